//! Order state machine.

string_enum! {
    /// The status of an order in its lifecycle.
    ///
    /// State transitions:
    /// ```text
    /// Pending ──► Paid ──► Confirmed ──► Completed
    ///    │          │          │             │
    ///    │          ├──────────┴─────────────┴──► Refunded
    ///    └──────────┴──────────┴──► Cancelled
    /// ```
    pub enum OrderStatus("order status") {
        /// Created by checkout, inventory locked, awaiting payment.
        Pending => "pending",
        /// Payment succeeded.
        Paid => "paid",
        /// Operator confirmed, inventory booked.
        Confirmed => "confirmed",
        /// Voyage done.
        Completed => "completed",
        /// Terminal.
        Cancelled => "cancelled",
        /// Terminal.
        Refunded => "refunded",
    }
}

impl OrderStatus {
    /// The transition table: every status this one may move to.
    pub fn allowed_targets(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Pending => &[Paid, Cancelled],
            Paid => &[Confirmed, Cancelled, Refunded],
            Confirmed => &[Completed, Cancelled, Refunded],
            Completed => &[Refunded],
            Cancelled | Refunded => &[],
        }
    }

    /// Returns true if `self -> to` appears in the transition table.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        self.allowed_targets().contains(&to)
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.allowed_targets().is_empty()
    }
}

string_enum! {
    /// Payment progress recorded on the order itself.
    pub enum OrderPaymentStatus("order payment status") {
        Unpaid => "unpaid",
        Partial => "partial",
        Paid => "paid",
        Refunded => "refunded",
    }
}

string_enum! {
    /// Ledger stage of a single order item.
    pub enum ItemStatus("order item status") {
        /// One cabin held in `locked`.
        Locked => "locked",
        /// One cabin moved to `booked`.
        Booked => "booked",
        /// Cabin returned to `available`.
        Released => "released",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use OrderStatus::*;
        let allowed = [
            (Pending, Paid),
            (Pending, Cancelled),
            (Paid, Confirmed),
            (Paid, Cancelled),
            (Paid, Refunded),
            (Confirmed, Completed),
            (Confirmed, Cancelled),
            (Confirmed, Refunded),
            (Completed, Refunded),
        ];

        for &from in OrderStatus::ALL {
            for &to in OrderStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Paid.is_terminal());
        assert!(!OrderStatus::Confirmed.is_terminal());
        assert!(!OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
    }

    #[test]
    fn test_no_self_transitions() {
        for &status in OrderStatus::ALL {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn test_string_round_trip() {
        for &status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        for &status in ItemStatus::ALL {
            assert_eq!(status.to_string().parse::<ItemStatus>().unwrap(), status);
        }

        let err = "shipped".parse::<OrderStatus>().unwrap_err();
        assert_eq!(err.kind, "order status");
    }

    #[test]
    fn test_serialization_matches_persisted_names() {
        let json = serde_json::to_string(&OrderPaymentStatus::Unpaid).unwrap();
        assert_eq!(json, "\"unpaid\"");
        let status: OrderStatus = serde_json::from_str("\"confirmed\"").unwrap();
        assert_eq!(status, OrderStatus::Confirmed);
    }
}
