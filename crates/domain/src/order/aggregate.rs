//! The order aggregate: one checkout attempt with its items and passengers.

use chrono::{DateTime, Duration, Utc};
use common::{CabinId, CabinTypeId, OrderId, OrderItemId, UserId, VoyageId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    Contact, ItemStatus, Occupancy, OrderError, OrderPaymentStatus, OrderStatus, Passenger,
    PassengerKind, PriceSnapshot,
};
use crate::Money;

pub const DEFAULT_ORDER_TTL_MINUTES: i64 = 15;

/// Reservation window applied when an order carries no explicit expiry.
pub fn default_order_ttl() -> Duration {
    Duration::minutes(DEFAULT_ORDER_TTL_MINUTES)
}

pub const DEFAULT_CURRENCY: &str = "CNY";

/// `ORD` + `YYYYMMDD` + 8 hex chars.
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    format!(
        "ORD{}{:08x}",
        now.format("%Y%m%d"),
        Uuid::new_v4().as_fields().0
    )
}

/// One cabin on an order, with prices frozen at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub voyage_id: VoyageId,
    pub cabin_id: CabinId,
    pub cabin_type_id: CabinTypeId,
    pub price: PriceSnapshot,
    pub occupancy: Occupancy,
    pub subtotal: Money,
    pub status: ItemStatus,
}

impl OrderItem {
    /// Creates an item holding one locked cabin. The subtotal is computed
    /// from the snapshot.
    pub fn new(
        voyage_id: VoyageId,
        cabin_id: CabinId,
        cabin_type_id: CabinTypeId,
        price: PriceSnapshot,
        occupancy: Occupancy,
    ) -> Self {
        Self {
            id: OrderItemId::new(),
            voyage_id,
            cabin_id,
            cabin_type_id,
            subtotal: price.subtotal(occupancy),
            price,
            occupancy,
            status: ItemStatus::Locked,
        }
    }
}

/// Everything checkout knows before the order exists.
#[derive(Debug, Clone, Default)]
pub struct OrderDraft {
    pub voyage_id: VoyageId,
    pub user_id: Option<UserId>,
    pub items: Vec<OrderItem>,
    pub passengers: Vec<Passenger>,
    pub contact: Contact,
    pub remark: Option<String>,
}

/// A booking order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    pub user_id: Option<UserId>,
    pub voyage_id: VoyageId,
    pub status: OrderStatus,
    pub payment_status: OrderPaymentStatus,
    pub total_amount: Money,
    pub paid_amount: Money,
    pub currency: String,
    pub passenger_count: u32,
    pub cabin_count: u32,
    pub contact: Contact,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
    pub passengers: Vec<Passenger>,
}

impl Order {
    /// Validates a draft and creates a pending order expiring `ttl` from `now`.
    ///
    /// Requires at least one item, an adult in every cabin, and one
    /// passenger record per adult or child across all items.
    pub fn create(draft: OrderDraft, ttl: Duration, now: DateTime<Utc>) -> Result<Self, OrderError> {
        if draft.items.is_empty() {
            return Err(OrderError::NoItems);
        }
        if let Some(item) = draft.items.iter().find(|i| i.occupancy.adults == 0) {
            return Err(OrderError::NoAdults {
                cabin_id: item.cabin_id,
            });
        }

        let expected: u32 = draft.items.iter().map(|i| i.occupancy.paying_guests()).sum();
        let actual = draft
            .passengers
            .iter()
            .filter(|p| p.kind != PassengerKind::Infant)
            .count();
        if usize::try_from(expected).ok() != Some(actual) {
            return Err(OrderError::PassengerCountMismatch { expected, actual });
        }

        let cabin_count =
            u32::try_from(draft.items.len()).map_err(|_| OrderError::TooManyItems)?;
        let total_amount = draft.items.iter().map(|i| i.subtotal).sum();

        Ok(Self {
            id: OrderId::new(),
            order_number: generate_order_number(now),
            user_id: draft.user_id,
            voyage_id: draft.voyage_id,
            status: OrderStatus::Pending,
            payment_status: OrderPaymentStatus::Unpaid,
            total_amount,
            paid_amount: Money::zero(),
            currency: DEFAULT_CURRENCY.to_string(),
            passenger_count: expected,
            cabin_count,
            contact: draft.contact,
            remark: draft.remark,
            created_at: now,
            expires_at: Some(now + ttl),
            paid_at: None,
            confirmed_at: None,
            updated_at: now,
            items: draft.items,
            passengers: draft.passengers,
        })
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == OrderPaymentStatus::Paid
    }

    /// The reservation deadline. Falls back to `created_at + 15 min`.
    pub fn expiry(&self) -> DateTime<Utc> {
        self.expires_at
            .unwrap_or_else(|| self.created_at + default_order_ttl())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry()
    }

    /// Items currently at the given ledger stage.
    pub fn items_in(&self, status: ItemStatus) -> impl Iterator<Item = &OrderItem> {
        self.items.iter().filter(move |i| i.status == status)
    }

    /// Every item holds a cabin (locked or booked).
    pub fn holds_all_items(&self) -> bool {
        self.items.iter().all(|i| i.status != ItemStatus::Released)
    }

    fn check_transition(&self, to: OrderStatus) -> Result<(), OrderError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(OrderError::InvalidOrderTransition {
                from: self.status,
                to,
            })
        }
    }

    /// `pending -> paid`
    pub fn mark_paid(
        &mut self,
        amount: Money,
        paid_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        self.check_transition(OrderStatus::Paid)?;
        if self.is_expired_at(now) {
            return Err(OrderError::OrderExpired {
                order_number: self.order_number.clone(),
            });
        }
        if self.is_paid() {
            return Err(OrderError::OrderAlreadyPaid);
        }

        self.status = OrderStatus::Paid;
        self.payment_status = OrderPaymentStatus::Paid;
        self.paid_amount = amount;
        self.paid_at = Some(paid_at);
        self.updated_at = now;
        Ok(())
    }

    /// `paid -> confirmed`. Item stages are updated by the caller as each
    /// ledger confirm succeeds.
    pub fn mark_confirmed(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.check_transition(OrderStatus::Confirmed)?;
        if !self.is_paid() {
            return Err(OrderError::OrderNotPaid);
        }

        self.status = OrderStatus::Confirmed;
        self.confirmed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `confirmed -> completed`
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.check_transition(OrderStatus::Completed)?;
        self.status = OrderStatus::Completed;
        self.updated_at = now;
        Ok(())
    }

    /// `{pending, paid, confirmed} -> cancelled`
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.check_transition(OrderStatus::Cancelled)?;
        self.status = OrderStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    /// `{paid, confirmed, completed} -> refunded`
    pub fn mark_refunded(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        self.check_transition(OrderStatus::Refunded)?;
        if !self.is_paid() {
            return Err(OrderError::OrderNotPaid);
        }

        self.status = OrderStatus::Refunded;
        self.payment_status = OrderPaymentStatus::Refunded;
        self.updated_at = now;
        Ok(())
    }

    /// Replaces contact details and remark. Pending orders only.
    pub fn update_contact(
        &mut self,
        contact: Contact,
        remark: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        if self.status != OrderStatus::Pending {
            return Err(OrderError::NotEditable {
                status: self.status,
            });
        }

        self.contact = contact;
        self.remark = remark;
        self.updated_at = now;
        Ok(())
    }
}
