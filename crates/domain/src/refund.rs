//! Refund requests and their review states.

use chrono::{DateTime, Utc};
use common::{OrderId, OrderItemId, RefundId, UserId};
use serde::{Deserialize, Serialize};

use crate::Money;

string_enum! {
    pub enum RefundType("refund type") {
        Full => "full",
        Partial => "partial",
    }
}

string_enum! {
    /// ```text
    /// Pending ──► Approved ──► Processing ──► Completed
    ///    │                          │
    ///    └──► Rejected              └──► Failed
    /// ```
    pub enum RefundStatus("refund status") {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

impl RefundStatus {
    /// Statuses whose amount is committed against the order total.
    pub fn holds_amount(&self) -> bool {
        matches!(self, RefundStatus::Processing | RefundStatus::Completed)
    }
}

/// A request to return money for an order, optionally for a single item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub id: RefundId,
    pub order_id: OrderId,
    pub order_item_id: Option<OrderItemId>,
    pub amount: Money,
    pub reason: String,
    pub refund_type: RefundType,
    pub status: RefundStatus,
    pub requested_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<UserId>,
    pub review_note: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub provider_refund_id: Option<String>,
}

impl RefundRequest {
    /// Creates a pending request. Without an explicit type, refunding the
    /// whole order total is `full` and anything less is `partial`.
    pub fn new(
        order_id: OrderId,
        order_item_id: Option<OrderItemId>,
        amount: Money,
        order_total: Money,
        reason: impl Into<String>,
        refund_type: Option<RefundType>,
        now: DateTime<Utc>,
    ) -> Self {
        let refund_type = refund_type.unwrap_or(if amount >= order_total {
            RefundType::Full
        } else {
            RefundType::Partial
        });

        Self {
            id: RefundId::new(),
            order_id,
            order_item_id,
            amount,
            reason: reason.into(),
            refund_type,
            status: RefundStatus::Pending,
            requested_at: now,
            reviewed_at: None,
            reviewed_by: None,
            review_note: None,
            processed_at: None,
            provider_refund_id: None,
        }
    }
}
