//! Payment attempts against an order.

use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Money;

/// A failed payment may be retried while `retry_count` is below this.
pub const MAX_PAYMENT_RETRIES: u32 = 3;

string_enum! {
    pub enum PaymentMethod("payment method") {
        Wechat => "wechat",
        Alipay => "alipay",
        Card => "card",
    }
}

string_enum! {
    /// Status of a single payment attempt.
    pub enum PaymentStatus("payment status") {
        Pending => "pending",
        Processing => "processing",
        Success => "success",
        Failed => "failed",
        Cancelled => "cancelled",
        Refunded => "refunded",
    }
}

impl PaymentStatus {
    /// `success` and `refunded` are final: reprocessing is a no-op.
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Success | PaymentStatus::Refunded)
    }
}

/// `PAY` + `YYYYMMDD` + 12 hex chars.
pub fn generate_payment_number(now: DateTime<Utc>) -> String {
    let uuid = Uuid::new_v4();
    let (high, mid, _, _) = uuid.as_fields();
    format!("PAY{}{:08x}{:04x}", now.format("%Y%m%d"), high, mid)
}

/// One attempted charge. `payment_no` is the idempotency key shared with
/// the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub payment_no: String,
    pub order_id: OrderId,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: Money,
    pub currency: String,
    pub third_party_transaction_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub notify_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Records a new pending attempt.
    pub fn new(
        order_id: OrderId,
        method: PaymentMethod,
        amount: Money,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            payment_no: generate_payment_number(now),
            order_id,
            method,
            status: PaymentStatus::Pending,
            amount,
            currency: currency.into(),
            third_party_transaction_id: None,
            paid_at: None,
            notify_at: None,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == PaymentStatus::Success
    }

    pub fn can_retry(&self) -> bool {
        self.status == PaymentStatus::Failed && self.retry_count < MAX_PAYMENT_RETRIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_number_format() {
        let now = DateTime::parse_from_rfc3339("2025-11-30T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        let number = generate_payment_number(now);

        assert_eq!(number.len(), 3 + 8 + 12);
        assert!(number.starts_with("PAY20251130"));
        assert!(number[11..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn settled_statuses() {
        let settled: Vec<_> = PaymentStatus::ALL
            .iter()
            .filter(|s| s.is_settled())
            .collect();
        assert_eq!(settled, [&PaymentStatus::Success, &PaymentStatus::Refunded]);
    }

    #[test]
    fn retry_is_bounded() {
        let mut payment = Payment::new(
            OrderId::new(),
            PaymentMethod::Wechat,
            Money::from_cents(100),
            "CNY",
            Utc::now(),
        );
        assert!(!payment.can_retry());

        payment.status = PaymentStatus::Failed;
        payment.retry_count = 2;
        assert!(payment.can_retry());

        payment.retry_count = MAX_PAYMENT_RETRIES;
        assert!(!payment.can_retry());
    }
}
