//! Domain error types.

use common::{OrderId, RefundId};
use thiserror::Error;

use crate::order::{OrderError, OrderStatus};
use crate::payment::PaymentStatus;
use crate::refund::RefundStatus;

/// A stored string did not name any variant of a status enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Errors that can occur during domain and repository operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An order rule was violated.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Refund request not found: {0}")]
    RefundNotFound(RefundId),

    /// The conditional write on the order's prior status matched nothing.
    #[error("Order {order_id} is no longer {expected}")]
    StaleOrder {
        order_id: OrderId,
        expected: OrderStatus,
    },

    /// The conditional write on the payment's prior status matched nothing.
    #[error("Payment {payment_no} is no longer {expected}")]
    StalePayment {
        payment_no: String,
        expected: PaymentStatus,
    },

    /// The conditional write on the refund's prior status matched nothing.
    #[error("Refund request {refund_id} is no longer {expected}")]
    StaleRefund {
        refund_id: RefundId,
        expected: RefundStatus,
    },

    #[error("Duplicate order number: {0}")]
    DuplicateOrderNumber(String),

    #[error("Duplicate payment number: {0}")]
    DuplicatePayment(String),

    /// Another payment of the same order already reached `success`.
    #[error("Order {order_id} already has a successful payment")]
    PaymentAlreadySucceeded { order_id: OrderId },

    /// A persisted value could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] ParseEnumError),

    /// The store refused the operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
