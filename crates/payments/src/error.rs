//! Payment and refund error types.

use booking::BookingError;
use common::{OrderId, RefundId};
use domain::{DomainError, Money, OrderStatus, PaymentStatus, RefundStatus};
use thiserror::Error;

use crate::provider::ProviderRefundStatus;

/// Errors raised while talking to providers or reconciling payments.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The notification failed signature verification or decryption.
    #[error("Invalid payment signature")]
    InvalidSignature,

    /// The notification authenticated but its content is unusable.
    #[error("Malformed provider notification: {0}")]
    MalformedNotification(String),

    /// The provider rejected the request or could not be reached.
    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Unsupported payment provider: {0}")]
    UnsupportedProvider(String),

    #[error("Provider configuration error: {0}")]
    Config(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("No payment for order {0}")]
    NoPayment(OrderId),

    /// Payments can only be created for pending, unexpired orders.
    #[error("Order cannot be paid in {status} status")]
    OrderNotPayable { status: OrderStatus },

    /// Some items of the order hold no cabin.
    #[error("Order {order_number} is missing cabins and cannot be paid")]
    IncompleteReservation { order_number: String },

    #[error("Order is already paid")]
    AlreadyPaid,

    /// The last attempt failed and no retries are left.
    #[error("Payment retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Payment {payment_no} is {status}")]
    InvalidPaymentState {
        payment_no: String,
        status: PaymentStatus,
    },

    /// Booking workflow error.
    #[error("Booking error: {0}")]
    Booking(#[from] BookingError),

    /// Repository error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// Errors raised by the refund workflow.
#[derive(Debug, Error)]
pub enum RefundError {
    #[error("Refund request not found: {0}")]
    RefundNotFound(RefundId),

    /// Refunds can be requested for paid or confirmed orders only.
    #[error("Order cannot be refunded in {status} status")]
    OrderNotRefundable { status: OrderStatus },

    #[error("Invalid refund amount {requested}: refundable amount is {refundable}")]
    InvalidAmount { requested: Money, refundable: Money },

    #[error("Refund {refund_id} is {actual}, expected {expected}")]
    InvalidRefundState {
        refund_id: RefundId,
        expected: RefundStatus,
        actual: RefundStatus,
    },

    #[error("Order {0} has no successful payment")]
    NoSuccessfulPayment(OrderId),

    /// The provider answered the refund call but did not take the refund.
    #[error("Provider refused refund {refund_no}: {status:?}")]
    ProviderRejected {
        refund_no: String,
        status: ProviderRefundStatus,
    },

    /// Provider or reconciliation error.
    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    /// Booking workflow error.
    #[error("Booking error: {0}")]
    Booking(#[from] BookingError),

    /// Repository error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// Convenience type alias for payment results.
pub type Result<T> = std::result::Result<T, PaymentError>;
