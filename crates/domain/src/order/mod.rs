//! Order aggregate and related types.

mod aggregate;
mod state;
mod value_objects;

pub use aggregate::{
    DEFAULT_CURRENCY, DEFAULT_ORDER_TTL_MINUTES, Order, OrderDraft, OrderItem, default_order_ttl,
    generate_order_number,
};
pub use state::{ItemStatus, OrderPaymentStatus, OrderStatus};
pub use value_objects::{Contact, Occupancy, Passenger, PassengerKind, PriceSnapshot};

use common::CabinId;
use thiserror::Error;

/// Errors raised by order rules. None of them mutate the order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// The transition is not in the table.
    #[error("Invalid order transition: {from} -> {to}")]
    InvalidOrderTransition { from: OrderStatus, to: OrderStatus },

    #[error("order has expired, please re-book")]
    OrderExpired { order_number: String },

    #[error("Order is already paid")]
    OrderAlreadyPaid,

    #[error("Order is not paid")]
    OrderNotPaid,

    #[error("Order has no items")]
    NoItems,

    #[error("Cabin {cabin_id} needs at least one adult")]
    NoAdults { cabin_id: CabinId },

    #[error("Passenger count mismatch: expected {expected}, got {actual}")]
    PassengerCountMismatch { expected: u32, actual: usize },

    #[error("Order has too many items")]
    TooManyItems,

    /// Contact details can only change while the order is pending.
    #[error("Order cannot be edited in {status} status")]
    NotEditable { status: OrderStatus },
}
