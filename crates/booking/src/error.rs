//! Booking error types.

use common::{CabinTypeId, OrderId, VoyageId};
use domain::{DomainError, OrderError};
use ledger::LedgerError;
use thiserror::Error;

/// Errors that can occur during booking workflows.
#[derive(Debug, Error)]
pub enum BookingError {
    /// Inventory ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Repository error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// An order rule rejected the operation.
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// No price is published for the cabin type on this voyage.
    #[error("No price for cabin type {cabin_type_id} on voyage {voyage_id}")]
    PriceNotFound {
        voyage_id: VoyageId,
        cabin_type_id: CabinTypeId,
    },

    /// Price catalog error.
    #[error("Price catalog error: {0}")]
    PriceCatalog(String),

    /// Alert delivery failed.
    #[error("Alert sink error: {0}")]
    AlertSink(String),

    /// Some items were locked before one failed. The order was persisted
    /// with the locks it holds and will be reclaimed by the reaper.
    #[error("Checkout of order {order_number} failed after {locked} locked item(s): {source}")]
    PartialCheckout {
        order_id: OrderId,
        order_number: String,
        locked: usize,
        #[source]
        source: LedgerError,
    },
}

impl BookingError {
    /// Only a lost optimistic update is safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::Ledger(e) if e.is_retryable())
    }

    /// The order left behind by a partial checkout, if any.
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            BookingError::PartialCheckout { order_id, .. } => Some(*order_id),
            _ => None,
        }
    }
}

/// Convenience type alias for booking results.
pub type Result<T> = std::result::Result<T, BookingError>;
