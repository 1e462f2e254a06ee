//! Booking workflows over the inventory ledger and the order repository.
//!
//! - [`OrderLifecycle`] drives order transitions and their ledger effects.
//! - [`Checkout`] turns a request into a pending order holding locked cabins.
//! - [`Reaper`] cancels pending orders whose reservation window has passed.
//! - [`InventoryMonitor`] reports low availability and unbalanced rows.

pub mod alert;
pub mod checkout;
pub mod error;
pub mod lifecycle;
pub mod pricing;
pub mod reaper;

pub use alert::{
    AlertSink, InMemoryAlertSink, InventoryMonitor, LowInventoryAlert, MonitorConfig,
    MonitorReport, TracingAlertSink,
};
pub use checkout::{Checkout, CheckoutItem, CheckoutRequest};
pub use error::{BookingError, Result};
pub use lifecycle::{OrderLifecycle, ReleaseReport};
pub use pricing::{InMemoryPriceCatalog, PriceCatalog};
pub use reaper::{CancelRequestError, Reaper, ReaperHandle, ReaperReport};
