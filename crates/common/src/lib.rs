//! Shared identifier types used across the booking workspace.

mod types;

pub use types::{
    CabinId, CabinTypeId, OrderId, OrderItemId, PassengerId, PaymentId, RefundId, UserId,
    VoyageId,
};
