//! Domain layer for the cabin booking core.
//!
//! This crate provides:
//! - the order aggregate with its explicit status transition table
//! - payment attempts and refund requests
//! - repository traits with in-memory and PostgreSQL implementations

#[macro_use]
mod macros;

pub mod error;
pub mod memory;
pub mod money;
pub mod order;
pub mod payment;
pub mod postgres;
pub mod refund;
pub mod repository;

pub use error::{DomainError, ParseEnumError, Result};
pub use memory::InMemoryRepository;
pub use money::Money;
pub use order::{
    Contact, DEFAULT_CURRENCY, DEFAULT_ORDER_TTL_MINUTES, ItemStatus, Occupancy, Order,
    OrderDraft, OrderError, OrderItem, OrderPaymentStatus, OrderStatus, Passenger, PassengerKind,
    PriceSnapshot, default_order_ttl, generate_order_number,
};
pub use payment::{MAX_PAYMENT_RETRIES, Payment, PaymentMethod, PaymentStatus, generate_payment_number};
pub use postgres::PostgresRepository;
pub use refund::{RefundRequest, RefundStatus, RefundType};
pub use repository::{OrderRepository, PaymentRepository, RefundRepository};
