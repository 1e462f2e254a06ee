//! Persistence boundary for orders, payments and refund requests.
//!
//! Repositories own creation and field mutation. Every update is a
//! conditional write on the record's prior status, so two workflows racing
//! on the same record cannot both apply a transition: the loser gets a
//! `Stale*` error and nothing is written.

use async_trait::async_trait;
use common::{OrderId, RefundId};

use crate::{
    Order, OrderStatus, Payment, PaymentStatus, RefundRequest, RefundStatus, error::Result,
};

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Inserts an order with its items and passengers.
    async fn insert_order(&self, order: &Order) -> Result<()>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    async fn get_order_by_number(&self, order_number: &str) -> Result<Option<Order>>;

    /// Orders in one status, oldest first.
    async fn list_orders_by_status(&self, status: OrderStatus) -> Result<Vec<Order>>;

    /// Writes the order's mutable fields and item stages if its stored
    /// status is still `expected`.
    async fn update_order(&self, order: &Order, expected: OrderStatus) -> Result<()>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Fails with `DuplicatePayment` if the payment number is taken.
    async fn insert_payment(&self, payment: &Payment) -> Result<()>;

    async fn get_payment_by_no(&self, payment_no: &str) -> Result<Option<Payment>>;

    /// Payments of one order, oldest first.
    async fn list_payments_for_order(&self, order_id: OrderId) -> Result<Vec<Payment>>;

    /// Writes the payment if its stored status is still `expected`.
    async fn update_payment(&self, payment: &Payment, expected: PaymentStatus) -> Result<()>;
}

#[async_trait]
pub trait RefundRepository: Send + Sync {
    async fn insert_refund(&self, refund: &RefundRequest) -> Result<()>;

    async fn get_refund(&self, id: RefundId) -> Result<Option<RefundRequest>>;

    /// Refund requests of one order, oldest first.
    async fn list_refunds_for_order(&self, order_id: OrderId) -> Result<Vec<RefundRequest>>;

    /// Writes the request if its stored status is still `expected`.
    async fn update_refund(&self, refund: &RefundRequest, expected: RefundStatus) -> Result<()>;
}
