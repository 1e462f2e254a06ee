use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{OrderId, PaymentId, RefundId};
use tokio::sync::RwLock;

use crate::{
    DomainError, Order, OrderStatus, Payment, PaymentStatus, RefundRequest, RefundStatus,
    error::Result,
    repository::{OrderRepository, PaymentRepository, RefundRepository},
};

/// In-memory repository for tests and single-process runs.
///
/// Implements all three repository traits over shared maps. Updates can be
/// made to fail per record kind to exercise error paths.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
    payments: Arc<RwLock<HashMap<PaymentId, Payment>>>,
    refunds: Arc<RwLock<HashMap<RefundId, RefundRequest>>>,
    fail_on_order_update: Arc<AtomicBool>,
    fail_on_payment_update: Arc<AtomicBool>,
    fail_on_refund_update: Arc<AtomicBool>,
}

impl InMemoryRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of orders stored.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    pub fn set_fail_on_order_update(&self, fail: bool) {
        self.fail_on_order_update.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_payment_update(&self, fail: bool) {
        self.fail_on_payment_update.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_refund_update(&self, fail: bool) {
        self.fail_on_refund_update.store(fail, Ordering::SeqCst);
    }
}

fn check_available(flag: &AtomicBool, what: &str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(DomainError::Unavailable(format!("{what} updates disabled")));
    }
    Ok(())
}

#[async_trait]
impl OrderRepository for InMemoryRepository {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        if orders
            .values()
            .any(|o| o.order_number == order.order_number)
        {
            return Err(DomainError::DuplicateOrderNumber(order.order_number.clone()));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn get_order_by_number(&self, order_number: &str) -> Result<Option<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .find(|o| o.order_number == order_number)
            .cloned())
    }

    async fn list_orders_by_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        let mut orders: Vec<_> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn update_order(&self, order: &Order, expected: OrderStatus) -> Result<()> {
        check_available(&self.fail_on_order_update, "order")?;
        let mut orders = self.orders.write().await;
        match orders.get_mut(&order.id) {
            Some(stored) if stored.status == expected => {
                *stored = order.clone();
                Ok(())
            }
            Some(_) => Err(DomainError::StaleOrder {
                order_id: order.id,
                expected,
            }),
            None => Err(DomainError::OrderNotFound(order.id.to_string())),
        }
    }
}

#[async_trait]
impl PaymentRepository for InMemoryRepository {
    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if payments
            .values()
            .any(|p| p.payment_no == payment.payment_no)
        {
            return Err(DomainError::DuplicatePayment(payment.payment_no.clone()));
        }
        payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment_by_no(&self, payment_no: &str) -> Result<Option<Payment>> {
        Ok(self
            .payments
            .read()
            .await
            .values()
            .find(|p| p.payment_no == payment_no)
            .cloned())
    }

    async fn list_payments_for_order(&self, order_id: OrderId) -> Result<Vec<Payment>> {
        let mut payments: Vec<_> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn update_payment(&self, payment: &Payment, expected: PaymentStatus) -> Result<()> {
        check_available(&self.fail_on_payment_update, "payment")?;
        let mut payments = self.payments.write().await;
        if payment.is_successful()
            && payments
                .values()
                .any(|p| p.order_id == payment.order_id && p.id != payment.id && p.is_successful())
        {
            return Err(DomainError::PaymentAlreadySucceeded {
                order_id: payment.order_id,
            });
        }
        match payments.get_mut(&payment.id) {
            Some(stored) if stored.status == expected => {
                *stored = payment.clone();
                Ok(())
            }
            Some(_) => Err(DomainError::StalePayment {
                payment_no: payment.payment_no.clone(),
                expected,
            }),
            None => Err(DomainError::PaymentNotFound(payment.payment_no.clone())),
        }
    }
}

#[async_trait]
impl RefundRepository for InMemoryRepository {
    async fn insert_refund(&self, refund: &RefundRequest) -> Result<()> {
        self.refunds
            .write()
            .await
            .insert(refund.id, refund.clone());
        Ok(())
    }

    async fn get_refund(&self, id: RefundId) -> Result<Option<RefundRequest>> {
        Ok(self.refunds.read().await.get(&id).cloned())
    }

    async fn list_refunds_for_order(&self, order_id: OrderId) -> Result<Vec<RefundRequest>> {
        let mut refunds: Vec<_> = self
            .refunds
            .read()
            .await
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        refunds.sort_by_key(|r| r.requested_at);
        Ok(refunds)
    }

    async fn update_refund(&self, refund: &RefundRequest, expected: RefundStatus) -> Result<()> {
        check_available(&self.fail_on_refund_update, "refund")?;
        let mut refunds = self.refunds.write().await;
        match refunds.get_mut(&refund.id) {
            Some(stored) if stored.status == expected => {
                *stored = refund.clone();
                Ok(())
            }
            Some(_) => Err(DomainError::StaleRefund {
                refund_id: refund.id,
                expected,
            }),
            None => Err(DomainError::RefundNotFound(refund.id)),
        }
    }
}
