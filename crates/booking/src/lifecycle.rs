//! Order lifecycle: transitions and their inventory effects.
//!
//! Every status change is persisted with a write conditional on the status
//! the order had when it was loaded, so two workflows racing on one order
//! (a payment callback and the reaper, say) cannot both win. Inventory is
//! only released by the workflow whose status write succeeded.

use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{Contact, ItemStatus, Money, Order, OrderRepository, OrderStatus};
use ledger::{InventoryKey, InventoryLedger, LedgerStore};

use crate::error::{BookingError, Result};

/// Outcome of releasing an order's items back to the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

/// Drives order transitions over a ledger and an order repository.
pub struct OrderLifecycle<S: LedgerStore, R: OrderRepository> {
    ledger: InventoryLedger<S>,
    orders: R,
}

impl<S: LedgerStore, R: OrderRepository> OrderLifecycle<S, R> {
    /// Creates a new lifecycle service.
    pub fn new(ledger: InventoryLedger<S>, orders: R) -> Self {
        Self { ledger, orders }
    }

    pub fn ledger(&self) -> &InventoryLedger<S> {
        &self.ledger
    }

    pub fn orders(&self) -> &R {
        &self.orders
    }

    /// Loads an order, failing with `OrderNotFound` if absent.
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| BookingError::OrderNotFound(order_id.to_string()))
    }

    pub async fn get_order_by_number(&self, order_number: &str) -> Result<Order> {
        self.orders
            .get_order_by_number(order_number)
            .await?
            .ok_or_else(|| BookingError::OrderNotFound(order_number.to_string()))
    }

    /// Orders in the given status, oldest first.
    pub async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        Ok(self.orders.list_orders_by_status(status).await?)
    }

    /// Replaces contact details and remark of a pending order.
    #[tracing::instrument(skip(self, contact, remark))]
    pub async fn update_contact(
        &self,
        order_id: OrderId,
        contact: Contact,
        remark: Option<String>,
    ) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        let prior = order.status;
        order.update_contact(contact, remark, Utc::now())?;
        self.orders.update_order(&order, prior).await?;
        Ok(order)
    }

    /// `pending -> paid`. Records the paid amount and time.
    #[tracing::instrument(skip(self))]
    pub async fn mark_paid(
        &self,
        order_id: OrderId,
        amount: Money,
        paid_at: DateTime<Utc>,
    ) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        let prior = order.status;
        order.mark_paid(amount, paid_at, Utc::now())?;
        self.orders.update_order(&order, prior).await?;

        record_transition(OrderStatus::Paid);
        tracing::info!(order_number = %order.order_number, "order paid");
        Ok(order)
    }

    /// `paid -> confirmed`.
    ///
    /// The status and the `booked` stage of every locked item are claimed in
    /// one conditional write, so a cancel racing this call either loses or
    /// releases the items as bookings. The ledger is confirmed afterwards;
    /// an item whose confirm fails is logged and written back as locked.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(&self, order_id: OrderId) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        let prior = order.status;
        order.mark_confirmed(Utc::now())?;

        let claimed: Vec<usize> = order
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == ItemStatus::Locked)
            .map(|(index, _)| index)
            .collect();
        for &index in &claimed {
            order.items[index].status = ItemStatus::Booked;
        }
        self.orders.update_order(&order, prior).await?;

        let mut unconfirmed = 0;
        for &index in &claimed {
            let item = &mut order.items[index];
            let key = InventoryKey::new(item.voyage_id, item.cabin_type_id);
            if let Err(e) = self.ledger.confirm(key, 1).await {
                tracing::error!(
                    order_number = %order.order_number,
                    cabin_id = %item.cabin_id,
                    error = %e,
                    "failed to confirm cabin"
                );
                item.status = ItemStatus::Locked;
                unconfirmed += 1;
            }
        }
        if unconfirmed > 0 {
            self.orders
                .update_order(&order, OrderStatus::Confirmed)
                .await?;
        }

        record_transition(OrderStatus::Confirmed);
        tracing::info!(
            order_number = %order.order_number,
            booked = claimed.len() - unconfirmed,
            unconfirmed,
            "order confirmed"
        );
        Ok(order)
    }

    /// `confirmed -> completed`
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, order_id: OrderId) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        let prior = order.status;
        order.mark_completed(Utc::now())?;
        self.orders.update_order(&order, prior).await?;

        record_transition(OrderStatus::Completed);
        Ok(order)
    }

    /// Cancels an order by id. See [`cancel_order`](Self::cancel_order).
    pub async fn cancel(&self, order_id: OrderId) -> Result<(Order, ReleaseReport)> {
        let order = self.get_order(order_id).await?;
        self.cancel_order(order).await
    }

    /// `{pending, paid, confirmed} -> cancelled`, then releases every item
    /// by its ledger stage.
    ///
    /// Release failures are logged and counted in the report; the order
    /// stays cancelled.
    #[tracing::instrument(skip(self, order), fields(order_number = %order.order_number))]
    pub async fn cancel_order(&self, mut order: Order) -> Result<(Order, ReleaseReport)> {
        let prior = order.status;
        order.mark_cancelled(Utc::now())?;
        self.orders.update_order(&order, prior).await?;

        let report = self.release_items(&mut order).await;
        if report.released > 0 {
            self.orders
                .update_order(&order, OrderStatus::Cancelled)
                .await?;
        }

        record_transition(OrderStatus::Cancelled);
        tracing::info!(
            from = %prior,
            released = report.released,
            failed = report.failed,
            "order cancelled"
        );
        Ok((order, report))
    }

    /// `{paid, confirmed, completed} -> refunded`.
    ///
    /// Inventory is not touched here; the refund flow calls
    /// [`release_and_persist`](Self::release_and_persist) once the provider
    /// has returned the money.
    #[tracing::instrument(skip(self))]
    pub async fn mark_refunded(&self, order_id: OrderId) -> Result<Order> {
        let mut order = self.get_order(order_id).await?;
        let prior = order.status;
        order.mark_refunded(Utc::now())?;
        self.orders.update_order(&order, prior).await?;

        record_transition(OrderStatus::Refunded);
        Ok(order)
    }

    /// Releases the items of an order that already reached a terminal
    /// status and persists their new stages.
    pub async fn release_and_persist(&self, mut order: Order) -> Result<(Order, ReleaseReport)> {
        let report = self.release_items(&mut order).await;
        if report.released > 0 {
            self.orders.update_order(&order, order.status).await?;
        }
        Ok((order, report))
    }

    /// Returns each held item to the available pool: locked items are
    /// unlocked, booked items have their booking cancelled.
    ///
    /// Only touches the ledger; item stages are updated in place.
    pub async fn release_items(&self, order: &mut Order) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for item in order.items.iter_mut() {
            let key = InventoryKey::new(item.voyage_id, item.cabin_type_id);
            let result = match item.status {
                ItemStatus::Locked => self.ledger.unlock(key, 1).await,
                ItemStatus::Booked => self.ledger.cancel_booking(key, 1).await,
                ItemStatus::Released => continue,
            };

            match result {
                Ok(_) => {
                    item.status = ItemStatus::Released;
                    report.released += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!("inventory_release_failures_total").increment(1);
                    tracing::warn!(
                        order_number = %order.order_number,
                        cabin_id = %item.cabin_id,
                        stage = %item.status,
                        error = %e,
                        "failed to release cabin"
                    );
                }
            }
        }
        report
    }
}

fn record_transition(to: OrderStatus) {
    metrics::counter!("order_transitions_total", "to" => to.as_str()).increment(1);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use common::{CabinId, CabinTypeId, VoyageId};
    use domain::{
        InMemoryRepository, Occupancy, OrderDraft, OrderError, OrderItem, Passenger,
        PassengerKind, PriceSnapshot, default_order_ttl,
    };
    use ledger::InMemoryLedgerStore;

    use super::*;

    struct Fixture {
        lifecycle: OrderLifecycle<InMemoryLedgerStore, InMemoryRepository>,
        key: InventoryKey,
    }

    async fn fixture() -> Fixture {
        let voyage_id = VoyageId::new();
        let cabin_type_id = CabinTypeId::new();
        let ledger = InventoryLedger::new(InMemoryLedgerStore::new());
        ledger
            .initialize(voyage_id, &HashMap::from([(cabin_type_id, 4)]))
            .await
            .unwrap();
        Fixture {
            lifecycle: OrderLifecycle::new(ledger, InMemoryRepository::new()),
            key: InventoryKey::new(voyage_id, cabin_type_id),
        }
    }

    /// Persists a pending order for `cabins` cabins and locks them.
    async fn locked_order(f: &Fixture, cabins: usize) -> Order {
        let price = PriceSnapshot {
            adult: Money::from_major(1000),
            ..PriceSnapshot::default()
        };
        let draft = OrderDraft {
            voyage_id: f.key.voyage_id,
            items: (0..cabins)
                .map(|_| {
                    OrderItem::new(
                        f.key.voyage_id,
                        CabinId::new(),
                        f.key.cabin_type_id,
                        price,
                        Occupancy::new(1, 0, 0),
                    )
                })
                .collect(),
            passengers: (0..cabins)
                .map(|i| Passenger::new(format!("guest {i}"), PassengerKind::Adult))
                .collect(),
            ..OrderDraft::default()
        };
        let order = Order::create(draft, default_order_ttl(), Utc::now()).unwrap();
        for _ in 0..cabins {
            f.lifecycle.ledger().lock(f.key, 1).await.unwrap();
        }
        f.lifecycle.orders().insert_order(&order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn pay_confirm_complete() {
        let f = fixture().await;
        let order = locked_order(&f, 2).await;

        f.lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap();
        let confirmed = f.lifecycle.confirm(order.id).await.unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());
        assert!(confirmed.items.iter().all(|i| i.status == ItemStatus::Booked));

        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!((row.available, row.locked, row.booked), (2, 0, 2));

        let completed = f.lifecycle.complete(order.id).await.unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        let stored = f.lifecycle.get_order(order.id).await.unwrap();
        assert_eq!(stored, completed);
    }

    #[tokio::test]
    async fn cancel_releases_by_stage() {
        let f = fixture().await;
        let order = locked_order(&f, 1).await;
        f.lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap();
        f.lifecycle.confirm(order.id).await.unwrap();

        let (cancelled, report) = f.lifecycle.cancel(order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(report, ReleaseReport { released: 1, failed: 0 });

        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!((row.available, row.locked, row.booked), (4, 0, 0));
        let stored = f.lifecycle.get_order(order.id).await.unwrap();
        assert_eq!(stored.items[0].status, ItemStatus::Released);
    }

    #[tokio::test]
    async fn cancelled_order_cannot_be_cancelled_twice() {
        let f = fixture().await;
        let order = locked_order(&f, 1).await;
        f.lifecycle.cancel(order.id).await.unwrap();

        let err = f.lifecycle.cancel(order.id).await.unwrap_err();
        assert!(matches!(
            err,
            BookingError::Order(OrderError::InvalidOrderTransition {
                from: OrderStatus::Cancelled,
                to: OrderStatus::Cancelled
            })
        ));
        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!(row.available, 4);
    }

    #[tokio::test]
    async fn release_failure_does_not_block_cancel() {
        let f = fixture().await;
        let order = locked_order(&f, 1).await;
        // someone else already returned the lock
        f.lifecycle.ledger().unlock(f.key, 1).await.unwrap();

        let (cancelled, report) = f.lifecycle.cancel(order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(report, ReleaseReport { released: 0, failed: 1 });
        assert_eq!(cancelled.items[0].status, ItemStatus::Locked);
    }

    #[tokio::test]
    async fn stale_status_write_loses() {
        let f = fixture().await;
        let order = locked_order(&f, 1).await;
        let loaded = f.lifecycle.get_order(order.id).await.unwrap();

        f.lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap();
        let err = f.lifecycle.cancel_order(loaded).await.unwrap_err();
        assert!(matches!(
            err,
            BookingError::Domain(domain::DomainError::StaleOrder { .. })
        ));

        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!(row.locked, 1);
    }

    #[tokio::test]
    async fn expired_order_cannot_be_paid() {
        let f = fixture().await;
        let mut order = locked_order(&f, 1).await;
        order.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        f.lifecycle
            .orders()
            .update_order(&order, OrderStatus::Pending)
            .await
            .unwrap();

        let err = f
            .lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "order has expired, please re-book");
    }

    #[tokio::test]
    async fn refund_then_release() {
        let f = fixture().await;
        let order = locked_order(&f, 2).await;
        f.lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap();
        f.lifecycle.confirm(order.id).await.unwrap();

        let refunded = f.lifecycle.mark_refunded(order.id).await.unwrap();
        assert_eq!(refunded.status, OrderStatus::Refunded);
        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!(row.booked, 2);

        let (released, report) = f.lifecycle.release_and_persist(refunded).await.unwrap();
        assert_eq!(report.released, 2);
        assert!(released.items.iter().all(|i| i.status == ItemStatus::Released));
        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!((row.available, row.booked), (4, 0));
    }

    #[tokio::test]
    async fn contact_only_editable_while_pending() {
        let f = fixture().await;
        let order = locked_order(&f, 1).await;
        let contact = Contact {
            name: "Liu Yang".into(),
            phone: "13900139000".into(),
            email: None,
        };
        let updated = f
            .lifecycle
            .update_contact(order.id, contact.clone(), None)
            .await
            .unwrap();
        assert_eq!(updated.contact, contact);

        f.lifecycle.cancel(order.id).await.unwrap();
        let err = f
            .lifecycle
            .update_contact(order.id, contact, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BookingError::Order(OrderError::NotEditable { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_order() {
        let f = fixture().await;
        assert!(matches!(
            f.lifecycle.confirm(OrderId::new()).await,
            Err(BookingError::OrderNotFound(_))
        ));
        assert!(matches!(
            f.lifecycle.get_order_by_number("ORD20250101deadbeef").await,
            Err(BookingError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_loaded_before_confirm_loses_and_spares_other_locks() {
        let f = fixture().await;
        let order = locked_order(&f, 1).await;
        let other = locked_order(&f, 1).await;
        f.lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap();
        let loaded = f.lifecycle.get_order(order.id).await.unwrap();

        f.lifecycle.confirm(order.id).await.unwrap();
        let err = f.lifecycle.cancel_order(loaded).await.unwrap_err();
        assert!(matches!(
            err,
            BookingError::Domain(domain::DomainError::StaleOrder { .. })
        ));
        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!((row.available, row.locked, row.booked), (2, 1, 1));

        // a cancel after confirm releases the booking, not the other lock
        let (_, report) = f.lifecycle.cancel(order.id).await.unwrap();
        assert_eq!(report.released, 1);
        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!((row.available, row.locked, row.booked), (3, 1, 0));
        let other = f.lifecycle.get_order(other.id).await.unwrap();
        assert_eq!(other.items[0].status, ItemStatus::Locked);
    }

    #[tokio::test]
    async fn confirm_stores_booked_stages_with_the_status() {
        let f = fixture().await;
        let order = locked_order(&f, 2).await;
        f.lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap();

        f.lifecycle.confirm(order.id).await.unwrap();

        let stored = f.lifecycle.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
        assert!(stored.items.iter().all(|i| i.status == ItemStatus::Booked));
    }

    #[tokio::test]
    async fn failed_ledger_confirm_reverts_item_to_locked() {
        let f = fixture().await;
        let order = locked_order(&f, 1).await;
        f.lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap();
        // the lock is gone, so the ledger refuses to confirm it
        f.lifecycle.ledger().unlock(f.key, 1).await.unwrap();

        let confirmed = f.lifecycle.confirm(order.id).await.unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert_eq!(confirmed.items[0].status, ItemStatus::Locked);

        let stored = f.lifecycle.get_order(order.id).await.unwrap();
        assert_eq!(stored, confirmed);
        let row = f.lifecycle.ledger().get(f.key).await.unwrap();
        assert_eq!((row.available, row.locked, row.booked), (4, 0, 0));
    }
}
