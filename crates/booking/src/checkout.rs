//! Checkout: builds a pending order and locks one cabin per item.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{CabinId, CabinTypeId, UserId, VoyageId};
use domain::{
    Contact, ItemStatus, Occupancy, Order, OrderDraft, OrderItem, OrderRepository, OrderStatus,
    Passenger, default_order_ttl,
};
use ledger::{InventoryKey, LedgerError, LedgerStore, RetryPolicy, retry::retry_on_conflict};
use serde::Deserialize;

use crate::error::{BookingError, Result};
use crate::lifecycle::OrderLifecycle;
use crate::pricing::PriceCatalog;

/// One cabin requested at checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutItem {
    pub cabin_id: CabinId,
    pub cabin_type_id: CabinTypeId,
    pub occupancy: Occupancy,
}

/// A checkout request.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub voyage_id: VoyageId,
    pub user_id: Option<UserId>,
    pub items: Vec<CheckoutItem>,
    pub passengers: Vec<Passenger>,
    pub contact: Contact,
    pub remark: Option<String>,
}

/// Places orders.
///
/// Prices are snapshotted from the catalog and the order is validated and
/// persisted holding nothing. Each item then locks one cabin in request
/// order and its stage is written back before the next lock, so every held
/// lock is referenced by a stored pending order the reaper can reclaim.
/// Lock conflicts are retried with bounded backoff. A lock that still fails
/// after earlier items locked is not rolled back: the order is expired at
/// once and the reaper returns what it holds on its next scan.
pub struct Checkout<S: LedgerStore, R: OrderRepository, P: PriceCatalog> {
    lifecycle: Arc<OrderLifecycle<S, R>>,
    catalog: P,
    retry: RetryPolicy,
    order_ttl: Duration,
}

impl<S: LedgerStore, R: OrderRepository, P: PriceCatalog> Checkout<S, R, P> {
    /// Creates a checkout with the default retry policy and a 15 minute
    /// reservation window.
    pub fn new(lifecycle: Arc<OrderLifecycle<S, R>>, catalog: P) -> Self {
        Self {
            lifecycle,
            catalog,
            retry: RetryPolicy::default(),
            order_ttl: default_order_ttl(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_order_ttl(mut self, order_ttl: Duration) -> Self {
        self.order_ttl = order_ttl;
        self
    }

    /// Places an order. On success every item holds one locked cabin.
    #[tracing::instrument(
        skip(self, request),
        fields(voyage_id = %request.voyage_id, items = request.items.len())
    )]
    pub async fn place_order(&self, request: CheckoutRequest) -> Result<Order> {
        let now = Utc::now();

        let mut items = Vec::with_capacity(request.items.len());
        for line in &request.items {
            let price = self
                .catalog
                .current_price(request.voyage_id, line.cabin_type_id)
                .await?
                .ok_or(BookingError::PriceNotFound {
                    voyage_id: request.voyage_id,
                    cabin_type_id: line.cabin_type_id,
                })?;
            items.push(OrderItem::new(
                request.voyage_id,
                line.cabin_id,
                line.cabin_type_id,
                price,
                line.occupancy,
            ));
        }

        let draft = OrderDraft {
            voyage_id: request.voyage_id,
            user_id: request.user_id,
            items,
            passengers: request.passengers,
            contact: request.contact,
            remark: request.remark,
        };
        let mut order = Order::create(draft, self.order_ttl, now)?;
        for item in &mut order.items {
            item.status = ItemStatus::Released;
        }
        if let Err(e) = self.lifecycle.orders().insert_order(&order).await {
            metrics::counter!("checkout_total", "outcome" => "error").increment(1);
            return Err(e.into());
        }

        let ledger = self.lifecycle.ledger();
        for index in 0..order.items.len() {
            let key = InventoryKey::new(order.voyage_id, order.items[index].cabin_type_id);
            if let Err(source) = retry_on_conflict(&self.retry, || ledger.lock(key, 1)).await {
                return Err(self.abandon(order, index, source).await);
            }

            order.items[index].status = ItemStatus::Locked;
            if let Err(e) = self
                .lifecycle
                .orders()
                .update_order(&order, OrderStatus::Pending)
                .await
            {
                // the stored order does not reference this lock
                order.items[index].status = ItemStatus::Released;
                if let Err(unlock_err) = ledger.unlock(key, 1).await {
                    tracing::warn!(
                        order_number = %order.order_number,
                        error = %unlock_err,
                        "failed to return unrecorded lock"
                    );
                }
                tracing::error!(
                    order_number = %order.order_number,
                    locked = index,
                    error = %e,
                    "failed to record locked cabin"
                );
                metrics::counter!("checkout_total", "outcome" => "error").increment(1);
                return Err(e.into());
            }
        }

        metrics::counter!("checkout_total", "outcome" => "ok").increment(1);
        tracing::info!(
            order_number = %order.order_number,
            total = %order.total_amount,
            "order placed"
        );
        Ok(order)
    }

    /// Handles a lock failure at item `locked`. Items from that index on
    /// hold nothing and are already marked released.
    ///
    /// An order holding nothing is cancelled outright. Otherwise it is
    /// expired now so it cannot be paid and the reaper reclaims its locks.
    async fn abandon(&self, mut order: Order, locked: usize, source: LedgerError) -> BookingError {
        if locked == 0 {
            if let Err(e) = self.lifecycle.cancel_order(order).await {
                tracing::warn!(error = %e, "failed to cancel rejected order");
            }
            metrics::counter!("checkout_total", "outcome" => "rejected").increment(1);
            return BookingError::Ledger(source);
        }

        let now = Utc::now();
        order.expires_at = Some(now);
        order.updated_at = now;
        if let Err(e) = self
            .lifecycle
            .orders()
            .update_order(&order, OrderStatus::Pending)
            .await
        {
            tracing::warn!(
                order_number = %order.order_number,
                error = %e,
                "failed to expire partially locked order"
            );
        }

        metrics::counter!("checkout_total", "outcome" => "partial").increment(1);
        tracing::warn!(
            order_number = %order.order_number,
            locked,
            error = %source,
            "checkout stopped after partial lock"
        );
        BookingError::PartialCheckout {
            order_id: order.id,
            order_number: order.order_number,
            locked,
            source,
        }
    }
}
