//! Reservation reaper.
//!
//! Pending orders hold locked cabins until they are paid. Once an order's
//! reservation window has passed, the reaper cancels it, which returns the
//! locks to the available pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{DomainError, OrderRepository, OrderStatus};
use ledger::LedgerStore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{BookingError, Result};
use crate::lifecycle::OrderLifecycle;

pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Out-of-band cancellations waiting for the reaper task.
pub const CANCEL_QUEUE_CAPACITY: usize = 64;

/// Outcome of one reaper run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaperReport {
    /// Pending orders examined.
    pub scanned: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Why an out-of-band cancellation was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelRequestError {
    #[error("Reaper queue is full")]
    QueueFull,
    #[error("Reaper is not running")]
    Stopped,
}

/// Sends out-of-band cancellations to a running reaper.
#[derive(Debug, Clone)]
pub struct ReaperHandle {
    tx: mpsc::Sender<OrderId>,
}

impl ReaperHandle {
    /// Queues a request to cancel a pending order now, regardless of its
    /// deadline. Never waits: a full queue is reported and the order is
    /// left to the next scan after it expires.
    pub fn try_cancel_now(&self, order_id: OrderId) -> std::result::Result<(), CancelRequestError> {
        self.tx.try_send(order_id).map_err(|e| match e {
            TrySendError::Full(_) => CancelRequestError::QueueFull,
            TrySendError::Closed(_) => CancelRequestError::Stopped,
        })
    }
}

/// Cancels pending orders past their reservation deadline.
pub struct Reaper<S: LedgerStore, R: OrderRepository> {
    lifecycle: Arc<OrderLifecycle<S, R>>,
    interval: Duration,
}

impl<S, R> Reaper<S, R>
where
    S: LedgerStore + 'static,
    R: OrderRepository + 'static,
{
    pub fn new(lifecycle: Arc<OrderLifecycle<S, R>>) -> Self {
        Self {
            lifecycle,
            interval: DEFAULT_REAPER_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Scans pending orders once and cancels those expired at `now`.
    ///
    /// Never fails: a failing order is logged and counted, and the batch
    /// continues. An order paid or cancelled between the scan and the
    /// cancel is skipped.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> ReaperReport {
        let start = Instant::now();
        let mut report = ReaperReport::default();

        let pending = match self.lifecycle.list_by_status(OrderStatus::Pending).await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::error!(error = %e, "reaper failed to list pending orders");
                metrics::counter!("reaper_runs_total", "outcome" => "error").increment(1);
                return report;
            }
        };
        report.scanned = pending.len();

        for order in pending.into_iter().filter(|o| o.is_expired_at(now)) {
            let order_number = order.order_number.clone();
            match self.lifecycle.cancel_order(order).await {
                Ok((_, release)) => {
                    report.cancelled += 1;
                    if release.failed > 0 {
                        tracing::warn!(
                            %order_number,
                            failed = release.failed,
                            "expired order cancelled with unreleased cabins"
                        );
                    }
                }
                Err(BookingError::Domain(DomainError::StaleOrder { .. })) => {
                    tracing::debug!(%order_number, "order changed during reaping, skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(%order_number, error = %e, "failed to cancel expired order");
                }
            }
        }

        metrics::counter!("reaper_runs_total", "outcome" => "ok").increment(1);
        metrics::counter!("reaper_orders_cancelled_total").increment(report.cancelled as u64);
        metrics::counter!("reaper_failures_total").increment(report.failed as u64);
        metrics::histogram!("reaper_run_duration_seconds").record(start.elapsed().as_secs_f64());

        if report.cancelled > 0 || report.failed > 0 {
            tracing::info!(
                scanned = report.scanned,
                cancelled = report.cancelled,
                failed = report.failed,
                "reaper run finished"
            );
        }
        report
    }

    /// Cancels one order immediately if it is still pending.
    ///
    /// Returns whether the order was cancelled by this call.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_pending(&self, order_id: OrderId) -> Result<bool> {
        let order = self.lifecycle.get_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Ok(false);
        }
        match self.lifecycle.cancel_order(order).await {
            Ok(_) => {
                metrics::counter!("reaper_orders_cancelled_total").increment(1);
                Ok(true)
            }
            Err(BookingError::Domain(DomainError::StaleOrder { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Runs the reaper on its interval until `shutdown` flips to true or
    /// its sender is dropped.
    ///
    /// The returned handle delivers out-of-band cancellations to the same
    /// task, so they never race a scan.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> (ReaperHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(CANCEL_QUEUE_CAPACITY);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.interval.as_secs(), "reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once(Utc::now()).await;
                    }
                    Some(order_id) = rx.recv() => {
                        if let Err(e) = self.cancel_pending(order_id).await {
                            tracing::warn!(%order_id, error = %e, "out-of-band cancel failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("reaper stopped");
        });

        (ReaperHandle { tx }, task)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use common::{CabinId, CabinTypeId, VoyageId};
    use domain::{
        InMemoryRepository, Money, Occupancy, Order, OrderDraft, OrderItem, Passenger,
        PassengerKind, PriceSnapshot,
    };
    use ledger::{InMemoryLedgerStore, InventoryKey, InventoryLedger};

    use super::*;

    type TestLifecycle = OrderLifecycle<InMemoryLedgerStore, InMemoryRepository>;

    async fn setup() -> (
        Reaper<InMemoryLedgerStore, InMemoryRepository>,
        Arc<TestLifecycle>,
        InventoryKey,
    ) {
        let key = InventoryKey::new(VoyageId::new(), CabinTypeId::new());
        let ledger = InventoryLedger::new(InMemoryLedgerStore::new());
        ledger
            .initialize(key.voyage_id, &HashMap::from([(key.cabin_type_id, 5)]))
            .await
            .unwrap();
        let lifecycle = Arc::new(OrderLifecycle::new(ledger, InMemoryRepository::new()));
        (Reaper::new(lifecycle.clone()), lifecycle, key)
    }

    async fn pending_order(
        lifecycle: &TestLifecycle,
        key: InventoryKey,
        ttl: chrono::Duration,
    ) -> Order {
        let draft = OrderDraft {
            voyage_id: key.voyage_id,
            items: vec![OrderItem::new(
                key.voyage_id,
                CabinId::new(),
                key.cabin_type_id,
                PriceSnapshot {
                    adult: Money::from_major(800),
                    ..PriceSnapshot::default()
                },
                Occupancy::new(1, 0, 0),
            )],
            passengers: vec![Passenger::new("Gao Fei", PassengerKind::Adult)],
            ..OrderDraft::default()
        };
        let order = Order::create(draft, ttl, Utc::now()).unwrap();
        lifecycle.ledger().lock(key, 1).await.unwrap();
        lifecycle.orders().insert_order(&order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn cancels_only_expired_orders() {
        let (reaper, lifecycle, key) = setup().await;
        let expired = pending_order(&lifecycle, key, chrono::Duration::minutes(-1)).await;
        let fresh = pending_order(&lifecycle, key, chrono::Duration::minutes(15)).await;

        let report = reaper.run_once(Utc::now()).await;
        assert_eq!(
            report,
            ReaperReport {
                scanned: 2,
                cancelled: 1,
                failed: 0
            }
        );
        assert_eq!(
            lifecycle.get_order(expired.id).await.unwrap().status,
            OrderStatus::Cancelled
        );
        assert_eq!(
            lifecycle.get_order(fresh.id).await.unwrap().status,
            OrderStatus::Pending
        );
        let row = lifecycle.ledger().get(key).await.unwrap();
        assert_eq!((row.available, row.locked), (4, 1));
    }

    #[tokio::test]
    async fn missing_expiry_falls_back_to_created_at() {
        let (reaper, lifecycle, key) = setup().await;
        let mut order = pending_order(&lifecycle, key, chrono::Duration::minutes(15)).await;
        order.expires_at = None;
        order.created_at = Utc::now() - chrono::Duration::minutes(16);
        lifecycle
            .orders()
            .update_order(&order, OrderStatus::Pending)
            .await
            .unwrap();

        assert_eq!(reaper.run_once(Utc::now()).await.cancelled, 1);
    }

    #[tokio::test]
    async fn cancel_pending_ignores_settled_orders() {
        let (reaper, lifecycle, key) = setup().await;
        let order = pending_order(&lifecycle, key, chrono::Duration::minutes(15)).await;
        lifecycle
            .mark_paid(order.id, order.total_amount, Utc::now())
            .await
            .unwrap();

        assert!(!reaper.cancel_pending(order.id).await.unwrap());
        assert_eq!(lifecycle.ledger().get(key).await.unwrap().locked, 1);
    }

    #[tokio::test]
    async fn handle_cancels_through_running_task() {
        let (reaper, lifecycle, key) = setup().await;
        let order = pending_order(&lifecycle, key, chrono::Duration::minutes(15)).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = reaper
            .with_interval(Duration::from_secs(3600))
            .spawn(shutdown_rx);
        handle.try_cancel_now(order.id).unwrap();

        let mut status = OrderStatus::Pending;
        for _ in 0..50 {
            status = lifecycle.get_order(order.id).await.unwrap().status;
            if status == OrderStatus::Cancelled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, OrderStatus::Cancelled);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(
            handle.try_cancel_now(order.id),
            Err(CancelRequestError::Stopped)
        );
    }

    #[tokio::test]
    async fn full_queue_is_reported_without_waiting() {
        let (reaper, _lifecycle, _key) = setup().await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = reaper
            .with_interval(Duration::from_secs(3600))
            .spawn(shutdown_rx);

        // the single-threaded test runtime does not poll the task until we yield
        for _ in 0..CANCEL_QUEUE_CAPACITY {
            handle.try_cancel_now(OrderId::new()).unwrap();
        }
        assert_eq!(
            handle.try_cancel_now(OrderId::new()),
            Err(CancelRequestError::QueueFull)
        );
    }
}
