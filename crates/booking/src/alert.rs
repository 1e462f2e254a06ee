//! Low-inventory alerts and the periodic conservation audit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::{InventoryKey, InventoryLedger, LedgerStore};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;

/// A cabin type running low on a voyage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LowInventoryAlert {
    pub key: InventoryKey,
    pub available: u32,
    pub total: u32,
    pub threshold: u32,
    pub raised_at: DateTime<Utc>,
}

/// Where low-inventory alerts are delivered.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &LowInventoryAlert) -> Result<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: &LowInventoryAlert) -> Result<()> {
        tracing::warn!(
            key = %alert.key,
            available = alert.available,
            total = alert.total,
            threshold = alert.threshold,
            "low cabin inventory"
        );
        Ok(())
    }
}

/// Collects alerts in memory for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAlertSink {
    alerts: Arc<RwLock<Vec<LowInventoryAlert>>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<LowInventoryAlert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn send(&self, alert: &LowInventoryAlert) -> Result<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Alert when `available` is at or below this.
    pub threshold: u32,
    pub interval: Duration,
    /// Minimum time between two alerts for the same key.
    pub cooldown: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            interval: Duration::from_secs(15 * 60),
            cooldown: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// Outcome of one monitor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub rows: usize,
    pub alerted: usize,
    pub unbalanced: usize,
}

/// Scans the ledger for low availability and conservation violations.
pub struct InventoryMonitor<S: LedgerStore> {
    ledger: InventoryLedger<S>,
    sink: Arc<dyn AlertSink>,
    config: MonitorConfig,
    last_alerted: Mutex<HashMap<InventoryKey, DateTime<Utc>>>,
}

impl<S: LedgerStore + 'static> InventoryMonitor<S> {
    pub fn new(ledger: InventoryLedger<S>, sink: Arc<dyn AlertSink>, config: MonitorConfig) -> Self {
        Self {
            ledger,
            sink,
            config,
            last_alerted: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one scan at `now`.
    ///
    /// A key is alerted at most once per cooldown. A failed delivery is
    /// logged and retried on the next run.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MonitorReport> {
        let rows = self.ledger.list_all().await?;
        let mut report = MonitorReport {
            rows: rows.len(),
            ..MonitorReport::default()
        };

        let mut last_alerted = self.last_alerted.lock().await;
        last_alerted.retain(|_, at| !self.cooled_down(*at, now));

        for row in rows
            .iter()
            .filter(|r| r.available <= self.config.threshold)
        {
            let key = row.key();
            if last_alerted.contains_key(&key) {
                continue;
            }

            let alert = LowInventoryAlert {
                key,
                available: row.available,
                total: row.total,
                threshold: self.config.threshold,
                raised_at: now,
            };
            match self.sink.send(&alert).await {
                Ok(()) => {
                    last_alerted.insert(key, now);
                    report.alerted += 1;
                    metrics::counter!("inventory_alerts_total").increment(1);
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "failed to deliver inventory alert");
                }
            }
        }
        drop(last_alerted);

        report.unbalanced = self.ledger.audit().await?.len();
        if report.alerted > 0 || report.unbalanced > 0 {
            tracing::info!(
                rows = report.rows,
                alerted = report.alerted,
                unbalanced = report.unbalanced,
                "inventory monitor run finished"
            );
        }
        Ok(report)
    }

    fn cooled_down(&self, alerted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - alerted_at)
            .to_std()
            .map(|elapsed| elapsed >= self.config.cooldown)
            .unwrap_or(false)
    }

    /// Runs the monitor on its interval until shutdown.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            tracing::error!(error = %e, "inventory monitor run failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("inventory monitor stopped");
        })
    }
}
