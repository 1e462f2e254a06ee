//! Background jobs: the reservation reaper and the inventory monitor.

use std::sync::Arc;

use booking::{AlertSink, InventoryMonitor, OrderLifecycle, Reaper, ReaperHandle};
use domain::OrderRepository;
use ledger::LedgerStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Running background jobs sharing one shutdown signal.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    reaper: ReaperHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the reaper and the inventory monitor.
    pub fn start<S, R>(
        lifecycle: Arc<OrderLifecycle<S, R>>,
        sink: Arc<dyn AlertSink>,
        config: &Config,
    ) -> Self
    where
        S: LedgerStore + Clone + 'static,
        R: OrderRepository + 'static,
    {
        let (shutdown, rx) = watch::channel(false);

        let monitor = InventoryMonitor::new(
            lifecycle.ledger().clone(),
            sink,
            config.inventory_alert.clone(),
        );
        let (reaper, reaper_task) = Reaper::new(lifecycle)
            .with_interval(config.reaper_interval)
            .spawn(rx.clone());
        let monitor_task = monitor.spawn(rx);

        Self {
            shutdown,
            reaper,
            tasks: vec![reaper_task, monitor_task],
        }
    }

    /// Handle for out-of-band cancellations.
    pub fn reaper(&self) -> ReaperHandle {
        self.reaper.clone()
    }

    /// Signals every job to stop and waits for them.
    pub async fn shutdown(self) {
        // receivers also stop when the sender is dropped
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background job panicked");
            }
        }
        tracing::info!("background jobs stopped");
    }
}
