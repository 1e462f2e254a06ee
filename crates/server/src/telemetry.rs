//! Logging and metrics setup.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when it parses.
pub fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Installs the Prometheus recorder and describes the service metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!(
        "ledger_operations_total",
        "Inventory ledger operations by kind and outcome"
    );
    metrics::describe_counter!(
        "ledger_conflicts_total",
        "Conditional inventory updates lost to a concurrent writer"
    );
    metrics::describe_counter!(
        "reaper_orders_cancelled_total",
        "Pending orders cancelled by the reaper"
    );
    metrics::describe_histogram!(
        "reaper_run_duration_seconds",
        "Duration of one reaper scan"
    );
    metrics::describe_counter!(
        "payment_callbacks_total",
        "Provider notifications by outcome"
    );
    metrics::describe_counter!(
        "payments_orphaned_total",
        "Successful payments for orders that could no longer be paid"
    );
    metrics::describe_counter!("inventory_alerts_total", "Low inventory alerts raised");

    Ok(handle)
}
