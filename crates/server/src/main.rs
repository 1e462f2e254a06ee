//! Booking server entry point.

use std::error::Error;
use std::sync::Arc;

use booking::{InMemoryPriceCatalog, OrderLifecycle, TracingAlertSink};
use domain::{
    InMemoryRepository, OrderRepository, PaymentMethod, PaymentRepository, PostgresRepository,
    RefundRepository,
};
use ledger::{InMemoryLedgerStore, InventoryLedger, LedgerStore, PostgresLedgerStore};
use metrics_exporter_prometheus::PrometheusHandle;
use payments::{PaymentService, WechatPayProvider};
use server::config::Config;
use server::scheduler::Scheduler;
use server::{AppState, telemetry};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;

type BoxError = Box<dyn Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Wires stores into services and runs until shutdown.
async fn serve<S, R, Q>(
    config: Config,
    ledger_store: S,
    orders: R,
    repo: Q,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError>
where
    S: LedgerStore + Clone + 'static,
    R: OrderRepository + 'static,
    Q: PaymentRepository + RefundRepository + 'static,
{
    let lifecycle = Arc::new(OrderLifecycle::new(
        InventoryLedger::new(ledger_store),
        orders,
    ));

    let mut payment_service = PaymentService::new(lifecycle.clone(), repo);
    if let Some(wechat) = &config.wechat {
        let provider = WechatPayProvider::new(wechat.provider_config()?)?;
        payment_service = payment_service.with_provider(PaymentMethod::Wechat, Arc::new(provider));
        tracing::info!(mch_id = %wechat.mch_id, "WeChat Pay enabled");
    } else {
        tracing::warn!("no payment provider configured, notifications will be rejected");
    }

    let scheduler = Scheduler::start(lifecycle.clone(), Arc::new(TracingAlertSink), &config);
    let state = AppState::new(
        Arc::new(payment_service),
        lifecycle,
        InMemoryPriceCatalog::new(),
        &config,
    )
    .with_reaper(scheduler.reaper());
    let app = server::create_app(Arc::new(state), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting booking server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    telemetry::init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = telemetry::init_metrics()?;

    // 3. Pick the stores and run
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let ledger_store = PostgresLedgerStore::new(pool.clone());
            ledger_store.run_migrations().await?;
            let repo = PostgresRepository::new(pool);
            tracing::info!("using PostgreSQL stores");
            serve(config, ledger_store, repo.clone(), repo, metrics_handle).await
        }
        None => {
            let repo = InMemoryRepository::new();
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            serve(
                config,
                InMemoryLedgerStore::new(),
                repo.clone(),
                repo,
                metrics_handle,
            )
            .await
        }
    }
}
