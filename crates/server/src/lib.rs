//! Cabin booking service.
//!
//! Serves provider payment notifications and checkout over HTTP, runs the
//! reservation reaper and the inventory monitor in the background, and
//! exposes health and Prometheus metrics endpoints.

pub mod config;
pub mod error;
pub mod routes;
pub mod scheduler;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use booking::{Checkout, InMemoryPriceCatalog, OrderLifecycle, ReaperHandle};
use domain::{OrderRepository, PaymentRepository, RefundRepository};
use ledger::LedgerStore;
use metrics_exporter_prometheus::PrometheusHandle;
use payments::PaymentService;
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<S, R, Q>
where
    S: LedgerStore,
    R: OrderRepository,
    Q: PaymentRepository + RefundRepository,
{
    pub checkout: Checkout<S, R, InMemoryPriceCatalog>,
    pub payments: Arc<PaymentService<S, R, Q>>,
    /// Set when the background reaper runs.
    pub reaper: Option<ReaperHandle>,
}

impl<S, R, Q> AppState<S, R, Q>
where
    S: LedgerStore,
    R: OrderRepository,
    Q: PaymentRepository + RefundRepository,
{
    pub fn new(
        payments: Arc<PaymentService<S, R, Q>>,
        lifecycle: Arc<OrderLifecycle<S, R>>,
        catalog: InMemoryPriceCatalog,
        config: &Config,
    ) -> Self {
        Self {
            checkout: Checkout::new(lifecycle, catalog).with_order_ttl(config.order_ttl()),
            payments,
            reaper: None,
        }
    }

    pub fn with_reaper(mut self, reaper: ReaperHandle) -> Self {
        self.reaper = Some(reaper);
        self
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, R, Q>(state: Arc<AppState<S, R, Q>>, metrics_handle: PrometheusHandle) -> Router
where
    S: LedgerStore + 'static,
    R: OrderRepository + 'static,
    Q: PaymentRepository + RefundRepository + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create::<S, R, Q>))
        .route(
            "/payments/{provider}/notify",
            post(routes::payments::notify::<S, R, Q>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}
