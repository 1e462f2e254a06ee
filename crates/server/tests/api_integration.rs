//! Integration tests for the booking server.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use booking::{InMemoryPriceCatalog, OrderLifecycle, Reaper};
use chrono::Utc;
use common::{CabinTypeId, OrderId, VoyageId};
use domain::{InMemoryRepository, Money, OrderStatus, Payment, PaymentMethod, PaymentStatus, PriceSnapshot};
use ledger::{InMemoryLedgerStore, InventoryKey, InventoryLedger};
use metrics_exporter_prometheus::PrometheusHandle;
use payments::{InMemoryPaymentProvider, PaymentService, TradeUpdate};
use server::AppState;
use server::config::Config;
use tokio::sync::watch;
use tower::ServiceExt;

const SIGNATURE: &str = "notify-signature";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

type Lifecycle = OrderLifecycle<InMemoryLedgerStore, InMemoryRepository>;
type Payments = PaymentService<InMemoryLedgerStore, InMemoryRepository, InMemoryRepository>;

struct TestApp {
    app: axum::Router,
    lifecycle: Arc<Lifecycle>,
    payments: Arc<Payments>,
    key: InventoryKey,
    _shutdown: watch::Sender<bool>,
}

impl TestApp {
    async fn new() -> Self {
        let key = InventoryKey::new(VoyageId::new(), CabinTypeId::new());
        let ledger = InventoryLedger::new(InMemoryLedgerStore::new());
        ledger
            .initialize(key.voyage_id, &HashMap::from([(key.cabin_type_id, 4)]))
            .await
            .unwrap();

        let catalog = InMemoryPriceCatalog::new();
        catalog
            .set_price(
                key.voyage_id,
                key.cabin_type_id,
                PriceSnapshot {
                    adult: Money::from_major(1800),
                    child: Money::from_major(900),
                    infant: Money::zero(),
                    port_fee: Money::from_major(80),
                    service_fee: Money::from_major(20),
                },
            )
            .await;

        let repo = InMemoryRepository::new();
        let lifecycle = Arc::new(OrderLifecycle::new(ledger, repo.clone()));
        let payments = Arc::new(
            PaymentService::new(lifecycle.clone(), repo).with_provider(
                PaymentMethod::Wechat,
                Arc::new(InMemoryPaymentProvider::new(SIGNATURE)),
            ),
        );

        let (shutdown, rx) = watch::channel(false);
        let (reaper, _) = Reaper::new(lifecycle.clone())
            .with_interval(Duration::from_secs(3600))
            .spawn(rx);

        let state = AppState::new(
            payments.clone(),
            lifecycle.clone(),
            catalog,
            &Config::default(),
        )
        .with_reaper(reaper);
        let app = server::create_app(Arc::new(state), get_metrics_handle());

        Self {
            app,
            lifecycle,
            payments,
            key,
            _shutdown: shutdown,
        }
    }

    fn checkout_body(&self, adults: u32) -> serde_json::Value {
        let passengers: Vec<_> = (0..adults)
            .map(|i| serde_json::json!({ "name": format!("guest {i}"), "kind": "adult" }))
            .collect();
        serde_json::json!({
            "voyage_id": self.key.voyage_id,
            "items": [{
                "cabin_id": common::CabinId::new(),
                "cabin_type_id": self.key.cabin_type_id,
                "occupancy": { "adults": adults, "children": 0, "infants": 0 },
            }],
            "passengers": passengers,
            "contact": { "name": "guest 0", "phone": "13900139000" },
        })
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn checkout(&self, adults: u32) -> (StatusCode, serde_json::Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("content-type", "application/json")
                .body(Body::from(self.checkout_body(adults).to_string()))
                .unwrap(),
        )
        .await
    }

    async fn place_order(&self) -> OrderId {
        let (status, json) = self.checkout(2).await;
        assert_eq!(status, StatusCode::CREATED);
        serde_json::from_value(json["id"].clone()).unwrap()
    }

    async fn pay(&self, order_id: OrderId) -> Payment {
        self.payments
            .create_payment(order_id, PaymentMethod::Wechat, "Cabin booking")
            .await
            .unwrap()
            .0
    }

    async fn notify(&self, provider: &str, signature: &str, body: Vec<u8>) -> StatusCode {
        self.send(
            Request::builder()
                .method("POST")
                .uri(format!("/payments/{provider}/notify"))
                .header("Wechatpay-Signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .0
    }

    async fn order_status(&self, order_id: OrderId) -> OrderStatus {
        self.lifecycle.get_order(order_id).await.unwrap().status
    }
}

fn trade(payment: &Payment, status: PaymentStatus) -> Vec<u8> {
    serde_json::to_vec(&TradeUpdate {
        payment_no: payment.payment_no.clone(),
        transaction_id: Some("4200000000000000000001".into()),
        status,
        amount: payment.amount,
        paid_at: Some(Utc::now()),
    })
    .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new().await;

    let (status, json) = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = TestApp::new().await;
    let response = app
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_checkout_creates_pending_order() {
    let app = TestApp::new().await;

    let (status, json) = app.checkout(2).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "pending");
    // 2 * 1800 + 2 * (80 + 20), in fen
    assert_eq!(json["total_amount"], 380_000);
    let row = app.lifecycle.ledger().get(app.key).await.unwrap();
    assert_eq!((row.available, row.locked), (3, 1));
}

#[tokio::test]
async fn test_checkout_validation_error() {
    let app = TestApp::new().await;
    let mut body = app.checkout_body(2);
    body["passengers"] = serde_json::json!([]);

    let (status, json) = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Passenger count"));
}

#[tokio::test]
async fn test_oversold_checkout_conflicts() {
    let app = TestApp::new().await;
    for _ in 0..4 {
        assert_eq!(app.checkout(1).await.0, StatusCode::CREATED);
    }

    let (status, json) = app.checkout(1).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(
        json["error"]
            .as_str()
            .unwrap()
            .contains("Insufficient cabin inventory")
    );
}

#[tokio::test]
async fn test_notify_marks_order_paid() {
    let app = TestApp::new().await;
    let order_id = app.place_order().await;
    let payment = app.pay(order_id).await;
    let body = trade(&payment, PaymentStatus::Success);

    assert_eq!(
        app.notify("wechat", SIGNATURE, body.clone()).await,
        StatusCode::OK
    );
    assert_eq!(app.order_status(order_id).await, OrderStatus::Paid);

    // redelivery is acknowledged without changes
    assert_eq!(app.notify("wechat", SIGNATURE, body).await, StatusCode::OK);
    let order = app.lifecycle.get_order(order_id).await.unwrap();
    assert_eq!(order.paid_amount, payment.amount);
}

#[tokio::test]
async fn test_notify_rejects_bad_signature() {
    let app = TestApp::new().await;
    let order_id = app.place_order().await;
    let payment = app.pay(order_id).await;

    let status = app
        .notify("wechat", "forged", trade(&payment, PaymentStatus::Success))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.order_status(order_id).await, OrderStatus::Pending);
}

#[tokio::test]
async fn test_notify_unknown_payment_is_retried() {
    let app = TestApp::new().await;
    let order_id = app.place_order().await;
    let mut payment = app.pay(order_id).await;
    payment.payment_no = "PAY20250101000000000000".into();

    let status = app
        .notify("wechat", SIGNATURE, trade(&payment, PaymentStatus::Success))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_notify_unknown_provider() {
    let app = TestApp::new().await;
    assert_eq!(
        app.notify("paypal", SIGNATURE, b"{}".to_vec()).await,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_closed_trade_cancels_reservation() {
    let app = TestApp::new().await;
    let order_id = app.place_order().await;
    let payment = app.pay(order_id).await;

    let status = app
        .notify("wechat", SIGNATURE, trade(&payment, PaymentStatus::Cancelled))
        .await;
    assert_eq!(status, StatusCode::OK);

    let mut cancelled = false;
    for _ in 0..50 {
        if app.order_status(order_id).await == OrderStatus::Cancelled {
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cancelled, "reaper did not cancel the order");
    let row = app.lifecycle.ledger().get(app.key).await.unwrap();
    assert_eq!((row.available, row.locked), (4, 0));
}

#[tokio::test]
async fn test_closed_stale_attempt_keeps_reservation() {
    let app = TestApp::new().await;
    let order_id = app.place_order().await;
    let abandoned = app.pay(order_id).await;
    let live = app.pay(order_id).await;

    let status = app
        .notify("wechat", SIGNATURE, trade(&abandoned, PaymentStatus::Cancelled))
        .await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.order_status(order_id).await, OrderStatus::Pending);
    let row = app.lifecycle.ledger().get(app.key).await.unwrap();
    assert_eq!((row.available, row.locked), (3, 1));

    // the live attempt still pays the order
    let status = app
        .notify("wechat", SIGNATURE, trade(&live, PaymentStatus::Success))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.order_status(order_id).await, OrderStatus::Paid);
}
