//! PostgreSQL integration tests for the repository.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p domain --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, DurationRound, Utc};
use common::{CabinId, CabinTypeId, UserId, VoyageId};
use domain::{
    Contact, DomainError, ItemStatus, Money, Occupancy, Order, OrderDraft, OrderItem,
    OrderRepository, OrderStatus, Passenger, PassengerKind, Payment, PaymentMethod,
    PaymentRepository, PaymentStatus, PostgresRepository, PriceSnapshot, RefundRepository,
    RefundRequest, RefundStatus, default_order_ttl,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            for migration in [
                include_str!("../../../migrations/001_create_cabin_inventory.sql"),
                include_str!("../../../migrations/002_create_orders.sql"),
                include_str!("../../../migrations/003_create_payments.sql"),
            ] {
                sqlx::raw_sql(migration).execute(&temp_pool).await.unwrap();
            }
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_repo() -> PostgresRepository {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE refund_requests, payments, passengers, order_items, orders")
        .execute(&pool)
        .await
        .unwrap();

    PostgresRepository::new(pool)
}

/// Postgres stores microseconds; truncate so round trips compare equal.
fn now() -> chrono::DateTime<Utc> {
    Utc::now()
        .duration_trunc(Duration::microseconds(1))
        .unwrap()
}

fn sample_order() -> Order {
    let voyage_id = VoyageId::new();
    let price = PriceSnapshot {
        adult: Money::from_major(4999),
        child: Money::from_major(2499),
        infant: Money::from_major(300),
        port_fee: Money::from_major(180),
        service_fee: Money::from_major(60),
    };
    let draft = OrderDraft {
        voyage_id,
        user_id: Some(UserId::new()),
        items: vec![
            OrderItem::new(
                voyage_id,
                CabinId::new(),
                CabinTypeId::new(),
                price,
                Occupancy::new(2, 0, 1),
            ),
            OrderItem::new(
                voyage_id,
                CabinId::new(),
                CabinTypeId::new(),
                price,
                Occupancy::new(1, 1, 0),
            ),
        ],
        passengers: vec![
            Passenger::new("Chen Jing", PassengerKind::Adult),
            Passenger::new("Chen Hao", PassengerKind::Adult),
            Passenger::new("Chen Xiaobao", PassengerKind::Infant),
            Passenger::new("Zhou Min", PassengerKind::Adult),
            Passenger::new("Zhou Lele", PassengerKind::Child),
        ],
        contact: Contact {
            name: "Chen Jing".into(),
            phone: "13600136000".into(),
            email: Some("chen@example.com".into()),
        },
        remark: Some("adjacent cabins".into()),
    };
    Order::create(draft, default_order_ttl(), now()).unwrap()
}

#[tokio::test]
#[serial]
async fn order_round_trip_with_children() {
    let repo = get_test_repo().await;
    let order = sample_order();
    repo.insert_order(&order).await.unwrap();

    let stored = repo.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored, order);

    let by_number = repo
        .get_order_by_number(&order.order_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_number.items.len(), 2);
    assert_eq!(by_number.passengers.len(), 5);
}

#[tokio::test]
#[serial]
async fn duplicate_order_number_is_rejected() {
    let repo = get_test_repo().await;
    let order = sample_order();
    repo.insert_order(&order).await.unwrap();

    let mut clash = sample_order();
    clash.order_number = order.order_number.clone();
    let err = repo.insert_order(&clash).await.unwrap_err();
    assert!(matches!(err, DomainError::DuplicateOrderNumber(_)));
}

#[tokio::test]
#[serial]
async fn conditional_status_update() {
    let repo = get_test_repo().await;
    let order = sample_order();
    repo.insert_order(&order).await.unwrap();

    let at = now();
    let mut cancelled = order.clone();
    cancelled.mark_cancelled(at).unwrap();
    for item in &mut cancelled.items {
        item.status = ItemStatus::Released;
    }
    repo.update_order(&cancelled, OrderStatus::Pending)
        .await
        .unwrap();

    let mut paid = order.clone();
    paid.mark_paid(paid.total_amount, at, at).unwrap();
    let err = repo
        .update_order(&paid, OrderStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::StaleOrder { .. }));

    let stored = repo.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert!(stored.items.iter().all(|i| i.status == ItemStatus::Released));
    assert!(
        repo.list_orders_by_status(OrderStatus::Pending)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
#[serial]
async fn payments_and_refunds_round_trip() {
    let repo = get_test_repo().await;
    let order = sample_order();
    repo.insert_order(&order).await.unwrap();

    let mut payment = Payment::new(
        order.id,
        PaymentMethod::Wechat,
        order.total_amount,
        "CNY",
        now(),
    );
    repo.insert_payment(&payment).await.unwrap();
    assert!(matches!(
        repo.insert_payment(&payment).await,
        Err(DomainError::Database(_)) | Err(DomainError::DuplicatePayment(_))
    ));

    payment.status = PaymentStatus::Success;
    payment.paid_at = Some(now());
    payment.third_party_transaction_id = Some("4200009876".into());
    repo.update_payment(&payment, PaymentStatus::Pending)
        .await
        .unwrap();
    let stored = repo
        .get_payment_by_no(&payment.payment_no)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, payment);

    let mut refund = RefundRequest::new(
        order.id,
        Some(order.items[0].id),
        Money::from_major(100),
        order.total_amount,
        "one cabin cancelled",
        None,
        now(),
    );
    repo.insert_refund(&refund).await.unwrap();
    refund.status = RefundStatus::Rejected;
    refund.review_note = Some("outside policy".into());
    repo.update_refund(&refund, RefundStatus::Pending)
        .await
        .unwrap();

    let refunds = repo.list_refunds_for_order(order.id).await.unwrap();
    assert_eq!(refunds, vec![refund.clone()]);
    assert!(matches!(
        repo.update_refund(&refund, RefundStatus::Pending).await,
        Err(DomainError::StaleRefund { .. })
    ));
}

#[tokio::test]
#[serial]
async fn one_successful_payment_per_order() {
    let repo = get_test_repo().await;
    let order = sample_order();
    repo.insert_order(&order).await.unwrap();

    let mut first = Payment::new(
        order.id,
        PaymentMethod::Wechat,
        order.total_amount,
        "CNY",
        now(),
    );
    let mut second = Payment::new(
        order.id,
        PaymentMethod::Wechat,
        order.total_amount,
        "CNY",
        now(),
    );
    repo.insert_payment(&first).await.unwrap();
    repo.insert_payment(&second).await.unwrap();

    first.status = PaymentStatus::Success;
    repo.update_payment(&first, PaymentStatus::Pending)
        .await
        .unwrap();
    second.status = PaymentStatus::Success;
    let err = repo
        .update_payment(&second, PaymentStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::PaymentAlreadySucceeded { .. }));

    let stored = repo
        .get_payment_by_no(&second.payment_no)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
}
