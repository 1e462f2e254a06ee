use std::collections::HashMap;

use async_trait::async_trait;
use common::{
    CabinId, CabinTypeId, OrderId, OrderItemId, PassengerId, PaymentId, RefundId, UserId,
    VoyageId,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Contact, DomainError, Money, Occupancy, Order, OrderItem, OrderStatus, Passenger, Payment,
    PaymentStatus, PriceSnapshot, RefundRequest, RefundStatus,
    error::Result,
    repository::{OrderRepository, PaymentRepository, RefundRepository},
};

const ORDER_COLUMNS: &str = "id, order_number, user_id, voyage_id, status, payment_status, total_amount, paid_amount, currency, passenger_count, cabin_count, contact_name, contact_phone, contact_email, remark, created_at, expires_at, paid_at, confirmed_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, voyage_id, cabin_id, cabin_type_id, adult_price, child_price, infant_price, port_fee, service_fee, adult_count, child_count, infant_count, subtotal, status";

const PASSENGER_COLUMNS: &str = "id, order_id, name, kind, id_number, passport_number, phone";

const PAYMENT_COLUMNS: &str = "id, payment_no, order_id, method, status, amount, currency, third_party_transaction_id, paid_at, notify_at, retry_count, error_message, created_at, updated_at";

const REFUND_COLUMNS: &str = "id, order_id, order_item_id, amount, reason, refund_type, status, requested_at, reviewed_at, reviewed_by, review_note, processed_at, provider_refund_id";

/// PostgreSQL-backed repository for orders, payments and refund requests.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

fn money(row: &PgRow, column: &str) -> Result<Money> {
    Ok(Money::from_cents(row.try_get(column)?))
}

fn count(row: &PgRow, column: &str) -> Result<u32> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|e| DomainError::Database(sqlx::Error::Decode(Box::new(e))))
}

fn to_int(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|e| DomainError::Database(sqlx::Error::Encode(Box::new(e))))
}

fn parse<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = crate::ParseEnumError>,
{
    let value: String = row.try_get(column)?;
    Ok(value.parse()?)
}

impl PostgresRepository {
    /// Creates a new PostgreSQL repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: &PgRow) -> Result<Order> {
        Ok(Order {
            id: OrderId::from_uuid(row.try_get("id")?),
            order_number: row.try_get("order_number")?,
            user_id: row
                .try_get::<Option<Uuid>, _>("user_id")?
                .map(UserId::from_uuid),
            voyage_id: VoyageId::from_uuid(row.try_get("voyage_id")?),
            status: parse(row, "status")?,
            payment_status: parse(row, "payment_status")?,
            total_amount: money(row, "total_amount")?,
            paid_amount: money(row, "paid_amount")?,
            currency: row.try_get("currency")?,
            passenger_count: count(row, "passenger_count")?,
            cabin_count: count(row, "cabin_count")?,
            contact: Contact {
                name: row.try_get("contact_name")?,
                phone: row.try_get("contact_phone")?,
                email: row.try_get("contact_email")?,
            },
            remark: row.try_get("remark")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            paid_at: row.try_get("paid_at")?,
            confirmed_at: row.try_get("confirmed_at")?,
            updated_at: row.try_get("updated_at")?,
            items: Vec::new(),
            passengers: Vec::new(),
        })
    }

    fn row_to_item(row: &PgRow) -> Result<OrderItem> {
        Ok(OrderItem {
            id: OrderItemId::from_uuid(row.try_get("id")?),
            voyage_id: VoyageId::from_uuid(row.try_get("voyage_id")?),
            cabin_id: CabinId::from_uuid(row.try_get("cabin_id")?),
            cabin_type_id: CabinTypeId::from_uuid(row.try_get("cabin_type_id")?),
            price: PriceSnapshot {
                adult: money(row, "adult_price")?,
                child: money(row, "child_price")?,
                infant: money(row, "infant_price")?,
                port_fee: money(row, "port_fee")?,
                service_fee: money(row, "service_fee")?,
            },
            occupancy: Occupancy {
                adults: count(row, "adult_count")?,
                children: count(row, "child_count")?,
                infants: count(row, "infant_count")?,
            },
            subtotal: money(row, "subtotal")?,
            status: parse(row, "status")?,
        })
    }

    fn row_to_passenger(row: &PgRow) -> Result<Passenger> {
        Ok(Passenger {
            id: PassengerId::from_uuid(row.try_get("id")?),
            name: row.try_get("name")?,
            kind: parse(row, "kind")?,
            id_number: row.try_get("id_number")?,
            passport_number: row.try_get("passport_number")?,
            phone: row.try_get("phone")?,
        })
    }

    fn row_to_payment(row: &PgRow) -> Result<Payment> {
        Ok(Payment {
            id: PaymentId::from_uuid(row.try_get("id")?),
            payment_no: row.try_get("payment_no")?,
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            method: parse(row, "method")?,
            status: parse(row, "status")?,
            amount: money(row, "amount")?,
            currency: row.try_get("currency")?,
            third_party_transaction_id: row.try_get("third_party_transaction_id")?,
            paid_at: row.try_get("paid_at")?,
            notify_at: row.try_get("notify_at")?,
            retry_count: count(row, "retry_count")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_refund(row: &PgRow) -> Result<RefundRequest> {
        Ok(RefundRequest {
            id: RefundId::from_uuid(row.try_get("id")?),
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            order_item_id: row
                .try_get::<Option<Uuid>, _>("order_item_id")?
                .map(OrderItemId::from_uuid),
            amount: money(row, "amount")?,
            reason: row.try_get("reason")?,
            refund_type: parse(row, "refund_type")?,
            status: parse(row, "status")?,
            requested_at: row.try_get("requested_at")?,
            reviewed_at: row.try_get("reviewed_at")?,
            reviewed_by: row
                .try_get::<Option<Uuid>, _>("reviewed_by")?
                .map(UserId::from_uuid),
            review_note: row.try_get("review_note")?,
            processed_at: row.try_get("processed_at")?,
            provider_refund_id: row.try_get("provider_refund_id")?,
        })
    }

    /// Attaches items and passengers to freshly loaded order rows.
    async fn with_children(&self, rows: Vec<PgRow>) -> Result<Vec<Order>> {
        let mut orders = rows
            .iter()
            .map(Self::row_to_order)
            .collect::<Result<Vec<_>>>()?;
        if orders.is_empty() {
            return Ok(orders);
        }
        let ids: Vec<Uuid> = orders.iter().map(|o| o.id.as_uuid()).collect();

        let item_rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = ANY($1) ORDER BY order_id, position"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let passenger_rows = sqlx::query(&format!(
            "SELECT {PASSENGER_COLUMNS} FROM passengers WHERE order_id = ANY($1) ORDER BY order_id, position"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut items: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for row in &item_rows {
            let order_id: Uuid = row.try_get("order_id")?;
            items.entry(order_id).or_default().push(Self::row_to_item(row)?);
        }
        let mut passengers: HashMap<Uuid, Vec<Passenger>> = HashMap::new();
        for row in &passenger_rows {
            let order_id: Uuid = row.try_get("order_id")?;
            passengers
                .entry(order_id)
                .or_default()
                .push(Self::row_to_passenger(row)?);
        }

        for order in &mut orders {
            order.items = items.remove(&order.id.as_uuid()).unwrap_or_default();
            order.passengers = passengers.remove(&order.id.as_uuid()).unwrap_or_default();
        }
        Ok(orders)
    }

    async fn fetch_one_order(&self, row: Option<PgRow>) -> Result<Option<Order>> {
        match row {
            Some(row) => Ok(self.with_children(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OrderRepository for PostgresRepository {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        ))
        .bind(order.id.as_uuid())
        .bind(&order.order_number)
        .bind(order.user_id.map(|u| u.as_uuid()))
        .bind(order.voyage_id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.total_amount.cents())
        .bind(order.paid_amount.cents())
        .bind(&order.currency)
        .bind(to_int(order.passenger_count)?)
        .bind(to_int(order.cabin_count)?)
        .bind(&order.contact.name)
        .bind(&order.contact.phone)
        .bind(&order.contact.email)
        .bind(&order.remark)
        .bind(order.created_at)
        .bind(order.expires_at)
        .bind(order.paid_at)
        .bind(order.confirmed_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("orders_order_number_key")
            {
                return DomainError::DuplicateOrderNumber(order.order_number.clone());
            }
            DomainError::Database(e)
        })?;

        for (position, item) in order.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, position, voyage_id, cabin_id, cabin_type_id,
                    adult_price, child_price, infant_price, port_fee, service_fee,
                    adult_count, child_count, infant_count, subtotal, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(item.id.as_uuid())
            .bind(order.id.as_uuid())
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .bind(item.voyage_id.as_uuid())
            .bind(item.cabin_id.as_uuid())
            .bind(item.cabin_type_id.as_uuid())
            .bind(item.price.adult.cents())
            .bind(item.price.child.cents())
            .bind(item.price.infant.cents())
            .bind(item.price.port_fee.cents())
            .bind(item.price.service_fee.cents())
            .bind(to_int(item.occupancy.adults)?)
            .bind(to_int(item.occupancy.children)?)
            .bind(to_int(item.occupancy.infants)?)
            .bind(item.subtotal.cents())
            .bind(item.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for (position, passenger) in order.passengers.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO passengers (id, order_id, position, name, kind, id_number, passport_number, phone)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(passenger.id.as_uuid())
            .bind(order.id.as_uuid())
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .bind(&passenger.name)
            .bind(passenger.kind.as_str())
            .bind(&passenger.id_number)
            .bind(&passenger.passport_number)
            .bind(&passenger.phone)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        self.fetch_one_order(row).await
    }

    async fn get_order_by_number(&self, order_number: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_number = $1"
        ))
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await?;
        self.fetch_one_order(row).await
    }

    async fn list_orders_by_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.with_children(rows).await
    }

    async fn update_order(&self, order: &Order, expected: OrderStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $1, payment_status = $2, paid_amount = $3, paid_at = $4,
                confirmed_at = $5, contact_name = $6, contact_phone = $7, contact_email = $8,
                remark = $9, expires_at = $10, updated_at = $11
            WHERE id = $12 AND status = $13
            "#,
        )
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.paid_amount.cents())
        .bind(order.paid_at)
        .bind(order.confirmed_at)
        .bind(&order.contact.name)
        .bind(&order.contact.phone)
        .bind(&order.contact.email)
        .bind(&order.remark)
        .bind(order.expires_at)
        .bind(order.updated_at)
        .bind(order.id.as_uuid())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM orders WHERE id = $1")
                .bind(order.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                Some(_) => DomainError::StaleOrder {
                    order_id: order.id,
                    expected,
                },
                None => DomainError::OrderNotFound(order.id.to_string()),
            });
        }

        for item in &order.items {
            sqlx::query("UPDATE order_items SET status = $1 WHERE id = $2 AND order_id = $3")
                .bind(item.status.as_str())
                .bind(item.id.as_uuid())
                .bind(order.id.as_uuid())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PaymentRepository for PostgresRepository {
    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(payment.id.as_uuid())
        .bind(&payment.payment_no)
        .bind(payment.order_id.as_uuid())
        .bind(payment.method.as_str())
        .bind(payment.status.as_str())
        .bind(payment.amount.cents())
        .bind(&payment.currency)
        .bind(&payment.third_party_transaction_id)
        .bind(payment.paid_at)
        .bind(payment.notify_at)
        .bind(to_int(payment.retry_count)?)
        .bind(&payment.error_message)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("payments_payment_no_key")
            {
                return DomainError::DuplicatePayment(payment.payment_no.clone());
            }
            DomainError::Database(e)
        })?;
        Ok(())
    }

    async fn get_payment_by_no(&self, payment_no: &str) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_no = $1"
        ))
        .bind(payment_no)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_payment).transpose()
    }

    async fn list_payments_for_order(&self, order_id: OrderId) -> Result<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_payment).collect()
    }

    async fn update_payment(&self, payment: &Payment, expected: PaymentStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $1, third_party_transaction_id = $2, paid_at = $3, notify_at = $4,
                retry_count = $5, error_message = $6, updated_at = $7
            WHERE id = $8 AND status = $9
            "#,
        )
        .bind(payment.status.as_str())
        .bind(&payment.third_party_transaction_id)
        .bind(payment.paid_at)
        .bind(payment.notify_at)
        .bind(to_int(payment.retry_count)?)
        .bind(&payment.error_message)
        .bind(payment.updated_at)
        .bind(payment.id.as_uuid())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("idx_payments_one_success")
            {
                return DomainError::PaymentAlreadySucceeded {
                    order_id: payment.order_id,
                };
            }
            DomainError::Database(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(match self.get_payment_by_no(&payment.payment_no).await? {
                Some(_) => DomainError::StalePayment {
                    payment_no: payment.payment_no.clone(),
                    expected,
                },
                None => DomainError::PaymentNotFound(payment.payment_no.clone()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RefundRepository for PostgresRepository {
    async fn insert_refund(&self, refund: &RefundRequest) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO refund_requests ({REFUND_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(refund.id.as_uuid())
        .bind(refund.order_id.as_uuid())
        .bind(refund.order_item_id.map(|i| i.as_uuid()))
        .bind(refund.amount.cents())
        .bind(&refund.reason)
        .bind(refund.refund_type.as_str())
        .bind(refund.status.as_str())
        .bind(refund.requested_at)
        .bind(refund.reviewed_at)
        .bind(refund.reviewed_by.map(|u| u.as_uuid()))
        .bind(&refund.review_note)
        .bind(refund.processed_at)
        .bind(&refund.provider_refund_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_refund(&self, id: RefundId) -> Result<Option<RefundRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {REFUND_COLUMNS} FROM refund_requests WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_refund).transpose()
    }

    async fn list_refunds_for_order(&self, order_id: OrderId) -> Result<Vec<RefundRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REFUND_COLUMNS} FROM refund_requests WHERE order_id = $1 ORDER BY requested_at ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_refund).collect()
    }

    async fn update_refund(&self, refund: &RefundRequest, expected: RefundStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE refund_requests
            SET status = $1, reviewed_at = $2, reviewed_by = $3, review_note = $4,
                processed_at = $5, provider_refund_id = $6
            WHERE id = $7 AND status = $8
            "#,
        )
        .bind(refund.status.as_str())
        .bind(refund.reviewed_at)
        .bind(refund.reviewed_by.map(|u| u.as_uuid()))
        .bind(&refund.review_note)
        .bind(refund.processed_at)
        .bind(&refund.provider_refund_id)
        .bind(refund.id.as_uuid())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match self.get_refund(refund.id).await? {
                Some(_) => DomainError::StaleRefund {
                    refund_id: refund.id,
                    expected,
                },
                None => DomainError::RefundNotFound(refund.id),
            });
        }
        Ok(())
    }
}
