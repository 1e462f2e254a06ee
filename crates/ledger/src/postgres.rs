use async_trait::async_trait;
use common::{CabinTypeId, VoyageId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CabinInventory, InventoryKey, LedgerError, Result, Transfer, Version, store::LedgerStore,
};

const COLUMNS: &str = "voyage_id, cabin_type_id, total, available, locked, booked, maintenance, version, last_updated_at";

/// PostgreSQL-backed ledger store.
///
/// Counter columns are `BIGINT` with `CHECK (>= 0)` constraints; the
/// conservation invariant is enforced by a table-level check as well.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Creates a new PostgreSQL ledger store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn counter(row: &PgRow, column: &str) -> Result<u32> {
        let value: i64 = row.try_get(column)?;
        u32::try_from(value).map_err(|e| LedgerError::Database(sqlx::Error::Decode(Box::new(e))))
    }

    fn row_to_inventory(row: PgRow) -> Result<CabinInventory> {
        Ok(CabinInventory {
            voyage_id: VoyageId::from_uuid(row.try_get::<Uuid, _>("voyage_id")?),
            cabin_type_id: CabinTypeId::from_uuid(row.try_get::<Uuid, _>("cabin_type_id")?),
            total: Self::counter(&row, "total")?,
            available: Self::counter(&row, "available")?,
            locked: Self::counter(&row, "locked")?,
            booked: Self::counter(&row, "booked")?,
            maintenance: Self::counter(&row, "maintenance")?,
            version: Version::new(row.try_get("version")?),
            last_updated_at: row.try_get("last_updated_at")?,
        })
    }

    async fn fetch_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        key: InventoryKey,
    ) -> Result<Option<CabinInventory>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM cabin_inventory WHERE voyage_id = $1 AND cabin_type_id = $2"
        ))
        .bind(key.voyage_id.as_uuid())
        .bind(key.cabin_type_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::row_to_inventory).transpose()
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn insert(&self, inventory: CabinInventory) -> Result<()> {
        let key = inventory.key();
        sqlx::query(
            r#"
            INSERT INTO cabin_inventory (voyage_id, cabin_type_id, total, available, locked, booked, maintenance, version, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(key.voyage_id.as_uuid())
        .bind(key.cabin_type_id.as_uuid())
        .bind(i64::from(inventory.total))
        .bind(i64::from(inventory.available))
        .bind(i64::from(inventory.locked))
        .bind(i64::from(inventory.booked))
        .bind(i64::from(inventory.maintenance))
        .bind(inventory.version.as_i64())
        .bind(inventory.last_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("cabin_inventory_pkey")
            {
                return LedgerError::InventoryExists(key);
            }
            LedgerError::Database(e)
        })?;

        Ok(())
    }

    async fn get(&self, key: InventoryKey) -> Result<Option<CabinInventory>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM cabin_inventory WHERE voyage_id = $1 AND cabin_type_id = $2"
        ))
        .bind(key.voyage_id.as_uuid())
        .bind(key.cabin_type_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_inventory).transpose()
    }

    async fn list_by_voyage(&self, voyage_id: VoyageId) -> Result<Vec<CabinInventory>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM cabin_inventory WHERE voyage_id = $1 ORDER BY cabin_type_id"
        ))
        .bind(voyage_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_inventory).collect()
    }

    async fn list_all(&self) -> Result<Vec<CabinInventory>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM cabin_inventory ORDER BY voyage_id, cabin_type_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_inventory).collect()
    }

    async fn compare_and_transfer(
        &self,
        key: InventoryKey,
        transfer: Transfer,
    ) -> Result<CabinInventory> {
        let mut tx = self.pool.begin().await?;

        let current = Self::fetch_in_tx(&mut tx, key)
            .await?
            .ok_or(LedgerError::InventoryNotFound(key))?;
        let next = current.apply(transfer)?;

        let result = sqlx::query(
            r#"
            UPDATE cabin_inventory
            SET available = $1, locked = $2, booked = $3, maintenance = $4,
                version = $5, last_updated_at = $6
            WHERE voyage_id = $7 AND cabin_type_id = $8 AND version = $9
            "#,
        )
        .bind(i64::from(next.available))
        .bind(i64::from(next.locked))
        .bind(i64::from(next.booked))
        .bind(i64::from(next.maintenance))
        .bind(next.version.as_i64())
        .bind(next.last_updated_at)
        .bind(key.voyage_id.as_uuid())
        .bind(key.cabin_type_id.as_uuid())
        .bind(current.version.as_i64())
        .execute(&mut *tx)
        .await?;

        // Dropping the transaction rolls it back.
        if result.rows_affected() == 0 {
            return Err(LedgerError::ConcurrentModification {
                key,
                expected: current.version,
            });
        }

        tx.commit().await?;
        Ok(next)
    }

    async fn transfer(&self, key: InventoryKey, transfer: Transfer) -> Result<CabinInventory> {
        if transfer.quantity == 0 {
            return Err(LedgerError::InvalidQuantity(transfer.quantity));
        }

        let mut tx = self.pool.begin().await?;

        // Column names come from `Bucket::as_str`, never from input.
        let from = transfer.from.as_str();
        let to = transfer.to.as_str();
        let updated = sqlx::query(&format!(
            r#"
            UPDATE cabin_inventory
            SET {from} = {from} - $1, {to} = {to} + $1,
                version = version + 1, last_updated_at = NOW()
            WHERE voyage_id = $2 AND cabin_type_id = $3 AND {from} >= $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(i64::from(transfer.quantity))
        .bind(key.voyage_id.as_uuid())
        .bind(key.cabin_type_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => {
                let inventory = Self::row_to_inventory(row)?;
                tx.commit().await?;
                Ok(inventory)
            }
            None => match Self::fetch_in_tx(&mut tx, key).await? {
                Some(current) => Err(LedgerError::InsufficientInventory {
                    key,
                    bucket: transfer.from,
                    requested: transfer.quantity,
                    remaining: current.count(transfer.from),
                }),
                None => Err(LedgerError::InventoryNotFound(key)),
            },
        }
    }

    async fn replace(
        &self,
        expected: Version,
        mut inventory: CabinInventory,
    ) -> Result<CabinInventory> {
        inventory.validate()?;

        let key = inventory.key();
        inventory.version = expected.next();

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(&format!(
            r#"
            UPDATE cabin_inventory
            SET total = $1, available = $2, locked = $3, booked = $4, maintenance = $5,
                version = $6, last_updated_at = NOW()
            WHERE voyage_id = $7 AND cabin_type_id = $8 AND version = $9
            RETURNING {COLUMNS}
            "#
        ))
        .bind(i64::from(inventory.total))
        .bind(i64::from(inventory.available))
        .bind(i64::from(inventory.locked))
        .bind(i64::from(inventory.booked))
        .bind(i64::from(inventory.maintenance))
        .bind(inventory.version.as_i64())
        .bind(key.voyage_id.as_uuid())
        .bind(key.cabin_type_id.as_uuid())
        .bind(expected.as_i64())
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => {
                let stored = Self::row_to_inventory(row)?;
                tx.commit().await?;
                Ok(stored)
            }
            None => match Self::fetch_in_tx(&mut tx, key).await? {
                Some(_) => Err(LedgerError::ConcurrentModification { key, expected }),
                None => Err(LedgerError::InventoryNotFound(key)),
            },
        }
    }
}
