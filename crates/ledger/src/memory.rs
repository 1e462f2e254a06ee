use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::VoyageId;
use tokio::sync::RwLock;

use crate::{
    CabinInventory, InventoryKey, LedgerError, Result, Transfer, Version, store::LedgerStore,
};

/// In-memory ledger store for tests and single-process runs.
///
/// The optimistic path reads under a shared lock and writes under an
/// exclusive one, so concurrent callers can lose the version race exactly as
/// they would against PostgreSQL.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    rows: Arc<RwLock<HashMap<InventoryKey, CabinInventory>>>,
}

impl InMemoryLedgerStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of rows stored.
    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Overwrites a row without any checks. Test helper for corrupt rows.
    pub async fn put_unchecked(&self, inventory: CabinInventory) {
        self.rows.write().await.insert(inventory.key(), inventory);
    }
}

fn sorted(mut rows: Vec<CabinInventory>) -> Vec<CabinInventory> {
    rows.sort_by_key(|r| (r.voyage_id, r.cabin_type_id));
    rows
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert(&self, inventory: CabinInventory) -> Result<()> {
        let mut rows = self.rows.write().await;
        let key = inventory.key();
        if rows.contains_key(&key) {
            return Err(LedgerError::InventoryExists(key));
        }
        rows.insert(key, inventory);
        Ok(())
    }

    async fn get(&self, key: InventoryKey) -> Result<Option<CabinInventory>> {
        Ok(self.rows.read().await.get(&key).cloned())
    }

    async fn list_by_voyage(&self, voyage_id: VoyageId) -> Result<Vec<CabinInventory>> {
        let rows = self.rows.read().await;
        Ok(sorted(
            rows.values()
                .filter(|r| r.voyage_id == voyage_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<CabinInventory>> {
        Ok(sorted(self.rows.read().await.values().cloned().collect()))
    }

    async fn compare_and_transfer(
        &self,
        key: InventoryKey,
        transfer: Transfer,
    ) -> Result<CabinInventory> {
        let current = self
            .rows
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(LedgerError::InventoryNotFound(key))?;

        let next = current.apply(transfer)?;

        let mut rows = self.rows.write().await;
        match rows.get_mut(&key) {
            Some(row) if row.version == current.version => {
                *row = next.clone();
                Ok(next)
            }
            Some(_) => Err(LedgerError::ConcurrentModification {
                key,
                expected: current.version,
            }),
            None => Err(LedgerError::InventoryNotFound(key)),
        }
    }

    async fn transfer(&self, key: InventoryKey, transfer: Transfer) -> Result<CabinInventory> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&key)
            .ok_or(LedgerError::InventoryNotFound(key))?;
        let next = row.apply(transfer)?;
        *row = next.clone();
        Ok(next)
    }

    async fn replace(
        &self,
        expected: Version,
        mut inventory: CabinInventory,
    ) -> Result<CabinInventory> {
        inventory.validate()?;

        let key = inventory.key();
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&key)
            .ok_or(LedgerError::InventoryNotFound(key))?;
        if row.version != expected {
            return Err(LedgerError::ConcurrentModification { key, expected });
        }

        inventory.version = expected.next();
        inventory.last_updated_at = Utc::now();
        *row = inventory.clone();
        Ok(inventory)
    }
}
