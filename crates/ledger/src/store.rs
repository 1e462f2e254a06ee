use async_trait::async_trait;
use common::VoyageId;

use crate::{CabinInventory, InventoryKey, Result, Transfer, Version};

/// Persistence contract for ledger rows.
///
/// Every mutating method is atomic with respect to concurrent callers on the
/// same key, and every successful mutation increments the row's version.
/// Implementations never retry on their own.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts a new row. Fails with `InventoryExists` if the key is taken.
    async fn insert(&self, inventory: CabinInventory) -> Result<()>;

    /// Fetches a row by key.
    async fn get(&self, key: InventoryKey) -> Result<Option<CabinInventory>>;

    /// Lists the rows of one voyage.
    async fn list_by_voyage(&self, voyage_id: VoyageId) -> Result<Vec<CabinInventory>>;

    /// Lists every row.
    async fn list_all(&self) -> Result<Vec<CabinInventory>>;

    /// Optimistic transfer: reads the row, applies `transfer` to the copy,
    /// then writes it back only if the version is unchanged.
    ///
    /// Fails with `ConcurrentModification` when the conditional write
    /// matches nothing.
    async fn compare_and_transfer(
        &self,
        key: InventoryKey,
        transfer: Transfer,
    ) -> Result<CabinInventory>;

    /// Guarded relative update: moves `transfer.quantity` in a single
    /// statement, provided the source counter covers it.
    async fn transfer(&self, key: InventoryKey, transfer: Transfer) -> Result<CabinInventory>;

    /// Replaces the row's counters if its version is still `expected`.
    ///
    /// The stored row ends up at `expected.next()`.
    async fn replace(&self, expected: Version, inventory: CabinInventory)
    -> Result<CabinInventory>;
}
