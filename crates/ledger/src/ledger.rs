//! Inventory ledger service.
//!
//! Wraps a [`LedgerStore`] with the four reservation operations, row
//! initialization, availability checks and the conservation audit.

use std::collections::HashMap;
use std::time::Instant;

use common::{CabinTypeId, VoyageId};
use serde::Serialize;

use crate::{
    CabinInventory, InventoryKey, LedgerError, Result, Transfer, Version, store::LedgerStore,
};

/// The four reservation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOperation {
    /// `available -> locked`, optimistic.
    Lock,
    /// `locked -> available`
    Unlock,
    /// `locked -> booked`
    Confirm,
    /// `booked -> available`
    CancelBooking,
}

impl LedgerOperation {
    pub fn transfer(&self, quantity: u32) -> Transfer {
        match self {
            Self::Lock => Transfer::lock(quantity),
            Self::Unlock => Transfer::unlock(quantity),
            Self::Confirm => Transfer::confirm(quantity),
            Self::CancelBooking => Transfer::cancel_booking(quantity),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Confirm => "confirm",
            Self::CancelBooking => "cancel_booking",
        }
    }
}

impl std::fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Answer to an availability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub sufficient: bool,
    pub available: u32,
}

/// Service over a ledger store.
///
/// Never retries: a lost compare-and-swap surfaces as
/// `ConcurrentModification` and the caller decides what to do.
#[derive(Clone)]
pub struct InventoryLedger<S: LedgerStore> {
    store: S,
}

impl<S: LedgerStore> InventoryLedger<S> {
    /// Creates a new ledger over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates one row per cabin type for a voyage.
    ///
    /// Zero counts are skipped. Fails on the first key that already exists;
    /// rows inserted before it are kept.
    #[tracing::instrument(skip(self, counts), fields(cabin_types = counts.len()))]
    pub async fn initialize(
        &self,
        voyage_id: VoyageId,
        counts: &HashMap<CabinTypeId, u32>,
    ) -> Result<Vec<CabinInventory>> {
        let mut created = Vec::with_capacity(counts.len());
        for (&cabin_type_id, &total) in counts {
            if total == 0 {
                continue;
            }
            let inventory = CabinInventory::new(InventoryKey::new(voyage_id, cabin_type_id), total);
            self.store.insert(inventory.clone()).await?;
            created.push(inventory);
        }

        tracing::info!(created = created.len(), "voyage inventory initialized");
        Ok(created)
    }

    /// Locks `quantity` cabins for a pending order.
    #[tracing::instrument(skip(self))]
    pub async fn lock(&self, key: InventoryKey, quantity: u32) -> Result<CabinInventory> {
        self.execute(LedgerOperation::Lock, key, quantity).await
    }

    /// Returns locked cabins to the available pool.
    #[tracing::instrument(skip(self))]
    pub async fn unlock(&self, key: InventoryKey, quantity: u32) -> Result<CabinInventory> {
        self.execute(LedgerOperation::Unlock, key, quantity).await
    }

    /// Turns locked cabins into bookings.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(&self, key: InventoryKey, quantity: u32) -> Result<CabinInventory> {
        self.execute(LedgerOperation::Confirm, key, quantity).await
    }

    /// Returns booked cabins to the available pool.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_booking(&self, key: InventoryKey, quantity: u32) -> Result<CabinInventory> {
        self.execute(LedgerOperation::CancelBooking, key, quantity)
            .await
    }

    /// Applies one of the four operations.
    pub async fn execute(
        &self,
        operation: LedgerOperation,
        key: InventoryKey,
        quantity: u32,
    ) -> Result<CabinInventory> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity(quantity));
        }

        let start = Instant::now();
        let transfer = operation.transfer(quantity);
        let result = match operation {
            LedgerOperation::Lock => self.store.compare_and_transfer(key, transfer).await,
            _ => self.store.transfer(key, transfer).await,
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(LedgerError::ConcurrentModification { .. }) => "conflict",
            Err(LedgerError::InsufficientInventory { .. }) => "insufficient",
            Err(_) => "error",
        };
        metrics::counter!(
            "ledger_operations_total",
            "operation" => operation.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("ledger_operation_duration_seconds", "operation" => operation.as_str())
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(row) => {
                tracing::debug!(
                    %operation,
                    available = row.available,
                    locked = row.locked,
                    booked = row.booked,
                    version = %row.version,
                    "ledger row updated"
                );
            }
            Err(e @ LedgerError::ConcurrentModification { .. }) => {
                metrics::counter!("ledger_conflicts_total", "operation" => operation.as_str())
                    .increment(1);
                tracing::debug!(%operation, error = %e, "ledger version conflict");
            }
            Err(e) => {
                tracing::warn!(%operation, error = %e, "ledger operation failed");
            }
        }

        result
    }

    /// Fetches a row, failing with `InventoryNotFound` if absent.
    pub async fn get(&self, key: InventoryKey) -> Result<CabinInventory> {
        self.store
            .get(key)
            .await?
            .ok_or(LedgerError::InventoryNotFound(key))
    }

    pub async fn list_by_voyage(&self, voyage_id: VoyageId) -> Result<Vec<CabinInventory>> {
        self.store.list_by_voyage(voyage_id).await
    }

    pub async fn list_all(&self) -> Result<Vec<CabinInventory>> {
        self.store.list_all().await
    }

    /// Reports whether `quantity` cabins are currently available.
    ///
    /// Advisory only: the answer can be stale by the time a lock runs.
    pub async fn check_availability(
        &self,
        key: InventoryKey,
        quantity: u32,
    ) -> Result<Availability> {
        let row = self.get(key).await?;
        Ok(Availability {
            sufficient: row.available >= quantity,
            available: row.available,
        })
    }

    /// Administrative replacement of a row's counters.
    ///
    /// `inventory.version` must be the version the caller read; the write is
    /// rejected with `ConcurrentModification` if the row moved since.
    #[tracing::instrument(skip(self, inventory), fields(key = %inventory.key()))]
    pub async fn adjust(&self, inventory: CabinInventory) -> Result<CabinInventory> {
        let expected: Version = inventory.version;
        let row = self.store.replace(expected, inventory).await?;
        tracing::info!(
            total = row.total,
            available = row.available,
            maintenance = row.maintenance,
            "inventory adjusted"
        );
        Ok(row)
    }

    /// Returns every row whose counters do not partition its total.
    #[tracing::instrument(skip(self))]
    pub async fn audit(&self) -> Result<Vec<CabinInventory>> {
        let unbalanced: Vec<_> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|row| !row.is_balanced())
            .collect();

        metrics::gauge!("ledger_unbalanced_rows").set(unbalanced.len() as f64);
        for row in &unbalanced {
            tracing::error!(
                key = %row.key(),
                total = row.total,
                accounted = row.accounted(),
                "inventory row violates conservation"
            );
        }
        Ok(unbalanced)
    }
}
