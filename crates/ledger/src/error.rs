use thiserror::Error;

use crate::{Bucket, InventoryKey, Version};

/// Errors that can occur when operating on the inventory ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The source counter does not cover the requested quantity.
    #[error(
        "Insufficient cabin inventory for {key}: requested {requested}, {bucket} has {remaining}"
    )]
    InsufficientInventory {
        key: InventoryKey,
        bucket: Bucket,
        requested: u32,
        remaining: u32,
    },

    /// Another writer changed the row between read and conditional update.
    #[error("Concurrent modification of inventory {key} at version {expected}, please retry")]
    ConcurrentModification {
        key: InventoryKey,
        expected: Version,
    },

    #[error("Inventory not found: {0}")]
    InventoryNotFound(InventoryKey),

    #[error("Inventory already exists: {0}")]
    InventoryExists(InventoryKey),

    #[error("Invalid quantity: {0} (must be greater than 0)")]
    InvalidQuantity(u32),

    /// Counters do not partition the row's total.
    #[error("Inventory {key} is unbalanced: total {total}, counters sum to {accounted}")]
    InvariantViolation {
        key: InventoryKey,
        total: u32,
        accounted: u64,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl LedgerError {
    /// Only a lost compare-and-swap is safe to retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
