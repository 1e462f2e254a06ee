use chrono::{DateTime, Utc};
use common::{CabinTypeId, VoyageId};
use serde::{Deserialize, Serialize};

use crate::{LedgerError, Result};

/// Version number of a ledger row, used for optimistic concurrency.
///
/// Every successful mutation increments the version by one. A freshly
/// initialized row starts at version 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version with the given value.
    pub fn new(version: i64) -> Self {
        Self(version)
    }

    /// Returns the version of a freshly initialized row.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Address of a ledger row: one cabin type on one voyage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryKey {
    pub voyage_id: VoyageId,
    pub cabin_type_id: CabinTypeId,
}

impl InventoryKey {
    pub fn new(voyage_id: VoyageId, cabin_type_id: CabinTypeId) -> Self {
        Self {
            voyage_id,
            cabin_type_id,
        }
    }
}

impl std::fmt::Display for InventoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.voyage_id, self.cabin_type_id)
    }
}

/// One of the counters a ledger row partitions its cabins into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Available,
    Locked,
    Booked,
    Maintenance,
}

impl Bucket {
    /// Returns the column name backing this counter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Locked => "locked",
            Self::Booked => "booked",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Moves `quantity` cabins from one counter to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub from: Bucket,
    pub to: Bucket,
    pub quantity: u32,
}

impl Transfer {
    /// `available -> locked`
    pub fn lock(quantity: u32) -> Self {
        Self {
            from: Bucket::Available,
            to: Bucket::Locked,
            quantity,
        }
    }

    /// `locked -> available`
    pub fn unlock(quantity: u32) -> Self {
        Self {
            from: Bucket::Locked,
            to: Bucket::Available,
            quantity,
        }
    }

    /// `locked -> booked`
    pub fn confirm(quantity: u32) -> Self {
        Self {
            from: Bucket::Locked,
            to: Bucket::Booked,
            quantity,
        }
    }

    /// `booked -> available`
    pub fn cancel_booking(quantity: u32) -> Self {
        Self {
            from: Bucket::Booked,
            to: Bucket::Available,
            quantity,
        }
    }
}

/// Availability counters for one cabin type on one voyage.
///
/// `available + locked + booked + maintenance == total` holds after every
/// successful mutation, and no counter ever goes below zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CabinInventory {
    pub voyage_id: VoyageId,
    pub cabin_type_id: CabinTypeId,
    pub total: u32,
    pub available: u32,
    pub locked: u32,
    pub booked: u32,
    pub maintenance: u32,
    pub version: Version,
    pub last_updated_at: DateTime<Utc>,
}

impl CabinInventory {
    /// Creates a fresh row with every cabin available.
    pub fn new(key: InventoryKey, total: u32) -> Self {
        Self {
            voyage_id: key.voyage_id,
            cabin_type_id: key.cabin_type_id,
            total,
            available: total,
            locked: 0,
            booked: 0,
            maintenance: 0,
            version: Version::initial(),
            last_updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.voyage_id, self.cabin_type_id)
    }

    pub fn count(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::Available => self.available,
            Bucket::Locked => self.locked,
            Bucket::Booked => self.booked,
            Bucket::Maintenance => self.maintenance,
        }
    }

    fn count_mut(&mut self, bucket: Bucket) -> &mut u32 {
        match bucket {
            Bucket::Available => &mut self.available,
            Bucket::Locked => &mut self.locked,
            Bucket::Booked => &mut self.booked,
            Bucket::Maintenance => &mut self.maintenance,
        }
    }

    /// Sum of all four counters, widened so a corrupt row cannot overflow.
    pub fn accounted(&self) -> u64 {
        u64::from(self.available)
            + u64::from(self.locked)
            + u64::from(self.booked)
            + u64::from(self.maintenance)
    }

    /// Returns true if the counters partition `total` exactly.
    pub fn is_balanced(&self) -> bool {
        self.accounted() == u64::from(self.total)
    }

    /// Checks the conservation invariant.
    pub fn validate(&self) -> Result<()> {
        if self.is_balanced() {
            Ok(())
        } else {
            Err(LedgerError::InvariantViolation {
                key: self.key(),
                total: self.total,
                accounted: self.accounted(),
            })
        }
    }

    /// Computes the row that results from applying `transfer`.
    ///
    /// The returned row carries the next version. `self` is left untouched,
    /// so stores can decide whether the write still applies.
    pub fn apply(&self, transfer: Transfer) -> Result<CabinInventory> {
        if transfer.quantity == 0 {
            return Err(LedgerError::InvalidQuantity(transfer.quantity));
        }

        let remaining = self.count(transfer.from);
        if remaining < transfer.quantity {
            return Err(LedgerError::InsufficientInventory {
                key: self.key(),
                bucket: transfer.from,
                requested: transfer.quantity,
                remaining,
            });
        }

        let mut next = self.clone();
        *next.count_mut(transfer.from) -= transfer.quantity;
        let target = next.count_mut(transfer.to);
        *target = target
            .checked_add(transfer.quantity)
            .ok_or(LedgerError::InvariantViolation {
                key: self.key(),
                total: self.total,
                accounted: self.accounted() + u64::from(transfer.quantity),
            })?;
        next.validate()?;

        next.version = self.version.next();
        next.last_updated_at = Utc::now();
        Ok(next)
    }
}
