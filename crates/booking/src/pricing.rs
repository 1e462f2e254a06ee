//! Price catalog trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{CabinTypeId, VoyageId};
use domain::PriceSnapshot;
use tokio::sync::RwLock;

use crate::error::{BookingError, Result};

/// Source of the effective per-head prices of a cabin type on a voyage.
#[async_trait]
pub trait PriceCatalog: Send + Sync {
    /// Returns the price in effect now, or `None` if none is published.
    async fn current_price(
        &self,
        voyage_id: VoyageId,
        cabin_type_id: CabinTypeId,
    ) -> Result<Option<PriceSnapshot>>;
}

/// In-memory price catalog for tests and single-process runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPriceCatalog {
    prices: Arc<RwLock<HashMap<(VoyageId, CabinTypeId), PriceSnapshot>>>,
    fail_on_lookup: Arc<AtomicBool>,
}

impl InMemoryPriceCatalog {
    /// Creates a new empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes (or replaces) a price.
    pub async fn set_price(
        &self,
        voyage_id: VoyageId,
        cabin_type_id: CabinTypeId,
        price: PriceSnapshot,
    ) {
        self.prices
            .write()
            .await
            .insert((voyage_id, cabin_type_id), price);
    }

    /// Configures the catalog to fail every lookup.
    pub fn set_fail_on_lookup(&self, fail: bool) {
        self.fail_on_lookup.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PriceCatalog for InMemoryPriceCatalog {
    async fn current_price(
        &self,
        voyage_id: VoyageId,
        cabin_type_id: CabinTypeId,
    ) -> Result<Option<PriceSnapshot>> {
        if self.fail_on_lookup.load(Ordering::SeqCst) {
            return Err(BookingError::PriceCatalog(
                "Price catalog unavailable".to_string(),
            ));
        }
        Ok(self
            .prices
            .read()
            .await
            .get(&(voyage_id, cabin_type_id))
            .copied())
    }
}
