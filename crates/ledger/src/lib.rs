pub mod error;
pub mod inventory;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod retry;
pub mod store;

pub use common::{CabinTypeId, VoyageId};
pub use error::{LedgerError, Result};
pub use inventory::{Bucket, CabinInventory, InventoryKey, Transfer, Version};
pub use ledger::{Availability, InventoryLedger, LedgerOperation};
pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use retry::RetryPolicy;
pub use store::LedgerStore;
