//! Services for bank-service.

pub mod database;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod transfer;

pub use database::Database;
pub use error::LedgerError;
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use store::{LedgerStore, UnitOfWork};
pub use transfer::{TransferEngine, DEFAULT_TRANSFER_TIMEOUT};
