pub mod db;
pub mod error;
pub mod store;
pub mod writer;

pub use db::{create_db, create_memory_db, DbPool};
pub use error::{StoreError, WriteError};
pub use store::{CorrectionOutcome, DimensionIds, SqliteStore, TransactionStore};
pub use writer::{persist_rules, write_transactions, BatchWriter, WriteMode, WriteSummary};
