//! Floe: a streaming upsert sink for snapshot-isolated tables.
//!
//! Change operations (insert, delete and paired update-delete/update-insert)
//! are buffered per primary key, reduced to their net effect, and committed
//! on every sync as one atomic snapshot of new data files plus equality-delete
//! files for the rows they replace.
//!
//! This crate handles:
//! - Per-key change reduction within a window (`changelog`)
//! - Per-partition Parquet data and equality-delete files (`writer`)
//! - Committed key locations for upserts (`index`)
//! - Optimistic commits against a versioned file-system catalog (`catalog`, `commit`)
//! - The write/sync/close lifecycle (`sink`) and reading tables back (`scan`)

pub mod catalog;
pub mod changelog;
pub mod cli;
pub mod commit;
pub mod config;
pub mod error;
pub mod index;
pub mod metrics;
pub mod partition;
pub mod scan;
pub mod schema;
pub mod sink;
pub mod value;
pub mod writer;

// Re-export commonly used items
pub use catalog::{Catalog, FsCatalog, TableHandle, TableIdentifier};
pub use changelog::{ChangeBuffer, KeyState, Op, Operation, reduce};
pub use commit::{CommitCoordinator, CommitPolicy};
pub use config::{Config, InsertMode, SinkConfig};
pub use error::{CatalogError, SinkError};
pub use partition::{PartitionKey, PartitionSpec};
pub use scan::TableScan;
pub use schema::{Column, DataType, TableSchema};
pub use sink::{SyncSummary, UpsertSink};
pub use value::{PrimaryKey, Row, Value};
pub use writer::{PartitionFile, PartitionFileSet};

// Re-export from floe-core
pub use floe_core::{StorageProvider, StorageProviderRef, init_metrics, init_tracing};
