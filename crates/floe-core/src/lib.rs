//! Shared infrastructure for floe: storage, configuration, metrics and tracing.

pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod tracing;

pub use crate::metrics::init_global as init_metrics;
pub use crate::tracing::init_tracing;
pub use error::{ConfigError, MetricsError, StorageError};
pub use storage::{StorageProvider, StorageProviderRef};
