//! Multi-backend storage abstraction.
//!
//! Provides a unified interface for working with S3, GCS, the local
//! filesystem and an in-process memory store.

mod gcs;
mod local;
mod memory;
mod s3;
mod url_parser;

pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutMode, PutOptions, PutPayload,
};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use memory::MemoryConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
    pub(crate) storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

/// Record the outcome and latency of a single storage request.
fn record_request<T>(
    operation: StorageOperation,
    start: Instant,
    result: &Result<T, object_store::Error>,
) {
    let status = if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url)?;

        match config {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// Create a provider backed by a fresh in-process memory store.
    pub fn in_memory() -> Self {
        Self::construct_memory(MemoryConfig { key: None })
    }

    /// The canonical URL of the storage root.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Get storage options passed at construction.
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;
        record_request(StorageOperation::Get, start, &result);

        let bytes = result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)?;
        Ok(bytes)
    }

    /// Get the contents of a file, returning `None` if it does not exist.
    pub async fn get_opt(&self, path: &Path) -> Result<Option<Bytes>, StorageError> {
        match self.get(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Put a payload to a path, overwriting any existing object.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        self.put_payload_with_opts(path, payload, PutOptions::default())
            .await
    }

    /// Put a payload only if no object exists at the path.
    ///
    /// Fails with an error for which [`StorageError::is_already_exists`] holds
    /// when another writer created the object first.
    pub async fn put_if_absent(
        &self,
        path: &Path,
        payload: PutPayload,
    ) -> Result<(), StorageError> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        self.put_payload_with_opts(path, payload, opts).await
    }

    /// Put a Parquet file to a path with the correct content type.
    ///
    /// Sets `Content-Type: application/vnd.apache.parquet` on cloud storage backends.
    /// Local filesystem doesn't support attributes, so they are skipped.
    pub async fn put_parquet(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        if !matches!(self.config, BackendConfig::S3(_) | BackendConfig::Gcs(_)) {
            return self.put_payload(path, payload).await;
        }

        let opts = PutOptions {
            attributes: Attributes::from_iter([(
                Attribute::ContentType,
                AttributeValue::from("application/vnd.apache.parquet"),
            )]),
            ..Default::default()
        };
        self.put_payload_with_opts(path, payload, opts).await
    }

    async fn put_payload_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;
        record_request(StorageOperation::Put, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete a file at the given path.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.delete(&path).await;
        record_request(StorageOperation::Delete, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Check whether an object exists at the path.
    pub async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.head(&path).await;
        record_request(StorageOperation::Head, start, &result);

        match result {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    /// List all objects under a prefix (relative to the configured base prefix).
    ///
    /// Returns paths relative to the configured base prefix, sorted.
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<Path>, StorageError> {
        let full_prefix: Path = match self.config.key() {
            Some(key) => key.parts().chain(Path::from(prefix).parts()).collect(),
            None => Path::from(prefix),
        };

        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let result: Result<Vec<Path>, object_store::Error> = self
            .object_store
            .list(Some(&full_prefix))
            .map_ok(|meta| meta.location.parts().skip(key_part_count).collect())
            .try_collect()
            .await;
        record_request(StorageOperation::List, start, &result);

        let mut paths = match result {
            Ok(paths) => paths,
            // Local listings of a missing directory surface as NotFound
            Err(object_store::Error::NotFound { .. }) => Vec::new(),
            Err(source) => return Err(StorageError::ObjectStore { source }),
        };
        paths.sort();
        Ok(paths)
    }

    /// Delete every object under a prefix. Returns the number of objects removed.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let paths = self.list_with_prefix(prefix).await?;
        for path in &paths {
            match self.delete(path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        debug!("Deleted {} objects under {}", paths.len(), prefix);
        Ok(paths.len())
    }
}
