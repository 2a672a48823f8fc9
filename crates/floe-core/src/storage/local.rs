//! Warehouse on the local filesystem.
//!
//! Relative warehouse paths are resolved against the working directory once,
//! at construction, so the provider keeps pointing at the same tree.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

impl LocalConfig {
    /// Absolute warehouse root.
    fn root(&self) -> Result<PathBuf, StorageError> {
        std::path::absolute(&self.path).context(IoSnafu)
    }
}

impl StorageProvider {
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        let root = config.root()?;
        tokio::fs::create_dir_all(&root).await.context(IoSnafu)?;

        // Partition directories emptied by discarded files are pruned
        let store = LocalFileSystem::new_with_prefix(&root)
            .context(ObjectStoreSnafu)?
            .with_automatic_cleanup(true);
        let object_store: Arc<dyn ObjectStore> = Arc::new(store);

        let canonical_url = format!("file://{}", root.display());
        let config = LocalConfig {
            path: root.display().to_string(),
        };

        Ok(Self {
            config: BackendConfig::Local(config),
            object_store,
            canonical_url,
            storage_options: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_store::path::Path;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_creates_missing_warehouse_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("a/b/warehouse");

        let storage = StorageProvider::construct_local(LocalConfig {
            path: root.display().to_string(),
        })
        .await
        .unwrap();

        assert!(root.is_dir());
        assert_eq!(storage.canonical_url(), format!("file://{}", root.display()));
    }

    #[test]
    fn test_relative_root_is_made_absolute() {
        let config = LocalConfig {
            path: "warehouse".into(),
        };
        let root = config.root().unwrap();
        assert!(root.is_absolute());
        assert!(root.ends_with("warehouse"));
    }

    #[tokio::test]
    async fn test_empty_partition_directories_are_pruned() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::construct_local(LocalConfig {
            path: temp_dir.path().display().to_string(),
        })
        .await
        .unwrap();

        let path = Path::from("db/t/data/part=aaa/file.parquet");
        storage
            .put_payload(&path, Bytes::from_static(b"x").into())
            .await
            .unwrap();
        assert!(temp_dir.path().join("db/t/data/part=aaa").is_dir());

        storage.delete(&path).await.unwrap();
        assert!(!temp_dir.path().join("db/t/data/part=aaa").exists());
    }
}
