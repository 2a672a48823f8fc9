//! File-system catalog: versioned metadata files next to the table data.
//!
//! Layout under the warehouse root:
//!
//! ```text
//! {namespace}/{table}/metadata/v{N}.metadata.json
//! {namespace}/{table}/metadata/version-hint.text
//! {namespace}/{table}/data/{partition}/{uuid}.parquet
//! ```
//!
//! A commit writes `v{N+1}.metadata.json` with put-if-absent, so exactly one
//! of several concurrent writers based on version `N` wins.

use async_trait::async_trait;
use object_store::PutPayload;
use object_store::path::Path;
use rand::Rng;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use floe_core::{StorageError, StorageProvider, StorageProviderRef};

use super::{Catalog, TableDelta, TableHandle, TableIdentifier, TableMetadata};
use crate::error::{
    CatalogError, CatalogStorageSnafu, InvalidTableSnafu, MetadataDecodeSnafu,
    MetadataEncodeSnafu, TableAlreadyExistsSnafu, TableNotFoundSnafu,
};
use crate::partition::PartitionSpec;
use crate::schema::TableSchema;

const METADATA_DIR: &str = "metadata";
const VERSION_HINT: &str = "version-hint.text";

fn metadata_path(location: &str, version: u64) -> Path {
    Path::from(format!("{location}/{METADATA_DIR}/v{version}.metadata.json"))
}

fn hint_path(location: &str) -> Path {
    Path::from(format!("{location}/{METADATA_DIR}/{VERSION_HINT}"))
}

/// Parse `v{N}.metadata.json` into `N`.
fn parse_version(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix('v')?
        .strip_suffix(".metadata.json")?
        .parse()
        .ok()
}

/// Catalog storing table metadata as versioned JSON files.
#[derive(Debug, Clone)]
pub struct FsCatalog {
    storage: StorageProviderRef,
}

impl FsCatalog {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    /// Open a catalog rooted at a warehouse URL.
    pub async fn from_url(
        warehouse: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let storage = StorageProvider::for_url_with_options(warehouse, options).await?;
        Ok(Self::new(Arc::new(storage)))
    }

    async fn read_hint(&self, location: &str) -> Result<Option<u64>, CatalogError> {
        let bytes = self
            .storage
            .get_opt(&hint_path(location))
            .await
            .context(CatalogStorageSnafu)?;
        Ok(bytes.and_then(|b| std::str::from_utf8(&b).ok()?.trim().parse().ok()))
    }

    async fn list_versions(&self, location: &str) -> Result<Option<u64>, CatalogError> {
        let paths = self
            .storage
            .list_with_prefix(&format!("{location}/{METADATA_DIR}"))
            .await
            .context(CatalogStorageSnafu)?;
        Ok(paths
            .iter()
            .filter_map(|p| p.filename().and_then(parse_version))
            .max())
    }

    /// Latest committed version: the hint, then check forward past it.
    async fn latest_version(&self, location: &str) -> Result<Option<u64>, CatalogError> {
        let start = match self.read_hint(location).await? {
            Some(version) => Some(version),
            None => self.list_versions(location).await?,
        };
        let Some(mut version) = start else {
            return Ok(None);
        };

        while self
            .storage
            .exists(&metadata_path(location, version + 1))
            .await
            .context(CatalogStorageSnafu)?
        {
            version += 1;
        }
        Ok(Some(version))
    }

    async fn read_metadata(
        &self,
        location: &str,
        version: u64,
    ) -> Result<TableMetadata, CatalogError> {
        let path = metadata_path(location, version);
        let bytes = self.storage.get(&path).await.context(CatalogStorageSnafu)?;
        serde_json::from_slice(&bytes).context(MetadataDecodeSnafu {
            path: path.to_string(),
        })
    }

    /// Write `metadata` as `version` unless that version already exists.
    ///
    /// Returns `Ok(false)` when another writer created the version first.
    async fn write_metadata(
        &self,
        location: &str,
        version: u64,
        metadata: &TableMetadata,
    ) -> Result<bool, CatalogError> {
        let json = serde_json::to_vec_pretty(metadata).context(MetadataEncodeSnafu)?;
        match self
            .storage
            .put_if_absent(&metadata_path(location, version), PutPayload::from(json))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => return Ok(false),
            Err(source) => return Err(CatalogError::CatalogStorage { source }),
        }

        // The hint only speeds up loads; readers look past a stale one.
        let hint = PutPayload::from(version.to_string());
        if let Err(e) = self.storage.put_payload(&hint_path(location), hint).await {
            warn!(location, version, error = %e, "Failed to update version hint");
        }
        Ok(true)
    }
}

#[async_trait]
impl Catalog for FsCatalog {
    async fn create_table(
        &self,
        identifier: &TableIdentifier,
        schema: TableSchema,
        partition_spec: PartitionSpec,
    ) -> Result<TableHandle, CatalogError> {
        partition_spec.bind(&schema).context(InvalidTableSnafu)?;

        let location = identifier.location();
        let table = identifier.to_string();
        ensure!(
            self.latest_version(&location).await?.is_none(),
            TableAlreadyExistsSnafu { table: &table }
        );

        let metadata = TableMetadata::new(location.clone(), schema, partition_spec);
        ensure!(
            self.write_metadata(&location, 1, &metadata).await?,
            TableAlreadyExistsSnafu { table: &table }
        );

        info!(target = %table, location = %location, "Created table");
        Ok(TableHandle::new(identifier.clone(), 1, metadata))
    }

    async fn load_table(&self, identifier: &TableIdentifier) -> Result<TableHandle, CatalogError> {
        let location = identifier.location();
        let version = self
            .latest_version(&location)
            .await?
            .context(TableNotFoundSnafu {
                table: identifier.to_string(),
            })?;

        let metadata = self.read_metadata(&location, version).await?;
        debug!(target = %identifier, version, files = metadata.files.len(), "Loaded table");
        Ok(TableHandle::new(identifier.clone(), version, metadata))
    }

    async fn commit(
        &self,
        base: &TableHandle,
        delta: TableDelta,
    ) -> Result<TableHandle, CatalogError> {
        let snapshot_id = rand::rng().random_range(1..i64::MAX);
        let metadata = base.metadata().apply(&delta, snapshot_id);
        let version = base.version() + 1;
        let table = base.identifier().to_string();

        if !self.write_metadata(base.location(), version, &metadata).await? {
            return Err(CatalogError::Conflict { table, version });
        }

        info!(
            target = %table,
            version,
            snapshot_id,
            sequence_number = metadata.last_sequence_number,
            data_files = delta.data_files().count(),
            delete_files = delta.delete_files().count(),
            "Committed snapshot"
        );
        Ok(TableHandle::new(base.identifier().clone(), version, metadata))
    }

    async fn drop_table(&self, identifier: &TableIdentifier) -> Result<(), CatalogError> {
        let location = identifier.location();
        ensure!(
            self.latest_version(&location).await?.is_some(),
            TableNotFoundSnafu {
                table: identifier.to_string()
            }
        );

        let removed = self
            .storage
            .delete_prefix(&location)
            .await
            .context(CatalogStorageSnafu)?;
        info!(target = %identifier, removed, "Dropped table");
        Ok(())
    }

    fn file_io(&self) -> StorageProviderRef {
        self.storage.clone()
    }
}
