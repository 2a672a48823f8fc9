//! Reading the live rows of a committed snapshot.
//!
//! A data file row is live unless an equality-delete file of the same
//! partition, committed with a higher sequence number, carries its key.

use bytes::Bytes;
use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use futures::future::try_join_all;
use futures::{StreamExt, TryStreamExt, stream};
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use floe_core::StorageProviderRef;

use crate::catalog::{Catalog, DataFile, TableHandle};
use crate::error::{BatchReadSnafu, ColumnMismatchSnafu, ParquetReadSnafu, ReadFileSnafu, ScanError};
use crate::partition::PartitionKey;
use crate::schema::TableSchema;
use crate::value::{PrimaryKey, Row};
use crate::writer::FileContent;
use crate::writer::arrow::batch_to_rows;

const READ_CONCURRENCY: usize = 8;

/// A read of one table version.
pub struct TableScan {
    storage: StorageProviderRef,
    schema: Arc<TableSchema>,
    key_schema: TableSchema,
    data_files: Vec<DataFile>,
    delete_files: Vec<DataFile>,
}

impl TableScan {
    pub fn new<C: Catalog + ?Sized>(catalog: &C, handle: &TableHandle) -> Self {
        let metadata = handle.metadata();
        Self {
            storage: catalog.file_io(),
            schema: Arc::new(metadata.schema.clone()),
            key_schema: metadata.schema.key_schema(),
            data_files: metadata.data_files().cloned().collect(),
            delete_files: metadata.delete_files().cloned().collect(),
        }
    }

    /// Every live row of the snapshot.
    pub async fn rows(&self) -> Result<Vec<Row>, ScanError> {
        self.scan(None, None).await
    }

    /// Live rows whose key is in `keys`.
    ///
    /// With `partitions`, only data files of those partitions are read.
    pub async fn lookup_keys(
        &self,
        keys: &HashSet<PrimaryKey>,
        partitions: Option<&HashSet<PartitionKey>>,
    ) -> Result<Vec<Row>, ScanError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.scan(Some(keys), partitions).await
    }

    /// Keys of every file committed after `sequence_number`, in commit order.
    ///
    /// Within one commit the delete files come first, since a commit's
    /// deletes never apply to its own rows.
    pub async fn keys_since(
        &self,
        sequence_number: u64,
    ) -> Result<Vec<(DataFile, HashSet<PrimaryKey>)>, ScanError> {
        let mut files: Vec<&DataFile> = self
            .data_files
            .iter()
            .chain(&self.delete_files)
            .filter(|f| f.sequence_number > sequence_number)
            .collect();
        files.sort_by_key(|f| (f.sequence_number, f.content == FileContent::Data));

        let keys: Vec<HashSet<PrimaryKey>> = stream::iter(files.iter().map(|f| self.read_keys(f)))
            .buffered(READ_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(files.into_iter().cloned().zip(keys).collect())
    }

    async fn scan(
        &self,
        keys: Option<&HashSet<PrimaryKey>>,
        partitions: Option<&HashSet<PartitionKey>>,
    ) -> Result<Vec<Row>, ScanError> {
        let data_files: Vec<&DataFile> = self
            .data_files
            .iter()
            .filter(|f| partitions.is_none_or(|p| p.contains(&f.partition)))
            .collect();

        let relevant_deletes: Vec<&DataFile> = self
            .delete_files
            .iter()
            .filter(|d| data_files.iter().any(|f| d.deletes_from(f)))
            .collect();
        let deleted_keys: HashMap<&str, HashSet<PrimaryKey>> = try_join_all(
            relevant_deletes.iter().map(|d| self.read_keys(d)),
        )
        .await?
        .into_iter()
        .zip(&relevant_deletes)
        .map(|(keys, file)| (file.path.as_str(), keys))
        .collect();

        let mut rows = Vec::new();
        for file in &data_files {
            let deletes: Vec<&HashSet<PrimaryKey>> = relevant_deletes
                .iter()
                .filter(|d| d.deletes_from(file))
                .filter_map(|d| deleted_keys.get(d.path.as_str()))
                .collect();

            let file_rows = self.read_file(&file.path, &self.schema).await?;
            rows.extend(file_rows.into_iter().filter(|row| {
                let key = self.schema.key_of(row);
                keys.is_none_or(|k| k.contains(&key)) && !deletes.iter().any(|d| d.contains(&key))
            }));
        }

        debug!(
            data_files = data_files.len(),
            delete_files = relevant_deletes.len(),
            rows = rows.len(),
            "Scanned table"
        );
        Ok(rows)
    }

    async fn read_keys(&self, file: &DataFile) -> Result<HashSet<PrimaryKey>, ScanError> {
        let rows = self.read_file(&file.path, &self.key_schema).await?;
        Ok(rows.into_iter().map(PrimaryKey::new).collect())
    }

    async fn read_file(&self, path: &str, schema: &TableSchema) -> Result<Vec<Row>, ScanError> {
        let bytes: Bytes = self
            .storage
            .get(&Path::from(path))
            .await
            .context(ReadFileSnafu { path })?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .and_then(|builder| builder.build())
            .context(ParquetReadSnafu { path })?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.context(BatchReadSnafu { path })?;
            let batch_rows = batch_to_rows(schema, &batch)
                .map_err(|column| ColumnMismatchSnafu { path, column }.build())?;
            rows.extend(batch_rows);
        }
        Ok(rows)
    }
}
