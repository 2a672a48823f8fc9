//! Per-partition data and equality-delete file writers for one window.

pub mod arrow;
mod parquet;

pub use parquet::{ParquetBytes, ParquetFileWriter};

use indexmap::IndexMap;
use object_store::PutPayload;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use floe_core::StorageProviderRef;
use floe_core::config::ParquetCompression;

use crate::error::{UploadSnafu, WriterError};
use crate::partition::PartitionKey;
use crate::schema::TableSchema;
use crate::value::Row;

/// Default number of rows per Arrow record batch.
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// Options shared by every writer of a file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub compression: ParquetCompression,
    pub batch_size: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: ParquetCompression::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// What a table file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileContent {
    Data,
    EqualityDeletes,
}

impl FileContent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileContent::Data => "data",
            FileContent::EqualityDeletes => "equality_deletes",
        }
    }
}

/// An immutable file written for one partition in one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFile {
    /// Path relative to the storage root.
    pub path: String,
    pub content: FileContent,
    pub partition: PartitionKey,
    pub record_count: u64,
    pub size_bytes: u64,
}

#[derive(Default)]
struct PartitionWriters {
    data: Option<ParquetFileWriter>,
    deletes: Option<ParquetFileWriter>,
}

/// Owns the open writers of the current window, one data writer and at most
/// one equality-delete writer per partition.
///
/// Every uploaded path is recorded before its upload starts, so a set that is
/// dropped mid-[`finalize`](Self::finalize) can still be [`discard`](Self::discard)ed.
pub struct PartitionFileSet {
    storage: StorageProviderRef,
    table_location: String,
    schema: Arc<TableSchema>,
    key_schema: Arc<TableSchema>,
    options: WriterOptions,
    writers: IndexMap<PartitionKey, PartitionWriters>,
    uploaded: Vec<String>,
}

impl PartitionFileSet {
    pub fn new(
        storage: StorageProviderRef,
        table_location: impl Into<String>,
        schema: Arc<TableSchema>,
        options: WriterOptions,
    ) -> Self {
        let key_schema = Arc::new(schema.key_schema());
        Self {
            storage,
            table_location: table_location.into(),
            schema,
            key_schema,
            options,
            writers: IndexMap::new(),
            uploaded: Vec::new(),
        }
    }

    /// Append a row to the partition's data file.
    pub fn write_insert(&mut self, partition: &PartitionKey, row: Row) -> Result<(), WriterError> {
        let writers = self.writers.entry(partition.clone()).or_default();
        let writer = match &mut writers.data {
            Some(writer) => writer,
            slot @ None => slot.insert(ParquetFileWriter::new(self.schema.clone(), &self.options)?),
        };
        writer.write(row)
    }

    /// Append a primary-key projection to the partition's equality-delete file.
    pub fn write_delete(&mut self, partition: &PartitionKey, key: Row) -> Result<(), WriterError> {
        let writers = self.writers.entry(partition.clone()).or_default();
        let writer = match &mut writers.deletes {
            Some(writer) => writer,
            slot @ None => {
                slot.insert(ParquetFileWriter::new(self.key_schema.clone(), &self.options)?)
            }
        };
        writer.write(key)
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Paths uploaded by this set that have not been discarded.
    pub fn uploaded_paths(&self) -> &[String] {
        &self.uploaded
    }

    fn file_path(&self, partition: &PartitionKey, content: FileContent) -> String {
        let suffix = match content {
            FileContent::Data => "",
            FileContent::EqualityDeletes => "-eq-del",
        };
        let uuid = Uuid::now_v7();
        if partition.is_unpartitioned() {
            format!("{}/data/{uuid}{suffix}.parquet", self.table_location)
        } else {
            format!(
                "{}/data/{}/{uuid}{suffix}.parquet",
                self.table_location,
                partition.path()
            )
        }
    }

    /// Close every writer and upload the non-empty files.
    ///
    /// Writers that received no rows produce no file. On error the files
    /// uploaded so far stay recorded; call [`discard`](Self::discard) to remove them.
    pub async fn finalize(&mut self) -> Result<Vec<PartitionFile>, WriterError> {
        let writers = std::mem::take(&mut self.writers);
        let mut files = Vec::new();

        for (partition, writers) in writers {
            let pending = [
                (FileContent::Data, writers.data),
                (FileContent::EqualityDeletes, writers.deletes),
            ];
            for (content, writer) in pending {
                let Some(finished) = writer.map(ParquetFileWriter::close).transpose()?.flatten()
                else {
                    continue;
                };
                let path = self.file_path(&partition, content);
                let size_bytes = finished.bytes.len() as u64;

                self.uploaded.push(path.clone());
                self.storage
                    .put_parquet(&Path::from(path.as_str()), PutPayload::from(finished.bytes))
                    .await
                    .context(UploadSnafu { path: path.clone() })?;

                debug!(
                    path = %path,
                    content = content.as_str(),
                    records = finished.record_count,
                    size_bytes,
                    "Uploaded file"
                );
                files.push(PartitionFile {
                    path,
                    content,
                    partition: partition.clone(),
                    record_count: finished.record_count,
                    size_bytes,
                });
            }
        }
        Ok(files)
    }

    /// Drop open writers and delete every file this set uploaded.
    ///
    /// Best effort: failures are logged and the path is kept for a later attempt.
    /// Returns the number of files deleted.
    pub async fn discard(&mut self) -> usize {
        self.writers.clear();
        let mut removed = 0;
        let mut remaining = Vec::new();
        for path in std::mem::take(&mut self.uploaded) {
            match self.storage.delete(&Path::from(path.as_str())).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to delete uncommitted file");
                    remaining.push(path);
                }
            }
        }
        self.uploaded = remaining;
        removed
    }

    /// Forget uploaded files after the catalog took ownership of them.
    pub fn release(&mut self) {
        self.uploaded.clear();
    }
}
