//! Table catalog abstraction.
//!
//! The sink talks to its table only through [`Catalog`]: it loads a
//! [`TableHandle`], proposes an additive [`TableDelta`] against it, and gets
//! back the handle of the new snapshot or a conflict.

mod fs;

pub use fs::FsCatalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use floe_core::StorageProviderRef;

use crate::error::CatalogError;
use crate::partition::{PartitionKey, PartitionSpec};
use crate::schema::TableSchema;
use crate::writer::{FileContent, PartitionFile};

/// Table metadata format version written by this crate.
pub const FORMAT_VERSION: u32 = 2;

/// Namespace-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdentifier {
    pub namespace: String,
    pub name: String,
}

impl TableIdentifier {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Table directory relative to the warehouse root.
    pub fn location(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// A file referenced by a snapshot, stamped with the commit's sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub path: String,
    pub content: FileContent,
    pub partition: PartitionKey,
    pub record_count: u64,
    pub size_bytes: u64,
    pub sequence_number: u64,
}

impl DataFile {
    /// Whether this equality-delete file applies to `data`.
    ///
    /// Deletes only suppress rows of the same partition committed strictly
    /// before them, never rows added by the same commit.
    pub fn deletes_from(&self, data: &DataFile) -> bool {
        self.content == FileContent::EqualityDeletes
            && data.content == FileContent::Data
            && self.partition == data.partition
            && data.sequence_number < self.sequence_number
    }
}

/// Counters recorded for each snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub added_data_files: u64,
    pub added_delete_files: u64,
    pub added_records: u64,
    pub added_equality_deletes: u64,
}

/// One entry of the snapshot log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: i64,
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: u64,
    pub timestamp_ms: i64,
    pub summary: SnapshotSummary,
}

/// Full table metadata of one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub format_version: u32,
    pub table_uuid: Uuid,
    pub location: String,
    pub schema: TableSchema,
    pub partition_spec: PartitionSpec,
    pub current_snapshot_id: Option<i64>,
    pub last_sequence_number: u64,
    pub last_updated_ms: i64,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// Live files of the current snapshot.
    #[serde(default)]
    pub files: Vec<DataFile>,
}

impl TableMetadata {
    pub fn new(location: String, schema: TableSchema, partition_spec: PartitionSpec) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            table_uuid: Uuid::new_v4(),
            location,
            schema,
            partition_spec,
            current_snapshot_id: None,
            last_sequence_number: 0,
            last_updated_ms: chrono::Utc::now().timestamp_millis(),
            snapshots: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        let id = self.current_snapshot_id?;
        self.snapshots.iter().find(|s| s.snapshot_id == id)
    }

    pub fn data_files(&self) -> impl Iterator<Item = &DataFile> {
        self.files
            .iter()
            .filter(|f| f.content == FileContent::Data)
    }

    pub fn delete_files(&self) -> impl Iterator<Item = &DataFile> {
        self.files
            .iter()
            .filter(|f| f.content == FileContent::EqualityDeletes)
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// Metadata of the next version with `delta` applied.
    pub(crate) fn apply(&self, delta: &TableDelta, snapshot_id: i64) -> TableMetadata {
        let sequence_number = self.last_sequence_number + 1;
        let timestamp_ms = chrono::Utc::now().timestamp_millis();

        let mut summary = SnapshotSummary::default();
        for file in &delta.files {
            match file.content {
                FileContent::Data => {
                    summary.added_data_files += 1;
                    summary.added_records += file.record_count;
                }
                FileContent::EqualityDeletes => {
                    summary.added_delete_files += 1;
                    summary.added_equality_deletes += file.record_count;
                }
            }
        }

        let mut next = self.clone();
        next.files.extend(delta.files.iter().map(|file| DataFile {
            path: file.path.clone(),
            content: file.content,
            partition: file.partition.clone(),
            record_count: file.record_count,
            size_bytes: file.size_bytes,
            sequence_number,
        }));
        next.snapshots.push(Snapshot {
            snapshot_id,
            parent_snapshot_id: self.current_snapshot_id,
            sequence_number,
            timestamp_ms,
            summary,
        });
        next.current_snapshot_id = Some(snapshot_id);
        next.last_sequence_number = sequence_number;
        next.last_updated_ms = timestamp_ms;
        next
    }
}

/// A loaded table at a specific metadata version.
#[derive(Debug, Clone)]
pub struct TableHandle {
    identifier: TableIdentifier,
    version: u64,
    metadata: Arc<TableMetadata>,
}

impl TableHandle {
    pub fn new(identifier: TableIdentifier, version: u64, metadata: TableMetadata) -> Self {
        Self {
            identifier,
            version,
            metadata: Arc::new(metadata),
        }
    }

    pub fn identifier(&self) -> &TableIdentifier {
        &self.identifier
    }

    /// Metadata version; advances by one with every commit.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub fn schema(&self) -> &TableSchema {
        &self.metadata.schema
    }

    pub fn location(&self) -> &str {
        &self.metadata.location
    }
}

/// An additive change to a table: new data files and new equality-delete files.
#[derive(Debug, Clone, Default)]
pub struct TableDelta {
    files: Vec<PartitionFile>,
}

impl TableDelta {
    pub fn new(files: Vec<PartitionFile>) -> Self {
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[PartitionFile] {
        &self.files
    }

    pub fn data_files(&self) -> impl Iterator<Item = &PartitionFile> {
        self.files.iter().filter(|f| f.content == FileContent::Data)
    }

    pub fn delete_files(&self) -> impl Iterator<Item = &PartitionFile> {
        self.files
            .iter()
            .filter(|f| f.content == FileContent::EqualityDeletes)
    }
}

/// The table catalog collaborator.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn create_table(
        &self,
        identifier: &TableIdentifier,
        schema: TableSchema,
        partition_spec: PartitionSpec,
    ) -> Result<TableHandle, CatalogError>;

    async fn load_table(&self, identifier: &TableIdentifier) -> Result<TableHandle, CatalogError>;

    /// Atomically commit `delta` on top of `base`.
    ///
    /// Fails with [`CatalogError::Conflict`] when the table moved past `base`.
    async fn commit(
        &self,
        base: &TableHandle,
        delta: TableDelta,
    ) -> Result<TableHandle, CatalogError>;

    async fn drop_table(&self, identifier: &TableIdentifier) -> Result<(), CatalogError>;

    /// Storage that table files are written to and read from.
    fn file_io(&self) -> StorageProviderRef;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::demo_schema;

    fn file(path: &str, content: FileContent, records: u64) -> PartitionFile {
        PartitionFile {
            path: path.into(),
            content,
            partition: PartitionKey::unpartitioned(),
            record_count: records,
            size_bytes: 10,
        }
    }

    #[test]
    fn test_apply_stamps_sequence_and_summary() {
        let base = TableMetadata::new("db/t".into(), demo_schema(), PartitionSpec::unpartitioned());
        let delta = TableDelta::new(vec![
            file("db/t/data/a.parquet", FileContent::Data, 3),
            file("db/t/data/b-eq-del.parquet", FileContent::EqualityDeletes, 1),
        ]);

        let next = base.apply(&delta, 42);
        assert_eq!(next.last_sequence_number, 1);
        assert_eq!(next.current_snapshot_id, Some(42));
        assert!(next.files.iter().all(|f| f.sequence_number == 1));

        let summary = &next.current_snapshot().unwrap().summary;
        assert_eq!(summary.added_data_files, 1);
        assert_eq!(summary.added_records, 3);
        assert_eq!(summary.added_equality_deletes, 1);

        let second = next.apply(&TableDelta::new(vec![file("db/t/data/c.parquet", FileContent::Data, 1)]), 43);
        assert_eq!(second.last_sequence_number, 2);
        assert_eq!(second.current_snapshot().unwrap().parent_snapshot_id, Some(42));
        assert_eq!(second.data_files().count(), 2);
    }

    #[test]
    fn test_delete_scope_is_partition_and_older_sequence() {
        let data = |seq, part: &str| DataFile {
            path: "d".into(),
            content: FileContent::Data,
            partition: serde_json::from_str(&format!(r#"[["part", {{"utf8": "{part}"}}]]"#)).unwrap(),
            record_count: 1,
            size_bytes: 1,
            sequence_number: seq,
        };
        let mut delete = data(2, "aaa");
        delete.content = FileContent::EqualityDeletes;

        assert!(delete.deletes_from(&data(1, "aaa")));
        assert!(!delete.deletes_from(&data(2, "aaa")));
        assert!(!delete.deletes_from(&data(1, "bbb")));
    }
}
