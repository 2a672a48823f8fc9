//! Where committed keys live.
//!
//! An upsert must retract the committed row of every key it re-inserts, and
//! that row may sit in any partition. [`KeyIndex`] answers the lookup from
//! memory. It is loaded once and then advanced with the sink's own commits,
//! or by reading only the files other writers committed since, so a sync
//! never reads partitions its window does not touch.

use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;

use crate::catalog::{Catalog, TableHandle};
use crate::changelog::PartitionWrites;
use crate::error::ScanError;
use crate::partition::PartitionKey;
use crate::scan::TableScan;
use crate::schema::TableSchema;
use crate::value::PrimaryKey;
use crate::writer::FileContent;

/// Partitions holding a live row, per primary key, as of one sequence number.
#[derive(Debug, Default)]
pub struct KeyIndex {
    keys: HashMap<PrimaryKey, IndexSet<PartitionKey>>,
    sequence_number: u64,
}

impl KeyIndex {
    /// Build the index of a table version.
    pub async fn load<C: Catalog + ?Sized>(
        catalog: &C,
        handle: &TableHandle,
    ) -> Result<Self, ScanError> {
        let mut index = Self::default();
        index.catch_up(catalog, handle).await?;
        Ok(index)
    }

    /// Last commit reflected in the index.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Number of keys with a live row.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn partitions_of(&self, key: &PrimaryKey) -> impl Iterator<Item = &PartitionKey> {
        self.keys.get(key).into_iter().flatten()
    }

    /// Read the files `handle` committed after the indexed sequence number.
    ///
    /// Returns the number of files read.
    pub async fn catch_up<C: Catalog + ?Sized>(
        &mut self,
        catalog: &C,
        handle: &TableHandle,
    ) -> Result<usize, ScanError> {
        let target = handle.metadata().last_sequence_number;
        if target <= self.sequence_number {
            return Ok(0);
        }

        let files = TableScan::new(catalog, handle)
            .keys_since(self.sequence_number)
            .await?;
        let read = files.len();
        for (file, keys) in files {
            match file.content {
                FileContent::EqualityDeletes => self.remove(&file.partition, keys),
                FileContent::Data => self.insert(&file.partition, keys),
            }
        }
        self.sequence_number = target;
        Ok(read)
    }

    /// Apply a commit this writer made with `sequence_number` from memory.
    ///
    /// Returns false, leaving the index untouched, when other commits landed
    /// in between; the next [`KeyIndex::catch_up`] then reads them all.
    pub fn record_commit(
        &mut self,
        sequence_number: u64,
        partitions: &IndexMap<PartitionKey, PartitionWrites>,
        schema: &TableSchema,
    ) -> bool {
        if sequence_number != self.sequence_number + 1 {
            return false;
        }
        for (partition, writes) in partitions {
            self.remove(partition, writes.deletes.iter().cloned().map(PrimaryKey::new));
        }
        for (partition, writes) in partitions {
            self.insert(partition, writes.inserts.iter().map(|row| schema.key_of(row)));
        }
        self.sequence_number = sequence_number;
        true
    }

    fn insert(&mut self, partition: &PartitionKey, keys: impl IntoIterator<Item = PrimaryKey>) {
        for key in keys {
            self.keys.entry(key).or_default().insert(partition.clone());
        }
    }

    fn remove(&mut self, partition: &PartitionKey, keys: impl IntoIterator<Item = PrimaryKey>) {
        for key in keys {
            if let Some(partitions) = self.keys.get_mut(&key) {
                partitions.shift_remove(partition);
                if partitions.is_empty() {
                    self.keys.remove(&key);
                }
            }
        }
    }
}
