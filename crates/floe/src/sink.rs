//! The upsert sink: buffers change operations and commits their net effect.
//!
//! A sink is driven by a single owner that calls [`UpsertSink::write`] and
//! [`UpsertSink::sync`] in sequence and finally [`UpsertSink::close`]:
//!
//! ```text
//! write(ops) ──► ChangeBuffer.absorb            (memory only)
//! sync()     ──► drain ─► PartitionFileSet ─► finalize ─► CommitCoordinator
//! close()    ──► discard uncommitted files, reject further calls
//! ```
//!
//! In upsert mode, inserts that do not retract anything are looked up in a
//! [`KeyIndex`] of committed keys. A committed row with the same key gets an
//! equality delete in its own partition. Those deletes depend on the base
//! snapshot, so a conflicting commit is retried only after deriving them
//! again from the reloaded table.
//!
//! The drained window is kept as a shadow copy until its commit succeeds.
//! Files of a sync that failed or was cancelled stay recorded until the next
//! `sync()` or `close()` settles them: if the table turns out to contain them
//! the commit landed, otherwise they are deleted and the shadow window is put
//! back into the buffer.

use indexmap::IndexMap;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use floe_core::emit;

use crate::catalog::{Catalog, TableDelta, TableHandle, TableIdentifier};
use crate::changelog::{ChangeBuffer, DrainedWindow, Operation, PartitionWrites};
use crate::commit::CommitCoordinator;
use crate::config::{InsertMode, SinkConfig};
use crate::error::{
    CatalogError, ClosedSnafu, InvalidRowSnafu, ScanSnafu, SchemaMismatchSnafu, SinkError,
    WriteSnafu,
};
use crate::metrics::events::{
    FilesWritten, OperationsAbsorbed, PendingKeys, RowsWritten, SyncCompleted, SyncOutcome,
};
use crate::index::KeyIndex;
use crate::partition::{BoundPartitionSpec, PartitionKey};
use crate::schema::TableSchema;
use crate::value::{PrimaryKey, Row};
use crate::writer::{FileContent, PartitionFile, PartitionFileSet};

/// What a successful non-empty `sync()` committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    /// Table version created by the commit.
    pub version: u64,
    pub data_files: usize,
    pub delete_files: usize,
    pub rows_inserted: u64,
    pub rows_deleted: u64,
    pub duration: Duration,
}

impl SyncSummary {
    fn from_files(version: u64, files: &[PartitionFile], duration: Duration) -> Self {
        let mut summary = Self {
            version,
            data_files: 0,
            delete_files: 0,
            rows_inserted: 0,
            rows_deleted: 0,
            duration,
        };
        for file in files {
            match file.content {
                FileContent::Data => {
                    summary.data_files += 1;
                    summary.rows_inserted += file.record_count;
                }
                FileContent::EqualityDeletes => {
                    summary.delete_files += 1;
                    summary.rows_deleted += file.record_count;
                }
            }
        }
        summary
    }
}

/// How an unfinished sync was resolved.
enum Settled {
    Nothing,
    /// The table already contains the files.
    Committed,
    Discarded,
}

/// Streaming upsert sink for one table.
pub struct UpsertSink<C: Catalog + ?Sized> {
    catalog: Arc<C>,
    table: TableHandle,
    label: String,
    schema: Arc<TableSchema>,
    spec: BoundPartitionSpec,
    config: SinkConfig,
    coordinator: CommitCoordinator,
    buffer: ChangeBuffer,
    /// Committed key locations; upsert mode only.
    index: Option<KeyIndex>,
    /// Files of a sync that has not been settled.
    in_flight: Option<PartitionFileSet>,
    /// The window being committed.
    shadow: Option<DrainedWindow>,
    closed: bool,
}

impl<C: Catalog + ?Sized> UpsertSink<C> {
    /// Open a sink on an existing table.
    ///
    /// When `expected_schema` is given it must equal the table's schema.
    pub async fn new(
        catalog: Arc<C>,
        identifier: &TableIdentifier,
        config: SinkConfig,
        expected_schema: Option<&TableSchema>,
    ) -> Result<Self, SinkError> {
        let table = catalog.load_table(identifier).await?;
        let label = identifier.to_string();

        if let Some(expected) = expected_schema {
            ensure!(
                expected == table.schema(),
                SchemaMismatchSnafu { table: &label }
            );
        }

        let spec = table
            .metadata()
            .partition_spec
            .bind(table.schema())
            .map_err(|source| SinkError::Catalog {
                source: CatalogError::InvalidTable { source },
            })?;
        let schema = Arc::new(table.schema().clone());
        let coordinator = CommitCoordinator::new(config.commit, &label);
        let index = match config.insert_mode {
            InsertMode::Upsert => Some(
                KeyIndex::load(&*catalog, &table)
                    .await
                    .context(ScanSnafu)?,
            ),
            InsertMode::Append => None,
        };

        info!(
            target = %label,
            version = table.version(),
            insert_mode = ?config.insert_mode,
            indexed_keys = index.as_ref().map_or(0, KeyIndex::len),
            "Opened upsert sink"
        );

        Ok(Self {
            catalog,
            table,
            label,
            buffer: ChangeBuffer::new(schema.clone()),
            schema,
            spec,
            config,
            coordinator,
            index,
            in_flight: None,
            shadow: None,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Version of the table this sink last observed.
    pub fn snapshot_version(&self) -> u64 {
        self.table.version()
    }

    pub fn table(&self) -> &TableHandle {
        &self.table
    }

    /// Keys with a pending effect in the current window.
    pub fn pending_keys(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer operations for the current window.
    ///
    /// Never touches storage. A malformed row rejects the whole call and
    /// leaves the buffer unchanged.
    pub fn write(&mut self, ops: Vec<Operation>) -> Result<usize, SinkError> {
        ensure!(!self.closed, ClosedSnafu);
        let count = self.buffer.absorb(ops).context(InvalidRowSnafu)?;

        emit!(OperationsAbsorbed {
            table: self.label.clone(),
            count: count as u64,
        });
        emit!(PendingKeys {
            table: self.label.clone(),
            count: self.buffer.len(),
        });
        Ok(count)
    }

    /// Commit the current window's net effect.
    ///
    /// Returns `None` without writing anything when the window is empty. On
    /// failure the table is unchanged; with `retain_window_on_failure` the
    /// window is put back into the buffer so a later `sync()` retries it.
    pub async fn sync(&mut self) -> Result<Option<SyncSummary>, SinkError> {
        ensure!(!self.closed, ClosedSnafu);
        let start = Instant::now();

        self.settle().await?;
        if self.buffer.is_empty() {
            self.emit_sync(SyncOutcome::Empty, start);
            return Ok(None);
        }

        self.shadow = Some(self.buffer.drain());
        match self.commit_window(start).await {
            Ok(summary) => {
                self.emit_sync(SyncOutcome::Committed, start);
                Ok(summary)
            }
            Err(e) => {
                warn!(target = %self.label, error = %e, "Sync failed");
                match self.settle().await {
                    Ok(Settled::Committed) => {
                        warn!(target = %self.label, "Commit landed despite the reported error")
                    }
                    Ok(_) => {}
                    Err(settle_error) => warn!(
                        target = %self.label,
                        error = %settle_error,
                        "Could not settle failed sync, retrying on next sync"
                    ),
                }
                self.emit_sync(SyncOutcome::Failed, start);
                Err(e)
            }
        }
    }

    async fn commit_window(&mut self, start: Instant) -> Result<Option<SyncSummary>, SinkError> {
        let Some(window) = self.shadow.as_ref() else {
            return Ok(None);
        };
        let writes = window.partitioned(&self.spec);
        let replacing: Vec<PrimaryKey> = if self.index.is_some() {
            window
                .unretracted_inserts()
                .map(|(key, _)| key.clone())
                .collect()
        } else {
            Vec::new()
        };

        let (committed, partitions, finished) = if replacing.is_empty() {
            // Nothing here depends on the base snapshot, so the files can be
            // re-committed as they are.
            let finished = self.write_files(&writes).await?;
            let committed = self
                .coordinator
                .commit(&*self.catalog, &self.table, finished.clone())
                .await?;
            (committed, writes, finished)
        } else {
            let (committed, partitions, finished) = self.commit_upsert(&writes, &replacing).await?;
            (Some(committed), partitions, finished)
        };
        let Some(committed) = committed else {
            self.in_flight = None;
            self.shadow = None;
            return Ok(None);
        };

        let summary = SyncSummary::from_files(committed.version(), &finished, start.elapsed());
        if let Some(index) = self.index.as_mut() {
            let sequence_number = committed.metadata().last_sequence_number;
            if !index.record_commit(sequence_number, &partitions, &self.schema) {
                debug!(target = %self.label, sequence_number, "Key index behind the table, catching up on next lookup");
            }
        }
        self.table = committed;
        if let Some(mut files) = self.in_flight.take() {
            files.release();
        }
        self.shadow = None;

        info!(
            target = %self.label,
            version = summary.version,
            data_files = summary.data_files,
            delete_files = summary.delete_files,
            rows_inserted = summary.rows_inserted,
            rows_deleted = summary.rows_deleted,
            duration_ms = summary.duration.as_millis(),
            "Sync committed"
        );
        self.emit_written(&summary);
        Ok(Some(summary))
    }

    /// Commit a window whose inserts may replace committed rows.
    ///
    /// After a conflict the uploaded files are removed, the table reloaded,
    /// and the upsert deletes derived again before the next attempt.
    async fn commit_upsert(
        &mut self,
        writes: &IndexMap<PartitionKey, PartitionWrites>,
        replacing: &[PrimaryKey],
    ) -> Result<
        (
            TableHandle,
            IndexMap<PartitionKey, PartitionWrites>,
            Vec<PartitionFile>,
        ),
        SinkError,
    > {
        let mut attempt = 0;
        loop {
            let mut partitions = writes.clone();
            for (partition, key) in self.find_replaced(replacing).await? {
                partitions.entry(partition).or_default().deletes.push(key);
            }
            let finished = self.write_files(&partitions).await?;

            let delta = TableDelta::new(finished.clone());
            let err = match self
                .coordinator
                .try_commit(&*self.catalog, &self.table, delta)
                .await
            {
                Ok(committed) => return Ok((committed, partitions, finished)),
                Err(e) if e.is_conflict() => e,
                Err(e) => return Err(e.into()),
            };
            let Some(delay) = self.coordinator.retry_delay(attempt) else {
                return Err(err.into());
            };
            attempt += 1;

            if let Some(files) = self.in_flight.as_mut() {
                files.discard().await;
                if !files.uploaded_paths().is_empty() {
                    return Err(err.into());
                }
            }
            self.in_flight = None;
            tokio::time::sleep(delay).await;
            self.table = self.catalog.load_table(self.table.identifier()).await?;
            info!(
                target = %self.label,
                version = self.table.version(),
                attempt,
                "Reloaded table, re-deriving upsert deletes"
            );
        }
    }

    /// Write and upload the files of one attempt, tracked as in flight.
    async fn write_files(
        &mut self,
        partitions: &IndexMap<PartitionKey, PartitionWrites>,
    ) -> Result<Vec<PartitionFile>, SinkError> {
        let files = self.in_flight.insert(PartitionFileSet::new(
            self.catalog.file_io(),
            self.table.location(),
            self.schema.clone(),
            self.config.writer_options(),
        ));
        for (partition, writes) in partitions {
            for row in &writes.inserts {
                files.write_insert(partition, row.clone()).context(WriteSnafu)?;
            }
            for key in &writes.deletes {
                files.write_delete(partition, key.clone()).context(WriteSnafu)?;
            }
        }
        files.finalize().await.context(WriteSnafu)
    }

    /// Find committed rows that window inserts replace without retracting.
    ///
    /// Returns `(partition, key)` pairs for the equality deletes to add. Only
    /// files committed since the index last advanced are read.
    async fn find_replaced(
        &mut self,
        keys: &[PrimaryKey],
    ) -> Result<Vec<(PartitionKey, Row)>, SinkError> {
        let Some(index) = self.index.as_mut() else {
            return Ok(Vec::new());
        };
        let read = index
            .catch_up(&*self.catalog, &self.table)
            .await
            .context(ScanSnafu)?;

        let index: &KeyIndex = index;
        let deletes: Vec<(PartitionKey, Row)> = keys
            .iter()
            .flat_map(|key| {
                index
                    .partitions_of(key)
                    .map(move |partition| (partition.clone(), key.clone().into_row()))
            })
            .collect();
        debug!(
            target = %self.label,
            looked_up = keys.len(),
            found = deletes.len(),
            files_read = read,
            "Looked up committed keys"
        );
        Ok(deletes)
    }

    /// Resolve the files and window of a sync that did not complete.
    async fn settle(&mut self) -> Result<Settled, SinkError> {
        let uploaded = self
            .in_flight
            .as_ref()
            .is_some_and(|files| !files.uploaded_paths().is_empty());
        if !uploaded {
            self.in_flight = None;
            return Ok(match self.shadow.take() {
                Some(window) => {
                    self.restore_window(window);
                    Settled::Discarded
                }
                None => Settled::Nothing,
            });
        }

        let latest = self.catalog.load_table(self.table.identifier()).await?;
        let Some(files) = self.in_flight.as_mut() else {
            return Ok(Settled::Nothing);
        };

        let landed = files
            .uploaded_paths()
            .iter()
            .any(|path| latest.metadata().contains_file(path));
        let settled = if landed {
            files.release();
            self.in_flight = None;
            self.shadow = None;
            info!(target = %self.label, version = latest.version(), "Unfinished sync was committed");
            Settled::Committed
        } else {
            let removed = files.discard().await;
            warn!(target = %self.label, removed, "Discarded uncommitted files");
            if files.uploaded_paths().is_empty() {
                self.in_flight = None;
            }
            if let Some(window) = self.shadow.take() {
                self.restore_window(window);
            }
            Settled::Discarded
        };

        if latest.version() != self.table.version() {
            debug!(
                target = %self.label,
                from = self.table.version(),
                to = latest.version(),
                "Refreshed table"
            );
        }
        self.table = latest;
        Ok(settled)
    }

    fn restore_window(&mut self, window: DrainedWindow) {
        if self.config.retain_window_on_failure {
            debug!(target = %self.label, keys = window.len(), "Restored window");
            self.buffer.restore(window);
        } else {
            warn!(target = %self.label, keys = window.len(), "Dropped window of failed sync");
        }
    }

    /// Discard pending work and close the sink. Idempotent.
    ///
    /// Uploaded files that the table does not reference are deleted; nothing
    /// is committed.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.settle().await {
            warn!(target = %self.label, error = %e, "Could not verify uncommitted files on close");
        }
        let dropped = self.buffer.drain().len();
        self.in_flight = None;
        self.shadow = None;

        emit!(PendingKeys {
            table: self.label.clone(),
            count: 0,
        });
        info!(target = %self.label, dropped_keys = dropped, "Closed upsert sink");
    }

    fn emit_sync(&self, outcome: SyncOutcome, start: Instant) {
        emit!(SyncCompleted {
            table: self.label.clone(),
            outcome,
            duration: start.elapsed(),
        });
        emit!(PendingKeys {
            table: self.label.clone(),
            count: self.buffer.len(),
        });
    }

    fn emit_written(&self, summary: &SyncSummary) {
        let counts = [
            (FileContent::Data, summary.data_files, summary.rows_inserted),
            (
                FileContent::EqualityDeletes,
                summary.delete_files,
                summary.rows_deleted,
            ),
        ];
        for (content, files, rows) in counts {
            emit!(FilesWritten {
                table: self.label.clone(),
                content: content.as_str(),
                count: files as u64,
            });
            emit!(RowsWritten {
                table: self.label.clone(),
                content: content.as_str(),
                count: rows,
            });
        }
    }
}

impl<C: Catalog + ?Sized> Drop for UpsertSink<C> {
    fn drop(&mut self) {
        let orphaned = self
            .in_flight
            .as_ref()
            .map_or(0, |files| files.uploaded_paths().len());
        if !self.closed && orphaned > 0 {
            warn!(target = %self.label, orphaned, "Sink dropped without close, uncommitted files remain");
        }
    }
}
