//! Internal events emitted by the upsert sink.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use floe_core::metrics::events::InternalEvent;

// ============================================================================
// Buffer events
// ============================================================================

/// Operations accepted by `write()`.
pub struct OperationsAbsorbed {
    pub table: String,
    pub count: u64,
}

impl InternalEvent for OperationsAbsorbed {
    fn emit(self) {
        trace!(table = %self.table, count = self.count, "Operations absorbed");
        counter!("floe_operations_absorbed_total", "table" => self.table).increment(self.count);
    }
}

/// Keys with a pending effect in the current window.
pub struct PendingKeys {
    pub table: String,
    pub count: usize,
}

impl InternalEvent for PendingKeys {
    fn emit(self) {
        gauge!("floe_pending_keys", "table" => self.table).set(self.count as f64);
    }
}

// ============================================================================
// Sync and commit events
// ============================================================================

/// Outcome label of a finished sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Committed,
    Empty,
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Committed => "committed",
            SyncOutcome::Empty => "empty",
            SyncOutcome::Failed => "failed",
        }
    }
}

/// Event emitted when `sync()` returns.
pub struct SyncCompleted {
    pub table: String,
    pub outcome: SyncOutcome,
    pub duration: Duration,
}

impl InternalEvent for SyncCompleted {
    fn emit(self) {
        trace!(
            table = %self.table,
            outcome = self.outcome.as_str(),
            duration_ms = self.duration.as_millis(),
            "Sync completed"
        );
        counter!(
            "floe_sync_completed_total",
            "table" => self.table.clone(),
            "outcome" => self.outcome.as_str()
        )
        .increment(1);
        histogram!("floe_sync_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Files committed by one sync, split by content.
pub struct FilesWritten {
    pub table: String,
    /// `data` or `equality_deletes`.
    pub content: &'static str,
    pub count: u64,
}

impl InternalEvent for FilesWritten {
    fn emit(self) {
        trace!(table = %self.table, content = self.content, count = self.count, "Files written");
        counter!("floe_files_written_total", "table" => self.table, "content" => self.content)
            .increment(self.count);
    }
}

/// Rows committed by one sync, split by content.
pub struct RowsWritten {
    pub table: String,
    pub content: &'static str,
    pub count: u64,
}

impl InternalEvent for RowsWritten {
    fn emit(self) {
        trace!(table = %self.table, content = self.content, count = self.count, "Rows written");
        counter!("floe_rows_written_total", "table" => self.table, "content" => self.content)
            .increment(self.count);
    }
}

/// A commit lost the race against another writer.
pub struct CommitConflict {
    pub table: String,
    pub version: u64,
}

impl InternalEvent for CommitConflict {
    fn emit(self) {
        trace!(table = %self.table, version = self.version, "Commit conflict");
        counter!("floe_commit_conflicts_total", "table" => self.table).increment(1);
    }
}
