//! Committing a window's files to the catalog.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use floe_core::emit;

use crate::catalog::{Catalog, TableDelta, TableHandle};
use crate::error::CatalogError;
use crate::metrics::events::CommitConflict;
use crate::writer::PartitionFile;

const MAX_BACKOFF_MS: u64 = 30_000;

fn default_retry_backoff_ms() -> u64 {
    100
}

/// How version conflicts are handled.
///
/// With `max_retries: 0` a conflict is returned to the caller untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitPolicy {
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay before the first retry; doubles with every attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Turns finalized partition files into one atomic catalog commit.
#[derive(Debug, Clone)]
pub struct CommitCoordinator {
    policy: CommitPolicy,
    table: String,
}

impl CommitCoordinator {
    pub fn new(policy: CommitPolicy, table: impl Into<String>) -> Self {
        Self {
            policy,
            table: table.into(),
        }
    }

    pub fn policy(&self) -> &CommitPolicy {
        &self.policy
    }

    /// Commit `files` on top of `base`.
    ///
    /// Returns `None` without contacting the catalog when there is nothing
    /// to commit. On a conflict the table is reloaded and the same files are
    /// committed against the fresh version, up to `max_retries` times. Only
    /// use this for files that stay correct on any later version; deletes
    /// derived from the base snapshot must be derived again instead.
    pub async fn commit<C: Catalog + ?Sized>(
        &self,
        catalog: &C,
        base: &TableHandle,
        files: Vec<PartitionFile>,
    ) -> Result<Option<TableHandle>, CatalogError> {
        if files.is_empty() {
            return Ok(None);
        }

        let delta = TableDelta::new(files);
        let mut base = base.clone();
        let mut attempt = 0;
        loop {
            match self.try_commit(catalog, &base, delta.clone()).await {
                Err(e) if e.is_conflict() => {
                    let Some(delay) = self.retry_delay(attempt) else {
                        return Err(e);
                    };
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    base = catalog.load_table(base.identifier()).await?;
                    info!(target = %self.table, version = base.version(), "Reloaded table for retry");
                }
                result => return result.map(Some),
            }
        }
    }

    /// One commit attempt. Conflicts are counted and returned as is.
    pub async fn try_commit<C: Catalog + ?Sized>(
        &self,
        catalog: &C,
        base: &TableHandle,
        delta: TableDelta,
    ) -> Result<TableHandle, CatalogError> {
        let result = catalog.commit(base, delta).await;
        if let Err(CatalogError::Conflict { version, .. }) = &result {
            emit!(CommitConflict {
                table: self.table.clone(),
                version: *version,
            });
        }
        result
    }

    /// Delay before retrying after `attempt` failed retries, or `None` once
    /// the policy is exhausted.
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.policy.max_retries {
            warn!(target = %self.table, attempt, "Commit conflict, giving up");
            return None;
        }
        let delay = self.backoff(attempt + 1);
        warn!(
            target = %self.table,
            attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "Commit conflict, retrying against latest version"
        );
        Some(delay)
    }

    /// Exponential backoff with up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .policy
            .retry_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            .min(MAX_BACKOFF_MS);
        let jitter = rand::rng().random_range(0..=exp / 2);
        Duration::from_millis(exp + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FsCatalog, TableIdentifier};
    use crate::partition::{PartitionKey, PartitionSpec};
    use crate::schema::tests::demo_schema;
    use crate::writer::FileContent;
    use floe_core::StorageProvider;
    use std::sync::Arc;

    fn file(path: &str) -> PartitionFile {
        PartitionFile {
            path: path.into(),
            content: FileContent::Data,
            partition: PartitionKey::unpartitioned(),
            record_count: 1,
            size_bytes: 1,
        }
    }

    async fn setup() -> (FsCatalog, TableHandle) {
        let catalog = FsCatalog::new(Arc::new(StorageProvider::in_memory()));
        let handle = catalog
            .create_table(
                &TableIdentifier::new("db", "t"),
                demo_schema(),
                PartitionSpec::unpartitioned(),
            )
            .await
            .unwrap();
        (catalog, handle)
    }

    fn coordinator(max_retries: u32) -> CommitCoordinator {
        CommitCoordinator::new(
            CommitPolicy {
                max_retries,
                retry_backoff_ms: 1,
            },
            "db.t",
        )
    }

    #[test]
    fn test_policy_defaults() {
        let policy: CommitPolicy = serde_yaml::from_str("{}").unwrap();
        assert_eq!(policy, CommitPolicy::default());
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.retry_backoff_ms, 100);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let coordinator = CommitCoordinator::new(CommitPolicy::default(), "t");
        let first = coordinator.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = coordinator.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));
        assert!(coordinator.backoff(40) <= Duration::from_millis(MAX_BACKOFF_MS * 3 / 2));
    }

    #[tokio::test]
    async fn test_empty_commit_is_skipped() {
        let (catalog, base) = setup().await;
        let result = coordinator(0).commit(&catalog, &base, vec![]).await.unwrap();
        assert!(result.is_none());
        assert_eq!(catalog.load_table(base.identifier()).await.unwrap().version(), 1);
    }

    #[tokio::test]
    async fn test_conflict_is_surfaced_by_default() {
        let (catalog, base) = setup().await;
        catalog
            .commit(&base, TableDelta::new(vec![file("other.parquet")]))
            .await
            .unwrap();

        let err = coordinator(0)
            .commit(&catalog, &base, vec![file("mine.parquet")])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let latest = catalog.load_table(base.identifier()).await.unwrap();
        assert!(!latest.metadata().contains_file("mine.parquet"));
    }

    #[tokio::test]
    async fn test_conflict_retries_against_reloaded_table() {
        let (catalog, base) = setup().await;
        catalog
            .commit(&base, TableDelta::new(vec![file("other.parquet")]))
            .await
            .unwrap();

        let committed = coordinator(2)
            .commit(&catalog, &base, vec![file("mine.parquet")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(committed.version(), 3);
        assert!(committed.metadata().contains_file("other.parquet"));
        assert!(committed.metadata().contains_file("mine.parquet"));
    }

    #[test]
    fn test_retry_delay_follows_policy() {
        assert!(coordinator(0).retry_delay(0).is_none());
        let coordinator = coordinator(2);
        assert!(coordinator.retry_delay(0).is_some());
        assert!(coordinator.retry_delay(1).is_some());
        assert!(coordinator.retry_delay(2).is_none());
    }

    #[tokio::test]
    async fn test_try_commit_does_not_retry() {
        let (catalog, base) = setup().await;
        catalog
            .commit(&base, TableDelta::new(vec![file("other.parquet")]))
            .await
            .unwrap();

        let err = coordinator(5)
            .try_commit(&catalog, &base, TableDelta::new(vec![file("mine.parquet")]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(catalog.load_table(base.identifier()).await.unwrap().version(), 2);
    }
}
