//! Configuration for the floe sink and CLI.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;

pub use floe_core::config::{MetricsConfig, ParquetCompression};

use crate::catalog::TableIdentifier;
use crate::commit::CommitPolicy;
use crate::error::ConfigError;
use crate::partition::PartitionSpec;
use crate::schema::TableSchema;
use crate::writer::{DEFAULT_BATCH_SIZE, WriterOptions};
use floe_core::error::{EmptyTableIdentSnafu, EmptyWarehouseSnafu, InvalidOptionSnafu};

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub catalog: CatalogConfig,
    pub table: TableConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where table metadata and data files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    /// Warehouse root: a local path, `file://`, `memory://`, `s3://` or `gs://` URL.
    pub warehouse: String,
    /// Options passed to the object store builder.
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// The table the sink writes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub namespace: String,
    pub name: String,
    /// Expected schema. Required for `create`; checked against the table otherwise.
    #[serde(default)]
    pub schema: Option<TableSchema>,
    /// Identity partition columns.
    #[serde(default)]
    pub partition_by: Vec<String>,
}

impl TableConfig {
    pub fn identifier(&self) -> TableIdentifier {
        TableIdentifier::new(&self.namespace, &self.name)
    }

    pub fn partition_spec(&self) -> PartitionSpec {
        PartitionSpec::new(self.partition_by.clone())
    }
}

/// How inserts for keys that may already be committed are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertMode {
    /// Look up the committed table and retract an existing row with the same key.
    #[default]
    Upsert,
    /// Trust the stream: an insert never retracts a committed row.
    Append,
}

/// Sink behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    #[serde(default)]
    pub insert_mode: InsertMode,
    #[serde(default)]
    pub compression: ParquetCompression,
    /// Rows per Arrow record batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Put a failed sync's window back into the buffer instead of losing it.
    #[serde(default = "default_true")]
    pub retain_window_on_failure: bool,
    #[serde(default)]
    pub commit: CommitPolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            insert_mode: InsertMode::default(),
            compression: ParquetCompression::default(),
            batch_size: default_batch_size(),
            retain_window_on_failure: true,
            commit: CommitPolicy::default(),
        }
    }
}

impl SinkConfig {
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            compression: self.compression,
            batch_size: self.batch_size,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.batch_size > 0,
            InvalidOptionSnafu {
                option: "sink.batch_size",
                message: "must be greater than zero",
            }
        );
        ensure!(
            self.commit.retry_backoff_ms > 0 || self.commit.max_retries == 0,
            InvalidOptionSnafu {
                option: "sink.commit.retry_backoff_ms",
                message: "must be greater than zero when retries are enabled",
            }
        );
        Ok(())
    }
}

impl Config {
    /// Load and validate a YAML config file, interpolating `${VAR}` references.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = floe_core::config::load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = floe_core::config::parse_yaml(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.catalog.warehouse.trim().is_empty(), EmptyWarehouseSnafu);
        ensure!(
            !self.table.namespace.is_empty() && !self.table.name.is_empty(),
            EmptyTableIdentSnafu
        );
        self.sink.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, DataType};

    const FULL: &str = r#"
catalog:
  warehouse: memory://
table:
  namespace: demo_db
  name: demo_table
  schema:
    columns:
      - { name: id, type: int32 }
      - { name: name, type: utf8 }
      - { name: part, type: utf8 }
    primary_key: [id]
  partition_by: [part]
sink:
  insert_mode: append
  compression: zstd
  batch_size: 100
  retain_window_on_failure: false
  commit:
    max_retries: 3
metrics:
  address: 127.0.0.1:9100
"#;

    #[test]
    fn test_full_config() {
        let config = Config::from_yaml(FULL).unwrap();
        assert_eq!(config.table.identifier().to_string(), "demo_db.demo_table");
        assert_eq!(config.table.partition_spec().columns(), ["part".to_string()]);

        let schema = config.table.schema.unwrap();
        assert_eq!(schema.columns()[2], Column::new("part", DataType::Utf8));
        assert_eq!(schema.primary_key(), ["id".to_string()]);

        assert_eq!(config.sink.insert_mode, InsertMode::Append);
        assert_eq!(config.sink.writer_options().compression, ParquetCompression::Zstd);
        assert_eq!(config.sink.writer_options().batch_size, 100);
        assert!(!config.sink.retain_window_on_failure);
        assert_eq!(config.sink.commit.max_retries, 3);
        assert_eq!(config.sink.commit.retry_backoff_ms, 100);
        assert_eq!(config.metrics.address, "127.0.0.1:9100");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml(
            "catalog: { warehouse: /tmp/wh }\ntable: { namespace: db, name: t }\n",
        )
        .unwrap();
        assert!(config.table.schema.is_none());
        assert!(config.table.partition_spec().is_unpartitioned());
        assert_eq!(config.sink, SinkConfig::default());
        assert_eq!(config.sink.insert_mode, InsertMode::Upsert);
        assert!(config.sink.retain_window_on_failure);
    }

    #[test]
    fn test_validation_errors() {
        let err = Config::from_yaml("catalog: { warehouse: '' }\ntable: { namespace: db, name: t }\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyWarehouse));

        let err = Config::from_yaml("catalog: { warehouse: /w }\ntable: { namespace: db, name: '' }\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTableIdent));

        let err = Config::from_yaml(
            "catalog: { warehouse: /w }\ntable: { namespace: db, name: t }\nsink: { batch_size: 0 }\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { .. }));
    }

    #[test]
    fn test_invalid_schema_is_a_parse_error() {
        let yaml = "catalog: { warehouse: /w }\ntable:\n  namespace: db\n  name: t\n  schema:\n    columns: [{ name: id, type: int32 }]\n    primary_key: [nope]\n";
        assert!(matches!(
            Config::from_yaml(yaml).unwrap_err(),
            ConfigError::YamlParse { .. }
        ));
    }
}
