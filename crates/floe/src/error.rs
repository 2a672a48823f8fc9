//! Error types for the floe upsert sink.

use snafu::prelude::*;

use crate::schema::DataType;

pub use floe_core::error::{ConfigError, MetricsError, StorageError};

/// Malformed input rows, reported synchronously from `write()`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RowError {
    #[snafu(display("Row has {actual} values but the table has {expected} columns"))]
    Arity { expected: usize, actual: usize },

    #[snafu(display("Column '{column}' expects {expected} but got {actual}"))]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: String,
    },

    #[snafu(display("Primary key column '{column}' cannot be null"))]
    NullKey { column: String },

    /// A JSON value could not be converted to the column type.
    #[snafu(display("Cannot convert JSON value for column '{column}': {message}"))]
    JsonValue { column: String, message: String },
}

/// Invalid table schema or partition spec definitions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    #[snafu(display("Table schema must have at least one column"))]
    NoColumns,

    #[snafu(display("Duplicate column name '{name}'"))]
    DuplicateColumn { name: String },

    #[snafu(display("Table schema must declare a primary key"))]
    EmptyPrimaryKey,

    #[snafu(display("Primary key column '{name}' is not in the schema"))]
    UnknownKeyColumn { name: String },

    #[snafu(display("Partition column '{name}' is not in the schema"))]
    UnknownPartitionColumn { name: String },

    #[snafu(display("Duplicate partition column '{name}'"))]
    DuplicatePartitionColumn { name: String },
}

/// Errors raised while producing Parquet files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WriterError {
    #[snafu(display("Failed to create Parquet writer: {source}"))]
    WriterCreate {
        source: deltalake::parquet::errors::ParquetError,
    },

    #[snafu(display("Failed to write Parquet data: {source}"))]
    ParquetWrite {
        source: deltalake::parquet::errors::ParquetError,
    },

    #[snafu(display("Failed to build record batch: {source}"))]
    RecordBatch {
        source: deltalake::arrow::error::ArrowError,
    },

    #[snafu(display("Buffer still in use"))]
    BufferInUse,

    #[snafu(display("Buffer lock poisoned"))]
    BufferLock,

    #[snafu(display("Failed to upload {path}: {source}"))]
    Upload { path: String, source: StorageError },
}

/// Errors from the table catalog.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    #[snafu(display("Table {table} does not exist"))]
    TableNotFound { table: String },

    #[snafu(display("Table {table} already exists"))]
    TableAlreadyExists { table: String },

    /// Another writer committed the version this commit was based on.
    #[snafu(display("Commit conflict on {table}: version {version} already exists"))]
    Conflict { table: String, version: u64 },

    #[snafu(display("Storage error in catalog: {source}"))]
    CatalogStorage { source: StorageError },

    #[snafu(display("Failed to encode table metadata: {source}"))]
    MetadataEncode { source: serde_json::Error },

    #[snafu(display("Failed to decode table metadata {path}: {source}"))]
    MetadataDecode {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Invalid table definition: {source}"))]
    InvalidTable { source: SchemaError },
}

impl CatalogError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CatalogError::Conflict { .. })
    }
}

/// Errors raised while reading table files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ScanError {
    #[snafu(display("Failed to read {path}: {source}"))]
    ReadFile { path: String, source: StorageError },

    #[snafu(display("Failed to decode Parquet file {path}: {source}"))]
    ParquetRead {
        path: String,
        source: deltalake::parquet::errors::ParquetError,
    },

    #[snafu(display("Failed to read record batch from {path}: {source}"))]
    BatchRead {
        path: String,
        source: deltalake::arrow::error::ArrowError,
    },

    #[snafu(display("Column '{column}' in {path} does not match the table schema"))]
    ColumnMismatch { path: String, column: String },
}

/// Top-level sink errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    #[snafu(display("Invalid row: {source}"))]
    InvalidRow { source: RowError },

    #[snafu(display("Sink is closed"))]
    Closed,

    #[snafu(display("Failed to write files: {source}"))]
    Write { source: WriterError },

    /// The table advanced concurrently; the caller decides whether to retry.
    #[snafu(display("Commit conflict on {table} at version {version}"))]
    CommitConflict { table: String, version: u64 },

    #[snafu(display("Catalog error: {source}"))]
    Catalog { source: CatalogError },

    #[snafu(display("Failed to read committed table state: {source}"))]
    Scan { source: ScanError },

    #[snafu(display("Table {table} schema does not match the configured schema"))]
    SchemaMismatch { table: String },
}

impl SinkError {
    /// Whether the failed operation can be attempted again on this sink.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::CommitConflict { .. })
    }
}

impl From<CatalogError> for SinkError {
    fn from(source: CatalogError) -> Self {
        match source {
            CatalogError::Conflict { table, version } => SinkError::CommitConflict { table, version },
            source => SinkError::Catalog { source },
        }
    }
}

/// Errors surfaced by the `floe` command line tool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("{source}"))]
    Sink { source: SinkError },

    #[snafu(display("Catalog error: {source}"))]
    CatalogCommand { source: CatalogError },

    #[snafu(display("Scan error: {source}"))]
    TableScan { source: ScanError },

    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    #[snafu(display("Table schema is required to create a table"))]
    MissingSchema,

    #[snafu(display("Invalid table definition: {source}"))]
    TableDefinition { source: SchemaError },

    #[snafu(display("Failed to read input {}: {source}", path.display()))]
    ReadInput {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Line {line}: invalid change record: {source}"))]
    ParseRecord {
        line: usize,
        source: serde_json::Error,
    },

    #[snafu(display("Line {line}: {source}"))]
    RecordRow { line: usize, source: RowError },

    #[snafu(display("Failed to encode output row: {source}"))]
    EncodeRow { source: serde_json::Error },

    #[snafu(display("Failed to write output: {source}"))]
    WriteOutput { source: std::io::Error },
}

impl From<ConfigError> for CliError {
    fn from(source: ConfigError) -> Self {
        CliError::Config { source }
    }
}

impl From<SinkError> for CliError {
    fn from(source: SinkError) -> Self {
        CliError::Sink { source }
    }
}

impl From<CatalogError> for CliError {
    fn from(source: CatalogError) -> Self {
        CliError::CatalogCommand { source }
    }
}
