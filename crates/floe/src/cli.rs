//! Command line interface for managing and feeding a table.

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::catalog::{Catalog, FsCatalog};
use crate::changelog::{ChangeRecord, Operation};
use crate::config::Config;
use crate::error::{
    CliError, EncodeRowSnafu, MetricsSnafu, MissingSchemaSnafu, ParseRecordSnafu, ReadInputSnafu,
    RecordRowSnafu, StorageSnafu, TableScanSnafu, WriteOutputSnafu,
};
use crate::scan::TableScan;
use crate::sink::UpsertSink;
use crate::value::Value;

#[derive(Parser, Debug)]
#[command(version, about = "Streaming upsert sink for snapshot tables")]
pub struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Serve Prometheus metrics on the configured address
    #[arg(long)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create the configured table
    Create,
    /// Apply a newline-delimited JSON change log to the table
    Apply {
        /// Change log file, one `{"op": ..., "row": [...]}` object per line
        #[arg(short, long)]
        input: PathBuf,
        /// Sync after this many operations; 0 syncs once at the end
        #[arg(long, default_value_t = 0)]
        sync_every: usize,
    },
    /// Print the live rows of the table as JSON arrays
    Scan,
    /// Drop the configured table and all of its files
    Drop,
}

/// Run a parsed command line.
pub async fn run(args: CliArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config)?;
    if args.metrics {
        floe_core::init_metrics(&config.metrics.address)
            .await
            .context(MetricsSnafu)?;
    }
    let mut stdout = std::io::stdout().lock();
    execute(&config, &args.command, &mut stdout).await
}

/// Execute one command against the configured table.
pub async fn execute(
    config: &Config,
    command: &Command,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let catalog = Arc::new(
        FsCatalog::from_url(
            &config.catalog.warehouse,
            config.catalog.storage_options.clone(),
        )
        .await
        .context(StorageSnafu)?,
    );
    let identifier = config.table.identifier();

    match command {
        Command::Create => {
            let schema = config.table.schema.clone().context(MissingSchemaSnafu)?;
            let handle = catalog
                .create_table(&identifier, schema, config.table.partition_spec())
                .await?;
            info!(target = %identifier, location = handle.location(), "Table created");
        }
        Command::Apply { input, sync_every } => {
            apply(catalog, config, input, *sync_every).await?;
        }
        Command::Scan => {
            let handle = catalog.load_table(&identifier).await?;
            let rows = TableScan::new(catalog.as_ref(), &handle)
                .rows()
                .await
                .context(TableScanSnafu)?;
            for row in &rows {
                let json = serde_json::Value::Array(row.iter().map(Value::to_json).collect());
                serde_json::to_writer(&mut *out, &json).context(EncodeRowSnafu)?;
                writeln!(out).context(WriteOutputSnafu)?;
            }
            info!(target = %identifier, version = handle.version(), rows = rows.len(), "Scanned table");
        }
        Command::Drop => {
            catalog.drop_table(&identifier).await?;
            info!(target = %identifier, "Table dropped");
        }
    }
    Ok(())
}

async fn apply(
    catalog: Arc<FsCatalog>,
    config: &Config,
    input: &Path,
    sync_every: usize,
) -> Result<(), CliError> {
    let file = std::fs::File::open(input).context(ReadInputSnafu { path: input })?;
    let mut sink = UpsertSink::new(
        catalog,
        &config.table.identifier(),
        config.sink.clone(),
        config.table.schema.as_ref(),
    )
    .await?;

    let result = feed(&mut sink, BufReader::new(file), input, sync_every).await;
    sink.close().await;
    let (operations, commits) = result?;

    info!(
        target = %config.table.identifier(),
        operations,
        commits,
        version = sink.snapshot_version(),
        "Applied change log"
    );
    Ok(())
}

/// Stream change records into the sink. Returns operations and commits made.
async fn feed(
    sink: &mut UpsertSink<FsCatalog>,
    reader: impl BufRead,
    input: &Path,
    sync_every: usize,
) -> Result<(usize, usize), CliError> {
    let schema = sink.table().schema().clone();
    let mut batch: Vec<Operation> = Vec::new();
    let mut operations = 0;
    let mut commits = 0;

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.context(ReadInputSnafu { path: input })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ChangeRecord =
            serde_json::from_str(&line).context(ParseRecordSnafu { line: line_no })?;
        let op = record
            .into_operation(&schema)
            .context(RecordRowSnafu { line: line_no })?;
        batch.push(op);
        operations += 1;

        if sync_every > 0 && operations % sync_every == 0 {
            sink.write(std::mem::take(&mut batch))?;
            commits += usize::from(sink.sync().await?.is_some());
        }
    }

    sink.write(batch)?;
    commits += usize::from(sink.sync().await?.is_some());
    Ok((operations, commits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(warehouse: &Path) -> Config {
        Config::from_yaml(&format!(
            r#"
catalog:
  warehouse: {}
table:
  namespace: demo_db
  name: demo_table
  schema:
    columns:
      - {{ name: id, type: int32 }}
      - {{ name: name, type: utf8 }}
      - {{ name: part, type: utf8 }}
    primary_key: [id]
  partition_by: [part]
"#,
            warehouse.display()
        ))
        .unwrap()
    }

    fn write_input(dir: &TempDir, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    async fn scan(config: &Config) -> Vec<String> {
        let mut out = Vec::new();
        execute(config, &Command::Scan, &mut out).await.unwrap();
        let mut lines: Vec<String> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        lines.sort();
        lines
    }

    #[test]
    fn test_parse_args() {
        let args = CliArgs::try_parse_from([
            "floe", "-c", "floe.yaml", "apply", "--input", "in.ndjson", "--sync-every", "10",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("floe.yaml"));
        assert!(!args.metrics);
        assert_eq!(
            args.command,
            Command::Apply {
                input: "in.ndjson".into(),
                sync_every: 10
            }
        );
    }

    #[tokio::test]
    async fn test_create_apply_scan_drop() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir.path().join("warehouse"));
        let mut out = Vec::new();
        execute(&config, &Command::Create, &mut out).await.unwrap();

        let first = write_input(
            &dir,
            "first.ndjson",
            &[
                r#"{"op": "insert", "row": [1, "Alice", "aaa"]}"#,
                r#"{"op": "insert", "row": [2, "Bob", "bbb"]}"#,
                "",
            ],
        );
        let apply = Command::Apply {
            input: first,
            sync_every: 0,
        };
        execute(&config, &apply, &mut out).await.unwrap();
        assert_eq!(
            scan(&config).await,
            vec![r#"[1,"Alice","aaa"]"#, r#"[2,"Bob","bbb"]"#]
        );

        let second = write_input(
            &dir,
            "second.ndjson",
            &[
                r#"{"op": "update_delete", "row": [1, "Alice", "aaa"]}"#,
                r#"{"op": "update_insert", "row": [1, "Clare", "ccc"]}"#,
                r#"{"op": "delete", "row": [2, "Bob", "bbb"]}"#,
            ],
        );
        let apply = Command::Apply {
            input: second,
            sync_every: 1,
        };
        execute(&config, &apply, &mut out).await.unwrap();
        assert_eq!(scan(&config).await, vec![r#"[1,"Clare","ccc"]"#]);

        execute(&config, &Command::Drop, &mut out).await.unwrap();
        assert!(matches!(
            execute(&config, &Command::Scan, &mut out).await,
            Err(CliError::CatalogCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_reports_bad_line() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir.path().join("warehouse"));
        let mut out = Vec::new();
        execute(&config, &Command::Create, &mut out).await.unwrap();

        let input = write_input(
            &dir,
            "bad.ndjson",
            &[
                r#"{"op": "insert", "row": [1, "Alice", "aaa"]}"#,
                r#"{"op": "insert", "row": [null, "Bob", "bbb"]}"#,
            ],
        );
        let err = execute(
            &config,
            &Command::Apply {
                input,
                sync_every: 0,
            },
            &mut out,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CliError::RecordRow { line: 2, .. }));
        assert!(scan(&config).await.is_empty());
    }
}
