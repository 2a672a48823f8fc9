//! Configuration primitives shared across floe crates.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;

use crate::error::{
    ConfigError, EnvInterpolationSnafu, ReadFileSnafu, UnsupportedFormatSnafu, YamlParseSnafu,
};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    crate::metrics::server::DEFAULT_METRICS_ADDR.to_string()
}

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Parse YAML text after environment variable interpolation.
pub fn parse_yaml<T: DeserializeOwned>(text: &str) -> Result<T, ConfigError> {
    let interpolated = interpolate(text);
    if !interpolated.is_ok() {
        return EnvInterpolationSnafu {
            message: interpolated.errors.join("\n"),
        }
        .fail();
    }
    serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)
}

/// Read and parse a YAML config file.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    ensure!(
        is_yaml_file(path),
        UnsupportedFormatSnafu {
            path: path.to_path_buf()
        }
    );
    let text = std::fs::read_to_string(path).context(ReadFileSnafu {
        path: path.to_path_buf(),
    })?;
    parse_yaml(&text)
}
