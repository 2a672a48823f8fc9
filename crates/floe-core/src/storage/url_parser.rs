//! URL parsing for storage backends.
//!
//! Extracts backend configuration from the URL formats accepted for catalog
//! warehouses (S3, GCS, local filesystem, in-process memory).

use object_store::path::Path;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{GcsConfig, LocalConfig, MemoryConfig, S3Config};

const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Memory,
    Local,
}

/// Matchers in priority order; `memory://` must be tried before the `file:` forms.
fn matchers() -> &'static [(Backend, Vec<Regex>)] {
    static MATCHERS: OnceLock<Vec<(Backend, Vec<Regex>)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let compile = |pattern: &str| Regex::new(pattern).expect("static storage URL pattern");
        vec![
            (
                Backend::S3,
                vec![compile(S3_ENDPOINT_URL), compile(S3_URL)],
            ),
            (Backend::Gcs, vec![compile(GCS_URL)]),
            (Backend::Memory, vec![compile(MEMORY_URL)]),
            (
                Backend::Local,
                vec![compile(FILE_URI), compile(FILE_URL), compile(FILE_PATH)],
            ),
        ]
    })
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

fn optional_key(matches: &regex::Captures) -> Option<Path> {
    matches
        .name("key")
        .map(|m| m.as_str().trim_matches('/'))
        .filter(|key| !key.is_empty())
        .map(Path::from)
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, patterns) in matchers() {
            if let Some(matches) = patterns.iter().find_map(|r| r.captures(url)) {
                return match backend {
                    Backend::S3 => Ok(Self::parse_s3(&matches)),
                    Backend::Gcs => Ok(Self::parse_gcs(&matches)),
                    Backend::Memory => Ok(BackendConfig::Memory(MemoryConfig {
                        key: optional_key(&matches),
                    })),
                    Backend::Local => Ok(Self::parse_local(&matches)),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: &regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let region = std::env::var("AWS_DEFAULT_REGION").ok();

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{protocol}://{}:{port}", endpoint.as_str())
            })
        });

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: optional_key(matches),
        })
    }

    fn parse_gcs(matches: &regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        BackendConfig::Gcs(GcsConfig {
            bucket,
            key: optional_key(matches),
        })
    }

    fn parse_local(matches: &regex::Captures) -> Self {
        let path = matches.name("path").map(|m| m.as_str()).unwrap_or_default();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let path = match path.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };

        BackendConfig::Local(LocalConfig { path })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Memory(memory) => memory.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://mybucket/path/to/warehouse").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.key, Some(Path::from("path/to/warehouse")));
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_s3_endpoint_url() {
        let config =
            BackendConfig::parse_url("s3::http://localhost:9000/mybucket/warehouse").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.key, Some(Path::from("warehouse")));
                if std::env::var("AWS_ENDPOINT").is_err() {
                    assert_eq!(s3.endpoint, Some("http://localhost:9000".to_string()));
                }
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_gcs_url_parsing() {
        let config = BackendConfig::parse_url("gs://mybucket/warehouse/").unwrap();
        match config {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "mybucket");
                assert_eq!(gcs.key, Some(Path::from("warehouse")));
            }
            _ => panic!("Expected Gcs config"),
        }
    }

    #[test]
    fn test_memory_url_parsing() {
        assert_eq!(
            BackendConfig::parse_url("memory://").unwrap(),
            BackendConfig::Memory(MemoryConfig { key: None })
        );
        assert_eq!(
            BackendConfig::parse_url("memory://warehouse").unwrap(),
            BackendConfig::Memory(MemoryConfig {
                key: Some(Path::from("warehouse"))
            })
        );
    }

    #[test]
    fn test_local_url_forms() {
        for url in [
            "/tmp/floe/warehouse",
            "file:///tmp/floe/warehouse",
            "file:/tmp/floe/warehouse/",
        ] {
            match BackendConfig::parse_url(url).unwrap() {
                BackendConfig::Local(local) => assert_eq!(local.path, "/tmp/floe/warehouse"),
                other => panic!("Expected Local config for {url}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_url() {
        assert!(BackendConfig::parse_url("invalid://url").is_err());
        assert!(BackendConfig::parse_url("relative/path").is_err());
    }
}
