//! Multi-cloud storage abstraction.
//!
//! Provides a unified interface for working with S3, GCS, Azure Blob Storage,
//! and local filesystem. Staging buckets and the reject log both live behind a
//! [`StorageProvider`]. Every backend is built with retries disabled so that a
//! failed request surfaces to the run instead of being retried in place.

mod azure;
mod gcs;
mod s3;

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload, RetryConfig,
};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, IoSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

// Re-export config types
pub use azure::AzureConfig;
pub use gcs::GcsConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different cloud storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for different storage backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const ABFS_URL: &str = r"^abfss?://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)\.dfs\.core\.windows\.net(/(?P<key>.+))?$";
const AZURE_HTTPS: &str = r"^https://(?P<account>[a-z0-9]+)\.(blob|dfs)\.core\.windows\.net/(?P<container>[a-z0-9\-]+)(/(?P<key>.+))?$";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Azure,
    Local,
}

// Checked in a fixed order: the https patterns of S3, GCS and Azure are
// disjoint, and the local patterns only match paths and file URLs.
fn matchers() -> &'static [(Backend, Vec<Regex>)] {
    static MATCHERS: OnceLock<Vec<(Backend, Vec<Regex>)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("storage URL pattern is valid"))
                .collect()
        };

        vec![
            (
                Backend::S3,
                compile(&[S3_PATH, S3_VIRTUAL, S3_ENDPOINT_URL, S3_URL]),
            ),
            (Backend::Gcs, compile(&[GCS_PATH, GCS_VIRTUAL, GCS_URL])),
            (Backend::Azure, compile(&[ABFS_URL, AZURE_HTTPS])),
            (Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH])),
        ]
    })
}

/// A directory used as a bucket, for development and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Absolute path without a trailing slash.
    pub path: String,
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
    Local(LocalConfig),
}

fn capture(matches: &regex::Captures, name: &str) -> Option<String> {
    matches.name(name).map(|m| m.as_str().to_string())
}

impl BackendConfig {
    /// Parse a bucket URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, patterns) in matchers() {
            if let Some(matches) = patterns.iter().find_map(|r| r.captures(url)) {
                let parsed = match backend {
                    Backend::S3 => Self::parse_s3(&matches),
                    Backend::Gcs => Self::parse_gcs(&matches),
                    Backend::Azure => Self::parse_azure(&matches),
                    Backend::Local => Self::parse_local(&matches),
                };
                return parsed.context(InvalidUrlSnafu { url });
            }
        }

        InvalidUrlSnafu { url }.fail()
    }

    fn parse_s3(matches: &regex::Captures) -> Option<Self> {
        let bucket = capture(matches, "bucket")?;

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| capture(matches, "region"));

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
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        Some(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: capture(matches, "key").map(Path::from),
        }))
    }

    fn parse_gcs(matches: &regex::Captures) -> Option<Self> {
        Some(BackendConfig::Gcs(GcsConfig {
            bucket: capture(matches, "bucket")?,
            key: capture(matches, "key").map(Path::from),
        }))
    }

    fn parse_azure(matches: &regex::Captures) -> Option<Self> {
        Some(BackendConfig::Azure(AzureConfig {
            account: capture(matches, "account")?,
            container: capture(matches, "container")?,
            key: capture(matches, "key").map(Path::from),
        }))
    }

    fn parse_local(matches: &regex::Captures) -> Option<Self> {
        let path = capture(matches, "path")?;
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        let path = path.trim_end_matches('/');

        Some(BackendConfig::Local(LocalConfig {
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        }))
    }

    /// Key prefix inside the bucket, if the URL had one.
    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Azure(azure) => azure.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

/// Retry configuration shared by all remote backends.
///
/// A failed upload or read is reported to the run as-is; re-running is the
/// scheduler's decision.
pub(crate) fn no_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 0,
        ..Default::default()
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url)?;

        match config {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Azure(config) => Self::construct_azure(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    // The bucket root is created if missing.
    async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(IoSnafu)?;
        let store = LocalFileSystem::new_with_prefix(&config.path).context(ObjectStoreSnafu)?;

        Ok(Self {
            canonical_url: format!("file://{}", config.path),
            config: BackendConfig::Local(config),
            object_store: Arc::new(store),
        })
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = match self.object_store.get(&self.qualify_path(&path)).await {
            Ok(get_result) => get_result.bytes().await,
            Err(e) => Err(e),
        };

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: request_status(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)
    }

    /// Upload a whole object with a single PUT, replacing any existing object.
    ///
    /// The content type is recorded as an object attribute on remote
    /// backends. The local filesystem backend does not store attributes.
    pub async fn put_object(
        &self,
        path: &Path,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let mut attributes = Attributes::new();
        if !self.is_local() {
            attributes.insert(
                Attribute::ContentType,
                AttributeValue::from(content_type.to_string()),
            );
        }
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.put_with_options(path, PutPayload::from(bytes), options)
            .await
    }

    /// Put a payload to a path.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        self.put_with_options(path, payload, PutOptions::default())
            .await
    }

    async fn put_with_options(
        &self,
        path: &Path,
        payload: PutPayload,
        options: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, options).await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: request_status(&result),
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Full URL of an object, for logs and load results.
    pub fn object_url(&self, path: &Path) -> String {
        format!("{}/{}", self.canonical_url.trim_end_matches('/'), path)
    }

    /// Canonical URL of the bucket (and key prefix).
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    pub fn is_local(&self) -> bool {
        matches!(self.config, BackendConfig::Local(_))
    }
}

fn request_status<T, E>(result: &Result<T, E>) -> RequestStatus {
    if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://mybucket/path/to/data").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.key, Some(Path::from("path/to/data")));
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_gcs_url_parsing() {
        let config = BackendConfig::parse_url("gs://dacntt-staging").unwrap();
        match config {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "dacntt-staging");
                assert_eq!(gcs.key, None);
            }
            _ => panic!("Expected Gcs config"),
        }
    }

    #[test]
    fn test_local_url_parsing() {
        let config = BackendConfig::parse_url("file:///local/path/to/data/").unwrap();
        match config {
            BackendConfig::Local(local) => {
                assert_eq!(local.path, "/local/path/to/data");
            }
            _ => panic!("Expected Local config"),
        }
    }

    #[test]
    fn test_azure_url_parsing() {
        let config = BackendConfig::parse_url(
            "abfss://mycontainer@mystorageaccount.dfs.core.windows.net/path/to/data",
        )
        .unwrap();
        match config {
            BackendConfig::Azure(azure) => {
                assert_eq!(azure.account, "mystorageaccount");
                assert_eq!(azure.container, "mycontainer");
                assert_eq!(azure.key, Some(Path::from("path/to/data")));
            }
            _ => panic!("Expected Azure config"),
        }
    }

    #[test]
    fn test_invalid_url() {
        let err = BackendConfig::parse_url("ftp://somewhere/bucket").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_put_object_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let url = temp_dir.path().join("bucket").display().to_string();
        let storage = StorageProvider::for_url_with_options(&url, HashMap::new())
            .await
            .unwrap();

        let path = Path::from("data/ticket/ticket_20250626.csv");
        storage
            .put_object(&path, Bytes::from_static(b"id\n1\n"), "text/csv")
            .await
            .unwrap();
        storage
            .put_object(&path, Bytes::from_static(b"id\n2\n"), "text/csv")
            .await
            .unwrap();

        let content = storage.get(path.clone()).await.unwrap();
        assert_eq!(content.as_ref(), b"id\n2\n");
        assert!(
            temp_dir
                .path()
                .join("bucket/data/ticket/ticket_20250626.csv")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let url = temp_dir.path().display().to_string();
        let storage = StorageProvider::for_url_with_options(&url, HashMap::new())
            .await
            .unwrap();

        let err = storage.get("missing.csv").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_local_bucket_created_on_demand() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("staging/bucket");
        let url = format!("file://{}/", root.display());

        let storage = StorageProvider::for_url_with_options(&url, HashMap::new())
            .await
            .unwrap();

        assert!(root.is_dir());
        assert!(storage.is_local());
        assert_eq!(
            storage.object_url(&Path::from("ticket/ticket_20250626.csv")),
            format!("file://{}/ticket/ticket_20250626.csv", root.display())
        );
    }

    #[test]
    fn test_no_retry_config() {
        assert_eq!(no_retry_config().max_retries, 0);
    }
}
