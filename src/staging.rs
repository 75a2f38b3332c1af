//! Staging objects in blob storage.
//!
//! Every successful run with data writes exactly one object, keyed by the
//! lower-cased source identity and the scheduler's run token:
//! `data/[<prefix>/]<id>/<id>_<token>.<ext>`. Re-running with the same token
//! replaces the object in place.

use bytes::Bytes;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use tracing::info;

use crate::emit;
use crate::error::{ConfigError, StagingError, StagingStorageSnafu, UploadSnafu};
use crate::metrics::events::{ObjectStaged, Stage, StageCompleted};
use crate::serialize::PayloadFormat;
use crate::storage::{StorageProvider, StorageProviderRef};

/// Scheduler-supplied logical run time, e.g. `20250626` or `20250626T000000`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunToken(String);

impl RunToken {
    pub fn parse(token: &str) -> Result<Self, ConfigError> {
        let reason = if token.is_empty() {
            Some("token is empty")
        } else if token.contains(['/', '\\']) {
            Some("token must not contain path separators")
        } else if token.chars().any(char::is_whitespace) {
            Some("token must not contain whitespace")
        } else if token == "." || token == ".." {
            Some("token must not be a relative path")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ConfigError::InvalidRunToken {
                token: token.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(Self(token.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object key for a staged payload.
pub fn object_path(
    prefix: Option<&str>,
    id: &str,
    token: &RunToken,
    format: PayloadFormat,
) -> Path {
    let id = id.to_lowercase();
    let file_name = format!("{id}_{token}.{}", format.extension());

    let mut parts: Vec<&str> = vec!["data"];
    if let Some(prefix) = prefix {
        parts.extend(prefix.split('/').filter(|p| !p.is_empty()));
    }
    parts.push(&id);
    parts.push(&file_name);

    Path::from_iter(parts)
}

/// A staged object, the only state handed from staging to loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Canonical URL of the staging bucket.
    pub bucket_url: String,
    /// Key inside the bucket.
    pub path: Path,
    pub format: PayloadFormat,
    /// Payload size in bytes.
    pub size: usize,
    /// Data rows or records in the payload.
    pub record_count: usize,
}

impl ObjectRef {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.bucket_url.trim_end_matches('/'), self.path)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Result of the staging step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Staged(ObjectRef),
    /// Nothing was extracted, so nothing was written and nothing is loaded.
    NoObject,
}

/// Uploads whole payloads to the staging bucket.
#[derive(Debug, Clone)]
pub struct StagingSink {
    storage: StorageProviderRef,
}

impl StagingSink {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    /// Open the staging bucket at `url`.
    pub async fn for_url(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StagingError> {
        let storage = StorageProvider::for_url_with_options(url, options)
            .await
            .context(StagingStorageSnafu)?;
        Ok(Self::new(storage.into()))
    }

    pub fn storage(&self) -> &StorageProviderRef {
        &self.storage
    }

    /// Upload `bytes` as one object at `path`, replacing any previous object.
    pub async fn stage(
        &self,
        path: Path,
        bytes: Bytes,
        format: PayloadFormat,
        record_count: usize,
    ) -> Result<ObjectRef, StagingError> {
        let start = Instant::now();
        let size = bytes.len();

        self.storage
            .put_object(&path, bytes, format.content_type())
            .await
            .context(UploadSnafu {
                path: path.to_string(),
            })?;

        emit!(ObjectStaged { bytes: size as u64 });
        emit!(StageCompleted {
            stage: Stage::Stage,
            duration: start.elapsed(),
        });

        let object = ObjectRef {
            bucket_url: self.storage.canonical_url().to_string(),
            path,
            format,
            size,
            record_count,
        };
        info!(object = %object, bytes = size, records = record_count, "Staged object");
        Ok(object)
    }
}
