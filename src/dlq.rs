//! Reject log for stream records that could not be decoded.
//!
//! Skipped records are always logged and counted. When enabled, a run also
//! writes them as NDJSON to `dlq/<id>/<id>_<run-token>.ndjson` in the staging
//! bucket so they can be inspected and replayed by hand.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::PutPayload;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, info};

use crate::emit;
use crate::error::{DlqError, DlqSerializeSnafu, DlqWriteSnafu};
use crate::metrics::events::RejectsWritten;
use crate::staging::RunToken;
use crate::storage::StorageProviderRef;
use crate::stream::SkippedRecord;

/// One rejected message as written to the reject log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Why decoding failed.
    pub reason: String,
    /// Raw payload, lossily converted to UTF-8. `None` for empty messages.
    pub payload: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl RejectedRecord {
    pub fn from_skipped(skipped: &SkippedRecord, recorded_at: DateTime<Utc>) -> Self {
        Self {
            topic: skipped.message.topic.clone(),
            partition: skipped.message.partition,
            offset: skipped.message.offset,
            reason: skipped.reason.to_string(),
            payload: skipped
                .message
                .payload
                .as_deref()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            recorded_at,
        }
    }
}

/// Object key of the reject log for one run.
pub fn reject_path(id: &str, token: &RunToken) -> Path {
    let id = id.to_lowercase();
    let file_name = format!("{id}_{token}.ndjson");
    Path::from_iter(["dlq", id.as_str(), file_name.as_str()])
}

/// Writes a run's skipped records next to its staging objects.
#[derive(Debug, Clone)]
pub struct RejectLog {
    storage: StorageProviderRef,
}

impl RejectLog {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    /// Write all skipped records of a batch as one object.
    ///
    /// Returns the object path, or `None` when there was nothing to write.
    pub async fn write(
        &self,
        id: &str,
        token: &RunToken,
        skipped: &[SkippedRecord],
    ) -> Result<Option<Path>, DlqError> {
        if skipped.is_empty() {
            return Ok(None);
        }

        let recorded_at = Utc::now();
        let mut ndjson = String::new();
        for record in skipped {
            let line = serde_json::to_string(&RejectedRecord::from_skipped(record, recorded_at))
                .context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        let path = reject_path(id, token);
        debug!(path = %path, count = skipped.len(), "Writing reject log");

        self.storage
            .put_payload(&path, PutPayload::from(Bytes::from(ndjson)))
            .await
            .context(DlqWriteSnafu)?;

        emit!(RejectsWritten {
            count: skipped.len() as u64,
        });
        info!(
            object = %self.storage.object_url(&path),
            count = skipped.len(),
            "Wrote rejected records"
        );
        Ok(Some(path))
    }
}
