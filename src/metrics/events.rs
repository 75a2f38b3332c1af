//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a pipeline run.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a window extraction returns rows.
pub struct RowsExtracted {
    pub pipeline: String,
    pub count: u64,
}

impl InternalEvent for RowsExtracted {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, count = self.count, "Rows extracted");
        counter!("rivulet_rows_extracted_total", "pipeline" => self.pipeline).increment(self.count);
    }
}

/// Event emitted when stream records decode successfully.
pub struct RecordsConsumed {
    pub pipeline: String,
    pub count: u64,
}

impl InternalEvent for RecordsConsumed {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, count = self.count, "Records consumed");
        counter!("rivulet_records_consumed_total", "pipeline" => self.pipeline)
            .increment(self.count);
    }
}

/// Event emitted when a stream record is skipped.
pub struct RecordSkipped {
    pub reason: &'static str,
}

impl InternalEvent for RecordSkipped {
    fn emit(self) {
        trace!(reason = self.reason, "Record skipped");
        counter!("rivulet_records_skipped_total", "reason" => self.reason).increment(1);
    }
}

/// Event emitted when a staging object is uploaded.
pub struct ObjectStaged {
    pub bytes: u64,
}

impl InternalEvent for ObjectStaged {
    fn emit(self) {
        trace!(bytes = self.bytes, "Object staged");
        counter!("rivulet_objects_staged_total").increment(1);
        counter!("rivulet_bytes_staged_total").increment(self.bytes);
    }
}

/// Event emitted when rows are appended to a destination table.
pub struct RowsLoaded {
    pub table: String,
    pub count: u64,
}

impl InternalEvent for RowsLoaded {
    fn emit(self) {
        trace!(table = %self.table, count = self.count, "Rows loaded");
        counter!("rivulet_rows_loaded_total", "table" => self.table).increment(self.count);
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Empty,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Empty => "empty",
            RunStatus::Failed => "failed",
        }
    }
}

/// Event emitted when a run reaches a terminal state.
pub struct RunFinished {
    pub status: RunStatus,
}

impl InternalEvent for RunFinished {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Run finished");
        counter!("rivulet_runs_total", "status" => self.status.as_str()).increment(1);
    }
}

/// Event emitted when skipped records are written to the reject log.
pub struct RejectsWritten {
    pub count: u64,
}

impl InternalEvent for RejectsWritten {
    fn emit(self) {
        trace!(count = self.count, "Rejects written");
        counter!("rivulet_dlq_records_total").increment(self.count);
    }
}

// ============================================================================
// Histogram events for timing
// ============================================================================

/// Pipeline stage being timed.
#[derive(Debug, Clone, Copy)]
pub enum Stage {
    Extract,
    Consume,
    Serialize,
    Stage,
    Load,
    Commit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Consume => "consume",
            Stage::Serialize => "serialize",
            Stage::Stage => "stage",
            Stage::Load => "load",
            Stage::Commit => "commit",
        }
    }
}

/// Event emitted when a pipeline stage completes.
pub struct StageCompleted {
    pub stage: Stage,
    pub duration: Duration,
}

impl InternalEvent for StageCompleted {
    fn emit(self) {
        trace!(
            stage = self.stage.as_str(),
            duration_ms = self.duration.as_millis(),
            "Stage completed"
        );
        histogram!("rivulet_stage_duration_seconds", "stage" => self.stage.as_str())
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a Delta Lake commit completes.
pub struct DeltaCommitCompleted {
    pub duration: Duration,
}

impl InternalEvent for DeltaCommitCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Delta commit completed"
        );
        histogram!("rivulet_delta_commit_duration_seconds").record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "rivulet_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "rivulet_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
