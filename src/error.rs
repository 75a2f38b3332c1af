//! Error types for rivulet using snafu.
//!
//! Each component owns an error enum with context selectors. Fatal errors
//! bubble up into [`RunError`], which records the pipeline, the state the
//! run was in, and the window or batch it was working on.

use snafu::prelude::*;

use crate::pipeline::RunState;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },

    /// Azure configuration error.
    #[snafu(display("Azure configuration error: {source}"))]
    AzureConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Staging URL is empty.
    #[snafu(display("Staging URL cannot be empty"))]
    EmptyStagingUrl,

    /// Warehouse URL is empty.
    #[snafu(display("Warehouse URL cannot be empty"))]
    EmptyWarehouseUrl,

    /// No pipelines configured.
    #[snafu(display("At least one pipeline must be configured"))]
    NoPipelines,

    /// Pipeline is not defined in the configuration.
    #[snafu(display("Unknown pipeline '{name}'"))]
    UnknownPipeline { name: String },

    /// Pipeline declares both or neither of `window` and `stream`.
    #[snafu(display("Pipeline '{pipeline}' must declare exactly one of `window` or `stream`"))]
    AmbiguousPipelineKind { pipeline: String },

    /// Window pipeline references a source that is not defined.
    #[snafu(display("Pipeline '{pipeline}' references unknown source '{source_name}'"))]
    UnknownSource { pipeline: String, source_name: String },

    /// Stream pipeline references a broker that is not defined.
    #[snafu(display("Pipeline '{pipeline}' references unknown broker '{broker}'"))]
    UnknownBroker { pipeline: String, broker: String },

    /// Stream pipeline has a zero idle timeout.
    #[snafu(display("Pipeline '{pipeline}' must use an idle timeout greater than zero"))]
    ZeroIdleTimeout { pipeline: String },

    /// Declared schema has no fields.
    #[snafu(display("Declared schema for pipeline '{pipeline}' must have at least one field"))]
    EmptySchema { pipeline: String },

    /// Destination table identifier is malformed.
    #[snafu(display("Invalid table reference '{value}': {reason}"))]
    InvalidTableRef { value: String, reason: String },

    /// Run token cannot be used in an object path.
    #[snafu(display("Invalid run token '{token}': {reason}"))]
    InvalidRunToken { token: String, reason: String },

    /// A table or column name is not a plain SQL identifier.
    #[snafu(display("Invalid {kind} identifier '{value}'"))]
    InvalidIdentifier { kind: String, value: String },

    /// Window bounds are not ordered.
    #[snafu(display("Window start {start} must be before end {end}"))]
    InvalidWindow { start: String, end: String },

    /// Window pipeline was invoked without window bounds.
    #[snafu(display("Pipeline '{pipeline}' is windowed and needs --start and --end"))]
    MissingWindow { pipeline: String },

    /// A run was assembled without one of its required parts.
    #[snafu(display("Pipeline '{pipeline}' cannot run without {missing}"))]
    IncompleteRun { pipeline: String, missing: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Source Errors ============

/// Errors raised while extracting a window from a relational source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The source could not be reached.
    #[snafu(display("Cannot connect to source '{source_id}': {source}"))]
    Connectivity {
        source_id: String,
        source: tokio_postgres::Error,
    },

    /// The source rejected or failed the query.
    #[snafu(display("Query failed on source '{source_id}': {message}"))]
    Query { source_id: String, message: String },

    /// A column type has no scalar mapping.
    #[snafu(display("Column '{column}' on source '{source_id}' has unsupported type {type_name}"))]
    UnsupportedType {
        source_id: String,
        column: String,
        type_name: String,
    },

    /// A row does not have as many values as the row set has columns.
    #[snafu(display("Row has {actual} values but the row set has {expected} columns"))]
    RowWidth { expected: usize, actual: usize },
}

// ============ Serializer Errors ============

/// Errors raised while serializing rows or records for staging.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SerializeError {
    /// CSV writer failure.
    #[snafu(display("Failed to write CSV: {source}"))]
    Csv { source: csv::Error },

    /// CSV buffer could not be recovered from the writer.
    #[snafu(display("Failed to flush CSV buffer: {message}"))]
    CsvFlush { message: String },

    /// JSON encoding failure.
    #[snafu(display("Failed to encode JSON record: {source}"))]
    JsonEncode { source: serde_json::Error },
}

// ============ Stream Errors ============

/// Errors raised while consuming from the stream broker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StreamError {
    /// Consumer could not be created from the client configuration.
    #[snafu(display("Invalid consumer configuration for topic '{topic}': {source}"))]
    ClientConfig {
        topic: String,
        source: rdkafka::error::KafkaError,
    },

    /// Subscribing to the topic failed.
    #[snafu(display("Cannot subscribe to topic '{topic}': {source}"))]
    Subscribe {
        topic: String,
        source: rdkafka::error::KafkaError,
    },

    /// The broker failed while polling.
    #[snafu(display("Broker error while consuming '{topic}': {source}"))]
    Broker {
        topic: String,
        source: rdkafka::error::KafkaError,
    },

    /// Committing consumed offsets failed.
    #[snafu(display("Cannot commit offsets for group '{group}' on '{topic}': {message}"))]
    Commit {
        topic: String,
        group: String,
        message: String,
    },

    /// A blocking commit task did not finish.
    #[snafu(display("Offset commit task failed: {source}"))]
    CommitTask { source: tokio::task::JoinError },
}

// ============ Staging Errors ============

/// Errors raised while uploading a staging object.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StagingError {
    /// Staging storage could not be created.
    #[snafu(display("Failed to open staging storage: {source}"))]
    StagingStorage { source: StorageError },

    /// Upload of the object failed.
    #[snafu(display("Failed to upload {path}: {source}"))]
    Upload { path: String, source: StorageError },
}

// ============ Load Errors ============

/// Errors raised while loading a staged object into the warehouse.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoadError {
    /// The staged object could not be read.
    #[snafu(display("Failed to read staged object {path}: {source}"))]
    ReadObject { path: String, source: StorageError },

    /// Warehouse storage could not be created.
    #[snafu(display("Failed to open warehouse storage: {source}"))]
    WarehouseStorage { source: StorageError },

    /// The payload does not match the declared, inferred or existing layout.
    #[snafu(display("Schema mismatch loading into {table}: {details}"))]
    SchemaMismatch { table: String, details: String },

    /// The payload could not be decoded.
    #[snafu(display("Failed to decode staged payload for {table}: {message}"))]
    Decode { table: String, message: String },

    /// No schema could be inferred because the payload has no rows.
    #[snafu(display("Cannot infer a schema for {table} from an empty payload"))]
    EmptyPayload { table: String },

    /// Destination table does not exist and creation was disabled.
    #[snafu(display("Destination table {table} does not exist"))]
    TableNotFound { table: String },

    /// Failed to construct the table location.
    #[snafu(display("Invalid table location {url}"))]
    TableUrl { url: String },

    /// Delta Lake operation failed.
    #[snafu(display("Delta Lake operation failed for {table}: {source}"))]
    Delta {
        table: String,
        source: deltalake::DeltaTableError,
    },

    /// Failed to convert between Arrow and Delta schemas.
    #[snafu(display("Failed to convert schema for {table}: {message}"))]
    SchemaConversion { table: String, message: String },
}

// ============ DLQ Errors ============

/// Errors that can occur while writing rejected stream records.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ: {source}"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize rejected record.
    #[snafu(display("Failed to serialize DLQ record: {source}"))]
    DlqSerialize { source: serde_json::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Run Error (top-level) ============

/// A fatal error that moved a run into the `Failed` state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RunError {
    /// The run could not be assembled from configuration.
    #[snafu(display("Pipeline '{pipeline}' could not be built: {source}"))]
    Build {
        pipeline: String,
        source: ConfigError,
    },

    /// Staging or warehouse storage could not be opened for the run.
    #[snafu(display("Pipeline '{pipeline}' could not open storage: {source}"))]
    Setup {
        pipeline: String,
        source: StorageError,
    },

    /// Extraction from the relational source failed.
    #[snafu(display("Pipeline '{pipeline}' failed extracting {window}: {source}"))]
    Extract {
        pipeline: String,
        window: String,
        source: SourceError,
    },

    /// Consumption from the stream failed.
    #[snafu(display("Pipeline '{pipeline}' failed consuming {batch}: {source}"))]
    Consume {
        pipeline: String,
        batch: String,
        source: StreamError,
    },

    /// Serialization of the extracted data failed.
    #[snafu(display("Pipeline '{pipeline}' failed serializing {batch}: {source}"))]
    Serialize {
        pipeline: String,
        batch: String,
        source: SerializeError,
    },

    /// Upload of the staging object failed.
    #[snafu(display("Pipeline '{pipeline}' failed staging {batch}: {source}"))]
    Stage {
        pipeline: String,
        batch: String,
        source: StagingError,
    },

    /// Loading the staged object failed.
    #[snafu(display("Pipeline '{pipeline}' failed loading {object} into {table}: {source}"))]
    Load {
        pipeline: String,
        object: String,
        table: String,
        source: LoadError,
    },

    /// Committing stream offsets after the load failed.
    #[snafu(display("Pipeline '{pipeline}' failed committing offsets for {batch}: {source}"))]
    CommitOffsets {
        pipeline: String,
        batch: String,
        source: StreamError,
    },
}

impl RunError {
    /// The state the run was in when the error occurred.
    pub fn failed_in(&self) -> RunState {
        match self {
            RunError::Build { .. } | RunError::Setup { .. } => RunState::Idle,
            RunError::Extract { .. } | RunError::Consume { .. } => RunState::Extracting,
            RunError::Serialize { .. } => RunState::Serializing,
            RunError::Stage { .. } => RunState::Staging,
            RunError::Load { .. } | RunError::CommitOffsets { .. } => RunState::Loading,
        }
    }

    /// Pipeline the failing run belonged to.
    pub fn pipeline(&self) -> &str {
        match self {
            RunError::Build { pipeline, .. }
            | RunError::Setup { pipeline, .. }
            | RunError::Extract { pipeline, .. }
            | RunError::Consume { pipeline, .. }
            | RunError::Serialize { pipeline, .. }
            | RunError::Stage { pipeline, .. }
            | RunError::Load { pipeline, .. }
            | RunError::CommitOffsets { pipeline, .. } => pipeline,
        }
    }

    /// Whether the failure is a schema mismatch at load time.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(
            self,
            RunError::Load {
                source: LoadError::SchemaMismatch { .. },
                ..
            }
        )
    }
}

// ============ CLI Error ============

/// Errors surfaced by the command-line entry point.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// A pipeline run failed.
    #[snafu(display("Run failed"))]
    Run { source: RunError },

    /// One or more concurrent runs failed.
    #[snafu(display("{failed} of {total} pipeline runs failed"))]
    RunsFailed { failed: usize, total: usize },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },
}
