//! rivulet: windowed database extracts and stream micro-batches loaded into
//! Delta Lake tables.
//!
//! Every run moves data one way: a relational window or a bounded stream
//! batch is serialized, staged as a single object in blob storage, and then
//! appended to a destination table whose layout is declared or inferred.
//!
//! # Example
//!
//! ```ignore
//! use rivulet::{Config, pipeline::{PipelineRun, RunParams}, staging::RunToken};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("rivulet.yaml")?;
//!     let params = RunParams {
//!         run_token: RunToken::parse("20250626T100000")?,
//!         window: None,
//!     };
//!     let outcome = PipelineRun::from_config(&config, "trip_searches", params)
//!         .await?
//!         .execute()
//!         .await?;
//!     println!("Staged {:?}", outcome.report().staged);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dlq;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod serialize;
pub mod source;
pub mod staging;
pub mod storage;
pub mod stream;

// Re-export main types
pub use config::{Config, TableRef};
pub use loader::{BatchLoader, LoadResult};
pub use pipeline::{PipelineRun, RunOutcome, RunParams, RunReport, RunState};
pub use staging::{ObjectRef, RunToken, StageOutcome, StagingSink};
pub use storage::{StorageProvider, StorageProviderRef};
