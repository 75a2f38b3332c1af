//! Per-run orchestration.
//!
//! A [`PipelineRun`] executes one scheduled run of one pipeline as a
//! sequential chain: extract a window (or consume a stream batch), serialize,
//! stage one object, then load it. An empty extract short-circuits everything
//! after it. The only state handed from staging to loading is the
//! [`StageOutcome`].
//!
//! Stream runs commit consumed offsets only after the batch has been staged
//! and loaded, or straight away when every record in the batch was skipped.

mod state;

pub use state::{RunState, StateTracker};

use chrono::{DateTime, Utc};
use deltalake::arrow::datatypes::SchemaRef;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{Config, CreateDisposition, PipelineKind, TableRef};
use crate::dlq::RejectLog;
use crate::emit;
use crate::error::{
    BuildSnafu, CommitOffsetsSnafu, ConfigError, ConsumeSnafu, ExtractSnafu,
    IncompleteRunSnafu, LoadSnafu, MissingWindowSnafu, RunError, SerializeSnafu, SetupSnafu,
    StageSnafu, UnknownBrokerSnafu, UnknownSourceSnafu,
};
use crate::loader::{BatchLoader, LoadResult, Warehouse};
use crate::metrics::events::{
    RecordsConsumed, RowsExtracted, RunFinished, RunStatus, Stage, StageCompleted,
};
use crate::serialize::{PayloadFormat, serialize_records, serialize_rows};
use crate::source::{ExtractionWindow, Extracted, PostgresSource, RelationalSource, extract};
use crate::staging::{ObjectRef, RunToken, StageOutcome, StagingSink, object_path};
use crate::storage::StorageProvider;
use crate::stream::{ConsumeOptions, KafkaConnector, SkippedRecord, StreamConsumer};

/// Scheduler-supplied parameters of one run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub run_token: RunToken,
    /// `[start, end)` for window pipelines. Ignored by stream pipelines.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Where a run reads from.
pub enum RunInput {
    Window {
        source: Arc<dyn RelationalSource>,
        window: ExtractionWindow,
    },
    Stream {
        consumer: StreamConsumer,
    },
}

impl RunInput {
    /// Lower-cased in object keys.
    fn id(&self) -> &str {
        match self {
            RunInput::Window { window, .. } => window.table(),
            RunInput::Stream { consumer } => consumer.topic(),
        }
    }

    fn format(&self) -> PayloadFormat {
        match self {
            RunInput::Window { .. } => PayloadFormat::Csv,
            RunInput::Stream { .. } => PayloadFormat::NewlineDelimitedJson,
        }
    }
}

impl std::fmt::Debug for RunInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunInput::Window { window, .. } => write!(f, "Window({window})"),
            RunInput::Stream { consumer } => write!(f, "Stream({consumer:?})"),
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub pipeline: String,
    pub run_token: RunToken,
    /// Rows extracted, or stream records decoded.
    pub records: usize,
    /// Stream records skipped as undecodable.
    pub skipped: usize,
    pub staged: StageOutcome,
    /// `None` when nothing was staged or loading is disabled.
    pub load: Option<LoadResult>,
    /// Reject log object, when one was written.
    pub rejects: Option<Path>,
    pub history: Vec<RunState>,
    pub duration: Duration,
}

/// Successful end of a run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Data was staged (and loaded, unless loading is disabled).
    Completed(RunReport),
    /// Nothing was extracted; nothing was staged or loaded.
    Empty(RunReport),
}

impl RunOutcome {
    pub fn report(&self) -> &RunReport {
        match self {
            RunOutcome::Completed(report) | RunOutcome::Empty(report) => report,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RunOutcome::Empty(_))
    }
}

/// Progress of a run before its report is finalized.
#[derive(Default)]
struct Progress {
    records: usize,
    skipped: usize,
    object: Option<ObjectRef>,
    load: Option<LoadResult>,
    rejects: Option<Path>,
}

/// Destination of a loading run.
#[derive(Debug, Clone)]
struct Destination {
    loader: BatchLoader,
    table: TableRef,
    declared: Option<SchemaRef>,
    disposition: CreateDisposition,
}

/// One execution of one pipeline.
#[derive(Debug)]
pub struct PipelineRun {
    name: String,
    run_token: RunToken,
    input: RunInput,
    staging: StagingSink,
    staging_prefix: Option<String>,
    destination: Option<Destination>,
    rejects: Option<RejectLog>,
}

impl PipelineRun {
    pub fn builder(name: impl Into<String>, run_token: RunToken) -> PipelineRunBuilder {
        PipelineRunBuilder {
            name: name.into(),
            run_token,
            input: None,
            staging: None,
            staging_prefix: None,
            destination: None,
            rejects: None,
        }
    }

    /// Assemble the run for pipeline `name` from configuration.
    pub async fn from_config(
        config: &Config,
        name: &str,
        params: RunParams,
    ) -> Result<Self, RunError> {
        let pipeline = config.pipeline(name).context(BuildSnafu { pipeline: name })?;
        let kind = pipeline.kind(name).context(BuildSnafu { pipeline: name })?;

        let storage = Arc::new(
            StorageProvider::for_url_with_options(
                &config.staging.url,
                config.staging.storage_options.clone(),
            )
            .await
            .context(SetupSnafu { pipeline: name })?,
        );

        let input = match kind {
            PipelineKind::Window(window) => {
                let (start, end) = params
                    .window
                    .context(MissingWindowSnafu { pipeline: name })
                    .context(BuildSnafu { pipeline: name })?;
                let source_config = config
                    .sources
                    .get(&window.source)
                    .context(UnknownSourceSnafu {
                        pipeline: name,
                        source_name: &window.source,
                    })
                    .context(BuildSnafu { pipeline: name })?;

                RunInput::Window {
                    source: Arc::new(PostgresSource::new(&window.source, &source_config.url)),
                    window: ExtractionWindow::new(
                        &window.source,
                        &window.schema,
                        &window.table,
                        &window.time_column,
                        start,
                        end,
                    )
                    .context(BuildSnafu { pipeline: name })?,
                }
            }
            PipelineKind::Stream(stream) => {
                let broker = config
                    .brokers
                    .get(&stream.broker)
                    .context(UnknownBrokerSnafu {
                        pipeline: name,
                        broker: &stream.broker,
                    })
                    .context(BuildSnafu { pipeline: name })?;

                let connector = KafkaConnector::new(&stream.topic, &stream.group_id, broker.clone());
                RunInput::Stream {
                    consumer: StreamConsumer::new(
                        Arc::new(connector),
                        ConsumeOptions {
                            idle_timeout: stream.idle_timeout(),
                            max_records: stream.max_records,
                            required_fields: stream.required_fields.clone(),
                        },
                    ),
                }
            }
        };

        let mut builder = Self::builder(name, params.run_token)
            .input(input)
            .staging(StagingSink::new(Arc::clone(&storage)))
            .staging_prefix(pipeline.staging_prefix());

        if pipeline.load {
            let warehouse = Warehouse::new(
                &config.warehouse.url,
                config.warehouse.storage_options.clone(),
            )
            .context(SetupSnafu { pipeline: name })?;
            let table = config
                .destination_table(name)
                .context(BuildSnafu { pipeline: name })?;

            builder = builder.destination(
                BatchLoader::new(Arc::clone(&storage), warehouse),
                table,
                pipeline
                    .destination
                    .schema
                    .as_ref()
                    .map(|schema| schema.to_arrow_schema()),
                pipeline.destination.create_disposition,
            );
        }

        if config.error_handling.dlq && matches!(kind, PipelineKind::Stream(_)) {
            builder = builder.reject_log(RejectLog::new(storage));
        }

        builder.build().context(BuildSnafu { pipeline: name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_token(&self) -> &RunToken {
        &self.run_token
    }

    /// Key the staging object of this run would be written to.
    pub fn object_path(&self) -> Path {
        object_path(
            self.staging_prefix.as_deref(),
            self.input.id(),
            &self.run_token,
            self.input.format(),
        )
    }

    /// Execute the run to a terminal state.
    pub async fn execute(self) -> Result<RunOutcome, RunError> {
        let start = Instant::now();
        let mut tracker = StateTracker::new(&self.name);

        info!(
            pipeline = %self.name,
            run_token = %self.run_token,
            input = ?self.input,
            "Starting run"
        );

        let result = match &self.input {
            RunInput::Window { source, window } => {
                self.run_window(source.as_ref(), window, &mut tracker).await
            }
            RunInput::Stream { consumer } => self.run_stream(consumer, &mut tracker).await,
        };

        match result {
            Ok(progress) => {
                let empty = progress.object.is_none();
                let report = RunReport {
                    pipeline: self.name.clone(),
                    run_token: self.run_token.clone(),
                    records: progress.records,
                    skipped: progress.skipped,
                    staged: match progress.object {
                        Some(object) => StageOutcome::Staged(object),
                        None => StageOutcome::NoObject,
                    },
                    load: progress.load,
                    rejects: progress.rejects,
                    history: tracker.history().to_vec(),
                    duration: start.elapsed(),
                };

                let status = if empty {
                    RunStatus::Empty
                } else {
                    RunStatus::Completed
                };
                emit!(RunFinished { status });
                info!(
                    pipeline = %self.name,
                    run_token = %self.run_token,
                    status = status.as_str(),
                    records = report.records,
                    skipped = report.skipped,
                    duration_ms = report.duration.as_millis() as u64,
                    "Run finished"
                );

                Ok(if empty {
                    RunOutcome::Empty(report)
                } else {
                    RunOutcome::Completed(report)
                })
            }
            Err(e) => {
                let failed_in = tracker.current();
                tracker.advance(RunState::Failed);
                emit!(RunFinished {
                    status: RunStatus::Failed,
                });
                error!(
                    pipeline = %self.name,
                    run_token = %self.run_token,
                    state = %failed_in,
                    error = %e,
                    "Run failed"
                );
                Err(e)
            }
        }
    }

    async fn run_window(
        &self,
        source: &dyn RelationalSource,
        window: &ExtractionWindow,
        tracker: &mut StateTracker,
    ) -> Result<Progress, RunError> {
        tracker.advance(RunState::Extracting);
        let extracted = extract(source, window).await.context(ExtractSnafu {
            pipeline: &self.name,
            window: window.to_string(),
        })?;

        let rows = match extracted {
            Extracted::Empty => {
                tracker.advance(RunState::Empty);
                tracker.advance(RunState::Completed);
                return Ok(Progress::default());
            }
            Extracted::Rows(rows) => rows,
        };
        emit!(RowsExtracted {
            pipeline: self.name.clone(),
            count: rows.len() as u64,
        });
        tracker.advance(RunState::Extracted);

        tracker.advance(RunState::Serializing);
        let serialize_start = Instant::now();
        let bytes = serialize_rows(&rows).context(SerializeSnafu {
            pipeline: &self.name,
            batch: window.to_string(),
        })?;
        emit!(StageCompleted {
            stage: Stage::Serialize,
            duration: serialize_start.elapsed(),
        });

        let object = self
            .stage(bytes, rows.len(), &window.to_string(), tracker)
            .await?;
        let load = self.load(&object, tracker).await?;
        tracker.advance(RunState::Completed);

        Ok(Progress {
            records: rows.len(),
            object: Some(object),
            load,
            ..Default::default()
        })
    }

    async fn run_stream(
        &self,
        consumer: &StreamConsumer,
        tracker: &mut StateTracker,
    ) -> Result<Progress, RunError> {
        let batch_id = format!(
            "{}@{} run {}",
            consumer.topic(),
            consumer.group_id(),
            self.run_token
        );

        tracker.advance(RunState::Extracting);
        let batch = consumer.consume().await.context(ConsumeSnafu {
            pipeline: &self.name,
            batch: &batch_id,
        })?;
        emit!(RecordsConsumed {
            pipeline: self.name.clone(),
            count: batch.received as u64,
        });

        let rejects = self.write_rejects(consumer.topic(), &batch.skipped).await;

        if batch.is_empty() {
            tracker.advance(RunState::Empty);
            // Nothing decodable: move the group past what was read so poison
            // messages are not re-read on every run.
            consumer
                .commit(&batch.offsets)
                .await
                .context(CommitOffsetsSnafu {
                    pipeline: &self.name,
                    batch: &batch_id,
                })?;
            tracker.advance(RunState::Completed);
            return Ok(Progress {
                skipped: batch.skipped.len(),
                rejects,
                ..Default::default()
            });
        }
        tracker.advance(RunState::Extracted);

        tracker.advance(RunState::Serializing);
        let serialize_start = Instant::now();
        let bytes = serialize_records(&batch.records).context(SerializeSnafu {
            pipeline: &self.name,
            batch: &batch_id,
        })?;
        emit!(StageCompleted {
            stage: Stage::Serialize,
            duration: serialize_start.elapsed(),
        });

        let object = self
            .stage(bytes, batch.records.len(), &batch_id, tracker)
            .await?;
        let load = self.load(&object, tracker).await?;

        consumer
            .commit(&batch.offsets)
            .await
            .context(CommitOffsetsSnafu {
                pipeline: &self.name,
                batch: &batch_id,
            })?;
        tracker.advance(RunState::Completed);

        Ok(Progress {
            records: batch.records.len(),
            skipped: batch.skipped.len(),
            object: Some(object),
            load,
            rejects,
        })
    }

    async fn stage(
        &self,
        bytes: bytes::Bytes,
        record_count: usize,
        batch_id: &str,
        tracker: &mut StateTracker,
    ) -> Result<ObjectRef, RunError> {
        tracker.advance(RunState::Staging);
        let object = self
            .staging
            .stage(self.object_path(), bytes, self.input.format(), record_count)
            .await
            .context(StageSnafu {
                pipeline: &self.name,
                batch: batch_id,
            })?;
        tracker.advance(RunState::Staged);
        Ok(object)
    }

    async fn load(
        &self,
        object: &ObjectRef,
        tracker: &mut StateTracker,
    ) -> Result<Option<LoadResult>, RunError> {
        let Some(destination) = &self.destination else {
            info!(pipeline = %self.name, object = %object, "Loading disabled, object left staged");
            return Ok(None);
        };

        tracker.advance(RunState::Loading);
        let result = destination
            .loader
            .load(
                object,
                &destination.table,
                destination.declared.as_ref(),
                destination.disposition,
            )
            .await
            .context(LoadSnafu {
                pipeline: &self.name,
                object: object.url(),
                table: destination.table.to_string(),
            })?;
        Ok(Some(result))
    }

    /// Reject log failures never fail the run.
    async fn write_rejects(
        &self,
        id: &str,
        skipped: &[SkippedRecord],
    ) -> Option<Path> {
        let log = self.rejects.as_ref()?;
        match log.write(id, &self.run_token, skipped).await {
            Ok(path) => path,
            Err(e) => {
                error!(
                    pipeline = %self.name,
                    count = skipped.len(),
                    error = %e,
                    "Failed to write reject log"
                );
                None
            }
        }
    }
}

/// Assembles a [`PipelineRun`] from parts.
pub struct PipelineRunBuilder {
    name: String,
    run_token: RunToken,
    input: Option<RunInput>,
    staging: Option<StagingSink>,
    staging_prefix: Option<String>,
    destination: Option<Destination>,
    rejects: Option<RejectLog>,
}

impl PipelineRunBuilder {
    pub fn input(mut self, input: RunInput) -> Self {
        self.input = Some(input);
        self
    }

    pub fn window(self, source: Arc<dyn RelationalSource>, window: ExtractionWindow) -> Self {
        self.input(RunInput::Window { source, window })
    }

    pub fn stream(self, consumer: StreamConsumer) -> Self {
        self.input(RunInput::Stream { consumer })
    }

    pub fn staging(mut self, staging: StagingSink) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn staging_prefix(mut self, prefix: Option<&str>) -> Self {
        self.staging_prefix = prefix.map(str::to_string);
        self
    }

    /// Load staged objects into `table`. Without a destination the run stops
    /// after staging.
    pub fn destination(
        mut self,
        loader: BatchLoader,
        table: TableRef,
        declared: Option<SchemaRef>,
        disposition: CreateDisposition,
    ) -> Self {
        self.destination = Some(Destination {
            loader,
            table,
            declared,
            disposition,
        });
        self
    }

    pub fn reject_log(mut self, rejects: RejectLog) -> Self {
        self.rejects = Some(rejects);
        self
    }

    pub fn build(self) -> Result<PipelineRun, ConfigError> {
        let input = self.input.context(IncompleteRunSnafu {
            pipeline: &self.name,
            missing: "an input",
        })?;
        let staging = self.staging.context(IncompleteRunSnafu {
            pipeline: &self.name,
            missing: "a staging bucket",
        })?;

        if self.rejects.is_some() && matches!(input, RunInput::Window { .. }) {
            warn!(pipeline = %self.name, "Reject log only applies to stream pipelines");
        }

        Ok(PipelineRun {
            name: self.name,
            run_token: self.run_token,
            input,
            staging,
            staging_prefix: self.staging_prefix,
            destination: self.destination,
            rejects: self.rejects,
        })
    }
}

/// Run every configured pipeline concurrently, one task per pipeline.
///
/// Returns each pipeline's result in name order.
pub async fn run_all(
    config: Arc<Config>,
    params: RunParams,
) -> Vec<(String, Result<RunOutcome, RunError>)> {
    let mut tasks = JoinSet::new();

    for name in config.pipelines.keys().cloned() {
        let config = Arc::clone(&config);
        let params = params.clone();
        tasks.spawn(async move {
            let result = match PipelineRun::from_config(&config, &name, params).await {
                Ok(run) => run.execute().await,
                Err(e) => Err(e),
            };
            (name, result)
        });
    }

    join_runs(tasks).await
}

/// Execute already assembled runs concurrently.
///
/// A failing run does not affect the others. Results are in name order.
pub async fn execute_all(
    runs: impl IntoIterator<Item = PipelineRun>,
) -> Vec<(String, Result<RunOutcome, RunError>)> {
    let mut tasks = JoinSet::new();
    for run in runs {
        tasks.spawn(async move {
            let name = run.name().to_string();
            (name, run.execute().await)
        });
    }

    join_runs(tasks).await
}

// Panicked tasks are logged and leave no entry.
async fn join_runs(
    mut tasks: JoinSet<(String, Result<RunOutcome, RunError>)>,
) -> Vec<(String, Result<RunOutcome, RunError>)> {
    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "Pipeline task panicked"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}
