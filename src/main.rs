//! rivulet: scheduled window extracts and stream micro-batches into Delta tables.
//!
//! Each invocation performs one run per pipeline: extract or consume, stage a
//! single object in blob storage, and append it to the destination table.
//! Scheduling and retries belong to the caller.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use rivulet::config::{Config, PipelineKind};
use rivulet::error::{
    AddressParseSnafu, CliError, ConfigSnafu, MetricsSnafu, RunSnafu, RunsFailedSnafu,
};
use rivulet::metrics;
use rivulet::pipeline::{PipelineRun, RunOutcome, RunParams, run_all};
use rivulet::serialize::PayloadFormat;
use rivulet::staging::{RunToken, StageOutcome, object_path};

/// Windowed extracts and stream micro-batches into Delta tables.
#[derive(Parser, Debug)]
#[command(name = "rivulet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = "rivulet.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one pipeline once.
    Run {
        /// Pipeline name from the configuration.
        #[arg(short, long)]
        pipeline: String,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Run every configured pipeline once, concurrently.
    RunAll {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Validate the configuration and print what each pipeline would do.
    Validate {
        /// Run token used to show staging object keys.
        #[arg(long, default_value = "RUN_TOKEN")]
        run_token: String,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Logical run time supplied by the scheduler, used in object keys.
    #[arg(long)]
    run_token: String,

    /// Inclusive window start (RFC 3339). Required for window pipelines.
    #[arg(long, requires = "end")]
    start: Option<DateTime<Utc>>,

    /// Exclusive window end (RFC 3339).
    #[arg(long, requires = "start")]
    end: Option<DateTime<Utc>>,
}

impl RunArgs {
    fn params(&self) -> Result<RunParams, CliError> {
        Ok(RunParams {
            run_token: RunToken::parse(&self.run_token).context(ConfigSnafu)?,
            window: self.start.zip(self.end),
        })
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), CliError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if config.metrics.enabled && !matches!(args.command, Command::Validate { .. }) {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    match &args.command {
        Command::Run { pipeline, run } => {
            let run = PipelineRun::from_config(&config, pipeline, run.params()?)
                .await
                .context(RunSnafu)?;
            let outcome = run.execute().await.context(RunSnafu)?;
            print_outcome(pipeline, &outcome);
            Ok(())
        }
        Command::RunAll { run } => {
            let total = config.pipelines.len();
            let results = run_all(Arc::new(config), run.params()?).await;
            // Panicked tasks produce no result.
            let mut failed = total - results.len();
            for (name, result) in &results {
                match result {
                    Ok(outcome) => print_outcome(name, outcome),
                    Err(e) => {
                        failed += 1;
                        error!(pipeline = %name, error = %e, "Pipeline failed");
                    }
                }
            }
            ensure!(failed == 0, RunsFailedSnafu { failed, total });
            Ok(())
        }
        Command::Validate { run_token } => validate(&config, run_token),
    }
}

fn print_outcome(pipeline: &str, outcome: &RunOutcome) {
    let report = outcome.report();
    match outcome {
        RunOutcome::Empty(_) => info!(pipeline, "No new data; nothing staged or loaded"),
        RunOutcome::Completed(_) => {
            info!(pipeline, "Run completed");
            info!("  Records: {}", report.records);
            info!("  Skipped: {}", report.skipped);
            if let StageOutcome::Staged(object) = &report.staged {
                info!("  Staged: {}", object);
            }
            if let Some(load) = &report.load {
                info!("  Loaded: {}", load);
            }
        }
    }
}

fn validate(config: &Config, run_token: &str) -> Result<(), CliError> {
    let token = RunToken::parse(run_token).context(ConfigSnafu)?;

    info!("Staging: {}", config.staging.url);
    info!("Warehouse: {}", config.warehouse.url);
    for (name, pipeline) in &config.pipelines {
        let table = config.destination_table(name).context(ConfigSnafu)?;
        let (id, format) = match pipeline.kind(name).context(ConfigSnafu)? {
            PipelineKind::Window(window) => {
                info!(
                    "Pipeline {name}: window {}.{} on {}",
                    window.schema, window.table, window.time_column
                );
                (window.table.as_str(), PayloadFormat::Csv)
            }
            PipelineKind::Stream(stream) => {
                info!(
                    "Pipeline {name}: topic {} as {} (idle {}s)",
                    stream.topic, stream.group_id, stream.idle_timeout_secs
                );
                (
                    stream.topic.as_str(),
                    PayloadFormat::NewlineDelimitedJson,
                )
            }
        };
        info!(
            "  Object: {}",
            object_path(pipeline.staging_prefix(), id, &token, format)
        );
        if pipeline.load {
            info!("  Destination: {table} ({format})");
        } else {
            info!("  Destination: none (stage only)");
        }
    }
    info!("Configuration is valid");
    Ok(())
}
