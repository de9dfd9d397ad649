//! zeroone pipeline driver
//!
//! Runs the stages of the zero/one equation pipeline from the command line:
//! - `generate`: run the solver for every missing shell
//! - `canonicalize`: dedup available shells into per-degree artifacts
//! - `verify`: prove every pending artifact infeasible with the engine
//! - `export-scripts`: write engine scripts for offline runs
//! - `status`: print progress as JSON
//!
//! ## Configuration
//!
//! Environment variables:
//! - `ZEROONE_*`: see [`zeroone_pipeline::config`]
//! - `RUST_LOG`: Log level filter (default: zeroone=info,zeroone_pipeline=info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for terminals (default: pretty)
//!
//! ## Usage
//!
//! ```bash
//! zeroone --jobs 7 --max-degree 12 canonicalize
//! ```
//!
//! Exit status is 2 when a counterexample is found, 1 on any other failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use zeroone_pipeline::pool::default_capacity;
use zeroone_pipeline::{EngineCommand, Pipeline, PipelineConfig, PipelineError};

#[derive(Parser)]
#[command(name = "zeroone")]
#[command(author, version, about = "Canonicalize and verify zero/one quadratic equation systems")]
#[command(propagate_version = true)]
struct Cli {
    /// Concurrent child processes (default: available parallelism - 1)
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Highest degree to process (default: unbounded)
    #[arg(long, global = true)]
    max_degree: Option<u32>,

    /// JSON configuration file
    #[arg(long, global = true, env = "ZEROONE_CONFIG")]
    config: Option<PathBuf>,

    /// Shell and canonical artifact directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verified artifact directory
    #[arg(long, global = true)]
    verified_dir: Option<PathBuf>,

    /// Engine command line, e.g. "M2 --script"
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Systems per engine script
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the solver for every missing shell, in degree order
    Generate,

    /// Deduplicate available shells into per-degree canonical artifacts
    Canonicalize,

    /// Verify pending canonical artifacts with the algebra engine
    Verify,

    /// Write engine scripts for pending artifacts without running them
    ExportScripts,

    /// Print pipeline progress as JSON
    Status,
}

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "zeroone=info,zeroone_pipeline=info".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, PipelineError> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
        config.canonical_dir = dir.clone();
    }
    if let Some(dir) = &cli.verified_dir {
        config.verified_dir = dir.clone();
    }
    if let Some(engine) = &cli.engine {
        config.engine = EngineCommand::parse(engine).ok_or_else(|| {
            zeroone_pipeline::ConfigError::Invalid(format!("empty engine command {:?}", engine))
        })?;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }

    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<(), PipelineError> {
    let config = load_config(&cli)?;
    let jobs = cli.jobs.unwrap_or_else(default_capacity);
    let pipeline = Pipeline::new(config, jobs, cli.max_degree);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        run_id = %pipeline.run_id(),
        jobs,
        max_degree = ?cli.max_degree,
        "Starting zeroone"
    );

    match cli.command {
        Commands::Generate => {
            let summary = pipeline.generate()?;
            for failure in &summary.job_failures {
                error!(job = failure.id(), error = %failure, "Shell not generated");
            }
        }
        Commands::Canonicalize => {
            pipeline.canonicalize()?;
        }
        Commands::Verify => {
            let report = pipeline.verify()?;
            info!(
                verified = report.verified.len(),
                systems = report.systems,
                isolated_batches = report.isolated_batches,
                "Verification finished"
            );
        }
        Commands::ExportScripts => {
            for (path, queries) in pipeline.export_scripts()? {
                println!("{}\t{}", path.display(), queries);
            }
        }
        Commands::Status => {
            let status = pipeline.status()?;
            let json = serde_json::to_string_pretty(&status).map_err(|e| PipelineError::Io {
                path: PathBuf::from("<stdout>"),
                source: e.into(),
            })?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ PipelineError::CounterexampleFound { .. }) => {
            error!(error = %e, "Pipeline halted");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "Pipeline failed");
            ExitCode::FAILURE
        }
    }
}
