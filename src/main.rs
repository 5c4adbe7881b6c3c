//! autodetect-ingest - anomaly-detection result ingester
//!
//! Reads one job's result stream from a file or stdin and persists it.
//!
//! # Usage
//!
//! ```bash
//! # Ingest a results file into ./data/results.db
//! autodetect-ingest --job-id farequote --input results.json
//!
//! # Pipe the engine's output straight in, keeping results in memory
//! autodetect_engine | autodetect-ingest --job-id farequote --in-memory
//! ```
//!
//! # Environment Variables
//!
//! - `INGEST_CONFIG`: Path to an `ingest_config.toml`
//! - `RUST_LOG`: Logging level (default: info)
//! - `RESET_DB`: Set to "true" to wipe the job's stored results on startup

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use autodetect_ingest::config::{self, IngestConfig};
use autodetect_ingest::pipeline::{DispatchStats, LoggingAlertObserver, ResultProcessor};
use autodetect_ingest::renormalizer::{QueueRenormalizer, Renormalizer, ScoreUpdater};
use autodetect_ingest::storage::{InMemorySink, JobLock, PersistenceSink, SledResultsStore};
use autodetect_ingest::types::Quantiles;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "autodetect-ingest")]
#[command(about = "Ingest anomaly-detection results for one job")]
#[command(version)]
struct CliArgs {
    /// Results file to read; stdin when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Job id (overrides the config file)
    #[arg(long)]
    job_id: Option<String>,

    /// Data directory for the results store and job lock (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Rescore each partition separately
    #[arg(long)]
    per_partition: bool,

    /// Keep results in memory instead of the sled store
    #[arg(long)]
    in_memory: bool,

    /// Wipe the job's stored results before starting.
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,

    /// Config file (skips the INGEST_CONFIG / ./ingest_config.toml search)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

fn reset_results_store(store: &SledResultsStore, job_id: &str, path: &Path) -> Result<()> {
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("  RESET_DB DETECTED - WIPING STORED RESULTS");
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("  Job: {} | Store: {}", job_id, path.display());

    store.reset().context("Failed to reset results store")?;

    warn!("  Stored results removed. The job starts from an empty store.");
    Ok(())
}

fn load_config(args: &CliArgs) -> Result<IngestConfig> {
    let mut cfg = match &args.config {
        Some(path) => IngestConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => IngestConfig::load(),
    };

    if let Some(job_id) = &args.job_id {
        cfg.job_id.clone_from(job_id);
    }
    if let Some(data_dir) = &args.data_dir {
        cfg.data_dir.clone_from(data_dir);
    }
    if args.per_partition {
        cfg.per_partition_normalization = true;
    }

    cfg.validate()?;
    Ok(cfg)
}

// ============================================================================
// Collaborators
// ============================================================================

/// Score updater for standalone runs: there is no engine to rescore with,
/// so updates are only reported.
struct LoggingScoreUpdater {
    job_id: String,
}

impl ScoreUpdater for LoggingScoreUpdater {
    fn update(&self, quantiles: &Quantiles, per_partition: bool) -> Result<()> {
        info!(
            job_id = %self.job_id,
            quantiles_timestamp = quantiles.timestamp,
            state_bytes = quantiles.quantile_state.len(),
            per_partition,
            "Quantiles updated, persisted scores are due for renormalization"
        );
        Ok(())
    }
}

/// Open the configured sink, resetting it first when asked.
///
/// Also returns the newest stored quantiles, if any, so renormalization
/// resumes from where the previous run left off.
fn open_sink(
    cfg: &IngestConfig,
    in_memory: bool,
    reset: bool,
) -> Result<(Arc<dyn PersistenceSink>, Option<Quantiles>)> {
    if in_memory {
        info!("Results kept in memory (--in-memory)");
        let sink = InMemorySink::new().with_processing_time_smoothing(cfg.processing_time_smoothing);
        return Ok((Arc::new(sink), None));
    }
    let path = cfg.results_db_path();
    let store = SledResultsStore::open(&path, &cfg.job_id)
        .with_context(|| format!("Failed to open results store {}", path.display()))?
        .with_processing_time_smoothing(cfg.processing_time_smoothing);
    if reset {
        reset_results_store(&store, &cfg.job_id, &path)?;
    }
    let seed = store
        .latest_quantiles()
        .context("Failed to read stored quantiles")?;
    Ok((Arc::new(store), seed))
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn Read + Send>> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            info!(path = %path.display(), "Reading results from file");
            Ok(Box::new(BufReader::new(file)))
        }
        None => {
            info!("Reading results from stdin");
            Ok(Box::new(io::stdin()))
        }
    }
}

fn print_stats(job_id: &str, stats: &DispatchStats) {
    match serde_json::to_string_pretty(stats) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(job_id, error = %e, "Failed to render run statistics"),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let cfg = load_config(&args)?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  autodetect-ingest");
    info!("  Job: {} | Data: {}", cfg.job_id, cfg.data_dir.display());
    info!(
        "  Per-partition: {} | Alerts: {}",
        cfg.per_partition_normalization,
        cfg.alerts.len()
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    config::init(cfg);
    let cfg = config::get();

    // The reset only runs once this process holds the job
    let lock = JobLock::acquire(&cfg.data_dir, &cfg.job_id)?;
    let (sink, seed) = open_sink(cfg, args.in_memory, should_reset_db(args.reset_db))?;
    let renormalizer: Arc<dyn Renormalizer> = Arc::new(
        QueueRenormalizer::start(
            &cfg.job_id,
            cfg.renormalizer_queue_capacity,
            Arc::new(LoggingScoreUpdater {
                job_id: cfg.job_id.clone(),
            }),
        )
        .context("Failed to start renormalizer")?,
    );

    let processor = ResultProcessor::new(cfg.job_id.clone(), sink, Arc::clone(&renormalizer))
        .with_job_lock(lock);
    if !cfg.alerts.is_empty() {
        processor.alerts().add(Arc::new(LoggingAlertObserver::new(
            cfg.job_id.clone(),
            cfg.alerts.clone(),
        )));
    }

    let input = open_input(args.input.as_deref())?;
    let per_partition = cfg.per_partition_normalization;
    let processor = Arc::new(processor);
    let worker = {
        let processor = Arc::clone(&processor);
        tokio::task::spawn_blocking(move || {
            if let Some(quantiles) = seed {
                info!(
                    job_id = %processor.job_id(),
                    quantiles_timestamp = quantiles.timestamp,
                    "Resuming renormalization from stored quantiles"
                );
                if per_partition {
                    renormalizer.renormalise_with_partition(&quantiles);
                } else {
                    renormalizer.renormalise(&quantiles);
                }
            }
            processor.run(input, per_partition)
        })
    };

    tokio::select! {
        joined = worker => {
            match joined.context("Result processor task panicked")? {
                Ok(stats) => {
                    print_stats(&cfg.job_id, &stats);
                    Ok(())
                }
                Err(e) => {
                    error!(job_id = %cfg.job_id, error = %e, "Result stream aborted");
                    Err(e.into())
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            // A blocking read cannot be interrupted; the lock file is left
            // behind and is cleared as stale on the next start.
            warn!(job_id = %cfg.job_id, "Interrupted, exiting before the stream ended");
            std::process::exit(130);
        }
    }
}
