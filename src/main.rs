//! # Evidence Harness CLI (`evsync`)
//!
//! The `evsync` binary drives evidence ingestion from the command line.
//!
//! ## Usage
//!
//! ```bash
//! evsync --config ./config/evsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `evsync init` | Create the SQLite database and run schema migrations |
//! | `evsync sync <case_id>` | Sync all evidence for a case |
//! | `evsync status <job_id>` | Show one sync job with its error log |
//! | `evsync jobs` | List recent sync jobs |
//! | `evsync cancel <job_id>` | Request cancellation of a running job |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use evidence_harness::chunk::Chunker;
use evidence_harness::config::{self, Config};
use evidence_harness::db;
use evidence_harness::embedding;
use evidence_harness::migrate;
use evidence_harness::models::{JobStatus, SyncJob};
use evidence_harness::source::HttpCaseSource;
use evidence_harness::store::Store;
use evidence_harness::sync::SyncOrchestrator;

/// Evidence Harness CLI — ingest forensic case evidence into a local
/// search-ready store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/evsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "evsync",
    about = "Evidence Harness — sync case evidence into a local chunked, embedded store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/evsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Sync all evidence for a case.
    ///
    /// Fetches the case and its evidence list from the configured source,
    /// then extracts, chunks, embeds, and stores each file. Individual file
    /// failures are logged against the job without aborting it.
    Sync {
        /// Upstream case identifier.
        case_id: i64,

        /// Re-chunk and re-embed documents that already exist.
        #[arg(long)]
        force_reindex: bool,

        /// Maximum number of evidence items to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one sync job, including its per-item error log.
    Status {
        /// Sync job UUID.
        job_id: String,
    },

    /// List recent sync jobs, newest first.
    Jobs {
        /// Only show jobs for this case.
        #[arg(long)]
        case_id: Option<i64>,

        /// Only show jobs with this status
        /// (pending, running, completed, completed_with_errors, failed).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of jobs to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Request cancellation of a pending or running job.
    ///
    /// In-flight items are allowed to finish; no new items are started.
    Cancel {
        /// Sync job UUID.
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            case_id,
            force_reindex,
            limit,
        } => {
            let orchestrator = build_orchestrator(&cfg).await?;
            let job = orchestrator.run(case_id, force_reindex, limit).await?;
            print_job(&job, true);
        }
        Commands::Status { job_id } => {
            let store = Store::new(db::connect(&cfg).await?);
            match store.get_job(&job_id).await? {
                Some(job) => print_job(&job, true),
                None => println!("No job found with id {}", job_id),
            }
        }
        Commands::Jobs {
            case_id,
            status,
            limit,
        } => {
            let status = match status.as_deref() {
                Some(s) => Some(
                    JobStatus::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown job status: {}", s))?,
                ),
                None => None,
            };
            let store = Store::new(db::connect(&cfg).await?);
            let jobs = store.list_jobs(case_id, status, limit).await?;
            if jobs.is_empty() {
                println!("No sync jobs found.");
            }
            for job in &jobs {
                print_job(job, false);
            }
        }
        Commands::Cancel { job_id } => {
            let store = Store::new(db::connect(&cfg).await?);
            if store.request_cancel(&job_id).await? {
                println!("Cancellation requested for job {}", job_id);
            } else {
                println!("Job {} is not running (or does not exist).", job_id);
            }
        }
    }

    Ok(())
}

async fn build_orchestrator(cfg: &Config) -> anyhow::Result<SyncOrchestrator> {
    let store = Store::new(db::connect(cfg).await?);
    let source = Arc::new(HttpCaseSource::new(&cfg.case_source)?);
    let embedder = embedding::create_embedder(&cfg.embedding)?;
    let chunker = Chunker::new(cfg.chunking)?;
    Ok(SyncOrchestrator::new(
        store,
        source,
        embedder,
        chunker,
        cfg.embedding.batch_size,
        cfg.sync.max_concurrent_items,
    ))
}

fn print_job(job: &SyncJob, with_errors: bool) {
    println!(
        "{}  case {}  {}  docs: {}  chunks: {}  started: {}  finished: {}",
        job.id,
        job.case_id,
        job.status,
        job.documents_synced,
        job.chunks_created,
        format_ts(job.started_at),
        format_ts(job.completed_at),
    );
    if let Some(message) = &job.error_message {
        println!("  error: {}", message);
    }
    if with_errors && !job.errors.is_empty() {
        println!("  item errors ({}):", job.errors.len());
        for err in &job.errors {
            println!("    [{}] evidence {}: {}", err.stage, err.evidence_id, err.message);
        }
    }
}

fn format_ts(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
