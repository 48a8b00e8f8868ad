use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use dflow_core::error::Result;
use dflow_core::{
    CancelToken, ChunkMode, Dflow, DflowError, Item, JobOptions, JobRegistry,
    ProcessingError, Workspace, DEFAULT_ITEMS_PER_CHUNK, DEFAULT_QUEUE_LIMIT,
};

#[derive(Parser)]
#[command(author, version, about = "dflowdev CLI (alpha)", long_about = None)]
struct Cli {
    /// Directory holding index and ledger files
    #[arg(long, default_value = ".dflow")]
    workspace: PathBuf,

    /// Job registry file
    #[arg(long, default_value = "dflows.json")]
    registry: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a file, register it as a job
    Create {
        file: PathBuf,

        #[arg(long, default_value_t = DEFAULT_ITEMS_PER_CHUNK)]
        chunk_size: u64,

        /// byte | line | token | csv
        #[arg(long, default_value = "line")]
        mode: String,

        /// Item delimiter (token mode only)
        #[arg(long, default_value = "\n")]
        delimiter: String,
    },

    /// List registered jobs
    List,

    /// Per-status chunk counts for one job
    Status { fingerprint: String },

    /// Process a job's chunks with the built-in pass-through step
    Run {
        fingerprint: String,

        #[arg(long, default_value_t = DEFAULT_QUEUE_LIMIT)]
        queue_limit: usize,
    },

    /// Flip every Failed chunk back to Pending
    RequeueFailed { fingerprint: String },

    /// Drop a job from the registry (its ledger and index stay on disk)
    Remove { fingerprint: String },
}

/// Default per-chunk step: every item passes through unchanged, csv rows
/// re-joined with commas.
fn pass_through(items: &[Item]) -> std::result::Result<Vec<String>, ProcessingError> {
    Ok(items
        .iter()
        .map(|item| match item {
            Item::Text(s) => s.clone(),
            Item::Record(fields) => fields.join(","),
        })
        .collect())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let ws = Workspace::open(&cli.workspace)?;
    let mut registry = JobRegistry::load(&cli.registry)?;

    match cli.command {
        Commands::Create {
            file,
            chunk_size,
            mode,
            delimiter,
        } => {
            let opts = JobOptions {
                mode: ChunkMode::from_str(&mode)?,
                delimiter: delimiter.into_bytes(),
                items_per_chunk: chunk_size,
                queue_limit: DEFAULT_QUEUE_LIMIT,
            };
            let job = Dflow::create(&ws, &file, opts)?;
            let entry = job
                .entry()
                .expect("locally created jobs always have an entry");
            let fingerprint = entry.fingerprint.clone();
            let total_chunks = entry.total_chunks;
            if registry.add(entry)? {
                println!("created {fingerprint} ({total_chunks} chunks)");
            } else {
                println!("already registered: {fingerprint}");
            }
        }

        Commands::List => {
            for entry in registry.list() {
                println!(
                    "{}  {}  mode={} chunks={} chunk_size={}",
                    entry.fingerprint,
                    entry.filepath.display(),
                    entry.mode,
                    entry.total_chunks,
                    entry.chunk_size
                );
            }
        }

        Commands::Status { fingerprint } => {
            let entry = find(&registry, &fingerprint)?;
            let job = Dflow::from_entry(&ws, entry, DEFAULT_QUEUE_LIMIT)?;
            let (pending, done, failed) = job.ledger().status_counts();
            println!(
                "{}: {} chunks total, {} unassigned, {} pending, {} done, {} failed",
                fingerprint,
                job.total_chunks(),
                job.unused_len(),
                pending,
                done,
                failed
            );
        }

        Commands::Run {
            fingerprint,
            queue_limit,
        } => {
            let entry = find(&registry, &fingerprint)?;
            let mut job = Dflow::from_entry(&ws, entry, queue_limit)?;
            let summary = job.run(&pass_through, &CancelToken::new())?;
            println!("{} done, {} failed", summary.done, summary.failed);
        }

        Commands::RequeueFailed { fingerprint } => {
            let entry = find(&registry, &fingerprint)?;
            let mut job = Dflow::from_entry(&ws, entry, DEFAULT_QUEUE_LIMIT)?;
            let requeued = job.requeue_failed()?;
            println!("{} chunks requeued", requeued.len());
        }

        Commands::Remove { fingerprint } => {
            if registry.remove(&fingerprint)? {
                println!("removed {fingerprint}");
            } else {
                println!("not found: {fingerprint}");
            }
        }
    }

    Ok(())
}

fn find<'a>(registry: &'a JobRegistry, fingerprint: &str) -> Result<&'a dflow_core::JobEntry> {
    registry
        .get_by_fingerprint(fingerprint)
        .ok_or_else(|| DflowError::Config(format!("no registered job {fingerprint}")))
}
