//! depotsync — Depot manifest synchronization tool.
//!
//! Mirrors depot manifests from a content-delivery relay to local disk,
//! decrypting filenames, canonicalizing the contents and recording the
//! depot decryption keys per application.
//!
//! # Usage
//!
//! ```bash
//! # Fetch one depot generation
//! depotsync fetch --server http://relay:8080 --app-id 10 --depot-id 11 --manifest-gid 12
//!
//! # Fetch a batch of depot generations from a task file
//! depotsync batch --server http://relay:8080 --tasks tasks.json
//!
//! # Show cached manifests and stored keys for an application
//! depotsync info --app-id 10
//! ```

mod remote;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use depotsync_core::{
    DepotTask, ExternalCrcTool, FetchOutcome, KeyStore, Manifest, ManifestFetcher, RetryPolicy,
    SkipReason, TaskReport, DEFAULT_CRC_TOOL,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "depotsync")]
#[command(author = "DepotSync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Depot manifest synchronization tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct FetchOpts {
    /// Relay base URL (e.g. http://relay:8080)
    #[arg(short, long)]
    server: String,

    /// Output directory for the depot tree
    #[arg(short, long, default_value = "depots")]
    output: String,

    /// Give up on a depot after this many acquire attempts
    /// (default: retry indefinitely)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Delay between acquire attempts in milliseconds (0 yields instead)
    #[arg(long, default_value_t = 0)]
    backoff_ms: u64,

    /// Checksum utility invoked against written manifest files
    #[arg(long, default_value = DEFAULT_CRC_TOOL)]
    crc_tool: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch one depot manifest generation
    Fetch {
        #[command(flatten)]
        opts: FetchOpts,

        /// Application id
        #[arg(long)]
        app_id: u32,

        /// Depot id
        #[arg(long)]
        depot_id: u32,

        /// Manifest generation id
        #[arg(long)]
        manifest_gid: u64,
    },

    /// Fetch a batch of depot generations listed in a JSON task file
    Batch {
        #[command(flatten)]
        opts: FetchOpts,

        /// Task file: JSON array of {app_id, depot_id, manifest_gid}
        #[arg(short, long)]
        tasks: String,
    },

    /// Display cached manifests and stored keys for an application
    Info {
        /// Application id
        #[arg(long)]
        app_id: u32,

        /// Output directory for the depot tree
        #[arg(short, long, default_value = "depots")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("depotsync_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch {
            opts,
            app_id,
            depot_id,
            manifest_gid,
        } => {
            cmd_fetch(
                opts,
                DepotTask {
                    app_id,
                    depot_id,
                    manifest_gid,
                },
            )
            .await
        }

        Commands::Batch { opts, tasks } => cmd_batch(opts, tasks).await,

        Commands::Info { app_id, output } => cmd_info(app_id, output).await,
    }
}

fn build_fetcher(opts: &FetchOpts) -> ManifestFetcher {
    let server = Arc::new(remote::HttpContentServer::new(&opts.server));
    let crc = Arc::new(ExternalCrcTool::new(&opts.crc_tool));
    ManifestFetcher::new(server, crc, &opts.output).with_policy(RetryPolicy {
        max_attempts: opts.max_attempts,
        backoff: Duration::from_millis(opts.backoff_ms),
    })
}

async fn cmd_fetch(opts: FetchOpts, task: DepotTask) -> Result<()> {
    let fetcher = build_fetcher(&opts);
    let report = fetcher.fetch(task).await;
    print_report(&report);
    if report.failed() {
        return Err(anyhow!("Fetch failed"));
    }
    Ok(())
}

async fn cmd_batch(opts: FetchOpts, tasks_path: String) -> Result<()> {
    let data = std::fs::read_to_string(&tasks_path)
        .with_context(|| format!("Failed to read task file {}", tasks_path))?;
    let tasks: Vec<DepotTask> =
        serde_json::from_str(&data).with_context(|| "Failed to parse task file JSON")?;

    if tasks.is_empty() {
        println!("Task file is empty, nothing to do.");
        return Ok(());
    }

    println!("Fetching {} depot manifests...", tasks.len());
    let fetcher = Arc::new(build_fetcher(&opts));
    let reports = fetcher.fetch_all(tasks).await;

    let mut completed = 0u32;
    let mut cached = 0u32;
    let mut denied = 0u32;
    let mut failed = 0u32;
    for report in &reports {
        print_report(report);
        match report.outcome {
            FetchOutcome::Completed => completed += 1,
            FetchOutcome::Skipped(SkipReason::AlreadyPresent) => cached += 1,
            FetchOutcome::Skipped(SkipReason::AccessDenied) => denied += 1,
            FetchOutcome::Failed(_) => failed += 1,
        }
    }

    println!("\nBatch completed:");
    println!("  Fetched:   {}", completed);
    println!("  Cached:    {}", cached);
    println!("  No access: {}", denied);
    println!("  Failed:    {}", failed);

    if failed > 0 {
        return Err(anyhow!("{} of {} tasks failed", failed, reports.len()));
    }
    Ok(())
}

async fn cmd_info(app_id: u32, output: String) -> Result<()> {
    let app_dir = Path::new(&output).join(app_id.to_string());
    if !app_dir.exists() {
        println!("No data for app {} under {}", app_id, output);
        return Ok(());
    }

    println!("App {}:", app_id);

    let mut entries: Vec<_> = std::fs::read_dir(&app_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "manifest").unwrap_or(false))
        .collect();
    entries.sort();

    println!("\nManifests ({}):", entries.len());
    for path in entries {
        let data = std::fs::read(&path)?;
        match Manifest::deserialize(&data) {
            Ok(m) => {
                let created = chrono::DateTime::from_timestamp(m.metadata.creation_time, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| m.metadata.creation_time.to_string());
                println!(
                    "  depot {:<10} gid {:<20} files {:<6} crc_clear {:<10} created {}",
                    m.depot_id,
                    m.gid,
                    m.mappings.len(),
                    m.metadata.crc_clear,
                    created
                );
            }
            Err(e) => {
                println!("  {} (unreadable: {})", path.display(), e);
            }
        }
    }

    let store = KeyStore::new(&output);
    let record = store.load(app_id)?;
    println!("\nDepot keys ({}):", record.depots.len());
    for (depot_id, key) in &record.depots {
        println!("  depot {:<10} DecryptionKey {}", depot_id, key);
    }

    Ok(())
}

fn print_report(report: &TaskReport) {
    let status = match &report.outcome {
        FetchOutcome::Completed => "fetched".to_string(),
        FetchOutcome::Skipped(SkipReason::AlreadyPresent) => "cached".to_string(),
        FetchOutcome::Skipped(SkipReason::AccessDenied) => "no access".to_string(),
        FetchOutcome::Failed(e) => format!("FAILED: {}", e),
    };
    println!(
        "  {} -> {} ({} attempts, {}ms)",
        report.task, status, report.attempts, report.duration_ms
    );
}
