//! catalog-sync: incremental downloader for CMS Provider Data datasets.
//!
//! Lists the public metastore, picks hospital datasets whose modification
//! date passes the change filter, downloads their CSV distributions with
//! bounded concurrency and rewrites the header row into snake_case. A JSON
//! state file records the watermark of the last completed run.

#![warn(clippy::all)]

mod catalog;
mod cli;
mod config;
pub mod retry;
mod shutdown;
mod state;
mod sync;
mod types;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use state::{JsonStateStore, StateStore};

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let state_path = config::expand_tilde(&args.state.state_file);
    if !state_path.exists() {
        println!("No state file found at {}", state_path.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let state = JsonStateStore::new(&state_path).load().await?;

    println!("State file: {}", state_path.display());
    println!();
    match &state.watermark {
        Some(mark) => println!("Watermark:  {}", mark.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Watermark:  none"),
    }
    println!("Files:      {}", state.materialized_files.len());
    println!("Failed:     {}", state.failed.len());

    if let Some(last) = &state.last_sync {
        println!();
        println!(
            "Last sync started:   {}",
            last.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!(
            "Last sync completed: {}",
            last.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!(
            "  {} selected, {} written, {} failed, {} rows",
            last.selected, last.succeeded, last.failed, last.rows_written
        );
    }

    if args.failed && !state.failed.is_empty() {
        println!();
        println!("Failed datasets:");
        for (identifier, failure) in &state.failed {
            println!(
                "  {} ({}) - {} [{}]",
                failure.title,
                identifier,
                failure.cause,
                failure.failed_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    Ok(())
}

/// Run the reset-state command.
async fn run_reset_state(args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let store = JsonStateStore::new(config::expand_tilde(&args.state.state_file));

    if !store.path().exists() {
        println!("No state file found at {}", store.path().display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the state file at:");
        println!("  {}", store.path().display());
        println!("The next sync will select every matching dataset.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let _lock = store.lock().await?;
    store.remove().await?;
    println!("State file deleted.");
    Ok(())
}

/// Run the verify command. Exits 1 when any recorded file is missing or
/// fails its checksum.
async fn run_verify(args: cli::VerifyArgs) -> anyhow::Result<()> {
    let state_path = config::expand_tilde(&args.state.state_file);
    if !state_path.exists() {
        println!("No state file found at {}", state_path.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let state = JsonStateStore::new(&state_path).load().await?;
    println!(
        "Verifying {} downloaded files...",
        state.materialized_files.len()
    );
    println!();

    let mut missing = 0;
    let mut corrupted = 0;
    let mut unchecked = 0;
    let mut verified = 0;

    for recorded in &state.materialized_files {
        let local_path = PathBuf::from(recorded);
        if !local_path.exists() {
            println!("MISSING: {}", local_path.display());
            missing += 1;
            continue;
        }

        if !args.checksums {
            verified += 1;
            continue;
        }

        let Some(expected) = state.checksums.get(recorded) else {
            println!("NO CHECKSUM: {}", local_path.display());
            unchecked += 1;
            continue;
        };
        match verify_checksum(&local_path, expected).await {
            Ok(true) => verified += 1,
            Ok(false) => {
                println!("CORRUPTED: {}", local_path.display());
                corrupted += 1;
            }
            Err(e) => {
                println!("ERROR: {} - {}", local_path.display(), e);
                corrupted += 1;
            }
        }
    }

    println!();
    println!("Results:");
    println!("  Verified:  {}", verified);
    println!("  Missing:   {}", missing);
    if args.checksums {
        println!("  Corrupted: {}", corrupted);
        println!("  Unchecked: {}", unchecked);
    }

    if missing > 0 || corrupted > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Verify a file's SHA256 checksum.
async fn verify_checksum(path: &Path, expected: &str) -> anyhow::Result<bool> {
    use sha2::{Digest, Sha256};

    let path = path.to_path_buf();
    let expected = expected.to_string();

    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        let computed: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(computed.eq_ignore_ascii_case(&expected))
    })
    .await?
}

/// Run the sync and retry-failed commands.
async fn run_sync(args: cli::SyncArgs, retry_failed: bool) -> anyhow::Result<()> {
    let config = config::Config::from_sync_args(args, retry_failed)?;
    tracing::info!(
        concurrency = config.threads_num,
        directory = %config.directory.display(),
        theme = %config.theme,
        "Starting catalog-sync"
    );

    let store = JsonStateStore::new(&config.state_file);
    let lock = store.lock().await.with_context(|| {
        format!(
            "another sync appears to be using {}",
            config.state_file.display()
        )
    })?;
    tracing::debug!(lock = %lock.path().display(), "State lock acquired");

    let client = reqwest::Client::builder()
        .user_agent(concat!("catalog-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let catalog = catalog::HttpCatalog::new(client.clone(), &config.catalog_url, config.timeout);
    let fetcher = sync::HttpFetcher::new(client, config.timeout, config.retry());

    let shutdown_token = shutdown::install_signal_handler()?;

    let result = sync::sync_once(
        &catalog,
        &store,
        &fetcher,
        &config.sync_config(),
        shutdown_token,
    )
    .await?;

    match result {
        sync::SyncResult::Completed(report) => {
            sync::log_summary(&report);
            if report.summary.failed > 0 {
                tracing::warn!(
                    "{} datasets failed; run `catalog-sync retry-failed` to retry them",
                    report.summary.failed
                );
            }
        }
        sync::SyncResult::DryRun { planned } => {
            tracing::info!("[DRY RUN] {} datasets would be downloaded", planned.len());
        }
    }

    drop(lock);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.effective_command() {
        Command::Sync(args) => run_sync(args, false).await,
        Command::RetryFailed(args) => run_sync(args, true).await,
        Command::Status(args) => run_status(args).await,
        Command::Verify(args) => run_verify(args).await,
        Command::ResetState(args) => run_reset_state(args).await,
    }
}
