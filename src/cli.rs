use clap::{Args, Parser, Subcommand};

use crate::catalog::DEFAULT_CATALOG_URL;
use crate::types::{FilenamePolicy, LogLevel, SelectionRule};

#[derive(Parser, Debug)]
#[command(
    name = "catalog-sync",
    version,
    about = "Incrementally sync CMS hospital datasets to local CSV files",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Sync options used when no subcommand is given
    #[command(flatten)]
    pub sync: SyncArgs,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download new or updated datasets (default)
    Sync(SyncArgs),
    /// Sync, and also retry datasets that failed in earlier runs
    RetryFailed(SyncArgs),
    /// Show the saved sync state
    Status(StatusArgs),
    /// Check that every recorded file is still present
    Verify(VerifyArgs),
    /// Delete the saved sync state
    ResetState(ResetStateArgs),
}

/// Location of the state file, shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct StateArgs {
    /// Path of the JSON state file
    #[arg(long, default_value = "metadata.json", env = "CATALOG_SYNC_STATE_FILE")]
    pub state_file: String,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Catalog metastore URL
    #[arg(long, default_value = DEFAULT_CATALOG_URL, env = "CATALOG_SYNC_URL")]
    pub catalog_url: String,

    /// Local directory for CSV files
    #[arg(short = 'd', long, default_value = "cms_hospital_datasets")]
    pub directory: String,

    /// Theme a dataset must carry to be synced (case-insensitive)
    #[arg(long, default_value = "hospitals")]
    pub theme: String,

    /// Number of concurrent downloads
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u16).range(1..))]
    pub threads_num: u16,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Retries for transient download errors (0 disables retry)
    #[arg(long, default_value_t = 0)]
    pub max_retries: u32,

    /// Base delay in seconds between retries
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// How modification dates are compared to the last run
    #[arg(long, value_enum, default_value = "modified-before")]
    pub selection_rule: SelectionRule,

    /// How output filenames are derived
    #[arg(long, value_enum, default_value = "title")]
    pub filename_policy: FilenamePolicy,

    /// List what would be downloaded without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// List datasets that failed in earlier runs
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Recompute SHA-256 checksums of recorded files
    #[arg(long)]
    pub checksums: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetStateArgs {
    #[command(flatten)]
    pub state: StateArgs,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

impl Cli {
    /// The subcommand to run; bare invocations sync with the top-level args.
    pub fn effective_command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Sync(self.sync.clone()))
    }
}
