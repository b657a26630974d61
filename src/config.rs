use std::path::PathBuf;
use std::time::Duration;

use crate::cli::SyncArgs;
use crate::retry::RetryConfig;
use crate::sync::SyncConfig;
use crate::types::{FilenamePolicy, SelectionRule};

/// Upper bound for the exponential retry backoff.
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Application configuration for a sync run.
#[derive(Debug, Clone)]
pub struct Config {
    pub catalog_url: String,
    pub directory: PathBuf,
    pub state_file: PathBuf,
    pub theme: String,

    pub timeout: Duration,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    pub threads_num: u16,

    pub selection_rule: SelectionRule,
    pub filename_policy: FilenamePolicy,

    pub retry_failed: bool,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_sync_args(args: SyncArgs, retry_failed: bool) -> anyhow::Result<Self> {
        let theme = args.theme.trim().to_string();
        if theme.is_empty() {
            anyhow::bail!("--theme must not be empty");
        }
        if args.timeout_secs == 0 {
            anyhow::bail!("--timeout-secs must be at least 1");
        }

        Ok(Self {
            catalog_url: args.catalog_url,
            directory: expand_tilde(&args.directory),
            state_file: expand_tilde(&args.state.state_file),
            theme,
            timeout: Duration::from_secs(args.timeout_secs),
            retry_delay_secs: args.retry_delay,
            max_retries: args.max_retries,
            threads_num: args.threads_num,
            selection_rule: args.selection_rule,
            filename_policy: args.filename_policy,
            retry_failed,
            dry_run: args.dry_run,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_secs: self.retry_delay_secs,
            max_delay_secs: MAX_RETRY_DELAY_SECS,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            directory: self.directory.clone(),
            theme: self.theme.clone(),
            selection_rule: self.selection_rule,
            filename_policy: self.filename_policy,
            concurrency: usize::from(self.threads_num),
            retry_failed: self.retry_failed,
            dry_run: self.dry_run,
            no_progress_bar: self.no_progress_bar,
        }
    }
}
