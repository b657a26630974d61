//! Incremental sync engine.
//!
//! A run selects the datasets that changed relative to the saved watermark,
//! fetches them with bounded concurrency, and folds the outcomes into a new
//! [`SyncState`]. Workers never touch run state: each outcome flows back
//! through the stream to a single consumer, and the state is only returned to
//! the caller once every selected dataset has been attempted.

pub mod error;
pub mod fetch;
pub mod filter;
pub mod normalize;
pub mod paths;

use std::collections::{BTreeMap, HashMap};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::catalog::{DatasetRecord, HttpCatalog};
use crate::state::{StateStore, SyncRunRecord, SyncState};
use crate::types::{FilenamePolicy, SelectionRule};

pub use error::{FailureKind, FetchError, SyncError};
pub use fetch::{FetchOutcome, Fetcher, HttpFetcher};
pub use filter::{select, select_pending, SelectCriteria, WorkItem};

/// Default number of datasets fetched concurrently.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Subset of application config consumed by the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub(crate) directory: PathBuf,
    pub(crate) theme: String,
    pub(crate) selection_rule: SelectionRule,
    pub(crate) filename_policy: FilenamePolicy,
    pub(crate) concurrency: usize,
    pub(crate) retry_failed: bool,
    pub(crate) dry_run: bool,
    pub(crate) no_progress_bar: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("cms_hospital_datasets"),
            theme: "hospitals".to_string(),
            selection_rule: SelectionRule::default(),
            filename_policy: FilenamePolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            retry_failed: false,
            dry_run: false,
            no_progress_bar: true,
        }
    }
}

impl SyncConfig {
    fn criteria(&self) -> SelectCriteria<'_> {
        SelectCriteria {
            theme: &self.theme,
            rule: self.selection_rule,
            directory: &self.directory,
            filename_policy: self.filename_policy,
        }
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rows_written: u64,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    pub elapsed: Duration,
}

/// A completed run: the state to persist plus every per-dataset outcome.
#[derive(Debug)]
pub struct RunReport {
    pub state: SyncState,
    pub outcomes: Vec<FetchOutcome>,
    pub summary: RunSummary,
}

/// What [`sync_once`] did.
#[derive(Debug)]
pub enum SyncResult {
    Completed(RunReport),
    DryRun { planned: Vec<WorkItem> },
}

/// Work set for this run: changed datasets, plus earlier failures when
/// retrying them.
pub fn plan(catalog: &[DatasetRecord], state: &SyncState, config: &SyncConfig) -> Vec<WorkItem> {
    let criteria = config.criteria();
    let mut items = select(catalog, state.watermark, &criteria);
    if config.retry_failed {
        let pending = select_pending(catalog, &state.failed, &items, &criteria);
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Retrying previously failed datasets");
        }
        items.extend(pending);
    }
    items
}

/// Split off items whose output path was already claimed by an earlier item
/// in the same run. The first claimant keeps the path.
fn reject_collisions(items: Vec<WorkItem>) -> (Vec<WorkItem>, Vec<FetchOutcome>) {
    let mut claimed: HashMap<PathBuf, String> = HashMap::new();
    let mut accepted = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for item in items {
        if let Some(owner) = claimed.get(&item.path) {
            tracing::error!(
                identifier = %item.record.identifier,
                path = %item.path.display(),
                claimed_by = %owner,
                "Output path collision",
            );
            let cause = FetchError::PathCollision {
                path: item.path.clone(),
                claimed_by: owner.clone(),
            };
            rejected.push(FetchOutcome::failure(&item, cause));
        } else {
            claimed.insert(item.path.clone(), item.record.identifier.clone());
            accepted.push(item);
        }
    }
    (accepted, rejected)
}

/// Progress bar with a consistent template; hidden when disabled or when
/// stdout is not a terminal (cron, systemd timers).
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    match ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        Ok(style) => pb.set_style(style.progress_chars("=> ")),
        Err(e) => tracing::debug!("Invalid progress template: {}", e),
    }
    pb
}

/// Run the engine over `catalog` starting from `state`.
///
/// Every selected dataset yields exactly one outcome. The returned state has
/// its watermark set to `started_at`, whatever the individual outcomes.
/// `started_at` must not be later than the moment `catalog` was requested,
/// otherwise a dataset republished in between would fall below the next
/// watermark. If `shutdown` fires at any point, the run is abandoned with
/// [`SyncError::Cancelled`] and no state is returned.
pub async fn run(
    catalog: &[DatasetRecord],
    state: &SyncState,
    fetcher: &dyn Fetcher,
    config: &SyncConfig,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
) -> Result<RunReport, SyncError> {
    let started = Instant::now();

    let items = plan(catalog, state, config);
    let selected = items.len();
    tracing::info!(selected, "Found {} new or updated datasets", selected);

    let (items, mut outcomes) = reject_collisions(items);
    outcomes.reserve(items.len());

    let pb = create_progress_bar(config.no_progress_bar, selected as u64);
    pb.inc(outcomes.len() as u64);

    let concurrency = config.concurrency.max(1);
    let dispatch_token = shutdown.clone();
    let mut results = stream::iter(items)
        .take_while(move |_| std::future::ready(!dispatch_token.is_cancelled()))
        .map(|item| async move { fetcher.fetch(&item).await })
        .buffer_unordered(concurrency);

    while let Some(outcome) = results.next().await {
        match &outcome {
            FetchOutcome::Success {
                path, row_count, ..
            } => {
                pb.suspend(|| {
                    tracing::info!(rows = row_count, "Wrote {}", path.display());
                });
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    pb.set_message(name.to_string());
                }
            }
            FetchOutcome::Failure {
                identifier, cause, ..
            } => {
                pb.suspend(|| {
                    tracing::error!(identifier = %identifier, "Dataset failed: {}", cause);
                });
            }
        }
        outcomes.push(outcome);
        pb.inc(1);
    }
    pb.finish_and_clear();

    if shutdown.is_cancelled() || outcomes.len() < selected {
        tracing::warn!(
            completed = outcomes.len(),
            selected,
            "Run interrupted before all datasets were attempted"
        );
        return Err(SyncError::Cancelled {
            completed: outcomes.len(),
            selected,
        });
    }

    let completed_at = Utc::now();
    let summary = summarize(&outcomes, started.elapsed());
    let mut state = reconcile(state, &outcomes, started_at, completed_at, &summary);
    let pruned = state.prune_failed(|id| {
        catalog
            .iter()
            .any(|r| r.identifier == id && r.has_theme(&config.theme))
    });
    if pruned > 0 {
        tracing::info!(pruned, "Dropped failures for datasets no longer in the catalog");
    }
    Ok(RunReport {
        state,
        outcomes,
        summary,
    })
}

/// Fold the outcomes of a finished run into a copy of the prior state.
fn reconcile(
    prior: &SyncState,
    outcomes: &[FetchOutcome],
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    summary: &RunSummary,
) -> SyncState {
    let mut state = prior.clone();
    for outcome in outcomes {
        match outcome {
            FetchOutcome::Success {
                identifier,
                path,
                checksum,
                ..
            } => {
                state.record_success(identifier, path.display().to_string(), checksum.clone());
            }
            FetchOutcome::Failure {
                identifier,
                title,
                cause,
            } => {
                state.record_failure(identifier, title, cause.to_string(), completed_at);
            }
        }
    }
    state.watermark = Some(started_at);
    state.last_sync = Some(SyncRunRecord {
        started_at,
        completed_at,
        selected: summary.selected,
        succeeded: summary.succeeded,
        failed: summary.failed,
        rows_written: summary.rows_written,
    });
    state
}

fn summarize(outcomes: &[FetchOutcome], elapsed: Duration) -> RunSummary {
    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    let mut summary = RunSummary {
        selected: outcomes.len(),
        succeeded,
        failed: outcomes.len() - succeeded,
        elapsed,
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            FetchOutcome::Success { row_count, .. } => summary.rows_written += row_count,
            FetchOutcome::Failure { cause, .. } => {
                *summary.failures_by_kind.entry(cause.kind()).or_default() += 1;
            }
        }
    }
    summary
}

/// One full sync cycle: load state, list the catalog, run, save.
///
/// State is saved only after [`run`] returns a completed report. A catalog
/// failure, a cancelled run or a dry run leave the state file untouched.
pub async fn sync_once(
    catalog: &HttpCatalog,
    store: &dyn StateStore,
    fetcher: &dyn Fetcher,
    config: &SyncConfig,
    shutdown: CancellationToken,
) -> Result<SyncResult, SyncError> {
    let started_at = Utc::now();
    let state = store.load().await?;
    match &state.watermark {
        Some(mark) => tracing::info!("Last completed run started at {}", mark.to_rfc3339()),
        None => tracing::info!("No previous run recorded, selecting every matching dataset"),
    }

    tracing::info!("Fetching catalog from {}", catalog.url());
    let records = catalog.list_datasets().await?;
    tracing::info!(total = records.len(), "Catalog listed");

    if config.dry_run {
        let planned = plan(&records, &state, config);
        for item in &planned {
            tracing::info!(
                identifier = %item.record.identifier,
                "[DRY RUN] Would download {}",
                item.path.display()
            );
        }
        return Ok(SyncResult::DryRun { planned });
    }

    let report = run(&records, &state, fetcher, config, started_at, shutdown).await?;
    store.save(&report.state).await?;
    Ok(SyncResult::Completed(report))
}

/// Log the end-of-run summary in the same shape for every run.
pub fn log_summary(report: &RunReport) {
    let summary = &report.summary;
    tracing::info!("── Summary ──");
    tracing::info!(
        "  {} written, {} failed, {} selected",
        summary.succeeded,
        summary.failed,
        summary.selected
    );
    tracing::info!("  {} data rows written", summary.rows_written);
    tracing::info!("  elapsed: {}", format_duration(summary.elapsed));
    for (kind, count) in &summary.failures_by_kind {
        tracing::warn!("  {}: {}", kind, count);
    }
    for outcome in &report.outcomes {
        if let FetchOutcome::Failure {
            identifier,
            title,
            cause,
        } = outcome
        {
            tracing::warn!("  {} ({}): {}", title, identifier, cause);
        }
    }
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
