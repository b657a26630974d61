//! Change detection: which catalog records need (re)downloading.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::paths;
use crate::catalog::DatasetRecord;
use crate::state::FailureRecord;
use crate::types::{FilenamePolicy, SelectionRule};

/// A dataset selected for this run, with its resolved output path.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub record: DatasetRecord,
    pub path: PathBuf,
}

/// Criteria for [`select`], held for the duration of a run.
#[derive(Debug, Clone)]
pub struct SelectCriteria<'a> {
    pub theme: &'a str,
    pub rule: SelectionRule,
    pub directory: &'a Path,
    pub filename_policy: FilenamePolicy,
}

/// Select the records that require download, in catalog order.
///
/// A record qualifies when it carries the configured theme
/// (case-insensitive) and a parseable modification time. With no watermark
/// every such record qualifies; otherwise the modification time is compared
/// to the watermark according to `criteria.rule`.
pub fn select(
    catalog: &[DatasetRecord],
    watermark: Option<DateTime<Utc>>,
    criteria: &SelectCriteria<'_>,
) -> Vec<WorkItem> {
    catalog
        .iter()
        .filter(|record| is_selected(record, watermark, criteria.theme, criteria.rule))
        .map(|record| work_item(record, criteria))
        .collect()
}

/// Records that failed in an earlier run and are still in the catalog,
/// excluding any already present in `selected`.
pub fn select_pending(
    catalog: &[DatasetRecord],
    pending: &BTreeMap<String, FailureRecord>,
    selected: &[WorkItem],
    criteria: &SelectCriteria<'_>,
) -> Vec<WorkItem> {
    let already: HashSet<&str> = selected
        .iter()
        .map(|item| item.record.identifier.as_str())
        .collect();
    catalog
        .iter()
        .filter(|record| {
            pending.contains_key(&record.identifier)
                && !already.contains(record.identifier.as_str())
        })
        .map(|record| work_item(record, criteria))
        .collect()
}

fn work_item(record: &DatasetRecord, criteria: &SelectCriteria<'_>) -> WorkItem {
    WorkItem {
        path: paths::output_path(criteria.directory, record, criteria.filename_policy),
        record: record.clone(),
    }
}

fn is_selected(
    record: &DatasetRecord,
    watermark: Option<DateTime<Utc>>,
    theme: &str,
    rule: SelectionRule,
) -> bool {
    if !record.has_theme(theme) {
        return false;
    }
    let Some(raw) = record.modified.as_deref() else {
        tracing::debug!(identifier = %record.identifier, "Skipping dataset without modified date");
        return false;
    };
    let Some(modified) = record.modified_at() else {
        tracing::warn!(
            identifier = %record.identifier,
            modified = raw,
            "Skipping dataset with unparseable modified date"
        );
        return false;
    };
    match (watermark, rule) {
        (None, _) => true,
        (Some(mark), SelectionRule::ModifiedBefore) => modified < mark,
        (Some(mark), SelectionRule::ModifiedSince) => modified >= mark,
    }
}
