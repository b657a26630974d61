//! Types for the state store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::catalog::parse_instant;

/// Durable record of what previous runs achieved.
///
/// `last_run` and `downloaded_files` are accepted as aliases so a
/// `metadata.json` written by the older Python script loads unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Start instant of the most recent completed run. `None` before the
    /// first one.
    #[serde(default, alias = "last_run", deserialize_with = "deserialize_instant")]
    pub watermark: Option<DateTime<Utc>>,

    /// Every file path written successfully, across all runs.
    #[serde(default, alias = "downloaded_files")]
    pub materialized_files: BTreeSet<String>,

    /// SHA-256 (hex) of each materialized file as last written.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksums: BTreeMap<String, String>,

    /// Datasets whose most recent attempt failed, keyed by identifier.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failed: BTreeMap<String, FailureRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<SyncRunRecord>,
}

/// Last failure recorded for a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub title: String,
    pub cause: String,
    pub failed_at: DateTime<Utc>,
}

/// Statistics for one completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rows_written: u64,
}

impl SyncState {
    /// Fold a successful write into the inventory. Clears any earlier failure
    /// for the same dataset.
    pub fn record_success(&mut self, identifier: &str, path: String, checksum: String) {
        self.failed.remove(identifier);
        self.checksums.insert(path.clone(), checksum);
        self.materialized_files.insert(path);
    }

    pub fn record_failure(
        &mut self,
        identifier: &str,
        title: &str,
        cause: String,
        failed_at: DateTime<Utc>,
    ) {
        self.failed.insert(
            identifier.to_string(),
            FailureRecord {
                title: title.to_string(),
                cause,
                failed_at,
            },
        );
    }

    /// Drop pending failures whose identifier `keep` rejects. Returns how many
    /// were removed.
    pub fn prune_failed(&mut self, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.failed.len();
        self.failed.retain(|identifier, _| keep(identifier));
        before - self.failed.len()
    }
}

fn deserialize_instant<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| {
        parse_instant(&s).ok_or_else(|| D::Error::custom(format!("invalid timestamp '{s}'")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_default_state_is_empty() {
        let state = SyncState::default();
        assert!(state.watermark.is_none());
        assert!(state.materialized_files.is_empty());
        assert!(state.failed.is_empty());
        assert!(state.last_sync.is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let mut state = SyncState {
            watermark: Some(Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()),
            ..Default::default()
        };
        state.record_success("a", "out/A.csv".into(), "ff".into());
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["watermark"], json!("2024-02-01T12:00:00Z"));
        assert_eq!(value["materialized_files"], json!(["out/A.csv"]));
        assert!(value.get("failed").is_none());
        assert!(value.get("last_sync").is_none());
    }

    #[test]
    fn test_null_watermark_round_trips() {
        let state: SyncState =
            serde_json::from_value(json!({"watermark": null, "materialized_files": []}))
                .unwrap();
        assert_eq!(state, SyncState::default());
    }

    #[test]
    fn test_loads_legacy_metadata() {
        let state: SyncState = serde_json::from_value(json!({
            "last_run": "2025-03-04T05:06:07.891011",
            "downloaded_files": [
                "cms_hospital_datasets/A.csv",
                "cms_hospital_datasets/A.csv",
                "cms_hospital_datasets/B.csv"
            ]
        }))
        .unwrap();
        let watermark = state.watermark.unwrap();
        assert_eq!(
            watermark.date_naive(),
            chrono::NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
        );
        assert_eq!(state.materialized_files.len(), 2);
    }

    #[test]
    fn test_rejects_invalid_watermark() {
        let result: Result<SyncState, _> =
            serde_json::from_value(json!({"watermark": "yesterday"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_success_clears_failure() {
        let mut state = SyncState::default();
        let now = Utc::now();
        state.record_failure("a", "A", "HTTP 500".into(), now);
        assert!(state.failed.contains_key("a"));
        state.record_success("a", "out/A.csv".into(), "00".into());
        assert!(state.failed.is_empty());
        assert!(state.materialized_files.contains("out/A.csv"));
        assert_eq!(state.checksums["out/A.csv"], "00");
    }

    #[test]
    fn test_prune_failed() {
        let mut state = SyncState::default();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        state.record_failure("a", "A", "HTTP 500".into(), at);
        state.record_failure("b", "B", "HTTP 500".into(), at);
        assert_eq!(state.prune_failed(|id| id == "a"), 1);
        assert_eq!(state.failed.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(state.prune_failed(|_| true), 0);
    }

    #[test]
    fn test_materialized_files_append_only_set() {
        let mut state = SyncState::default();
        state.record_success("a", "out/A.csv".into(), "01".into());
        state.record_success("a", "out/A.csv".into(), "02".into());
        state.record_success("b", "out/B.csv".into(), "03".into());
        assert_eq!(state.materialized_files.len(), 2);
        assert_eq!(state.checksums["out/A.csv"], "02");
    }
}
