use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

/// Title used when a record carries none.
const UNTITLED: &str = "untitled";

/// One downloadable representation of a dataset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Distribution {
    #[serde(default, rename = "downloadURL")]
    pub download_url: Option<String>,
    #[serde(default, rename = "mediaType")]
    pub media_type: Option<String>,
}

impl Distribution {
    /// Whether the download URL points at a CSV file. The query string and
    /// fragment are ignored and the extension match is case-insensitive.
    pub fn is_csv(&self) -> bool {
        let Some(url) = self.download_url.as_deref() else {
            return false;
        };
        let path = url.split(['?', '#']).next().unwrap_or(url);
        path.len() >= 4
            && path
                .get(path.len() - 4..)
                .is_some_and(|ext| ext.eq_ignore_ascii_case(".csv"))
    }
}

/// A dataset entry from the metastore listing. Read-only input to the sync
/// engine.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRecord {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "theme")]
    pub themes: Vec<String>,
    /// Raw `modified` value as published. See [`DatasetRecord::modified_at`].
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default, rename = "distribution")]
    pub distributions: Vec<Distribution>,
}

impl DatasetRecord {
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(UNTITLED)
    }

    /// Case-insensitive theme membership.
    pub fn has_theme(&self, theme: &str) -> bool {
        self.themes
            .iter()
            .any(|t| t.trim().to_lowercase() == theme.to_lowercase())
    }

    /// Parsed last-modified instant, `None` when absent or unparseable.
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified.as_deref().and_then(parse_instant)
    }

    /// First distribution with a CSV download URL, in catalog order.
    pub fn csv_distribution(&self) -> Option<&Distribution> {
        self.distributions.iter().find(|d| d.is_csv())
    }
}

/// Parse a catalog or state timestamp into a UTC instant.
///
/// Accepts RFC 3339 (`Z` or a numeric offset), naive ISO datetimes (taken as
/// UTC, with optional fractional seconds) and bare dates (midnight UTC).
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    None
}
