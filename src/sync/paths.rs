//! Output and temp file locations for materialized datasets.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::catalog::DatasetRecord;
use crate::types::FilenamePolicy;

/// Extension of every materialized dataset.
pub const OUTPUT_EXTENSION: &str = "csv";

/// Build the local path for a dataset under `directory`.
///
/// The file stem is the title with each whitespace character replaced by
/// `_`. Titles that differ only in whitespace or in stripped characters map
/// to the same path; the orchestrator rejects such collisions within a run.
pub fn output_path(directory: &Path, record: &DatasetRecord, policy: FilenamePolicy) -> PathBuf {
    let mut stem = sanitize_title(record.title());
    if policy == FilenamePolicy::TitleId {
        let id = clean_filename(&record.identifier);
        if !id.is_empty() {
            stem.push('_');
            stem.push_str(&id);
        }
    }
    directory.join(format!("{stem}.{OUTPUT_EXTENSION}"))
}

/// Title to file stem: whitespace becomes `_`, filesystem-invalid characters
/// are removed. Falls back to `untitled` when nothing is left.
pub fn sanitize_title(title: &str) -> String {
    let replaced: String = title
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    let clean = clean_filename(&replaced);
    if clean.is_empty() || clean.chars().all(|c| c == '.') {
        "untitled".to_string()
    } else {
        clean
    }
}

/// Remove characters that are invalid on common filesystems: `/`, `\`, `:`,
/// `*`, `?`, `"`, `<`, `>`, `|` and control characters.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| {
            !c.is_control() && !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
        })
        .collect()
}

/// Hidden `.part` sibling used while a dataset is being written.
///
/// Derived from the dataset identifier so two datasets never share a temp
/// file, even if their final paths collide.
pub fn temp_path(path: &Path, identifier: &str) -> PathBuf {
    let digest = Sha256::digest(identifier.as_bytes());
    let tag: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{tag}.part"))
}
