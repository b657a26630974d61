//! Column header normalization.

/// Map a raw column label to a lower-case snake_case identifier.
///
/// Characters other than ASCII letters, digits, whitespace and `_` are
/// dropped, the result is trimmed and lower-cased, and each internal run of
/// whitespace becomes a single `_`. Keeping `_` makes the mapping idempotent.
/// Distinct labels may map to the same identifier; that is not detected here.
pub fn normalize(label: &str) -> String {
    let kept: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    kept.split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}
