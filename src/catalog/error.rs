use thiserror::Error;

/// Failure of the bulk catalog listing. Always fatal to a run: without the
/// listing there is no way to tell which datasets changed.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request to {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("catalog at {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("catalog response from {url} is not a dataset listing: {source}")]
    Json {
        url: String,
        source: serde_json::Error,
    },
}
