use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::state::StateError;

/// Why a single dataset could not be materialized.
///
/// These never abort a run: the orchestrator turns each into a failure
/// outcome and moves on. `is_retryable()` separates transient transport
/// failures from ones a retry cannot fix.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no CSV distribution")]
    NoEligibleDistribution,

    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("payload is not valid CSV: {0}")]
    Decode(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("output path {path} is already claimed by dataset {claimed_by}")]
    PathCollision { path: PathBuf, claimed_by: String },
}

/// Coarse failure category used in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureKind {
    NoEligibleDistribution,
    Transport,
    Decode,
    Write,
    PathCollision,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::NoEligibleDistribution => "no eligible distribution",
            FailureKind::Transport => "transport error",
            FailureKind::Decode => "decode error",
            FailureKind::Write => "write error",
            FailureKind::PathCollision => "path collision",
        })
    }
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::NoEligibleDistribution => FailureKind::NoEligibleDistribution,
            FetchError::Transport { .. } | FetchError::HttpStatus { .. } => FailureKind::Transport,
            FetchError::Decode(_) => FailureKind::Decode,
            FetchError::Write { .. } => FailureKind::Write,
            FetchError::PathCollision { .. } => FailureKind::PathCollision,
        }
    }

    /// Whether another attempt could plausibly succeed: rate limiting,
    /// server errors and connection-level failures (including timeouts).
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            FetchError::Transport { .. } => true,
            FetchError::NoEligibleDistribution
            | FetchError::Decode(_)
            | FetchError::Write { .. }
            | FetchError::PathCollision { .. } => false,
        }
    }
}

/// Errors that end a run without saving state.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(#[from] CatalogError),

    #[error(transparent)]
    Persistence(#[from] StateError),

    #[error("run cancelled after {completed} of {selected} datasets; state not saved")]
    Cancelled { completed: usize, selected: usize },
}
