//! Error types for the state store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or persisting sync state.
#[derive(Error, Debug)]
pub enum StateError {
    /// The state file exists but could not be read.
    #[error("Failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The state file is not a valid state document.
    #[error("State file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The new state could not be durably written. The previous file is left
    /// in place.
    #[error("Failed to persist state to {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Another run holds the lock for this state file.
    #[error("Another catalog-sync run is using {path}")]
    Locked { path: PathBuf },

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}
