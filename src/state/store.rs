//! State store trait and JSON file implementation.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::fs_std::FileExt;

use super::error::StateError;
use super::types::SyncState;

/// Load and persist [`SyncState`].
///
/// Object-safe so callers can hold `&dyn StateStore`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state. A missing state is not an error and yields
    /// [`SyncState::default`].
    async fn load(&self) -> Result<SyncState, StateError>;

    /// Replace the saved state. Either the new state is fully written or the
    /// previous one stays in place.
    async fn save(&self, state: &SyncState) -> Result<(), StateError>;
}

/// State stored as pretty-printed JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

/// Exclusive advisory lock on a state file, released on drop.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, "lock")
    }

    fn temp_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, "tmp")
    }

    /// Take the per-state-file lock so two scheduled runs cannot interleave
    /// their load/save cycles.
    pub async fn lock(&self) -> Result<StateLock, StateError> {
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| StateError::Persist {
                    path: lock_path.clone(),
                    source,
                })?;
            }
            let file = File::create(&lock_path).map_err(|source| StateError::Persist {
                path: lock_path.clone(),
                source,
            })?;
            file.try_lock_exclusive()
                .map_err(|_| StateError::Locked {
                    path: lock_path.clone(),
                })?;
            Ok(StateLock {
                _file: file,
                path: lock_path,
            })
        })
        .await?
    }

    /// Delete the state file. Returns whether a file was removed.
    pub async fn remove(&self) -> Result<bool, StateError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Persist {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<SyncState, StateError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No state file, starting fresh");
                return Ok(SyncState::default());
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&contents).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, state: &SyncState) -> Result<(), StateError> {
        let mut json = serde_json::to_vec_pretty(state)?;
        json.push(b'\n');

        let path = self.path.clone();
        let temp = self.temp_path();
        tokio::task::spawn_blocking(move || {
            write_atomic(&path, &temp, &json).map_err(|source| {
                let _ = std::fs::remove_file(&temp);
                StateError::Persist { path, source }
            })
        })
        .await??;

        tracing::debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}

/// Write to `temp`, flush to disk, then rename over `path`.
fn write_atomic(path: &Path, temp: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(temp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(temp, path)
}

/// `metadata.json` -> `metadata.json.<suffix>` in the same directory.
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
