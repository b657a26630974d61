//! Persistent sync state.
//!
//! A single JSON document records the watermark of the last completed run and
//! the inventory of files written so far. It is read once when a run starts
//! and replaced atomically once the run has reconciled every outcome, so the
//! file on disk always describes a whole run.

pub mod error;
pub mod store;
pub mod types;

pub use error::StateError;
pub use store::{JsonStateStore, StateStore};
pub use types::{FailureRecord, SyncRunRecord, SyncState};
