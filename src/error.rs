//! Typed error taxonomy for the TM engine.
//!
//! The core propagates these with `?`; the CLI converts them into actionable
//! messages. Note that an empty TM is *not* an error: sync reports
//! `status = "empty"` and writes nothing.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TmError {
    /// Invalid engine name or malformed configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The embedding model failed to load. Not retried internally.
    #[error("embedding model failed to load: {0}")]
    ModelLoad(String),

    /// No persisted index bundle exists for the requested TM.
    #[error("no persisted index found at {}", .0.display())]
    NotFound(PathBuf),

    /// Persisted vectors were produced by an engine with a different
    /// dimensionality. Handled internally by a full re-embed; callers of the
    /// public API never see this variant.
    #[error("embedding dimension mismatch: persisted {persisted}, engine {engine}")]
    DimensionMismatch { persisted: usize, engine: usize },

    #[error("entry store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Corrupt or unreadable persisted artifact.
    #[error("failed to decode persisted artifact: {0}")]
    Decode(String),

    #[error("failed to encode artifact: {0}")]
    Encode(String),
}

pub type Result<T, E = TmError> = std::result::Result<T, E>;
