//! Embedding engine contract.
//!
//! Engines are cheap to construct and lazily loaded: `load()` does the
//! expensive work, is idempotent, and may fail with `TmError::ModelLoad`.
//! `encode` loads on first use, so callers that never embed (a tier-1 hash
//! hit, for instance) never touch the model.

use crate::error::Result;

/// Engine metadata, for display and the persisted metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    /// Short name used for selection (e.g. "light", "deep").
    pub name: &'static str,
    /// Unique id recorded in persisted artifacts (e.g. "fnv1a-256").
    pub id: &'static str,
    pub dimension: usize,
    /// True for ML backends, false for deterministic lexical hashing.
    pub is_semantic: bool,
}

/// A pluggable embedding backend.
///
/// Implementations are `Send + Sync`: one engine instance is shared
/// process-wide and may serve concurrent `encode` calls.
pub trait EmbeddingEngine: Send + Sync {
    fn info(&self) -> EngineInfo;

    fn is_loaded(&self) -> bool;

    /// Load the backing model. Idempotent; a second call on a loaded engine
    /// is a no-op. Fails with `TmError::ModelLoad` and is not retried
    /// internally.
    fn load(&self) -> Result<()>;

    /// Release the backing model. A later `load()` reinitializes it.
    fn unload(&self);

    /// Encode a batch of texts into `f32` vectors of [`EngineInfo::dimension`]
    /// components. When `normalize` is set, each vector is L2-normalized so
    /// inner product equals cosine similarity. Loads the engine on first use.
    fn encode(&self, texts: &[String], normalize: bool) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize {
        self.info().dimension
    }
}
