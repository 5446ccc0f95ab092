//! Engine registry and process-wide resolution.
//!
//! The registry is the single place engine names are interpreted. Resolved
//! engines are cached per name (lazy-loaded singleton per engine), so every
//! component handed the same name shares one instance.

use std::sync::Arc;

use fxhash::FxHashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config;
use crate::error::{Result, TmError};
use crate::search::embedder::{EmbeddingEngine, EngineInfo};
use crate::search::hash_embedder::HashEngine;

/// Default engine: the lightweight lexical hasher, always available.
pub const DEFAULT_ENGINE: &str = "light";

/// One registry row.
#[derive(Debug, Clone, Copy)]
pub struct RegisteredEngine {
    pub info: EngineInfo,
    pub description: &'static str,
    /// False when the engine cannot be constructed in this build
    /// (e.g. the `ml` feature is compiled out).
    pub available: bool,
}

/// Static table of every engine this build knows about.
pub static ENGINES: &[RegisteredEngine] = &[
    RegisteredEngine {
        info: EngineInfo {
            name: "light",
            id: "fnv1a-256",
            dimension: 256,
            is_semantic: false,
        },
        description: "FNV-1a feature hashing, 256-dim - fast lexical engine, always available",
        available: true,
    },
    RegisteredEngine {
        info: EngineInfo {
            name: "wide",
            id: "fnv1a-1024",
            dimension: 1024,
            is_semantic: false,
        },
        description: "FNV-1a feature hashing, 1024-dim - finer lexical buckets",
        available: true,
    },
    RegisteredEngine {
        info: EngineInfo {
            name: "deep",
            id: "minilm-384",
            dimension: 384,
            is_semantic: true,
        },
        description: "MiniLM L6 v2 via ONNX - semantic engine (feature `ml`)",
        available: cfg!(feature = "ml"),
    },
];

/// Look up a registry row by name or id.
pub fn get(name: &str) -> Option<&'static RegisteredEngine> {
    let lower = name.to_ascii_lowercase();
    ENGINES
        .iter()
        .find(|e| e.info.name == lower || e.info.id == lower)
}

static ENGINE_CACHE: Lazy<Mutex<FxHashMap<&'static str, Arc<dyn EmbeddingEngine>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Resolve a name to a shared engine instance.
///
/// Unknown names fail with `TmError::Configuration`. Resolution never loads
/// the model; that happens on first `encode` (or explicit `load()`).
pub fn resolve(name: &str) -> Result<Arc<dyn EmbeddingEngine>> {
    let registered = get(name).ok_or_else(|| {
        TmError::Configuration(format!(
            "unknown engine '{}'. Known engines: {}",
            name,
            ENGINES
                .iter()
                .map(|e| e.info.name)
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })?;

    if !registered.available {
        return Err(TmError::Configuration(format!(
            "engine '{}' is not available in this build (compile with the `ml` feature)",
            registered.info.name
        )));
    }

    let mut cache = ENGINE_CACHE.lock();
    if let Some(engine) = cache.get(registered.info.name) {
        return Ok(Arc::clone(engine));
    }

    let engine = construct(registered)?;
    cache.insert(registered.info.name, Arc::clone(&engine));
    Ok(engine)
}

/// Resolve the process-wide current engine name.
pub fn resolve_current() -> Result<Arc<dyn EmbeddingEngine>> {
    resolve(&config::current_engine_name())
}

fn construct(registered: &RegisteredEngine) -> Result<Arc<dyn EmbeddingEngine>> {
    match registered.info.name {
        "light" | "wide" => Ok(Arc::new(HashEngine::new(registered.info))),
        #[cfg(feature = "ml")]
        "deep" => Ok(Arc::new(
            crate::search::fastembed_embedder::FastembedEngine::new(registered.info),
        )),
        other => Err(TmError::Configuration(format!(
            "engine '{other}' has no constructor in this build"
        ))),
    }
}
