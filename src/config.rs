//! Data-directory layout and process-wide engine selection.
//!
//! The current engine name is shared mutable state for the whole process,
//! guarded by a `parking_lot::RwLock`. Changing it affects only *subsequent*
//! resolutions through the registry; components hold the `Arc` they were
//! constructed with, so in-flight encodes are unaffected.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::search::embedder_registry::DEFAULT_ENGINE;

static CURRENT_ENGINE: Lazy<RwLock<String>> =
    Lazy::new(|| RwLock::new(DEFAULT_ENGINE.to_string()));

/// Name of the engine new resolutions will use.
pub fn current_engine_name() -> String {
    CURRENT_ENGINE.read().clone()
}

/// Select the engine used by subsequent registry resolutions.
///
/// The name is not validated here; `embedder_registry::resolve` rejects
/// unknown names with `TmError::Configuration`.
pub fn set_current_engine_name(name: &str) {
    let mut guard = CURRENT_ENGINE.write();
    *guard = name.to_string();
}

/// Platform data directory (`~/.local/share/tm-search` on Linux).
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "tm-search", "tm-search")
        .expect("project dirs available")
        .data_dir()
        .to_path_buf()
}

pub fn default_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("tm_store.db")
}

/// Directory holding the persisted index bundle for one TM.
pub fn tm_index_dir(data_dir: &Path, tm_id: &str) -> PathBuf {
    data_dir.join("tm").join(tm_id)
}
