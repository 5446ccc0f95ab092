//! ONNX-backed ML engine (feature `ml`).
//!
//! Wraps fastembed's MiniLM. The model is loaded lazily behind a mutex;
//! `load()` failures surface as `TmError::ModelLoad` and are not retried.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;

use crate::error::{Result, TmError};
use crate::search::ann_index::l2_normalize;
use crate::search::embedder::{EmbeddingEngine, EngineInfo};

pub struct FastembedEngine {
    info: EngineInfo,
    model: Mutex<Option<TextEmbedding>>,
}

impl FastembedEngine {
    pub fn new(info: EngineInfo) -> Self {
        Self {
            info,
            model: Mutex::new(None),
        }
    }
}

impl EmbeddingEngine for FastembedEngine {
    fn info(&self) -> EngineInfo {
        self.info
    }

    fn is_loaded(&self) -> bool {
        self.model.lock().is_some()
    }

    fn load(&self) -> Result<()> {
        let mut guard = self.model.lock();
        if guard.is_some() {
            return Ok(());
        }
        let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| TmError::ModelLoad(format!("{}: {e}", self.info.id)))?;
        *guard = Some(model);
        tracing::info!(engine = self.info.id, "loaded ML embedding model");
        Ok(())
    }

    fn unload(&self) {
        *self.model.lock() = None;
    }

    fn encode(&self, texts: &[String], normalize: bool) -> Result<Vec<Vec<f32>>> {
        self.load()?;
        let mut guard = self.model.lock();
        let model = guard
            .as_mut()
            .ok_or_else(|| TmError::ModelLoad("model unloaded during encode".into()))?;
        let mut vectors = model
            .embed(texts.to_vec(), None)
            .map_err(|e| TmError::ModelLoad(format!("encode failed: {e}")))?;
        if normalize {
            for vec in &mut vectors {
                l2_normalize(vec);
            }
        }
        Ok(vectors)
    }
}
