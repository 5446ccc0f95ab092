//! FNV-1a feature-hashing engines.
//!
//! Deterministic lexical embeddings with no model files: each word and each
//! character trigram is FNV-1a hashed into a bucket, with a second hash bit
//! choosing the sign. Always available, so they serve as the fast tier and
//! as the test backend. Two registered dimensionalities (`light` 256,
//! `wide` 1024) exercise the dimension-mismatch recovery path without any
//! ML dependency.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::error::Result;
use crate::search::ann_index::l2_normalize;
use crate::search::embedder::{EmbeddingEngine, EngineInfo};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Batch size above which encoding fans out across the rayon pool.
const PARALLEL_BATCH_THRESHOLD: usize = 64;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub struct HashEngine {
    info: EngineInfo,
    loaded: AtomicBool,
}

impl HashEngine {
    pub fn new(info: EngineInfo) -> Self {
        Self {
            info,
            loaded: AtomicBool::new(false),
        }
    }

    fn embed_one(&self, text: &str, normalize: bool) -> Vec<f32> {
        let dim = self.info.dimension;
        let mut vec = vec![0.0f32; dim];

        let lowered = text.to_lowercase();
        for word in lowered.split_whitespace() {
            accumulate(&mut vec, word.as_bytes());
            let chars: Vec<char> = word.chars().collect();
            for window in chars.windows(3) {
                let gram: String = window.iter().collect();
                accumulate(&mut vec, gram.as_bytes());
            }
        }

        if normalize {
            l2_normalize(&mut vec);
        }
        vec
    }
}

fn accumulate(vec: &mut [f32], token: &[u8]) {
    let hash = fnv1a(token);
    let bucket = (hash % vec.len() as u64) as usize;
    // One more hash bit decides the sign, keeping the expectation centered.
    let sign = if (hash >> 63) & 1 == 1 { -1.0 } else { 1.0 };
    vec[bucket] += sign;
}

impl EmbeddingEngine for HashEngine {
    fn info(&self) -> EngineInfo {
        self.info
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn load(&self) -> Result<()> {
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn unload(&self) {
        self.loaded.store(false, Ordering::Release);
    }

    fn encode(&self, texts: &[String], normalize: bool) -> Result<Vec<Vec<f32>>> {
        self.load()?;
        let vectors = if texts.len() >= PARALLEL_BATCH_THRESHOLD {
            texts
                .par_iter()
                .map(|t| self.embed_one(t, normalize))
                .collect()
        } else {
            texts.iter().map(|t| self.embed_one(t, normalize)).collect()
        };
        Ok(vectors)
    }
}
