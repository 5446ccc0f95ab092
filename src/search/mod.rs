//! Search stack: text normalization, embedding engines, vector indexes,
//! and the tiered cascade that ties them together.

pub mod ann_index;
pub mod cascade;
pub mod embedder;
pub mod embedder_registry;
#[cfg(feature = "ml")]
pub mod fastembed_embedder;
pub mod hash_embedder;
pub mod normalize;
