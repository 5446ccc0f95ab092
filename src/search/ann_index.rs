//! HNSW-based approximate nearest neighbor index and its on-disk format.
//!
//! Similarity is inner product over L2-normalized vectors (cosine), via
//! `DistDot` which reports `1 - dot`; scores returned here are converted
//! back to similarities. Tuning is fixed: M=32, efConstruction=400,
//! efSearch=500.
//!
//! ## File format (`.tmvi`, little-endian)
//!
//! Header:
//!   Magic: "TMVI" (4 bytes)
//!   Version: u16
//!   EngineID length: u16
//!   EngineID: bytes
//!   Dimension: u32
//!   Count: u32
//!   HeaderCRC32: u32 (CRC32 of header bytes before this field)
//! Vector slab:
//!   Count × Dimension × f32, contiguous.
//!
//! The slab is the durable artifact; the HNSW graph is rebuilt from it on
//! load. That keeps the persisted embeddings and the index one atomic file
//! and sidesteps graph-serialization format churn.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use hnsw_rs::prelude::*;

use crate::error::{Result, TmError};
use crate::model::types::MappingRecord;

pub const TMVI_MAGIC: [u8; 4] = *b"TMVI";
pub const TMVI_VERSION: u16 = 1;

pub const HNSW_M: usize = 32;
pub const HNSW_EF_CONSTRUCTION: usize = 400;
pub const HNSW_EF_SEARCH: usize = 500;
pub const HNSW_MAX_LAYER: usize = 16;

/// Scale a vector to unit L2 norm in place. Zero vectors are left unchanged.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Normalize a batch of vectors in place.
pub fn normalize_vectors(vecs: &mut [Vec<f32>]) {
    for vec in vecs.iter_mut() {
        l2_normalize(vec);
    }
}

/// Cosine similarity between two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// One ANN hit: similarity score and row index into the mapping array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnHit {
    pub score: f32,
    pub row: usize,
}

pub struct AnnIndex {
    hnsw: Hnsw<'static, f32, DistDot>,
    vectors: Vec<Vec<f32>>,
    dimension: usize,
    engine_id: String,
}

impl AnnIndex {
    /// Create an empty index for `dimension`-component vectors.
    pub fn create(dimension: usize, engine_id: &str) -> Self {
        Self {
            hnsw: new_graph(0),
            vectors: Vec::new(),
            dimension,
            engine_id: engine_id.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Persisted vector rows, parallel to the caller's mapping array.
    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    /// Append vectors as new rows. Row ids continue from the current count.
    pub fn add_vectors(&mut self, mut vecs: Vec<Vec<f32>>, normalize: bool) -> Result<()> {
        for vec in &vecs {
            if vec.len() != self.dimension {
                return Err(TmError::DimensionMismatch {
                    persisted: self.dimension,
                    engine: vec.len(),
                });
            }
        }
        if normalize {
            normalize_vectors(&mut vecs);
        }
        let start = self.vectors.len();
        insert_into_graph(&self.hnsw, start, &vecs);
        self.vectors.extend(vecs);
        Ok(())
    }

    /// Approximate top-`k` rows by cosine similarity, best first.
    pub fn search(&self, query: &[f32], k: usize, normalize: bool) -> Result<Vec<AnnHit>> {
        if query.len() != self.dimension {
            return Err(TmError::DimensionMismatch {
                persisted: self.dimension,
                engine: query.len(),
            });
        }
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }

        let mut owned;
        let query = if normalize {
            owned = query.to_vec();
            l2_normalize(&mut owned);
            owned.as_slice()
        } else {
            query
        };

        let neighbours: Vec<Neighbour> = self.hnsw.search(query, k, HNSW_EF_SEARCH);
        Ok(neighbours
            .into_iter()
            .map(|n| AnnHit {
                // DistDot reports 1 - dot; invert back to similarity.
                score: 1.0 - n.distance,
                row: n.d_id,
            })
            .collect())
    }

    /// Write the index to `path` via a temp file and atomic rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        // Temp file in the same directory so the final rename stays on one fs.
        let temp = tempfile::NamedTempFile::new_in(parent)?;
        let mut writer = BufWriter::new(temp);

        let mut header = Vec::new();
        header.extend_from_slice(&TMVI_MAGIC);
        header.extend_from_slice(&TMVI_VERSION.to_le_bytes());
        let id_bytes = self.engine_id.as_bytes();
        let id_len = u16::try_from(id_bytes.len())
            .map_err(|_| TmError::Encode("engine id too long".into()))?;
        header.extend_from_slice(&id_len.to_le_bytes());
        header.extend_from_slice(id_bytes);
        header.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        header.extend_from_slice(&(self.vectors.len() as u32).to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        let crc = hasher.finalize();

        writer.write_all(&header)?;
        writer.write_all(&crc.to_le_bytes())?;

        for vec in &self.vectors {
            for x in vec {
                writer.write_all(&x.to_le_bytes())?;
            }
        }
        writer.flush()?;
        let temp = writer
            .into_inner()
            .map_err(|e| TmError::Io(e.into_error()))?;
        temp.persist(path).map_err(|e| TmError::from(e.error))?;
        tracing::debug!(path = %path.display(), count = self.vectors.len(), "saved vector index");
        Ok(())
    }

    /// Load an index from `path`, rebuilding the HNSW graph from the slab.
    /// Fails with `TmError::NotFound` when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TmError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut header = Vec::new();

        let magic = read_array::<4>(&mut reader, &mut header)?;
        if magic != TMVI_MAGIC {
            return Err(TmError::Decode(format!("invalid TMVI magic: {magic:?}")));
        }
        let version = u16::from_le_bytes(read_array::<2>(&mut reader, &mut header)?);
        if version != TMVI_VERSION {
            return Err(TmError::Decode(format!("unsupported TMVI version: {version}")));
        }
        let id_len = u16::from_le_bytes(read_array::<2>(&mut reader, &mut header)?) as usize;
        let mut id_bytes = vec![0u8; id_len];
        reader.read_exact(&mut id_bytes)?;
        header.extend_from_slice(&id_bytes);
        let engine_id = String::from_utf8(id_bytes)
            .map_err(|_| TmError::Decode("engine id is not valid UTF-8".into()))?;
        let dimension = u32::from_le_bytes(read_array::<4>(&mut reader, &mut header)?) as usize;
        let count = u32::from_le_bytes(read_array::<4>(&mut reader, &mut header)?) as usize;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        let crc_expected = u32::from_le_bytes(crc_bytes);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        let crc_actual = hasher.finalize();
        if crc_actual != crc_expected {
            return Err(TmError::Decode(format!(
                "header CRC mismatch (expected {crc_expected:#010x}, got {crc_actual:#010x})"
            )));
        }

        let mut vectors = Vec::with_capacity(count);
        let mut buf = [0u8; 4];
        for _ in 0..count {
            let mut vec = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                reader.read_exact(&mut buf)?;
                vec.push(f32::from_le_bytes(buf));
            }
            vectors.push(vec);
        }

        let hnsw = new_graph(count);
        insert_into_graph(&hnsw, 0, &vectors);

        Ok(Self {
            hnsw,
            vectors,
            dimension,
            engine_id,
        })
    }

    /// Load `path` if it exists, otherwise create an empty index.
    pub fn load_or_create(path: &Path, dimension: usize, engine_id: &str) -> Result<Self> {
        match Self::load(path) {
            Ok(index) => Ok(index),
            Err(TmError::NotFound(_)) => Ok(Self::create(dimension, engine_id)),
            Err(e) => Err(e),
        }
    }

    /// Load-or-create, append, save. The append-only update path.
    pub fn incremental_add(
        path: &Path,
        new_vecs: Vec<Vec<f32>>,
        dimension: usize,
        engine_id: &str,
        normalize: bool,
    ) -> Result<Self> {
        let mut index = Self::load_or_create(path, dimension, engine_id)?;
        index.add_vectors(new_vecs, normalize)?;
        index.save(path)?;
        Ok(index)
    }

    /// Full rebuild from a vector set, optionally persisted.
    pub fn build(
        vecs: Vec<Vec<f32>>,
        dimension: usize,
        engine_id: &str,
        path: Option<&Path>,
        normalize: bool,
    ) -> Result<Self> {
        let mut index = Self::create(dimension, engine_id);
        index.add_vectors(vecs, normalize)?;
        if let Some(path) = path {
            index.save(path)?;
        }
        Ok(index)
    }
}

impl std::fmt::Debug for AnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnIndex")
            .field("count", &self.vectors.len())
            .field("dimension", &self.dimension)
            .field("engine_id", &self.engine_id)
            .finish()
    }
}

fn new_graph(expected: usize) -> Hnsw<'static, f32, DistDot> {
    // nb_elem is a sizing hint; exceeding it on later appends is fine.
    Hnsw::new(
        HNSW_M,
        expected.max(1024),
        HNSW_MAX_LAYER,
        HNSW_EF_CONSTRUCTION,
        DistDot,
    )
}

fn insert_into_graph(hnsw: &Hnsw<'static, f32, DistDot>, start: usize, vecs: &[Vec<f32>]) {
    if vecs.is_empty() {
        return;
    }
    // hnsw_rs keeps references to the inserted data, so hand it 'static
    // slices owned by the graph for the life of the process.
    let items: Vec<(&[f32], usize)> = vecs
        .iter()
        .enumerate()
        .map(|(i, vec)| {
            let leaked: &'static [f32] = Box::leak(vec.clone().into_boxed_slice());
            (leaked, start + i)
        })
        .collect();
    hnsw.parallel_insert_slice(&items);
}

fn read_array<const N: usize>(reader: &mut impl Read, header: &mut Vec<u8>) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    header.extend_from_slice(&buf);
    Ok(buf)
}

/// An ANN index and its parallel mapping array, kept in lockstep.
///
/// Every mutation goes through [`VectorStore::add`], which enforces the
/// row-count invariant, so index row `i` always resolves to `mapping[i]`.
pub struct VectorStore {
    index: AnnIndex,
    mapping: Vec<MappingRecord>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("index", &self.index)
            .field("mapping_len", &self.mapping.len())
            .finish()
    }
}

impl VectorStore {
    pub fn create(dimension: usize, engine_id: &str) -> Self {
        Self {
            index: AnnIndex::create(dimension, engine_id),
            mapping: Vec::new(),
        }
    }

    /// Pair a loaded index with its loaded mapping, verifying alignment.
    pub fn new(index: AnnIndex, mapping: Vec<MappingRecord>) -> Result<Self> {
        if index.len() != mapping.len() {
            return Err(TmError::Decode(format!(
                "vector index has {} rows but mapping has {}",
                index.len(),
                mapping.len()
            )));
        }
        Ok(Self { index, mapping })
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    pub fn index(&self) -> &AnnIndex {
        &self.index
    }

    pub fn mapping(&self) -> &[MappingRecord] {
        &self.mapping
    }

    /// Append vectors with their records. Lengths must match.
    pub fn add(
        &mut self,
        vecs: Vec<Vec<f32>>,
        records: Vec<MappingRecord>,
        normalize: bool,
    ) -> Result<()> {
        if vecs.len() != records.len() {
            return Err(TmError::Encode(format!(
                "adding {} vectors with {} mapping records",
                vecs.len(),
                records.len()
            )));
        }
        self.index.add_vectors(vecs, normalize)?;
        self.mapping.extend(records);
        debug_assert_eq!(self.index.len(), self.mapping.len());
        Ok(())
    }

    /// Top-`k` records by cosine similarity. The query is L2-normalized.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(f32, &MappingRecord)>> {
        let hits = self.index.search(query, k, true)?;
        Ok(hits
            .into_iter()
            .map(|hit| (hit.score, &self.mapping[hit.row]))
            .collect())
    }
}
