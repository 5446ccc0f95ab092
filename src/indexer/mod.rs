//! Index construction and the on-disk bundle.
//!
//! Each TM owns one directory under `<data_dir>/tm/<tm_id>/` holding seven
//! artifacts:
//!
//!   whole_lookup.bin   normalized whole-text key -> slot (MessagePack)
//!   line_lookup.bin    normalized line key -> record (MessagePack)
//!   whole_mapping.bin  mapping rows parallel to whole.tmvi (MessagePack)
//!   line_mapping.bin   mapping rows parallel to line.tmvi (MessagePack)
//!   whole.tmvi         whole-text vector index
//!   line.tmvi          per-line vector index
//!   metadata.json      bundle metadata, committed LAST
//!
//! Every artifact is written to a temp file and renamed into place, and the
//! metadata record is the commit point: a bundle without metadata.json is
//! treated as absent.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config;
use crate::error::{Result, TmError};
use crate::model::types::{
    IndexMetadata, LineLookupTable, LineRecord, MappingRecord, TmEntry, WholeLookupTable,
    WholeRecord, WholeSlot,
};
use crate::search::ann_index::{AnnIndex, VectorStore};
use crate::search::embedder::EmbeddingEngine;
use crate::search::normalize::{is_blank, normalize_for_embedding, normalize_for_hash,
    normalize_newlines_universal};

pub const FORMAT_VERSION: u32 = 1;

/// Paths to every artifact of one TM's bundle.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub dir: PathBuf,
    pub whole_lookup: PathBuf,
    pub line_lookup: PathBuf,
    pub whole_mapping: PathBuf,
    pub line_mapping: PathBuf,
    pub whole_index: PathBuf,
    pub line_index: PathBuf,
    pub metadata: PathBuf,
}

impl IndexPaths {
    pub fn new(data_dir: &Path, tm_id: &str) -> Self {
        let dir = config::tm_index_dir(data_dir, tm_id);
        Self {
            whole_lookup: dir.join("whole_lookup.bin"),
            line_lookup: dir.join("line_lookup.bin"),
            whole_mapping: dir.join("whole_mapping.bin"),
            line_mapping: dir.join("line_mapping.bin"),
            whole_index: dir.join("whole.tmvi"),
            line_index: dir.join("line.tmvi"),
            metadata: dir.join("metadata.json"),
            dir,
        }
    }

    /// The bundle exists iff its metadata commit record exists.
    pub fn bundle_exists(&self) -> bool {
        self.metadata.exists()
    }
}

/// Versioned wrapper around every MessagePack artifact.
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    format_version: u32,
    payload: T,
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    // Temp file in the same directory so the final rename stays on one fs.
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.persist(path).map_err(|e| TmError::from(e.error))?;
    Ok(())
}

fn write_msgpack<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        payload,
    };
    // Named encoding keeps the internally tagged `WholeSlot` enum decodable.
    let bytes = rmp_serde::to_vec_named(&envelope)
        .map_err(|e| TmError::Encode(format!("{}: {e}", path.display())))?;
    write_atomic(path, &bytes)
}

fn read_msgpack<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(TmError::NotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let envelope: Envelope<T> = rmp_serde::from_slice(&bytes)
        .map_err(|e| TmError::Decode(format!("{}: {e}", path.display())))?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(TmError::Decode(format!(
            "{}: unsupported format version {}",
            path.display(),
            envelope.format_version
        )));
    }
    Ok(envelope.payload)
}

fn write_json_atomic<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(payload)
        .map_err(|e| TmError::Encode(format!("{}: {e}", path.display())))?;
    write_atomic(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(TmError::NotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TmError::Decode(format!("{}: {e}", path.display())))
}

/// Insert one entry into the whole-text table, applying the variation
/// policy: keys where any colliding entry carries a `string_id` accumulate
/// all records as variations; otherwise the last writer wins.
pub fn insert_whole(table: &mut WholeLookupTable, entry: &TmEntry) {
    let key = normalize_for_hash(&entry.source_text);
    let record = WholeRecord::from_entry(entry);
    match table.entry(key) {
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(WholeSlot::Single(record));
        }
        std::collections::hash_map::Entry::Occupied(mut slot) => match slot.get_mut() {
            WholeSlot::Single(existing) => {
                if existing.string_id.is_some() || record.string_id.is_some() {
                    let variations = vec![existing.clone(), record];
                    let source_text = existing.source_text.clone();
                    *slot.get_mut() = WholeSlot::Variations {
                        variations,
                        source_text,
                    };
                } else {
                    *slot.get_mut() = WholeSlot::Single(record);
                }
            }
            WholeSlot::Variations { variations, .. } => variations.push(record),
        },
    }
}

/// Insert one entry's non-blank lines into the line table. First occurrence
/// of a line key wins; target lines pair up by index and default to empty.
pub fn insert_lines(table: &mut LineLookupTable, entry: &TmEntry) {
    let source = normalize_newlines_universal(&entry.source_text);
    let target = normalize_newlines_universal(entry.target_text.as_deref().unwrap_or(""));
    let source_lines: Vec<&str> = source.lines().collect();
    let target_lines: Vec<&str> = target.lines().collect();
    let total_lines = source_lines.len();

    for (line_num, line) in source_lines.iter().enumerate() {
        if is_blank(line) {
            continue;
        }
        let key = normalize_for_hash(line);
        table.entry(key).or_insert_with(|| LineRecord {
            entry_id: entry.id,
            source_line: (*line).to_string(),
            target_line: target_lines.get(line_num).copied().unwrap_or("").to_string(),
            line_num,
            total_lines,
        });
    }
}

/// Build both lookup tables from scratch. Blank-source entries are skipped.
pub fn build_tables(entries: &[TmEntry]) -> (WholeLookupTable, LineLookupTable) {
    let mut whole = WholeLookupTable::default();
    let mut line = LineLookupTable::default();
    for entry in entries {
        if is_blank(&entry.source_text) {
            continue;
        }
        insert_whole(&mut whole, entry);
        insert_lines(&mut line, entry);
    }
    (whole, line)
}

/// Embedding rows for the whole-text index.
///
/// `reuse` maps a normalized source key to a previously persisted vector;
/// hits skip the engine entirely. Returns the mapping rows, their vectors,
/// and (generated, reused) counts.
pub fn whole_embedding_rows(
    engine: &dyn EmbeddingEngine,
    entries: &[TmEntry],
    reuse: Option<&FxHashMap<String, Vec<f32>>>,
) -> Result<(Vec<MappingRecord>, Vec<Vec<f32>>, usize, usize)> {
    let eligible: Vec<&TmEntry> = entries
        .iter()
        .filter(|e| !is_blank(&e.source_text))
        .collect();

    let mut mapping = Vec::with_capacity(eligible.len());
    let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(eligible.len());
    let mut pending_rows = Vec::new();
    let mut pending_texts = Vec::new();
    let mut reused = 0usize;

    for (row, entry) in eligible.iter().enumerate() {
        mapping.push(MappingRecord {
            entry_id: entry.id,
            text: entry.source_text.clone(),
            target_text: entry.target_text.clone(),
            string_id: entry.string_id.clone(),
        });
        let cached = reuse.and_then(|map| map.get(&normalize_for_hash(&entry.source_text)));
        match cached {
            Some(vec) => {
                vectors.push(Some(vec.clone()));
                reused += 1;
            }
            None => {
                vectors.push(None);
                pending_rows.push(row);
                pending_texts.push(normalize_for_embedding(&entry.source_text));
            }
        }
    }

    let generated = pending_texts.len();
    if generated > 0 {
        let fresh = engine.encode(&pending_texts, true)?;
        for (row, vec) in pending_rows.into_iter().zip(fresh) {
            vectors[row] = Some(vec);
        }
    }

    let vectors = vectors
        .into_iter()
        .map(|v| v.ok_or_else(|| TmError::Encode("embedding row left unfilled".into())))
        .collect::<Result<Vec<_>>>()?;
    Ok((mapping, vectors, generated, reused))
}

/// Embedding rows for the per-line index. Every non-blank line is indexed;
/// the minimum-length cutoff applies only to query lines at search time.
pub fn line_embedding_rows(
    engine: &dyn EmbeddingEngine,
    entries: &[TmEntry],
) -> Result<(Vec<MappingRecord>, Vec<Vec<f32>>)> {
    let mut mapping = Vec::new();
    let mut texts = Vec::new();

    for entry in entries {
        if is_blank(&entry.source_text) {
            continue;
        }
        let source = normalize_newlines_universal(&entry.source_text);
        let target = normalize_newlines_universal(entry.target_text.as_deref().unwrap_or(""));
        let target_lines: Vec<&str> = target.lines().collect();
        for (line_num, line) in source.lines().enumerate() {
            if is_blank(line) {
                continue;
            }
            let embed_input = normalize_for_embedding(line);
            mapping.push(MappingRecord {
                entry_id: entry.id,
                text: line.to_string(),
                target_text: target_lines.get(line_num).map(|t| (*t).to_string()),
                string_id: entry.string_id.clone(),
            });
            texts.push(embed_input);
        }
    }

    let vectors = if texts.is_empty() {
        Vec::new()
    } else {
        engine.encode(&texts, true)?
    };
    Ok((mapping, vectors))
}

/// Write every artifact of a bundle, metadata last.
pub fn persist_bundle(
    paths: &IndexPaths,
    whole_lookup: &WholeLookupTable,
    line_lookup: &LineLookupTable,
    whole: &VectorStore,
    line: &VectorStore,
    metadata: &IndexMetadata,
) -> Result<()> {
    fs::create_dir_all(&paths.dir)?;
    write_msgpack(&paths.whole_lookup, whole_lookup)?;
    write_msgpack(&paths.line_lookup, line_lookup)?;
    write_msgpack(&paths.whole_mapping, &whole.mapping().to_vec())?;
    write_msgpack(&paths.line_mapping, &line.mapping().to_vec())?;
    whole.index().save(&paths.whole_index)?;
    line.index().save(&paths.line_index)?;
    // Commit point. A crash before this line leaves the bundle absent.
    write_json_atomic(&paths.metadata, metadata)?;
    debug!(dir = %paths.dir.display(), "persisted index bundle");
    Ok(())
}

/// Everything loaded back from one bundle.
#[derive(Debug)]
pub struct IndexBundle {
    pub whole_lookup: WholeLookupTable,
    pub line_lookup: LineLookupTable,
    pub whole: Option<VectorStore>,
    pub line: Option<VectorStore>,
    pub metadata: IndexMetadata,
}

pub struct TmIndexer {
    data_dir: PathBuf,
    engine: Arc<dyn EmbeddingEngine>,
}

impl TmIndexer {
    pub fn new(data_dir: PathBuf, engine: Arc<dyn EmbeddingEngine>) -> Self {
        Self { data_dir, engine }
    }

    pub fn paths(&self, tm_id: &str) -> IndexPaths {
        IndexPaths::new(&self.data_dir, tm_id)
    }

    /// Full build of one TM's bundle from its entries.
    ///
    /// With zero eligible entries nothing is written and the returned
    /// metadata carries `entry_count = 0`.
    pub fn build_indexes(&self, tm_id: &str, entries: &[TmEntry]) -> Result<IndexMetadata> {
        use crate::model::types::{DiffStats, SyncMode};

        let (whole_lookup, line_lookup) = build_tables(entries);
        let eligible = entries.iter().filter(|e| !is_blank(&e.source_text)).count();

        let metadata = IndexMetadata {
            format_version: FORMAT_VERSION,
            entry_count: eligible,
            whole_lookup_size: whole_lookup.len(),
            line_lookup_size: line_lookup.len(),
            embedding_dim: self.engine.dimension(),
            engine_name: self.engine.info().name.to_string(),
            synced_at: chrono::Utc::now(),
            sync_mode: SyncMode::Full,
            sync_stats: DiffStats {
                insert: eligible,
                ..DiffStats::default()
            },
        };
        if eligible == 0 {
            info!(tm_id, "no eligible entries; nothing indexed");
            return Ok(metadata);
        }

        let (whole_mapping, whole_vectors, _, _) =
            whole_embedding_rows(self.engine.as_ref(), entries, None)?;
        let (line_mapping, line_vectors) = line_embedding_rows(self.engine.as_ref(), entries)?;

        let dim = self.engine.dimension();
        let engine_id = self.engine.info().id;
        let mut whole = VectorStore::create(dim, engine_id);
        whole.add(whole_vectors, whole_mapping, false)?;
        let mut line = VectorStore::create(dim, engine_id);
        line.add(line_vectors, line_mapping, false)?;

        persist_bundle(
            &self.paths(tm_id),
            &whole_lookup,
            &line_lookup,
            &whole,
            &line,
            &metadata,
        )?;
        info!(
            tm_id,
            entries = eligible,
            whole_rows = whole.len(),
            line_rows = line.len(),
            "built index bundle"
        );
        Ok(metadata)
    }

    /// Load one TM's bundle. `NotFound` when the bundle was never committed.
    pub fn load_indexes(&self, tm_id: &str) -> Result<IndexBundle> {
        let paths = self.paths(tm_id);
        if !paths.bundle_exists() {
            return Err(TmError::NotFound(paths.metadata));
        }
        let metadata: IndexMetadata = read_json(&paths.metadata)?;
        let whole_lookup: WholeLookupTable = read_msgpack(&paths.whole_lookup)?;
        let line_lookup: LineLookupTable = read_msgpack(&paths.line_lookup)?;

        let whole = load_store(&paths.whole_index, &paths.whole_mapping)?;
        let line = load_store(&paths.line_index, &paths.line_mapping)?;

        Ok(IndexBundle {
            whole_lookup,
            line_lookup,
            whole,
            line,
            metadata,
        })
    }
}

fn load_store(index_path: &Path, mapping_path: &Path) -> Result<Option<VectorStore>> {
    match AnnIndex::load(index_path) {
        Ok(index) => {
            let mapping: Vec<MappingRecord> = read_msgpack(mapping_path)?;
            Ok(Some(VectorStore::new(index, mapping)?))
        }
        Err(TmError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
