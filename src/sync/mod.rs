//! Synchronization between the entry store and the persisted index bundle.
//!
//! `sync()` diffs the store against the persisted whole-text mapping and
//! picks one of two paths:
//!
//!   incremental  only inserts since the last sync: new rows are embedded
//!                and appended, nothing is rebuilt
//!   full         any update or delete, a missing bundle, or an engine
//!                change: everything is rebuilt, reusing persisted
//!                embeddings for unchanged sources where the dimension
//!                still matches
//!
//! The store is authoritative; the bundle is always derivable from it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use fxhash::FxHashMap;
use tracing::{info, warn};

use crate::error::{Result, TmError};
use crate::indexer::{
    build_tables, insert_lines, insert_whole, line_embedding_rows, persist_bundle,
    whole_embedding_rows, IndexPaths, TmIndexer, FORMAT_VERSION,
};
use crate::model::types::{
    DiffStats, IndexMetadata, MappingRecord, SyncDiff, SyncMode, SyncReport, SyncStatus, TmEntry,
    UpdatedEntry,
};
use crate::search::ann_index::VectorStore;
use crate::search::embedder::EmbeddingEngine;
use crate::search::normalize::{is_blank, normalize_for_hash};
use crate::storage::EntryStore;

/// Progress callback: `(stage, current_step, total_steps)`. The lifetime
/// lets callers pass borrowing closures (a CLI progress bar, a test recorder).
pub type ProgressFn<'a> = dyn Fn(&str, u64, u64) + 'a;

const FULL_STEPS: u64 = 5;
const INCREMENTAL_STEPS: u64 = 4;

pub struct TmSyncManager {
    data_dir: PathBuf,
    engine: Arc<dyn EmbeddingEngine>,
}

/// Outer join of current entries against the persisted whole mapping.
///
/// Keys are `normalize_for_hash(source)`. Both sides collapse to one
/// representative per key (store side keeps every entry of the key in the
/// category lists so variations survive a rebuild; comparison uses the
/// last entry, matching the lookup table's last-writer policy).
pub fn compute_diff(entries: &[TmEntry], cached: Option<&[MappingRecord]>) -> SyncDiff {
    let eligible: Vec<&TmEntry> = entries
        .iter()
        .filter(|e| !is_blank(&e.source_text))
        .collect();

    let Some(cached) = cached else {
        return SyncDiff {
            insert: eligible.into_iter().cloned().collect(),
            ..SyncDiff::default()
        };
    };

    // Group current entries by key, preserving first-seen key order.
    let mut key_order: Vec<String> = Vec::new();
    let mut groups: FxHashMap<String, Vec<&TmEntry>> = FxHashMap::default();
    for entry in eligible {
        let key = normalize_for_hash(&entry.source_text);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                key_order.push(key.clone());
                Vec::new()
            })
            .push(entry);
    }

    // Last writer wins on the cached side too.
    let mut cache_map: FxHashMap<String, &MappingRecord> = FxHashMap::default();
    for record in cached {
        cache_map.insert(normalize_for_hash(&record.text), record);
    }

    let mut diff = SyncDiff::default();
    for key in &key_order {
        let group = &groups[key];
        match cache_map.get(key) {
            None => diff.insert.extend(group.iter().map(|e| (*e).clone())),
            Some(record) => {
                let last = group.last().expect("group is never empty");
                let new_target = normalize_for_hash(last.target_text.as_deref().unwrap_or(""));
                let old_target =
                    normalize_for_hash(record.target_text.as_deref().unwrap_or(""));
                if new_target != old_target {
                    diff.update.push(UpdatedEntry {
                        entry: (*last).clone(),
                        old_target: record.target_text.clone(),
                    });
                    diff.unchanged
                        .extend(group[..group.len() - 1].iter().map(|e| (*e).clone()));
                } else {
                    diff.unchanged.extend(group.iter().map(|e| (*e).clone()));
                }
            }
        }
    }
    for (key, record) in &cache_map {
        if !groups.contains_key(key) {
            diff.delete.push((*record).clone());
        }
    }
    diff
}

impl TmSyncManager {
    pub fn new(data_dir: PathBuf, engine: Arc<dyn EmbeddingEngine>) -> Self {
        Self { data_dir, engine }
    }

    /// Bring one TM's bundle up to date with the entry store.
    pub fn sync(
        &self,
        tm_id: &str,
        store: &EntryStore,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<SyncReport> {
        let start = Instant::now();
        let indexer = TmIndexer::new(self.data_dir.clone(), Arc::clone(&self.engine));
        let paths = indexer.paths(tm_id);

        let entries = store.entries(tm_id)?;
        let eligible: Vec<TmEntry> = entries
            .into_iter()
            .filter(|e| !is_blank(&e.source_text))
            .collect();
        if eligible.is_empty() {
            info!(tm_id, "entry store is empty; sync skipped");
            return Ok(SyncReport {
                status: SyncStatus::Empty,
                sync_mode: SyncMode::Skipped,
                stats: DiffStats::default(),
                final_count: 0,
                embeddings_generated: 0,
                embeddings_reused: 0,
                time_seconds: start.elapsed().as_secs_f64(),
            });
        }

        let existing = match indexer.load_indexes(tm_id) {
            Ok(bundle) => Some(bundle),
            Err(TmError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let cached_mapping = existing
            .as_ref()
            .and_then(|b| b.whole.as_ref())
            .map(|store| store.mapping());

        let diff = compute_diff(&eligible, cached_mapping);
        let stats = diff.stats();

        let engine_dim = self.engine.dimension();
        let cached_dim = existing
            .as_ref()
            .and_then(|b| b.whole.as_ref())
            .map(VectorStore::dimension);
        let dims_match = cached_dim == Some(engine_dim);

        let incremental = stats.update == 0
            && stats.delete == 0
            && stats.insert > 0
            && dims_match
            && existing.as_ref().is_some_and(|b| b.whole.is_some());

        let report = if incremental {
            let bundle = existing.expect("incremental path requires a loaded bundle");
            self.sync_incremental(tm_id, &paths, bundle, diff, &eligible, progress)?
        } else {
            if let Some(dim) = cached_dim {
                if dim != engine_dim {
                    warn!(
                        tm_id,
                        persisted_dim = dim,
                        engine_dim,
                        "embedding dimension changed; discarding persisted embeddings"
                    );
                }
            }
            self.sync_full(tm_id, &paths, existing, diff, &eligible, dims_match, progress)?
        };

        Ok(SyncReport {
            time_seconds: start.elapsed().as_secs_f64(),
            ..report
        })
    }

    fn sync_incremental(
        &self,
        tm_id: &str,
        paths: &IndexPaths,
        bundle: crate::indexer::IndexBundle,
        diff: SyncDiff,
        eligible: &[TmEntry],
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<SyncReport> {
        let report_step = |stage: &str, step: u64| {
            if let Some(cb) = progress {
                cb(stage, step, INCREMENTAL_STEPS);
            }
        };
        report_step("load entries", 1);
        report_step("compute diff", 2);

        let stats = diff.stats();
        let mut whole_lookup = bundle.whole_lookup;
        let mut line_lookup = bundle.line_lookup;
        let mut whole = bundle
            .whole
            .ok_or_else(|| TmError::Encode("incremental sync without a whole store".into()))?;
        let mut line = match bundle.line {
            Some(store) => store,
            None => VectorStore::create(self.engine.dimension(), self.engine.info().id),
        };

        let (whole_mapping, whole_vectors, _, _) =
            whole_embedding_rows(self.engine.as_ref(), &diff.insert, None)?;
        let (line_mapping, line_vectors) = line_embedding_rows(self.engine.as_ref(), &diff.insert)?;
        report_step("embed new entries", 3);

        whole.add(whole_vectors, whole_mapping, false)?;
        line.add(line_vectors, line_mapping, false)?;
        for entry in &diff.insert {
            insert_whole(&mut whole_lookup, entry);
            insert_lines(&mut line_lookup, entry);
        }

        let metadata = self.metadata(eligible.len(), &whole_lookup, &line_lookup, SyncMode::Incremental, stats);
        persist_bundle(paths, &whole_lookup, &line_lookup, &whole, &line, &metadata)?;
        report_step("append and save", 4);

        info!(
            tm_id,
            inserted = stats.insert,
            total = eligible.len(),
            "incremental sync complete"
        );
        Ok(SyncReport {
            status: SyncStatus::Ok,
            sync_mode: SyncMode::Incremental,
            stats,
            final_count: eligible.len(),
            embeddings_generated: stats.insert,
            embeddings_reused: stats.unchanged,
            time_seconds: 0.0,
        })
    }

    fn sync_full(
        &self,
        tm_id: &str,
        paths: &IndexPaths,
        existing: Option<crate::indexer::IndexBundle>,
        diff: SyncDiff,
        eligible: &[TmEntry],
        dims_match: bool,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<SyncReport> {
        let report_step = |stage: &str, step: u64| {
            if let Some(cb) = progress {
                cb(stage, step, FULL_STEPS);
            }
        };
        report_step("load entries", 1);
        report_step("compute diff", 2);

        let stats = diff.stats();

        // Reuse persisted embeddings for sources whose text survived, unless
        // the engine dimension changed. Updated keys are excluded so changed
        // targets carry freshly embedded mapping rows.
        let reuse = if dims_match {
            existing.as_ref().and_then(|b| b.whole.as_ref()).map(|store| {
                let mut map: FxHashMap<String, Vec<f32>> = FxHashMap::default();
                for (record, vec) in store.mapping().iter().zip(store.index().vectors()) {
                    map.insert(normalize_for_hash(&record.text), vec.clone());
                }
                for updated in &diff.update {
                    map.remove(&normalize_for_hash(&updated.entry.source_text));
                }
                map
            })
        } else {
            None
        };

        let (whole_lookup, line_lookup) = build_tables(eligible);
        let (whole_mapping, whole_vectors, generated, reused) =
            whole_embedding_rows(self.engine.as_ref(), eligible, reuse.as_ref())?;
        let (line_mapping, line_vectors) = line_embedding_rows(self.engine.as_ref(), eligible)?;
        report_step("generate embeddings", 3);

        let dim = self.engine.dimension();
        let engine_id = self.engine.info().id;
        let mut whole = VectorStore::create(dim, engine_id);
        whole.add(whole_vectors, whole_mapping, false)?;
        let mut line = VectorStore::create(dim, engine_id);
        line.add(line_vectors, line_mapping, false)?;
        report_step("rebuild indexes", 4);

        let metadata = self.metadata(eligible.len(), &whole_lookup, &line_lookup, SyncMode::Full, stats);
        persist_bundle(paths, &whole_lookup, &line_lookup, &whole, &line, &metadata)?;
        report_step("save metadata", 5);

        info!(
            tm_id,
            total = eligible.len(),
            generated,
            reused,
            "full sync complete"
        );
        Ok(SyncReport {
            status: SyncStatus::Ok,
            sync_mode: SyncMode::Full,
            stats,
            final_count: eligible.len(),
            embeddings_generated: generated,
            embeddings_reused: reused,
            time_seconds: 0.0,
        })
    }

    fn metadata(
        &self,
        entry_count: usize,
        whole_lookup: &crate::model::types::WholeLookupTable,
        line_lookup: &crate::model::types::LineLookupTable,
        sync_mode: SyncMode,
        sync_stats: DiffStats,
    ) -> IndexMetadata {
        IndexMetadata {
            format_version: FORMAT_VERSION,
            entry_count,
            whole_lookup_size: whole_lookup.len(),
            line_lookup_size: line_lookup.len(),
            embedding_dim: self.engine.dimension(),
            engine_name: self.engine.info().name.to_string(),
            synced_at: chrono::Utc::now(),
            sync_mode,
            sync_stats,
        }
    }
}
