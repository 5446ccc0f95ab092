//! Core entity, lookup-table, and report types.

use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One translation-memory entry as read from the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmEntry {
    pub id: i64,
    pub source_text: String,
    pub target_text: Option<String>,
    /// Disambiguates multiple legitimate translations of an identical source.
    pub string_id: Option<String>,
}

/// Record stored in the whole-text lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WholeRecord {
    pub entry_id: i64,
    pub source_text: String,
    pub target_text: Option<String>,
    pub string_id: Option<String>,
}

impl WholeRecord {
    pub fn from_entry(entry: &TmEntry) -> Self {
        Self {
            entry_id: entry.id,
            source_text: entry.source_text.clone(),
            target_text: entry.target_text.clone(),
            string_id: entry.string_id.clone(),
        }
    }
}

/// Slot in the whole-text lookup table.
///
/// Entries sharing a normalized key where at least one carries a `string_id`
/// accumulate as `Variations`; otherwise the last writer wins and the slot
/// stays `Single`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WholeSlot {
    Single(WholeRecord),
    Variations {
        variations: Vec<WholeRecord>,
        source_text: String,
    },
}

impl WholeSlot {
    /// All records in this slot, in insertion order.
    pub fn records(&self) -> &[WholeRecord] {
        match self {
            WholeSlot::Single(record) => std::slice::from_ref(record),
            WholeSlot::Variations { variations, .. } => variations,
        }
    }
}

/// Record stored in the per-line lookup table. First occurrence wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    pub entry_id: i64,
    pub source_line: String,
    pub target_line: String,
    pub line_num: usize,
    pub total_lines: usize,
}

/// `NormalizedKey(whole source)` → slot.
pub type WholeLookupTable = FxHashMap<String, WholeSlot>;

/// `NormalizedKey(one non-blank line)` → record.
pub type LineLookupTable = FxHashMap<String, LineRecord>;

/// One row of the mapping array kept parallel to the ANN index.
///
/// `target_text` is carried so the sync diff can detect target updates from
/// the persisted mapping alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub entry_id: i64,
    pub text: String,
    pub target_text: Option<String>,
    pub string_id: Option<String>,
}

/// Where a match came from within the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "match_type", rename_all = "snake_case")]
pub enum MatchOrigin {
    Whole,
    Line {
        /// Zero-based index of the query line that produced this hit.
        query_line_num: usize,
        /// Line position within the matched TM entry.
        line_num: usize,
        total_lines: usize,
    },
}

/// One search hit. Perfect (hash-table) matches carry `score = 1.0`.
#[derive(Debug, Clone, Serialize)]
pub struct TmMatch {
    pub entry_id: i64,
    pub source_text: String,
    pub target_text: Option<String>,
    pub string_id: Option<String>,
    pub score: f32,
    #[serde(flatten)]
    pub origin: MatchOrigin,
}

/// Cascade tiers, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Empty or missing query; nothing was attempted.
    Empty,
    /// Every tier ran and produced nothing.
    NoMatch,
    PerfectWhole,
    WholeEmbedding,
    PerfectLine,
    LineEmbedding,
    NgramFallback,
}

impl Tier {
    pub fn number(self) -> u8 {
        match self {
            Tier::Empty | Tier::NoMatch => 0,
            Tier::PerfectWhole => 1,
            Tier::WholeEmbedding => 2,
            Tier::PerfectLine => 3,
            Tier::LineEmbedding => 4,
            Tier::NgramFallback => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tier::Empty => "empty",
            Tier::NoMatch => "no_match",
            Tier::PerfectWhole => "perfect_whole",
            Tier::WholeEmbedding => "whole_embedding",
            Tier::PerfectLine => "perfect_line",
            Tier::LineEmbedding => "line_embedding",
            Tier::NgramFallback => "ngram_fallback",
        }
    }
}

/// Result of one cascade search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub tier: u8,
    pub tier_name: &'static str,
    pub perfect_match: bool,
    pub results: Vec<TmMatch>,
}

impl SearchResponse {
    pub fn new(tier: Tier, perfect_match: bool, results: Vec<TmMatch>) -> Self {
        Self {
            tier: tier.number(),
            tier_name: tier.name(),
            perfect_match,
            results,
        }
    }

    pub fn empty(tier: Tier) -> Self {
        Self::new(tier, false, Vec::new())
    }
}

/// Entry whose target changed since the cache was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedEntry {
    pub entry: TmEntry,
    pub old_target: Option<String>,
}

/// Counts for one diff, persisted into the metadata record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub insert: usize,
    pub update: usize,
    pub delete: usize,
    pub unchanged: usize,
}

/// Outer join of current entries against the persisted mapping.
#[derive(Debug, Clone, Default)]
pub struct SyncDiff {
    pub insert: Vec<TmEntry>,
    pub update: Vec<UpdatedEntry>,
    /// Cached rows with no surviving entry in the store.
    pub delete: Vec<MappingRecord>,
    pub unchanged: Vec<TmEntry>,
}

impl SyncDiff {
    pub fn stats(&self) -> DiffStats {
        DiffStats {
            insert: self.insert.len(),
            update: self.update.len(),
            delete: self.delete.len(),
            unchanged: self.unchanged.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Ok,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
    /// Nothing to sync (empty store); no files were touched.
    Skipped,
}

/// Outcome of one `sync()` run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub sync_mode: SyncMode,
    pub stats: DiffStats,
    pub final_count: usize,
    pub embeddings_generated: usize,
    pub embeddings_reused: usize,
    pub time_seconds: f64,
}

/// Outcome of a translation-consistency (NPC) check.
#[derive(Debug, Clone, Serialize)]
pub struct NpcReport {
    /// `None` when the check could not run (no TM matches to compare).
    pub consistent: Option<bool>,
    pub best_match: Option<TmMatch>,
    pub best_score: Option<f32>,
    /// Similarities against every candidate target, sorted descending.
    pub all_scores: Vec<f32>,
    pub threshold: f32,
    pub message: Option<String>,
}

/// `search()` composed with `npc_check()`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchWithNpc {
    pub search: SearchResponse,
    pub npc: NpcReport,
}

/// Persisted metadata record, committed last during sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub format_version: u32,
    pub entry_count: usize,
    pub whole_lookup_size: usize,
    pub line_lookup_size: usize,
    pub embedding_dim: usize,
    pub engine_name: String,
    pub synced_at: DateTime<Utc>,
    pub sync_mode: SyncMode,
    pub sync_stats: DiffStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_numbers_and_names() {
        assert_eq!(Tier::Empty.number(), 0);
        assert_eq!(Tier::NoMatch.number(), 0);
        assert_eq!(Tier::NoMatch.name(), "no_match");
        assert_eq!(Tier::PerfectWhole.number(), 1);
        assert_eq!(Tier::NgramFallback.number(), 5);
        assert_eq!(Tier::LineEmbedding.name(), "line_embedding");
    }

    #[test]
    fn whole_slot_records_views_both_shapes() {
        let rec = WholeRecord {
            entry_id: 1,
            source_text: "저장".into(),
            target_text: Some("Save".into()),
            string_id: None,
        };
        let single = WholeSlot::Single(rec.clone());
        assert_eq!(single.records().len(), 1);

        let vars = WholeSlot::Variations {
            variations: vec![rec.clone(), rec],
            source_text: "저장".into(),
        };
        assert_eq!(vars.records().len(), 2);
    }

    #[test]
    fn diff_stats_counts() {
        let entry = TmEntry {
            id: 1,
            source_text: "a".into(),
            target_text: None,
            string_id: None,
        };
        let diff = SyncDiff {
            insert: vec![entry.clone()],
            update: vec![],
            delete: vec![],
            unchanged: vec![entry],
        };
        let stats = diff.stats();
        assert_eq!(stats.insert, 1);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.update + stats.delete, 0);
    }
}
