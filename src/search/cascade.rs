//! Five-tier cascade search over a loaded index bundle.
//!
//! Tiers run in order of increasing cost and decreasing confidence; each
//! tier runs only if every prior tier produced zero results:
//!
//! | Tier | Name            | Method                                          |
//! |------|-----------------|-------------------------------------------------|
//! | 0    | empty/no_match  | empty query, or all tiers exhausted              |
//! | 1    | perfect_whole   | normalized key in the whole lookup table         |
//! | 2    | whole_embedding | ANN over whole-text vectors, score ≥ threshold   |
//! | 3    | perfect_line    | per-line key lookups, hits from all lines        |
//! | 4    | line_embedding  | per-line ANN, best hit per line ≥ threshold      |
//! | 5    | ngram_fallback  | 3-gram Jaccard scan over every whole key         |
//!
//! The same numeric `threshold` is applied to cosine similarity (tiers 2/4)
//! and Jaccard similarity (tier 5). That is a deliberate simplification
//! carried over from the original behavior, not a claim the metrics are
//! equivalent.
//!
//! A tier-1 or tier-3 hit never touches the embedding engine; the model is
//! loaded lazily on the first tier that embeds.

use std::sync::Arc;

use fxhash::FxHashSet;

use crate::error::{Result, TmError};
use crate::model::types::{
    LineLookupTable, MatchOrigin, NpcReport, SearchResponse, SearchWithNpc, Tier, TmMatch,
    WholeLookupTable, WholeRecord,
};
use crate::search::ann_index::{cosine_similarity, VectorStore};
use crate::search::embedder::EmbeddingEngine;
use crate::search::normalize::{is_blank, normalize_for_embedding, normalize_for_hash,
    normalize_newlines_universal};

pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_THRESHOLD: f32 = 0.92;
pub const DEFAULT_NPC_THRESHOLD: f32 = 0.65;

/// Lines shorter than this (after embedding normalization) are skipped in
/// tier 4; they carry too little signal to embed.
pub const MIN_EMBED_LINE_CHARS: usize = 3;

pub struct TmSearcher {
    engine: Arc<dyn EmbeddingEngine>,
    whole_lookup: WholeLookupTable,
    line_lookup: LineLookupTable,
    whole: Option<VectorStore>,
    line: Option<VectorStore>,
}

impl TmSearcher {
    pub fn new(
        engine: Arc<dyn EmbeddingEngine>,
        whole_lookup: WholeLookupTable,
        line_lookup: LineLookupTable,
        whole: Option<VectorStore>,
        line: Option<VectorStore>,
    ) -> Self {
        Self {
            engine,
            whole_lookup,
            line_lookup,
            whole,
            line,
        }
    }

    /// Run the cascade for one query.
    pub fn search(&self, query: &str, top_k: usize, threshold: f32) -> Result<SearchResponse> {
        if is_blank(query) {
            return Ok(SearchResponse::empty(Tier::Empty));
        }

        let key = normalize_for_hash(query);

        // Tier 1: exact whole-text key.
        if let Some(slot) = self.whole_lookup.get(&key) {
            let results = slot.records().iter().map(whole_match).collect();
            return Ok(SearchResponse::new(Tier::PerfectWhole, true, results));
        }

        // Tier 2: whole-text embedding.
        if let Some(store) = &self.whole {
            let results = self.whole_embedding_tier(query, store, top_k, threshold)?;
            if !results.is_empty() {
                return Ok(SearchResponse::new(Tier::WholeEmbedding, false, results));
            }
        }

        // Tier 3: exact per-line keys, collected from every line.
        let line_results = self.perfect_line_tier(&key);
        if !line_results.is_empty() {
            return Ok(SearchResponse::new(Tier::PerfectLine, true, line_results));
        }

        // Tier 4: per-line embedding.
        if let Some(store) = &self.line {
            let results = self.line_embedding_tier(query, store, top_k, threshold)?;
            if !results.is_empty() {
                return Ok(SearchResponse::new(Tier::LineEmbedding, false, results));
            }
        }

        // Tier 5: 3-gram Jaccard scan over every whole key. Linear, last resort.
        let ngram_results = self.ngram_fallback_tier(&key, top_k, threshold);
        if !ngram_results.is_empty() {
            return Ok(SearchResponse::new(Tier::NgramFallback, false, ngram_results));
        }

        Ok(SearchResponse::empty(Tier::NoMatch))
    }

    /// Independent per-query application of [`search`](Self::search).
    pub fn search_batch(
        &self,
        queries: &[String],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchResponse>> {
        queries
            .iter()
            .map(|q| self.search(q, top_k, threshold))
            .collect()
    }

    fn whole_embedding_tier(
        &self,
        query: &str,
        store: &VectorStore,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<TmMatch>> {
        let vector = self.embed(&normalize_for_embedding(query))?;
        let mut results: Vec<TmMatch> = store
            .search(&vector, top_k)?
            .into_iter()
            .filter(|(score, _)| *score >= threshold)
            .map(|(score, record)| TmMatch {
                entry_id: record.entry_id,
                source_text: record.text.clone(),
                target_text: record.target_text.clone(),
                string_id: record.string_id.clone(),
                score,
                origin: MatchOrigin::Whole,
            })
            .collect();
        sort_by_score(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    fn perfect_line_tier(&self, key: &str) -> Vec<TmMatch> {
        let mut results = Vec::new();
        for (query_line_num, line) in key.lines().enumerate() {
            if is_blank(line) {
                continue;
            }
            if let Some(record) = self.line_lookup.get(line) {
                results.push(TmMatch {
                    entry_id: record.entry_id,
                    source_text: record.source_line.clone(),
                    target_text: Some(record.target_line.clone()),
                    string_id: None,
                    score: 1.0,
                    origin: MatchOrigin::Line {
                        query_line_num,
                        line_num: record.line_num,
                        total_lines: record.total_lines,
                    },
                });
            }
        }
        results
    }

    fn line_embedding_tier(
        &self,
        query: &str,
        store: &VectorStore,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<TmMatch>> {
        let normalized = normalize_newlines_universal(query);
        let mut results = Vec::new();
        for (query_line_num, line) in normalized.lines().enumerate() {
            let embed_input = normalize_for_embedding(line);
            if embed_input.chars().count() < MIN_EMBED_LINE_CHARS {
                continue;
            }
            let vector = self.embed(&embed_input)?;
            // Best hit only; one candidate per query line.
            if let Some((score, record)) = store.search(&vector, 1)?.into_iter().next() {
                if score >= threshold {
                    results.push(TmMatch {
                        entry_id: record.entry_id,
                        source_text: record.text.clone(),
                        target_text: record.target_text.clone(),
                        string_id: record.string_id.clone(),
                        score,
                        origin: MatchOrigin::Line {
                            query_line_num,
                            line_num: 0,
                            total_lines: 0,
                        },
                    });
                }
            }
        }
        sort_by_score(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    fn ngram_fallback_tier(&self, key: &str, top_k: usize, threshold: f32) -> Vec<TmMatch> {
        let query_grams = trigram_set(key);
        let mut results = Vec::new();
        for (candidate_key, slot) in &self.whole_lookup {
            let score = jaccard(&query_grams, &trigram_set(candidate_key));
            if score >= threshold {
                for record in slot.records() {
                    let mut m = whole_match(record);
                    m.score = score;
                    results.push(m);
                }
            }
        }
        sort_by_score(&mut results);
        results.truncate(top_k);
        results
    }

    /// Consistency check: does the user's translation agree with TM targets?
    ///
    /// Embeds `user_target` and every non-empty candidate target from
    /// `tm_matches` (whole- or line-shaped), takes the best cosine
    /// similarity, and compares it against `threshold`. The default
    /// [`DEFAULT_NPC_THRESHOLD`] is lower than the search threshold because
    /// short strings have naturally depressed embedding similarity even
    /// when paraphrastic.
    pub fn npc_check(
        &self,
        user_target: &str,
        tm_matches: &[TmMatch],
        threshold: f32,
    ) -> Result<NpcReport> {
        if is_blank(user_target) {
            return Ok(NpcReport {
                consistent: Some(false),
                best_match: None,
                best_score: None,
                all_scores: Vec::new(),
                threshold,
                message: Some("empty target text; nothing to check".to_string()),
            });
        }

        let candidates: Vec<&TmMatch> = tm_matches
            .iter()
            .filter(|m| m.target_text.as_deref().is_some_and(|t| !is_blank(t)))
            .collect();
        if candidates.is_empty() {
            return Ok(NpcReport {
                consistent: None,
                best_match: None,
                best_score: None,
                all_scores: Vec::new(),
                threshold,
                message: Some("no TM targets to compare against".to_string()),
            });
        }

        let mut texts = Vec::with_capacity(candidates.len() + 1);
        texts.push(normalize_for_embedding(user_target));
        for m in &candidates {
            texts.push(normalize_for_embedding(m.target_text.as_deref().unwrap_or("")));
        }
        let vectors = self.engine.encode(&texts, true)?;
        let (user_vec, candidate_vecs) = vectors
            .split_first()
            .ok_or_else(|| TmError::Encode("engine returned no vectors".into()))?;

        let mut best_idx = 0usize;
        let mut best_score = f32::MIN;
        let mut all_scores = Vec::with_capacity(candidates.len());
        for (i, vec) in candidate_vecs.iter().enumerate() {
            let score = cosine_similarity(user_vec, vec);
            all_scores.push(score);
            if score > best_score {
                best_score = score;
                best_idx = i;
            }
        }
        all_scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        let consistent = best_score >= threshold;
        Ok(NpcReport {
            consistent: Some(consistent),
            best_match: Some(candidates[best_idx].clone()),
            best_score: Some(best_score),
            all_scores,
            threshold,
            message: (!consistent).then(|| {
                format!(
                    "best TM similarity {best_score:.3} is below the consistency threshold {threshold:.2}"
                )
            }),
        })
    }

    /// `search` composed with `npc_check`. When search finds nothing the
    /// NPC result is a stub with `consistent = None`.
    pub fn search_with_npc(
        &self,
        source: &str,
        user_target: &str,
        top_k: usize,
        threshold: f32,
        npc_threshold: f32,
    ) -> Result<SearchWithNpc> {
        let search = self.search(source, top_k, threshold)?;
        let npc = if search.results.is_empty() {
            NpcReport {
                consistent: None,
                best_match: None,
                best_score: None,
                all_scores: Vec::new(),
                threshold: npc_threshold,
                message: Some("no TM matches; consistency not evaluated".to_string()),
            }
        } else {
            self.npc_check(user_target, &search.results, npc_threshold)?
        };
        Ok(SearchWithNpc { search, npc })
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.engine.encode(&[text.to_string()], true)?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| TmError::Encode("engine returned no vector".into()))
    }
}

fn whole_match(record: &WholeRecord) -> TmMatch {
    TmMatch {
        entry_id: record.entry_id,
        source_text: record.source_text.clone(),
        target_text: record.target_text.clone(),
        string_id: record.string_id.clone(),
        score: 1.0,
        origin: MatchOrigin::Whole,
    }
}

fn sort_by_score(results: &mut [TmMatch]) {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// Character 3-grams of a key. Keys shorter than three characters contribute
/// themselves as a single gram so tiny strings still compare.
fn trigram_set(text: &str) -> FxHashSet<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut grams = FxHashSet::default();
    if chars.len() < 3 {
        if !chars.is_empty() {
            grams.insert(text.to_string());
        }
        return grams;
    }
    for window in chars.windows(3) {
        grams.insert(window.iter().collect());
    }
    grams
}

fn jaccard(a: &FxHashSet<String>, b: &FxHashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f32 / union as f32
}
