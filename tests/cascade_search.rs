//! End-to-end cascade behavior over in-memory index bundles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tm_search::error::Result;
use tm_search::indexer::{build_tables, line_embedding_rows, whole_embedding_rows};
use tm_search::model::types::{MatchOrigin, TmEntry};
use tm_search::search::ann_index::VectorStore;
use tm_search::search::cascade::{TmSearcher, DEFAULT_NPC_THRESHOLD, DEFAULT_THRESHOLD};
use tm_search::search::embedder::{EmbeddingEngine, EngineInfo};
use tm_search::search::embedder_registry;

fn entry(id: i64, source: &str, target: &str) -> TmEntry {
    TmEntry {
        id,
        source_text: source.to_string(),
        target_text: Some(target.to_string()),
        string_id: None,
    }
}

fn entry_with_sid(id: i64, source: &str, target: &str, sid: &str) -> TmEntry {
    TmEntry {
        string_id: Some(sid.to_string()),
        ..entry(id, source, target)
    }
}

/// Build a searcher the way the CLI does, but without touching disk.
fn searcher_for(entries: &[TmEntry], engine: Arc<dyn EmbeddingEngine>) -> TmSearcher {
    let (whole_lookup, line_lookup) = build_tables(entries);

    let (whole_mapping, whole_vectors, _, _) =
        whole_embedding_rows(engine.as_ref(), entries, None).unwrap();
    let mut whole = VectorStore::create(engine.dimension(), engine.info().id);
    whole.add(whole_vectors, whole_mapping, false).unwrap();

    let (line_mapping, line_vectors) = line_embedding_rows(engine.as_ref(), entries).unwrap();
    let mut line = VectorStore::create(engine.dimension(), engine.info().id);
    line.add(line_vectors, line_mapping, false).unwrap();

    TmSearcher::new(engine, whole_lookup, line_lookup, Some(whole), Some(line))
}

fn light() -> Arc<dyn EmbeddingEngine> {
    embedder_registry::resolve("light").unwrap()
}

/// Delegating engine that counts `encode` calls.
struct CountingEngine {
    inner: Arc<dyn EmbeddingEngine>,
    calls: AtomicUsize,
}

impl CountingEngine {
    fn new(inner: Arc<dyn EmbeddingEngine>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }
}

impl EmbeddingEngine for CountingEngine {
    fn info(&self) -> EngineInfo {
        self.inner.info()
    }
    fn is_loaded(&self) -> bool {
        self.inner.is_loaded()
    }
    fn load(&self) -> Result<()> {
        self.inner.load()
    }
    fn unload(&self) {
        self.inner.unload();
    }
    fn encode(&self, texts: &[String], normalize: bool) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.encode(texts, normalize)
    }
}

#[test]
fn perfect_whole_hit_returns_every_variation() {
    let entries = vec![
        entry_with_sid(1, "Save", "저장", "UI_SAVE"),
        entry_with_sid(2, "save", "세이브", "MENU_SAVE"),
        entry_with_sid(3, "SAVE", "저장하기", "DLG_SAVE"),
    ];
    let searcher = searcher_for(&entries, light());

    let response = searcher.search("save", 3, DEFAULT_THRESHOLD).unwrap();
    assert_eq!(response.tier, 1);
    assert_eq!(response.tier_name, "perfect_whole");
    assert!(response.perfect_match);
    assert_eq!(response.results.len(), 3);

    let mut targets: Vec<&str> = response
        .results
        .iter()
        .map(|m| m.target_text.as_deref().unwrap())
        .collect();
    targets.sort_unstable();
    assert_eq!(targets, ["세이브", "저장", "저장하기"]);
    assert!(response.results.iter().all(|m| m.score == 1.0));
}

#[test]
fn perfect_whole_ignores_case_and_extra_whitespace() {
    let entries = vec![entry(1, "Save the file", "파일 저장")];
    let searcher = searcher_for(&entries, light());

    let response = searcher
        .search("  SAVE   THE FILE  ", 3, DEFAULT_THRESHOLD)
        .unwrap();
    assert_eq!(response.tier, 1);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].entry_id, 1);
}

#[test]
fn perfect_whole_hit_never_calls_the_engine() {
    let entries = vec![entry(1, "save the file", "파일 저장")];
    // Indexing embeds with a plain engine; searching goes through the counter.
    let plain = light();
    let (whole_lookup, line_lookup) = build_tables(&entries);
    let (mapping, vectors, _, _) = whole_embedding_rows(plain.as_ref(), &entries, None).unwrap();
    let mut whole = VectorStore::create(plain.dimension(), plain.info().id);
    whole.add(vectors, mapping, false).unwrap();

    let counter = Arc::new(CountingEngine::new(plain));
    let searcher = TmSearcher::new(
        Arc::clone(&counter) as Arc<dyn EmbeddingEngine>,
        whole_lookup,
        line_lookup,
        Some(whole),
        None,
    );

    let response = searcher
        .search("save the file", 3, DEFAULT_THRESHOLD)
        .unwrap();
    assert_eq!(response.tier, 1);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn whole_embedding_finds_near_matches() {
    let entries = vec![
        entry(1, "save the file", "파일 저장"),
        entry(2, "완전히 무관한 항목", "unrelated"),
    ];
    let searcher = searcher_for(&entries, light());

    // Not an exact key, so tier 1 misses; the lexical embedding still lands.
    let response = searcher.search("save the file please", 3, 0.5).unwrap();
    assert_eq!(response.tier, 2);
    assert_eq!(response.tier_name, "whole_embedding");
    assert!(!response.perfect_match);
    assert_eq!(response.results[0].entry_id, 1);
    assert!(response.results[0].score >= 0.5 && response.results[0].score < 1.0);
    assert!(matches!(response.results[0].origin, MatchOrigin::Whole));
}

#[test]
fn perfect_line_tags_query_line_numbers() {
    let entries = vec![
        entry(1, "Welcome back", "어서 오세요"),
        entry(2, "Press any key", "아무 키나 누르세요"),
    ];
    let searcher = searcher_for(&entries, light());

    let response = searcher
        .search("Welcome back\r\nPress any key", 3, DEFAULT_THRESHOLD)
        .unwrap();
    assert_eq!(response.tier, 3);
    assert_eq!(response.tier_name, "perfect_line");
    assert!(response.perfect_match);
    assert_eq!(response.results.len(), 2);

    match response.results[0].origin {
        MatchOrigin::Line { query_line_num, .. } => assert_eq!(query_line_num, 0),
        MatchOrigin::Whole => panic!("expected a line match"),
    }
    match response.results[1].origin {
        MatchOrigin::Line { query_line_num, .. } => assert_eq!(query_line_num, 1),
        MatchOrigin::Whole => panic!("expected a line match"),
    }
    assert_eq!(response.results[1].entry_id, 2);
}

#[test]
fn perfect_line_returns_only_the_lines_it_knows() {
    let entries = vec![
        entry(1, "Welcome back", "어서 오세요"),
        entry(2, "Press any key", "아무 키나 누르세요"),
    ];
    let searcher = searcher_for(&entries, light());

    // Three query lines, only the first two indexed.
    let response = searcher
        .search(
            "Welcome back\nPress any key\nSee you next time",
            3,
            DEFAULT_THRESHOLD,
        )
        .unwrap();
    assert_eq!(response.tier, 3);
    assert!(response.perfect_match);
    assert_eq!(response.results.len(), 2);

    let line_nums: Vec<usize> = response
        .results
        .iter()
        .map(|m| match m.origin {
            MatchOrigin::Line { query_line_num, .. } => query_line_num,
            MatchOrigin::Whole => panic!("expected line matches"),
        })
        .collect();
    assert_eq!(line_nums, [0, 1]);
}

#[test]
fn line_embedding_reaches_short_indexed_lines() {
    let entries = vec![
        entry(1, "ok", "네"),
        entry(2, "something else entirely", "완전 다른 것"),
    ];
    let searcher = searcher_for(&entries, light());

    // "ok ok" is long enough to embed as a query line and should land on
    // the two-character indexed line.
    let response = searcher
        .search("intro words that differ\nok ok", 3, DEFAULT_THRESHOLD)
        .unwrap();
    assert_eq!(response.tier, 4);
    assert_eq!(response.tier_name, "line_embedding");
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].entry_id, 1);
    match response.results[0].origin {
        MatchOrigin::Line { query_line_num, .. } => assert_eq!(query_line_num, 1),
        MatchOrigin::Whole => panic!("expected a line match"),
    }
}

#[test]
fn empty_query_short_circuits_to_tier_zero() {
    let searcher = searcher_for(&[entry(1, "anything", "무엇이든")], light());
    let response = searcher.search(" \t\n ", 3, DEFAULT_THRESHOLD).unwrap();
    assert_eq!(response.tier, 0);
    assert_eq!(response.tier_name, "empty");
    assert!(response.results.is_empty());
}

#[test]
fn unrelated_query_exhausts_the_cascade() {
    let searcher = searcher_for(&[entry(1, "save the file", "파일 저장")], light());
    let response = searcher
        .search("완전히무관한질의문장", 3, DEFAULT_THRESHOLD)
        .unwrap();
    assert_eq!(response.tier, 0);
    assert_eq!(response.tier_name, "no_match");
    assert!(response.results.is_empty());
}

#[test]
fn search_batch_matches_individual_searches() {
    let searcher = searcher_for(&[entry(1, "save the file", "파일 저장")], light());
    let queries = vec!["save the file".to_string(), "없는 문장".to_string()];
    let responses = searcher.search_batch(&queries, 3, DEFAULT_THRESHOLD).unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].tier, 1);
    assert_eq!(responses[1].tier, 0);
}

#[test]
fn npc_accepts_the_recorded_translation() {
    let entries = vec![entry(1, "save the file", "파일을 저장합니다")];
    let searcher = searcher_for(&entries, light());

    let response = searcher.search("save the file", 3, DEFAULT_THRESHOLD).unwrap();
    let report = searcher
        .npc_check("파일을 저장합니다", &response.results, DEFAULT_NPC_THRESHOLD)
        .unwrap();
    assert_eq!(report.consistent, Some(true));
    assert!(report.best_score.unwrap() > 0.99);
    assert!(report.message.is_none());
}

#[test]
fn npc_flags_an_unrelated_translation() {
    let entries = vec![entry(1, "save the file", "파일을 저장합니다")];
    let searcher = searcher_for(&entries, light());

    let response = searcher.search("save the file", 3, DEFAULT_THRESHOLD).unwrap();
    let report = searcher
        .npc_check("completely different words here", &response.results, DEFAULT_NPC_THRESHOLD)
        .unwrap();
    assert_eq!(report.consistent, Some(false));
    assert!(report.best_score.unwrap() < DEFAULT_NPC_THRESHOLD);
    assert!(report.message.is_some());
}

#[test]
fn search_with_npc_stubs_when_nothing_matches() {
    let searcher = searcher_for(&[entry(1, "save the file", "파일 저장")], light());
    let combined = searcher
        .search_with_npc(
            "없는 문장입니다",
            "아무 번역",
            3,
            DEFAULT_THRESHOLD,
            DEFAULT_NPC_THRESHOLD,
        )
        .unwrap();
    assert_eq!(combined.search.tier, 0);
    assert_eq!(combined.npc.consistent, None);
    assert!(combined.npc.message.is_some());
}
