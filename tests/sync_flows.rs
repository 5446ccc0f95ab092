//! Full and incremental sync paths against a real on-disk bundle.

use std::path::Path;
use std::sync::Arc;

use serial_test::serial;
use tempfile::tempdir;

use tm_search::config;
use tm_search::indexer::{IndexPaths, TmIndexer};
use tm_search::model::types::{SyncMode, SyncStatus};
use tm_search::search::cascade::{TmSearcher, DEFAULT_THRESHOLD};
use tm_search::search::embedder::EmbeddingEngine;
use tm_search::search::embedder_registry;
use tm_search::storage::EntryStore;
use tm_search::sync::TmSyncManager;

const TM: &str = "game-ui";

fn engine(name: &str) -> Arc<dyn EmbeddingEngine> {
    embedder_registry::resolve(name).unwrap()
}

fn store_at(dir: &Path) -> EntryStore {
    EntryStore::open(&dir.join("tm_store.db")).unwrap()
}

fn seed(store: &EntryStore) {
    store
        .add_entry(TM, "Save the file", Some("파일 저장"), None)
        .unwrap();
    store
        .add_entry(TM, "Load the file", Some("파일 불러오기"), None)
        .unwrap();
    store
        .add_entry(TM, "Quit without saving", Some("저장하지 않고 종료"), None)
        .unwrap();
}

#[test]
fn first_sync_is_a_full_build() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path());
    seed(&store);

    let manager = TmSyncManager::new(dir.path().to_path_buf(), engine("light"));
    let report = manager.sync(TM, &store, None).unwrap();

    assert_eq!(report.status, SyncStatus::Ok);
    assert_eq!(report.sync_mode, SyncMode::Full);
    assert_eq!(report.stats.insert, 3);
    assert_eq!(report.final_count, 3);
    assert_eq!(report.embeddings_generated, 3);
    assert_eq!(report.embeddings_reused, 0);
    assert!(IndexPaths::new(dir.path(), TM).bundle_exists());
}

#[test]
fn insert_only_changes_go_incremental() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path());
    seed(&store);

    let manager = TmSyncManager::new(dir.path().to_path_buf(), engine("light"));
    manager.sync(TM, &store, None).unwrap();

    store
        .add_entry(TM, "New game", Some("새 게임"), None)
        .unwrap();
    store
        .add_entry(TM, "Continue", Some("이어하기"), None)
        .unwrap();

    let report = manager.sync(TM, &store, None).unwrap();
    assert_eq!(report.sync_mode, SyncMode::Incremental);
    assert_eq!(report.stats.insert, 2);
    assert_eq!(report.stats.unchanged, 3);
    assert_eq!(report.final_count, 5);
    assert_eq!(report.embeddings_generated, 2);
    assert_eq!(report.embeddings_reused, 3);

    let metadata = TmIndexer::new(dir.path().to_path_buf(), engine("light"))
        .load_indexes(TM)
        .unwrap()
        .metadata;
    assert_eq!(metadata.sync_mode, SyncMode::Incremental);
    assert_eq!(metadata.entry_count, 5);
}

#[test]
fn resync_with_no_changes_reuses_everything() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path());
    seed(&store);

    let manager = TmSyncManager::new(dir.path().to_path_buf(), engine("light"));
    manager.sync(TM, &store, None).unwrap();

    let report = manager.sync(TM, &store, None).unwrap();
    // Zero inserts disqualifies the incremental path; the full rebuild
    // reuses every persisted embedding.
    assert_eq!(report.sync_mode, SyncMode::Full);
    assert_eq!(report.stats.unchanged, 3);
    assert_eq!(report.embeddings_generated, 0);
    assert_eq!(report.embeddings_reused, 3);
}

#[test]
fn target_update_forces_a_full_rebuild() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path());
    seed(&store);

    let manager = TmSyncManager::new(dir.path().to_path_buf(), engine("light"));
    manager.sync(TM, &store, None).unwrap();

    let first_id = store.entries(TM).unwrap()[0].id;
    store.update_target(first_id, "다른 번역").unwrap();

    let report = manager.sync(TM, &store, None).unwrap();
    assert_eq!(report.sync_mode, SyncMode::Full);
    assert_eq!(report.stats.update, 1);
    assert_eq!(report.stats.unchanged, 2);
    // The updated source is re-embedded; the others are reused.
    assert_eq!(report.embeddings_generated, 1);
    assert_eq!(report.embeddings_reused, 2);
}

#[test]
fn delete_forces_a_full_rebuild() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path());
    seed(&store);

    let manager = TmSyncManager::new(dir.path().to_path_buf(), engine("light"));
    manager.sync(TM, &store, None).unwrap();

    let last_id = store.entries(TM).unwrap()[2].id;
    store.delete_entry(last_id).unwrap();

    let report = manager.sync(TM, &store, None).unwrap();
    assert_eq!(report.sync_mode, SyncMode::Full);
    assert_eq!(report.stats.delete, 1);
    assert_eq!(report.final_count, 2);

    let bundle = TmIndexer::new(dir.path().to_path_buf(), engine("light"))
        .load_indexes(TM)
        .unwrap();
    assert_eq!(bundle.whole_lookup.len(), 2);
    assert_eq!(bundle.whole.unwrap().len(), 2);
}

#[test]
#[serial]
fn engine_switch_re_embeds_everything() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path());
    seed(&store);

    TmSyncManager::new(dir.path().to_path_buf(), engine("light"))
        .sync(TM, &store, None)
        .unwrap();

    // Same entries, wider engine: the persisted 256-dim embeddings are
    // unusable, so nothing is reused.
    let report = TmSyncManager::new(dir.path().to_path_buf(), engine("wide"))
        .sync(TM, &store, None)
        .unwrap();
    assert_eq!(report.sync_mode, SyncMode::Full);
    assert_eq!(report.embeddings_generated, 3);
    assert_eq!(report.embeddings_reused, 0);

    let metadata = TmIndexer::new(dir.path().to_path_buf(), engine("wide"))
        .load_indexes(TM)
        .unwrap()
        .metadata;
    assert_eq!(metadata.embedding_dim, 1024);
    assert_eq!(metadata.engine_name, "wide");
}

#[test]
#[serial]
fn process_wide_engine_selection_feeds_resolution() {
    let before = config::current_engine_name();
    config::set_current_engine_name("wide");
    let resolved = embedder_registry::resolve_current().unwrap();
    assert_eq!(resolved.info().name, "wide");
    config::set_current_engine_name(&before);
}

#[test]
fn synced_bundle_reloads_into_a_working_searcher() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path());
    seed(&store);

    let manager = TmSyncManager::new(dir.path().to_path_buf(), engine("light"));
    manager.sync(TM, &store, None).unwrap();

    let bundle = TmIndexer::new(dir.path().to_path_buf(), engine("light"))
        .load_indexes(TM)
        .unwrap();
    let searcher = TmSearcher::new(
        engine("light"),
        bundle.whole_lookup,
        bundle.line_lookup,
        bundle.whole,
        bundle.line,
    );

    let response = searcher
        .search("SAVE THE FILE", 3, DEFAULT_THRESHOLD)
        .unwrap();
    assert_eq!(response.tier, 1);
    assert_eq!(response.results[0].target_text.as_deref(), Some("파일 저장"));
}

#[test]
fn empty_store_skips_without_writing() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path());

    let manager = TmSyncManager::new(dir.path().to_path_buf(), engine("light"));
    let report = manager.sync(TM, &store, None).unwrap();

    assert_eq!(report.status, SyncStatus::Empty);
    assert_eq!(report.sync_mode, SyncMode::Skipped);
    assert_eq!(report.final_count, 0);
    assert!(!IndexPaths::new(dir.path(), TM).bundle_exists());
}

#[test]
fn progress_milestones_differ_by_mode() {
    use std::sync::Mutex;

    let dir = tempdir().unwrap();
    let store = store_at(dir.path());
    seed(&store);

    let manager = TmSyncManager::new(dir.path().to_path_buf(), engine("light"));

    let stages: Mutex<Vec<(String, u64, u64)>> = Mutex::new(Vec::new());
    let record = |stage: &str, step: u64, total: u64| {
        stages.lock().unwrap().push((stage.to_string(), step, total));
    };

    manager.sync(TM, &store, Some(&record)).unwrap();
    {
        let seen = stages.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|(_, _, total)| *total == 5));
        assert_eq!(seen.last().unwrap().0, "save metadata");
    }

    stages.lock().unwrap().clear();
    store.add_entry(TM, "Options", Some("설정"), None).unwrap();
    manager.sync(TM, &store, Some(&record)).unwrap();
    let seen = stages.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|(_, _, total)| *total == 4));
    assert_eq!(seen.last().unwrap().0, "append and save");
}
