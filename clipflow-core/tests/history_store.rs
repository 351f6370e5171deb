use tempfile::TempDir;

use clipflow_core::history::{HistoryError, HistoryStore};

#[test]
fn first_run_creates_an_empty_ledger_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state/history.json");

    let store = HistoryStore::open(&path).unwrap();
    assert!(store.is_empty());
    assert!(path.exists(), "ledger file should exist after open");

    let content = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value["handled"], serde_json::json!([]));
}

#[test]
fn marks_are_ordered_durable_and_idempotent() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");

    let mut store = HistoryStore::open(&path).unwrap();
    store.mark_handled("first").unwrap();
    store.mark_handled("second").unwrap();
    store.mark_handled("first").unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.ids(), ["first".to_string(), "second".to_string()]);

    // A fresh process sees exactly what was flushed.
    let reloaded = HistoryStore::open(&path).unwrap();
    assert!(reloaded.is_handled("first"));
    assert!(reloaded.is_handled("second"));
    assert!(!reloaded.is_handled("third"));
    assert_eq!(reloaded.ids(), store.ids());
}

#[test]
fn the_ledger_file_is_plain_inspectable_json() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");

    let mut store = HistoryStore::open(&path).unwrap();
    store.mark_handled("abc123").unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.ends_with('\n'));
    assert!(content.contains("abc123"));
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value["handled"][0], "abc123");
}

#[test]
fn hand_edited_ledgers_load_with_duplicates_collapsed() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");
    std::fs::write(
        &path,
        r#"{ "handled": ["a", "b", "a"], "note": "trimmed by hand" }"#,
    )
    .unwrap();

    let store = HistoryStore::open(&path).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.ids(), ["a".to_string(), "b".to_string()]);
}

#[test]
fn removing_an_id_by_hand_makes_it_unhandled_again() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");

    let mut store = HistoryStore::open(&path).unwrap();
    store.mark_handled("keep").unwrap();
    store.mark_handled("redo").unwrap();
    drop(store);

    std::fs::write(&path, "{ \"handled\": [\"keep\"] }\n").unwrap();
    let store = HistoryStore::open(&path).unwrap();
    assert!(store.is_handled("keep"));
    assert!(!store.is_handled("redo"));
}

#[test]
fn corrupt_ledgers_are_a_startup_error_not_a_silent_reset() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");
    std::fs::write(&path, "not json at all").unwrap();

    let err = HistoryStore::open(&path).unwrap_err();
    assert!(matches!(err, HistoryError::Parse { .. }));
}

#[test]
fn read_only_stores_reject_writes() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");
    std::fs::write(&path, "{ \"handled\": [\"a\"] }\n").unwrap();

    let mut store = HistoryStore::builder()
        .path(&path)
        .read_only(true)
        .open()
        .unwrap();
    assert!(store.is_handled("a"));
    let err = store.mark_handled("b").unwrap_err();
    assert!(matches!(err, HistoryError::ReadOnly));

    // The file is untouched.
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(!content.contains('b'));
}

#[test]
fn builder_without_a_path_is_rejected() {
    let err = HistoryStore::builder().open().unwrap_err();
    assert!(matches!(err, HistoryError::MissingStore));
}

#[test]
fn create_if_missing_false_leaves_the_filesystem_untouched() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");

    let store = HistoryStore::builder()
        .path(&path)
        .create_if_missing(false)
        .open()
        .unwrap();
    assert!(store.is_empty());
    assert!(!path.exists());
}

#[test]
fn flushes_leave_no_stray_temp_files() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");

    let mut store = HistoryStore::open(&path).unwrap();
    for id in ["a", "b", "c", "d"] {
        store.mark_handled(id).unwrap();
    }

    let entries: Vec<String> = std::fs::read_dir(temp.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(entries, ["history.json".to_string()]);
}
