use sentiment_etl::{format_deltas, AnalysisResult, AuditEntry, AuditLedger, BlobStore, FsBlobStore, MemoryBlobStore, StoreError};

/// Blobs written to a directory store read back, nest under `/`-separated keys, and
/// list sorted by prefix without exposing in-flight temp files.
#[test]
fn fs_store_put_get_list() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::open(dir.path()).unwrap();

    store.put("chunks/analysis_3-4.csv", b"b", true).unwrap();
    store.put("chunks/analysis_1-2.csv", b"a", true).unwrap();
    store.put("audit.csv", b"x", true).unwrap();
    std::fs::write(dir.path().join("chunks").join(".analysis_5-6.csv.tmp"), b"partial").unwrap();

    assert_eq!(store.get("chunks/analysis_1-2.csv").unwrap(), b"a");
    assert!(store.exists("audit.csv").unwrap());
    assert_eq!(
        store.list("chunks/").unwrap(),
        vec!["chunks/analysis_1-2.csv".to_string(), "chunks/analysis_3-4.csv".to_string()]
    );
    assert_eq!(store.list("").unwrap().len(), 3);

    store.put("audit.csv", b"y", true).unwrap();
    assert_eq!(store.get("audit.csv").unwrap(), b"y");
}

/// Absence is `NotFound` (or `None` via `get_opt`); refusing to overwrite is explicit;
/// keys that escape the root are rejected.
#[test]
fn fs_store_errors() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::open(dir.path()).unwrap();

    assert!(matches!(store.get("missing.txt"), Err(StoreError::NotFound(_))));
    assert_eq!(store.get_opt("missing.txt").unwrap(), None);

    store.put("once.txt", b"1", false).unwrap();
    assert!(matches!(store.put("once.txt", b"2", false), Err(StoreError::AlreadyExists(_))));
    assert_eq!(store.get("once.txt").unwrap(), b"1");

    for bad in ["../escape.txt", "/abs.txt", "", "a/../b"] {
        assert!(matches!(store.get(bad), Err(StoreError::InvalidKey(_))), "{bad:?}");
    }
}

/// The memory store can simulate transport failures on a key until healed.
#[test]
fn memory_store_failure_injection() {
    let store = MemoryBlobStore::new().with_blob("k", b"v".to_vec());
    store.fail_key("k");
    assert!(matches!(store.get("k"), Err(StoreError::Io { .. })));
    assert!(store.get_opt("k").is_err());
    store.heal_key("k");
    assert_eq!(store.get("k").unwrap(), b"v");
}

/// Ledger rows append under a single header; earlier rows are kept verbatim, even when
/// the existing blob lacks a trailing newline.
#[test]
fn audit_ledger_appends() {
    let header = "Timestamp,NumOfTweets,StartTweetID,EndTweetID,MentionsDetails";
    let legacy = format!("{header}\n2024-01-01T00:00:00Z,5,1,5,positive: 2");
    let store = MemoryBlobStore::new().with_blob("audit.csv", legacy.clone().into_bytes());
    let ledger = AuditLedger::new("audit.csv");

    let delta = AnalysisResult::from_mentions([("Sentiments: Positive", 2), ("Emotions: Joy", 1)]);
    ledger.append(&store, &AuditEntry::now(3, 6, 8, &delta)).unwrap();

    let text = store.text("audit.csv").unwrap();
    assert!(text.starts_with(&legacy));
    assert_eq!(text.matches("Timestamp").count(), 1);

    let rows = ledger.read(&store).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].num_records, 3);
    assert_eq!((rows[1].first_id, rows[1].last_id), (6, 8));
    assert_eq!(rows[1].deltas, "emotions: joy: 1; sentiments: positive: 2");
}

/// A new ledger starts with the header row.
#[test]
fn audit_ledger_starts_with_header() {
    let store = MemoryBlobStore::new();
    let ledger = AuditLedger::new("audit.csv");
    assert!(ledger.read(&store).unwrap().is_empty());

    let delta = AnalysisResult::from_entity_counts([("Jane", "Sentiments", "Positive", 1)]);
    ledger.append(&store, &AuditEntry::now(1, 9, 9, &delta)).unwrap();
    let text = store.text("audit.csv").unwrap();
    assert!(text.starts_with("Timestamp,NumOfTweets,StartTweetID,EndTweetID,MentionsDetails\n"));
    assert_eq!(format_deltas(&delta), "jane / sentiments / positive: 1");
}
