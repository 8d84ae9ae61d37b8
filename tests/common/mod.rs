#![allow(dead_code)]

use sentiment_etl::{AnalyzerError, MemoryBlobStore, Record, SentimentETL, TextAnalyzer};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const INPUT_KEY: &str = "tweets.json";
pub const PROCESSED_KEY: &str = "processed_tweet_ids.txt";
pub const WATERMARK_KEY: &str = "last_processed_id.txt";
pub const FLAT_AGGREGATE_KEY: &str = "sentiment_analysis.csv";
pub const AUDIT_KEY: &str = "audit.csv";

/// Analyzer double: replies from a queue, then falls back to a fixed reply.
/// Every call is counted and its user-message body recorded.
pub struct ScriptedAnalyzer {
    replies: Mutex<VecDeque<Result<String, AnalyzerError>>>,
    fallback: String,
    calls: AtomicUsize,
    bodies: Mutex<Vec<String>>,
}

impl ScriptedAnalyzer {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|s| Ok(s.into())).collect()),
            fallback: sentiment_etl::ERROR_SENTINEL.to_string(),
            calls: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
        }
    }

    /// Same reply for every call.
    pub fn always(reply: impl Into<String>) -> Self {
        let mut a = Self::new(Vec::<String>::new());
        a.fallback = reply.into();
        a
    }

    /// Queue an error as the next scripted outcome.
    pub fn then_err(self, err: AnalyzerError) -> Self {
        self.replies.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn then_reply(self, reply: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }
}

impl TextAnalyzer for ScriptedAnalyzer {
    fn analyze(&self, _instruction: &str, body: &str) -> Result<String, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => Ok(self.fallback.clone()),
        }
    }
}

/// JSON array of `{id, text}` objects, with an extra field the loader must ignore.
pub fn records_json(records: &[(u64, &str)]) -> Vec<u8> {
    let arr: Vec<_> = records
        .iter()
        .map(|(id, text)| json!({ "id": id, "text": text, "lang": "en" }))
        .collect();
    serde_json::to_vec(&arr).unwrap()
}

pub fn records(records: &[(u64, &str)]) -> Vec<Record> {
    records.iter().map(|(id, t)| Record::new(*id, *t)).collect()
}

/// Store holding only the input blob.
pub fn seeded_store(records: &[(u64, &str)]) -> MemoryBlobStore {
    MemoryBlobStore::new().with_blob(INPUT_KEY, records_json(records))
}

/// `n` records with ids `1..=n`.
pub fn numbered(n: u64) -> Vec<(u64, String)> {
    (1..=n).map(|i| (i, format!("post number {i}"))).collect()
}

pub fn seeded_numbered(n: u64) -> MemoryBlobStore {
    let owned = numbered(n);
    let borrowed: Vec<(u64, &str)> = owned.iter().map(|(i, t)| (*i, t.as_str())).collect();
    seeded_store(&borrowed)
}

/// Flat-CSV reply the way a model would typically format it.
pub fn flat_reply(rows: &[(&str, i64)]) -> String {
    let mut s = String::from("Category,Mentions\n");
    for (cat, n) in rows {
        s.push_str(&format!("{cat},{n}\n"));
    }
    s
}

/// Pipeline with progress output off and everything else at defaults.
pub fn etl() -> SentimentETL {
    SentimentETL::new().progress(false)
}

/// Ids listed in the id-set tracker blob.
pub fn processed_ids(store: &MemoryBlobStore) -> Vec<u64> {
    store
        .text(PROCESSED_KEY)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().parse().unwrap())
        .collect()
}
