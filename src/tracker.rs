//! Processed-record bookkeeping: which ids are already folded into the aggregate.
//!
//! Two durable encodings are supported:
//!  - `IdSet`: newline-delimited decimal ids (`processed_tweet_ids.txt`).
//!  - `Watermark`: a single id cursor (`last_processed_id.txt`); everything at or below
//!    the cursor counts as processed. It cannot represent holes, so a run using it
//!    must stop at the first failed chunk (`Tracker::requires_contiguous`).

use crate::config::PipelineOptions;
use crate::record::Record;
use crate::store::{BlobStore, StoreError};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrackerKind {
    #[default]
    IdSet,
    Watermark,
}

impl FromStr for TrackerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "id-set" | "idset" | "ids" | "set" => Ok(TrackerKind::IdSet),
            "watermark" | "cursor" | "last-id" => Ok(TrackerKind::Watermark),
            other => Err(format!("unknown tracker kind {other:?} (expected id-set or watermark)")),
        }
    }
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerKind::IdSet => f.write_str("id-set"),
            TrackerKind::Watermark => f.write_str("watermark"),
        }
    }
}

/// Set of record ids already merged into the aggregate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessedSet(BTreeSet<u64>);

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.0.contains(&id)
    }

    pub fn insert(&mut self, id: u64) -> bool {
        self.0.insert(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().copied()
    }

    /// Parse newline-delimited ids. Blank lines are ignored; garbage lines are logged
    /// and skipped (the worst case is re-analysing those records).
    pub fn parse(text: &str) -> Self {
        let mut set = BTreeSet::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<u64>() {
                Ok(id) => {
                    set.insert(id);
                }
                Err(_) => tracing::warn!(line = lineno + 1, value = line, "ignoring malformed processed id"),
            }
        }
        Self(set)
    }

    /// One id per line, ascending, trailing newline.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 12);
        for id in &self.0 {
            out.push_str(&id.to_string());
            out.push('\n');
        }
        out
    }
}

impl FromIterator<u64> for ProcessedSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// In-memory tracker state for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Ids(ProcessedSet),
    Watermark(Option<u64>),
}

impl Progress {
    pub fn contains(&self, id: u64) -> bool {
        match self {
            Progress::Ids(set) => set.contains(id),
            Progress::Watermark(cursor) => cursor.is_some_and(|c| id <= c),
        }
    }

    /// Record ids as processed. The watermark only ever moves forward.
    pub fn mark(&mut self, ids: impl IntoIterator<Item = u64>) {
        match self {
            Progress::Ids(set) => {
                for id in ids {
                    set.insert(id);
                }
            }
            Progress::Watermark(cursor) => {
                if let Some(max) = ids.into_iter().max() {
                    *cursor = Some(cursor.map_or(max, |c| c.max(max)));
                }
            }
        }
    }

    pub fn as_set(&self) -> Option<&ProcessedSet> {
        match self {
            Progress::Ids(set) => Some(set),
            Progress::Watermark(_) => None,
        }
    }

    pub fn watermark(&self) -> Option<u64> {
        match self {
            Progress::Ids(_) => None,
            Progress::Watermark(cursor) => *cursor,
        }
    }
}

/// Durable tracker bound to one blob key.
#[derive(Clone, Debug)]
pub struct Tracker {
    kind: TrackerKind,
    key: String,
}

impl Tracker {
    pub fn new(kind: TrackerKind, key: impl Into<String>) -> Self {
        Self { kind, key: key.into() }
    }

    pub fn from_options(opts: &PipelineOptions) -> Self {
        match opts.tracker {
            TrackerKind::IdSet => Self::new(TrackerKind::IdSet, opts.processed_key.clone()),
            TrackerKind::Watermark => Self::new(TrackerKind::Watermark, opts.watermark_key.clone()),
        }
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn requires_contiguous(&self) -> bool {
        self.kind == TrackerKind::Watermark
    }

    /// Read the durable state; no prior state means nothing processed yet.
    pub fn load(&self, store: &dyn BlobStore) -> Result<Progress, StoreError> {
        let text = store
            .get_opt(&self.key)?
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        match self.kind {
            TrackerKind::IdSet => Ok(Progress::Ids(text.map(|t| ProcessedSet::parse(&t)).unwrap_or_default())),
            TrackerKind::Watermark => {
                let cursor = match text.as_deref().map(str::trim) {
                    None | Some("") => None,
                    Some(raw) => Some(raw.parse::<u64>().map_err(|e| StoreError::Corrupt {
                        key: self.key.clone(),
                        reason: format!("watermark {raw:?}: {e}"),
                    })?),
                };
                Ok(Progress::Watermark(cursor))
            }
        }
    }

    /// Overwrite the durable state (last writer wins).
    pub fn save(&self, store: &dyn BlobStore, progress: &Progress) -> Result<(), StoreError> {
        let body = match progress {
            Progress::Ids(set) => set.serialize(),
            Progress::Watermark(Some(c)) => format!("{c}\n"),
            Progress::Watermark(None) => String::new(),
        };
        store.put(&self.key, body.as_bytes(), true)
    }
}

/// Records not yet processed, in input order. A repeated id inside the input is
/// kept only at its first occurrence so it cannot be counted twice in one run.
pub fn filter(records: &[Record], progress: &Progress) -> Vec<Record> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut out = Vec::with_capacity(records.len());
    for r in records {
        if progress.contains(r.id) {
            continue;
        }
        if !seen.insert(r.id) {
            tracing::warn!(id = r.id, "duplicate record id in input; keeping first occurrence");
            continue;
        }
        out.push(r.clone());
    }
    out
}
