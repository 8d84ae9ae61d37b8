//! Append-only CSV ledger: one row per chunk merged into the aggregate.

use crate::result::AnalysisResult;
use crate::store::BlobStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "NumOfTweets")]
    pub num_records: usize,
    #[serde(rename = "StartTweetID")]
    pub first_id: u64,
    #[serde(rename = "EndTweetID")]
    pub last_id: u64,
    #[serde(rename = "MentionsDetails")]
    pub deltas: String,
}

impl AuditEntry {
    /// Entry stamped with the current UTC time.
    pub fn now(num_records: usize, first_id: u64, last_id: u64, delta: &AnalysisResult) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string());
        Self { timestamp, num_records, first_id, last_id, deltas: format_deltas(delta) }
    }
}

/// `key: n; key: n`, sorted by key.
pub fn format_deltas(delta: &AnalysisResult) -> String {
    delta
        .totals()
        .into_iter()
        .map(|(k, n)| format!("{k}: {n}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Clone, Debug)]
pub struct AuditLedger {
    key: String,
}

impl AuditLedger {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append one row; the header is written only when the ledger is new.
    /// Existing rows are carried over byte for byte.
    pub fn append(&self, store: &dyn BlobStore, entry: &AuditEntry) -> Result<()> {
        let mut bytes = store
            .get_opt(&self.key)
            .with_context(|| format!("read audit ledger {}", self.key))?
            .unwrap_or_default();
        let fresh = bytes.is_empty();
        if !fresh && !bytes.ends_with(b"\n") {
            bytes.push(b'\n');
        }
        let mut w = csv::WriterBuilder::new().has_headers(fresh).from_writer(bytes);
        w.serialize(entry).context("serialize audit entry")?;
        let bytes = w.into_inner().map_err(|e| anyhow::anyhow!("flush audit csv: {}", e.error()))?;
        store
            .put(&self.key, &bytes, true)
            .with_context(|| format!("write audit ledger {}", self.key))
    }

    /// All rows, oldest first. A missing ledger is empty.
    pub fn read(&self, store: &dyn BlobStore) -> Result<Vec<AuditEntry>> {
        let Some(bytes) = store
            .get_opt(&self.key)
            .with_context(|| format!("read audit ledger {}", self.key))?
        else {
            return Ok(Vec::new());
        };
        let mut rdr = csv::Reader::from_reader(bytes.as_slice());
        rdr.deserialize()
            .collect::<Result<Vec<AuditEntry>, _>>()
            .with_context(|| format!("parse audit ledger {}", self.key))
    }
}
