//! Input records and the loader for the collected-posts blob.

use crate::store::BlobStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::io;

/// One collected post. `id` is the idempotence key; every other field of the
/// source object (author, lang, created_at, ...) is ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(deserialize_with = "id_from_number_or_string")]
    pub id: u64,
    pub text: String,
}

impl Record {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        Self { id, text: text.into() }
    }
}

/// Lookup APIs hand ids out as JSON strings (they overflow f64); older dumps use numbers.
fn id_from_number_or_string<'de, D>(d: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Num(u64),
        Str(String),
    }
    match RawId::deserialize(d)? {
        RawId::Num(n) => Ok(n),
        RawId::Str(s) => s.trim().parse::<u64>().map_err(serde::de::Error::custom),
    }
}

/// Transparently decompress `.zst` blobs; anything else is returned as-is.
pub fn decode_blob(key: &str, bytes: Vec<u8>) -> io::Result<Vec<u8>> {
    if key.ends_with(".zst") {
        zstd::stream::decode_all(bytes.as_slice())
    } else {
        Ok(bytes)
    }
}

/// Load the input record array. Absence, transport failure and malformed JSON are
/// all errors here: without the input set there is nothing safe to do.
pub fn load_records(store: &dyn BlobStore, key: &str) -> Result<Vec<Record>> {
    let bytes = store.get(key).with_context(|| format!("read input records {key}"))?;
    let bytes = decode_blob(key, bytes).with_context(|| format!("decompress {key}"))?;
    let records: Vec<Record> =
        serde_json::from_slice(&bytes).with_context(|| format!("deserialize input records {key}"))?;
    tracing::debug!(key, count = records.len(), "loaded input records");
    Ok(records)
}
