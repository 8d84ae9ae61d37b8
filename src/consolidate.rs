//! Fold stored per-chunk outputs into one consolidated table.
//!
//! Chunk blobs are decoded in parallel and reduced with `merge`; the reduction order
//! is arbitrary, which is fine because merge is associative and commutative.

use crate::config::PipelineOptions;
use crate::merge::merge;
use crate::pipeline::persist_aggregate;
use crate::result::AnalysisResult;
use crate::schema::SchemaMismatchError;
use crate::store::BlobStore;
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidateReport {
    pub chunk_blobs: usize,
    pub merged: usize,
    /// Keys that could not be read or decoded.
    pub skipped: Vec<String>,
    /// `None` when there was nothing to write.
    pub output_key: Option<String>,
}

pub(crate) fn consolidate_chunks(opts: &PipelineOptions, store: &dyn BlobStore) -> Result<ConsolidateReport> {
    let out_key = opts.consolidated_key();
    let keys: Vec<String> = store
        .list(&opts.chunk_prefix)
        .with_context(|| format!("listing chunk outputs under {:?}", opts.chunk_prefix))?
        .into_iter()
        .filter(|k| *k != out_key)
        .collect();

    let mut report = ConsolidateReport { chunk_blobs: keys.len(), ..Default::default() };
    if keys.is_empty() {
        tracing::info!(prefix = %opts.chunk_prefix, "No chunk outputs to consolidate.");
        return Ok(report);
    }

    let schema = opts.schema;
    let decoded: Vec<(String, Result<AnalysisResult>)> = keys
        .par_iter()
        .map(|key| {
            let result = store
                .get(key)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| AnalysisResult::decode(schema, &bytes));
            (key.clone(), result)
        })
        .collect();

    let mut parts = Vec::with_capacity(decoded.len());
    for (key, result) in decoded {
        match result {
            Ok(part) => parts.push(part),
            Err(e) => {
                tracing::warn!(key = %key, error = %format!("{e:#}"), "skipping undecodable chunk output");
                report.skipped.push(key);
            }
        }
    }
    report.merged = parts.len();

    let total = parts
        .into_par_iter()
        .map(Ok::<_, SchemaMismatchError>)
        .try_reduce(|| AnalysisResult::empty(schema), merge)
        .context("merging chunk outputs")?;
    persist_aggregate(store, &out_key, &total, opts)?;
    tracing::info!(merged = report.merged, skipped = report.skipped.len(), key = %out_key, "Consolidated chunk outputs.");
    report.output_key = Some(out_key);
    Ok(report)
}
