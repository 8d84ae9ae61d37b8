use crate::analyzer::TextAnalyzer;
use crate::audit::{AuditEntry, AuditLedger};
use crate::chunking::split;
use crate::config::PipelineOptions;
use crate::consolidate::{consolidate_chunks, ConsolidateReport};
use crate::merge::merge;
use crate::processor::{ChunkOutcome, ChunkProcessor};
use crate::progress::ProgressScope;
use crate::record::load_records;
use crate::result::{Aggregate, AnalysisResult};
use crate::schema::OutputSchema;
use crate::store::BlobStore;
use crate::summarize::{summarize_aggregate, SummaryReport};
use crate::tracker::{filter, Tracker, TrackerKind};
use crate::util::init_tracing_once;
use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Clone, Debug, Default)]
pub struct SentimentETL {
    pub(crate) opts: PipelineOptions,
}

/// Outcome of one `process` run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub total_records: usize,
    pub pending_records: usize,
    pub chunks_total: usize,
    pub chunks_succeeded: usize,
    pub chunks_skipped: usize,
    /// Ids of skipped chunks; still unprocessed, picked up by the next run.
    pub skipped_ids: Vec<u64>,
    /// Chunks handed to the analyzer; retries inside the analyzer are not counted.
    pub chunks_attempted: usize,
    /// Chunks merged and tracked whose audit row could not be written.
    pub audit_failures: usize,
    /// Watermark tracking stops at the first skipped chunk.
    pub halted_early: bool,
}

impl RunReport {
    /// Every pending record was analyzed and merged.
    pub fn is_complete(&self) -> bool {
        self.chunks_skipped == 0 && !self.halted_early && self.chunks_succeeded == self.chunks_total
    }
}

impl SentimentETL {
    pub fn new() -> Self {
        Self { opts: PipelineOptions::default() }
    }

    pub fn with_options(opts: PipelineOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.opts
    }

    // -------- Builder methods --------
    pub fn chunk_size(mut self, n: usize) -> Self { self.opts = self.opts.with_chunk_size(n); self }
    pub fn schema(mut self, schema: OutputSchema) -> Self { self.opts = self.opts.with_schema(schema); self }
    pub fn tracker(mut self, kind: TrackerKind) -> Self { self.opts = self.opts.with_tracker(kind); self }
    pub fn input_key(mut self, key: impl Into<String>) -> Self { self.opts = self.opts.with_input_key(key); self }
    pub fn aggregate_key(mut self, key: impl Into<String>) -> Self { self.opts = self.opts.with_aggregate_key(key); self }
    pub fn chunk_prefix(mut self, prefix: impl Into<String>) -> Self { self.opts = self.opts.with_chunk_prefix(prefix); self }
    pub fn keep_chunk_outputs(mut self, yes: bool) -> Self { self.opts = self.opts.with_chunk_outputs(yes); self }
    pub fn prune_zeros(mut self, yes: bool) -> Self { self.opts = self.opts.with_prune_zeros(yes); self }
    pub fn audit(mut self, yes: bool) -> Self { self.opts = self.opts.with_audit(yes); self }
    pub fn summary_chunk_chars(mut self, n: usize) -> Self { self.opts = self.opts.with_summary_chunk_chars(n); self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }
    pub fn progress_label(mut self, label: impl Into<String>) -> Self { self.opts = self.opts.with_progress_label(label); self }

    /// Analyze every record not yet folded into the aggregate.
    ///
    /// Per chunk the aggregate is persisted before the tracker, so a crash between
    /// the two writes can count that chunk twice on the next run but never loses it.
    /// Skipped chunks leave their ids unmarked. Errors are returned only when the
    /// input or existing aggregate cannot be read, a store write fails, or the
    /// analyzer reports a fatal error.
    pub fn process(&self, store: &dyn BlobStore, analyzer: &dyn TextAnalyzer) -> Result<RunReport> {
        init_tracing_once();
        let opts = &self.opts;
        opts.validate()?;

        let records = load_records(store, &opts.input_key)?;
        let tracker = Tracker::from_options(opts);
        let mut progress = tracker
            .load(store)
            .with_context(|| format!("loading tracker {}", tracker.key()))?;
        let mut pending = filter(&records, &progress);
        if tracker.requires_contiguous() {
            // the cursor only stays sound if chunks advance through ids in order
            pending.sort_by_key(|r| r.id);
        }

        let chunks = split(&pending, opts.chunk_size);
        let mut report = RunReport {
            total_records: records.len(),
            pending_records: pending.len(),
            chunks_total: chunks.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            tracing::info!(total = records.len(), "No new records to analyze.");
            return Ok(report);
        }

        let agg_key = opts.aggregate_key();
        let mut aggregate = load_aggregate(store, &agg_key, opts.schema)?;
        tracing::info!(
            total = records.len(),
            pending = pending.len(),
            chunks = chunks.len(),
            tracker = %tracker.kind(),
            schema = %opts.schema,
            "Planned analysis run."
        );

        let processor = ChunkProcessor::new(analyzer, opts.schema);
        let ledger = opts.audit.then(|| AuditLedger::new(opts.audit_key.clone()));
        let label = opts.progress_label.clone().unwrap_or_else(|| "Analyzing chunks".to_string());
        let bar = ProgressScope::count(opts.progress, label, chunks.len() as u64);

        for chunk in chunks {
            let (first_id, last_id) = (chunk.first_id().unwrap_or_default(), chunk.last_id().unwrap_or_default());
            report.chunks_attempted += 1;
            let outcome = processor
                .process(&chunk)
                .with_context(|| format!("analyzing chunk {} (ids {first_id}..={last_id})", chunk.index))?;
            bar.inc(1);

            let delta = match outcome {
                ChunkOutcome::Analyzed(delta) => delta,
                ChunkOutcome::Skipped { reason } => {
                    tracing::warn!(chunk = chunk.index, first_id, last_id, reason = %reason, "chunk skipped; its records stay pending");
                    report.chunks_skipped += 1;
                    report.skipped_ids.extend(chunk.ids());
                    if tracker.requires_contiguous() {
                        tracing::warn!(chunk = chunk.index, "watermark tracking cannot leave gaps; stopping run");
                        report.halted_early = true;
                        break;
                    }
                    continue;
                }
            };

            if opts.keep_chunk_outputs {
                let key = format!("{}{first_id}-{last_id}.{}", opts.chunk_prefix, opts.schema.extension());
                let bytes = delta.encode(opts.schema)?;
                store
                    .put(&key, &bytes, true)
                    .with_context(|| format!("writing chunk output {key}"))?;
            }
            let entry = ledger.as_ref().map(|_| AuditEntry::now(chunk.len(), first_id, last_id, &delta));

            let current = std::mem::replace(&mut aggregate, AnalysisResult::empty(opts.schema));
            aggregate = merge(current, delta).with_context(|| format!("merging chunk {}", chunk.index))?;
            persist_aggregate(store, &agg_key, &aggregate, opts)?;

            if let (Some(ledger), Some(entry)) = (&ledger, entry) {
                if let Err(e) = ledger.append(store, &entry) {
                    tracing::warn!(key = ledger.key(), error = %e, "audit append failed; continuing");
                    report.audit_failures += 1;
                }
            }

            progress.mark(chunk.ids());
            tracker
                .save(store, &progress)
                .with_context(|| format!("saving tracker {} after chunk {}", tracker.key(), chunk.index))?;
            report.chunks_succeeded += 1;
            tracing::debug!(chunk = chunk.index, first_id, last_id, "chunk merged");
        }

        bar.finish("done");
        tracing::info!(
            succeeded = report.chunks_succeeded,
            skipped = report.chunks_skipped,
            audit_failures = report.audit_failures,
            halted_early = report.halted_early,
            "Analysis run finished."
        );
        Ok(report)
    }

    /// Fold every stored per-chunk output into `consolidated_key`.
    pub fn consolidate(&self, store: &dyn BlobStore) -> Result<ConsolidateReport> {
        init_tracing_once();
        consolidate_chunks(&self.opts, store)
    }

    /// Summarize the aggregate with the analyzer into a Markdown document.
    pub fn summarize(&self, store: &dyn BlobStore, analyzer: &dyn TextAnalyzer) -> Result<SummaryReport> {
        init_tracing_once();
        summarize_aggregate(&self.opts, store, analyzer)
    }
}

/// Existing aggregate, or an empty one when nothing is stored yet.
/// A stored aggregate that does not decode is an error: merging into it would lose totals.
pub fn load_aggregate(store: &dyn BlobStore, key: &str, schema: OutputSchema) -> Result<Aggregate> {
    let Some(bytes) = store
        .get_opt(key)
        .with_context(|| format!("reading aggregate {key}"))?
    else {
        return Ok(AnalysisResult::empty(schema));
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(AnalysisResult::empty(schema));
    }
    AnalysisResult::decode(schema, &bytes).with_context(|| format!("existing aggregate {key} cannot be decoded as {schema}"))
}

pub(crate) fn persist_aggregate(store: &dyn BlobStore, key: &str, aggregate: &Aggregate, opts: &PipelineOptions) -> Result<()> {
    let bytes = if opts.prune_zeros {
        aggregate.pruned().encode(opts.schema)?
    } else {
        aggregate.encode(opts.schema)?
    };
    store
        .put(key, &bytes, true)
        .with_context(|| format!("writing aggregate {key}"))
}
