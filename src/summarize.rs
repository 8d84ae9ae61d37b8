//! Narrative summary of the aggregate, written as a Markdown document.

use crate::analyzer::{TextAnalyzer, ERROR_SENTINEL};
use crate::config::PipelineOptions;
use crate::result::AnalysisResult;
use crate::store::BlobStore;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const SUMMARY_INSTRUCTION: &str = "You are a research assistant. The user message lists aggregated sentiment and \
emotion counts extracted from social-media posts, one `label: count` per line. Write a concise narrative summary \
(two or three short paragraphs) of the overall public sentiment: what dominates, notable emotions, and anything \
surprising. Refer to the numbers where useful. Do not invent data that is not listed.";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SummaryReport {
    pub pieces: usize,
    pub summarized: usize,
    pub failed: usize,
    pub summary_key: String,
}

/// One `label: count` line per non-zero count.
pub fn render_lines(aggregate: &AnalysisResult) -> Vec<String> {
    aggregate
        .pruned()
        .totals()
        .into_iter()
        .map(|(label, n)| format!("{label}: {n}"))
        .collect()
}

/// Pack lines into pieces of at most `max_chars` characters, breaking only between
/// lines. A single line longer than the limit is split on character boundaries.
pub fn wrap_lines(lines: &[String], max_chars: usize) -> Vec<String> {
    let max = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut cur = String::new();
    let mut cur_chars = 0usize;
    for line in lines {
        let n = line.chars().count();
        if n > max {
            if !cur.is_empty() {
                pieces.push(std::mem::take(&mut cur));
                cur_chars = 0;
            }
            let chars: Vec<char> = line.chars().collect();
            pieces.extend(chars.chunks(max).map(|c| c.iter().collect::<String>()));
            continue;
        }
        let extra = if cur.is_empty() { n } else { n + 1 };
        if cur_chars + extra > max {
            pieces.push(std::mem::take(&mut cur));
            cur_chars = 0;
        }
        if !cur.is_empty() {
            cur.push('\n');
            cur_chars += 1;
        }
        cur.push_str(line);
        cur_chars += n;
    }
    if !cur.is_empty() {
        pieces.push(cur);
    }
    pieces
}

fn escape_cell(s: &str) -> String {
    s.replace('|', "\\|")
}

fn render_document(source_key: &str, summaries: &[String], failed: usize, aggregate: &AnalysisResult) -> String {
    let generated = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    let mut doc = String::new();
    let _ = writeln!(doc, "# Sentiment Analysis Summary\n");
    let _ = writeln!(doc, "_Generated {generated} from `{source_key}`._\n");
    let _ = writeln!(doc, "## Summary\n");
    if summaries.is_empty() {
        let _ = writeln!(doc, "_No summary could be generated._\n");
    }
    for s in summaries {
        let _ = writeln!(doc, "{}\n", s.trim());
    }
    if failed > 0 {
        let _ = writeln!(doc, "_Note: {failed} part(s) of the data could not be summarized._\n");
    }
    let _ = writeln!(doc, "## Totals\n");
    let _ = writeln!(doc, "| Category | Count |");
    let _ = writeln!(doc, "|---|---:|");
    for (label, n) in aggregate.pruned().totals() {
        let _ = writeln!(doc, "| {} | {n} |", escape_cell(&label));
    }
    doc
}

pub(crate) fn summarize_aggregate(
    opts: &PipelineOptions,
    store: &dyn BlobStore,
    analyzer: &dyn TextAnalyzer,
) -> Result<SummaryReport> {
    let key = opts.aggregate_key();
    let Some(bytes) = store.get_opt(&key).with_context(|| format!("reading aggregate {key}"))? else {
        bail!("no aggregate stored at {key}; run process first");
    };
    let aggregate = AnalysisResult::decode(opts.schema, &bytes)
        .with_context(|| format!("aggregate {key} cannot be decoded as {}", opts.schema))?;

    let pieces = wrap_lines(&render_lines(&aggregate), opts.summary_chunk_chars);
    let mut report = SummaryReport { pieces: pieces.len(), summary_key: opts.summary_key.clone(), ..Default::default() };
    let mut summaries = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        match analyzer.analyze(SUMMARY_INSTRUCTION, piece) {
            Ok(text) if text.trim() != ERROR_SENTINEL && !text.trim().is_empty() => summaries.push(text),
            Ok(_) => {
                tracing::warn!(piece = i, "analyzer returned no usable summary");
                report.failed += 1;
            }
            Err(e) if e.is_fatal() => return Err(e).with_context(|| format!("summarizing piece {i}")),
            Err(e) => {
                tracing::warn!(piece = i, error = %e, "summary request failed");
                report.failed += 1;
            }
        }
    }
    report.summarized = summaries.len();

    let doc = render_document(&key, &summaries, report.failed, &aggregate);
    store
        .put(&opts.summary_key, doc.as_bytes(), true)
        .with_context(|| format!("writing summary {}", opts.summary_key))?;
    tracing::info!(pieces = report.pieces, failed = report.failed, key = %opts.summary_key, "Summary written.");
    Ok(report)
}
