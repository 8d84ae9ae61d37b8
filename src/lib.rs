mod config;
mod util;
mod progress;
mod store;
mod record;

mod chunking;
mod tracker;
mod schema;
mod result;
mod merge;

mod ratelimit;
mod analyzer;
mod processor;
mod audit;

mod pipeline;
mod consolidate;
mod summarize;

pub use crate::config::{AnalyzerOptions, PipelineOptions};
pub use crate::pipeline::{load_aggregate, RunReport, SentimentETL};
pub use crate::consolidate::ConsolidateReport;
pub use crate::summarize::{render_lines, wrap_lines, SummaryReport, SUMMARY_INSTRUCTION};

// storage seam and its two backends
pub use crate::store::{BlobStore, FsBlobStore, MemoryBlobStore, StoreError};
pub use crate::record::{decode_blob, load_records, Record};

// work units and bookkeeping
pub use crate::chunking::{split, Chunk, Chunks};
pub use crate::tracker::{filter, ProcessedSet, Progress, Tracker, TrackerKind};

// results, schemas and merging
pub use crate::result::{Aggregate, AnalysisResult, EntityTree, FlatRow, FlatTable, DEFAULT_COUNT_COLUMN};
pub use crate::schema::{is_count_column, parse_count, OutputSchema, SchemaMismatchError, FLAT_COUNT_COLUMNS};
pub use crate::merge::{merge, merge_all, normalize_key};

// analyzer seam
pub use crate::analyzer::{
    classify_status, completion_text, parse_retry_after, AnalyzerError, OpenAiAnalyzer, RetryingAnalyzer, TextAnalyzer,
    ERROR_SENTINEL,
};
pub use crate::ratelimit::{RateLimit, RateLimiter};
pub use crate::processor::{ChunkOutcome, ChunkProcessor};
pub use crate::audit::{format_deltas, AuditEntry, AuditLedger};

pub use crate::progress::{make_count_progress, ProgressScope};
pub use crate::util::{init_tracing_once, replace_file_atomic_backoff};
