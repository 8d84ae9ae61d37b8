use crate::ratelimit::RateLimit;
use crate::schema::OutputSchema;
use crate::tracker::TrackerKind;
use crate::util::{env_parse, env_string};
use anyhow::{bail, Result};
use std::time::Duration;

/// Pipeline options with sensible defaults and builder chaining.
///
/// Key fields name blobs inside the `BlobStore`; everything else tunes the run.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub chunk_size: usize,             // records per analyzer call
    pub schema: OutputSchema,
    pub tracker: TrackerKind,

    // blob keys
    pub input_key: String,
    pub processed_key: String,          // id-set tracker
    pub watermark_key: String,          // watermark tracker
    pub aggregate_key: Option<String>,  // None = "sentiment_analysis.<ext>" for the schema
    pub audit_key: String,
    pub chunk_prefix: String,
    pub consolidated_key: Option<String>,
    pub summary_key: String,

    pub prune_zeros: bool,              // drop zero counts from the stored aggregate
    pub audit: bool,                    // append a ledger row per merged chunk
    pub keep_chunk_outputs: bool,       // also store each chunk's own result
    pub summary_chunk_chars: usize,     // max characters per summarize request
    pub progress: bool,
    pub progress_label: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            schema: OutputSchema::default(),
            tracker: TrackerKind::default(),

            input_key: "tweets.json".to_string(),
            processed_key: "processed_tweet_ids.txt".to_string(),
            watermark_key: "last_processed_id.txt".to_string(),
            aggregate_key: None,
            audit_key: "audit.csv".to_string(),
            chunk_prefix: "chunks/analysis_".to_string(),
            consolidated_key: None,
            summary_key: "Summary.md".to_string(),

            prune_zeros: true,
            audit: true,
            keep_chunk_outputs: false,
            summary_chunk_chars: 4000,
            progress: true,
            progress_label: None,
        }
    }
}

impl PipelineOptions {
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }
    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = schema;
        self
    }
    pub fn with_tracker(mut self, kind: TrackerKind) -> Self {
        self.tracker = kind;
        self
    }
    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        self.input_key = key.into();
        self
    }
    pub fn with_processed_key(mut self, key: impl Into<String>) -> Self {
        self.processed_key = key.into();
        self
    }
    pub fn with_watermark_key(mut self, key: impl Into<String>) -> Self {
        self.watermark_key = key.into();
        self
    }
    pub fn with_aggregate_key(mut self, key: impl Into<String>) -> Self {
        self.aggregate_key = Some(key.into());
        self
    }
    pub fn with_audit_key(mut self, key: impl Into<String>) -> Self {
        self.audit_key = key.into();
        self
    }
    pub fn with_chunk_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.chunk_prefix = prefix.into();
        self
    }
    pub fn with_consolidated_key(mut self, key: impl Into<String>) -> Self {
        self.consolidated_key = Some(key.into());
        self
    }
    pub fn with_summary_key(mut self, key: impl Into<String>) -> Self {
        self.summary_key = key.into();
        self
    }
    pub fn with_prune_zeros(mut self, yes: bool) -> Self {
        self.prune_zeros = yes;
        self
    }
    pub fn with_audit(mut self, yes: bool) -> Self {
        self.audit = yes;
        self
    }
    pub fn with_chunk_outputs(mut self, yes: bool) -> Self {
        self.keep_chunk_outputs = yes;
        self
    }
    pub fn with_summary_chunk_chars(mut self, n: usize) -> Self {
        self.summary_chunk_chars = n.max(1);
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_progress_label(mut self, label: impl Into<String>) -> Self {
        self.progress_label = Some(label.into());
        self
    }

    pub fn aggregate_key(&self) -> String {
        self.aggregate_key
            .clone()
            .unwrap_or_else(|| format!("sentiment_analysis.{}", self.schema.extension()))
    }

    pub fn consolidated_key(&self) -> String {
        self.consolidated_key
            .clone()
            .unwrap_or_else(|| format!("consolidated_analysis.{}", self.schema.extension()))
    }

    /// Reject combinations that would make a run meaningless or unsafe.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1");
        }
        if self.summary_chunk_chars == 0 {
            bail!("summary_chunk_chars must be at least 1");
        }
        if self.input_key.trim().is_empty() {
            bail!("input_key must not be empty");
        }
        let aggregate = self.aggregate_key();
        let tracker = match self.tracker {
            TrackerKind::IdSet => &self.processed_key,
            TrackerKind::Watermark => &self.watermark_key,
        };
        if aggregate == *tracker || aggregate == self.input_key || *tracker == self.input_key {
            bail!("input, aggregate and tracker keys must be distinct");
        }
        if self.keep_chunk_outputs && self.chunk_prefix.is_empty() {
            bail!("chunk_prefix must not be empty when chunk outputs are kept");
        }
        if !self.chunk_prefix.is_empty() && aggregate.starts_with(&self.chunk_prefix) {
            bail!("aggregate key {aggregate:?} lies under the chunk prefix {:?}", self.chunk_prefix);
        }
        Ok(())
    }

    /// Apply `SENTIMENT_*` environment overrides.
    pub fn merge_env(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("SENTIMENT_CHUNK_SIZE") {
            self = self.with_chunk_size(n);
        }
        if let Some(s) = env_parse::<OutputSchema>("SENTIMENT_SCHEMA") {
            self.schema = s;
        }
        if let Some(t) = env_parse::<TrackerKind>("SENTIMENT_TRACKER") {
            self.tracker = t;
        }
        if let Some(k) = env_string("SENTIMENT_INPUT_KEY") {
            self.input_key = k;
        }
        if let Some(k) = env_string("SENTIMENT_AGGREGATE_KEY") {
            self.aggregate_key = Some(k);
        }
        self
    }
}

/// Settings for the HTTP analyzer and its retry wrapper.
#[derive(Clone, Debug)]
pub struct AnalyzerOptions {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub rate_limit: RateLimit,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 2048,
            timeout: Duration::from_secs(120),
            rate_limit: RateLimit::default(),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl AnalyzerOptions {
    /// Defaults overridden by `ANALYZER_*` (and `OPENAI_API_KEY`) variables.
    pub fn from_env() -> Self {
        let mut o = Self::default();
        if let Some(e) = env_string("ANALYZER_ENDPOINT") {
            o.endpoint = e;
        }
        o.api_key = env_string("ANALYZER_API_KEY").or_else(|| env_string("OPENAI_API_KEY"));
        if let Some(m) = env_string("ANALYZER_MODEL") {
            o.model = m;
        }
        if let Some(r) = env_parse::<RateLimit>("ANALYZER_RATE_LIMIT") {
            o.rate_limit = r;
        }
        if let Some(n) = env_parse::<usize>("ANALYZER_MAX_RETRIES") {
            o.max_retries = n;
        }
        o
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = url.into();
        self
    }
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = limit;
        self
    }
    pub fn with_retries(mut self, max_retries: usize, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }
}
