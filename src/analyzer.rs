//! Text analyzer seam: the remote model that turns a chunk of posts into a table.
//!
//! `TextAnalyzer` is the only thing the pipeline knows about the model. The
//! production implementation is `OpenAiAnalyzer` (blocking chat-completions client),
//! usually wrapped in `RetryingAnalyzer` for rate limiting and retries.

use crate::config::AnalyzerOptions;
use crate::ratelimit::RateLimiter;
use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{json, Value};
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

/// Reply some analyzers produce instead of an error status. Treated as a failed chunk.
pub const ERROR_SENTINEL: &str = "Error analyzing the text.";

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("rate limited by analyzer")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient analyzer failure: {0}")]
    Transient(String),
    #[error("malformed analyzer exchange: {0}")]
    Malformed(String),
    #[error("fatal analyzer error: {0}")]
    Fatal(String),
}

impl AnalyzerError {
    /// Errors that stop the whole run rather than just the current chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AnalyzerError::Fatal(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalyzerError::RateLimited { .. } | AnalyzerError::Transient(_))
    }
}

pub trait TextAnalyzer: Send + Sync {
    /// Send `instruction` (system role) and `body` (user role); return the raw reply text.
    fn analyze(&self, instruction: &str, body: &str) -> Result<String, AnalyzerError>;
}

impl<T: TextAnalyzer + ?Sized> TextAnalyzer for &T {
    fn analyze(&self, instruction: &str, body: &str) -> Result<String, AnalyzerError> {
        (**self).analyze(instruction, body)
    }
}

impl<T: TextAnalyzer + ?Sized> TextAnalyzer for Box<T> {
    fn analyze(&self, instruction: &str, body: &str) -> Result<String, AnalyzerError> {
        (**self).analyze(instruction, body)
    }
}

// ----------------------------- Retry wrapper ------------------------------------

/// Adds a client-side rate limit and bounded retries around another analyzer.
#[derive(Debug)]
pub struct RetryingAnalyzer<A> {
    inner: A,
    limiter: Option<RateLimiter>,
    max_retries: usize,
    retry_delay: Duration,
    max_backoff: Duration,
}

impl<A: TextAnalyzer> RetryingAnalyzer<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            limiter: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn from_options(inner: A, opts: &AnalyzerOptions) -> Self {
        Self::new(inner)
            .with_rate_limiter(RateLimiter::new(opts.rate_limit))
            .with_max_retries(opts.max_retries)
            .with_retry_delay(opts.retry_delay)
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_max_retries(mut self, n: usize) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = cap;
        self
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn wait_for(&self, err: &AnalyzerError, attempt: usize) -> Duration {
        let wait = match err {
            AnalyzerError::RateLimited { retry_after: Some(d) } => *d,
            AnalyzerError::RateLimited { retry_after: None } => self.retry_delay,
            _ => self.retry_delay.saturating_mul(attempt as u32),
        };
        wait.min(self.max_backoff)
    }
}

impl<A: TextAnalyzer> TextAnalyzer for RetryingAnalyzer<A> {
    fn analyze(&self, instruction: &str, body: &str) -> Result<String, AnalyzerError> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.limiter {
                limiter.acquire();
            }
            match self.inner.analyze(instruction, body) {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let wait = self.wait_for(&e, attempt);
                    tracing::warn!(attempt, wait_ms = wait.as_millis() as u64, error = %e, "analyzer call failed; retrying");
                    sleep(wait);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ----------------------------- OpenAI-compatible client ------------------------------------

/// Blocking chat-completions client (OpenAI wire format).
#[derive(Debug, Clone)]
pub struct OpenAiAnalyzer {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiAnalyzer {
    pub fn new(opts: &AnalyzerOptions) -> anyhow::Result<Self> {
        let api_key = opts
            .api_key
            .clone()
            .context("no analyzer API key configured (set ANALYZER_API_KEY or OPENAI_API_KEY)")?;
        let client = Client::builder()
            .timeout(opts.timeout)
            .build()
            .context("failed to build analyzer HTTP client")?;
        Ok(Self {
            client,
            endpoint: opts.endpoint.clone(),
            api_key,
            model: opts.model.clone(),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
        })
    }

    fn request_body(&self, instruction: &str, body: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": instruction },
                { "role": "user", "content": body },
            ],
        })
    }
}

/// `Retry-After` as delta-seconds. HTTP-dates and values too large for a `Duration`
/// yield `None`, so the caller falls back to its fixed delay.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let secs = raw.trim().parse::<f64>().ok().filter(|s| *s >= 0.0)?;
    Duration::try_from_secs_f64(secs).ok()
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    parse_retry_after(headers.get(RETRY_AFTER)?.to_str().ok()?)
}

/// Map a non-success HTTP status to an `AnalyzerError`.
/// 429 is rate limiting, 401/403 are fatal, 408 and 5xx are transient and any other
/// status means the request or reply was malformed.
pub fn classify_status(status: u16, retry_after: Option<Duration>, detail: &str) -> AnalyzerError {
    match status {
        429 => AnalyzerError::RateLimited { retry_after },
        401 | 403 => AnalyzerError::Fatal(format!("analyzer rejected credentials ({status}): {detail}")),
        408 | 500..=599 => AnalyzerError::Transient(format!("{status}: {detail}")),
        _ => AnalyzerError::Malformed(format!("{status}: {detail}")),
    }
}

/// `choices[0].message.content` of a chat-completions response.
pub fn completion_text(payload: &Value) -> Option<String> {
    payload
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

impl TextAnalyzer for OpenAiAnalyzer {
    fn analyze(&self, instruction: &str, body: &str) -> Result<String, AnalyzerError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(instruction, body))
            .send()
            .map_err(|e| AnalyzerError::Transient(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = resp.status();
        if !status.is_success() {
            let wait = retry_after(resp.headers());
            let detail = resp.text().unwrap_or_default();
            let detail: String = detail.chars().take(500).collect();
            return Err(classify_status(status.as_u16(), wait, &detail));
        }

        let payload: Value = resp
            .json()
            .map_err(|e| AnalyzerError::Malformed(format!("response is not JSON: {e}")))?;
        completion_text(&payload)
            .ok_or_else(|| AnalyzerError::Malformed("response has no choices[0].message.content".into()))
    }
}
