#[path = "common/mod.rs"]
mod common;

use common::*;
use sentiment_etl::{
    classify_status, completion_text, parse_retry_after, split, AnalyzerError, AnalyzerOptions, ChunkOutcome, ChunkProcessor, OpenAiAnalyzer,
    OutputSchema, RateLimit, RateLimiter, RetryingAnalyzer, TextAnalyzer, ERROR_SENTINEL,
};
use serde_json::json;
use std::time::{Duration, Instant};

fn fast_retry(inner: ScriptedAnalyzer, retries: usize) -> RetryingAnalyzer<ScriptedAnalyzer> {
    RetryingAnalyzer::new(inner)
        .with_max_retries(retries)
        .with_retry_delay(Duration::from_millis(1))
}

/// Rate limits are written as CALLS/SECONDS.
#[test]
fn rate_limit_parses() {
    let r: RateLimit = "3500/60".parse().unwrap();
    assert_eq!(r.calls, 3500);
    assert_eq!(r.period, Duration::from_secs(60));
    assert_eq!(RateLimit::default(), r);
    assert!("0/60".parse::<RateLimit>().is_err());
    assert!("fast".parse::<RateLimit>().is_err());
    assert!("1/1e30".parse::<RateLimit>().is_err());
    assert!("1/inf".parse::<RateLimit>().is_err());
}

/// Once the window is full, `try_acquire` reports how long until the next slot.
#[test]
fn limiter_refuses_when_window_is_full() {
    let limiter = RateLimiter::new(RateLimit::new(2, Duration::from_secs(10)));
    assert!(limiter.try_acquire().is_ok());
    assert!(limiter.try_acquire().is_ok());
    let wait = limiter.try_acquire().unwrap_err();
    assert!(wait > Duration::ZERO && wait <= Duration::from_secs(10));
}

/// `acquire` blocks the caller until the window frees up instead of failing.
#[test]
fn limiter_blocks_until_slot_frees() {
    let limiter = RateLimiter::new(RateLimit::new(1, Duration::from_millis(60)));
    let start = Instant::now();
    limiter.acquire();
    limiter.acquire();
    assert!(start.elapsed() >= Duration::from_millis(50));
}

/// Rate-limited and transient failures are retried; the eventual reply is returned.
#[test]
fn retries_rate_limits_and_transient_errors() {
    let inner = ScriptedAnalyzer::new(Vec::<String>::new())
        .then_err(AnalyzerError::RateLimited { retry_after: Some(Duration::from_millis(1)) })
        .then_err(AnalyzerError::Transient("502".into()))
        .then_reply("ok");
    let a = fast_retry(inner, 3);
    assert_eq!(a.analyze("i", "b").unwrap(), "ok");
    assert_eq!(a.inner().calls(), 3);
}

/// After the retry budget is spent the last error is returned.
#[test]
fn gives_up_after_max_retries() {
    let inner = ScriptedAnalyzer::new(Vec::<String>::new())
        .then_err(AnalyzerError::Transient("1".into()))
        .then_err(AnalyzerError::Transient("2".into()))
        .then_err(AnalyzerError::Transient("3".into()))
        .then_reply("too late");
    let a = fast_retry(inner, 2);
    match a.analyze("i", "b") {
        Err(AnalyzerError::Transient(msg)) => assert_eq!(msg, "3"),
        other => panic!("expected transient error, got {other:?}"),
    }
    assert_eq!(a.inner().calls(), 3);
}

/// Malformed exchanges and fatal errors are not retried.
#[test]
fn malformed_and_fatal_are_not_retried() {
    let a = fast_retry(ScriptedAnalyzer::new(Vec::<String>::new()).then_err(AnalyzerError::Malformed("400".into())), 5);
    assert!(matches!(a.analyze("i", "b"), Err(AnalyzerError::Malformed(_))));
    assert_eq!(a.inner().calls(), 1);

    let a = fast_retry(ScriptedAnalyzer::new(Vec::<String>::new()).then_err(AnalyzerError::Fatal("401".into())), 5);
    let err = a.analyze("i", "b").unwrap_err();
    assert!(err.is_fatal() && !err.is_retryable());
    assert_eq!(a.inner().calls(), 1);
}

/// The chat-completions reply text lives at choices[0].message.content.
#[test]
fn completion_text_extraction() {
    let payload = json!({"choices": [{"message": {"role": "assistant", "content": "Category,Mentions"}}]});
    assert_eq!(completion_text(&payload).as_deref(), Some("Category,Mentions"));
    assert_eq!(completion_text(&json!({"choices": []})), None);
}

/// HTTP statuses map onto the retry policy: 429 carries the server's wait, bad
/// credentials stop the run, server trouble is retried, anything else is malformed.
#[test]
fn http_status_classification() {
    let wait = Some(Duration::from_secs(7));
    assert!(matches!(classify_status(429, wait, ""), AnalyzerError::RateLimited { retry_after } if retry_after == wait));
    assert!(matches!(classify_status(429, None, ""), AnalyzerError::RateLimited { retry_after: None }));
    for status in [401, 403] {
        let err = classify_status(status, None, "bad key");
        assert!(err.is_fatal(), "{status}");
    }
    for status in [408, 500, 502, 503, 599] {
        let err = classify_status(status, None, "");
        assert!(matches!(err, AnalyzerError::Transient(_)), "{status}");
        assert!(err.is_retryable());
    }
    for status in [400, 404, 422] {
        let err = classify_status(status, None, "");
        assert!(matches!(err, AnalyzerError::Malformed(_)), "{status}");
        assert!(!err.is_retryable() && !err.is_fatal());
    }
}

/// Retry-After is read as seconds; dates, negatives and values too large for a
/// duration fall back to the fixed delay instead of aborting.
#[test]
fn retry_after_header_values() {
    assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
    assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
    assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    assert_eq!(parse_retry_after("1e30"), None);
    assert_eq!(parse_retry_after("inf"), None);
    assert_eq!(parse_retry_after("NaN"), None);
    assert_eq!(parse_retry_after("-5"), None);
    assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
}

/// A rate-limited reply with a huge server wait is retried after the fixed delay.
#[test]
fn oversized_server_wait_is_retried() {
    let inner = ScriptedAnalyzer::new(Vec::<String>::new())
        .then_err(classify_status(429, parse_retry_after("1e30"), "slow down"))
        .then_reply(flat_reply(&[("Positive", 1)]));
    let retrying = fast_retry(inner, 2);
    assert!(retrying.analyze("i", "b").is_ok());
    assert_eq!(retrying.inner().calls(), 2);
}

/// The HTTP analyzer refuses to start without credentials.
#[test]
fn http_analyzer_requires_api_key() {
    let opts = AnalyzerOptions { api_key: None, ..AnalyzerOptions::default() };
    assert!(OpenAiAnalyzer::new(&opts).is_err());
    assert!(OpenAiAnalyzer::new(&opts.with_api_key("sk-test")).is_ok());
}

/// The processor maps each analyzer outcome onto a chunk outcome: parsed results,
/// skips for the sentinel, recoverable errors and unparseable replies, and an error
/// only for fatal failures.
#[test]
fn processor_outcomes() {
    let recs = records(&[(1, "a"), (2, "b")]);
    let chunk = split(&recs, 2).iter().next().unwrap();

    let good = ScriptedAnalyzer::always(flat_reply(&[("Sentiments: Positive", 2)]));
    match ChunkProcessor::new(&good, OutputSchema::FlatCsvV1).process(&chunk).unwrap() {
        ChunkOutcome::Analyzed(r) => assert_eq!(r.mentions("sentiments: positive"), Some(2)),
        other => panic!("expected analyzed, got {other:?}"),
    }
    assert_eq!(good.bodies(), vec!["a\nb".to_string()]);

    let sentinel = ScriptedAnalyzer::always(format!("  {ERROR_SENTINEL}\n"));
    let out = ChunkProcessor::new(&sentinel, OutputSchema::FlatCsvV1).process(&chunk).unwrap();
    assert!(!out.is_analyzed());

    let garbage = ScriptedAnalyzer::always("no table here");
    let out = ChunkProcessor::new(&garbage, OutputSchema::FlatCsvV1).process(&chunk).unwrap();
    assert!(matches!(out, ChunkOutcome::Skipped { .. }));

    let flaky = ScriptedAnalyzer::new(Vec::<String>::new()).then_err(AnalyzerError::RateLimited { retry_after: None });
    let out = ChunkProcessor::new(&flaky, OutputSchema::FlatCsvV1).process(&chunk).unwrap();
    assert!(matches!(out, ChunkOutcome::Skipped { .. }));

    let fatal = ScriptedAnalyzer::new(Vec::<String>::new()).then_err(AnalyzerError::Fatal("quota closed".into()));
    assert!(ChunkProcessor::new(&fatal, OutputSchema::FlatCsvV1).process(&chunk).is_err());
}
