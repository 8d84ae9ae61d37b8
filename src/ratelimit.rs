//! Client-side sliding-window rate limiting for analyzer calls.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// At most `calls` requests in any `period`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub calls: u32,
    pub period: Duration,
}

impl RateLimit {
    pub fn new(calls: u32, period: Duration) -> Self {
        Self { calls: calls.max(1), period }
    }

    pub fn per_minute(calls: u32) -> Self {
        Self::new(calls, Duration::from_secs(60))
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::per_minute(3500)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.calls, self.period.as_secs_f64())
    }
}

/// `"3500/60"`: calls per seconds.
impl FromStr for RateLimit {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (calls, secs) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected CALLS/SECONDS, got {s:?}"))?;
        let calls: u32 = calls.trim().parse().map_err(|e| format!("calls {calls:?}: {e}"))?;
        let secs: f64 = secs.trim().parse().map_err(|e| format!("seconds {secs:?}: {e}"))?;
        if calls == 0 || !secs.is_finite() || secs <= 0.0 {
            return Err(format!("rate limit must be positive, got {s:?}"));
        }
        let period = Duration::try_from_secs_f64(secs).map_err(|e| format!("seconds {secs}: {e}"))?;
        Ok(Self::new(calls, period))
    }
}

/// Sliding-window limiter shared by every attempt of a run.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self { limit, window: Mutex::new(VecDeque::with_capacity(limit.calls as usize)) }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take a slot if one is free; otherwise return how long until one frees up.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.window.lock();
        while window.front().is_some_and(|t| now.duration_since(*t) >= self.limit.period) {
            window.pop_front();
        }
        if window.len() < self.limit.calls as usize {
            window.push_back(now);
            return Ok(());
        }
        let oldest = window.front().copied().unwrap_or(now);
        Err(self.limit.period.saturating_sub(now.duration_since(oldest)))
    }

    /// Block until a slot is available.
    pub fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached; waiting");
                    sleep(wait.max(Duration::from_millis(1)));
                }
            }
        }
    }
}
