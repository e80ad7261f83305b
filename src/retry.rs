//! Retry and backoff scheduling
//!
//! Pure policy-to-schedule computation plus error retryability
//! classification. The only side effect lives in [`Retrier::run`], which
//! sleeps between attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::{Error, Result};

/// Default retry/backoff settings shared across the harness
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 6;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1500);
pub const DEFAULT_RETRY_MAX_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;

/// Error text fragments considered transient when no policy list applies
const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "dial tcp",
    "connection reset",
    "connection refused",
    "client.timeout exceeded",
    "context deadline exceeded",
    "tls handshake timeout",
    "i/o timeout",
    "timed out",
    "temporary failure in name resolution",
    "no such host",
    "dns error",
    "eof",
    "too many requests",
    "rate limit",
    "status=429",
    "429",
    "503 service unavailable",
    "504 gateway timeout",
    "gateway timeout",
    "bad gateway",
    "retry-after",
];

/// Retry policy as declared in a scenario document
///
/// Every field is optional; scopes compose with [`RetryPolicy::compose`].
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: Option<u32>,
    pub interval: Option<String>,
    pub max_interval: Option<String>,
    pub backoff_factor: Option<f64>,
    pub jitter: Option<String>,
    #[serde(default)]
    pub only: Vec<String>,
    #[serde(default)]
    pub never: Vec<String>,
}

impl RetryPolicy {
    /// True when no field is set at this scope
    pub fn is_empty(&self) -> bool {
        self.attempts.is_none()
            && self.interval.is_none()
            && self.max_interval.is_none()
            && self.backoff_factor.is_none()
            && self.jitter.is_none()
            && self.only.is_empty()
            && self.never.is_empty()
    }

    /// Compose scopes ordered from least to most specific.
    ///
    /// For each field the most specific scope that sets it wins.
    pub fn compose(scopes: &[&RetryPolicy]) -> RetryPolicy {
        let mut out = RetryPolicy::default();
        for scope in scopes {
            if scope.attempts.is_some() {
                out.attempts = scope.attempts;
            }
            if scope.interval.is_some() {
                out.interval = scope.interval.clone();
            }
            if scope.max_interval.is_some() {
                out.max_interval = scope.max_interval.clone();
            }
            if scope.backoff_factor.is_some() {
                out.backoff_factor = scope.backoff_factor;
            }
            if scope.jitter.is_some() {
                out.jitter = scope.jitter.clone();
            }
            if !scope.only.is_empty() {
                out.only = scope.only.clone();
            }
            if !scope.never.is_empty() {
                out.never = scope.never.clone();
            }
        }
        out
    }

    /// Resolve the declared fields into a backoff configuration.
    ///
    /// An unset attempt count means a single attempt.
    pub fn backoff(&self) -> Result<BackoffConfig> {
        Ok(BackoffConfig {
            attempts: self.attempts.unwrap_or(1),
            base: parse_optional_duration(self.interval.as_deref())?.unwrap_or(Duration::ZERO),
            max: parse_optional_duration(self.max_interval.as_deref())?.unwrap_or(Duration::ZERO),
            factor: self.backoff_factor.unwrap_or(0.0),
            jitter: parse_optional_duration(self.jitter.as_deref())?.unwrap_or(Duration::ZERO),
        })
    }
}

/// Retry/backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base: DEFAULT_RETRY_INTERVAL,
            max: DEFAULT_RETRY_MAX_INTERVAL,
            factor: DEFAULT_RETRY_BACKOFF_FACTOR,
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffConfig {
    /// Apply harness defaults where values are missing or invalid
    pub fn normalized(mut self) -> Self {
        if self.attempts < 1 {
            self.attempts = 1;
        }
        if self.base.is_zero() {
            self.base = DEFAULT_RETRY_INTERVAL;
        }
        if self.max.is_zero() {
            self.max = DEFAULT_RETRY_MAX_INTERVAL;
        }
        if self.factor.is_nan() || self.factor <= 0.0 {
            self.factor = DEFAULT_RETRY_BACKOFF_FACTOR;
        }
        self
    }
}

/// Delays between attempts: `attempts - 1` entries,
/// `delay[i] = min(base * factor^i + uniform(0, jitter), max)`.
pub fn build_backoff_schedule(cfg: &BackoffConfig) -> Vec<Duration> {
    let cfg = cfg.normalized();
    let steps = cfg.attempts.saturating_sub(1) as usize;
    let mut schedule = Vec::with_capacity(steps);
    let mut next = cfg.base;
    for _ in 0..steps {
        let delay = (next + jitter_duration(cfg.jitter)).min(cfg.max);
        schedule.push(delay);
        if next < cfg.max {
            next = next.mul_f64(cfg.factor);
        }
    }
    schedule
}

/// Delay before the retry following zero-based `attempt`; zero once exhausted
pub fn backoff_delay(schedule: &[Duration], attempt: usize) -> Duration {
    schedule.get(attempt).copied().unwrap_or(Duration::ZERO)
}

fn jitter_duration(max: Duration) -> Duration {
    let nanos = max.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

/// Decide whether a failure warrants another attempt.
///
/// Deny-list matches win unconditionally; a non-empty allow-list is
/// exhaustive; otherwise structural error kinds and finally the default
/// transient patterns decide.
pub fn should_retry(err: &Error, detail: &str, only: &[String], never: &[String]) -> bool {
    let detail = detail.to_lowercase();

    if never
        .iter()
        .any(|pat| !pat.is_empty() && detail.contains(&pat.to_lowercase()))
    {
        return false;
    }

    if !only.is_empty() {
        return only
            .iter()
            .any(|pat| !pat.is_empty() && detail.contains(&pat.to_lowercase()));
    }

    if matches!(
        err.root(),
        Error::Transport(_) | Error::Timeout(_) | Error::SpawnFailed(_)
    ) {
        return true;
    }

    DEFAULT_RETRYABLE_PATTERNS
        .iter()
        .any(|pat| detail.contains(pat))
}

/// Parse a duration string such as `1500ms`, `2s`, `1m30s` or `0.5s`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = || Error::Config(format!("invalid duration '{}'", input));
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * seconds_per_unit;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_secs_f64(total))
}

fn parse_optional_duration(value: Option<&str>) -> Result<Option<Duration>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_duration(s).map(Some),
    }
}

/// Drives an operation through a resolved policy
#[derive(Debug, Clone)]
pub struct Retrier {
    schedule: Vec<Duration>,
    attempts: u32,
    only: Vec<String>,
    never: Vec<String>,
}

impl Retrier {
    /// Build from a composed policy
    pub fn from_policy(policy: &RetryPolicy) -> Result<Self> {
        let cfg = policy.backoff()?.normalized();
        Ok(Self {
            schedule: build_backoff_schedule(&cfg),
            attempts: cfg.attempts,
            only: policy.only.clone(),
            never: policy.never.clone(),
        })
    }

    /// A retrier that runs the operation exactly once
    pub fn once() -> Self {
        Self {
            schedule: Vec::new(),
            attempts: 1,
            only: Vec::new(),
            never: Vec::new(),
        }
    }

    /// Classify with the policy's allow/deny lists and the default heuristics
    pub fn should_retry(&self, err: &Error) -> bool {
        should_retry(err, &err.detail(), &self.only, &self.never)
    }

    /// Classify for checks that are expected to converge: any failure is
    /// retryable unless the policy's allow/deny lists say otherwise.
    pub fn permits(&self, err: &Error) -> bool {
        let detail = err.detail().to_lowercase();
        if self
            .never
            .iter()
            .any(|pat| !pat.is_empty() && detail.contains(&pat.to_lowercase()))
        {
            return false;
        }
        self.only.is_empty()
            || self
                .only
                .iter()
                .any(|pat| !pat.is_empty() && detail.contains(&pat.to_lowercase()))
    }

    /// Run `op` until it succeeds, `retryable` rejects the error, or the
    /// attempts are used up. The operation receives the zero-based attempt.
    pub async fn run<T, F, Fut, C>(&self, label: &str, retryable: C, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_authoring() || !retryable(&err) {
                debug!("{}: attempt {} failed, not retryable: {}", label, attempt + 1, err);
                return Err(err);
            }
            if attempt + 1 >= self.attempts {
                if self.attempts > 1 {
                    return Err(Error::RetryExhausted {
                        attempts: self.attempts,
                        source: Box::new(err),
                    });
                }
                return Err(err);
            }

            let delay = backoff_delay(&self.schedule, attempt as usize);
            warn!(
                "{}: attempt {}/{} failed, retrying in {:?}: {}",
                label,
                attempt + 1,
                self.attempts,
                delay,
                err
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
