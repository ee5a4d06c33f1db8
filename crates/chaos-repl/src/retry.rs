//! Retry logic with exponential backoff.
//!
//! [`RetryExecutor`] drives client-side retries of writes; [`Backoff`] is the
//! non-blocking variant pullers use to space out attempts across ticks.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};

use chaos_meta::config::BackoffConfig;
use chaos_meta::error::{ChaosError, ChaosResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_backoff(&BackoffConfig::default(), 5)
    }
}

impl RetryConfig {
    /// Retry config built from a node or client backoff section.
    pub fn from_backoff(backoff: &BackoffConfig, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(backoff.initial_ms),
            max_backoff: Duration::from_millis(backoff.max_ms),
            backoff_multiplier: backoff.multiplier,
            jitter: true,
        }
    }
}

/// Computes `initial * multiplier^attempt`, capped at the maximum, plus up to
/// 50% jitter.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = config.initial_backoff.as_millis() as f64;
    let max_ms = config.max_backoff.as_millis() as f64;
    let capped = (base_ms * config.backoff_multiplier.powi(attempt as i32)).min(max_ms);

    if config.jitter && capped >= 2.0 {
        let jitter_ms = rand::thread_rng().gen_range(0..=(capped as u64 / 2));
        Duration::from_millis((capped as u64).saturating_add(jitter_ms))
    } else {
        Duration::from_millis(capped as u64)
    }
}

/// Executor for retried operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `operation`, retrying retryable errors with exponential backoff.
    ///
    /// `on_retry` runs before each retry with the error that caused it; the
    /// caller uses it to drop cached state such as replication cards.
    /// Permanent errors and the last error after `max_retries` are returned.
    pub async fn execute<F, Fut, T, R>(&self, mut operation: F, mut on_retry: R) -> ChaosResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ChaosResult<T>>,
        R: FnMut(&ChaosError),
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    tracing::debug!(attempt, error = %e, "retrying after transient error");
                    on_retry(&e);
                    tokio::time::sleep(compute_backoff(&self.config, attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Failure counter with a next-attempt deadline.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl Backoff {
    /// Fresh backoff; the first attempt may run immediately.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: RetryConfig::from_backoff(config, u32::MAX),
            failures: 0,
            next_attempt: None,
        }
    }

    /// Whether an attempt may run at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map(|at| now >= at).unwrap_or(true)
    }

    /// Records a failure and returns the delay until the next attempt.
    pub fn failure(&mut self, now: Instant) -> Duration {
        let delay = compute_backoff(&self.config, self.failures);
        self.failures = self.failures.saturating_add(1);
        self.next_attempt = Some(now + delay);
        delay
    }

    /// Records a success.
    pub fn success(&mut self) {
        self.failures = 0;
        self.next_attempt = None;
    }

    /// Consecutive failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
