//! Self-tuning request pacing shared by every external-call client.
//!
//! Two mechanisms compose here. [`AdaptiveRateLimiter`] owns the ambient
//! spacing between *all* requests a client issues and persists across
//! requests. [`RetryPolicy`] only governs how long to wait before reissuing
//! one logical request that failed.

use std::{
    future::Future,
    sync::Mutex as StdMutex,
    time::Duration,
};

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

use crate::error::{FetchError, Outcome};

const SLOWDOWN_BLOCKED: f64 = 5.0;
const SLOWDOWN_RATE_LIMITED: f64 = 3.0;
const SLOWDOWN_SERVER_ERROR: f64 = 2.0;
const SLOWDOWN_OTHER: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub initial_delay: Duration,
    /// Floor the delay never drops below.
    pub min_delay: Duration,
    /// Ceiling the delay never exceeds.
    pub max_delay: Duration,
    /// Consecutive successes needed before the delay shrinks.
    pub success_threshold: u32,
    pub speedup_factor: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            success_threshold: 5,
            speedup_factor: 0.8,
        }
    }
}

impl LimiterConfig {
    /// No pacing at all; used by tests and offline tooling.
    pub fn unpaced() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            success_threshold: 5,
            speedup_factor: 0.8,
        }
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_nanos((delay.as_nanos() as f64 * factor).round() as u64)
}

fn slowdown_factor(outcome: Outcome) -> f64 {
    match outcome {
        Outcome::Blocked => SLOWDOWN_BLOCKED,
        Outcome::RateLimited => SLOWDOWN_RATE_LIMITED,
        Outcome::ServerError => SLOWDOWN_SERVER_ERROR,
        Outcome::OtherError | Outcome::Success => SLOWDOWN_OTHER,
    }
}

/// Pure pacing state machine; no clocks, no I/O.
#[derive(Debug, Clone)]
pub struct PacingState {
    delay: Duration,
    min_delay: Duration,
    max_delay: Duration,
    success_threshold: u32,
    speedup_factor: f64,
    consecutive_successes: u32,
    consecutive_errors: u32,
}

impl PacingState {
    pub fn new(config: &LimiterConfig) -> Self {
        let min_delay = config.min_delay;
        let max_delay = config.max_delay.max(min_delay);
        Self {
            delay: config.initial_delay.clamp(min_delay, max_delay),
            min_delay,
            max_delay,
            success_threshold: config.success_threshold.max(1),
            speedup_factor: config.speedup_factor,
            consecutive_successes: 0,
            consecutive_errors: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Applies one request outcome and returns the new delay.
    pub fn record(&mut self, outcome: Outcome) -> Duration {
        if outcome == Outcome::Success {
            self.consecutive_successes += 1;
            self.consecutive_errors = 0;
            if self.consecutive_successes >= self.success_threshold {
                self.delay =
                    scale(self.delay, self.speedup_factor).clamp(self.min_delay, self.max_delay);
                self.consecutive_successes = 0;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_errors += 1;
            self.delay =
                scale(self.delay, slowdown_factor(outcome)).clamp(self.min_delay, self.max_delay);
        }
        self.delay
    }
}

/// One instance per external client (registry search, enrichment, each geocoder).
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    name: String,
    pacing: StdMutex<PacingState>,
    next_slot: Mutex<Option<Instant>>,
}

impl AdaptiveRateLimiter {
    pub fn new(name: impl Into<String>, config: &LimiterConfig) -> Self {
        Self {
            name: name.into(),
            pacing: StdMutex::new(PacingState::new(config)),
            next_slot: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_delay(&self) -> Duration {
        self.with_pacing(|p| p.delay())
    }

    /// Waits until this client may issue its next request and reserves the slot.
    pub async fn acquire(&self) {
        let delay = self.current_delay();
        let mut guard = self.next_slot.lock().await;
        if let Some(slot) = *guard {
            let now = Instant::now();
            if slot > now {
                sleep(slot - now).await;
            }
        }
        *guard = Some(Instant::now() + delay);
    }

    pub fn record(&self, outcome: Outcome) {
        let (before, after, errors) = self.with_pacing(|p| {
            let before = p.delay();
            let after = p.record(outcome);
            (before, after, p.consecutive_errors())
        });
        if before == after {
            return;
        }
        if outcome == Outcome::Success {
            tracing::debug!(
                limiter = %self.name,
                "speeding up: {}ms -> {}ms",
                before.as_millis(),
                after.as_millis()
            );
        } else {
            tracing::debug!(
                limiter = %self.name,
                ?outcome,
                consecutive_errors = errors,
                "slowing down: {}ms -> {}ms",
                before.as_millis(),
                after.as_millis()
            );
        }
    }

    pub fn record_result<T>(&self, result: &Result<T, FetchError>) {
        match result {
            Ok(_) => self.record(Outcome::Success),
            Err(err) => self.record(err.outcome()),
        }
    }

    fn with_pacing<R>(&self, f: impl FnOnce(&mut PacingState) -> R) -> R {
        let mut guard = match self.pacing.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// Per-request retry schedule; independent of the ambient limiter delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before reissuing a request whose `attempt`-th try failed with `err`.
    pub fn delay_for(&self, attempt: u32, err: &FetchError) -> Duration {
        if let Some(retry_after) = err.retry_after() {
            return retry_after.min(self.max_delay.max(self.base_delay));
        }
        let severity = match err {
            FetchError::Blocked(_) => 3.0,
            FetchError::RateLimited { .. } => 2.0,
            _ => 1.0,
        };
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent) * severity;
        scale(self.base_delay, factor).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
///
/// Returns the final result together with the number of attempts made.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> (Result<T, FetchError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let wait = policy.delay_for(attempt, &err);
                tracing::debug!(
                    "{label}: attempt {attempt}/{attempts} failed ({err}); retrying in {}ms",
                    wait.as_millis()
                );
                if !wait.is_zero() {
                    sleep(wait).await;
                }
                attempt += 1;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}
