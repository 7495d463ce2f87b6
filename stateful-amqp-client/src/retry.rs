//! Retry schedulers for transport reconnection
//!
//! A scheduler is a small synchronous policy object. The reconnection loop
//! asks it three things:
//! - Is another attempt allowed? (`has_next`)
//! - How long to wait before that attempt? (`next_interval`)
//! - How long may one attempt take? (`operation_timeout`)
//!
//! A fresh scheduler is created for every reconnection episode through a
//! [`RetrySchedulerSupplier`], so attempt counters never leak between
//! episodes.
//!
//! # Built-in Schedulers
//!
//! - **ExponentialBackoff**: jittered, geometrically growing intervals (recommended)
//! - **FixedRate**: constant interval, bounded attempts
//! - **NoRetry**: never waits for another attempt
//!
//! # Examples
//!
//! ```rust
//! use stateful_amqp_client::{ExponentialBackoff, RetryScheduler};
//! use std::time::Duration;
//!
//! let mut scheduler = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1))
//!     .with_max_retries(3);
//!
//! while scheduler.has_next() {
//!     let wait = scheduler.next_interval().unwrap();
//!     assert!(wait <= Duration::from_secs(1));
//! }
//! assert!(scheduler.next_interval().is_err());
//! ```

use rand::Rng;
use stateful_amqp_core::settings::DEFAULT_OPERATION_TIMEOUT;
use stateful_amqp_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Policy deciding whether and when a failed operation is retried
pub trait RetryScheduler: Send + Sync {
    /// Whether `next_interval` would hand out another interval
    fn has_next(&self) -> bool;

    /// Consume one attempt and return the wait before it
    ///
    /// Fails with `Error::RetryExhausted` once `has_next` is false.
    fn next_interval(&mut self) -> Result<Duration>;

    /// Upper bound for a single attempt, independent of the retry cadence
    fn operation_timeout(&self) -> Duration;
}

/// Factory producing a fresh scheduler per reconnection episode
pub type RetrySchedulerSupplier = Arc<dyn Fn() -> Box<dyn RetryScheduler> + Send + Sync>;

/// Exponential backoff with symmetric jitter
///
/// Each call to `next_interval` returns the current interval randomized by
/// `±current × jitter`, clamped to `[0, max_interval]`, and then grows the
/// current interval by `multiplier` (never beyond `max_interval`).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_retries: Option<u32>,
    initial_interval: Duration,
    max_interval: Duration,
    jitter: f64,
    multiplier: f64,
    operation_timeout: Duration,
    current_interval: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create an unbounded backoff growing from `initial_interval` to `max_interval`
    ///
    /// Jitter defaults to 0.5 and the multiplier to 1.5.
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        let max_interval = max_interval.max(initial_interval);
        Self {
            max_retries: None,
            initial_interval,
            max_interval,
            jitter: 0.5,
            multiplier: 1.5,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            current_interval: initial_interval,
            attempts: 0,
        }
    }

    /// Backoff used by the transport handler for reconnection: unbounded,
    /// 1s to 5min, jitter 0.25, multiplier 1.25
    pub fn for_reconnect(operation_timeout: Duration) -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
            .with_jitter(0.25)
            .with_multiplier(1.25)
            .with_operation_timeout(operation_timeout)
    }

    /// Stop after `max_retries` intervals
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Jitter fraction, clamped to `[0, 1]`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    /// Growth factor, at least 1.0
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Number of intervals handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over from the initial interval
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_interval = self.initial_interval;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

impl RetryScheduler for ExponentialBackoff {
    fn has_next(&self) -> bool {
        self.max_retries.map_or(true, |max| self.attempts < max)
    }

    fn next_interval(&mut self) -> Result<Duration> {
        if !self.has_next() {
            return Err(Error::RetryExhausted {
                attempts: self.attempts,
            });
        }
        self.attempts = self.attempts.saturating_add(1);

        let current = self.current_interval.as_secs_f64();
        let max = self.max_interval.as_secs_f64();
        let delta = current * self.jitter;
        let randomized = if delta > 0.0 {
            current - delta + rand::thread_rng().gen::<f64>() * 2.0 * delta
        } else {
            current
        };

        // Near Duration::MAX the f64 round trip can overflow; saturate at the cap
        self.current_interval = Duration::try_from_secs_f64((current * self.multiplier).min(max))
            .unwrap_or(self.max_interval);
        Ok(Duration::try_from_secs_f64(randomized.clamp(0.0, max)).unwrap_or(self.max_interval))
    }

    fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
}

/// Constant interval between a bounded number of attempts
#[derive(Debug, Clone)]
pub struct FixedRate {
    interval: Duration,
    max_retries: u32,
    operation_timeout: Duration,
    attempts: u32,
}

impl FixedRate {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            attempts: 0,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

impl RetryScheduler for FixedRate {
    fn has_next(&self) -> bool {
        self.attempts < self.max_retries
    }

    fn next_interval(&mut self) -> Result<Duration> {
        if !self.has_next() {
            return Err(Error::RetryExhausted {
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        Ok(self.interval)
    }

    fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
}

/// Scheduler that never grants a retry
#[derive(Debug, Clone)]
pub struct NoRetry {
    operation_timeout: Duration,
}

impl NoRetry {
    /// The timeout still bounds the single attempt the caller makes
    pub fn new(operation_timeout: Duration) -> Self {
        Self { operation_timeout }
    }
}

impl Default for NoRetry {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TIMEOUT)
    }
}

impl RetryScheduler for NoRetry {
    fn has_next(&self) -> bool {
        false
    }

    fn next_interval(&mut self) -> Result<Duration> {
        Err(Error::RetryExhausted { attempts: 0 })
    }

    fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
}
