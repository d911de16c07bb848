//! Request pacing.
//!
//! [`RateLimiter`] is a token bucket with continuous refill plus a
//! multiplicative backoff factor: failures stretch every wait, sustained
//! success decays the factor back toward 1. [`AdaptiveRateLimiter`] layers
//! outcome counting on top and retunes the base rate itself.
//!
//! The limiter serializes *issuance* of requests: no matter how many
//! tasks call [`RateLimiter::acquire`] concurrently, long-run throughput
//! never exceeds the configured rate.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, sleep};

/// Multiplier applied to the backoff factor on each triggered backoff
const BACKOFF_GROWTH: f64 = 2.0;

/// Decay applied to the backoff factor on a successful, unblocked acquire
const BACKOFF_DECAY: f64 = 0.9;

/// Default ceiling for the backoff factor
const DEFAULT_MAX_BACKOFF: f64 = 60.0;

/// Observations between rate adjustments of the adaptive limiter
const ADJUSTMENT_THRESHOLD: u64 = 10;

#[derive(Debug)]
struct BucketState {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    backoff_factor: f64,
    total_acquires: u64,
    blocked_acquires: u64,
    backoff_events: u64,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
    }
}

/// Snapshot of limiter state and counters, for monitoring collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    /// Total `acquire` calls
    pub total_acquires: u64,
    /// Acquires that had to wait for a token
    pub blocked_acquires: u64,
    /// Times the backoff factor was raised
    pub backoff_events: u64,
    /// Current sustained rate (requests per second)
    pub current_rate: f64,
    /// Tokens currently in the bucket
    pub current_tokens: f64,
    /// Current backoff multiplier
    pub backoff_factor: f64,
    /// Fraction of acquires that were blocked
    pub block_rate: f64,
}

/// Token bucket rate limiter with exponential backoff.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    max_backoff: f64,
}

impl RateLimiter {
    /// Create a limiter allowing `rate` requests per second. The bucket
    /// starts full, so an initial burst of up to `rate` requests passes
    /// without waiting.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate,
                tokens: rate,
                last_refill: Instant::now(),
                backoff_factor: 1.0,
                total_acquires: 0,
                blocked_acquires: 0,
                backoff_events: 0,
            }),
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    /// Take one token, waiting if the bucket is empty.
    ///
    /// When a token is available it is consumed immediately and the
    /// backoff factor decays toward 1. Otherwise the caller sleeps for
    /// `(1 - tokens) / rate * backoff_factor`, then consumes a token even
    /// if the refill came up fractionally short — a slight overdraft that
    /// avoids re-queueing behind later callers.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock().expect("limiter lock poisoned");
            state.total_acquires += 1;
            state.refill(Instant::now());

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                if state.backoff_factor > 1.0 {
                    state.backoff_factor = (state.backoff_factor * BACKOFF_DECAY).max(1.0);
                }
                None
            } else {
                state.blocked_acquires += 1;
                let secs = (1.0 - state.tokens) / state.rate * state.backoff_factor;
                Some(Duration::from_secs_f64(secs))
            }
        };

        if let Some(wait) = wait {
            log::debug!("rate limit reached, waiting {:.2}s", wait.as_secs_f64());
            sleep(wait).await;
            let mut state = self.state.lock().expect("limiter lock poisoned");
            state.refill(Instant::now());
            state.tokens -= 1.0;
        }
    }

    /// Multiply the backoff factor, capped at the configured maximum.
    pub fn set_backoff(&self, factor: f64) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let old = state.backoff_factor;
        state.backoff_factor = (state.backoff_factor * factor).min(self.max_backoff);
        if state.backoff_factor > old {
            state.backoff_events += 1;
            log::info!(
                "backoff factor raised: {:.2} -> {:.2}",
                old,
                state.backoff_factor
            );
        }
    }

    /// Double the backoff factor.
    pub fn trigger_exponential_backoff(&self) {
        self.set_backoff(BACKOFF_GROWTH);
    }

    /// Reset the backoff factor to 1.
    pub fn reset_backoff(&self) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        if state.backoff_factor > 1.0 {
            log::info!("backoff factor reset: {:.2} -> 1.0", state.backoff_factor);
            state.backoff_factor = 1.0;
        }
    }

    /// Change the sustained rate, rescaling the available tokens
    /// proportionally and clamping them to the new capacity.
    pub fn update_rate(&self, new_rate: f64) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let old_rate = state.rate;
        state.rate = new_rate;
        if new_rate > old_rate {
            state.tokens = (state.tokens * (new_rate / old_rate)).min(new_rate);
        } else {
            state.tokens = state.tokens.min(new_rate);
        }
        log::info!("request rate updated: {old_rate} -> {new_rate} req/s");
    }

    /// Current sustained rate.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.state.lock().expect("limiter lock poisoned").rate
    }

    /// Current backoff multiplier.
    #[must_use]
    pub fn backoff_factor(&self) -> f64 {
        self.state
            .lock()
            .expect("limiter lock poisoned")
            .backoff_factor
    }

    /// Snapshot the limiter counters.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().expect("limiter lock poisoned");
        let block_rate = if state.total_acquires == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = state.blocked_acquires as f64 / state.total_acquires as f64;
            rate
        };
        RateLimiterStats {
            total_acquires: state.total_acquires,
            blocked_acquires: state.blocked_acquires,
            backoff_events: state.backoff_events,
            current_rate: state.rate,
            current_tokens: state.tokens,
            backoff_factor: state.backoff_factor,
            block_rate,
        }
    }
}

/// A rate limiter that retunes its own rate from observed outcomes.
///
/// Every 10 recorded observations the success rate is inspected: above
/// 0.9 the rate grows by 20% (up to `max_rate`), below 0.7 it shrinks by
/// 20% (down to `min_rate`). The observation window resets after each
/// decision.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    limiter: RateLimiter,
    min_rate: f64,
    max_rate: f64,
    window: Mutex<(u64, u64)>,
}

impl AdaptiveRateLimiter {
    /// Create an adaptive limiter starting at `initial_rate`, bounded by
    /// `min_rate` and `max_rate`.
    #[must_use]
    pub fn new(initial_rate: f64, min_rate: f64, max_rate: f64) -> Self {
        Self {
            limiter: RateLimiter::new(initial_rate),
            min_rate,
            max_rate,
            window: Mutex::new((0, 0)),
        }
    }

    /// The wrapped token bucket.
    #[must_use]
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// See [`RateLimiter::acquire`].
    pub async fn acquire(&self) {
        self.limiter.acquire().await;
    }

    /// See [`RateLimiter::trigger_exponential_backoff`].
    pub fn trigger_exponential_backoff(&self) {
        self.limiter.trigger_exponential_backoff();
    }

    /// See [`RateLimiter::reset_backoff`].
    pub fn reset_backoff(&self) {
        self.limiter.reset_backoff();
    }

    /// Current sustained rate.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.limiter.rate()
    }

    /// Snapshot the limiter counters.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    /// Record a successful request outcome.
    pub fn record_success(&self) {
        self.observe(true);
    }

    /// Record a failed request outcome.
    pub fn record_failure(&self) {
        self.observe(false);
    }

    fn observe(&self, success: bool) {
        let mut window = self.window.lock().expect("window lock poisoned");
        if success {
            window.0 += 1;
        } else {
            window.1 += 1;
        }

        let total = window.0 + window.1;
        if total < ADJUSTMENT_THRESHOLD {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let success_rate = window.0 as f64 / total as f64;
        *window = (0, 0);
        drop(window);

        let rate = self.limiter.rate();
        if success_rate > 0.9 {
            let new_rate = (rate * 1.2).min(self.max_rate);
            if (new_rate - rate).abs() > f64::EPSILON {
                log::info!("high success rate ({success_rate:.2}), raising request rate");
                self.limiter.update_rate(new_rate);
            }
        } else if success_rate < 0.7 {
            let new_rate = (rate * 0.8).max(self.min_rate);
            if (new_rate - rate).abs() > f64::EPSILON {
                log::info!("low success rate ({success_rate:.2}), lowering request rate");
                self.limiter.update_rate(new_rate);
            }
        }
    }
}
