//! Per-candidate reliability ledger.
//!
//! Every pool member carries a [`ResourceHealth`] record: observed
//! successes, failures, accumulated latency and the cooldown bookkeeping
//! that temporarily quarantines candidates which keep failing. The record
//! only ever changes through [`ResourceHealth::record_success`],
//! [`ResourceHealth::record_failure`] and [`ResourceHealth::reset`].

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Consecutive failures before a resource starts cooling down
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Cooldown applied when the threshold is first reached
const DEFAULT_BASE_COOLDOWN: Duration = Duration::from_secs(60);

/// Upper bound for a single cooldown period
const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(3600);

/// Controls when and for how long a failing resource is quarantined.
///
/// After `threshold` consecutive failures the resource cools down for
/// `base * 2^(consecutive - threshold)`, capped at `max`. External
/// resources often recover, so the quarantine is always temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownPolicy {
    /// Consecutive failures that trigger the first cooldown
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Duration of the first cooldown period
    #[serde(default = "default_base_cooldown", with = "humantime_serde")]
    pub base: Duration,

    /// Longest cooldown a resource can be assigned
    #[serde(default = "default_max_cooldown", with = "humantime_serde")]
    pub max: Duration,
}

const fn default_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

const fn default_base_cooldown() -> Duration {
    DEFAULT_BASE_COOLDOWN
}

const fn default_max_cooldown() -> Duration {
    DEFAULT_MAX_COOLDOWN
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILURE_THRESHOLD,
            base: DEFAULT_BASE_COOLDOWN,
            max: DEFAULT_MAX_COOLDOWN,
        }
    }
}

impl CooldownPolicy {
    /// Cooldown duration for the given consecutive failure count, or `None`
    /// while the count is still below the threshold.
    #[must_use]
    pub fn duration_for(&self, consecutive_failures: u32) -> Option<Duration> {
        if consecutive_failures < self.threshold {
            return None;
        }
        let exponent = consecutive_failures - self.threshold;
        // Saturate instead of overflowing for absurd failure streaks
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }
}

/// Reliability counters for a single pool candidate.
#[derive(Debug, Clone)]
pub struct ResourceHealth {
    /// Whether the resource takes part in ranking at all
    pub enabled: bool,
    /// Number of successful uses
    pub success_count: u64,
    /// Number of failed uses
    pub failure_count: u64,
    /// Sum of latencies over all successful uses
    pub total_latency: Duration,
    /// Wall-clock time of the most recent success
    pub last_success_at: Option<SystemTime>,
    /// Wall-clock time of the most recent failure
    pub last_failure_at: Option<SystemTime>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// End of the current quarantine, if any
    pub cooldown_until: Option<Instant>,
}

impl Default for ResourceHealth {
    fn default() -> Self {
        Self {
            enabled: true,
            success_count: 0,
            failure_count: 0,
            total_latency: Duration::ZERO,
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }
}

impl ResourceHealth {
    /// Observed success rate in `[0.0, 1.0]`.
    ///
    /// A candidate without any observations reports `0.5`: unproven
    /// resources rank in the middle of the field, so they receive traffic
    /// and can prove themselves without displacing known performers. This
    /// default applies uniformly to every pool type.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.5
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = self.success_count as f64 / total as f64;
            rate
        }
    }

    /// Average latency over successful uses, if there were any.
    #[must_use]
    pub fn avg_latency(&self) -> Option<Duration> {
        if self.success_count == 0 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        Some(self.total_latency / (self.success_count as u32))
    }

    /// Average latency in seconds, `+inf` without successes.
    ///
    /// Used as a sort key: resources that never succeeded sort behind
    /// everything with a measured latency.
    #[must_use]
    pub fn avg_latency_secs(&self) -> f64 {
        self.avg_latency()
            .map_or(f64::INFINITY, |d| d.as_secs_f64())
    }

    /// Total number of recorded observations.
    #[must_use]
    pub const fn observations(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Whether the resource is currently quarantined.
    #[must_use]
    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Record a successful use. Clears any cooldown and the consecutive
    /// failure streak.
    pub fn record_success(&mut self, latency: Duration) {
        self.success_count += 1;
        self.total_latency += latency;
        self.last_success_at = Some(SystemTime::now());
        self.consecutive_failures = 0;
        self.cooldown_until = None;
    }

    /// Record a failed use. Once the streak reaches the policy threshold
    /// the resource enters an exponentially growing cooldown.
    pub fn record_failure(&mut self, policy: Option<&CooldownPolicy>) {
        self.failure_count += 1;
        self.last_failure_at = Some(SystemTime::now());
        self.consecutive_failures += 1;

        if let Some(policy) = policy {
            if let Some(duration) = policy.duration_for(self.consecutive_failures) {
                self.cooldown_until = Some(Instant::now() + duration);
            }
        }
    }

    /// Clear all counters and any cooldown, keeping the enabled flag.
    pub fn reset(&mut self) {
        let enabled = self.enabled;
        *self = Self::default();
        self.enabled = enabled;
    }
}

/// A pool entry: an immutable descriptor plus its mutable health record
/// behind its own lock.
///
/// Each candidate gets a dedicated mutex so concurrent fetches touching
/// different resources never contend, and the lock is only held for
/// plain field updates (never across an await point).
#[derive(Debug)]
pub struct Tracked<R> {
    descriptor: R,
    health: Mutex<ResourceHealth>,
}

/// Anything that can live in a ranked pool: it only needs a stable id.
pub trait Resource {
    /// Unique identifier within its pool
    fn id(&self) -> &str;
}

impl<R: Resource> Tracked<R> {
    pub(crate) fn new(descriptor: R) -> Self {
        Self {
            descriptor,
            health: Mutex::new(ResourceHealth::default()),
        }
    }

    /// The immutable descriptor
    pub fn descriptor(&self) -> &R {
        &self.descriptor
    }

    /// The resource id
    pub fn id(&self) -> &str {
        self.descriptor.id()
    }

    /// A snapshot copy of the current health record
    ///
    /// # Panics
    ///
    /// Panics if the health mutex is poisoned
    #[must_use]
    pub fn health(&self) -> ResourceHealth {
        self.health.lock().expect("health mutex poisoned").clone()
    }

    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut ResourceHealth) -> T) -> T {
        let mut health = self.health.lock().expect("health mutex poisoned");
        f(&mut health)
    }
}
