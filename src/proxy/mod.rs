//! Proxy pool: ranked selection, ban handling and background probing.
//!
//! # State machine
//! ```text
//! Active --(3 failed probes)--> Failed --(1 successful probe)--> Active
//! {Active, Failed} --(ban detected)--> Banned --(manual reset)--> Active
//! ```
//!
//! Failed proxies are excluded from selection but keep being probed so
//! they can recover on their own. Banned proxies stay out until an
//! operator resets them: a ban usually means the exit IP is burned, and
//! probing it again would only confirm the ban.

pub mod probe;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use http::StatusCode;
use rand::Rng;
use serde::Serialize;
use url::Url;

use crate::error::Result;
use crate::health::{CooldownPolicy, Resource, Tracked};
use crate::pool::{RankedPool, TieBreak};

/// Consecutive failed probes before a proxy is marked [`ProxyStatus::Failed`]
const PROBE_FAILURE_THRESHOLD: u32 = 3;

/// Operational state of a proxy.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    /// Usable and eligible for selection
    Active = 0,
    /// Repeatedly failed probing; excluded but still probed
    Failed = 1,
    /// Ban signature observed; excluded until manually reset
    Banned = 2,
    /// A probe is currently in flight
    Checking = 3,
}

impl From<u8> for ProxyStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Failed,
            2 => Self::Banned,
            3 => Self::Checking,
            _ => Self::Active,
        }
    }
}

/// A single proxy endpoint and its operational state.
#[derive(Debug)]
pub struct ProxyEndpoint {
    url: Url,
    status: AtomicU8,
    probe_failures: AtomicU32,
}

impl ProxyEndpoint {
    fn new(url: Url) -> Self {
        Self {
            url,
            status: AtomicU8::new(ProxyStatus::Active as u8),
            probe_failures: AtomicU32::new(0),
        }
    }

    /// The proxy URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Current operational state.
    #[must_use]
    pub fn status(&self) -> ProxyStatus {
        self.status.load(Ordering::Relaxed).into()
    }

    pub(crate) fn set_status(&self, status: ProxyStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub(crate) fn record_probe_success(&self) {
        self.probe_failures.store(0, Ordering::Relaxed);
        self.set_status(ProxyStatus::Active);
    }

    /// Returns the new state after a failed probe.
    pub(crate) fn record_probe_failure(&self) -> ProxyStatus {
        let failures = self.probe_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= PROBE_FAILURE_THRESHOLD {
            self.set_status(ProxyStatus::Failed);
        } else {
            self.set_status(ProxyStatus::Active);
        }
        self.status()
    }
}

impl Resource for ProxyEndpoint {
    fn id(&self) -> &str {
        self.url.as_str()
    }
}

/// Ban detection: statuses and block-page phrases that indicate the
/// requester has been blocked.
#[derive(Debug, Clone)]
pub struct BanSignature {
    statuses: Vec<StatusCode>,
    phrases: Vec<String>,
}

impl Default for BanSignature {
    fn default() -> Self {
        Self {
            statuses: vec![
                StatusCode::FORBIDDEN,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::SERVICE_UNAVAILABLE,
            ],
            phrases: [
                "access denied",
                "access restricted",
                "forbidden",
                "ip blocked",
                "ip banned",
                "rate limited",
                "too many requests",
                "captcha",
                "verification required",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

impl BanSignature {
    /// Whether the response looks like a block page.
    #[must_use]
    pub fn matches(&self, status: StatusCode, body: &str) -> bool {
        if self.statuses.contains(&status) {
            return true;
        }
        let lower = body.to_lowercase();
        self.phrases.iter().any(|phrase| lower.contains(phrase))
    }
}

/// Snapshot of a proxy pool's state, for monitoring collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyPoolStats {
    /// Registered proxies
    pub total: usize,
    /// Proxies in the `Active` state
    pub active: usize,
    /// Proxies in the `Failed` state
    pub failed: usize,
    /// Proxies in the `Banned` state
    pub banned: usize,
    /// Proxies currently being probed
    pub checking: usize,
    /// Observed success rate across all proxies (0 without observations)
    pub success_rate: f64,
    /// Mean latency over all successful uses, in milliseconds
    pub avg_latency_ms: Option<u128>,
}

/// A ranked pool of proxies.
#[derive(Debug)]
pub struct ProxyPool {
    inner: RankedPool<ProxyEndpoint>,
    ban: BanSignature,
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(CooldownPolicy::default())
    }
}

impl ProxyPool {
    /// Create an empty proxy pool.
    #[must_use]
    pub fn new(cooldown: CooldownPolicy) -> Self {
        Self {
            inner: RankedPool::new(cooldown),
            ban: BanSignature::default(),
        }
    }

    /// Override the ban signature.
    #[must_use]
    pub fn with_ban_signature(mut self, ban: BanSignature) -> Self {
        self.ban = ban;
        self
    }

    /// Set the tie-breaking policy.
    #[must_use]
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.inner = self.inner.with_tie_break(tie_break);
        self
    }

    /// Register a proxy by URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the proxy is
    /// already registered.
    pub fn add(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url)?;
        self.inner.add(ProxyEndpoint::new(parsed))
    }

    /// Remove a proxy.
    pub fn remove(&self, id: &str) -> bool {
        self.inner.remove(id)
    }

    /// Re-enable a disabled proxy.
    pub fn enable(&self, id: &str) -> bool {
        self.inner.enable(id)
    }

    /// Hide a proxy from selection without losing its history.
    pub fn disable(&self, id: &str) -> bool {
        self.inner.disable(id)
    }

    /// Pick a proxy for the next request, or `None` if no proxy is
    /// currently usable.
    ///
    /// Takes the ranked, `Active` proxies, keeps the top half (rounded
    /// up, at least one) and picks uniformly among them: the best
    /// performers carry most traffic, but load still spreads enough that
    /// no single exit gets burned by overuse.
    #[must_use]
    pub fn select(&self) -> Option<Arc<Tracked<ProxyEndpoint>>> {
        let ranked: Vec<_> = self
            .inner
            .rank()
            .into_iter()
            .filter(|entry| entry.descriptor().status() == ProxyStatus::Active)
            .collect();
        if ranked.is_empty() {
            log::warn!("no usable proxy available");
            return None;
        }
        let keep = ranked.len().div_ceil(2).max(1);
        let index = rand::thread_rng().gen_range(0..keep);
        Some(Arc::clone(&ranked[index]))
    }

    /// Record a successful request through the given proxy.
    pub fn record_success(&self, id: &str, latency: Duration) -> bool {
        self.inner.record_success(id, latency)
    }

    /// Record a failed request through the given proxy.
    pub fn record_failure(&self, id: &str) -> bool {
        self.inner.record_failure(id)
    }

    /// Mark a proxy as banned. It stays excluded until [`ProxyPool::reset`].
    pub fn mark_banned(&self, id: &str) -> bool {
        match self.inner.get(id) {
            Some(entry) => {
                entry.descriptor().set_status(ProxyStatus::Banned);
                log::warn!("proxy `{id}` marked as banned");
                true
            }
            None => false,
        }
    }

    /// Inspect a response observed through `id`; marks the proxy banned
    /// when it matches the ban signature. Returns whether it matched.
    pub fn handle_ban_detection(&self, id: &str, status: StatusCode, body: &str) -> bool {
        if self.ban.matches(status, body) {
            self.mark_banned(id);
            return true;
        }
        false
    }

    /// The configured ban signature.
    #[must_use]
    pub const fn ban_signature(&self) -> &BanSignature {
        &self.ban
    }

    /// Manually reset a proxy: back to `Active` with a clean history.
    pub fn reset(&self, id: &str) -> bool {
        match self.inner.get(id) {
            Some(entry) => {
                entry.descriptor().set_status(ProxyStatus::Active);
                entry.descriptor().probe_failures.store(0, Ordering::Relaxed);
                self.inner.reset(id);
                log::info!("proxy `{id}` reset to active");
                true
            }
            None => false,
        }
    }

    /// Whether the proxy is currently cooling down.
    #[must_use]
    pub fn is_in_cooldown(&self, id: &str) -> bool {
        self.inner.is_in_cooldown(id)
    }

    /// All registered proxies, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Tracked<ProxyEndpoint>>> {
        self.inner.all()
    }

    /// Number of registered proxies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot pool-wide statistics.
    #[must_use]
    pub fn stats(&self) -> ProxyPoolStats {
        let entries = self.inner.all();
        let mut stats = ProxyPoolStats {
            total: entries.len(),
            active: 0,
            failed: 0,
            banned: 0,
            checking: 0,
            success_rate: 0.0,
            avg_latency_ms: None,
        };

        let mut successes = 0u64;
        let mut observations = 0u64;
        let mut total_latency = Duration::ZERO;
        for entry in &entries {
            match entry.descriptor().status() {
                ProxyStatus::Active => stats.active += 1,
                ProxyStatus::Failed => stats.failed += 1,
                ProxyStatus::Banned => stats.banned += 1,
                ProxyStatus::Checking => stats.checking += 1,
            }
            let health = entry.health();
            successes += health.success_count;
            observations += health.observations();
            total_latency += health.total_latency;
        }

        if observations > 0 {
            #[allow(clippy::cast_precision_loss)]
            let rate = successes as f64 / observations as f64;
            stats.success_rate = rate;
        }
        if successes > 0 {
            stats.avg_latency_ms = Some((total_latency / u32::try_from(successes).unwrap_or(u32::MAX)).as_millis());
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool_of(n: usize) -> ProxyPool {
        let pool = ProxyPool::default();
        for i in 0..n {
            pool.add(&format!("http://proxy-{i}.example.com:8080")).unwrap();
        }
        pool
    }

    #[test]
    fn test_add_rejects_bad_urls_and_duplicates() {
        let pool = ProxyPool::default();
        assert!(pool.add("not a url").is_err());
        pool.add("http://proxy.example.com:8080").unwrap();
        assert!(pool.add("http://proxy.example.com:8080").is_err());
    }

    #[test]
    fn test_select_prefers_top_half() {
        let pool = pool_of(4);
        // proxy-0 and proxy-1 have perfect records, 2 and 3 have failures
        pool.record_success("http://proxy-0.example.com:8080/", Duration::from_millis(50));
        pool.record_success("http://proxy-1.example.com:8080/", Duration::from_millis(60));
        pool.record_failure("http://proxy-2.example.com:8080/");
        pool.record_failure("http://proxy-3.example.com:8080/");

        for _ in 0..50 {
            let picked = pool.select().unwrap();
            let id = picked.id().to_string();
            assert!(
                id.contains("proxy-0") || id.contains("proxy-1"),
                "unexpected pick: {id}"
            );
        }
    }

    #[test]
    fn test_select_with_single_proxy() {
        let pool = pool_of(1);
        assert!(pool.select().is_some());
    }

    #[test]
    fn test_select_skips_banned_and_failed() {
        let pool = pool_of(2);
        pool.mark_banned("http://proxy-0.example.com:8080/");
        pool.all()[1].descriptor().set_status(ProxyStatus::Failed);
        assert!(pool.select().is_none());
    }

    #[test]
    fn test_probe_state_machine() {
        let pool = pool_of(1);
        let entry = pool.all().remove(0);
        let proxy = entry.descriptor();

        assert_eq!(proxy.record_probe_failure(), ProxyStatus::Active);
        assert_eq!(proxy.record_probe_failure(), ProxyStatus::Active);
        assert_eq!(proxy.record_probe_failure(), ProxyStatus::Failed);

        proxy.record_probe_success();
        assert_eq!(proxy.status(), ProxyStatus::Active);
    }

    #[test]
    fn test_ban_requires_manual_reset() {
        let pool = pool_of(1);
        let id = "http://proxy-0.example.com:8080/";
        pool.mark_banned(id);

        // a successful probe must not clear a ban
        let entry = pool.all().remove(0);
        assert_eq!(entry.descriptor().status(), ProxyStatus::Banned);
        assert!(pool.select().is_none());

        pool.reset(id);
        assert_eq!(entry.descriptor().status(), ProxyStatus::Active);
        assert!(pool.select().is_some());
    }

    #[test]
    fn test_ban_signature_on_status() {
        let ban = BanSignature::default();
        assert!(ban.matches(StatusCode::FORBIDDEN, ""));
        assert!(ban.matches(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(ban.matches(StatusCode::SERVICE_UNAVAILABLE, ""));
        assert!(!ban.matches(StatusCode::OK, "regular page content"));
        assert!(!ban.matches(StatusCode::NOT_FOUND, "nothing here"));
    }

    #[test]
    fn test_ban_signature_on_body() {
        let ban = BanSignature::default();
        assert!(ban.matches(StatusCode::OK, "Your IP Blocked due to abuse"));
        assert!(ban.matches(StatusCode::OK, "please solve this CAPTCHA"));
    }

    #[test]
    fn test_handle_ban_detection() {
        let pool = pool_of(1);
        let id = "http://proxy-0.example.com:8080/";
        assert!(!pool.handle_ban_detection(id, StatusCode::OK, "all good"));
        assert!(pool.handle_ban_detection(id, StatusCode::FORBIDDEN, ""));
        assert_eq!(pool.all()[0].descriptor().status(), ProxyStatus::Banned);
    }

    #[test]
    fn test_stats_counts_states() {
        let pool = pool_of(3);
        pool.mark_banned("http://proxy-0.example.com:8080/");
        pool.all()[1].descriptor().set_status(ProxyStatus::Failed);
        pool.record_success("http://proxy-2.example.com:8080/", Duration::from_millis(100));

        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.banned, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.avg_latency_ms, Some(100));
    }
}
