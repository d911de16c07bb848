//! Bypass strategy chain.
//!
//! Strategies are opaque procedures that try to turn a target page into
//! a final resource URL by some trick the site did not intend (forged
//! entitlement headers, alternative API endpoints, and so on — the
//! tricks themselves live outside this crate). The chain scores each
//! strategy by its success rate and always tries the most promising one
//! first.
//!
//! Unlike proxies and relays, strategies are never quarantined: a
//! heuristic that fails on one input may well succeed on the next, so
//! cooling it down would throw away working tricks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;

use crate::error::Result;
use crate::health::Resource;
use crate::pool::RankedPool;
use crate::transport::Transport;

/// Delay bounds between failed strategy attempts, in seconds
const ATTEMPT_DELAY_SECS: (f64, f64) = (1.0, 3.0);

/// Markers suggesting a page is entitlement-gated or blocked, so a
/// direct fetch alone will not yield the resource.
const PROTECTED_MARKERS: [&str; 10] = [
    "svip",
    "vip",
    "premium",
    "paywall",
    "subscription",
    "members only",
    "paid content",
    "\"isvip\":true",
    "\"ispaid\":true",
    "data-vip=\"true\"",
];

/// An opaque bypass procedure.
///
/// Implementations receive the target URL, the page body the caller
/// already fetched (possibly empty) and a transport for any additional
/// requests they need to make.
#[async_trait]
pub trait BypassStrategy: Send + Sync {
    /// Stable name, unique within a chain.
    fn name(&self) -> &str;

    /// Attempt the bypass. `Ok(None)` means the trick did not work on
    /// this input; `Err` means it could not even be attempted.
    async fn bypass(
        &self,
        target: &str,
        cached_body: &str,
        transport: &dyn Transport,
    ) -> Result<Option<String>>;
}

/// A chain slot: strategy plus its owned id string.
pub struct StrategySlot {
    name: String,
    strategy: Arc<dyn BypassStrategy>,
}

impl std::fmt::Debug for StrategySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategySlot")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Resource for StrategySlot {
    fn id(&self) -> &str {
        &self.name
    }
}

/// Per-strategy statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    /// Strategy name
    pub name: String,
    /// Successful bypasses
    pub successes: u64,
    /// Failed attempts
    pub failures: u64,
    /// Observed success rate (0.5 before any observation)
    pub success_rate: f64,
}

/// An ordered chain of bypass strategies.
#[derive(Debug)]
pub struct StrategyChain {
    inner: RankedPool<StrategySlot>,
}

impl Default for StrategyChain {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RankedPool::without_cooldown(),
        }
    }

    /// Register a strategy.
    ///
    /// # Errors
    ///
    /// Returns an error if a strategy with the same name is already
    /// registered.
    pub fn add(&self, strategy: Arc<dyn BypassStrategy>) -> Result<()> {
        let slot = StrategySlot {
            name: strategy.name().to_string(),
            strategy,
        };
        self.inner.add(slot)
    }

    /// Remove a strategy by name.
    pub fn remove(&self, name: &str) -> bool {
        self.inner.remove(name)
    }

    /// Re-enable a disabled strategy.
    pub fn enable(&self, name: &str) -> bool {
        self.inner.enable(name)
    }

    /// Hide a strategy from the chain without losing its history.
    pub fn disable(&self, name: &str) -> bool {
        self.inner.disable(name)
    }

    /// Number of registered strategies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Run the chain: strategies are invoked best-first, stopping at the
    /// first one that produces a URL. Failed attempts are separated by a
    /// randomized 1–3 s pause to avoid bursts of bypass traffic.
    pub async fn run(
        &self,
        target: &str,
        cached_body: &str,
        transport: &dyn Transport,
    ) -> Option<String> {
        let ranked = self.inner.rank();
        if ranked.is_empty() {
            return None;
        }

        let last = ranked.len() - 1;
        for (index, entry) in ranked.iter().enumerate() {
            let slot = entry.descriptor();
            log::info!("trying bypass strategy `{}`", slot.name);

            match slot.strategy.bypass(target, cached_body, transport).await {
                Ok(Some(resolved)) => {
                    entry.update(|h| h.record_success(Duration::ZERO));
                    log::info!("bypass succeeded via `{}`", slot.name);
                    return Some(resolved);
                }
                Ok(None) => {
                    entry.update(|h| h.record_failure(None));
                }
                Err(err) => {
                    log::debug!("strategy `{}` failed: {err}", slot.name);
                    entry.update(|h| h.record_failure(None));
                }
            }

            if index < last {
                let secs = rand::thread_rng().gen_range(ATTEMPT_DELAY_SECS.0..ATTEMPT_DELAY_SECS.1);
                sleep(Duration::from_secs_f64(secs)).await;
            }
        }

        log::warn!("every bypass strategy failed for this target");
        None
    }

    /// Per-strategy statistics, in registration order.
    #[must_use]
    pub fn stats(&self) -> Vec<StrategyStats> {
        self.inner
            .all()
            .iter()
            .map(|entry| {
                let health = entry.health();
                StrategyStats {
                    name: entry.id().to_string(),
                    successes: health.success_count,
                    failures: health.failure_count,
                    success_rate: health.success_rate(),
                }
            })
            .collect()
    }
}

/// Whether a fetched page looks entitlement-gated or blocked, i.e.
/// worth escalating to the relay pool or the bypass chain.
#[must_use]
pub fn looks_protected(body: &str) -> bool {
    let lower = body.to_lowercase();
    PROTECTED_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A strategy that succeeds after a configurable number of failures.
    struct Flaky {
        name: String,
        failures_left: AtomicU64,
        calls: AtomicU64,
    }

    impl Flaky {
        fn new(name: &str, failures: u64) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                failures_left: AtomicU64::new(failures),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl BypassStrategy for Flaky {
        fn name(&self) -> &str {
            &self.name
        }

        async fn bypass(
            &self,
            _target: &str,
            _cached_body: &str,
            _transport: &dyn Transport,
        ) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                Ok(None)
            } else {
                Ok(Some("https://cdn.example.com/bypassed.m3u8".to_string()))
            }
        }
    }

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn fetch(
            &self,
            _url: &str,
            _headers: &HeaderMap,
            _proxy: Option<&url::Url>,
        ) -> Result<crate::transport::FetchResponse> {
            Ok(crate::transport::FetchResponse {
                status: http::StatusCode::OK,
                body: Vec::new(),
                elapsed: Duration::ZERO,
            })
        }

        async fn post(
            &self,
            url: &str,
            headers: &HeaderMap,
            _body: Vec<u8>,
            proxy: Option<&url::Url>,
        ) -> Result<crate::transport::FetchResponse> {
            self.fetch(url, headers, proxy).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_stops_the_chain() {
        let chain = StrategyChain::new();
        let a = Flaky::new("a", 0);
        let b = Flaky::new("b", 0);
        chain.add(a.clone()).unwrap();
        chain.add(b.clone()).unwrap();

        let result = chain.run("https://t", "", &NullTransport).await;
        assert_eq!(
            result.as_deref(),
            Some("https://cdn.example.com/bypassed.m3u8")
        );
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_orders_by_success_rate() {
        let chain = StrategyChain::new();
        let weak = Flaky::new("weak", u64::MAX);
        let strong = Flaky::new("strong", 0);
        chain.add(weak.clone()).unwrap();
        chain.add(strong.clone()).unwrap();

        // give `strong` a track record
        chain.run("https://t", "", &NullTransport).await;

        // now `strong` (1.0) ranks above `weak` (0.0): it is asked first
        let calls_before = weak.calls.load(Ordering::SeqCst);
        chain.run("https://t", "", &NullTransport).await;
        assert_eq!(weak.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_strategies_are_never_quarantined() {
        let chain = StrategyChain::new();
        let hopeless = Flaky::new("hopeless", u64::MAX);
        chain.add(hopeless.clone()).unwrap();

        for _ in 0..10 {
            assert_eq!(chain.run("https://t", "", &NullTransport).await, None);
        }
        // ten runs, ten attempts: no cooldown ever kicked in
        assert_eq!(hopeless.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_disable() {
        let chain = StrategyChain::new();
        chain.add(Flaky::new("gone", 0)).unwrap();
        chain.add(Flaky::new("off", 0)).unwrap();
        assert_eq!(chain.len(), 2);

        assert!(chain.remove("gone"));
        assert!(chain.disable("off"));
        assert_eq!(chain.run("https://t", "", &NullTransport).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_names_rejected() {
        let chain = StrategyChain::new();
        chain.add(Flaky::new("dup", 0)).unwrap();
        assert!(chain.add(Flaky::new("dup", 0)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_outcomes() {
        let chain = StrategyChain::new();
        chain.add(Flaky::new("s", 1)).unwrap();

        chain.run("https://t", "", &NullTransport).await;
        chain.run("https://t", "", &NullTransport).await;

        let stats = chain.stats();
        assert_eq!(stats[0].failures, 1);
        assert_eq!(stats[0].successes, 1);
        assert!((stats[0].success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_looks_protected() {
        assert!(looks_protected("<div class=\"svip-banner\">"));
        assert!(looks_protected("This video requires a Premium plan"));
        assert!(looks_protected(r#"{"isVip":true}"#));
        assert!(!looks_protected("<html><body>an ordinary page</body></html>"));
    }
}
