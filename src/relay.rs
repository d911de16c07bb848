//! Relay endpoint pool.
//!
//! A relay is a third-party service that, given a target URL, attempts
//! to resolve a final retrievable resource on its own. Each relay is
//! described by a URL template with a `{url}` placeholder for the
//! percent-encoded target, plus the shape of its responses (JSON or
//! HTML), which picks the extraction routine.
//!
//! The pool tries relays in ranked order and keeps a persistent
//! reputation ledger so that a process restart does not forget which
//! relays have been worth asking.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use url::Url;

use crate::error::{ErrorKind, Result};
use crate::extract;
use crate::health::{CooldownPolicy, Resource, ResourceHealth, Tracked};
use crate::pool::{RankedPool, TieBreak};
use crate::transport::Transport;

/// Placeholder that every relay template must contain exactly once
const TEMPLATE_PLACEHOLDER: &str = "{url}";

/// Base delay between relay attempts; jittered by ±33%
const ATTEMPT_DELAY: Duration = Duration::from_millis(300);

/// Fixed target used by the relay health sweep
const SWEEP_TARGET: &str = "https://example.com/watch/health-check";

/// Shape of a relay's responses, selecting the extraction routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseShape {
    /// Body is JSON; searched with the bounded-depth visitor
    Json,
    /// Body is HTML or arbitrary text; searched with pattern scan
    Html,
}

/// A single relay endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEndpoint {
    name: String,
    url_template: String,
    response_shape: ResponseShape,
}

impl RelayEndpoint {
    /// Describe a relay endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidTemplate`] unless the template
    /// contains the `{url}` placeholder exactly once.
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        response_shape: ResponseShape,
    ) -> Result<Self> {
        let url_template = url_template.into();
        if url_template.matches(TEMPLATE_PLACEHOLDER).count() != 1 {
            return Err(ErrorKind::InvalidTemplate(url_template));
        }
        Ok(Self {
            name: name.into(),
            url_template,
            response_shape,
        })
    }

    /// The relay's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw URL template.
    #[must_use]
    pub fn url_template(&self) -> &str {
        &self.url_template
    }

    /// The declared response shape.
    #[must_use]
    pub const fn response_shape(&self) -> ResponseShape {
        self.response_shape
    }

    /// Build the request URL for an already percent-encoded target.
    #[must_use]
    pub fn build_url(&self, encoded_target: &str) -> String {
        self.url_template
            .replace(TEMPLATE_PLACEHOLDER, encoded_target)
    }
}

impl Resource for RelayEndpoint {
    fn id(&self) -> &str {
        &self.name
    }
}

/// One persisted ledger entry, keyed by relay name in the ledger file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Number of successful resolutions
    pub success_count: u64,
    /// Number of failed attempts
    pub failure_count: u64,
    /// Sum of response times over successes, in seconds
    pub total_response_time: f64,
    /// Unix timestamp of the last success
    pub last_success_time: Option<f64>,
    /// Unix timestamp of the last failure
    pub last_failure_time: Option<f64>,
}

impl From<&ResourceHealth> for LedgerEntry {
    fn from(health: &ResourceHealth) -> Self {
        Self {
            success_count: health.success_count,
            failure_count: health.failure_count,
            total_response_time: health.total_latency.as_secs_f64(),
            last_success_time: health.last_success_at.map(unix_seconds),
            last_failure_time: health.last_failure_at.map(unix_seconds),
        }
    }
}

fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

fn from_unix_seconds(seconds: f64) -> Option<SystemTime> {
    if seconds.is_finite() && seconds >= 0.0 {
        Some(UNIX_EPOCH + Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

impl LedgerEntry {
    fn apply_to(&self, health: &mut ResourceHealth) {
        health.success_count = self.success_count;
        health.failure_count = self.failure_count;
        health.total_latency = if self.total_response_time.is_finite() {
            Duration::from_secs_f64(self.total_response_time.max(0.0))
        } else {
            Duration::ZERO
        };
        health.last_success_at = self.last_success_time.and_then(from_unix_seconds);
        health.last_failure_at = self.last_failure_time.and_then(from_unix_seconds);
    }
}

/// Snapshot of a relay pool's state.
#[derive(Debug, Clone, Serialize)]
pub struct RelayPoolStats {
    /// Registered relays
    pub total: usize,
    /// Relays not disabled
    pub enabled: usize,
    /// Relays currently rankable (enabled and not cooling down)
    pub available: usize,
    /// Relays currently quarantined
    pub cooled_down: usize,
    /// Observed success rate across all relays (0 without observations)
    pub success_rate: f64,
    /// Mean latency over all successful resolutions, in milliseconds
    pub avg_latency_ms: Option<u128>,
}

/// A ranked pool of relay endpoints.
#[derive(Debug)]
pub struct RelayPool {
    inner: RankedPool<RelayEndpoint>,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(CooldownPolicy::default())
    }
}

impl RelayPool {
    /// Create an empty relay pool.
    #[must_use]
    pub fn new(cooldown: CooldownPolicy) -> Self {
        Self {
            inner: RankedPool::new(cooldown),
        }
    }

    /// Set the tie-breaking policy.
    #[must_use]
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.inner = self.inner.with_tie_break(tie_break);
        self
    }

    /// Register a relay endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if a relay with the same name already exists.
    pub fn add(&self, endpoint: RelayEndpoint) -> Result<()> {
        self.inner.add(endpoint)
    }

    /// Remove a relay by name.
    pub fn remove(&self, name: &str) -> bool {
        self.inner.remove(name)
    }

    /// Re-enable a disabled relay.
    pub fn enable(&self, name: &str) -> bool {
        self.inner.enable(name)
    }

    /// Hide a relay from ranking without losing its history.
    pub fn disable(&self, name: &str) -> bool {
        self.inner.disable(name)
    }

    /// Whether the relay is currently quarantined.
    #[must_use]
    pub fn is_in_cooldown(&self, name: &str) -> bool {
        self.inner.is_in_cooldown(name)
    }

    /// Number of registered relays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// All registered relays, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Tracked<RelayEndpoint>>> {
        self.inner.all()
    }

    /// Try to resolve `target` into a final resource URL.
    ///
    /// Relays are asked in ranked order. The first candidate whose
    /// response yields a URL that passes validation wins; it gets a
    /// success (with the measured latency) on its ledger, every relay
    /// tried before it gets a failure. A short jittered pause separates
    /// attempts so a run of failing relays does not turn into a burst.
    ///
    /// Returns `None` once every relay failed or is cooling down.
    pub async fn resolve(&self, target: &str, transport: &dyn Transport) -> Option<String> {
        let encoded = encode_target(target);
        let ranked = self.inner.rank();
        if ranked.is_empty() {
            log::error!("no relay endpoint available");
            return None;
        }

        let last = ranked.len() - 1;
        for (index, entry) in ranked.iter().enumerate() {
            let relay = entry.descriptor();
            let api_url = relay.build_url(&encoded);
            log::info!("trying relay `{}`", relay.name());

            match transport.fetch(&api_url, &HeaderMap::new(), None).await {
                Ok(response) => {
                    let body = response.text();
                    let candidate = match relay.response_shape() {
                        ResponseShape::Json => extract::url_from_json(&body),
                        ResponseShape::Html => extract::url_from_text(&body),
                    };
                    if let Some(candidate) = candidate {
                        if extract::validate_url(&candidate) {
                            entry.update(|h| h.record_success(response.elapsed));
                            log::info!(
                                "relay `{}` resolved target in {:.2}s",
                                relay.name(),
                                response.elapsed.as_secs_f64()
                            );
                            return Some(candidate);
                        }
                        log::debug!(
                            "relay `{}` produced invalid candidate: {candidate}",
                            relay.name()
                        );
                    }
                    self.record_failure_for(entry);
                }
                Err(err) => {
                    log::debug!("relay `{}` failed: {err}", relay.name());
                    self.record_failure_for(entry);
                }
            }

            if index < last {
                sleep(jittered(ATTEMPT_DELAY)).await;
            }
        }

        log::warn!("every relay endpoint failed for this target");
        None
    }

    fn record_failure_for(&self, entry: &Arc<Tracked<RelayEndpoint>>) {
        entry.update(|h| h.record_failure(self.inner.cooldown_policy()));
    }

    /// Probe every registered relay with a fixed test target.
    ///
    /// A relay counts as live when it answers at all; whether it can
    /// actually resolve the test target is irrelevant. Results are
    /// reported, not recorded on the ledgers.
    pub async fn health_sweep(&self, transport: &dyn Transport) -> Vec<(String, bool)> {
        let encoded = encode_target(SWEEP_TARGET);
        let mut results = Vec::new();
        for entry in self.inner.all() {
            let relay = entry.descriptor();
            let api_url = relay.build_url(&encoded);
            let live = transport
                .fetch(&api_url, &HeaderMap::new(), None)
                .await
                .is_ok();
            if !live {
                log::warn!("relay `{}` failed its health check", relay.name());
            }
            results.push((relay.name().to_string(), live));
        }
        results
    }

    /// Write the reputation ledger as a flat JSON object keyed by relay
    /// name.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_ledger<W: Write>(&self, writer: W) -> Result<()> {
        let ledger: BTreeMap<String, LedgerEntry> = self
            .inner
            .all()
            .iter()
            .map(|entry| (entry.id().to_string(), LedgerEntry::from(&entry.health())))
            .collect();
        serde_json::to_writer_pretty(writer, &ledger)?;
        Ok(())
    }

    /// Load a previously saved ledger, restoring the reputation of every
    /// relay that is still registered. Entries for unknown relay names
    /// are ignored. Returns how many entries were applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or parsed.
    pub fn load_ledger<R: Read>(&self, reader: R) -> Result<usize> {
        let ledger: BTreeMap<String, LedgerEntry> = serde_json::from_reader(reader)?;
        let mut applied = 0;
        for (name, saved) in &ledger {
            if let Some(entry) = self.inner.get(name) {
                entry.update(|h| saved.apply_to(h));
                applied += 1;
            } else {
                log::debug!("ignoring ledger entry for unknown relay `{name}`");
            }
        }
        log::debug!("loaded relay ledger ({applied} entries applied)");
        Ok(applied)
    }

    /// [`RelayPool::save_ledger`] to a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save_ledger_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .map_err(|e| ErrorKind::from((path.to_path_buf(), e)))?;
        self.save_ledger(file)
    }

    /// [`RelayPool::load_ledger`] from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or parsed.
    pub fn load_ledger_from(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| ErrorKind::from((path.to_path_buf(), e)))?;
        self.load_ledger(file)
    }

    /// Snapshot pool-wide statistics.
    #[must_use]
    pub fn stats(&self) -> RelayPoolStats {
        let entries = self.inner.all();
        let available = self.inner.rank().len();

        let mut stats = RelayPoolStats {
            total: entries.len(),
            enabled: 0,
            available,
            cooled_down: 0,
            success_rate: 0.0,
            avg_latency_ms: None,
        };

        let mut successes = 0u64;
        let mut observations = 0u64;
        let mut total_latency = Duration::ZERO;
        for entry in &entries {
            let health = entry.health();
            if health.enabled {
                stats.enabled += 1;
            }
            if health.is_in_cooldown() {
                stats.cooled_down += 1;
            }
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
            stats.avg_latency_ms =
                Some((total_latency / u32::try_from(successes).unwrap_or(u32::MAX)).as_millis());
        }
        stats
    }
}

/// Strip query and fragment from the target, then percent-encode it for
/// substitution into a relay template.
fn encode_target(target: &str) -> String {
    let clean = match Url::parse(target) {
        Ok(url) => {
            let mut clean = format!("{}://", url.scheme());
            if let Some(host) = url.host_str() {
                clean.push_str(host);
            }
            if let Some(port) = url.port() {
                clean.push_str(&format!(":{port}"));
            }
            clean.push_str(url.path());
            clean
        }
        Err(_) => target.to_string(),
    };
    utf8_percent_encode(&clean, NON_ALPHANUMERIC).to_string()
}

fn jittered(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.67..1.33);
    base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FetchResponse;
    use async_trait::async_trait;
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn relay(name: &str, shape: ResponseShape) -> RelayEndpoint {
        RelayEndpoint::new(
            name,
            format!("https://{name}/resolve?url={{url}}"),
            shape,
        )
        .unwrap()
    }

    /// Transport that maps request-URL substrings to canned bodies and
    /// records every requested URL.
    struct CannedTransport {
        responses: Vec<(&'static str, String)>,
        requests: Mutex<Vec<String>>,
    }

    impl CannedTransport {
        fn new(responses: Vec<(&'static str, String)>) -> Self {
            Self {
                responses,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn fetch(
            &self,
            url: &str,
            _headers: &HeaderMap,
            _proxy: Option<&Url>,
        ) -> crate::Result<FetchResponse> {
            self.requests.lock().unwrap().push(url.to_string());
            let body = self
                .responses
                .iter()
                .find(|(fragment, _)| url.contains(fragment))
                .map(|(_, body)| body.clone())
                .unwrap_or_default();
            Ok(FetchResponse {
                status: StatusCode::OK,
                body: body.into_bytes(),
                elapsed: Duration::from_millis(42),
            })
        }

        async fn post(
            &self,
            url: &str,
            headers: &HeaderMap,
            _body: Vec<u8>,
            proxy: Option<&Url>,
        ) -> crate::Result<FetchResponse> {
            self.fetch(url, headers, proxy).await
        }
    }

    #[test]
    fn test_template_validation() {
        assert!(RelayEndpoint::new("r", "https://r/x?url={url}", ResponseShape::Html).is_ok());
        assert!(matches!(
            RelayEndpoint::new("r", "https://r/x", ResponseShape::Html),
            Err(ErrorKind::InvalidTemplate(_))
        ));
        assert!(matches!(
            RelayEndpoint::new("r", "https://r/x?a={url}&b={url}", ResponseShape::Html),
            Err(ErrorKind::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_encode_target_strips_query_and_fragment() {
        let encoded = encode_target("https://video.example.com/x/cover/abc.html?ptag=1#t=2");
        assert!(!encoded.contains('?'));
        assert!(!encoded.contains('#'));
        assert!(encoded.contains("abc%2Ehtml"));
    }

    #[test]
    fn test_build_url_substitutes_placeholder() {
        let relay = relay("jx.example.com", ResponseShape::Html);
        let url = relay.build_url("https%3A%2F%2Ftarget");
        assert_eq!(
            url,
            "https://jx.example.com/resolve?url=https%3A%2F%2Ftarget"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_returns_first_valid_and_records_outcomes() {
        let pool = RelayPool::default();
        pool.add(relay("first.example.com", ResponseShape::Html))
            .unwrap();
        pool.add(relay("second.example.com", ResponseShape::Json))
            .unwrap();
        pool.add(relay("third.example.com", ResponseShape::Html))
            .unwrap();

        // first answers garbage, second resolves
        let transport = CannedTransport::new(vec![
            ("first.example.com", "<html>nothing here</html>".to_string()),
            (
                "second.example.com",
                r#"{"url": "https://cdn.example.com/stream/video.m3u8"}"#.to_string(),
            ),
        ]);

        let resolved = pool
            .resolve("https://video.example.com/watch/1", &transport)
            .await;
        assert_eq!(
            resolved.as_deref(),
            Some("https://cdn.example.com/stream/video.m3u8")
        );

        // exactly one success, one failure, third never asked
        assert_eq!(pool.all()[0].health().failure_count, 1);
        assert_eq!(pool.all()[1].health().success_count, 1);
        assert_eq!(pool.all()[2].health().observations(), 0);
        assert_eq!(transport.requested().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_rejects_invalid_candidates() {
        let pool = RelayPool::default();
        pool.add(relay("bad.example.com", ResponseShape::Json))
            .unwrap();

        // a candidate that extracts but fails validation (too short)
        let transport = CannedTransport::new(vec![(
            "bad.example.com",
            r#"{"url": "http://s.io/a.mp4"}"#.to_string(),
        )]);

        let resolved = pool.resolve("https://video.example.com/w/1", &transport).await;
        assert_eq!(resolved, None);
        assert_eq!(pool.all()[0].health().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_exhausted_returns_none() {
        let pool = RelayPool::default();
        pool.add(relay("a.example.com", ResponseShape::Html)).unwrap();
        pool.add(relay("b.example.com", ResponseShape::Html)).unwrap();

        let transport = CannedTransport::new(vec![]);
        let resolved = pool.resolve("https://video.example.com/w/1", &transport).await;
        assert_eq!(resolved, None);
        assert_eq!(transport.requested().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_follows_ranking() {
        let pool = RelayPool::default();
        pool.add(relay("slow.example.com", ResponseShape::Json)).unwrap();
        pool.add(relay("fast.example.com", ResponseShape::Json)).unwrap();

        // both have history; fast has better latency
        pool.all()[0].update(|h| h.record_success(Duration::from_millis(900)));
        pool.all()[1].update(|h| h.record_success(Duration::from_millis(100)));

        let transport = CannedTransport::new(vec![(
            "fast.example.com",
            r#"{"url": "https://cdn.example.com/stream/video.m3u8"}"#.to_string(),
        )]);

        let resolved = pool.resolve("https://video.example.com/w/1", &transport).await;
        assert!(resolved.is_some());
        // fast was asked first and answered; slow never contacted
        assert_eq!(transport.requested().len(), 1);
        assert!(transport.requested()[0].contains("fast.example.com"));
    }

    #[test]
    fn test_ledger_roundtrip() {
        let pool = RelayPool::default();
        pool.add(relay("keeper.example.com", ResponseShape::Html))
            .unwrap();
        pool.all()[0].update(|h| {
            h.record_success(Duration::from_millis(500));
            h.record_failure(None);
        });

        let mut buffer = Vec::new();
        pool.save_ledger(&mut buffer).unwrap();

        let fresh = RelayPool::default();
        fresh
            .add(relay("keeper.example.com", ResponseShape::Html))
            .unwrap();
        let applied = fresh.load_ledger(buffer.as_slice()).unwrap();
        assert_eq!(applied, 1);

        let health = fresh.all()[0].health();
        assert_eq!(health.success_count, 1);
        assert_eq!(health.failure_count, 1);
        assert_eq!(health.total_latency, Duration::from_millis(500));
        assert!(health.last_success_at.is_some());
    }

    #[test]
    fn test_ledger_ignores_unknown_ids() {
        let ledger = r#"{
            "ghost.example.com": {
                "success_count": 9,
                "failure_count": 1,
                "total_response_time": 4.5,
                "last_success_time": 1700000000.0,
                "last_failure_time": null
            }
        }"#;

        let pool = RelayPool::default();
        pool.add(relay("real.example.com", ResponseShape::Html))
            .unwrap();
        let applied = pool.load_ledger(ledger.as_bytes()).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(pool.all()[0].health().observations(), 0);
    }

    #[test]
    fn test_ledger_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay_ledger.json");

        let pool = RelayPool::default();
        pool.add(relay("disk.example.com", ResponseShape::Json))
            .unwrap();
        pool.all()[0].update(|h| h.record_success(Duration::from_millis(80)));
        pool.save_ledger_to(&path).unwrap();

        let fresh = RelayPool::default();
        fresh
            .add(relay("disk.example.com", ResponseShape::Json))
            .unwrap();
        assert_eq!(fresh.load_ledger_from(&path).unwrap(), 1);
        assert_eq!(fresh.all()[0].health().success_count, 1);
    }

    #[test]
    fn test_stats() {
        let pool = RelayPool::default();
        pool.add(relay("a.example.com", ResponseShape::Html)).unwrap();
        pool.add(relay("b.example.com", ResponseShape::Html)).unwrap();
        pool.disable("b.example.com");
        pool.all()[0].update(|h| h.record_success(Duration::from_millis(200)));

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.cooled_down, 0);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.avg_latency_ms, Some(200));
    }
}
