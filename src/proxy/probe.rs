//! Periodic background probing of proxies.
//!
//! A probe issues one lightweight request through each proxy and updates
//! its operational state: repeated failures park it as `Failed`, a
//! single success brings it back to `Active`. Banned proxies are never
//! probed — a ban is cleared by operators, not by traffic.
//!
//! The prober runs as a spawned task; shutdown is a watch-channel signal
//! that the loop observes between ticks, and the task handle is awaited
//! on coordinator teardown so no probe is left in flight.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, interval, timeout};

use crate::proxy::{ProxyPool, ProxyStatus};
use crate::transport::Transport;

/// Default interval between probe sweeps
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(300);

/// Default per-probe timeout
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lightweight endpoints suitable for connectivity probes
const DEFAULT_PROBE_TARGETS: [&str; 3] = [
    "http://httpbin.org/ip",
    "https://api.ipify.org?format=json",
    "http://ip-api.com/json",
];

/// Configuration for the background proxy prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Whether probing runs at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Time between probe sweeps
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Deadline for a single probe request
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Candidate URLs to probe; one is chosen at random per probe
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
}

const fn default_enabled() -> bool {
    true
}

const fn default_interval() -> Duration {
    DEFAULT_PROBE_INTERVAL
}

const fn default_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

fn default_targets() -> Vec<String> {
    DEFAULT_PROBE_TARGETS
        .iter()
        .map(ToString::to_string)
        .collect()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
            targets: default_targets(),
        }
    }
}

/// The background probing task.
pub(crate) struct Prober {
    pool: Arc<ProxyPool>,
    transport: Arc<dyn Transport>,
    config: ProbeConfig,
}

impl Prober {
    pub(crate) fn new(
        pool: Arc<ProxyPool>,
        transport: Arc<dyn Transport>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            pool,
            transport,
            config,
        }
    }

    /// Probe loop. Runs until the shutdown signal flips to `true`.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            log::info!("proxy probing disabled");
            return;
        }

        log::info!(
            "proxy prober started (interval {:.0}s)",
            self.config.interval.as_secs_f64()
        );
        let mut ticker = interval(self.config.interval);
        // the first tick fires immediately; skip it so freshly added
        // proxies get a chance to serve before their first probe
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown too
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("proxy prober received shutdown signal");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every proxy that is not banned or disabled, concurrently.
    pub(crate) async fn sweep(&self) {
        let entries = self.pool.all();
        let probes = entries.iter().filter_map(|entry| {
            let status = entry.descriptor().status();
            if status == ProxyStatus::Banned || !entry.health().enabled {
                return None;
            }
            Some(self.probe_one(entry))
        });
        futures::future::join_all(probes).await;
    }

    async fn probe_one(&self, entry: &Arc<crate::health::Tracked<crate::proxy::ProxyEndpoint>>) {
        let proxy = entry.descriptor();
        let previous = proxy.status();
        proxy.set_status(ProxyStatus::Checking);

        let target = {
            let mut rng = rand::thread_rng();
            self.config
                .targets
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| DEFAULT_PROBE_TARGETS[0].to_string())
        };

        let start = Instant::now();
        let outcome = timeout(
            self.config.timeout,
            self.transport
                .fetch(&target, &HeaderMap::new(), Some(proxy.url())),
        )
        .await;

        match outcome {
            Ok(Ok(response)) if response.is_success() => {
                let latency = start.elapsed();
                entry.update(|h| h.record_success(latency));
                proxy.record_probe_success();
                log::debug!("probe ok for `{}` ({latency:?})", entry.id());
            }
            Ok(Ok(response)) => {
                self.fail(entry, previous);
                log::debug!(
                    "probe failed for `{}`: status {}",
                    entry.id(),
                    response.status
                );
            }
            Ok(Err(err)) => {
                self.fail(entry, previous);
                log::debug!("probe failed for `{}`: {err}", entry.id());
            }
            Err(_) => {
                self.fail(entry, previous);
                log::debug!("probe timed out for `{}`", entry.id());
            }
        }
    }

    fn fail(
        &self,
        entry: &Arc<crate::health::Tracked<crate::proxy::ProxyEndpoint>>,
        previous: ProxyStatus,
    ) {
        entry.update(|h| h.record_failure(self.pool.inner.cooldown_policy()));
        let next = entry.descriptor().record_probe_failure();
        if next == ProxyStatus::Failed && previous != ProxyStatus::Failed {
            log::warn!("proxy `{}` marked as failed", entry.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::CooldownPolicy;
    use crate::transport::FetchResponse;
    use async_trait::async_trait;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Transport that answers probes from a script of statuses.
    struct ScriptedTransport {
        script: Vec<StatusCode>,
        cursor: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<StatusCode>) -> Self {
            Self {
                script,
                cursor: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn fetch(
            &self,
            _url: &str,
            _headers: &HeaderMap,
            _proxy: Option<&Url>,
        ) -> crate::Result<FetchResponse> {
            let index = self.cursor.fetch_add(1, Ordering::SeqCst);
            let status = self.script[index.min(self.script.len() - 1)];
            Ok(FetchResponse {
                status,
                body: Vec::new(),
                elapsed: Duration::from_millis(10),
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

    fn pool_with_one() -> Arc<ProxyPool> {
        let pool = Arc::new(ProxyPool::new(CooldownPolicy::default()));
        pool.add("http://proxy.example.com:8080").unwrap();
        pool
    }

    fn prober(pool: &Arc<ProxyPool>, script: Vec<StatusCode>) -> Prober {
        Prober::new(
            Arc::clone(pool),
            Arc::new(ScriptedTransport::new(script)),
            ProbeConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_three_failed_probes_mark_failed_then_one_success_recovers() {
        let pool = pool_with_one();
        let prober = prober(
            &pool,
            vec![
                StatusCode::BAD_GATEWAY,
                StatusCode::BAD_GATEWAY,
                StatusCode::BAD_GATEWAY,
                StatusCode::OK,
            ],
        );

        prober.sweep().await;
        prober.sweep().await;
        assert_eq!(pool.all()[0].descriptor().status(), ProxyStatus::Active);

        prober.sweep().await;
        assert_eq!(pool.all()[0].descriptor().status(), ProxyStatus::Failed);

        prober.sweep().await;
        assert_eq!(pool.all()[0].descriptor().status(), ProxyStatus::Active);
    }

    #[tokio::test]
    async fn test_probe_success_records_latency() {
        let pool = pool_with_one();
        let prober = prober(&pool, vec![StatusCode::OK]);
        prober.sweep().await;

        let health = pool.all()[0].health();
        assert_eq!(health.success_count, 1);
        assert!(health.avg_latency().is_some());
    }

    #[tokio::test]
    async fn test_banned_proxies_are_not_probed() {
        let pool = pool_with_one();
        pool.mark_banned("http://proxy.example.com:8080/");
        let prober = prober(&pool, vec![StatusCode::OK]);
        prober.sweep().await;

        // still banned, no observation recorded
        assert_eq!(pool.all()[0].descriptor().status(), ProxyStatus::Banned);
        assert_eq!(pool.all()[0].health().observations(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_probe_loop() {
        let pool = pool_with_one();
        let prober = prober(&pool, vec![StatusCode::OK]);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(prober.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("prober did not shut down")
            .unwrap();
    }

    #[test]
    fn test_probe_config_toml_roundtrip() {
        let config = ProbeConfig {
            enabled: true,
            interval: Duration::from_secs(120),
            timeout: Duration::from_secs(5),
            targets: vec!["http://probe.example.com/ping".to_string()],
        };
        let toml = toml::to_string(&config).unwrap();
        let parsed: ProbeConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.interval, Duration::from_secs(120));
        assert_eq!(parsed.targets.len(), 1);
    }
}
