//! Handler of resilient fetch operations.
//!
//! This module defines two structs, [`Fetcher`] and [`FetcherBuilder`].
//! `Fetcher` orchestrates the rate limiter, the proxy pool, the relay
//! pool and the bypass strategy chain around a transport; the builder
//! exposes a finer level of granularity for wiring all of them up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use rand::Rng;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use typed_builder::TypedBuilder;

use crate::error::{ErrorKind, Result};
use crate::health::CooldownPolicy;
use crate::pool::TieBreak;
use crate::proxy::probe::{ProbeConfig, Prober};
use crate::proxy::{BanSignature, ProxyPool, ProxyPoolStats};
use crate::ratelimit::{AdaptiveRateLimiter, RateLimiterStats};
use crate::relay::{RelayEndpoint, RelayPool, RelayPoolStats};
use crate::retryable::RetryExt;
use crate::strategy::{self, BypassStrategy, StrategyChain, StrategyStats};
use crate::transport::{HttpTransport, Transport};

/// Default number of retries per fetch before giving up, 3.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default bound on concurrently running fetch operations, 4.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
/// Default sustained request rate, 1 request per second.
pub const DEFAULT_RATE: f64 = 1.0;
/// Default lower bound for the adaptive rate, 0.1 requests per second.
pub const DEFAULT_MIN_RATE: f64 = 0.1;
/// Default upper bound for the adaptive rate, 10 requests per second.
pub const DEFAULT_MAX_RATE: f64 = 10.0;

/// Longest backoff delay between retry attempts, in seconds
const MAX_RETRY_DELAY_SECS: f64 = 60.0;

/// How a target was ultimately obtained by
/// [`Fetcher::fetch_or_resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The page body fetched directly
    Direct(Vec<u8>),
    /// A final resource URL produced by a relay endpoint
    Relayed(String),
    /// A final resource URL produced by a bypass strategy
    Bypassed(String),
}

/// Builder for [`Fetcher`].
///
/// Every field has a sensible default; a bare
/// `FetcherBuilder::builder().build().fetcher()` produces a working
/// coordinator without proxies, relays or strategies.
#[derive(TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct FetcherBuilder {
    /// Transport used for every outbound request. Defaults to
    /// [`HttpTransport`] with its standard timeout.
    transport: Option<Arc<dyn Transport>>,

    /// Initial sustained request rate (requests per second).
    #[builder(default = DEFAULT_RATE)]
    rate: f64,

    /// Lower bound for adaptive rate tuning.
    #[builder(default = DEFAULT_MIN_RATE)]
    min_rate: f64,

    /// Upper bound for adaptive rate tuning.
    #[builder(default = DEFAULT_MAX_RATE)]
    max_rate: f64,

    /// Retries per fetch after the first attempt.
    #[builder(default = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Bound on concurrently running fetch operations.
    #[builder(default = DEFAULT_MAX_CONCURRENCY)]
    max_concurrency: usize,

    /// Proxy URLs registered at construction.
    proxies: Vec<String>,

    /// Relay endpoints registered at construction.
    relays: Vec<RelayEndpoint>,

    /// Bypass strategies registered at construction.
    strategies: Vec<Arc<dyn BypassStrategy>>,

    /// Cooldown policy applied to the proxy and relay pools.
    cooldown: CooldownPolicy,

    /// Tie-breaking policy for both ranked pools.
    tie_break: TieBreak,

    /// Ban signature used to classify responses.
    ban: BanSignature,

    /// Background proxy probing configuration.
    probe: ProbeConfig,
}

impl FetcherBuilder {
    /// Assemble the [`Fetcher`] and start its background prober.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the default transport cannot be constructed
    /// or any of the configured proxies fails to register.
    pub fn fetcher(self) -> Result<Fetcher> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };

        let proxies = Arc::new(
            ProxyPool::new(self.cooldown)
                .with_ban_signature(self.ban.clone())
                .with_tie_break(self.tie_break),
        );
        for proxy in &self.proxies {
            proxies.add(proxy)?;
        }

        let relays = RelayPool::new(self.cooldown).with_tie_break(self.tie_break);
        for relay in self.relays {
            relays.add(relay)?;
        }

        let strategies = StrategyChain::new();
        for strategy in self.strategies {
            strategies.add(strategy)?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prober = Prober::new(Arc::clone(&proxies), Arc::clone(&transport), self.probe);
        let prober_handle = tokio::spawn(prober.run(shutdown_rx));

        Ok(Fetcher {
            transport,
            limiter: AdaptiveRateLimiter::new(self.rate, self.min_rate, self.max_rate),
            proxies,
            relays,
            strategies,
            ban: self.ban,
            semaphore: Semaphore::new(self.max_concurrency),
            max_retries: self.max_retries,
            prober: Mutex::new(Some((shutdown_tx, prober_handle))),
        })
    }
}

/// Coordinates pacing, proxy selection, retries and fallback pools
/// around a transport.
///
/// The fetcher exclusively owns its rate limiter and its three pools;
/// collaborators observe them through the stats accessors only.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    limiter: AdaptiveRateLimiter,
    proxies: Arc<ProxyPool>,
    relays: RelayPool,
    strategies: StrategyChain,
    ban: BanSignature,
    semaphore: Semaphore,
    max_retries: u32,
    prober: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("max_retries", &self.max_retries)
            .field("proxies", &self.proxies.len())
            .field("relays", &self.relays.len())
            .field("strategies", &self.strategies.len())
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Fetch a URL with pacing, proxy rotation, retries and ban
    /// handling, returning the raw body on success.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::RetriesExhausted`] when every attempt failed with
    ///   a retryable condition.
    /// - [`ErrorKind::HttpStatus`] for a terminal, non-retryable status.
    /// - [`ErrorKind::Network`] when the transport failed terminally.
    pub async fn fetch_with_resilience(&self, url: &str) -> Result<Vec<u8>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ErrorKind::PoolExhausted("fetch"))?;

        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;

            let selected = self.proxies.select();
            let proxy_url = selected.as_ref().map(|p| p.descriptor().url().clone());

            match self
                .transport
                .fetch(url, &HeaderMap::new(), proxy_url.as_ref())
                .await
            {
                Ok(response) => {
                    let status = response.status;

                    if self.ban.matches(status, &response.text()) {
                        if let Some(proxy) = &selected {
                            self.proxies.mark_banned(proxy.id());
                        }
                        self.limiter.record_failure();
                        log::warn!("ban signature detected on `{url}` (status {status})");
                        if attempt >= self.max_retries {
                            return Err(ErrorKind::RetriesExhausted {
                                url: url.to_string(),
                                attempts: attempt + 1,
                            });
                        }
                        sleep(retry_delay(attempt, Some(status))).await;
                        attempt += 1;
                        continue;
                    }

                    if status.is_success() {
                        if let Some(proxy) = &selected {
                            self.proxies.record_success(proxy.id(), response.elapsed);
                        }
                        self.limiter.record_success();
                        return Ok(response.body);
                    }

                    self.limiter.record_failure();
                    if status.should_retry() && attempt < self.max_retries {
                        let delay = retry_delay(attempt, Some(status));
                        log::warn!(
                            "HTTP {status} for `{url}`, retrying in {:.1}s",
                            delay.as_secs_f64()
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(if status.should_retry() {
                        ErrorKind::RetriesExhausted {
                            url: url.to_string(),
                            attempts: attempt + 1,
                        }
                    } else {
                        ErrorKind::HttpStatus(status)
                    });
                }
                Err(err) => {
                    if let Some(proxy) = &selected {
                        self.proxies.record_failure(proxy.id());
                    }
                    self.limiter.trigger_exponential_backoff();
                    self.limiter.record_failure();

                    if err.should_retry() && attempt < self.max_retries {
                        let delay = retry_delay(attempt, None);
                        log::warn!(
                            "transport error for `{url}` ({err}), retrying in {:.1}s",
                            delay.as_secs_f64()
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(err);
                }
            }
        }
    }

    /// Ask the relay pool to resolve `url` into a final resource.
    pub async fn resolve_via_relays(&self, url: &str) -> Option<String> {
        self.relays.resolve(url, &*self.transport).await
    }

    /// Run the bypass strategy chain against `url` with an already
    /// fetched page body.
    pub async fn run_strategies(&self, url: &str, body: &str) -> Option<String> {
        self.strategies.run(url, body, &*self.transport).await
    }

    /// Full escalation: fetch the page directly; if the fetch exhausts
    /// its retries, or the page looks entitlement-gated, fall back to
    /// the relay pool and then to the bypass chain.
    ///
    /// A protected page whose fallbacks all fail is still returned as
    /// [`Resolution::Direct`] — the caller keeps whatever was fetched.
    ///
    /// # Errors
    ///
    /// Propagates the fetch error when the direct fetch failed
    /// terminally and no fallback produced a result.
    pub async fn fetch_or_resolve(&self, url: &str) -> Result<Resolution> {
        match self.fetch_with_resilience(url).await {
            Ok(body) => {
                let text = String::from_utf8_lossy(&body).into_owned();
                if !strategy::looks_protected(&text) {
                    return Ok(Resolution::Direct(body));
                }
                log::info!("`{url}` looks protected, escalating");
                if let Some(resolved) = self.resolve_via_relays(url).await {
                    return Ok(Resolution::Relayed(resolved));
                }
                if let Some(resolved) = self.run_strategies(url, &text).await {
                    return Ok(Resolution::Bypassed(resolved));
                }
                log::warn!("all fallbacks failed for `{url}`, returning the page as fetched");
                Ok(Resolution::Direct(body))
            }
            Err(err @ ErrorKind::RetriesExhausted { .. }) => {
                log::info!("direct fetch of `{url}` exhausted, escalating");
                if let Some(resolved) = self.resolve_via_relays(url).await {
                    return Ok(Resolution::Relayed(resolved));
                }
                if let Some(resolved) = self.run_strategies(url, "").await {
                    return Ok(Resolution::Bypassed(resolved));
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// The proxy pool.
    #[must_use]
    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    /// The relay pool.
    #[must_use]
    pub const fn relays(&self) -> &RelayPool {
        &self.relays
    }

    /// The bypass strategy chain.
    #[must_use]
    pub const fn strategies(&self) -> &StrategyChain {
        &self.strategies
    }

    /// Proxy pool statistics.
    #[must_use]
    pub fn proxy_stats(&self) -> ProxyPoolStats {
        self.proxies.stats()
    }

    /// Relay pool statistics.
    #[must_use]
    pub fn relay_stats(&self) -> RelayPoolStats {
        self.relays.stats()
    }

    /// Per-strategy statistics.
    #[must_use]
    pub fn strategy_stats(&self) -> Vec<StrategyStats> {
        self.strategies.stats()
    }

    /// Rate limiter statistics.
    #[must_use]
    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    /// Stop the background prober and wait for it to wind down.
    ///
    /// Idempotent; later calls are no-ops.
    pub async fn shutdown(&self) {
        let handle = self
            .prober
            .lock()
            .expect("prober handle poisoned")
            .take();
        if let Some((shutdown_tx, handle)) = handle {
            let _ = shutdown_tx.send(true);
            if let Err(err) = handle.await {
                log::debug!("prober task ended abnormally: {err}");
            }
        }
    }
}

/// Exponential backoff with jitter, status-aware base, capped at 60 s.
///
/// Rate-limit responses start from a longer base than generic server
/// errors; transport failures use the shortest one.
fn retry_delay(attempt: u32, status: Option<StatusCode>) -> Duration {
    let base = match status {
        Some(code) if code == StatusCode::TOO_MANY_REQUESTS => 2.0,
        Some(code) if code.is_server_error() => 1.5,
        _ => 1.0,
    };
    let exponential = base * 2f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let jitter = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64((exponential + jitter).min(MAX_RETRY_DELAY_SECS))
}
