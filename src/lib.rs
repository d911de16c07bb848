//! `remora` is the selection-and-resilience core of a fetcher for sites
//! that actively resist automated access.
//!
//! It tracks the historical reliability of every candidate resource —
//! intermediary proxies, third-party relay endpoints, bypass
//! strategies — ranks them dynamically, quarantines the ones that keep
//! failing and paces all outbound traffic with an adaptive token
//! bucket. Content extraction, output writers and user interfaces are
//! deliberately outside: they talk to this crate through a narrow fetch
//! contract and get opaque bytes back.
//!
//! ```no_run
//! use remora::{FetcherBuilder, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let fetcher = FetcherBuilder::builder()
//!         .proxies(vec!["http://127.0.0.1:8080".to_string()])
//!         .build()
//!         .fetcher()?;
//!
//!     let body = fetcher
//!         .fetch_with_resilience("https://example.com/watch/video-page")
//!         .await?;
//!     println!("{} bytes", body.len());
//!
//!     fetcher.shutdown().await;
//!     Ok(())
//! }
//! ```

mod error;
mod fetcher;
mod retryable;

pub mod extract;
pub mod health;
pub mod pool;
pub mod proxy;
pub mod ratelimit;
pub mod relay;
pub mod strategy;
pub mod transport;

pub use error::{ErrorKind, Result};
pub use extract::validate_url;
pub use fetcher::{Fetcher, FetcherBuilder, Resolution};
pub use health::{CooldownPolicy, Resource, ResourceHealth, Tracked};
pub use pool::{RankedPool, TieBreak};
pub use proxy::probe::ProbeConfig;
pub use proxy::{BanSignature, ProxyEndpoint, ProxyPool, ProxyPoolStats, ProxyStatus};
pub use ratelimit::{AdaptiveRateLimiter, RateLimiter, RateLimiterStats};
pub use relay::{LedgerEntry, RelayEndpoint, RelayPool, RelayPoolStats, ResponseShape};
pub use strategy::{BypassStrategy, StrategyChain, StrategyStats, looks_protected};
pub use transport::{FetchResponse, HttpTransport, Transport};
