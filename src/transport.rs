//! The narrow transport contract between the core and the outside world.
//!
//! The core never talks HTTP directly; it hands URLs (and an optional
//! proxy) to a [`Transport`] and receives status, opaque bytes and the
//! elapsed time back. [`HttpTransport`] is the production implementation
//! on top of `reqwest`; tests substitute scripted transports.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use url::Url;

use crate::error::Result;

/// Default per-attempt timeout for fetches
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for only the connect phase
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Browser User-Agent strings rotated across requests
const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// What a transport hands back for every completed request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Opaque response body
    pub body: Vec<u8>,
    /// Time from issuing the request to the last body byte
    pub elapsed: Duration,
}

impl FetchResponse {
    /// Whether the status is in the 2xx range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The body as (lossy) UTF-8 text.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// The single contract the core consumes: issue a request, optionally
/// through a proxy, and report status, body and elapsed time — or raise
/// a network error.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET request.
    async fn fetch(
        &self,
        url: &str,
        headers: &HeaderMap,
        proxy: Option<&Url>,
    ) -> Result<FetchResponse>;

    /// Issue a POST request with the given body.
    async fn post(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        proxy: Option<&Url>,
    ) -> Result<FetchResponse>;
}

/// Production transport on top of `reqwest`.
///
/// Requests go out with browser camouflage headers and a rotating
/// User-Agent. Because `reqwest` fixes the proxy at client construction,
/// one client per proxy is built lazily and cached.
pub struct HttpTransport {
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
    timeout: Duration,
    user_agents: Vec<String>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create a transport with the default per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    /// Create a transport with a custom per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            direct: Self::build_client(timeout, None)?,
            proxied: Mutex::new(HashMap::new()),
            timeout,
            user_agents: USER_AGENTS.iter().map(ToString::to_string).collect(),
        })
    }

    /// Replace the rotated User-Agent list.
    #[must_use]
    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        if !user_agents.is_empty() {
            self.user_agents = user_agents;
        }
        self
    }

    fn build_client(timeout: Duration, proxy: Option<&Url>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .gzip(true);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
        Ok(builder.build()?)
    }

    fn client_for(&self, proxy: Option<&Url>) -> Result<reqwest::Client> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut cache = self.proxied.lock().expect("client cache poisoned");
        if let Some(client) = cache.get(proxy.as_str()) {
            return Ok(client.clone());
        }
        let client = Self::build_client(self.timeout, Some(proxy))?;
        cache.insert(proxy.as_str().to_string(), client.clone());
        Ok(client)
    }

    /// Base headers mimicking a real browser session, with a randomly
    /// chosen User-Agent and occasional client-hint headers.
    fn camouflage_headers(&self, extra: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let insert = |headers: &mut HeaderMap, name: &'static str, value: &str| {
            if let Ok(value) = value.parse() {
                headers.insert(name, value);
            }
        };

        insert(
            &mut headers,
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        );
        insert(&mut headers, "accept-language", "en-US,en;q=0.9");
        insert(&mut headers, "connection", "keep-alive");
        insert(&mut headers, "upgrade-insecure-requests", "1");

        let mut rng = rand::thread_rng();
        if let Some(agent) = self.user_agents.choose(&mut rng) {
            insert(&mut headers, "user-agent", agent);
        }
        if rng.gen_bool(0.3) {
            insert(
                &mut headers,
                "sec-ch-ua",
                "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\"",
            );
            insert(&mut headers, "sec-ch-ua-mobile", "?0");
        }

        for (name, value) in extra {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<FetchResponse> {
        let start = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(FetchResponse {
            status,
            body,
            elapsed: start.elapsed(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        headers: &HeaderMap,
        proxy: Option<&Url>,
    ) -> Result<FetchResponse> {
        let client = self.client_for(proxy)?;
        let request = client.get(url).headers(self.camouflage_headers(headers));
        self.execute(request).await
    }

    async fn post(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        proxy: Option<&Url>,
    ) -> Result<FetchResponse> {
        let client = self.client_for(proxy)?;
        let request = client
            .post(url)
            .headers(self.camouflage_headers(headers))
            .body(body);
        self.execute(request).await
    }
}
