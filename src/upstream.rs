//! Per-tenant reverse proxying over a shared upstream transport.
//!
//! One proxy handle exists per tenant id, built lazily and retained across
//! worker restarts (the port never changes). All handles forward through a
//! single pooled HTTP client tuned from `http_timeout`.

use dashmap::DashMap;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Idle upstream connections kept per worker.
const MAX_IDLE_PER_HOST: usize = 10;

/// Error type for upstream forwarding
#[derive(Debug)]
pub enum UpstreamError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building the upstream request
    RequestBuild(String),
    /// The worker did not answer within the transport budget
    Timeout(Duration),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "client error: {}", e),
            UpstreamError::RequestBuild(s) => write!(f, "request build error: {}", s),
            UpstreamError::Timeout(d) => write!(f, "no response within {}s", d.as_secs()),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

/// Counters for the shared upstream transport
#[derive(Debug, Default)]
pub struct UpstreamStats {
    forwarded: AtomicU64,
}

impl UpstreamStats {
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

/// Lazily built map from tenant id to its reverse-proxy handle.
pub struct ProxyCache {
    client: Client<HttpConnector, Incoming>,
    proxies: DashMap<u16, Arc<TenantProxy>>,
    request_timeout: Duration,
    stats: Arc<UpstreamStats>,
}

impl ProxyCache {
    pub fn new(http_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(http_timeout));
        connector.set_keepalive(Some(http_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(http_timeout)
            .build(connector);

        debug!(
            timeout_secs = http_timeout.as_secs(),
            max_idle = MAX_IDLE_PER_HOST,
            "upstream transport initialized"
        );

        Self {
            client,
            proxies: DashMap::new(),
            request_timeout: http_timeout,
            stats: Arc::new(UpstreamStats::default()),
        }
    }

    /// Fetch the proxy for a tenant id, building it on first use. Entries
    /// survive worker restarts; the id never maps to a different port.
    pub fn proxy_for(&self, id: u16) -> Arc<TenantProxy> {
        let entry = self.proxies.entry(id).or_insert_with(|| {
            Arc::new(TenantProxy {
                port: id,
                client: self.client.clone(),
                request_timeout: self.request_timeout,
                stats: Arc::clone(&self.stats),
            })
        });
        Arc::clone(entry.value())
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.proxies.len()
    }
}

/// Reverse proxy for one tenant, directed at `http://127.0.0.1:<id>/`.
pub struct TenantProxy {
    port: u16,
    client: Client<HttpConnector, Incoming>,
    request_timeout: Duration,
    stats: Arc<UpstreamStats>,
}

impl TenantProxy {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Forward a request to the worker and hand the response back verbatim.
    ///
    /// Headers are copied through unchanged; in particular the original
    /// client `Host` header survives, since the client only derives `Host`
    /// from the URI when the header is absent.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", self.port, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let upstream_req = builder
            .body(body)
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

        self.stats.record_forwarded();

        let response = tokio::time::timeout(self.request_timeout, self.client.request(upstream_req))
            .await
            .map_err(|_| UpstreamError::Timeout(self.request_timeout))??;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxies_are_cached_per_id() {
        let cache = ProxyCache::new(Duration::from_secs(30));

        let a = cache.proxy_for(15000);
        let b = cache.proxy_for(15000);
        let c = cache.proxy_for(15001);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.port(), 15000);
        assert_eq!(c.port(), 15001);
        assert_eq!(cache.cached(), 2);
    }

    #[test]
    fn test_stats_start_at_zero() {
        let cache = ProxyCache::new(Duration::from_secs(30));
        assert_eq!(cache.stats().forwarded(), 0);

        cache.stats().record_forwarded();
        cache.stats().record_forwarded();
        assert_eq!(cache.stats().forwarded(), 2);
    }

    #[test]
    fn test_upstream_error_display() {
        let err = UpstreamError::RequestBuild("bad uri".to_string());
        assert_eq!(err.to_string(), "request build error: bad uri");

        let err = UpstreamError::Timeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "no response within 300s");
    }
}
