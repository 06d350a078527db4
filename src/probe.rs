//! Worker readiness probing.
//!
//! A worker is ready once `GET http://127.0.0.1:<port>/` answers with any
//! status below 500. Transport errors and 5xx responses both mean the worker
//! is still coming up; the probe loop in the tenant state machine absorbs
//! them and tries again.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Per-probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a single readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

/// Readiness prober with its own small connection pool, shared across tenants.
pub struct ReadyProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl ReadyProbe {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(PROBE_TIMEOUT));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .build(connector);

        Self { client }
    }

    /// Probe the worker's root path once.
    pub async fn check(&self, port: u16) -> Readiness {
        let uri = format!("http://127.0.0.1:{}/", port);
        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(_) => return Readiness::NotReady,
        };

        match tokio::time::timeout(PROBE_TIMEOUT, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                // Drain the body so the connection can be reused.
                let _ = response.into_body().collect().await;
                if status.as_u16() < 500 {
                    Readiness::Ready
                } else {
                    debug!(port, %status, "probe saw server error");
                    Readiness::NotReady
                }
            }
            Ok(Err(e)) => {
                debug!(port, error = %e, "probe transport error");
                Readiness::NotReady
            }
            Err(_) => {
                debug!(port, "probe timed out");
                Readiness::NotReady
            }
        }
    }
}

impl Default for ReadyProbe {
    fn default() -> Self {
        Self::new()
    }
}
