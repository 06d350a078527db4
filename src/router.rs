//! Inbound HTTP handling: header → tenant → state machine → proxy.
//!
//! The gate listens on one plain-HTTP address. Each request must identify a
//! tenant through the configured header and capture regex; everything that
//! fails to do so is a 401 without revealing which step failed.

use crate::config::Config;
use crate::error::{json_error_response, GateErrorCode};
use crate::manager::{EnsureError, TenantManager};
use crate::upstream::ProxyCache;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Everything a request handler needs, shared across connections.
struct GateContext {
    config: Arc<Config>,
    header_regex: Regex,
    manager: Arc<TenantManager>,
    proxies: ProxyCache,
}

/// The gate's HTTP server
pub struct GateServer {
    bind: String,
    ctx: Arc<GateContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GateServer {
    pub fn new(
        config: Arc<Config>,
        manager: Arc<TenantManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let header_regex = config.compile_regex()?;
        let proxies = ProxyCache::new(config.upstream_timeout());
        let bind = config.bind.clone();

        Ok(Self {
            bind,
            ctx: Arc::new(GateContext {
                config,
                header_regex,
                manager,
                proxies,
            }),
            shutdown_rx,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind.as_str()).await?;
        info!(bind = %self.bind, "gate listening for new HTTP connections");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("gate server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<GateContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    // Both HTTP/1.1 and h2c on the same listener.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<GateContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header_value = match req
        .headers()
        .get(ctx.config.header.as_str())
        .and_then(|v| v.to_str().ok())
    {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            info!(header = %ctx.config.header, "access denied, header missing or empty");
            return Ok(json_error_response(
                GateErrorCode::MissingHeader,
                "Access denied",
            ));
        }
    };

    let Some(key) = capture_tenant_key(&ctx.header_regex, &header_value) else {
        info!(
            header = %ctx.config.header,
            value = %header_value,
            "access denied, header did not match capture regex"
        );
        return Ok(json_error_response(
            GateErrorCode::HeaderNotMatched,
            "Access denied",
        ));
    };

    let Some(attrs) = ctx.config.data.get(&key) else {
        info!(key = %key, "access denied, no data entry for tenant");
        return Ok(json_error_response(
            GateErrorCode::UnknownTenant,
            "Access denied",
        ));
    };

    let Some(slot) = ctx.manager.slot(&key, attrs) else {
        info!(key = %key, "access denied, tenant id space exhausted");
        return Ok(json_error_response(
            GateErrorCode::TenantIdsExhausted,
            "Access denied",
        ));
    };

    debug!(
        key = %key,
        id = slot.id(),
        method = %req.method(),
        uri = %req.uri(),
        request_id = %request_id,
        "incoming request"
    );

    if let Err(e) = ctx.manager.ensure_started(&slot).await {
        return Ok(match e {
            EnsureError::CapacityDenied => {
                json_error_response(GateErrorCode::CapacityExhausted, "Access denied")
            }
            EnsureError::WorkerDied => json_error_response(
                GateErrorCode::WorkerUnavailable,
                "Worker exited during startup",
            ),
            EnsureError::StartupTimedOut => json_error_response(
                GateErrorCode::WorkerUnavailable,
                "Worker did not become ready",
            ),
        });
    }

    slot.touch();

    // Stamp proxy headers. These overwrite client-supplied values; the gate
    // is the first trusted hop. The Host header is left as the client sent
    // it and reaches the worker unchanged.
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let proxy = ctx.proxies.proxy_for(slot.id());
    match proxy.forward(req).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(
                key = %key,
                id = slot.id(),
                error = %e,
                "failed to forward request to worker"
            );
            Ok(json_error_response(
                GateErrorCode::UpstreamFailed,
                "Failed to reach worker",
            ))
        }
    }
}

/// Apply the capture regex; group 1 is the tenant key, and an empty capture
/// counts as no match.
fn capture_tenant_key(regex: &Regex, header_value: &str) -> Option<String> {
    let captures = regex.captures(header_value)?;
    let key = captures.get(1)?.as_str();
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_group_one_is_the_key() {
        let regex = Regex::new(r"^tenant-([a-z]+)$").unwrap();
        assert_eq!(
            capture_tenant_key(&regex, "tenant-alice"),
            Some("alice".to_string())
        );
        assert_eq!(capture_tenant_key(&regex, "tenant-"), None);
        assert_eq!(capture_tenant_key(&regex, "other"), None);
    }

    #[test]
    fn test_regex_without_group_never_matches() {
        let regex = Regex::new(r"^[a-z]+$").unwrap();
        assert_eq!(capture_tenant_key(&regex, "alice"), None);
    }

    #[test]
    fn test_full_value_capture() {
        let regex = Regex::new(r"^(.+)$").unwrap();
        assert_eq!(
            capture_tenant_key(&regex, "alice"),
            Some("alice".to_string())
        );
    }
}
