//! Denial and bad-gateway responses.
//!
//! When the gate refuses a request on its own authority it answers with a
//! small JSON document and mirrors the machine-readable code into an
//! `X-Gate-Error` header. Worker responses never pass through here.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Everything that can go wrong before a request reaches a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateErrorCode {
    /// Identifying header absent or empty
    MissingHeader,
    /// Header present but the capture regex did not match
    HeaderNotMatched,
    /// No configuration entry for the captured tenant key
    UnknownTenant,
    /// Tenant id space exhausted
    TenantIdsExhausted,
    /// Live worker cap reached
    CapacityExhausted,
    /// Worker died before ready or never became ready
    WorkerUnavailable,
    /// Worker was started but the request could not be forwarded
    UpstreamFailed,
}

impl GateErrorCode {
    /// Every access failure is a plain 401; worker trouble is a bad gateway.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::MissingHeader
            | GateErrorCode::HeaderNotMatched
            | GateErrorCode::UnknownTenant
            | GateErrorCode::TenantIdsExhausted
            | GateErrorCode::CapacityExhausted => StatusCode::UNAUTHORIZED,
            GateErrorCode::WorkerUnavailable | GateErrorCode::UpstreamFailed => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Stable machine-readable name, used both in the body and the header.
    pub fn label(&self) -> &'static str {
        match self {
            GateErrorCode::MissingHeader => "MISSING_HEADER",
            GateErrorCode::HeaderNotMatched => "HEADER_NOT_MATCHED",
            GateErrorCode::UnknownTenant => "UNKNOWN_TENANT",
            GateErrorCode::TenantIdsExhausted => "TENANT_IDS_EXHAUSTED",
            GateErrorCode::CapacityExhausted => "CAPACITY_EXHAUSTED",
            GateErrorCode::WorkerUnavailable => "WORKER_UNAVAILABLE",
            GateErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
        }
    }
}

/// Wire shape of a gate-generated error body.
#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
    status: u16,
}

/// Build the full HTTP response for a refused request.
pub fn json_error_response(
    code: GateErrorCode,
    message: impl AsRef<str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = code.status_code();
    let body = ErrorBody {
        code: code.label(),
        message: message.as_ref(),
        status: status.as_u16(),
    };
    // Strings and integers always serialize; an empty body on the off chance
    // they do not still carries the status and header.
    let json = serde_json::to_vec(&body).unwrap_or_default();

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Gate-Error", code.label())
        .body(Full::new(Bytes::from(json)).map_err(|never| match never {}).boxed())
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        for code in [
            GateErrorCode::MissingHeader,
            GateErrorCode::HeaderNotMatched,
            GateErrorCode::UnknownTenant,
            GateErrorCode::TenantIdsExhausted,
            GateErrorCode::CapacityExhausted,
        ] {
            assert_eq!(code.status_code(), StatusCode::UNAUTHORIZED, "{code:?}");
        }
        for code in [
            GateErrorCode::WorkerUnavailable,
            GateErrorCode::UpstreamFailed,
        ] {
            assert_eq!(code.status_code(), StatusCode::BAD_GATEWAY, "{code:?}");
        }
    }

    #[test]
    fn test_labels_are_screaming_snake() {
        assert_eq!(GateErrorCode::MissingHeader.label(), "MISSING_HEADER");
        assert_eq!(GateErrorCode::CapacityExhausted.label(), "CAPACITY_EXHAUSTED");
        assert_eq!(GateErrorCode::UpstreamFailed.label(), "UPSTREAM_FAILED");
    }

    #[tokio::test]
    async fn test_response_shape() {
        let response = json_error_response(GateErrorCode::UnknownTenant, "Access denied");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Gate-Error").unwrap(),
            "UNKNOWN_TENANT"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "UNKNOWN_TENANT");
        assert_eq!(body["message"], "Access denied");
        assert_eq!(body["status"], 401);
    }

    #[tokio::test]
    async fn test_bad_gateway_body_carries_502() {
        let response =
            json_error_response(GateErrorCode::WorkerUnavailable, "Worker exited during startup");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], 502);
        assert_eq!(body["code"], "WORKER_UNAVAILABLE");
    }
}
