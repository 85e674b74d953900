use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use vaultgate::{AdmissionGate, Decision, RequestInfo};

pub const REMAINING_HEADER: &str = "x-rate-limit-remaining";
pub const RETRY_AFTER_HEADER: &str = "x-rate-limit-retry-after-seconds";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Admission check run before every handler.
///
/// Allowed requests carry their [`Decision`] as a request extension and get
/// `X-Rate-Limit-Remaining` on the response. Denied requests never reach the
/// handler: 429 with `X-Rate-Limit-Retry-After-Seconds` and a plain-text body.
pub async fn admission_layer(
    State(gate): State<Arc<AdmissionGate>>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let info = request_info(req.headers(), peer);
    let decision = gate.admit(&info);

    if !decision.allowed {
        return too_many_requests(&decision);
    }

    let remaining = decision.remaining_tokens;
    req.extensions_mut().insert(decision);
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(REMAINING_HEADER, HeaderValue::from(remaining));
    response
}

/// Extract the identity signals the gate looks at.
pub fn request_info(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestInfo {
    RequestInfo {
        forwarded_for: header_str(headers, FORWARDED_FOR_HEADER),
        peer_addr: peer.map(|addr| addr.ip()),
        authorization: header_str(headers, header::AUTHORIZATION.as_str()),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn too_many_requests(decision: &Decision) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    response.headers_mut().insert(
        RETRY_AFTER_HEADER,
        HeaderValue::from(decision.retry_after_seconds),
    );
    response
}
