//! axum integration: the admission middleware and client address extraction.

use ::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use crate::{
    policy::{AdmissionRequest, AuthContext},
    reporter::RateLimitHeaders,
    service::AdmissionService,
};

/// Admission check for every request passing through the layer.
///
/// An upstream auth layer is expected to insert an [`AuthContext`] into the
/// request extensions for authenticated callers. Admitted requests carry the
/// [`Decision`](crate::service::Decision) in their extensions downstream.
pub async fn admission_middleware(
    State(service): State<Arc<AdmissionService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let admission_request = AdmissionRequest {
        auth: request.extensions().get::<AuthContext>().cloned(),
        client_addr: client_addr(&request, service.trusted_proxies()),
    };

    let decision = match service.admit(&admission_request) {
        Ok(decision) => decision,
        Err(e) => {
            let body = service.reporter().report_error(&e);
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
    };

    let report = service.report(&decision);

    if let Some(rejection) = report.rejection {
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(rejection)).into_response();
        if let Some(headers) = &report.headers {
            apply_headers(response.headers_mut(), headers);
        }
        return response;
    }

    request.extensions_mut().insert(decision);
    let mut response = next.run(request).await;
    if let Some(headers) = &report.headers {
        apply_headers(response.headers_mut(), headers);
    }
    response
}

/// Set rate-limit headers on a response
pub fn apply_headers(target: &mut HeaderMap, headers: &RateLimitHeaders) {
    for (name, value) in headers.to_pairs() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            target.insert(name, value);
        }
    }
}

/// Caller address. A socket peer listed in `trusted_proxies` may name the
/// caller through the first `X-Forwarded-For` hop or `X-Real-IP`; any other
/// peer is the caller itself. Empty when the peer address is unknown.
pub fn client_addr(request: &Request, trusted_proxies: &[IpAddr]) -> String {
    let Some(peer) = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
    else {
        return String::new();
    };

    if trusted_proxies.contains(&peer) {
        if let Some(forwarded) = forwarded_addr(request.headers()) {
            return forwarded;
        }
    }

    peer.to_string()
}

fn forwarded_addr(headers: &HeaderMap) -> Option<String> {
    let first_hop = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    first_hop.or_else(real_ip).map(str::to_string)
}
