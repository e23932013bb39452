use axum::extract::connect_info::MockConnectInfo;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONNECTION;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::any::Any;
use std::net::SocketAddr;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::server::AppState;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = client_ip(&request).unwrap_or_else(|| "unknown".to_string());
    let request_id = Uuid::new_v4().to_string();

    info!(
        target: "movies_api::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "movies_api::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status,
        "request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// The peer address of the connection, port stripped. Forwarding headers
/// are not consulted.
pub fn client_ip(request: &Request) -> Option<String> {
    let extensions = request.extensions();
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr)
        .or_else(|| {
            extensions
                .get::<MockConnectInfo<SocketAddr>>()
                .map(|MockConnectInfo(addr)| addr)
        })
        .map(|addr| addr.ip().to_string())
}

/// Per-client admission control in front of everything but panic recovery.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.limiter.is_enabled() {
        return next.run(request).await;
    }

    let Some(ip) = client_ip(&request) else {
        return ApiError::Invariant("connection info missing from request").into_response();
    };

    if !state.limiter.allow(&ip) {
        return ApiError::RateLimitExceeded.into_response();
    }
    next.run(request).await
}

/// The router answers a wrong method with an empty 405; give it the usual
/// JSON error body while keeping its `Allow` header.
pub async fn method_not_allowed(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let response = next.run(request).await;
    if response.status() != StatusCode::METHOD_NOT_ALLOWED {
        return response;
    }

    let allow = response.headers().get(axum::http::header::ALLOW).cloned();
    let mut rewritten = ApiError::MethodNotAllowed(method).into_response();
    if let Some(allow) = allow {
        rewritten.headers_mut().insert(axum::http::header::ALLOW, allow);
    }
    rewritten
}

/// Turns a panic anywhere below into a server error and closes the
/// connection.
pub fn recover_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };

    let mut response = ApiError::server(format!("panic: {detail}")).into_response();
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
