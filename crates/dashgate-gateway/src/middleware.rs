use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashgate_security::{AuditAction, AuditLog, RateDecision, RateLimiter, TokenStore, TokenValidation};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MISSING_HINT: &str = "Send Authorization: Bearer <token>";
const REJECTED_HINT: &str = "Invalid or expired token";

/// Shared middleware state.
pub struct MiddlewareState {
    pub tokens: Arc<TokenStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLog>,
}

/// JSON body of every denial.
#[derive(Debug, Serialize)]
struct Denial<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

fn deny(status: StatusCode, error: &str, hint: &str) -> Response {
    let body = Denial {
        error,
        hint: Some(hint),
        retry_after_seconds: None,
    };
    (status, Json(body)).into_response()
}

fn too_many(error: &str, retry_after: Duration) -> Response {
    let secs = retry_after.as_secs();
    let body = Denial {
        error,
        hint: None,
        retry_after_seconds: Some(secs),
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    response
}

/// Peer IP of the connection, or `unknown` when the server was not started
/// with connect info.
pub fn client_id(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Strip a case-insensitive `Bearer` scheme and the whitespace after it.
pub fn bearer_token(value: &str) -> &str {
    if let Some(scheme) = value.get(..6) {
        if scheme.eq_ignore_ascii_case("bearer") {
            let rest = &value[6..];
            let token = rest.trim_start();
            if token.len() < rest.len() {
                return token;
            }
        }
    }
    value
}

/// Rate limiting middleware: blocked clients and request floods never reach auth.
pub async fn rate_limit_middleware(
    State(state): State<Arc<MiddlewareState>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_id(&request);
    let endpoint = request.uri().path().to_string();

    match state.rate_limiter.check(&client, &endpoint).await {
        RateDecision::Allowed => next.run(request).await,
        RateDecision::Exceeded { retry_after, .. } => too_many("rate_limit_exceeded", retry_after),
        RateDecision::Blocked { retry_after } => too_many("too_many_failed_attempts", retry_after),
    }
}

/// Auth middleware: validates the dashboard token from the `Authorization` header.
///
/// With no token configured every request passes (legacy open mode). Every
/// rejection is audited and counted against the client's failure window.
pub async fn auth_middleware(
    State(state): State<Arc<MiddlewareState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.tokens.state().is_configured() {
        return next.run(request).await;
    }

    let client = client_id(&request);
    let endpoint = request.uri().path().to_string();

    // A missing header is audited but not counted toward the failure block.
    let Some(header_value) = request.headers().get(header::AUTHORIZATION) else {
        warn!(client = %client, endpoint = %endpoint, "Rejected request: missing token");
        state.audit.record(
            &client,
            &endpoint,
            AuditAction::AuthMissing,
            "No Authorization header",
        );
        return deny(
            StatusCode::UNAUTHORIZED,
            "authentication_required",
            MISSING_HINT,
        );
    };

    // A non-UTF-8 header can never match a hex token.
    let candidate = bearer_token(header_value.to_str().unwrap_or_default());
    let result = state.tokens.validate(candidate);

    match result {
        TokenValidation::NoTokenConfigured | TokenValidation::Valid => {
            debug!(client = %client, endpoint = %endpoint, "Authenticated");
            next.run(request).await
        }
        TokenValidation::ValidGrace => {
            warn!(client = %client, endpoint = %endpoint, "Authenticated with previous token");
            state.audit.record(
                &client,
                &endpoint,
                AuditAction::AuthGrace,
                "Authenticated with previous token (grace period)",
            );
            next.run(request).await
        }
        rejected => {
            let reason = rejected.reason().unwrap_or("invalid_token");
            warn!(client = %client, endpoint = %endpoint, reason, "Rejected request: bad token");

            state.rate_limiter.record_failure(&client).await;
            state
                .audit
                .record(&client, &endpoint, AuditAction::AuthFailed, reason);

            let status = match &rejected {
                TokenValidation::InvalidToken => StatusCode::FORBIDDEN,
                _ => StatusCode::UNAUTHORIZED,
            };
            deny(status, reason, rejected.hint().unwrap_or(REJECTED_HINT))
        }
    }
}
