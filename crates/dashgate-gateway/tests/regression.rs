#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Regression tests for dashgate-gateway: middleware ordering and audit
//! side effects, driven in-process without a socket.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use dashgate_gateway::{GatewayServer, MiddlewareState};
use dashgate_security::token::{CurrentToken, PreviousToken, Secret};
use dashgate_security::{
    AuditAction, AuditEntry, AuditLog, AuditLogConfig, RateLimitConfig, RateLimiter, TokenState,
    TokenStore, TokenStoreConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

fn state(tmp: &tempfile::TempDir) -> Arc<MiddlewareState> {
    let audit = Arc::new(AuditLog::new(AuditLogConfig::new(tmp.path().join("audit.log"))));
    Arc::new(MiddlewareState {
        tokens: Arc::new(TokenStore::new(TokenStoreConfig::new(tmp.path().join("secrets")))),
        rate_limiter: Arc::new(
            RateLimiter::new(RateLimitConfig::default()).with_audit(audit.clone()),
        ),
        audit,
    })
}

fn request(path: &str, peer: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(path);
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    let mut req = builder.body(Body::empty()).unwrap();
    let addr: SocketAddr = peer.parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

async fn entries(state: &MiddlewareState) -> Vec<AuditEntry> {
    state.audit.flush().await;
    std::fs::read_to_string(state.audit.path())
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn test_expired_previous_token_is_401() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state(&tmp);
    let now = Utc::now();
    state
        .tokens
        .save(&TokenState {
            current: Some(CurrentToken {
                value: Secret::new("c".repeat(64)),
                created_at: now,
            }),
            previous: Some(PreviousToken {
                value: Secret::new("p".repeat(64)),
                expires_at: now - chrono::TimeDelta::minutes(1),
            }),
        })
        .unwrap();

    let app = GatewayServer::build(state.clone());
    let auth = format!("Bearer {}", "p".repeat(64));
    let resp = app
        .oneshot(request("/api/token", "10.1.1.1:4000", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "previous_token_expired");

    let logged = entries(&state).await;
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].action, AuditAction::AuthFailed);
    assert_eq!(logged[0].detail, "previous_token_expired");
    assert_eq!(logged[0].client, "10.1.1.1");
    assert_eq!(logged[0].endpoint, "/api/token");
}

#[tokio::test]
async fn test_expired_current_token_is_401_with_hint() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state(&tmp);
    state
        .tokens
        .save(&TokenState {
            current: Some(CurrentToken {
                value: Secret::new("c".repeat(64)),
                created_at: Utc::now() - chrono::TimeDelta::days(8),
            }),
            previous: None,
        })
        .unwrap();

    let app = GatewayServer::build(state.clone());
    let auth = format!("Bearer {}", "c".repeat(64));
    let resp = app
        .oneshot(request("/api/token", "10.1.1.2:4000", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "token_expired");
    assert!(json["hint"].as_str().unwrap().contains("dashgate token rotate"));
}

#[tokio::test]
async fn test_failures_are_tracked_per_peer() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state(&tmp);
    let token = state.tokens.rotate().unwrap();
    let app = GatewayServer::build(state.clone());

    for _ in 0..5 {
        let resp = app
            .clone()
            .oneshot(request("/api/token", "10.2.0.1:1000", Some("Bearer nope")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
    assert!(state.rate_limiter.is_blocked("10.2.0.1").await);

    let auth = format!("Bearer {token}");
    let other = app
        .clone()
        .oneshot(request("/api/token", "10.2.0.2:1000", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);

    let blocked = app
        .oneshot(request("/api/token", "10.2.0.1:1001", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_health_is_not_rate_limited() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state(&tmp);
    state.tokens.rotate().unwrap();
    let app = GatewayServer::build(state.clone());

    for _ in 0..40 {
        let resp = app
            .clone()
            .oneshot(request("/health", "10.3.0.1:1000", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    assert_eq!(state.rate_limiter.tracked_clients().await, 0);
}

#[tokio::test]
async fn test_missing_header_does_not_count_toward_block() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state(&tmp);
    let token = state.tokens.rotate().unwrap();
    let app = GatewayServer::build(state.clone());

    for _ in 0..6 {
        let resp = app
            .clone()
            .oneshot(request("/api/token", "10.4.0.1:1000", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
    assert!(!state.rate_limiter.is_blocked("10.4.0.1").await);

    let auth = format!("Bearer {token}");
    let resp = app
        .oneshot(request("/api/token", "10.4.0.1:1001", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let logged = entries(&state).await;
    assert_eq!(logged.len(), 6);
    assert!(logged.iter().all(|e| e.action == AuditAction::AuthMissing));
}
