use crate::middleware::{auth_middleware, rate_limit_middleware, MiddlewareState};
use axum::{
    extract::State,
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashgate_security::TokenInfo;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// The dashboard gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router: `/health` is open, everything under `/api` sits
    /// behind rate limiting and then token auth.
    ///
    /// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
    /// clients are told apart by peer address.
    pub fn build(state: Arc<MiddlewareState>) -> Router {
        let api = Router::new()
            .route("/api/token", get(token_info_handler))
            .route("/api/rotate", post(rotate_handler))
            .with_state(state.clone())
            .layer(axum_mw::from_fn_with_state(state.clone(), auth_middleware))
            .layer(axum_mw::from_fn_with_state(state, rate_limit_middleware));

        Router::new()
            .route("/health", get(health_handler))
            .merge(api)
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "dashgate"}))
}

#[derive(Serialize)]
struct TokenInfoResponse {
    configured: bool,
    #[serde(flatten)]
    info: Option<TokenInfo>,
}

async fn token_info_handler(State(state): State<Arc<MiddlewareState>>) -> impl IntoResponse {
    let info = state.tokens.info();
    Json(TokenInfoResponse {
        configured: info.is_some(),
        info,
    })
}

#[derive(Serialize)]
struct RotateResponse {
    token: String,
    grace_period_seconds: u64,
    max_age_days: u64,
}

async fn rotate_handler(State(state): State<Arc<MiddlewareState>>) -> Response {
    let tokens = state.tokens.clone();
    let rotated = tokio::task::spawn_blocking(move || tokens.rotate()).await;

    match rotated {
        Ok(Ok(token)) => {
            info!("Dashboard token rotated via API");
            let config = state.tokens.config();
            Json(RotateResponse {
                token,
                grace_period_seconds: config.grace_period.as_secs(),
                max_age_days: config.max_age.as_secs() / 86_400,
            })
            .into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "Token rotation failed");
            rotation_failed()
        }
        Err(e) => {
            error!(error = %e, "Token rotation task panicked");
            rotation_failed()
        }
    }
}

fn rotation_failed() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "rotation_failed"})),
    )
        .into_response()
}
