//! HTTP and WebSocket front end over the Shellgate brokers.

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use shellgate_core::{HelperBroker, PtyBroker, ShellgateConfig};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod routes;
pub mod ws;

use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub pty: Arc<PtyBroker>,
    pub helper: Arc<HelperBroker>,
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(config: &ShellgateConfig) -> Self {
        Self {
            pty: Arc::new(PtyBroker::new(config.terminal.clone())),
            helper: Arc::new(HelperBroker::new(config.helper.clone())),
            auth_token: config.server.auth_token.clone().filter(|t| !t.is_empty()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/terminal/sessions",
            post(routes::create_session).get(routes::list_sessions),
        )
        .route("/api/terminal/sessions/close", post(routes::close_session))
        .route("/api/terminal/sessions/{id}/ws", get(ws::session_socket))
        .route(
            "/api/terminal/helper",
            get(routes::helper_status).post(routes::create_helper),
        )
        .route("/api/terminal/helper/stop", post(routes::stop_helper))
        .route("/api/status", get(routes::status))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn provided_token(request: &Request) -> Option<String> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = header {
        return Some(token.to_string());
    }
    // Browsers cannot set headers on a WebSocket upgrade.
    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(query)| query.token)
}

fn token_matches(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.auth_token.as_deref() {
        let accepted = provided_token(&request)
            .map(|token| token_matches(expected, &token))
            .unwrap_or(false);
        if !accepted {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}
