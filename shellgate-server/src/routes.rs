use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use shellgate_core::{CreateOptions, HelperAuth, HelperInfo, PtySessionInfo};
use tracing::warn;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub shell: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionBody {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HelperStatusResponse {
    pub installed: bool,
    pub sessions: Vec<HelperInfo>,
}

#[derive(Debug, Serialize)]
pub struct HelperCreatedResponse {
    pub port: u16,
    pub pid: u32,
    pub auth: HelperAuth,
}

#[derive(Debug, Deserialize)]
pub struct StopHelperBody {
    pub port: u16,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let session_id = state.pty.create_with(CreateOptions {
        shell: body.shell,
        cols: body.cols,
        rows: body.rows,
        cwd: body.cwd.map(Into::into),
    })?;
    Ok(Json(CreateSessionResponse { session_id }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<PtySessionInfo>> {
    Json(state.pty.list())
}

pub async fn close_session(
    State(state): State<AppState>,
    Json(body): Json<CloseSessionBody>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.pty.close(&body.session_id)?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn helper_status(State(state): State<AppState>) -> Json<HelperStatusResponse> {
    let helper = state.helper.clone();
    // Both calls shell out or scan the process table.
    let response = tokio::task::spawn_blocking(move || HelperStatusResponse {
        installed: helper.is_available(),
        sessions: helper.list_active(),
    })
    .await
    .unwrap_or(HelperStatusResponse {
        installed: false,
        sessions: Vec::new(),
    });
    Json(response)
}

pub async fn create_helper(
    State(state): State<AppState>,
) -> Result<Json<HelperCreatedResponse>, ApiError> {
    let launch = state.helper.create().await?;
    Ok(Json(HelperCreatedResponse {
        port: launch.port,
        pid: launch.pid,
        auth: launch.credential.to_auth(),
    }))
}

pub async fn stop_helper(
    State(state): State<AppState>,
    Json(body): Json<StopHelperBody>,
) -> Json<SuccessResponse> {
    let helper = state.helper.clone();
    // An untracked port means a scan of the process and socket tables.
    if let Err(e) = tokio::task::spawn_blocking(move || helper.stop(body.port)).await {
        warn!(port = body.port, error = %e, "Helper stop task failed");
    }
    Json(SuccessResponse { success: true })
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.pty.len(),
    })
}
