//! HTTP surface: agent ingest, chat webhook, and diagnostics (spec §6).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::aggregator::handle_notify;
use crate::errors::RelayError;
use crate::router::handle_webhook;
use crate::state::AppState;

/// Agent ingest plus diagnostics, served on `gateway.notify_port` (spec
/// §5 "configuration file enumerates ... webhook port, notification
/// port" — two distinct listeners, not one combined router).
pub fn build_notify_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/notify", post(handle_notify))
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .route("/dlq/stats", get(dlq_stats_handler))
        .with_state(state)
}

/// Chat provider inbound webhook, served on `gateway.webhook_port`.
pub fn build_webhook_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    servers: usize,
    active_sessions: usize,
}

async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, RelayError> {
    let servers = state.servers.count().await;
    let active_sessions = state.sessions.get_all_sessions()?.len();
    Ok(Json(HealthResponse {
        status: "ok",
        servers,
        active_sessions,
    }))
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    count: usize,
    sessions: Vec<SessionView>,
}

#[derive(Debug, Serialize)]
struct SessionView {
    identifier: String,
    server_id: String,
    project: String,
    tmux_session: String,
    status: String,
    created_at: String,
    expires_at: String,
}

async fn sessions_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionsResponse>, RelayError> {
    let sessions = state.sessions.get_all_sessions()?;
    let views: Vec<SessionView> = sessions
        .iter()
        .map(|s| SessionView {
            identifier: s.identifier(),
            server_id: s.server_id.clone(),
            project: s.project.clone(),
            tmux_session: s.tmux_session.clone(),
            status: s.status.as_str().to_string(),
            created_at: s.created_at.to_rfc3339(),
            expires_at: s.expires_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(SessionsResponse {
        count: views.len(),
        sessions: views,
    }))
}

#[derive(Debug, Serialize)]
struct DlqStatsResponse {
    enabled: bool,
    total_messages: u64,
    pending_messages: u64,
    archived_messages: u64,
    by_type: std::collections::HashMap<String, u64>,
}

async fn dlq_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DlqStatsResponse>, RelayError> {
    let stats = state.dlq.stats()?;
    Ok(Json(DlqStatsResponse {
        enabled: true,
        total_messages: stats.total,
        pending_messages: stats.pending,
        archived_messages: stats.archived,
        by_type: stats.by_type,
    }))
}
