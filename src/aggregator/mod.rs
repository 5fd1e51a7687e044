//! Notification aggregator: ingest authentication, session upsert,
//! chat dispatch, and the dead-letter retry loop (spec §4.7).

mod format;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use relay_channels::OutboundNotification;

use crate::errors::RelayError;
use crate::state::AppState;

pub use format::{build_notifications, format_notification};

const DLQ_MESSAGE_TYPE: &str = "telegram_notification";
const RETRY_LOOP_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_LOOP_BATCH: usize = 10;
const DEFAULT_DLQ_CLEANUP_AFTER_DAYS: i64 = 30;
/// Archived messages are only worth sweeping for age once an hour, not
/// on every 30s retry tick.
const CLEANUP_EVERY_N_TICKS: u32 = 120;

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(rename = "serverId")]
    pub server_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub project: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Serialize)]
pub struct NotifySessionView {
    pub id: String,
    pub identifier: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub success: bool,
    pub session: NotifySessionView,
}

fn constant_time_eq(expected: &str, actual: &str) -> bool {
    expected.as_bytes().ct_eq(actual.as_bytes()).into()
}

pub async fn handle_notify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>, RelayError> {
    let provided_secret = headers
        .get("X-Shared-Secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(&state.config.gateway.shared_secret, provided_secret) {
        return Err(RelayError::Unauthorized);
    }

    if body.server_id.is_empty() || body.notification_type.is_empty() || body.project.is_empty() {
        return Err(RelayError::BadRequest(
            "serverId, type, and project are required".to_string(),
        ));
    }
    if !state.servers.has(&body.server_id).await {
        return Err(RelayError::BadRequest(format!(
            "unknown serverId '{}'",
            body.server_id
        )));
    }
    let tmux_session = body
        .metadata
        .get("tmuxSession")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::BadRequest("metadata.tmuxSession is required".to_string()))?
        .to_string();

    state
        .servers
        .update_status(&body.server_id, "active", chrono::Utc::now())
        .await;

    let session = state
        .sessions
        .create_session(&body.server_id, &tmux_session, &body.project, &body.metadata)?;

    let identifier = session.identifier();
    let parts = format_notification(&body.server_id, &body.project, &identifier, &body.metadata);
    let notifications = build_notifications(&state.config.chat.chat_id, parts);

    if let Err(send_err) = dispatch_all(&state, &notifications).await {
        warn!(server_id = %body.server_id, error = %send_err, "chat dispatch failed, enqueueing to dlq");
        if let Err(dlq_err) = enqueue_failed(&state, &notifications, &send_err.to_string()) {
            error!(error = %dlq_err, "failed to enqueue dead-letter message");
        }
        return Err(RelayError::Internal(anyhow::anyhow!(
            "chat dispatch failed: {send_err}"
        )));
    }

    Ok(Json(NotifyResponse {
        success: true,
        session: NotifySessionView {
            id: session.id,
            identifier,
            token: session.token,
        },
    }))
}

async fn dispatch_all(
    state: &AppState,
    notifications: &[OutboundNotification],
) -> anyhow::Result<()> {
    for notification in notifications {
        state.chat.send(notification).await?;
    }
    Ok(())
}

fn enqueue_failed(
    state: &AppState,
    notifications: &[OutboundNotification],
    error: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::to_value(
        notifications
            .iter()
            .map(|n| serde_json::json!({"chat_id": n.chat_id, "text": n.text}))
            .collect::<Vec<_>>(),
    )?;
    state.dlq.enqueue(DLQ_MESSAGE_TYPE, &payload, error)?;
    Ok(())
}

/// Background ticker: dequeues up to `RETRY_LOOP_BATCH` ready messages
/// every `RETRY_LOOP_INTERVAL` and re-dispatches each (spec §4.7 "Retry
/// loop"). `shutdown` flips to `true` to cancel at the next tick,
/// mirroring the teacher's `running` flag convention but inverted.
pub async fn run_retry_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(RETRY_LOOP_INTERVAL);
    let mut tick_count: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("dlq retry loop cancelled");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = process_retry_batch(&state).await {
                    error!(error = %e, "dlq retry batch failed");
                }
                tick_count += 1;
                if tick_count % CLEANUP_EVERY_N_TICKS == 0 {
                    if let Err(e) = cleanup_archived(&state) {
                        error!(error = %e, "dlq archive cleanup failed");
                    }
                }
            }
        }
    }
}

fn cleanup_archived(state: &AppState) -> anyhow::Result<()> {
    let days = state
        .config
        .retry
        .dlq_cleanup_after_days
        .unwrap_or(DEFAULT_DLQ_CLEANUP_AFTER_DAYS);
    let deleted = state.dlq.cleanup_old_archived(days)?;
    if deleted > 0 {
        info!(deleted, days, "swept aged-out archived dead-letter messages");
    }
    Ok(())
}

async fn process_retry_batch(state: &AppState) -> anyhow::Result<()> {
    let pending = state.dlq.dequeue_pending(RETRY_LOOP_BATCH)?;
    for message in pending {
        let entries: Vec<serde_json::Value> = serde_json::from_value(message.payload.clone())
            .unwrap_or_default();
        let mut all_ok = true;
        for entry in &entries {
            let chat_id = entry["chat_id"].as_str().unwrap_or_default();
            let text = entry["text"].as_str().unwrap_or_default();
            let notification = OutboundNotification::text(chat_id, text);
            if let Err(e) = state.chat.send(&notification).await {
                all_ok = false;
                state.dlq.record_retry_attempt(&message.id, &e.to_string())?;
                break;
            }
        }
        if all_ok {
            state.dlq.record_success(&message.id)?;
            info!(message_id = %message.id, "dead-letter message delivered on retry");
        }
    }
    Ok(())
}
