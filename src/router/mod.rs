//! Command router: parses chat commands and delegates to the SSH
//! executor (spec §4.8).

mod parser;

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::Value;
use tracing::{info, warn};

use relay_channels::{InboundUpdate, OutboundNotification};
use relay_core::{CoreError, SessionStatus};

use crate::errors::RelayError;
use crate::state::AppState;

pub use parser::{parse_command, Command};

const HELP_TEXT: &str = "Usage: /cmd <identifier> <command text>\nidentifier is either \"serverid:N\" or an 8-character token.";
const START_TEXT: &str = "Relay hub ready. Send /cmd <identifier> <command text> to run something in a session, or /help for usage.";

/// POST handler for the chat provider's webhook. Authorization is the
/// allow-list baked into the channel adapter (`parse_update` already
/// filters unknown senders); a `None` result means "nothing actionable".
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, RelayError> {
    let Some(update) = state.chat.parse_update(&raw)? else {
        return Ok(Json(serde_json::json!({"ignored": true})));
    };

    match update {
        InboundUpdate::Text { chat_id, text, .. } => {
            handle_text_command(&state, &chat_id, &text).await?;
        }
        InboundUpdate::Callback { chat_id, data, .. } => {
            handle_callback(&state, &chat_id, &data).await?;
        }
    }

    Ok(Json(serde_json::json!({"ok": true})))
}

async fn reply(state: &AppState, chat_id: &str, text: impl Into<String>) -> Result<(), RelayError> {
    let notification = OutboundNotification::text(chat_id, text);
    state
        .chat
        .send(&notification)
        .await
        .map_err(RelayError::Channel)
}

async fn handle_text_command(
    state: &AppState,
    chat_id: &str,
    text: &str,
) -> Result<(), RelayError> {
    match parse_command(text) {
        Command::Start => reply(state, chat_id, START_TEXT).await,
        Command::Help => reply(state, chat_id, HELP_TEXT).await,
        Command::Usage => reply(state, chat_id, HELP_TEXT).await,
        Command::Run { identifier, command } => run_command(state, chat_id, &identifier, &command).await,
    }
}

async fn run_command(
    state: &AppState,
    chat_id: &str,
    identifier: &str,
    command: &str,
) -> Result<(), RelayError> {
    let session = match state.sessions.find_session(identifier)? {
        Some(session) if session.status == SessionStatus::Active => session,
        _ => {
            return reply(state, chat_id, "invalid or expired session").await;
        }
    };

    match state
        .executor
        .execute(&session.server_id, command, &session.tmux_session)
        .await
    {
        Ok(()) => {
            info!(identifier, "command delivered");
            reply(
                state,
                chat_id,
                format!(
                    "[{}] {} ({})\n> {}",
                    session.server_id.to_uppercase(),
                    identifier,
                    session.tmux_session,
                    command
                ),
            )
            .await
        }
        Err(e) => {
            warn!(identifier, error = %e, "command delivery failed");
            let guidance = RelayError::from(e).user_guidance();
            reply(state, chat_id, format!("Failed to deliver command: {guidance}")).await
        }
    }
}

async fn handle_callback(state: &AppState, chat_id: &str, data: &str) -> Result<(), RelayError> {
    let Some(number) = parser::parse_callback_number(data) else {
        return reply(state, chat_id, HELP_TEXT).await;
    };

    let sessions = state.sessions.get_all_sessions()?;
    let Some(session) = sessions.into_iter().find(|s| s.server_number == number) else {
        return reply(
            state,
            chat_id,
            format!("No session numbered {number} is currently active."),
        )
        .await;
    };

    reply(
        state,
        chat_id,
        format!("/cmd {} <command>", session.identifier()),
    )
    .await
}

/// Convenience used by the gateway's 404/unknown-server mapping; kept
/// here so the router and aggregator share one `CoreError` translation.
pub fn is_unknown_server(error: &CoreError) -> bool {
    matches!(error, CoreError::UnknownServer(_))
}
