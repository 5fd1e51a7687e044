use std::sync::Arc;

use relay_channels::ChatChannel;
use relay_core::{DeadLetterQueue, ServerRegistry, SessionRegistry};
use relay_ssh::CommandExecutor;

use crate::config::Config;

/// Shared application state, handed to every handler and background
/// worker as an `Arc<AppState>` (spec §9 "package as explicit instances
/// owned by the aggregator and command-router components").
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionRegistry>,
    pub servers: Arc<ServerRegistry>,
    pub dlq: Arc<DeadLetterQueue>,
    pub executor: Arc<CommandExecutor>,
    pub chat: Arc<dyn ChatChannel>,
}
