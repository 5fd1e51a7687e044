use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use relay_channels::{ChatChannel, TelegramChannel, TelegramConfig};
use relay_core::{DeadLetterQueue, Server, ServerRegistry, ServerType, SessionRegistry};
use relay_resilience::CircuitBreaker;
use relay_ssh::CommandExecutor;

use relay_hub::config::{load_config, ServerEntryConfig};
use relay_hub::recovery::RecoveryManager;
use relay_hub::state::AppState;
use relay_hub::{aggregator, gateway, recovery};

#[derive(Parser)]
#[command(name = "relay-hub")]
#[command(about = "Reliability and routing core for a distributed remote-execution hub")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "relay-hub.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: webhook/notify listener plus background workers.
    Serve,
    /// Validate configuration and storage, report readiness.
    Doctor,
    /// Inspect session state.
    Sessions {
        #[command(subcommand)]
        cmd: SessionsCommands,
    },
}

#[derive(Subcommand)]
enum SessionsCommands {
    /// List all active sessions.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "relay-hub exited with error");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config).context("loading configuration")?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Doctor => doctor(config).await,
        Commands::Sessions { cmd } => sessions_command(config, cmd).await,
    }
}

fn build_servers(entries: &[ServerEntryConfig]) -> ServerRegistry {
    let servers = entries
        .iter()
        .map(|e| Server {
            id: e.id.clone(),
            server_type: match e.kind {
                relay_hub::config::ServerKind::Local => ServerType::Local,
                relay_hub::config::ServerKind::Remote => ServerType::Remote,
            },
            hostname: e.hostname.clone(),
            ssh_user: e.ssh_user.clone(),
            ssh_port: Some(e.ssh_port),
            ssh_key_path: e.ssh_key_path.clone(),
            status: "unknown".to_string(),
            last_seen: None,
        })
        .collect();
    ServerRegistry::new(servers)
}

async fn build_state(config: relay_hub::config::Config) -> Result<Arc<AppState>> {
    let sessions = Arc::new(
        SessionRegistry::open(config.storage.sessions_db_path())
            .context("opening session registry")?,
    );

    let dlq_max_attempts = config.retry.dlq_max_attempts.unwrap_or(relay_core::MAX_ATTEMPTS);
    let dlq_retry_intervals_secs = config
        .retry
        .dlq_retry_intervals_secs
        .clone()
        .unwrap_or_else(|| relay_core::RETRY_INTERVALS_SECS.to_vec());
    let dlq = Arc::new(
        DeadLetterQueue::open_with_policy(
            config.storage.dlq_db_path(),
            dlq_max_attempts,
            dlq_retry_intervals_secs,
        )
        .context("opening dlq")?,
    );

    let servers = Arc::new(build_servers(&config.servers));
    let breaker = CircuitBreaker::new(
        config.retry.breaker_failure_threshold.unwrap_or(5),
        config.retry.breaker_success_threshold.unwrap_or(2),
        Duration::from_secs(config.retry.breaker_timeout_secs.unwrap_or(30)),
    );
    let executor = Arc::new(CommandExecutor::new(servers.clone(), breaker));

    let chat: Arc<dyn ChatChannel> = Arc::new(TelegramChannel::new(TelegramConfig {
        token: config.chat.telegram_token.clone(),
        chat_id: config.chat.chat_id.clone(),
        allow_from: config.chat.allow_from.clone(),
    }));

    Ok(Arc::new(AppState {
        config,
        sessions,
        servers,
        dlq,
        executor,
        chat,
    }))
}

async fn serve(config: relay_hub::config::Config) -> Result<()> {
    let notify_port = config.gateway.notify_port;
    let webhook_port = config.gateway.webhook_port;
    let state = build_state(config).await?;
    let notify_router = gateway::build_notify_router(state.clone());
    let webhook_router = gateway::build_webhook_router(state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let retry_loop = tokio::spawn(aggregator::run_retry_loop(state.clone(), shutdown_rx.clone()));
    let recovery_manager = Arc::new(RecoveryManager::new(state.clone()));
    let recovery_loop =
        tokio::spawn(recovery::run_recovery_loop(recovery_manager, shutdown_rx.clone()));

    let notify_listener = tokio::net::TcpListener::bind(("0.0.0.0", notify_port))
        .await
        .with_context(|| format!("binding notify listener on port {notify_port}"))?;
    let webhook_listener = tokio::net::TcpListener::bind(("0.0.0.0", webhook_port))
        .await
        .with_context(|| format!("binding webhook listener on port {webhook_port}"))?;
    info!(notify_port, webhook_port, "relay hub listening");

    let notify_shutdown = shutdown_rx.clone();
    let notify_server = axum::serve(notify_listener, notify_router)
        .with_graceful_shutdown(wait_for_shutdown(notify_shutdown));
    let webhook_server = axum::serve(webhook_listener, webhook_router)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let (notify_result, webhook_result) = tokio::join!(notify_server, webhook_server);
    if let Err(e) = notify_result {
        error!(error = %e, "notify server error");
    }
    if let Err(e) = webhook_result {
        error!(error = %e, "webhook server error");
    }

    info!("shutting down background workers");
    let _ = retry_loop.await;
    let _ = recovery_loop.await;

    state.executor.shutdown().await;
    state.sessions.close().context("checkpointing session registry")?;
    info!("relay hub stopped");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.changed().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

async fn doctor(config: relay_hub::config::Config) -> Result<()> {
    println!("Checking configuration...");
    println!("  gateway.notify_port  = {}", config.gateway.notify_port);
    println!("  gateway.webhook_port = {}", config.gateway.webhook_port);
    println!("  servers configured   = {}", config.servers.len());

    println!("Opening session registry...");
    let sessions = SessionRegistry::open(config.storage.sessions_db_path())?;
    let count = sessions.get_all_sessions()?.len();
    println!("  active sessions      = {count}");

    println!("Opening dead-letter queue...");
    let dlq = DeadLetterQueue::open_with_policy(
        config.storage.dlq_db_path(),
        config.retry.dlq_max_attempts.unwrap_or(relay_core::MAX_ATTEMPTS),
        config
            .retry
            .dlq_retry_intervals_secs
            .clone()
            .unwrap_or_else(|| relay_core::RETRY_INTERVALS_SECS.to_vec()),
    )?;
    let stats = dlq.stats()?;
    println!("  pending messages     = {}", stats.pending);
    println!("  archived messages    = {}", stats.archived);

    println!("relay-hub: ready");
    Ok(())
}

async fn sessions_command(config: relay_hub::config::Config, cmd: SessionsCommands) -> Result<()> {
    let sessions = SessionRegistry::open(config.storage.sessions_db_path())?;
    match cmd {
        SessionsCommands::List => {
            for session in sessions.get_all_sessions()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    session.identifier(),
                    session.project,
                    session.tmux_session,
                    session.expires_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}
