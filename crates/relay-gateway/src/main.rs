use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_agent::functions::FunctionRegistry;
use relay_agent::openai::OpenAiProvider;
use relay_agent::retry::RetryingProvider;
use relay_agent::tokens::default_counter;
use relay_agent::transform::ContentPipeline;
use relay_agent::{LlmProvider, Relay, RelaySettings};
use relay_core::config::RelayConfig;
use relay_gateway::app;
use relay_slack::{EventRouter, SlackClient, ThreadRoots};
use tracing::{info, warn};

/// How long in-flight sessions get to settle their replies after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "relay-gateway", version, about = "Slack to LLM streaming relay")]
struct Cli {
    /// Path to the TOML config file (default: ~/.relay/relay.toml).
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<String>,

    /// Override gateway.bind.
    #[arg(long)]
    bind: Option<String>,

    /// Override gateway.port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_gateway=info,relay_agent=info,relay_slack=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let mut config =
        RelayConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if config.slack.verify_signatures && config.slack.signing_secret.is_none() {
        anyhow::bail!("slack.signing_secret is required unless slack.verify_signatures = false");
    }

    let slack = Arc::new(SlackClient::new(&config.slack)?);
    let bot_user_id = match config.slack.bot_user_id.clone() {
        Some(id) => id,
        None => {
            let auth = slack
                .auth_test()
                .await
                .context("auth.test failed; check slack.bot_token")?;
            info!(user_id = %auth.user_id, bot_id = ?auth.bot_id, "resolved bot identity");
            auth.user_id
        }
    };

    let settings = RelaySettings::from_config(&config, &bot_user_id)?;
    let pipeline = ContentPipeline::from_config(&config)?;
    let functions = FunctionRegistry::from_module(config.functions.module.as_deref())?;
    let provider: Arc<dyn LlmProvider> = Arc::new(RetryingProvider::new(
        Box::new(OpenAiProvider::new(&config.openai)?),
        config.retry.clone(),
    ));

    let relay = Arc::new(Relay::new(
        slack.clone(),
        provider,
        default_counter(),
        pipeline,
        functions,
        &bot_user_id,
        settings,
    ));
    let roots: Arc<dyn ThreadRoots> = slack;
    let router = EventRouter::new(roots, bot_user_id);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
        .parse()
        .context("invalid gateway bind address")?;
    let state = Arc::new(app::AppState::new(config, Arc::clone(&relay), router));
    let app = app::build_router(state);

    info!(%addr, "relay gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&relay)))
        .await?;

    drain(&relay).await;
    info!("relay gateway stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM, after cancelling every active session.
async fn shutdown_signal(relay: Arc<Relay>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    let cancelled = relay.shutdown();
    info!(sessions = cancelled, "shutdown requested");
}

/// Give cancelled sessions a moment to write their final edit.
async fn drain(relay: &Relay) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while relay.active_sessions() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                sessions = relay.active_sessions(),
                "sessions still active at exit"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
