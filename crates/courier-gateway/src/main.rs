use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, reload, EnvFilter};

use courier_agent::ToolRegistry;
use courier_channels::ChannelAdapter;
use courier_core::config::{CourierConfig, HEARTBEAT_INTERVAL_SECS};
use courier_store::SqlitePersister;
use courier_telegram::TelegramAdapter;

mod builtin;
mod commands;
mod http;
mod orchestrator;
mod ratelimit;
mod watcher;

use orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "courier-gateway", about = "Conversational AI gateway daemon")]
struct Args {
    /// Path to courier.toml (default: ~/.courier/courier.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = CourierConfig::resolve_path(args.config.as_deref());
    let config =
        CourierConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    // Log filter behind a reload handle so hot reload can adjust it.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.gateway.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let persister = match SqlitePersister::open(&config.database.path) {
        Ok(p) => Some(Arc::new(p)),
        Err(e) => {
            warn!(path = %config.database.path, error = %e,
                "failed to open durable store — running without persistence");
            None
        }
    };

    let registry = Arc::new(ToolRegistry::new());
    builtin::register_builtin_tools(&registry);

    let orch = Orchestrator::new(config.clone(), persister, Arc::clone(&registry));
    orch.install_agent_from_config(&config.agent).await;
    orch.subagents().mark_orphans();

    if let Some(tg) = &config.channels.telegram {
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(TelegramAdapter::new(tg));
        orch.register_adapter(adapter).await;
    }
    orch.start_adapters().await;

    let log_reload: watcher::LogReloadFn = Arc::new(move |level: &str| {
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if let Err(e) = reload_handle.reload(filter) {
                    warn!(error = %e, "failed to apply new log filter");
                }
            }
            Err(e) => warn!(level, error = %e, "invalid log filter directive"),
        }
    });
    let _watcher = watcher::spawn_config_watcher(
        config_path,
        Arc::clone(&orch),
        Some(log_reload),
        orch.root_token().child_token(),
    );

    spawn_heartbeat(Arc::clone(&orch));

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind HTTP listener")?;
    info!(%addr, "courier gateway listening");

    let shutdown_orch = Arc::clone(&orch);
    axum::serve(listener, http::build_router(Arc::clone(&orch)))
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            shutdown_orch.shutdown().await;
        })
        .await
        .context("HTTP server error")?;

    info!("courier gateway exited");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler, waiting on SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}

/// Periodic liveness log while the gateway runs.
fn spawn_heartbeat(orch: Arc<Orchestrator>) {
    let cancel = orch.root_token().child_token();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    tracing::debug!(
                        uptime_seconds = orch.uptime().as_secs(),
                        in_flight = orch.in_flight(),
                        sessions = orch.store().count(),
                        "heartbeat"
                    );
                }
            }
        }
    });
}
