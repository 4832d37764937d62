use std::path::PathBuf;

use clap::Parser;
use eyre::{Context, Result};

use anthropic_proxy::config::ProxyConfig;
use anthropic_proxy::http::router;
use anthropic_proxy::proxy::ProxyState;

/// Rate-limited, multi-tenant admission-control proxy in front of the
/// Anthropic Messages API.
#[derive(Parser, Debug)]
#[command(name = "anthropic-proxy", version, about)]
struct Cli {
    /// Path to a YAML config file. Falls back to
    /// ~/.config/anthropic-proxy/config.yml, then ./anthropic-proxy.yml, then defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP server to, overriding config and BIND_ADDR.
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level, overriding config and RUST_LOG/LOG_LEVEL.
    #[arg(short, long)]
    log_level: Option<String>,
}

fn setup_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::load(cli.config.as_ref()).context("failed to load configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(log_level) = &cli.log_level {
        config.log_level = log_level.clone();
    }

    setup_logging(&config.log_level);

    tracing::info!(bind_addr = %config.bind_addr, "starting anthropic-proxy");

    let state = ProxyState::new(config.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
