//! tidegated: the Tidegate daemon.
//!
//! Single binary that assembles every Tidegate subsystem:
//! - Node registry + load balancer
//! - Health checker
//! - Metrics store + alert monitor
//! - Cache / rate limiter with its reconnect supervisor
//! - Autoscaler
//! - Admin API
//!
//! # Usage
//!
//! ```text
//! tidegated run --config tidegate.toml --listen 0.0.0.0:8080
//! tidegated check-config --config tidegate.toml
//! ```

mod services;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tidegate_core::TidegateConfig;

use crate::services::{Services, join_all};

const DEFAULT_FILTER: &str = "info,tidegate=debug";

#[derive(Parser)]
#[command(name = "tidegated", about = "Tidegate resilience daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Path to tidegate.toml. Built-in defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `server.listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Parse and validate a config file, then print the resolved config.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TidegateConfig> {
    let config = match path {
        Some(path) => TidegateConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TidegateConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            listen,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            run(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: TidegateConfig) -> anyhow::Result<()> {
    info!("Tidegate daemon starting");

    let addr = config.server.listen;
    let services = Services::build(config).await?;
    services.connect_cache().await;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // ── Start background tasks ─────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = services.spawn_background(&shutdown_rx);

    // ── Start API server ───────────────────────────────────────

    let router = services.router();
    info!(%addr, "API server listening");

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let served = server.await;

    // A failed server drops the sender, which also stops the loops.
    join_all(tasks).await;

    served.context("API server failed")?;
    info!("Tidegate daemon stopped");
    Ok(())
}
