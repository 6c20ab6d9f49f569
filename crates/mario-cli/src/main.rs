//! mario: a long-running agent managing a fleet of SSH port-forwarding
//! tunnels, driven by an interactive console.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mario_core::config;
use mario_fleet::{Dashboard, Fleet};
use mario_ssh::MIN_HEALTH_CHECK_INTERVAL;

mod output;
mod repl;

#[derive(Parser)]
#[command(name = "mario")]
#[command(version)]
#[command(about = "mario handles pipes (ssh tunnels) for you")]
#[command(long_about = "Manage ssh tunnels: establishing, closing, health check, reconnect...")]
struct Cli {
    /// Config file with tunnels to open on startup
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SSH private key file path, default <home>/.ssh/id_rsa
    #[arg(long)]
    pk: Option<PathBuf>,

    /// Health-check interval of a tunnel, in seconds
    #[arg(long = "i", default_value_t = 15)]
    interval: u64,

    /// Log debug info
    #[arg(short = 'v', long = "debug")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let interval = Duration::from_secs(cli.interval).max(MIN_HEALTH_CHECK_INTERVAL);
    let fleet = Fleet::new(cli.pk.clone(), interval);
    let dashboard = Dashboard::new(fleet);
    dashboard
        .start()
        .await
        .context("failed to start monitoring")?;

    if let Some(path) = &cli.config {
        let loaded = config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        for entry in &loaded.tunnels {
            let pk = entry
                .private_key
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(Path::new);
            if let Err(error) = dashboard
                .new_tunnel(
                    &entry.name,
                    &entry.local,
                    &entry.ssh_server,
                    &entry.map_to,
                    pk,
                    entry.do_not_connect,
                )
                .await
            {
                tracing::error!(name = %entry.name, %error, "failed to establish tunnel from config");
            }
        }
    }

    repl::run(&dashboard, interval).await;
    Ok(())
}
