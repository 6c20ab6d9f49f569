//! The interactive command loop.
//!
//! Each input line is split on whitespace and parsed with clap, so the
//! console commands get the same flag handling, help text and error
//! reporting as the binary itself.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use mario_core::config::{self, Link, TunnelEntry, TunnelsConfig};
use mario_fleet::{Dashboard, Target};

use crate::output;

#[derive(Parser)]
#[command(name = "", no_binary_name = true, disable_version_flag = true)]
#[command(about = "manage tunnels: open, close, reconnect and save")]
struct Console {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Establish a tunnel
    Open {
        /// Composed descriptor: local:port:remote_host:remote_port@user@host:port
        #[arg(short, long)]
        link: Option<String>,

        /// Local listening address
        #[arg(long, default_value = ":8080")]
        local: String,

        /// SSH server address, e.g. user@host.com:22
        #[arg(short, long)]
        server: Option<String>,

        /// Remote endpoint of the tunnel, e.g. 192.168.1.2:1080
        #[arg(short, long)]
        remote: Option<String>,

        /// Tunnel name
        #[arg(short, long)]
        name: Option<String>,

        /// Private key path; the global key is used when absent
        #[arg(short, long)]
        key: Option<PathBuf>,
    },

    /// Close tunnels by id (-1 for all) or name
    #[command(allow_negative_numbers = true)]
    Close {
        ids: Vec<i64>,

        /// Tunnel name, used when no id is given
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Reconnect tunnels by id (-1 for all) or name
    #[command(allow_negative_numbers = true)]
    Up {
        ids: Vec<i64>,

        /// Tunnel name, used when no id is given
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List tunnels
    List,

    /// Show one tunnel and its live connections
    View { id: Option<u32> },

    /// Save the tunnel configuration as JSON
    Save {
        /// Output path, default <home>/tunnels.json
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Quit mario
    Exit,
}

/// Read command lines from stdin until `exit`, end of input or Ctrl-C,
/// then stop the fleet.
pub async fn run(dashboard: &Arc<Dashboard>, interval: Duration) {
    output::print_info("type 'help' for the command list");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let command = match Console::try_parse_from(&words) {
            Ok(console) => console.command,
            Err(error) => {
                // clap renders its own usage/help output
                let _ = error.print();
                continue;
            }
        };
        if execute(dashboard, interval, command).await {
            break;
        }
    }
    dashboard.quit().await;
    output::print_info("bye");
}

fn prompt() {
    print!("mario> ");
    let _ = std::io::stdout().flush();
}

/// Run one console command; returns true when the loop should exit.
async fn execute(dashboard: &Arc<Dashboard>, interval: Duration, command: Command) -> bool {
    match command {
        Command::Open {
            link,
            local,
            server,
            remote,
            name,
            key,
        } => open(dashboard, link, local, server, remote, name, key).await,
        Command::Close { ids, name } => apply(dashboard, ids, name, true).await,
        Command::Up { ids, name } => apply(dashboard, ids, name, false).await,
        Command::List => output::print_tunnels(&dashboard.tunnels()),
        Command::View { id } => view(dashboard, id).await,
        Command::Save { output } => save(dashboard, interval, output),
        Command::Exit => return true,
    }
    false
}

async fn open(
    dashboard: &Arc<Dashboard>,
    link: Option<String>,
    local: String,
    server: Option<String>,
    remote: Option<String>,
    name: Option<String>,
    key: Option<PathBuf>,
) {
    let (local, server, remote) = if let Some(link) = link {
        match link.parse::<Link>() {
            Ok(link) => (link.local, link.server, link.remote),
            Err(error) => {
                output::print_error(&error.to_string());
                return;
            }
        }
    } else {
        match (server, remote) {
            (Some(server), Some(remote)) => (local, server, remote),
            _ => {
                output::print_error("specify server with -s and remote with -r");
                return;
            }
        }
    };

    match dashboard
        .new_tunnel(
            name.as_deref().unwrap_or(""),
            &local,
            &server,
            &remote,
            key.as_deref(),
            false,
        )
        .await
    {
        Ok(view) => output::print_info(&format!(
            "tunnel <{}> ({}) opening: {}",
            view.id(),
            view.name(),
            view.represent()
        )),
        Err(error) => output::print_error(&format!("open tunnel failed: {error}")),
    }
}

/// Close or reconnect every addressed tunnel.
async fn apply(dashboard: &Arc<Dashboard>, ids: Vec<i64>, name: Option<String>, close: bool) {
    let mut targets: Vec<Target> = ids
        .iter()
        .map(|id| Target::parse(&id.to_string()))
        .collect();
    if let Some(name) = name {
        targets.push(Target::Name(name));
    }
    if targets.is_empty() {
        output::print_error("specify tunnel id or tunnel name");
        return;
    }
    for target in targets {
        let applied = if close {
            dashboard.close(&target, true).await
        } else {
            dashboard.up(&target, true).await
        };
        let verb = if close { "close" } else { "up" };
        match applied {
            Ok(()) => output::print_info(&format!("{verb} tunnel {target}")),
            Err(error) => output::print_error(&format!("{verb} tunnel {target}: {error}")),
        }
    }
}

async fn view(dashboard: &Arc<Dashboard>, id: Option<u32>) {
    let Some(id) = id else {
        output::print_tunnels(&dashboard.tunnels());
        return;
    };
    match dashboard.get_tunnel(&Target::Id(id)) {
        Some(view) => {
            let connectors = view.connectors().await;
            output::print_tunnel_detail(&view, &connectors);
        }
        None => output::print_error(&format!("tunnel {id} not found")),
    }
}

fn save(dashboard: &Arc<Dashboard>, interval: Duration, output_path: Option<PathBuf>) {
    let tunnels = dashboard
        .tunnels()
        .iter()
        .map(|view| TunnelEntry {
            name: view.name().to_string(),
            local: view.local(),
            ssh_server: view.server(),
            map_to: view.remote(),
            private_key: view.private_key_path().map(|p| p.display().to_string()),
            do_not_connect: false,
        })
        .collect();
    let saved = TunnelsConfig {
        tunnel_timeout: Some(interval.as_secs()),
        tunnels,
    };
    let path = output_path.unwrap_or_else(config::default_save_path);
    match config::save(&path, &saved) {
        Ok(()) => output::print_info(&format!("tunnels have been saved to {}", path.display())),
        Err(error) => output::print_error(&format!("save failed: {error}")),
    }
}
