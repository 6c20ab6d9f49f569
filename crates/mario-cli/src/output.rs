//! Console output formatting.

use std::time::SystemTime;

use tabled::settings::Style;
use tabled::{Table, Tabled};

use mario_fleet::TunnelView;
use mario_ssh::ConnectorInfo;

pub fn print_info(msg: &str) {
    println!("[info] {msg}");
}

pub fn print_error(msg: &str) {
    eprintln!("[error] {msg}");
}

/// Render the tunnel list as an ASCII table.
pub fn print_tunnels(tunnels: &[TunnelView]) {
    if tunnels.is_empty() {
        println!("no tunnels");
        return;
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "ID")]
        id: u32,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "STATUS")]
        status: &'static str,
        #[tabled(rename = "LINK")]
        link: String,
    }

    let rows: Vec<Row> = tunnels
        .iter()
        .map(|view| Row {
            id: view.id(),
            name: view.name().to_string(),
            status: view.status_str(),
            link: view.represent(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::sharp()));
}

/// Render one tunnel with its live connections.
pub fn print_tunnel_detail(view: &TunnelView, connectors: &[ConnectorInfo]) {
    println!("tunnel <{}> ({})", view.id(), view.name());
    println!("  local:  {}", view.local());
    println!("  server: {}", view.server());
    println!("  remote: {}", view.remote());
    println!("  status: {}", view.status_str());
    if let Some(error) = view.error() {
        println!("  error:  {error}");
    }

    if connectors.is_empty() {
        println!("no live connections");
        return;
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "ID")]
        id: u64,
        #[tabled(rename = "PEER")]
        peer: String,
        #[tabled(rename = "OPENED")]
        opened: String,
    }

    let rows: Vec<Row> = connectors
        .iter()
        .map(|connector| Row {
            id: connector.id(),
            peer: connector.peer().to_string(),
            opened: opened_ago(connector.opened_at()),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::sharp()));
}

fn opened_ago(opened_at: SystemTime) -> String {
    match opened_at.elapsed() {
        Ok(elapsed) => format!("{}s ago", elapsed.as_secs()),
        Err(_) => "just now".to_string(),
    }
}
