//! Persisted tunnel configuration and address parsing.
//!
//! The on-disk format is JSON: a `tunnel_timeout` in seconds shared by every
//! tunnel plus one entry per tunnel. [`Link`] parses the composed
//! `local:port:remote:port@user@host:port` shortcut accepted by the `open`
//! command.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// On-disk configuration: tunnel descriptors plus the shared health-check
/// interval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelsConfig {
    /// Health-check interval for every tunnel, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_timeout: Option<u64>,

    /// Tunnel descriptors
    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
}

/// One persisted tunnel descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEntry {
    pub name: String,

    /// Local listening address, `host:port`
    pub local: String,

    /// SSH server address, `user@host:port`
    pub ssh_server: String,

    /// Remote endpoint the local port maps to, `host:port`
    pub map_to: String,

    /// Per-tunnel private key path; the global key is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Register the tunnel without connecting it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub do_not_connect: bool,
}

/// Load a [`TunnelsConfig`] from a JSON file.
pub fn load(path: &Path) -> Result<TunnelsConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Write a [`TunnelsConfig`] to `path` as pretty-printed JSON.
pub fn save(path: &Path, config: &TunnelsConfig) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Default path tunnels are saved to: `<home>/tunnels.json`.
pub fn default_save_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnels.json")
}

/// Default global private key path: `<home>/.ssh/id_rsa`.
pub fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("id_rsa")
}

/// A parsed tunnel-shortcut string.
///
/// The form is `<local_host>:<local_port>:<remote_host>:<remote_port>@<user>@<ssh_host>:<ssh_port>`,
/// e.g. `0.0.0.0:8080:192.168.1.2:8080@deploy@gateway.example.com:22`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Local listening address, `host:port`
    pub local: String,
    /// SSH server address, `user@host:port`
    pub server: String,
    /// Remote endpoint, `host:port`
    pub remote: String,
}

impl FromStr for Link {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // the mapping part cannot contain '@', so the first one is the
        // mapping/server boundary
        let (mapping, server) = s
            .split_once('@')
            .ok_or_else(|| ConfigError::InvalidLink(s.to_string()))?;

        let fields: Vec<&str> = mapping.splitn(3, ':').collect();
        if fields.len() != 3 || server.is_empty() {
            return Err(ConfigError::InvalidLink(s.to_string()));
        }
        if fields[1].parse::<u16>().is_err() {
            return Err(ConfigError::InvalidLink(s.to_string()));
        }

        Ok(Link {
            local: format!("{}:{}", fields[0], fields[1]),
            server: server.to_string(),
            remote: fields[2].to_string(),
        })
    }
}

/// Split `host:port`, requiring a numeric port. Returns `None` when either
/// piece is missing or the port does not parse.
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Split `user@host[:port]`, defaulting the SSH port to 22.
pub fn split_server_addr(server: &str) -> Result<(String, String), ConfigError> {
    let (user, host) = server
        .split_once('@')
        .ok_or_else(|| ConfigError::MissingUser(server.to_string()))?;
    if user.is_empty() || host.is_empty() {
        return Err(ConfigError::MissingUser(server.to_string()));
    }
    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:22")
    };
    Ok((user.to_string(), addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_parses_full_form() {
        let link: Link = "0.0.0.0:8080:192.168.1.2:9090@deploy@gateway.example.com:2222"
            .parse()
            .unwrap();
        assert_eq!(link.local, "0.0.0.0:8080");
        assert_eq!(link.server, "deploy@gateway.example.com:2222");
        assert_eq!(link.remote, "192.168.1.2:9090");
    }

    #[test]
    fn link_rejects_missing_server() {
        let err = "0.0.0.0:8080:192.168.1.2:9090".parse::<Link>();
        assert!(matches!(err, Err(ConfigError::InvalidLink(_))));
    }

    #[test]
    fn link_rejects_short_mapping() {
        let err = "8080:192.168.1.2@user@host:22".parse::<Link>();
        assert!(matches!(err, Err(ConfigError::InvalidLink(_))));
    }

    #[test]
    fn link_rejects_non_numeric_port() {
        let err = "0.0.0.0:http:192.168.1.2:9090@user@host:22".parse::<Link>();
        assert!(matches!(err, Err(ConfigError::InvalidLink(_))));
    }

    #[test]
    fn split_host_port_accepts_empty_host() {
        assert_eq!(split_host_port(":8080"), Some((String::new(), 8080)));
        assert_eq!(
            split_host_port("127.0.0.1:12379"),
            Some(("127.0.0.1".to_string(), 12379))
        );
        assert_eq!(split_host_port("nocolon"), None);
        assert_eq!(split_host_port("host:notaport"), None);
    }

    #[test]
    fn split_server_addr_defaults_port() {
        let (user, addr) = split_server_addr("deploy@gateway").unwrap();
        assert_eq!(user, "deploy");
        assert_eq!(addr, "gateway:22");

        let (user, addr) = split_server_addr("deploy@gateway:2222").unwrap();
        assert_eq!(user, "deploy");
        assert_eq!(addr, "gateway:2222");
    }

    #[test]
    fn split_server_addr_requires_user() {
        assert!(matches!(
            split_server_addr("gateway:22"),
            Err(ConfigError::MissingUser(_))
        ));
        assert!(matches!(
            split_server_addr("@gateway:22"),
            Err(ConfigError::MissingUser(_))
        ));
    }

    #[test]
    fn config_json_field_names() {
        let cfg = TunnelsConfig {
            tunnel_timeout: Some(30),
            tunnels: vec![TunnelEntry {
                name: "etcd".to_string(),
                local: "127.0.0.1:12379".to_string(),
                ssh_server: "core@gateway:22".to_string(),
                map_to: "127.0.0.1:2379".to_string(),
                private_key: None,
                do_not_connect: false,
            }],
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"tunnel_timeout\":30"));
        assert!(json.contains("\"ssh_server\""));
        assert!(json.contains("\"map_to\""));
        // optional fields are omitted when unset
        assert!(!json.contains("private_key"));
        assert!(!json.contains("do_not_connect"));
    }

    #[test]
    fn config_round_trips_through_file() {
        let cfg = TunnelsConfig {
            tunnel_timeout: Some(15),
            tunnels: vec![
                TunnelEntry {
                    name: "one".to_string(),
                    local: ":8080".to_string(),
                    ssh_server: "a@b:22".to_string(),
                    map_to: "c:80".to_string(),
                    private_key: Some("/tmp/key".to_string()),
                    do_not_connect: true,
                },
                TunnelEntry {
                    name: "two".to_string(),
                    local: ":8081".to_string(),
                    ssh_server: "a@b:22".to_string(),
                    map_to: "c:81".to_string(),
                    private_key: None,
                    do_not_connect: false,
                },
            ],
        };
        let path = std::env::temp_dir().join(format!("mario-config-{}.json", std::process::id()));
        save(&path, &cfg).unwrap();
        let loaded = load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn config_load_tolerates_minimal_json() {
        let cfg: TunnelsConfig = serde_json::from_str(r#"{"tunnels": []}"#).unwrap();
        assert_eq!(cfg.tunnel_timeout, None);
        assert!(cfg.tunnels.is_empty());
    }
}
