//! Configuration error taxonomy.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while validating descriptors or loading configuration.
///
/// These are reported synchronously from construction paths; no tunnel
/// state exists when one of them is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Local listening address is not `host:port` with a numeric port
    #[error("invalid local listening address: {0}")]
    InvalidLocalAddr(String),

    /// SSH server address is missing the `user@` part
    #[error("user not specified in ssh server address: {0}")]
    MissingUser(String),

    /// Remote target is missing its port
    #[error("remote port not specified: {0}")]
    MissingRemotePort(String),

    /// Malformed link shortcut
    #[error("invalid link: {0}")]
    InvalidLink(String),

    /// A file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file could not be written
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
