//! Shared foundation for the mario workspace: the persisted tunnel
//! configuration model, address and link parsing, and the configuration
//! error taxonomy.

pub mod config;
pub mod error;

pub use config::{Link, TunnelEntry, TunnelsConfig};
pub use error::ConfigError;
