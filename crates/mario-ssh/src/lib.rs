//! SSH tunnel supervision.
//!
//! A [`Tunnel`] couples one local TCP listener with one SSH session and a
//! set of live [`connector`][ConnectorInfo] pairs. All tunnel state is
//! mutated by a single per-tunnel work task; external callers enqueue work
//! and observe status through a lock-guarded snapshot. See [`Tunnel`] for
//! the lifecycle operations.

mod connector;
mod status;
mod tunnel;

pub use connector::ConnectorInfo;
pub use status::TunnelStatus;
pub use tunnel::{Done, StatusSink, Tunnel, TunnelError, MIN_HEALTH_CHECK_INTERVAL};
