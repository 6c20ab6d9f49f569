//! Fleet orchestration over mario tunnels.
//!
//! The [`Fleet`] is the one-per-process registry: it mints tunnel ids,
//! caches the global private key, dispatches open/close/reconnect actions,
//! and fans per-tunnel status changes into a single broadcast stream. The
//! [`Dashboard`] keeps an id-ordered index of [`TunnelView`]s on top of
//! that stream for lookup and bulk operations.

mod dashboard;
mod fleet;
mod view;

pub use dashboard::{Dashboard, Target};
pub use fleet::{Act, Fleet, FleetError};
pub use view::TunnelView;
