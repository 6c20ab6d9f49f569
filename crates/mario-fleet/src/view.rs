//! Read-mostly views over registered tunnels.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use mario_ssh::{ConnectorInfo, Done, Tunnel, TunnelError, TunnelStatus};

use crate::fleet::Fleet;

/// The wrapper the fleet hands out for a registered tunnel: an immutable
/// id/name/key-path triple plus handles back to the tunnel and its fleet.
///
/// Views are cheap to clone and safe to hold after the tunnel is removed;
/// operations on a removed tunnel are no-ops.
#[derive(Clone)]
pub struct TunnelView {
    inner: Arc<Inner>,
}

struct Inner {
    id: u32,
    name: String,
    private_key: Option<PathBuf>,
    tunnel: Arc<Tunnel>,
    fleet: Weak<Fleet>,
}

impl TunnelView {
    pub(crate) fn new(
        id: u32,
        name: String,
        private_key: Option<PathBuf>,
        tunnel: Arc<Tunnel>,
        fleet: Weak<Fleet>,
    ) -> TunnelView {
        TunnelView {
            inner: Arc::new(Inner {
                id,
                name,
                private_key,
                tunnel,
                fleet,
            }),
        }
    }

    /// Fleet-minted id; strictly increasing, never reused.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// User-supplied name, defaulting to the decimal id.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Per-tunnel private key path, if one was supplied.
    pub fn private_key_path(&self) -> Option<&Path> {
        self.inner.private_key.as_deref()
    }

    /// Local listening address.
    pub fn local(&self) -> String {
        self.inner.tunnel.local().to_string()
    }

    /// SSH server address as `user@host:port`.
    pub fn server(&self) -> String {
        self.inner.tunnel.server()
    }

    /// Remote endpoint as `host:port`.
    pub fn remote(&self) -> String {
        self.inner.tunnel.remote()
    }

    /// `local -> server -> remote` rendering used in listings.
    pub fn represent(&self) -> String {
        self.inner.tunnel.to_string()
    }

    /// Raw status bitmask.
    pub fn status(&self) -> TunnelStatus {
        self.inner.tunnel.status()
    }

    /// Human-readable status. An error overrides the primary state.
    pub fn status_str(&self) -> &'static str {
        if self.error().is_some() {
            return "error";
        }
        self.inner.tunnel.status().name()
    }

    /// The tunnel's last error, present iff its error bit is set.
    pub fn error(&self) -> Option<Arc<TunnelError>> {
        self.inner.tunnel.error()
    }

    /// Snapshot the tunnel's live connectors.
    pub async fn connectors(&self) -> Vec<ConnectorInfo> {
        self.inner.tunnel.connectors().await
    }

    /// Close the tunnel through the fleet dispatcher.
    pub async fn close(&self, done: Option<Done>) {
        if let Some(fleet) = self.inner.fleet.upgrade() {
            fleet.close(self, done).await;
        }
    }

    /// Reconnect the tunnel through the fleet dispatcher.
    pub async fn up(&self, done: Option<Done>) {
        if let Some(fleet) = self.inner.fleet.upgrade() {
            fleet.up(self, done).await;
        }
    }

    pub(crate) fn tunnel(&self) -> &Arc<Tunnel> {
        &self.inner.tunnel
    }
}

impl fmt::Debug for TunnelView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelView")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status_str())
            .finish()
    }
}
