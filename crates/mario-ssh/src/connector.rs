//! Connector: one accepted local connection joined to one SSH channel.

use std::net::SocketAddr;
use std::time::SystemTime;

use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::tunnel::Work;

/// Work-task-owned bookkeeping for one live connector pair.
///
/// The sockets themselves live inside the forward task; the work task holds
/// this handle so a tunnel teardown can cut the pair without routing
/// through the work queue again.
pub(crate) struct Connector {
    info: ConnectorInfo,
    cancel: CancellationToken,
}

impl Connector {
    /// Launch the forward task for an accepted connection and hand back the
    /// bookkeeping entry.
    pub(crate) fn spawn(
        id: u64,
        local: TcpStream,
        peer: SocketAddr,
        channel: Channel<Msg>,
        works: mpsc::Sender<Work>,
    ) -> Connector {
        let cancel = CancellationToken::new();
        tokio::spawn(forward(id, local, channel, works, cancel.clone()));
        Connector {
            info: ConnectorInfo {
                id,
                opened_at: SystemTime::now(),
                peer,
            },
            cancel,
        }
    }

    pub(crate) fn info(&self) -> ConnectorInfo {
        self.info.clone()
    }

    /// Idempotent: cancels the forward task, which closes both endpoints.
    pub(crate) fn shut_down(&self) {
        self.cancel.cancel();
    }
}

/// Snapshot of a live connector, as returned by
/// [`Tunnel::connectors`](crate::Tunnel::connectors).
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    id: u64,
    opened_at: SystemTime,
    peer: SocketAddr,
}

impl ConnectorInfo {
    /// Tunnel-scoped counter; ids are strictly increasing per tunnel.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wall-clock time the pair was opened.
    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    /// Address of the local client this connector serves.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Copy bytes in both directions until either side ends, then ask the
/// owning tunnel to forget this connector.
///
/// Any I/O error is treated as end-of-stream; connector faults never
/// promote the tunnel to an error state.
async fn forward(
    id: u64,
    mut local: TcpStream,
    channel: Channel<Msg>,
    works: mpsc::Sender<Work>,
    cancel: CancellationToken,
) {
    let mut remote = channel.into_stream();
    tokio::select! {
        _ = cancel.cancelled() => {
            trace!(connector = id, "connector cancelled");
        }
        copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => match copied {
            Ok((to_remote, to_local)) => {
                debug!(connector = id, to_remote, to_local, "connector finished");
            }
            Err(error) => {
                debug!(connector = id, %error, "connector ended");
            }
        },
    }
    // both endpoints drop here; removal goes through the work queue so the
    // work task stays the sole mutator of the connector set
    let _ = works.send(Work::RemoveConnector { id }).await;
}
