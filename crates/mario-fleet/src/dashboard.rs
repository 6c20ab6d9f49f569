//! ID-ordered index of tunnel views plus the status receive loop.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::fleet::{wait_timeout, Act, Fleet, FleetError, APPLY_TIMEOUT};
use crate::view::TunnelView;

const RECV_QUEUE_CAPACITY: usize = 16;

/// Addressing for dashboard operations: one tunnel by id or name, or every
/// registered tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Id(u32),
    Name(String),
    All,
}

impl Target {
    /// Parse a command argument: non-negative integers are ids, `-1` is
    /// the apply-to-all sentinel, anything else is a name.
    pub fn parse(arg: &str) -> Target {
        match arg.parse::<i64>() {
            Ok(-1) => Target::All,
            Ok(id) if (0..=i64::from(u32::MAX)).contains(&id) => Target::Id(id as u32),
            _ => Target::Name(arg.to_string()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Id(id) => write!(f, "{id}"),
            Target::Name(name) => write!(f, "{name}"),
            Target::All => write!(f, "all"),
        }
    }
}

/// Thin, id-sorted index over the fleet's tunnel views, fed by the fleet's
/// status stream.
pub struct Dashboard {
    fleet: Arc<Fleet>,
    tunnels: RwLock<Vec<TunnelView>>,
    recv: mpsc::Sender<TunnelView>,
    recv_rx: Mutex<Option<mpsc::Receiver<TunnelView>>>,
}

impl Dashboard {
    pub fn new(fleet: Arc<Fleet>) -> Arc<Dashboard> {
        let (recv, recv_rx) = mpsc::channel(RECV_QUEUE_CAPACITY);
        Arc::new(Dashboard {
            fleet,
            tunnels: RwLock::new(Vec::new()),
            recv,
            recv_rx: Mutex::new(Some(recv_rx)),
        })
    }

    /// Start consuming the fleet's status stream. May only be called once.
    pub async fn start(self: &Arc<Self>) -> Result<(), FleetError> {
        let mut events = self.fleet.monitor().await?;
        let Some(mut updates) = self.recv_rx.lock().expect("dashboard lock poisoned").take()
        else {
            return Err(FleetError::AlreadyMonitoring);
        };

        // fan fleet events into the receive queue, surfacing errors as
        // they pass through
        let recv = self.recv.clone();
        tokio::spawn(async move {
            while let Some(view) = events.recv().await {
                if let Some(error) = view.error() {
                    if view.status_str() != "closed" {
                        warn!(id = view.id(), name = %view.name(), %error, "tunnel error");
                    }
                }
                if recv.send(view).await.is_err() {
                    break;
                }
            }
        });

        // the single consumer of the receive queue keeps the index fresh
        let dashboard = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(view) = updates.recv().await {
                dashboard.upsert(view);
            }
        });
        Ok(())
    }

    /// Open a new tunnel and feed its view into the receive queue.
    pub async fn new_tunnel(
        &self,
        name: &str,
        local: &str,
        server: &str,
        remote: &str,
        private_key: Option<&Path>,
        no_connect: bool,
    ) -> Result<TunnelView, FleetError> {
        let view = self
            .fleet
            .establish(name, local, server, remote, private_key, no_connect)
            .await?;
        let _ = self.recv.send(view.clone()).await;
        Ok(view)
    }

    /// Look up a view by id (binary search) or name (linear scan, first
    /// match wins). `Target::All` has no single view.
    pub fn get_tunnel(&self, target: &Target) -> Option<TunnelView> {
        let tunnels = self.tunnels.read().expect("dashboard lock poisoned");
        match target {
            Target::Id(id) => tunnels
                .binary_search_by_key(id, TunnelView::id)
                .ok()
                .map(|i| tunnels[i].clone()),
            Target::Name(name) => tunnels.iter().find(|view| view.name() == name).cloned(),
            Target::All => None,
        }
    }

    /// Close one tunnel, or all of them for `Target::All`, waiting up to
    /// the bulk timeout when `wait_done` is set.
    pub async fn close(&self, target: &Target, wait_done: bool) -> Result<(), FleetError> {
        self.apply(target, Act::Close, wait_done).await
    }

    /// Reconnect one tunnel, or all of them for `Target::All`.
    pub async fn up(&self, target: &Target, wait_done: bool) -> Result<(), FleetError> {
        self.apply(target, Act::Reconnect, wait_done).await
    }

    /// Current id-ordered snapshot.
    pub fn tunnels(&self) -> Vec<TunnelView> {
        self.tunnels
            .read()
            .expect("dashboard lock poisoned")
            .clone()
    }

    /// Ask the fleet to stop.
    pub async fn quit(&self) {
        self.fleet.stop().await;
    }

    async fn apply(&self, target: &Target, act: Act, wait_done: bool) -> Result<(), FleetError> {
        if matches!(target, Target::All) {
            self.fleet.apply_all(act, wait_done).await;
            return Ok(());
        }
        let view = self
            .get_tunnel(target)
            .ok_or_else(|| FleetError::NotFound(target.to_string()))?;
        let (done, mut completions) = mpsc::channel(1);
        match act {
            Act::Reconnect => view.up(Some(done)).await,
            _ => view.close(Some(done)).await,
        }
        if wait_done {
            wait_timeout(APPLY_TIMEOUT, &mut completions, 1).await;
        }
        Ok(())
    }

    fn upsert(&self, view: TunnelView) {
        let mut tunnels = self.tunnels.write().expect("dashboard lock poisoned");
        match tunnels.binary_search_by_key(&view.id(), TunnelView::id) {
            // a status update for a known tunnel
            Ok(i) => tunnels[i] = view,
            // new tunnel; keep the vector id-sorted
            Err(i) => tunnels.insert(i, view),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parses_ids_names_and_the_all_sentinel() {
        assert_eq!(Target::parse("7"), Target::Id(7));
        assert_eq!(Target::parse("0"), Target::Id(0));
        assert_eq!(Target::parse("-1"), Target::All);
        assert_eq!(Target::parse("etcd"), Target::Name("etcd".to_string()));
        assert_eq!(Target::parse("-2"), Target::Name("-2".to_string()));
    }

    #[test]
    fn target_displays_for_error_messages() {
        assert_eq!(Target::Id(3).to_string(), "3");
        assert_eq!(Target::Name("db".to_string()).to_string(), "db");
        assert_eq!(Target::All.to_string(), "all");
    }
}
