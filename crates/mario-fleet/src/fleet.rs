//! The process-wide tunnel registry and its dispatcher task.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mario_core::config::default_key_path;
use mario_ssh::{Done, Tunnel, TunnelError, TunnelStatus};

use crate::view::TunnelView;

/// How long bulk operations wait for per-tunnel completions.
pub(crate) const APPLY_TIMEOUT: Duration = Duration::from_secs(2);

const ACTION_QUEUE_CAPACITY: usize = 16;
const STATUS_QUEUE_CAPACITY: usize = 16;

/// Cross-tunnel actions handled by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Act {
    /// Register a pre-built view if absent. [`Fleet::establish`] already
    /// registers, so this only matters for tunnels injected out-of-band.
    Open,
    Close,
    Reconnect,
}

struct Action {
    act: Act,
    view: TunnelView,
    done: Option<Done>,
}

/// Errors raised by fleet operations.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The status stream has already been handed out
    #[error("monitoring may only be started once")]
    AlreadyMonitoring,

    /// A private key file could not be read
    #[error("failed to read private key {path}: {source}")]
    Key {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No registered tunnel matches the requested id or name
    #[error("no tunnel with id or name {0}")]
    NotFound(String),

    /// Descriptor validation or key parsing failed
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// One owner per process: mints tunnel ids, stores per-tunnel names and
/// key paths, holds the lazily loaded global key, and hosts the action
/// dispatcher plus the single status-broadcast stream.
///
/// A fleet is single-use: after [`stop`](Fleet::stop) it cannot be
/// restarted.
pub struct Fleet {
    check_alive_interval: Duration,
    key_path: PathBuf,
    global_key: OnceCell<Vec<u8>>,
    next_id: AtomicU32,
    actions: mpsc::Sender<Action>,
    actions_rx: Mutex<Option<mpsc::Receiver<Action>>>,
    status_in: mpsc::Sender<Arc<Tunnel>>,
    status_in_rx: Mutex<Option<mpsc::Receiver<Arc<Tunnel>>>>,
    status_out: mpsc::Sender<TunnelView>,
    status_out_rx: Mutex<Option<mpsc::Receiver<TunnelView>>>,
    views: DashMap<u64, TunnelView>,
    stop: CancellationToken,
}

impl Fleet {
    /// Create a fleet. `key_path` is the global private key used by
    /// tunnels without one of their own (default `<home>/.ssh/id_rsa`);
    /// `heartbeat` is the shared health-check interval.
    pub fn new(key_path: Option<PathBuf>, heartbeat: Duration) -> Arc<Fleet> {
        let (actions, actions_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
        let (status_in, status_in_rx) = mpsc::channel(STATUS_QUEUE_CAPACITY);
        let (status_out, status_out_rx) = mpsc::channel(STATUS_QUEUE_CAPACITY);
        Arc::new(Fleet {
            check_alive_interval: heartbeat,
            key_path: key_path.unwrap_or_else(default_key_path),
            global_key: OnceCell::new(),
            next_id: AtomicU32::new(0),
            actions,
            actions_rx: Mutex::new(Some(actions_rx)),
            status_in,
            status_in_rx: Mutex::new(Some(status_in_rx)),
            status_out,
            status_out_rx: Mutex::new(Some(status_out_rx)),
            views: DashMap::new(),
            stop: CancellationToken::new(),
        })
    }

    /// Shared health-check interval handed to every tunnel.
    pub fn heartbeat(&self) -> Duration {
        self.check_alive_interval
    }

    /// Build a tunnel from a descriptor, register a view for it, and
    /// (unless `no_connect`) start it in the background.
    ///
    /// An empty `name` defaults to the minted decimal id. `private_key`
    /// overrides the global key for this tunnel only.
    pub async fn establish(
        self: &Arc<Self>,
        name: &str,
        local: &str,
        server: &str,
        remote: &str,
        private_key: Option<&Path>,
        no_connect: bool,
    ) -> Result<TunnelView, FleetError> {
        let key = match private_key {
            Some(path) => tokio::fs::read(path).await.map_err(|source| FleetError::Key {
                path: path.to_path_buf(),
                source,
            })?,
            None => self.global_key().await?.clone(),
        };

        let tunnel = Tunnel::new(
            local,
            server,
            remote,
            &key,
            Some(self.status_in.clone()),
            self.check_alive_interval,
        )?;

        let name = (!name.is_empty()).then(|| name.to_string());
        let view = self.wrap(Arc::clone(&tunnel), name, private_key.map(Path::to_path_buf));
        self.views.insert(tunnel.tunnel_key(), view.clone());

        if !no_connect {
            tokio::spawn(async move { tunnel.up().await });
        }
        Ok(view)
    }

    /// Reconnect `view` unless it is already connected, in which case the
    /// sink is signaled right away.
    pub async fn up(&self, view: &TunnelView, done: Option<Done>) {
        if view.tunnel().status().contains(TunnelStatus::CONNECTED) {
            signal(done).await;
            return;
        }
        let _ = self
            .actions
            .send(Action {
                act: Act::Reconnect,
                view: view.clone(),
                done,
            })
            .await;
    }

    /// Close `view` through the dispatcher.
    pub async fn close(&self, view: &TunnelView, done: Option<Done>) {
        let _ = self
            .actions
            .send(Action {
                act: Act::Close,
                view: view.clone(),
                done,
            })
            .await;
    }

    /// Apply `act` to every registered tunnel, optionally waiting up to
    /// two seconds for the completions that arrive in time.
    pub async fn apply_all(&self, act: Act, wait_done: bool) {
        let views: Vec<TunnelView> = self.views.iter().map(|entry| entry.value().clone()).collect();
        let (done, mut completions) = mpsc::channel(views.len().max(1));
        for view in &views {
            match act {
                Act::Reconnect => view.tunnel().reconnect(Some(done.clone())).await,
                _ => view.tunnel().down(Some(done.clone())).await,
            }
        }
        drop(done);
        if wait_done {
            wait_timeout(APPLY_TIMEOUT, &mut completions, views.len()).await;
        }
    }

    /// Load the global key, start the dispatcher, and hand back the status
    /// stream. The stream has exactly one consumer and per-tunnel event
    /// order matches the order of state changes on that tunnel.
    ///
    /// May only be called once per fleet; a failure to read the key file
    /// aborts monitoring.
    pub async fn monitor(self: &Arc<Self>) -> Result<mpsc::Receiver<TunnelView>, FleetError> {
        self.global_key().await?;
        let taken = (
            self.actions_rx.lock().expect("fleet lock poisoned").take(),
            self.status_in_rx.lock().expect("fleet lock poisoned").take(),
            self.status_out_rx.lock().expect("fleet lock poisoned").take(),
        );
        let (Some(actions), Some(status_in), Some(status_out)) = taken else {
            return Err(FleetError::AlreadyMonitoring);
        };
        tokio::spawn(Arc::clone(self).dispatch(actions, status_in));
        Ok(status_out)
    }

    /// Stop the dispatcher, then close every tunnel, waiting briefly for
    /// the completions.
    pub async fn stop(&self) {
        debug!("fleet stopping");
        self.stop.cancel();
        let views: Vec<TunnelView> = self.views.iter().map(|entry| entry.value().clone()).collect();
        let (done, mut completions) = mpsc::channel(views.len().max(1));
        for view in &views {
            view.tunnel().down(Some(done.clone())).await;
        }
        drop(done);
        let closed = wait_timeout(APPLY_TIMEOUT, &mut completions, views.len()).await;
        debug!(closed, total = views.len(), "fleet stopped");
    }

    /// Serialize registry updates and fan status changes out to the
    /// subscriber.
    async fn dispatch(
        self: Arc<Self>,
        mut actions: mpsc::Receiver<Action>,
        mut status_in: mpsc::Receiver<Arc<Tunnel>>,
    ) {
        loop {
            tokio::select! {
                action = actions.recv() => {
                    let Some(action) = action else { break };
                    match action.act {
                        Act::Open => {
                            self.views
                                .entry(action.view.tunnel().tunnel_key())
                                .or_insert_with(|| action.view.clone());
                        }
                        Act::Close => action.view.tunnel().down(action.done).await,
                        Act::Reconnect => action.view.tunnel().reconnect(action.done).await,
                    }
                }
                tunnel = status_in.recv() => {
                    let Some(tunnel) = tunnel else { break };
                    let key = tunnel.tunnel_key();
                    let view = match self.views.get(&key).map(|entry| entry.value().clone()) {
                        Some(view) => view,
                        None => {
                            // a tunnel introduced out-of-band; adopt it
                            let view = self.wrap(tunnel, Some("unknown".to_string()), None);
                            self.views.insert(key, view.clone());
                            view
                        }
                    };
                    if self.status_out.send(view).await.is_err() {
                        warn!("status subscriber gone, dispatcher exiting");
                        break;
                    }
                }
                _ = self.stop.cancelled() => break,
            }
        }
        debug!("fleet dispatcher stopped");
    }

    fn wrap(
        self: &Arc<Self>,
        tunnel: Arc<Tunnel>,
        name: Option<String>,
        private_key: Option<PathBuf>,
    ) -> TunnelView {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let name = name.unwrap_or_else(|| id.to_string());
        TunnelView::new(id, name, private_key, tunnel, Arc::downgrade(self))
    }

    async fn global_key(&self) -> Result<&Vec<u8>, FleetError> {
        self.global_key
            .get_or_try_init(|| async {
                tokio::fs::read(&self.key_path)
                    .await
                    .map_err(|source| FleetError::Key {
                        path: self.key_path.clone(),
                        source,
                    })
            })
            .await
    }
}

/// Drain up to `count` completion signals, giving up at the deadline.
/// Returns how many arrived in time.
pub(crate) async fn wait_timeout(
    limit: Duration,
    completions: &mut mpsc::Receiver<()>,
    count: usize,
) -> usize {
    let deadline = Instant::now() + limit;
    let mut seen = 0;
    while seen < count {
        match timeout_at(deadline, completions.recv()).await {
            Ok(Some(())) => seen += 1,
            Ok(None) | Err(_) => break,
        }
    }
    seen
}

async fn signal(done: Option<Done>) {
    if let Some(done) = done {
        let _ = done.send(()).await;
    }
}
