//! The tunnel supervisor: descriptor validation, the single-writer work
//! task, the listener-accept loop and the SSH health check.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::{KeyPair, PublicKey};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mario_core::config::{split_host_port, split_server_addr};
use mario_core::error::ConfigError;

use crate::connector::{Connector, ConnectorInfo};
use crate::status::TunnelStatus;

/// Minimum allowed health-check interval; shorter values are clamped.
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

const WORK_QUEUE_CAPACITY: usize = 32;

/// Completion sink for lifecycle operations. The work task signals it
/// exactly once after the requested action has been applied; errors are
/// observed through [`Tunnel::error`], not the sink.
pub type Done = mpsc::Sender<()>;

/// Receiver of status-change notifications, invoked from the work task.
/// The consumer must keep draining it; the work task blocks on a full
/// sink rather than dropping a transition.
pub type StatusSink = mpsc::Sender<Arc<Tunnel>>;

/// Process-unique keys identifying tunnels in fleet registries.
static NEXT_TUNNEL_KEY: AtomicU64 = AtomicU64::new(1);

/// Errors surfaced by tunnel operations and stored behind the `ERROR`
/// status bit.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Bad descriptor; reported synchronously, no tunnel state exists
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The private key could not be parsed
    #[error("invalid private key: {0}")]
    Key(#[from] russh_keys::Error),

    /// SSH-level failure while dialing or talking to the gateway
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// The gateway did not answer within the dial timeout
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// The gateway rejected our public key
    #[error("authentication rejected by {0}")]
    AuthRejected(String),

    /// The local listening address could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The SSH session is gone; a reconnect will be attempted
    #[error("remote connection lost")]
    RemoteLost,

    /// The accept loop terminated unexpectedly
    #[error("listener closed: {0}")]
    ListenerClosed(#[source] std::io::Error),
}

/// Units of work executed by the tunnel's work task, which is the sole
/// mutator of tunnel state.
pub(crate) enum Work {
    /// Drop the current session (if any) and dial a fresh one
    Connect { done: Option<Done> },
    /// An accepted local connection waiting for its SSH channel
    Incoming { stream: TcpStream, peer: SocketAddr },
    /// The accept loop died with an error
    AcceptFailed { error: std::io::Error },
    /// Tear everything down and enter `CLOSED`
    Down { done: Option<Done> },
    /// Tear everything down and enter `REMOVED`; the work task exits
    Destroy { done: Option<Done> },
    /// A connector finished and wants to be forgotten
    RemoveConnector { id: u64 },
    /// Snapshot the connector set in insertion order
    Connectors {
        reply: oneshot::Sender<Vec<ConnectorInfo>>,
    },
}

#[derive(Debug)]
struct Shared {
    status: TunnelStatus,
    err: Option<Arc<TunnelError>>,
}

/// One local listener plus one SSH session plus a managed set of
/// connectors.
///
/// Lifecycle: `NEW → CONNECTING → CONNECTED ↔ (error overlays) → CLOSED →
/// REMOVED`, with `REMOVED` terminal. The work task started by [`up`]
/// performs every state mutation; [`status`] and [`error`] are the only
/// lock-guarded external read paths.
///
/// [`up`]: Tunnel::up
/// [`status`]: Tunnel::status
/// [`error`]: Tunnel::error
#[derive(Debug)]
pub struct Tunnel {
    local: String,
    user: String,
    ssh_addr: String,
    remote_host: String,
    remote_port: u16,
    signer: Arc<KeyPair>,
    health_check_interval: Duration,
    tunnel_key: u64,
    started: AtomicBool,
    works: mpsc::Sender<Work>,
    work_rx: Mutex<Option<mpsc::Receiver<Work>>>,
    shared: RwLock<Shared>,
    on_status: Option<StatusSink>,
}

impl Tunnel {
    /// Create a tunnel forwarding `local` (`host:port`) to `remote`
    /// (`host:port`) through the SSH server `server` (`user@host[:port]`,
    /// port defaulting to 22). `pk` holds the PEM-encoded private key.
    ///
    /// `health_check_interval` doubles as the dial timeout; values below
    /// [`MIN_HEALTH_CHECK_INTERVAL`] are clamped.
    pub fn new(
        local: &str,
        server: &str,
        remote: &str,
        pk: &[u8],
        on_status: Option<StatusSink>,
        health_check_interval: Duration,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let pem = std::str::from_utf8(pk).map_err(|_| russh_keys::Error::CouldNotReadKey)?;
        let signer = russh_keys::decode_secret_key(pem, None)?;
        Self::with_key(local, server, remote, signer, on_status, health_check_interval)
    }

    /// Like [`Tunnel::new`] but with an already-parsed key.
    pub fn with_key(
        local: &str,
        server: &str,
        remote: &str,
        signer: KeyPair,
        on_status: Option<StatusSink>,
        health_check_interval: Duration,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let (local_host, local_port) = split_host_port(local)
            .ok_or_else(|| ConfigError::InvalidLocalAddr(local.to_string()))?;
        // a bare `:port` listens on every interface
        let local = if local_host.is_empty() {
            format!("0.0.0.0:{local_port}")
        } else {
            format!("{local_host}:{local_port}")
        };
        let (user, ssh_addr) = split_server_addr(server)?;
        let (remote_host, remote_port) = split_host_port(remote)
            .ok_or_else(|| ConfigError::MissingRemotePort(remote.to_string()))?;

        let (works, work_rx) = mpsc::channel(WORK_QUEUE_CAPACITY);
        Ok(Arc::new(Tunnel {
            local,
            user,
            ssh_addr,
            remote_host,
            remote_port,
            signer: Arc::new(signer),
            health_check_interval: health_check_interval.max(MIN_HEALTH_CHECK_INTERVAL),
            tunnel_key: NEXT_TUNNEL_KEY.fetch_add(1, Ordering::Relaxed),
            started: AtomicBool::new(false),
            works,
            work_rx: Mutex::new(Some(work_rx)),
            shared: RwLock::new(Shared {
                status: TunnelStatus::NEW,
                err: None,
            }),
            on_status,
        }))
    }

    /// Local listening address.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// SSH user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// SSH server address as `user@host:port`.
    pub fn server(&self) -> String {
        format!("{}@{}", self.user, self.ssh_addr)
    }

    /// Remote endpoint as `host:port`.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Health-check interval after clamping.
    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    /// Process-unique key identifying this tunnel in registries.
    pub fn tunnel_key(&self) -> u64 {
        self.tunnel_key
    }

    /// Current status bitmask; callable from any task.
    pub fn status(&self) -> TunnelStatus {
        self.shared.read().expect("status lock poisoned").status
    }

    /// The last error, present iff the `ERROR` status bit is set.
    pub fn error(&self) -> Option<Arc<TunnelError>> {
        let shared = self.shared.read().expect("status lock poisoned");
        if shared.status.contains(TunnelStatus::ERROR) {
            shared.err.clone()
        } else {
            None
        }
    }

    /// Start the work task: perform the initial connect, then run the event
    /// loop until the tunnel is removed.
    ///
    /// The loop runs on the calling task; start it in the background with
    /// `tokio::spawn`. A second call, or a call on a removed tunnel,
    /// returns immediately: the work task runs at most once per tunnel
    /// lifetime.
    pub async fn up(self: &Arc<Self>) {
        if self.status().contains(TunnelStatus::REMOVED) {
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let work_rx = {
            self.work_rx
                .lock()
                .expect("work queue lock poisoned")
                .take()
        };
        let Some(work_rx) = work_rx else { return };
        Worker::new(Arc::clone(self)).run(work_rx).await;
    }

    /// Enqueue a forced reconnect.
    ///
    /// On a tunnel whose work task never started this starts [`up`] in the
    /// background instead; on a removed tunnel it is a no-op. Either way
    /// `done` is signaled once the request has been applied.
    ///
    /// [`up`]: Tunnel::up
    pub async fn reconnect(self: &Arc<Self>, done: Option<Done>) {
        if self.status().contains(TunnelStatus::REMOVED) {
            signal(done).await;
            return;
        }
        if !self.started.load(Ordering::SeqCst) {
            let tunnel = Arc::clone(self);
            tokio::spawn(async move { tunnel.up().await });
            signal(done).await;
            return;
        }
        // a send failure means the work task is already gone
        let _ = self.works.send(Work::Connect { done }).await;
    }

    /// Tear down the listener, the SSH session and every connector, then
    /// enter `CLOSED`. The tunnel can be reopened with [`reconnect`].
    ///
    /// On a non-running tunnel this is a no-op that signals `done`
    /// immediately.
    ///
    /// [`reconnect`]: Tunnel::reconnect
    pub async fn down(self: &Arc<Self>, done: Option<Done>) {
        if self.status().contains(TunnelStatus::REMOVED) || !self.started.load(Ordering::SeqCst) {
            signal(done).await;
            return;
        }
        let _ = self.works.send(Work::Down { done }).await;
    }

    /// Like [`down`] but terminal: the status becomes `REMOVED`, the work
    /// task exits and every subsequent operation is a no-op.
    ///
    /// [`down`]: Tunnel::down
    pub async fn destroy(self: &Arc<Self>, done: Option<Done>) {
        if self.status().contains(TunnelStatus::REMOVED) {
            signal(done).await;
            return;
        }
        if !self.started.load(Ordering::SeqCst) {
            self.set_status_error(TunnelStatus::REMOVED, None).await;
            signal(done).await;
            return;
        }
        if let Err(rejected) = self.works.send(Work::Destroy { done }).await {
            // the work task raced us to exit; still honor the sink
            if let Work::Destroy { done } = rejected.0 {
                signal(done).await;
            }
        }
    }

    /// Snapshot the live connectors in stable insertion order.
    pub async fn connectors(self: &Arc<Self>) -> Vec<ConnectorInfo> {
        if !self.started.load(Ordering::SeqCst) || self.status().contains(TunnelStatus::REMOVED) {
            return Vec::new();
        }
        let (reply, rx) = oneshot::channel();
        if self.works.send(Work::Connectors { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Assign a new status, overlay the `ERROR` bit when `err` is present,
    /// and notify the status sink. Called only from the work task, except
    /// for destroying a tunnel that never ran.
    pub(crate) async fn set_status_error(
        self: &Arc<Self>,
        status: TunnelStatus,
        err: Option<TunnelError>,
    ) {
        {
            let mut shared = self.shared.write().expect("status lock poisoned");
            let mut next = status;
            if shared.status.contains(TunnelStatus::RUNNING) {
                next |= TunnelStatus::RUNNING;
            }
            if let Some(err) = err {
                next |= TunnelStatus::ERROR;
                shared.err = Some(Arc::new(err));
            }
            shared.status = next;
        }
        if let Some(sink) = &self.on_status {
            let _ = sink.send(Arc::clone(self)).await;
        }
    }

    /// Overlay an error on the current primary state.
    pub(crate) async fn set_error(self: &Arc<Self>, err: TunnelError) {
        let primary = self.status().primary();
        self.set_status_error(primary, Some(err)).await;
    }

    /// Flip the `RUNNING` bit without publishing a transition.
    fn set_running(&self, running: bool) {
        let mut shared = self.shared.write().expect("status lock poisoned");
        if running {
            shared.status |= TunnelStatus::RUNNING;
        } else {
            shared.status = shared.status.without(TunnelStatus::RUNNING);
        }
    }

    /// Dial the SSH server and authenticate, bounded by the dial timeout.
    async fn dial(&self) -> Result<Handle<ClientHandler>, TunnelError> {
        let config = Arc::new(client::Config::default());
        let mut session = timeout(
            self.health_check_interval,
            client::connect(config, self.ssh_addr.as_str(), ClientHandler),
        )
        .await
        .map_err(|_| TunnelError::ConnectTimeout(self.ssh_addr.clone()))??;

        let authenticated = session
            .authenticate_publickey(self.user.as_str(), Arc::clone(&self.signer))
            .await?;
        if !authenticated {
            return Err(TunnelError::AuthRejected(self.ssh_addr.clone()));
        }
        Ok(session)
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} -> {}", self.local, self.ssh_addr, self.remote())
    }
}

async fn signal(done: Option<Done>) {
    if let Some(done) = done {
        let _ = done.send(()).await;
    }
}

/// russh client handler; the gateway's host key is accepted
/// unconditionally.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // always accept the gateway's key
        Ok(true)
    }
}

/// The single writer: owns every piece of mutable tunnel state and
/// executes work items one at a time.
struct Worker {
    tunnel: Arc<Tunnel>,
    client: Option<Handle<ClientHandler>>,
    listener_cancel: Option<CancellationToken>,
    connectors: BTreeMap<u64, Connector>,
    connector_count: u64,
}

impl Worker {
    fn new(tunnel: Arc<Tunnel>) -> Worker {
        Worker {
            tunnel,
            client: None,
            listener_cancel: None,
            connectors: BTreeMap::new(),
            connector_count: 0,
        }
    }

    async fn run(mut self, mut works: mpsc::Receiver<Work>) {
        self.tunnel.set_running(true);
        if let Err(err) = self.force_connect().await {
            self.tunnel.set_error(err).await;
        }

        let period = self.tunnel.health_check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                work = works.recv() => match work {
                    Some(work) => self.handle(work).await,
                    None => break,
                },
                _ = ticker.tick() => self.health_check().await,
            }
            if self.tunnel.status().contains(TunnelStatus::REMOVED) {
                debug!(tunnel = %self.tunnel, "work task exiting");
                break;
            }
        }
        self.tunnel.set_running(false);
    }

    async fn handle(&mut self, work: Work) {
        match work {
            Work::Connect { done } => {
                if let Err(err) = self.force_connect().await {
                    self.tunnel.set_error(err).await;
                }
                signal(done).await;
            }
            Work::Incoming { stream, peer } => self.open_connector(stream, peer).await,
            Work::AcceptFailed { error } => {
                self.listener_cancel = None;
                // a closing tunnel expects its listener to die; only a live
                // one surfaces the failure
                if !self.tunnel.status().contains(TunnelStatus::CLOSED) {
                    self.tunnel
                        .set_status_error(
                            TunnelStatus::CLOSED,
                            Some(TunnelError::ListenerClosed(error)),
                        )
                        .await;
                }
            }
            Work::Down { done } => self.teardown(TunnelStatus::CLOSED, done).await,
            Work::Destroy { done } => self.teardown(TunnelStatus::REMOVED, done).await,
            Work::RemoveConnector { id } => {
                self.connectors.remove(&id);
            }
            Work::Connectors { reply } => {
                let infos = self.connectors.values().map(Connector::info).collect();
                let _ = reply.send(infos);
            }
        }
    }

    /// Idempotent connect: drop the current session, dial a new one, and
    /// make sure a listener is accepting.
    async fn force_connect(&mut self) -> Result<(), TunnelError> {
        let was_closed = self.tunnel.status().contains(TunnelStatus::CLOSED);
        if let Some(client) = self.client.take() {
            let _ = client
                .disconnect(Disconnect::ByApplication, "reconnecting", "en")
                .await;
        }
        self.tunnel
            .set_status_error(TunnelStatus::CONNECTING, None)
            .await;

        let client = self.tunnel.dial().await?;
        self.client = Some(client);

        if self.listener_cancel.is_none() || was_closed {
            let listener = TcpListener::bind(self.tunnel.local.as_str())
                .await
                .map_err(|source| TunnelError::Bind {
                    addr: self.tunnel.local.clone(),
                    source,
                })?;
            let cancel = CancellationToken::new();
            tokio::spawn(accept_loop(
                listener,
                self.tunnel.works.clone(),
                cancel.clone(),
            ));
            self.listener_cancel = Some(cancel);
            debug!(tunnel = %self.tunnel, "listening on {}", self.tunnel.local);
        }

        self.tunnel
            .set_status_error(TunnelStatus::CONNECTED, None)
            .await;
        Ok(())
    }

    /// Dial the remote target through the current session and launch a
    /// connector for an accepted local connection. Failures drop the
    /// connection without failing the tunnel.
    async fn open_connector(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Some(client) = &self.client else {
            debug!(tunnel = %self.tunnel, %peer, "no ssh session, dropping connection");
            return;
        };
        let opened = timeout(
            self.tunnel.health_check_interval,
            client.channel_open_direct_tcpip(
                self.tunnel.remote_host.as_str(),
                u32::from(self.tunnel.remote_port),
                &peer.ip().to_string(),
                u32::from(peer.port()),
            ),
        )
        .await;
        let channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(error)) => {
                debug!(tunnel = %self.tunnel, %peer, %error, "channel open failed, dropping connection");
                return;
            }
            Err(_) => {
                debug!(tunnel = %self.tunnel, %peer, "channel open timed out, dropping connection");
                return;
            }
        };

        self.connector_count += 1;
        let id = self.connector_count;
        let connector = Connector::spawn(id, stream, peer, channel, self.tunnel.works.clone());
        self.connectors.insert(id, connector);
        debug!(tunnel = %self.tunnel, connector = id, %peer, "connector opened");
    }

    /// Cut every connector, stop the listener, close the session, and
    /// settle in `last` (`CLOSED` or `REMOVED`).
    async fn teardown(&mut self, last: TunnelStatus, done: Option<Done>) {
        // direct shutdown: routing removals through the work queue here
        // would have the single writer waiting on itself
        for (_, connector) in std::mem::take(&mut self.connectors) {
            connector.shut_down();
        }
        if let Some(cancel) = self.listener_cancel.take() {
            cancel.cancel();
        }
        if let Some(client) = self.client.take() {
            let _ = client.disconnect(Disconnect::ByApplication, "", "en").await;
        }
        self.tunnel.set_status_error(last, None).await;
        signal(done).await;
    }

    /// Periodic liveness check; on failure records the error and retries
    /// the connect.
    async fn health_check(&mut self) {
        let status = self.tunnel.status();
        if status.contains(TunnelStatus::REMOVED) {
            return;
        }
        if status.contains(TunnelStatus::CLOSED) && self.tunnel.error().is_none() {
            return;
        }
        debug!(tunnel = %self.tunnel, "health check");
        let err = match &self.client {
            None => Some(TunnelError::RemoteLost),
            Some(client) => {
                match keepalive(self.tunnel.health_check_interval, client).await {
                    Ok(()) if self.listener_cancel.is_some() => return,
                    // session healthy but no listener (earlier bind
                    // failure); redial to get one bound
                    Ok(()) => None,
                    Err(err) => Some(err),
                }
            }
        };
        if let Some(err) = err {
            warn!(tunnel = %self.tunnel, error = %err, "health check failed, reconnecting");
            self.tunnel.set_error(err).await;
        }
        if let Err(err) = self.force_connect().await {
            self.tunnel.set_error(err).await;
        }
    }
}

/// Probe the session: a channel open is a full round-trip through the
/// gateway.
async fn keepalive(
    limit: Duration,
    client: &Handle<ClientHandler>,
) -> Result<(), TunnelError> {
    if client.is_closed() {
        return Err(TunnelError::RemoteLost);
    }
    let probe = timeout(limit, client.channel_open_session())
        .await
        .map_err(|_| TunnelError::RemoteLost)??;
    let _ = probe.eof().await;
    Ok(())
}

/// Accept local connections and enqueue them on the work queue until the
/// listener is cancelled or dies.
async fn accept_loop(
    listener: TcpListener,
    works: mpsc::Sender<Work>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if works.send(Work::Incoming { stream, peer }).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    let _ = works.send(Work::AcceptFailed { error }).await;
                    break;
                }
            },
        }
    }
}
