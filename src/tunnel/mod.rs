//! Port forwarding over SSH: local (-L), remote (-R) and dynamic SOCKS5 (-D).
//!
//! Each tunnel owns one SSH connection, at most one local listener and the
//! peer tasks piping through it. Teardown always runs peers, then listener,
//! then connection.

pub mod dynamic;
pub mod local;
pub mod pipe;
pub mod remote;
pub mod socks;

use crate::context::RuntimeContext;
use crate::error::{ApiError, ErrorCode, MuxError, MuxResult};
use crate::session::lock;
use crate::transport::{Connection, SshTarget};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_BIND_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Local,
    Remote,
    Dynamic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// A forwarding rule as supplied by the caller.
///
/// For local and dynamic forwards `local_host:local_port` is the listener.
/// For remote forwards `remote_host:remote_port` is where the server listens
/// and `local_host:local_port` is the destination on this side. Dynamic
/// forwards ignore the remote fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_bind_host")]
    pub local_host: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    pub ssh: SshTarget,
}

fn default_bind_host() -> String {
    DEFAULT_BIND_HOST.to_string()
}

/// Full tunnel state, sent on every status change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelSnapshot {
    pub id: String,
    pub name: String,
    pub kind: TunnelKind,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub status: TunnelStatus,
    pub error: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: usize,
}

struct StatusCell {
    status: TunnelStatus,
    error: Option<String>,
}

pub struct Tunnel {
    spec: TunnelSpec,
    kind: TunnelKind,
    status: Mutex<StatusCell>,
    bound_port: AtomicU16,
    /// Local side to SSH side.
    bytes_out: AtomicU64,
    /// SSH side to local side.
    bytes_in: AtomicU64,
    peers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_peer: AtomicU64,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
    events: broadcast::Sender<TunnelSnapshot>,
}

impl Tunnel {
    fn new(spec: TunnelSpec, kind: TunnelKind, events: broadcast::Sender<TunnelSnapshot>) -> Self {
        let bound_port = spec.local_port;
        Self {
            spec,
            kind,
            status: Mutex::new(StatusCell {
                status: TunnelStatus::Connecting,
                error: None,
            }),
            bound_port: AtomicU16::new(bound_port),
            bytes_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            connection: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let (status, error) = {
            let cell = lock(&self.status);
            (cell.status, cell.error.clone())
        };
        TunnelSnapshot {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            kind: self.kind,
            local_host: self.spec.local_host.clone(),
            local_port: self.bound_port.load(Ordering::SeqCst),
            remote_host: self.spec.remote_host.clone(),
            remote_port: self.spec.remote_port,
            ssh_host: self.spec.ssh.host.clone(),
            ssh_port: self.spec.ssh.port,
            status,
            error,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connections: lock(&self.peers).len(),
        }
    }

    fn emit(&self) {
        let _ = self.events.send(self.snapshot());
    }

    fn set_status(&self, status: TunnelStatus, error: Option<String>) {
        {
            let mut cell = lock(&self.status);
            cell.status = status;
            cell.error = error;
        }
        self.emit();
    }

    /// Move to Connected unless teardown has already begun.
    fn mark_connected(&self) -> bool {
        {
            let mut cell = lock(&self.status);
            if self.is_stopping() {
                return false;
            }
            cell.status = TunnelStatus::Connected;
            cell.error = None;
        }
        self.emit();
        true
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Track a peer task. Refused once teardown has begun.
    fn spawn_peer<F>(self: &Arc<Self>, peer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut peers = lock(&self.peers);
            if self.is_stopping() {
                return;
            }
            let peer_id = self.next_peer.fetch_add(1, Ordering::SeqCst);
            let guard = PeerGuard {
                tunnel: self.clone(),
                peer_id,
            };
            let handle = tokio::spawn(async move {
                let _guard = guard;
                peer.await;
            });
            peers.insert(peer_id, handle);
        }
        self.emit();
    }

    fn release_peer(&self, peer_id: u64) {
        let removed = lock(&self.peers).remove(&peer_id).is_some();
        if removed && !self.is_stopping() {
            self.emit();
        }
    }

    /// Hand the connection to the tunnel. Returns it back if teardown has
    /// already started so the caller can close it.
    fn attach_connection(&self, connection: Arc<dyn Connection>) -> Result<(), Arc<dyn Connection>> {
        let mut slot = lock(&self.connection);
        if self.is_stopping() {
            return Err(connection);
        }
        *slot = Some(connection);
        Ok(())
    }

    fn attach_task(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        if self.is_stopping() {
            task.abort();
            return;
        }
        tasks.push(task);
    }

    /// Close peers, then listener tasks, then the connection. Returns false
    /// when another caller already tore the tunnel down.
    async fn teardown(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }

        let peers: Vec<JoinHandle<()>> = lock(&self.peers).drain().map(|(_, handle)| handle).collect();
        for peer in &peers {
            peer.abort();
        }
        for peer in peers {
            let _ = peer.await;
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let connection = lock(&self.connection).take();
        if let Some(connection) = connection
            && let Err(err) = connection.close().await
        {
            tracing::debug!(tunnel_id = %self.spec.id, error = %err, "SSH connection close failed");
        }
        true
    }
}

struct PeerGuard {
    tunnel: Arc<Tunnel>,
    peer_id: u64,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.tunnel.release_peer(self.peer_id);
    }
}

pub struct TunnelManager {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    context: Arc<RuntimeContext>,
    events: broadcast::Sender<TunnelSnapshot>,
}

impl TunnelManager {
    pub fn new(context: Arc<RuntimeContext>) -> Arc<Self> {
        let capacity = context.config().tunnel.event_capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        Arc::new(Self {
            tunnels: RwLock::new(HashMap::new()),
            context,
            events,
        })
    }

    /// Status snapshots for every tunnel, emitted on each change.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelSnapshot> {
        self.events.subscribe()
    }

    pub async fn create_local_forward(self: &Arc<Self>, spec: TunnelSpec) -> MuxResult<TunnelSnapshot> {
        self.start(spec, TunnelKind::Local).await
    }

    pub async fn create_remote_forward(self: &Arc<Self>, spec: TunnelSpec) -> MuxResult<TunnelSnapshot> {
        self.start(spec, TunnelKind::Remote).await
    }

    pub async fn create_dynamic_forward(self: &Arc<Self>, spec: TunnelSpec) -> MuxResult<TunnelSnapshot> {
        self.start(spec, TunnelKind::Dynamic).await
    }

    async fn start(self: &Arc<Self>, spec: TunnelSpec, kind: TunnelKind) -> MuxResult<TunnelSnapshot> {
        validate_spec(&spec, kind)?;
        let tunnel = Arc::new(Tunnel::new(spec, kind, self.events.clone()));
        {
            let mut tunnels = self.tunnels.write().await;
            if tunnels.contains_key(tunnel.id()) {
                return Err(
                    ApiError::new(ErrorCode::AlreadyExists, "Tunnel with this ID already exists")
                        .with_details(tunnel.id().to_string())
                        .into(),
                );
            }
            tunnels.insert(tunnel.id().to_string(), tunnel.clone());
        }
        tunnel.emit();
        tracing::info!(tunnel_id = %tunnel.id(), ?kind, "Starting tunnel");

        match self.establish(&tunnel).await {
            Ok(connection) => {
                if !tunnel.mark_connected() {
                    return Err(ApiError::new(ErrorCode::RemoteClosed, "Tunnel stopped while connecting")
                        .with_details(tunnel.id().to_string())
                        .into());
                }
                self.spawn_watchdog(&tunnel, connection);
                tracing::info!(
                    tunnel_id = %tunnel.id(),
                    local_port = tunnel.bound_port.load(Ordering::SeqCst),
                    "Tunnel connected"
                );
                Ok(tunnel.snapshot())
            }
            Err(err) => {
                if tunnel.teardown().await {
                    tracing::warn!(tunnel_id = %tunnel.id(), error = %err, "Tunnel failed to start");
                    tunnel.set_status(TunnelStatus::Error, Some(err.to_string()));
                    self.forget(&tunnel).await;
                }
                Err(err)
            }
        }
    }

    async fn establish(&self, tunnel: &Arc<Tunnel>) -> MuxResult<Arc<dyn Connection>> {
        let connection = self.context.connect(&tunnel.spec.ssh).await?;
        if let Err(connection) = tunnel.attach_connection(connection.clone()) {
            let _ = connection.close().await;
            return Err(ApiError::new(ErrorCode::RemoteClosed, "Tunnel stopped while connecting").into());
        }
        let task = match tunnel.kind {
            TunnelKind::Local => local::start(tunnel, connection.clone()).await?,
            TunnelKind::Remote => remote::start(tunnel, connection.clone()).await?,
            TunnelKind::Dynamic => dynamic::start(tunnel, connection.clone()).await?,
        };
        tunnel.attach_task(task);
        Ok(connection)
    }

    /// An SSH connection that dies under a running tunnel moves it to Error.
    fn spawn_watchdog(self: &Arc<Self>, tunnel: &Arc<Tunnel>, connection: Arc<dyn Connection>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let watched = tunnel.clone();
        let task = tokio::spawn(async move {
            connection.wait_closed().await;
            if watched.is_stopping() {
                return;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            // Teardown awaits this task, so it has to run elsewhere.
            tokio::spawn(async move {
                manager.fail(&watched, "SSH connection lost").await;
            });
        });
        tunnel.attach_task(task);
    }

    async fn fail(&self, tunnel: &Arc<Tunnel>, message: &str) {
        if tunnel.teardown().await {
            tracing::warn!(tunnel_id = %tunnel.id(), message, "Tunnel failed");
            tunnel.set_status(TunnelStatus::Error, Some(message.to_string()));
            self.forget(tunnel).await;
        }
    }

    async fn forget(&self, tunnel: &Arc<Tunnel>) {
        let mut tunnels = self.tunnels.write().await;
        if tunnels
            .get(tunnel.id())
            .is_some_and(|current| Arc::ptr_eq(current, tunnel))
        {
            tunnels.remove(tunnel.id());
        }
    }

    /// Stop a tunnel. Unknown ids and repeated calls are not errors.
    pub async fn stop(&self, tunnel_id: &str) -> MuxResult<()> {
        let tunnel = self.tunnels.write().await.remove(tunnel_id);
        let Some(tunnel) = tunnel else {
            return Ok(());
        };
        if tunnel.teardown().await {
            tunnel.set_status(TunnelStatus::Disconnected, None);
            tracing::info!(tunnel_id = %tunnel_id, "Tunnel stopped");
        }
        Ok(())
    }

    pub async fn get_tunnel(&self, tunnel_id: &str) -> MuxResult<TunnelSnapshot> {
        self.tunnels
            .read()
            .await
            .get(tunnel_id)
            .map(|tunnel| tunnel.snapshot())
            .ok_or_else(|| {
                ApiError::new(ErrorCode::NotFound, "Tunnel not found")
                    .with_details(tunnel_id.to_string())
                    .into()
            })
    }

    pub async fn get_all_tunnels(&self) -> Vec<TunnelSnapshot> {
        let tunnels = self.tunnels.read().await;
        let mut snapshots: Vec<TunnelSnapshot> = tunnels.values().map(|t| t.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                tracing::warn!(tunnel_id = %id, error = %err, "Failed to stop tunnel");
            }
        }
    }
}

fn validate_spec(spec: &TunnelSpec, kind: TunnelKind) -> MuxResult<()> {
    let invalid = |message: &str| -> MuxError { ApiError::new(ErrorCode::InvalidArgument, message).into() };
    if spec.id.trim().is_empty() {
        return Err(invalid("tunnel id is required"));
    }
    if spec.ssh.host.trim().is_empty() || spec.ssh.username.trim().is_empty() {
        return Err(invalid("SSH host and username are required"));
    }
    match kind {
        TunnelKind::Local => {
            if spec.remote_host.trim().is_empty() || spec.remote_port == 0 {
                return Err(invalid("local forward needs a remote destination"));
            }
        }
        TunnelKind::Remote => {
            if spec.local_host.trim().is_empty() || spec.local_port == 0 {
                return Err(invalid("remote forward needs a local destination"));
            }
        }
        TunnelKind::Dynamic => {}
    }
    Ok(())
}

/// Bind the tunnel's local listener and record the port actually bound.
async fn bind_listener(tunnel: &Tunnel) -> MuxResult<TcpListener> {
    let host = tunnel.spec.local_host.as_str();
    let port = tunnel.spec.local_port;
    let listener = TcpListener::bind((host, port)).await.map_err(|err| {
        ApiError::new(ErrorCode::BindFailed, "Failed to bind local listener")
            .with_details(format!("{host}:{port}: {err}"))
    })?;
    if let Ok(addr) = listener.local_addr() {
        tunnel.bound_port.store(addr.port(), Ordering::SeqCst);
    }
    tracing::debug!(tunnel_id = %tunnel.spec.id, host, port, "Listener bound");
    Ok(listener)
}

async fn accept_loop<F, Fut>(listener: TcpListener, tunnel: Arc<Tunnel>, mut serve: F)
where
    F: FnMut(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                tracing::debug!(tunnel_id = %tunnel.spec.id, %peer, "Accepted connection");
                tunnel.spawn_peer(serve(socket, peer));
            }
            Err(err) => {
                tracing::warn!(tunnel_id = %tunnel.spec.id, error = %err, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Listener and destination parsed from an ssh-style forward argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEndpoints {
    pub bind_host: String,
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

/// `[bind_host:]port:host:hostport`, as used by `-L` and `-R`.
pub fn parse_forward(spec: &str) -> MuxResult<ForwardEndpoints> {
    let parts = split_forward(spec)?;
    let (bind_host, rest) = match parts.len() {
        3 => (DEFAULT_BIND_HOST.to_string(), &parts[..]),
        4 => (parts[0].clone(), &parts[1..]),
        _ => return Err(bad_forward(spec)),
    };
    let target_host = rest[1].clone();
    if target_host.is_empty() {
        return Err(bad_forward(spec));
    }
    Ok(ForwardEndpoints {
        bind_host,
        bind_port: parse_port(&rest[0], spec)?,
        target_host,
        target_port: parse_port(&rest[2], spec)?,
    })
}

/// `[bind_host:]port`, as used by `-D`.
pub fn parse_bind(spec: &str) -> MuxResult<(String, u16)> {
    let parts = split_forward(spec)?;
    match parts.as_slice() {
        [port] => Ok((DEFAULT_BIND_HOST.to_string(), parse_port(port, spec)?)),
        [host, port] => Ok((host.clone(), parse_port(port, spec)?)),
        _ => Err(bad_forward(spec)),
    }
}

/// Split on `:` while keeping bracketed IPv6 literals whole.
fn split_forward(spec: &str) -> MuxResult<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    for ch in spec.trim().chars() {
        match ch {
            '[' if !in_brackets && current.is_empty() => in_brackets = true,
            ']' if in_brackets => in_brackets = false,
            ':' if !in_brackets => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if in_brackets {
        return Err(bad_forward(spec));
    }
    parts.push(current);
    Ok(parts)
}

fn parse_port(value: &str, spec: &str) -> MuxResult<u16> {
    value.parse::<u16>().map_err(|_| bad_forward(spec))
}

fn bad_forward(spec: &str) -> MuxError {
    ApiError::new(ErrorCode::InvalidArgument, "Invalid forward specification")
        .with_details(spec.to_string())
        .into()
}
