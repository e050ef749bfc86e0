pub mod buffer;
pub mod credential;
pub mod ordering;
pub mod pty;

use crate::config::ShellTransport;
use crate::context::RuntimeContext;
use crate::error::{ApiError, ErrorCode, MuxResult};
use crate::session::credential::{AuthPlan, InjectionDriver, InjectionTiming, is_valid_env_name};
use crate::session::ordering::PendingShell;
use crate::session::pty::{LocalPtyParams, PtyBackend, PtyGeometry, RemotePtyParams};
use crate::transport::{
    AuthMaterial, Connection, ExecChunk, ExecOutput, ExecStatus, ShellControl, ShellRequest, SshTarget,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(flatten)]
    pub target: SshTarget,
    /// Overrides the configured default transport.
    #[serde(default)]
    pub transport: Option<ShellTransport>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

impl ConnectRequest {
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            transport: None,
            env: Vec::new(),
            cols: None,
            rows: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Pty,
    Protocol,
    Local,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionLifecycle {
    Created,
    Authenticating,
    Ready,
    Closed,
    Failed,
}

impl SessionLifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            x if x == Self::Created as u8 => Self::Created,
            x if x == Self::Authenticating as u8 => Self::Authenticating,
            x if x == Self::Ready as u8 => Self::Ready,
            x if x == Self::Closed as u8 => Self::Closed,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// What a session's consumer receives, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Data(Bytes),
    Ready,
    Closed { exit_code: Option<u32> },
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn write(&self, data: &[u8]) -> MuxResult<usize>;
    async fn resize(&self, cols: u16, rows: u16) -> MuxResult<()>;
    async fn close(&self) -> MuxResult<()>;
    fn is_eof(&self) -> bool;
}

/// Shell channel on an in-process SSH connection.
struct ProtocolBackend {
    control: Arc<dyn ShellControl>,
    connection: Arc<dyn Connection>,
}

#[async_trait]
impl SessionBackend for ProtocolBackend {
    async fn write(&self, data: &[u8]) -> MuxResult<usize> {
        self.control.write(data).await?;
        Ok(data.len())
    }

    async fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        self.control.resize(cols, rows).await
    }

    async fn close(&self) -> MuxResult<()> {
        let shell = self.control.close().await;
        let connection = self.connection.close().await;
        shell.and(connection)
    }

    fn is_eof(&self) -> bool {
        self.connection.is_closed()
    }
}

pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub host: String,
    pub port: u16,
    target: Option<SshTarget>,
    backend: Box<dyn SessionBackend>,
    lifecycle: AtomicU8,
    created_at: u64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    cols: AtomicU32,
    rows: AtomicU32,
    exec_connection: AsyncMutex<Option<Arc<dyn Connection>>>,
}

struct SessionInit {
    id: String,
    kind: SessionKind,
    target: Option<SshTarget>,
    backend: Box<dyn SessionBackend>,
    lifecycle: SessionLifecycle,
    cols: u16,
    rows: u16,
    exec_connection: Option<Arc<dyn Connection>>,
}

impl Session {
    fn new(init: SessionInit) -> Self {
        let (host, port) = init
            .target
            .as_ref()
            .map(|target| (target.host.clone(), target.port))
            .unwrap_or_else(|| ("localhost".to_string(), 0));
        Self {
            id: init.id,
            kind: init.kind,
            host,
            port,
            target: init.target,
            backend: init.backend,
            lifecycle: AtomicU8::new(init.lifecycle as u8),
            created_at: now_ms(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            cols: AtomicU32::new(u32::from(init.cols)),
            rows: AtomicU32::new(u32::from(init.rows)),
            exec_connection: AsyncMutex::new(init.exec_connection),
        }
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        SessionLifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    fn set_lifecycle(&self, lifecycle: SessionLifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::SeqCst);
    }

    fn mark_ready(&self) {
        if !self.lifecycle().is_terminal() {
            self.set_lifecycle(SessionLifecycle::Ready);
        }
    }

    /// A process that dies with an error before ever showing a prompt failed
    /// to connect; anything else is an ordinary close.
    fn mark_exited(&self, exit_code: Option<u32>) {
        let failed = self.lifecycle() != SessionLifecycle::Ready
            && exit_code.is_some_and(|code| code != 0);
        self.set_lifecycle(if failed {
            SessionLifecycle::Failed
        } else {
            SessionLifecycle::Closed
        });
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            lifecycle: self.lifecycle(),
            created_at: self.created_at,
            bytes_in: self.bytes_in.load(Ordering::SeqCst),
            bytes_out: self.bytes_out.load(Ordering::SeqCst),
            cols: self.cols.load(Ordering::SeqCst) as u16,
            rows: self.rows.load(Ordering::SeqCst) as u16,
        }
    }

    pub async fn write(&self, data: &[u8]) -> MuxResult<usize> {
        let written = self.backend.write(data).await?;
        self.bytes_out.fetch_add(written as u64, Ordering::SeqCst);
        Ok(written)
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        self.backend.resize(cols, rows).await?;
        self.cols.store(u32::from(cols), Ordering::SeqCst);
        self.rows.store(u32::from(rows), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> MuxResult<()> {
        let result = self.backend.close().await;
        if let Some(connection) = self.exec_connection.lock().await.take()
            && let Err(err) = connection.close().await
        {
            tracing::debug!(session_id = %self.id, error = %err, "Command connection close failed");
        }
        if !self.lifecycle().is_terminal() {
            self.set_lifecycle(SessionLifecycle::Closed);
        }
        result
    }

    pub fn is_eof(&self) -> bool {
        self.backend.is_eof()
    }
}

/// The consumer's end of a session.
pub struct SessionHandle {
    pub id: String,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub kind: SessionKind,
    pub host: String,
    pub port: u16,
    pub lifecycle: SessionLifecycle,
    pub created_at: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub cols: u16,
    pub rows: u16,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    context: Arc<RuntimeContext>,
}

impl SessionRegistry {
    pub fn new(context: Arc<RuntimeContext>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            context,
        })
    }

    /// Open an interactive shell on a remote host. The returned handle's
    /// events start with whatever the selected transport produces first.
    pub async fn connect(self: &Arc<Self>, request: ConnectRequest) -> MuxResult<SessionHandle> {
        validate_request(&request)?;
        let id = request.target.session_id();
        if self.is_active(&id).await {
            return Err(ApiError::new(ErrorCode::AlreadyExists, "Session already active")
                .with_details(id)
                .into());
        }

        let config = self.context.config();
        let transport = request.transport.unwrap_or(config.session.transport);
        let cols = request.cols.unwrap_or(config.pty.cols);
        let rows = request.rows.unwrap_or(config.pty.rows);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();

        tracing::info!(session_id = %id, ?transport, "Opening session");
        let session = match transport {
            ShellTransport::PtySubprocess => {
                self.context.knock_if_configured(&request.target).await;
                let driver = InjectionDriver::new(
                    self.context.patterns(),
                    auth_plan(&request.target.auth),
                    &request.env,
                    InjectionTiming::from(&config.injection),
                    config.injection.prompt_window_chars,
                );
                let backend = PtyBackend::spawn_remote(RemotePtyParams {
                    session_id: &id,
                    ssh_path: self.context.ssh_executable(),
                    target: &request.target,
                    env: &request.env,
                    ssh_config: &config.ssh,
                    geometry: PtyGeometry {
                        term: config.pty.term.clone(),
                        cols,
                        rows,
                    },
                    driver,
                    events: internal_tx,
                })?;
                Session::new(SessionInit {
                    id: id.clone(),
                    kind: SessionKind::Pty,
                    target: Some(request.target.clone()),
                    backend: Box::new(backend),
                    lifecycle: SessionLifecycle::Authenticating,
                    cols,
                    rows,
                    exec_connection: None,
                })
            }
            ShellTransport::ProtocolShell => {
                let connection = self.context.connect(&request.target).await?;
                let shell_request = ShellRequest {
                    term: config.pty.term.clone(),
                    cols,
                    rows,
                    env: request.env.clone(),
                };
                let channel = match connection.open_shell(shell_request).await {
                    Ok(channel) => channel,
                    Err(err) => {
                        let _ = connection.close().await;
                        return Err(err);
                    }
                };
                let pending = PendingShell::capture(connection.clone(), channel);
                let backend = ProtocolBackend {
                    control: pending.control(),
                    connection: connection.clone(),
                };
                let _ = internal_tx.send(SessionEvent::Ready);
                let motd_command = config.ssh.motd_command.clone();
                tokio::spawn(async move {
                    pending.start_streaming(internal_tx, &motd_command).await;
                });
                Session::new(SessionInit {
                    id: id.clone(),
                    kind: SessionKind::Protocol,
                    target: Some(request.target.clone()),
                    backend: Box::new(backend),
                    lifecycle: SessionLifecycle::Ready,
                    cols,
                    rows,
                    exec_connection: Some(connection),
                })
            }
        };

        self.register(Arc::new(session), internal_rx, sink_tx).await?;
        Ok(SessionHandle { id, events: sink_rx })
    }

    /// Spawn a local shell on a PTY.
    pub async fn create_local_shell(
        self: &Arc<Self>,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> MuxResult<SessionHandle> {
        let config = self.context.config();
        let cols = cols.unwrap_or(config.pty.cols);
        let rows = rows.unwrap_or(config.pty.rows);
        validate_geometry(cols, rows)?;

        let id = format!("local-{}", Uuid::new_v4().simple());
        let shell = pty::local_shell(&config.pty.local_shell);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let backend = PtyBackend::spawn_local(LocalPtyParams {
            session_id: &id,
            shell: &shell,
            geometry: PtyGeometry {
                term: config.pty.term.clone(),
                cols,
                rows,
            },
            events: internal_tx,
        })?;
        let session = Session::new(SessionInit {
            id: id.clone(),
            kind: SessionKind::Local,
            target: None,
            backend: Box::new(backend),
            lifecycle: SessionLifecycle::Authenticating,
            cols,
            rows,
            exec_connection: None,
        });

        self.register(Arc::new(session), internal_rx, sink_tx).await?;
        Ok(SessionHandle { id, events: sink_rx })
    }

    async fn register(
        self: &Arc<Self>,
        session: Arc<Session>,
        internal: mpsc::UnboundedReceiver<SessionEvent>,
        sink: mpsc::UnboundedSender<SessionEvent>,
    ) -> MuxResult<()> {
        {
            let mut sessions = self.sessions.write().await;
            let taken = sessions
                .get(&session.id)
                .is_some_and(|existing| !existing.lifecycle().is_terminal());
            if !taken {
                sessions.insert(session.id.clone(), session.clone());
            }
            drop(sessions);
            if taken {
                let _ = session.close().await;
                return Err(ApiError::new(ErrorCode::AlreadyExists, "Session already active")
                    .with_details(session.id.clone())
                    .into());
            }
        }
        self.spawn_event_pump(session, internal, sink);
        Ok(())
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut internal: mpsc::UnboundedReceiver<SessionEvent>,
        sink: mpsc::UnboundedSender<SessionEvent>,
    ) {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = internal.recv().await {
                let closed = matches!(event, SessionEvent::Closed { .. });
                match &event {
                    SessionEvent::Data(bytes) => {
                        session
                            .bytes_in
                            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
                    }
                    SessionEvent::Ready => session.mark_ready(),
                    SessionEvent::Closed { exit_code } => session.mark_exited(*exit_code),
                }
                let _ = sink.send(event);
                if closed {
                    tracing::info!(session_id = %session.id, lifecycle = ?session.lifecycle(), "Session closed");
                    if let Some(registry) = registry.upgrade() {
                        registry.forget(&session).await;
                    }
                    break;
                }
            }
        });
    }

    async fn forget(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&session.id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.id);
        }
    }

    pub async fn get_session(&self, session_id: &str) -> MuxResult<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                ApiError::new(ErrorCode::NotFound, "Session not found")
                    .with_details(session_id.to_string())
                    .into()
            })
    }

    pub async fn write(&self, session_id: &str, data: &[u8]) -> MuxResult<usize> {
        let session = self.get_session(session_id).await?;
        session.write(data).await
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> MuxResult<()> {
        validate_geometry(cols, rows)?;
        let session = self.get_session(session_id).await?;
        session.resize(cols, rows).await
    }

    /// Tear down a session. Unknown or already closed ids are not an error.
    pub async fn disconnect(&self, session_id: &str) -> MuxResult<()> {
        let session = self.sessions.write().await.remove(session_id);
        let Some(session) = session else {
            return Ok(());
        };
        tracing::info!(session_id = %session_id, "Disconnecting session");
        session.close().await
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|session| !session.lifecycle().is_terminal())
    }

    /// Run a command next to the shell. PTY sessions get a lazily opened
    /// protocol connection with the same credentials.
    pub async fn execute(&self, session_id: &str, command: &str) -> MuxResult<ExecOutput> {
        let connection = self.exec_connection(session_id).await?;
        let output = connection.execute(command).await?;
        if !output.success() {
            return Err(ApiError::new(ErrorCode::CommandFailed, "Command exited with an error")
                .with_details(format!(
                    "exit status {}: {}",
                    output.exit_status.unwrap_or_default(),
                    output.stderr_lossy().trim()
                ))
                .into());
        }
        Ok(output)
    }

    /// Like [`execute`](Self::execute), but on a PTY with every chunk sent to
    /// `sink` as it arrives. The exit code is reported, not turned into an
    /// error.
    pub async fn execute_stream(
        &self,
        session_id: &str,
        command: &str,
        sink: mpsc::UnboundedSender<ExecChunk>,
    ) -> MuxResult<ExecStatus> {
        let connection = self.exec_connection(session_id).await?;
        let status = connection.execute_stream(command, sink).await?;
        tracing::debug!(session_id, exit_code = ?status.exit_code, "Streamed command finished");
        Ok(status)
    }

    async fn exec_connection(&self, session_id: &str) -> MuxResult<Arc<dyn Connection>> {
        let session = self.get_session(session_id).await?;
        let Some(target) = session.target.as_ref() else {
            return Err(ApiError::new(
                ErrorCode::Unsupported,
                "Command execution needs a remote session",
            )
            .into());
        };

        let mut slot = session.exec_connection.lock().await;
        match slot.as_ref() {
            Some(connection) if !connection.is_closed() => Ok(connection.clone()),
            _ => {
                let connection = self.context.connect(target).await?;
                *slot = Some(connection.clone());
                Ok(connection)
            }
        }
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<SessionSummary> = sessions.values().map(|s| s.summary()).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| !session.lifecycle().is_terminal())
            .count()
    }

    /// Disconnect everything; individual failures are logged and skipped.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.disconnect(&id).await {
                tracing::warn!(session_id = %id, error = %err, "Failed to close session");
            }
        }
    }
}

fn auth_plan(auth: &AuthMaterial) -> AuthPlan {
    match auth {
        AuthMaterial::Password { password } => AuthPlan::Password(password.clone()),
        AuthMaterial::PrivateKey { passphrase, .. } => AuthPlan::PrivateKey {
            passphrase: passphrase.clone().filter(|p| !p.is_empty()),
        },
    }
}

fn validate_request(request: &ConnectRequest) -> MuxResult<()> {
    let target = &request.target;
    if target.host.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "host is required").into());
    }
    if target.username.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "username is required").into());
    }
    if target.port == 0 {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "port must be non-zero").into());
    }
    if let Some((name, _)) = request.env.iter().find(|(name, _)| !is_valid_env_name(name)) {
        return Err(
            ApiError::new(ErrorCode::InvalidArgument, "Invalid environment variable name")
                .with_details(name.clone())
                .into(),
        );
    }
    validate_geometry(
        request.cols.unwrap_or(1),
        request.rows.unwrap_or(1),
    )
}

fn validate_geometry(cols: u16, rows: u16) -> MuxResult<()> {
    if cols == 0 || rows == 0 {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "cols and rows must be non-zero").into());
    }
    Ok(())
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
