//! The SSH transport contract the session and tunnel engines are written
//! against.
//!
//! Key exchange, ciphers and channel multiplexing live behind [`Transport`]
//! and [`Connection`]; everything above this module only sees byte streams,
//! shell channels and command results.

pub mod native;

use crate::error::MuxResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Credentials presented to the server.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMaterial {
    Password {
        password: String,
    },
    PrivateKey {
        pem: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl AuthMaterial {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn private_key(pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::PrivateKey {
            pem: pem.into(),
            passphrase,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthMaterial::Password { .. } => "password",
            AuthMaterial::PrivateKey { .. } => "private_key",
        }
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMaterial::Password { .. } => f.write_str("Password(<redacted>)"),
            AuthMaterial::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("pem", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Where and as whom to connect, plus the pre-connect knock sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMaterial,
    #[serde(default)]
    pub knock_sequence: Vec<u16>,
    #[serde(default)]
    pub legacy_algorithms: bool,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMaterial) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
            knock_sequence: Vec::new(),
            legacy_algorithms: false,
        }
    }

    /// `username@host:port`, the identity of a remote session.
    pub fn session_id(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMaterial,
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count_max: usize,
    pub legacy_algorithms: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        matches!(self.exit_status, None | Some(0))
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// One piece of output from a streamed command, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// How a streamed command ended. A non-zero exit is reported here, not as
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecStatus {
    pub success: bool,
    pub exit_code: Option<u32>,
}

impl ExecStatus {
    pub fn from_exit(exit_code: Option<u32>) -> Self {
        Self {
            success: matches!(exit_code, None | Some(0)),
            exit_code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Data(Vec<u8>),
    Closed,
}

#[async_trait]
pub trait ShellControl: Send + Sync {
    async fn write(&self, data: &[u8]) -> MuxResult<()>;
    async fn resize(&self, cols: u16, rows: u16) -> MuxResult<()>;
    async fn close(&self) -> MuxResult<()>;
}

/// An interactive shell channel: its output stream and its control half.
pub struct ShellChannel {
    pub output: mpsc::UnboundedReceiver<ShellOutput>,
    pub control: Arc<dyn ShellControl>,
}

pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A forwarded channel seen as a plain duplex byte stream.
pub type ChannelStream = Box<dyn ByteStream>;

/// A connection the server opened toward us for a remote forward.
pub struct InboundConnection {
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
    pub stream: ChannelStream,
}

impl fmt::Debug for InboundConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundConnection")
            .field("connected_address", &self.connected_address)
            .field("connected_port", &self.connected_port)
            .field("originator_address", &self.originator_address)
            .field("originator_port", &self.originator_port)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate; resolves once the connection is ready.
    async fn connect(&self, options: &ConnectOptions) -> MuxResult<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Server identification line, when the library exposes it.
    fn greeting(&self) -> Option<String>;

    /// Pre-authentication banner sent by the server.
    fn banner(&self) -> Option<String>;

    async fn execute(&self, command: &str) -> MuxResult<ExecOutput>;

    /// Run `command` on a PTY and hand every output chunk to `sink` as it
    /// arrives. Resolves when the remote side closes the channel.
    async fn execute_stream(
        &self,
        command: &str,
        sink: mpsc::UnboundedSender<ExecChunk>,
    ) -> MuxResult<ExecStatus>;

    async fn open_shell(&self, request: ShellRequest) -> MuxResult<ShellChannel>;

    async fn forward_out(
        &self,
        src_addr: &str,
        src_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> MuxResult<ChannelStream>;

    /// Ask the server to listen on `bind_host:bind_port`; every connection it
    /// accepts arrives on the returned receiver.
    async fn forward_in(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> MuxResult<mpsc::UnboundedReceiver<InboundConnection>>;

    async fn close(&self) -> MuxResult<()>;

    fn is_closed(&self) -> bool;

    /// Resolves when the connection has gone away for any reason.
    async fn wait_closed(&self) {
        while !self.is_closed() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// True when a connect failure looks like an algorithm negotiation mismatch,
/// which is worth one retry with the legacy algorithm set.
pub fn is_negotiation_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "bad key types",
        "no matching",
        "no common",
        "unable to negotiate",
        "algorithm",
        "kex",
        "cipher",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Normalise PEM text: LF line endings and exactly one trailing newline.
pub fn normalize_private_key(pem: &str) -> String {
    let mut normalized = pem.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed_len = normalized.trim_end_matches('\n').len();
    normalized.truncate(trimmed_len);
    normalized.push('\n');
    normalized
}
