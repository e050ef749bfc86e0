#![allow(dead_code)]

use async_trait::async_trait;
use sshmux::config::Config;
use sshmux::context::RuntimeContext;
use sshmux::error::{ApiError, ErrorCode, MuxResult};
use sshmux::transport::{
    AuthMaterial, ChannelStream, ConnectOptions, Connection, ExecChunk, ExecOutput, ExecStatus, InboundConnection,
    ShellChannel, ShellControl, ShellOutput, ShellRequest, SshTarget, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::mpsc;

const CHANNEL_BUFFER: usize = 64 * 1024;
pub const UNREACHABLE_HOST: &str = "unreachable.invalid";

/// What a scripted server says and does.
#[derive(Clone, Default)]
pub struct Script {
    pub greeting: Option<String>,
    pub banner: Option<String>,
    pub motd_command: String,
    pub motd: Option<String>,
    pub shell_output: Vec<Vec<u8>>,
    pub negotiation_needs_legacy: bool,
}

/// The far end of a forwarded channel, as the server would see it.
pub struct RemoteEnd {
    pub src_addr: String,
    pub src_port: u16,
    pub host: String,
    pub port: u16,
    pub stream: DuplexStream,
}

pub struct MockTransport {
    script: Script,
    pub attempts: Mutex<Vec<ConnectOptions>>,
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            attempts: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn last_connection(&self) -> Arc<MockConnection> {
        self.connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection was opened")
    }

    pub fn attempts(&self) -> Vec<bool> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|options| options.legacy_algorithms)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, options: &ConnectOptions) -> MuxResult<Arc<dyn Connection>> {
        self.attempts.lock().unwrap().push(options.clone());
        if self.script.negotiation_needs_legacy && !options.legacy_algorithms {
            return Err(ApiError::new(ErrorCode::NegotiationFailed, "no matching key exchange").into());
        }
        let connection = Arc::new(MockConnection::new(self.script.clone()));
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

pub struct MockConnection {
    script: Script,
    closed: AtomicBool,
    remote_tx: mpsc::UnboundedSender<RemoteEnd>,
    remote_rx: Mutex<Option<mpsc::UnboundedReceiver<RemoteEnd>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundConnection>>>,
    pub forward_in_requests: Mutex<Vec<(String, u16)>>,
    pub executed: Mutex<Vec<String>>,
    pub shell: Mutex<Option<Arc<MockShell>>>,
}

impl MockConnection {
    fn new(script: Script) -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            script,
            closed: AtomicBool::new(false),
            remote_tx,
            remote_rx: Mutex::new(Some(remote_rx)),
            inbound: Mutex::new(None),
            forward_in_requests: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            shell: Mutex::new(None),
        }
    }

    /// Forwarded channels opened through this connection, in order.
    pub fn remote_ends(&self) -> mpsc::UnboundedReceiver<RemoteEnd> {
        self.remote_rx.lock().unwrap().take().expect("remote ends already taken")
    }

    /// Simulate the server accepting a connection on a remote forward.
    pub fn push_inbound(&self) -> DuplexStream {
        let (near, far) = duplex(CHANNEL_BUFFER);
        let sender = self.inbound.lock().unwrap().clone().expect("no remote listener");
        sender
            .send(InboundConnection {
                connected_address: "0.0.0.0".to_string(),
                connected_port: 2222,
                originator_address: "203.0.113.9".to_string(),
                originator_port: 50000,
                stream: Box::new(near),
            })
            .expect("remote listener gone");
        far
    }

    /// Simulate the link dying underneath.
    pub fn drop_link(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn greeting(&self) -> Option<String> {
        self.script.greeting.clone()
    }

    fn banner(&self) -> Option<String> {
        self.script.banner.clone()
    }

    async fn execute(&self, command: &str) -> MuxResult<ExecOutput> {
        self.executed.lock().unwrap().push(command.to_string());
        if command == self.script.motd_command {
            // A slow MOTD lets the shell prompt arrive first.
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Ok(ExecOutput {
                stdout: self.script.motd.clone().unwrap_or_default().into_bytes(),
                stderr: Vec::new(),
                exit_status: Some(0),
            });
        }
        if command == "false" {
            return Ok(ExecOutput {
                stdout: Vec::new(),
                stderr: b"boom\n".to_vec(),
                exit_status: Some(1),
            });
        }
        Ok(ExecOutput {
            stdout: format!("ran {command}\n").into_bytes(),
            stderr: Vec::new(),
            exit_status: Some(0),
        })
    }

    async fn execute_stream(
        &self,
        command: &str,
        sink: mpsc::UnboundedSender<ExecChunk>,
    ) -> MuxResult<ExecStatus> {
        self.executed.lock().unwrap().push(command.to_string());
        if command == "false" {
            let _ = sink.send(ExecChunk::Stderr(b"boom\r\n".to_vec()));
            return Ok(ExecStatus::from_exit(Some(1)));
        }
        for line in 1..=3 {
            let _ = sink.send(ExecChunk::Stdout(format!("{command} {line}\r\n").into_bytes()));
            tokio::task::yield_now().await;
        }
        Ok(ExecStatus::from_exit(Some(0)))
    }

    async fn open_shell(&self, request: ShellRequest) -> MuxResult<ShellChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in &self.script.shell_output {
            let _ = tx.send(ShellOutput::Data(chunk.clone()));
        }
        let shell = Arc::new(MockShell {
            request,
            output: tx,
            written: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
        });
        *self.shell.lock().unwrap() = Some(shell.clone());
        Ok(ShellChannel {
            output: rx,
            control: shell,
        })
    }

    async fn forward_out(
        &self,
        src_addr: &str,
        src_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> MuxResult<ChannelStream> {
        if dst_host == UNREACHABLE_HOST {
            return Err(ApiError::new(ErrorCode::ChannelFailed, "Connection refused").into());
        }
        let (near, far) = duplex(CHANNEL_BUFFER);
        let _ = self.remote_tx.send(RemoteEnd {
            src_addr: src_addr.to_string(),
            src_port,
            host: dst_host.to_string(),
            port: dst_port,
            stream: far,
        });
        Ok(Box::new(near))
    }

    async fn forward_in(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> MuxResult<mpsc::UnboundedReceiver<InboundConnection>> {
        self.forward_in_requests
            .lock()
            .unwrap()
            .push((bind_host.to_string(), bind_port));
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn close(&self) -> MuxResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.lock().unwrap().take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockShell {
    pub request: ShellRequest,
    output: mpsc::UnboundedSender<ShellOutput>,
    pub written: Mutex<Vec<u8>>,
    pub sizes: Mutex<Vec<(u16, u16)>>,
}

impl MockShell {
    pub fn emit(&self, data: &[u8]) {
        let _ = self.output.send(ShellOutput::Data(data.to_vec()));
    }

    pub fn hang_up(&self) {
        let _ = self.output.send(ShellOutput::Closed);
    }
}

#[async_trait]
impl ShellControl for MockShell {
    async fn write(&self, data: &[u8]) -> MuxResult<()> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        self.sizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn close(&self) -> MuxResult<()> {
        let _ = self.output.send(ShellOutput::Closed);
        Ok(())
    }
}

pub fn context_with(transport: Arc<MockTransport>, config: Config) -> Arc<RuntimeContext> {
    RuntimeContext::new(config, transport).expect("context")
}

pub fn target() -> SshTarget {
    SshTarget::new("db.example", 22, "alice", AuthMaterial::password("s3cret"))
}
