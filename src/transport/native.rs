//! [`Transport`] implementation backed by `russh`.

use super::{
    ChannelStream, Connection, ConnectOptions, ExecChunk, ExecOutput, ExecStatus, InboundConnection, ShellChannel,
    ShellControl, ShellOutput, ShellRequest, Transport, AuthMaterial, is_negotiation_error,
    normalize_private_key,
};
use crate::error::{ApiError, ErrorCode, MuxError, MuxResult};
use async_trait::async_trait;
use russh::client::{self, Handle, Msg, Session};
use russh::keys::key;
use russh::{Channel, ChannelMsg, Disconnect, Preferred};
use std::borrow::Cow;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};

const STREAM_TERM: &str = "xterm-256color";
const STREAM_COLS: u32 = 80;
const STREAM_ROWS: u32 = 24;

#[derive(Debug, Default, Clone, Copy)]
pub struct RusshTransport;

impl RusshTransport {
    pub fn new() -> Self {
        Self
    }
}

struct ClientHandler {
    banner: Arc<StdMutex<Option<String>>>,
    inbound: mpsc::UnboundedSender<InboundConnection>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host key pinning belongs to the caller's known-hosts store.
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut slot = self.banner.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert_with(String::new).push_str(banner);
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let inbound = InboundConnection {
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
            stream: Box::new(channel.into_stream()),
        };
        if self.inbound.send(inbound).is_err() {
            tracing::debug!(
                connected_address,
                connected_port,
                "Dropping forwarded connection with no listener"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(&self, options: &ConnectOptions) -> MuxResult<Arc<dyn Connection>> {
        let banner = Arc::new(StdMutex::new(None));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let handler = ClientHandler {
            banner: banner.clone(),
            inbound: inbound_tx,
        };

        let mut config = client::Config {
            keepalive_interval: Some(options.keepalive_interval),
            keepalive_max: options.keepalive_count_max,
            ..Default::default()
        };
        if options.legacy_algorithms {
            config.preferred = legacy_preferred();
        }

        let address = (options.host.as_str(), options.port);
        tracing::info!(
            host = %options.host,
            port = options.port,
            username = %options.username,
            auth = options.auth.kind(),
            legacy = options.legacy_algorithms,
            "Connecting"
        );

        let handshake = async {
            let mut handle = client::connect(Arc::new(config), address, handler)
                .await
                .map_err(connect_error)?;
            authenticate(&mut handle, options).await?;
            Ok::<_, MuxError>(handle)
        };
        let handle = tokio::time::timeout(options.ready_timeout, handshake)
            .await
            .map_err(|_| {
                ApiError::new(ErrorCode::ConnectTimeout, "SSH connection timed out")
                    .with_details(format!("{}:{}", options.host, options.port))
            })??;

        let banner = banner.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(Arc::new(RusshConnection {
            handle: Mutex::new(handle),
            banner,
            inbound: StdMutex::new(Some(inbound_rx)),
            closed: AtomicBool::new(false),
        }))
    }
}

async fn authenticate(handle: &mut Handle<ClientHandler>, options: &ConnectOptions) -> MuxResult<()> {
    let accepted = match &options.auth {
        AuthMaterial::Password { password } => handle
            .authenticate_password(&options.username, password)
            .await
            .map_err(|err| ssh_error(ErrorCode::AuthFailed, "Password authentication error", err))?,
        AuthMaterial::PrivateKey { pem, passphrase } => {
            let pem = normalize_private_key(pem);
            let key = russh_keys::decode_secret_key(&pem, passphrase.as_deref())
                .map_err(|err| ssh_error(ErrorCode::AuthFailed, "Failed to decode private key", err))?;
            handle
                .authenticate_publickey(&options.username, Arc::new(key))
                .await
                .map_err(|err| ssh_error(ErrorCode::AuthFailed, "Public key authentication error", err))?
        }
    };
    if !accepted {
        return Err(ApiError::new(ErrorCode::AuthFailed, "Authentication rejected by server")
            .with_details(options.username.clone())
            .into());
    }
    Ok(())
}

/// Default preference list extended with SHA-1 Diffie-Hellman groups.
fn legacy_preferred() -> Preferred {
    let defaults = Preferred::default();
    let mut kex = defaults.kex.to_vec();
    for name in [russh::kex::DH_G14_SHA1, russh::kex::DH_G1_SHA1] {
        if !kex.contains(&name) {
            kex.push(name);
        }
    }
    Preferred {
        kex: Cow::Owned(kex),
        ..defaults
    }
}

fn connect_error(err: russh::Error) -> MuxError {
    let message = err.to_string();
    let code = if is_negotiation_error(&message) || is_negotiation_error(&format!("{err:?}")) {
        ErrorCode::NegotiationFailed
    } else {
        ErrorCode::ConnectFailed
    };
    ApiError::new(code, "SSH handshake failed")
        .with_details(message)
        .into()
}

fn ssh_error(code: ErrorCode, message: &str, err: impl Display) -> MuxError {
    ApiError::new(code, message).with_details(err.to_string()).into()
}

pub struct RusshConnection {
    handle: Mutex<Handle<ClientHandler>>,
    banner: Option<String>,
    inbound: StdMutex<Option<mpsc::UnboundedReceiver<InboundConnection>>>,
    closed: AtomicBool,
}

impl RusshConnection {
    async fn open_session(&self) -> MuxResult<Channel<Msg>> {
        self.handle
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|err| ssh_error(ErrorCode::ChannelFailed, "Failed to open session channel", err))
    }
}

#[async_trait]
impl Connection for RusshConnection {
    fn greeting(&self) -> Option<String> {
        None
    }

    fn banner(&self) -> Option<String> {
        self.banner.clone()
    }

    async fn execute(&self, command: &str) -> MuxResult<ExecOutput> {
        let mut channel = self.open_session().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|err| ssh_error(ErrorCode::ChannelFailed, "Failed to execute command", err))?;

        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok(output)
    }

    async fn execute_stream(
        &self,
        command: &str,
        sink: mpsc::UnboundedSender<ExecChunk>,
    ) -> MuxResult<ExecStatus> {
        let mut channel = self.open_session().await?;
        channel
            .request_pty(true, STREAM_TERM, STREAM_COLS, STREAM_ROWS, 0, 0, &[])
            .await
            .map_err(|err| ssh_error(ErrorCode::ChannelFailed, "Failed to request PTY", err))?;
        channel
            .exec(true, command)
            .await
            .map_err(|err| ssh_error(ErrorCode::ChannelFailed, "Failed to execute command", err))?;

        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            // A caller that stopped listening still waits for the exit code.
            match msg {
                ChannelMsg::Data { data } => {
                    let _ = sink.send(ExecChunk::Stdout(data.to_vec()));
                }
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    let _ = sink.send(ExecChunk::Stderr(data.to_vec()));
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok(ExecStatus::from_exit(exit_code))
    }

    async fn open_shell(&self, request: ShellRequest) -> MuxResult<ShellChannel> {
        let mut channel = self.open_session().await?;
        for (name, value) in &request.env {
            // Servers commonly refuse env requests; the shell still opens.
            if let Err(err) = channel.set_env(false, name.as_str(), value.as_str()).await {
                tracing::debug!(variable = %name, error = %err, "Env request failed");
            }
        }
        channel
            .request_pty(
                true,
                &request.term,
                u32::from(request.cols),
                u32::from(request.rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|err| ssh_error(ErrorCode::ChannelFailed, "Failed to request PTY", err))?;
        channel
            .request_shell(true)
            .await
            .map_err(|err| ssh_error(ErrorCode::ChannelFailed, "Failed to request shell", err))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_shell(channel, output_tx, command_rx));

        Ok(ShellChannel {
            output: output_rx,
            control: Arc::new(NativeShellControl {
                commands: command_tx,
            }),
        })
    }

    async fn forward_out(
        &self,
        src_addr: &str,
        src_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> MuxResult<ChannelStream> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(dst_host, u32::from(dst_port), src_addr, u32::from(src_port))
            .await
            .map_err(|err| {
                ssh_error(
                    ErrorCode::ChannelFailed,
                    &format!("Failed to open channel to {dst_host}:{dst_port}"),
                    err,
                )
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn forward_in(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> MuxResult<mpsc::UnboundedReceiver<InboundConnection>> {
        let receiver = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::Unsupported,
                    "Connection already carries a remote forward",
                )
            })?;
        let _bound = self
            .handle
            .lock()
            .await
            .tcpip_forward(bind_host, u32::from(bind_port))
            .await
            .map_err(|err| {
                ssh_error(
                    ErrorCode::BindFailed,
                    &format!("Server refused to listen on {bind_host}:{bind_port}"),
                    err,
                )
            })?;
        Ok(receiver)
    }

    async fn close(&self) -> MuxResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self.handle.lock().await;
        if let Err(err) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(error = %err, "Disconnect failed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        self.handle
            .try_lock()
            .map(|handle| handle.is_closed())
            .unwrap_or(false)
    }
}

enum ShellCommand {
    Data(Vec<u8>),
    Resize(u16, u16),
    Close,
}

struct NativeShellControl {
    commands: mpsc::UnboundedSender<ShellCommand>,
}

impl NativeShellControl {
    fn send(&self, command: ShellCommand) -> MuxResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ApiError::new(ErrorCode::RemoteClosed, "Shell channel closed").into())
    }
}

#[async_trait]
impl ShellControl for NativeShellControl {
    async fn write(&self, data: &[u8]) -> MuxResult<()> {
        self.send(ShellCommand::Data(data.to_vec()))
    }

    async fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        self.send(ShellCommand::Resize(cols, rows))
    }

    async fn close(&self) -> MuxResult<()> {
        // The pump may already be gone when the remote side closed first.
        let _ = self.commands.send(ShellCommand::Close);
        Ok(())
    }
}

async fn pump_shell(
    mut channel: Channel<Msg>,
    output: mpsc::UnboundedSender<ShellOutput>,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    let _ = output.send(ShellOutput::Data(data.to_vec()));
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            command = commands.recv() => match command {
                Some(ShellCommand::Data(bytes)) => {
                    if let Err(err) = channel.data(&bytes[..]).await {
                        tracing::debug!(error = %err, "Shell write failed");
                        break;
                    }
                }
                Some(ShellCommand::Resize(cols, rows)) => {
                    if let Err(err) = channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await
                    {
                        tracing::debug!(error = %err, "Window change failed");
                    }
                }
                Some(ShellCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
        }
    }
    let _ = output.send(ShellOutput::Closed);
}
