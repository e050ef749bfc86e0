use clap::Parser;
use sshmux::config::{
    self, Cli, Command, ExecArgs, ForwardArgs, KnockArgs, ShellArgs, TargetArgs,
};
use sshmux::context::RuntimeContext;
use sshmux::error::{ApiError, ErrorCode, MuxResult};
use sshmux::knock;
use sshmux::session::{ConnectRequest, SessionEvent, SessionHandle, SessionRegistry};
use sshmux::transport::native::RusshTransport;
use sshmux::transport::{AuthMaterial, Connection, ExecChunk, ExecStatus, SshTarget};
use sshmux::tunnel::{self, TunnelManager, TunnelSpec};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = config::Config::load(&cli.global)?;
    init_logging(&config.logging);

    let context = RuntimeContext::new(config, Arc::new(RusshTransport::new()))?;
    let result = match cli.command {
        Command::Shell(args) => run_shell(context, args).await,
        Command::Local => run_local(context).await,
        Command::Exec(args) => run_exec(context, args).await,
        Command::Forward(args) => run_forward(context, args).await.map(|()| 0),
        Command::Knock(args) => run_knock(context, args).await.map(|()| 0),
    };

    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sshmux: {err}");
            std::process::exit(1);
        }
    }
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_shell(context: Arc<RuntimeContext>, args: ShellArgs) -> MuxResult<i32> {
    let mut request = ConnectRequest::new(build_target(&args.target)?);
    request.transport = args.transport;
    request.env = parse_env_pairs(&args.env)?;
    if let Some((cols, rows)) = terminal::size() {
        request.cols = Some(cols);
        request.rows = Some(rows);
    }

    let registry = SessionRegistry::new(context);
    let handle = registry.connect(request).await?;
    attach(registry, handle).await
}

async fn run_local(context: Arc<RuntimeContext>) -> MuxResult<i32> {
    let size = terminal::size();
    let registry = SessionRegistry::new(context);
    let handle = registry
        .create_local_shell(size.map(|(cols, _)| cols), size.map(|(_, rows)| rows))
        .await?;
    attach(registry, handle).await
}

/// Relay the terminal to a session until it closes.
async fn attach(registry: Arc<SessionRegistry>, mut handle: SessionHandle) -> MuxResult<i32> {
    let _raw = terminal::RawMode::enable();
    let session_id = handle.id.clone();

    let input_registry = registry.clone();
    let input_id = session_id.clone();
    let input = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(err) = input_registry.write(&input_id, &buf[..n]).await {
                        tracing::debug!(error = %err, "Input dropped");
                        break;
                    }
                }
            }
        }
    });

    #[cfg(unix)]
    let resize = {
        let resize_registry = registry.clone();
        let resize_id = session_id.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let Ok(mut winch) = signal(SignalKind::window_change()) else {
                return;
            };
            while winch.recv().await.is_some() {
                if let Some((cols, rows)) = terminal::size() {
                    let _ = resize_registry.resize(&resize_id, cols, rows).await;
                }
            }
        })
    };

    let mut stdout = tokio::io::stdout();
    let mut exit_code = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            SessionEvent::Data(bytes) => {
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
            SessionEvent::Ready => tracing::debug!(session_id = %session_id, "Session ready"),
            SessionEvent::Closed { exit_code: code } => {
                exit_code = code;
                break;
            }
        }
    }

    input.abort();
    #[cfg(unix)]
    resize.abort();
    registry.close_all().await;
    Ok(exit_code.map(|code| code as i32).unwrap_or(0))
}

async fn run_exec(context: Arc<RuntimeContext>, args: ExecArgs) -> MuxResult<i32> {
    let target = build_target(&args.target)?;
    let command = args.command.join(" ");
    let connection = context.connect(&target).await?;
    if args.stream {
        let status = stream_command(connection.as_ref(), &command).await;
        let _ = connection.close().await;
        return Ok(status?.exit_code.map(|code| code as i32).unwrap_or(0));
    }
    let output = connection.execute(&command).await;
    let _ = connection.close().await;
    let output = output?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output.stdout).await?;
    stdout.flush().await?;
    let mut stderr = tokio::io::stderr();
    stderr.write_all(&output.stderr).await?;
    stderr.flush().await?;
    Ok(output.exit_status.map(|code| code as i32).unwrap_or(0))
}

async fn stream_command(connection: &dyn Connection, command: &str) -> MuxResult<ExecStatus> {
    let (sink, mut chunks) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        while let Some(chunk) = chunks.recv().await {
            let written = match chunk {
                ExecChunk::Stdout(data) => stdout.write_all(&data).await.and(stdout.flush().await),
                ExecChunk::Stderr(data) => stderr.write_all(&data).await.and(stderr.flush().await),
            };
            if written.is_err() {
                break;
            }
        }
    });
    let status = connection.execute_stream(command, sink).await;
    let _ = printer.await;
    status
}

async fn run_forward(context: Arc<RuntimeContext>, args: ForwardArgs) -> MuxResult<()> {
    let ssh = build_target(&args.target)?;
    let manager = TunnelManager::new(context);
    let mut events = manager.subscribe();

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(snapshot) => match serde_json::to_string(&snapshot) {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::warn!(error = %err, "Snapshot encoding failed"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Status events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let created = if let Some(value) = &args.local {
        let endpoints = tunnel::parse_forward(value)?;
        let spec = forward_spec(&args, ssh, endpoints.bind_host, endpoints.bind_port, endpoints.target_host, endpoints.target_port);
        manager.create_local_forward(spec).await
    } else if let Some(value) = &args.remote {
        let endpoints = tunnel::parse_forward(value)?;
        let spec = forward_spec(&args, ssh, endpoints.target_host, endpoints.target_port, endpoints.bind_host, endpoints.bind_port);
        manager.create_remote_forward(spec).await
    } else if let Some(value) = &args.dynamic {
        let (host, port) = tunnel::parse_bind(value)?;
        let spec = forward_spec(&args, ssh, host, port, String::new(), 0);
        manager.create_dynamic_forward(spec).await
    } else {
        Err(ApiError::new(ErrorCode::InvalidArgument, "One of --local, --remote or --dynamic is required").into())
    };

    if let Err(err) = created {
        printer.abort();
        return Err(err);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, stopping tunnels");
    manager.close_all().await;
    printer.abort();
    Ok(())
}

fn forward_spec(
    args: &ForwardArgs,
    ssh: SshTarget,
    local_host: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
) -> TunnelSpec {
    let id = args
        .id
        .clone()
        .unwrap_or_else(|| format!("{}:{}", local_host, local_port));
    TunnelSpec {
        name: args.name.clone().unwrap_or_else(|| id.clone()),
        id,
        local_host,
        local_port,
        remote_host,
        remote_port,
        ssh,
    }
}

async fn run_knock(context: Arc<RuntimeContext>, args: KnockArgs) -> MuxResult<()> {
    if let Some(len) = args.generate {
        let ports = knock::generate_knock_sequence(len)?;
        let joined: Vec<String> = ports.iter().map(u16::to_string).collect();
        println!("{}", joined.join(","));
        return Ok(());
    }

    let (Some(host), Some(sequence)) = (args.host, args.sequence) else {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "--host and --sequence are required").into());
    };
    let ports = knock::parse_knock_sequence(&sequence)?;
    knock::knock(&host, &ports, &context.config().knock).await;
    tracing::info!(host = %host, ports = ?ports, "Knock sequence sent");
    Ok(())
}

fn build_target(args: &TargetArgs) -> MuxResult<SshTarget> {
    let auth = match &args.identity {
        Some(path) => {
            let pem = std::fs::read_to_string(path).map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to read identity file")
                    .with_details(format!("{}: {err}", path.display()))
            })?;
            let passphrase = args
                .passphrase_env
                .as_deref()
                .map(read_secret_env)
                .transpose()?;
            AuthMaterial::private_key(pem, passphrase)
        }
        None => {
            let Some(var) = args.password_env.as_deref() else {
                return Err(ApiError::new(
                    ErrorCode::InvalidArgument,
                    "Either --identity or --password-env is required",
                )
                .into());
            };
            AuthMaterial::password(read_secret_env(var)?)
        }
    };

    let mut target = SshTarget::new(&args.host, args.port, &args.user, auth);
    if let Some(sequence) = &args.knock {
        target.knock_sequence = knock::parse_knock_sequence(sequence)?;
    }
    target.legacy_algorithms = args.legacy;
    Ok(target)
}

fn read_secret_env(name: &str) -> MuxResult<String> {
    std::env::var(name).map_err(|_| {
        ApiError::new(ErrorCode::InvalidArgument, "Secret environment variable is not set")
            .with_details(name.to_string())
            .into()
    })
}

fn parse_env_pairs(values: &[String]) -> MuxResult<Vec<(String, String)>> {
    values
        .iter()
        .map(|value| match value.split_once('=') {
            Some((name, val)) => Ok((name.to_string(), val.to_string())),
            None => Err(ApiError::new(ErrorCode::InvalidArgument, "Expected KEY=VALUE")
                .with_details(value.clone())
                .into()),
        })
        .collect()
}

#[cfg(unix)]
mod terminal {
    /// Columns and rows of the controlling terminal.
    pub fn size() -> Option<(u16, u16)> {
        let mut winsize: libc::winsize = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) };
        (rc == 0 && winsize.ws_col > 0 && winsize.ws_row > 0).then_some((winsize.ws_col, winsize.ws_row))
    }

    /// Puts stdin into raw mode and restores it on drop.
    pub struct RawMode {
        original: Option<libc::termios>,
    }

    impl RawMode {
        pub fn enable() -> Self {
            let mut original: libc::termios = unsafe { std::mem::zeroed() };
            if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1
                || unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut original) } != 0
            {
                return Self { original: None };
            }
            let mut raw = original;
            unsafe { libc::cfmakeraw(&mut raw) };
            if unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) } != 0 {
                return Self { original: None };
            }
            Self {
                original: Some(original),
            }
        }
    }

    impl Drop for RawMode {
        fn drop(&mut self) {
            if let Some(original) = &self.original {
                unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, original) };
            }
        }
    }
}

#[cfg(not(unix))]
mod terminal {
    pub fn size() -> Option<(u16, u16)> {
        None
    }

    pub struct RawMode;

    impl RawMode {
        pub fn enable() -> Self {
            Self
        }
    }
}
