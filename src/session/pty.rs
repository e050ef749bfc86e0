use crate::config::{HostKeyPolicy, SshConfig};
use crate::error::{ApiError, ErrorCode, MuxResult};
use crate::session::credential::{DriverAction, InjectionDriver};
use crate::session::{SessionBackend, SessionEvent, lock};
use crate::transport::{AuthMaterial, SshTarget, normalize_private_key};
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// `-o` options that re-enable SHA-1 key exchange, DSA/RSA host keys and CBC
/// ciphers for old servers.
pub const LEGACY_SSH_OPTIONS: [&str; 5] = [
    "KexAlgorithms=+diffie-hellman-group1-sha1,diffie-hellman-group14-sha1,diffie-hellman-group-exchange-sha1",
    "HostKeyAlgorithms=+ssh-rsa,ssh-dss",
    "Ciphers=+aes128-cbc,aes192-cbc,aes256-cbc,3des-cbc",
    "MACs=+hmac-sha1,hmac-md5",
    "PubkeyAcceptedAlgorithms=+ssh-rsa,ssh-dss",
];

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

#[derive(Debug, Clone)]
pub(super) struct PtyGeometry {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

pub(super) struct RemotePtyParams<'a> {
    pub session_id: &'a str,
    pub ssh_path: &'a Path,
    pub target: &'a SshTarget,
    pub env: &'a [(String, String)],
    pub ssh_config: &'a SshConfig,
    pub geometry: PtyGeometry,
    pub driver: InjectionDriver,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

pub(super) struct LocalPtyParams<'a> {
    pub session_id: &'a str,
    pub shell: &'a str,
    pub geometry: PtyGeometry,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Delayed jobs tied to one session, aborted together on disconnect.
#[derive(Default)]
pub(super) struct PendingTimers {
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl PendingTimers {
    fn schedule(&self, runtime: &Handle, delay: Duration, job: impl FnOnce() + Send + 'static) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tokio::task::spawn_blocking(job).await;
        });
        let mut handles = lock(&self.handles);
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    pub(super) fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        for handle in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }
}

/// A child process (system `ssh` or a local shell) running on a PTY.
pub struct PtyBackend {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: SharedChild,
    eof: Arc<AtomicBool>,
    timers: Arc<PendingTimers>,
    key_file: Arc<Mutex<Option<NamedTempFile>>>,
}

struct ReaderContext {
    session_id: String,
    runtime: Handle,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: SharedChild,
    eof: Arc<AtomicBool>,
    timers: Arc<PendingTimers>,
    key_file: Arc<Mutex<Option<NamedTempFile>>>,
    driver: Option<Arc<Mutex<InjectionDriver>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PtyBackend {
    pub(super) fn spawn_remote(params: RemotePtyParams<'_>) -> MuxResult<Self> {
        let key_file = match &params.target.auth {
            AuthMaterial::PrivateKey { pem, .. } => Some(write_temp_key(pem)?),
            AuthMaterial::Password { .. } => None,
        };

        let args = build_ssh_args(SshArgs {
            target: params.target,
            env: params.env,
            ssh_config: params.ssh_config,
            key_path: key_file.as_ref().map(|file| file.path()),
        });
        let mut cmd = CommandBuilder::new(params.ssh_path);
        cmd.env("TERM", &params.geometry.term);
        cmd.args(args);

        tracing::info!(
            session_id = %params.session_id,
            ssh = %params.ssh_path.display(),
            "Spawning ssh on PTY"
        );
        // On any error below the key file is dropped, which deletes it.
        Self::spawn(
            cmd,
            params.session_id,
            &params.geometry,
            Some(params.driver),
            params.events,
            key_file,
        )
    }

    pub(super) fn spawn_local(params: LocalPtyParams<'_>) -> MuxResult<Self> {
        let mut cmd = CommandBuilder::new(params.shell);
        cmd.env("TERM", &params.geometry.term);
        if let Some(home) = home_dir() {
            cmd.cwd(home);
        }
        tracing::info!(session_id = %params.session_id, shell = %params.shell, "Spawning local shell");
        Self::spawn(cmd, params.session_id, &params.geometry, None, params.events, None)
    }

    fn spawn(
        cmd: CommandBuilder,
        session_id: &str,
        geometry: &PtyGeometry,
        driver: Option<InjectionDriver>,
        events: mpsc::UnboundedSender<SessionEvent>,
        key_file: Option<NamedTempFile>,
    ) -> MuxResult<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            ApiError::new(ErrorCode::Unsupported, "PTY sessions need a tokio runtime")
                .with_details(err.to_string())
        })?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: geometry.rows,
                cols: geometry.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| {
                ApiError::new(ErrorCode::ConnectFailed, "Failed to allocate PTY")
                    .with_details(err.to_string())
            })?;

        let child = pair.slave.spawn_command(cmd).map_err(|err| {
            ApiError::new(ErrorCode::ConnectFailed, "Failed to spawn PTY process")
                .with_details(err.to_string())
        })?;
        // The child holds its own copy; ours would keep the master from seeing EOF.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to clone PTY reader")
                .with_details(err.to_string())
        })?;
        let writer = pair.master.take_writer().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to take PTY writer")
                .with_details(err.to_string())
        })?;

        let backend = Self {
            writer: Arc::new(Mutex::new(writer)),
            master: Arc::new(Mutex::new(pair.master)),
            child: Arc::new(Mutex::new(child)),
            eof: Arc::new(AtomicBool::new(false)),
            timers: Arc::new(PendingTimers::default()),
            key_file: Arc::new(Mutex::new(key_file)),
        };

        let context = ReaderContext {
            session_id: session_id.to_string(),
            runtime,
            writer: backend.writer.clone(),
            child: backend.child.clone(),
            eof: backend.eof.clone(),
            timers: backend.timers.clone(),
            key_file: backend.key_file.clone(),
            driver: driver.map(|driver| Arc::new(Mutex::new(driver))),
            events,
        };
        if context.driver.is_none() {
            let _ = context.events.send(SessionEvent::Ready);
        }
        thread::spawn(move || read_loop(reader, context));

        Ok(backend)
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, context: ReaderContext) {
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => handle_chunk(&context, &buffer[..n]),
            Err(err) => {
                // Linux reports EIO once the child side of the PTY is gone.
                tracing::debug!(session_id = %context.session_id, error = %err, "PTY read ended");
                break;
            }
        }
    }

    context.eof.store(true, Ordering::SeqCst);
    context.timers.cancel_all();
    let exit_code = wait_for_exit(&context.child);
    release_key_file(&context.key_file);
    tracing::info!(session_id = %context.session_id, exit_code = ?exit_code, "PTY process exited");
    let _ = context.events.send(SessionEvent::Closed { exit_code });
}

fn handle_chunk(context: &ReaderContext, chunk: &[u8]) {
    let Some(driver) = &context.driver else {
        let _ = context
            .events
            .send(SessionEvent::Data(Bytes::copy_from_slice(chunk)));
        return;
    };

    let actions = lock(driver).feed(chunk);
    for action in actions {
        match action {
            DriverAction::Forward(bytes) => {
                let _ = context.events.send(SessionEvent::Data(Bytes::from(bytes)));
            }
            DriverAction::Ready => {
                let _ = context.events.send(SessionEvent::Ready);
            }
            DriverAction::SendSecret { kind, delay } => {
                let Some(line) = lock(driver).secret_line(kind) else {
                    continue;
                };
                tracing::debug!(session_id = %context.session_id, ?kind, "Prompt detected, sending secret");
                let writer = context.writer.clone();
                let session_id = context.session_id.clone();
                context.timers.schedule(&context.runtime, delay, move || {
                    if let Err(err) = write_line(&writer, line.as_bytes()) {
                        tracing::warn!(session_id = %session_id, error = %err, "Failed to send secret");
                    }
                });
            }
            DriverAction::EndHideWindowAfter(delay) => {
                let driver = driver.clone();
                context.timers.schedule(&context.runtime, delay, move || {
                    lock(&driver).expire_hide_window();
                });
            }
            DriverAction::InjectEnv { command, delay } => {
                tracing::debug!(session_id = %context.session_id, "Shell ready, injecting environment");
                let writer = context.writer.clone();
                let session_id = context.session_id.clone();
                context.timers.schedule(&context.runtime, delay, move || {
                    if let Err(err) = write_line(&writer, command.as_bytes()) {
                        tracing::warn!(session_id = %session_id, error = %err, "Failed to inject environment");
                    }
                });
            }
        }
    }
}

fn write_line(writer: &Mutex<Box<dyn Write + Send>>, bytes: &[u8]) -> std::io::Result<()> {
    let mut writer = lock(writer);
    writer.write_all(bytes)?;
    writer.flush()
}

fn wait_for_exit(child: &SharedChild) -> Option<u32> {
    for _ in 0..40 {
        match lock(child).try_wait() {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) => {}
            Err(_) => return None,
        }
        thread::sleep(Duration::from_millis(25));
    }
    None
}

fn release_key_file(key_file: &Mutex<Option<NamedTempFile>>) {
    if let Some(file) = lock(key_file).take()
        && let Err(err) = file.close()
    {
        tracing::warn!(error = %err, "Failed to delete temporary key file");
    }
}

#[async_trait]
impl SessionBackend for PtyBackend {
    async fn write(&self, data: &[u8]) -> MuxResult<usize> {
        let data = data.to_vec();
        let writer = self.writer.clone();

        tokio::task::spawn_blocking(move || -> MuxResult<usize> {
            write_line(&writer, &data).map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to write to PTY")
                    .with_details(err.to_string())
            })?;
            Ok(data.len())
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join write").with_details(err.to_string())
        })?
    }

    async fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        let master = self.master.clone();

        tokio::task::spawn_blocking(move || -> MuxResult<()> {
            lock(&master)
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|err| {
                    ApiError::new(ErrorCode::IoError, "Failed to resize PTY")
                        .with_details(err.to_string())
                        .into()
                })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join resize").with_details(err.to_string())
        })?
    }

    async fn close(&self) -> MuxResult<()> {
        self.timers.cancel_all();
        release_key_file(&self.key_file);
        if self.eof.load(Ordering::SeqCst) {
            return Ok(());
        }
        let child = self.child.clone();

        tokio::task::spawn_blocking(move || -> MuxResult<()> {
            let mut child = lock(&child);
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            child.kill().map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to kill PTY process")
                    .with_details(err.to_string())
                    .into()
            })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join close").with_details(err.to_string())
        })?
    }

    fn is_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }
}

struct SshArgs<'a> {
    target: &'a SshTarget,
    env: &'a [(String, String)],
    ssh_config: &'a SshConfig,
    key_path: Option<&'a Path>,
}

fn build_ssh_args(config: SshArgs<'_>) -> Vec<String> {
    let mut args = Vec::new();
    let mut option = |value: String| {
        args.push("-o".to_string());
        args.push(value);
    };

    let policy = match config.ssh_config.host_key_policy {
        HostKeyPolicy::Strict => "yes",
        HostKeyPolicy::AcceptNew => "accept-new",
        HostKeyPolicy::Disabled => "no",
    };
    option(format!("StrictHostKeyChecking={policy}"));
    if config.ssh_config.host_key_policy == HostKeyPolicy::Disabled {
        option(format!("UserKnownHostsFile={NULL_DEVICE}"));
    } else if !config.ssh_config.known_hosts_path.is_empty() {
        option(format!("UserKnownHostsFile={}", config.ssh_config.known_hosts_path));
    }
    option("LogLevel=ERROR".to_string());

    match config.target.auth {
        AuthMaterial::Password { .. } => {
            option("PreferredAuthentications=password,keyboard-interactive".to_string())
        }
        AuthMaterial::PrivateKey { .. } => option("PreferredAuthentications=publickey".to_string()),
    }

    let connect_timeout = config.ssh_config.ready_timeout_ms.div_ceil(1000).max(1);
    option(format!("ConnectTimeout={connect_timeout}"));
    let keepalive = config.ssh_config.keepalive_interval_ms / 1000;
    if keepalive > 0 {
        option(format!("ServerAliveInterval={keepalive}"));
        option(format!("ServerAliveCountMax={}", config.ssh_config.keepalive_count_max));
    }

    if config.target.legacy_algorithms {
        for legacy in LEGACY_SSH_OPTIONS {
            option(legacy.to_string());
        }
    }
    for (key, value) in config.env {
        option(format!("SetEnv={key}={value}"));
    }

    if let Some(path) = config.key_path {
        args.push("-i".to_string());
        args.push(path.to_string_lossy().to_string());
    }
    args.push("-p".to_string());
    args.push(config.target.port.to_string());
    args.push(format!("{}@{}", config.target.username, config.target.host));
    args
}

fn write_temp_key(pem: &str) -> MuxResult<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("sshmux-key-")
        .tempfile()
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to create temp key file")
                .with_details(err.to_string())
        })?;
    restrict_permissions(&file)?;
    file.write_all(normalize_private_key(pem).as_bytes())
        .and_then(|_| file.flush())
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to write private key")
                .with_details(err.to_string())
        })?;
    Ok(file)
}

#[cfg(unix)]
fn restrict_permissions(file: &NamedTempFile) -> MuxResult<()> {
    use std::os::unix::fs::PermissionsExt;

    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to set key permissions")
                .with_details(err.to_string())
                .into()
        })
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &NamedTempFile) -> MuxResult<()> {
    Ok(())
}

fn home_dir() -> Option<std::path::PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(var)
        .map(std::path::PathBuf::from)
        .filter(|path| path.is_dir())
}

/// Shell for local sessions: configured, then `$SHELL`, then the platform default.
pub(super) fn local_shell(configured: &str) -> String {
    if !configured.trim().is_empty() {
        return configured.trim().to_string();
    }
    if cfg!(windows) {
        return std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
    }
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(auth: AuthMaterial) -> SshTarget {
        SshTarget::new("db.internal", 2202, "alice", auth)
    }

    #[test]
    fn password_args_disable_host_checks_and_end_with_destination() {
        let ssh_config = SshConfig::default();
        let target = target(AuthMaterial::password("pw"));
        let env = vec![("LANG".to_string(), "C.UTF-8".to_string())];
        let args = build_ssh_args(SshArgs {
            target: &target,
            env: &env,
            ssh_config: &ssh_config,
            key_path: None,
        });

        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&format!("UserKnownHostsFile={NULL_DEVICE}")));
        assert!(args.contains(&"LogLevel=ERROR".to_string()));
        assert!(args.contains(&"SetEnv=LANG=C.UTF-8".to_string()));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(args.contains(&"ServerAliveCountMax=3".to_string()));
        assert!(!args.iter().any(|arg| arg.starts_with("KexAlgorithms")));
        assert!(!args.contains(&"-i".to_string()));
        assert_eq!(&args[args.len() - 3..], ["-p", "2202", "alice@db.internal"]);
    }

    #[test]
    fn key_and_legacy_args() {
        let ssh_config = SshConfig {
            host_key_policy: HostKeyPolicy::Strict,
            known_hosts_path: "/etc/ssh/known".to_string(),
            ..SshConfig::default()
        };
        let mut target = target(AuthMaterial::private_key("pem", None));
        target.legacy_algorithms = true;
        let key_path = Path::new("/tmp/sshmux-key-1");
        let args = build_ssh_args(SshArgs {
            target: &target,
            env: &[],
            ssh_config: &ssh_config,
            key_path: Some(key_path),
        });

        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/etc/ssh/known".to_string()));
        assert!(args.contains(&"PreferredAuthentications=publickey".to_string()));
        for legacy in LEGACY_SSH_OPTIONS {
            assert!(args.contains(&legacy.to_string()));
        }
        let i = args.iter().position(|arg| arg == "-i").unwrap();
        assert_eq!(args[i + 1], "/tmp/sshmux-key-1");
    }

    #[test]
    fn temp_key_is_normalised_private_and_removed() {
        let file = write_temp_key("-----BEGIN KEY-----\r\nabc\r\n-----END KEY-----").unwrap();
        let path = file.path().to_path_buf();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "-----BEGIN KEY-----\nabc\n-----END KEY-----\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let slot = Mutex::new(Some(file));
        release_key_file(&slot);
        assert!(!path.exists());
        release_key_file(&slot);
    }

    #[test]
    fn configured_local_shell_wins() {
        assert_eq!(local_shell(" /bin/zsh "), "/bin/zsh");
        assert!(!local_shell("").is_empty());
    }

    #[tokio::test]
    async fn cancelled_timers_never_fire() {
        let timers = PendingTimers::default();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        timers.schedule(&Handle::current(), Duration::from_millis(50), move || {
            flag.store(true, Ordering::SeqCst);
        });
        timers.cancel_all();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!fired.load(Ordering::SeqCst));

        timers.schedule(&Handle::current(), Duration::from_millis(1), || {});
        assert!(lock(&timers.handles).is_empty());
    }
}
