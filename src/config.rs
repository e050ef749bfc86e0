use crate::error::{ApiError, ErrorCode, MuxResult};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "sshmux.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShellTransport {
    /// Spawn the system `ssh` client on a pseudo-terminal.
    #[default]
    #[value(name = "pty")]
    #[serde(rename = "pty")]
    PtySubprocess,
    /// Open a shell channel on an in-process SSH connection.
    #[value(name = "protocol")]
    #[serde(rename = "protocol")]
    ProtocolShell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    Strict,
    AcceptNew,
    #[default]
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub ssh: SshConfig,
    pub pty: PtyConfig,
    pub injection: InjectionConfig,
    pub knock: KnockConfig,
    pub tunnel: TunnelConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionConfig {
    pub transport: ShellTransport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Explicit path of the `ssh` executable; empty means auto-detect.
    pub ssh_path: String,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts_path: String,
    pub ready_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub keepalive_count_max: usize,
    pub motd_command: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_path: String::new(),
            host_key_policy: HostKeyPolicy::Disabled,
            known_hosts_path: String::new(),
            ready_timeout_ms: 30_000,
            keepalive_interval_ms: 10_000,
            keepalive_count_max: 3,
            motd_command: "cat /run/motd.dynamic 2>/dev/null || cat /etc/motd 2>/dev/null"
                .to_string(),
        }
    }
}

impl SshConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    /// Shell used for local sessions; empty means `$SHELL` or the platform default.
    pub local_shell: String,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            local_shell: String::new(),
        }
    }
}

/// Tuning for the prompt-watching credential injector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    pub prompt_window_chars: usize,
    pub secret_delay_ms: u64,
    pub hide_window_ms: u64,
    pub env_inject_delay_ms: u64,
    pub password_prompts: Vec<String>,
    pub passphrase_prompts: Vec<String>,
    pub shell_ready_pattern: String,
    pub hide_release_pattern: String,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            prompt_window_chars: 500,
            secret_delay_ms: 50,
            hide_window_ms: 500,
            env_inject_delay_ms: 100,
            password_prompts: vec![
                "password:".to_string(),
                "'s password:".to_string(),
                "password for".to_string(),
            ],
            passphrase_prompts: vec![
                "enter passphrase".to_string(),
                "passphrase for".to_string(),
            ],
            shell_ready_pattern: r"[$#%]|Last login|Welcome|~\]".to_string(),
            hide_release_pattern: r"[$#~]|Last login|Welcome".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnockConfig {
    pub delay_ms: u64,
    pub timeout_ms: u64,
    pub settle_ms: u64,
}

impl Default for KnockConfig {
    fn default() -> Self {
        Self {
            delay_ms: 100,
            timeout_ms: 1_000,
            settle_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub event_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version = crate::version::VERSION, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Args, Clone, Default)]
pub struct GlobalArgs {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    #[arg(long, global = true)]
    pub log_format: Option<String>,
    #[arg(long, global = true)]
    pub ssh_path: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Open an interactive shell on a remote host.
    Shell(ShellArgs),
    /// Open an interactive local shell on a pseudo-terminal.
    Local,
    /// Run one command on a remote host and print its output.
    Exec(ExecArgs),
    /// Run a port forward until interrupted.
    Forward(ForwardArgs),
    /// Send a port-knock sequence to a host.
    Knock(KnockArgs),
}

#[derive(Debug, clap::Args, Clone)]
pub struct TargetArgs {
    #[arg(long)]
    pub host: String,
    #[arg(long, default_value_t = 22)]
    pub port: u16,
    #[arg(long)]
    pub user: String,
    /// Name of the environment variable holding the password.
    #[arg(long)]
    pub password_env: Option<String>,
    /// Private key file used instead of a password.
    #[arg(long)]
    pub identity: Option<PathBuf>,
    /// Name of the environment variable holding the key passphrase.
    #[arg(long)]
    pub passphrase_env: Option<String>,
    /// Comma or space separated knock ports, e.g. "7000,8000,9000".
    #[arg(long)]
    pub knock: Option<String>,
    /// Allow legacy key exchange, host key and cipher algorithms.
    #[arg(long)]
    pub legacy: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct ShellArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long, value_enum)]
    pub transport: Option<ShellTransport>,
    /// Remote environment variable, `KEY=VALUE`; may be repeated.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
}

#[derive(Debug, clap::Args, Clone)]
pub struct ExecArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Run on a remote PTY and print output as it arrives.
    #[arg(long)]
    pub stream: bool,
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, clap::Args, Clone)]
#[command(group(clap::ArgGroup::new("mode").required(true).args(["local", "remote", "dynamic"])))]
pub struct ForwardArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[arg(long)]
    pub id: Option<String>,
    #[arg(long)]
    pub name: Option<String>,
    /// `[BIND:]PORT:HOST:PORT`, listen locally and forward through the server.
    #[arg(long)]
    pub local: Option<String>,
    /// `[BIND:]PORT:HOST:PORT`, listen on the server and forward to a local target.
    #[arg(long)]
    pub remote: Option<String>,
    /// `[BIND:]PORT`, run a SOCKS5 proxy locally.
    #[arg(long)]
    pub dynamic: Option<String>,
}

#[derive(Debug, clap::Args, Clone)]
pub struct KnockArgs {
    #[arg(long, required_unless_present = "generate")]
    pub host: Option<String>,
    #[arg(long, required_unless_present = "generate")]
    pub sequence: Option<String>,
    /// Print a random sequence of this many ports instead of knocking.
    #[arg(long, conflicts_with_all = ["host", "sequence"])]
    pub generate: Option<usize>,
}

impl Config {
    pub fn load(args: &GlobalArgs) -> MuxResult<Self> {
        let mut config = if let Some(path) = &args.config {
            Self::from_file(path)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.apply_cli(args);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> MuxResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> MuxResult<Self> {
        let parsed: Self = toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("SSHMUX_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = env::var("SSHMUX_LOG_FORMAT") {
            self.logging.format = value;
        }
        if let Ok(value) = env::var("SSHMUX_SSH_PATH") {
            self.ssh.ssh_path = value;
        }
        if let Ok(value) = env::var("SSHMUX_TRANSPORT")
            && let Some(transport) = parse_transport(&value)
        {
            self.session.transport = transport;
        }
    }

    fn apply_cli(&mut self, args: &GlobalArgs) {
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(format) = &args.log_format {
            self.logging.format = format.clone();
        }
        if let Some(path) = &args.ssh_path {
            self.ssh.ssh_path = path.clone();
        }
    }
}

fn parse_transport(value: &str) -> Option<ShellTransport> {
    match value.to_ascii_lowercase().as_str() {
        "pty" => Some(ShellTransport::PtySubprocess),
        "protocol" => Some(ShellTransport::ProtocolShell),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_connection_timings() {
        let config = Config::default();
        assert_eq!(config.ssh.ready_timeout(), Duration::from_secs(30));
        assert_eq!(config.ssh.keepalive_interval(), Duration::from_secs(10));
        assert_eq!(config.ssh.keepalive_count_max, 3);
        assert_eq!(config.injection.prompt_window_chars, 500);
        assert_eq!(config.knock.delay_ms, 100);
        assert_eq!(config.session.transport, ShellTransport::PtySubprocess);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [session]
            transport = "protocol"

            [ssh]
            ssh_path = "/opt/ssh/bin/ssh"
            host_key_policy = "acceptnew"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.transport, ShellTransport::ProtocolShell);
        assert_eq!(config.ssh.ssh_path, "/opt/ssh/bin/ssh");
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::AcceptNew);
        assert_eq!(config.ssh.keepalive_count_max, 3);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn malformed_toml_is_invalid_argument() {
        let err = Config::from_toml("[ssh\nssh_path = 1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = Config::default();
        config.apply_cli(&GlobalArgs {
            log_level: Some("debug".to_string()),
            ssh_path: Some("/usr/local/bin/ssh".to_string()),
            ..GlobalArgs::default()
        });
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.ssh.ssh_path, "/usr/local/bin/ssh");
    }

    #[test]
    fn transport_names_parse() {
        assert_eq!(parse_transport("PTY"), Some(ShellTransport::PtySubprocess));
        assert_eq!(parse_transport("protocol"), Some(ShellTransport::ProtocolShell));
        assert_eq!(parse_transport("telnet"), None);
    }

    #[test]
    fn exec_stream_flag_parses() {
        let cli = Cli::try_parse_from([
            "sshmux", "exec", "--host", "db", "--user", "ops", "--stream", "tail", "-n", "5", "log",
        ])
        .unwrap();
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert!(args.stream);
        assert_eq!(args.command, vec!["tail", "-n", "5", "log"]);
    }
}
