//! Process-root context handed to the session and tunnel engines.
//!
//! Everything that used to be ambient (the resolved `ssh` path, compiled
//! prompt patterns, the transport implementation) lives here so tests can
//! build an isolated context with a mock transport.

use crate::config::Config;
use crate::error::{ErrorCode, MuxError, MuxResult};
use crate::knock;
use crate::session::credential::CredentialPatterns;
use crate::transport::{ConnectOptions, Connection, SshTarget, Transport};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};

#[cfg(windows)]
const BARE_SSH: &str = "ssh.exe";
#[cfg(not(windows))]
const BARE_SSH: &str = "ssh";

pub struct RuntimeContext {
    config: Config,
    transport: Arc<dyn Transport>,
    patterns: Arc<CredentialPatterns>,
    ssh_executable: OnceLock<PathBuf>,
}

impl RuntimeContext {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> MuxResult<Arc<Self>> {
        let patterns = Arc::new(CredentialPatterns::compile(&config.injection)?);
        Ok(Arc::new(Self {
            config,
            transport,
            patterns,
            ssh_executable: OnceLock::new(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn patterns(&self) -> Arc<CredentialPatterns> {
        self.patterns.clone()
    }

    /// The `ssh` binary for PTY sessions, resolved on first use and cached
    /// for the lifetime of this context.
    pub fn ssh_executable(&self) -> &Path {
        self.ssh_executable
            .get_or_init(|| {
                let path = resolve_ssh_executable(&self.config.ssh.ssh_path);
                tracing::debug!(path = %path.display(), "Resolved ssh executable");
                path
            })
            .as_path()
    }

    pub fn connect_options(&self, target: &SshTarget, legacy_algorithms: bool) -> ConnectOptions {
        ConnectOptions {
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
            auth: target.auth.clone(),
            ready_timeout: self.config.ssh.ready_timeout(),
            keepalive_interval: self.config.ssh.keepalive_interval(),
            keepalive_count_max: self.config.ssh.keepalive_count_max,
            legacy_algorithms,
        }
    }

    pub async fn knock_if_configured(&self, target: &SshTarget) {
        if !target.knock_sequence.is_empty() {
            knock::knock(&target.host, &target.knock_sequence, &self.config.knock).await;
        }
    }

    /// Knock, connect, and retry once with legacy algorithms when the server
    /// only speaks an older algorithm set.
    pub async fn connect(&self, target: &SshTarget) -> MuxResult<Arc<dyn Connection>> {
        self.knock_if_configured(target).await;

        let options = self.connect_options(target, target.legacy_algorithms);
        match self.transport.connect(&options).await {
            Err(err) if is_negotiation_failure(&err) && !target.legacy_algorithms => {
                tracing::warn!(
                    host = %target.host,
                    error = %err,
                    "Algorithm negotiation failed, retrying with legacy algorithms"
                );
                let legacy = self.connect_options(target, true);
                self.transport.connect(&legacy).await
            }
            other => other,
        }
    }
}

fn is_negotiation_failure(err: &MuxError) -> bool {
    err.code() == ErrorCode::NegotiationFailed
}

pub fn resolve_ssh_executable(configured: &str) -> PathBuf {
    let configured = configured.trim();
    if !configured.is_empty() {
        return PathBuf::from(configured);
    }
    resolve_from(&install_locations(), search_path)
}

fn resolve_from(candidates: &[PathBuf], search: impl FnOnce() -> Option<PathBuf>) -> PathBuf {
    candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .cloned()
        .or_else(search)
        .unwrap_or_else(|| PathBuf::from(BARE_SSH))
}

#[cfg(windows)]
fn install_locations() -> Vec<PathBuf> {
    let var = |name: &str, fallback: &str| {
        std::env::var(name).unwrap_or_else(|_| fallback.to_string())
    };
    let system_root = PathBuf::from(var("SystemRoot", r"C:\Windows"));
    let program_files = PathBuf::from(var("ProgramFiles", r"C:\Program Files"));
    let program_files_x86 = PathBuf::from(var("ProgramFiles(x86)", r"C:\Program Files (x86)"));
    let profile = PathBuf::from(var("USERPROFILE", ""));
    vec![
        system_root.join(r"System32\OpenSSH\ssh.exe"),
        program_files.join(r"Git\usr\bin\ssh.exe"),
        program_files_x86.join(r"Git\usr\bin\ssh.exe"),
        program_files.join(r"OpenSSH\ssh.exe"),
        profile.join(r"AppData\Local\Programs\Git\usr\bin\ssh.exe"),
    ]
}

#[cfg(not(windows))]
fn install_locations() -> Vec<PathBuf> {
    ["/usr/bin/ssh", "/usr/local/bin/ssh", "/opt/homebrew/bin/ssh", "/bin/ssh"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn search_path() -> Option<PathBuf> {
    let finder = if cfg!(windows) { "where" } else { "which" };
    let output = Command::new(finder).arg(BARE_SSH).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_path_wins() {
        assert_eq!(
            resolve_ssh_executable("  /opt/custom/ssh "),
            PathBuf::from("/opt/custom/ssh")
        );
    }

    #[test]
    fn first_existing_candidate_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("ssh");
        std::fs::write(&present, b"").unwrap();
        let candidates = vec![dir.path().join("missing"), present.clone()];
        let resolved = resolve_from(&candidates, || panic!("path search should not run"));
        assert_eq!(resolved, present);
    }

    #[test]
    fn falls_back_to_search_then_bare_name() {
        let missing = vec![PathBuf::from("/nonexistent/ssh")];
        assert_eq!(
            resolve_from(&missing, || Some(PathBuf::from("/found/ssh"))),
            PathBuf::from("/found/ssh")
        );
        assert_eq!(resolve_from(&missing, || None), PathBuf::from(BARE_SSH));
    }
}
