//! Prompt-watching credential injector for PTY driven `ssh` sessions.
//!
//! The system `ssh` client owns the terminal, so secrets are delivered the
//! way a user would type them: by watching output for a prompt and writing
//! the answer back. [`InjectionDriver`] is a pure state machine; the PTY
//! backend feeds it output chunks and executes the [`DriverAction`]s it
//! returns (timers, writes, forwarding).
//!
//! Phases move strictly forward:
//! `AwaitingPrompt -> SecretSent -> EnvInjected -> Streaming`.
//! A prompt that never matches is not an error; output just passes through.

use crate::config::InjectionConfig;
use crate::error::MuxResult;
use crate::session::buffer::PromptWindow;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct CredentialPatterns {
    password_prompts: Vec<String>,
    passphrase_prompts: Vec<String>,
    shell_ready: Regex,
    hide_release: Regex,
}

impl CredentialPatterns {
    pub fn compile(config: &InjectionConfig) -> MuxResult<Self> {
        let lower = |items: &[String]| {
            items
                .iter()
                .map(|item| item.to_lowercase())
                .filter(|item| !item.is_empty())
                .collect()
        };
        Ok(Self {
            password_prompts: lower(&config.password_prompts),
            passphrase_prompts: lower(&config.passphrase_prompts),
            shell_ready: Regex::new(&config.shell_ready_pattern)?,
            hide_release: Regex::new(&config.hide_release_pattern)?,
        })
    }

    /// Key passphrase prompt, e.g. `Enter passphrase for key '/tmp/k':`.
    pub fn is_passphrase_prompt(&self, chunk: &str) -> bool {
        let chunk = chunk.to_lowercase();
        self.passphrase_prompts
            .iter()
            .any(|prompt| chunk.contains(prompt.as_str()))
            || (chunk.contains("passphrase") && chunk.contains(':'))
    }

    /// Password prompt in the newest chunk, or one that was split across
    /// reads and now sits at the end of the rolling window.
    pub fn is_password_prompt(&self, chunk: &str, window: &str) -> bool {
        let chunk = chunk.to_lowercase();
        if self
            .password_prompts
            .iter()
            .any(|prompt| chunk.contains(prompt.as_str()))
        {
            return true;
        }
        let window = window.to_lowercase();
        let tail = window.trim_end();
        tail.ends_with("password:") || tail.ends_with("'s password:")
    }

    /// Output that looks like an interactive shell is up.
    pub fn is_shell_ready(&self, chunk: &str) -> bool {
        self.shell_ready.is_match(chunk)
    }

    /// Output that ends the post-password hide window early.
    ///
    /// Known to misfire on banners containing `$`, `#` or `~`.
    pub fn releases_hide_window(&self, chunk: &str) -> bool {
        self.hide_release.is_match(chunk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPhase {
    AwaitingPrompt,
    SecretSent,
    EnvInjected,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Password,
    Passphrase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverAction {
    /// Pass these bytes to the session's consumer.
    Forward(Vec<u8>),
    /// Write the secret of this kind, followed by CR, after `delay`.
    SendSecret { kind: SecretKind, delay: Duration },
    /// Call [`InjectionDriver::expire_hide_window`] after this long.
    EndHideWindowAfter(Duration),
    /// Write this command line after `delay`.
    InjectEnv { command: String, delay: Duration },
    /// The first usable shell prompt has been seen.
    Ready,
}

/// What the session authenticates with, as far as prompts are concerned.
#[derive(Clone)]
pub enum AuthPlan {
    Password(String),
    PrivateKey { passphrase: Option<String> },
    /// Local shells and agent-based logins: nothing to type.
    Nothing,
}

impl fmt::Debug for AuthPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPlan::Password(_) => f.write_str("Password(<redacted>)"),
            AuthPlan::PrivateKey { passphrase } => write!(
                f,
                "PrivateKey {{ passphrase: {} }}",
                if passphrase.is_some() { "<redacted>" } else { "none" }
            ),
            AuthPlan::Nothing => f.write_str("Nothing"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InjectionTiming {
    pub secret_delay: Duration,
    pub hide_window: Duration,
    pub env_delay: Duration,
}

impl From<&InjectionConfig> for InjectionTiming {
    fn from(config: &InjectionConfig) -> Self {
        Self {
            secret_delay: Duration::from_millis(config.secret_delay_ms),
            hide_window: Duration::from_millis(config.hide_window_ms),
            env_delay: Duration::from_millis(config.env_inject_delay_ms),
        }
    }
}

#[derive(Debug)]
pub struct InjectionDriver {
    patterns: Arc<CredentialPatterns>,
    auth: AuthPlan,
    env_command: Option<String>,
    timing: InjectionTiming,
    window: PromptWindow,
    phase: InjectionPhase,
    password_sent: bool,
    passphrase_sent: bool,
    hiding: bool,
    ready: bool,
}

impl InjectionDriver {
    pub fn new(
        patterns: Arc<CredentialPatterns>,
        auth: AuthPlan,
        env: &[(String, String)],
        timing: InjectionTiming,
        window_chars: usize,
    ) -> Self {
        Self {
            patterns,
            auth,
            env_command: build_env_command(env),
            timing,
            window: PromptWindow::new(window_chars),
            phase: InjectionPhase::AwaitingPrompt,
            password_sent: false,
            passphrase_sent: false,
            hiding: false,
            ready: false,
        }
    }

    #[cfg(test)]
    fn phase(&self) -> InjectionPhase {
        self.phase
    }

    #[cfg(test)]
    fn is_hiding(&self) -> bool {
        self.hiding
    }

    #[cfg(test)]
    fn is_ready(&self) -> bool {
        self.ready
    }

    /// The line to type for `kind`, secret plus CR.
    pub fn secret_line(&self, kind: SecretKind) -> Option<String> {
        let secret = match (kind, &self.auth) {
            (SecretKind::Password, AuthPlan::Password(password)) => password.as_str(),
            (SecretKind::Passphrase, AuthPlan::PrivateKey { passphrase: Some(p) }) => p.as_str(),
            _ => return None,
        };
        Some(format!("{secret}\r"))
    }

    /// End the hide window; returns whether output was being hidden.
    pub fn expire_hide_window(&mut self) -> bool {
        std::mem::replace(&mut self.hiding, false)
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DriverAction> {
        let mut actions = Vec::new();
        if self.phase == InjectionPhase::Streaming {
            actions.push(DriverAction::Forward(chunk.to_vec()));
            return actions;
        }
        if self.phase == InjectionPhase::EnvInjected && self.ready {
            self.phase = InjectionPhase::Streaming;
        }

        let text = String::from_utf8_lossy(chunk);
        self.window.push(&text);

        let shell_ready = self.patterns.is_shell_ready(&text);
        let secrets_done = self.required_secret_sent();

        if shell_ready
            && secrets_done
            && let Some(command) = self.env_command.take()
        {
            self.phase = InjectionPhase::EnvInjected;
            actions.push(DriverAction::InjectEnv {
                command,
                delay: self.timing.env_delay,
            });
        }

        if self.wants_passphrase() && self.patterns.is_passphrase_prompt(&text) {
            self.passphrase_sent = true;
            self.phase = InjectionPhase::SecretSent;
            actions.push(DriverAction::SendSecret {
                kind: SecretKind::Passphrase,
                delay: self.timing.secret_delay,
            });
            actions.push(DriverAction::Forward(chunk.to_vec()));
            return actions;
        }

        if self.wants_password() && self.patterns.is_password_prompt(&text, self.window.as_str()) {
            self.password_sent = true;
            self.hiding = true;
            self.phase = InjectionPhase::SecretSent;
            actions.push(DriverAction::SendSecret {
                kind: SecretKind::Password,
                delay: self.timing.secret_delay,
            });
            actions.push(DriverAction::EndHideWindowAfter(self.timing.hide_window));
            return actions;
        }

        if self.hiding {
            if !self.patterns.releases_hide_window(&text) {
                return actions;
            }
            self.hiding = false;
        }

        actions.push(DriverAction::Forward(chunk.to_vec()));

        if shell_ready && secrets_done && !self.ready {
            self.ready = true;
            actions.push(DriverAction::Ready);
            if self.env_command.is_none() && self.phase != InjectionPhase::EnvInjected {
                self.phase = InjectionPhase::Streaming;
            }
        }
        actions
    }

    fn required_secret_sent(&self) -> bool {
        match self.auth {
            AuthPlan::Password(_) => self.password_sent,
            _ => true,
        }
    }

    fn wants_password(&self) -> bool {
        matches!(self.auth, AuthPlan::Password(_)) && !self.password_sent
    }

    fn wants_passphrase(&self) -> bool {
        matches!(self.auth, AuthPlan::PrivateKey { passphrase: Some(_) }) && !self.passphrase_sent
    }
}

/// `export K='v' && ... && clear\r`, or `None` when there is nothing to set.
pub fn build_env_command(env: &[(String, String)]) -> Option<String> {
    if env.is_empty() {
        return None;
    }
    let exports: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("export {key}={}", shell_single_quote(value)))
        .collect();
    Some(format!("{} && clear\r", exports.join(" && ")))
}

fn shell_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Environment variable names that are safe to splice into a shell line.
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
