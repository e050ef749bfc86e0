//! Startup ordering for protocol shells.
//!
//! A freshly opened shell channel starts talking at once, usually with its
//! prompt. Consumers expect to see the server greeting, the auth banner and
//! the message of the day first, so the shell output is queued until
//! [`PendingShell::start_streaming`] has fetched the MOTD and flushed
//! everything in order.

use crate::session::SessionEvent;
use crate::session::buffer::StartupQueue;
use crate::transport::{Connection, ShellChannel, ShellControl, ShellOutput};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A shell channel that is capturing output but not yet delivering it.
pub struct PendingShell {
    connection: Arc<dyn Connection>,
    control: Arc<dyn ShellControl>,
    prefix: Vec<u8>,
    start: oneshot::Sender<StreamStart>,
}

struct StreamStart {
    prefix: Vec<u8>,
    sink: mpsc::UnboundedSender<SessionEvent>,
}

impl PendingShell {
    /// Begin capturing `channel`; greeting and banner are taken from the
    /// connection now so they lead the eventual flush.
    pub fn capture(connection: Arc<dyn Connection>, channel: ShellChannel) -> Self {
        let mut prefix = Vec::new();
        if let Some(greeting) = connection.greeting() {
            prefix.extend_from_slice(greeting.as_bytes());
        }
        if let Some(banner) = connection.banner() {
            prefix.extend_from_slice(banner.as_bytes());
        }

        let (start_tx, start_rx) = oneshot::channel();
        tokio::spawn(relay(channel.output, start_rx));

        Self {
            connection,
            control: channel.control,
            prefix,
            start: start_tx,
        }
    }

    pub fn control(&self) -> Arc<dyn ShellControl> {
        self.control.clone()
    }

    /// Fetch the MOTD, then flush greeting, banner, MOTD and queued shell
    /// output into `sink` as one chunk and switch to pass-through.
    ///
    /// A failing MOTD command is skipped; the flush still happens.
    pub async fn start_streaming(self, sink: mpsc::UnboundedSender<SessionEvent>, motd_command: &str) {
        let mut prefix = self.prefix;
        if let Some(motd) = fetch_motd(self.connection.as_ref(), motd_command).await {
            prefix.extend_from_slice(b"\r\n");
            prefix.extend_from_slice(motd.as_bytes());
            prefix.extend_from_slice(b"\r\n");
        }
        if self.start.send(StreamStart { prefix, sink }).is_err() {
            tracing::debug!("Shell relay ended before streaming started");
        }
    }
}

async fn fetch_motd(connection: &dyn Connection, command: &str) -> Option<String> {
    if command.trim().is_empty() {
        return None;
    }
    match connection.execute(command).await {
        Ok(output) => {
            let motd = output.stdout_lossy();
            (!motd.trim().is_empty()).then_some(motd)
        }
        Err(err) => {
            tracing::debug!(error = %err, "MOTD fetch failed");
            None
        }
    }
}

async fn relay(
    mut output: mpsc::UnboundedReceiver<ShellOutput>,
    mut start: oneshot::Receiver<StreamStart>,
) {
    let mut queue = StartupQueue::new();
    let mut closed = false;

    let StreamStart { prefix, sink } = loop {
        tokio::select! {
            started = &mut start => match started {
                Ok(started) => break started,
                Err(_) => return,
            },
            item = output.recv(), if !closed => match item {
                Some(ShellOutput::Data(bytes)) => queue.push(bytes),
                Some(ShellOutput::Closed) | None => closed = true,
            },
        }
    };

    let mut flush = prefix;
    queue.drain_into(&mut flush);
    if !flush.is_empty() {
        let _ = sink.send(SessionEvent::Data(Bytes::from(flush)));
    }

    if !closed {
        while let Some(item) = output.recv().await {
            match item {
                ShellOutput::Data(bytes) => {
                    if sink.send(SessionEvent::Data(Bytes::from(bytes))).is_err() {
                        return;
                    }
                }
                ShellOutput::Closed => break,
            }
        }
    }
    let _ = sink.send(SessionEvent::Closed { exit_code: None });
}
