// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Stdio protocol bridge.
//!
//! The reader loop decodes one command per line and dispatches each in a
//! fresh task, so `cancel_request` is handled even while a `user_message`
//! run is in flight.  The writer loop drains a bounded event channel; a
//! full buffer drops events with a warning and never blocks the scheduler.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::manager::SessionManager;
use crate::protocol::{decode_command, encode_event, Command, Event};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cloneable sender half of the event channel with drop-on-full semantics.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Best-effort emit.  Observation must never stall the scheduler, so a
    /// full channel drops the event.
    pub fn emit(&self, event: Event) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            warn!(?event, "event channel full; dropping event");
        }
    }
}

/// Dispatch one decoded command against the manager.
pub async fn handle_command(manager: Arc<SessionManager>, command: Command) {
    match command {
        Command::StartSession {
            session_id,
            repo_root,
            ..
        } => manager.start_session(session_id, repo_root).await,
        Command::UserMessage {
            session_id,
            message,
            ..
        } => manager.user_message(&session_id, &message).await,
        Command::CancelRequest { session_id } => manager.cancel_request(&session_id).await,
        Command::SaveConfig { config, .. } => manager.save_config(config).await,
        Command::GetConfig { .. } => manager.get_config().await,
        Command::ReloadConfig { session_id } => manager.reload_config(&session_id).await,
        Command::ProjectPermission {
            session_id,
            granted,
        } => manager.project_permission(&session_id, granted).await,
    }
}

/// Run the bridge over arbitrary byte streams until the input reaches EOF.
///
/// `events` is the receiver paired with the manager's [`EventSender`].
pub async fn run<R, W>(
    manager: Arc<SessionManager>,
    input: R,
    output: W,
    mut events: mpsc::Receiver<Event>,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(event) = events.recv().await {
            let line = match encode_event(&event) {
                Ok(line) => line,
                Err(e) => {
                    warn!("failed to encode event: {e}");
                    continue;
                }
            };
            if output.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if output.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = output.flush().await;
        }
    });

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match decode_command(trimmed) {
            Ok(command) => {
                debug!(?command, "dispatching command");
                let manager = Arc::clone(&manager);
                tokio::spawn(handle_command(manager, command));
            }
            Err(e) => {
                manager.events().emit(Event::Error {
                    session_id: None,
                    kind: "invalid_command".into(),
                    message: e.to_string(),
                });
            }
        }
    }

    // EOF: tear down. Cancel in-flight runs so tools stop promptly, then
    // let the writer drain what is already queued.  The writer exits when
    // the last event sender drops; the timeout covers handler tasks that
    // still hold one.
    manager.shutdown().await;
    drop(manager);
    if tokio::time::timeout(std::time::Duration::from_secs(2), writer)
        .await
        .is_err()
    {
        debug!("writer did not drain in time; exiting anyway");
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_drops_when_channel_is_full() {
        let (tx, mut rx) = mpsc::channel(2);
        let sender = EventSender { tx };
        for i in 0..5 {
            sender.emit(Event::Status {
                session_id: None,
                state: format!("s{i}"),
                message: None,
            });
        }
        // Only the first two made it; the rest were dropped, not queued.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
