//! Bridge process - command serving and event fan-out
//!
//! The bridge owns the UI-facing side of the stdio protocol:
//!
//! ```text
//! Desktop shell ←→ line JSON ←→ Bridge (this module) ←→ stream-json ←→ Claude Code CLI
//!                  stdin/stdout   ├ dispatcher                          (one per session)
//!                                 ├ session   (C2)
//!                                 ├ permission (C3)
//!                                 └ doctor
//! ```
//!
//! All stdout writes (responses and events alike) funnel through one writer
//! task, so lines never interleave. Stdin EOF triggers the global shutdown
//! sequence: cancel permissions, close sessions, tear down vendor children.

pub mod dispatcher;
pub mod doctor;
pub mod permission;
pub mod session;

pub use dispatcher::Dispatcher;
pub use doctor::{run_doctor, DoctorReport};
pub use permission::{PermissionHandler, SharedSessionId};
pub use session::{SessionManager, SessionStatus};

use crate::config::ClawdeckConfig;
use crate::protocol::command::{Request, Response};
use crate::protocol::event::{BridgeEvent, EVENT_ERROR};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Single-writer outlet for everything the bridge says on stdout.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<String>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Emit an event. A value that cannot be serialized is replaced by an
    /// `error` event so the client always sees something.
    pub fn emit(&self, event: BridgeEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let _ = self.tx.send(line);
            }
            Err(err) => {
                tracing::error!("Failed to serialize event: {err}");
                let replacement = BridgeEvent::new(
                    EVENT_ERROR,
                    event.session_id,
                    event.workspace_id,
                    json!({
                        "code": "SERIALIZATION_ERROR",
                        "message": err.to_string(),
                        "recoverable": true,
                    }),
                );
                if let Ok(line) = serde_json::to_string(&replacement) {
                    let _ = self.tx.send(line);
                }
            }
        }
    }

    /// Queue a response line.
    pub fn send_response(&self, response: &Response) {
        match serde_json::to_string(response) {
            Ok(line) => {
                let _ = self.tx.send(line);
            }
            Err(err) => {
                tracing::error!(id = response.id, "Failed to serialize response: {err}");
                let fallback = Response::err(response.id, format!("Serialization error: {err}"));
                if let Ok(line) = serde_json::to_string(&fallback) {
                    let _ = self.tx.send(line);
                }
            }
        }
    }
}

/// The bridge process: wires the dispatcher to stdio.
pub struct Bridge {
    dispatcher: Dispatcher,
    sessions: Arc<SessionManager>,
    permissions: Arc<PermissionHandler>,
    events: EventSink,
    outbox: mpsc::UnboundedReceiver<String>,
}

impl Bridge {
    pub fn new(config: ClawdeckConfig) -> Self {
        let (tx, outbox) = mpsc::unbounded_channel();
        let events = EventSink::new(tx);
        let permissions = Arc::new(PermissionHandler::new(config.permission_timeout()));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&permissions),
            events.clone(),
            config.bridge.clone(),
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&sessions), Arc::clone(&permissions));

        Self {
            dispatcher,
            sessions,
            permissions,
            events,
            outbox,
        }
    }

    /// Serve the protocol until stdin closes.
    pub async fn run(self) -> crate::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve the protocol over an arbitrary byte stream pair until the
    /// reader closes.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> crate::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Bridge {
            dispatcher,
            sessions,
            permissions,
            events,
            mut outbox,
        } = self;

        let writer = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = outbox.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        tracing::info!("Bridge serving");

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    let response = dispatcher.handle(request).await;
                    events.send_response(&response);
                }
                Err(err) => {
                    // Salvage the id when possible so the caller is unblocked
                    let id = serde_json::from_str::<Value>(&line)
                        .ok()
                        .and_then(|v| v.get("id").and_then(Value::as_u64));
                    match id {
                        Some(id) => events.send_response(&Response::err(
                            id as u32,
                            crate::Error::InvalidCommand(err.to_string()).to_string(),
                        )),
                        None => events.emit(BridgeEvent::error(
                            "",
                            "",
                            &crate::Error::Parse(err.to_string()),
                        )),
                    }
                }
            }
        }

        tracing::info!("Command stream closed, shutting down");
        permissions.cancel_all();
        sessions.close_all().await;

        // Give the writer a moment to drain terminal events
        drop(events);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        writer.abort();

        Ok(())
    }
}
