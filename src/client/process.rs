//! Bridge child-process supervision
//!
//! `AgentProcess` owns the single bridge child and its stdio: commands are
//! serialized one JSON object per line to stdin, responses are correlated
//! back to callers by id, and unsolicited events fan out to the embedding
//! shell. Stderr is demultiplexed into `bridge/stderr` events and a raw line
//! stream for diagnostics.

use crate::protocol::event::{BridgeEvent, EVENT_BRIDGE_CONNECTED, EVENT_BRIDGE_STDERR};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound streams produced by [`AgentProcess::start`]
#[derive(Debug)]
pub struct AgentProcessStreams {
    /// Unsolicited events, including synthetic ones for parse errors and
    /// disconnects
    pub events: mpsc::UnboundedReceiver<BridgeEvent>,
    /// Raw stderr lines
    pub stderr: mpsc::UnboundedReceiver<String>,
}

/// Supervisor for the bridge child process (C1)
#[derive(Debug)]
pub struct AgentProcess {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: StdMutex<HashMap<u32, oneshot::Sender<crate::Result<Value>>>>,
    next_id: AtomicU32,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl AgentProcess {
    /// Spawn the bridge binary and wire its stdio.
    pub fn start(
        program: &str,
        args: &[String],
    ) -> crate::Result<(Arc<AgentProcess>, AgentProcessStreams)> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                crate::Error::SpawnFailed(format!("Failed to spawn bridge at {program}: {e}"))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| crate::Error::SpawnFailed("missing stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| crate::Error::SpawnFailed("missing stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| crate::Error::SpawnFailed("missing stderr".to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        let process = Arc::new(AgentProcess {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            events: events_tx,
        });

        process.spawn_stdout_reader(stdout);
        process.spawn_stderr_reader(stderr, stderr_tx);

        tracing::info!(program = program, "Bridge process started");

        Ok((
            process,
            AgentProcessStreams {
                events: events_rx,
                stderr: stderr_rx,
            },
        ))
    }

    /// Perform the protocol handshake. Emits `bridge/connected` on success.
    pub async fn initialize(&self, client_name: &str, client_version: &str) -> crate::Result<Value> {
        let result = timeout(
            INITIALIZE_TIMEOUT,
            self.request(
                "initialize",
                json!({
                    "clientInfo": { "name": client_name, "version": client_version }
                }),
            ),
        )
        .await
        .map_err(|_| {
            crate::Error::Internal("bridge did not respond to initialize".to_string())
        })??;

        let _ = self.events.send(BridgeEvent::global(
            EVENT_BRIDGE_CONNECTED,
            result.clone(),
        ));
        Ok(result)
    }

    /// Send a command and wait for the response with the same id.
    pub async fn request(&self, method: &str, params: Value) -> crate::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params });
        if let Err(err) = self.write_line(&frame).await {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(crate::Error::BridgeDisconnected),
        }
    }

    /// Serialize one JSON object and write it, newline-terminated. Writes
    /// are serialized by the stdin guard.
    async fn write_line(&self, frame: &Value) -> crate::Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(crate::Error::Disconnected)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| crate::Error::Disconnected)?;
        stdin.flush().await.map_err(|_| crate::Error::Disconnected)
    }

    /// Close stdin, wait up to `grace` for a clean exit, then kill.
    /// Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        // Dropping stdin is the shutdown signal for the bridge
        self.stdin.lock().await.take();

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match timeout(grace, child.wait()).await {
                Ok(status) => {
                    tracing::info!(status = ?status.ok(), "Bridge exited");
                }
                Err(_) => {
                    tracing::warn!("Bridge did not exit within grace period, killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.fail_pending(crate::Error::BridgeDisconnected);
    }

    fn fail_pending(&self, _err: crate::Error) {
        let pending: Vec<oneshot::Sender<crate::Result<Value>>> = {
            let mut guard = self.pending.lock().expect("pending lock poisoned");
            guard.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(crate::Error::BridgeDisconnected));
        }
    }

    fn spawn_stdout_reader(self: &Arc<Self>, stdout: tokio::process::ChildStdout) {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                process.route_line(&line);
            }

            // Unexpected EOF: every in-flight command and session is over
            tracing::warn!("Bridge stdout closed");
            process.fail_pending(crate::Error::BridgeDisconnected);
            let _ = process.events.send(BridgeEvent::error(
                "",
                "",
                &crate::Error::BridgeDisconnected,
            ));
        });
    }

    /// Classify one stdout line: a response resolves its pending request,
    /// anything with a `type` is an event, the rest is a recoverable parse
    /// error.
    fn route_line(&self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                let preview = &line[..line.len().min(200)];
                tracing::warn!("Bridge parse error: {err} (line: {preview})");
                let _ = self.events.send(BridgeEvent::error(
                    "",
                    "",
                    &crate::Error::Parse(err.to_string()),
                ));
                return;
            }
        };

        let is_response = value.get("id").is_some()
            && (value.get("result").is_some() || value.get("error").is_some());
        if is_response {
            let id = value.get("id").and_then(Value::as_u64).unwrap_or(0) as u32;
            let tx = self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            match tx {
                Some(tx) => {
                    let result = match value.get("error").and_then(Value::as_str) {
                        Some(error) => Err(crate::Error::Command(error.to_string())),
                        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
                None => {
                    tracing::warn!(id = id, "Response for unknown request id");
                }
            }
            return;
        }

        match serde_json::from_value::<BridgeEvent>(value) {
            Ok(event) => {
                let _ = self.events.send(event);
            }
            Err(err) => {
                tracing::warn!("Bridge emitted unroutable line: {err}");
                let _ = self.events.send(BridgeEvent::error(
                    "",
                    "",
                    &crate::Error::Parse(err.to_string()),
                ));
            }
        }
    }

    fn spawn_stderr_reader(
        self: &Arc<Self>,
        stderr: tokio::process::ChildStderr,
        stderr_tx: mpsc::UnboundedSender<String>,
    ) {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                tracing::debug!("Bridge stderr: {line}");
                let _ = process.events.send(BridgeEvent::global(
                    EVENT_BRIDGE_STDERR,
                    json!({ "message": line }),
                ));
                let _ = stderr_tx.send(line);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shell one-liner that answers every request line with a success
    /// response carrying the same id.
    const ECHO_RESPONDER: &str =
        r#"exec sed -u 's/.*"id":\([0-9]*\).*/{"id":\1,"result":{"ok":true}}/'"#;

    fn sh(script: &str) -> (Arc<AgentProcess>, AgentProcessStreams) {
        AgentProcess::start("/bin/sh", &["-c".to_string(), script.to_string()]).unwrap()
    }

    #[tokio::test]
    async fn test_start_missing_binary_is_spawn_failed() {
        let err = AgentProcess::start("/definitely/not/here/bridge", &[]).unwrap_err();
        assert_eq!(err.code(), "SPAWN_FAILED");
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (process, _streams) = sh(ECHO_RESPONDER);
        let result = process.request("model/list", json!({})).await.unwrap();
        assert_eq!(result["ok"], true);
        process.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_every_request_gets_exactly_one_response() {
        let (process, _streams) = sh(ECHO_RESPONDER);
        for _ in 0..5 {
            let result = process.request("noop", json!({})).await.unwrap();
            assert_eq!(result["ok"], true);
        }
        assert!(process
            .pending
            .lock()
            .expect("pending lock poisoned")
            .is_empty());
        process.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_command_error() {
        let (process, _streams) =
            sh(r#"exec sed -u 's/.*"id":\([0-9]*\).*/{"id":\1,"error":"Workspace busy"}/'"#);
        let err = process.request("session/start", json!({})).await.unwrap_err();
        assert_eq!(err.code(), "COMMAND_ERROR");
        assert!(err.to_string().contains("Workspace busy"));
        process.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_event_lines_are_forwarded() {
        let (process, mut streams) = sh(
            r#"echo '{"type":"session/started","sessionId":"S1","workspaceId":"w1","timestamp":1,"payload":{}}'; sleep 2"#,
        );
        let event = streams.events.recv().await.unwrap();
        assert_eq!(event.event_type, "session/started");
        assert_eq!(event.session_id, "S1");
        process.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_malformed_line_is_recoverable_parse_error() {
        let (process, mut streams) = sh(r#"echo 'this is not json'; sleep 2"#);
        let event = streams.events.recv().await.unwrap();
        assert_eq!(event.event_type, "error");
        assert_eq!(event.payload["code"], "PARSE_ERROR");
        assert_eq!(event.payload["recoverable"], true);
        process.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_eof_fails_inflight_with_bridge_disconnected() {
        // Child that reads nothing and exits immediately
        let (process, mut streams) = sh("exit 0");
        // Give the child a moment to exit
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = process.request("model/list", json!({})).await.unwrap_err();
        // Depending on whether the write or the EOF loses the race, the
        // caller sees the pipe failure or the in-flight fail-all
        assert!(matches!(
            err.code(),
            "BRIDGE_DISCONNECTED" | "DISCONNECTED"
        ));

        // The disconnect is surfaced as a non-recoverable error event
        let mut saw_disconnect = false;
        while let Ok(event) = streams.events.try_recv() {
            if event.payload["code"] == "BRIDGE_DISCONNECTED" {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_stderr_is_demultiplexed() {
        let (process, mut streams) = sh(r#"echo 'boot diagnostics' >&2; sleep 2"#);
        let line = streams.stderr.recv().await.unwrap();
        assert_eq!(line, "boot diagnostics");
        process.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (process, _streams) = sh("exec cat > /dev/null");
        process.shutdown(Duration::from_secs(2)).await;
        process.shutdown(Duration::from_secs(2)).await;
        let err = process.request("model/list", json!({})).await.unwrap_err();
        assert_eq!(err.code(), "DISCONNECTED");
    }
}
