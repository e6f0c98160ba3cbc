//! Event protocol: bridge → UI notifications
//!
//! Every event is one line of JSON on stdout with a fixed envelope:
//! `{type, sessionId, workspaceId, timestamp, payload}`. Events with no
//! session scope (stderr forwarding, bridge lifecycle) carry empty IDs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

// Event types
pub const EVENT_SESSION_STARTED: &str = "session/started";
pub const EVENT_SESSION_CLOSED: &str = "session/closed";
pub const EVENT_MESSAGE_DELTA: &str = "message/delta";
pub const EVENT_MESSAGE_COMPLETE: &str = "message/complete";
pub const EVENT_TOOL_STARTED: &str = "tool/started";
pub const EVENT_TOOL_PROGRESS: &str = "tool/progress";
pub const EVENT_TOOL_COMPLETED: &str = "tool/completed";
pub const EVENT_PERMISSION_REQUEST: &str = "permission/request";
pub const EVENT_RESULT: &str = "result";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_BRIDGE_STDERR: &str = "bridge/stderr";
pub const EVENT_BRIDGE_CONNECTED: &str = "bridge/connected";

/// Event envelope emitted by the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub workspace_id: String,
    /// Milliseconds since the UNIX epoch
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

impl BridgeEvent {
    /// Build a session-scoped event.
    pub fn new(
        event_type: &str,
        session_id: impl Into<String>,
        workspace_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            session_id: session_id.into(),
            workspace_id: workspace_id.into(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// Build an event with no session scope.
    pub fn global(event_type: &str, payload: Value) -> Self {
        Self::new(event_type, "", "", payload)
    }

    /// Build an `error` event from a crate error.
    pub fn error(session_id: &str, workspace_id: &str, err: &crate::Error) -> Self {
        Self::new(
            EVENT_ERROR,
            session_id,
            workspace_id,
            json!({
                "code": err.code(),
                "message": err.to_string(),
                "recoverable": err.recoverable(),
            }),
        )
    }
}

/// Reason carried by `session/closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Closed by explicit user action
    User,
    /// The vendor consumer loop ended cleanly
    Completed,
    /// The vendor consumer loop failed
    Error,
}

/// Current time in milliseconds since UNIX epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_shape() {
        let event = BridgeEvent::new(
            EVENT_SESSION_STARTED,
            "s1",
            "w1",
            json!({"model": "claude-sonnet-4-20250514"}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "session/started");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["workspaceId"], "w1");
        assert!(value["timestamp"].as_u64().unwrap() > 1_700_000_000_000);
        assert_eq!(value["payload"]["model"], "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_global_event_has_empty_scope() {
        let event = BridgeEvent::global(EVENT_BRIDGE_STDERR, json!({"message": "boot"}));
        assert!(event.session_id.is_empty());
        assert!(event.workspace_id.is_empty());
    }

    #[test]
    fn test_error_event_payload() {
        let err = crate::Error::Auth("token expired".to_string());
        let event = BridgeEvent::error("s1", "w1", &err);
        assert_eq!(event.payload["code"], "AUTH_ERROR");
        assert_eq!(event.payload["recoverable"], false);
    }

    #[test]
    fn test_close_reason_serializes_lowercase() {
        assert_eq!(serde_json::to_value(CloseReason::User).unwrap(), "user");
        assert_eq!(
            serde_json::to_value(CloseReason::Completed).unwrap(),
            "completed"
        );
        assert_eq!(serde_json::to_value(CloseReason::Error).unwrap(), "error");
    }

    #[test]
    fn test_event_roundtrip() {
        let event = BridgeEvent::new(EVENT_RESULT, "s1", "w1", json!({"success": true}));
        let line = serde_json::to_string(&event).unwrap();
        let parsed: BridgeEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.event_type, EVENT_RESULT);
        assert_eq!(parsed.payload["success"], true);
    }
}
