//! Event routing and per-session conversation state
//!
//! Lives on the UI side of the bridge: classifies every inbound event and
//! folds it into the per-session conversation that the desktop shell
//! renders. Streaming deltas are reconciled here; tool items are keyed by
//! `tool-<toolUseId>` so progress and completion merge into one row.

use crate::client::stream::{merge_overlap, normalize_ingest, StreamingCursor};
use crate::protocol::event::{
    BridgeEvent, EVENT_BRIDGE_CONNECTED, EVENT_BRIDGE_STDERR, EVENT_ERROR, EVENT_MESSAGE_COMPLETE,
    EVENT_MESSAGE_DELTA, EVENT_PERMISSION_REQUEST, EVENT_RESULT, EVENT_SESSION_CLOSED,
    EVENT_SESSION_STARTED, EVENT_TOOL_COMPLETED, EVENT_TOOL_PROGRESS, EVENT_TOOL_STARTED,
};
use crate::registry::{RegistryEntry, SessionRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Cap on retained diagnostics lines
const MAX_DIAGNOSTICS: usize = 200;

/// Tool execution state shown in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Running,
    Completed,
    Failed,
}

/// One renderable conversation entry
#[derive(Debug, Clone)]
pub struct ConversationItem {
    /// Stable ID; re-observing it merges into the existing item
    pub id: String,
    pub kind: ItemKind,
}

#[derive(Debug, Clone)]
pub enum ItemKind {
    Message {
        role: String,
        text: String,
    },
    Reasoning {
        summary: String,
        content: String,
    },
    Tool {
        name: String,
        input: Value,
        status: ToolStatus,
        output: Option<String>,
        elapsed: Option<f64>,
    },
    Review {
        state: String,
        text: String,
    },
    Diff {
        path: String,
        patch: String,
        status: Option<String>,
    },
}

/// Accumulated token usage for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Per-session view maintained for the UI
pub struct SessionView {
    pub workspace_id: String,
    items: Vec<ConversationItem>,
    index: HashMap<String, usize>,
    cursor: Option<StreamingCursor>,
    reasoning_cursor: Option<String>,
    pub usage: TokenUsage,
    /// tool_use_id → permission/request payload, removed on result
    pub pending_permissions: HashMap<String, Value>,
    pub close_reason: Option<String>,
}

impl SessionView {
    fn new(workspace_id: String) -> Self {
        Self {
            workspace_id,
            items: Vec::new(),
            index: HashMap::new(),
            cursor: None,
            reasoning_cursor: None,
            usage: TokenUsage::default(),
            pending_permissions: HashMap::new(),
            close_reason: None,
        }
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn item(&self, id: &str) -> Option<&ConversationItem> {
        self.index.get(id).map(|&at| &self.items[at])
    }

    fn upsert(&mut self, id: &str) -> &mut ConversationItem {
        if let Some(&at) = self.index.get(id) {
            return &mut self.items[at];
        }
        self.items.push(ConversationItem {
            id: id.to_string(),
            kind: ItemKind::Message {
                role: "assistant".to_string(),
                text: String::new(),
            },
        });
        let at = self.items.len() - 1;
        self.index.insert(id.to_string(), at);
        &mut self.items[at]
    }
}

/// Classifies bridge events and applies per-session state transitions (C4)
pub struct EventRouter {
    sessions: HashMap<String, SessionView>,
    registry: Option<Arc<SessionRegistry>>,
    pub connected: bool,
    diagnostics: Vec<String>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            registry: None,
            connected: false,
            diagnostics: Vec::new(),
        }
    }

    /// Route registry side effects (register on start, touch on activity)
    /// into the given registry.
    pub fn with_registry(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::new()
        }
    }

    pub fn session(&self, session_id: &str) -> Option<&SessionView> {
        self.sessions.get(session_id)
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// Apply one event. Unknown discriminants are logged and dropped.
    pub async fn handle(&mut self, event: &BridgeEvent) {
        match event.event_type.as_str() {
            EVENT_SESSION_STARTED => self.on_session_started(event).await,
            EVENT_SESSION_CLOSED => self.on_session_closed(event),
            EVENT_MESSAGE_DELTA => self.on_message_delta(event),
            EVENT_MESSAGE_COMPLETE => self.on_message_complete(event).await,
            EVENT_TOOL_STARTED => self.on_tool_started(event),
            EVENT_TOOL_PROGRESS => self.on_tool_progress(event),
            EVENT_TOOL_COMPLETED => self.on_tool_completed(event),
            EVENT_PERMISSION_REQUEST => self.on_permission_request(event),
            EVENT_RESULT => self.on_result(event).await,
            EVENT_ERROR => self.on_error(event),
            EVENT_BRIDGE_STDERR => self.push_diagnostic(event),
            EVENT_BRIDGE_CONNECTED => self.connected = true,
            other => {
                tracing::debug!(event_type = other, "Dropping unknown event");
            }
        }
    }

    /// The bridge process died: every live session is over.
    pub fn handle_disconnect(&mut self) {
        self.connected = false;
        for view in self.sessions.values_mut() {
            if view.close_reason.is_none() {
                view.close_reason = Some("error".to_string());
            }
            view.cursor = None;
            view.pending_permissions.clear();
        }
    }

    /// Merge a review item (UI verdict panels).
    pub fn upsert_review(&mut self, session_id: &str, id: &str, state: &str, text: &str) {
        if let Some(view) = self.sessions.get_mut(session_id) {
            let item = view.upsert(id);
            item.kind = ItemKind::Review {
                state: state.to_string(),
                text: text.to_string(),
            };
        }
    }

    /// Merge a diff item (file-change panels).
    pub fn upsert_diff(
        &mut self,
        session_id: &str,
        id: &str,
        path: &str,
        patch: &str,
        status: Option<String>,
    ) {
        if let Some(view) = self.sessions.get_mut(session_id) {
            let item = view.upsert(id);
            item.kind = ItemKind::Diff {
                path: path.to_string(),
                patch: patch.to_string(),
                status,
            };
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    async fn on_session_started(&mut self, event: &BridgeEvent) {
        self.sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| SessionView::new(event.workspace_id.clone()));

        if let Some(registry) = &self.registry {
            let cwd = event
                .payload
                .get("cwd")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let entry = RegistryEntry::for_new_session(event.session_id.clone(), cwd);
            if let Err(err) = registry.register(&event.workspace_id, entry).await {
                tracing::warn!(session_id = %event.session_id, "Failed to register session: {err}");
            }
        }
    }

    fn on_session_closed(&mut self, event: &BridgeEvent) {
        if let Some(view) = self.sessions.get_mut(&event.session_id) {
            view.close_reason = Some(
                event
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("completed")
                    .to_string(),
            );
            view.cursor = None;
            view.reasoning_cursor = None;
            view.pending_permissions.clear();
        }
    }

    fn on_message_delta(&mut self, event: &BridgeEvent) {
        let view = match self.sessions.get_mut(&event.session_id) {
            Some(view) => view,
            None => return,
        };
        let Some(stream_event) = event.payload.get("event") else {
            return;
        };
        let event_type = stream_event
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("");

        match event_type {
            "message_start" => {
                open_cursor_if_absent(view, &event.session_id);
            }
            "content_block_start" => {
                let block_type = stream_event
                    .pointer("/content_block/type")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match block_type {
                    // The cursor opens at the first of message_start /
                    // content_block_start{text}, never twice.
                    "text" => open_cursor_if_absent(view, &event.session_id),
                    "thinking" => {
                        let id = format!("reasoning-{}", uuid::Uuid::new_v4());
                        let item = view.upsert(&id);
                        item.kind = ItemKind::Reasoning {
                            summary: String::new(),
                            content: String::new(),
                        };
                        view.reasoning_cursor = Some(id);
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta_type = stream_event
                    .pointer("/delta/type")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match delta_type {
                    "text_delta" => {
                        let text = stream_event
                            .pointer("/delta/text")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let text = normalize_ingest(text);
                        // A delta with no opening event still renders
                        open_cursor_if_absent(view, &event.session_id);
                        let item_id = view.cursor.as_ref().map(|c| c.item_id.clone());
                        if let Some(item_id) = item_id {
                            let item = view.upsert(&item_id);
                            if let ItemKind::Message { text: existing, .. } = &mut item.kind {
                                *existing = merge_overlap(existing, &text);
                            }
                        }
                    }
                    "thinking_delta" => {
                        let text = stream_event
                            .pointer("/delta/thinking")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        let item_id = view.reasoning_cursor.clone();
                        if let Some(item_id) = item_id {
                            let item = view.upsert(&item_id);
                            if let ItemKind::Reasoning { content, .. } = &mut item.kind {
                                content.push_str(&text);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    async fn on_message_complete(&mut self, event: &BridgeEvent) {
        let preview = {
            let view = match self.sessions.get_mut(&event.session_id) {
                Some(view) => view,
                None => return,
            };

            let full_text = extract_message_text(&event.payload);

            let item_id = match view.cursor.take() {
                Some(cursor) => cursor.item_id,
                None => {
                    if full_text.is_empty() && !has_tool_blocks(&event.payload) {
                        return;
                    }
                    streaming_item_id(&event.session_id)
                }
            };
            view.reasoning_cursor = None;

            if !full_text.is_empty() || view.item(&item_id).is_none() {
                let normalized = normalize_ingest(&full_text);
                let item = view.upsert(&item_id);
                if let ItemKind::Message { text, .. } = &mut item.kind {
                    // Streamed text stands when the final message is empty
                    if !normalized.is_empty() {
                        *text = normalized;
                    }
                }
            }

            apply_tool_blocks(view, &event.payload);

            match view.item(&item_id).map(|item| &item.kind) {
                Some(ItemKind::Message { text, .. }) if !text.is_empty() => Some(text.clone()),
                _ => None,
            }
        };

        if let (Some(registry), Some(preview)) = (&self.registry, preview) {
            let _ = registry.touch(&event.session_id, Some(preview)).await;
        }
    }

    fn on_tool_started(&mut self, event: &BridgeEvent) {
        if let Some(view) = self.sessions.get_mut(&event.session_id) {
            let tool_use_id = payload_str(&event.payload, "toolUseId");
            let item = view.upsert(&format!("tool-{tool_use_id}"));
            let name = payload_str(&event.payload, "toolName");
            let input = event.payload.get("input").cloned().unwrap_or(Value::Null);
            match &mut item.kind {
                ItemKind::Tool {
                    name: n, input: i, ..
                } => {
                    *n = name;
                    *i = input;
                }
                _ => {
                    item.kind = ItemKind::Tool {
                        name,
                        input,
                        status: ToolStatus::Running,
                        output: None,
                        elapsed: None,
                    };
                }
            }
        }
    }

    fn on_tool_progress(&mut self, event: &BridgeEvent) {
        if let Some(view) = self.sessions.get_mut(&event.session_id) {
            let tool_use_id = payload_str(&event.payload, "toolUseId");
            let seconds = event
                .payload
                .get("elapsedSeconds")
                .and_then(Value::as_f64);
            let item = view.upsert(&format!("tool-{tool_use_id}"));
            if let ItemKind::Tool { elapsed, name, .. } = &mut item.kind {
                *elapsed = seconds;
                if name.is_empty() {
                    *name = payload_str(&event.payload, "toolName");
                }
            } else {
                item.kind = ItemKind::Tool {
                    name: payload_str(&event.payload, "toolName"),
                    input: Value::Null,
                    status: ToolStatus::Running,
                    output: None,
                    elapsed: seconds,
                };
            }
        }
    }

    fn on_tool_completed(&mut self, event: &BridgeEvent) {
        if let Some(view) = self.sessions.get_mut(&event.session_id) {
            let tool_use_id = payload_str(&event.payload, "toolUseId");
            let output = event
                .payload
                .get("output")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            let failed = event
                .payload
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let item = view.upsert(&format!("tool-{tool_use_id}"));
            if let ItemKind::Tool {
                status, output: out, ..
            } = &mut item.kind
            {
                *status = if failed {
                    ToolStatus::Failed
                } else {
                    ToolStatus::Completed
                };
                *out = output;
            } else {
                item.kind = ItemKind::Tool {
                    name: String::new(),
                    input: Value::Null,
                    status: if failed {
                        ToolStatus::Failed
                    } else {
                        ToolStatus::Completed
                    },
                    output,
                    elapsed: None,
                };
            }
        }
    }

    fn on_permission_request(&mut self, event: &BridgeEvent) {
        if let Some(view) = self.sessions.get_mut(&event.session_id) {
            let tool_use_id = payload_str(&event.payload, "toolUseId");
            view.pending_permissions
                .insert(tool_use_id, event.payload.clone());
        }
    }

    async fn on_result(&mut self, event: &BridgeEvent) {
        {
            let view = match self.sessions.get_mut(&event.session_id) {
                Some(view) => view,
                None => return,
            };

            // A turn is over: nothing can still be running
            for item in &mut view.items {
                if let ItemKind::Tool { status, .. } = &mut item.kind {
                    if *status == ToolStatus::Running {
                        *status = ToolStatus::Completed;
                    }
                }
            }

            if let Some(usage) = event.payload.get("usage") {
                let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
                view.usage.input += field("input");
                view.usage.output += field("output");
                view.usage.cache_read += field("cacheRead");
                view.usage.cache_creation += field("cacheCreation");
            }

            view.cursor = None;
            view.reasoning_cursor = None;
            view.pending_permissions.clear();
        }

        if let Some(registry) = &self.registry {
            let _ = registry.touch(&event.session_id, None).await;
        }
    }

    fn on_error(&mut self, event: &BridgeEvent) {
        let code = payload_str(&event.payload, "code");
        let message = payload_str(&event.payload, "message");
        tracing::warn!(
            session_id = %event.session_id,
            code = %code,
            "Bridge error: {message}"
        );
        self.diagnostics.push(format!("[{code}] {message}"));
        self.trim_diagnostics();

        if code == "BRIDGE_DISCONNECTED" {
            self.handle_disconnect();
        }
    }

    fn push_diagnostic(&mut self, event: &BridgeEvent) {
        let message = payload_str(&event.payload, "message");
        self.diagnostics.push(message);
        self.trim_diagnostics();
    }

    fn trim_diagnostics(&mut self) {
        if self.diagnostics.len() > MAX_DIAGNOSTICS {
            let excess = self.diagnostics.len() - MAX_DIAGNOSTICS;
            self.diagnostics.drain(..excess);
        }
    }
}

fn open_cursor_if_absent(view: &mut SessionView, session_id: &str) {
    if view.cursor.is_some() {
        return;
    }
    let item_id = streaming_item_id(session_id);
    let item = view.upsert(&item_id);
    item.kind = ItemKind::Message {
        role: "assistant".to_string(),
        text: String::new(),
    };
    view.cursor = Some(StreamingCursor { item_id });
}

fn streaming_item_id(session_id: &str) -> String {
    format!("msg-{}-{}", session_id, uuid::Uuid::new_v4())
}

fn payload_str(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// Concatenated text blocks of a message/complete payload.
fn extract_message_text(payload: &Value) -> String {
    let Some(content) = payload.pointer("/message/content").and_then(Value::as_array) else {
        return String::new();
    };
    let parts: Vec<&str> = content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    parts.join("\n")
}

fn has_tool_blocks(payload: &Value) -> bool {
    payload
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(|content| {
            content.iter().any(|block| {
                matches!(
                    block.get("type").and_then(Value::as_str),
                    Some("tool_use") | Some("tool_result")
                )
            })
        })
        .unwrap_or(false)
}

/// Open/advance tool items from the content blocks of a complete message.
fn apply_tool_blocks(view: &mut SessionView, payload: &Value) {
    let Some(content) = payload.pointer("/message/content").and_then(Value::as_array) else {
        return;
    };
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or("");
                let item = view.upsert(&format!("tool-{id}"));
                if !matches!(item.kind, ItemKind::Tool { .. }) {
                    item.kind = ItemKind::Tool {
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                        status: ToolStatus::Running,
                        output: None,
                        elapsed: None,
                    };
                }
            }
            Some("tool_result") => {
                let id = block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let output = block
                    .get("content")
                    .map(|c| match c {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                let failed = block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let item = view.upsert(&format!("tool-{id}"));
                if let ItemKind::Tool {
                    status, output: out, ..
                } = &mut item.kind
                {
                    *status = if failed {
                        ToolStatus::Failed
                    } else {
                        ToolStatus::Completed
                    };
                    *out = Some(output);
                } else {
                    item.kind = ItemKind::Tool {
                        name: String::new(),
                        input: Value::Null,
                        status: ToolStatus::Completed,
                        output: Some(output),
                        elapsed: None,
                    };
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn started(session_id: &str) -> BridgeEvent {
        BridgeEvent::new(
            EVENT_SESSION_STARTED,
            session_id,
            "w1",
            json!({"model": "claude-sonnet-4-20250514", "cwd": "/p"}),
        )
    }

    fn delta(session_id: &str, stream_event: Value) -> BridgeEvent {
        BridgeEvent::new(
            EVENT_MESSAGE_DELTA,
            session_id,
            "w1",
            json!({"event": stream_event}),
        )
    }

    fn text_delta(session_id: &str, text: &str) -> BridgeEvent {
        delta(
            session_id,
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}}),
        )
    }

    async fn streamed_text(router: &EventRouter, session_id: &str) -> String {
        let view = router.session(session_id).unwrap();
        view.items()
            .iter()
            .find_map(|item| match &item.kind {
                ItemKind::Message { text, .. } => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_happy_path_streaming() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&delta("S1", json!({"type": "message_start"})))
            .await;
        router.handle(&text_delta("S1", "hello")).await;
        router.handle(&text_delta("S1", "hello wo")).await;
        router.handle(&text_delta("S1", "world")).await;

        assert_eq!(streamed_text(&router, "S1").await, "hello world");

        // Completion with the full text wins
        router
            .handle(&BridgeEvent::new(
                EVENT_MESSAGE_COMPLETE,
                "S1",
                "w1",
                json!({"message": {"role": "assistant", "content": [
                    {"type": "text", "text": "hello world"}
                ]}, "uuid": "u1"}),
            ))
            .await;
        assert_eq!(streamed_text(&router, "S1").await, "hello world");
        assert!(router.session("S1").unwrap().cursor.is_none());

        // Usage lands on result
        router
            .handle(&BridgeEvent::new(
                EVENT_RESULT,
                "S1",
                "w1",
                json!({"success": true, "usage": {"input": 10, "output": 20}}),
            ))
            .await;
        let usage = router.session("S1").unwrap().usage;
        assert_eq!(usage.total(), 30);
    }

    #[tokio::test]
    async fn test_cursor_opens_once_for_start_pair() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&delta("S1", json!({"type": "message_start"})))
            .await;
        router
            .handle(&delta(
                "S1",
                json!({"type": "content_block_start", "content_block": {"type": "text"}}),
            ))
            .await;
        router.handle(&text_delta("S1", "once")).await;

        let view = router.session("S1").unwrap();
        let message_items = view
            .items()
            .iter()
            .filter(|i| matches!(i.kind, ItemKind::Message { .. }))
            .count();
        assert_eq!(message_items, 1);
    }

    #[tokio::test]
    async fn test_duplicate_deltas_are_idempotent() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router.handle(&text_delta("S1", "abc")).await;
        router.handle(&text_delta("S1", "abc")).await;
        router.handle(&text_delta("S1", "abcdef")).await;
        router.handle(&text_delta("S1", "def")).await;
        assert_eq!(streamed_text(&router, "S1").await, "abcdef");
    }

    #[tokio::test]
    async fn test_complete_keeps_streamed_text_when_message_empty() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router.handle(&text_delta("S1", "partial answer")).await;
        router
            .handle(&BridgeEvent::new(
                EVENT_MESSAGE_COMPLETE,
                "S1",
                "w1",
                json!({"message": {"role": "assistant", "content": []}, "uuid": "u1"}),
            ))
            .await;
        assert_eq!(streamed_text(&router, "S1").await, "partial answer");
    }

    #[tokio::test]
    async fn test_tool_lifecycle_merges_into_one_item() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&BridgeEvent::new(
                EVENT_TOOL_STARTED,
                "S1",
                "w1",
                json!({"toolUseId": "T1", "toolName": "Bash", "input": {"command": "ls"}}),
            ))
            .await;
        router
            .handle(&BridgeEvent::new(
                EVENT_TOOL_PROGRESS,
                "S1",
                "w1",
                json!({"toolUseId": "T1", "toolName": "Bash", "elapsedSeconds": 2.5}),
            ))
            .await;
        router
            .handle(&BridgeEvent::new(
                EVENT_TOOL_COMPLETED,
                "S1",
                "w1",
                json!({"toolUseId": "T1", "output": "file.txt", "isError": false}),
            ))
            .await;

        let view = router.session("S1").unwrap();
        let item = view.item("tool-T1").unwrap();
        match &item.kind {
            ItemKind::Tool {
                name,
                status,
                output,
                elapsed,
                ..
            } => {
                assert_eq!(name, "Bash");
                assert_eq!(*status, ToolStatus::Completed);
                assert_eq!(output.as_deref(), Some("file.txt"));
                assert_eq!(*elapsed, Some(2.5));
            }
            other => panic!("expected tool item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_result_forces_running_tools_completed() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&BridgeEvent::new(
                EVENT_TOOL_STARTED,
                "S1",
                "w1",
                json!({"toolUseId": "T1", "toolName": "Bash", "input": {}}),
            ))
            .await;
        router
            .handle(&BridgeEvent::new(
                EVENT_RESULT,
                "S1",
                "w1",
                json!({"success": true, "usage": {}}),
            ))
            .await;

        let view = router.session("S1").unwrap();
        match &view.item("tool-T1").unwrap().kind {
            ItemKind::Tool { status, .. } => assert_eq!(*status, ToolStatus::Completed),
            other => panic!("expected tool item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_complete_opens_tool_items() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&BridgeEvent::new(
                EVENT_MESSAGE_COMPLETE,
                "S1",
                "w1",
                json!({"message": {"role": "assistant", "content": [
                    {"type": "text", "text": "running a command"},
                    {"type": "tool_use", "id": "T9", "name": "Bash", "input": {"command": "pwd"}},
                ]}, "uuid": "u2"}),
            ))
            .await;

        let view = router.session("S1").unwrap();
        match &view.item("tool-T9").unwrap().kind {
            ItemKind::Tool { name, status, .. } => {
                assert_eq!(name, "Bash");
                assert_eq!(*status, ToolStatus::Running);
            }
            other => panic!("expected tool item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permission_tracked_and_cleared_on_result() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&BridgeEvent::new(
                EVENT_PERMISSION_REQUEST,
                "S1",
                "w1",
                json!({"toolUseId": "T1", "toolName": "Bash", "input": {"command": "rm x"}}),
            ))
            .await;
        assert_eq!(
            router.session("S1").unwrap().pending_permissions.len(),
            1
        );

        router
            .handle(&BridgeEvent::new(EVENT_RESULT, "S1", "w1", json!({})))
            .await;
        assert!(router.session("S1").unwrap().pending_permissions.is_empty());
    }

    #[tokio::test]
    async fn test_session_closed_records_reason() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&BridgeEvent::new(
                EVENT_SESSION_CLOSED,
                "S1",
                "w1",
                json!({"reason": "user"}),
            ))
            .await;
        assert_eq!(
            router.session("S1").unwrap().close_reason.as_deref(),
            Some("user")
        );
    }

    #[tokio::test]
    async fn test_unknown_event_dropped() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&BridgeEvent::new("something/new", "S1", "w1", json!({})))
            .await;
        // Malformed events do not disturb other state
        assert!(router.session("S1").is_some());
    }

    #[tokio::test]
    async fn test_bridge_disconnected_closes_all_views() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router.handle(&started("S2")).await;
        router
            .handle(&BridgeEvent::global(
                EVENT_ERROR,
                json!({"code": "BRIDGE_DISCONNECTED", "message": "child exited", "recoverable": false}),
            ))
            .await;
        assert_eq!(
            router.session("S1").unwrap().close_reason.as_deref(),
            Some("error")
        );
        assert_eq!(
            router.session("S2").unwrap().close_reason.as_deref(),
            Some("error")
        );
    }

    #[tokio::test]
    async fn test_stderr_collects_diagnostics() {
        let mut router = EventRouter::new();
        router
            .handle(&BridgeEvent::global(
                EVENT_BRIDGE_STDERR,
                json!({"message": "warming up"}),
            ))
            .await;
        assert_eq!(router.diagnostics(), ["warming up"]);
    }

    #[tokio::test]
    async fn test_reasoning_stream() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router
            .handle(&delta(
                "S1",
                json!({"type": "content_block_start", "content_block": {"type": "thinking"}}),
            ))
            .await;
        router
            .handle(&delta(
                "S1",
                json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "let me see"}}),
            ))
            .await;

        let view = router.session("S1").unwrap();
        let reasoning = view
            .items()
            .iter()
            .find_map(|item| match &item.kind {
                ItemKind::Reasoning { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(reasoning, "let me see");
    }

    #[tokio::test]
    async fn test_registry_register_and_touch() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistry::load(dir.path().join("threads.json")));
        let mut router = EventRouter::with_registry(Arc::clone(&registry));

        router.handle(&started("S1")).await;
        let entry = registry.entry("S1").await.unwrap();
        assert_eq!(entry.cwd, "/p");
        assert_eq!(registry.visible("w1").await.len(), 1);

        router
            .handle(&BridgeEvent::new(
                EVENT_MESSAGE_COMPLETE,
                "S1",
                "w1",
                json!({"message": {"role": "assistant", "content": [
                    {"type": "text", "text": "here is the summary"}
                ]}, "uuid": "u1"}),
            ))
            .await;
        let entry = registry.entry("S1").await.unwrap();
        assert_eq!(entry.preview.as_deref(), Some("here is the summary"));
    }

    #[tokio::test]
    async fn test_review_and_diff_upserts_merge() {
        let mut router = EventRouter::new();
        router.handle(&started("S1")).await;
        router.upsert_review("S1", "review-1", "pending", "looking");
        router.upsert_review("S1", "review-1", "approved", "lgtm");
        router.upsert_diff("S1", "diff-1", "src/main.rs", "+1 -0", None);

        let view = router.session("S1").unwrap();
        assert_eq!(view.items().len(), 2);
        match &view.item("review-1").unwrap().kind {
            ItemKind::Review { state, .. } => assert_eq!(state, "approved"),
            other => panic!("expected review, got {other:?}"),
        }
    }
}
