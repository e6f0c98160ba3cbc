//! Multi-session state machine
//!
//! Owns the authoritative session table and the `workspace → session` index.
//! Each live session maps to one vendor query process; a background consumer
//! loop drains the query's message stream and fans events out to the UI.
//!
//! Sessions start under a locally minted `pending-<ts>` ID and are re-keyed
//! exactly once when the vendor announces the real ID in `system.init`.

use crate::bridge::permission::{
    PermissionDecision, PermissionHandler, SharedSessionId,
};
use crate::bridge::EventSink;
use crate::config::BridgeConfig;
use crate::protocol::event::{
    BridgeEvent, CloseReason, EVENT_MESSAGE_COMPLETE, EVENT_MESSAGE_DELTA, EVENT_PERMISSION_REQUEST,
    EVENT_RESULT, EVENT_SESSION_CLOSED, EVENT_SESSION_STARTED, EVENT_TOOL_COMPLETED,
    EVENT_TOOL_PROGRESS, EVENT_TOOL_STARTED,
};
use crate::vendor::message::{
    self, AssistantMessage, ContentBlock, ControlRequestMessage, McpServerInfo, ResultMessage,
    SystemMessage, UserMessage,
};
use crate::vendor::query::{InputStream, QueryOptions, VendorQuery};
use crate::vendor::{ImageAttachment, VendorMessage};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Query spawned, waiting for system.init
    Starting,
    /// Real ID assigned, accepting messages
    Active,
    /// Close requested, teardown in progress
    Closing,
    /// Terminal
    Closed,
}

impl SessionStatus {
    fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closing | SessionStatus::Closed)
    }
}

/// Snapshot of the vendor's system.init announcement
#[derive(Debug, Clone, Default)]
pub struct SessionInit {
    pub model: String,
    pub tools: Vec<String>,
    pub version: String,
    pub permission_mode: String,
    pub mcp_servers: Vec<McpServerInfo>,
    pub slash_commands: Vec<String>,
}

/// Point-in-time view of a live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub workspace_id: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub created_at: u64,
}

/// Options accepted by [`SessionManager::start`]
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub claude_bin: Option<String>,
    pub enable_file_checkpointing: bool,
    pub mcp_servers: Option<Value>,
    pub plugins: Option<Value>,
    pub agents: Option<Value>,
}

struct SessionEntry {
    id: SharedSessionId,
    workspace_id: String,
    cwd: String,
    status: SessionStatus,
    input: InputStream,
    query: Arc<VendorQuery>,
    created_at: u64,
    init: Option<SessionInit>,
    /// Set once this process has queued input. User frames arriving before
    /// that are resume replay, not a live turn.
    live_input: Arc<AtomicBool>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, SessionEntry>,
    by_workspace: HashMap<String, String>,
}

/// Multi-session state machine (C2)
pub struct SessionManager {
    tables: RwLock<Tables>,
    permissions: Arc<PermissionHandler>,
    events: EventSink,
    config: BridgeConfig,
}

impl SessionManager {
    pub fn new(
        permissions: Arc<PermissionHandler>,
        events: EventSink,
        config: BridgeConfig,
    ) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            permissions,
            events,
            config,
        }
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Start a new session for a workspace. Returns the pending session ID;
    /// the real ID arrives via `session/started`.
    pub async fn start(
        self: &Arc<Self>,
        workspace_id: &str,
        cwd: &str,
        options: StartOptions,
    ) -> crate::Result<String> {
        let pending_id = format!("pending-{}", now_millis());
        self.launch(workspace_id, cwd, pending_id, None, options).await
    }

    /// Resume a persisted session. The returned ID is the one passed in;
    /// the vendor confirms (or re-keys) it via `session/started`.
    pub async fn resume(
        self: &Arc<Self>,
        workspace_id: &str,
        session_id: &str,
        cwd: &str,
        claude_bin: Option<String>,
    ) -> crate::Result<String> {
        let options = StartOptions {
            claude_bin,
            ..Default::default()
        };
        self.launch(
            workspace_id,
            cwd,
            session_id.to_string(),
            Some(session_id.to_string()),
            options,
        )
        .await
    }

    async fn launch(
        self: &Arc<Self>,
        workspace_id: &str,
        cwd: &str,
        key: String,
        resume: Option<String>,
        options: StartOptions,
    ) -> crate::Result<String> {
        self.ensure_workspace_free(workspace_id).await?;

        let query_options = QueryOptions {
            cwd: cwd.to_string(),
            model: options.model,
            permission_mode: options
                .permission_mode
                .or_else(|| Some(self.config.default_permission_mode.clone())),
            resume,
            enable_file_checkpointing: options.enable_file_checkpointing,
            mcp_servers: options.mcp_servers,
            plugins: options.plugins,
            agents: options.agents,
            claude_bin: options.claude_bin.or_else(|| self.config.claude_bin.clone()),
        };

        let (query, messages) = VendorQuery::spawn(&query_options)?;
        let shared_id = SharedSessionId::new(&key);
        let live_input = Arc::new(AtomicBool::new(false));

        let entry = SessionEntry {
            id: shared_id.clone(),
            workspace_id: workspace_id.to_string(),
            cwd: cwd.to_string(),
            status: SessionStatus::Starting,
            input: query.input(),
            query: Arc::clone(&query),
            created_at: now_millis(),
            init: None,
            live_input: Arc::clone(&live_input),
        };

        {
            let mut tables = self.tables.write().await;
            // Re-check under the exclusive guard; a concurrent start may have
            // won the workspace in the meantime.
            if let Some(existing) = tables.by_workspace.get(workspace_id) {
                if tables
                    .sessions
                    .get(existing)
                    .map(|e| !e.status.is_terminal())
                    .unwrap_or(false)
                {
                    drop(tables);
                    query.shutdown(Duration::from_secs(0)).await;
                    return Err(crate::Error::WorkspaceBusy(workspace_id.to_string()));
                }
            }
            tables.sessions.insert(key.clone(), entry);
            tables
                .by_workspace
                .insert(workspace_id.to_string(), key.clone());
        }

        tracing::info!(
            session_id = %key,
            workspace_id = workspace_id,
            cwd = cwd,
            "Session launched"
        );

        self.spawn_consumer(workspace_id.to_string(), shared_id, query, messages, live_input);

        Ok(key)
    }

    async fn ensure_workspace_free(&self, workspace_id: &str) -> crate::Result<()> {
        let tables = self.tables.read().await;
        if let Some(existing) = tables.by_workspace.get(workspace_id) {
            if let Some(entry) = tables.sessions.get(existing) {
                if !entry.status.is_terminal() {
                    return Err(crate::Error::WorkspaceBusy(workspace_id.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Queue a user message. Returns false when both the text and the image
    /// list are empty (nothing is sent).
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        images: &[String],
    ) -> crate::Result<bool> {
        if text.is_empty() && images.is_empty() {
            return Ok(false);
        }

        let (input, live_input) = {
            let tables = self.tables.read().await;
            let entry = tables
                .sessions
                .get(session_id)
                .ok_or_else(|| crate::Error::SessionNotFound(session_id.to_string()))?;
            if entry.status.is_terminal() {
                return Err(crate::Error::SessionInactive(session_id.to_string()));
            }
            (entry.input.clone(), Arc::clone(&entry.live_input))
        };

        let attachments: Vec<ImageAttachment> = images
            .iter()
            .map(|path| ImageAttachment::from_path(path))
            .collect::<crate::Result<_>>()?;

        let frame = message::user_message_frame(text, &attachments);
        // Flagged before the push so a prompt vendor reply can never be
        // mistaken for replay
        live_input.store(true, Ordering::SeqCst);
        input.push(frame).await?;
        Ok(true)
    }

    /// Interrupt the current turn. Status is unchanged; the vendor emits a
    /// terminal `result` on the message stream.
    pub async fn interrupt(&self, session_id: &str) -> crate::Result<()> {
        let query = self.query_for(session_id).await?;
        query.interrupt().await
    }

    /// Close a session: cancel its pending permissions, tear down the query
    /// and emit `session/closed{reason: user}`. The table entry lingers in
    /// `Closing` until the consumer loop drains, then disappears. Idempotent.
    pub async fn close(&self, session_id: &str) -> crate::Result<()> {
        let (query, workspace_id) = {
            let mut tables = self.tables.write().await;
            let Some(entry) = tables.sessions.get_mut(session_id) else {
                return Ok(());
            };
            if entry.status.is_terminal() {
                return Ok(());
            }
            entry.status = SessionStatus::Closing;
            let query = Arc::clone(&entry.query);
            let workspace_id = entry.workspace_id.clone();
            if tables.by_workspace.get(&workspace_id).map(String::as_str) == Some(session_id) {
                tables.by_workspace.remove(&workspace_id);
            }
            (query, workspace_id)
        };

        tracing::info!(session_id = session_id, "Closing session");
        self.permissions.cancel_for_session(session_id);

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        tokio::spawn(async move {
            query.shutdown(grace).await;
        });

        self.events.emit(BridgeEvent::new(
            EVENT_SESSION_CLOSED,
            session_id,
            workspace_id,
            json!({ "reason": CloseReason::User }),
        ));

        Ok(())
    }

    /// Close every session, sequentially. Used on global shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = {
            let tables = self.tables.read().await;
            tables.sessions.keys().cloned().collect()
        };
        for id in ids {
            if let Err(err) = self.close(&id).await {
                tracing::warn!(session_id = %id, "Failed to close session: {err}");
            }
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Query handle for control operations (model/set, rewind, mcp).
    pub async fn query_for(&self, session_id: &str) -> crate::Result<Arc<VendorQuery>> {
        let tables = self.tables.read().await;
        let entry = tables
            .sessions
            .get(session_id)
            .ok_or_else(|| crate::Error::SessionNotFound(session_id.to_string()))?;
        if entry.status.is_terminal() {
            return Err(crate::Error::SessionInactive(session_id.to_string()));
        }
        Ok(Arc::clone(&entry.query))
    }

    /// Cached system.init snapshot for a session.
    pub async fn session_init(&self, session_id: &str) -> crate::Result<SessionInit> {
        let tables = self.tables.read().await;
        let entry = tables
            .sessions
            .get(session_id)
            .ok_or_else(|| crate::Error::SessionNotFound(session_id.to_string()))?;
        Ok(entry.init.clone().unwrap_or_default())
    }

    pub async fn status_of(&self, session_id: &str) -> Option<SessionStatus> {
        self.tables
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|e| e.status)
    }

    pub async fn workspace_of(&self, session_id: &str) -> Option<String> {
        self.tables
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|e| e.workspace_id.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    /// Snapshot of every live session.
    pub async fn sessions_snapshot(&self) -> Vec<SessionInfo> {
        self.tables
            .read()
            .await
            .sessions
            .values()
            .map(|entry| SessionInfo {
                session_id: entry.id.get(),
                workspace_id: entry.workspace_id.clone(),
                cwd: entry.cwd.clone(),
                status: entry.status,
                created_at: entry.created_at,
            })
            .collect()
    }

    // =========================================================================
    // Consumer loop
    // =========================================================================

    fn spawn_consumer(
        self: &Arc<Self>,
        workspace_id: String,
        shared_id: SharedSessionId,
        query: Arc<VendorQuery>,
        mut messages: mpsc::Receiver<VendorMessage>,
        live_input: Arc<AtomicBool>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut failure: Option<crate::Error> = None;

            while let Some(msg) = messages.recv().await {
                match msg {
                    VendorMessage::System(sys) => {
                        manager.handle_system(&shared_id, &workspace_id, sys).await;
                    }
                    VendorMessage::StreamEvent(se) => {
                        manager.events.emit(BridgeEvent::new(
                            EVENT_MESSAGE_DELTA,
                            shared_id.get(),
                            workspace_id.clone(),
                            json!({
                                "event": se.event,
                                "parentToolUseId": se.parent_tool_use_id,
                            }),
                        ));
                    }
                    VendorMessage::Assistant(ast) => {
                        manager.handle_assistant(&shared_id, &workspace_id, ast);
                    }
                    VendorMessage::User(user) => {
                        let live = live_input.load(Ordering::SeqCst);
                        manager.handle_user(&shared_id, &workspace_id, user, live);
                    }
                    VendorMessage::ToolProgress(tp) => {
                        manager.events.emit(BridgeEvent::new(
                            EVENT_TOOL_PROGRESS,
                            shared_id.get(),
                            workspace_id.clone(),
                            json!({
                                "toolName": tp.tool_name,
                                "toolUseId": tp.tool_use_id,
                                "elapsedSeconds": tp.elapsed_time_seconds,
                            }),
                        ));
                    }
                    VendorMessage::Result(res) => {
                        manager.handle_result(&shared_id, &workspace_id, res);
                    }
                    VendorMessage::ControlRequest(cr) => {
                        manager
                            .handle_control_request(&shared_id, &workspace_id, &query, cr)
                            .await;
                    }
                    VendorMessage::ControlCancel(cancel) => {
                        manager.permissions.abort_by_request(&cancel.request_id);
                    }
                    VendorMessage::AuthStatus(auth) => {
                        if let Some(message) = auth.error {
                            let err = crate::Error::Auth(message);
                            manager.events.emit(BridgeEvent::error(
                                &shared_id.get(),
                                &workspace_id,
                                &err,
                            ));
                            failure = Some(err);
                            break;
                        }
                    }
                    VendorMessage::ControlResponse(_) => {
                        // Acknowledged in the query reader; stray frames are noise
                    }
                    VendorMessage::Unknown(value) => {
                        tracing::debug!(
                            session_id = %shared_id.get(),
                            "Unknown vendor message: {}",
                            value.get("type").and_then(|v| v.as_str()).unwrap_or("?")
                        );
                    }
                }
            }

            manager
                .finish_session(&shared_id, &workspace_id, failure)
                .await;
        });
    }

    /// Promote the pending ID on init and announce the session.
    async fn handle_system(
        &self,
        shared_id: &SharedSessionId,
        workspace_id: &str,
        sys: SystemMessage,
    ) {
        if sys.subtype != "init" {
            tracing::debug!(subtype = %sys.subtype, "Unhandled system message");
            return;
        }

        let old_key = shared_id.get();
        let real_id = sys.session_id.clone().unwrap_or_else(|| old_key.clone());

        let announced = {
            let mut tables = self.tables.write().await;
            match tables.sessions.remove(&old_key) {
                Some(mut entry) => {
                    let was_starting = entry.status == SessionStatus::Starting;
                    entry.status = SessionStatus::Active;
                    entry.init = Some(SessionInit {
                        model: sys.model.clone().unwrap_or_default(),
                        tools: sys.tools.clone().unwrap_or_default(),
                        version: sys.claude_code_version.clone().unwrap_or_default(),
                        permission_mode: sys.permission_mode.clone().unwrap_or_default(),
                        mcp_servers: sys.mcp_servers.clone().unwrap_or_default(),
                        slash_commands: sys.slash_commands.clone().unwrap_or_default(),
                    });
                    shared_id.set(&real_id);
                    tables.sessions.insert(real_id.clone(), entry);
                    tables
                        .by_workspace
                        .insert(workspace_id.to_string(), real_id.clone());
                    was_starting
                }
                // Closed while init was in flight
                None => false,
            }
        };

        if !announced {
            return;
        }

        tracing::info!(
            session_id = %real_id,
            pending_id = %old_key,
            workspace_id = workspace_id,
            "Session active"
        );

        self.events.emit(BridgeEvent::new(
            EVENT_SESSION_STARTED,
            real_id,
            workspace_id,
            json!({
                "pendingSessionId": old_key,
                "model": sys.model,
                "tools": sys.tools,
                "cwd": sys.cwd,
                "version": sys.claude_code_version,
                "permissionMode": sys.permission_mode,
                "mcpServers": sys.mcp_servers,
                "slashCommands": sys.slash_commands,
            }),
        ));
    }

    fn handle_assistant(
        &self,
        shared_id: &SharedSessionId,
        workspace_id: &str,
        ast: AssistantMessage,
    ) {
        let session_id = shared_id.get();
        let uuid = ast
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let message_value = serde_json::to_value(&ast.message).unwrap_or(Value::Null);

        self.events.emit(BridgeEvent::new(
            EVENT_MESSAGE_COMPLETE,
            session_id.clone(),
            workspace_id,
            json!({
                "message": message_value,
                "uuid": uuid,
                "parentToolUseId": ast.parent_tool_use_id,
            }),
        ));

        for block in &ast.message.content {
            if let ContentBlock::ToolUse { id, name, input } = block {
                self.events.emit(BridgeEvent::new(
                    EVENT_TOOL_STARTED,
                    session_id.clone(),
                    workspace_id,
                    json!({
                        "toolUseId": id,
                        "toolName": name,
                        "input": input,
                    }),
                ));
            }
        }
    }

    /// User frames in a live turn carry tool results. A resumed vendor
    /// replays the prior transcript before this process has queued any
    /// input; those frames are logged and dropped so historical tool
    /// results never surface as live completions.
    fn handle_user(
        &self,
        shared_id: &SharedSessionId,
        workspace_id: &str,
        user: UserMessage,
        live: bool,
    ) {
        if !live {
            tracing::debug!(session_id = %shared_id.get(), "Replayed user message");
            return;
        }
        for block in &user.message.content {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            {
                self.events.emit(BridgeEvent::new(
                    EVENT_TOOL_COMPLETED,
                    shared_id.get(),
                    workspace_id,
                    json!({
                        "toolUseId": tool_use_id,
                        "output": serialize_tool_output(content),
                        "isError": is_error,
                    }),
                ));
            }
        }
    }

    fn handle_result(&self, shared_id: &SharedSessionId, workspace_id: &str, res: ResultMessage) {
        self.events.emit(BridgeEvent::new(
            EVENT_RESULT,
            shared_id.get(),
            workspace_id,
            json!({
                "success": !res.is_error,
                "subtype": res.subtype,
                "durationMs": res.duration_ms,
                "numTurns": res.num_turns,
                "totalCostUsd": res.total_cost_usd,
                "usage": res.usage_payload(),
                "errors": res.errors,
            }),
        ));
    }

    /// Route a vendor permission prompt through the approval table.
    async fn handle_control_request(
        self: &Arc<Self>,
        shared_id: &SharedSessionId,
        workspace_id: &str,
        query: &Arc<VendorQuery>,
        cr: ControlRequestMessage,
    ) {
        if cr.request.subtype != "can_use_tool" {
            tracing::debug!(subtype = %cr.request.subtype, "Unhandled control request");
            return;
        }

        let tool_use_id = cr
            .request
            .tool_use_id
            .clone()
            .unwrap_or_else(|| cr.request_id.clone());

        let rx = self
            .permissions
            .register(&tool_use_id, &cr.request_id, shared_id.clone());

        self.events.emit(BridgeEvent::new(
            EVENT_PERMISSION_REQUEST,
            shared_id.get(),
            workspace_id,
            json!({
                "toolUseId": tool_use_id,
                "toolName": cr.request.tool_name,
                "input": cr.request.input,
                "suggestions": cr.request.permission_suggestions,
                "blockedPath": cr.request.blocked_path,
                "decisionReason": cr.request.decision_reason,
                "agentId": cr.request.agent_id,
            }),
        ));

        let query = Arc::clone(query);
        let request_id = cr.request_id;
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(PermissionDecision::Allow {
                    updated_permissions,
                })) => {
                    let frame = message::permission_allow_frame(
                        &request_id,
                        &tool_use_id,
                        updated_permissions.as_ref(),
                    );
                    let _ = query.respond_permission(frame).await;
                }
                Ok(Ok(PermissionDecision::Deny { message: deny })) => {
                    let frame =
                        message::permission_deny_frame(&request_id, &tool_use_id, &deny);
                    let _ = query.respond_permission(frame).await;
                }
                Ok(Err(rejection)) => {
                    // Session close, vendor abort, or shutdown: the query is
                    // going away, no reply is owed.
                    tracing::debug!(
                        tool_use_id = %tool_use_id,
                        "Permission rejected without verdict: {rejection:?}"
                    );
                }
                Err(_) => {}
            }
        });
    }

    /// Consumer loop ended: drop the entry. A user close already said
    /// goodbye; any other path still owes the terminal event, and a loop
    /// that died before init counts as a failed start.
    async fn finish_session(
        &self,
        shared_id: &SharedSessionId,
        workspace_id: &str,
        failure: Option<crate::Error>,
    ) {
        let key = shared_id.get();
        let prior_status = {
            let mut tables = self.tables.write().await;
            match tables.sessions.remove(&key) {
                Some(entry) => {
                    if tables.by_workspace.get(&entry.workspace_id).map(String::as_str)
                        == Some(key.as_str())
                    {
                        tables.by_workspace.remove(&entry.workspace_id);
                    }
                    entry.status
                }
                None => return,
            }
        };

        if prior_status == SessionStatus::Closing {
            // User close: event already emitted, permissions already rejected
            return;
        }

        self.permissions.cancel_for_session(&key);

        let failure = match failure {
            Some(err) => Some(err),
            None if prior_status == SessionStatus::Starting => Some(crate::Error::MessageProcessing(
                "vendor process exited before announcing the session".to_string(),
            )),
            None => None,
        };

        let reason = if failure.is_some() {
            CloseReason::Error
        } else {
            CloseReason::Completed
        };

        if let Some(crate::Error::MessageProcessing(detail)) = &failure {
            self.events.emit(BridgeEvent::error(
                &key,
                workspace_id,
                &crate::Error::MessageProcessing(detail.clone()),
            ));
        }

        tracing::info!(session_id = %key, reason = ?reason, "Session ended");

        self.events.emit(BridgeEvent::new(
            EVENT_SESSION_CLOSED,
            key,
            workspace_id,
            json!({ "reason": reason }),
        ));
    }
}

/// Render a tool_result content value as display text.
fn serialize_tool_output(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let parts: Vec<String> = blocks
                .iter()
                .map(|block| match block.get("text").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => block.to_string(),
                })
                .collect();
            parts.join("\n")
        }
        other => other.to_string(),
    }
}

/// Current time in milliseconds since UNIX epoch
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
