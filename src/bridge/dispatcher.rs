//! Command dispatch
//!
//! Parses UI requests, validates their params, and routes them to the
//! session manager and permission table. Every request gets exactly one
//! response carrying its id; validation failures are reported in the
//! response, never thrown.

use crate::bridge::permission::{PermissionDecision, PermissionHandler, DEFAULT_DENY_MESSAGE};
use crate::bridge::session::{SessionManager, StartOptions};
use crate::protocol::command::{
    self, CommandListResult, InitializeResult, McpServerStatus, McpSetResult, McpStatusResult,
    ModelInfo, ModelListResult, Request, Response, RewindResult, SessionStartResult, SlashCommand,
    SuccessResult,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capabilities advertised to the client on initialize
const CAPABILITIES: &[&str] = &[
    "sessions",
    "streaming",
    "permissions",
    "checkpointing",
    "mcp",
    "models",
];

/// Command dispatcher serving the UI protocol
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    permissions: Arc<PermissionHandler>,
    initialized: AtomicBool,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionManager>, permissions: Arc<PermissionHandler>) -> Self {
        Self {
            sessions,
            permissions,
            initialized: AtomicBool::new(false),
        }
    }

    /// Handle one request, producing exactly one response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id;

        // initialize must precede everything except close
        let gated = !matches!(
            request.method.as_str(),
            command::METHOD_INITIALIZE | command::METHOD_SESSION_CLOSE
        );
        if gated && !self.initialized.load(Ordering::SeqCst) {
            return Response::err(
                id,
                crate::Error::InvalidCommand("initialize must be called first".to_string())
                    .to_string(),
            );
        }

        let result = match request.method.as_str() {
            command::METHOD_INITIALIZE => self.initialize(request.params).await,
            command::METHOD_SESSION_START => self.session_start(request.params).await,
            command::METHOD_SESSION_RESUME => self.session_resume(request.params).await,
            command::METHOD_SESSION_CLOSE => self.session_close(request.params).await,
            command::METHOD_SESSION_REWIND => self.session_rewind(request.params).await,
            command::METHOD_MESSAGE_SEND => self.message_send(request.params).await,
            command::METHOD_MESSAGE_INTERRUPT => self.message_interrupt(request.params).await,
            command::METHOD_PERMISSION_RESPOND => self.permission_respond(request.params).await,
            command::METHOD_MODEL_LIST => self.model_list(request.params).await,
            command::METHOD_MODEL_SET => self.model_set(request.params).await,
            command::METHOD_COMMAND_LIST => self.command_list(request.params).await,
            command::METHOD_MCP_STATUS => self.mcp_status(request.params).await,
            command::METHOD_MCP_SET => self.mcp_set(request.params).await,
            other => Err(crate::Error::InvalidCommand(format!(
                "Unknown method: {other}"
            ))),
        };

        match result {
            Ok(value) => Response {
                id,
                result: Some(value),
                error: None,
            },
            Err(err) => Response::err(id, err.to_string()),
        }
    }

    // =========================================================================
    // Method handlers
    // =========================================================================

    async fn initialize(&self, params: Value) -> crate::Result<Value> {
        let params: command::InitializeParams = parse_params(params)?;
        tracing::info!(
            client = %params.client_info.name,
            version = %params.client_info.version,
            "Client initialized"
        );
        self.initialized.store(true, Ordering::SeqCst);
        to_value(InitializeResult {
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        })
    }

    async fn session_start(&self, params: Value) -> crate::Result<Value> {
        let params: command::SessionStartParams = parse_params(params)?;
        let options = StartOptions {
            model: params.model,
            permission_mode: params.permission_mode,
            claude_bin: params.claude_code_bin,
            enable_file_checkpointing: params.enable_file_checkpointing.unwrap_or(false),
            mcp_servers: params
                .mcp_servers
                .map(|servers| serde_json::to_value(servers).unwrap_or(Value::Null)),
            plugins: params.plugins,
            agents: params.agents,
        };
        let session_id = self
            .sessions
            .start(&params.workspace_id, &params.cwd, options)
            .await?;
        to_value(SessionStartResult { session_id })
    }

    async fn session_resume(&self, params: Value) -> crate::Result<Value> {
        let params: command::SessionResumeParams = parse_params(params)?;
        self.sessions
            .resume(
                &params.workspace_id,
                &params.session_id,
                &params.cwd,
                params.claude_code_bin,
            )
            .await?;
        to_value(SuccessResult { success: true })
    }

    async fn session_close(&self, params: Value) -> crate::Result<Value> {
        let params: command::SessionIdParams = parse_params(params)?;
        self.sessions.close(&params.session_id).await?;
        to_value(SuccessResult { success: true })
    }

    async fn session_rewind(&self, params: Value) -> crate::Result<Value> {
        let params: command::SessionRewindParams = parse_params(params)?;
        let query = self.sessions.query_for(&params.session_id).await?;
        let response = query
            .rewind(&params.user_message_id, params.dry_run.unwrap_or(false))
            .await?;
        let result: RewindResult =
            serde_json::from_value(response).unwrap_or(RewindResult {
                can_rewind: false,
                error: Some("rewind not supported by this session".to_string()),
                files_changed: None,
                insertions: None,
                deletions: None,
            });
        to_value(result)
    }

    async fn message_send(&self, params: Value) -> crate::Result<Value> {
        let params: command::MessageSendParams = parse_params(params)?;
        let images = params.images.unwrap_or_default();
        self.sessions
            .send_message(&params.session_id, &params.message, &images)
            .await?;
        to_value(SuccessResult { success: true })
    }

    async fn message_interrupt(&self, params: Value) -> crate::Result<Value> {
        let params: command::SessionIdParams = parse_params(params)?;
        self.sessions.interrupt(&params.session_id).await?;
        to_value(SuccessResult { success: true })
    }

    async fn permission_respond(&self, params: Value) -> crate::Result<Value> {
        let params: command::PermissionRespondParams = parse_params(params)?;
        let decision = match params.decision.as_str() {
            "allow" => PermissionDecision::Allow {
                updated_permissions: params.updated_permissions,
            },
            "deny" => PermissionDecision::Deny {
                message: params
                    .message
                    .unwrap_or_else(|| DEFAULT_DENY_MESSAGE.to_string()),
            },
            other => {
                return Err(crate::Error::InvalidCommand(format!(
                    "decision must be allow or deny, got {other}"
                )))
            }
        };
        let success = self.permissions.resolve(&params.tool_use_id, decision);
        to_value(SuccessResult { success })
    }

    async fn model_list(&self, params: Value) -> crate::Result<Value> {
        let _params: command::ModelListParams = parse_params(params)?;
        to_value(ModelListResult {
            models: model_catalog(),
        })
    }

    async fn model_set(&self, params: Value) -> crate::Result<Value> {
        let params: command::ModelSetParams = parse_params(params)?;
        let query = self.sessions.query_for(&params.session_id).await?;
        query.set_model(&params.model).await?;
        to_value(SuccessResult { success: true })
    }

    async fn command_list(&self, params: Value) -> crate::Result<Value> {
        let params: command::CommandListParams = parse_params(params)?;
        let session_id = match params.session_id {
            Some(id) if !id.trim().is_empty() => Some(id),
            _ => self
                .sessions
                .sessions_snapshot()
                .await
                .first()
                .map(|info| info.session_id.clone()),
        };

        let commands = match session_id {
            Some(id) => self
                .sessions
                .session_init(&id)
                .await?
                .slash_commands
                .into_iter()
                .map(|name| SlashCommand {
                    name,
                    description: None,
                })
                .collect(),
            None => Vec::new(),
        };
        to_value(CommandListResult { commands })
    }

    async fn mcp_status(&self, params: Value) -> crate::Result<Value> {
        let params: command::SessionIdParams = parse_params(params)?;
        let query = self.sessions.query_for(&params.session_id).await?;

        // Prefer a live answer; fall back to the init snapshot when the
        // vendor does not answer the control request.
        let servers = match query.mcp_status().await {
            Ok(response) => parse_server_list(&response),
            Err(_) => None,
        };
        let servers = match servers {
            Some(servers) => servers,
            None => self
                .sessions
                .session_init(&params.session_id)
                .await?
                .mcp_servers
                .into_iter()
                .map(|s| McpServerStatus {
                    name: s.name,
                    status: s.status,
                })
                .collect(),
        };
        to_value(McpStatusResult { servers })
    }

    async fn mcp_set(&self, params: Value) -> crate::Result<Value> {
        let params: command::McpSetParams = parse_params(params)?;
        let query = self.sessions.query_for(&params.session_id).await?;

        let requested: Vec<String> = params.servers.keys().cloned().collect();
        let servers = serde_json::to_value(&params.servers)?;
        let response = query.set_mcp_servers(&servers).await?;

        let result: McpSetResult =
            serde_json::from_value(response).unwrap_or_else(|_| McpSetResult {
                added: requested,
                removed: Vec::new(),
                errors: Default::default(),
            });
        to_value(result)
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> crate::Result<T> {
    serde_json::from_value(params).map_err(|e| crate::Error::InvalidCommand(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> crate::Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn parse_server_list(response: &Value) -> Option<Vec<McpServerStatus>> {
    let list = response.get("servers")?.as_array()?;
    Some(
        list.iter()
            .filter_map(|entry| {
                Some(McpServerStatus {
                    name: entry.get("name")?.as_str()?.to_string(),
                    status: entry
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                })
            })
            .collect(),
    )
}

/// Curated model catalog surfaced in the UI picker.
pub fn model_catalog() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "claude-opus-4-20250514".to_string(),
            display_name: "Claude Opus 4".to_string(),
            description: "Most capable, best for complex work".to_string(),
        },
        ModelInfo {
            id: "claude-sonnet-4-20250514".to_string(),
            display_name: "Claude Sonnet 4".to_string(),
            description: "Balanced speed and intelligence".to_string(),
        },
        ModelInfo {
            id: "claude-haiku-3-5-20241022".to_string(),
            display_name: "Claude Haiku 3.5".to_string(),
            description: "Fastest responses".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EventSink;
    use crate::config::BridgeConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn make_dispatcher() -> (Dispatcher, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventSink::new(tx);
        let permissions = Arc::new(PermissionHandler::new(Duration::from_secs(300)));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&permissions),
            events,
            BridgeConfig::default(),
        ));
        (Dispatcher::new(sessions, permissions), rx)
    }

    fn request(id: u32, method: &str, params: Value) -> Request {
        Request {
            id,
            method: method.to_string(),
            params,
        }
    }

    async fn initialize(dispatcher: &Dispatcher) {
        let response = dispatcher
            .handle(request(
                0,
                command::METHOD_INITIALIZE,
                json!({"clientInfo": {"name": "test", "version": "0.0.0"}}),
            ))
            .await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_methods_gated_until_initialize() {
        let (dispatcher, _rx) = make_dispatcher();
        let response = dispatcher
            .handle(request(1, command::METHOD_MODEL_LIST, json!({})))
            .await;
        assert!(response.error.unwrap().contains("initialize"));
    }

    #[tokio::test]
    async fn test_close_allowed_before_initialize() {
        let (dispatcher, _rx) = make_dispatcher();
        let response = dispatcher
            .handle(request(
                1,
                command::METHOD_SESSION_CLOSE,
                json!({"sessionId": "nope"}),
            ))
            .await;
        // Close is idempotent even for unknown sessions
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_initialize_returns_capabilities() {
        let (dispatcher, _rx) = make_dispatcher();
        let response = dispatcher
            .handle(request(
                7,
                command::METHOD_INITIALIZE,
                json!({"clientInfo": {"name": "deck", "version": "1.0"}}),
            ))
            .await;
        assert_eq!(response.id, 7);
        let caps = response.result.unwrap();
        assert!(caps["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "sessions"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_invalid_command() {
        let (dispatcher, _rx) = make_dispatcher();
        initialize(&dispatcher).await;
        let response = dispatcher
            .handle(request(2, "session/frobnicate", json!({})))
            .await;
        assert!(response.error.unwrap().contains("Unknown method"));
    }

    #[tokio::test]
    async fn test_malformed_params_reported_in_response() {
        let (dispatcher, _rx) = make_dispatcher();
        initialize(&dispatcher).await;
        let response = dispatcher
            .handle(request(3, command::METHOD_MESSAGE_SEND, json!({"bogus": 1})))
            .await;
        assert!(response.error.unwrap().contains("Invalid command"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_session() {
        let (dispatcher, _rx) = make_dispatcher();
        initialize(&dispatcher).await;
        let response = dispatcher
            .handle(request(
                4,
                command::METHOD_MESSAGE_SEND,
                json!({"sessionId": "ghost", "workspaceId": "w1", "message": "hi"}),
            ))
            .await;
        assert!(response.error.unwrap().contains("Session not found"));
    }

    #[tokio::test]
    async fn test_permission_respond_unknown_id_is_success_false() {
        let (dispatcher, _rx) = make_dispatcher();
        initialize(&dispatcher).await;
        let response = dispatcher
            .handle(request(
                5,
                command::METHOD_PERMISSION_RESPOND,
                json!({"sessionId": "s1", "toolUseId": "T404", "decision": "deny"}),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["success"], false);
    }

    #[tokio::test]
    async fn test_permission_respond_invalid_decision() {
        let (dispatcher, _rx) = make_dispatcher();
        initialize(&dispatcher).await;
        let response = dispatcher
            .handle(request(
                6,
                command::METHOD_PERMISSION_RESPOND,
                json!({"sessionId": "s1", "toolUseId": "T1", "decision": "maybe"}),
            ))
            .await;
        assert!(response.error.unwrap().contains("allow or deny"));
    }

    #[tokio::test]
    async fn test_model_list_returns_catalog() {
        let (dispatcher, _rx) = make_dispatcher();
        initialize(&dispatcher).await;
        let response = dispatcher
            .handle(request(8, command::METHOD_MODEL_LIST, json!({})))
            .await;
        let models = response.result.unwrap();
        assert!(!models["models"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_command_list_without_sessions_is_empty() {
        let (dispatcher, _rx) = make_dispatcher();
        initialize(&dispatcher).await;
        let response = dispatcher
            .handle(request(9, command::METHOD_COMMAND_LIST, json!({})))
            .await;
        assert_eq!(
            response.result.unwrap()["commands"].as_array().unwrap().len(),
            0
        );
    }

    #[test]
    fn test_parse_server_list() {
        let response = json!({"servers": [{"name": "files", "status": "connected"}]});
        let servers = parse_server_list(&response).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "files");

        assert!(parse_server_list(&json!({})).is_none());
        assert!(parse_server_list(&json!(null)).is_none());
    }
}
