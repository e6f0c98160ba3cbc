//! Command protocol: UI → bridge requests and their responses
//!
//! Line-framed JSON. Each command carries a client-assigned `id`; the bridge
//! answers every command with exactly one response bearing the same `id`.
//! Unsolicited traffic uses the event envelope in [`crate::protocol::event`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Request from the UI client
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u32,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Response to a request (success carries `result`, failure carries `error`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(id: u32, result: T) -> Self {
        Self {
            id,
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn err(id: u32, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

// Method names
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_START: &str = "session/start";
pub const METHOD_SESSION_RESUME: &str = "session/resume";
pub const METHOD_SESSION_CLOSE: &str = "session/close";
pub const METHOD_SESSION_REWIND: &str = "session/rewind";
pub const METHOD_MESSAGE_SEND: &str = "message/send";
pub const METHOD_MESSAGE_INTERRUPT: &str = "message/interrupt";
pub const METHOD_PERMISSION_RESPOND: &str = "permission/respond";
pub const METHOD_MODEL_LIST: &str = "model/list";
pub const METHOD_MODEL_SET: &str = "model/set";
pub const METHOD_COMMAND_LIST: &str = "command/list";
pub const METHOD_MCP_STATUS: &str = "mcp/status";
pub const METHOD_MCP_SET: &str = "mcp/set";

// --- Request params ---

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartParams {
    pub workspace_id: String,
    pub cwd: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub claude_code_bin: Option<String>,
    #[serde(default)]
    pub enable_file_checkpointing: Option<bool>,
    #[serde(default)]
    pub mcp_servers: Option<HashMap<String, McpServerConfig>>,
    #[serde(default)]
    pub plugins: Option<Value>,
    #[serde(default)]
    pub agents: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumeParams {
    pub workspace_id: String,
    pub session_id: String,
    pub cwd: String,
    #[serde(default)]
    pub claude_code_bin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRewindParams {
    pub session_id: String,
    pub user_message_id: String,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSendParams {
    pub session_id: String,
    pub workspace_id: String,
    pub message: String,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRespondParams {
    pub session_id: String,
    pub tool_use_id: String,
    /// "allow" or "deny"
    pub decision: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub updated_permissions: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelListParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSetParams {
    pub session_id: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandListParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpSetParams {
    pub session_id: String,
    pub servers: HashMap<String, McpServerConfig>,
}

/// MCP server configuration passed through to the vendor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

// --- Response types ---

#[derive(Debug, Clone, Serialize)]
pub struct InitializeResult {
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartResult {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuccessResult {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindResult {
    pub can_rewind: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insertions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u32>,
}

/// One entry in the model catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelListResult {
    pub models: Vec<ModelInfo>,
}

/// Slash command exposed by the vendor session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlashCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandListResult {
    pub commands: Vec<SlashCommand>,
}

/// MCP server status as reported by the vendor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerStatus {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct McpStatusResult {
    pub servers: Vec<McpServerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSetResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub errors: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults_params_to_null() {
        let request: Request =
            serde_json::from_str(r#"{"id":1,"method":"initialize"}"#).expect("request to parse");
        assert_eq!(request.id, 1);
        assert_eq!(request.method, METHOD_INITIALIZE);
        assert_eq!(request.params, json!(null));
    }

    #[test]
    fn test_response_ok_serializes_result() {
        let response = Response::ok(2, SuccessResult { success: true });
        let value = serde_json::to_value(response).expect("response to serialize");
        assert_eq!(value.get("id"), Some(&json!(2)));
        assert_eq!(value.get("result"), Some(&json!({"success": true})));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_response_err_serializes_error() {
        let response = Response::err(3, "Workspace w1 already has an active session");
        let value = serde_json::to_value(response).expect("response to serialize");
        assert_eq!(value.get("id"), Some(&json!(3)));
        assert!(value.get("result").is_none());
        assert!(value["error"].as_str().unwrap().contains("w1"));
    }

    #[test]
    fn test_session_start_params_minimal() {
        let params: SessionStartParams =
            serde_json::from_value(json!({"workspaceId": "w1", "cwd": "/p"})).unwrap();
        assert_eq!(params.workspace_id, "w1");
        assert_eq!(params.cwd, "/p");
        assert!(params.model.is_none());
        assert!(params.mcp_servers.is_none());
    }

    #[test]
    fn test_session_start_params_full() {
        let params: SessionStartParams = serde_json::from_value(json!({
            "workspaceId": "w1",
            "cwd": "/p",
            "model": "claude-sonnet-4-20250514",
            "permissionMode": "acceptEdits",
            "enableFileCheckpointing": true,
            "mcpServers": {"files": {"type": "stdio", "command": "mcp-files"}},
        }))
        .unwrap();
        assert_eq!(params.permission_mode.as_deref(), Some("acceptEdits"));
        assert_eq!(params.enable_file_checkpointing, Some(true));
        let servers = params.mcp_servers.unwrap();
        assert_eq!(servers["files"].command.as_deref(), Some("mcp-files"));
    }

    #[test]
    fn test_permission_respond_params() {
        let params: PermissionRespondParams = serde_json::from_value(json!({
            "sessionId": "s1",
            "toolUseId": "T1",
            "decision": "deny",
            "message": "no",
        }))
        .unwrap();
        assert_eq!(params.tool_use_id, "T1");
        assert_eq!(params.decision, "deny");
        assert_eq!(params.message.as_deref(), Some("no"));
    }

    #[test]
    fn test_rewind_result_omits_empty_fields() {
        let result = RewindResult {
            can_rewind: true,
            error: None,
            files_changed: None,
            insertions: None,
            deletions: None,
        };
        let value = serde_json::to_value(result).unwrap();
        assert_eq!(value.get("canRewind"), Some(&json!(true)));
        assert!(value.get("filesChanged").is_none());
    }
}
