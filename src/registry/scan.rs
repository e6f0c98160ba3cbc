//! Transcript discovery and history parsing
//!
//! The vendor persists each session as `~/.claude/projects/<dir>/<id>.jsonl`
//! where `<dir>` is the working directory with separators dashed. Scanning
//! walks the project directory matching a workspace and extracts enough
//! metadata to offer the sessions for import; history loading replays a
//! transcript into renderable message items.

use crate::registry::{EntryStatus, RegistryEntry};
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lines inspected per transcript when scanning for metadata
const SCAN_LINE_LIMIT: usize = 50;

/// Replayed transcript content
#[derive(Debug, Serialize)]
pub struct SessionHistory {
    pub items: Vec<Value>,
    pub preview: Option<String>,
    #[serde(rename = "lastActivity")]
    pub last_activity: u64,
}

/// Convert a working directory to the vendor's project directory name
/// (`/Users/foo/bar` → `-Users-foo-bar`).
fn cwd_to_project_dir_name(cwd: &str) -> String {
    let normalized = cwd.replace('/', "-").replace('\\', "-");
    if normalized.starts_with('-') {
        normalized
    } else {
        format!("-{normalized}")
    }
}

/// The vendor's projects base directory.
fn claude_projects_dir() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(".claude").join("projects"))
}

/// Derive (project dir, transcript path) for a session from its cwd.
pub fn derive_project_paths(cwd: &str, session_id: &str) -> Option<(String, String)> {
    let project_dir_name = cwd_to_project_dir_name(cwd);
    let projects = claude_projects_dir()?;
    let project_path = projects.join(&project_dir_name);
    let transcript_path = project_path.join(format!("{session_id}.jsonl"));
    Some((
        project_path.to_string_lossy().to_string(),
        transcript_path.to_string_lossy().to_string(),
    ))
}

/// Scan the project directory matching a workspace path for session
/// transcripts. Most recently active first.
pub fn scan_project_sessions(cwd: &str) -> crate::Result<Vec<RegistryEntry>> {
    let Some(projects) = claude_projects_dir() else {
        return Ok(Vec::new());
    };
    if !projects.exists() {
        return Ok(Vec::new());
    }

    let project_dir = projects.join(cwd_to_project_dir_name(cwd));
    if !project_dir.is_dir() {
        return Ok(Vec::new());
    }

    scan_project_dir(&project_dir, cwd)
}

fn scan_project_dir(project_dir: &Path, cwd: &str) -> crate::Result<Vec<RegistryEntry>> {
    let mut sessions = Vec::new();

    for entry in std::fs::read_dir(project_dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().map(|e| e != "jsonl").unwrap_or(true) {
            continue;
        }
        let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(session) = extract_session_from_jsonl(&path, session_id, cwd, project_dir) {
            sessions.push(session);
        }
    }

    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    Ok(sessions)
}

/// Extract session metadata from one transcript. Returns None when the
/// transcript belongs to a different working directory; an unreadable file
/// yields an entry flagged missing.
fn extract_session_from_jsonl(
    jsonl_path: &Path,
    session_id: &str,
    expected_cwd: &str,
    project_dir: &Path,
) -> Option<RegistryEntry> {
    let (created_at, last_activity) = file_times(jsonl_path);

    let base = RegistryEntry {
        session_id: session_id.to_string(),
        cwd: expected_cwd.to_string(),
        preview: None,
        created_at,
        last_activity,
        transcript_path: Some(jsonl_path.to_string_lossy().to_string()),
        project_path: Some(project_dir.to_string_lossy().to_string()),
        status: EntryStatus::Active,
    };

    let file = match std::fs::File::open(jsonl_path) {
        Ok(file) => file,
        Err(_) => {
            return Some(RegistryEntry {
                status: EntryStatus::Missing,
                ..base
            })
        }
    };
    let reader = BufReader::new(file);

    let mut preview: Option<String> = None;
    let mut actual_cwd: Option<String> = None;

    for line in reader.lines().take(SCAN_LINE_LIMIT) {
        let Ok(line) = line else { continue };
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        if actual_cwd.is_none() {
            if let Some(cwd) = entry.get("cwd").and_then(Value::as_str) {
                actual_cwd = Some(cwd.to_string());
            }
        }

        if preview.is_none() && entry.get("type").and_then(Value::as_str) == Some("user") {
            if let Some(message) = entry.get("message") {
                let text = extract_text_from_message(message);
                if !text.is_empty() {
                    let truncated: String = text.chars().take(100).collect();
                    preview = Some(if text.chars().count() > 100 {
                        format!("{truncated}...")
                    } else {
                        truncated
                    });
                }
            }
        }

        if preview.is_some() && actual_cwd.is_some() {
            break;
        }
    }

    // Transcripts recorded under a different cwd belong to another workspace
    if let Some(ref session_cwd) = actual_cwd {
        let expected = expected_cwd.trim_end_matches('/');
        let actual = session_cwd.trim_end_matches('/');
        if expected != actual {
            return None;
        }
    }

    Some(RegistryEntry {
        cwd: actual_cwd.unwrap_or_else(|| expected_cwd.to_string()),
        preview,
        ..base
    })
}

/// Replay a transcript into ordered message items.
pub fn parse_session_history(
    session_id: &str,
    transcript_path: &Path,
) -> crate::Result<SessionHistory> {
    let file = std::fs::File::open(transcript_path)?;
    let reader = BufReader::new(file);
    let mut items = Vec::new();
    let mut preview: Option<String> = None;

    for (index, line) in reader.lines().enumerate() {
        let Ok(line) = line else { continue };
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let entry_type = entry.get("type").and_then(Value::as_str).unwrap_or("");
        if entry_type != "user" && entry_type != "assistant" {
            continue;
        }
        let message = entry.get("message").unwrap_or(&entry);
        let text = extract_text_from_message(message);
        if text.is_empty() {
            continue;
        }
        if preview.is_none() && entry_type == "user" {
            preview = Some(text.clone());
        }
        let message_id = entry
            .get("uuid")
            .and_then(Value::as_str)
            .map(|u| u.to_string())
            .unwrap_or_else(|| format!("{session_id}:{index}"));
        items.push(serde_json::json!({
            "id": message_id,
            "kind": "message",
            "role": entry_type,
            "text": text,
        }));
    }

    if preview.is_none() {
        preview = items
            .iter()
            .find_map(|item| item.get("text").and_then(Value::as_str).map(String::from));
    }

    let (_, last_activity) = file_times(transcript_path);

    Ok(SessionHistory {
        items,
        preview,
        last_activity,
    })
}

/// Join the text blocks of a transcript message.
fn extract_text_from_message(message: &Value) -> String {
    if let Some(content) = message.get("content").and_then(Value::as_array) {
        let parts: Vec<&str> = content
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .filter(|text| !text.is_empty())
            .collect();
        return parts.join("\n");
    }
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(text) = message.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    String::new()
}

fn file_times(path: &Path) -> (u64, u64) {
    let to_millis = |time: std::io::Result<SystemTime>| {
        time.unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    };
    match std::fs::metadata(path) {
        Ok(metadata) => (
            to_millis(metadata.created()),
            to_millis(metadata.modified()),
        ),
        Err(_) => (0, 0),
    }
}
