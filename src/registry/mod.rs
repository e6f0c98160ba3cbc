//! Persistent session registry
//!
//! A single JSON document records, per workspace, which sessions are visible
//! and which are archived, plus metadata for every known session. Archiving
//! only hides a session: the `sessions` entry and the on-disk transcript are
//! never deleted. All mutations rewrite the file atomically (tmp + fsync +
//! rename) through an in-memory copy that is the source of truth after load.

pub mod scan;

pub use scan::{derive_project_paths, SessionHistory};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Display budget for session previews
const PREVIEW_MAX_CHARS: usize = 38;

/// Whether a registered session's transcript is still readable
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Active,
    Missing,
}

/// Metadata for one known session
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegistryEntry {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub cwd: String,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "lastActivity")]
    pub last_activity: u64,
    #[serde(default, rename = "transcriptPath")]
    pub transcript_path: Option<String>,
    #[serde(default, rename = "projectPath")]
    pub project_path: Option<String>,
    #[serde(default)]
    pub status: EntryStatus,
}

impl RegistryEntry {
    /// Entry for a session the bridge just announced, with transcript and
    /// project paths derived from the working directory.
    pub fn for_new_session(session_id: String, cwd: String) -> Self {
        let now = now_millis();
        let (project_path, transcript_path) = match derive_project_paths(&cwd, &session_id) {
            Some((project, transcript)) => (Some(project), Some(transcript)),
            None => (None, None),
        };
        Self {
            session_id,
            cwd,
            preview: None,
            created_at: now,
            last_activity: now,
            transcript_path,
            project_path,
            status: EntryStatus::Active,
        }
    }
}

/// Per-workspace visibility lists
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct WorkspaceRegistry {
    #[serde(default, rename = "projectPath")]
    pub project_path: Option<String>,
    #[serde(default, rename = "visibleSessionIds")]
    pub visible_session_ids: Vec<String>,
    #[serde(default, rename = "archivedSessionIds")]
    pub archived_session_ids: Vec<String>,
}

/// The persisted document
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegistryDoc {
    #[serde(default = "default_registry_version")]
    pub version: u32,
    #[serde(default)]
    pub workspaces: HashMap<String, WorkspaceRegistry>,
    #[serde(default)]
    pub sessions: HashMap<String, RegistryEntry>,
}

fn default_registry_version() -> u32 {
    1
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: 1,
            workspaces: HashMap::new(),
            sessions: HashMap::new(),
        }
    }
}

/// Curated registry of visible sessions per workspace (C5)
pub struct SessionRegistry {
    path: PathBuf,
    doc: RwLock<RegistryDoc>,
}

impl SessionRegistry {
    /// Load the registry from disk. A missing or corrupt file yields an
    /// empty registry and a clean rewrite on the next mutation.
    pub fn load(path: PathBuf) -> Self {
        let doc = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        "Corrupt registry, starting empty: {err}"
                    );
                    RegistryDoc::default()
                }
            },
            Err(_) => RegistryDoc::default(),
        };
        Self {
            path,
            doc: RwLock::new(doc),
        }
    }

    /// Visible sessions for a workspace, in stored order. Entries whose
    /// transcript has disappeared are flagged missing (and the flag is
    /// persisted).
    pub async fn visible(&self, workspace_id: &str) -> Vec<RegistryEntry> {
        let mut doc = self.doc.write().await;

        let visible_ids: Vec<String> = doc
            .workspaces
            .get(workspace_id)
            .map(|w| w.visible_session_ids.clone())
            .unwrap_or_default();

        let mut flagged = false;
        for session_id in &visible_ids {
            if let Some(entry) = doc.sessions.get_mut(session_id) {
                if entry.status == EntryStatus::Active {
                    if let Some(ref path) = entry.transcript_path {
                        if !Path::new(path).exists() {
                            entry.status = EntryStatus::Missing;
                            flagged = true;
                        }
                    }
                }
            }
        }

        if flagged {
            if let Err(err) = write_doc(&self.path, &doc) {
                tracing::warn!("Failed to persist missing flags: {err}");
            }
        }

        visible_ids
            .iter()
            .filter_map(|id| doc.sessions.get(id).cloned())
            .collect()
    }

    /// Archived sessions for a workspace, in stored order.
    pub async fn archived(&self, workspace_id: &str) -> Vec<RegistryEntry> {
        let doc = self.doc.read().await;
        doc.workspaces
            .get(workspace_id)
            .map(|w| {
                w.archived_session_ids
                    .iter()
                    .filter_map(|id| doc.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of one entry.
    pub async fn entry(&self, session_id: &str) -> Option<RegistryEntry> {
        self.doc.read().await.sessions.get(session_id).cloned()
    }

    /// Candidate sessions on disk for this workspace that are not yet
    /// imported (neither visible nor archived).
    pub async fn scan(
        &self,
        workspace_id: &str,
        workspace_path: &str,
    ) -> crate::Result<Vec<RegistryEntry>> {
        let known: std::collections::HashSet<String> = {
            let doc = self.doc.read().await;
            doc.workspaces
                .get(workspace_id)
                .map(|w| {
                    w.visible_session_ids
                        .iter()
                        .chain(w.archived_session_ids.iter())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let candidates = scan::scan_project_sessions(workspace_path)?;
        Ok(candidates
            .into_iter()
            .filter(|entry| !known.contains(&entry.session_id))
            .collect())
    }

    /// Add sessions to the visible list (deduplicated) and record their
    /// snapshots.
    pub async fn import(
        &self,
        workspace_id: &str,
        session_ids: Vec<String>,
        snapshots: Vec<RegistryEntry>,
    ) -> crate::Result<()> {
        let mut doc = self.doc.write().await;
        for snapshot in snapshots {
            doc.sessions.insert(snapshot.session_id.clone(), snapshot);
        }
        let workspace = doc.workspaces.entry(workspace_id.to_string()).or_default();
        for id in session_ids {
            if !workspace.visible_session_ids.contains(&id) {
                workspace.visible_session_ids.push(id);
            }
        }
        write_doc(&self.path, &doc)
    }

    /// Hide a session. Its metadata and transcript stay untouched.
    pub async fn archive(&self, workspace_id: &str, session_id: &str) -> crate::Result<()> {
        let mut doc = self.doc.write().await;
        let workspace = doc.workspaces.entry(workspace_id.to_string()).or_default();
        workspace.visible_session_ids.retain(|id| id != session_id);
        if !workspace
            .archived_session_ids
            .contains(&session_id.to_string())
        {
            workspace.archived_session_ids.push(session_id.to_string());
        }
        write_doc(&self.path, &doc)
    }

    /// Restore a hidden session to the visible list (appended at tail).
    pub async fn unarchive(&self, workspace_id: &str, session_id: &str) -> crate::Result<()> {
        let mut doc = self.doc.write().await;
        if !doc.sessions.contains_key(session_id) {
            return Err(crate::Error::Registry(format!(
                "Session not in registry: {session_id}"
            )));
        }
        let workspace = doc.workspaces.entry(workspace_id.to_string()).or_default();
        workspace.archived_session_ids.retain(|id| id != session_id);
        if !workspace
            .visible_session_ids
            .contains(&session_id.to_string())
        {
            workspace.visible_session_ids.push(session_id.to_string());
        }
        write_doc(&self.path, &doc)
    }

    /// Record a session the bridge announced as active.
    pub async fn register(
        &self,
        workspace_id: &str,
        entry: RegistryEntry,
    ) -> crate::Result<()> {
        let mut doc = self.doc.write().await;
        let session_id = entry.session_id.clone();
        doc.sessions.insert(session_id.clone(), entry);

        let workspace = doc.workspaces.entry(workspace_id.to_string()).or_default();
        workspace.archived_session_ids.retain(|id| id != &session_id);
        if !workspace.visible_session_ids.contains(&session_id) {
            workspace.visible_session_ids.push(session_id);
        }
        write_doc(&self.path, &doc)
    }

    /// Update activity (and optionally the preview) on message completion.
    /// Unknown sessions are ignored.
    pub async fn touch(
        &self,
        session_id: &str,
        preview: Option<String>,
    ) -> crate::Result<()> {
        let mut doc = self.doc.write().await;
        match doc.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.last_activity = now_millis();
                if let Some(preview) = preview {
                    entry.preview = Some(truncate_preview(&preview));
                }
            }
            None => return Ok(()),
        }
        write_doc(&self.path, &doc)
    }

    /// Load the session's transcript as ordered conversation items. A gone
    /// transcript flags the entry missing.
    pub async fn session_history(&self, session_id: &str) -> crate::Result<SessionHistory> {
        let transcript_path = {
            let mut doc = self.doc.write().await;
            let mut derived = false;
            {
                let entry = doc.sessions.get_mut(session_id).ok_or_else(|| {
                    crate::Error::Registry(format!("Session not in registry: {session_id}"))
                })?;

                if entry.transcript_path.is_none() {
                    if let Some((project, transcript)) =
                        derive_project_paths(&entry.cwd, session_id)
                    {
                        entry.project_path = Some(project);
                        entry.transcript_path = Some(transcript);
                        derived = true;
                    }
                }
            }
            if derived {
                let _ = write_doc(&self.path, &doc);
            }

            doc.sessions
                .get(session_id)
                .and_then(|e| e.transcript_path.clone())
                .ok_or_else(|| {
                    crate::Error::Registry(format!("Session has no transcript path: {session_id}"))
                })?
        };

        let path = Path::new(&transcript_path);
        if !path.exists() {
            let mut doc = self.doc.write().await;
            if let Some(entry) = doc.sessions.get_mut(session_id) {
                if entry.status != EntryStatus::Missing {
                    entry.status = EntryStatus::Missing;
                    let _ = write_doc(&self.path, &doc);
                }
            }
            return Err(crate::Error::Registry(format!(
                "Transcript not found: {transcript_path}"
            )));
        }

        scan::parse_session_history(session_id, path)
    }
}

/// Atomic write: sibling tmp file, fsync, rename into place.
fn write_doc(path: &Path, doc: &RegistryDoc) -> crate::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(doc)?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Shorten a preview to its display budget, on a char boundary.
fn truncate_preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_MAX_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(PREVIEW_MAX_CHARS - 1).collect();
    format!("{}…", cut.trim_end())
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
    use tempfile::TempDir;

    fn make_registry(dir: &TempDir) -> SessionRegistry {
        SessionRegistry::load(dir.path().join("threads.json"))
    }

    fn entry(session_id: &str) -> RegistryEntry {
        RegistryEntry {
            session_id: session_id.to_string(),
            cwd: "/p".to_string(),
            preview: Some("hello".to_string()),
            created_at: 1_700_000_000_000,
            last_activity: 1_700_000_000_000,
            transcript_path: None,
            project_path: None,
            status: EntryStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_register_and_visible_order() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);

        registry.register("w1", entry("s1")).await.unwrap();
        registry.register("w1", entry("s2")).await.unwrap();

        let visible = registry.visible("w1").await;
        let ids: Vec<&str> = visible.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(ids, ["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_on_visibility() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);

        registry.register("w1", entry("s1")).await.unwrap();
        registry.register("w1", entry("s1")).await.unwrap();
        assert_eq!(registry.visible("w1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_archive_is_not_delete() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);

        registry.register("w1", entry("s1")).await.unwrap();
        registry.archive("w1", "s1").await.unwrap();

        assert!(registry.visible("w1").await.is_empty());
        let archived = registry.archived("w1").await;
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].session_id, "s1");
        // The sessions map still has the entry
        assert!(registry.entry("s1").await.is_some());
    }

    #[tokio::test]
    async fn test_archive_unarchive_survives_cold_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threads.json");

        {
            let registry = SessionRegistry::load(path.clone());
            registry.register("w1", entry("s1")).await.unwrap();
            registry.register("w1", entry("s2")).await.unwrap();
            registry.archive("w1", "s1").await.unwrap();
        }

        // Cold restart
        let registry = SessionRegistry::load(path.clone());
        let visible = registry.visible("w1").await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].session_id, "s2");
        assert_eq!(registry.archived("w1").await.len(), 1);

        registry.unarchive("w1", "s1").await.unwrap();

        let registry = SessionRegistry::load(path);
        let ids: Vec<String> = registry
            .visible("w1")
            .await
            .iter()
            .map(|e| e.session_id.clone())
            .collect();
        // Restored at the tail
        assert_eq!(ids, ["s2", "s1"]);
        assert!(registry.archived("w1").await.is_empty());
    }

    #[tokio::test]
    async fn test_unarchive_unknown_session_fails() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);
        assert!(registry.unarchive("w1", "ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_import_dedupes() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);

        registry
            .import(
                "w1",
                vec!["s1".to_string(), "s2".to_string()],
                vec![entry("s1"), entry("s2")],
            )
            .await
            .unwrap();
        registry
            .import("w1", vec!["s1".to_string()], vec![entry("s1")])
            .await
            .unwrap();

        assert_eq!(registry.visible("w1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_touch_updates_activity_and_preview() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);
        registry.register("w1", entry("s1")).await.unwrap();

        registry
            .touch("s1", Some("a new preview of the conversation".to_string()))
            .await
            .unwrap();

        let entry = registry.entry("s1").await.unwrap();
        assert!(entry.last_activity >= 1_700_000_000_000);
        assert_eq!(
            entry.preview.as_deref(),
            Some("a new preview of the conversation")
        );

        // Unknown session is a no-op
        registry.touch("ghost", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threads.json");
        std::fs::write(&path, "{definitely not json").unwrap();

        let registry = SessionRegistry::load(path.clone());
        assert!(registry.visible("w1").await.is_empty());

        // The next mutation rewrites a clean file
        registry.register("w1", entry("s1")).await.unwrap();
        let reread = SessionRegistry::load(path);
        assert_eq!(reread.visible("w1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_partial_file_after_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threads.json");
        let registry = SessionRegistry::load(path.clone());
        registry.register("w1", entry("s1")).await.unwrap();

        // The tmp sibling never survives a completed write
        assert!(!path.with_extension("json.tmp").exists());
        let data = std::fs::read_to_string(&path).unwrap();
        let doc: RegistryDoc = serde_json::from_str(&data).unwrap();
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn test_visible_flags_missing_transcripts() {
        let dir = TempDir::new().unwrap();
        let registry = make_registry(&dir);

        let mut e = entry("s1");
        e.transcript_path = Some(
            dir.path()
                .join("nope.jsonl")
                .to_string_lossy()
                .to_string(),
        );
        registry.register("w1", e).await.unwrap();

        let visible = registry.visible("w1").await;
        assert_eq!(visible[0].status, EntryStatus::Missing);
    }

    #[test]
    fn test_truncate_preview() {
        assert_eq!(truncate_preview("short"), "short");
        assert_eq!(truncate_preview("line\none"), "line one");

        let long = "a very long preview that keeps going well past the display budget";
        let truncated = truncate_preview(long);
        assert!(truncated.chars().count() <= 38);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn test_registry_doc_defaults_from_empty_json() {
        let doc: RegistryDoc = serde_json::from_str("{}").unwrap();
        assert_eq!(doc.version, 1);
        assert!(doc.workspaces.is_empty());
        assert!(doc.sessions.is_empty());
    }

    #[test]
    fn test_entry_serialization_uses_camel_case() {
        let e = entry("s1");
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("lastActivity").is_some());
        assert_eq!(value["status"], "active");
    }
}
