//! Installation diagnostics
//!
//! Verifies that the Claude Code CLI and its Node.js runtime are reachable
//! before any session is attempted. Runs outside the command protocol; the
//! desktop shell calls it directly and shows the result in onboarding.

use serde::{Deserialize, Serialize};
use std::env;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Diagnostic result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    /// Both the CLI and the runtime check out
    pub ok: bool,
    pub claude_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_version: Option<String>,
    pub node_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// PATH used for the probes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Check the Claude Code CLI and Node.js runtime.
pub async fn run_doctor(claude_bin: Option<&str>) -> DoctorReport {
    let path_env = build_node_path_env(claude_bin);

    let (node_ok, node_version, node_details) =
        probe_version("node", path_env.as_deref()).await;

    let claude_name = claude_bin.filter(|v| !v.trim().is_empty()).unwrap_or("claude");
    let (claude_ok, claude_version, claude_details) =
        probe_version(claude_name, path_env.as_deref()).await;

    let details = match (node_details, claude_details) {
        (Some(n), Some(c)) => Some(format!("{n}; {c}")),
        (Some(n), None) => Some(n),
        (None, Some(c)) => Some(c),
        (None, None) => None,
    };

    DoctorReport {
        ok: node_ok && claude_ok,
        claude_ok,
        claude_version,
        node_ok,
        node_version,
        details,
        path: path_env,
    }
}

/// Run `<binary> --version` under a timeout.
async fn probe_version(
    binary: &str,
    path_env: Option<&str>,
) -> (bool, Option<String>, Option<String>) {
    let mut command = Command::new(binary);
    if let Some(path) = path_env {
        command.env("PATH", path);
    }
    command.arg("--version");
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    match timeout(VERSION_CHECK_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => {
            if output.status.success() {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!version.is_empty(), Some(version).filter(|v| !v.is_empty()), None)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                (false, None, Some(stderr))
            }
        }
        Ok(Err(err)) => {
            if err.kind() == ErrorKind::NotFound {
                (false, None, Some(format!("{binary} not found on PATH")))
            } else {
                (false, None, Some(err.to_string()))
            }
        }
        Err(_) => (
            false,
            None,
            Some(format!("Timed out while checking {binary}")),
        ),
    }
}

/// Build a PATH that covers the usual Node.js and Claude Code install
/// locations on top of the inherited environment.
pub(crate) fn build_node_path_env(claude_bin: Option<&str>) -> Option<String> {
    let mut paths: Vec<String> = env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .collect();

    let mut extras: Vec<String> = [
        "/opt/homebrew/bin",
        "/usr/local/bin",
        "/usr/bin",
        "/bin",
        "/usr/sbin",
        "/sbin",
    ]
    .into_iter()
    .map(|value| value.to_string())
    .collect();

    if let Ok(home) = env::var("HOME") {
        extras.push(format!("{home}/.local/bin"));
        extras.push(format!("{home}/.local/share/mise/shims"));
        extras.push(format!("{home}/.cargo/bin"));
        extras.push(format!("{home}/.bun/bin"));

        let nvm_root = Path::new(&home).join(".nvm/versions/node");
        if let Ok(entries) = std::fs::read_dir(nvm_root) {
            for entry in entries.flatten() {
                let bin_path = entry.path().join("bin");
                if bin_path.is_dir() {
                    extras.push(bin_path.to_string_lossy().to_string());
                }
            }
        }
    }

    if let Some(bin_path) = claude_bin.filter(|v| !v.trim().is_empty()) {
        if let Some(parent) = Path::new(bin_path).parent() {
            extras.push(parent.to_string_lossy().to_string());
        }
    }

    for extra in extras {
        if !paths.contains(&extra) {
            paths.push(extra);
        }
    }

    if paths.is_empty() {
        None
    } else {
        Some(paths.join(":"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_node_path_env_includes_standard_dirs() {
        let path = build_node_path_env(None).unwrap();
        assert!(path.contains("/usr/local/bin"));
        assert!(path.contains("/usr/bin"));
    }

    #[test]
    fn test_build_node_path_env_includes_custom_bin_parent() {
        let path = build_node_path_env(Some("/opt/tools/claude/claude")).unwrap();
        assert!(path.contains("/opt/tools/claude"));
    }

    #[test]
    fn test_build_node_path_env_dedupes() {
        let path = build_node_path_env(None).unwrap();
        let count = path.split(':').filter(|p| *p == "/usr/bin").count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_probe_missing_binary() {
        let (ok, version, details) = probe_version("definitely-not-a-binary-xyz", None).await;
        assert!(!ok);
        assert!(version.is_none());
        assert!(details.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_doctor_report_serializes_camel_case() {
        let report = DoctorReport {
            ok: false,
            claude_ok: false,
            claude_version: None,
            node_ok: true,
            node_version: Some("v20.11.0".to_string()),
            details: None,
            path: None,
        };
        let value = serde_json::to_value(report).unwrap();
        assert_eq!(value["claudeOk"], false);
        assert_eq!(value["nodeOk"], true);
        assert_eq!(value["nodeVersion"], "v20.11.0");
        assert!(value.get("claudeVersion").is_none());
    }
}
