//! Clawdeck configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main clawdeck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClawdeckConfig {
    /// Bridge configuration
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Path to the Claude Code CLI binary (None = search PATH and
    /// well-known install locations)
    pub claude_bin: Option<String>,

    /// Permission mode applied when a session does not specify one
    pub default_permission_mode: String,

    /// Milliseconds before a pending tool approval auto-denies
    pub permission_timeout_ms: u64,

    /// Seconds to wait for a clean child exit before force-killing
    pub shutdown_grace_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            claude_bin: None,
            default_permission_mode: "default".to_string(),
            permission_timeout_ms: 300_000,
            shutdown_grace_secs: 5,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for application data
    pub data_dir: PathBuf,

    /// Session registry file
    pub registry_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clawdeck");

        Self {
            registry_path: base.join("threads.json"),
            data_dir: base,
        }
    }
}

impl ClawdeckConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Effective permission timeout.
    pub fn permission_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.bridge.permission_timeout_ms)
    }

    /// Effective shutdown grace period.
    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.bridge.shutdown_grace_secs)
    }
}
