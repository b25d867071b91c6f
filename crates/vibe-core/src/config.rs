//! Configuration management for Vibe
//!
//! Repository-level settings for the HTTP/WebSocket server, the broadcast
//! hub (heartbeat, buffers, auth tokens) and the patch engine (event log and
//! document locations).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, VibeError};

/// Repository-level Vibe configuration
///
/// Loaded from `.vibe/config.toml` in the repo root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VibeConfig {
    /// HTTP/WebSocket listener
    #[serde(default)]
    pub server: ServerSettings,

    /// Broadcast hub behaviour
    #[serde(default)]
    pub hub: HubSettings,

    /// Patch engine defaults
    #[serde(default)]
    pub patch: PatchSettings,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Broadcast hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Seconds between heartbeat sweeps
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Connections idle for longer than this are evicted
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Outbound frames buffered per connection before frames are dropped
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Whether `subscribe` requires a prior successful `auth`
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// Static token table: token -> identity
    #[serde(default)]
    pub auth_tokens: HashMap<String, TokenIdentity>,
}

/// Identity a static token resolves to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIdentity {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Patch engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSettings {
    /// Append-only JSONL event log
    #[serde(default = "default_event_log")]
    pub event_log: PathBuf,

    /// Root directory JSON documents are resolved against
    #[serde(default = "default_documents_root")]
    pub documents_root: PathBuf,

    /// Default for `ApplyOptions::rollback_on_failure`
    #[serde(default = "default_rollback_on_failure")]
    pub rollback_on_failure: bool,
}

// Default value providers
fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_require_auth() -> bool {
    true
}

fn default_event_log() -> PathBuf {
    PathBuf::from(".vibe/events.jsonl")
}

fn default_documents_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_rollback_on_failure() -> bool {
    true
}

impl VibeConfig {
    /// Load configuration from `.vibe/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".vibe/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| VibeError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.vibe/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(".vibe");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| VibeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Socket address string for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// Resolve a configured path against the repo root unless already absolute
    pub fn resolve(&self, repo_root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            repo_root.join(path)
        }
    }
}

impl HubSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            outbound_buffer: default_outbound_buffer(),
            require_auth: default_require_auth(),
            auth_tokens: HashMap::new(),
        }
    }
}

impl Default for PatchSettings {
    fn default() -> Self {
        Self {
            event_log: default_event_log(),
            documents_root: default_documents_root(),
            rollback_on_failure: default_rollback_on_failure(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = VibeConfig::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.hub.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.hub.stale_after(), Duration::from_secs(300));
        assert!(config.hub.require_auth);
        assert!(config.patch.rollback_on_failure);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = VibeConfig::from_toml(
            r#"
[server]
port = 9000

[hub]
stale_after_secs = 30

[hub.auth_tokens.secret]
user_id = "u1"
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.hub.stale_after_secs, 30);
        assert_eq!(config.hub.heartbeat_interval_secs, 60);
        assert_eq!(
            config.hub.auth_tokens.get("secret").unwrap().user_id.as_deref(),
            Some("u1")
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = VibeConfig::from_toml("server = [");
        assert!(matches!(result, Err(VibeError::Config(_))));
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = VibeConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());

        let loaded = VibeConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.server.port, 8787);
        assert_eq!(loaded.patch.event_log, PathBuf::from(".vibe/events.jsonl"));
    }

    #[test]
    fn test_load_missing_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = VibeConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.listen_addr(), "0.0.0.0:8787");
    }
}
