//! Agent configuration.
//!
//! A JSON document with PascalCase keys, resolved from two locations:
//! `hostlink.json` beside the executable, then `hostlink.json` in the
//! per-machine data directory. The later file wins per field. Missing files
//! are non-fatal and missing fields fall back to hard-coded defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

pub const CONFIG_FILE: &str = "hostlink.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentConfig {
    /// WebSocket endpoint of the console, e.g. `wss://console.example/ws/agent`.
    pub console_url: String,
    /// Stable agent identity presented during authentication.
    pub agent_id: String,
    pub agent_token: String,
    /// tracing filter directive ("info", "hostlink=debug", ...).
    pub log_level: String,
    /// Directory for rolling log files; stderr when unset.
    pub log_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            console_url: "ws://127.0.0.1:9870/ws/agent".to_string(),
            agent_id: String::new(),
            agent_token: String::new(),
            log_level: "info".to_string(),
            log_path: None,
        }
    }
}

/// Candidate config files in application order (later wins).
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push(dir.join(CONFIG_FILE));
        }
    }
    paths.push(crate::platform::data_dir().join(CONFIG_FILE));
    paths
}

/// Load and merge the configuration from the standard locations.
pub fn load() -> AgentConfig {
    load_from(&candidate_paths())
}

/// Load and merge the given files in order. Exposed for tests and the
/// `--config` override.
pub fn load_from(paths: &[PathBuf]) -> AgentConfig {
    let mut merged = serde_json::Map::new();

    for path in paths {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => continue,
        };
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Object(map)) => {
                debug!("applying configuration from {}", path.display());
                for (key, value) in map {
                    merged.insert(key, value);
                }
            }
            Ok(_) => warn!("{} is not a JSON object, skipping", path.display()),
            Err(e) => warn!("failed to parse {}: {e}", path.display()),
        }
    }

    let mut config: AgentConfig = match serde_json::from_value(serde_json::Value::Object(merged)) {
        Ok(config) => config,
        Err(e) => {
            warn!("configuration has invalid field types ({e}), using defaults");
            AgentConfig::default()
        }
    };

    // The identity must exist before the first connection attempt.
    if config.agent_id.is_empty() {
        config.agent_id = uuid::Uuid::new_v4().to_string();
        warn!("no AgentId configured, generated {}", config.agent_id);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempFile(PathBuf);

    impl TempFile {
        fn new(name: &str, contents: &str) -> TempFile {
            let path = std::env::temp_dir().join(format!(
                "hostlink-test-{}-{}",
                std::process::id(),
                name
            ));
            std::fs::write(&path, contents).expect("write temp config");
            TempFile(path)
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let config = load_from(&[PathBuf::from("/nonexistent/hostlink.json")]);
        assert_eq!(config.console_url, AgentConfig::default().console_url);
        assert_eq!(config.log_level, "info");
        // generated identity
        assert!(!config.agent_id.is_empty());
    }

    #[test]
    fn later_file_wins_per_field() {
        let base = TempFile::new(
            "base.json",
            r#"{"ConsoleUrl":"wss://a/ws/agent","AgentId":"agent-1","AgentToken":"t1"}"#,
        );
        let over = TempFile::new("override.json", r#"{"AgentToken":"t2","LogLevel":"debug"}"#);

        let config = load_from(&[base.0.clone(), over.0.clone()]);
        assert_eq!(config.console_url, "wss://a/ws/agent");
        assert_eq!(config.agent_id, "agent-1");
        assert_eq!(config.agent_token, "t2");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn unparsable_file_is_skipped() {
        let bad = TempFile::new("bad.json", "{nope");
        let good = TempFile::new("good.json", r#"{"AgentId":"agent-2"}"#);
        let config = load_from(&[bad.0.clone(), good.0.clone()]);
        assert_eq!(config.agent_id, "agent-2");
    }
}
