//! Configuration loading.
//!
//! Config lives at `.parley/config.yaml`; every field has a default so a
//! missing file still produces a working local setup.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Builder backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Backend type; only "opencode" builders expose an HTTP server we talk to.
    pub r#type: String,
    pub port: u16,
    pub model: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            r#type: "opencode".to_string(),
            port: 8002,
            model: "opencode/gemini-3-flash".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    /// Directory containing the user's projects.
    pub root_project_dir: String,
    /// Port of the subagent orchestration server.
    pub orchestration_port: u16,
    /// Per-agent model overrides.
    pub models: HashMap<String, String>,
    /// Named builder backends.
    pub builders: HashMap<String, BuilderConfig>,
    /// Path to the voice system prompt.
    pub voice_system_prompt: String,
    /// RMS threshold above which a capture frame counts as speech.
    pub voice_speech_threshold: f32,
    /// Whether to auto-start the orchestration layer.
    pub orchestration_auto_start: bool,
    /// Seconds to wait for the orchestration layer to become healthy.
    pub orchestration_start_timeout_secs: f64,
    /// Isolated config directory for the orchestration layer.
    pub orchestration_config_dir: String,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            root_project_dir: ".".to_string(),
            orchestration_port: 4096,
            models: HashMap::new(),
            builders: HashMap::new(),
            voice_system_prompt: ".parley/prompts/assistant.md".to_string(),
            voice_speech_threshold: 500.0,
            orchestration_auto_start: true,
            orchestration_start_timeout_secs: 30.0,
            orchestration_config_dir: ".parley/opencode".to_string(),
        }
    }
}

impl ParleyConfig {
    /// Load config from a YAML file, falling back to defaults when the file
    /// is missing or unreadable.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn get_model(&self, agent_name: &str) -> &str {
        self.models
            .get(agent_name)
            .map(String::as_str)
            .unwrap_or("opencode/gemini-3-flash")
    }

    pub fn builder_url(&self, name: &str) -> Option<String> {
        self.builders.get(name).map(|b| format!("http://localhost:{}", b.port))
    }

    pub fn orchestration_url(&self) -> String {
        format!("http://localhost:{}", self.orchestration_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let config = ParleyConfig::load("/nonexistent/config.yaml");
        assert_eq!(config.orchestration_port, 4096);
        assert_eq!(config.root_project_dir, ".");
        assert!(config.builders.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
root_project_dir: /home/dev/projects
orchestration_port: 4158
builders:
  opencode-fast:
    type: opencode
    port: 8002
    model: opencode/gemini-3-flash
  opencode-pro:
    type: opencode
    port: 8003
    model: opencode/gemini-3-pro
models:
  planner: opencode/gemini-3-pro
"#,
        )
        .unwrap();

        let config = ParleyConfig::load(&path);
        assert_eq!(config.root_project_dir, "/home/dev/projects");
        assert_eq!(config.orchestration_port, 4158);
        assert_eq!(config.builders.len(), 2);
        assert_eq!(config.builders["opencode-pro"].port, 8003);
        assert_eq!(config.get_model("planner"), "opencode/gemini-3-pro");
        assert_eq!(config.get_model("unknown"), "opencode/gemini-3-flash");
        assert_eq!(config.builder_url("opencode-fast").unwrap(), "http://localhost:8002");
    }
}
