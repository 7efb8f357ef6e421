use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowlineError, Result};

/// Environment variable that switches on debug logging for every workflow.
pub const DEBUG_ENV: &str = "FLOWLINE_DEBUG";

/// Top-level Flowline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_name")]
    pub name: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub debug_mode: bool,
    /// Emit step and composite lifecycle events when streaming.
    #[serde(default)]
    pub stream_intermediate_steps: bool,
    /// Keep streamed events on the stored run record.
    #[serde(default)]
    pub store_events: bool,
    /// Event types left out of the stored record, e.g. "StepContent".
    #[serde(default)]
    pub events_to_skip: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            name: default_workflow_name(),
            workflow_id: None,
            description: None,
            debug_mode: false,
            stream_intermediate_steps: false,
            store_events: false,
            events_to_skip: vec![],
        }
    }
}

fn default_workflow_name() -> String {
    "workflow".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String {
    "~/.flowline/sessions.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast capacity of the event bus.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "flowline=info,warn".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowlineError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowlineError::Config(e.to_string()))
    }

    /// Resolve the storage path (expand ~).
    pub fn storage_path(&self) -> PathBuf {
        let path = &self.storage.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }

    /// Config debug flag, or `FLOWLINE_DEBUG=true` in the environment.
    pub fn debug_enabled(&self) -> bool {
        self.workflow.debug_mode || debug_from_env()
    }
}

/// Whether `FLOWLINE_DEBUG` is set to a truthy value.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWLINE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWLINE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWLINE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWLINE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWLINE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.workflow.name, "workflow");
        assert!(!config.workflow.stream_intermediate_steps);
        assert!(config.workflow.events_to_skip.is_empty());
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.events.capacity, 256);
        assert_eq!(config.log.filter, "flowline=info,warn");
    }

    #[test]
    fn test_workflow_section() {
        let toml_str = r#"
[workflow]
name = "content-pipeline"
description = "Research, draft and review an article"
store_events = true
events_to_skip = ["StepContent"]

[storage]
backend = "memory"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workflow.name, "content-pipeline");
        assert!(config.workflow.store_events);
        assert_eq!(config.workflow.events_to_skip, vec!["StepContent"]);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.path, "~/.flowline/sessions.db");
    }

    #[test]
    fn test_storage_path_expands_home() {
        let mut config = AppConfig::default();
        config.storage.path = "/var/lib/flowline.db".into();
        assert_eq!(config.storage_path(), PathBuf::from("/var/lib/flowline.db"));

        if let Some(home) = dirs_home() {
            config.storage.path = "~/x/sessions.db".into();
            assert_eq!(config.storage_path(), home.join("x/sessions.db"));
        }
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result: std::result::Result<AppConfig, _> = toml::from_str("[storage]\nbackend = \"redis\"");
        assert!(result.is_err());
    }
}
