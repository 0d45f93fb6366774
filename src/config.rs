use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use std::{env, fs, path::PathBuf};

use crate::decomposer::Intent;
use crate::error::ConfigError;

/// Top-level configuration file (`taskmesh.json`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskmeshConfig {
    pub orchestrator: OrchestratorSettings,
    pub timeouts: RpcTimeouts,
    pub decomposer: DecomposerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Seconds between registry health sweeps. 0 disables the sweep.
    pub health_interval_secs: u64,
    /// Upper bound on concurrent outbound RPCs for the whole process.
    pub max_concurrent_rpcs: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            max_concurrent_rpcs: 64,
        }
    }
}

/// Per-RPC timeouts, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RpcTimeouts {
    pub health_secs: u64,
    pub registration_secs: u64,
    pub reasoning_secs: u64,
    pub tool_secs: u64,
    pub memory_secs: u64,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            health_secs: 2,
            registration_secs: 5,
            reasoning_secs: 300,
            tool_secs: 60,
            memory_secs: 30,
        }
    }
}

impl RpcTimeouts {
    pub fn health(&self) -> Duration {
        Duration::from_secs(self.health_secs)
    }

    pub fn registration(&self) -> Duration {
        Duration::from_secs(self.registration_secs)
    }

    pub fn reasoning(&self) -> Duration {
        Duration::from_secs(self.reasoning_secs)
    }

    pub fn tool(&self) -> Duration {
        Duration::from_secs(self.tool_secs)
    }

    pub fn memory(&self) -> Duration {
        Duration::from_secs(self.memory_secs)
    }
}

/// Knobs for plan construction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecomposerConfig {
    /// Intents whose plans get a `tool_execution` step.
    pub requires_tools: BTreeSet<Intent>,
    /// Tool invoked by the `tool_execution` step for each intent.
    pub tool_for_intent: BTreeMap<Intent, String>,
    pub memory_top_k: usize,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            requires_tools: [
                Intent::Coding,
                Intent::FileOperation,
                Intent::MlTraining,
                Intent::Automation,
            ]
            .into(),
            tool_for_intent: [
                (Intent::Coding, "code_tools".to_string()),
                (Intent::FileOperation, "file_ops".to_string()),
                (Intent::MlTraining, "automation".to_string()),
                (Intent::Automation, "automation".to_string()),
            ]
            .into(),
            memory_top_k: 5,
        }
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("TASKMESH_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("taskmesh").join("taskmesh.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("taskmesh.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Replace `${NAME}` references using `lookup`. Unknown names are left as-is.
fn expand_vars_with(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            match lookup(&name) {
                Some(val) if closed => out.push_str(&val),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_value(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => *s = expand_vars_with(s, lookup),
        Value::Array(items) => items.iter_mut().for_each(|v| expand_value(v, lookup)),
        Value::Object(map) => map.values_mut().for_each(|v| expand_value(v, lookup)),
        _ => {}
    }
}

impl TaskmeshConfig {
    /// Parse a config document, expanding `${VAR}` in string values.
    pub fn from_json_str(
        raw: &str,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut value: Value = serde_json::from_str(raw)?;
        expand_value(&mut value, lookup);
        Ok(serde_json::from_value(value)?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw, &|name| env::var(name).ok())
    }

    /// Load from the resolved config path, or fall back to defaults when no
    /// file exists.
    pub fn load() -> Result<Self, ConfigError> {
        match resolve_config_path() {
            Some(path) => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load_from(&path)
            }
            None => {
                tracing::debug!("No taskmesh.json found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "HOME_NET" => Some("10.0.0".to_string()),
            "TOOL" => Some("file_ops".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_expand_known_and_unknown_vars() {
        assert_eq!(expand_vars_with("${HOME_NET}.4:8001", &lookup), "10.0.0.4:8001");
        assert_eq!(expand_vars_with("${MISSING}/x", &lookup), "${MISSING}/x");
        assert_eq!(expand_vars_with("plain $ text", &lookup), "plain $ text");
        assert_eq!(expand_vars_with("${HOME_NET", &lookup), "${HOME_NET");
    }

    #[test]
    fn test_defaults() {
        let cfg = TaskmeshConfig::default();
        assert_eq!(cfg.timeouts.health(), Duration::from_secs(2));
        assert_eq!(cfg.timeouts.registration(), Duration::from_secs(5));
        assert_eq!(cfg.timeouts.reasoning(), Duration::from_secs(300));
        assert_eq!(cfg.timeouts.tool(), Duration::from_secs(60));
        assert_eq!(cfg.timeouts.memory(), Duration::from_secs(30));
        assert_eq!(cfg.orchestrator.max_concurrent_rpcs, 64);
        assert!(cfg.decomposer.requires_tools.contains(&Intent::Automation));
        assert!(!cfg.decomposer.requires_tools.contains(&Intent::Research));
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let raw = r#"{
            "timeouts": { "tool_secs": 10 },
            "decomposer": { "tool_for_intent": { "coding": "${TOOL}" } }
        }"#;
        let cfg = TaskmeshConfig::from_json_str(raw, &lookup).unwrap();
        assert_eq!(cfg.timeouts.tool_secs, 10);
        assert_eq!(cfg.timeouts.health_secs, 2);
        assert_eq!(
            cfg.decomposer.tool_for_intent.get(&Intent::Coding).map(String::as_str),
            Some("file_ops")
        );
        assert_eq!(cfg.orchestrator.health_interval_secs, 30);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "orchestrator": {{ "max_concurrent_rpcs": 8 }} }}"#
        )
        .unwrap();

        let cfg = TaskmeshConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.orchestrator.max_concurrent_rpcs, 8);
    }

    #[test]
    fn test_load_from_missing_file_reports_path() {
        let err = TaskmeshConfig::load_from(std::path::Path::new("/nonexistent/taskmesh.json"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/taskmesh.json"));
    }
}
