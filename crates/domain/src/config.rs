//! Server configuration.
//!
//! The config file is JSON: agent definitions, plugin toggles, MCP server
//! launch specs, and session cache knobs. `${NAME}` references inside any
//! string value are substituted from the process environment before the
//! document is parsed. A missing config file is non-fatal (empty agent
//! list); a malformed one is a startup error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentDefinition;
use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    /// Plugin toggles and opaque per-plugin options (keyed by plugin id).
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    /// Capacity of the in-memory session cache.
    #[serde(default = "d_max_cached")]
    pub max_cached: usize,
    /// When true, pi-cli transcripts are mirrored into the event store.
    #[serde(default = "default_true")]
    pub mirror_pi_session_history: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_cached: d_max_cached(),
            mirror_pi_session_history: true,
        }
    }
}

fn d_max_cached() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Parse from a JSON string, applying `${NAME}` env substitution first.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Self::from_json_str_with(raw, |name| std::env::var(name).ok())
    }

    /// Parse with an explicit variable lookup (tests supply their own).
    pub fn from_json_str_with(
        raw: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::InvalidConfig(format!("config is not valid JSON: {e}")))?;
        substitute_env(&mut value, &lookup);
        let config: ServerConfig = serde_json::from_value(value)
            .map_err(|e| Error::InvalidConfig(format!("config shape: {e}")))?;
        let issues = config.validate();
        if issues.is_empty() {
            Ok(config)
        } else {
            Err(Error::InvalidConfig(issues.join("; ")))
        }
    }

    /// Load from a file. A missing file yields the default (empty) config.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_json_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no agents config file, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.sessions.max_cached < 1 {
            issues.push("sessions.maxCached must be >= 1".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            issues.extend(agent.validate());
            if !seen.insert(agent.agent_id.clone()) {
                issues.push(format!("duplicate agent id: {}", agent.agent_id));
            }
        }
        for (i, mcp) in self.mcp_servers.iter().enumerate() {
            if mcp.command.trim().is_empty() {
                issues.push(format!("mcpServers[{i}]: command must be non-empty"));
            }
        }
        issues
    }
}

/// Replace `${NAME}` references in every string value of a JSON document.
/// Unset variables leave the reference untouched.
pub fn substitute_env(value: &mut Value, lookup: &impl Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = substitute_str(s, lookup);
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_env(item, lookup);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env(v, lookup);
            }
        }
        _ => {}
    }
}

fn substitute_str(s: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(v) => out.push_str(&v),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process environment knobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings taken from process environment variables rather than the
/// config file.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub data_dir: PathBuf,
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub max_messages_per_minute: i64,
    pub max_tool_calls_per_minute: i64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            port: 8700,
            openai_api_key: None,
            openai_base_url: None,
            max_messages_per_minute: 60,
            max_tool_calls_per_minute: 30,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_base_url: std::env::var("OPENAI_BASE_URL").ok(),
            max_messages_per_minute: std::env::var("MAX_MESSAGES_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_messages_per_minute),
            max_tool_calls_per_minute: std::env::var("MAX_TOOL_CALLS_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_tool_calls_per_minute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_parses_with_defaults() {
        let config = ServerConfig::from_json_str("{}").unwrap();
        assert!(config.agents.is_empty());
        assert_eq!(config.sessions.max_cached, 100);
        assert!(config.sessions.mirror_pi_session_history);
    }

    #[test]
    fn env_substitution_applies_to_nested_strings() {
        let raw = r#"{
            "agents": [{
                "agentId": "a",
                "systemPrompt": "key is ${TEST_KEY}",
                "chat": {"provider": "openai"}
            }]
        }"#;
        let config = ServerConfig::from_json_str_with(raw, |name| {
            (name == "TEST_KEY").then(|| "sekrit".to_string())
        })
        .unwrap();
        assert_eq!(config.agents[0].system_prompt.as_deref(), Some("key is sekrit"));
    }

    #[test]
    fn unset_variables_stay_verbatim() {
        let mut value = serde_json::json!({"x": "a ${NOPE} b"});
        substitute_env(&mut value, &|_| None);
        assert_eq!(value["x"], "a ${NOPE} b");
    }

    #[test]
    fn multiple_references_in_one_string() {
        let mut value = serde_json::json!("${A}-${B}");
        substitute_env(&mut value, &|name| Some(name.to_lowercase()));
        assert_eq!(value, "a-b");
    }

    #[test]
    fn unterminated_reference_is_literal() {
        let mut value = serde_json::json!("${A");
        substitute_env(&mut value, &|_| Some("x".into()));
        assert_eq!(value, "${A");
    }

    #[test]
    fn zero_max_cached_rejected() {
        let err = ServerConfig::from_json_str(r#"{"sessions": {"maxCached": 0}}"#).unwrap_err();
        assert_eq!(err.code(), "invalid_config");
    }

    #[test]
    fn duplicate_agents_rejected() {
        let raw = r#"{"agents": [{"agentId": "a"}, {"agentId": "a"}]}"#;
        let err = ServerConfig::from_json_str(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate agent id"));
    }

    #[test]
    fn plugin_options_are_preserved() {
        let raw = r#"{"plugins": {"weather": {"enabled": false, "city": "Oslo"}}}"#;
        let config = ServerConfig::from_json_str(raw).unwrap();
        let plugin = &config.plugins["weather"];
        assert!(!plugin.enabled);
        assert_eq!(plugin.options["city"], "Oslo");
    }

    #[test]
    fn missing_file_is_non_fatal() {
        let config = ServerConfig::load(Path::new("/definitely/not/here.json")).unwrap();
        assert!(config.agents.is_empty());
    }
}
