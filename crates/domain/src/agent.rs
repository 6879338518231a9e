//! Agent definitions.
//!
//! An agent is a named chat persona: a provider binding, a system prompt,
//! allow/deny scopes for tools, skills, capabilities and peer agents, plus
//! optional cron schedules. Definitions are immutable once loaded and
//! validated exhaustively up front so runtime code never re-checks them.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentDefinition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub agent_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub agent_type: AgentType,
    /// Provider binding. Required at runtime for `type = chat` agents; a
    /// chat agent without it resolves to `agent_not_available`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatSettings>,
    /// Required iff `type = external`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_allowlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_denylist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_allowlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_denylist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_allowlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_denylist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_allowlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_denylist: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub ui_visible: bool,
    #[serde(default)]
    pub api_exposed: bool,
    #[serde(default)]
    pub tool_exposure: ToolExposure,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<ScheduleConfig>,
    /// Instruction-skill source roots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    #[default]
    Chat,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExposure {
    #[default]
    Tools,
    Skills,
    Mixed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider binding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatProviderKind {
    /// In-process OpenAI HTTP API ("pi" is the historical alias).
    #[serde(rename = "openai", alias = "pi")]
    Openai,
    #[serde(rename = "openai-compatible")]
    OpenaiCompatible,
    #[serde(rename = "claude-cli")]
    ClaudeCli,
    #[serde(rename = "codex-cli")]
    CodexCli,
    #[serde(rename = "pi-cli")]
    PiCli,
}

impl ChatProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatProviderKind::Openai => "openai",
            ChatProviderKind::OpenaiCompatible => "openai-compatible",
            ChatProviderKind::ClaudeCli => "claude-cli",
            ChatProviderKind::CodexCli => "codex-cli",
            ChatProviderKind::PiCli => "pi-cli",
        }
    }

    /// CLI subprocess providers own their transcript on disk.
    pub fn is_cli(&self) -> bool {
        matches!(
            self,
            ChatProviderKind::ClaudeCli | ChatProviderKind::CodexCli | ChatProviderKind::PiCli
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub provider: ChatProviderKind,
    /// Models offered for this agent; the first is the default.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default)]
    pub config: ChatProviderConfig,
}

/// Per-provider tuning knobs. All optional; range-checked by
/// [`AgentDefinition::validate`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Bound on provider↔tool round trips within one turn (default 8).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_iterations: Option<u32>,
    /// Extra CLI flags for subprocess providers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Wrapper program prepended to subprocess invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

pub const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 8;

impl ChatProviderConfig {
    pub fn max_tool_iterations(&self) -> u32 {
        self.max_tool_iterations.unwrap_or(DEFAULT_MAX_TOOL_ITERATIONS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSettings {
    /// Endpoint that receives user input for this agent.
    pub input_url: String,
    /// Base URL this server is reachable at; callbacks are delivered to
    /// `<callbackBaseUrl>/external/sessions/<sessionId>/messages`.
    pub callback_base_url: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub id: String,
    /// 5-field POSIX cron expression.
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Shell command run before each scheduled turn; non-zero exit skips
    /// the run and stdout is appended to the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_title: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_one")]
    pub max_concurrent: u32,
    /// IANA timezone for cron evaluation (default UTC).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// CLI flags the server itself owns; agent `extraArgs` may not carry them.
fn reserved_flags(kind: ChatProviderKind) -> &'static [&'static str] {
    match kind {
        ChatProviderKind::ClaudeCli => &[
            "-p",
            "--print",
            "--output-format",
            "--input-format",
            "--resume",
            "--session-id",
        ],
        ChatProviderKind::CodexCli => &["exec", "proto", "--json", "-c"],
        ChatProviderKind::PiCli => &["--mode", "--session", "--no-interactive"],
        _ => &[],
    }
}

impl AgentDefinition {
    /// The name shown in UIs; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.agent_id
        } else {
            &self.display_name
        }
    }

    /// Validate this definition, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let id = self.agent_id.trim();
        if id.is_empty() {
            issues.push("agentId must be non-empty".to_string());
        }

        match self.agent_type {
            AgentType::Chat => {
                if self.external.is_some() {
                    issues.push(format!("agent '{id}': external config forbidden for type=chat"));
                }
            }
            AgentType::External => {
                if self.chat.is_some() {
                    issues.push(format!("agent '{id}': chat config forbidden for type=external"));
                }
                match &self.external {
                    None => issues.push(format!("agent '{id}': type=external requires external config")),
                    Some(ext) => {
                        if ext.input_url.trim().is_empty() {
                            issues.push(format!("agent '{id}': external.inputUrl must be non-empty"));
                        }
                        if ext.callback_base_url.trim().is_empty() {
                            issues.push(format!(
                                "agent '{id}': external.callbackBaseUrl must be non-empty"
                            ));
                        }
                    }
                }
            }
        }

        if let Some(chat) = &self.chat {
            let cfg = &chat.config;
            if let Some(t) = cfg.temperature {
                if !(0.0..=2.0).contains(&t) {
                    issues.push(format!("agent '{id}': temperature {t} out of range [0, 2]"));
                }
            }
            if cfg.max_tokens == Some(0) {
                issues.push(format!("agent '{id}': maxTokens must be >= 1"));
            }
            if let Some(n) = cfg.max_tool_iterations {
                if n == 0 || n > 64 {
                    issues.push(format!("agent '{id}': maxToolIterations {n} out of range [1, 64]"));
                }
            }
            let reserved = reserved_flags(chat.provider);
            for arg in &cfg.extra_args {
                let flag = arg.split('=').next().unwrap_or(arg);
                if reserved.contains(&flag) {
                    issues.push(format!(
                        "agent '{id}': extraArgs contains reserved flag '{flag}' for provider {}",
                        chat.provider.as_str()
                    ));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for schedule in &self.schedules {
            if schedule.id.trim().is_empty() {
                issues.push(format!("agent '{id}': schedule id must be non-empty"));
            } else if !seen.insert(schedule.id.clone()) {
                issues.push(format!("agent '{id}': duplicate schedule id '{}'", schedule.id));
            }
            if schedule.cron.split_whitespace().count() != 5 {
                issues.push(format!(
                    "agent '{id}': schedule '{}' cron '{}' is not a 5-field expression",
                    schedule.id, schedule.cron
                ));
            }
            if schedule.max_concurrent == 0 {
                issues.push(format!(
                    "agent '{id}': schedule '{}' maxConcurrent must be >= 1",
                    schedule.id
                ));
            }
        }

        issues
    }

    /// Minimal definition used widely by tests.
    pub fn minimal(agent_id: &str, provider: ChatProviderKind) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            display_name: String::new(),
            description: String::new(),
            agent_type: AgentType::Chat,
            chat: Some(ChatSettings {
                provider,
                models: Vec::new(),
                thinking: None,
                config: ChatProviderConfig::default(),
            }),
            external: None,
            system_prompt: None,
            tool_allowlist: None,
            tool_denylist: None,
            skill_allowlist: None,
            skill_denylist: None,
            capability_allowlist: None,
            capability_denylist: None,
            agent_allowlist: None,
            agent_denylist: None,
            ui_visible: true,
            api_exposed: false,
            tool_exposure: ToolExposure::Tools,
            schedules: Vec::new(),
            skills: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_chat_agent_is_valid() {
        let agent = AgentDefinition::minimal("helper", ChatProviderKind::Openai);
        assert!(agent.validate().is_empty());
        assert_eq!(agent.display_name(), "helper");
    }

    #[test]
    fn external_requires_external_config() {
        let mut agent = AgentDefinition::minimal("ext", ChatProviderKind::Openai);
        agent.agent_type = AgentType::External;
        agent.chat = None;
        let issues = agent.validate();
        assert!(issues.iter().any(|i| i.contains("requires external config")));
    }

    #[test]
    fn chat_config_forbidden_for_external() {
        let mut agent = AgentDefinition::minimal("ext", ChatProviderKind::Openai);
        agent.agent_type = AgentType::External;
        agent.external = Some(ExternalSettings {
            input_url: "http://localhost:9000/input".into(),
            callback_base_url: "http://localhost:8700".into(),
        });
        let issues = agent.validate();
        assert!(issues.iter().any(|i| i.contains("chat config forbidden")));
    }

    #[test]
    fn temperature_range_checked() {
        let mut agent = AgentDefinition::minimal("hot", ChatProviderKind::Openai);
        agent.chat.as_mut().unwrap().config.temperature = Some(3.5);
        assert!(!agent.validate().is_empty());
    }

    #[test]
    fn reserved_cli_flags_rejected() {
        let mut agent = AgentDefinition::minimal("coder", ChatProviderKind::ClaudeCli);
        agent.chat.as_mut().unwrap().config.extra_args =
            vec!["--verbose".into(), "--session-id=abc".into()];
        let issues = agent.validate();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("--session-id"));
    }

    #[test]
    fn pi_alias_parses_as_openai() {
        let json = serde_json::json!({
            "agentId": "a",
            "chat": { "provider": "pi" }
        });
        let agent: AgentDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(agent.chat.unwrap().provider, ChatProviderKind::Openai);
    }

    #[test]
    fn six_field_cron_rejected() {
        let mut agent = AgentDefinition::minimal("sched", ChatProviderKind::Openai);
        agent.schedules.push(ScheduleConfig {
            id: "tick".into(),
            cron: "0 0 * * * *".into(),
            prompt: Some("go".into()),
            pre_check: None,
            session_title: None,
            enabled: true,
            max_concurrent: 1,
            timezone: None,
        });
        let issues = agent.validate();
        assert!(issues.iter().any(|i| i.contains("5-field")));
    }

}
