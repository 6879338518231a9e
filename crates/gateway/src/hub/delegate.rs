//! Agent-to-agent delegation: the `agents_message` tool.
//!
//! Lets one agent message another. The target session resolves per the
//! `session` argument (`latest`, `create`, `latest-or-create`, or an
//! explicit id); dispatch is sync (run inline, raced against the timeout)
//! or async (spawned). A busy target queues the message instead. Whatever
//! way the target turn ends, the hub delivers an `agent_callback` into the
//! caller session and seeds a follow-up turn there.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use parlor_domain::error::{Error, Result};
use parlor_domain::event::{ChatEvent, EventPayload};
use parlor_domain::message::ToolSpec;
use parlor_tools::{ToolCallContext, ToolHost};

use super::cache::MessageSource;
use super::{DispatchMode, RunOutcome, SessionHub, StartSessionMessage};
use crate::hub::turn::RunStatus;

pub const AGENTS_MESSAGE_TOOL: &str = "agents_message";

const DEFAULT_TIMEOUT_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DelegateMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AgentsMessageArgs {
    agent_id: String,
    content: String,
    #[serde(default = "default_session")]
    session: String,
    #[serde(default)]
    mode: DelegateMode,
    timeout: Option<f64>,
}

fn default_session() -> String {
    "latest-or-create".to_owned()
}

pub struct AgentsMessageTool {
    hub: Weak<SessionHub>,
}

impl AgentsMessageTool {
    pub(crate) fn new(hub: Weak<SessionHub>) -> Self {
        Self { hub }
    }

    fn spec() -> ToolSpec {
        ToolSpec {
            name: AGENTS_MESSAGE_TOOL.to_owned(),
            description: "Send a message to another agent and optionally wait for its reply."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "agentId": {"type": "string", "description": "Target agent id"},
                    "content": {"type": "string", "description": "Message to deliver"},
                    "session": {
                        "type": "string",
                        "description": "\"latest\", \"create\", \"latest-or-create\", or an explicit session id",
                    },
                    "mode": {"type": "string", "enum": ["sync", "async"]},
                    "timeout": {"type": "number", "description": "Seconds to wait in sync mode (default 300)"},
                },
                "required": ["agentId", "content"],
            }),
            capabilities: vec!["agents".to_owned()],
        }
    }
}

#[async_trait]
impl ToolHost for AgentsMessageTool {
    async fn list_tools(&self) -> Vec<ToolSpec> {
        vec![Self::spec()]
    }

    async fn call_tool(&self, name: &str, args: Value, ctx: &ToolCallContext) -> Result<Value> {
        if name != AGENTS_MESSAGE_TOOL {
            return Err(Error::ToolNotFound(name.to_owned()));
        }
        let args: AgentsMessageArgs = serde_json::from_value(args)
            .map_err(|e| Error::InvalidArguments(format!("agents_message: {e}")))?;
        if args.content.trim().is_empty() {
            return Err(Error::InvalidArguments("content must be non-empty".into()));
        }
        let timeout = args.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !(timeout > 0.0) {
            return Err(Error::InvalidArguments(format!(
                "timeout must be > 0, got {timeout}"
            )));
        }
        let timeout = Duration::from_secs((timeout.floor() as u64).max(1));

        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| Error::Other("session hub is shutting down".into()))?;

        // Target agent, caller visibility, provider availability.
        let target = hub
            .agents
            .get(&args.agent_id)
            .ok_or_else(|| Error::AgentNotFound(args.agent_id.clone()))?;
        if !ctx.agent_id.is_empty() && !hub.agents.can_delegate(&ctx.agent_id, &args.agent_id) {
            return Err(Error::AgentNotAccessible(format!(
                "agent '{}' may not message '{}'",
                ctx.agent_id, args.agent_id
            )));
        }
        hub.providers.for_agent(target)?;

        let target_session = resolve_target_session(&hub, &args)?;
        let message_id = uuid::Uuid::new_v4().to_string();

        // Record the outgoing delegation in the caller's log.
        let mut event = ChatEvent::new(
            &ctx.session_id,
            EventPayload::AgentMessage {
                message_id: message_id.clone(),
                target_agent_id: args.agent_id.clone(),
                target_session_id: target_session.clone(),
                message: args.content.clone(),
                wait: args.mode == DelegateMode::Sync,
            },
        );
        if let Some(turn_id) = &ctx.turn_id {
            event = event.with_turn(turn_id);
        }
        if let Some(response_id) = &ctx.response_id {
            event = event.with_response(response_id);
        }
        hub.record_event(&ctx.session_id, true, event);

        let source = MessageSource::AgentMessage {
            from_agent_id: ctx.agent_id.clone(),
            from_session_id: ctx.session_id.clone(),
            message_id: message_id.clone(),
            wait: args.mode == DelegateMode::Sync,
        };
        if args.mode == DelegateMode::Sync {
            // Park the callback until our tool_result is in the log.
            hub.expect_callback(&message_id, &ctx.tool_call_id);
        }

        let mode = match args.mode {
            DelegateMode::Sync => DispatchMode::Sync { timeout },
            DelegateMode::Async => DispatchMode::Detached,
        };
        let outcome = hub
            .start_session_message(StartSessionMessage {
                session_id: target_session.clone(),
                content: args.content.clone(),
                source,
                mode,
                forward_chunks: ctx.output.clone(),
            })
            .await
            .map_err(|e| match e {
                e @ (Error::AgentNotFound(_)
                | Error::AgentNotAvailable(_)
                | Error::SessionNotFound(_)) => e,
                other => Error::AgentMessageFailed(other.to_string()),
            })?;

        match outcome {
            RunOutcome::Complete(report) => match report.status {
                RunStatus::Complete => Ok(json!({
                    "status": "complete",
                    "response": report.response,
                    "responseId": report.response_id,
                    "messageId": message_id,
                    "targetSessionId": target_session,
                })),
                RunStatus::Cancelled => Err(Error::AgentMessageFailed(
                    "target run was cancelled".into(),
                )),
                RunStatus::Error => Err(Error::AgentMessageFailed(
                    "target run failed".into(),
                )),
            },
            RunOutcome::Timeout { response_id } => Ok(json!({
                "status": "timeout",
                "responseId": response_id,
                "messageId": message_id,
                "targetSessionId": target_session,
            })),
            RunOutcome::Queued => Ok(json!({
                "status": "queued",
                "messageId": message_id,
                "targetSessionId": target_session,
            })),
            RunOutcome::Started { response_id } => Ok(json!({
                "status": "started",
                "responseId": response_id,
                "messageId": message_id,
                "targetSessionId": target_session,
            })),
        }
    }
}

/// Resolve the `session` argument into a concrete target session id.
fn resolve_target_session(hub: &SessionHub, args: &AgentsMessageArgs) -> Result<String> {
    match args.session.as_str() {
        "latest" => hub
            .index
            .find_session_for_agent(&args.agent_id)
            .map(|s| s.session_id)
            .ok_or_else(|| {
                Error::AgentSessionError(format!(
                    "agent '{}' has no existing session",
                    args.agent_id
                ))
            }),
        "create" => Ok(hub.create_session(&args.agent_id)?.session_id),
        "latest-or-create" => match hub.index.find_session_for_agent(&args.agent_id) {
            Some(s) => Ok(s.session_id),
            None => Ok(hub.create_session(&args.agent_id)?.session_id),
        },
        explicit => {
            let summary = hub.index.get(explicit).ok_or_else(|| {
                Error::AgentSessionError(format!("session '{explicit}' does not exist"))
            })?;
            if summary.agent_id != args.agent_id {
                return Err(Error::AgentSessionError(format!(
                    "session '{explicit}' belongs to agent '{}', not '{}'",
                    summary.agent_id, args.agent_id
                )));
            }
            Ok(summary.session_id)
        }
    }
}
