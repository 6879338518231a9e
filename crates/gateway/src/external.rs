//! External agents.
//!
//! Agents with `type = external` run no local provider: user messages are
//! POSTed to the agent's input URL together with a callback URL, and the
//! remote process answers asynchronously on
//! `POST /external/sessions/<sessionId>/messages`. Callback payloads are
//! translated into typed events; anything unrecognized is preserved as a
//! `custom_message` rather than dropped.

use serde_json::{json, Value};

use parlor_domain::agent::AgentDefinition;
use parlor_domain::error::{Error, Result};
use parlor_domain::event::{EventPayload, ToolErrorInfo};

pub struct ExternalAgentClient {
    http: reqwest::Client,
}

impl Default for ExternalAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalAgentClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Deliver a user message to the external agent's input endpoint.
    pub async fn deliver_user_message(
        &self,
        agent: &AgentDefinition,
        session_id: &str,
        text: &str,
    ) -> Result<()> {
        let external = agent.external.as_ref().ok_or_else(|| {
            Error::AgentNotAvailable(format!(
                "agent '{}' has no external endpoint",
                agent.agent_id
            ))
        })?;
        let callback_url = join_url(
            &external.callback_base_url,
            &format!("external/sessions/{session_id}/messages"),
        );
        let body = json!({
            "sessionId": session_id,
            "agentId": agent.agent_id,
            "callbackUrl": callback_url,
            "message": {
                "type": "user",
                "text": text,
                "createdAt": chrono::Utc::now().to_rfc3339(),
            },
        });

        let response = self
            .http
            .post(&external.input_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ExternalAgentError(format!("delivery failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::ExternalAgentError(format!(
                "external endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Join a base URL and a path with exactly one `/` between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Translate an external callback payload into event payloads. Well-typed
/// assistant text and tool-result shapes become their native events;
/// everything else is recorded verbatim as `custom_message`.
pub fn translate_callback(payload: &Value) -> Vec<EventPayload> {
    // Accept both a single message and a `messages` batch.
    if let Some(items) = payload.get("messages").and_then(Value::as_array) {
        return items.iter().flat_map(translate_callback).collect();
    }

    let text = payload
        .get("text")
        .or_else(|| payload.get("content"))
        .and_then(Value::as_str);
    let kind = payload.get("type").and_then(Value::as_str);

    match (kind, text) {
        (None | Some("assistant" | "assistant_done" | "text"), Some(text)) => {
            vec![EventPayload::AssistantDone {
                text: text.to_owned(),
                interrupted: false,
            }]
        }
        (Some("tool_result"), _) => {
            let tool_call_id = payload
                .get("toolCallId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if tool_call_id.is_empty() {
                return vec![fallback_custom(payload)];
            }
            let error = payload.get("error").map(|e| ToolErrorInfo {
                code: e
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("external_agent_error")
                    .to_owned(),
                message: e
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            });
            vec![EventPayload::ToolResult {
                tool_call_id,
                ok: error.is_none(),
                result: payload.get("result").cloned().unwrap_or(Value::Null),
                error,
            }]
        }
        _ => vec![fallback_custom(payload)],
    }
}

fn fallback_custom(payload: &Value) -> EventPayload {
    EventPayload::CustomMessage {
        text: payload.to_string(),
        label: Some("external".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(join_url("http://h:1", "a/b"), "http://h:1/a/b");
        assert_eq!(join_url("http://h:1/", "a/b"), "http://h:1/a/b");
        assert_eq!(join_url("http://h:1/", "/a/b"), "http://h:1/a/b");
        assert_eq!(join_url("http://h:1", "/a/b"), "http://h:1/a/b");
    }

    #[test]
    fn assistant_text_translates_to_assistant_done() {
        let events = translate_callback(&json!({"type": "assistant", "text": "hi there"}));
        assert_eq!(
            events,
            vec![EventPayload::AssistantDone { text: "hi there".into(), interrupted: false }]
        );
        // Bare text with no type at all is treated the same way.
        let bare = translate_callback(&json!({"text": "plain"}));
        assert_eq!(bare.len(), 1);
    }

    #[test]
    fn tool_results_translate_when_well_typed() {
        let events = translate_callback(&json!({
            "type": "tool_result",
            "toolCallId": "tc1",
            "result": {"ok": true},
        }));
        match &events[0] {
            EventPayload::ToolResult { tool_call_id, ok, .. } => {
                assert_eq!(tool_call_id, "tc1");
                assert!(ok);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unknown_payloads_become_custom_messages() {
        let events = translate_callback(&json!({"type": "telemetry", "watts": 42}));
        match &events[0] {
            EventPayload::CustomMessage { label, text } => {
                assert_eq!(label.as_deref(), Some("external"));
                assert!(text.contains("telemetry"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn message_batches_flatten() {
        let events = translate_callback(&json!({
            "messages": [
                {"type": "assistant", "text": "one"},
                {"type": "assistant", "text": "two"},
            ]
        }));
        assert_eq!(events.len(), 2);
    }
}
