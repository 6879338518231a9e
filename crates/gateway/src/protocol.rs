//! Wire protocol to clients.
//!
//! Transport-agnostic duplex JSON messages; the WebSocket endpoint frames
//! them. Clients open with `hello` (version-gated), then send text inputs
//! and control actions; the server streams session-scoped output messages
//! to every subscribed connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parlor_sessions::SessionSummary;

pub const PROTOCOL_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client → server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `hello.subscriptions` accepts a single id or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionSpec {
    One(String),
    Many(Vec<String>),
}

impl SubscriptionSpec {
    pub fn session_ids(&self) -> Vec<String> {
        match self {
            SubscriptionSpec::One(id) => vec![id.clone()],
            SubscriptionSpec::Many(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Hello {
        protocol_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscriptions: Option<SubscriptionSpec>,
    },
    #[serde(rename_all = "camelCase")]
    TextInput { session_id: String, text: String },
    #[serde(rename_all = "camelCase")]
    Control {
        action: ControlAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_end_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Subscribe { session_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server → client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Subscribed { session_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    TextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        response_id: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    TextDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        response_id: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ThinkingStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        response_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ThinkingDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        response_id: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ThinkingDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        response_id: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        tool_call_id: String,
        chunk: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        tool_call_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    #[serde(rename_all = "camelCase")]
    OutputCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        response_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PanelEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(flatten)]
        data: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    UserMessage { session_id: String, text: String },
    SessionCreated { session: SessionSummary },
    SessionUpdated { session: SessionSummary },
    #[serde(rename_all = "camelCase")]
    SessionDeleted { session_id: String },
    #[serde(rename_all = "camelCase")]
    AgentCallbackResult {
        session_id: String,
        message_id: String,
        from_agent_id: String,
        result: String,
    },
    Error(ErrorBody),
    /// This connection missed messages (slow consumer, oldest dropped).
    Desync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn from_error(err: &parlor_domain::Error) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
            details: None,
        }
    }
}

impl ServerMessage {
    /// Inject the session id into session-scoped messages that omit it.
    pub fn ensure_session_id(&mut self, sid: &str) {
        match self {
            ServerMessage::TextDelta { session_id, .. }
            | ServerMessage::TextDone { session_id, .. }
            | ServerMessage::ThinkingStart { session_id, .. }
            | ServerMessage::ThinkingDelta { session_id, .. }
            | ServerMessage::ThinkingDone { session_id, .. }
            | ServerMessage::ToolCallStart { session_id, .. }
            | ServerMessage::ToolOutputDelta { session_id, .. }
            | ServerMessage::ToolResult { session_id, .. }
            | ServerMessage::OutputCancelled { session_id, .. }
            | ServerMessage::PanelEvent { session_id, .. } => {
                if session_id.is_none() {
                    *session_id = Some(sid.to_owned());
                }
            }
            _ => {}
        }
    }
}
