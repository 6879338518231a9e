//! The append-only event model.
//!
//! Every session's history is a totally ordered sequence of [`ChatEvent`]s.
//! An event is a fixed header (id, timestamp, session, optional turn and
//! response ids) plus a `type`-tagged payload. Unknown payload types are
//! preserved as opaque records so logs written by a newer server remain
//! readable: they deserialize into [`EventBody::Opaque`] and re-serialize
//! with their original fields intact.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A fresh globally unique event id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One line of a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    /// Globally unique event id.
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl ChatEvent {
    /// Build an event with a fresh id and the current timestamp.
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: new_id(),
            timestamp: now_ms(),
            session_id: session_id.into(),
            turn_id: None,
            response_id: None,
            body: EventBody::Typed(payload),
        }
    }

    pub fn with_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }

    pub fn with_response(mut self, response_id: impl Into<String>) -> Self {
        self.response_id = Some(response_id.into());
        self
    }

    /// The typed payload, when this event carries a known type.
    pub fn payload(&self) -> Option<&EventPayload> {
        match &self.body {
            EventBody::Typed(p) => Some(p),
            EventBody::Opaque(_) => None,
        }
    }

    /// The `type` tag, including for opaque events.
    pub fn event_type(&self) -> &str {
        self.body.event_type()
    }

    /// Structural validation applied before an append is accepted.
    ///
    /// An opaque body whose `type` matches a known tag means the payload
    /// failed its schema (the typed parse would have succeeded otherwise).
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidEvent("missing event id".into()));
        }
        if self.session_id.trim().is_empty() {
            return Err(Error::InvalidEvent("missing session id".into()));
        }
        if self.timestamp <= 0 {
            return Err(Error::InvalidEvent(format!(
                "non-positive timestamp {}",
                self.timestamp
            )));
        }
        if let EventBody::Opaque(map) = &self.body {
            match map.get("type").and_then(Value::as_str) {
                None => return Err(Error::InvalidEvent("missing payload type".into())),
                Some(t) if KNOWN_EVENT_TYPES.contains(&t) => {
                    return Err(Error::InvalidEvent(format!(
                        "malformed payload for event type '{t}'"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventBody — typed payload or opaque forward-compatible record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventBody {
    Typed(EventPayload),
    /// An event type this build does not know. Kept verbatim.
    Opaque(serde_json::Map<String, Value>),
}

impl EventBody {
    pub fn event_type(&self) -> &str {
        match self {
            EventBody::Typed(p) => p.event_type(),
            EventBody::Opaque(map) => map
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }
}

impl From<EventPayload> for EventBody {
    fn from(p: EventPayload) -> Self {
        EventBody::Typed(p)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventPayload — the known event kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What started a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTrigger {
    User,
    System,
    Callback,
}

/// Why an in-flight run was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    UserCancel,
    Timeout,
    Error,
}

/// Error details attached to a failed tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // ── Inputs ────────────────────────────────────────────────────
    UserMessage {
        text: String,
    },
    UserAudio {
        transcription: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentMessage {
        message_id: String,
        target_agent_id: String,
        target_session_id: String,
        message: String,
        wait: bool,
    },
    #[serde(rename_all = "camelCase")]
    AgentCallback {
        message_id: String,
        from_agent_id: String,
        from_session_id: String,
        result: String,
    },

    // ── Turn lifecycle ────────────────────────────────────────────
    TurnStart {
        trigger: TurnTrigger,
    },
    TurnEnd,

    // ── Assistant output ──────────────────────────────────────────
    AssistantChunk {
        text: String,
    },
    AssistantDone {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        interrupted: bool,
    },
    ThinkingStart,
    ThinkingDelta {
        text: String,
    },
    ThinkingDone {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        #[serde(default = "default_true")]
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ToolErrorInfo>,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputDelta {
        tool_call_id: String,
        chunk: String,
    },

    // ── Control ───────────────────────────────────────────────────
    #[serde(rename_all = "camelCase")]
    OutputCancelled {
        response_id: String,
    },
    Interrupt {
        reason: InterruptReason,
    },
    #[serde(rename_all = "camelCase")]
    SummaryMessage {
        text: String,
        summary_type: String,
    },
    CustomMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    PanelEvent {
        #[serde(flatten)]
        data: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    InteractionRequest {
        tool_call_id: String,
        #[serde(flatten)]
        data: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    InteractionResponse {
        tool_call_id: String,
        #[serde(flatten)]
        data: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    InteractionPending {
        tool_call_id: String,
        #[serde(flatten)]
        data: serde_json::Map<String, Value>,
    },
}

fn default_true() -> bool {
    true
}

/// Every tag [`EventPayload`] can carry. Used to distinguish "unknown
/// future type" from "known type, malformed payload" during validation.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "user_message",
    "user_audio",
    "agent_message",
    "agent_callback",
    "turn_start",
    "turn_end",
    "assistant_chunk",
    "assistant_done",
    "thinking_start",
    "thinking_delta",
    "thinking_done",
    "tool_call",
    "tool_result",
    "tool_output_delta",
    "output_cancelled",
    "interrupt",
    "summary_message",
    "custom_message",
    "panel_event",
    "interaction_request",
    "interaction_response",
    "interaction_pending",
];

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::UserMessage { .. } => "user_message",
            EventPayload::UserAudio { .. } => "user_audio",
            EventPayload::AgentMessage { .. } => "agent_message",
            EventPayload::AgentCallback { .. } => "agent_callback",
            EventPayload::TurnStart { .. } => "turn_start",
            EventPayload::TurnEnd => "turn_end",
            EventPayload::AssistantChunk { .. } => "assistant_chunk",
            EventPayload::AssistantDone { .. } => "assistant_done",
            EventPayload::ThinkingStart => "thinking_start",
            EventPayload::ThinkingDelta { .. } => "thinking_delta",
            EventPayload::ThinkingDone { .. } => "thinking_done",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::ToolOutputDelta { .. } => "tool_output_delta",
            EventPayload::OutputCancelled { .. } => "output_cancelled",
            EventPayload::Interrupt { .. } => "interrupt",
            EventPayload::SummaryMessage { .. } => "summary_message",
            EventPayload::CustomMessage { .. } => "custom_message",
            EventPayload::PanelEvent { .. } => "panel_event",
            EventPayload::InteractionRequest { .. } => "interaction_request",
            EventPayload::InteractionResponse { .. } => "interaction_response",
            EventPayload::InteractionPending { .. } => "interaction_pending",
        }
    }
}
