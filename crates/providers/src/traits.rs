use std::pin::Pin;

use serde::{Deserialize, Serialize};

use parlor_domain::error::Result;
use parlor_domain::message::{ChatMessage, ToolSpec};

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / stream types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat request for one model round.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// Model override; `None` uses the provider default.
    pub model: Option<String>,
    /// Thinking/reasoning effort hint (provider-interpreted).
    pub thinking: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// The text of the latest user message, when present.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == parlor_domain::message::Role::User)
            .map(|m| m.content.all_text())
    }
}

/// Incremental events emitted while a provider streams a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Reasoning/thinking delta.
    Thinking { text: String },
    /// Assistant text delta.
    Token { text: String },
    #[serde(rename_all = "camelCase")]
    ToolCallStarted { call_id: String, tool_name: String },
    #[serde(rename_all = "camelCase")]
    ToolCallDelta { call_id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every chat provider adapter implements. Adapters translate
/// between the neutral types above and each provider's wire format.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;

    /// Run one model round, streaming events until `Done`.
    async fn stream_chat(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
