//! The tool host interface.
//!
//! A [`ToolHost`] exposes a set of callable tools to the chat processor.
//! Hosts compose: built-in tools, plugin tools, MCP tools, and the
//! delegation tool are separate hosts unioned by a composite and filtered
//! per agent by a scoped wrapper. Heavy dependencies (registries, stores,
//! hub handles) are captured at host construction; the per-call context
//! carries only identifiers, the cancel token, and the output channel.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use parlor_domain::cancel::CancelToken;
use parlor_domain::error::Result;
use parlor_domain::message::ToolSpec;

/// Per-call context handed to every tool execution.
#[derive(Clone)]
pub struct ToolCallContext {
    pub session_id: String,
    pub turn_id: Option<String>,
    pub response_id: Option<String>,
    pub tool_call_id: String,
    pub agent_id: String,
    /// Cooperative cancellation for the surrounding turn.
    pub cancel: CancelToken,
    /// Incremental output chunks; the hub turns these into
    /// `tool_output_delta` events. Absent when nobody is listening.
    pub output: Option<mpsc::Sender<String>>,
}

impl ToolCallContext {
    pub fn new(session_id: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turn_id: None,
            response_id: None,
            tool_call_id: tool_call_id.into(),
            agent_id: String::new(),
            cancel: CancelToken::new(),
            output: None,
        }
    }

    /// Emit an incremental output chunk. Dropped silently when the channel
    /// is full or closed; tools must not block on observers.
    pub fn emit_output(&self, chunk: impl Into<String>) {
        if let Some(tx) = &self.output {
            let _ = tx.try_send(chunk.into());
        }
    }
}

/// A provider of callable tools.
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// Every tool this host owns.
    async fn list_tools(&self) -> Vec<ToolSpec>;

    /// Whether this host owns a tool by name.
    async fn has_tool(&self, name: &str) -> bool {
        self.list_tools().await.iter().any(|t| t.name == name)
    }

    /// Execute a tool. Errors carry a stable code (`tool_not_found`,
    /// `tool_not_allowed`, `invalid_arguments`, `rate_limited`,
    /// `tool_interrupted`).
    async fn call_tool(&self, name: &str, args: Value, ctx: &ToolCallContext) -> Result<Value>;
}
