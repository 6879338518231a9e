//! Shared domain types for the Parlor multi-agent conversation server:
//! the event model, agent definitions and registry, configuration, pattern
//! matching, rate limiting, and the workspace-wide error type.

pub mod agent;
pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod limiter;
pub mod message;
pub mod pattern;
pub mod registry;

pub use agent::{AgentDefinition, AgentType, ChatProviderKind, ChatSettings, ScheduleConfig};
pub use cancel::CancelToken;
pub use config::{EnvConfig, ServerConfig};
pub use error::{Error, Result};
pub use event::{ChatEvent, EventBody, EventPayload, InterruptReason, TurnTrigger};
pub use limiter::{RateDecision, RateLimiter};
pub use message::{ChatMessage, MessageContent, Role, ToolCallRequest, ToolSpec};
pub use pattern::{Pattern, PatternSet};
pub use registry::AgentRegistry;
