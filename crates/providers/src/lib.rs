//! Chat provider adapters for Parlor: the [`ChatProvider`] streaming
//! trait, the provider registry, the OpenAI-compatible HTTP adapter, a
//! deterministic scripted provider, and the history providers that
//! reconstruct sessions from external CLI rollout files.

pub mod history;
pub mod openai;
pub mod registry;
pub mod scripted;
pub mod traits;

pub use history::{HistoryProvider, HistoryProviderRegistry, HistoryRequest};
pub use openai::OpenAiProvider;
pub use registry::ProviderRegistry;
pub use scripted::{ScriptStep, ScriptedProvider, ScriptedTurn};
pub use traits::{BoxStream, ChatProvider, ChatRequest, StreamEvent, Usage};
