//! Provider registry: maps each configured provider kind to its adapter
//! and resolves the adapter for an agent's provider binding.

use std::collections::HashMap;
use std::sync::Arc;

use parlor_domain::agent::{AgentDefinition, ChatProviderKind};
use parlor_domain::error::{Error, Result};

use crate::traits::ChatProvider;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ChatProviderKind, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ChatProviderKind, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ChatProviderKind) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Resolve the adapter for an agent. A chat agent without a provider
    /// binding, or with an unregistered one, is `agent_not_available`.
    pub fn for_agent(&self, agent: &AgentDefinition) -> Result<Arc<dyn ChatProvider>> {
        let chat = agent.chat.as_ref().ok_or_else(|| {
            Error::AgentNotAvailable(format!("agent '{}' has no chat provider", agent.agent_id))
        })?;
        self.get(chat.provider).ok_or_else(|| {
            Error::AgentNotAvailable(format!(
                "provider '{}' for agent '{}' is not configured",
                chat.provider.as_str(),
                agent.agent_id
            ))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
