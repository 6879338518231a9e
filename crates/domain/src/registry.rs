//! Immutable agent registry with visibility resolution.
//!
//! Built once at startup from validated definitions; rejects duplicate ids.
//! Visibility (which peers an agent may see and delegate to) is resolved
//! from per-agent allow/deny pattern lists compiled at construction.

use std::collections::HashMap;

use crate::agent::AgentDefinition;
use crate::error::{Error, Result};
use crate::pattern::PatternSet;

#[derive(Debug)]
struct CompiledVisibility {
    allow: Option<PatternSet>,
    deny: Option<PatternSet>,
}

#[derive(Debug)]
pub struct AgentRegistry {
    agents: Vec<AgentDefinition>,
    by_id: HashMap<String, usize>,
    visibility: HashMap<String, CompiledVisibility>,
}

impl AgentRegistry {
    /// Build the registry. Fails on duplicate agent ids or invalid
    /// definitions.
    pub fn new(agents: Vec<AgentDefinition>) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut visibility = HashMap::new();

        for (idx, agent) in agents.iter().enumerate() {
            let issues = agent.validate();
            if !issues.is_empty() {
                return Err(Error::InvalidConfig(issues.join("; ")));
            }
            if by_id.insert(agent.agent_id.clone(), idx).is_some() {
                return Err(Error::DuplicateAgentId(agent.agent_id.clone()));
            }
            visibility.insert(
                agent.agent_id.clone(),
                CompiledVisibility {
                    allow: agent
                        .agent_allowlist
                        .as_ref()
                        .map(|p| PatternSet::compile(p)),
                    deny: agent
                        .agent_denylist
                        .as_ref()
                        .map(|p| PatternSet::compile(p)),
                },
            );
        }

        tracing::info!(agents = agents.len(), "agent registry built");
        Ok(Self {
            agents,
            by_id,
            visibility,
        })
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.by_id.get(agent_id).map(|&i| &self.agents[i])
    }

    pub fn has(&self, agent_id: &str) -> bool {
        self.by_id.contains_key(agent_id)
    }

    pub fn list(&self) -> &[AgentDefinition] {
        &self.agents
    }

    /// Peer agents visible to `from_agent_id`:
    /// UI-visible agents, filtered through the source agent's allow list
    /// (when present) and deny list, excluding the source agent itself.
    pub fn visible_agents(&self, from_agent_id: &str) -> Vec<&AgentDefinition> {
        let compiled = self.visibility.get(from_agent_id);
        self.agents
            .iter()
            .filter(|peer| peer.agent_id != from_agent_id)
            .filter(|peer| peer.ui_visible)
            .filter(|peer| match compiled.and_then(|c| c.allow.as_ref()) {
                Some(allow) => allow.matches(&peer.agent_id),
                None => true,
            })
            .filter(|peer| match compiled.and_then(|c| c.deny.as_ref()) {
                Some(deny) => !deny.matches(&peer.agent_id),
                None => true,
            })
            .collect()
    }

    /// Whether `from` may delegate to `to`.
    pub fn can_delegate(&self, from: &str, to: &str) -> bool {
        self.visible_agents(from).iter().any(|a| a.agent_id == to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ChatProviderKind;

    fn agent(id: &str) -> AgentDefinition {
        AgentDefinition::minimal(id, ChatProviderKind::Openai)
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = AgentRegistry::new(vec![agent("a"), agent("a")]).unwrap_err();
        assert_eq!(err.code(), "duplicate_agent_id");
    }

    #[test]
    fn lookup_and_list() {
        let reg = AgentRegistry::new(vec![agent("a"), agent("b")]).unwrap();
        assert!(reg.has("a"));
        assert!(reg.get("c").is_none());
        assert_eq!(reg.list().len(), 2);
    }

    #[test]
    fn source_agent_excluded_from_peers() {
        let reg = AgentRegistry::new(vec![agent("a"), agent("b")]).unwrap();
        let peers = reg.visible_agents("a");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].agent_id, "b");
    }

    #[test]
    fn ui_invisible_agents_hidden() {
        let mut hidden = agent("ghost");
        hidden.ui_visible = false;
        let reg = AgentRegistry::new(vec![agent("a"), hidden]).unwrap();
        assert!(reg.visible_agents("a").is_empty());
        assert!(!reg.can_delegate("a", "ghost"));
    }

    #[test]
    fn allowlist_restricts_peers() {
        let mut a = agent("a");
        a.agent_allowlist = Some(vec!["research_*".into()]);
        let reg = AgentRegistry::new(vec![a, agent("research_web"), agent("ops")]).unwrap();
        let peers = reg.visible_agents("a");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].agent_id, "research_web");
    }

    #[test]
    fn denylist_excludes_peers() {
        let mut a = agent("a");
        a.agent_denylist = Some(vec!["ops".into()]);
        let reg = AgentRegistry::new(vec![a, agent("research"), agent("ops")]).unwrap();
        assert!(reg.can_delegate("a", "research"));
        assert!(!reg.can_delegate("a", "ops"));
    }

    #[test]
    fn empty_allowlist_denies_all() {
        let mut a = agent("a");
        a.agent_allowlist = Some(Vec::new());
        let reg = AgentRegistry::new(vec![a, agent("b")]).unwrap();
        assert!(reg.visible_agents("a").is_empty());
    }

    #[test]
    fn unknown_source_sees_visible_agents() {
        let reg = AgentRegistry::new(vec![agent("a")]).unwrap();
        let peers = reg.visible_agents("nobody");
        assert_eq!(peers.len(), 1);
    }
}
