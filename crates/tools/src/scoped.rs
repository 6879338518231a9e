//! Per-agent tool scoping.
//!
//! Wraps a base host and filters by the agent's tool and capability
//! allow/deny pattern lists. `list_tools` hides disallowed tools entirely;
//! `call_tool` rejects them with `tool_not_allowed`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use parlor_domain::agent::AgentDefinition;
use parlor_domain::error::{Error, Result};
use parlor_domain::message::ToolSpec;
use parlor_domain::pattern::PatternSet;

use crate::host::{ToolCallContext, ToolHost};

pub struct ScopedToolHost {
    inner: Arc<dyn ToolHost>,
    tool_allow: Option<PatternSet>,
    tool_deny: Option<PatternSet>,
    capability_allow: Option<PatternSet>,
    capability_deny: Option<PatternSet>,
}

impl ScopedToolHost {
    pub fn new(
        inner: Arc<dyn ToolHost>,
        tool_allow: Option<PatternSet>,
        tool_deny: Option<PatternSet>,
        capability_allow: Option<PatternSet>,
        capability_deny: Option<PatternSet>,
    ) -> Self {
        Self {
            inner,
            tool_allow,
            tool_deny,
            capability_allow,
            capability_deny,
        }
    }

    /// Compile a scope from an agent's allow/deny lists.
    pub fn for_agent(inner: Arc<dyn ToolHost>, agent: &AgentDefinition) -> Self {
        let compile = |list: &Option<Vec<String>>| list.as_ref().map(|p| PatternSet::compile(p));
        Self::new(
            inner,
            compile(&agent.tool_allowlist),
            compile(&agent.tool_denylist),
            compile(&agent.capability_allowlist),
            compile(&agent.capability_denylist),
        )
    }

    fn allowed(&self, spec: &ToolSpec) -> bool {
        if let Some(allow) = &self.tool_allow {
            if !allow.matches(&spec.name) {
                return false;
            }
        }
        if let Some(deny) = &self.tool_deny {
            if deny.matches(&spec.name) {
                return false;
            }
        }
        if let Some(allow) = &self.capability_allow {
            if !spec.capabilities.iter().any(|c| allow.matches(c)) {
                return false;
            }
        }
        if let Some(deny) = &self.capability_deny {
            if spec.capabilities.iter().any(|c| deny.matches(c)) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl ToolHost for ScopedToolHost {
    async fn list_tools(&self) -> Vec<ToolSpec> {
        self.inner
            .list_tools()
            .await
            .into_iter()
            .filter(|spec| self.allowed(spec))
            .collect()
    }

    async fn call_tool(&self, name: &str, args: Value, ctx: &ToolCallContext) -> Result<Value> {
        let spec = self
            .inner
            .list_tools()
            .await
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::ToolNotFound(name.to_owned()))?;
        if !self.allowed(&spec) {
            return Err(Error::ToolNotAllowed(name.to_owned()));
        }
        self.inner.call_tool(name, args, ctx).await
    }
}
