//! Union of tool hosts. On a name collision the first host to own the
//! name wins, both for listing and for dispatch.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use parlor_domain::error::{Error, Result};
use parlor_domain::message::ToolSpec;

use crate::host::{ToolCallContext, ToolHost};

#[derive(Default)]
pub struct CompositeToolHost {
    hosts: Vec<Arc<dyn ToolHost>>,
}

impl CompositeToolHost {
    pub fn new(hosts: Vec<Arc<dyn ToolHost>>) -> Self {
        Self { hosts }
    }

    pub fn push(&mut self, host: Arc<dyn ToolHost>) {
        self.hosts.push(host);
    }
}

#[async_trait]
impl ToolHost for CompositeToolHost {
    async fn list_tools(&self) -> Vec<ToolSpec> {
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        for host in &self.hosts {
            for spec in host.list_tools().await {
                if seen.insert(spec.name.clone()) {
                    all.push(spec);
                }
            }
        }
        all
    }

    async fn call_tool(&self, name: &str, args: Value, ctx: &ToolCallContext) -> Result<Value> {
        for host in &self.hosts {
            if host.has_tool(name).await {
                return host.call_tool(name, args, ctx).await;
            }
        }
        Err(Error::ToolNotFound(name.to_owned()))
    }
}
