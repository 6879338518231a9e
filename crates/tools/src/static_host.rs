//! A tool host backed by a static name → handler table.
//!
//! Used for built-in tools and widely by tests. Handlers are async
//! closures capturing whatever dependencies they need.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

use parlor_domain::error::{Error, Result};
use parlor_domain::message::ToolSpec;

use crate::host::{ToolCallContext, ToolHost};

type Handler =
    Arc<dyn Fn(Value, ToolCallContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Default)]
pub struct StaticToolHost {
    specs: Vec<ToolSpec>,
    handlers: HashMap<String, Handler>,
}

impl StaticToolHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Re-registering a name replaces the handler.
    pub fn register<F, Fut>(&mut self, spec: ToolSpec, handler: F)
    where
        F: Fn(Value, ToolCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = spec.name.clone();
        if let Some(existing) = self.specs.iter_mut().find(|s| s.name == name) {
            *existing = spec;
        } else {
            self.specs.push(spec);
        }
        self.handlers.insert(
            name,
            Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        );
    }
}

#[async_trait]
impl ToolHost for StaticToolHost {
    async fn list_tools(&self) -> Vec<ToolSpec> {
        self.specs.clone()
    }

    async fn has_tool(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    async fn call_tool(&self, name: &str, args: Value, ctx: &ToolCallContext) -> Result<Value> {
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_owned()))?;
        handler(args, ctx.clone()).await
    }
}
