//! Tool hosting for Parlor: the [`ToolHost`] interface plus the scoped,
//! composite, and static host implementations the hub composes per agent.

pub mod composite;
pub mod host;
pub mod scoped;
pub mod static_host;

pub use composite::CompositeToolHost;
pub use host::{ToolCallContext, ToolHost};
pub use scoped::ScopedToolHost;
pub use static_host::StaticToolHost;
