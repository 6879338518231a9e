//! The Parlor gateway: the Session Hub and everything wired around it —
//! turn execution, delegation, the cron scheduler, external agents, and
//! the client wire protocol.

pub mod api;
pub mod external;
pub mod hub;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod ws;

pub use hub::{DispatchMode, HubDeps, RunOutcome, SessionHub, StartSessionMessage};
pub use scheduler::Scheduler;
pub use state::AppState;
