use std::sync::Arc;

use crate::hub::SessionHub;
use crate::scheduler::Scheduler;

/// Shared application state passed to all HTTP/WS handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SessionHub>,
    pub scheduler: Arc<Scheduler>,
}
