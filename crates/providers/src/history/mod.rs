//! History providers.
//!
//! CLI-backed chat providers (claude-cli, codex-cli, pi-cli) own the
//! canonical transcript on disk. A history provider reconstructs a
//! session's [`ChatEvent`] sequence from that external rollout file, so
//! the hub can rehydrate sessions it never wrote events for. Parses are
//! cached by file mtime; interaction overlay events recorded in the event
//! store are merged back in by `toolCallId`.

pub mod claude;
pub mod codex;
pub mod pi;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde_json::Value;

use parlor_domain::error::{Error, Result};
use parlor_domain::event::{ChatEvent, EventBody, EventPayload, TurnTrigger};

pub use claude::ClaudeHistoryProvider;
pub use codex::CodexHistoryProvider;
pub use pi::PiHistoryProvider;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request & trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    pub session_id: String,
    /// The agent's chat provider id (e.g. `claude-cli`).
    pub provider_id: String,
    /// The session's attribute record (carries `providers.<id>.*`).
    pub attributes: serde_json::Map<String, Value>,
    /// Return only events after this event id.
    pub after: Option<String>,
    /// Bypass the mtime cache.
    pub force: bool,
}

impl HistoryRequest {
    /// Read `providers.<provider_id>.<field>` from the session attributes.
    pub fn provider_attr(&self, field: &str) -> Option<&str> {
        self.attributes
            .get("providers")?
            .get(&self.provider_id)?
            .get(field)?
            .as_str()
    }
}

pub trait HistoryProvider: Send + Sync {
    fn supports(&self, provider_id: &str) -> bool;

    /// Reconstruct the session's events from the provider's file, in
    /// original chronological order with intact turn bracketing.
    fn get_history(&self, req: &HistoryRequest) -> Result<Vec<ChatEvent>>;

    /// When true the event store is also written for this session; when
    /// false the provider's file is the single source of truth.
    fn should_persist(&self, _req: &HistoryRequest) -> bool {
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct HistoryProviderRegistry {
    providers: Vec<Arc<dyn HistoryProvider>>,
}

impl HistoryProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn HistoryProvider>>) -> Self {
        Self { providers }
    }

    /// First provider claiming this provider id.
    pub fn provider_for(&self, provider_id: &str) -> Option<Arc<dyn HistoryProvider>> {
        self.providers
            .iter()
            .find(|p| p.supports(provider_id))
            .cloned()
    }

    /// Reconstruct history and merge overlay events. `None` when no
    /// provider claims the id (the event store is authoritative then).
    pub fn get_history(
        &self,
        req: &HistoryRequest,
        overlay: Vec<ChatEvent>,
    ) -> Option<Result<Vec<ChatEvent>>> {
        let provider = self.provider_for(&req.provider_id)?;
        Some(provider.get_history(req).map(|events| {
            let merged = merge_overlay(events, overlay);
            match &req.after {
                Some(cursor) => match merged.iter().position(|e| &e.id == cursor) {
                    Some(pos) => merged[pos + 1..].to_vec(),
                    None => merged,
                },
                None => merged,
            }
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Overlay merge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn event_tool_call_id(event: &ChatEvent) -> Option<&str> {
    match event.payload()? {
        EventPayload::ToolCall { tool_call_id, .. }
        | EventPayload::ToolResult { tool_call_id, .. }
        | EventPayload::ToolOutputDelta { tool_call_id, .. }
        | EventPayload::InteractionRequest { tool_call_id, .. }
        | EventPayload::InteractionResponse { tool_call_id, .. }
        | EventPayload::InteractionPending { tool_call_id, .. } => Some(tool_call_id),
        _ => None,
    }
}

/// Merge interaction overlay events into a reconstructed history: each
/// overlay event lands right after the last event sharing its
/// `toolCallId`; unmatched overlays append at the end.
pub fn merge_overlay(base: Vec<ChatEvent>, overlay: Vec<ChatEvent>) -> Vec<ChatEvent> {
    if overlay.is_empty() {
        return base;
    }
    let mut merged = base;
    for event in overlay {
        let anchor = event_tool_call_id(&event).and_then(|id| {
            merged
                .iter()
                .rposition(|e| event_tool_call_id(e) == Some(id))
        });
        match anchor {
            Some(pos) => merged.insert(pos + 1, event),
            None => merged.push(event),
        }
    }
    merged
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared parsing infrastructure
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// mtime-keyed parse cache shared by the rollout readers.
pub(crate) struct RolloutCache {
    entries: Mutex<HashMap<PathBuf, (SystemTime, Vec<ChatEvent>)>>,
}

impl RolloutCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_parse(
        &self,
        path: &Path,
        force: bool,
        parse: impl FnOnce(&str) -> Vec<ChatEvent>,
    ) -> Result<Vec<ChatEvent>> {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let modified = meta.modified()?;

        if !force {
            if let Some((cached_mtime, events)) = self.entries.lock().get(path) {
                if *cached_mtime == modified {
                    return Ok(events.clone());
                }
            }
        }

        let raw = std::fs::read_to_string(path)?;
        let events = parse(&raw);
        self.entries
            .lock()
            .insert(path.to_owned(), (modified, events.clone()));
        Ok(events)
    }
}

/// Builds a bracketed event sequence: every assistant/tool event lives
/// inside a `turn_start`/`turn_end` pair, turns close when the next user
/// input begins or the file ends.
pub(crate) struct TurnAccumulator {
    session_id: String,
    events: Vec<ChatEvent>,
    open_turn: Option<String>,
    seq: usize,
}

impl TurnAccumulator {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            events: Vec::new(),
            open_turn: None,
            seq: 0,
        }
    }

    fn next_id(&mut self) -> String {
        self.seq += 1;
        format!("{}-h{:06}", self.session_id, self.seq)
    }

    fn push_event(&mut self, payload: EventPayload, ts: i64) {
        let id = self.next_id();
        let turn_id = self.open_turn.clone();
        self.events.push(ChatEvent {
            id,
            timestamp: ts.max(1),
            session_id: self.session_id.clone(),
            turn_id,
            response_id: None,
            body: EventBody::Typed(payload),
        });
    }

    /// A user input: closes any open turn, records the message, and opens
    /// the next turn.
    pub fn user_message(&mut self, text: String, ts: i64) {
        self.close_turn(ts);
        self.push_event(EventPayload::UserMessage { text }, ts);
        let turn_id = self.next_id();
        self.open_turn = Some(turn_id);
        self.push_event(EventPayload::TurnStart { trigger: TurnTrigger::User }, ts);
    }

    /// An assistant-side event; opens a turn if none is open (a rollout
    /// may begin mid-conversation).
    pub fn in_turn(&mut self, payload: EventPayload, ts: i64) {
        if self.open_turn.is_none() {
            let turn_id = self.next_id();
            self.open_turn = Some(turn_id);
            self.push_event(EventPayload::TurnStart { trigger: TurnTrigger::System }, ts);
        }
        self.push_event(payload, ts);
    }

    fn close_turn(&mut self, ts: i64) {
        if self.open_turn.is_some() {
            self.push_event(EventPayload::TurnEnd, ts);
            self.open_turn = None;
        }
    }

    pub fn finish(mut self, ts: i64) -> Vec<ChatEvent> {
        self.close_turn(ts);
        self.events
    }
}

/// Parse an ISO timestamp string into epoch milliseconds.
pub(crate) fn parse_ts(value: &Value) -> Option<i64> {
    let raw = value.as_str()?;
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
