//! In-memory session state and its LRU cache.
//!
//! A [`LogicalSessionState`] is the rehydratable working set of one
//! session: the summary snapshot, provider-neutral message history, the
//! active run (if any), and the FIFO queue of deferred inputs. The cache
//! is bounded; eviction only touches entries that are neither running nor
//! watched by a subscriber, and evicted entries rebuild from the durable
//! stores on next access.

use std::collections::{HashMap, VecDeque};

use parlor_domain::cancel::CancelToken;
use parlor_domain::event::TurnTrigger;
use parlor_domain::message::ChatMessage;
use parlor_sessions::SessionSummary;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a queued input came from; shapes the turn's trigger and the
/// events recorded for it.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageSource {
    User,
    System,
    AgentMessage {
        from_agent_id: String,
        from_session_id: String,
        message_id: String,
        wait: bool,
    },
    Callback {
        from_agent_id: String,
        from_session_id: String,
        message_id: String,
    },
}

impl MessageSource {
    pub fn trigger(&self) -> TurnTrigger {
        match self {
            MessageSource::User | MessageSource::AgentMessage { .. } => TurnTrigger::User,
            MessageSource::System => TurnTrigger::System,
            MessageSource::Callback { .. } => TurnTrigger::Callback,
        }
    }
}

/// An input deferred while the session was busy.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub text: String,
    pub source: MessageSource,
}

/// Bookkeeping for the one in-flight run of a session.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub turn_id: String,
    pub response_id: String,
    pub cancel: CancelToken,
}

pub struct LogicalSessionState {
    pub summary: SessionSummary,
    pub chat_messages: Vec<ChatMessage>,
    pub active_run: Option<ActiveRun>,
    pub queue: VecDeque<QueuedMessage>,
    /// False when a history provider owns the transcript (event store
    /// writes for chat output are skipped to avoid divergence).
    pub persist_chat_events: bool,
    last_access: u64,
}

impl LogicalSessionState {
    pub fn new(summary: SessionSummary, chat_messages: Vec<ChatMessage>) -> Self {
        Self {
            summary,
            chat_messages,
            active_run: None,
            queue: VecDeque::new(),
            persist_chat_events: true,
            last_access: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_run.is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LRU cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionCache {
    entries: HashMap<String, LogicalSessionState>,
    capacity: usize,
    access_counter: u64,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            access_counter: 0,
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    /// Fetch and LRU-touch.
    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut LogicalSessionState> {
        self.access_counter += 1;
        let counter = self.access_counter;
        let state = self.entries.get_mut(session_id)?;
        state.last_access = counter;
        Some(state)
    }

    pub fn insert(&mut self, session_id: String, mut state: LogicalSessionState) {
        self.access_counter += 1;
        state.last_access = self.access_counter;
        self.entries.insert(session_id, state);
    }

    pub fn remove(&mut self, session_id: &str) -> Option<LogicalSessionState> {
        self.entries.remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict least-recently-accessed entries until the cache fits its
    /// capacity. Entries with an active run, a non-empty queue, or at
    /// least one subscriber are pinned. Eviction drops only the in-memory
    /// working set; the durable stores rebuild it on next access.
    pub fn evict(&mut self, is_subscribed: impl Fn(&str) -> bool) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let candidate = self
                .entries
                .iter()
                .filter(|(id, state)| {
                    !state.is_busy() && state.queue.is_empty() && !is_subscribed(id)
                })
                .min_by_key(|(_, state)| state.last_access)
                .map(|(id, _)| id.clone());
            match candidate {
                Some(id) => {
                    self.entries.remove(&id);
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn summary(id: &str) -> SessionSummary {
        SessionSummary {
            session_id: id.to_owned(),
            agent_id: "a".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: None,
            last_snippet: None,
            pinned_at: None,
            model: None,
            thinking: None,
            attributes: serde_json::Map::new(),
        }
    }

    fn state(id: &str) -> LogicalSessionState {
        LogicalSessionState::new(summary(id), Vec::new())
    }

    #[test]
    fn evicts_least_recently_accessed_first() {
        let mut cache = SessionCache::new(2);
        cache.insert("s1".into(), state("s1"));
        cache.insert("s2".into(), state("s2"));
        cache.get_mut("s1");
        cache.insert("s3".into(), state("s3"));

        let evicted = cache.evict(|_| false);
        assert_eq!(evicted, vec!["s2".to_string()]);
        assert!(cache.contains("s1"));
        assert!(cache.contains("s3"));
    }

    #[test]
    fn busy_sessions_are_never_evicted() {
        let mut cache = SessionCache::new(1);
        let mut busy = state("busy");
        busy.active_run = Some(ActiveRun {
            turn_id: "t".into(),
            response_id: "r".into(),
            cancel: CancelToken::new(),
        });
        cache.insert("busy".into(), busy);
        cache.insert("idle".into(), state("idle"));

        let evicted = cache.evict(|_| false);
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert!(cache.contains("busy"));
    }

    #[test]
    fn subscribed_sessions_are_pinned() {
        let mut cache = SessionCache::new(1);
        cache.insert("watched".into(), state("watched"));
        cache.insert("other".into(), state("other"));

        let evicted = cache.evict(|id| id == "watched");
        assert_eq!(evicted, vec!["other".to_string()]);
    }

    #[test]
    fn eviction_gives_up_when_everything_is_pinned() {
        let mut cache = SessionCache::new(1);
        cache.insert("s1".into(), state("s1"));
        cache.insert("s2".into(), state("s2"));

        let evicted = cache.evict(|_| true);
        assert!(evicted.is_empty());
        // Over capacity, but only by pinned entries (the bounded-cache
        // property allows capacity + pinned).
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn queued_messages_pin_a_session() {
        let mut cache = SessionCache::new(1);
        let mut with_queue = state("queued");
        with_queue.queue.push_back(QueuedMessage {
            text: "later".into(),
            source: MessageSource::User,
        });
        cache.insert("queued".into(), with_queue);
        cache.insert("plain".into(), state("plain"));

        let evicted = cache.evict(|_| false);
        assert_eq!(evicted, vec!["plain".to_string()]);
    }
}
