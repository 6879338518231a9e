//! Append-only per-session event log.
//!
//! Each session's events live in `<root>/sessions/<sessionId>/events.jsonl`,
//! one validated JSON line per event. Appends are serialized per session;
//! a batch is serialized into a single buffer and flushed with one write so
//! either every line lands or none do. Live subscribers are invoked
//! synchronously after a successful append, in append order.
//!
//! Reads are tolerant: malformed or schema-invalid lines are skipped with a
//! warning, which also makes a torn trailing line after a crash harmless.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use parlor_domain::error::{Error, Result};
use parlor_domain::event::ChatEvent;

type Handler = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: Handler,
}

type SubscriberMap = Arc<RwLock<HashMap<String, Vec<Subscriber>>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventStore {
    root: PathBuf,
    /// Per-session append locks. Holding one across serialize-write-fanout
    /// keeps broadcast order identical to append order.
    appenders: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    subscribers: SubscriberMap,
    next_subscriber_id: AtomicU64,
}

impl EventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            appenders: Mutex::new(HashMap::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.root
            .join("sessions")
            .join(session_id)
            .join("events.jsonl")
    }

    fn append_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.appenders
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .clone()
    }

    fn check_session_id(session_id: &str) -> Result<()> {
        if session_id.trim().is_empty()
            || session_id.contains('/')
            || session_id.contains('\\')
            || session_id.contains("..")
        {
            return Err(Error::InvalidArguments(format!(
                "bad session id '{session_id}'"
            )));
        }
        Ok(())
    }

    // ── Appending ──────────────────────────────────────────────────

    pub fn append(&self, session_id: &str, event: &ChatEvent) -> Result<()> {
        self.append_batch(session_id, std::slice::from_ref(event))
    }

    /// Append a batch of events. All lines are serialized up front and
    /// written with a single `write_all`, so the batch is all-or-nothing at
    /// the serialization layer. Fan-out happens per event in input order.
    pub fn append_batch(&self, session_id: &str, events: &[ChatEvent]) -> Result<()> {
        Self::check_session_id(session_id)?;
        if events.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for event in events {
            event.validate()?;
            if event.session_id != session_id {
                return Err(Error::SessionMismatch(format!(
                    "event {} targets session '{}', appended to '{}'",
                    event.id, event.session_id, session_id
                )));
            }
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }

        let lock = self.append_lock(session_id);
        let _guard = lock.lock();

        let path = self.events_path(session_id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(buf.as_bytes())?;

        // Fan out while still holding the append lock so subscribers see
        // events in append order even under concurrent writers.
        let subscribers = self.subscribers.read();
        if let Some(subs) = subscribers.get(session_id) {
            for event in events {
                for sub in subs {
                    (sub.handler)(event);
                }
            }
        }
        Ok(())
    }

    // ── Reading ────────────────────────────────────────────────────

    /// All events for a session in file order. A missing file is an empty
    /// history; unreadable lines are skipped.
    pub fn get_events(&self, session_id: &str) -> Result<Vec<ChatEvent>> {
        Self::check_session_id(session_id)?;
        let path = self.events_path(session_id);
        read_events_file(&path, Some(session_id))
    }

    /// Events strictly after the one whose id equals `cursor_id`. An empty
    /// or unknown cursor returns the whole history.
    pub fn get_events_since(&self, session_id: &str, cursor_id: &str) -> Result<Vec<ChatEvent>> {
        let events = self.get_events(session_id)?;
        if cursor_id.is_empty() {
            return Ok(events);
        }
        match events.iter().position(|e| e.id == cursor_id) {
            Some(pos) => Ok(events[pos + 1..].to_vec()),
            None => Ok(events),
        }
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Subscribe to live appends. The handler runs synchronously on the
    /// appending thread and must not block. Dropping the returned guard
    /// unsubscribes.
    pub fn subscribe(
        &self,
        session_id: &str,
        handler: impl Fn(&ChatEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .push(Subscriber {
                id,
                handler: Arc::new(handler),
            });
        EventSubscription {
            subscribers: Arc::clone(&self.subscribers),
            session_id: session_id.to_owned(),
            id,
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Truncate a session's event file. The session itself stays valid.
    pub fn clear_session(&self, session_id: &str) -> Result<()> {
        Self::check_session_id(session_id)?;
        let lock = self.append_lock(session_id);
        let _guard = lock.lock();
        let path = self.events_path(session_id);
        if path.exists() {
            std::fs::File::create(&path)?;
        }
        Ok(())
    }

    /// Remove a session's event file (and its directory when empty).
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        Self::check_session_id(session_id)?;
        let lock = self.append_lock(session_id);
        let _guard = lock.lock();
        let path = self.events_path(session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
        Ok(())
    }
}

/// RAII unsubscribe guard returned by [`EventStore::subscribe`].
pub struct EventSubscription {
    subscribers: SubscriberMap,
    session_id: String,
    id: u64,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        let mut map = self.subscribers.write();
        if let Some(subs) = map.get_mut(&self.session_id) {
            subs.retain(|s| s.id != self.id);
            if subs.is_empty() {
                map.remove(&self.session_id);
            }
        }
    }
}

/// Read a JSONL event file, skipping lines that fail to parse or validate.
pub(crate) fn read_events_file(
    path: &Path,
    expect_session: Option<&str>,
) -> Result<Vec<ChatEvent>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut events = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: ChatEvent = match serde_json::from_str(line) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "skipping malformed event line"
                );
                continue;
            }
        };
        if let Err(e) = event.validate() {
            tracing::warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "skipping schema-invalid event line"
            );
            continue;
        }
        if let Some(expected) = expect_session {
            if event.session_id != expected {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    "skipping event with foreign session id"
                );
                continue;
            }
        }
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_domain::event::EventPayload;
    use std::sync::atomic::AtomicUsize;

    fn store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        (dir, store)
    }

    fn user_msg(session: &str, text: &str) -> ChatEvent {
        ChatEvent::new(session, EventPayload::UserMessage { text: text.into() })
    }

    #[test]
    fn append_then_read_roundtrips() {
        let (_dir, store) = store();
        let e1 = user_msg("s1", "hello");
        let e2 = user_msg("s1", "world");
        store.append("s1", &e1).unwrap();
        store.append("s1", &e2).unwrap();

        let events = store.get_events("s1").unwrap();
        assert_eq!(events, vec![e1, e2]);
    }

    #[test]
    fn batch_append_preserves_payloads_and_order() {
        let (_dir, store) = store();
        let batch: Vec<_> = (0..5).map(|i| user_msg("s1", &format!("m{i}"))).collect();
        store.append_batch("s1", &batch).unwrap();
        assert_eq!(store.get_events("s1").unwrap(), batch);
    }

    #[test]
    fn session_mismatch_rejected_and_nothing_written() {
        let (_dir, store) = store();
        let good = user_msg("s1", "ok");
        let bad = user_msg("s2", "wrong session");
        let err = store.append_batch("s1", &[good, bad]).unwrap_err();
        assert_eq!(err.code(), "session_mismatch");
        assert!(store.get_events("s1").unwrap().is_empty());
    }

    #[test]
    fn invalid_event_rejected() {
        let (_dir, store) = store();
        let mut ev = user_msg("s1", "x");
        ev.id = String::new();
        assert_eq!(store.append("s1", &ev).unwrap_err().code(), "invalid_event");
    }

    #[test]
    fn missing_file_reads_empty() {
        let (_dir, store) = store();
        assert!(store.get_events("never-seen").unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (dir, store) = store();
        let ev = user_msg("s1", "kept");
        store.append("s1", &ev).unwrap();

        // Simulate a torn write: garbage and a truncated JSON tail.
        let path = dir.path().join("sessions/s1/events.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json at all").unwrap();
        write!(file, "{{\"id\":\"trunc").unwrap();

        let events = store.get_events("s1").unwrap();
        assert_eq!(events, vec![ev]);
    }

    #[test]
    fn get_events_since_cursor_semantics() {
        let (_dir, store) = store();
        let e1 = user_msg("s1", "a");
        let e2 = user_msg("s1", "b");
        let e3 = user_msg("s1", "c");
        store.append_batch("s1", &[e1.clone(), e2.clone(), e3.clone()]).unwrap();

        assert_eq!(store.get_events_since("s1", &e1.id).unwrap(), vec![e2.clone(), e3.clone()]);
        assert_eq!(store.get_events_since("s1", &e3.id).unwrap(), Vec::<ChatEvent>::new());
        // Unknown and empty cursors both return the full history.
        assert_eq!(store.get_events_since("s1", "nope").unwrap().len(), 3);
        assert_eq!(store.get_events_since("s1", "").unwrap().len(), 3);
    }

    #[test]
    fn subscribers_see_appends_in_order() {
        let (_dir, store) = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = store.subscribe("s1", move |ev| {
            seen2.lock().push(ev.id.clone());
        });

        let e1 = user_msg("s1", "a");
        let e2 = user_msg("s1", "b");
        store.append_batch("s1", &[e1.clone(), e2.clone()]).unwrap();
        assert_eq!(*seen.lock(), vec![e1.id, e2.id]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let (_dir, store) = store();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let sub = store.subscribe("s1", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        store.append("s1", &user_msg("s1", "one")).unwrap();
        drop(sub);
        store.append("s1", &user_msg("s1", "two")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribers_are_per_session() {
        let (_dir, store) = store();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let _sub = store.subscribe("s1", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        store.append("s2", &user_msg("s2", "elsewhere")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_truncates_but_session_stays_usable() {
        let (_dir, store) = store();
        store.append("s1", &user_msg("s1", "old")).unwrap();
        store.clear_session("s1").unwrap();
        assert!(store.get_events("s1").unwrap().is_empty());

        let fresh = user_msg("s1", "new");
        store.append("s1", &fresh).unwrap();
        assert_eq!(store.get_events("s1").unwrap(), vec![fresh]);
    }

    #[test]
    fn delete_removes_the_file() {
        let (dir, store) = store();
        store.append("s1", &user_msg("s1", "x")).unwrap();
        store.delete_session("s1").unwrap();
        assert!(!dir.path().join("sessions/s1/events.jsonl").exists());
        // Deleting again is a no-op.
        store.delete_session("s1").unwrap();
    }

    #[test]
    fn path_traversal_session_ids_rejected() {
        let (_dir, store) = store();
        let ev = user_msg("../evil", "x");
        assert!(store.append("../evil", &ev).is_err());
        assert!(store.get_events("a/b").is_err());
    }

    #[test]
    fn unknown_event_types_roundtrip_through_the_store() {
        let (dir, store) = store();
        store.append("s1", &user_msg("s1", "typed")).unwrap();
        let path = dir.path().join("sessions/s1/events.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            file,
            "{{\"id\":\"fut1\",\"timestamp\":4,\"sessionId\":\"s1\",\"type\":\"from_the_future\",\"n\":7}}"
        )
        .unwrap();

        let events = store.get_events("s1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type(), "from_the_future");
    }
}
