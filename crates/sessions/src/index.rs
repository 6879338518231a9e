//! Durable session catalog.
//!
//! The index is an append-only change log at `<root>/sessions.jsonl`; every
//! mutation appends one typed record and the in-memory map is rebuilt by
//! replaying the log on load. A single writer lock serializes append and
//! map update, so readers always observe a state some prefix of the log
//! produced.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use parlor_domain::error::{Error, Result};

use crate::attributes;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionSummary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Catalog entry for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, Value>,
}

/// Parameters for [`SessionIndex::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub session_id: Option<String>,
    pub agent_id: String,
    pub model: Option<String>,
    pub thinking: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Change-log records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IndexRecord {
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        agent_id: String,
        at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionUpdated {
        session_id: String,
        at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_snippet: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionDeleted { session_id: String, at: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    SessionRenamed {
        session_id: String,
        at: DateTime<Utc>,
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionAgentSet {
        session_id: String,
        at: DateTime<Utc>,
        agent_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionCleared { session_id: String, at: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    SessionPinned {
        session_id: String,
        at: DateTime<Utc>,
        pinned: bool,
    },
    #[serde(rename_all = "camelCase")]
    SessionModelSet {
        session_id: String,
        at: DateTime<Utc>,
        model: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionThinkingSet {
        session_id: String,
        at: DateTime<Utc>,
        thinking: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionAttributesPatch {
        session_id: String,
        at: DateTime<Utc>,
        patch: Value,
    },
}

impl IndexRecord {
    fn session_id(&self) -> &str {
        match self {
            IndexRecord::SessionCreated { session_id, .. }
            | IndexRecord::SessionUpdated { session_id, .. }
            | IndexRecord::SessionDeleted { session_id, .. }
            | IndexRecord::SessionRenamed { session_id, .. }
            | IndexRecord::SessionAgentSet { session_id, .. }
            | IndexRecord::SessionCleared { session_id, .. }
            | IndexRecord::SessionPinned { session_id, .. }
            | IndexRecord::SessionModelSet { session_id, .. }
            | IndexRecord::SessionThinkingSet { session_id, .. }
            | IndexRecord::SessionAttributesPatch { session_id, .. } => session_id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionIndex
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Inner {
    sessions: HashMap<String, SessionSummary>,
    /// lowercase name → session id, for case-insensitive uniqueness.
    names: HashMap<String, String>,
}

pub struct SessionIndex {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl SessionIndex {
    /// Load (or create) the index at `<root>/sessions.jsonl`.
    pub fn load(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join("sessions.jsonl");
        let mut inner = Inner {
            sessions: HashMap::new(),
            names: HashMap::new(),
        };

        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                for (line_no, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IndexRecord>(line) {
                        Ok(record) => apply(&mut inner, &record),
                        Err(e) => {
                            tracing::warn!(
                                line = line_no + 1,
                                error = %e,
                                "skipping malformed session index record"
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        tracing::info!(
            sessions = inner.sessions.len(),
            path = %path.display(),
            "session index loaded"
        );
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn commit(&self, inner: &mut Inner, record: IndexRecord) -> Result<()> {
        let line = serde_json::to_string(&record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        apply(inner, &record);
        Ok(())
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Create a session. Re-creating an existing id with the same agent is
    /// an idempotent no-op returning the existing summary; with a different
    /// agent it is an error.
    pub fn create_session(&self, params: CreateSession) -> Result<SessionSummary> {
        if params.agent_id.trim().is_empty() {
            return Err(Error::InvalidArguments("agentId must be non-empty".into()));
        }
        let mut inner = self.inner.lock();
        let session_id = params
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(existing) = inner.sessions.get(&session_id) {
            if existing.agent_id == params.agent_id {
                return Ok(existing.clone());
            }
            return Err(Error::SessionMismatch(format!(
                "session '{session_id}' already belongs to agent '{}'",
                existing.agent_id
            )));
        }

        self.commit(
            &mut inner,
            IndexRecord::SessionCreated {
                session_id: session_id.clone(),
                agent_id: params.agent_id,
                at: Utc::now(),
                model: params.model,
                thinking: params.thinking,
            },
        )?;
        Ok(inner.sessions[&session_id].clone())
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Record activity: bump `updatedAt` and replace the last snippet.
    pub fn mark_session_activity(
        &self,
        session_id: &str,
        snippet: Option<&str>,
    ) -> Result<Option<SessionSummary>> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session_id) {
            return Ok(None);
        }
        self.commit(
            &mut inner,
            IndexRecord::SessionUpdated {
                session_id: session_id.to_owned(),
                at: Utc::now(),
                last_snippet: snippet.map(str::to_owned),
            },
        )?;
        Ok(inner.sessions.get(session_id).cloned())
    }

    pub fn touch_session(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        self.mark_session_activity(session_id, None)
    }

    pub fn mark_session_deleted(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session_id) {
            return Ok(());
        }
        self.commit(
            &mut inner,
            IndexRecord::SessionDeleted {
                session_id: session_id.to_owned(),
                at: Utc::now(),
            },
        )
    }

    /// Rename a session. The trimmed name must be unique case-insensitively
    /// among non-deleted sessions; `None` (or a blank name) removes it.
    pub fn rename_session(
        &self,
        session_id: &str,
        name: Option<&str>,
    ) -> Result<Option<SessionSummary>> {
        let trimmed = name.map(str::trim).filter(|n| !n.is_empty());
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session_id) {
            return Ok(None);
        }
        if let Some(new_name) = trimmed {
            if let Some(holder) = inner.names.get(&new_name.to_lowercase()) {
                if holder != session_id {
                    return Err(Error::NameInUse(new_name.to_owned()));
                }
            }
        }
        self.commit(
            &mut inner,
            IndexRecord::SessionRenamed {
                session_id: session_id.to_owned(),
                at: Utc::now(),
                name: trimmed.map(str::to_owned),
            },
        )?;
        Ok(inner.sessions.get(session_id).cloned())
    }

    pub fn set_session_agent(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<Option<SessionSummary>> {
        if agent_id.trim().is_empty() {
            return Err(Error::InvalidArguments("agentId must be non-empty".into()));
        }
        self.simple_mutation(session_id, |at| IndexRecord::SessionAgentSet {
            session_id: session_id.to_owned(),
            at,
            agent_id: agent_id.to_owned(),
        })
    }

    pub fn set_session_model(
        &self,
        session_id: &str,
        model: Option<&str>,
    ) -> Result<Option<SessionSummary>> {
        self.simple_mutation(session_id, |at| IndexRecord::SessionModelSet {
            session_id: session_id.to_owned(),
            at,
            model: model.map(str::to_owned),
        })
    }

    pub fn set_session_thinking(
        &self,
        session_id: &str,
        thinking: Option<&str>,
    ) -> Result<Option<SessionSummary>> {
        self.simple_mutation(session_id, |at| IndexRecord::SessionThinkingSet {
            session_id: session_id.to_owned(),
            at,
            thinking: thinking.map(str::to_owned),
        })
    }

    pub fn pin_session(&self, session_id: &str, pinned: bool) -> Result<Option<SessionSummary>> {
        self.simple_mutation(session_id, |at| IndexRecord::SessionPinned {
            session_id: session_id.to_owned(),
            at,
            pinned,
        })
    }

    /// Clear a session: metadata survives, the snippet is dropped. Event
    /// history is the event store's concern, not the index's.
    pub fn clear_session(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        self.simple_mutation(session_id, |at| IndexRecord::SessionCleared {
            session_id: session_id.to_owned(),
            at,
        })
    }

    /// Deep-merge an attribute patch (validated first).
    pub fn update_session_attributes(
        &self,
        session_id: &str,
        patch: Value,
    ) -> Result<Option<SessionSummary>> {
        attributes::validate_patch(&patch)?;
        self.simple_mutation(session_id, |at| IndexRecord::SessionAttributesPatch {
            session_id: session_id.to_owned(),
            at,
            patch: patch.clone(),
        })
    }

    fn simple_mutation(
        &self,
        session_id: &str,
        make: impl Fn(DateTime<Utc>) -> IndexRecord,
    ) -> Result<Option<SessionSummary>> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session_id) {
            return Ok(None);
        }
        self.commit(&mut inner, make(Utc::now()))?;
        Ok(inner.sessions.get(session_id).cloned())
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub fn get(&self, session_id: &str) -> Option<SessionSummary> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    pub fn find_session_by_name(&self, name: &str) -> Option<SessionSummary> {
        let inner = self.inner.lock();
        let id = inner.names.get(&name.trim().to_lowercase())?;
        inner.sessions.get(id).cloned()
    }

    /// The most recently updated non-deleted session bound to an agent.
    pub fn find_session_for_agent(&self, agent_id: &str) -> Option<SessionSummary> {
        let inner = self.inner.lock();
        inner
            .sessions
            .values()
            .filter(|s| s.agent_id == agent_id)
            .max_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.session_id.cmp(&b.session_id))
            })
            .cloned()
    }

    /// All non-deleted sessions, most recently updated first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self.inner.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn apply(inner: &mut Inner, record: &IndexRecord) {
    if let IndexRecord::SessionCreated {
        session_id,
        agent_id,
        at,
        model,
        thinking,
    } = record
    {
        // A created record without an agent is invalid and dropped.
        if agent_id.trim().is_empty() {
            tracing::warn!(%session_id, "dropping session record without agent id");
            return;
        }
        inner.sessions.insert(
            session_id.clone(),
            SessionSummary {
                session_id: session_id.clone(),
                agent_id: agent_id.clone(),
                created_at: *at,
                updated_at: *at,
                name: None,
                last_snippet: None,
                pinned_at: None,
                model: model.clone(),
                thinking: thinking.clone(),
                attributes: serde_json::Map::new(),
            },
        );
        return;
    }

    if let IndexRecord::SessionDeleted { session_id, .. } = record {
        if let Some(removed) = inner.sessions.remove(session_id) {
            if let Some(name) = removed.name {
                inner.names.remove(&name.to_lowercase());
            }
        }
        return;
    }

    let Some(session) = inner.sessions.get_mut(record.session_id()) else {
        return;
    };

    match record {
        IndexRecord::SessionUpdated { at, last_snippet, .. } => {
            session.updated_at = (*at).max(session.created_at);
            if let Some(snippet) = last_snippet {
                session.last_snippet = Some(snippet.clone());
            }
        }
        IndexRecord::SessionRenamed { at, name, .. } => {
            if let Some(old) = session.name.take() {
                inner.names.remove(&old.to_lowercase());
            }
            if let Some(new_name) = name {
                // Replay may contain a collision from a torn log; last
                // writer wins there, the live path checked beforehand.
                inner
                    .names
                    .insert(new_name.to_lowercase(), session.session_id.clone());
                session.name = Some(new_name.clone());
            }
            session.updated_at = (*at).max(session.created_at);
        }
        IndexRecord::SessionAgentSet { at, agent_id, .. } => {
            session.agent_id = agent_id.clone();
            session.updated_at = (*at).max(session.created_at);
        }
        IndexRecord::SessionCleared { at, .. } => {
            session.last_snippet = None;
            session.updated_at = (*at).max(session.created_at);
        }
        IndexRecord::SessionPinned { at, pinned, .. } => {
            session.pinned_at = pinned.then_some(*at);
            session.updated_at = (*at).max(session.created_at);
        }
        IndexRecord::SessionModelSet { at, model, .. } => {
            session.model = model.clone();
            session.updated_at = (*at).max(session.created_at);
        }
        IndexRecord::SessionThinkingSet { at, thinking, .. } => {
            session.thinking = thinking.clone();
            session.updated_at = (*at).max(session.created_at);
        }
        IndexRecord::SessionAttributesPatch { at, patch, .. } => {
            if let Some(patch_obj) = patch.as_object() {
                attributes::merge_attributes(&mut session.attributes, patch_obj);
            }
            session.updated_at = (*at).max(session.created_at);
        }
        IndexRecord::SessionCreated { .. } | IndexRecord::SessionDeleted { .. } => {}
    }
}
