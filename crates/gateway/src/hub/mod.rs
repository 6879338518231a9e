//! The Session Hub.
//!
//! Process-wide coordinator owning the in-memory session cache, per-session
//! busy semantics and FIFO message queues, connection subscriptions and
//! broadcast fan-out, cancellation, and agent-to-agent delegation. All
//! cross-component traffic flows through hub methods; no caller holds a
//! session's internals across a suspension point.

pub mod cache;
pub mod cancel;
pub mod delegate;
pub mod subscriptions;
pub mod turn;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use parlor_domain::agent::{AgentDefinition, AgentType};
use parlor_domain::config::{EnvConfig, ServerConfig};
use parlor_domain::error::{Error, Result};
use parlor_domain::event::{ChatEvent, EventPayload};
use parlor_domain::limiter::RateLimiter;
use parlor_domain::message::{ChatMessage, ToolCallRequest};
use parlor_domain::registry::AgentRegistry;
use parlor_providers::history::{HistoryProviderRegistry, HistoryRequest};
use parlor_providers::ProviderRegistry;
use parlor_sessions::{CreateSession, EventStore, SessionIndex, SessionSummary};
use parlor_tools::{CompositeToolHost, ScopedToolHost, ToolHost};

use crate::external::ExternalAgentClient;
use crate::protocol::ServerMessage;
use cache::{ActiveRun, LogicalSessionState, MessageSource, QueuedMessage, SessionCache};
use cancel::CancelMap;
use subscriptions::{ConnectionId, SubscriptionTable};
use turn::{run_turn, TurnJob, TurnReport};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public request/outcome types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a message dispatch behaves once the session is claimed.
#[derive(Debug, Clone, Copy)]
pub enum DispatchMode {
    /// Run the turn inline, racing the given timeout.
    Sync { timeout: Duration },
    /// Spawn the turn and return immediately.
    Detached,
}

pub struct StartSessionMessage {
    pub session_id: String,
    pub content: String,
    pub source: MessageSource,
    pub mode: DispatchMode,
    /// Forward assistant text and tool-output chunks of this turn (used by
    /// sync nested delegation to stream into the caller's tool output).
    pub forward_chunks: Option<mpsc::Sender<String>>,
}

impl StartSessionMessage {
    pub fn detached(session_id: impl Into<String>, content: impl Into<String>, source: MessageSource) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            source,
            mode: DispatchMode::Detached,
            forward_chunks: None,
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Sync run finished (successfully, with an error status, or cancelled
    /// mid-way; see the report's status).
    Complete(TurnReport),
    /// Sync run hit its timeout; the closing events were still emitted.
    Timeout { response_id: String },
    /// Session was busy; the message waits in the FIFO queue.
    Queued,
    /// Detached run started.
    Started { response_id: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionHub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HubDeps {
    pub config: Arc<ServerConfig>,
    pub env: Arc<EnvConfig>,
    pub agents: Arc<AgentRegistry>,
    pub index: Arc<SessionIndex>,
    pub events: Arc<EventStore>,
    pub providers: Arc<ProviderRegistry>,
    pub history: Arc<HistoryProviderRegistry>,
    /// Built-in + plugin + MCP tools (the delegation tool is added by the
    /// hub itself).
    pub base_tools: Arc<dyn ToolHost>,
}

pub struct SessionHub {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) env: Arc<EnvConfig>,
    pub agents: Arc<AgentRegistry>,
    pub index: Arc<SessionIndex>,
    pub events: Arc<EventStore>,
    pub(crate) providers: Arc<ProviderRegistry>,
    pub(crate) history: Arc<HistoryProviderRegistry>,
    base_tools: Arc<dyn ToolHost>,
    delegation: Arc<delegate::AgentsMessageTool>,
    external: ExternalAgentClient,

    pub(crate) subs: SubscriptionTable,
    pub(crate) cancels: CancelMap,
    sessions: Mutex<SessionCache>,
    message_limiters: Mutex<HashMap<String, RateLimiter>>,
    tool_limiters: Mutex<HashMap<String, RateLimiter>>,
    deferred: Mutex<DeferredCallbacks>,
}

/// Callback delivery for sync delegations is deferred until the caller's
/// `tool_result` lands, so the caller log reads `agent_message`,
/// `tool_result`, `agent_callback` in that order.
#[derive(Default)]
struct DeferredCallbacks {
    /// message id → caller tool call id, registered by a sync waiter.
    expectations: HashMap<String, String>,
    /// caller tool call id → ready-to-deliver callback.
    ready: HashMap<String, DeferredCallback>,
}

struct DeferredCallback {
    caller_session_id: String,
    target_session_id: String,
    target_agent_id: String,
    message_id: String,
    response_id: String,
    result: String,
}

impl SessionHub {
    pub fn new(deps: HubDeps) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            delegation: Arc::new(delegate::AgentsMessageTool::new(weak.clone())),
            external: ExternalAgentClient::new(),
            subs: SubscriptionTable::new(),
            cancels: CancelMap::new(),
            sessions: Mutex::new(SessionCache::new(deps.config.sessions.max_cached)),
            message_limiters: Mutex::new(HashMap::new()),
            tool_limiters: Mutex::new(HashMap::new()),
            deferred: Mutex::new(DeferredCallbacks::default()),
            config: deps.config,
            env: deps.env,
            agents: deps.agents,
            index: deps.index,
            events: deps.events,
            providers: deps.providers,
            history: deps.history,
            base_tools: deps.base_tools,
        })
    }

    // ── Client input ───────────────────────────────────────────────

    /// A user text input from a connection: rate-limit, echo to peers,
    /// then dispatch (external agents get an HTTP delivery instead of a
    /// local turn).
    pub async fn handle_text_input(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
        from_connection: Option<ConnectionId>,
    ) -> Result<RunOutcome> {
        let decision = self
            .message_limiters
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| RateLimiter::new(self.env.max_messages_per_minute, 60_000))
            .check_now(1);
        if !decision.allowed {
            return Err(Error::RateLimited(format!(
                "message rate exceeded, retry in {}ms",
                decision.retry_after_ms
            )));
        }

        let summary = self
            .index
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;
        let agent = self
            .agents
            .get(&summary.agent_id)
            .ok_or_else(|| Error::AgentNotFound(summary.agent_id.clone()))?
            .clone();

        // Echo to the session's other subscribers.
        self.subs.send_to_session(
            session_id,
            ServerMessage::UserMessage {
                session_id: session_id.to_owned(),
                text: text.to_owned(),
            },
            from_connection,
        );

        if agent.agent_type == AgentType::External {
            self.record_event(
                session_id,
                true,
                ChatEvent::new(session_id, EventPayload::UserMessage { text: text.to_owned() }),
            );
            self.external
                .deliver_user_message(&agent, session_id, text)
                .await?;
            let _ = self.index.mark_session_activity(session_id, Some(text));
            return Ok(RunOutcome::Started { response_id: String::new() });
        }

        self.start_session_message(StartSessionMessage::detached(
            session_id,
            text,
            MessageSource::User,
        ))
        .await
    }

    // ── Message dispatch ───────────────────────────────────────────

    /// Dispatch a message into a session: queue when busy, otherwise claim
    /// the session and run the turn (inline for sync, spawned for
    /// detached).
    pub async fn start_session_message(
        self: &Arc<Self>,
        req: StartSessionMessage,
    ) -> Result<RunOutcome> {
        self.ensure_session_state(&req.session_id).await?;

        let job = {
            let mut sessions = self.sessions.lock();
            let state = sessions
                .get_mut(&req.session_id)
                .ok_or_else(|| Error::SessionNotFound(req.session_id.clone()))?;

            if state.is_busy() {
                state.queue.push_back(QueuedMessage {
                    text: req.content.clone(),
                    source: req.source.clone(),
                });
                tracing::debug!(
                    session_id = %req.session_id,
                    depth = state.queue.len(),
                    "session busy, message queued"
                );
                return Ok(RunOutcome::Queued);
            }

            let agent = self
                .agents
                .get(&state.summary.agent_id)
                .ok_or_else(|| Error::AgentNotFound(state.summary.agent_id.clone()))?
                .clone();

            let run = ActiveRun {
                turn_id: uuid::Uuid::new_v4().to_string(),
                response_id: uuid::Uuid::new_v4().to_string(),
                cancel: self.cancels.register(&req.session_id),
            };
            state.active_run = Some(run.clone());

            TurnJob {
                session_id: req.session_id.clone(),
                agent,
                history: state.chat_messages.clone(),
                persist: state.persist_chat_events,
                model: state.summary.model.clone(),
                thinking: state.summary.thinking.clone(),
                content: req.content.clone(),
                source: req.source.clone(),
                turn_id: run.turn_id,
                response_id: run.response_id,
                cancel: run.cancel,
                forward_chunks: req.forward_chunks.clone(),
            }
        };

        let response_id = job.response_id.clone();
        match req.mode {
            DispatchMode::Detached => {
                let hub = Arc::clone(self);
                tokio::spawn(async move {
                    run_turn(hub, job).await;
                });
                Ok(RunOutcome::Started { response_id })
            }
            DispatchMode::Sync { timeout } => {
                let hub = Arc::clone(self);
                let mut handle = tokio::spawn(async move { run_turn(hub, job).await });
                match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(joined) => {
                        let report = joined
                            .map_err(|e| Error::Other(format!("turn task panicked: {e}")))?;
                        Ok(RunOutcome::Complete(report))
                    }
                    Err(_) => {
                        // Cooperative cancel; the task still emits the
                        // closing events before it resolves.
                        self.cancels.cancel(&req.session_id);
                        let _ = handle.await;
                        Ok(RunOutcome::Timeout { response_id })
                    }
                }
            }
        }
    }

    /// Cancel the active run of a session, if any.
    pub fn cancel_active_run(&self, session_id: &str) -> bool {
        self.cancels.cancel(session_id)
    }

    // ── Session cache ──────────────────────────────────────────────

    /// Make sure a session's state is cached, rehydrating from the history
    /// provider (CLI transcripts) or the event store.
    pub(crate) async fn ensure_session_state(&self, session_id: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.lock();
            if sessions.get_mut(session_id).is_some() {
                return Ok(());
            }
        }

        let summary = self
            .index
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;

        let (events, persist) = self.load_session_events(&summary)?;
        let messages = events_to_messages(&events);

        let mut state = LogicalSessionState::new(summary, messages);
        state.persist_chat_events = persist;

        let mut sessions = self.sessions.lock();
        // Lost the race to another rehydration: keep the existing entry.
        if !sessions.contains(session_id) {
            sessions.insert(session_id.to_owned(), state);
        }
        let evicted = sessions.evict(|id| self.subs.subscriber_count(id) > 0);
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted idle sessions from cache");
        }
        Ok(())
    }

    /// Load replayable events for a session: the agent's history provider
    /// when it owns the transcript, the event store otherwise.
    fn load_session_events(&self, summary: &SessionSummary) -> Result<(Vec<ChatEvent>, bool)> {
        let provider_id = self
            .agents
            .get(&summary.agent_id)
            .and_then(|a| a.chat.as_ref())
            .map(|c| c.provider.as_str().to_owned());

        if let Some(provider_id) = provider_id {
            let req = HistoryRequest {
                session_id: summary.session_id.clone(),
                provider_id,
                attributes: summary.attributes.clone(),
                after: None,
                force: false,
            };
            if let Some(provider) = self.history.provider_for(&req.provider_id) {
                let overlay: Vec<ChatEvent> = self
                    .events
                    .get_events(&summary.session_id)?
                    .into_iter()
                    .filter(|e| e.event_type().starts_with("interaction_"))
                    .collect();
                match self.history.get_history(&req, overlay) {
                    Some(Ok(events)) => {
                        return Ok((events, provider.should_persist(&req)));
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            session_id = %summary.session_id,
                            error = %e,
                            "history provider failed, falling back to event store"
                        );
                    }
                    None => {}
                }
            }
        }

        Ok((self.events.get_events(&summary.session_id)?, true))
    }

    /// Number of cached sessions (bounded-cache property).
    pub fn cached_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether a session currently has an active chat run.
    pub fn has_active_run(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get_mut(session_id)
            .is_some_and(|s| s.is_busy())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Create a session for an agent and announce it.
    pub fn create_session(&self, agent_id: &str) -> Result<SessionSummary> {
        if !self.agents.has(agent_id) {
            return Err(Error::AgentNotFound(agent_id.to_owned()));
        }
        let summary = self.index.create_session(CreateSession {
            session_id: None,
            agent_id: agent_id.to_owned(),
            model: None,
            thinking: None,
        })?;
        self.subs
            .send_to_all(ServerMessage::SessionCreated { session: summary.clone() });
        Ok(summary)
    }

    /// Delete a session: cancel its run, drop cache and durable state.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.cancels.cancel(session_id);
        self.sessions.lock().remove(session_id);
        self.events.delete_session(session_id)?;
        self.index.mark_session_deleted(session_id)?;
        self.subs.send_to_all(ServerMessage::SessionDeleted {
            session_id: session_id.to_owned(),
        });
        Ok(())
    }

    /// Clear a session's history: truncate events, drop the snippet and
    /// the cached message history. The session (and its name) survive.
    pub fn clear_session(&self, session_id: &str) -> Result<()> {
        self.events.clear_session(session_id)?;
        self.index.clear_session(session_id)?;
        if let Some(state) = self.sessions.lock().get_mut(session_id) {
            state.chat_messages.clear();
        }
        Ok(())
    }

    // ── Subscriptions & broadcast ──────────────────────────────────

    /// Register a client connection; the receiver feeds the socket pump.
    pub fn register_connection(
        &self,
    ) -> (subscriptions::ConnectionHandle, subscriptions::ConnectionReceiver) {
        self.subs.register()
    }

    /// Drop a connection and all its subscriptions (disconnects never
    /// cancel active runs).
    pub fn unregister_connection(&self, connection_id: ConnectionId) {
        self.subs.unregister(connection_id);
    }

    pub fn subscribe_connection(&self, session_id: &str, connection_id: ConnectionId) {
        self.subs.subscribe(session_id, connection_id);
    }

    pub(crate) fn broadcast(
        &self,
        session_id: &str,
        msg: ServerMessage,
        exclude: Option<ConnectionId>,
    ) {
        self.subs.send_to_session(session_id, msg, exclude);
    }

    // ── Event recording ────────────────────────────────────────────

    /// Append an event, honoring the session's persistence mode (sessions
    /// whose transcript a CLI owns only persist interaction overlays).
    /// Store failures are logged; the hub keeps running.
    pub(crate) fn record_event(&self, session_id: &str, persist: bool, event: ChatEvent) {
        let must_keep = event.event_type().starts_with("interaction_");
        if !persist && !must_keep {
            return;
        }
        if let Err(e) = self.events.append(session_id, &event) {
            tracing::error!(
                session_id,
                event_type = event.event_type(),
                error = %e,
                "failed to append event"
            );
        }
    }

    // ── Prompt & tool surface ──────────────────────────────────────

    /// Compose an agent's system prompt: its configured prompt plus the
    /// peer agents it may delegate to (per visibility rules).
    pub(crate) fn build_system_prompt(&self, agent: &AgentDefinition) -> Option<String> {
        let mut sections = Vec::new();
        if let Some(prompt) = &agent.system_prompt {
            let trimmed = prompt.trim();
            if !trimmed.is_empty() {
                sections.push(trimmed.to_owned());
            }
        }
        let peers = self.agents.visible_agents(&agent.agent_id);
        if !peers.is_empty() {
            let mut lines = vec![
                "You can message other agents with the agents_message tool:".to_owned(),
            ];
            for peer in peers {
                let description = if peer.description.is_empty() {
                    String::new()
                } else {
                    format!(": {}", peer.description)
                };
                lines.push(format!("- {} ({}){}", peer.display_name(), peer.agent_id, description));
            }
            sections.push(lines.join("\n"));
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    // ── Tool hosts ─────────────────────────────────────────────────

    /// The tool surface for one agent: base hosts + delegation, filtered
    /// by the agent's allow/deny lists.
    pub(crate) fn tool_host_for_agent(&self, agent: &AgentDefinition) -> Arc<dyn ToolHost> {
        let union = CompositeToolHost::new(vec![
            Arc::clone(&self.base_tools),
            self.delegation.clone() as Arc<dyn ToolHost>,
        ]);
        Arc::new(ScopedToolHost::for_agent(Arc::new(union), agent))
    }

    /// Sliding-window limiter for tool calls in a session.
    pub(crate) fn check_tool_rate(&self, session_id: &str) -> parlor_domain::RateDecision {
        self.tool_limiters
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| RateLimiter::new(self.env.max_tool_calls_per_minute, 60_000))
            .check_now(1)
    }

    // ── Run finalization ───────────────────────────────────────────

    /// Invoked by the turn task after its closing events: write back the
    /// session state, deliver delegation callbacks, drain the queue.
    pub(crate) fn finish_run(self: &Arc<Self>, job: &TurnJob, report: &TurnReport) {
        {
            let mut sessions = self.sessions.lock();
            if let Some(state) = sessions.get_mut(&job.session_id) {
                state.active_run = None;
                state.chat_messages = report.messages.clone();
            }
        }
        self.cancels.remove(&job.session_id);

        let snippet = truncate_chars(&report.response, 120);
        if let Err(e) = self
            .index
            .mark_session_activity(&job.session_id, Some(&snippet))
        {
            tracing::warn!(session_id = %job.session_id, error = %e, "failed to touch session index");
        }

        // Delegated turns report back to their caller regardless of how
        // the run ended. When a sync waiter registered an expectation, the
        // delivery parks until the caller's tool_result is recorded.
        if let MessageSource::AgentMessage {
            from_session_id,
            message_id,
            ..
        } = &job.source
        {
            let parked = {
                let mut deferred = self.deferred.lock();
                match deferred.expectations.remove(message_id) {
                    Some(tool_call_id) => {
                        deferred.ready.insert(
                            tool_call_id,
                            DeferredCallback {
                                caller_session_id: from_session_id.clone(),
                                target_session_id: job.session_id.clone(),
                                target_agent_id: job.agent.agent_id.clone(),
                                message_id: message_id.clone(),
                                response_id: job.response_id.clone(),
                                result: report.response.clone(),
                            },
                        );
                        true
                    }
                    None => false,
                }
            };
            if !parked {
                self.deliver_agent_callback(
                    from_session_id,
                    &job.session_id,
                    &job.agent.agent_id,
                    message_id,
                    &job.response_id,
                    &report.response,
                );
            }
        }

        self.process_next_queued(&job.session_id);
    }

    /// FIFO drain: start the next queued message once the session is idle.
    pub(crate) fn process_next_queued(self: &Arc<Self>, session_id: &str) {
        let next = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(session_id) {
                Some(state) if !state.is_busy() => state.queue.pop_front(),
                _ => None,
            }
        };
        let Some(queued) = next else { return };

        let hub = Arc::clone(self);
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            let outcome = hub
                .start_session_message(StartSessionMessage::detached(
                    &session_id,
                    queued.text,
                    queued.source,
                ))
                .await;
            if let Err(e) = outcome {
                tracing::error!(%session_id, error = %e, "queued message failed to start");
            }
        });
    }

    // ── Delegation callbacks ───────────────────────────────────────

    /// Register a sync waiter: when the delegated turn for `message_id`
    /// finishes, its callback parks until the tool result with
    /// `tool_call_id` has been recorded.
    pub(crate) fn expect_callback(&self, message_id: &str, tool_call_id: &str) {
        self.deferred
            .lock()
            .expectations
            .insert(message_id.to_owned(), tool_call_id.to_owned());
    }

    /// Called after a tool result lands: deliver any parked callback for
    /// that call and drop stale expectations (a queued delegation's later
    /// completion then delivers directly).
    pub(crate) fn flush_deferred_callback(self: &Arc<Self>, tool_call_id: &str) {
        let parked = {
            let mut deferred = self.deferred.lock();
            deferred.expectations.retain(|_, tc| tc != tool_call_id);
            deferred.ready.remove(tool_call_id)
        };
        if let Some(cb) = parked {
            self.deliver_agent_callback(
                &cb.caller_session_id,
                &cb.target_session_id,
                &cb.target_agent_id,
                &cb.message_id,
                &cb.response_id,
                &cb.result,
            );
        }
    }

    /// Deliver a delegated-turn result into the caller session: record the
    /// callback event, notify subscribers, and seed a follow-up turn so
    /// the caller agent can react (on its own provider).
    pub(crate) fn deliver_agent_callback(
        self: &Arc<Self>,
        caller_session_id: &str,
        target_session_id: &str,
        target_agent_id: &str,
        message_id: &str,
        response_id: &str,
        result: &str,
    ) {
        if self.index.get(caller_session_id).is_none() {
            tracing::debug!(
                caller_session_id,
                "caller session gone, dropping agent callback"
            );
            return;
        }

        self.record_event(
            caller_session_id,
            true,
            ChatEvent::new(
                caller_session_id,
                EventPayload::AgentCallback {
                    message_id: message_id.to_owned(),
                    from_agent_id: target_agent_id.to_owned(),
                    from_session_id: target_session_id.to_owned(),
                    result: result.to_owned(),
                },
            ),
        );
        self.broadcast(
            caller_session_id,
            ServerMessage::AgentCallbackResult {
                session_id: caller_session_id.to_owned(),
                message_id: message_id.to_owned(),
                from_agent_id: target_agent_id.to_owned(),
                result: result.to_owned(),
            },
            None,
        );

        let seeded = format!("[Async response, responseId={response_id}]: {result}");
        let hub = Arc::clone(self);
        let caller_session = caller_session_id.to_owned();
        let source = MessageSource::Callback {
            from_agent_id: target_agent_id.to_owned(),
            from_session_id: target_session_id.to_owned(),
            message_id: message_id.to_owned(),
        };
        tokio::spawn(async move {
            if let Err(e) = hub
                .start_session_message(StartSessionMessage::detached(
                    &caller_session,
                    seeded,
                    source,
                ))
                .await
            {
                tracing::warn!(
                    session_id = %caller_session,
                    error = %e,
                    "callback follow-up turn failed to start"
                );
            }
        });
    }

    // ── External callbacks ─────────────────────────────────────────

    /// Translate an external agent's callback payload into session events
    /// (bracketed in a synthetic turn) and notify subscribers.
    pub fn handle_external_callback(
        &self,
        session_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let summary = self
            .index
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;

        let payloads = crate::external::translate_callback(payload);
        if payloads.is_empty() {
            return Ok(());
        }

        let turn_id = uuid::Uuid::new_v4().to_string();
        let response_id = uuid::Uuid::new_v4().to_string();
        let mut batch = Vec::with_capacity(payloads.len() + 2);
        batch.push(
            ChatEvent::new(session_id, EventPayload::TurnStart {
                trigger: parlor_domain::TurnTrigger::System,
            })
            .with_turn(&turn_id),
        );
        for p in payloads {
            batch.push(
                ChatEvent::new(session_id, p)
                    .with_turn(&turn_id)
                    .with_response(&response_id),
            );
        }
        batch.push(ChatEvent::new(session_id, EventPayload::TurnEnd).with_turn(&turn_id));

        self.events.append_batch(session_id, &batch)?;

        for event in &batch {
            if let Some(EventPayload::AssistantDone { text, .. }) = event.payload() {
                self.broadcast(
                    session_id,
                    ServerMessage::TextDone {
                        session_id: None,
                        response_id: response_id.clone(),
                        text: text.clone(),
                    },
                    None,
                );
            }
        }

        // Keep the cached message history aligned.
        {
            let mut sessions = self.sessions.lock();
            if let Some(state) = sessions.get_mut(session_id) {
                for event in &batch {
                    if let Some(EventPayload::AssistantDone { text, .. }) = event.payload() {
                        state.chat_messages.push(ChatMessage::assistant(text.clone()));
                    }
                }
            }
        }
        let _ = self.index.touch_session(&summary.session_id);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event → message reconstruction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rebuild the provider-neutral message history from replayed events.
pub(crate) fn events_to_messages(events: &[ChatEvent]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    for event in events {
        let Some(payload) = event.payload() else { continue };
        match payload {
            EventPayload::UserMessage { text } => messages.push(ChatMessage::user(text.clone())),
            EventPayload::UserAudio { transcription } => {
                messages.push(ChatMessage::user(transcription.clone()))
            }
            EventPayload::AssistantDone { text, .. } => {
                if !text.is_empty() {
                    messages.push(ChatMessage::assistant(text.clone()));
                }
            }
            EventPayload::ToolCall { tool_call_id, tool_name, args } => {
                messages.push(ChatMessage::assistant_tool_calls(
                    "",
                    &[ToolCallRequest {
                        call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: args.clone(),
                    }],
                ));
            }
            EventPayload::ToolResult { tool_call_id, ok, result, error } => {
                let content = match error {
                    Some(err) => err.message.clone(),
                    None => stringify_result(result),
                };
                messages.push(ChatMessage::tool_result(tool_call_id.clone(), content, !ok));
            }
            EventPayload::SummaryMessage { text, .. } => {
                messages.push(ChatMessage::system(text.clone()))
            }
            _ => {}
        }
    }
    messages
}

pub(crate) fn stringify_result(result: &serde_json::Value) -> String {
    match result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}
