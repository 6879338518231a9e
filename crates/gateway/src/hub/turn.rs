//! Turn execution — the per-turn state machine that streams a provider
//! response, dispatches tool calls, and records every step as events.
//!
//! One invocation = one turn: `turn_start` through `turn_end`, with the
//! provider↔tool loop bounded by the agent's `maxToolIterations` and the
//! per-session tool-call limiter. Cancellation is observed at every await
//! boundary; a cancelled turn still emits its closing sequence
//! (interrupted `assistant_done`, interrupted `tool_result`s,
//! `output_cancelled`, `turn_end`) before resolving.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use parlor_domain::cancel::CancelToken;
use parlor_domain::error::Error;
use parlor_domain::event::{ChatEvent, EventPayload, ToolErrorInfo};
use parlor_domain::message::{ChatMessage, ToolCallRequest};
use parlor_domain::AgentDefinition;
use parlor_providers::{ChatRequest, StreamEvent};
use parlor_tools::{ToolCallContext, ToolHost};

use super::cache::MessageSource;
use super::SessionHub;
use crate::protocol::{ErrorBody, ServerMessage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job & report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a turn needs, snapshotted while the session lock was held.
pub(crate) struct TurnJob {
    pub session_id: String,
    pub agent: AgentDefinition,
    /// Message history before this turn.
    pub history: Vec<ChatMessage>,
    /// Whether chat events are written to the event store.
    pub persist: bool,
    /// Session-level model/thinking overrides.
    pub model: Option<String>,
    pub thinking: Option<String>,
    pub content: String,
    pub source: MessageSource,
    pub turn_id: String,
    pub response_id: String,
    pub cancel: CancelToken,
    /// Assistant text and tool-output chunks are mirrored here (sync
    /// nested delegation streams into the caller's tool call).
    pub forward_chunks: Option<mpsc::Sender<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Cancelled,
    Error,
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: String,
    pub response_id: String,
    pub status: RunStatus,
    pub response: String,
    pub thinking_text: Option<String>,
    pub truncated: bool,
    pub duration_ms: u64,
    pub tool_call_count: u32,
    /// Full message history after the turn (written back to the cache).
    pub(crate) messages: Vec<ChatMessage>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn to completion and finalize the session (state write-back,
/// callback delivery, queue drain) no matter how it ended.
pub(crate) async fn run_turn(hub: Arc<SessionHub>, job: TurnJob) -> TurnReport {
    let started = Instant::now();
    let span = tracing::info_span!(
        "turn",
        session_id = %job.session_id,
        turn_id = %job.turn_id,
        agent_id = %job.agent.agent_id,
    );

    let mut exec = TurnExecution::new(&hub, &job);
    let status = exec.run().instrument(span).await;

    let report = TurnReport {
        turn_id: job.turn_id.clone(),
        response_id: job.response_id.clone(),
        status,
        response: exec.response_text.clone(),
        thinking_text: (!exec.thinking_text.is_empty()).then(|| exec.thinking_text.clone()),
        truncated: exec.truncated,
        duration_ms: started.elapsed().as_millis() as u64,
        tool_call_count: exec.tool_call_count,
        messages: exec.messages,
    };
    hub.finish_run(&job, &report);
    report
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TurnExecution<'a> {
    hub: &'a Arc<SessionHub>,
    job: &'a TurnJob,
    messages: Vec<ChatMessage>,
    response_text: String,
    thinking_text: String,
    tool_call_count: u32,
    truncated: bool,
    /// Dispatched tool calls that have no result yet (closed as
    /// interrupted on cancel).
    active_tool_calls: Vec<(String, String)>,
}

impl<'a> TurnExecution<'a> {
    fn new(hub: &'a Arc<SessionHub>, job: &'a TurnJob) -> Self {
        Self {
            hub,
            job,
            messages: job.history.clone(),
            response_text: String::new(),
            thinking_text: String::new(),
            tool_call_count: 0,
            truncated: false,
            active_tool_calls: Vec::new(),
        }
    }

    fn record(&self, payload: EventPayload) {
        let event = ChatEvent::new(&self.job.session_id, payload)
            .with_turn(&self.job.turn_id)
            .with_response(&self.job.response_id);
        self.hub
            .record_event(&self.job.session_id, self.job.persist, event);
    }

    fn broadcast(&self, msg: ServerMessage) {
        self.hub.broadcast(&self.job.session_id, msg, None);
    }

    fn forward(&self, chunk: &str) {
        if let Some(tx) = &self.job.forward_chunks {
            let _ = tx.try_send(chunk.to_owned());
        }
    }

    async fn run(&mut self) -> RunStatus {
        self.open_turn();

        let provider = match self.hub.providers.for_agent(&self.job.agent) {
            Ok(p) => p,
            Err(e) => return self.close_with_error(e),
        };
        let host = self.hub.tool_host_for_agent(&self.job.agent);
        let tools = host.list_tools().await;

        let Some(chat) = self.job.agent.chat.clone() else {
            return self.close_with_error(Error::AgentNotAvailable(format!(
                "agent '{}' has no chat provider",
                self.job.agent.agent_id
            )));
        };
        let model = self
            .job
            .model
            .clone()
            .or_else(|| chat.models.first().cloned());
        let thinking = self.job.thinking.clone().or_else(|| chat.thinking.clone());
        let max_iterations = chat.config.max_tool_iterations();

        self.messages.push(ChatMessage::user(self.job.content.clone()));

        for iteration in 0..max_iterations {
            if self.job.cancel.is_cancelled() {
                return self.close_cancelled();
            }

            let request = ChatRequest {
                messages: self.request_messages(),
                tools: tools.clone(),
                model: model.clone(),
                thinking: thinking.clone(),
                temperature: chat.config.temperature,
                max_tokens: chat.config.max_tokens,
            };

            let mut stream = match provider.stream_chat(request).await {
                Ok(s) => s,
                Err(e) => return self.close_with_error(e),
            };

            let mut iteration_text = String::new();
            let mut iteration_thinking = String::new();
            let mut thinking_started = false;
            let mut pending_calls: Vec<ToolCallRequest> = Vec::new();
            let mut cancelled = false;

            while let Some(item) = stream.next().await {
                if self.job.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let event = match item {
                    Ok(ev) => ev,
                    Err(e) => {
                        self.response_text.push_str(&iteration_text);
                        return self.close_with_error(e);
                    }
                };
                match event {
                    StreamEvent::Thinking { text } => {
                        if !thinking_started {
                            thinking_started = true;
                            self.record(EventPayload::ThinkingStart);
                            self.broadcast(ServerMessage::ThinkingStart {
                                session_id: None,
                                response_id: self.job.response_id.clone(),
                            });
                        }
                        self.record(EventPayload::ThinkingDelta { text: text.clone() });
                        self.broadcast(ServerMessage::ThinkingDelta {
                            session_id: None,
                            response_id: self.job.response_id.clone(),
                            text: text.clone(),
                        });
                        iteration_thinking.push_str(&text);
                    }
                    StreamEvent::Token { text } => {
                        self.record(EventPayload::AssistantChunk { text: text.clone() });
                        self.broadcast(ServerMessage::TextDelta {
                            session_id: None,
                            response_id: self.job.response_id.clone(),
                            text: text.clone(),
                        });
                        self.forward(&text);
                        iteration_text.push_str(&text);
                    }
                    StreamEvent::ToolCallStarted { call_id, tool_name } => {
                        self.broadcast(ServerMessage::ToolCallStart {
                            session_id: None,
                            tool_call_id: call_id,
                            tool_name,
                        });
                    }
                    StreamEvent::ToolCallDelta { .. } => {}
                    StreamEvent::ToolCallFinished { call_id, tool_name, arguments } => {
                        pending_calls.push(ToolCallRequest {
                            call_id,
                            tool_name,
                            arguments,
                        });
                    }
                    StreamEvent::Done { .. } => {}
                }
            }

            if thinking_started {
                self.record(EventPayload::ThinkingDone { text: iteration_thinking.clone() });
                self.broadcast(ServerMessage::ThinkingDone {
                    session_id: None,
                    response_id: self.job.response_id.clone(),
                    text: iteration_thinking.clone(),
                });
                self.thinking_text.push_str(&iteration_thinking);
            }
            self.response_text.push_str(&iteration_text);

            if cancelled {
                return self.close_cancelled();
            }

            if pending_calls.is_empty() {
                return self.close_complete();
            }

            // Tool dispatch phase.
            self.messages
                .push(ChatMessage::assistant_tool_calls(&iteration_text, &pending_calls));
            let mut remaining = pending_calls.into_iter();
            while let Some(call) = remaining.next() {
                if self.job.cancel.is_cancelled() {
                    // The current call and everything after it dies
                    // interrupted.
                    self.active_tool_calls
                        .push((call.call_id.clone(), call.tool_name.clone()));
                    for rest in remaining {
                        self.active_tool_calls.push((rest.call_id, rest.tool_name));
                    }
                    return self.close_cancelled();
                }
                self.dispatch_tool_call(&host, call).await;
            }

            if iteration + 1 == max_iterations {
                self.truncated = true;
                tracing::warn!(
                    session_id = %self.job.session_id,
                    max_iterations,
                    "tool iteration cap reached, forcing turn end"
                );
                return self.close_complete();
            }
        }

        self.close_complete()
    }

    /// Append the input events. User/system inputs log the message before
    /// the turn opens; delegated messages and callbacks open the turn
    /// first (the message belongs to the delegated exchange).
    fn open_turn(&mut self) {
        let trigger = self.job.source.trigger();
        match &self.job.source {
            MessageSource::User | MessageSource::System => {
                self.record(EventPayload::UserMessage { text: self.job.content.clone() });
                self.record(EventPayload::TurnStart { trigger });
            }
            MessageSource::AgentMessage { .. } | MessageSource::Callback { .. } => {
                self.record(EventPayload::TurnStart { trigger });
                self.record(EventPayload::UserMessage { text: self.job.content.clone() });
            }
        }
    }

    fn request_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = self.hub.build_system_prompt(&self.job.agent) {
            out.push(ChatMessage::system(prompt));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    async fn dispatch_tool_call(&mut self, host: &Arc<dyn ToolHost>, call: ToolCallRequest) {
        self.tool_call_count += 1;
        self.active_tool_calls
            .push((call.call_id.clone(), call.tool_name.clone()));
        self.record(EventPayload::ToolCall {
            tool_call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            args: call.arguments.clone(),
        });

        // Per-session tool-call budget.
        let decision = self.hub.check_tool_rate(&self.job.session_id);
        if !decision.allowed {
            let err = Error::RateLimited(format!(
                "tool call budget exhausted, retry in {}ms",
                decision.retry_after_ms
            ));
            self.finish_tool_call(&call, Err(err));
            return;
        }

        // Incremental output pump: chunks become events + broadcasts while
        // the tool runs; drained fully before the result is recorded.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
        let pump = {
            let session_id = self.job.session_id.clone();
            let tool_call_id = call.call_id.clone();
            let turn_id = self.job.turn_id.clone();
            let response_id = self.job.response_id.clone();
            let persist = self.job.persist;
            let forward = self.job.forward_chunks.clone();
            let hub = Arc::clone(self.hub);
            tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    hub.record_event(
                        &session_id,
                        persist,
                        ChatEvent::new(&session_id, EventPayload::ToolOutputDelta {
                            tool_call_id: tool_call_id.clone(),
                            chunk: chunk.clone(),
                        })
                        .with_turn(&turn_id)
                        .with_response(&response_id),
                    );
                    hub.broadcast(
                        &session_id,
                        ServerMessage::ToolOutputDelta {
                            session_id: None,
                            tool_call_id: tool_call_id.clone(),
                            chunk: chunk.clone(),
                        },
                        None,
                    );
                    if let Some(tx) = &forward {
                        let _ = tx.try_send(chunk);
                    }
                }
            })
        };

        let ctx = ToolCallContext {
            session_id: self.job.session_id.clone(),
            turn_id: Some(self.job.turn_id.clone()),
            response_id: Some(self.job.response_id.clone()),
            tool_call_id: call.call_id.clone(),
            agent_id: self.job.agent.agent_id.clone(),
            cancel: self.job.cancel.clone(),
            output: Some(chunk_tx),
        };
        let span = tracing::info_span!("tool.call", tool_name = %call.tool_name);
        let result = host
            .call_tool(&call.tool_name, call.arguments.clone(), &ctx)
            .instrument(span)
            .await;
        drop(ctx);
        let _ = pump.await;

        self.finish_tool_call(&call, result);
    }

    fn finish_tool_call(
        &mut self,
        call: &ToolCallRequest,
        result: parlor_domain::Result<serde_json::Value>,
    ) {
        self.active_tool_calls.retain(|(id, _)| id != &call.call_id);
        let is_delegation = call.tool_name == super::delegate::AGENTS_MESSAGE_TOOL;
        match result {
            Ok(value) => {
                self.record(EventPayload::ToolResult {
                    tool_call_id: call.call_id.clone(),
                    ok: true,
                    result: value.clone(),
                    error: None,
                });
                self.broadcast(ServerMessage::ToolResult {
                    session_id: None,
                    tool_call_id: call.call_id.clone(),
                    ok: true,
                    result: Some(value.clone()),
                    error: None,
                });
                self.messages.push(ChatMessage::tool_result(
                    call.call_id.clone(),
                    super::stringify_result(&value),
                    false,
                ));
            }
            Err(err) => {
                let info = ToolErrorInfo {
                    code: err.code().to_owned(),
                    message: err.to_string(),
                };
                tracing::warn!(
                    tool_name = %call.tool_name,
                    code = %info.code,
                    "tool call failed"
                );
                self.record(EventPayload::ToolResult {
                    tool_call_id: call.call_id.clone(),
                    ok: false,
                    result: serde_json::Value::Null,
                    error: Some(info.clone()),
                });
                self.broadcast(ServerMessage::ToolResult {
                    session_id: None,
                    tool_call_id: call.call_id.clone(),
                    ok: false,
                    result: None,
                    error: Some(ErrorBody {
                        code: info.code.clone(),
                        message: info.message.clone(),
                        details: None,
                    }),
                });
                self.messages.push(ChatMessage::tool_result(
                    call.call_id.clone(),
                    info.message,
                    true,
                ));
            }
        }
        if is_delegation {
            // A parked sync-delegation callback may deliver now that the
            // tool result is in the log.
            self.hub.flush_deferred_callback(&call.call_id);
        }
    }

    // ── Closing sequences ──────────────────────────────────────────

    fn close_complete(&mut self) -> RunStatus {
        self.record(EventPayload::AssistantDone {
            text: self.response_text.clone(),
            interrupted: false,
        });
        self.broadcast(ServerMessage::TextDone {
            session_id: None,
            response_id: self.job.response_id.clone(),
            text: self.response_text.clone(),
        });
        if !self.response_text.is_empty() {
            self.messages
                .push(ChatMessage::assistant(self.response_text.clone()));
        }
        self.record(EventPayload::TurnEnd);
        RunStatus::Complete
    }

    /// The cancellation closing sequence: interrupted `assistant_done`
    /// when any text streamed, interrupted results for every in-flight
    /// tool call, `output_cancelled`, `turn_end`.
    fn close_cancelled(&mut self) -> RunStatus {
        if !self.response_text.is_empty() {
            self.record(EventPayload::AssistantDone {
                text: self.response_text.clone(),
                interrupted: true,
            });
            self.messages
                .push(ChatMessage::assistant(self.response_text.clone()));
        }
        for (tool_call_id, tool_name) in std::mem::take(&mut self.active_tool_calls) {
            self.record(EventPayload::ToolResult {
                tool_call_id: tool_call_id.clone(),
                ok: false,
                result: serde_json::Value::Null,
                error: Some(ToolErrorInfo {
                    code: "tool_interrupted".into(),
                    message: format!("tool '{tool_name}' interrupted by cancellation"),
                }),
            });
        }
        self.record(EventPayload::OutputCancelled {
            response_id: self.job.response_id.clone(),
        });
        self.broadcast(ServerMessage::OutputCancelled {
            session_id: None,
            response_id: self.job.response_id.clone(),
        });
        self.record(EventPayload::TurnEnd);
        tracing::info!(session_id = %self.job.session_id, "turn cancelled");
        RunStatus::Cancelled
    }

    /// Provider failures convert to an error status; the turn still closes
    /// and the hub keeps running.
    fn close_with_error(&mut self, err: Error) -> RunStatus {
        tracing::error!(
            session_id = %self.job.session_id,
            code = err.code(),
            error = %err,
            "turn failed"
        );
        self.broadcast(ServerMessage::Error(ErrorBody::from_error(&err)));
        self.record(EventPayload::TurnEnd);
        RunStatus::Error
    }
}
