//! Deterministic scripted provider.
//!
//! Streams pre-programmed turns instead of calling a model. The
//! integration suites drive every end-to-end scenario through it, and it
//! doubles as an offline smoke provider (`echo` mode).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use parlor_domain::error::Result;

use crate::traits::{BoxStream, ChatProvider, ChatRequest, StreamEvent, Usage};

/// One scripted step of a turn.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Thinking(String),
    /// One assistant text chunk (one `Token` event).
    Text(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
}

/// A full scripted turn: the steps streamed for one model round.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub steps: Vec<ScriptStep>,
}

impl ScriptedTurn {
    /// A plain text reply streamed as the given chunks.
    pub fn chunks<S: Into<String>>(chunks: impl IntoIterator<Item = S>) -> Self {
        Self {
            steps: chunks.into_iter().map(|c| ScriptStep::Text(c.into())).collect(),
        }
    }

    pub fn text(reply: impl Into<String>) -> Self {
        Self::chunks([reply.into()])
    }
}

type TurnFn = Arc<dyn Fn(&ChatRequest) -> ScriptedTurn + Send + Sync>;

pub struct ScriptedProvider {
    id: String,
    handler: TurnFn,
    /// Queued turns take precedence over the handler.
    queue: Mutex<VecDeque<ScriptedTurn>>,
    step_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn with_handler(
        handler: impl Fn(&ChatRequest) -> ScriptedTurn + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: "scripted".into(),
            handler: Arc::new(handler),
            queue: Mutex::new(VecDeque::new()),
            step_delay: None,
        }
    }

    /// Replies by echoing the latest user message.
    pub fn echo() -> Self {
        Self::with_handler(|req| {
            ScriptedTurn::text(req.last_user_text().unwrap_or_default())
        })
    }

    /// Plays the given turns in order, then falls back to echo.
    pub fn with_queue(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        let provider = Self::echo();
        provider.queue.lock().extend(turns);
        provider
    }

    /// Sleep between steps; lets tests cancel mid-stream.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn enqueue(&self, turn: ScriptedTurn) {
        self.queue.lock().push_back(turn);
    }
}

#[async_trait::async_trait]
impl ChatProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let turn = self
            .queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| (self.handler)(&req));
        let delay = self.step_delay;

        let stream = async_stream::stream! {
            let mut any_tool_call = false;
            for step in turn.steps {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                match step {
                    ScriptStep::Thinking(text) => {
                        yield Ok(StreamEvent::Thinking { text });
                    }
                    ScriptStep::Text(text) => {
                        yield Ok(StreamEvent::Token { text });
                    }
                    ScriptStep::ToolCall { name, arguments } => {
                        any_tool_call = true;
                        let call_id = format!("call-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
                        yield Ok(StreamEvent::ToolCallStarted {
                            call_id: call_id.clone(),
                            tool_name: name.clone(),
                        });
                        yield Ok(StreamEvent::ToolCallFinished {
                            call_id,
                            tool_name: name,
                            arguments,
                        });
                    }
                }
            }
            yield Ok(StreamEvent::Done {
                usage: Some(Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                }),
                finish_reason: Some(if any_tool_call { "tool_calls" } else { "stop" }.into()),
            });
        };
        Ok(Box::pin(stream))
    }
}
