//! OpenAI-compatible streaming adapter.
//!
//! Speaks the chat-completions SSE contract, which also covers Azure-style
//! gateways, Ollama, vLLM, and the other compatible endpoints. Tool calls
//! arrive as indexed argument fragments; [`StreamAssembler`] stitches them
//! back into whole calls before the `Done` event.

use serde_json::{json, Value};

use parlor_domain::error::{Error, Result};
use parlor_domain::message::{ChatMessage, ContentPart, MessageContent, Role, ToolSpec};

use crate::traits::{BoxStream, ChatProvider, ChatRequest, StreamEvent, Usage};

pub struct OpenAiProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Other(format!("building http client: {e}")))?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut body = json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": wire_messages(&req.messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(wire_tools(&req.tools));
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if let Some(effort) = &req.thinking {
            body["reasoning_effort"] = json!(effort);
        }
        body
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&self.build_body(&req));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let provider = self.id.clone();
        let response = builder.send().await.map_err(|e| Error::Provider {
            provider: provider.clone(),
            message: e.to_string(),
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider,
                message: format!("HTTP {status}: {detail}"),
            });
        }

        let stream = async_stream::stream! {
            let mut response = response;
            let mut buffer = String::new();
            let mut assembler = StreamAssembler::default();
            let mut done_emitted = false;

            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for data in drain_sse_data(&mut buffer) {
                            for event in assembler.feed(&data) {
                                if matches!(event, Ok(StreamEvent::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Provider {
                            provider: provider.clone(),
                            message: e.to_string(),
                        });
                        return;
                    }
                }
            }

            if !done_emitted {
                for event in assembler.finish() {
                    yield event;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire conversion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match (&message.role, &message.content) {
            (Role::Tool, MessageContent::Parts(parts)) => {
                for part in parts {
                    if let ContentPart::ToolResult { tool_use_id, content, .. } = part {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                }
            }
            (Role::Assistant, MessageContent::Parts(parts)) => {
                let text: String = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                let tool_calls: Vec<Value> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::ToolUse { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            },
                        })),
                        _ => None,
                    })
                    .collect();
                let mut msg = json!({
                    "role": "assistant",
                    "content": if text.is_empty() { Value::Null } else { json!(text) },
                });
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = Value::Array(tool_calls);
                }
                out.push(msg);
            }
            (role, content) => {
                let role = match role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                out.push(json!({"role": role, "content": content.all_text()}));
            }
        }
    }
    out
}

fn wire_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull complete `data:` payloads out of an SSE buffer. Events are
/// `\n\n`-delimited; a trailing partial event stays buffered.
fn drain_sse_data(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();
        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_owned());
                }
            }
        }
    }
    payloads
}

/// Reassembles indexed tool-call fragments across chunks.
#[derive(Default)]
struct StreamAssembler {
    /// index → (call id, tool name, accumulated argument json).
    calls: Vec<(String, String, String)>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamAssembler {
    fn feed(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data == "[DONE]" {
            return self.finish();
        }
        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable SSE chunk");
                return Vec::new();
            }
        };

        let mut events = Vec::new();

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
            });
        }

        let Some(choice) = chunk["choices"].get(0) else {
            return events;
        };
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_owned());
        }

        let delta = &choice["delta"];
        if let Some(text) = delta["reasoning_content"].as_str() {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Thinking { text: text.to_owned() }));
            }
        }
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token { text: text.to_owned() }));
            }
        }

        if let Some(fragments) = delta["tool_calls"].as_array() {
            for fragment in fragments {
                let index = fragment["index"].as_u64().unwrap_or(0) as usize;
                while self.calls.len() <= index {
                    self.calls.push((String::new(), String::new(), String::new()));
                }
                let entry = &mut self.calls[index];
                if let Some(id) = fragment["id"].as_str() {
                    entry.0 = id.to_owned();
                }
                if let Some(name) = fragment["function"]["name"].as_str() {
                    entry.1.push_str(name);
                    events.push(Ok(StreamEvent::ToolCallStarted {
                        call_id: entry.0.clone(),
                        tool_name: entry.1.clone(),
                    }));
                }
                if let Some(args) = fragment["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        entry.2.push_str(args);
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            call_id: entry.0.clone(),
                            delta: args.to_owned(),
                        }));
                    }
                }
            }
        }

        events
    }

    /// Flush assembled tool calls and close the stream.
    fn finish(&mut self) -> Vec<Result<StreamEvent>> {
        let mut events = Vec::new();
        for (call_id, tool_name, args) in self.calls.drain(..) {
            if tool_name.is_empty() {
                continue;
            }
            let arguments = if args.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&args).unwrap_or_else(|e| {
                    tracing::warn!(
                        %call_id,
                        error = %e,
                        "tool call arguments are not valid JSON; using empty object"
                    );
                    json!({})
                })
            };
            events.push(Ok(StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            }));
        }
        events.push(Ok(StreamEvent::Done {
            usage: self.usage.take(),
            finish_reason: self.finish_reason.take(),
        }));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_splits_on_blank_lines() {
        let mut buf = "data: one\n\ndata: two\n\ndata: par".to_string();
        let payloads = drain_sse_data(&mut buf);
        assert_eq!(payloads, vec!["one", "two"]);
        assert_eq!(buf, "data: par");

        buf.push_str("tial\n\n");
        assert_eq!(drain_sse_data(&mut buf), vec!["partial"]);
    }

    #[test]
    fn assembler_emits_text_tokens() {
        let mut asm = StreamAssembler::default();
        let events = asm.feed(r#"{"choices":[{"delta":{"content":"hi"}}]}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamEvent::Token { text } if text == "hi"
        ));
    }

    #[test]
    fn assembler_stitches_tool_call_fragments() {
        let mut asm = StreamAssembler::default();
        asm.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"lookup"}}]}}]}"#,
        );
        asm.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":"}}]}}]}"#,
        );
        asm.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"x\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        );
        let events = asm.feed("[DONE]");

        let finished = events
            .iter()
            .map(|e| e.as_ref().unwrap())
            .find_map(|e| match e {
                StreamEvent::ToolCallFinished { call_id, tool_name, arguments } => {
                    Some((call_id.clone(), tool_name.clone(), arguments.clone()))
                }
                _ => None,
            })
            .expect("a finished tool call");
        assert_eq!(finished.0, "c1");
        assert_eq!(finished.1, "lookup");
        assert_eq!(finished.2, json!({"q": "x"}));

        match events.last().unwrap().as_ref().unwrap() {
            StreamEvent::Done { finish_reason, .. } => {
                assert_eq!(finish_reason.as_deref(), Some("tool_calls"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn assembler_captures_usage() {
        let mut asm = StreamAssembler::default();
        asm.feed(r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4,"total_tokens":14}}"#);
        let events = asm.feed("[DONE]");
        match events.last().unwrap().as_ref().unwrap() {
            StreamEvent::Done { usage: Some(u), .. } => {
                assert_eq!(u.prompt_tokens, 10);
                assert_eq!(u.total_tokens, 14);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn malformed_tool_arguments_fall_back_to_empty_object() {
        let mut asm = StreamAssembler::default();
        asm.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"t","arguments":"{oops"}}]}}]}"#,
        );
        let events = asm.feed("[DONE]");
        let has_empty_args = events.iter().map(|e| e.as_ref().unwrap()).any(|e| {
            matches!(e, StreamEvent::ToolCallFinished { arguments, .. } if arguments == &json!({}))
        });
        assert!(has_empty_args);
    }

    #[test]
    fn wire_messages_cover_tool_roundtrip() {
        use parlor_domain::message::ToolCallRequest;
        let messages = vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("what time is it"),
            ChatMessage::assistant_tool_calls(
                "checking",
                &[ToolCallRequest {
                    call_id: "c1".into(),
                    tool_name: "clock".into(),
                    arguments: json!({}),
                }],
            ),
            ChatMessage::tool_result("c1", "12:00", false),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[2]["tool_calls"][0]["function"]["name"], "clock");
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "c1");
    }
}
