//! claude-cli rollout reader.
//!
//! The claude CLI keeps one JSONL file per session under
//! `~/.claude/projects/<munged-cwd>/<sessionId>.jsonl`: user and assistant
//! entries whose `message.content` is either a string or an array of
//! `text` / `thinking` / `tool_use` / `tool_result` blocks.

use std::path::PathBuf;

use serde_json::Value;

use parlor_domain::error::Result;
use parlor_domain::event::{ChatEvent, EventPayload, ToolErrorInfo};

use super::{parse_ts, HistoryProvider, HistoryRequest, RolloutCache, TurnAccumulator};

pub struct ClaudeHistoryProvider {
    projects_root: PathBuf,
    cache: RolloutCache,
}

impl ClaudeHistoryProvider {
    pub fn new(projects_root: Option<PathBuf>) -> Self {
        let projects_root = projects_root.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude")
                .join("projects")
        });
        Self {
            projects_root,
            cache: RolloutCache::new(),
        }
    }

    /// The CLI encodes a project cwd by replacing every path separator and
    /// dot with `-`.
    fn project_dir_name(cwd: &str) -> String {
        cwd.chars()
            .map(|c| if c == '/' || c == '\\' || c == '.' { '-' } else { c })
            .collect()
    }

    fn rollout_path(&self, req: &HistoryRequest) -> PathBuf {
        let provider_session = req.provider_attr("sessionId").unwrap_or(&req.session_id);
        let dir = match req.provider_attr("cwd") {
            Some(cwd) => self.projects_root.join(Self::project_dir_name(cwd)),
            None => self.projects_root.clone(),
        };
        dir.join(format!("{provider_session}.jsonl"))
    }
}

impl HistoryProvider for ClaudeHistoryProvider {
    fn supports(&self, provider_id: &str) -> bool {
        provider_id == "claude-cli"
    }

    fn get_history(&self, req: &HistoryRequest) -> Result<Vec<ChatEvent>> {
        let path = self.rollout_path(req);
        let session_id = req.session_id.clone();
        self.cache
            .get_or_parse(&path, req.force, move |raw| parse_rollout(&session_id, raw))
    }

    /// The CLI file is the source of truth; mirroring it would diverge.
    fn should_persist(&self, _req: &HistoryRequest) -> bool {
        false
    }
}

fn parse_rollout(session_id: &str, raw: &str) -> Vec<ChatEvent> {
    let mut acc = TurnAccumulator::new(session_id);
    let mut last_ts: i64 = 1;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed claude rollout line");
                continue;
            }
        };
        let ts = parse_ts(&entry["timestamp"]).unwrap_or(last_ts);
        last_ts = ts;

        match entry["type"].as_str() {
            Some("user") => convert_user(&mut acc, &entry["message"], ts),
            Some("assistant") => convert_assistant(&mut acc, &entry["message"], ts),
            // Summaries and system banners are CLI-internal.
            _ => {}
        }
    }
    acc.finish(last_ts)
}

fn convert_user(acc: &mut TurnAccumulator, message: &Value, ts: i64) {
    match &message["content"] {
        Value::String(text) => acc.user_message(text.clone(), ts),
        Value::Array(parts) => {
            // An array user entry carrying tool_result blocks is the CLI
            // feeding results back mid-turn, not a new user input.
            let mut text_parts = Vec::new();
            for part in parts {
                match part["type"].as_str() {
                    Some("tool_result") => {
                        let content = flatten_block_text(&part["content"]);
                        let is_error = part["is_error"].as_bool().unwrap_or(false);
                        acc.in_turn(
                            EventPayload::ToolResult {
                                tool_call_id: part["tool_use_id"]
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_owned(),
                                ok: !is_error,
                                result: Value::String(content.clone()),
                                error: is_error.then(|| ToolErrorInfo {
                                    code: "tool_error".into(),
                                    message: content,
                                }),
                            },
                            ts,
                        );
                    }
                    Some("text") => {
                        if let Some(text) = part["text"].as_str() {
                            text_parts.push(text.to_owned());
                        }
                    }
                    _ => {}
                }
            }
            if !text_parts.is_empty() {
                acc.user_message(text_parts.join("\n"), ts);
            }
        }
        _ => {}
    }
}

fn convert_assistant(acc: &mut TurnAccumulator, message: &Value, ts: i64) {
    let Some(parts) = message["content"].as_array() else {
        if let Some(text) = message["content"].as_str() {
            acc.in_turn(
                EventPayload::AssistantDone { text: text.to_owned(), interrupted: false },
                ts,
            );
        }
        return;
    };

    for part in parts {
        match part["type"].as_str() {
            Some("thinking") => {
                if let Some(text) = part["thinking"].as_str() {
                    acc.in_turn(EventPayload::ThinkingDone { text: text.to_owned() }, ts);
                }
            }
            Some("text") => {
                if let Some(text) = part["text"].as_str() {
                    acc.in_turn(
                        EventPayload::AssistantDone { text: text.to_owned(), interrupted: false },
                        ts,
                    );
                }
            }
            Some("tool_use") => {
                acc.in_turn(
                    EventPayload::ToolCall {
                        tool_call_id: part["id"].as_str().unwrap_or_default().to_owned(),
                        tool_name: part["name"].as_str().unwrap_or_default().to_owned(),
                        args: part["input"].clone(),
                    },
                    ts,
                );
            }
            _ => {}
        }
    }
}

/// `tool_result.content` is either a plain string or an array of text
/// blocks.
fn flatten_block_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ROLLOUT: &str = r#"{"type":"user","timestamp":"2025-05-01T10:00:00Z","message":{"role":"user","content":"list files"}}
{"type":"assistant","timestamp":"2025-05-01T10:00:01Z","message":{"role":"assistant","content":[{"type":"thinking","thinking":"need ls"},{"type":"tool_use","id":"tc1","name":"Bash","input":{"command":"ls"}}]}}
{"type":"user","timestamp":"2025-05-01T10:00:02Z","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"tc1","content":"a.txt"}]}}
{"type":"assistant","timestamp":"2025-05-01T10:00:03Z","message":{"role":"assistant","content":[{"type":"text","text":"one file: a.txt"}]}}
"#;

    #[test]
    fn parses_a_full_turn() {
        let events = parse_rollout("s1", ROLLOUT);
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "user_message",
                "turn_start",
                "thinking_done",
                "tool_call",
                "tool_result",
                "assistant_done",
                "turn_end",
            ]
        );
        // Thinking precedes the tool call, as the external log dictates.
        match events[3].payload().unwrap() {
            EventPayload::ToolCall { tool_call_id, tool_name, .. } => {
                assert_eq!(tool_call_id, "tc1");
                assert_eq!(tool_name, "Bash");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        // All share the session and honor chronology.
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(events.iter().all(|e| e.session_id == "s1"));
    }

    #[test]
    fn provider_reads_from_munged_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("-home-me-repo");
        std::fs::create_dir_all(&project).unwrap();
        let mut file = std::fs::File::create(project.join("ext-123.jsonl")).unwrap();
        file.write_all(ROLLOUT.as_bytes()).unwrap();

        let provider = ClaudeHistoryProvider::new(Some(dir.path().to_owned()));
        let mut attributes = serde_json::Map::new();
        attributes.insert(
            "providers".into(),
            serde_json::json!({"claude-cli": {"sessionId": "ext-123", "cwd": "/home/me/repo"}}),
        );
        let req = HistoryRequest {
            session_id: "internal-1".into(),
            provider_id: "claude-cli".into(),
            attributes,
            ..Default::default()
        };
        let events = provider.get_history(&req).unwrap();
        assert!(!events.is_empty());
        assert_eq!(events[0].session_id, "internal-1");
        assert!(!provider.should_persist(&req));
    }

    #[test]
    fn missing_rollout_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ClaudeHistoryProvider::new(Some(dir.path().to_owned()));
        let req = HistoryRequest {
            session_id: "nope".into(),
            provider_id: "claude-cli".into(),
            ..Default::default()
        };
        assert!(provider.get_history(&req).unwrap().is_empty());
    }

    #[test]
    fn cache_refreshes_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, ROLLOUT).unwrap();

        let provider = ClaudeHistoryProvider::new(Some(dir.path().to_owned()));
        let req = HistoryRequest {
            session_id: "s".into(),
            provider_id: "claude-cli".into(),
            ..Default::default()
        };
        let first = provider.get_history(&req).unwrap();

        // Append another exchange and backdate-proof the mtime bump.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            file,
            r#"{{"type":"user","timestamp":"2025-05-01T10:01:00Z","message":{{"role":"user","content":"more"}}}}"#
        )
        .unwrap();

        let second = provider.get_history(&req).unwrap();
        assert!(second.len() > first.len());
    }
}
