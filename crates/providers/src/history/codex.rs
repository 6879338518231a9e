//! codex-cli rollout reader.
//!
//! Codex writes dated rollout files under `~/.codex/sessions/` whose names
//! carry the codex session uuid. The gateway keeps its own
//! `codex-sessions.json` map from internal session ids to codex ids, so
//! locating a rollout is map lookup + filename scan.

use std::path::{Path, PathBuf};

use serde_json::Value;

use parlor_domain::error::Result;
use parlor_domain::event::{ChatEvent, EventPayload};

use super::{parse_ts, HistoryProvider, HistoryRequest, RolloutCache, TurnAccumulator};

pub struct CodexHistoryProvider {
    sessions_root: PathBuf,
    /// Path of `codex-sessions.json` in the data dir.
    map_path: PathBuf,
    cache: RolloutCache,
}

impl CodexHistoryProvider {
    pub fn new(sessions_root: Option<PathBuf>, map_path: PathBuf) -> Self {
        let sessions_root = sessions_root.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".codex")
                .join("sessions")
        });
        Self {
            sessions_root,
            map_path,
            cache: RolloutCache::new(),
        }
    }

    /// Resolve the codex session id: attribute first, then the id map.
    fn codex_session_id(&self, req: &HistoryRequest) -> Option<String> {
        if let Some(id) = req.provider_attr("sessionId") {
            return Some(id.to_owned());
        }
        let raw = std::fs::read_to_string(&self.map_path).ok()?;
        let map: Value = serde_json::from_str(&raw).ok()?;
        map.get(&req.session_id)?.as_str().map(str::to_owned)
    }

    fn find_rollout(&self, codex_id: &str) -> Option<PathBuf> {
        find_file_containing(&self.sessions_root, codex_id, 4)
    }
}

/// Breadth-limited recursive filename scan (year/month/day nesting).
fn find_file_containing(dir: &Path, needle: &str, depth: u32) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if depth > 0 {
                if let Some(found) = find_file_containing(&path, needle, depth - 1) {
                    return Some(found);
                }
            }
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(needle) && n.ends_with(".jsonl"))
        {
            return Some(path);
        }
    }
    None
}

impl HistoryProvider for CodexHistoryProvider {
    fn supports(&self, provider_id: &str) -> bool {
        provider_id == "codex-cli"
    }

    fn get_history(&self, req: &HistoryRequest) -> Result<Vec<ChatEvent>> {
        let Some(codex_id) = self.codex_session_id(req) else {
            return Ok(Vec::new());
        };
        let Some(path) = self.find_rollout(&codex_id) else {
            return Ok(Vec::new());
        };
        let session_id = req.session_id.clone();
        self.cache
            .get_or_parse(&path, req.force, move |raw| parse_rollout(&session_id, raw))
    }

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
                tracing::warn!(error = %e, "skipping malformed codex rollout line");
                continue;
            }
        };
        if entry["type"].as_str() != Some("response_item") {
            continue;
        }
        let ts = parse_ts(&entry["timestamp"]).unwrap_or(last_ts);
        last_ts = ts;
        let payload = &entry["payload"];

        match payload["type"].as_str() {
            Some("message") => {
                let text = collect_text(&payload["content"]);
                if text.is_empty() {
                    continue;
                }
                match payload["role"].as_str() {
                    Some("user") => acc.user_message(text, ts),
                    Some("assistant") => {
                        acc.in_turn(EventPayload::AssistantDone { text, interrupted: false }, ts)
                    }
                    _ => {}
                }
            }
            Some("reasoning") => {
                let text = collect_text(&payload["summary"]);
                if !text.is_empty() {
                    acc.in_turn(EventPayload::ThinkingDone { text }, ts);
                }
            }
            Some("function_call") => {
                let args = payload["arguments"]
                    .as_str()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_else(|| payload["arguments"].clone());
                acc.in_turn(
                    EventPayload::ToolCall {
                        tool_call_id: payload["call_id"].as_str().unwrap_or_default().to_owned(),
                        tool_name: payload["name"].as_str().unwrap_or_default().to_owned(),
                        args,
                    },
                    ts,
                );
            }
            Some("function_call_output") => {
                acc.in_turn(
                    EventPayload::ToolResult {
                        tool_call_id: payload["call_id"].as_str().unwrap_or_default().to_owned(),
                        ok: true,
                        result: payload["output"].clone(),
                        error: None,
                    },
                    ts,
                );
            }
            _ => {}
        }
    }
    acc.finish(last_ts)
}

/// Codex message content is an array of `input_text`/`output_text`/
/// `summary_text` blocks.
fn collect_text(content: &Value) -> String {
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
