//! pi-cli session reader.
//!
//! pi keeps per-session JSONL files of role-tagged messages under its
//! agent home. Unlike the other CLIs, pi sessions can be mirrored into
//! the event store (`sessions.mirrorPiSessionHistory`), in which case the
//! event store is written too and stays aligned with the file.

use std::path::PathBuf;

use serde_json::Value;

use parlor_domain::error::Result;
use parlor_domain::event::{ChatEvent, EventPayload};

use super::{parse_ts, HistoryProvider, HistoryRequest, RolloutCache, TurnAccumulator};

pub struct PiHistoryProvider {
    sessions_root: PathBuf,
    mirror: bool,
    cache: RolloutCache,
}

impl PiHistoryProvider {
    pub fn new(sessions_root: Option<PathBuf>, mirror: bool) -> Self {
        let sessions_root = sessions_root.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".pi")
                .join("agent")
                .join("sessions")
        });
        Self {
            sessions_root,
            mirror,
            cache: RolloutCache::new(),
        }
    }

    fn session_path(&self, req: &HistoryRequest) -> PathBuf {
        let provider_session = req.provider_attr("sessionId").unwrap_or(&req.session_id);
        self.sessions_root.join(format!("{provider_session}.jsonl"))
    }
}

impl HistoryProvider for PiHistoryProvider {
    fn supports(&self, provider_id: &str) -> bool {
        provider_id == "pi-cli"
    }

    fn get_history(&self, req: &HistoryRequest) -> Result<Vec<ChatEvent>> {
        let path = self.session_path(req);
        let session_id = req.session_id.clone();
        self.cache
            .get_or_parse(&path, req.force, move |raw| parse_session(&session_id, raw))
    }

    fn should_persist(&self, _req: &HistoryRequest) -> bool {
        self.mirror
    }
}

fn parse_session(session_id: &str, raw: &str) -> Vec<ChatEvent> {
    let mut acc = TurnAccumulator::new(session_id);
    let mut last_ts: i64 = 1;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed pi session line");
                continue;
            }
        };
        if entry["type"].as_str() != Some("message") {
            continue;
        }
        let ts = parse_ts(&entry["timestamp"]).unwrap_or(last_ts);
        last_ts = ts;

        let message = &entry["message"];
        let text = match &message["content"] {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            _ => continue,
        };
        if text.is_empty() {
            continue;
        }

        match message["role"].as_str() {
            Some("user") => acc.user_message(text, ts),
            Some("assistant") => {
                acc.in_turn(EventPayload::AssistantDone { text, interrupted: false }, ts)
            }
            _ => {}
        }
    }
    acc.finish(last_ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = r#"{"type":"message","timestamp":"2025-07-01T08:00:00Z","message":{"role":"user","content":"good morning"}}
{"type":"message","timestamp":"2025-07-01T08:00:01Z","message":{"role":"assistant","content":"morning! coffee is on."}}
"#;

    #[test]
    fn parses_plain_exchanges() {
        let events = parse_session("s1", SESSION);
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["user_message", "turn_start", "assistant_done", "turn_end"]
        );
    }

    #[test]
    fn mirror_flag_controls_should_persist() {
        let mirrored = PiHistoryProvider::new(None, true);
        let unmirrored = PiHistoryProvider::new(None, false);
        let req = HistoryRequest {
            session_id: "s".into(),
            provider_id: "pi-cli".into(),
            ..Default::default()
        };
        assert!(mirrored.should_persist(&req));
        assert!(!unmirrored.should_persist(&req));
    }

    #[test]
    fn reads_session_file_by_provider_session_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pi-9.jsonl"), SESSION).unwrap();
        let provider = PiHistoryProvider::new(Some(dir.path().to_owned()), true);
        let mut attributes = serde_json::Map::new();
        attributes.insert(
            "providers".into(),
            serde_json::json!({"pi-cli": {"sessionId": "pi-9"}}),
        );
        let req = HistoryRequest {
            session_id: "local".into(),
            provider_id: "pi-cli".into(),
            attributes,
            ..Default::default()
        };
        assert_eq!(provider.get_history(&req).unwrap().len(), 4);
    }
}
