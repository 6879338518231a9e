//! End-to-end scenarios driven through the hub with the scripted
//! provider: basic turns, delegation, cancellation, timeouts, queueing,
//! cache bounds, scheduled runs, and external-agent callbacks.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use parlor_domain::agent::{AgentDefinition, AgentType, ChatProviderKind, ExternalSettings, ScheduleConfig};
use parlor_domain::config::{EnvConfig, ServerConfig};
use parlor_domain::event::{ChatEvent, EventPayload};
use parlor_domain::message::Role;
use parlor_domain::registry::AgentRegistry;
use parlor_gateway::hub::cache::MessageSource;
use parlor_gateway::hub::turn::RunStatus;
use parlor_gateway::hub::{DispatchMode, HubDeps, RunOutcome, SessionHub, StartSessionMessage};
use parlor_gateway::protocol::ServerMessage;
use parlor_gateway::scheduler::{ScheduleOutcome, Scheduler, SkipReason};
use parlor_providers::history::HistoryProviderRegistry;
use parlor_providers::{ProviderRegistry, ScriptStep, ScriptedProvider, ScriptedTurn};
use parlor_sessions::EventStore;
use parlor_tools::CompositeToolHost;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    _dir: tempfile::TempDir,
    hub: Arc<SessionHub>,
    events: Arc<EventStore>,
}

fn harness(agents: Vec<AgentDefinition>, provider: ScriptedProvider) -> Harness {
    harness_with_config(agents, provider, ServerConfig::default())
}

fn harness_with_config(
    agents: Vec<AgentDefinition>,
    provider: ScriptedProvider,
    config: ServerConfig,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvConfig {
        data_dir: dir.path().to_owned(),
        ..Default::default()
    };
    let events = Arc::new(EventStore::new(dir.path()));
    let index = Arc::new(parlor_sessions::SessionIndex::load(dir.path()).unwrap());
    let mut providers = ProviderRegistry::new();
    providers.register(ChatProviderKind::Openai, Arc::new(provider));

    let hub = SessionHub::new(HubDeps {
        config: Arc::new(config),
        env: Arc::new(env),
        agents: Arc::new(AgentRegistry::new(agents).unwrap()),
        index,
        events: Arc::clone(&events),
        providers: Arc::new(providers),
        history: Arc::new(HistoryProviderRegistry::new(Vec::new())),
        base_tools: Arc::new(CompositeToolHost::new(Vec::new())),
    });
    Harness { _dir: dir, hub, events }
}

fn agent(id: &str) -> AgentDefinition {
    AgentDefinition::minimal(id, ChatProviderKind::Openai)
}

fn event_types(events: &[ChatEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event_type()).collect()
}

/// Poll the event store until the predicate holds (or panic after 5s).
async fn wait_for_events(
    store: &EventStore,
    session_id: &str,
    pred: impl Fn(&[ChatEvent]) -> bool,
) -> Vec<ChatEvent> {
    for _ in 0..250 {
        let events = store.get_events(session_id).unwrap();
        if pred(&events) {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "condition not reached; events: {:?}",
        event_types(&store.get_events(session_id).unwrap())
    );
}

fn sync_start(session_id: &str, content: &str) -> StartSessionMessage {
    StartSessionMessage {
        session_id: session_id.to_owned(),
        content: content.to_owned(),
        source: MessageSource::User,
        mode: DispatchMode::Sync { timeout: Duration::from_secs(5) },
        forward_chunks: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Basic turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn basic_turn_event_sequence_and_broadcast() {
    let h = harness(
        vec![agent("a"), agent("b")],
        ScriptedProvider::with_queue([ScriptedTurn::chunks(["he", "llo"])]),
    );
    let session = h.hub.create_session("a").unwrap();
    let sid = session.session_id.clone();

    let (conn, mut rx) = h.hub.register_connection();
    h.hub.subscribe_connection(&sid, conn.id);

    let outcome = h.hub.handle_text_input(&sid, "hi", None).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Started { .. }));

    let events = wait_for_events(&h.events, &sid, |evs| {
        evs.iter().any(|e| e.event_type() == "turn_end")
    })
    .await;
    assert_eq!(
        event_types(&events),
        vec![
            "user_message",
            "turn_start",
            "assistant_chunk",
            "assistant_chunk",
            "assistant_done",
            "turn_end",
        ]
    );
    match events[4].payload().unwrap() {
        EventPayload::AssistantDone { text, interrupted } => {
            assert_eq!(text, "hello");
            assert!(!interrupted);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    // Turn bracketing: every event of the turn carries its id.
    let turn_id = events[1].turn_id.clone().unwrap();
    assert!(events[1..].iter().all(|e| e.turn_id.as_deref() == Some(turn_id.as_str())));

    // The subscriber saw two deltas then the full text.
    let mut deltas = Vec::new();
    let mut done = None;
    while done.is_none() {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("broadcast")
            .expect("open channel")
        {
            ServerMessage::TextDelta { text, session_id, .. } => {
                assert_eq!(session_id.as_deref(), Some(sid.as_str()));
                deltas.push(text);
            }
            ServerMessage::TextDone { text, .. } => done = Some(text),
            _ => {}
        }
    }
    assert_eq!(deltas, vec!["he", "llo"]);
    assert_eq!(done.as_deref(), Some("hello"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sync delegation via agents_message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn delegation_provider() -> ScriptedProvider {
    ScriptedProvider::with_handler(|req| {
        let last_user = req.last_user_text().unwrap_or_default();
        let has_tool_result = req.messages.iter().any(|m| m.role == Role::Tool);
        if last_user == "ping" {
            ScriptedTurn::text("pong")
        } else if last_user.starts_with("[Async response") {
            ScriptedTurn::text("noted")
        } else if has_tool_result {
            ScriptedTurn::text("relayed")
        } else {
            ScriptedTurn {
                steps: vec![ScriptStep::ToolCall {
                    name: "agents_message".into(),
                    arguments: json!({
                        "agentId": "b",
                        "content": "ping",
                        "session": "latest-or-create",
                        "mode": "sync",
                        "timeout": 5,
                    }),
                }],
            }
        }
    })
}

#[tokio::test]
async fn sync_delegation_creates_target_session_and_calls_back() {
    let h = harness(vec![agent("a"), agent("b")], delegation_provider());
    let caller = h.hub.create_session("a").unwrap().session_id;

    let outcome = h
        .hub
        .start_session_message(sync_start(&caller, "delegate this"))
        .await
        .unwrap();
    let report = match outcome {
        RunOutcome::Complete(r) => r,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(report.response, "relayed");
    assert_eq!(report.tool_call_count, 1);

    // The caller log carries the delegation, its result, and the callback.
    let caller_events = wait_for_events(&h.events, &caller, |evs| {
        evs.iter().any(|e| e.event_type() == "agent_callback")
    })
    .await;

    let (target_session, wait) = caller_events
        .iter()
        .find_map(|e| match e.payload() {
            Some(EventPayload::AgentMessage { target_session_id, wait, message, .. }) => {
                assert_eq!(message, "ping");
                Some((target_session_id.clone(), *wait))
            }
            _ => None,
        })
        .expect("agent_message event");
    assert!(wait);

    let tool_result = caller_events
        .iter()
        .find_map(|e| match e.payload() {
            Some(EventPayload::ToolResult { ok, result, .. }) => Some((*ok, result.clone())),
            _ => None,
        })
        .expect("tool_result event");
    assert!(tool_result.0);
    assert_eq!(tool_result.1["status"], "complete");
    assert_eq!(tool_result.1["response"], "pong");

    let callback = caller_events
        .iter()
        .find_map(|e| match e.payload() {
            Some(EventPayload::AgentCallback { from_agent_id, from_session_id, result, .. }) => {
                Some((from_agent_id.clone(), from_session_id.clone(), result.clone()))
            }
            _ => None,
        })
        .expect("agent_callback event");
    assert_eq!(callback.0, "b");
    assert_eq!(callback.1, target_session);
    assert_eq!(callback.2, "pong");

    // Log order on the caller: agent_message, tool_result, agent_callback.
    let position = |t: &str| {
        caller_events
            .iter()
            .position(|e| e.event_type() == t)
            .unwrap()
    };
    assert!(position("agent_message") < position("tool_result"));
    assert!(position("tool_result") < position("agent_callback"));

    // Target session ran a full bracketed turn answering "pong".
    let target_events = h.events.get_events(&target_session).unwrap();
    let types = event_types(&target_events);
    assert_eq!(types[0], "turn_start");
    assert_eq!(types[1], "user_message");
    assert!(types.contains(&"assistant_done"));
    assert_eq!(*types.last().unwrap(), "turn_end");

    // The caller gets a follow-up turn seeded with the async response.
    let follow_up = wait_for_events(&h.events, &caller, |evs| {
        evs.iter().any(|e| match e.payload() {
            Some(EventPayload::UserMessage { text }) => text.starts_with("[Async response"),
            _ => false,
        })
    })
    .await;
    let seeded = follow_up
        .iter()
        .find_map(|e| match e.payload() {
            Some(EventPayload::UserMessage { text }) if text.starts_with("[Async response") => {
                Some(text.clone())
            }
            _ => None,
        })
        .unwrap();
    assert!(seeded.ends_with(": pong"), "seeded text: {seeded}");
}

#[tokio::test]
async fn delegation_respects_visibility() {
    let mut a = agent("a");
    a.agent_denylist = Some(vec!["b".into()]);
    let h = harness(vec![a, agent("b")], delegation_provider());
    let caller = h.hub.create_session("a").unwrap().session_id;

    let outcome = h
        .hub
        .start_session_message(sync_start(&caller, "delegate this"))
        .await
        .unwrap();
    let report = match outcome {
        RunOutcome::Complete(r) => r,
        other => panic!("unexpected outcome {other:?}"),
    };
    // The tool call failed but the turn completed; the error is recorded
    // on the tool_result event.
    assert_eq!(report.status, RunStatus::Complete);
    let events = h.events.get_events(&caller).unwrap();
    let error = events
        .iter()
        .find_map(|e| match e.payload() {
            Some(EventPayload::ToolResult { error: Some(err), .. }) => Some(err.code.clone()),
            _ => None,
        })
        .expect("failed tool_result");
    assert_eq!(error, "agent_not_accessible");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancellation & timeouts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn cancellation_emits_closing_sequence() {
    let provider = ScriptedProvider::with_queue([ScriptedTurn::chunks(
        (0..50).map(|i| format!("chunk{i} ")),
    )])
    .with_step_delay(Duration::from_millis(25));
    let h = harness(vec![agent("a")], provider);
    let sid = h.hub.create_session("a").unwrap().session_id;

    h.hub.handle_text_input(&sid, "go", None).await.unwrap();

    // Let a few chunks stream, then cancel.
    wait_for_events(&h.events, &sid, |evs| {
        evs.iter().filter(|e| e.event_type() == "assistant_chunk").count() >= 2
    })
    .await;
    assert!(h.hub.cancel_active_run(&sid));

    let events = wait_for_events(&h.events, &sid, |evs| {
        evs.iter().any(|e| e.event_type() == "turn_end")
    })
    .await;

    let tail: Vec<&str> = event_types(&events)
        .into_iter()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    assert_eq!(tail, vec!["assistant_done", "output_cancelled", "turn_end"]);

    let interrupted = events
        .iter()
        .find_map(|e| match e.payload() {
            Some(EventPayload::AssistantDone { text, interrupted: true }) => Some(text.clone()),
            _ => None,
        })
        .expect("interrupted assistant_done");
    assert!(interrupted.starts_with("chunk0"));

    // The run slot is released (finalization follows the closing events).
    for _ in 0..100 {
        if !h.hub.has_active_run(&sid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("active run never cleared");
}

#[tokio::test]
async fn sync_timeout_cancels_and_reports_timeout() {
    let provider = ScriptedProvider::with_queue([ScriptedTurn::chunks(
        (0..100).map(|i| i.to_string()),
    )])
    .with_step_delay(Duration::from_millis(50));
    let h = harness(vec![agent("a")], provider);
    let sid = h.hub.create_session("a").unwrap().session_id;

    let outcome = h
        .hub
        .start_session_message(StartSessionMessage {
            mode: DispatchMode::Sync { timeout: Duration::from_millis(200) },
            ..sync_start(&sid, "slow")
        })
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Timeout { .. }));

    let events = h.events.get_events(&sid).unwrap();
    let types = event_types(&events);
    assert!(types.contains(&"output_cancelled"));
    assert_eq!(*types.last().unwrap(), "turn_end");
    assert!(!h.hub.has_active_run(&sid));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FIFO queueing on a busy session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn queued_messages_run_fifo_after_the_active_turn() {
    let provider = ScriptedProvider::echo().with_step_delay(Duration::from_millis(80));
    let h = harness(vec![agent("a")], provider);
    let sid = h.hub.create_session("a").unwrap().session_id;

    h.hub.handle_text_input(&sid, "first", None).await.unwrap();
    // While busy, queue two more.
    let q1 = h.hub.handle_text_input(&sid, "second", None).await.unwrap();
    let q2 = h.hub.handle_text_input(&sid, "third", None).await.unwrap();
    assert!(matches!(q1, RunOutcome::Queued));
    assert!(matches!(q2, RunOutcome::Queued));

    let events = wait_for_events(&h.events, &sid, |evs| {
        evs.iter().filter(|e| e.event_type() == "turn_end").count() == 3
    })
    .await;

    let users: Vec<String> = events
        .iter()
        .filter_map(|e| match e.payload() {
            Some(EventPayload::UserMessage { text }) => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(users, vec!["first", "second", "third"]);

    // Turn starts are ordered by time.
    let starts: Vec<i64> = events
        .iter()
        .filter(|e| e.event_type() == "turn_start")
        .map(|e| e.timestamp)
        .collect();
    assert_eq!(starts.len(), 3);
    assert!(starts.windows(2).all(|w| w[0] <= w[1]));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bounded cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn session_cache_stays_bounded() {
    let mut config = ServerConfig::default();
    config.sessions.max_cached = 2;
    let h = harness_with_config(vec![agent("a")], ScriptedProvider::echo(), config);

    for i in 0..5 {
        let sid = h.hub.create_session("a").unwrap().session_id;
        let outcome = h
            .hub
            .start_session_message(sync_start(&sid, &format!("msg {i}")))
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Complete(_)));
        assert!(h.hub.cached_session_count() <= 2, "cache exceeded its bound");
    }
}

#[tokio::test]
async fn evicted_sessions_rehydrate_with_history() {
    let mut config = ServerConfig::default();
    config.sessions.max_cached = 1;
    let h = harness_with_config(vec![agent("a")], ScriptedProvider::echo(), config);

    let first = h.hub.create_session("a").unwrap().session_id;
    h.hub
        .start_session_message(sync_start(&first, "remember me"))
        .await
        .unwrap();

    // Fill the cache with another session, evicting the first.
    let second = h.hub.create_session("a").unwrap().session_id;
    h.hub
        .start_session_message(sync_start(&second, "other"))
        .await
        .unwrap();

    // Back on the first session: echo provider sees prior history intact,
    // and events keep appending after the old ones.
    h.hub
        .start_session_message(sync_start(&first, "again"))
        .await
        .unwrap();
    let events = h.events.get_events(&first).unwrap();
    let users: Vec<_> = events
        .iter()
        .filter_map(|e| match e.payload() {
            Some(EventPayload::UserMessage { text }) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(users, vec!["remember me", "again"]);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduled runs with pre-check
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn scheduled_agent(pre_check: Option<&str>, prompt: Option<&str>) -> AgentDefinition {
    let mut a = agent("sched");
    a.schedules.push(ScheduleConfig {
        id: "deps".into(),
        cron: "* * * * *".into(),
        prompt: prompt.map(str::to_owned),
        pre_check: pre_check.map(str::to_owned),
        session_title: None,
        enabled: true,
        max_concurrent: 1,
        timezone: None,
    });
    a
}

#[tokio::test]
async fn scheduled_run_composes_prompt_from_pre_check_stdout() {
    let h = harness(
        vec![scheduled_agent(Some("echo deps updated"), Some("Review deps"))],
        ScriptedProvider::echo(),
    );
    let scheduler = Scheduler::new(h.hub.clone());
    scheduler.trigger_run("sched", "deps", false).await.unwrap();

    let record = scheduler.last_run("sched", "deps").expect("a run record");
    assert_eq!(record.outcome, ScheduleOutcome::Completed);

    // The scheduled session is tagged and carries the composed prompt.
    let session = h
        .hub
        .index
        .list()
        .into_iter()
        .find(|s| s.attributes.contains_key("scheduledSession"))
        .expect("scheduled session");
    assert_eq!(session.attributes["scheduledSession"]["agentId"], "sched");
    assert!(session.attributes["core"]["autoTitle"]
        .as_str()
        .unwrap()
        .starts_with("scheduled: sched/deps @ "));

    let events = h.events.get_events(&session.session_id).unwrap();
    let prompt = events
        .iter()
        .find_map(|e| match e.payload() {
            Some(EventPayload::UserMessage { text }) => Some(text.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(prompt, "Review deps\n\ndeps updated");

    // A second trigger reuses the same tagged session.
    scheduler.trigger_run("sched", "deps", false).await.unwrap();
    let tagged: Vec<_> = h
        .hub
        .index
        .list()
        .into_iter()
        .filter(|s| s.attributes.contains_key("scheduledSession"))
        .collect();
    assert_eq!(tagged.len(), 1);
}

#[tokio::test]
async fn failing_pre_check_skips_the_run() {
    let h = harness(
        vec![scheduled_agent(Some("exit 3"), Some("Never runs"))],
        ScriptedProvider::echo(),
    );
    let scheduler = Scheduler::new(h.hub.clone());
    scheduler.trigger_run("sched", "deps", false).await.unwrap();

    let record = scheduler.last_run("sched", "deps").unwrap();
    assert_eq!(
        record.outcome,
        ScheduleOutcome::Skipped(SkipReason::PrecheckNonzero)
    );
    assert!(h.hub.index.list().is_empty(), "no session should be created");
}

#[tokio::test]
async fn empty_prompt_and_stdout_skip_the_run() {
    let h = harness(
        vec![scheduled_agent(Some("true"), None)],
        ScriptedProvider::echo(),
    );
    let scheduler = Scheduler::new(h.hub.clone());
    scheduler.trigger_run("sched", "deps", false).await.unwrap();
    assert_eq!(
        scheduler.last_run("sched", "deps").unwrap().outcome,
        ScheduleOutcome::Skipped(SkipReason::NoPrompt)
    );
}

#[tokio::test]
async fn disabled_schedule_still_runs_on_manual_trigger() {
    let mut a = scheduled_agent(None, Some("Manual only"));
    a.schedules[0].enabled = false;
    let h = harness(vec![a], ScriptedProvider::echo());
    let scheduler = Scheduler::new(h.hub.clone());

    scheduler.trigger_run("sched", "deps", false).await.unwrap();
    assert_eq!(
        scheduler.last_run("sched", "deps").unwrap().outcome,
        ScheduleOutcome::Completed
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// External agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn external_callback_translates_into_a_bracketed_turn() {
    let mut ext = agent("ext");
    ext.agent_type = AgentType::External;
    ext.chat = None;
    ext.external = Some(ExternalSettings {
        input_url: "http://127.0.0.1:9/input".into(),
        callback_base_url: "http://127.0.0.1:8700".into(),
    });
    let h = harness(vec![ext], ScriptedProvider::echo());
    let sid = h.hub.create_session("ext").unwrap().session_id;

    h.hub
        .handle_external_callback(&sid, &json!({"type": "assistant", "text": "from outside"}))
        .unwrap();

    let events = h.events.get_events(&sid).unwrap();
    assert_eq!(
        event_types(&events),
        vec!["turn_start", "assistant_done", "turn_end"]
    );

    // Unknown payloads are preserved rather than dropped.
    h.hub
        .handle_external_callback(&sid, &json!({"type": "sensor", "reading": 7}))
        .unwrap();
    let events = h.events.get_events(&sid).unwrap();
    assert!(events.iter().any(|e| e.event_type() == "custom_message"));

    let missing = h
        .hub
        .handle_external_callback("nope", &json!({"text": "x"}))
        .unwrap_err();
    assert_eq!(missing.code(), "session_not_found");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle through the hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn clear_keeps_the_session_delete_removes_it() {
    let h = harness(vec![agent("a")], ScriptedProvider::echo());
    let sid = h.hub.create_session("a").unwrap().session_id;
    h.hub
        .start_session_message(sync_start(&sid, "hello"))
        .await
        .unwrap();
    assert!(!h.events.get_events(&sid).unwrap().is_empty());

    h.hub.clear_session(&sid).unwrap();
    assert!(h.events.get_events(&sid).unwrap().is_empty());
    assert!(h.hub.index.get(&sid).is_some(), "clear must not delete");

    // The cleared session accepts new turns with no stale history.
    let outcome = h
        .hub
        .start_session_message(sync_start(&sid, "fresh"))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Complete(_)));

    h.hub.delete_session(&sid).unwrap();
    assert!(h.hub.index.get(&sid).is_none());
    assert!(h.events.get_events(&sid).unwrap().is_empty());
    let err = h
        .hub
        .start_session_message(sync_start(&sid, "ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "session_not_found");
}

#[tokio::test]
async fn unknown_agent_session_is_rejected() {
    let h = harness(vec![agent("a")], ScriptedProvider::echo());
    let err = h.hub.create_session("nobody").unwrap_err();
    assert_eq!(err.code(), "agent_not_found");
}
