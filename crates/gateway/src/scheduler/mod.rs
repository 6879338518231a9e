//! Cron-driven agent sessions.
//!
//! Every `agentId:scheduleId` pair gets a timer task armed from its cron
//! expression. On fire the timer rearms first (long runs must not drift),
//! then the run gates on enablement and the concurrency cap, executes the
//! optional pre-check subprocess, composes the prompt, resolves the
//! schedule's dedicated session, and drives a sync turn through the hub.

pub mod cron;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::process::Command;

use parlor_domain::agent::ScheduleConfig;
use parlor_domain::error::{Error, Result};

use crate::hub::cache::MessageSource;
use crate::hub::turn::RunStatus;
use crate::hub::{DispatchMode, RunOutcome, SessionHub, StartSessionMessage};

const PRE_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const RUN_TIMEOUT: Duration = Duration::from_secs(300);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    MaxConcurrent,
    PrecheckNonzero,
    NoPrompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Completed,
    Queued,
    Timeout,
    Skipped(SkipReason),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ScheduleRunRecord {
    pub at: DateTime<Utc>,
    pub outcome: ScheduleOutcome,
}

struct ScheduleState {
    agent_id: String,
    config: ScheduleConfig,
    /// Runtime enable/disable override (wins over the config flag).
    enabled_override: Option<bool>,
    running_count: u32,
    running_started_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    last_run: Option<ScheduleRunRecord>,
}

impl ScheduleState {
    fn effective_enabled(&self) -> bool {
        self.enabled_override.unwrap_or(self.config.enabled)
    }
}

/// Introspection view of one schedule.
#[derive(Debug, Clone)]
pub struct ScheduleSnapshot {
    pub agent_id: String,
    pub schedule_id: String,
    pub enabled: bool,
    pub running_count: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<ScheduleRunRecord>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Scheduler {
    hub: Arc<SessionHub>,
    entries: Mutex<HashMap<String, ScheduleState>>,
}

fn key_of(agent_id: &str, schedule_id: &str) -> String {
    format!("{agent_id}:{schedule_id}")
}

impl Scheduler {
    /// Build schedule state from every agent's schedule list. Invalid cron
    /// expressions were rejected by config validation already; any that
    /// slip through are logged and carry no timer.
    pub fn new(hub: Arc<SessionHub>) -> Arc<Self> {
        let mut entries = HashMap::new();
        for agent in hub.agents.list() {
            for config in &agent.schedules {
                entries.insert(
                    key_of(&agent.agent_id, &config.id),
                    ScheduleState {
                        agent_id: agent.agent_id.clone(),
                        config: config.clone(),
                        enabled_override: None,
                        running_count: 0,
                        running_started_at: None,
                        next_run_at: None,
                        last_run: None,
                    },
                );
            }
        }
        Arc::new(Self {
            hub,
            entries: Mutex::new(entries),
        })
    }

    /// Arm one timer task per schedule.
    pub fn start(self: &Arc<Self>) {
        let keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        for key in keys {
            let (cron_expr, tz) = {
                let entries = self.entries.lock();
                let state = &entries[&key];
                (
                    state.config.cron.clone(),
                    cron::parse_tz(state.config.timezone.as_deref().unwrap_or("UTC")),
                )
            };
            if let Err(e) = cron::validate(&cron_expr) {
                tracing::error!(schedule = %key, error = %e, "invalid cron, schedule not armed");
                continue;
            }

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let mut next = cron::next_after_tz(&cron_expr, &Utc::now(), tz);
                while let Some(fire_at) = next {
                    scheduler.set_next_run(&key, Some(fire_at));
                    let wait = (fire_at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;

                    // Rearm before executing so a long run does not push
                    // the following tick.
                    next = cron::next_after_tz(&cron_expr, &Utc::now(), tz);
                    scheduler.set_next_run(&key, next);

                    let scheduler = Arc::clone(&scheduler);
                    let key = key.clone();
                    tokio::spawn(async move {
                        scheduler.execute(&key, false, false).await;
                    });
                }
                tracing::warn!(schedule = %key, "cron produced no further occurrences");
            });
        }
        tracing::info!(
            schedules = self.entries.lock().len(),
            "scheduler started"
        );
    }

    fn set_next_run(&self, key: &str, at: Option<DateTime<Utc>>) {
        if let Some(state) = self.entries.lock().get_mut(key) {
            state.next_run_at = at;
        }
    }

    /// Manually fire a schedule. Runs even when disabled; the concurrency
    /// cap still applies unless `force`.
    pub async fn trigger_run(&self, agent_id: &str, schedule_id: &str, force: bool) -> Result<()> {
        let key = key_of(agent_id, schedule_id);
        if !self.entries.lock().contains_key(&key) {
            return Err(Error::InvalidArguments(format!(
                "no schedule '{schedule_id}' for agent '{agent_id}'"
            )));
        }
        self.execute(&key, true, force).await;
        Ok(())
    }

    /// Runtime enable/disable override (`None` reverts to the config).
    pub fn set_enabled(&self, agent_id: &str, schedule_id: &str, enabled: Option<bool>) -> Result<()> {
        let key = key_of(agent_id, schedule_id);
        let mut entries = self.entries.lock();
        let state = entries.get_mut(&key).ok_or_else(|| {
            Error::InvalidArguments(format!("no schedule '{schedule_id}' for agent '{agent_id}'"))
        })?;
        state.enabled_override = enabled;
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<ScheduleSnapshot> {
        self.entries
            .lock()
            .values()
            .map(|s| ScheduleSnapshot {
                agent_id: s.agent_id.clone(),
                schedule_id: s.config.id.clone(),
                enabled: s.effective_enabled(),
                running_count: s.running_count,
                next_run_at: s.next_run_at,
                last_run: s.last_run.clone(),
            })
            .collect()
    }

    pub fn last_run(&self, agent_id: &str, schedule_id: &str) -> Option<ScheduleRunRecord> {
        self.entries
            .lock()
            .get(&key_of(agent_id, schedule_id))
            .and_then(|s| s.last_run.clone())
    }

    // ── Execution ──────────────────────────────────────────────────

    async fn execute(&self, key: &str, manual: bool, force: bool) {
        let (agent_id, config) = {
            let mut entries = self.entries.lock();
            let Some(state) = entries.get_mut(key) else { return };

            if !manual && !state.effective_enabled() {
                state.last_run = Some(ScheduleRunRecord {
                    at: Utc::now(),
                    outcome: ScheduleOutcome::Skipped(SkipReason::Disabled),
                });
                tracing::debug!(schedule = %key, "skipped: disabled");
                return;
            }
            if !force && state.running_count >= state.config.max_concurrent {
                state.last_run = Some(ScheduleRunRecord {
                    at: Utc::now(),
                    outcome: ScheduleOutcome::Skipped(SkipReason::MaxConcurrent),
                });
                tracing::warn!(
                    schedule = %key,
                    max = state.config.max_concurrent,
                    "skipped: concurrency limit reached"
                );
                return;
            }
            state.running_count += 1;
            state.running_started_at = Some(Utc::now());
            (state.agent_id.clone(), state.config.clone())
        };

        let outcome = self.run_once(&agent_id, &config).await;
        tracing::info!(schedule = %key, outcome = ?outcome, "scheduled run finished");

        let mut entries = self.entries.lock();
        if let Some(state) = entries.get_mut(key) {
            state.running_count = state.running_count.saturating_sub(1);
            if state.running_count == 0 {
                state.running_started_at = None;
            }
            state.last_run = Some(ScheduleRunRecord {
                at: Utc::now(),
                outcome,
            });
        }
    }

    async fn run_once(&self, agent_id: &str, config: &ScheduleConfig) -> ScheduleOutcome {
        // Pre-check subprocess.
        let pre_check_stdout = match &config.pre_check {
            Some(command) => match self.run_pre_check(agent_id, command).await {
                PreCheckResult::Passed(stdout) => stdout,
                PreCheckResult::NonZero(code) => {
                    tracing::info!(
                        agent_id,
                        schedule_id = %config.id,
                        code,
                        "pre-check exited non-zero, skipping run"
                    );
                    return ScheduleOutcome::Skipped(SkipReason::PrecheckNonzero);
                }
                PreCheckResult::TimedOut => {
                    tracing::warn!(
                        agent_id,
                        schedule_id = %config.id,
                        "pre-check timed out, skipping run"
                    );
                    return ScheduleOutcome::Skipped(SkipReason::PrecheckNonzero);
                }
                PreCheckResult::Failed(e) => return ScheduleOutcome::Error(e),
            },
            None => String::new(),
        };

        let Some(content) = compose_prompt(config.prompt.as_deref(), &pre_check_stdout) else {
            return ScheduleOutcome::Skipped(SkipReason::NoPrompt);
        };

        let session_id = match self.resolve_schedule_session(agent_id, config) {
            Ok(id) => id,
            Err(e) => return ScheduleOutcome::Error(e.to_string()),
        };

        let outcome = self
            .hub
            .start_session_message(StartSessionMessage {
                session_id,
                content,
                source: MessageSource::System,
                mode: DispatchMode::Sync { timeout: RUN_TIMEOUT },
                forward_chunks: None,
            })
            .await;

        match outcome {
            Ok(RunOutcome::Complete(report)) => match report.status {
                RunStatus::Complete => ScheduleOutcome::Completed,
                RunStatus::Cancelled => ScheduleOutcome::Error("run cancelled".into()),
                RunStatus::Error => ScheduleOutcome::Error("run failed".into()),
            },
            Ok(RunOutcome::Timeout { .. }) => ScheduleOutcome::Timeout,
            Ok(RunOutcome::Queued) => ScheduleOutcome::Queued,
            Ok(RunOutcome::Started { .. }) => ScheduleOutcome::Completed,
            Err(e) => ScheduleOutcome::Error(e.to_string()),
        }
    }

    /// Run the pre-check as a shell subprocess under the agent's working
    /// dir (and wrapper, when configured). Killed on timeout.
    async fn run_pre_check(&self, agent_id: &str, command_line: &str) -> PreCheckResult {
        let agent_config = self
            .hub
            .agents
            .get(agent_id)
            .and_then(|a| a.chat.as_ref())
            .map(|c| c.config.clone())
            .unwrap_or_default();

        let mut command = match &agent_config.wrapper {
            Some(wrapper) => {
                let mut c = Command::new(wrapper);
                c.arg("sh").arg("-c").arg(command_line);
                c
            }
            None => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(command_line);
                c
            }
        };
        if let Some(dir) = &agent_config.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => return PreCheckResult::Failed(format!("spawning pre-check: {e}")),
        };

        match tokio::time::timeout(PRE_CHECK_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    PreCheckResult::Passed(String::from_utf8_lossy(&output.stdout).into_owned())
                } else {
                    PreCheckResult::NonZero(output.status.code().unwrap_or(-1))
                }
            }
            Ok(Err(e)) => PreCheckResult::Failed(format!("waiting for pre-check: {e}")),
            // Dropping the output future reaps the child (kill_on_drop).
            Err(_) => PreCheckResult::TimedOut,
        }
    }

    /// Reuse the most recently updated session tagged for this schedule,
    /// otherwise create one with an auto title.
    fn resolve_schedule_session(&self, agent_id: &str, config: &ScheduleConfig) -> Result<String> {
        let marker = json!({"agentId": agent_id, "scheduleId": config.id});
        if let Some(existing) = self
            .hub
            .index
            .list()
            .into_iter()
            .find(|s| s.attributes.get("scheduledSession") == Some(&marker))
        {
            return Ok(existing.session_id);
        }

        let summary = self.hub.create_session(agent_id)?;
        let title = config.session_title.clone().unwrap_or_else(|| {
            format!(
                "scheduled: {agent_id}/{} @ {}",
                config.id,
                Utc::now().format("%Y-%m-%d %H:%M")
            )
        });
        self.hub.index.update_session_attributes(
            &summary.session_id,
            json!({
                "scheduledSession": marker,
                "core": {"autoTitle": title},
            }),
        )?;
        Ok(summary.session_id)
    }
}

enum PreCheckResult {
    Passed(String),
    NonZero(i32),
    TimedOut,
    Failed(String),
}

/// `trim(prompt) + "\n\n" + trim(stdout)`, omitting empty halves; `None`
/// when both are empty.
fn compose_prompt(prompt: Option<&str>, pre_check_stdout: &str) -> Option<String> {
    let parts: Vec<&str> = [prompt.unwrap_or(""), pre_check_stdout]
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_prompt_joins_both_halves() {
        assert_eq!(
            compose_prompt(Some("Review deps"), "deps updated\n"),
            Some("Review deps\n\ndeps updated".to_string())
        );
    }

    #[test]
    fn compose_prompt_handles_empty_halves() {
        assert_eq!(compose_prompt(Some("Only prompt"), ""), Some("Only prompt".into()));
        assert_eq!(compose_prompt(None, "only output"), Some("only output".into()));
        assert_eq!(compose_prompt(None, ""), None);
        assert_eq!(compose_prompt(Some("   "), "  \n"), None);
    }

    #[test]
    fn schedule_keys_are_agent_scoped() {
        assert_eq!(key_of("a", "daily"), "a:daily");
        assert_ne!(key_of("a", "daily"), key_of("b", "daily"));
    }
}
