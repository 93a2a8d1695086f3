//! Auto-approval countdowns and retry backoff
//!
//! Pure bookkeeping: every operation returns [`Effect`]s and the connection
//! actor turns them into timers and frames. A timer that fires after its
//! state is gone is answered with a stop, never with an action.

use std::collections::HashMap;
use std::time::Duration;

use agentrelay_protocol::{new_id, RemoteCommand, TaskMessageData, UiFrame};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{AutoApprovalConfig, AutoRetryConfig};
use crate::events::ClientEvent;
use crate::messages::StructuredContent;
use crate::state::Effect;

/// What an ask wants to run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTarget {
    Tool { name: String, path: Option<String> },
    Command(String),
}

impl ApprovalTarget {
    /// Approval target of an ask, if it is a tool or command ask.
    pub fn of(content: &StructuredContent) -> Option<Self> {
        match content {
            StructuredContent::ToolApproval { tool, path, .. } => Some(ApprovalTarget::Tool {
                name: tool.clone(),
                path: path.clone(),
            }),
            StructuredContent::CommandApproval { command } => {
                Some(ApprovalTarget::Command(command.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ApprovalKey {
    pub task_id: String,
    pub target: ApprovalTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalState {
    pub key: ApprovalKey,
    pub agent_id: String,
    pub time_left: u32,
    pub is_approved: bool,
    pub is_denied: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryState {
    pub agent_id: String,
    pub is_retrying: bool,
    pub retry_count: u32,
    pub timer_pending: bool,
}

/// Delay before retry number `retry_count` (0-based); the last entry repeats.
pub fn retry_delay(retry_count: u32, delays_ms: &[u64]) -> Duration {
    let Some(last) = delays_ms.len().checked_sub(1) else {
        return Duration::ZERO;
    };
    let index = (retry_count as usize).min(last);
    Duration::from_millis(delays_ms[index])
}

#[derive(Debug)]
pub struct ApprovalAndRetryScheduler {
    approval: AutoApprovalConfig,
    retry: AutoRetryConfig,
    /// At most one pending approval per task; a newer ask supersedes it.
    approvals: HashMap<String, ApprovalState>,
    retries: HashMap<String, RetryState>,
}

impl ApprovalAndRetryScheduler {
    pub fn new(approval: AutoApprovalConfig, retry: AutoRetryConfig) -> Self {
        Self {
            approval,
            retry,
            approvals: HashMap::new(),
            retries: HashMap::new(),
        }
    }

    pub fn approval(&self, task_id: &str) -> Option<&ApprovalState> {
        self.approvals.get(task_id)
    }

    pub fn retry_state(&self, task_id: &str) -> Option<&RetryState> {
        self.retries.get(task_id)
    }

    pub fn approvals(&self) -> impl Iterator<Item = &ApprovalState> {
        self.approvals.values()
    }

    pub fn retries(&self) -> &HashMap<String, RetryState> {
        &self.retries
    }

    // -- Approvals ---------------------------------------------------------

    pub fn on_ask(&mut self, agent_id: &str, task_id: &str, target: ApprovalTarget) -> Vec<Effect> {
        let key = ApprovalKey {
            task_id: task_id.to_string(),
            target,
        };
        if self
            .approvals
            .get(task_id)
            .is_some_and(|existing| existing.key == key)
        {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if let Some(previous) = self.approvals.remove(task_id) {
            effects.push(Effect::StopCountdown(previous.key));
        }
        let state = ApprovalState {
            key: key.clone(),
            agent_id: agent_id.to_string(),
            time_left: self.approval.timeout_secs,
            is_approved: false,
            is_denied: false,
        };
        effects.push(Effect::Notify(ClientEvent::ApprovalRequested {
            approval: state.clone(),
        }));
        if self.approval.enabled {
            effects.push(Effect::StartCountdown(key));
        }
        self.approvals.insert(task_id.to_string(), state);
        effects
    }

    /// One second of an auto-approval countdown elapsed.
    pub fn countdown_tick(&mut self, key: &ApprovalKey) -> Vec<Effect> {
        let time_left = match self.approvals.get_mut(&key.task_id) {
            Some(state) if state.key == *key => {
                state.time_left = state.time_left.saturating_sub(1);
                state.time_left
            }
            _ => return vec![Effect::StopCountdown(key.clone())],
        };
        if time_left == 0 {
            return self.resolve(&key.task_id, true, true);
        }
        vec![Effect::Notify(ClientEvent::ApprovalCountdown {
            key: key.clone(),
            time_left,
        })]
    }

    pub fn approve(&mut self, task_id: &str) -> Vec<Effect> {
        self.resolve(task_id, true, false)
    }

    pub fn deny(&mut self, task_id: &str) -> Vec<Effect> {
        self.resolve(task_id, false, false)
    }

    fn resolve(&mut self, task_id: &str, approve: bool, automatic: bool) -> Vec<Effect> {
        let Some(mut state) = self.approvals.remove(task_id) else {
            return Vec::new();
        };
        state.is_approved = approve;
        state.is_denied = !approve;
        debug!(
            component = "scheduler",
            event = "scheduler.approval.resolved",
            task_id,
            approved = approve,
            automatic,
            "Approval resolved"
        );

        let agent_id = state.agent_id.as_str();
        let mut effects = vec![Effect::StopCountdown(state.key.clone())];
        if approve {
            effects.push(Effect::Send(remote(
                agent_id,
                RemoteCommand::ResumeTask {
                    task_id: task_id.to_string(),
                },
            )));
            effects.push(Effect::Send(remote(
                agent_id,
                RemoteCommand::PressPrimaryButton {
                    task_id: task_id.to_string(),
                },
            )));
        } else {
            effects.push(Effect::Send(remote(
                agent_id,
                RemoteCommand::PressSecondaryButton {
                    task_id: task_id.to_string(),
                },
            )));
        }
        effects.push(Effect::Notify(ClientEvent::ApprovalResolved {
            key: state.key,
            approved: approve,
            automatic,
        }));
        effects
    }

    /// A spawn makes the task's pending prompt moot: drop it without acting.
    pub fn on_spawn(&mut self, task_id: &str) -> Vec<Effect> {
        match self.approvals.remove(task_id) {
            Some(state) => vec![Effect::StopCountdown(state.key)],
            None => Vec::new(),
        }
    }

    /// The task completed or was aborted.
    pub fn on_task_finished(&mut self, task_id: &str) -> Vec<Effect> {
        let mut effects = self.on_spawn(task_id);
        if let Some(state) = self.retries.remove(task_id) {
            if state.timer_pending {
                effects.push(Effect::CancelRetry {
                    task_id: task_id.to_string(),
                });
            }
        }
        effects
    }

    /// The user closed the connection. Countdowns stop, leaving approvals to
    /// a manual decision, and pending retries are cancelled.
    pub fn halt_timers(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.approval.enabled {
            let mut keys: Vec<ApprovalKey> =
                self.approvals.values().map(|state| state.key.clone()).collect();
            keys.sort_by(|a, b| a.task_id.cmp(&b.task_id));
            effects.extend(keys.into_iter().map(Effect::StopCountdown));
        }

        let mut pending: Vec<String> = self
            .retries
            .iter()
            .filter(|(_, state)| state.timer_pending)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        pending.sort();
        for task_id in pending {
            effects.extend(self.cancel_retry(&task_id));
        }
        effects
    }

    // -- Retries -----------------------------------------------------------

    pub fn on_api_error(&mut self, agent_id: &str, task_id: &str, message: &str) -> Vec<Effect> {
        let mut effects = vec![Effect::Notify(ClientEvent::ApiError {
            task_id: task_id.to_string(),
            message: message.to_string(),
        })];
        if !self.retry.enabled {
            return effects;
        }

        let state = self.retries.entry(task_id.to_string()).or_default();
        state.agent_id = agent_id.to_string();
        if state.timer_pending {
            return effects;
        }
        if state.retry_count >= self.retry.max_retries {
            state.is_retrying = false;
            effects.push(Effect::Notify(ClientEvent::RetryExhausted {
                task_id: task_id.to_string(),
            }));
            return effects;
        }

        let delay = retry_delay(state.retry_count, &self.retry.delays_ms);
        state.retry_count += 1;
        state.is_retrying = true;
        state.timer_pending = true;
        effects.push(Effect::ScheduleRetry {
            task_id: task_id.to_string(),
            delay,
        });
        effects.push(Effect::Notify(ClientEvent::RetryScheduled {
            task_id: task_id.to_string(),
            attempt: state.retry_count,
            delay,
        }));
        effects
    }

    /// The retry timer for `task_id` fired.
    pub fn retry_fired(
        &mut self,
        task_id: &str,
        last_user_message: Option<(String, Vec<String>)>,
    ) -> Vec<Effect> {
        let agent_id = match self.retries.get_mut(task_id) {
            Some(state) if state.timer_pending => {
                state.timer_pending = false;
                state.agent_id.clone()
            }
            _ => return Vec::new(),
        };
        resend(&agent_id, task_id, last_user_message)
    }

    /// A non-error message arrived for `task_id`.
    pub fn on_success(&mut self, task_id: &str) -> Vec<Effect> {
        match self.retries.remove(task_id) {
            Some(state) if state.timer_pending => vec![Effect::CancelRetry {
                task_id: task_id.to_string(),
            }],
            _ => Vec::new(),
        }
    }

    pub fn retry_now(
        &mut self,
        agent_id: &str,
        task_id: &str,
        last_user_message: Option<(String, Vec<String>)>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(state) = self.retries.get_mut(task_id) {
            if state.timer_pending {
                state.timer_pending = false;
                effects.push(Effect::CancelRetry {
                    task_id: task_id.to_string(),
                });
            }
        }
        effects.extend(resend(agent_id, task_id, last_user_message));
        effects
    }

    /// Stop the pending retry; the count is kept.
    pub fn cancel_retry(&mut self, task_id: &str) -> Vec<Effect> {
        let Some(state) = self.retries.get_mut(task_id) else {
            return Vec::new();
        };
        let was_pending = state.timer_pending;
        state.timer_pending = false;
        state.is_retrying = false;
        if !was_pending {
            return Vec::new();
        }
        vec![
            Effect::CancelRetry {
                task_id: task_id.to_string(),
            },
            Effect::Notify(ClientEvent::RetryCancelled {
                task_id: task_id.to_string(),
            }),
        ]
    }

    /// Re-key pending approval and retry state after a task id change.
    pub fn rename_task(&mut self, old_id: &str, new_id: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(mut state) = self.approvals.remove(old_id) {
            if self.approval.enabled {
                effects.push(Effect::StopCountdown(state.key.clone()));
            }
            state.key.task_id = new_id.to_string();
            if self.approval.enabled {
                effects.push(Effect::StartCountdown(state.key.clone()));
            }
            self.approvals.insert(new_id.to_string(), state);
        }
        if let Some(state) = self.retries.remove(old_id) {
            if state.timer_pending {
                effects.push(Effect::CancelRetry {
                    task_id: old_id.to_string(),
                });
                effects.push(Effect::ScheduleRetry {
                    task_id: new_id.to_string(),
                    delay: retry_delay(
                        state.retry_count.saturating_sub(1),
                        &self.retry.delays_ms,
                    ),
                });
            }
            self.retries.insert(new_id.to_string(), state);
        }
        effects
    }
}

fn remote(agent_id: &str, command: RemoteCommand) -> UiFrame {
    UiFrame::RemoteCommand {
        agent_id: agent_id.to_string(),
        request_id: Some(new_id()),
        command,
    }
}

fn resend(
    agent_id: &str,
    task_id: &str,
    last_user_message: Option<(String, Vec<String>)>,
) -> Vec<Effect> {
    let Some((text, images)) = last_user_message else {
        warn!(
            component = "scheduler",
            event = "scheduler.retry.no_user_message",
            task_id,
            "Nothing to resend for task"
        );
        return Vec::new();
    };
    vec![Effect::Send(UiFrame::SendMessageToTask {
        agent_id: agent_id.to_string(),
        data: TaskMessageData {
            task_id: task_id.to_string(),
            text,
            images,
        },
    })]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(auto_approve: bool) -> ApprovalAndRetryScheduler {
        ApprovalAndRetryScheduler::new(
            AutoApprovalConfig {
                enabled: auto_approve,
                timeout_secs: 3,
            },
            AutoRetryConfig::default(),
        )
    }

    fn command(cmd: &str) -> ApprovalTarget {
        ApprovalTarget::Command(cmd.to_string())
    }

    fn sent_commands(effects: &[Effect]) -> Vec<&'static str> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(UiFrame::RemoteCommand { command, .. }) => Some(command.name()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn retry_delays_repeat_the_last_entry() {
        let delays = [10_000, 30_000, 60_000];
        let schedule: Vec<u128> = (0..4)
            .map(|count| retry_delay(count, &delays).as_millis())
            .collect();
        assert_eq!(schedule, vec![10_000, 30_000, 60_000, 60_000]);
        assert_eq!(retry_delay(3, &[]), Duration::ZERO);
    }

    #[test]
    fn countdown_reaching_zero_approves() {
        let mut scheduler = scheduler(true);
        let effects = scheduler.on_ask("a1", "t1", command("npm test"));
        let key = ApprovalKey {
            task_id: "t1".into(),
            target: command("npm test"),
        };
        assert!(effects.contains(&Effect::StartCountdown(key.clone())));

        assert!(sent_commands(&scheduler.countdown_tick(&key)).is_empty());
        assert!(sent_commands(&scheduler.countdown_tick(&key)).is_empty());
        let effects = scheduler.countdown_tick(&key);
        assert_eq!(sent_commands(&effects), vec!["resumeTask", "pressPrimaryButton"]);
        assert!(effects.contains(&Effect::Notify(ClientEvent::ApprovalResolved {
            key: key.clone(),
            approved: true,
            automatic: true,
        })));

        // A late tick finds nothing to approve
        assert_eq!(
            scheduler.countdown_tick(&key),
            vec![Effect::StopCountdown(key)]
        );
    }

    #[test]
    fn disabled_auto_approval_waits_for_the_user() {
        let mut scheduler = scheduler(false);
        let effects = scheduler.on_ask("a1", "t1", command("rm -rf build"));
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, Effect::StartCountdown(_))));
        assert_eq!(scheduler.approval("t1").map(|s| s.time_left), Some(3));
    }

    #[test]
    fn manual_approve_is_idempotent_and_deny_presses_secondary() {
        let mut scheduler = scheduler(true);
        scheduler.on_ask("a1", "t1", command("ls"));
        assert_eq!(
            sent_commands(&scheduler.approve("t1")),
            vec!["resumeTask", "pressPrimaryButton"]
        );
        assert!(scheduler.approve("t1").is_empty());

        scheduler.on_ask("a1", "t2", command("ls"));
        assert_eq!(sent_commands(&scheduler.deny("t2")), vec!["pressSecondaryButton"]);
        assert!(scheduler.deny("t2").is_empty());
    }

    #[test]
    fn observed_spawn_discards_pending_approval() {
        let mut scheduler = scheduler(true);
        let target = ApprovalTarget::Tool {
            name: "newTask".into(),
            path: None,
        };
        scheduler.on_ask("a1", "t1", target.clone());
        let key = ApprovalKey {
            task_id: "t1".into(),
            target,
        };
        assert_eq!(scheduler.on_spawn("t1"), vec![Effect::StopCountdown(key.clone())]);
        for _ in 0..5 {
            assert!(sent_commands(&scheduler.countdown_tick(&key)).is_empty());
        }
    }

    #[test]
    fn newer_ask_supersedes_and_repeat_ask_is_ignored() {
        let mut scheduler = scheduler(true);
        scheduler.on_ask("a1", "t1", command("ls"));
        assert!(scheduler.on_ask("a1", "t1", command("ls")).is_empty());

        let effects = scheduler.on_ask("a1", "t1", command("pwd"));
        assert_eq!(
            effects.first(),
            Some(&Effect::StopCountdown(ApprovalKey {
                task_id: "t1".into(),
                target: command("ls"),
            }))
        );
        assert_eq!(
            scheduler.approval("t1").map(|s| s.key.target.clone()),
            Some(command("pwd"))
        );
    }

    #[test]
    fn halting_stops_countdowns_and_pending_retries() {
        let mut scheduler = scheduler(true);
        scheduler.on_ask("a1", "t1", command("ls"));
        scheduler.on_api_error("a1", "t2", "overloaded");
        let key = ApprovalKey {
            task_id: "t1".into(),
            target: command("ls"),
        };

        let effects = scheduler.halt_timers();
        assert_eq!(
            effects,
            vec![
                Effect::StopCountdown(key),
                Effect::CancelRetry {
                    task_id: "t2".into()
                },
                Effect::Notify(ClientEvent::RetryCancelled {
                    task_id: "t2".into()
                }),
            ]
        );
        assert!(sent_commands(&effects).is_empty());
        // The prompt stays for the user to answer
        assert_eq!(scheduler.approval("t1").map(|s| s.time_left), Some(3));
        assert!(!scheduler.retry_state("t2").expect("state").timer_pending);
        assert!(scheduler
            .halt_timers()
            .iter()
            .all(|effect| matches!(effect, Effect::StopCountdown(_))));
    }

    #[test]
    fn api_errors_schedule_backoff_until_exhausted() {
        let mut scheduler = scheduler(false);
        let mut delays = Vec::new();
        for _ in 0..4 {
            let effects = scheduler.on_api_error("a1", "t1", "rate limited");
            for effect in &effects {
                if let Effect::ScheduleRetry { delay, .. } = effect {
                    delays.push(delay.as_millis());
                }
            }
            scheduler.retry_fired("t1", Some(("hi".into(), Vec::new())));
        }
        assert_eq!(delays, vec![10_000, 30_000, 60_000]);
        assert_eq!(scheduler.retry_state("t1").map(|s| s.retry_count), Some(3));
        assert!(!scheduler.retry_state("t1").expect("state").is_retrying);
    }

    #[test]
    fn duplicate_error_while_pending_does_not_advance() {
        let mut scheduler = scheduler(false);
        scheduler.on_api_error("a1", "t1", "boom");
        scheduler.on_api_error("a1", "t1", "boom");
        assert_eq!(scheduler.retry_state("t1").map(|s| s.retry_count), Some(1));
    }

    #[test]
    fn retry_fired_resends_last_user_message() {
        let mut scheduler = scheduler(false);
        scheduler.on_api_error("a1", "t1", "boom");
        let effects = scheduler.retry_fired("t1", Some(("build it".into(), vec!["img".into()])));
        assert_eq!(
            effects,
            vec![Effect::Send(UiFrame::SendMessageToTask {
                agent_id: "a1".into(),
                data: TaskMessageData {
                    task_id: "t1".into(),
                    text: "build it".into(),
                    images: vec!["img".into()],
                },
            })]
        );
        // Fired twice: nothing pending anymore
        assert!(scheduler.retry_fired("t1", Some(("x".into(), Vec::new()))).is_empty());
    }

    #[test]
    fn success_resets_and_cancel_keeps_count() {
        let mut scheduler = scheduler(false);
        scheduler.on_api_error("a1", "t1", "boom");
        assert_eq!(
            scheduler.on_success("t1"),
            vec![Effect::CancelRetry {
                task_id: "t1".into()
            }]
        );
        assert!(scheduler.retry_state("t1").is_none());

        scheduler.on_api_error("a1", "t2", "boom");
        let effects = scheduler.cancel_retry("t2");
        assert!(effects.contains(&Effect::CancelRetry {
            task_id: "t2".into()
        }));
        let state = scheduler.retry_state("t2").expect("state kept");
        assert_eq!(state.retry_count, 1);
        assert!(!state.timer_pending);
    }

    #[test]
    fn retry_now_bypasses_timer() {
        let mut scheduler = scheduler(false);
        scheduler.on_api_error("a1", "t1", "boom");
        let effects = scheduler.retry_now("a1", "t1", Some(("again".into(), Vec::new())));
        assert!(matches!(effects[0], Effect::CancelRetry { .. }));
        assert!(matches!(effects[1], Effect::Send(UiFrame::SendMessageToTask { .. })));
        assert!(scheduler.retry_fired("t1", Some(("again".into(), Vec::new()))).is_empty());
    }

    #[test]
    fn disabled_retry_only_reports_the_error() {
        let mut scheduler = ApprovalAndRetryScheduler::new(
            AutoApprovalConfig::default(),
            AutoRetryConfig {
                enabled: false,
                ..AutoRetryConfig::default()
            },
        );
        let effects = scheduler.on_api_error("a1", "t1", "boom");
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::Notify(ClientEvent::ApiError { .. })));
    }

    #[test]
    fn rename_moves_pending_state() {
        let mut scheduler = scheduler(true);
        scheduler.on_ask("a1", "client-1", command("ls"));
        scheduler.on_api_error("a1", "client-1", "boom");
        let effects = scheduler.rename_task("client-1", "t1");
        assert!(effects.contains(&Effect::StartCountdown(ApprovalKey {
            task_id: "t1".into(),
            target: command("ls"),
        })));
        assert!(effects.contains(&Effect::ScheduleRetry {
            task_id: "t1".into(),
            delay: Duration::from_secs(10),
        }));
        assert!(scheduler.approval("client-1").is_none());
        assert!(scheduler.approval("t1").is_some());
        assert!(scheduler.retry_state("t1").is_some());
    }
}
