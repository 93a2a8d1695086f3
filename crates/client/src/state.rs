//! Client state transition
//!
//! Everything the connection actor knows lives here. Inbound frames and user
//! actions go in and effects come out, describing IO for the actor to run.
//! No method touches a socket or a timer.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use agentrelay_protocol::{
    new_id, AgentEvent, AgentEventName, AgentFrame, AgentInfo, CommandResponse, CreateTaskData,
    Frame, HistoryItem, Metadata, RemoteCommand, ServerFrame, TaskMessageData, UiFrame,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::dedup::{EventDeduplicator, Ingest};
use crate::events::ClientEvent;
use crate::messages::{ChatMessage, COMPLETION_RESULT};
use crate::scheduler::{
    ApprovalAndRetryScheduler, ApprovalKey, ApprovalState, ApprovalTarget, RetryState,
};
use crate::tasks::{CompletionSource, Task, TaskHierarchyTracker, LOCAL_TASK_PREFIX};

/// IO requested by a state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(UiFrame),
    Notify(ClientEvent),
    StartCountdown(ApprovalKey),
    StopCountdown(ApprovalKey),
    ScheduleRetry { task_id: String, delay: Duration },
    CancelRetry { task_id: String },
}

/// Point-in-time copy of client state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub agents: Vec<AgentInfo>,
    pub tasks: Vec<Task>,
    pub messages: HashMap<String, Vec<ChatMessage>>,
    pub approvals: Vec<ApprovalState>,
    pub retries: HashMap<String, RetryState>,
}

#[derive(Debug, Clone)]
struct PendingCommand {
    agent_id: String,
    task_id: Option<String>,
}

pub struct ClientState {
    client_id: String,
    agents: BTreeMap<String, AgentInfo>,
    tracker: TaskHierarchyTracker,
    dedup: EventDeduplicator,
    scheduler: ApprovalAndRetryScheduler,
    pending_commands: HashMap<String, PendingCommand>,
}

impl ClientState {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client_id: config
                .client_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(new_id),
            agents: BTreeMap::new(),
            tracker: TaskHierarchyTracker::new(),
            dedup: EventDeduplicator::new(&config.dedup),
            scheduler: ApprovalAndRetryScheduler::new(
                config.auto_approval.clone(),
                config.auto_retry.clone(),
            ),
            pending_commands: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tracker(&self) -> &TaskHierarchyTracker {
        &self.tracker
    }

    /// Remote commands still waiting for a response.
    pub fn pending_command_count(&self) -> usize {
        self.pending_commands.len()
    }

    pub fn scheduler(&self) -> &ApprovalAndRetryScheduler {
        &self.scheduler
    }

    /// A fresh socket opened: forget fingerprints, register, resync.
    pub fn on_connected(&mut self) -> Vec<Effect> {
        self.dedup.clear();
        vec![
            Effect::Send(UiFrame::Register {
                client_id: Some(self.client_id.clone()),
                data: Metadata::new(),
            }),
            Effect::Send(UiFrame::GetAgents),
        ]
    }

    pub fn apply_frame(&mut self, frame: Frame) -> Vec<Effect> {
        match frame {
            Frame::Server(frame) => self.apply_server_frame(frame),
            Frame::Agent(frame) => self.apply_agent_frame(frame),
            Frame::Ui(frame) => {
                debug!(
                    component = "client_state",
                    event = "client.frame.ignored",
                    kind = frame.kind(),
                    "Ignoring UI-role frame"
                );
                Vec::new()
            }
        }
    }

    fn apply_server_frame(&mut self, frame: ServerFrame) -> Vec<Effect> {
        match frame {
            ServerFrame::Registered { id, .. } => {
                debug!(
                    component = "client_state",
                    event = "client.registered",
                    connection_id = %id,
                    "Registered with relay"
                );
                Vec::new()
            }
            ServerFrame::Ping { .. } | ServerFrame::Pong { .. } => Vec::new(),
            ServerFrame::AgentList { agents } => {
                self.agents = agents
                    .into_iter()
                    .map(|agent| (agent.id.clone(), agent))
                    .collect();
                let mut effects = vec![self.agents_changed()];
                let ids: Vec<String> = self.agents.keys().cloned().collect();
                for agent_id in ids {
                    effects.extend(sync_agent(&agent_id));
                }
                effects
            }
            ServerFrame::AgentUpdate { agent } => {
                let agent_id = agent.id.clone();
                let is_new = self.agents.insert(agent_id.clone(), agent).is_none();
                let mut effects = vec![self.agents_changed()];
                if is_new {
                    effects.extend(sync_agent(&agent_id));
                }
                effects
            }
            ServerFrame::AgentDisconnected { agent_id, reason } => {
                self.agents.remove(&agent_id);
                // Responses from a departed agent never arrive
                self.pending_commands
                    .retain(|_, pending| pending.agent_id != agent_id);
                let mut effects = vec![
                    Effect::Notify(ClientEvent::AgentDisconnected {
                        agent_id: agent_id.clone(),
                        reason,
                    }),
                    self.agents_changed(),
                ];
                for task_id in self.tracker.deactivate_agent(&agent_id) {
                    effects.extend(self.task_updated(&task_id));
                }
                effects
            }
            ServerFrame::Error {
                code,
                message,
                agent_id,
            } => {
                warn!(
                    component = "client_state",
                    event = "client.server_error",
                    code = %code,
                    message = %message,
                    "Relay rejected a frame"
                );
                vec![Effect::Notify(ClientEvent::ServerError {
                    code,
                    message,
                    agent_id,
                })]
            }
        }
    }

    fn apply_agent_frame(&mut self, frame: AgentFrame) -> Vec<Effect> {
        let Some(agent_id) = frame.agent_id().map(str::to_string) else {
            debug!(
                component = "client_state",
                event = "client.frame.unstamped",
                "Agent frame without agentId"
            );
            return Vec::new();
        };
        match frame {
            AgentFrame::AgentUpdate { data, .. } => {
                let agent = self
                    .agents
                    .entry(agent_id.clone())
                    .or_insert_with(|| AgentInfo {
                        id: agent_id.clone(),
                        metadata: Metadata::new(),
                        connected_at: 0,
                        last_heartbeat_age_ms: 0,
                    });
                agent.metadata.extend(data);
                vec![self.agents_changed()]
            }
            AgentFrame::ActiveTaskIdsResponse { data, .. } => {
                let changed = self.tracker.apply_active_ids(&agent_id, &data.task_ids);
                changed
                    .iter()
                    .flat_map(|task_id| self.task_updated(task_id))
                    .collect()
            }
            AgentFrame::AgentResponse { event, .. } => self.apply_event(&agent_id, event),
            AgentFrame::RemoteCommandResponse { data, .. } => {
                self.apply_command_response(&agent_id, data)
            }
            AgentFrame::Register { .. }
            | AgentFrame::Unregister
            | AgentFrame::Ping { .. }
            | AgentFrame::Pong { .. } => Vec::new(),
        }
    }

    fn apply_event(&mut self, agent_id: &str, event: AgentEvent) -> Vec<Effect> {
        let task_id = event.task_id.as_str();
        match event.event_name {
            AgentEventName::TaskCreated => {
                let mut effects = Vec::new();
                if let Some(rename) = self.tracker.on_task_created(
                    agent_id,
                    task_id,
                    event.client_task_id.as_deref(),
                ) {
                    effects.extend(self.scheduler.rename_task(&rename.old_id, &rename.new_id));
                    effects.push(Effect::Notify(ClientEvent::TaskIdChanged {
                        old_id: rename.old_id,
                        new_id: rename.new_id,
                    }));
                }
                effects.extend(self.task_updated(task_id));
                effects
            }
            AgentEventName::TaskSpawned => {
                let Some(child) = event.child_task_id.as_deref() else {
                    warn!(
                        component = "client_state",
                        event = "client.spawn.missing_child",
                        task_id,
                        "TaskSpawned without childTaskId"
                    );
                    return Vec::new();
                };
                self.tracker.on_spawned(agent_id, task_id, child);
                let mut effects = self.scheduler.on_spawn(task_id);
                effects.push(Effect::Notify(ClientEvent::TaskSpawned {
                    agent_id: agent_id.to_string(),
                    parent_task_id: task_id.to_string(),
                    child_task_id: child.to_string(),
                }));
                effects.extend(self.task_updated(task_id));
                effects.extend(self.task_updated(child));
                effects
            }
            AgentEventName::TaskAborted | AgentEventName::TaskCompleted => {
                self.tracker.ensure(agent_id, task_id);
                self.tracker.mark_completed(task_id, CompletionSource::Event);
                let mut effects = self.scheduler.on_task_finished(task_id);
                effects.extend(self.task_updated(task_id));
                effects
            }
            AgentEventName::Message => {
                let Some(message) = event.message else {
                    return Vec::new();
                };
                self.tracker.note_live_event(agent_id, task_id);
                let outcome =
                    self.dedup
                        .ingest(task_id, &message, self.tracker.messages_mut(task_id));
                if outcome == Ingest::Duplicate {
                    debug!(
                        component = "client_state",
                        event = "client.message.duplicate",
                        task_id,
                        "Dropped duplicate event"
                    );
                    return Vec::new();
                }

                let Some(stored) = self.tracker.messages(task_id).last().cloned() else {
                    return Vec::new();
                };
                let mut effects = vec![Effect::Notify(ClientEvent::MessageUpdated {
                    task_id: task_id.to_string(),
                    message: stored.clone(),
                    replaced: outcome == Ingest::Replaced,
                })];
                if message.partial {
                    return effects;
                }

                if stored.is_api_error() {
                    effects.extend(self.scheduler.on_api_error(
                        agent_id,
                        task_id,
                        message.text(),
                    ));
                    return effects;
                }
                effects.extend(self.scheduler.on_success(task_id));

                if message.subtype() == COMPLETION_RESULT {
                    self.tracker.mark_completed(task_id, CompletionSource::Event);
                    effects.extend(self.task_updated(task_id));
                }
                if let Some(target) = stored
                    .content
                    .structured()
                    .and_then(ApprovalTarget::of)
                {
                    // A task that has spawned a subtask waits on it; no auto-approval
                    if self.tracker.has_spawned(task_id) {
                        debug!(
                            component = "client_state",
                            event = "client.approval.skipped_after_spawn",
                            task_id,
                            "Ask after spawn left for manual approval"
                        );
                    } else {
                        effects.extend(self.scheduler.on_ask(agent_id, task_id, target));
                    }
                }
                effects
            }
        }
    }

    fn apply_command_response(&mut self, agent_id: &str, response: CommandResponse) -> Vec<Effect> {
        let pending = match response.request_id.as_deref() {
            Some(id) if self.pending_commands.get(id).is_some_and(|p| p.agent_id == agent_id) => {
                self.pending_commands.remove(id)
            }
            _ => None,
        };
        let mut effects = Vec::new();

        if response.success {
            match response.command.as_str() {
                "getTaskHistory" => {
                    let items = history_items(response.result.as_ref());
                    for task_id in self.tracker.apply_history(agent_id, &items) {
                        effects.extend(self.task_updated(&task_id));
                    }
                }
                "getTaskDetails" => {
                    let task_id = pending.and_then(|p| p.task_id).or_else(|| {
                        response
                            .result
                            .as_ref()
                            .and_then(|result| result.get("id"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    });
                    if let (Some(task_id), Some(result)) = (task_id, response.result.clone()) {
                        self.tracker.ensure(agent_id, &task_id);
                        self.tracker.set_task_data(&task_id, result);
                        effects.extend(self.task_updated(&task_id));
                    }
                }
                _ => {}
            }
        } else {
            warn!(
                component = "client_state",
                event = "client.command.failed",
                agent_id,
                command = %response.command,
                error = response.error.as_deref().unwrap_or(""),
                "Remote command failed"
            );
        }

        effects.push(Effect::Notify(ClientEvent::CommandResponse {
            agent_id: agent_id.to_string(),
            response,
        }));
        effects
    }

    // -- User actions ------------------------------------------------------

    /// Start a task under a local id; returns the id and the effects.
    pub fn create_task(
        &mut self,
        agent_id: &str,
        text: &str,
        images: Vec<String>,
    ) -> (String, Vec<Effect>) {
        let local_id = format!("{}{}", LOCAL_TASK_PREFIX, new_id());
        self.tracker.create_local(agent_id, &local_id);
        self.tracker
            .messages_mut(&local_id)
            .push(ChatMessage::user(text, images.clone()));

        let mut effects = vec![Effect::Send(UiFrame::CreateTask {
            agent_id: agent_id.to_string(),
            data: CreateTaskData {
                text: text.to_string(),
                images,
                client_task_id: Some(local_id.clone()),
            },
        })];
        effects.extend(self.task_updated(&local_id));
        (local_id, effects)
    }

    pub fn send_to_task(
        &mut self,
        agent_id: &str,
        task_id: &str,
        text: &str,
        images: Vec<String>,
    ) -> Vec<Effect> {
        self.tracker.ensure(agent_id, task_id);
        let message = ChatMessage::user(text, images.clone());
        self.tracker.messages_mut(task_id).push(message.clone());
        vec![
            Effect::Send(UiFrame::SendMessageToTask {
                agent_id: agent_id.to_string(),
                data: TaskMessageData {
                    task_id: task_id.to_string(),
                    text: text.to_string(),
                    images,
                },
            }),
            Effect::Notify(ClientEvent::MessageUpdated {
                task_id: task_id.to_string(),
                message,
                replaced: false,
            }),
        ]
    }

    /// Returns the request id the response will echo.
    pub fn remote_command(&mut self, agent_id: &str, command: RemoteCommand) -> (String, Vec<Effect>) {
        let request_id = new_id();
        self.pending_commands.insert(
            request_id.clone(),
            PendingCommand {
                agent_id: agent_id.to_string(),
                task_id: command.task_id().map(str::to_string),
            },
        );
        let effects = vec![Effect::Send(UiFrame::RemoteCommand {
            agent_id: agent_id.to_string(),
            request_id: Some(request_id.clone()),
            command,
        })];
        (request_id, effects)
    }

    pub fn request_active_task_ids(&self, agent_id: &str) -> Vec<Effect> {
        vec![Effect::Send(UiFrame::GetActiveTaskIds {
            agent_id: agent_id.to_string(),
        })]
    }

    pub fn approve(&mut self, task_id: &str) -> Vec<Effect> {
        self.scheduler.approve(task_id)
    }

    pub fn deny(&mut self, task_id: &str) -> Vec<Effect> {
        self.scheduler.deny(task_id)
    }

    pub fn countdown_tick(&mut self, key: &ApprovalKey) -> Vec<Effect> {
        self.scheduler.countdown_tick(key)
    }

    pub fn retry_fired(&mut self, task_id: &str) -> Vec<Effect> {
        let last = self.tracker.last_user_message(task_id);
        self.scheduler.retry_fired(task_id, last)
    }

    pub fn retry_now(&mut self, task_id: &str) -> Vec<Effect> {
        let Some(agent_id) = self.agent_of(task_id) else {
            warn!(
                component = "client_state",
                event = "client.retry.unknown_task",
                task_id,
                "Cannot retry unknown task"
            );
            return Vec::new();
        };
        let last = self.tracker.last_user_message(task_id);
        self.scheduler.retry_now(&agent_id, task_id, last)
    }

    pub fn cancel_retry(&mut self, task_id: &str) -> Vec<Effect> {
        self.scheduler.cancel_retry(task_id)
    }

    /// The user closed the connection; nothing may fire on its own until
    /// they reconnect.
    pub fn on_disconnected(&mut self) -> Vec<Effect> {
        self.scheduler.halt_timers()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let mut tasks: Vec<Task> = self.tracker.tasks().cloned().collect();
        tasks.sort_by(|a, b| a.agent_id.cmp(&b.agent_id).then(a.id.cmp(&b.id)));
        ClientSnapshot {
            client_id: self.client_id.clone(),
            agents: self.agents.values().cloned().collect(),
            tasks,
            messages: self.tracker.all_messages().clone(),
            approvals: self.scheduler.approvals().cloned().collect(),
            retries: self.scheduler.retries().clone(),
        }
    }

    fn agent_of(&self, task_id: &str) -> Option<String> {
        self.tracker.get(task_id).map(|task| task.agent_id.clone())
    }

    fn agents_changed(&self) -> Effect {
        Effect::Notify(ClientEvent::AgentsChanged {
            agents: self.agents.values().cloned().collect(),
        })
    }

    fn task_updated(&self, task_id: &str) -> Option<Effect> {
        self.tracker
            .get(task_id)
            .map(|task| Effect::Notify(ClientEvent::TaskUpdated { task: task.clone() }))
    }
}

/// Initial sync for a newly seen agent: liveness first, then history.
fn sync_agent(agent_id: &str) -> Vec<Effect> {
    vec![
        Effect::Send(UiFrame::GetActiveTaskIds {
            agent_id: agent_id.to_string(),
        }),
        Effect::Send(UiFrame::RemoteCommand {
            agent_id: agent_id.to_string(),
            request_id: Some(new_id()),
            command: RemoteCommand::GetTaskHistory { limit: None },
        }),
    ]
}

/// History results come as a bare array or wrapped in `history`/`tasks`.
fn history_items(result: Option<&Value>) -> Vec<HistoryItem> {
    let Some(result) = result else {
        return Vec::new();
    };
    let list = result
        .as_array()
        .or_else(|| result.get("history").and_then(Value::as_array))
        .or_else(|| result.get("tasks").and_then(Value::as_array));
    list.map(|items| {
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    })
    .unwrap_or_default()
}
