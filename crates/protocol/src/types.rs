//! Core types shared across the protocol

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form key/value metadata attached to a connection.
pub type Metadata = BTreeMap<String, Value>;

/// WebSocket close codes used by the relay.
pub mod close_code {
    /// Normal closure, never followed by a reconnect.
    pub const NORMAL: u16 = 1000;
    /// Peer is going away (page unload, process exit), never followed by a reconnect.
    pub const GOING_AWAY: u16 = 1001;
    /// Server evicted the connection after its heartbeat went stale.
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;

    /// Whether a close with this code should be followed by a reconnect attempt.
    pub fn is_abnormal(code: Option<u16>) -> bool {
        !matches!(code, Some(NORMAL) | Some(GOING_AWAY))
    }
}

/// Which side of the relay a connection speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Ui,
}

/// An agent as listed to UI connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Unix epoch millis of the current registration
    pub connected_at: u64,
    pub last_heartbeat_age_ms: u64,
}

/// Why the server reported an agent as gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    SocketClosed,
    Unregistered,
    HeartbeatTimeout,
}

/// Streamed agent event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentEventName {
    TaskCreated,
    TaskSpawned,
    TaskAborted,
    TaskCompleted,
    Message,
}

/// The `(eventName, taskId, message)` triple carried by `agentResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub event_name: AgentEventName,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<AgentMessage>,
    /// Set on `TaskSpawned`: the subtask created under `task_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_task_id: Option<String>,
    /// Set on `TaskCreated` when the task originated from a UI `createTask`
    /// that carried a locally assigned id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMessageType {
    Say,
    Ask,
}

/// One chat event emitted by an agent, possibly a streaming chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Agent-assigned timestamp; stable across partial updates of one reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    #[serde(rename = "type")]
    pub kind: AgentMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub say: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AgentMessage {
    /// The say/ask subtype, e.g. `text`, `tool`, `command`, `followup`.
    pub fn subtype(&self) -> &str {
        let raw = match self.kind {
            AgentMessageType::Say => self.say.as_deref(),
            AgentMessageType::Ask => self.ask.as_deref(),
        };
        raw.unwrap_or("")
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn is_ask(&self) -> bool {
        self.kind == AgentMessageType::Ask
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTaskIds {
    #[serde(default)]
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskData {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessageData {
    pub task_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

/// Result of a `remoteCommand`, reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One entry of a `getTaskHistory` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

/// Liveness of one agent as reported by `GET /status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRunState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLiveness {
    pub agent_id: String,
    pub state: AgentRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_age_ms: Option<u64>,
    pub healthy: bool,
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub healthy: bool,
    pub agents: Vec<AgentLiveness>,
}
