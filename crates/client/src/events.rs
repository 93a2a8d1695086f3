//! Notifications published to subscribers

use std::time::Duration;

use agentrelay_protocol::{AgentInfo, CommandResponse, DisconnectReason};

use crate::messages::ChatMessage;
use crate::scheduler::{ApprovalKey, ApprovalState};
use crate::tasks::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Published on the status `watch` channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    /// Reconnect attempts since the last successful open
    pub attempts: u32,
    /// Reconnect attempts ran out; only `reconnect()` clears this.
    pub gave_up: bool,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            gave_up: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    AgentsChanged {
        agents: Vec<AgentInfo>,
    },
    AgentDisconnected {
        agent_id: String,
        reason: DisconnectReason,
    },
    ServerError {
        code: String,
        message: String,
        agent_id: Option<String>,
    },
    TaskUpdated {
        task: Task,
    },
    TaskSpawned {
        agent_id: String,
        parent_task_id: String,
        child_task_id: String,
    },
    TaskIdChanged {
        old_id: String,
        new_id: String,
    },
    MessageUpdated {
        task_id: String,
        message: ChatMessage,
        /// The tail message was replaced rather than a new one appended.
        replaced: bool,
    },
    ApprovalRequested {
        approval: ApprovalState,
    },
    ApprovalCountdown {
        key: ApprovalKey,
        time_left: u32,
    },
    ApprovalResolved {
        key: ApprovalKey,
        approved: bool,
        automatic: bool,
    },
    ApiError {
        task_id: String,
        message: String,
    },
    RetryScheduled {
        task_id: String,
        attempt: u32,
        delay: Duration,
    },
    RetryCancelled {
        task_id: String,
    },
    RetryExhausted {
        task_id: String,
    },
    CommandResponse {
        agent_id: String,
        response: CommandResponse,
    },
    ReconnectExhausted {
        attempts: u32,
    },
}
