//! UI → Server messages

use serde::{Deserialize, Serialize};

use crate::command::RemoteCommand;
use crate::types::{CreateTaskData, Metadata, TaskMessageData};

/// Frames sent by UI connections.
///
/// Agent-directed variants carry an `agent_id`; the server forwards their
/// original text to that agent untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UiFrame {
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default)]
        data: Metadata,
    },
    Unregister,
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    GetAgents,

    // Forwarded to the target agent
    GetActiveTaskIds {
        #[serde(default)]
        agent_id: String,
    },
    CreateTask {
        #[serde(default)]
        agent_id: String,
        data: CreateTaskData,
    },
    SendMessageToTask {
        #[serde(default)]
        agent_id: String,
        data: TaskMessageData,
    },
    RemoteCommand {
        #[serde(default)]
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        command: RemoteCommand,
    },
}

impl UiFrame {
    /// Target agent of a forwarded frame; `None` for frames the server answers itself.
    pub fn target_agent(&self) -> Option<&str> {
        match self {
            UiFrame::GetActiveTaskIds { agent_id }
            | UiFrame::CreateTask { agent_id, .. }
            | UiFrame::SendMessageToTask { agent_id, .. }
            | UiFrame::RemoteCommand { agent_id, .. } => Some(agent_id.as_str()),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UiFrame::Register { .. } => "register",
            UiFrame::Unregister => "unregister",
            UiFrame::Ping { .. } => "ping",
            UiFrame::GetAgents => "getAgents",
            UiFrame::GetActiveTaskIds { .. } => "getActiveTaskIds",
            UiFrame::CreateTask { .. } => "createTask",
            UiFrame::SendMessageToTask { .. } => "sendMessageToTask",
            UiFrame::RemoteCommand { .. } => "remoteCommand",
        }
    }
}
