//! Agent → Server messages

use serde::{Deserialize, Serialize};

use crate::types::{ActiveTaskIds, AgentEvent, CommandResponse, Metadata};

/// Frames sent by agent connections.
///
/// The last four variants are forwarded to every UI connection after the
/// server stamps `agent_id` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AgentFrame {
    Register {
        /// Stable id chosen by the agent so it survives reconnects.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default)]
        data: Metadata,
    },
    Unregister,
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    // Forwarded to UI connections
    AgentUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        #[serde(default)]
        data: Metadata,
    },
    ActiveTaskIdsResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        #[serde(default)]
        data: ActiveTaskIds,
    },
    AgentResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        event: AgentEvent,
    },
    RemoteCommandResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        data: CommandResponse,
    },
}

impl AgentFrame {
    /// Whether the server relays this frame to UI connections.
    pub fn is_forwarded(&self) -> bool {
        matches!(
            self,
            AgentFrame::AgentUpdate { .. }
                | AgentFrame::ActiveTaskIdsResponse { .. }
                | AgentFrame::AgentResponse { .. }
                | AgentFrame::RemoteCommandResponse { .. }
        )
    }

    /// Overwrite the routing tags on a forwarded frame. Returns `false` for
    /// frames that are never forwarded.
    pub fn stamp(&mut self, id: &str, ts: u64) -> bool {
        match self {
            AgentFrame::AgentUpdate {
                agent_id,
                timestamp,
                ..
            }
            | AgentFrame::ActiveTaskIdsResponse {
                agent_id,
                timestamp,
                ..
            }
            | AgentFrame::AgentResponse {
                agent_id,
                timestamp,
                ..
            }
            | AgentFrame::RemoteCommandResponse {
                agent_id,
                timestamp,
                ..
            } => {
                *agent_id = Some(id.to_string());
                *timestamp = Some(ts);
                true
            }
            _ => false,
        }
    }

    /// `agentId` as carried on the wire (set by the server on forwarded frames).
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            AgentFrame::Register { agent_id, .. }
            | AgentFrame::AgentUpdate { agent_id, .. }
            | AgentFrame::ActiveTaskIdsResponse { agent_id, .. }
            | AgentFrame::AgentResponse { agent_id, .. }
            | AgentFrame::RemoteCommandResponse { agent_id, .. } => agent_id.as_deref(),
            _ => None,
        }
    }
}
