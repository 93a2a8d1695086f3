//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{AgentInfo, DisconnectReason, Role};

/// Frames originated by the server itself (as opposed to relayed ones).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Registered {
        id: String,
        connection_role: Role,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    AgentList {
        agents: Vec<AgentInfo>,
    },
    AgentUpdate {
        agent: AgentInfo,
    },
    AgentDisconnected {
        agent_id: String,
        reason: DisconnectReason,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
}
