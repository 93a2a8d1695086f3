//! Protocol and delivery errors.
//!
//! None of these are fatal to a connection: the offending frame is dropped,
//! the error logged, and for some kinds reported back to the sender.

use agentrelay_protocol::Role;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("server-role frames are not accepted from peers")]
    ServerRoleFrame,

    #[error("{kind} requires a target agentId")]
    MissingAgentId { kind: &'static str },

    #[error("no live agent registered as {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("connection registered as {registered:?} sent a {sent:?} frame")]
    RoleMismatch { registered: Role, sent: Role },

    #[error("agent must register before sending events")]
    NotRegistered,

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl RouteError {
    /// Stable code sent in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::Malformed(_) => "parse_error",
            RouteError::ServerRoleFrame => "invalid_role",
            RouteError::MissingAgentId { .. } => "missing_agent_id",
            RouteError::UnknownAgent { .. } => "unknown_agent",
            RouteError::RoleMismatch { .. } => "role_mismatch",
            RouteError::NotRegistered => "not_registered",
            RouteError::Register(_) => "id_in_use",
            RouteError::Delivery(_) => "delivery_failed",
        }
    }

    /// Whether the sender gets an `error` frame back. Unknown targets are
    /// only logged.
    pub fn reply_to_sender(&self) -> bool {
        !matches!(
            self,
            RouteError::UnknownAgent { .. } | RouteError::Delivery(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// Agent and UI ids share one namespace; a live id is never taken over
    /// by the other role.
    #[error("id {id} is held by a live {held_by:?} connection")]
    IdInUse { id: String, held_by: Role },
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no live connection for {0}")]
    NotConnected(String),

    #[error("outbound queue full for {0}")]
    QueueFull(String),

    #[error("connection {0} is closed")]
    Closed(String),
}
