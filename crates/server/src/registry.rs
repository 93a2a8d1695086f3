//! Connection registry
//!
//! Tracks every registered socket keyed by its id. Agents pick their own id
//! so it survives reconnects; registering an id that is already live under
//! the same role replaces the old entry (last writer wins) and orphans the
//! previous socket. An id held by the other role is refused. Each entry
//! remembers the serial of the socket that owns it, so a late close or
//! heartbeat from an orphaned socket never touches its replacement.

use agentrelay_protocol::{
    new_id, AgentInfo, AgentLiveness, AgentRunState, Metadata, Role, StatusReport,
};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::error::{DeliveryError, RegisterError};
use crate::state::unix_millis;

/// Frames queued for a socket's writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

/// One registered socket
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub role: Role,
    pub serial: u64,
    pub connected_at: Instant,
    pub connected_at_ms: u64,
    pub last_heartbeat: Instant,
    pub last_ping_sent: Option<Instant>,
    pub grace_period: bool,
    pub metadata: Metadata,
    sender: mpsc::Sender<Outbound>,
}

impl Connection {
    pub fn heartbeat_age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Queue a frame on this socket without waiting.
    pub fn try_send(&self, frame: Outbound) -> Result<(), DeliveryError> {
        self.sender.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::QueueFull(self.id.clone()),
            TrySendError::Closed(_) => DeliveryError::Closed(self.id.clone()),
        })
    }

    pub fn agent_info(&self, now: Instant) -> AgentInfo {
        AgentInfo {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            connected_at: self.connected_at_ms,
            last_heartbeat_age_ms: self.heartbeat_age(now).as_millis() as u64,
        }
    }
}

/// Result of [`ConnectionRegistry::register`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    /// Serial of the socket that previously owned this id, if any.
    pub replaced: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Departed {
    last_heartbeat: Instant,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
    /// Agents that disconnected during this process's lifetime.
    departed: DashMap<String, Departed>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        role: Role,
        id: Option<String>,
        metadata: Metadata,
        serial: u64,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<Registration, RegisterError> {
        let id = id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(new_id);
        let now = Instant::now();
        let connection = Connection {
            id: id.clone(),
            role,
            serial,
            connected_at: now,
            connected_at_ms: unix_millis(),
            last_heartbeat: now,
            last_ping_sent: None,
            grace_period: true,
            metadata,
            sender,
        };

        let replaced = match self.connections.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let held_by = occupied.get().role;
                if held_by != role {
                    warn!(
                        component = "registry",
                        event = "registry.connection.id_conflict",
                        connection_id = %id,
                        role = ?role,
                        held_by = ?held_by,
                        serial,
                        "Registration refused, id held by the other role"
                    );
                    return Err(RegisterError::IdInUse { id, held_by });
                }
                let previous = occupied.insert(connection).serial;
                (previous != serial).then_some(previous)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(connection);
                None
            }
        };
        if role == Role::Agent {
            self.departed.remove(&id);
        }

        if let Some(previous) = replaced {
            warn!(
                component = "registry",
                event = "registry.connection.replaced",
                connection_id = %id,
                role = ?role,
                previous_serial = previous,
                serial,
                "Registration replaced a live connection with the same id"
            );
        } else {
            info!(
                component = "registry",
                event = "registry.connection.registered",
                connection_id = %id,
                role = ?role,
                serial,
                "Connection registered"
            );
        }

        Ok(Registration { id, replaced })
    }

    /// Refresh the heartbeat of `id` while it is owned by the socket `serial`.
    pub fn touch_heartbeat(&self, id: &str, serial: u64) -> bool {
        match self.connections.get_mut(id) {
            Some(mut entry) if entry.serial == serial => {
                entry.last_heartbeat = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<Connection> {
        let removed = self.connections.remove(id).map(|(_, connection)| connection);
        if let Some(connection) = &removed {
            self.record_departure(connection);
        }
        removed
    }

    /// Remove `id` only while it is still owned by the socket `serial`.
    pub fn remove_if_current(&self, id: &str, serial: u64) -> Option<Connection> {
        let removed = self
            .connections
            .remove_if(id, |_, connection| connection.serial == serial)
            .map(|(_, connection)| connection);
        if let Some(connection) = &removed {
            self.record_departure(connection);
        }
        removed
    }

    fn record_departure(&self, connection: &Connection) {
        if connection.role == Role::Agent {
            self.departed.insert(
                connection.id.clone(),
                Departed {
                    last_heartbeat: connection.last_heartbeat,
                },
            );
        }
        debug!(
            component = "registry",
            event = "registry.connection.removed",
            connection_id = %connection.id,
            role = ?connection.role,
            serial = connection.serial,
            "Connection removed"
        );
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        self.connections.get(id).map(|entry| entry.clone())
    }

    pub fn is_current(&self, id: &str, serial: u64) -> bool {
        self.connections
            .get(id)
            .is_some_and(|entry| entry.serial == serial)
    }

    /// Snapshot of all live connections with `role`.
    pub fn list_by_role(&self, role: Role) -> Vec<Connection> {
        let mut connections: Vec<Connection> = self
            .connections
            .iter()
            .filter(|entry| entry.role == role)
            .map(|entry| entry.clone())
            .collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));
        connections
    }

    /// Snapshot of every live connection, for health sweeps.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn agent_infos(&self) -> Vec<AgentInfo> {
        let now = Instant::now();
        self.list_by_role(Role::Agent)
            .iter()
            .map(|connection| connection.agent_info(now))
            .collect()
    }

    pub fn update_metadata(&self, id: &str, metadata: Metadata) -> Option<Connection> {
        let mut entry = self.connections.get_mut(id)?;
        entry.metadata.extend(metadata);
        Some(entry.clone())
    }

    pub fn mark_ping_sent(&self, id: &str, serial: u64, at: Instant) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            if entry.serial == serial {
                entry.last_ping_sent = Some(at);
            }
        }
    }

    /// Clear the grace flag on connections registered at least `grace` ago.
    /// Returns how many entries left their grace period.
    pub fn end_grace_periods(&self, now: Instant, grace: std::time::Duration) -> usize {
        let mut ended = 0;
        for mut entry in self.connections.iter_mut() {
            if entry.grace_period && now.saturating_duration_since(entry.connected_at) >= grace {
                entry.grace_period = false;
                ended += 1;
            }
        }
        ended
    }

    /// Queue a frame for one connection without waiting.
    pub fn send_to(&self, id: &str, frame: Outbound) -> Result<(), DeliveryError> {
        let (serial, sender) = self
            .connections
            .get(id)
            .map(|entry| (entry.serial, entry.sender.clone()))
            .ok_or_else(|| DeliveryError::NotConnected(id.to_string()))?;
        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::QueueFull(id.to_string())),
            Err(TrySendError::Closed(_)) => {
                self.remove_if_current(id, serial);
                Err(DeliveryError::Closed(id.to_string()))
            }
        }
    }

    /// Send `text` to every live connection with `role`. Closed sockets are
    /// pruned; a full queue loses only this frame. Returns the delivery count.
    pub fn broadcast(&self, role: Role, text: &str) -> usize {
        let targets: Vec<(String, u64, mpsc::Sender<Outbound>)> = self
            .connections
            .iter()
            .filter(|entry| entry.role == role)
            .map(|entry| (entry.id.clone(), entry.serial, entry.sender.clone()))
            .collect();

        let mut delivered = 0;
        for (id, serial, sender) in targets {
            match sender.try_send(Outbound::Text(text.to_string())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        component = "registry",
                        event = "registry.broadcast.queue_full",
                        connection_id = %id,
                        "Outbound queue full, frame dropped for this connection"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(
                        component = "registry",
                        event = "registry.broadcast.pruned",
                        connection_id = %id,
                        "Connection closed, pruning from registry"
                    );
                    self.remove_if_current(&id, serial);
                }
            }
        }
        delivered
    }

    pub fn status_report(&self, now: Instant, heartbeat: &HeartbeatConfig) -> StatusReport {
        let mut agents: Vec<AgentLiveness> = self
            .list_by_role(Role::Agent)
            .iter()
            .map(|connection| {
                let age = connection.heartbeat_age(now);
                AgentLiveness {
                    agent_id: connection.id.clone(),
                    state: AgentRunState::Running,
                    last_heartbeat_age_ms: Some(age.as_millis() as u64),
                    healthy: age <= heartbeat.effective_timeout(connection.grace_period),
                }
            })
            .collect();
        agents.extend(self.departed.iter().map(|entry| AgentLiveness {
            agent_id: entry.key().clone(),
            state: AgentRunState::Stopped,
            last_heartbeat_age_ms: Some(
                now.saturating_duration_since(entry.value().last_heartbeat)
                    .as_millis() as u64,
            ),
            healthy: false,
        }));
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let healthy = agents
            .iter()
            .filter(|agent| agent.state == AgentRunState::Running)
            .all(|agent| agent.healthy);
        StatusReport { healthy, agents }
    }
}
