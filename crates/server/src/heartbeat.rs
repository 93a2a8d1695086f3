//! Heartbeat supervision
//!
//! One task on a fixed interval: end grace periods, ping agents, evict
//! connections whose heartbeat went stale. Every pass works on a registry
//! snapshot and never holds a map guard while sending.

use std::sync::Arc;
use std::time::Duration;

use agentrelay_protocol::{close_code, DisconnectReason, Role, ServerFrame};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::Outbound;
use crate::router::encode;
use crate::state::{unix_millis, AppState};

/// A connection removed for a stale heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub id: String,
    pub role: Role,
    pub heartbeat_age: Duration,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub grace_ended: usize,
    pub pinged: usize,
    pub evicted: Vec<Eviction>,
}

pub struct HeartbeatSupervisor {
    state: Arc<AppState>,
}

impl HeartbeatSupervisor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let period = self.state.config.heartbeat.ping_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            info!(
                component = "heartbeat",
                event = "heartbeat.supervisor.started",
                ping_interval_ms = period.as_millis() as u64,
                "Heartbeat supervisor started"
            );
            loop {
                ticker.tick().await;
                self.tick(Instant::now());
            }
        })
    }

    pub fn tick(&self, now: Instant) -> TickReport {
        let grace_ended = self
            .state
            .registry
            .end_grace_periods(now, self.state.config.heartbeat.grace_period);
        let pinged = self.send_pings(now);
        let evicted = self.check_health(now);
        if grace_ended > 0 || !evicted.is_empty() {
            debug!(
                component = "heartbeat",
                event = "heartbeat.tick",
                grace_ended,
                pinged,
                evicted = evicted.len(),
                "Heartbeat tick"
            );
        }
        TickReport {
            grace_ended,
            pinged,
            evicted,
        }
    }

    /// Ping every agent that has left its grace period.
    fn send_pings(&self, now: Instant) -> usize {
        let Some(ping) = encode(ServerFrame::Ping {
            timestamp: unix_millis(),
        }) else {
            return 0;
        };

        let mut pinged = 0;
        for connection in self.state.registry.list_by_role(Role::Agent) {
            if connection.grace_period {
                continue;
            }
            match connection.try_send(Outbound::Text(ping.clone())) {
                Ok(()) => {
                    self.state
                        .registry
                        .mark_ping_sent(&connection.id, connection.serial, now);
                    pinged += 1;
                }
                Err(err) => {
                    debug!(
                        component = "heartbeat",
                        event = "heartbeat.ping.failed",
                        connection_id = %connection.id,
                        error = %err,
                        "Ping not queued"
                    );
                }
            }
        }
        pinged
    }

    fn check_health(&self, now: Instant) -> Vec<Eviction> {
        let heartbeat = &self.state.config.heartbeat;
        let mut evicted = Vec::new();

        for connection in self.state.registry.snapshot() {
            let age = connection.heartbeat_age(now);
            if age <= heartbeat.effective_timeout(connection.grace_period) {
                continue;
            }
            // Re-registered since the snapshot: the new socket is not stale
            let Some(removed) = self
                .state
                .registry
                .remove_if_current(&connection.id, connection.serial)
            else {
                continue;
            };

            warn!(
                component = "heartbeat",
                event = "heartbeat.connection.evicted",
                connection_id = %removed.id,
                role = ?removed.role,
                heartbeat_age_ms = age.as_millis() as u64,
                "Heartbeat timeout, closing connection"
            );
            let _ = removed.try_send(Outbound::Close {
                code: close_code::HEARTBEAT_TIMEOUT,
                reason: "heartbeat timeout".into(),
            });

            if removed.role == Role::Agent {
                if let Some(notice) = encode(ServerFrame::AgentDisconnected {
                    agent_id: removed.id.clone(),
                    reason: DisconnectReason::HeartbeatTimeout,
                }) {
                    self.state.registry.broadcast(Role::Ui, &notice);
                }
            }

            evicted.push(Eviction {
                id: removed.id,
                role: removed.role,
                heartbeat_age: age,
            });
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConfig, ServerConfig};
    use agentrelay_protocol::{Frame, Metadata};
    use tokio::sync::mpsc;

    fn state_with(heartbeat: HeartbeatConfig) -> Arc<AppState> {
        Arc::new(AppState::new(ServerConfig {
            heartbeat,
            auth_token: None,
        }))
    }

    fn register(
        state: &AppState,
        role: Role,
        id: &str,
        serial: u64,
    ) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        state
            .registry
            .register(role, Some(id.into()), Metadata::new(), serial, tx)
            .expect("register");
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn stale_agent_is_evicted_after_effective_timeout() {
        let state = state_with(HeartbeatConfig::default());
        let supervisor = HeartbeatSupervisor::new(state.clone());
        let mut stale = register(&state, Role::Agent, "stale", 1);
        let mut ui = register(&state, Role::Ui, "ui", 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        let _fresh = register(&state, Role::Agent, "fresh", 3);

        // stale: 51s since last heartbeat. fresh: 40s.
        tokio::time::advance(Duration::from_secs(40)).await;
        state.registry.touch_heartbeat("ui", 2);
        let report = supervisor.tick(Instant::now());

        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].id, "stale");
        assert!(state.registry.get("stale").is_none());
        assert!(state.registry.get("fresh").is_some());

        let closes: Vec<_> = drain(&mut stale)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Close { code, .. } => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(closes, vec![close_code::HEARTBEAT_TIMEOUT]);

        let notices: Vec<_> = drain(&mut ui)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Text(text) => Frame::parse(&text).ok(),
                _ => None,
            })
            .collect();
        assert_eq!(
            notices,
            vec![Frame::Server(ServerFrame::AgentDisconnected {
                agent_id: "stale".into(),
                reason: DisconnectReason::HeartbeatTimeout,
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_floors_the_timeout() {
        let state = state_with(HeartbeatConfig {
            grace_period: Duration::from_secs(120),
            ..HeartbeatConfig::default()
        });
        let supervisor = HeartbeatSupervisor::new(state.clone());
        let _rx = register(&state, Role::Agent, "slow-start", 1);

        tokio::time::advance(Duration::from_secs(55)).await;
        assert!(supervisor.tick(Instant::now()).evicted.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let report = supervisor.tick(Instant::now());
        assert_eq!(report.evicted.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_only_agents_out_of_grace() {
        let state = state_with(HeartbeatConfig::default());
        let supervisor = HeartbeatSupervisor::new(state.clone());
        let mut agent = register(&state, Role::Agent, "a1", 1);
        let mut ui = register(&state, Role::Ui, "ui", 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(supervisor.tick(Instant::now()).pinged, 0);
        assert!(drain(&mut agent).is_empty());

        tokio::time::advance(Duration::from_secs(21)).await;
        state.registry.touch_heartbeat("a1", 1);
        state.registry.touch_heartbeat("ui", 2);
        let report = supervisor.tick(Instant::now());
        assert_eq!(report.grace_ended, 2);
        assert_eq!(report.pinged, 1);
        assert!(state.registry.get("a1").and_then(|c| c.last_ping_sent).is_some());

        match drain(&mut agent).as_slice() {
            [Outbound::Text(text)] => assert!(matches!(
                Frame::parse(text),
                Ok(Frame::Server(ServerFrame::Ping { .. }))
            )),
            other => panic!("expected one ping, got {:?}", other),
        }
        assert!(drain(&mut ui).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_connection_is_checked_once() {
        let state = state_with(HeartbeatConfig::default());
        let supervisor = HeartbeatSupervisor::new(state.clone());
        let mut first = register(&state, Role::Agent, "a1", 1);

        tokio::time::advance(Duration::from_secs(45)).await;
        let mut second = register(&state, Role::Agent, "a1", 2);
        tokio::time::advance(Duration::from_secs(10)).await;

        // The orphaned socket's age no longer counts against the id
        let report = supervisor.tick(Instant::now());
        assert!(report.evicted.is_empty());
        assert!(state.registry.is_current("a1", 2));
        assert!(drain(&mut first).is_empty());
        assert!(drain(&mut second)
            .iter()
            .all(|frame| !matches!(frame, Outbound::Close { .. })));
    }
}
