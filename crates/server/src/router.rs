//! Message routing
//!
//! Classifies every inbound text frame by role. Agent events are stamped and
//! fanned out to UI connections; agent-directed UI frames are forwarded to the
//! target agent as the exact text that arrived.

use agentrelay_protocol::{
    AgentFrame, DisconnectReason, Frame, Metadata, Role, ServerFrame, UiFrame,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::RouteError;
use crate::registry::Outbound;
use crate::state::{unix_millis, AppState};

/// Per-socket routing state owned by the socket's read loop
pub struct ConnectionContext {
    pub serial: u64,
    sender: mpsc::Sender<Outbound>,
    registration: Option<(Role, String)>,
}

impl ConnectionContext {
    pub fn new(serial: u64, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            serial,
            sender,
            registration: None,
        }
    }

    pub fn registration(&self) -> Option<(Role, &str)> {
        self.registration
            .as_ref()
            .map(|(role, id)| (*role, id.as_str()))
    }

    fn registered_as(&self, role: Role) -> Option<&str> {
        match &self.registration {
            Some((registered, id)) if *registered == role => Some(id.as_str()),
            _ => None,
        }
    }

    fn check_role(&self, sent: Role) -> Result<(), RouteError> {
        match &self.registration {
            Some((registered, _)) if *registered != sent => Err(RouteError::RoleMismatch {
                registered: *registered,
                sent,
            }),
            _ => Ok(()),
        }
    }

    fn reply(&self, frame: ServerFrame) {
        if let Some(text) = encode(frame) {
            if self.sender.try_send(Outbound::Text(text)).is_err() {
                debug!(
                    component = "router",
                    event = "router.reply.dropped",
                    serial = self.serial,
                    "Reply not queued"
                );
            }
        }
    }
}

pub(crate) fn encode(frame: impl Into<Frame>) -> Option<String> {
    match frame.into().to_json() {
        Ok(text) => Some(text),
        Err(err) => {
            error!(
                component = "router",
                event = "router.encode.failed",
                error = %err,
                "Failed to serialize frame"
            );
            None
        }
    }
}

/// Route one inbound frame, logging and answering protocol errors.
pub fn handle_text(state: &AppState, ctx: &mut ConnectionContext, raw: &str) {
    let Err(err) = route_frame(state, ctx, raw) else {
        return;
    };

    let agent_id = match &err {
        RouteError::UnknownAgent { agent_id } => Some(agent_id.clone()),
        _ => None,
    };
    warn!(
        component = "router",
        event = "router.frame.rejected",
        serial = ctx.serial,
        code = err.code(),
        error = %err,
        payload_preview = %truncate_for_log(raw, 240),
        "Dropped inbound frame"
    );
    if err.reply_to_sender() {
        ctx.reply(ServerFrame::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            agent_id,
        });
    }
}

pub fn route_frame(
    state: &AppState,
    ctx: &mut ConnectionContext,
    raw: &str,
) -> Result<(), RouteError> {
    match Frame::parse(raw)? {
        Frame::Agent(frame) => {
            ctx.check_role(Role::Agent)?;
            route_agent_frame(state, ctx, frame)
        }
        Frame::Ui(frame) => {
            ctx.check_role(Role::Ui)?;
            route_ui_frame(state, ctx, frame, raw)
        }
        Frame::Server(_) => Err(RouteError::ServerRoleFrame),
    }
}

fn route_agent_frame(
    state: &AppState,
    ctx: &mut ConnectionContext,
    mut frame: AgentFrame,
) -> Result<(), RouteError> {
    match frame {
        AgentFrame::Register { agent_id, data } => {
            register(state, ctx, Role::Agent, agent_id, data)
        }
        AgentFrame::Unregister => {
            unregister(state, ctx, DisconnectReason::Unregistered);
            Ok(())
        }
        AgentFrame::Ping { .. } => {
            if let Some(id) = ctx.registered_as(Role::Agent) {
                state.registry.touch_heartbeat(id, ctx.serial);
            }
            ctx.reply(ServerFrame::Pong {
                timestamp: unix_millis(),
            });
            Ok(())
        }
        AgentFrame::Pong { .. } => {
            if let Some(id) = ctx.registered_as(Role::Agent) {
                state.registry.touch_heartbeat(id, ctx.serial);
            }
            Ok(())
        }
        _ => {
            let id = ctx
                .registered_as(Role::Agent)
                .ok_or(RouteError::NotRegistered)?
                .to_string();
            if let AgentFrame::AgentUpdate { data, .. } = &frame {
                state.registry.update_metadata(&id, data.clone());
            }
            frame.stamp(&id, state.clock.next());
            if let Some(text) = encode(frame) {
                let delivered = state.registry.broadcast(Role::Ui, &text);
                debug!(
                    component = "router",
                    event = "router.agent_event.broadcast",
                    agent_id = %id,
                    delivered,
                    "Agent event relayed to UI connections"
                );
            }
            Ok(())
        }
    }
}

fn route_ui_frame(
    state: &AppState,
    ctx: &mut ConnectionContext,
    frame: UiFrame,
    raw: &str,
) -> Result<(), RouteError> {
    match frame {
        UiFrame::Register { client_id, data } => {
            register(state, ctx, Role::Ui, client_id, data)
        }
        UiFrame::Unregister => {
            unregister(state, ctx, DisconnectReason::Unregistered);
            Ok(())
        }
        UiFrame::Ping { .. } => {
            if let Some(id) = ctx.registered_as(Role::Ui) {
                state.registry.touch_heartbeat(id, ctx.serial);
            }
            ctx.reply(ServerFrame::Pong {
                timestamp: unix_millis(),
            });
            Ok(())
        }
        UiFrame::GetAgents => {
            ctx.reply(ServerFrame::AgentList {
                agents: state.registry.agent_infos(),
            });
            Ok(())
        }
        ref forwarded => {
            let kind = forwarded.kind();
            let target = forwarded.target_agent().unwrap_or_default().trim();
            if target.is_empty() {
                return Err(RouteError::MissingAgentId { kind });
            }
            let is_agent = state
                .registry
                .get(target)
                .is_some_and(|connection| connection.role == Role::Agent);
            if !is_agent {
                return Err(RouteError::UnknownAgent {
                    agent_id: target.to_string(),
                });
            }
            state
                .registry
                .send_to(target, Outbound::Text(raw.to_string()))?;
            debug!(
                component = "router",
                event = "router.ui_command.forwarded",
                agent_id = %target,
                kind,
                "UI frame forwarded to agent"
            );
            Ok(())
        }
    }
}

fn register(
    state: &AppState,
    ctx: &mut ConnectionContext,
    role: Role,
    requested_id: Option<String>,
    metadata: Metadata,
) -> Result<(), RouteError> {
    // Re-registering under a new id releases the old one
    if let Some((_, previous)) = ctx.registration.take() {
        let same_id = requested_id.as_deref().map(str::trim) == Some(previous.as_str());
        if !same_id {
            release(state, ctx.serial, role, &previous, DisconnectReason::Unregistered);
        }
    }

    let registration = state.registry.register(
        role,
        requested_id,
        metadata,
        ctx.serial,
        ctx.sender.clone(),
    )?;
    ctx.registration = Some((role, registration.id.clone()));
    ctx.reply(ServerFrame::Registered {
        id: registration.id.clone(),
        connection_role: role,
    });

    if role == Role::Agent {
        if let Some(agent) = state.registry.get(&registration.id) {
            let info = agent.agent_info(tokio::time::Instant::now());
            if let Some(text) = encode(ServerFrame::AgentUpdate { agent: info }) {
                state.registry.broadcast(Role::Ui, &text);
            }
        }
    }
    Ok(())
}

fn unregister(state: &AppState, ctx: &mut ConnectionContext, reason: DisconnectReason) {
    if let Some((role, id)) = ctx.registration.take() {
        release(state, ctx.serial, role, &id, reason);
    }
}

/// Tear down routing state when the socket ends.
pub fn connection_closed(state: &AppState, ctx: &mut ConnectionContext) {
    unregister(state, ctx, DisconnectReason::SocketClosed);
}

fn release(state: &AppState, serial: u64, role: Role, id: &str, reason: DisconnectReason) {
    let Some(removed) = state.registry.remove_if_current(id, serial) else {
        return;
    };
    info!(
        component = "router",
        event = "router.connection.released",
        connection_id = %removed.id,
        role = ?role,
        reason = ?reason,
        "Connection left the registry"
    );
    if role == Role::Agent {
        if let Some(text) = encode(ServerFrame::AgentDisconnected {
            agent_id: removed.id,
            reason,
        }) {
            state.registry.broadcast(Role::Ui, &text);
        }
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use agentrelay_protocol::AgentEventName;

    struct Peer {
        ctx: ConnectionContext,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Peer {
        fn new(serial: u64) -> Self {
            let (tx, rx) = mpsc::channel(32);
            Self {
                ctx: ConnectionContext::new(serial, tx),
                rx,
            }
        }

        fn send(&mut self, state: &AppState, raw: &str) -> Result<(), RouteError> {
            route_frame(state, &mut self.ctx, raw)
        }

        fn texts(&mut self) -> Vec<String> {
            let mut texts = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Outbound::Text(text) = frame {
                    texts.push(text);
                }
            }
            texts
        }

        fn frames(&mut self) -> Vec<Frame> {
            self.texts()
                .iter()
                .map(|text| Frame::parse(text).expect("server emits valid frames"))
                .collect()
        }
    }

    fn state() -> AppState {
        AppState::new(ServerConfig::default())
    }

    fn connected(state: &AppState) -> (Peer, Peer) {
        let mut agent = Peer::new(1);
        let mut ui = Peer::new(2);
        ui.send(state, r#"{"role":"ui","type":"register","clientId":"ui-1"}"#)
            .expect("ui register");
        agent
            .send(state, r#"{"role":"agent","type":"register","agentId":"a1","data":{"name":"dev"}}"#)
            .expect("agent register");
        agent.texts();
        ui.texts();
        (agent, ui)
    }

    #[tokio::test]
    async fn agent_register_replies_and_announces_to_uis() {
        let state = state();
        let mut ui = Peer::new(2);
        ui.send(&state, r#"{"role":"ui","type":"register"}"#)
            .expect("ui register");
        assert!(matches!(
            ui.frames().as_slice(),
            [Frame::Server(ServerFrame::Registered {
                connection_role: Role::Ui,
                ..
            })]
        ));

        let mut agent = Peer::new(1);
        agent
            .send(&state, r#"{"role":"agent","type":"register","agentId":"a1"}"#)
            .expect("agent register");
        assert_eq!(
            agent.frames(),
            vec![Frame::Server(ServerFrame::Registered {
                id: "a1".into(),
                connection_role: Role::Agent,
            })]
        );
        match ui.frames().as_slice() {
            [Frame::Server(ServerFrame::AgentUpdate { agent })] => assert_eq!(agent.id, "a1"),
            other => panic!("expected agentUpdate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn agent_events_are_stamped_and_broadcast() {
        let state = state();
        let (mut agent, mut ui) = connected(&state);

        let event = r#"{"role":"agent","type":"agentResponse","agentId":"spoofed","timestamp":1,
            "event":{"eventName":"Message","taskId":"t1","message":{"ts":5,"type":"say","say":"text","text":"hi"}}}"#;
        agent.send(&state, event).expect("first event");
        agent.send(&state, event).expect("second event");

        let frames = ui.frames();
        assert_eq!(frames.len(), 2);
        let stamps: Vec<u64> = frames
            .iter()
            .map(|frame| match frame {
                Frame::Agent(AgentFrame::AgentResponse {
                    agent_id,
                    timestamp,
                    event,
                }) => {
                    assert_eq!(agent_id.as_deref(), Some("a1"));
                    assert_eq!(event.event_name, AgentEventName::Message);
                    timestamp.expect("stamped")
                }
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert!(stamps[1] > stamps[0]);
        assert!(agent.texts().is_empty(), "agents do not receive their own events");
    }

    #[tokio::test]
    async fn ui_commands_are_forwarded_verbatim() {
        let state = state();
        let (mut agent, mut ui) = connected(&state);

        let raw = r#"{"role":"ui","type":"createTask","agentId":"a1","data":{"text":"build it","clientTaskId":"client-1"},"extra":true}"#;
        ui.send(&state, raw).expect("forward createTask");
        assert_eq!(agent.texts(), vec![raw.to_string()]);

        let command = r#"{"role":"ui","type":"remoteCommand","agentId":"a1","command":"cancelTask","parameters":{"taskId":"t1"}}"#;
        ui.send(&state, command).expect("forward remote command");
        assert_eq!(agent.texts(), vec![command.to_string()]);
        assert!(ui.texts().is_empty());
    }

    #[tokio::test]
    async fn get_agents_is_answered_from_the_registry() {
        let state = state();
        let (_agent, mut ui) = connected(&state);
        ui.send(&state, r#"{"role":"ui","type":"getAgents"}"#)
            .expect("getAgents");
        match ui.frames().as_slice() {
            [Frame::Server(ServerFrame::AgentList { agents })] => {
                assert_eq!(agents.len(), 1);
                assert_eq!(agents[0].id, "a1");
                assert_eq!(agents[0].metadata["name"], "dev");
            }
            other => panic!("expected agentList, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn protocol_errors_drop_the_frame_only() {
        let state = state();
        let (mut agent, mut ui) = connected(&state);

        handle_text(&state, &mut ui.ctx, "{not json");
        handle_text(&state, &mut ui.ctx, r#"{"role":"ui","type":"getActiveTaskIds"}"#);
        handle_text(
            &state,
            &mut ui.ctx,
            r#"{"role":"ui","type":"getActiveTaskIds","agentId":"ghost"}"#,
        );

        let codes: Vec<String> = ui
            .frames()
            .into_iter()
            .map(|frame| match frame {
                Frame::Server(ServerFrame::Error { code, .. }) => code,
                other => panic!("expected error frame, got {:?}", other),
            })
            .collect();
        // Unknown targets are only logged
        assert_eq!(codes, vec!["parse_error", "missing_agent_id"]);
        assert!(agent.texts().is_empty());

        // The connection keeps working afterwards
        ui.send(&state, r#"{"role":"ui","type":"getActiveTaskIds","agentId":"a1"}"#)
            .expect("still routable");
        assert_eq!(agent.texts().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_agent_cannot_emit_events() {
        let state = state();
        let mut agent = Peer::new(9);
        let err = agent
            .send(
                &state,
                r#"{"role":"agent","type":"activeTaskIdsResponse","data":{"taskIds":["t1"]}}"#,
            )
            .expect_err("must register first");
        assert!(matches!(err, RouteError::NotRegistered));
    }

    #[tokio::test]
    async fn role_mismatch_is_rejected() {
        let state = state();
        let (_agent, mut ui) = connected(&state);
        let err = ui
            .send(&state, r#"{"role":"agent","type":"pong"}"#)
            .expect_err("ui cannot speak as agent");
        assert_eq!(err.code(), "role_mismatch");
        let err = ui
            .send(&state, r#"{"role":"server","type":"ping","timestamp":1}"#)
            .expect_err("peers cannot speak as server");
        assert_eq!(err.code(), "invalid_role");
    }

    #[tokio::test]
    async fn socket_close_announces_departure_unless_replaced() {
        let state = state();
        let (mut agent, mut ui) = connected(&state);

        // Same id from a new socket: the old socket's close is a no-op
        let mut replacement = Peer::new(3);
        replacement
            .send(&state, r#"{"role":"agent","type":"register","agentId":"a1"}"#)
            .expect("re-register");
        ui.texts();
        connection_closed(&state, &mut agent.ctx);
        assert!(state.registry.is_current("a1", 3));
        assert!(ui.texts().is_empty());

        connection_closed(&state, &mut replacement.ctx);
        assert_eq!(
            ui.frames(),
            vec![Frame::Server(ServerFrame::AgentDisconnected {
                agent_id: "a1".into(),
                reason: DisconnectReason::SocketClosed,
            })]
        );
        assert!(state.registry.get("a1").is_none());
    }

    #[tokio::test]
    async fn ping_refreshes_heartbeat_and_gets_pong() {
        let state = state();
        let (mut agent, _ui) = connected(&state);
        agent
            .send(&state, r#"{"role":"agent","type":"ping","timestamp":1}"#)
            .expect("ping");
        assert!(matches!(
            agent.frames().as_slice(),
            [Frame::Server(ServerFrame::Pong { .. })]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_socket_heartbeats_do_not_refresh_replacement() {
        use std::time::Duration;
        use tokio::time::Instant;

        let state = state();
        let (mut orphan, _ui) = connected(&state);
        let mut replacement = Peer::new(3);
        replacement
            .send(&state, r#"{"role":"agent","type":"register","agentId":"a1"}"#)
            .expect("re-register");

        tokio::time::advance(Duration::from_secs(30)).await;
        orphan
            .send(&state, r#"{"role":"agent","type":"ping","timestamp":1}"#)
            .expect("orphan ping");
        orphan
            .send(&state, r#"{"role":"agent","type":"pong","timestamp":2}"#)
            .expect("orphan pong");
        let age = |state: &AppState| {
            state
                .registry
                .get("a1")
                .expect("a1 live")
                .heartbeat_age(Instant::now())
        };
        assert_eq!(age(&state), Duration::from_secs(30));

        replacement
            .send(&state, r#"{"role":"agent","type":"pong","timestamp":3}"#)
            .expect("replacement pong");
        assert_eq!(age(&state), Duration::ZERO);
    }

    #[tokio::test]
    async fn ui_cannot_take_over_a_live_agent_id() {
        let state = state();
        let (mut agent, mut ui) = connected(&state);

        let mut intruder = Peer::new(3);
        handle_text(
            &state,
            &mut intruder.ctx,
            r#"{"role":"ui","type":"register","clientId":"a1"}"#,
        );
        match intruder.frames().as_slice() {
            [Frame::Server(ServerFrame::Error { code, .. })] => assert_eq!(code, "id_in_use"),
            other => panic!("expected id_in_use error, got {:?}", other),
        }
        assert!(intruder.ctx.registration.is_none());
        assert!(state.registry.is_current("a1", 1));

        ui.send(&state, r#"{"role":"ui","type":"getAgents"}"#)
            .expect("getAgents");
        match ui.frames().as_slice() {
            [Frame::Server(ServerFrame::AgentList { agents })] => {
                assert_eq!(agents.len(), 1);
                assert_eq!(agents[0].id, "a1");
            }
            other => panic!("expected agentList, got {:?}", other),
        }
        ui.send(&state, r#"{"role":"ui","type":"getActiveTaskIds","agentId":"a1"}"#)
            .expect("forward to the agent");
        assert_eq!(agent.texts().len(), 1);
    }
}
