//! agentrelay protocol
//!
//! Shared frame types for the relay server, agent connections and UI clients.
//! Every frame is a JSON object tagged by `role` (who speaks) and `type`
//! (what kind of message), sent as a WebSocket text message.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod agent;
pub mod command;
pub mod server;
pub mod types;
pub mod ui;

pub use agent::AgentFrame;
pub use command::RemoteCommand;
pub use server::ServerFrame;
pub use types::*;
pub use ui::UiFrame;

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Frame {
    Agent(AgentFrame),
    Ui(UiFrame),
    Server(ServerFrame),
}

impl Frame {
    pub fn parse(text: &str) -> Result<Frame, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<AgentFrame> for Frame {
    fn from(frame: AgentFrame) -> Self {
        Frame::Agent(frame)
    }
}

impl From<UiFrame> for Frame {
    fn from(frame: UiFrame) -> Self {
        Frame::Ui(frame)
    }
}

impl From<ServerFrame> for Frame {
    fn from(frame: ServerFrame) -> Self {
        Frame::Server(frame)
    }
}

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_agent_response_event() {
        let json = r#"{
          "role":"agent",
          "type":"agentResponse",
          "event":{
            "eventName":"Message",
            "taskId":"t1",
            "message":{"ts":1700,"type":"say","say":"text","text":"Hello","partial":true}
          }
        }"#;

        let parsed = Frame::parse(json).expect("parse agent response");
        match parsed {
            Frame::Agent(AgentFrame::AgentResponse {
                agent_id,
                timestamp,
                event,
            }) => {
                assert!(agent_id.is_none());
                assert!(timestamp.is_none());
                assert_eq!(event.event_name, AgentEventName::Message);
                assert_eq!(event.task_id, "t1");
                let message = event.message.expect("message payload");
                assert_eq!(message.ts, Some(1700));
                assert_eq!(message.kind, AgentMessageType::Say);
                assert_eq!(message.subtype(), "text");
                assert_eq!(message.text(), "Hello");
                assert!(message.partial);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn deserializes_remote_command_envelope() {
        let json = r#"{
          "role":"ui",
          "type":"remoteCommand",
          "agentId":"a1",
          "requestId":"r-1",
          "command":"getTaskDetails",
          "parameters":{"taskId":"t-42"}
        }"#;

        let parsed = Frame::parse(json).expect("parse remote command");
        match parsed {
            Frame::Ui(UiFrame::RemoteCommand {
                agent_id,
                request_id,
                command,
            }) => {
                assert_eq!(agent_id, "a1");
                assert_eq!(request_id.as_deref(), Some("r-1"));
                assert_eq!(
                    command,
                    RemoteCommand::GetTaskDetails {
                        task_id: "t-42".to_string()
                    }
                );
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn remote_command_without_parameters() {
        let json = r#"{"role":"ui","type":"remoteCommand","agentId":"a1","command":"getStatus"}"#;
        let parsed = Frame::parse(json).expect("parse parameterless command");
        assert_eq!(
            parsed,
            Frame::Ui(UiFrame::RemoteCommand {
                agent_id: "a1".into(),
                request_id: None,
                command: RemoteCommand::GetStatus,
            })
        );
    }

    #[test]
    fn forward_frames_default_missing_agent_id_to_empty() {
        let json = r#"{"role":"ui","type":"getActiveTaskIds"}"#;
        let parsed = Frame::parse(json).expect("parse getActiveTaskIds");
        match parsed {
            Frame::Ui(frame) => assert_eq!(frame.target_agent(), Some("")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn serialized_frames_carry_role_and_type() {
        let frame = Frame::Server(ServerFrame::AgentDisconnected {
            agent_id: "a1".into(),
            reason: DisconnectReason::HeartbeatTimeout,
        });
        let value: serde_json::Value =
            serde_json::from_str(&frame.to_json().expect("serialize")).expect("json");
        assert_eq!(value["role"], "server");
        assert_eq!(value["type"], "agentDisconnected");
        assert_eq!(value["agentId"], "a1");
        assert_eq!(value["reason"], "heartbeat_timeout");

        let get_agents = Frame::Ui(UiFrame::GetAgents).to_json().expect("serialize");
        assert_eq!(get_agents, r#"{"role":"ui","type":"getAgents"}"#);
    }

    #[test]
    fn stamping_sets_routing_tags_on_forwarded_frames() {
        let mut frame = AgentFrame::ActiveTaskIdsResponse {
            agent_id: None,
            timestamp: None,
            data: ActiveTaskIds {
                task_ids: vec!["t1".into()],
            },
        };
        assert!(frame.is_forwarded());
        assert!(frame.stamp("a1", 42));
        assert_eq!(frame.agent_id(), Some("a1"));

        let mut ping = AgentFrame::Ping { timestamp: None };
        assert!(!ping.is_forwarded());
        assert!(!ping.stamp("a1", 42));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Frame::parse(r#"{"role":"ui","type":"launchMissiles"}"#).is_err());
        assert!(Frame::parse(r#"{"type":"getAgents"}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn abnormal_close_codes() {
        assert!(!close_code::is_abnormal(Some(close_code::NORMAL)));
        assert!(!close_code::is_abnormal(Some(close_code::GOING_AWAY)));
        assert!(close_code::is_abnormal(Some(close_code::HEARTBEAT_TIMEOUT)));
        assert!(close_code::is_abnormal(Some(1006)));
        assert!(close_code::is_abnormal(None));
    }
}
