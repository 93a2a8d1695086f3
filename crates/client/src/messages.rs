//! Chat messages as shown to the user
//!
//! Agent events arrive as say/ask messages with a subtype string. They are
//! classified once, on arrival, into plain text or one of the structured
//! shapes below.

use agentrelay_protocol::{AgentMessage, AgentMessageType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Agent,
}

/// The say/ask kind an agent message was built from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Say(String),
    Ask(String),
}

impl EventKind {
    pub fn of(message: &AgentMessage) -> Self {
        let subtype = message.subtype().to_string();
        match message.kind {
            AgentMessageType::Say => EventKind::Say(subtype),
            AgentMessageType::Ask => EventKind::Ask(subtype),
        }
    }

    pub fn is_ask(&self) -> bool {
        matches!(self, EventKind::Ask(_))
    }

    pub fn subtype(&self) -> &str {
        match self {
            EventKind::Say(kind) | EventKind::Ask(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructuredContent {
    ToolApproval {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    CommandApproval {
        command: String,
    },
    ToolResult {
        #[serde(default)]
        payload: Value,
    },
    ApiError {
        message: String,
    },
    Say {
        say: String,
        text: String,
    },
    Question {
        question: String,
        #[serde(default)]
        suggest: Vec<String>,
    },
}

impl StructuredContent {
    /// Whether this content asks the user for a decision.
    pub fn is_ask(&self) -> bool {
        matches!(
            self,
            StructuredContent::ToolApproval { .. }
                | StructuredContent::CommandApproval { .. }
                | StructuredContent::Question { .. }
        )
    }

    fn same_shape(&self, other: &StructuredContent) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Structured(StructuredContent),
}

impl MessageContent {
    /// Plain text, or the JSON encoding of a structured payload.
    pub fn to_wire(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Structured(content) => {
                serde_json::to_string(content).unwrap_or_default()
            }
        }
    }

    pub fn structured(&self) -> Option<&StructuredContent> {
        match self {
            MessageContent::Structured(content) => Some(content),
            MessageContent::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub content: MessageContent,
    pub ts: Option<u64>,
    pub partial: bool,
    pub origin: Option<EventKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ChatMessage {
    /// A message typed by the local user.
    pub fn user(text: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            kind: MessageKind::User,
            content: MessageContent::Text(text.into()),
            ts: None,
            partial: false,
            origin: None,
            images,
        }
    }

    pub fn from_agent(message: &AgentMessage) -> Self {
        let (kind, content) = classify(message);
        Self {
            kind,
            content,
            ts: message.ts,
            partial: message.partial,
            origin: Some(EventKind::of(message)),
            images: message.images.clone(),
        }
    }

    /// Structured asks with the same shape replace each other at the tail.
    pub fn is_same_ask_shape(&self, other: &ChatMessage) -> bool {
        match (self.content.structured(), other.content.structured()) {
            (Some(a), Some(b)) => a.is_ask() && b.is_ask() && a.same_shape(b),
            _ => false,
        }
    }

    pub fn is_api_error(&self) -> bool {
        matches!(
            self.content,
            MessageContent::Structured(StructuredContent::ApiError { .. })
        )
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text),
            MessageContent::Structured(_) => None,
        }
    }

    /// Echo of a locally sent user message, as reported back by the agent.
    pub fn is_echo_of(&self, local: &ChatMessage) -> bool {
        local.kind == MessageKind::User
            && local.origin.is_none()
            && self.kind == MessageKind::User
            && self.text().map(str::trim) == local.text().map(str::trim)
    }
}

/// Subtype that marks a task as finished.
pub const COMPLETION_RESULT: &str = "completion_result";

fn classify(message: &AgentMessage) -> (MessageKind, MessageContent) {
    let text = message.text().to_string();
    let subtype = message.subtype();
    match message.kind {
        AgentMessageType::Say => match subtype {
            "text" | "reasoning" | COMPLETION_RESULT => {
                (MessageKind::Agent, MessageContent::Text(text))
            }
            "user_feedback" => (MessageKind::User, MessageContent::Text(text)),
            "error" | "api_error" => (
                MessageKind::Agent,
                MessageContent::Structured(StructuredContent::ApiError { message: text }),
            ),
            "tool" => (
                MessageKind::Agent,
                MessageContent::Structured(StructuredContent::ToolResult {
                    payload: parse_json_or_string(&text),
                }),
            ),
            other => (
                MessageKind::Agent,
                MessageContent::Structured(StructuredContent::Say {
                    say: other.to_string(),
                    text,
                }),
            ),
        },
        AgentMessageType::Ask => {
            let content = match subtype {
                "tool" => tool_approval(&text),
                "command" => StructuredContent::CommandApproval { command: text },
                "followup" => question(&text),
                "api_req_failed" => StructuredContent::ApiError { message: text },
                COMPLETION_RESULT => return (MessageKind::Agent, MessageContent::Text(text)),
                _ => StructuredContent::Question {
                    question: text,
                    suggest: Vec::new(),
                },
            };
            (MessageKind::Agent, MessageContent::Structured(content))
        }
    }
}

fn parse_json_or_string(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn tool_approval(text: &str) -> StructuredContent {
    let payload = parse_json_or_string(text);
    let tool = payload
        .get("tool")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let path = payload
        .get("path")
        .and_then(Value::as_str)
        .map(str::to_string);
    StructuredContent::ToolApproval {
        tool,
        path,
        payload,
    }
}

fn question(text: &str) -> StructuredContent {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return StructuredContent::Question {
            question: text.to_string(),
            suggest: Vec::new(),
        };
    };
    let question = value
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or(text)
        .to_string();
    // Suggestions are plain strings or `{ "answer": ... }` objects
    let suggest = value
        .get("suggest")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.as_str()
                        .or_else(|| item.get("answer").and_then(Value::as_str))
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();
    StructuredContent::Question { question, suggest }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn say(kind: &str, text: &str) -> AgentMessage {
        AgentMessage {
            ts: Some(1),
            kind: AgentMessageType::Say,
            say: Some(kind.into()),
            ask: None,
            text: Some(text.into()),
            partial: false,
            images: Vec::new(),
        }
    }

    fn ask(kind: &str, text: &str) -> AgentMessage {
        AgentMessage {
            ts: Some(1),
            kind: AgentMessageType::Ask,
            say: None,
            ask: Some(kind.into()),
            text: Some(text.into()),
            partial: false,
            images: Vec::new(),
        }
    }

    #[test]
    fn plain_says_become_text() {
        let message = ChatMessage::from_agent(&say("text", "hello"));
        assert_eq!(message.kind, MessageKind::Agent);
        assert_eq!(message.content, MessageContent::Text("hello".into()));
        assert_eq!(message.origin, Some(EventKind::Say("text".into())));

        let feedback = ChatMessage::from_agent(&say("user_feedback", "do it"));
        assert_eq!(feedback.kind, MessageKind::User);
    }

    #[test]
    fn tool_ask_parses_tool_and_path() {
        let message = ChatMessage::from_agent(&ask(
            "tool",
            r#"{"tool":"editedExistingFile","path":"src/main.rs","diff":"..."}"#,
        ));
        match message.content {
            MessageContent::Structured(StructuredContent::ToolApproval { tool, path, payload }) => {
                assert_eq!(tool, "editedExistingFile");
                assert_eq!(path.as_deref(), Some("src/main.rs"));
                assert_eq!(payload["diff"], "...");
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn followup_accepts_string_and_object_suggestions() {
        let message = ChatMessage::from_agent(&ask(
            "followup",
            r#"{"question":"Which branch?","suggest":["main",{"answer":"dev"}]}"#,
        ));
        assert_eq!(
            message.content,
            MessageContent::Structured(StructuredContent::Question {
                question: "Which branch?".into(),
                suggest: vec!["main".into(), "dev".into()],
            })
        );

        let plain = ChatMessage::from_agent(&ask("followup", "Continue?"));
        assert_eq!(
            plain.content,
            MessageContent::Structured(StructuredContent::Question {
                question: "Continue?".into(),
                suggest: Vec::new(),
            })
        );
    }

    #[test]
    fn errors_are_api_errors() {
        assert!(ChatMessage::from_agent(&say("api_error", "rate limited")).is_api_error());
        assert!(ChatMessage::from_agent(&ask("api_req_failed", "500")).is_api_error());
        assert!(!ChatMessage::from_agent(&say("text", "fine")).is_api_error());
    }

    #[test]
    fn wire_form_is_text_or_json() {
        assert_eq!(MessageContent::Text("hi".into()).to_wire(), "hi");
        let wire = MessageContent::Structured(StructuredContent::CommandApproval {
            command: "cargo build".into(),
        })
        .to_wire();
        let value: Value = serde_json::from_str(&wire).expect("json");
        assert_eq!(value["type"], "command_approval");
        assert_eq!(value["command"], "cargo build");
    }

    #[test]
    fn same_ask_shape_ignores_content() {
        let a = ChatMessage::from_agent(&ask("command", "ls"));
        let b = ChatMessage::from_agent(&ask("command", "pwd"));
        let c = ChatMessage::from_agent(&ask("followup", "?"));
        assert!(a.is_same_ask_shape(&b));
        assert!(!a.is_same_ask_shape(&c));
        assert!(!a.is_same_ask_shape(&ChatMessage::from_agent(&say("text", "x"))));
    }
}
