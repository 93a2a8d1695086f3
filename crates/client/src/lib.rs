//! agentrelay client
//!
//! Connection manager and task state for UI clients of the relay. Spawn a
//! [`ClientConnectionManager`], then drive it through the returned
//! [`ClientHandle`] and subscribe to [`ClientEvent`]s.

pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod events;
pub mod messages;
pub mod scheduler;
pub mod state;
pub mod tasks;
pub mod timers;

pub use config::ClientConfig;
pub use connection::{reconnect_delay, ClientConnectionManager, ClientHandle};
pub use dedup::{EventDeduplicator, Fingerprint, Ingest};
pub use error::ClientError;
pub use events::{ClientEvent, ConnectionSnapshot, ConnectionStatus};
pub use messages::{ChatMessage, MessageContent, MessageKind, StructuredContent};
pub use scheduler::{ApprovalAndRetryScheduler, ApprovalKey, ApprovalState, RetryState};
pub use state::{ClientSnapshot, ClientState, Effect};
pub use tasks::{Task, TaskHierarchyTracker};
