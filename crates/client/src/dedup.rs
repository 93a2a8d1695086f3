//! Event deduplication and streaming assembly
//!
//! The relay delivers at least once, so the same final event can show up
//! twice (replays after reconnect, agents resending). Finals are fingerprinted
//! and dropped when already seen. Partials are never dropped: they fold into
//! the task's tail message until the matching final closes it.

use std::collections::{HashSet, VecDeque};

use agentrelay_protocol::AgentMessage;

use crate::config::DedupConfig;
use crate::messages::{ChatMessage, EventKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub task_id: String,
    pub ts: Option<u64>,
    pub kind: EventKind,
    pub partial: bool,
    pub text_prefix: String,
}

impl Fingerprint {
    pub fn new(task_id: &str, message: &AgentMessage, prefix_chars: usize) -> Self {
        Self {
            task_id: task_id.to_string(),
            ts: message.ts,
            kind: EventKind::of(message),
            partial: message.partial,
            text_prefix: message.text().chars().take(prefix_chars).collect(),
        }
    }
}

/// Bounded insertion-ordered set
#[derive(Debug)]
struct RecentSet {
    seen: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
    capacity: usize,
}

impl RecentSet {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(2),
        }
    }

    fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    fn insert(&mut self, fingerprint: Fingerprint) {
        if !self.seen.insert(fingerprint.clone()) {
            return;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity {
            let keep = self.capacity / 2;
            while self.order.len() > keep {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

/// What happened to an incoming event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Duplicate,
    Appended,
    Replaced,
}

#[derive(Debug)]
pub struct EventDeduplicator {
    recent: RecentSet,
    prefix_chars: usize,
}

impl EventDeduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            recent: RecentSet::new(config.capacity),
            prefix_chars: config.text_prefix_chars,
        }
    }

    /// Fold one agent message into `messages`, the task's message list.
    pub fn ingest(
        &mut self,
        task_id: &str,
        message: &AgentMessage,
        messages: &mut Vec<ChatMessage>,
    ) -> Ingest {
        if !message.partial {
            let fingerprint = Fingerprint::new(task_id, message, self.prefix_chars);
            if self.recent.contains(&fingerprint) {
                return Ingest::Duplicate;
            }
            self.recent.insert(fingerprint);
        }

        let incoming = ChatMessage::from_agent(message);
        if let Some(tail) = messages.last_mut() {
            let open_stream = tail.partial && tail.origin == incoming.origin;
            if open_stream || tail.is_same_ask_shape(&incoming) || incoming.is_echo_of(tail) {
                *tail = incoming;
                return Ingest::Replaced;
            }
        }
        messages.push(incoming);
        Ingest::Appended
    }

    /// Forget every fingerprint. Called on each fresh connection.
    pub fn clear(&mut self) {
        self.recent.clear();
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
