//! Task hierarchy tracking
//!
//! Rebuilds each agent's task forest from three unordered sources: active-id
//! lists, spawn events and history responses. Tasks are created on first
//! reference. Completion only moves forward: an event-driven completion is
//! never undone, while a history-driven one yields to liveness.

use std::collections::{HashMap, HashSet, VecDeque};

use agentrelay_protocol::HistoryItem;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::messages::{ChatMessage, MessageContent, MessageKind};

/// Prefix of task ids assigned locally before the agent confirms creation.
pub const LOCAL_TASK_PREFIX: &str = "client-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    /// completion_result, TaskCompleted or TaskAborted
    Event,
    History,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    pub parent_task_id: Option<String>,
    pub is_subtask: bool,
    pub level: u32,
    pub is_active: bool,
    /// Created locally or announced, still waiting for its first message
    pub is_new_task: bool,
    pub completion: Option<CompletionSource>,
    pub title: Option<String>,
    pub task_data: Option<Value>,
    /// Subtasks this task has spawned, in order
    pub spawned: Vec<String>,
    has_live_events: bool,
    created_seq: u64,
}

impl Task {
    fn new(id: &str, agent_id: &str, created_seq: u64) -> Self {
        Self {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            parent_task_id: None,
            is_subtask: false,
            level: 0,
            is_active: false,
            is_new_task: false,
            completion: None,
            title: None,
            task_data: None,
            spawned: Vec::new(),
            has_live_events: false,
            created_seq,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_some()
    }

    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_TASK_PREFIX)
    }
}

/// A client-assigned id replaced by the agent's canonical id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRename {
    pub old_id: String,
    pub new_id: String,
}

#[derive(Debug, Default)]
pub struct TaskHierarchyTracker {
    tasks: HashMap<String, Task>,
    messages: HashMap<String, Vec<ChatMessage>>,
    next_seq: u64,
}

impl TaskHierarchyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn tasks_for(&self, agent_id: &str) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|task| task.agent_id == agent_id)
            .collect();
        tasks.sort_by_key(|task| task.created_seq);
        tasks
    }

    pub fn messages(&self, task_id: &str) -> &[ChatMessage] {
        self.messages
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn messages_mut(&mut self, task_id: &str) -> &mut Vec<ChatMessage> {
        self.messages.entry(task_id.to_string()).or_default()
    }

    pub fn all_messages(&self) -> &HashMap<String, Vec<ChatMessage>> {
        &self.messages
    }

    /// Text and images of the last message the user sent to `task_id`.
    pub fn last_user_message(&self, task_id: &str) -> Option<(String, Vec<String>)> {
        self.messages(task_id)
            .iter()
            .rev()
            .find(|message| message.kind == MessageKind::User)
            .and_then(|message| match &message.content {
                MessageContent::Text(text) => Some((text.clone(), message.images.clone())),
                MessageContent::Structured(_) => None,
            })
    }

    pub fn ensure(&mut self, agent_id: &str, task_id: &str) -> &mut Task {
        let next_seq = &mut self.next_seq;
        let task = self.tasks.entry(task_id.to_string()).or_insert_with(|| {
            *next_seq += 1;
            Task::new(task_id, agent_id, *next_seq)
        });
        if task.agent_id.is_empty() {
            task.agent_id = agent_id.to_string();
        }
        task
    }

    /// A task created locally, pending the agent's `TaskCreated`.
    pub fn create_local(&mut self, agent_id: &str, task_id: &str) -> &Task {
        let task = self.ensure(agent_id, task_id);
        task.is_new_task = true;
        task.is_active = true;
        task
    }

    /// Apply an agent's active-id list. Returns the ids whose state changed.
    pub fn apply_active_ids(&mut self, agent_id: &str, task_ids: &[String]) -> Vec<String> {
        let listed: HashSet<&str> = task_ids.iter().map(String::as_str).collect();
        let mut changed = Vec::new();

        for task_id in task_ids {
            let task = self.ensure(agent_id, task_id);
            let before = task.clone();
            task.is_active = true;
            if task.completion == Some(CompletionSource::History) {
                task.completion = None;
            }
            if *task != before {
                changed.push(task_id.clone());
            }
        }

        for task in self.tasks.values_mut() {
            // Local tasks are not known to the agent yet
            if task.agent_id != agent_id || listed.contains(task.id.as_str()) || task.is_local() {
                continue;
            }
            if task.is_active || task.has_live_events {
                task.is_active = false;
                task.has_live_events = false;
                changed.push(task.id.clone());
            }
        }
        changed
    }

    /// Every task of `agent_id` loses liveness, e.g. when the agent disconnects.
    pub fn deactivate_agent(&mut self, agent_id: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for task in self.tasks.values_mut() {
            if task.agent_id == agent_id && (task.is_active || task.has_live_events) {
                task.is_active = false;
                task.has_live_events = false;
                changed.push(task.id.clone());
            }
        }
        changed
    }

    /// Record a live message event for `task_id`.
    pub fn note_live_event(&mut self, agent_id: &str, task_id: &str) {
        let task = self.ensure(agent_id, task_id);
        task.has_live_events = true;
        task.is_new_task = false;
    }

    /// Agent confirmed a task. With a client id (or a pending local task to
    /// fall back on) the local record is renamed to `task_id`.
    pub fn on_task_created(
        &mut self,
        agent_id: &str,
        task_id: &str,
        client_task_id: Option<&str>,
    ) -> Option<TaskRename> {
        let local = client_task_id
            .filter(|id| *id != task_id && self.tasks.contains_key(*id))
            .map(str::to_string)
            .or_else(|| {
                if self.tasks.contains_key(task_id) {
                    return None;
                }
                self.oldest_pending_local(agent_id)
            });

        let rename = match local {
            Some(old_id) if self.rename(&old_id, task_id) => Some(TaskRename {
                old_id,
                new_id: task_id.to_string(),
            }),
            _ => None,
        };

        let task = self.ensure(agent_id, task_id);
        task.is_active = true;
        rename
    }

    fn oldest_pending_local(&self, agent_id: &str) -> Option<String> {
        self.tasks
            .values()
            .filter(|task| task.agent_id == agent_id && task.is_local() && task.is_new_task)
            .min_by_key(|task| task.created_seq)
            .map(|task| task.id.clone())
    }

    /// `parent` spawned `child`.
    pub fn on_spawned(&mut self, agent_id: &str, parent: &str, child: &str) {
        self.ensure(agent_id, parent);
        self.ensure(agent_id, child).is_active = true;
        self.link_parent(child, parent);
        if let Some(parent_task) = self.tasks.get_mut(parent) {
            if !parent_task.spawned.iter().any(|id| id == child) {
                parent_task.spawned.push(child.to_string());
            }
        }
    }

    /// Whether a spawn has been recorded for `task_id`.
    pub fn has_spawned(&self, task_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .is_some_and(|task| !task.spawned.is_empty())
    }

    pub fn apply_history(&mut self, agent_id: &str, items: &[HistoryItem]) -> Vec<String> {
        let mut changed = Vec::new();
        for item in items {
            let task = self.ensure(agent_id, &item.id);
            let before = task.clone();
            if let Some(title) = &item.task {
                task.title.get_or_insert_with(|| title.clone());
            }
            if !task.is_active && !task.has_live_events && task.completion.is_none() {
                task.completion = Some(CompletionSource::History);
            }
            let differs = *task != before;

            if let Some(parent) = item.parent_task_id.as_deref() {
                self.ensure(agent_id, parent);
                self.link_parent(&item.id, parent);
            }
            if differs || item.parent_task_id.is_some() {
                changed.push(item.id.clone());
            }
        }
        changed
    }

    /// Mark `task_id` completed. Event completion overrides history completion.
    pub fn mark_completed(&mut self, task_id: &str, source: CompletionSource) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        let next = match (task.completion, source) {
            (Some(CompletionSource::Event), _) => return false,
            (_, CompletionSource::Event) => CompletionSource::Event,
            (Some(CompletionSource::History), CompletionSource::History) => return false,
            (None, CompletionSource::History) => CompletionSource::History,
        };
        task.completion = Some(next);
        task.has_live_events = false;
        true
    }

    pub fn set_task_data(&mut self, task_id: &str, data: Value) -> bool {
        match self.tasks.get_mut(task_id) {
            Some(task) => {
                task.task_data = Some(data);
                true
            }
            None => false,
        }
    }

    /// Move `old_id`'s record and messages to `new_id`. The renamed record
    /// wins over any record already stored under `new_id`.
    pub fn rename(&mut self, old_id: &str, new_id: &str) -> bool {
        if old_id == new_id {
            return false;
        }
        let Some(mut task) = self.tasks.remove(old_id) else {
            return false;
        };
        task.id = new_id.to_string();
        if let Some(existing) = self.tasks.remove(new_id) {
            warn!(
                component = "tasks",
                event = "tasks.rename.conflict",
                old_id,
                new_id,
                "Renamed task collides with a known task, keeping the renamed record"
            );
            task.is_active |= existing.is_active;
            task.has_live_events |= existing.has_live_events;
            task.is_new_task &= existing.is_new_task;
            if task.completion != Some(CompletionSource::Event) {
                task.completion = existing.completion.or(task.completion);
            }
            if task.parent_task_id.is_none() {
                task.parent_task_id = existing.parent_task_id;
                task.is_subtask = existing.is_subtask;
                task.level = existing.level;
            }
            task.title = task.title.or(existing.title);
            task.task_data = task.task_data.or(existing.task_data);
            for child in existing.spawned {
                if !task.spawned.contains(&child) {
                    task.spawned.push(child);
                }
            }
        }
        self.tasks.insert(new_id.to_string(), task);

        // Buffered messages go in front of anything already received
        if let Some(mut buffered) = self.messages.remove(old_id) {
            let entry = self.messages.entry(new_id.to_string()).or_default();
            buffered.append(entry);
            *entry = buffered;
        }

        for other in self.tasks.values_mut() {
            if other.parent_task_id.as_deref() == Some(old_id) {
                other.parent_task_id = Some(new_id.to_string());
            }
            for child in other.spawned.iter_mut() {
                if child == old_id {
                    *child = new_id.to_string();
                }
            }
        }
        self.relevel_from(new_id);

        debug!(
            component = "tasks",
            event = "tasks.renamed",
            old_id,
            new_id,
            "Task id replaced"
        );
        true
    }

    fn is_ancestor(&self, candidate: &str, task_id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = self
            .tasks
            .get(task_id)
            .and_then(|task| task.parent_task_id.clone());
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            if !seen.insert(id.clone()) {
                return false;
            }
            current = self.tasks.get(&id).and_then(|task| task.parent_task_id.clone());
        }
        false
    }

    fn link_parent(&mut self, child: &str, parent: &str) {
        if child == parent || self.is_ancestor(child, parent) {
            warn!(
                component = "tasks",
                event = "tasks.link.cycle",
                child,
                parent,
                "Ignoring parent link that would create a cycle"
            );
            return;
        }
        let parent_level = self.tasks.get(parent).map(|task| task.level).unwrap_or(0);
        if let Some(task) = self.tasks.get_mut(child) {
            task.parent_task_id = Some(parent.to_string());
            task.is_subtask = true;
            task.level = parent_level + 1;
        }
        self.relevel_from(child);
    }

    /// Recompute levels of every known descendant of `root`.
    fn relevel_from(&mut self, root: &str) {
        let mut queue = VecDeque::from([root.to_string()]);
        let mut visited = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(level) = self.tasks.get(&id).map(|task| task.level) else {
                continue;
            };
            for task in self.tasks.values_mut() {
                if task.parent_task_id.as_deref() == Some(id.as_str()) {
                    task.level = level + 1;
                    task.is_subtask = true;
                    queue.push_back(task.id.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn history(id: &str, parent: Option<&str>) -> HistoryItem {
        HistoryItem {
            id: id.into(),
            parent_task_id: parent.map(str::to_string),
            ts: None,
            task: Some(format!("task {}", id)),
        }
    }

    fn assert_levels_consistent(tracker: &TaskHierarchyTracker) {
        for task in tracker.tasks() {
            match &task.parent_task_id {
                None => assert_eq!(task.level, 0, "root {} must be level 0", task.id),
                Some(parent) => {
                    let parent = tracker.get(parent).expect("parent is tracked");
                    assert_eq!(task.level, parent.level + 1, "level of {}", task.id);
                }
            }
        }
    }

    #[test]
    fn spawn_chain_levels_follow_parents() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.on_spawned("a1", "root", "child");
        tracker.on_spawned("a1", "child", "grandchild");
        assert_eq!(tracker.get("root").map(|t| t.level), Some(0));
        assert_eq!(tracker.get("child").map(|t| t.level), Some(1));
        assert_eq!(tracker.get("grandchild").map(|t| t.level), Some(2));
        assert!(tracker.has_spawned("root"));
        assert_levels_consistent(&tracker);

        // Learning that root itself has a parent re-levels the whole chain
        tracker.on_spawned("a1", "top", "root");
        assert_eq!(tracker.get("grandchild").map(|t| t.level), Some(3));
        assert_levels_consistent(&tracker);
    }

    #[test]
    fn cycles_are_refused() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.on_spawned("a1", "a", "b");
        tracker.on_spawned("a1", "b", "a");
        assert!(tracker.get("a").and_then(|t| t.parent_task_id.clone()).is_none());
        assert_levels_consistent(&tracker);
    }

    #[test]
    fn event_completion_survives_active_ids() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.apply_active_ids("a1", &ids(&["t1"]));
        assert!(tracker.mark_completed("t1", CompletionSource::Event));
        tracker.apply_active_ids("a1", &ids(&["t1"]));
        let task = tracker.get("t1").expect("tracked");
        assert!(task.is_completed());
        assert!(task.is_active);
    }

    #[test]
    fn history_completion_yields_to_liveness() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.apply_history("a1", &[history("t1", None), history("t2", None)]);
        assert!(tracker.get("t1").expect("t1").is_completed());

        tracker.apply_active_ids("a1", &ids(&["t1"]));
        assert!(!tracker.get("t1").expect("t1").is_completed());
        assert!(tracker.get("t2").expect("t2").is_completed());
    }

    #[test]
    fn history_never_completes_a_live_task() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.note_live_event("a1", "t1");
        tracker.apply_history("a1", &[history("t1", None), history("t9", Some("t1"))]);
        assert!(!tracker.get("t1").expect("t1").is_completed());
        assert_eq!(tracker.get("t9").map(|t| t.level), Some(1));
        assert_eq!(tracker.get("t1").and_then(|t| t.title.clone()).as_deref(), Some("task t1"));
    }

    #[test]
    fn active_ids_drop_liveness_of_unlisted_tasks() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.apply_active_ids("a1", &ids(&["t1", "t2"]));
        tracker.apply_active_ids("a2", &ids(&["x1"]));
        let changed = tracker.apply_active_ids("a1", &ids(&["t2"]));
        assert_eq!(changed, vec!["t1".to_string()]);
        assert!(!tracker.get("t1").expect("t1").is_active);
        assert!(tracker.get("x1").expect("x1").is_active);
    }

    #[test]
    fn task_created_renames_local_task() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.create_local("a1", "client-1");
        tracker
            .messages_mut("client-1")
            .push(ChatMessage::user("hello", Vec::new()));
        tracker.on_spawned("a1", "client-1", "sub");

        let rename = tracker.on_task_created("a1", "t1", Some("client-1"));
        assert_eq!(
            rename,
            Some(TaskRename {
                old_id: "client-1".into(),
                new_id: "t1".into(),
            })
        );
        assert!(tracker.get("client-1").is_none());
        assert_eq!(tracker.messages("t1").len(), 1);
        assert_eq!(
            tracker.get("sub").and_then(|t| t.parent_task_id.clone()).as_deref(),
            Some("t1")
        );
        assert_eq!(tracker.get("t1").map(|t| t.spawned.clone()), Some(vec!["sub".to_string()]));
        assert_levels_consistent(&tracker);
    }

    #[test]
    fn task_created_without_client_id_claims_oldest_pending_local() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.create_local("a1", "client-1");
        tracker.create_local("a1", "client-2");
        let rename = tracker.on_task_created("a1", "t1", None).expect("renamed");
        assert_eq!(rename.old_id, "client-1");
        assert!(tracker.get("client-2").is_some());
    }

    #[test]
    fn rename_prepends_buffered_messages() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.create_local("a1", "client-1");
        tracker
            .messages_mut("client-1")
            .push(ChatMessage::user("first", Vec::new()));
        // Events for the canonical id raced ahead of TaskCreated
        tracker.note_live_event("a1", "t1");
        tracker
            .messages_mut("t1")
            .push(ChatMessage::user("second", Vec::new()));

        assert!(tracker.rename("client-1", "t1"));
        let texts: Vec<_> = tracker
            .messages("t1")
            .iter()
            .filter_map(|m| m.text())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(
            tracker.last_user_message("t1"),
            Some(("second".to_string(), Vec::new()))
        );
    }

    #[test]
    fn event_completion_is_monotonic() {
        let mut tracker = TaskHierarchyTracker::new();
        tracker.ensure("a1", "t1");
        assert!(tracker.mark_completed("t1", CompletionSource::History));
        assert!(tracker.mark_completed("t1", CompletionSource::Event));
        assert!(!tracker.mark_completed("t1", CompletionSource::History));
        assert_eq!(
            tracker.get("t1").and_then(|t| t.completion),
            Some(CompletionSource::Event)
        );
    }
}
