//! Core models for the superobjective library
//!
//! This module contains the task tree and the data types shared by the completion engine,
//! the injection scheduler and the persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::navigator;

/// Identifier of a task, unique across the whole tree
pub type TaskId = u64;

/// Id reserved for the tree root
pub const ROOT_ID: TaskId = 0;

/// Description given to tasks added from the editor without text
pub const NEW_TASK_DESCRIPTION: &str = "New Task";

/// A node in the objective/task tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    id: TaskId,
    #[serde(default)]
    description: String,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    completion_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_parent_id")]
    parent_id: Option<TaskId>,
    #[serde(default)]
    children: Vec<TaskNode>,
    #[serde(default)]
    duration: u32,
    #[serde(default)]
    elapsed_messages: u32,
}

/// Accepts `null`, `""`, a number, or a numeric string for the parent link.
fn deserialize_parent_id<'de, D>(deserializer: D) -> Result<Option<TaskId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawParent {
        Id(TaskId),
        Text(String),
    }

    match Option::<RawParent>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawParent::Id(id)) => Ok(Some(id)),
        Some(RawParent::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(RawParent::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl TaskNode {
    /// Creates a new, incomplete task
    pub fn new(id: TaskId, description: impl Into<String>, parent_id: Option<TaskId>) -> Self {
        Self {
            id,
            description: description.into(),
            completed: false,
            completion_date: None,
            parent_id,
            children: Vec::new(),
            duration: 0,
            elapsed_messages: 0,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn completion_date(&self) -> Option<DateTime<Utc>> {
        self.completion_date
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.parent_id
    }

    pub fn children(&self) -> &[TaskNode] {
        &self.children
    }

    pub fn duration(&self) -> u32 {
        self.duration
    }

    pub fn elapsed_messages(&self) -> u32 {
        self.elapsed_messages
    }

    /// True for the node without a parent
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the duration gate still blocks automated completion
    pub fn is_gated(&self) -> bool {
        self.duration > 0 && self.elapsed_messages < self.duration
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<TaskNode> {
        &mut self.children
    }

    pub(crate) fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub(crate) fn set_duration(&mut self, duration: u32) {
        self.duration = duration;
        if duration == 0 {
            self.elapsed_messages = 0;
        }
    }

    pub(crate) fn reset_elapsed(&mut self) {
        self.elapsed_messages = 0;
    }

    pub(crate) fn increment_elapsed(&mut self) {
        self.elapsed_messages = self.elapsed_messages.saturating_add(1);
    }

    /// Sets the flag alone, stamping the completion date on the first transition to true.
    pub(crate) fn set_completed_flag(&mut self, completed: bool) {
        if completed && self.completion_date.is_none() {
            self.completion_date = Some(Utc::now());
        }
        self.completed = completed;
    }

    /// Applies `completed` to this node and every descendant.
    pub(crate) fn set_completed_recursive(&mut self, completed: bool) {
        self.set_completed_flag(completed);
        for child in &mut self.children {
            child.set_completed_recursive(completed);
        }
    }

    fn all_children_completed(&self) -> bool {
        !self.children.is_empty() && self.children.iter().all(|c| c.completed)
    }

    fn relink(&mut self, parent_id: Option<TaskId>) {
        self.parent_id = parent_id;
        let id = self.id;
        for child in &mut self.children {
            child.relink(Some(id));
        }
    }

    /// Builds a seed copy of this node's children with completion cleared
    pub fn to_seeds(&self, keep_completion: bool) -> Vec<TaskSeed> {
        self.children
            .iter()
            .map(|child| TaskSeed {
                description: child.description.clone(),
                completed: keep_completion && child.completed,
                children: child.to_seeds(keep_completion),
            })
            .collect()
    }
}

/// A task without identity, used by templates and imports
///
/// Unknown fields in imported documents are ignored, so full node records can be read as
/// seeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSeed {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub children: Vec<TaskSeed>,
}

impl TaskSeed {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            completed: false,
            children: Vec::new(),
        }
    }
}

/// Failures raised by tree lookups and mutations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task id is missing")]
    MissingId,
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("parent of task {0} could not be resolved")]
    ParentNotFound(TaskId),
    #[error("the root task cannot be modified this way")]
    RootImmutable,
    #[error("new child order for task {0} is not a permutation of its children")]
    ReorderMismatch(TaskId),
    #[error("index {index} is out of bounds for task {parent} with {len} children")]
    IndexOutOfBounds {
        parent: TaskId,
        index: usize,
        len: usize,
    },
}

/// Failures surfaced by plan operations
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("there is no active task")]
    NoActiveTask,
    #[error("{0} requires confirmation")]
    ConfirmationRequired(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("{0} not found")]
    Missing(String),
    #[error("{0}")]
    Invalid(String),
    #[error("generation failed: {0}")]
    Generation(#[from] crate::generation::GenerationError),
    #[error("import failed: {0}")]
    Import(#[from] crate::library::ImportError),
    #[error("storage failed: {0}")]
    Store(#[from] crate::persistence::StoreError),
}

/// A rooted, ordered task tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskTree {
    root: TaskNode,
}

impl Default for TaskTree {
    fn default() -> Self {
        Self::new("")
    }
}

impl TaskTree {
    /// Creates a tree holding only a root with the given description
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            root: TaskNode::new(ROOT_ID, description, None),
        }
    }

    /// Wraps an existing root, repairing child parent links
    pub fn from_root(mut root: TaskNode) -> Self {
        root.relink(None);
        Self { root }
    }

    pub fn root(&self) -> &TaskNode {
        &self.root
    }

    pub fn into_root(self) -> TaskNode {
        self.root
    }

    pub fn contains(&self, id: TaskId) -> bool {
        navigator::find(&self.root, id).is_some()
    }

    pub fn find(&self, id: TaskId) -> Result<&TaskNode, TaskError> {
        navigator::find(&self.root, id).ok_or(TaskError::NotFound(id))
    }

    pub(crate) fn find_mut(&mut self, id: TaskId) -> Result<&mut TaskNode, TaskError> {
        navigator::find_mut(&mut self.root, id).ok_or(TaskError::NotFound(id))
    }

    /// Looks up an optional id, distinguishing a missing id from an unknown one
    pub fn lookup(&self, id: Option<TaskId>) -> Result<&TaskNode, TaskError> {
        self.find(id.ok_or(TaskError::MissingId)?)
    }

    pub fn parent_of(&self, id: TaskId) -> Result<&TaskNode, TaskError> {
        let node = self.find(id)?;
        let parent_id = node.parent_id().ok_or(TaskError::RootImmutable)?;
        navigator::find(&self.root, parent_id)
            .filter(|parent| parent.children().iter().any(|c| c.id() == id))
            .ok_or(TaskError::ParentNotFound(id))
    }

    /// Position of the node among its parent's children
    pub fn index_in_parent(&self, id: TaskId) -> Result<usize, TaskError> {
        let parent = self.parent_of(id)?;
        parent
            .children()
            .iter()
            .position(|c| c.id() == id)
            .ok_or(TaskError::ParentNotFound(id))
    }

    fn next_id(&self) -> TaskId {
        navigator::max_id(&self.root) + 1
    }

    /// Inserts a new task under `parent` at `index` (default: end) and returns its id.
    ///
    /// The completion state of ancestors is left untouched.
    pub fn add_child(
        &mut self,
        parent: TaskId,
        description: impl Into<String>,
        index: Option<usize>,
    ) -> Result<TaskId, TaskError> {
        let id = self.next_id();
        let parent_node = self.find_mut(parent)?;
        let len = parent_node.children.len();
        let index = index.unwrap_or(len);
        if index > len {
            return Err(TaskError::IndexOutOfBounds { parent, index, len });
        }
        parent_node
            .children
            .insert(index, TaskNode::new(id, description, Some(parent)));
        Ok(id)
    }

    /// Appends seeds as fresh nodes under `parent`, returning the ids of the top-level nodes
    pub fn graft(&mut self, parent: TaskId, seeds: &[TaskSeed]) -> Result<Vec<TaskId>, TaskError> {
        let mut next = self.next_id();
        let parent_node = self.find_mut(parent)?;
        let mut created = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let node = build_from_seed(seed, parent, &mut next);
            created.push(node.id);
            parent_node.children.push(node);
        }
        Ok(created)
    }

    /// Removes the node and its subtree. The root can never be removed.
    pub fn remove(&mut self, id: TaskId) -> Result<TaskNode, TaskError> {
        if id == self.root.id {
            return Err(TaskError::RootImmutable);
        }
        let index = self.index_in_parent(id)?;
        let parent_id = self.parent_of(id)?.id();
        let parent = self.find_mut(parent_id)?;
        let removed = parent.children.remove(index);
        if !parent.children.is_empty() {
            self.refresh_ancestors_from(parent_id);
        }
        Ok(removed)
    }

    /// Removes every child of `parent`
    pub fn clear_children(&mut self, parent: TaskId) -> Result<Vec<TaskNode>, TaskError> {
        let node = self.find_mut(parent)?;
        Ok(std::mem::take(&mut node.children))
    }

    /// Replaces the children of `parent` with a permutation of the same ids
    pub fn reorder(&mut self, parent: TaskId, order: &[TaskId]) -> Result<(), TaskError> {
        let node = self.find_mut(parent)?;
        let mut current: Vec<TaskId> = node.children.iter().map(|c| c.id).collect();
        let mut requested = order.to_vec();
        current.sort_unstable();
        requested.sort_unstable();
        if current != requested {
            return Err(TaskError::ReorderMismatch(parent));
        }

        let mut pool = std::mem::take(&mut node.children);
        let mut reordered = Vec::with_capacity(pool.len());
        for id in order {
            if let Some(pos) = pool.iter().position(|c| c.id == *id) {
                reordered.push(pool.swap_remove(pos));
            }
        }
        node.children = reordered;
        Ok(())
    }

    /// Bulk toggle: applies `completed` to the node and all descendants, then recomputes
    /// ancestors. Returns the previous state of the node.
    pub fn set_completed(&mut self, id: TaskId, completed: bool) -> Result<bool, TaskError> {
        if id == self.root.id {
            return Err(TaskError::RootImmutable);
        }
        let node = self.find_mut(id)?;
        let previous = node.completed;
        node.set_completed_recursive(completed);
        self.refresh_ancestors(id);
        Ok(previous)
    }

    /// Single-task completion transition. Descendants are not touched.
    ///
    /// Returns `false` when the task was already complete, leaving it unchanged.
    pub fn complete(&mut self, id: TaskId) -> Result<bool, TaskError> {
        if id == self.root.id {
            return Err(TaskError::RootImmutable);
        }
        let node = self.find_mut(id)?;
        if node.completed {
            return Ok(false);
        }
        node.completed = true;
        node.completion_date = Some(Utc::now());
        node.elapsed_messages = 0;
        self.refresh_ancestors(id);
        Ok(true)
    }

    /// Recomputes completion of every ancestor of `id`
    fn refresh_ancestors(&mut self, id: TaskId) {
        if let Ok(parent_id) = self.parent_of(id).map(TaskNode::id) {
            self.refresh_ancestors_from(parent_id);
        }
    }

    /// Recomputes `id` from its children and walks upward while states keep changing
    fn refresh_ancestors_from(&mut self, id: TaskId) {
        let mut current = Some(id);
        while let Some(id) = current {
            let Ok(node) = self.find_mut(id) else {
                return;
            };
            if node.children.is_empty() {
                return;
            }
            let completed = node.all_children_completed();
            if node.completed == completed {
                return;
            }
            node.set_completed_flag(completed);
            current = node.parent_id;
        }
    }

    /// Number of non-root tasks
    pub fn count_tasks(&self) -> usize {
        navigator::count_nodes(&self.root) - 1
    }

    /// Number of completed non-root tasks
    pub fn count_completed(&self) -> usize {
        fn walk(node: &TaskNode) -> usize {
            node.children
                .iter()
                .map(|c| usize::from(c.completed) + walk(c))
                .sum()
        }
        walk(&self.root)
    }
}

fn build_from_seed(seed: &TaskSeed, parent: TaskId, next: &mut TaskId) -> TaskNode {
    let id = *next;
    *next += 1;
    let mut node = TaskNode::new(id, seed.description.clone(), Some(parent));
    node.completed = seed.completed;
    if seed.completed {
        node.completion_date = Some(Utc::now());
    }
    node.children = seed
        .children
        .iter()
        .map(|child| build_from_seed(child, id, next))
        .collect();
    node
}

/// Id, description and completion date of a task, used by the derived caches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<DateTime<Utc>>,
}

impl From<&TaskNode> for TaskSummary {
    fn from(node: &TaskNode) -> Self {
        Self {
            id: node.id(),
            description: node.description().to_string(),
            completion_date: node.completion_date(),
        }
    }
}

/// One entry in the completion history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub id: TaskId,
    pub description: String,
    pub completion_date: DateTime<Utc>,
    #[serde(default)]
    pub objective_description: String,
}

/// Counters describing progress, kept per conversation and globally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
    pub tasks_completed: u64,
    pub tasks_created: u64,
    pub objectives_completed: u64,
    pub last_completion_date: Option<DateTime<Utc>>,
}

impl Statistics {
    pub(crate) fn record(&mut self, event: &StatEvent) {
        match event {
            StatEvent::TaskCreated => self.tasks_created += 1,
            StatEvent::TaskCompleted { at } => {
                self.tasks_completed += 1;
                self.last_completion_date = Some(*at);
            }
            StatEvent::ObjectiveCompleted => self.objectives_completed += 1,
        }
    }
}

/// Statistic changes produced by a session and mirrored into the global counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatEvent {
    TaskCreated,
    TaskCompleted { at: DateTime<Utc> },
    ObjectiveCompleted,
}

/// Role the injected block is attributed to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    #[default]
    System,
    User,
    Assistant,
}

impl<'de> Deserialize<'de> for PromptRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawRole {
            Index(u64),
            Name(String),
        }

        match RawRole::deserialize(deserializer)? {
            RawRole::Index(0) => Ok(PromptRole::System),
            RawRole::Index(1) => Ok(PromptRole::User),
            RawRole::Index(2) => Ok(PromptRole::Assistant),
            RawRole::Index(other) => Err(serde::de::Error::custom(format!(
                "unknown prompt role index {}",
                other
            ))),
            RawRole::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

impl std::str::FromStr for PromptRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" | "0" => Ok(PromptRole::System),
            "user" | "1" => Ok(PromptRole::User),
            "assistant" | "2" => Ok(PromptRole::Assistant),
            other => Err(format!("unknown prompt role '{}'", other)),
        }
    }
}

impl fmt::Display for PromptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromptRole::System => "system",
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        };
        f.write_str(name)
    }
}

/// Reads counts stored either as numbers or as numeric strings
fn deserialize_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawCount {
        Number(u32),
        Text(String),
    }

    match RawCount::deserialize(deserializer)? {
        RawCount::Number(n) => Ok(n),
        RawCount::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Per-conversation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// How many turns back the injected block is placed
    #[serde(deserialize_with = "deserialize_count")]
    pub chat_depth: u32,
    /// Turns between automated completion checks; 0 disables checks
    #[serde(deserialize_with = "deserialize_count")]
    pub check_frequency: u32,
    /// Whether swipes count towards the check countdown
    pub swipes_decrement: bool,
    /// Turns between injections
    #[serde(deserialize_with = "deserialize_count")]
    pub injection_frequency: u32,
    pub prompt_role: PromptRole,
    pub show_completed_tasks: bool,
    #[serde(deserialize_with = "deserialize_count")]
    pub completed_tasks_count: u32,
    pub show_upcoming_tasks: bool,
    #[serde(deserialize_with = "deserialize_count")]
    pub upcoming_tasks_count: u32,
    /// Presentation flag only
    pub hide_tasks: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chat_depth: 2,
            check_frequency: 3,
            swipes_decrement: false,
            injection_frequency: 1,
            prompt_role: PromptRole::System,
            show_completed_tasks: false,
            completed_tasks_count: 3,
            show_upcoming_tasks: false,
            upcoming_tasks_count: 3,
            hide_tasks: false,
        }
    }
}

impl Settings {
    /// Capacity of the recently-completed ring; zero falls back to the default
    pub fn completed_cap(&self) -> usize {
        match self.completed_tasks_count {
            0 => 3,
            n => n as usize,
        }
    }

    pub fn upcoming_cap(&self) -> usize {
        match self.upcoming_tasks_count {
            0 => 3,
            n => n as usize,
        }
    }

    /// Injection frequency, never below one
    pub fn injection_period(&self) -> u32 {
        self.injection_frequency.max(1)
    }
}

/// A partial settings change; absent fields are left as they are
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsUpdate {
    pub chat_depth: Option<u32>,
    pub check_frequency: Option<u32>,
    pub swipes_decrement: Option<bool>,
    pub injection_frequency: Option<u32>,
    pub prompt_role: Option<PromptRole>,
    pub show_completed_tasks: Option<bool>,
    pub completed_tasks_count: Option<u32>,
    pub show_upcoming_tasks: Option<bool>,
    pub upcoming_tasks_count: Option<u32>,
    pub hide_tasks: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == SettingsUpdate::default()
    }
}

/// Represents a single state transition event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: Option<String>,
}

impl TransitionLogEntry {
    pub fn new(action: String, details: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            details,
        }
    }
}

/// Bounded log of recent transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionLog {
    entries: VecDeque<TransitionLogEntry>,
}

pub const MAX_HISTORY_SIZE: usize = 20;

impl TransitionLog {
    pub fn push(&mut self, action: impl Into<String>, details: Option<String>) {
        if self.entries.len() == MAX_HISTORY_SIZE {
            self.entries.pop_front();
        }
        self.entries
            .push_back(TransitionLogEntry::new(action.into(), details));
    }

    pub fn entries(&self) -> Vec<TransitionLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&TransitionLogEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse<T> {
    pub res: T,
    pub distilled_context: DistilledContext,
}

impl<T> PlanResponse<T> {
    pub fn new(res: T, distilled_context: DistilledContext) -> Self {
        Self {
            res,
            distilled_context,
        }
    }

    pub fn inner(&self) -> &T {
        &self.res
    }

    pub fn into_inner(self) -> T {
        self.res
    }

    pub fn replace<B>(self, res: B) -> PlanResponse<B> {
        PlanResponse {
            res,
            distilled_context: self.distilled_context,
        }
    }

    pub fn context(self) -> DistilledContext {
        self.distilled_context
    }
}

/// The active task as shown to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub id: TaskId,
    pub description: String,
    pub completed: bool,
    pub duration: u32,
    pub elapsed_messages: u32,
    pub parent: Option<String>,
}

/// Distilled context containing focused information about a conversation's plan
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct DistilledContext {
    pub conversation_id: String,
    /// The node whose children are currently being worked through
    pub objective: TaskSummary,
    pub active_task: Option<ActiveTask>,
    /// Direct children of the objective, one level deep
    pub task_list: Vec<TaskTreeNode>,
    pub check_counter: i64,
    pub injection_counter: u32,
    /// Text currently held in the injection slot; empty when cleared
    pub injection: String,
    pub recently_completed: Vec<TaskSummary>,
    pub upcoming: Vec<TaskSummary>,
    pub selected_prompt_set: String,
    /// Recent state transition history
    pub transition_history: Vec<TransitionLogEntry>,
}

/// A node in the task list for the distilled context
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct TaskTreeNode {
    pub id: TaskId,
    pub description: String,
    pub completed: bool,
    pub is_active: bool,
    pub child_count: usize,
    pub duration: u32,
    pub elapsed_messages: u32,
}
