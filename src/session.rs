//! Per-conversation plan state
//!
//! A [`Session`] owns one conversation's tree together with its pointers, counters, caches
//! and prompts. Every core operation takes the session it acts on explicitly, so several
//! conversations can live in one process.

use chrono::Utc;
use tracing::info;

use crate::injection::Injection;
use crate::models::{
    ActiveTask, CompletionRecord, DistilledContext, PlanError, Settings, SettingsUpdate,
    StatEvent, Statistics, TaskError, TaskId, TaskNode, TaskSeed, TaskSummary, TaskTree,
    TaskTreeNode, TransitionLog, TransitionLogEntry, NEW_TASK_DESCRIPTION, ROOT_ID,
};
use crate::prompts::{default_prompts, PromptKind, PromptSet, DEFAULT_PROMPT_SET};

/// Most recent completions kept in the history
pub const MAX_COMPLETION_HISTORY: usize = 100;

#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) conversation_id: String,
    pub(crate) tree: TaskTree,
    pub(crate) objective_id: TaskId,
    pub(crate) active_task_id: Option<TaskId>,
    pub(crate) check_counter: i64,
    pub(crate) injection_counter: u32,
    pub(crate) last_message_was_swipe: bool,
    pub(crate) check_in_flight: Option<TaskId>,
    pub(crate) settings: Settings,
    pub(crate) prompts: PromptSet,
    pub(crate) selected_prompt_set: String,
    pub(crate) recently_completed: Vec<TaskSummary>,
    pub(crate) upcoming: Vec<TaskSummary>,
    pub(crate) completion_history: Vec<CompletionRecord>,
    pub(crate) statistics: Statistics,
    pub(crate) injection: Injection,
    pub(crate) history: TransitionLog,
    pub(crate) stat_events: Vec<StatEvent>,
}

impl Session {
    /// Creates a fresh session holding a single empty root
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let settings = Settings::default();
        Self {
            conversation_id: conversation_id.into(),
            tree: TaskTree::default(),
            objective_id: ROOT_ID,
            active_task_id: None,
            check_counter: i64::from(settings.check_frequency),
            injection_counter: 0,
            last_message_was_swipe: false,
            check_in_flight: None,
            settings,
            prompts: default_prompts(),
            selected_prompt_set: DEFAULT_PROMPT_SET.to_string(),
            recently_completed: Vec::new(),
            upcoming: Vec::new(),
            completion_history: Vec::new(),
            statistics: Statistics::default(),
            injection: Injection::cleared(),
            history: TransitionLog::default(),
            stat_events: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    /// The current objective, falling back to the root if the pointer went stale
    pub fn objective(&self) -> &TaskNode {
        self.tree
            .find(self.objective_id)
            .unwrap_or_else(|_| self.tree.root())
    }

    pub fn active_task(&self) -> Option<&TaskNode> {
        self.active_task_id.and_then(|id| self.tree.find(id).ok())
    }

    pub fn check_counter(&self) -> i64 {
        self.check_counter
    }

    pub fn injection_counter(&self) -> u32 {
        self.injection_counter
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    pub fn selected_prompt_set(&self) -> &str {
        &self.selected_prompt_set
    }

    pub fn recently_completed(&self) -> &[TaskSummary] {
        &self.recently_completed
    }

    pub fn upcoming(&self) -> &[TaskSummary] {
        &self.upcoming
    }

    pub fn completion_history(&self) -> &[CompletionRecord] {
        &self.completion_history
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn injection(&self) -> &Injection {
        &self.injection
    }

    pub fn history(&self) -> Vec<TransitionLogEntry> {
        self.history.entries()
    }

    pub(crate) fn log_transition(&mut self, action: &str, details: Option<String>) {
        info!(
            conversation = %self.conversation_id,
            action,
            details = details.as_deref().unwrap_or(""),
            "Plan transition"
        );
        self.history.push(action, details);
    }

    pub(crate) fn emit(&mut self, event: StatEvent) {
        self.statistics.record(&event);
        self.stat_events.push(event);
    }

    /// Hands over statistic events produced since the last call
    pub(crate) fn drain_stat_events(&mut self) -> Vec<StatEvent> {
        std::mem::take(&mut self.stat_events)
    }

    /// Ring, history and statistics bookkeeping for a task that just became complete
    pub(crate) fn record_completion(&mut self, id: TaskId) {
        let Ok(node) = self.tree.find(id) else {
            return;
        };
        let summary = TaskSummary::from(node);
        let at = summary.completion_date.unwrap_or_else(Utc::now);
        let record = CompletionRecord {
            id,
            description: summary.description.clone(),
            completion_date: at,
            objective_description: self.objective().description().to_string(),
        };

        self.recently_completed.retain(|t| t.id != id);
        self.recently_completed.insert(0, summary);
        self.recently_completed
            .truncate(self.settings.completed_cap());

        self.completion_history.push(record);
        if self.completion_history.len() > MAX_COMPLETION_HISTORY {
            let excess = self.completion_history.len() - MAX_COMPLETION_HISTORY;
            self.completion_history.drain(..excess);
        }

        self.emit(StatEvent::TaskCompleted { at });
        let objective = self.objective();
        if !objective.is_leaf() && objective.children().iter().all(TaskNode::is_completed) {
            self.emit(StatEvent::ObjectiveCompleted);
        }
    }

    /// Adds a task under `parent` (default: the current objective)
    pub fn add_task(
        &mut self,
        parent: Option<TaskId>,
        description: String,
        index: Option<usize>,
    ) -> Result<TaskId, PlanError> {
        let parent = parent.unwrap_or(self.objective_id);
        let id = self.tree.add_child(parent, description, index)?;
        self.emit(StatEvent::TaskCreated);
        self.log_transition("add_task", Some(format!("{} under {}", id, parent)));
        self.reresolve_active();
        Ok(id)
    }

    /// Inserts a "New Task" right after `id` among its siblings
    pub fn add_task_after(&mut self, id: TaskId) -> Result<TaskId, PlanError> {
        let index = self.tree.index_in_parent(id)?;
        let parent = self.tree.parent_of(id)?.id();
        self.add_task(Some(parent), NEW_TASK_DESCRIPTION.to_string(), Some(index + 1))
    }

    /// Removes a task and its subtree. Tasks with subtasks need `confirmed`.
    pub fn remove_task(&mut self, id: TaskId, confirmed: bool) -> Result<TaskNode, PlanError> {
        let node = self.tree.find(id)?;
        if !node.is_leaf() && !confirmed {
            return Err(PlanError::ConfirmationRequired(format!(
                "deleting task {} with subtasks",
                id
            )));
        }
        let removed = self.tree.remove(id)?;

        if !self.tree.contains(self.objective_id) {
            self.objective_id = ROOT_ID;
        }
        let tree = &self.tree;
        self.recently_completed.retain(|t| tree.contains(t.id));
        self.log_transition(
            "remove_task",
            Some(format!("{} '{}'", id, removed.description())),
        );

        let active_removed = self
            .active_task_id
            .is_some_and(|active| !self.tree.contains(active));
        if active_removed {
            self.set_active_task(None, true);
        } else {
            self.push_injection();
        }
        Ok(removed)
    }

    pub fn reorder_tasks(&mut self, parent: TaskId, order: &[TaskId]) -> Result<(), PlanError> {
        self.tree.reorder(parent, order)?;
        self.log_transition("reorder", Some(format!("children of {}", parent)));
        self.push_injection();
        Ok(())
    }

    /// Bulk completion toggle used by the task list checkbox.
    ///
    /// Checking adds the task to the ring, history and statistics and advances to the next
    /// incomplete task. Unchecking drops it from the ring and makes it active. Returns
    /// whether the task's state changed.
    pub fn set_completed(&mut self, id: TaskId, completed: bool) -> Result<bool, PlanError> {
        let was_completed = self.tree.set_completed(id, completed)?;
        let changed = was_completed != completed;

        match (was_completed, completed) {
            (false, true) => {
                self.log_transition("complete", Some(id.to_string()));
                self.record_completion(id);
                let next = self.next_incomplete_id().or(Some(id));
                self.set_active_task(next, true);
            }
            (true, false) => {
                self.log_transition("uncomplete", Some(id.to_string()));
                self.recently_completed.retain(|t| t.id != id);
                self.set_active_task(Some(id), true);
            }
            _ => {}
        }
        Ok(changed)
    }

    pub fn set_description(&mut self, id: TaskId, description: String) -> Result<(), PlanError> {
        self.tree.find_mut(id)?.set_description(description);
        self.log_transition("describe", Some(id.to_string()));
        self.push_injection();
        Ok(())
    }

    pub fn set_objective_description(&mut self, description: String) -> Result<(), PlanError> {
        self.set_description(self.objective_id, description)
    }

    /// Sets the duration gate. Zero disables gating and resets the elapsed counter.
    pub fn set_duration(&mut self, id: TaskId, duration: u32) -> Result<(), PlanError> {
        let node = self.non_root_mut(id)?;
        node.set_duration(duration);
        self.log_transition("duration", Some(format!("{} = {}", id, duration)));
        Ok(())
    }

    pub fn reset_elapsed(&mut self, id: TaskId) -> Result<(), PlanError> {
        self.non_root_mut(id)?.reset_elapsed();
        self.log_transition("reset_elapsed", Some(id.to_string()));
        Ok(())
    }

    fn non_root_mut(&mut self, id: TaskId) -> Result<&mut TaskNode, PlanError> {
        if id == self.tree.root().id() {
            return Err(TaskError::RootImmutable.into());
        }
        Ok(self.tree.find_mut(id)?)
    }

    /// Makes `id` the current objective and activates its next incomplete task
    pub fn branch(&mut self, id: TaskId) -> Result<(), PlanError> {
        let node = self.tree.find(id)?;
        let next = crate::navigator::next_incomplete(node)
            .map(TaskNode::id)
            .unwrap_or(id);
        self.objective_id = id;
        self.log_transition("branch", Some(id.to_string()));
        self.set_active_task(Some(next), true);
        Ok(())
    }

    /// Moves the objective pointer to its parent. Returns `false` at the root.
    pub fn ascend(&mut self) -> Result<bool, PlanError> {
        let objective = self.objective();
        let Some(parent) = objective.parent_id() else {
            return Ok(false);
        };
        self.objective_id = self.tree.find(parent)?.id();
        self.log_transition("ascend", Some(parent.to_string()));
        self.set_active_task(None, true);
        Ok(true)
    }

    /// Removes every task of the current objective
    pub fn clear_tasks(&mut self, confirmed: bool) -> Result<usize, PlanError> {
        if !confirmed {
            return Err(PlanError::ConfirmationRequired(
                "clearing all tasks".to_string(),
            ));
        }
        let removed = self.tree.clear_children(self.objective_id)?;
        self.recently_completed.clear();
        self.log_transition("clear_tasks", Some(format!("{} removed", removed.len())));
        self.set_active_task(None, true);
        Ok(removed.len())
    }

    pub fn purge_recently_completed(&mut self, confirmed: bool) -> Result<(), PlanError> {
        if !confirmed {
            return Err(PlanError::ConfirmationRequired(
                "purging recently completed tasks".to_string(),
            ));
        }
        self.recently_completed.clear();
        self.log_transition("purge_completed", None);
        self.push_injection();
        Ok(())
    }

    pub fn purge_upcoming(&mut self, confirmed: bool) -> Result<(), PlanError> {
        if !confirmed {
            return Err(PlanError::ConfirmationRequired(
                "purging upcoming tasks".to_string(),
            ));
        }
        self.upcoming.clear();
        self.log_transition("purge_upcoming", None);
        Ok(())
    }

    /// Applies a partial settings change and re-pushes the injected block
    pub fn update_settings(&mut self, update: SettingsUpdate) -> Result<(), PlanError> {
        let s = &mut self.settings;
        if let Some(v) = update.chat_depth {
            s.chat_depth = v;
        }
        if let Some(v) = update.check_frequency {
            s.check_frequency = v;
            self.check_counter = i64::from(v);
        }
        if let Some(v) = update.swipes_decrement {
            s.swipes_decrement = v;
        }
        if let Some(v) = update.injection_frequency {
            s.injection_frequency = v;
            self.injection_counter = 0;
        }
        if let Some(v) = update.prompt_role {
            s.prompt_role = v;
        }
        if let Some(v) = update.show_completed_tasks {
            s.show_completed_tasks = v;
        }
        if let Some(v) = update.completed_tasks_count {
            s.completed_tasks_count = v;
            let cap = s.completed_cap();
            self.recently_completed.truncate(cap);
        }
        if let Some(v) = update.show_upcoming_tasks {
            s.show_upcoming_tasks = v;
        }
        if let Some(v) = update.upcoming_tasks_count {
            s.upcoming_tasks_count = v;
        }
        if let Some(v) = update.hide_tasks {
            s.hide_tasks = v;
        }
        self.log_transition("settings", None);
        self.push_injection();
        Ok(())
    }

    /// Edits one template of the session's prompts
    pub fn set_prompt(&mut self, kind: PromptKind, text: String) -> Result<(), PlanError> {
        self.prompts.set(kind, text);
        self.prompts.backfill();
        self.log_transition("prompt", Some(kind.to_string()));
        self.push_injection();
        Ok(())
    }

    /// Replaces the session's prompts with a library set
    pub(crate) fn use_prompt_set(&mut self, name: &str, mut prompts: PromptSet) {
        prompts.backfill();
        self.prompts = prompts;
        self.selected_prompt_set = name.to_string();
        self.log_transition("select_prompts", Some(name.to_string()));
        self.push_injection();
    }

    /// Replaces the objective's children with fresh nodes built from seeds.
    ///
    /// Requires `confirmed` when the objective already has children.
    pub(crate) fn replace_tasks(
        &mut self,
        description: Option<String>,
        seeds: &[TaskSeed],
        confirmed: bool,
    ) -> Result<Vec<TaskId>, PlanError> {
        let objective = self.objective_id;
        if !self.tree.find(objective)?.is_leaf() && !confirmed {
            return Err(PlanError::ConfirmationRequired(
                "replacing existing tasks".to_string(),
            ));
        }
        self.tree.clear_children(objective)?;
        if let Some(description) = description.filter(|d| !d.trim().is_empty()) {
            self.tree.find_mut(objective)?.set_description(description);
        }
        let created = self.tree.graft(objective, seeds)?;
        self.recently_completed.clear();
        self.log_transition("replace_tasks", Some(format!("{} tasks", created.len())));
        self.set_active_task(None, true);
        Ok(created)
    }

    /// Conversation switch: counters and flags reset, block re-pushed
    pub(crate) fn on_switch(&mut self) {
        self.last_message_was_swipe = false;
        self.check_in_flight = None;
        let active = self.active_task_id;
        self.restore_active_task(active);
    }

    pub fn distilled_context(&self) -> DistilledContext {
        let objective = self.objective();
        let active = self.active_task().map(|task| ActiveTask {
            id: task.id(),
            description: task.description().to_string(),
            completed: task.is_completed(),
            duration: task.duration(),
            elapsed_messages: task.elapsed_messages(),
            parent: self.template_context().parent.map(str::to_string),
        });
        let task_list = objective
            .children()
            .iter()
            .map(|child| TaskTreeNode {
                id: child.id(),
                description: child.description().to_string(),
                completed: child.is_completed(),
                is_active: Some(child.id()) == self.active_task_id,
                child_count: child.children().len(),
                duration: child.duration(),
                elapsed_messages: child.elapsed_messages(),
            })
            .collect();

        DistilledContext {
            conversation_id: self.conversation_id.clone(),
            objective: TaskSummary::from(objective),
            active_task: active,
            task_list,
            check_counter: self.check_counter,
            injection_counter: self.injection_counter,
            injection: self.injection.text.clone(),
            recently_completed: self.recently_completed.clone(),
            upcoming: self.upcoming.clone(),
            selected_prompt_set: self.selected_prompt_set.clone(),
            transition_history: self.history.entries(),
        }
    }
}
