//! Activation of the active task and the injected context block
//!
//! The block is only present in the host's slot on turns where it is due; on every other
//! turn the slot is explicitly cleared.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{PromptRole, TaskId, TaskNode, TaskSummary};
use crate::navigator;
use crate::session::Session;
use crate::template::{self, TemplateContext};

/// Key under which the block is registered with the host, so each push replaces the last
pub const INJECTION_KEY: &str = "superobjective";

/// Where the block is placed in the generation request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Slot cleared
    #[default]
    None,
    /// Inside the conversation, `depth` turns back
    InChat,
}

/// Contents of the host's prompt-injection slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Injection {
    pub key: String,
    pub text: String,
    pub placement: Placement,
    pub depth: u32,
    pub role: PromptRole,
}

impl Default for Injection {
    fn default() -> Self {
        Self::cleared()
    }
}

impl Injection {
    pub fn cleared() -> Self {
        Self {
            key: INJECTION_KEY.to_string(),
            text: String::new(),
            placement: Placement::None,
            depth: 0,
            role: PromptRole::System,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl Session {
    /// Points the session at a task and updates the injection slot.
    ///
    /// `None` (or an id that no longer resolves) selects the next incomplete task of the
    /// whole tree. A changed id resets the task's elapsed counter and the injection
    /// countdown, and always pushes a fresh block. Otherwise the block is pushed when
    /// `repush` is set and cleared when it is not. Returns whether the active task changed.
    pub(crate) fn set_active_task(&mut self, requested: Option<TaskId>, repush: bool) -> bool {
        let previous = self.active_task_id;
        let resolved = self.resolve_task(requested);
        let changed = resolved != previous;
        self.active_task_id = resolved;

        if changed {
            if let Some(node) = resolved.and_then(|id| self.tree.find_mut(id).ok()) {
                node.reset_elapsed();
            }
            self.injection_counter = 0;
            let details = self
                .active_task()
                .map(|t| format!("{} '{}'", t.id(), t.description()));
            self.log_transition("activate", details);
        }

        if changed || repush {
            self.push_injection();
        } else {
            self.clear_injection();
        }
        changed
    }

    /// Re-resolves a persisted active id without touching elapsed counters and pushes the
    /// block unconditionally.
    pub(crate) fn restore_active_task(&mut self, persisted: Option<TaskId>) {
        self.active_task_id = self.resolve_task(persisted);
        self.injection_counter = 0;
        self.push_injection();
    }

    /// Keeps the current task if it is still open, otherwise moves to the next incomplete one
    pub(crate) fn reresolve_active(&mut self) {
        let keep = self
            .active_task()
            .filter(|task| !task.is_completed())
            .map(TaskNode::id);
        self.set_active_task(keep, true);
    }

    fn resolve_task(&self, requested: Option<TaskId>) -> Option<TaskId> {
        match requested {
            Some(id) if self.tree.contains(id) => Some(id),
            Some(id) => {
                warn!(
                    conversation = %self.conversation_id,
                    task_id = id,
                    "Task not found, falling back to next incomplete task"
                );
                self.next_incomplete_id()
            }
            None => self.next_incomplete_id(),
        }
    }

    pub(crate) fn next_incomplete_id(&self) -> Option<TaskId> {
        navigator::next_incomplete(self.tree.root()).map(TaskNode::id)
    }

    /// Advances the injection countdown for one turn and reports whether this turn is due
    pub(crate) fn step_injection_counter(&mut self) -> bool {
        let due = self.injection_counter == 0;
        self.injection_counter = (self.injection_counter + 1) % self.settings.injection_period();
        due
    }

    /// Builds and stores the block for the active task, or clears the slot when there is none
    pub(crate) fn push_injection(&mut self) {
        self.refresh_upcoming();

        let has_text = self
            .active_task()
            .is_some_and(|task| !task.description().trim().is_empty());
        if !has_text {
            self.clear_injection();
            return;
        }

        let text = self.render_injection_text();
        debug!(
            conversation = %self.conversation_id,
            depth = self.settings.chat_depth,
            role = %self.settings.prompt_role,
            "Pushing task injection"
        );
        self.injection = Injection {
            key: INJECTION_KEY.to_string(),
            text,
            placement: Placement::InChat,
            depth: self.settings.chat_depth,
            role: self.settings.prompt_role,
        };
    }

    pub(crate) fn clear_injection(&mut self) {
        self.injection = Injection::cleared();
    }

    fn render_injection_text(&self) -> String {
        let ctx = self.template_context();
        let mut text = template::substitute(&self.prompts.current_task, &ctx);

        if self.settings.show_completed_tasks && !self.recently_completed.is_empty() {
            text.push('\n');
            text.push_str(&template::substitute(&self.prompts.completed_tasks, &ctx));
        }

        if self.settings.show_upcoming_tasks && !self.upcoming.is_empty() {
            text.push('\n');
            text.push_str(&template::substitute(&self.prompts.upcoming_tasks, &ctx));
        }

        text
    }

    /// Template state for the active task
    pub(crate) fn template_context(&self) -> TemplateContext<'_> {
        let active = self.active_task();
        let parent = active
            .and_then(|task| navigator::ancestor_chain(self.tree.root(), task.id()))
            .and_then(|chain| chain.into_iter().nth(1))
            .map(TaskNode::description);

        TemplateContext {
            objective: Some(self.objective().description()),
            task: active.map(TaskNode::description),
            parent,
            completed: &self.recently_completed,
            upcoming: &self.upcoming,
        }
    }

    /// Rebuilds the upcoming list from the active task's later siblings, then from the
    /// remaining incomplete tasks of the whole tree.
    pub(crate) fn refresh_upcoming(&mut self) {
        self.upcoming = self.compute_upcoming();
    }

    fn compute_upcoming(&self) -> Vec<TaskSummary> {
        let Some(active) = self.active_task_id else {
            return Vec::new();
        };
        let Ok(parent) = self.tree.parent_of(active) else {
            return Vec::new();
        };
        let cap = self.settings.upcoming_cap();

        let mut upcoming: Vec<TaskSummary> = parent
            .children()
            .iter()
            .skip_while(|sibling| sibling.id() != active)
            .skip(1)
            .filter(|sibling| !sibling.is_completed())
            .take(cap)
            .map(TaskSummary::from)
            .collect();

        for node in navigator::flatten_incomplete(self.tree.root()) {
            if upcoming.len() >= cap {
                break;
            }
            if node.id() == active || upcoming.iter().any(|t| t.id == node.id()) {
                continue;
            }
            upcoming.push(TaskSummary::from(node));
        }
        upcoming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SettingsUpdate, ROOT_ID};
    use pretty_assertions::assert_eq;

    fn session_with_tasks(descriptions: &[&str]) -> (Session, Vec<TaskId>) {
        let mut session = Session::new("test");
        let ids = descriptions
            .iter()
            .map(|d| session.add_task(None, d.to_string(), None).unwrap())
            .collect();
        (session, ids)
    }

    #[test]
    fn test_activation_pushes_block_with_task_text() {
        let (session, ids) = session_with_tasks(&["Find the key", "Open the door"]);
        assert_eq!(session.active_task().unwrap().id(), ids[0]);

        let injection = session.injection();
        assert_eq!(injection.key, INJECTION_KEY);
        assert_eq!(injection.placement, Placement::InChat);
        assert_eq!(injection.depth, 2);
        assert_eq!(injection.role, PromptRole::System);
        assert_eq!(
            injection.text,
            "Your current task is [Find the key]. Balance existing roleplay with completing this task."
        );
    }

    #[test]
    fn test_no_active_task_clears_slot() {
        let mut session = Session::new("test");
        session.set_active_task(None, true);
        assert!(session.injection().is_empty());
        assert_eq!(session.injection().placement, Placement::None);
    }

    #[test]
    fn test_unchanged_task_without_repush_clears_slot() {
        let (mut session, ids) = session_with_tasks(&["A"]);
        assert!(!session.injection().is_empty());
        assert!(!session.set_active_task(Some(ids[0]), false));
        assert!(session.injection().is_empty());
    }

    #[test]
    fn test_changed_task_resets_elapsed_only_on_change() {
        let (mut session, ids) = session_with_tasks(&["A", "B"]);
        session.tree.find_mut(ids[1]).unwrap().increment_elapsed();
        session.tree.find_mut(ids[0]).unwrap().increment_elapsed();

        assert!(!session.set_active_task(Some(ids[0]), true));
        assert_eq!(session.active_task().unwrap().elapsed_messages(), 1);

        assert!(session.set_active_task(Some(ids[1]), false));
        assert_eq!(session.active_task().unwrap().elapsed_messages(), 0);
        assert!(!session.injection().is_empty());
    }

    #[test]
    fn test_unknown_id_falls_back_to_next_incomplete() {
        let (mut session, ids) = session_with_tasks(&["A", "B"]);
        session.set_active_task(Some(ids[1]), true);
        session.set_active_task(Some(404), true);
        assert_eq!(session.active_task().unwrap().id(), ids[0]);
    }

    #[test]
    fn test_injection_counter_wraps_at_frequency() {
        let (mut session, _ids) = session_with_tasks(&["A"]);
        session
            .update_settings(SettingsUpdate {
                injection_frequency: Some(3),
                ..Default::default()
            })
            .unwrap();
        let due: Vec<bool> = (0..7).map(|_| session.step_injection_counter()).collect();
        assert_eq!(due, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn test_optional_sections_are_appended() {
        let (mut session, ids) = session_with_tasks(&["A", "B", "C"]);
        session
            .update_settings(SettingsUpdate {
                show_completed_tasks: Some(true),
                show_upcoming_tasks: Some(true),
                ..Default::default()
            })
            .unwrap();
        session.mark_active_completed().unwrap();

        assert_eq!(session.active_task().unwrap().id(), ids[1]);
        let lines: Vec<&str> = session.injection().text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "Recently completed tasks: [A]");
        assert_eq!(lines[2], "Upcoming tasks: [C]");
    }

    #[test]
    fn test_upcoming_backfills_from_whole_tree() {
        let mut session = Session::new("test");
        let a = session.add_task(None, "A".to_string(), None).unwrap();
        let a1 = session.add_task(Some(a), "A1".to_string(), None).unwrap();
        let a2 = session.add_task(Some(a), "A2".to_string(), None).unwrap();
        let b = session.add_task(Some(ROOT_ID), "B".to_string(), None).unwrap();

        session.set_active_task(Some(a2), true);
        let upcoming: Vec<TaskId> = session.upcoming().iter().map(|t| t.id).collect();
        // No later siblings, so the list comes from the depth-first walk
        assert_eq!(upcoming, vec![a, a1, b]);
    }

    #[test]
    fn test_parent_placeholder_resolves_through_ancestors() {
        let mut session = Session::new("test");
        session
            .set_prompt(crate::prompts::PromptKind::CurrentTask, "{{task}} < {{parent}}".to_string())
            .unwrap();
        let a = session.add_task(None, "Explore".to_string(), None).unwrap();
        let a1 = session.add_task(Some(a), "Map the cave".to_string(), None).unwrap();
        session.set_active_task(Some(a1), true);
        assert_eq!(session.injection().text, "Map the cave < Explore");
    }
}
