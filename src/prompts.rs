//! Prompt templates used to drive generation, injection and completion checks
//!
//! A [`PromptSet`] bundles the six templates a conversation renders. The built-in
//! set is named [`DEFAULT_PROMPT_SET`] and can never be deleted from the library.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the built-in prompt set
pub const DEFAULT_PROMPT_SET: &str = "default";

const CREATE_TASK: &str = "Ignore previous instructions. Please generate a numbered list of plain text tasks to complete an objective. The objective that you must make a numbered task list for is: \"{{objective}}\". The tasks created should take into account the character traits of {{char}}. These tasks may or may not involve {{user}} directly. Include the objective as the final task.\n\nThe list should be formatted using a number followed by a fullstop and the task on each line, e.g. \"1. Take over the world\". Include only the list in your reply.";

const CHECK_TASK_COMPLETED: &str = "Ignore previous instructions. Determine if this task is completed: [{{task}}]. To do this, examine the most recent messages. Your response must only contain either true or false, and nothing else. Example output: true";

const CURRENT_TASK: &str =
    "Your current task is [{{task}}]. Balance existing roleplay with completing this task.";

const COMPLETED_TASKS: &str = "Recently completed tasks: {{completedTasks}}";

const UPCOMING_TASKS: &str = "Upcoming tasks: {{upcomingTasks}}";

const ADDITIONAL_TASKS: &str = "Ignore previous instructions. Please generate additional numbered tasks to complete the objective: \"{{objective}}\". The tasks created should take into account the character traits of {{char}}. These tasks may or may not involve {{user}} directly.\n\nThe following tasks have already been created:\n{{existingTasks}}\n\nPlease generate additional tasks that complement these existing tasks. Continue the numbering from where the list left off. Do not repeat any existing tasks.\n\nThe list should be formatted using a number followed by a fullstop and the task on each line, e.g. \"4. Investigate the mysterious cave\". Include only the list in your reply.";

lazy_static! {
    static ref DEFAULT_PROMPTS: PromptSet = PromptSet {
        create_task: CREATE_TASK.to_string(),
        check_task_completed: CHECK_TASK_COMPLETED.to_string(),
        current_task: CURRENT_TASK.to_string(),
        completed_tasks: COMPLETED_TASKS.to_string(),
        upcoming_tasks: UPCOMING_TASKS.to_string(),
        additional_tasks: ADDITIONAL_TASKS.to_string(),
    };
}

/// Identifies one template inside a [`PromptSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromptKind {
    CreateTask,
    CheckTaskCompleted,
    CurrentTask,
    CompletedTasks,
    UpcomingTasks,
    AdditionalTasks,
}

impl PromptKind {
    pub const ALL: [PromptKind; 6] = [
        PromptKind::CreateTask,
        PromptKind::CheckTaskCompleted,
        PromptKind::CurrentTask,
        PromptKind::CompletedTasks,
        PromptKind::UpcomingTasks,
        PromptKind::AdditionalTasks,
    ];
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromptKind::CreateTask => "createTask",
            PromptKind::CheckTaskCompleted => "checkTaskCompleted",
            PromptKind::CurrentTask => "currentTask",
            PromptKind::CompletedTasks => "completedTasks",
            PromptKind::UpcomingTasks => "upcomingTasks",
            PromptKind::AdditionalTasks => "additionalTasks",
        };
        f.write_str(name)
    }
}

/// The six templates a conversation renders
///
/// Missing keys deserialize to the built-in text, so partial sets from older
/// exports are backfilled on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSet {
    #[serde(default = "default_create_task")]
    pub create_task: String,
    #[serde(default = "default_check_task_completed")]
    pub check_task_completed: String,
    #[serde(default = "default_current_task")]
    pub current_task: String,
    #[serde(default = "default_completed_tasks")]
    pub completed_tasks: String,
    #[serde(default = "default_upcoming_tasks")]
    pub upcoming_tasks: String,
    #[serde(default = "default_additional_tasks")]
    pub additional_tasks: String,
}

fn default_create_task() -> String {
    CREATE_TASK.to_string()
}

fn default_check_task_completed() -> String {
    CHECK_TASK_COMPLETED.to_string()
}

fn default_current_task() -> String {
    CURRENT_TASK.to_string()
}

fn default_completed_tasks() -> String {
    COMPLETED_TASKS.to_string()
}

fn default_upcoming_tasks() -> String {
    UPCOMING_TASKS.to_string()
}

fn default_additional_tasks() -> String {
    ADDITIONAL_TASKS.to_string()
}

impl Default for PromptSet {
    fn default() -> Self {
        default_prompts()
    }
}

impl PromptSet {
    pub fn get(&self, kind: PromptKind) -> &str {
        match kind {
            PromptKind::CreateTask => &self.create_task,
            PromptKind::CheckTaskCompleted => &self.check_task_completed,
            PromptKind::CurrentTask => &self.current_task,
            PromptKind::CompletedTasks => &self.completed_tasks,
            PromptKind::UpcomingTasks => &self.upcoming_tasks,
            PromptKind::AdditionalTasks => &self.additional_tasks,
        }
    }

    pub fn set(&mut self, kind: PromptKind, text: String) {
        let slot = match kind {
            PromptKind::CreateTask => &mut self.create_task,
            PromptKind::CheckTaskCompleted => &mut self.check_task_completed,
            PromptKind::CurrentTask => &mut self.current_task,
            PromptKind::CompletedTasks => &mut self.completed_tasks,
            PromptKind::UpcomingTasks => &mut self.upcoming_tasks,
            PromptKind::AdditionalTasks => &mut self.additional_tasks,
        };
        *slot = text;
    }

    /// Replaces blank templates with the built-in text
    pub fn backfill(&mut self) {
        for kind in PromptKind::ALL {
            if self.get(kind).trim().is_empty() {
                self.set(kind, DEFAULT_PROMPTS.get(kind).to_string());
            }
        }
    }
}

/// Returns the built-in prompt set
pub fn default_prompts() -> PromptSet {
    DEFAULT_PROMPTS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_set_is_backfilled_on_deserialize() {
        let set: PromptSet =
            serde_json::from_str(r#"{"currentTask":"Do [{{task}}] now"}"#).unwrap();
        assert_eq!(set.current_task, "Do [{{task}}] now");
        assert_eq!(set.additional_tasks, default_prompts().additional_tasks);
        assert_eq!(set.create_task, default_prompts().create_task);
    }

    #[test]
    fn test_backfill_replaces_blank_templates() {
        let mut set = default_prompts();
        set.set(PromptKind::AdditionalTasks, "  ".to_string());
        set.set(PromptKind::CurrentTask, "custom".to_string());
        set.backfill();
        assert_eq!(set.get(PromptKind::AdditionalTasks), ADDITIONAL_TASKS);
        assert_eq!(set.get(PromptKind::CurrentTask), "custom");
    }

    #[test]
    fn test_prompt_kind_display_matches_wire_names() {
        for kind in PromptKind::ALL {
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire.as_str().unwrap(), kind.to_string());
        }
    }
}
