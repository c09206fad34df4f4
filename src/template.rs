//! Placeholder substitution for prompt templates
//!
//! Only a fixed set of `{{token}}` names is recognised (case-insensitively). Anything else,
//! such as `{{char}}` or `{{user}}`, is left in place for the host to fill in.

use crate::models::TaskSummary;

pub const NO_COMPLETED_TASKS: &str = "No tasks completed yet";
pub const NO_UPCOMING_TASKS: &str = "No upcoming tasks yet";

/// State a template is rendered against
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateContext<'a> {
    pub objective: Option<&'a str>,
    pub task: Option<&'a str>,
    pub parent: Option<&'a str>,
    pub completed: &'a [TaskSummary],
    pub upcoming: &'a [TaskSummary],
}

impl<'a> TemplateContext<'a> {
    fn resolve(&self, token: &str) -> Option<String> {
        let has_task = self.task.is_some();
        let value = match token.to_ascii_lowercase().as_str() {
            "objective" => self.objective.unwrap_or_default().to_string(),
            "task" | "currenttask" => self.task.unwrap_or_default().to_string(),
            "parent" => self.parent.unwrap_or_default().to_string(),
            "completedtasks" if !has_task => String::new(),
            "completedtasks" => format_list(self.completed, NO_COMPLETED_TASKS),
            "upcomingtasks" if !has_task => String::new(),
            "upcomingtasks" => format_list(self.upcoming, NO_UPCOMING_TASKS),
            _ => return None,
        };
        Some(value)
    }
}

/// Formats summaries as `[first], [second]`, or the fallback phrase when empty
pub fn format_list(tasks: &[TaskSummary], empty: &str) -> String {
    if tasks.is_empty() {
        return empty.to_string();
    }
    tasks
        .iter()
        .map(|t| format!("[{}]", t.description))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders `template` against `ctx`
pub fn substitute(template: &str, ctx: &TemplateContext<'_>) -> String {
    render_with(template, |token| ctx.resolve(token))
}

/// Replaces a single named token, leaving all others untouched
pub fn replace_token(template: &str, name: &str, value: &str) -> String {
    render_with(template, |token| {
        token.eq_ignore_ascii_case(name).then(|| value.to_string())
    })
}

fn render_with<F>(template: &str, resolve: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token = &after[..end];
        match resolve(token) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("{{");
                out.push_str(token);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn summary(id: u64, description: &str) -> TaskSummary {
        TaskSummary {
            id,
            description: description.to_string(),
            completion_date: None,
        }
    }

    #[test]
    fn test_tokens_are_case_insensitive() {
        let ctx = TemplateContext {
            objective: Some("Win the game"),
            task: Some("Find the key"),
            parent: Some("Win the game"),
            ..Default::default()
        };
        let out = substitute("{{TASK}} for {{Objective}} under {{parent}}", &ctx);
        assert_eq!(out, "Find the key for Win the game under Win the game");
    }

    #[test]
    fn test_unknown_tokens_pass_through() {
        let ctx = TemplateContext {
            task: Some("Greet"),
            ..Default::default()
        };
        assert_eq!(
            substitute("{{char}} must [{{task}}] with {{user}}", &ctx),
            "{{char}} must [Greet] with {{user}}"
        );
        assert_eq!(substitute("dangling {{task", &ctx), "dangling {{task");
    }

    #[test]
    fn test_list_tokens_fall_back_when_empty() {
        let upcoming = vec![summary(2, "Open door"), summary(3, "Leave")];
        let ctx = TemplateContext {
            task: Some("Find key"),
            upcoming: &upcoming,
            ..Default::default()
        };
        assert_eq!(
            substitute("{{completedTasks}} | {{upcomingTasks}}", &ctx),
            "No tasks completed yet | [Open door], [Leave]"
        );
    }

    #[test]
    fn test_no_active_task_renders_empty() {
        let ctx = TemplateContext {
            objective: None,
            ..Default::default()
        };
        assert_eq!(
            substitute("[{{task}}][{{completedTasks}}][{{objective}}]", &ctx),
            "[][][]"
        );
    }

    #[test]
    fn test_replace_token_only_touches_named_token() {
        let out = replace_token("{{existingTasks}} then {{task}}", "existingtasks", "1. A");
        assert_eq!(out, "1. A then {{task}}");
    }
}
