//! Turn handling, completion checks and task list generation
//!
//! The engine is split into synchronous prepare/apply steps on [`Session`]. The caller owns
//! the asynchronous call to the generation service in between, which keeps the session
//! free of locks held across awaits and lets stale responses be matched against the task or
//! objective they were issued for.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::generation::GenerationError;
use crate::models::{PlanError, StatEvent, TaskId, TaskNode};
use crate::session::Session;
use crate::template;

/// Kind of conversational turn that produced a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    #[default]
    Normal,
    Continue,
    Quiet,
    Impersonate,
}

impl TurnType {
    /// Turns that never advance the check countdown
    pub fn skips_check(self) -> bool {
        matches!(
            self,
            TurnType::Continue | TurnType::Quiet | TurnType::Impersonate
        )
    }
}

impl std::str::FromStr for TurnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(TurnType::Normal),
            "continue" => Ok(TurnType::Continue),
            "quiet" => Ok(TurnType::Quiet),
            "impersonate" => Ok(TurnType::Impersonate),
            other => Err(format!("unknown turn type '{}'", other)),
        }
    }
}

/// What a turn decided before any generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnPlan {
    /// Active task when the turn started
    pub task_id: Option<TaskId>,
    pub injection_due: bool,
    pub check_due: bool,
}

/// Interpretation of a completion-check response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Complete,
    Incomplete,
    /// Neither marker present
    Unclear,
}

/// Reads a free-text response; "true" wins over "false"
pub fn parse_verdict(response: &str) -> Verdict {
    let lower = response.to_lowercase();
    if lower.contains("true") {
        Verdict::Complete
    } else if lower.contains("false") {
        Verdict::Incomplete
    } else {
        Verdict::Unclear
    }
}

/// A completion check waiting on the generation service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub task_id: TaskId,
    pub prompt: String,
    /// Duration gate still closed; a positive verdict is reported but not applied
    pub gated: bool,
}

/// Result of one completion check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The task was completed; `next_task_id` is the new active task
    Completed {
        task_id: TaskId,
        next_task_id: Option<TaskId>,
    },
    NotCompleted { task_id: TaskId, verdict: Verdict },
    /// The service said yes but the duration gate is still closed
    Gated {
        task_id: TaskId,
        would_complete: bool,
        elapsed_messages: u32,
        duration: u32,
    },
    /// The response arrived after the active task changed and was discarded
    Stale { task_id: TaskId },
    /// The check could not run this cycle
    Aborted { task_id: TaskId, reason: String },
    /// No open active task, or a check already in flight
    Skipped,
}

impl CheckOutcome {
    pub fn completed(&self) -> bool {
        matches!(self, CheckOutcome::Completed { .. })
    }
}

/// A task-list generation waiting on the generation service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub objective_id: TaskId,
    pub prompt: String,
    /// Append to existing tasks instead of replacing them
    pub additional: bool,
}

/// Extracts `N. text` lines from a free-text response
pub fn parse_numbered_list(response: &str) -> Vec<String> {
    response
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            if digits == 0 {
                return None;
            }
            let rest = line[digits..].strip_prefix('.')?;
            let text = rest.trim();
            (!text.is_empty()).then(|| text.to_string())
        })
        .collect()
}

impl Session {
    /// Bookkeeping for one received message. Returns what the caller still has to do.
    pub fn begin_turn(&mut self, turn: TurnType) -> TurnPlan {
        let Some(task_id) = self.active_task_id.filter(|id| self.tree.contains(*id)) else {
            return TurnPlan {
                task_id: None,
                injection_due: false,
                check_due: false,
            };
        };

        if let Ok(task) = self.tree.find_mut(task_id) {
            if !task.is_completed() {
                task.increment_elapsed();
            }
        }

        let injection_due = self.step_injection_counter();

        let counts = self.settings.check_frequency > 0
            && !turn.skips_check()
            && (!self.last_message_was_swipe || self.settings.swipes_decrement);
        let mut check_due = false;
        if counts {
            self.check_counter -= 1;
            if self.check_counter <= 0 {
                self.check_counter = 0;
                check_due = true;
            }
        }
        self.last_message_was_swipe = false;

        debug!(
            conversation = %self.conversation_id,
            task_id,
            ?turn,
            injection_due,
            check_due,
            check_counter = self.check_counter,
            "Turn processed"
        );

        TurnPlan {
            task_id: Some(task_id),
            injection_due,
            check_due,
        }
    }

    /// Settles the injection slot for the turn unless a task change already pushed it
    pub fn end_turn(&mut self, plan: &TurnPlan) {
        if plan.task_id.is_none() || self.active_task_id != plan.task_id {
            return;
        }
        self.set_active_task(plan.task_id, plan.injection_due);
    }

    /// Records that the last turn was a regeneration
    pub fn mark_swipe(&mut self) {
        self.last_message_was_swipe = true;
    }

    /// Builds a completion check for the active task, or `None` when there is nothing to
    /// check or a check for it is already running.
    pub fn prepare_check(&mut self) -> Option<CheckRequest> {
        let task = self.active_task().filter(|task| !task.is_completed())?;
        let task_id = task.id();
        let gated = task.is_gated();
        if self.check_in_flight == Some(task_id) {
            debug!(task_id, "Completion check already in flight");
            return None;
        }

        let prompt = template::substitute(
            &self.prompts.check_task_completed,
            &self.template_context(),
        );
        self.check_in_flight = Some(task_id);
        Some(CheckRequest {
            task_id,
            prompt,
            gated,
        })
    }

    /// Applies the service's answer to the task the request was issued for.
    ///
    /// Never fails: service errors and unclear answers leave the task incomplete.
    pub fn apply_check(
        &mut self,
        request: &CheckRequest,
        response: Result<String, GenerationError>,
    ) -> CheckOutcome {
        self.finish_check(request);
        let task_id = request.task_id;

        let response = match response {
            Ok(text) => text,
            Err(err) => {
                warn!(task_id, error = %err, "Completion check failed");
                return CheckOutcome::Aborted {
                    task_id,
                    reason: err.to_string(),
                };
            }
        };

        if self.active_task_id != Some(task_id) {
            warn!(
                task_id,
                active = ?self.active_task_id,
                "Discarding completion check for a task that is no longer active"
            );
            return CheckOutcome::Stale { task_id };
        }

        let verdict = parse_verdict(&response);
        if verdict == Verdict::Unclear {
            warn!(task_id, response = %response, "Completion check returned neither true nor false");
        }

        if request.gated {
            let (elapsed_messages, duration) = self
                .tree
                .find(task_id)
                .map(|t| (t.elapsed_messages(), t.duration()))
                .unwrap_or_default();
            let would_complete = verdict == Verdict::Complete;
            if would_complete {
                info!(
                    task_id,
                    elapsed_messages, duration, "Task would be completed but duration not met"
                );
                self.log_transition(
                    "duration_gate",
                    Some(format!("{} ({}/{})", task_id, elapsed_messages, duration)),
                );
            }
            return CheckOutcome::Gated {
                task_id,
                would_complete,
                elapsed_messages,
                duration,
            };
        }

        match verdict {
            Verdict::Complete => {
                self.complete_task(task_id);
                CheckOutcome::Completed {
                    task_id,
                    next_task_id: self.active_task_id.filter(|id| *id != task_id),
                }
            }
            other => CheckOutcome::NotCompleted {
                task_id,
                verdict: other,
            },
        }
    }

    /// Gives up on a check, e.g. when the host stayed busy past the wait ceiling
    pub fn abort_check(&mut self, request: &CheckRequest, reason: &str) -> CheckOutcome {
        self.finish_check(request);
        warn!(task_id = request.task_id, reason, "Completion check aborted");
        CheckOutcome::Aborted {
            task_id: request.task_id,
            reason: reason.to_string(),
        }
    }

    fn finish_check(&mut self, request: &CheckRequest) {
        if self.check_in_flight == Some(request.task_id) {
            self.check_in_flight = None;
        }
        self.check_counter = i64::from(self.settings.check_frequency);
    }

    /// The completion transition shared by checks and manual completion.
    ///
    /// Returns `false` when the task was already complete.
    pub(crate) fn complete_task(&mut self, id: TaskId) -> bool {
        match self.tree.complete(id) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                warn!(task_id = id, error = %err, "Cannot complete task");
                return false;
            }
        }
        self.log_transition("complete", Some(id.to_string()));
        self.record_completion(id);
        let next = self.next_incomplete_id().or(Some(id));
        self.set_active_task(next, true);
        true
    }

    /// Completes the active task without asking the service. Idempotent.
    pub fn mark_active_completed(&mut self) -> Result<bool, PlanError> {
        let task_id = self.active_task().map(TaskNode::id).ok_or(PlanError::NoActiveTask)?;
        Ok(self.complete_task(task_id))
    }

    /// Builds the prompt for (re)generating the objective's tasks.
    ///
    /// An additional request on an objective without children becomes a full one.
    pub fn prepare_generation(&self, additional: bool) -> GenerationRequest {
        let objective = self.objective();
        let additional = additional && !objective.is_leaf();
        let ctx = self.template_context();

        let prompt = if additional {
            let existing = objective
                .children()
                .iter()
                .enumerate()
                .map(|(i, task)| format!("{}. {}", i + 1, task.description()))
                .collect::<Vec<_>>()
                .join("\n");
            let seeded =
                template::replace_token(&self.prompts.additional_tasks, "existingTasks", &existing);
            template::substitute(&seeded, &ctx)
        } else {
            template::substitute(&self.prompts.create_task, &ctx)
        };

        GenerationRequest {
            objective_id: objective.id(),
            prompt,
            additional,
        }
    }

    /// Creates tasks from a numbered-list response and returns their ids.
    ///
    /// Fails without mutating when the objective no longer exists.
    pub fn apply_generation(
        &mut self,
        request: &GenerationRequest,
        response: &str,
    ) -> Result<Vec<TaskId>, PlanError> {
        self.tree.find(request.objective_id)?;
        let descriptions = parse_numbered_list(response);
        if descriptions.is_empty() {
            warn!(
                objective = request.objective_id,
                "Generation response contained no numbered tasks"
            );
        }

        if !request.additional {
            self.tree.clear_children(request.objective_id)?;
            let tree = &self.tree;
            self.recently_completed.retain(|t| tree.contains(t.id));
        }

        let mut created = Vec::with_capacity(descriptions.len());
        for description in descriptions {
            let id = self.tree.add_child(request.objective_id, description, None)?;
            self.emit(StatEvent::TaskCreated);
            created.push(id);
        }

        self.log_transition(
            if request.additional {
                "generate_more"
            } else {
                "generate"
            },
            Some(format!("{} tasks", created.len())),
        );

        match created.first() {
            Some(first) if !request.additional => {
                self.set_active_task(Some(*first), true);
            }
            _ => self.reresolve_active(),
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SettingsUpdate;
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
    fn test_parse_verdict() {
        assert_eq!(parse_verdict("True"), Verdict::Complete);
        assert_eq!(parse_verdict("  FALSE."), Verdict::Incomplete);
        assert_eq!(parse_verdict("not false, it's true"), Verdict::Complete);
        assert_eq!(parse_verdict("maybe"), Verdict::Unclear);
    }

    #[test]
    fn test_parse_numbered_list() {
        let response = "Here you go:\n1. Find the key\n 2.   Open the door \n3.\n- bullet\n10. Leave";
        assert_eq!(
            parse_numbered_list(response),
            vec!["Find the key", "Open the door", "Leave"]
        );
    }

    #[test]
    fn test_check_fires_on_every_third_turn() {
        let (mut session, _ids) = session_with_tasks(&["A"]);
        let due: Vec<bool> = (0..6)
            .map(|_| {
                let plan = session.begin_turn(TurnType::Normal);
                if plan.check_due {
                    // Counter resets once the check settles
                    let request = session.prepare_check().unwrap();
                    session.apply_check(&request, Ok("false".to_string()));
                }
                session.end_turn(&plan);
                plan.check_due
            })
            .collect();
        assert_eq!(due, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_excluded_turns_and_swipes_do_not_count() {
        let (mut session, ids) = session_with_tasks(&["A"]);
        session.begin_turn(TurnType::Quiet);
        session.mark_swipe();
        session.begin_turn(TurnType::Normal);
        assert_eq!(session.check_counter(), 3);
        assert_eq!(session.active_task().unwrap().elapsed_messages(), 2);

        session
            .update_settings(SettingsUpdate {
                swipes_decrement: Some(true),
                ..Default::default()
            })
            .unwrap();
        session.mark_swipe();
        session.begin_turn(TurnType::Normal);
        assert_eq!(session.check_counter(), 2);
        assert_eq!(session.tree().find(ids[0]).unwrap().elapsed_messages(), 3);
    }

    #[test]
    fn test_zero_frequency_disables_checks() {
        let (mut session, _ids) = session_with_tasks(&["A"]);
        session
            .update_settings(SettingsUpdate {
                check_frequency: Some(0),
                ..Default::default()
            })
            .unwrap();
        for _ in 0..10 {
            assert!(!session.begin_turn(TurnType::Normal).check_due);
        }
    }

    #[test]
    fn test_no_active_task_is_a_no_op() {
        let mut session = Session::new("test");
        let plan = session.begin_turn(TurnType::Normal);
        assert_eq!(plan.task_id, None);
        assert!(!plan.check_due);
        assert_eq!(session.check_counter(), 3);
        assert!(session.prepare_check().is_none());
    }

    #[test]
    fn test_duration_gate_holds_then_releases() {
        let (mut session, ids) = session_with_tasks(&["A", "B"]);
        session.set_duration(ids[0], 5).unwrap();
        for _ in 0..3 {
            session.begin_turn(TurnType::Normal);
        }

        let request = session.prepare_check().unwrap();
        assert!(request.gated);
        let outcome = session.apply_check(&request, Ok("true".to_string()));
        assert_eq!(
            outcome,
            CheckOutcome::Gated {
                task_id: ids[0],
                would_complete: true,
                elapsed_messages: 3,
                duration: 5
            }
        );
        assert!(!session.tree().find(ids[0]).unwrap().is_completed());
        assert_eq!(session.active_task().unwrap().id(), ids[0]);

        for _ in 0..2 {
            session.begin_turn(TurnType::Normal);
        }
        let request = session.prepare_check().unwrap();
        assert!(!request.gated);
        let outcome = session.apply_check(&request, Ok("true".to_string()));
        assert!(outcome.completed());
        assert!(session.tree().find(ids[0]).unwrap().is_completed());
        assert_eq!(session.active_task().unwrap().id(), ids[1]);
    }

    #[test]
    fn test_unclear_and_failed_checks_fail_open() {
        let (mut session, ids) = session_with_tasks(&["A"]);
        let request = session.prepare_check().unwrap();
        let outcome = session.apply_check(&request, Ok("I cannot tell".to_string()));
        assert_eq!(
            outcome,
            CheckOutcome::NotCompleted {
                task_id: ids[0],
                verdict: Verdict::Unclear
            }
        );

        let request = session.prepare_check().unwrap();
        let outcome = session.apply_check(
            &request,
            Err(GenerationError::InvalidResponse("empty".to_string())),
        );
        assert!(matches!(outcome, CheckOutcome::Aborted { .. }));
        assert!(!session.tree().find(ids[0]).unwrap().is_completed());
        assert_eq!(session.check_counter(), 3);
    }

    #[test]
    fn test_single_flight_and_stale_response() {
        let (mut session, ids) = session_with_tasks(&["A", "B"]);
        let request = session.prepare_check().unwrap();
        assert!(session.prepare_check().is_none());

        // The user moves on while the check is pending
        session.set_completed(ids[0], true).unwrap();
        session.set_completed(ids[0], false).unwrap();
        session.set_active_task(Some(ids[1]), true);

        let outcome = session.apply_check(&request, Ok("true".to_string()));
        assert_eq!(outcome, CheckOutcome::Stale { task_id: ids[0] });
        assert!(!session.tree().find(ids[1]).unwrap().is_completed());
        assert!(!session.tree().find(ids[0]).unwrap().is_completed());
        assert!(session.prepare_check().is_some());
    }

    #[test]
    fn test_manual_completion_is_idempotent() {
        let (mut session, ids) = session_with_tasks(&["A"]);
        assert!(session.mark_active_completed().unwrap());
        let date = session.tree().find(ids[0]).unwrap().completion_date();

        // Nothing left, so the completed task stays active for display
        assert_eq!(session.active_task().unwrap().id(), ids[0]);
        assert!(!session.mark_active_completed().unwrap());
        assert_eq!(session.recently_completed().len(), 1);
        assert_eq!(session.completion_history().len(), 1);
        assert_eq!(session.tree().find(ids[0]).unwrap().completion_date(), date);
        assert!(session.prepare_check().is_none());
    }

    #[test]
    fn test_generation_replaces_and_appends() {
        let mut session = Session::new("test");
        session
            .set_objective_description("Win the game".to_string())
            .unwrap();

        let request = session.prepare_generation(true);
        assert!(!request.additional);
        assert!(request.prompt.contains("\"Win the game\""));

        let created = session
            .apply_generation(&request, "1. Scout\n2. Fight\n3. Win")
            .unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(session.active_task().unwrap().id(), created[0]);

        let more = session.prepare_generation(true);
        assert!(more.additional);
        assert!(more.prompt.contains("1. Scout\n2. Fight\n3. Win"));
        let appended = session.apply_generation(&more, "4. Celebrate").unwrap();
        assert_eq!(session.tree().root().children().len(), 4);
        assert_eq!(session.active_task().unwrap().id(), created[0]);
        assert_eq!(appended.len(), 1);
        assert_eq!(session.statistics().tasks_created, 4);
    }

    #[test]
    fn test_generation_for_removed_objective_is_rejected() {
        let (mut session, ids) = session_with_tasks(&["A"]);
        session.branch(ids[0]).unwrap();
        let request = session.prepare_generation(false);
        session.ascend().unwrap();
        session.remove_task(ids[0], true).unwrap();

        assert!(session.apply_generation(&request, "1. X").is_err());
        assert_eq!(session.tree().count_tasks(), 0);
    }
}
