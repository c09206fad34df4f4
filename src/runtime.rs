//! Thread-safe entry point shared by the HTTP surface and embedders
//!
//! [`Core`] owns every loaded conversation, the global library and the collaborators. Locks
//! are only held inside synchronous closures; generation calls run between them, and the
//! session matches the answer against the request it was issued for.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::completion::{CheckOutcome, CheckRequest, TurnPlan, TurnType};
use crate::generation::{wait_until_idle, Generator, HostActivity, HostState, WaitConfig};
use crate::injection::Injection;
use crate::library::{
    parse_task_import, ConflictPolicy, ImportReport, Library, PromptSetExport, TaskExport,
    TaskTemplate, TemplateExport, EXPORT_VERSION,
};
use crate::models::{
    CompletionRecord, PlanError, PlanResponse, Settings, SettingsUpdate, StatEvent, Statistics,
    TaskId, TaskNode, TaskTree,
};
use crate::persistence::{self, conversation_key, Snapshot, Store, LIBRARY_KEY};
use crate::prompts::{default_prompts, PromptKind, DEFAULT_PROMPT_SET};
use crate::session::Session;

// Releases a check whose future was dropped before the answer was applied
struct PendingCheck<'a> {
    core: &'a Core,
    conversation: &'a str,
    request: CheckRequest,
    armed: bool,
}

impl Drop for PendingCheck<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let request = &self.request;
        if let Err(err) = self
            .core
            .with_session(self.conversation, |s| Ok(s.abort_check(request, "check cancelled")))
        {
            error!(conversation = %self.conversation, error = %err, "Failed to release cancelled check");
        }
    }
}

/// What happened during one received message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnReport {
    pub plan: TurnPlan,
    pub check: Option<CheckOutcome>,
}

/// Progress numbers for one conversation next to the global counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsView {
    pub conversation: Statistics,
    pub global: Statistics,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    /// Rounded percentage of completed tasks
    pub completion_rate: u32,
    /// Newest first
    pub recent_completions: Vec<CompletionRecord>,
}

const RECENT_COMPLETIONS_SHOWN: usize = 10;

#[derive(Clone)]
pub struct Core {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    library: Arc<Mutex<Library>>,
    store: Arc<dyn Store>,
    generator: Arc<dyn Generator>,
    host: Arc<dyn HostActivity>,
    wait: WaitConfig,
    update_tx: Arc<broadcast::Sender<String>>,
}

impl Core {
    pub fn new(store: Arc<dyn Store>, generator: Arc<dyn Generator>) -> Self {
        // Create a broadcast channel with capacity for 100 messages
        let (tx, _rx) = broadcast::channel(100);

        let mut library = match store.load(LIBRARY_KEY) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|err| {
                warn!(error = %err, "Stored library is unreadable, starting empty");
                Library::default()
            }),
            Ok(None) => Library::default(),
            Err(err) => {
                error!(error = %err, "Failed to load library");
                Library::default()
            }
        };
        library.ensure_default();

        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            library: Arc::new(Mutex::new(library)),
            store,
            generator,
            host: Arc::new(HostState::default()),
            wait: WaitConfig::default(),
            update_tx: Arc::new(tx),
        }
    }

    /// Uses `host` to decide when the transcript is settled enough to check
    pub fn with_host(mut self, host: Arc<dyn HostActivity>) -> Self {
        self.host = host;
        self
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    // Subscribe to state updates; each message is the id of the conversation that changed
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.update_tx.subscribe()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn library(&self) -> MutexGuard<'_, Library> {
        match self.library.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn load_session(&self, conversation: &str) -> Session {
        let key = conversation_key(conversation);
        let stored = self.store.load(&key).unwrap_or_else(|err| {
            warn!(conversation, error = %err, "Failed to read stored plan");
            None
        });
        let loaded = persistence::load(conversation, stored);
        if loaded.migrated {
            info!(conversation, "Migrated legacy plan layout");
            self.persist(conversation, &persistence::save(&loaded.session));
        }
        loaded.session
    }

    fn persist(&self, conversation: &str, snapshot: &Snapshot) {
        let result = serde_json::to_value(snapshot)
            .map_err(persistence::StoreError::from)
            .and_then(|value| self.store.save(&conversation_key(conversation), value));
        if let Err(err) = result {
            error!(conversation, error = %err, "Failed to persist plan");
        }
    }

    fn persist_library(&self, library: &Library) {
        let result = serde_json::to_value(library)
            .map_err(persistence::StoreError::from)
            .and_then(|value| self.store.save(LIBRARY_KEY, value));
        if let Err(err) = result {
            error!(error = %err, "Failed to persist library");
        }
    }

    fn record_events(&self, events: &[StatEvent]) {
        if events.is_empty() {
            return;
        }
        let mut library = self.library();
        library.record(events);
        self.persist_library(&library);
    }

    // Helper method to run a mutation, persist the result, and notify observers
    fn with_session<F, R>(&self, conversation: &str, f: F) -> Result<PlanResponse<R>, PlanError>
    where
        F: FnOnce(&mut Session) -> Result<R, PlanError>,
    {
        let (res, context, snapshot, events) = {
            let mut sessions = self.sessions();
            let session = sessions
                .entry(conversation.to_string())
                .or_insert_with(|| self.load_session(conversation));
            let res = f(session)?;
            (
                res,
                session.distilled_context(),
                persistence::save(session),
                session.drain_stat_events(),
            )
        };

        self.persist(conversation, &snapshot);
        self.record_events(&events);
        let _ = self.update_tx.send(conversation.to_string());

        Ok(PlanResponse::new(res, context))
    }

    // Read-only access; nothing is persisted or broadcast
    fn view<F, R>(&self, conversation: &str, f: F) -> PlanResponse<R>
    where
        F: FnOnce(&Session) -> R,
    {
        let mut sessions = self.sessions();
        let session = sessions
            .entry(conversation.to_string())
            .or_insert_with(|| self.load_session(conversation));
        PlanResponse::new(f(session), session.distilled_context())
    }

    pub fn get_plan(&self, conversation: &str) -> PlanResponse<TaskTree> {
        self.view(conversation, |s| s.tree().clone())
    }

    /// Gets a distilled context with focused information about the conversation's plan
    pub fn distilled_context(&self, conversation: &str) -> PlanResponse<()> {
        self.view(conversation, |_| ())
    }

    pub fn injection(&self, conversation: &str) -> PlanResponse<Injection> {
        self.view(conversation, |s| s.injection().clone())
    }

    pub fn statistics(&self, conversation: &str) -> PlanResponse<StatsView> {
        let global = self.library().statistics().clone();
        self.view(conversation, |s| {
            let total_tasks = s.tree().count_tasks();
            let completed_tasks = s.tree().count_completed();
            let completion_rate = if total_tasks == 0 {
                0
            } else {
                ((completed_tasks as f64 / total_tasks as f64) * 100.0).round() as u32
            };
            StatsView {
                conversation: s.statistics().clone(),
                global,
                total_tasks,
                completed_tasks,
                completion_rate,
                recent_completions: s
                    .completion_history()
                    .iter()
                    .rev()
                    .take(RECENT_COMPLETIONS_SHOWN)
                    .cloned()
                    .collect(),
            }
        })
    }

    pub fn add_task(
        &self,
        conversation: &str,
        parent: Option<TaskId>,
        description: String,
        index: Option<usize>,
    ) -> Result<PlanResponse<TaskId>, PlanError> {
        self.with_session(conversation, |s| s.add_task(parent, description, index))
    }

    pub fn add_task_after(
        &self,
        conversation: &str,
        id: TaskId,
    ) -> Result<PlanResponse<TaskId>, PlanError> {
        self.with_session(conversation, |s| s.add_task_after(id))
    }

    /// Removes the task at the given id
    pub fn remove_task(
        &self,
        conversation: &str,
        id: TaskId,
        confirmed: bool,
    ) -> Result<PlanResponse<TaskNode>, PlanError> {
        self.with_session(conversation, |s| s.remove_task(id, confirmed))
    }

    pub fn reorder_tasks(
        &self,
        conversation: &str,
        parent: TaskId,
        order: Vec<TaskId>,
    ) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.reorder_tasks(parent, &order))
    }

    pub fn set_completed(
        &self,
        conversation: &str,
        id: TaskId,
        completed: bool,
    ) -> Result<PlanResponse<bool>, PlanError> {
        self.with_session(conversation, |s| s.set_completed(id, completed))
    }

    pub fn set_description(
        &self,
        conversation: &str,
        id: TaskId,
        description: String,
    ) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.set_description(id, description))
    }

    pub fn set_objective_description(
        &self,
        conversation: &str,
        description: String,
    ) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.set_objective_description(description))
    }

    pub fn set_duration(
        &self,
        conversation: &str,
        id: TaskId,
        duration: u32,
    ) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.set_duration(id, duration))
    }

    pub fn reset_elapsed(
        &self,
        conversation: &str,
        id: TaskId,
    ) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.reset_elapsed(id))
    }

    pub fn branch(&self, conversation: &str, id: TaskId) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.branch(id))
    }

    pub fn ascend(&self, conversation: &str) -> Result<PlanResponse<bool>, PlanError> {
        self.with_session(conversation, |s| s.ascend())
    }

    /// Completes the active task on the user's word, skipping the service and duration gate
    pub fn complete_active(&self, conversation: &str) -> Result<PlanResponse<bool>, PlanError> {
        self.with_session(conversation, |s| s.mark_active_completed())
    }

    pub fn clear_tasks(
        &self,
        conversation: &str,
        confirmed: bool,
    ) -> Result<PlanResponse<usize>, PlanError> {
        self.with_session(conversation, |s| s.clear_tasks(confirmed))
    }

    pub fn purge_recently_completed(
        &self,
        conversation: &str,
        confirmed: bool,
    ) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.purge_recently_completed(confirmed))
    }

    pub fn purge_upcoming(
        &self,
        conversation: &str,
        confirmed: bool,
    ) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.purge_upcoming(confirmed))
    }

    pub fn update_settings(
        &self,
        conversation: &str,
        update: SettingsUpdate,
    ) -> Result<PlanResponse<Settings>, PlanError> {
        self.with_session(conversation, |s| {
            s.update_settings(update)?;
            Ok(s.settings().clone())
        })
    }

    pub fn set_prompt(
        &self,
        conversation: &str,
        kind: PromptKind,
        text: String,
    ) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| s.set_prompt(kind, text))
    }

    /// The last message was regenerated
    pub fn swipe(&self, conversation: &str) -> Result<PlanResponse<()>, PlanError> {
        self.with_session(conversation, |s| {
            s.mark_swipe();
            Ok(())
        })
    }

    /// Drops the in-memory copy and reloads the conversation from the store
    pub fn switch_conversation(&self, conversation: &str) -> Result<PlanResponse<()>, PlanError> {
        {
            let mut session = self.load_session(conversation);
            session.on_switch();
            self.sessions().insert(conversation.to_string(), session);
        }
        info!(conversation, "Switched conversation");
        self.with_session(conversation, |_| Ok(()))
    }

    /// Handles a received message: counts the turn, runs a due completion check, and settles
    /// the injection slot.
    pub async fn message_received(
        &self,
        conversation: &str,
        turn: TurnType,
    ) -> Result<PlanResponse<TurnReport>, PlanError> {
        let plan = self
            .with_session(conversation, |s| Ok(s.begin_turn(turn)))?
            .into_inner();

        let check = if plan.check_due {
            Some(self.run_check(conversation).await?)
        } else {
            None
        };

        self.with_session(conversation, |s| {
            s.end_turn(&plan);
            Ok(TurnReport { plan, check })
        })
    }

    /// Runs a completion check right away, ignoring the periodic countdown
    pub async fn check_now(
        &self,
        conversation: &str,
    ) -> Result<PlanResponse<CheckOutcome>, PlanError> {
        let outcome = self.run_check(conversation).await?;
        Ok(self.view(conversation, |_| outcome))
    }

    async fn run_check(&self, conversation: &str) -> Result<CheckOutcome, PlanError> {
        let request = self
            .with_session(conversation, |s| Ok(s.prepare_check()))?
            .into_inner();
        let Some(request) = request else {
            return Ok(CheckOutcome::Skipped);
        };
        let mut pending = PendingCheck {
            core: self,
            conversation,
            request: request.clone(),
            armed: true,
        };

        if let Err(err) = wait_until_idle(self.host.as_ref(), self.wait).await {
            pending.armed = false;
            let reason = err.to_string();
            return Ok(self
                .with_session(conversation, |s| Ok(s.abort_check(&request, &reason)))?
                .into_inner());
        }

        let response = self.generator.generate(&request.prompt, true).await;
        pending.armed = false;
        Ok(self
            .with_session(conversation, |s| Ok(s.apply_check(&request, response)))?
            .into_inner())
    }

    /// Replaces (or, with `additional`, extends) the objective's tasks from the service
    pub async fn generate_tasks(
        &self,
        conversation: &str,
        additional: bool,
    ) -> Result<PlanResponse<Vec<TaskId>>, PlanError> {
        let request = self
            .view(conversation, |s| s.prepare_generation(additional))
            .into_inner();
        let response = self.generator.generate(&request.prompt, true).await?;
        self.with_session(conversation, |s| s.apply_generation(&request, &response))
    }

    pub fn prompt_set_names(&self) -> Vec<String> {
        self.library().prompt_set_names()
    }

    pub fn select_prompt_set(
        &self,
        conversation: &str,
        name: &str,
    ) -> Result<PlanResponse<()>, PlanError> {
        let prompts = self
            .library()
            .prompt_set(name)
            .cloned()
            .ok_or_else(|| PlanError::Missing(format!("prompt set '{}'", name)))?;
        self.with_session(conversation, |s| {
            s.use_prompt_set(name, prompts);
            Ok(())
        })
    }

    /// Saves the conversation's current prompts as a new named set and selects it
    pub fn new_prompt_set(
        &self,
        conversation: &str,
        name: &str,
    ) -> Result<PlanResponse<()>, PlanError> {
        let name = name.trim();
        let prompts = self
            .view(conversation, |s| s.prompts().clone())
            .into_inner();
        {
            let mut library = self.library();
            library
                .add_prompt_set(name, prompts.clone())
                .map_err(PlanError::InvalidName)?;
            self.persist_library(&library);
        }
        self.with_session(conversation, |s| {
            s.use_prompt_set(name, prompts);
            Ok(())
        })
    }

    /// Writes the conversation's prompts back into its selected set
    pub fn save_prompt_set(&self, conversation: &str) -> Result<PlanResponse<()>, PlanError> {
        let (name, prompts) = self
            .view(conversation, |s| {
                (s.selected_prompt_set().to_string(), s.prompts().clone())
            })
            .into_inner();
        let mut library = self.library();
        library
            .update_prompt_set(&name, prompts)
            .map_err(PlanError::Invalid)?;
        self.persist_library(&library);
        drop(library);
        Ok(self.view(conversation, |_| ()))
    }

    /// Deletes the selected set and falls back to the built-in one
    pub fn delete_prompt_set(
        &self,
        conversation: &str,
        confirmed: bool,
    ) -> Result<PlanResponse<()>, PlanError> {
        if !confirmed {
            return Err(PlanError::ConfirmationRequired(
                "deleting the prompt set".to_string(),
            ));
        }
        let name = self
            .view(conversation, |s| s.selected_prompt_set().to_string())
            .into_inner();
        {
            let mut library = self.library();
            library.remove_prompt_set(&name).map_err(PlanError::Invalid)?;
            self.persist_library(&library);
        }
        self.with_session(conversation, |s| {
            s.use_prompt_set(DEFAULT_PROMPT_SET, default_prompts());
            Ok(())
        })
    }

    pub fn export_prompt_sets(&self, names: &[String]) -> PromptSetExport {
        self.library().export_prompt_sets(names)
    }

    pub fn import_prompt_sets(
        &self,
        document: &Value,
        policy: ConflictPolicy,
    ) -> Result<ImportReport, PlanError> {
        let mut library = self.library();
        let report = library.import_prompt_sets(document, policy)?;
        self.persist_library(&library);
        Ok(report)
    }

    pub fn template_names(&self) -> Vec<String> {
        self.library().template_names()
    }

    /// Stores the objective's tasks, with completion cleared, as a named template
    pub fn save_template(
        &self,
        conversation: &str,
        name: &str,
    ) -> Result<PlanResponse<()>, PlanError> {
        let template = self
            .view(conversation, |s| {
                let objective = s.objective();
                TaskTemplate {
                    description: objective.description().to_string(),
                    tasks: objective.to_seeds(false),
                }
            })
            .into_inner();
        if template.tasks.is_empty() {
            return Err(PlanError::Invalid(
                "the objective has no tasks to save".to_string(),
            ));
        }
        {
            let mut library = self.library();
            library
                .put_template(name, template)
                .map_err(PlanError::InvalidName)?;
            self.persist_library(&library);
        }
        info!(conversation, template = name, "Saved template");
        Ok(self.view(conversation, |_| ()))
    }

    /// Replaces the objective's tasks with a template's
    pub fn load_template(
        &self,
        conversation: &str,
        name: &str,
        confirmed: bool,
    ) -> Result<PlanResponse<Vec<TaskId>>, PlanError> {
        let template = self
            .library()
            .template(name)
            .cloned()
            .ok_or_else(|| PlanError::Missing(format!("template '{}'", name)))?;
        self.with_session(conversation, |s| {
            s.replace_tasks(Some(template.description), &template.tasks, confirmed)
        })
    }

    pub fn delete_template(&self, name: &str, confirmed: bool) -> Result<(), PlanError> {
        if !confirmed {
            return Err(PlanError::ConfirmationRequired(format!(
                "deleting template '{}'",
                name
            )));
        }
        let mut library = self.library();
        library
            .remove_template(name)
            .ok_or_else(|| PlanError::Missing(format!("template '{}'", name)))?;
        self.persist_library(&library);
        Ok(())
    }

    pub fn export_templates(&self, names: &[String]) -> TemplateExport {
        self.library().export_templates(names)
    }

    pub fn import_templates(
        &self,
        document: &Value,
        policy: ConflictPolicy,
    ) -> Result<ImportReport, PlanError> {
        let mut library = self.library();
        let report = library.import_templates(document, policy)?;
        self.persist_library(&library);
        Ok(report)
    }

    /// Exports the objective's tasks as full node records
    pub fn export_tasks(&self, conversation: &str) -> Result<TaskExport, PlanError> {
        let export = self
            .view(conversation, |s| {
                let objective = s.objective();
                TaskExport {
                    description: Some(objective.description().to_string()),
                    tasks: objective.children().to_vec(),
                    export_date: chrono::Utc::now(),
                    version: EXPORT_VERSION.to_string(),
                }
            })
            .into_inner();
        if export.tasks.is_empty() {
            return Err(PlanError::Invalid("there are no tasks to export".to_string()));
        }
        Ok(export)
    }

    /// Replaces the objective's tasks with an exported list
    pub fn import_tasks(
        &self,
        conversation: &str,
        document: &Value,
        confirmed: bool,
    ) -> Result<PlanResponse<Vec<TaskId>>, PlanError> {
        let import = parse_task_import(document)?;
        self.with_session(conversation, |s| {
            s.replace_tasks(import.description, &import.tasks, confirmed)
        })
    }

    pub fn global_statistics(&self) -> Statistics {
        self.library().statistics().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ScriptedGenerator;
    use crate::persistence::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const CONV: &str = "chat-1";

    fn core_with(responses: &[&str]) -> (Core, Arc<ScriptedGenerator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(ScriptedGenerator::new(responses.iter().copied()));
        let core = Core::new(store.clone(), generator.clone());
        (core, generator, store)
    }

    #[tokio::test]
    async fn test_generate_then_check_on_third_turn() {
        let (core, generator, _store) = core_with(&["1. Scout\n2. Fight\n3. Win", "true"]);
        core.set_objective_description(CONV, "Win the game".to_string())
            .unwrap();
        let created = core.generate_tasks(CONV, false).await.unwrap().into_inner();
        assert_eq!(created.len(), 3);

        for turn in 1..=3 {
            let report = core
                .message_received(CONV, TurnType::Normal)
                .await
                .unwrap()
                .into_inner();
            assert_eq!(report.check.is_some(), turn == 3);
        }

        let context = core.distilled_context(CONV).context();
        let active = context.active_task.unwrap();
        assert_eq!(active.id, created[1]);
        assert_eq!(active.elapsed_messages, 0);
        assert_eq!(generator.prompts().len(), 2);
        assert!(generator.prompts()[1].contains("[Scout]"));
    }

    #[tokio::test]
    async fn test_check_now_reports_boolean_outcome() {
        let (core, _generator, _store) = core_with(&["FALSE", "True!"]);
        core.add_task(CONV, None, "Greet".to_string(), None).unwrap();

        let first = core.check_now(CONV).await.unwrap().into_inner();
        assert!(!first.completed());
        let second = core.check_now(CONV).await.unwrap().into_inner();
        assert!(second.completed());

        let third = core.check_now(CONV).await.unwrap().into_inner();
        assert_eq!(third, CheckOutcome::Skipped);
    }

    // Never answers its first call; every later call says the task is done
    #[derive(Default)]
    struct StallOnceGenerator {
        called: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Generator for StallOnceGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            _quiet: bool,
        ) -> Result<String, crate::generation::GenerationError> {
            if !self.called.swap(true, std::sync::atomic::Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok("true".to_string())
        }
    }

    #[tokio::test]
    async fn test_cancelled_check_releases_task() {
        let core = Core::new(
            Arc::new(MemoryStore::new()),
            Arc::new(StallOnceGenerator::default()),
        );
        let first = core
            .add_task(CONV, None, "Greet".to_string(), None)
            .unwrap()
            .into_inner();
        core.add_task(CONV, None, "Leave".to_string(), None).unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), core.check_now(CONV)).await;
        assert!(cancelled.is_err());
        let context = core.distilled_context(CONV).context();
        assert_eq!(context.check_counter, 3);

        for _ in 0..2 {
            let report = core
                .message_received(CONV, TurnType::Normal)
                .await
                .unwrap()
                .into_inner();
            assert!(report.check.is_none());
        }
        let report = core
            .message_received(CONV, TurnType::Normal)
            .await
            .unwrap()
            .into_inner();
        assert!(report.check.unwrap().completed());
        let plan = core.get_plan(CONV).into_inner();
        assert!(plan.find(first).unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_repeated_completion_keeps_checks_running() {
        let (core, _generator, _store) = core_with(&["true"]);
        let first = core
            .add_task(CONV, None, "Greet".to_string(), None)
            .unwrap()
            .into_inner();
        let second = core
            .add_task(CONV, None, "Leave".to_string(), None)
            .unwrap()
            .into_inner();

        assert!(core.set_completed(CONV, first, true).unwrap().into_inner());
        assert!(!core.set_completed(CONV, first, true).unwrap().into_inner());
        let active = core.distilled_context(CONV).context().active_task.unwrap();
        assert_eq!(active.id, second);

        let outcome = core.check_now(CONV).await.unwrap().into_inner();
        assert!(outcome.completed());
        assert!(core.get_plan(CONV).into_inner().find(second).unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_busy_host_aborts_check() {
        let (core, generator, _store) = core_with(&["true"]);
        let host = Arc::new(HostState::default());
        host.set_generating(true);
        let core = core.with_host(host.clone()).with_wait(WaitConfig {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        });
        core.add_task(CONV, None, "Greet".to_string(), None).unwrap();

        let outcome = core.check_now(CONV).await.unwrap().into_inner();
        assert!(matches!(outcome, CheckOutcome::Aborted { .. }));
        assert!(generator.prompts().is_empty());

        host.set_generating(false);
        assert!(core.check_now(CONV).await.unwrap().into_inner().completed());
    }

    #[tokio::test]
    async fn test_conversations_are_isolated_and_persisted() {
        let (core, _generator, store) = core_with(&[]);
        core.add_task("a", None, "Only in a".to_string(), None)
            .unwrap();
        assert_eq!(core.get_plan("b").into_inner().count_tasks(), 0);
        assert!(store.load(&conversation_key("a")).unwrap().is_some());

        // A second core over the same store picks the plan up
        let other = Core::new(store.clone(), Arc::new(ScriptedGenerator::new(Vec::<String>::new())));
        let plan = other.get_plan("a").into_inner();
        assert_eq!(plan.root().children()[0].description(), "Only in a");
    }

    #[tokio::test]
    async fn test_switch_reloads_and_forces_injection() {
        let (core, _generator, _store) = core_with(&[]);
        core.add_task(CONV, None, "Greet".to_string(), None).unwrap();
        core.update_settings(
            CONV,
            SettingsUpdate {
                injection_frequency: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        core.message_received(CONV, TurnType::Normal).await.unwrap();
        core.message_received(CONV, TurnType::Normal).await.unwrap();
        assert!(core.injection(CONV).into_inner().is_empty());

        let context = core.switch_conversation(CONV).unwrap().context();
        assert_eq!(context.injection_counter, 0);
        assert!(!context.injection.is_empty());
    }

    #[test]
    fn test_global_statistics_follow_sessions() {
        let (core, _generator, _store) = core_with(&[]);
        let id = core
            .add_task("a", None, "A".to_string(), None)
            .unwrap()
            .into_inner();
        core.add_task("b", None, "B".to_string(), None).unwrap();
        core.set_completed("a", id, true).unwrap();

        let global = core.global_statistics();
        assert_eq!(global.tasks_created, 2);
        assert_eq!(global.tasks_completed, 1);
        assert_eq!(global.objectives_completed, 1);

        let stats = core.statistics("a").into_inner();
        assert_eq!(stats.completion_rate, 100);
        assert_eq!(stats.recent_completions.len(), 1);
    }

    #[test]
    fn test_templates_and_prompt_sets() {
        let (core, _generator, _store) = core_with(&[]);
        assert!(core.save_template(CONV, "empty").is_err());

        core.set_objective_description(CONV, "Heist".to_string())
            .unwrap();
        let first = core
            .add_task(CONV, None, "Case the bank".to_string(), None)
            .unwrap()
            .into_inner();
        core.set_completed(CONV, first, true).unwrap();
        core.save_template(CONV, "heist").unwrap();

        assert!(matches!(
            core.load_template(CONV, "heist", false),
            Err(PlanError::ConfirmationRequired(_))
        ));
        let created = core.load_template(CONV, "heist", true).unwrap().into_inner();
        let plan = core.get_plan(CONV).into_inner();
        assert!(!plan.find(created[0]).unwrap().is_completed());
        assert_eq!(plan.root().description(), "Heist");

        core.set_prompt(CONV, PromptKind::CurrentTask, "Now: {{task}}".to_string())
            .unwrap();
        core.new_prompt_set(CONV, "terse").unwrap();
        assert_eq!(core.prompt_set_names(), vec!["default", "terse"]);
        let context = core.select_prompt_set(CONV, "default").unwrap().context();
        assert_eq!(context.selected_prompt_set, "default");
        let context = core.select_prompt_set(CONV, "terse").unwrap().context();
        assert_eq!(context.injection, "Now: Case the bank");

        assert!(core.delete_prompt_set(CONV, false).is_err());
        let context = core.delete_prompt_set(CONV, true).unwrap().context();
        assert_eq!(context.selected_prompt_set, DEFAULT_PROMPT_SET);
        assert_eq!(core.prompt_set_names(), vec!["default"]);
    }

    #[test]
    fn test_task_export_import() {
        let (core, _generator, _store) = core_with(&[]);
        assert!(core.export_tasks(CONV).is_err());
        core.add_task(CONV, None, "One".to_string(), None).unwrap();
        core.add_task(CONV, None, "Two".to_string(), None).unwrap();

        let export = serde_json::to_value(core.export_tasks(CONV).unwrap()).unwrap();
        assert_eq!(export["version"], "1.0");

        assert!(core
            .import_tasks("other", &serde_json::json!({"description": "x"}), true)
            .is_err());
        let created = core
            .import_tasks("other", &export, false)
            .unwrap()
            .into_inner();
        assert_eq!(created, vec![1, 2]);
        let plan = core.get_plan("other").into_inner();
        assert_eq!(plan.root().children()[1].description(), "Two");
    }
}
