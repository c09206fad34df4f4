use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use superobjective::persistence::conversation_key;
use superobjective::{
    CheckOutcome, ConflictPolicy, Core, FileStore, MemoryStore, ScriptedGenerator,
    SettingsUpdate, Store, TurnType,
};

const CONV: &str = "tavern";

fn core(generator: ScriptedGenerator) -> (Core, Arc<ScriptedGenerator>) {
    let generator = Arc::new(generator);
    let core = Core::new(Arc::new(MemoryStore::new()), generator.clone());
    (core, generator)
}

#[tokio::test]
async fn generated_plan_advances_after_third_turn() {
    let (core, generator) = core(ScriptedGenerator::new([
        "1. Find the key\n2. Open the door\n3. Claim the crown",
        "true",
    ]));
    core.set_objective_description(CONV, "Win the game".to_string())
        .unwrap();

    let response = core.generate_tasks(CONV, false).await.unwrap();
    let created = response.inner().clone();
    let context = response.context();
    assert_eq!(created.len(), 3);
    assert_eq!(context.task_list.len(), 3);
    let active = context.active_task.unwrap();
    assert_eq!(active.id, created[0]);
    assert_eq!(active.elapsed_messages, 0);

    let mut checks = Vec::new();
    for _ in 0..3 {
        let report = core
            .message_received(CONV, TurnType::Normal)
            .await
            .unwrap()
            .into_inner();
        checks.extend(report.check);
    }

    assert_eq!(checks.len(), 1);
    assert!(checks[0].completed());
    assert_eq!(generator.prompts().len(), 2);

    let context = core.distilled_context(CONV).context();
    assert!(context.task_list[0].completed);
    let active = context.active_task.unwrap();
    assert_eq!(active.id, created[1]);
    assert_eq!(active.description, "Open the door");
    assert_eq!(active.elapsed_messages, 0);
}

#[tokio::test]
async fn duration_gate_holds_until_enough_messages() {
    let (core, _generator) =
        core(ScriptedGenerator::new(Vec::<String>::new()).with_fallback("true"));
    let id = core
        .add_task(CONV, None, "Chat with the bard".to_string(), None)
        .unwrap()
        .into_inner();
    core.set_duration(CONV, id, 5).unwrap();
    core.update_settings(
        CONV,
        SettingsUpdate {
            check_frequency: Some(1),
            ..Default::default()
        },
    )
    .unwrap();

    for turn in 1..=4u32 {
        let report = core
            .message_received(CONV, TurnType::Normal)
            .await
            .unwrap()
            .into_inner();
        match report.check {
            Some(CheckOutcome::Gated {
                elapsed_messages,
                duration,
                would_complete,
                ..
            }) => {
                assert_eq!(elapsed_messages, turn);
                assert_eq!(duration, 5);
                assert!(would_complete);
            }
            other => panic!("turn {}: expected a gated check, got {:?}", turn, other),
        }
    }

    let report = core
        .message_received(CONV, TurnType::Normal)
        .await
        .unwrap()
        .into_inner();
    assert!(report.check.unwrap().completed());
    let plan = core.get_plan(CONV).into_inner();
    assert!(plan.find(id).unwrap().is_completed());
}

#[tokio::test]
async fn injection_is_throttled_by_frequency() {
    let (core, _generator) = core(ScriptedGenerator::new(Vec::<String>::new()));
    core.add_task(CONV, None, "Greet the innkeeper".to_string(), None)
        .unwrap();
    core.update_settings(
        CONV,
        SettingsUpdate {
            injection_frequency: Some(3),
            check_frequency: Some(0),
            ..Default::default()
        },
    )
    .unwrap();

    let mut injected_on = Vec::new();
    for turn in 1..=7 {
        let context = core
            .message_received(CONV, TurnType::Normal)
            .await
            .unwrap()
            .context();
        if !context.injection.is_empty() {
            injected_on.push(turn);
        }
    }
    assert_eq!(injected_on, vec![1, 4, 7]);
}

#[tokio::test]
async fn task_change_forces_injection_between_throttled_turns() {
    let (core, _generator) = core(ScriptedGenerator::new(Vec::<String>::new()));
    core.add_task(CONV, None, "Greet".to_string(), None).unwrap();
    core.add_task(CONV, None, "Order a drink".to_string(), None)
        .unwrap();
    core.update_settings(
        CONV,
        SettingsUpdate {
            injection_frequency: Some(3),
            check_frequency: Some(0),
            ..Default::default()
        },
    )
    .unwrap();

    core.message_received(CONV, TurnType::Normal).await.unwrap();
    let context = core
        .message_received(CONV, TurnType::Normal)
        .await
        .unwrap()
        .context();
    assert!(context.injection.is_empty());

    let context = core.complete_active(CONV).unwrap().context();
    assert!(context.injection.contains("Order a drink"));
    assert_eq!(context.injection_counter, 0);

    // The countdown restarts from the new task
    let context = core
        .message_received(CONV, TurnType::Normal)
        .await
        .unwrap()
        .context();
    assert!(!context.injection.is_empty());
}

#[test]
fn parent_completion_follows_children() {
    let (core, _generator) = core(ScriptedGenerator::new(Vec::<String>::new()));
    let parent = core
        .add_task(CONV, None, "Prepare".to_string(), None)
        .unwrap()
        .into_inner();
    let first = core
        .add_task(CONV, Some(parent), "Pack".to_string(), None)
        .unwrap()
        .into_inner();
    let second = core
        .add_task(CONV, Some(parent), "Sharpen sword".to_string(), None)
        .unwrap()
        .into_inner();

    core.set_completed(CONV, first, true).unwrap();
    assert!(!core.get_plan(CONV).into_inner().find(parent).unwrap().is_completed());

    core.set_completed(CONV, second, true).unwrap();
    assert!(core.get_plan(CONV).into_inner().find(parent).unwrap().is_completed());

    core.set_completed(CONV, first, false).unwrap();
    let plan = core.get_plan(CONV).into_inner();
    assert!(!plan.find(parent).unwrap().is_completed());
    assert!(plan.find(second).unwrap().is_completed());
}

#[test]
fn completing_twice_is_a_no_op() {
    let (core, _generator) = core(ScriptedGenerator::new(Vec::<String>::new()));
    core.add_task(CONV, None, "Greet".to_string(), None).unwrap();

    assert!(core.complete_active(CONV).unwrap().into_inner());
    let first = core.statistics(CONV).into_inner();
    let date = first.recent_completions[0].completion_date;

    assert!(!core.complete_active(CONV).unwrap().into_inner());
    let second = core.statistics(CONV).into_inner();
    assert_eq!(second.recent_completions.len(), 1);
    assert_eq!(second.recent_completions[0].completion_date, date);
    assert_eq!(second.conversation.tasks_completed, 1);
    let context = core.distilled_context(CONV).context();
    assert_eq!(context.recently_completed.len(), 1);
}

#[test]
fn nested_plan_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path()).unwrap());
    let core = Core::new(store.clone(), Arc::new(ScriptedGenerator::new(Vec::<String>::new())));

    core.set_objective_description(CONV, "Reach the summit".to_string())
        .unwrap();
    let camp = core
        .add_task(CONV, None, "Set up camp".to_string(), None)
        .unwrap()
        .into_inner();
    let tent = core
        .add_task(CONV, Some(camp), "Pitch the tent".to_string(), None)
        .unwrap()
        .into_inner();
    let pegs = core
        .add_task(CONV, Some(tent), "Find pegs".to_string(), None)
        .unwrap()
        .into_inner();
    core.add_task(CONV, Some(tent), "Raise poles".to_string(), None)
        .unwrap();
    core.add_task(CONV, None, "Climb".to_string(), None).unwrap();
    core.set_duration(CONV, tent, 4).unwrap();
    core.set_completed(CONV, pegs, true).unwrap();

    let before = core.get_plan(CONV).into_inner();
    let context_before = core.distilled_context(CONV).context();

    let restarted = Core::new(store, Arc::new(ScriptedGenerator::new(Vec::<String>::new())));
    let after = restarted.get_plan(CONV).into_inner();
    let context_after = restarted.distilled_context(CONV).context();

    assert_eq!(before, after);
    assert_eq!(
        context_before.active_task.map(|t| t.id),
        context_after.active_task.map(|t| t.id)
    );
    assert_eq!(context_before.recently_completed, context_after.recently_completed);
}

#[test]
fn legacy_layout_is_migrated_on_load() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(
            &conversation_key("old"),
            json!({
                "objective": "Escape the dungeon",
                "tasks": [
                    { "description": "Pick the lock", "completed": true },
                    { "description": "Run", "completed": false }
                ],
                "checkFrequency": "5",
                "chatDepth": 4
            }),
        )
        .unwrap();
    let core = Core::new(store.clone(), Arc::new(ScriptedGenerator::new(Vec::<String>::new())));

    let plan = core.get_plan("old").into_inner();
    assert_eq!(plan.root().description(), "Escape the dungeon");
    assert_eq!(plan.root().children().len(), 2);
    assert!(plan.root().children()[0].is_completed());

    let context = core.distilled_context("old").context();
    assert_eq!(context.active_task.unwrap().description, "Run");
    assert_eq!(context.check_counter, 5);

    let rewritten = store.load(&conversation_key("old")).unwrap().unwrap();
    assert!(rewritten.get("taskTree").is_some());
}

#[test]
fn template_import_renames_past_existing_suffixes() {
    let (core, _generator) = core(ScriptedGenerator::new(Vec::<String>::new()));
    let document = json!({
        "templates": {
            "foo": { "description": "Foo", "tasks": [{ "description": "Step" }] }
        },
        "exportDate": "2024-05-01T12:00:00Z",
        "version": "1.0"
    });

    core.import_templates(&document, ConflictPolicy::Rename)
        .unwrap();
    core.import_templates(&document, ConflictPolicy::Rename)
        .unwrap();
    assert_eq!(core.template_names(), vec!["foo", "foo-2"]);

    let report = core
        .import_templates(&document, ConflictPolicy::Rename)
        .unwrap();
    assert_eq!(report.renamed, vec![("foo".to_string(), "foo-3".to_string())]);
    assert_eq!(core.template_names(), vec!["foo", "foo-2", "foo-3"]);

    let report = core
        .import_templates(&document, ConflictPolicy::Skip)
        .unwrap();
    assert_eq!(report.skipped, vec!["foo"]);
    assert_eq!(core.template_names().len(), 3);
}
