//! The global library of prompt sets and task-list templates
//!
//! The library outlives any single conversation. It also carries the global statistics.
//! Imports are validated in full before anything is merged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::models::{StatEvent, Statistics, TaskNode, TaskSeed};
use crate::prompts::{default_prompts, PromptSet, DEFAULT_PROMPT_SET};

pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing or malformed field '{0}'")]
    MissingField(&'static str),
    #[error("'{0}' contains no entries")]
    Empty(&'static str),
}

/// How name collisions are resolved during an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    Overwrite,
    Skip,
    #[default]
    Rename,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "skip" => Ok(ConflictPolicy::Skip),
            "rename" => Ok(ConflictPolicy::Rename),
            other => Err(format!("unknown conflict policy '{}'", other)),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Skip => "skip",
            ConflictPolicy::Rename => "rename",
        };
        f.write_str(name)
    }
}

/// What an import did with each incoming name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub overwritten: Vec<String>,
    pub skipped: Vec<String>,
    /// `(incoming name, stored name)`
    pub renamed: Vec<(String, String)>,
}

/// A reusable list of tasks for an objective
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<TaskSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateExport {
    pub templates: BTreeMap<String, TaskTemplate>,
    pub export_date: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSetExport {
    pub custom_prompts: BTreeMap<String, PromptSet>,
    pub export_date: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tasks: Vec<TaskNode>,
    pub export_date: DateTime<Utc>,
    pub version: String,
}

/// A validated task import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskImport {
    pub description: Option<String>,
    pub tasks: Vec<TaskSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    #[serde(default)]
    prompt_sets: BTreeMap<String, PromptSet>,
    #[serde(default)]
    templates: BTreeMap<String, TaskTemplate>,
    #[serde(default)]
    statistics: Statistics,
}

impl Default for Library {
    fn default() -> Self {
        let mut library = Self {
            prompt_sets: BTreeMap::new(),
            templates: BTreeMap::new(),
            statistics: Statistics::default(),
        };
        library.ensure_default();
        library
    }
}

impl Library {
    /// Puts the built-in set back in place and backfills partial sets
    pub fn ensure_default(&mut self) {
        self.prompt_sets
            .insert(DEFAULT_PROMPT_SET.to_string(), default_prompts());
        for set in self.prompt_sets.values_mut() {
            set.backfill();
        }
    }

    pub fn prompt_set_names(&self) -> Vec<String> {
        self.prompt_sets.keys().cloned().collect()
    }

    pub fn prompt_set(&self, name: &str) -> Option<&PromptSet> {
        self.prompt_sets.get(name)
    }

    /// Stores a set under a new name
    pub fn add_prompt_set(&mut self, name: &str, prompts: PromptSet) -> Result<(), String> {
        let name = validate_name(name)?;
        if self.prompt_sets.contains_key(name) {
            return Err(format!("a prompt set named '{}' already exists", name));
        }
        self.prompt_sets.insert(name.to_string(), prompts);
        Ok(())
    }

    /// Overwrites an existing, non-default set
    pub fn update_prompt_set(&mut self, name: &str, prompts: PromptSet) -> Result<(), String> {
        if name == DEFAULT_PROMPT_SET {
            return Err("the default prompt set cannot be changed".to_string());
        }
        match self.prompt_sets.get_mut(name) {
            Some(slot) => {
                *slot = prompts;
                Ok(())
            }
            None => Err(format!("no prompt set named '{}'", name)),
        }
    }

    pub fn remove_prompt_set(&mut self, name: &str) -> Result<PromptSet, String> {
        if name == DEFAULT_PROMPT_SET {
            return Err("the default prompt set cannot be deleted".to_string());
        }
        self.prompt_sets
            .remove(name)
            .ok_or_else(|| format!("no prompt set named '{}'", name))
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    pub fn template(&self, name: &str) -> Option<&TaskTemplate> {
        self.templates.get(name)
    }

    /// Stores a template, replacing any template with the same name
    pub fn put_template(&mut self, name: &str, template: TaskTemplate) -> Result<(), String> {
        let name = validate_name(name)?;
        self.templates.insert(name.to_string(), template);
        Ok(())
    }

    pub fn remove_template(&mut self, name: &str) -> Option<TaskTemplate> {
        self.templates.remove(name)
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub(crate) fn record(&mut self, events: &[StatEvent]) {
        for event in events {
            self.statistics.record(event);
        }
    }

    pub fn export_templates(&self, names: &[String]) -> TemplateExport {
        TemplateExport {
            templates: select(&self.templates, names),
            export_date: Utc::now(),
            version: EXPORT_VERSION.to_string(),
        }
    }

    /// Exports the named custom sets, or all of them when `names` is empty.
    /// The built-in set is never exported.
    pub fn export_prompt_sets(&self, names: &[String]) -> PromptSetExport {
        let mut custom_prompts = select(&self.prompt_sets, names);
        custom_prompts.remove(DEFAULT_PROMPT_SET);
        PromptSetExport {
            custom_prompts,
            export_date: Utc::now(),
            version: EXPORT_VERSION.to_string(),
        }
    }

    pub fn import_templates(
        &mut self,
        document: &Value,
        policy: ConflictPolicy,
    ) -> Result<ImportReport, ImportError> {
        let incoming: Vec<(String, TaskTemplate)> = parse_entries(document, "templates")?;
        Ok(merge_named(&mut self.templates, incoming, policy, |_| false))
    }

    /// Imports prompt sets; entries may be partial and are backfilled. The built-in name is
    /// always treated as taken.
    pub fn import_prompt_sets(
        &mut self,
        document: &Value,
        policy: ConflictPolicy,
    ) -> Result<ImportReport, ImportError> {
        let mut incoming: Vec<(String, PromptSet)> = parse_entries(document, "customPrompts")?;
        for (_, set) in &mut incoming {
            set.backfill();
        }
        let report = merge_named(&mut self.prompt_sets, incoming, policy, |name| {
            name == DEFAULT_PROMPT_SET
        });
        self.ensure_default();
        Ok(report)
    }
}

fn validate_name(name: &str) -> Result<&str, String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    Ok(name)
}

fn select<T: Clone>(map: &BTreeMap<String, T>, names: &[String]) -> BTreeMap<String, T> {
    map.iter()
        .filter(|(name, _)| names.is_empty() || names.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Reads `document[field]` as a non-empty object of named entries
fn parse_entries<T>(document: &Value, field: &'static str) -> Result<Vec<(String, T)>, ImportError>
where
    T: serde::de::DeserializeOwned,
{
    let entries = document
        .get(field)
        .and_then(Value::as_object)
        .ok_or(ImportError::MissingField(field))?;
    if entries.is_empty() {
        return Err(ImportError::Empty(field));
    }
    entries
        .iter()
        .map(|(name, value)| {
            let name = name.trim();
            if name.is_empty() {
                return Err(ImportError::MissingField(field));
            }
            Ok((name.to_string(), serde_json::from_value(value.clone())?))
        })
        .collect()
}

/// Validates a task export document
pub fn parse_task_import(document: &Value) -> Result<TaskImport, ImportError> {
    let tasks = document
        .get("tasks")
        .filter(|tasks| tasks.is_array())
        .ok_or(ImportError::MissingField("tasks"))?;
    let tasks: Vec<TaskSeed> = serde_json::from_value(tasks.clone())?;
    let description = document
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(TaskImport { description, tasks })
}

/// Merges `incoming` into `existing` according to `policy`.
///
/// Renamed entries take the first free `name-N` (N ≥ 2), checked against everything already
/// stored, including entries renamed earlier in the same import.
fn merge_named<T, F>(
    existing: &mut BTreeMap<String, T>,
    incoming: Vec<(String, T)>,
    policy: ConflictPolicy,
    reserved: F,
) -> ImportReport
where
    F: Fn(&str) -> bool,
{
    let mut report = ImportReport::default();
    let taken = |map: &BTreeMap<String, T>, name: &str| map.contains_key(name) || reserved(name);

    for (name, value) in incoming {
        if !taken(&*existing, &name) {
            existing.insert(name.clone(), value);
            report.imported.push(name);
            continue;
        }
        match policy {
            ConflictPolicy::Skip => report.skipped.push(name),
            ConflictPolicy::Overwrite if reserved(&name) => report.skipped.push(name),
            ConflictPolicy::Overwrite => {
                existing.insert(name.clone(), value);
                report.overwritten.push(name);
            }
            ConflictPolicy::Rename => {
                let mut suffix = 2;
                let mut candidate = format!("{}-{}", name, suffix);
                while taken(&*existing, &candidate) {
                    suffix += 1;
                    candidate = format!("{}-{}", name, suffix);
                }
                existing.insert(candidate.clone(), value);
                report.renamed.push((name, candidate));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn template(description: &str) -> TaskTemplate {
        TaskTemplate {
            description: description.to_string(),
            tasks: vec![TaskSeed::new("step")],
        }
    }

    #[test]
    fn test_rename_picks_first_free_suffix() {
        let mut library = Library::default();
        library.put_template("foo", template("a")).unwrap();
        library.put_template("foo-2", template("b")).unwrap();

        let document = json!({"templates": {"foo": {"description": "c", "tasks": []}}});
        let report = library
            .import_templates(&document, ConflictPolicy::Rename)
            .unwrap();
        assert_eq!(
            report.renamed,
            vec![("foo".to_string(), "foo-3".to_string())]
        );
        assert_eq!(library.template("foo-3").unwrap().description, "c");
        assert_eq!(library.template("foo").unwrap().description, "a");
    }

    #[test]
    fn test_rename_accounts_for_entries_renamed_in_same_import() {
        let mut library = Library::default();
        library.put_template("foo", template("a")).unwrap();

        let document = json!({"templates": {
            "foo": {"description": "first"},
            "foo-2": {"description": "second"}
        }});
        let report = library
            .import_templates(&document, ConflictPolicy::Rename)
            .unwrap();
        assert_eq!(
            report.renamed,
            vec![
                ("foo".to_string(), "foo-2".to_string()),
                ("foo-2".to_string(), "foo-2-2".to_string())
            ]
        );
        assert_eq!(library.template_names().len(), 3);
    }

    #[test]
    fn test_skip_and_overwrite_policies() {
        let mut library = Library::default();
        library.put_template("foo", template("old")).unwrap();
        let document = json!({"templates": {
            "foo": {"description": "new"},
            "bar": {"description": "bar"}
        }});

        let report = library
            .import_templates(&document, ConflictPolicy::Skip)
            .unwrap();
        assert_eq!(report.skipped, vec!["foo"]);
        assert_eq!(report.imported, vec!["bar"]);
        assert_eq!(library.template("foo").unwrap().description, "old");

        let report = library
            .import_templates(&document, ConflictPolicy::Overwrite)
            .unwrap();
        assert_eq!(report.overwritten, vec!["bar", "foo"]);
        assert_eq!(library.template("foo").unwrap().description, "new");
    }

    #[test]
    fn test_invalid_documents_are_rejected_without_changes() {
        let mut library = Library::default();
        let before = library.template_names();

        assert!(matches!(
            library.import_templates(&json!({"nope": {}}), ConflictPolicy::Rename),
            Err(ImportError::MissingField("templates"))
        ));
        assert!(matches!(
            library.import_templates(&json!({"templates": {}}), ConflictPolicy::Rename),
            Err(ImportError::Empty("templates"))
        ));
        assert!(matches!(
            library.import_templates(
                &json!({"templates": {"ok": {"tasks": []}, "bad": {"tasks": 5}}}),
                ConflictPolicy::Rename
            ),
            Err(ImportError::Json(_))
        ));
        assert_eq!(library.template_names(), before);
    }

    #[test]
    fn test_default_prompt_set_is_protected() {
        let mut library = Library::default();
        assert!(library.remove_prompt_set(DEFAULT_PROMPT_SET).is_err());
        assert!(library
            .update_prompt_set(DEFAULT_PROMPT_SET, default_prompts())
            .is_err());

        let document = json!({"customPrompts": {
            "default": {"currentTask": "hijack"},
            "mine": {"currentTask": "Do {{task}}"}
        }});
        let report = library
            .import_prompt_sets(&document, ConflictPolicy::Overwrite)
            .unwrap();
        assert_eq!(report.skipped, vec!["default"]);
        assert_eq!(
            library.prompt_set(DEFAULT_PROMPT_SET).unwrap(),
            &default_prompts()
        );
        let mine = library.prompt_set("mine").unwrap();
        assert_eq!(mine.current_task, "Do {{task}}");
        assert_eq!(mine.create_task, default_prompts().create_task);

        let export = library.export_prompt_sets(&[]);
        assert_eq!(export.custom_prompts.keys().collect::<Vec<_>>(), vec!["mine"]);
        assert_eq!(export.version, EXPORT_VERSION);
    }

    #[test]
    fn test_task_import_requires_tasks_array() {
        assert!(matches!(
            parse_task_import(&json!({"description": "x"})),
            Err(ImportError::MissingField("tasks"))
        ));
        let parsed = parse_task_import(&json!({
            "description": "Escape",
            "tasks": [{"id": 4, "description": "Run", "completed": true, "parentId": 0,
                       "children": [{"description": "Faster"}]}]
        }))
        .unwrap();
        assert_eq!(parsed.description.as_deref(), Some("Escape"));
        assert!(parsed.tasks[0].completed);
        assert_eq!(parsed.tasks[0].children[0].description, "Faster");
    }
}
