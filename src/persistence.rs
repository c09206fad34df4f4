//! Snapshots and the key-value stores they are written to
//!
//! A conversation is persisted as one JSON [`Snapshot`]. Loading tolerates the older flat
//! `{objective, tasks}` layout by migrating it into a root with one level of children, and
//! falls back to a fresh session on anything it cannot read.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::models::{
    CompletionRecord, Settings, Statistics, TaskId, TaskNode, TaskSummary, TaskTree, ROOT_ID,
};
use crate::prompts::{PromptSet, DEFAULT_PROMPT_SET};
use crate::session::Session;

pub const SNAPSHOT_VERSION: u32 = 2;

/// Key under which the global library is stored
pub const LIBRARY_KEY: &str = "library";

/// Key under which a conversation's snapshot is stored
pub fn conversation_key(conversation_id: &str) -> String {
    format!("conversation-{}", conversation_id)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Lock,
}

/// Everything a conversation needs to resume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub current_objective_id: Option<TaskId>,
    #[serde(default)]
    pub current_task_id: Option<TaskId>,
    pub task_tree: TaskNode,
    #[serde(flatten)]
    pub settings: Settings,
    #[serde(default)]
    pub check_counter: Option<i64>,
    #[serde(default)]
    pub recently_completed_tasks: Vec<TaskSummary>,
    #[serde(default)]
    pub upcoming_tasks: Vec<TaskSummary>,
    #[serde(default)]
    pub prompts: PromptSet,
    #[serde(default = "default_prompt_set_name")]
    pub selected_custom_prompt: String,
    #[serde(default)]
    pub completion_history: Vec<CompletionRecord>,
    #[serde(default)]
    pub statistics: Statistics,
}

fn default_prompt_set_name() -> String {
    DEFAULT_PROMPT_SET.to_string()
}

/// The flat layout written before tasks could nest
#[derive(Debug, Deserialize)]
struct LegacySnapshot {
    objective: String,
    #[serde(default)]
    tasks: Vec<LegacyTask>,
    #[serde(flatten)]
    settings: Settings,
}

#[derive(Debug, Deserialize)]
struct LegacyTask {
    #[serde(default)]
    description: String,
    #[serde(default)]
    completed: bool,
}

impl LegacySnapshot {
    fn into_snapshot(self) -> Snapshot {
        let mut root = TaskNode::new(ROOT_ID, self.objective, None);
        for (i, task) in self.tasks.into_iter().enumerate() {
            let mut child = TaskNode::new(i as TaskId + 1, task.description, Some(ROOT_ID));
            if task.completed {
                child.set_completed_flag(true);
            }
            root.children_mut().push(child);
        }
        Snapshot {
            version: SNAPSHOT_VERSION,
            current_objective_id: Some(ROOT_ID),
            current_task_id: None,
            task_tree: root,
            settings: self.settings,
            check_counter: None,
            recently_completed_tasks: Vec::new(),
            upcoming_tasks: Vec::new(),
            prompts: PromptSet::default(),
            selected_custom_prompt: default_prompt_set_name(),
            completion_history: Vec::new(),
            statistics: Statistics::default(),
        }
    }
}

/// Outcome of reading a stored conversation
#[derive(Debug)]
pub struct Loaded {
    pub session: Session,
    /// The stored data was in the legacy layout and should be written back
    pub migrated: bool,
}

/// Serializes a session into its snapshot
pub fn save(session: &Session) -> Snapshot {
    Snapshot {
        version: SNAPSHOT_VERSION,
        current_objective_id: Some(session.objective_id),
        current_task_id: session.active_task_id,
        task_tree: session.tree.root().clone(),
        settings: session.settings.clone(),
        check_counter: Some(session.check_counter),
        recently_completed_tasks: session.recently_completed.clone(),
        upcoming_tasks: session.upcoming.clone(),
        prompts: session.prompts.clone(),
        selected_custom_prompt: session.selected_prompt_set.clone(),
        completion_history: session.completion_history.clone(),
        statistics: session.statistics.clone(),
    }
}

/// Rebuilds a session from stored data, falling back to a fresh one when there is none or it
/// cannot be read
pub fn load(conversation_id: &str, stored: Option<Value>) -> Loaded {
    let Some(value) = stored else {
        debug!(conversation = conversation_id, "No stored plan, starting fresh");
        return fresh(conversation_id);
    };

    let (snapshot, migrated) = match parse_snapshot(value) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                conversation = conversation_id,
                error = %err,
                "Stored plan is unreadable, starting fresh"
            );
            return fresh(conversation_id);
        }
    };

    Loaded {
        session: restore(conversation_id, snapshot),
        migrated,
    }
}

fn fresh(conversation_id: &str) -> Loaded {
    let mut session = Session::new(conversation_id);
    session.restore_active_task(None);
    Loaded {
        session,
        migrated: false,
    }
}

fn parse_snapshot(value: Value) -> Result<(Snapshot, bool), serde_json::Error> {
    let legacy = value.get("objective").is_some_and(Value::is_string)
        && value.get("taskTree").is_none();
    if legacy {
        let old: LegacySnapshot = serde_json::from_value(value)?;
        return Ok((old.into_snapshot(), true));
    }
    Ok((serde_json::from_value(value)?, false))
}

fn restore(conversation_id: &str, snapshot: Snapshot) -> Session {
    let mut session = Session::new(conversation_id);
    session.tree = TaskTree::from_root(snapshot.task_tree);
    session.objective_id = snapshot
        .current_objective_id
        .filter(|id| session.tree.contains(*id))
        .unwrap_or(ROOT_ID);
    session.check_counter = snapshot
        .check_counter
        .unwrap_or_else(|| i64::from(snapshot.settings.check_frequency));
    session.settings = snapshot.settings;
    session.recently_completed = snapshot.recently_completed_tasks;
    session.upcoming = snapshot.upcoming_tasks;
    session.prompts = snapshot.prompts;
    session.prompts.backfill();
    session.selected_prompt_set = snapshot.selected_custom_prompt;
    session.completion_history = snapshot.completion_history;
    session.statistics = snapshot.statistics;
    session.restore_active_task(snapshot.current_task_id);
    session
}

/// Key-value store holding JSON documents
pub trait Store: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn save(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Lock)?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Lock)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// One pretty-printed JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // Safe characters stay readable; every other byte becomes `%xx`, so distinct keys never
    // share a file
    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len());
        for c in key.chars() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                name.push(c);
            } else {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    name.push('%');
                    name.push_str(&hex::encode([byte]));
                }
            }
        }
        self.dir.join(format!("{}.json", name))
    }
}

impl Store for FileStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Batches writes in memory and flushes them to an inner store periodically.
///
/// Reads see pending writes, so callers never observe their own data going backwards.
pub struct DebouncedStore {
    inner: Arc<dyn Store>,
    pending: Mutex<HashMap<String, Value>>,
}

impl DebouncedStore {
    pub fn new(inner: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Writes every pending entry to the inner store
    pub fn flush(&self) -> Result<usize, StoreError> {
        let batch = {
            let mut pending = self.pending.lock().map_err(|_| StoreError::Lock)?;
            std::mem::take(&mut *pending)
        };
        let count = batch.len();
        for (key, value) in batch {
            self.inner.save(&key, value)?;
        }
        if count > 0 {
            debug!(count, "Flushed pending writes");
        }
        Ok(count)
    }

    /// Flushes on a fixed interval until the store is dropped
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = store.flush() {
                    error!(error = %err, "Failed to flush pending writes");
                }
            }
        })
    }
}

impl Store for DebouncedStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        {
            let pending = self.pending.lock().map_err(|_| StoreError::Lock)?;
            if let Some(value) = pending.get(key) {
                return Ok(Some(value.clone()));
            }
        }
        self.inner.load(key)
    }

    fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut pending = self.pending.lock().map_err(|_| StoreError::Lock)?;
        pending.insert(key.to_string(), value);
        Ok(())
    }
}

impl Drop for DebouncedStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(error = %err, "Failed to flush pending writes on shutdown");
        }
    }
}
