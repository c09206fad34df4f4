//! Superobjective library crate
//!
//! Hierarchical objective/task plans that steer a conversational generation loop. A
//! [`Core`] keeps one plan per conversation, points at the active task, periodically asks a
//! generation service whether that task is done, and keeps an injected prompt block in sync
//! with the plan.

pub mod api;
pub mod cli;
pub mod completion;
pub mod generation;
pub mod injection;
pub mod library;
pub mod models;
pub mod navigator;
pub mod persistence;
pub mod prompts;
pub mod runtime;
pub mod session;
pub mod template;

pub use crate::completion::{CheckOutcome, TurnType, Verdict};
pub use crate::generation::{Generator, HostActivity, HostState, ScriptedGenerator};
pub use crate::injection::Injection;
pub use crate::library::{ConflictPolicy, ImportReport, Library};
pub use crate::models::{
    DistilledContext, PlanError, PlanResponse, Settings, SettingsUpdate, TaskError, TaskId,
    TaskNode, TaskTree,
};
pub use crate::persistence::{DebouncedStore, FileStore, MemoryStore, Store};
pub use crate::prompts::{PromptKind, PromptSet};
pub use crate::runtime::{Core, StatsView, TurnReport};
pub use crate::session::Session;
