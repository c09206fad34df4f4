//! CLI module
//!
//! This module provides the command-line interface for superobjective: `serve` runs the API
//! server, everything else talks to a running server through [`Client`].

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    api::{serve, Client, ClientConfig, ServerConfig},
    completion::TurnType,
    generation::{GeneratorConfig, HostState, HttpGenerator, WaitConfig},
    library::ConflictPolicy,
    models::{PlanResponse, PromptRole, SettingsUpdate, TaskId, TaskNode, TaskTreeNode},
    persistence::{DebouncedStore, FileStore, MemoryStore, Store},
    Core,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API server URL
    #[arg(
        short,
        long,
        env = "SUPEROBJECTIVE_SERVER",
        default_value = "http://localhost:3000"
    )]
    server: String,

    /// Conversation the command applies to
    #[arg(
        short,
        long,
        global = true,
        env = "SUPEROBJECTIVE_CONVERSATION",
        default_value = "default"
    )]
    conversation: String,
}

#[derive(Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Directory for persisted plans and the library; in-memory when absent
    #[arg(long, env = "SUPEROBJECTIVE_STORE")]
    store: Option<PathBuf>,

    /// OpenAI-compatible base URL of the generation service
    #[arg(
        long,
        env = "SUPEROBJECTIVE_GENERATOR_URL",
        default_value = "http://localhost:5001/v1"
    )]
    generator_url: String,

    /// Model name sent to the generation service
    #[arg(long, env = "SUPEROBJECTIVE_MODEL", default_value = "default")]
    model: String,

    /// Environment variable holding the generation service's API key
    #[arg(long, default_value = "SUPEROBJECTIVE_API_KEY")]
    api_key_env: String,

    #[arg(long, default_value_t = 512)]
    max_tokens: u32,

    /// Seconds a completion check waits for the host to go idle
    #[arg(long, default_value_t = 30)]
    wait_timeout: u64,

    /// Milliseconds between store flushes
    #[arg(long, default_value_t = 500)]
    debounce_ms: u64,
}

#[derive(Args)]
struct SettingsArgs {
    #[arg(long)]
    chat_depth: Option<u32>,
    /// Turns between completion checks; 0 disables them
    #[arg(long)]
    check_frequency: Option<u32>,
    #[arg(long)]
    swipes_decrement: Option<bool>,
    #[arg(long)]
    injection_frequency: Option<u32>,
    /// system, user or assistant
    #[arg(long)]
    prompt_role: Option<PromptRole>,
    #[arg(long)]
    show_completed: Option<bool>,
    #[arg(long)]
    completed_count: Option<u32>,
    #[arg(long)]
    show_upcoming: Option<bool>,
    #[arg(long)]
    upcoming_count: Option<u32>,
    #[arg(long)]
    hide_tasks: Option<bool>,
}

impl From<&SettingsArgs> for SettingsUpdate {
    fn from(args: &SettingsArgs) -> Self {
        SettingsUpdate {
            chat_depth: args.chat_depth,
            check_frequency: args.check_frequency,
            swipes_decrement: args.swipes_decrement,
            injection_frequency: args.injection_frequency,
            prompt_role: args.prompt_role,
            show_completed_tasks: args.show_completed,
            completed_tasks_count: args.completed_count,
            show_upcoming_tasks: args.show_upcoming,
            upcoming_tasks_count: args.upcoming_count,
            hide_tasks: args.hide_tasks,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the superobjective API server
    Serve(ServeArgs),

    /// Show the task tree
    Plan,

    /// Get a distilled context of the conversation's plan
    Distilled,

    /// Show progress statistics
    Stats,

    /// Add a task under the current objective (or --parent)
    Add {
        description: String,

        #[arg(long)]
        parent: Option<TaskId>,

        /// Position among the parent's children; appended when absent
        #[arg(long)]
        index: Option<usize>,
    },

    /// Remove a task and its subtasks
    Remove {
        id: TaskId,

        /// Confirm removing a task that has subtasks
        #[arg(short, long)]
        yes: bool,
    },

    /// Mark a task (and its subtasks) completed
    Complete { id: TaskId },

    /// Mark a task (and its subtasks) incomplete
    Uncomplete { id: TaskId },

    /// Complete the active task without asking the generation service
    Done,

    /// Ask the generation service whether the active task is complete
    Check,

    /// Replace the objective's tasks with a generated list
    Generate,

    /// Append generated tasks to the objective
    #[command(name = "generate-more")]
    GenerateMore,

    /// Set the objective's description
    Objective { description: String },

    /// Make a task the current objective
    Branch { id: TaskId },

    /// Move the objective to its parent
    Up,

    /// Report a received message
    Turn {
        /// normal, continue, quiet or impersonate
        #[arg(long, default_value = "normal")]
        turn_type: TurnType,
    },

    /// Report that the last message was regenerated
    Swipe,

    /// Switch to the conversation given by --conversation
    Switch,

    /// Change conversation settings
    Settings(SettingsArgs),

    /// Export the objective's tasks as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the objective's tasks with an exported list
    Import {
        file: PathBuf,

        /// Confirm replacing existing tasks
        #[arg(short, long)]
        yes: bool,
    },

    /// Task-list templates
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },

    /// Prompt sets
    Prompts {
        #[command(subcommand)]
        command: PromptCommands,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Save the objective's tasks as a template
    Save { name: String },

    /// Replace the objective's tasks with a template
    Load {
        name: String,

        #[arg(short, long)]
        yes: bool,
    },

    Delete {
        name: String,

        #[arg(short, long)]
        yes: bool,
    },

    List,

    /// Export templates as JSON (all when no names are given)
    Export {
        names: Vec<String>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    Import {
        file: PathBuf,

        /// overwrite, skip or rename
        #[arg(long, default_value = "rename")]
        policy: ConflictPolicy,
    },
}

#[derive(Subcommand)]
enum PromptCommands {
    /// Use a named prompt set for this conversation
    Select { name: String },

    /// Save this conversation's prompts as a new set
    New { name: String },

    /// Overwrite the selected set with this conversation's prompts
    Save,

    /// Delete the selected set
    Delete {
        #[arg(short, long)]
        yes: bool,
    },

    List,

    /// Export custom prompt sets as JSON (all when no names are given)
    Export {
        names: Vec<String>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    Import {
        file: PathBuf,

        /// overwrite, skip or rename
        #[arg(long, default_value = "rename")]
        policy: ConflictPolicy,
    },
}

/// Run the CLI application
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let conversation = cli.conversation.as_str();

    match &cli.command {
        Commands::Serve(args) => run_server(args).await,

        Commands::Completions { shell } => {
            // Generate completions for the specified shell
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, bin_name, &mut io::stdout());
            Ok(())
        }

        Commands::Plan => {
            let client = create_client(&cli.server);
            let response = client.get_plan(conversation).await?;
            print_response(&response, |tree| {
                let active = response
                    .distilled_context
                    .active_task
                    .as_ref()
                    .map(|t| t.id);
                println!("{}", "Task tree:".bold());
                if tree.root().is_leaf() {
                    println!("  No tasks yet. Add some with 'superobjective add'");
                }
                print_task(tree.root(), active, 0);
            });
            Ok(())
        }

        Commands::Distilled => {
            let client = create_client(&cli.server);
            let response = client.distilled_context(conversation).await?;
            print_distilled_context_response(&response);
            Ok(())
        }

        Commands::Stats => {
            let client = create_client(&cli.server);
            let stats = client.statistics(conversation).await?.into_inner();
            println!("{}", "Conversation:".bold());
            println!(
                "  {} of {} tasks completed ({}%)",
                stats.completed_tasks, stats.total_tasks, stats.completion_rate
            );
            println!(
                "  Created: {}  Completed: {}  Objectives completed: {}",
                stats.conversation.tasks_created,
                stats.conversation.tasks_completed,
                stats.conversation.objectives_completed
            );
            println!("{}", "All conversations:".bold());
            println!(
                "  Created: {}  Completed: {}  Objectives completed: {}",
                stats.global.tasks_created,
                stats.global.tasks_completed,
                stats.global.objectives_completed
            );
            if !stats.recent_completions.is_empty() {
                println!("{}", "Recent completions:".bold());
                for record in &stats.recent_completions {
                    println!(
                        "  {} {} ({})",
                        record.completion_date.format("%Y-%m-%d %H:%M"),
                        record.description,
                        record.objective_description.dimmed()
                    );
                }
            }
            Ok(())
        }

        Commands::Add {
            description,
            parent,
            index,
        } => {
            let client = create_client(&cli.server);
            let response = client
                .add_task(conversation, *parent, description.clone(), *index)
                .await?;
            print_response(&response, |id| {
                println!("Added task {}: \"{}\"", id, description);
            });
            Ok(())
        }

        Commands::Remove { id, yes } => {
            let client = create_client(&cli.server);
            let response = client.remove_task(conversation, *id, *yes).await?;
            print_response(&response, |removed| {
                println!("Removed task {}: \"{}\"", removed.id(), removed.description());
            });
            Ok(())
        }

        Commands::Complete { id } | Commands::Uncomplete { id } => {
            let completed = matches!(cli.command, Commands::Complete { .. });
            let client = create_client(&cli.server);
            let response = client.set_completed(conversation, *id, completed).await?;
            print_response(&response, |changed| {
                let state = if completed { "completed" } else { "incomplete" };
                if *changed {
                    println!("Marked task {} {}", id, state);
                } else {
                    println!("Task {} was already {}", id, state);
                }
            });
            Ok(())
        }

        Commands::Done => {
            let client = create_client(&cli.server);
            let response = client.complete_active(conversation).await?;
            print_response(&response, |changed| {
                if *changed {
                    println!("{}", "Completed the active task".green());
                } else {
                    println!("The active task was already complete");
                }
            });
            Ok(())
        }

        Commands::Check => {
            let client = create_client(&cli.server);
            let completed = client.check_now(conversation).await?;
            if completed {
                println!("{}", "true".green());
            } else {
                println!("{}", "false".yellow());
            }
            Ok(())
        }

        Commands::Generate | Commands::GenerateMore => {
            let additional = matches!(cli.command, Commands::GenerateMore);
            let client = create_client(&cli.server);
            let response = client.generate(conversation, additional).await?;
            print_response(&response, |created| {
                println!("Generated {} tasks", created.len());
            });
            Ok(())
        }

        Commands::Objective { description } => {
            let client = create_client(&cli.server);
            let response = client
                .set_objective(conversation, description.clone())
                .await?;
            print_distilled_context_response(&response);
            Ok(())
        }

        Commands::Branch { id } => {
            let client = create_client(&cli.server);
            let response = client.branch(conversation, *id).await?;
            print_distilled_context_response(&response);
            Ok(())
        }

        Commands::Up => {
            let client = create_client(&cli.server);
            let response = client.ascend(conversation).await?;
            print_response(&response, |moved| {
                if !*moved {
                    println!("Already at the top-level objective");
                }
            });
            Ok(())
        }

        Commands::Turn { turn_type } => {
            let client = create_client(&cli.server);
            let response = client.turn(conversation, *turn_type).await?;
            print_response(&response, |report| {
                if let Some(outcome) = &report.check {
                    println!("Completion check: {:?}", outcome);
                }
            });
            Ok(())
        }

        Commands::Swipe => {
            let client = create_client(&cli.server);
            client.swipe(conversation).await?;
            println!("Recorded swipe");
            Ok(())
        }

        Commands::Switch => {
            let client = create_client(&cli.server);
            let response = client.switch_conversation(conversation).await?;
            print_distilled_context_response(&response);
            Ok(())
        }

        Commands::Settings(args) => {
            let client = create_client(&cli.server);
            let response = client
                .update_settings(conversation, &SettingsUpdate::from(args))
                .await?;
            println!("{}", serde_json::to_string_pretty(response.inner())?);
            Ok(())
        }

        Commands::Export { output } => {
            let client = create_client(&cli.server);
            let export = client.export_tasks(conversation).await?;
            write_json(&serde_json::to_value(export)?, output.as_ref())
        }

        Commands::Import { file, yes } => {
            let client = create_client(&cli.server);
            let document = read_json(file)?;
            let response = client.import_tasks(conversation, &document, *yes).await?;
            print_response(&response, |created| {
                println!("Imported {} tasks", created.len());
            });
            Ok(())
        }

        Commands::Template { command } => {
            let client = create_client(&cli.server);
            match command {
                TemplateCommands::Save { name } => {
                    client.save_template(conversation, name).await?;
                    println!("Saved template '{}'", name);
                }
                TemplateCommands::Load { name, yes } => {
                    let response = client.load_template(conversation, name, *yes).await?;
                    print_response(&response, |created| {
                        println!("Loaded {} tasks from '{}'", created.len(), name);
                    });
                }
                TemplateCommands::Delete { name, yes } => {
                    let deleted = client.delete_template(name, *yes).await?;
                    println!("Deleted template '{}'", deleted);
                }
                TemplateCommands::List => print_names(&client.template_names().await?),
                TemplateCommands::Export { names, output } => {
                    let export = client.export_templates(names).await?;
                    write_json(&serde_json::to_value(export)?, output.as_ref())?;
                }
                TemplateCommands::Import { file, policy } => {
                    let report = client.import_templates(&read_json(file)?, *policy).await?;
                    print_import_report(&report);
                }
            }
            Ok(())
        }

        Commands::Prompts { command } => {
            let client = create_client(&cli.server);
            match command {
                PromptCommands::Select { name } => {
                    let response = client.select_prompt_set(conversation, name).await?;
                    print_distilled_context_response(&response);
                }
                PromptCommands::New { name } => {
                    client.new_prompt_set(conversation, name).await?;
                    println!("Created prompt set '{}'", name);
                }
                PromptCommands::Save => {
                    let response = client.save_prompt_set(conversation).await?;
                    println!(
                        "Saved prompt set '{}'",
                        response.distilled_context.selected_prompt_set
                    );
                }
                PromptCommands::Delete { yes } => {
                    let response = client.delete_prompt_set(conversation, *yes).await?;
                    println!(
                        "Deleted; now using '{}'",
                        response.distilled_context.selected_prompt_set
                    );
                }
                PromptCommands::List => print_names(&client.prompt_set_names().await?),
                PromptCommands::Export { names, output } => {
                    let export = client.export_prompt_sets(names).await?;
                    write_json(&serde_json::to_value(export)?, output.as_ref())?;
                }
                PromptCommands::Import { file, policy } => {
                    let report = client
                        .import_prompt_sets(&read_json(file)?, *policy)
                        .await?;
                    print_import_report(&report);
                }
            }
            Ok(())
        }
    }
}

async fn run_server(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let inner: Arc<dyn Store> = match &args.store {
        Some(dir) => Arc::new(FileStore::new(dir.clone())?),
        None => {
            tracing::warn!("No store directory given, plans will not outlive the process");
            Arc::new(MemoryStore::new())
        }
    };
    let store = DebouncedStore::new(inner);
    let flusher = store.spawn_flusher(Duration::from_millis(args.debounce_ms));

    let generator = HttpGenerator::new(GeneratorConfig {
        base_url: args.generator_url.clone(),
        model: args.model.clone(),
        api_key_env: Some(args.api_key_env.clone()),
        max_tokens: args.max_tokens,
        ..Default::default()
    })?;

    let host = Arc::new(HostState::default());
    let core = Core::new(store.clone(), Arc::new(generator))
        .with_host(host.clone())
        .with_wait(WaitConfig {
            timeout: Duration::from_secs(args.wait_timeout),
            ..Default::default()
        });

    println!("Starting superobjective API server on port {}...", args.port);
    let config = ServerConfig {
        address: ([127, 0, 0, 1], args.port).into(),
    };
    let result = serve(core, host, config).await;

    flusher.abort();
    let flushed = store.flush()?;
    tracing::info!(flushed, "Flushed pending writes on shutdown");
    result
}

fn create_client(server_url: &str) -> Client {
    let config = ClientConfig {
        base_url: server_url.to_string(),
    };
    Client::with_config(config)
}

fn read_json(path: &PathBuf) -> Result<Value, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn write_json(value: &Value, output: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let text = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, text)?;
            println!("Wrote {}", path.display());
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn print_names(names: &[String]) {
    if names.is_empty() {
        println!("(none)");
    }
    for name in names {
        println!("  {}", name);
    }
}

fn print_import_report(report: &crate::library::ImportReport) {
    println!(
        "Imported {}, overwrote {}, skipped {}",
        report.imported.len(),
        report.overwritten.len(),
        report.skipped.len()
    );
    if !report.skipped.is_empty() {
        println!("  skipped: {}", report.skipped.join(", "));
    }
    for (from, to) in &report.renamed {
        println!("  renamed '{}' to '{}'", from, to);
    }
}

/// Generic function to print any PlanResponse<T>
/// Takes a closure to handle printing the inner value
fn print_response<T, F>(response: &PlanResponse<T>, print_inner: F)
where
    F: FnOnce(&T),
{
    print_inner(response.inner());
    print_distilled_context_response(response);
}

/// Recursively prints a task and its subtasks with proper indentation
fn print_task(task: &TaskNode, active: Option<TaskId>, depth: usize) {
    if !task.is_root() {
        let indent = "  ".repeat(depth);
        let marker = if Some(task.id()) == active {
            "→ "
        } else {
            "  "
        };
        let status = if task.is_completed() {
            "[✓]".green()
        } else {
            "[ ]".normal()
        };
        let gate = if task.duration() > 0 {
            format!(" ({}/{} messages)", task.elapsed_messages(), task.duration())
        } else {
            String::new()
        };
        println!(
            "{}{}{} {} {}{}",
            indent,
            marker,
            status,
            task.id().to_string().dimmed(),
            task.description(),
            gate.dimmed()
        );
    }
    let depth = if task.is_root() { depth } else { depth + 1 };
    for child in task.children() {
        print_task(child, active, depth);
    }
}

/// Print a distilled context from any PlanResponse
fn print_distilled_context_response<T>(response: &PlanResponse<T>) {
    let context = &response.distilled_context;

    println!("\n{}\n", "=== DISTILLED CONTEXT ===".bold());

    println!("{}", "OBJECTIVE:".bold());
    if context.objective.description.is_empty() {
        println!("  (no description)");
    } else {
        println!("  {}", context.objective.description);
    }
    println!();

    println!("{}", "ACTIVE TASK:".bold());
    match &context.active_task {
        Some(task) => {
            println!("  {} {}", task.id.to_string().dimmed(), task.description.cyan());
            if let Some(parent) = &task.parent {
                println!("  Parent: {}", parent);
            }
            if task.duration > 0 {
                println!(
                    "  Messages: {}/{}",
                    task.elapsed_messages, task.duration
                );
            }
        }
        None => println!("  None"),
    }
    println!(
        "  Next check in {} turns, injection counter {}",
        context.check_counter, context.injection_counter
    );
    println!();

    println!("{}", "TASKS:".bold());
    print_task_list(&context.task_list);

    if !context.recently_completed.is_empty() {
        println!("\n{}", "RECENTLY COMPLETED:".bold());
        for task in &context.recently_completed {
            println!("  {}", task.description);
        }
    }
    if !context.upcoming.is_empty() {
        println!("\n{}", "UPCOMING:".bold());
        for task in &context.upcoming {
            println!("  {}", task.description);
        }
    }

    if !context.injection.is_empty() {
        println!("\n{}", "INJECTED:".bold());
        println!("  {}", context.injection);
    }

    if let Some(entry) = context.transition_history.last() {
        println!(
            "\nLast change: {} {}",
            entry.action,
            entry.details.as_deref().unwrap_or("")
        );
    }
    println!();
}

fn print_task_list(nodes: &[TaskTreeNode]) {
    if nodes.is_empty() {
        println!("  (empty)");
    }
    for node in nodes {
        // Create indicator for current task
        let current_indicator = if node.is_active { "→ " } else { "  " };
        let completion_status = if node.completed { "[✓]" } else { "[ ]" };
        let children = if node.child_count > 0 {
            format!(" (+{} subtasks)", node.child_count)
        } else {
            String::new()
        };
        println!(
            "{}{} {}{}",
            current_indicator, completion_status, node.description, children
        );
    }
}
