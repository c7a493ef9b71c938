use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use redb::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::checkpoint::{ApprovalDecision, Arguments, ResumeValue};
use tether_core::permission::{Effect, Rule, RuleOrigin};
use tether_core::task::{AUTHOR_HUMAN, NewTask, TaskId, TaskStatus, TaskUpdate};
use tether_core::telemetry::{TelemetryConfig, init_telemetry};
use tether_db::checkpoint_store::CheckpointStore;
use tether_db::task_store::TaskStore;
use tether_runner::{
    CapabilityRegistry, EventBus, ExecutionEngine, PermissionService, PlanReasoner,
    ResumeGateway, Scheduler,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "tether",
    about = "Single-flight task scheduler with durable human-in-the-loop suspension"
)]
struct Cli {
    /// Path to the database file.
    #[arg(long, default_value = "tether.redb")]
    db: PathBuf,

    /// Path to tether.toml (scheduler and permission settings).
    #[arg(long, default_value = "tether.toml")]
    config: PathBuf,

    /// Directory for daily JSONL log files.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Output JSON-structured logs to console.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler loop.
    Run {
        /// Run a single cycle then stop.
        #[arg(long)]
        once: bool,
        /// Also serve the HTTP API on this address.
        #[arg(long)]
        serve: Option<String>,
    },
    /// Start the HTTP API server without the scheduler.
    Serve {
        /// Bind address.
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: String,
    },
    /// Manage tasks in the queue.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Answer a task waiting on human input.
    Respond {
        id: TaskId,
        /// Free-form answer to a question.
        #[arg(long, conflicts_with = "decision", required_unless_present = "decision")]
        text: Option<String>,
        /// approve, always_allow, or deny.
        #[arg(long)]
        decision: Option<ApprovalDecision>,
        /// Note to attach to the decision.
        #[arg(long, requires = "decision")]
        message: Option<String>,
    },
    /// Inspect permission rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Show queue counts, the running task, and who is waiting.
    Status,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Add a new task to the queue.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        desc: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// JSON list of planned capability calls.
        #[arg(long)]
        plan: Option<String>,
    },
    /// List tasks.
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Show a task and its checkpoint.
    Show { id: TaskId },
    /// Append a comment.
    Comment {
        id: TaskId,
        text: String,
        #[arg(long, default_value = AUTHOR_HUMAN)]
        author: String,
    },
    /// Set a task's status (for operational recovery).
    SetStatus {
        id: TaskId,
        #[arg(long)]
        status: TaskStatus,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// List static and learned rules.
    List,
    /// Show what the policy decides for a capability call.
    Check {
        capability: String,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry_config = TelemetryConfig {
        json_logs: cli.json_logs,
        log_dir: cli.log_dir.clone(),
        ..TelemetryConfig::default()
    };
    let _telemetry_guard = init_telemetry(&telemetry_config)?;

    let db = Arc::new(tether_db::open_db(&cli.db)?);

    match cli.command {
        Commands::Run { once, serve } => cmd_run(db, cli.config, once, serve).await,
        Commands::Serve { bind } => {
            let events = EventBus::new();
            let (permissions, _) = PermissionService::start(Arc::clone(&db), cli.config, events.clone())?;
            let permissions = Arc::new(permissions);
            let state = Arc::new(tether_api::ApiState::new(db, events, permissions));
            tether_api::serve(state, &bind).await
        }
        Commands::Task { action } => cmd_task(&db, action),
        Commands::Respond {
            id,
            text,
            decision,
            message,
        } => {
            let response = match (text, decision) {
                (Some(text), _) => ResumeValue::Text(text),
                (None, Some(decision)) => ResumeValue::Decision { decision, message },
                (None, None) => anyhow::bail!("pass --text or --decision"),
            };
            let task = ResumeGateway::new(Arc::clone(&db), EventBus::new()).respond(id, response)?;
            println!("Recorded response for {}: now '{}'", task.id, task.status);
            Ok(())
        }
        Commands::Rules { action } => cmd_rules(db, cli.config, action),
        Commands::Status => cmd_status(db, cli.config),
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────

async fn cmd_run(
    db: Arc<Database>,
    config_path: PathBuf,
    once: bool,
    serve: Option<String>,
) -> Result<()> {
    let events = EventBus::new();
    let (permissions, config) = PermissionService::start(Arc::clone(&db), config_path, events.clone())?;
    let permissions = Arc::new(permissions);
    let engine = Arc::new(
        ExecutionEngine::new(
            Arc::new(CapabilityRegistry::with_builtins()),
            Arc::new(PlanReasoner),
            Arc::clone(&permissions),
        )
        .with_max_turns(config.scheduler.max_turns),
    );
    let scheduler = Scheduler::new(Arc::clone(&db), engine, events.clone(), config.scheduler);

    if once {
        let report = scheduler.run_once().await?;
        println!("{report}");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
            shutdown_clone.cancel();
        }
    });

    let api = serve.map(|bind| {
        let state = Arc::new(tether_api::ApiState::new(
            Arc::clone(&db),
            events.clone(),
            Arc::clone(&permissions),
        ));
        let token = shutdown.clone();
        tokio::spawn(async move { tether_api::serve_with_shutdown(state, &bind, token).await })
    });

    let result = scheduler.run(shutdown.clone()).await;
    // A scheduler that gave up takes the API down with it.
    shutdown.cancel();
    if let Some(api) = api {
        match api.await {
            Ok(Err(e)) => tracing::error!(error = %format!("{e:#}"), "API server failed"),
            Err(e) => tracing::error!(error = %e, "API server task panicked"),
            Ok(Ok(())) => {}
        }
    }
    result
}

// ─── Tasks ───────────────────────────────────────────────────────────────

fn cmd_task(db: &Database, action: TaskAction) -> Result<()> {
    let store = TaskStore::new(db);

    match action {
        TaskAction::Add {
            title,
            desc,
            tags,
            plan,
        } => {
            let mut new = NewTask::new(title).description(desc);
            for tag in tags {
                new = new.tag(tag);
            }
            if let Some(plan) = plan {
                let plan: serde_json::Value =
                    serde_json::from_str(&plan).context("--plan must be valid JSON")?;
                new = new.meta(tether_runner::reasoner::PLAN_KEY, plan);
            }
            let task = store.create(new)?;
            println!("Created {}: {}", task.id, task.title);
        }
        TaskAction::List { status } => {
            let tasks = store.list(status)?;
            if tasks.is_empty() {
                println!("No tasks found.");
            } else {
                println!("{:<12} {:<22} {:<5} TITLE", "ID", "STATUS", "RUNS");
                println!("{}", "-".repeat(72));
                for t in tasks {
                    println!(
                        "{:<12} {:<22} {:<5} {}",
                        t.id,
                        t.status.label(),
                        t.run_count,
                        t.title
                    );
                }
            }
        }
        TaskAction::Show { id } => {
            let task = store.require(id)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            match CheckpointStore::new(db).get(id) {
                Ok(Some(cp)) => {
                    println!("\nCheckpoint v{} ({} turns, {} entries)", cp.version, cp.turns, cp.transcript.len());
                    if let Some(pending) = &cp.pending_interrupt {
                        println!("  waiting on: {}", pending.interrupt.summary());
                    }
                    if let Some(response) = &cp.response {
                        println!("  response:   {}", response.summary());
                    }
                }
                Ok(None) => {}
                Err(e) => println!("\nCheckpoint unreadable: {e:#}"),
            }
        }
        TaskAction::Comment { id, text, author } => {
            let task = store.update(id, TaskUpdate::comment(author, text))?;
            println!("Commented on {}: {}", task.id, task.title);
        }
        TaskAction::SetStatus { id, status } => {
            let task = store.update(id, TaskUpdate::status(status))?;
            println!("Set {} to '{}': {}", task.id, task.status.label(), task.title);
        }
    }

    Ok(())
}

// ─── Permissions ─────────────────────────────────────────────────────────

fn cmd_rules(db: Arc<Database>, config_path: PathBuf, action: RulesAction) -> Result<()> {
    let (permissions, _) = PermissionService::start(db, config_path, EventBus::new())?;
    let snapshot = permissions.snapshot();

    match action {
        RulesAction::List => {
            if let Some(error) = &snapshot.config_error {
                println!("Rules unusable, every call requires approval:\n  {error}\n");
            }
            println!(
                "default: {}",
                if snapshot.default_secure { "require approval" } else { "allow" }
            );
            for rule in snapshot.deny.iter().chain(snapshot.allow.iter()) {
                println!("  {}", describe_rule(rule));
            }
        }
        RulesAction::Check { capability, args } => {
            let arguments: Arguments =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let verdict = permissions.explain(&capability, &arguments);
            match verdict.rule {
                Some(rule) => println!("{} (matched {})", verdict.decision, describe_rule(&rule)),
                None => println!("{} (no rule matched)", verdict.decision),
            }
        }
    }
    Ok(())
}

fn describe_rule(rule: &Rule) -> String {
    let effect = match rule.effect {
        Effect::Allow => "allow",
        Effect::Deny => "deny",
    };
    let origin = match rule.origin {
        RuleOrigin::Static => "config",
        RuleOrigin::Learned => "learned",
    };
    format!("{effect:<6} {:<40} [{origin}]", rule.pattern.to_string())
}

// ─── Status ──────────────────────────────────────────────────────────────

fn cmd_status(db: Arc<Database>, config_path: PathBuf) -> Result<()> {
    let store = TaskStore::new(&db);
    let counts = store.status_counts()?;

    println!("=== Tether Status ===\n");
    println!("Task counts:");
    for (status, count) in &counts {
        println!("  {status:<20} {count}");
    }
    let total: usize = counts.values().sum();
    println!("  {:<20} {total}", "total");

    match store.in_progress()? {
        Some(task) => println!("\nRunning: {} {}", task.id, task.title),
        None => println!("\nRunning: nothing"),
    }

    let waiting = store.list(Some(TaskStatus::NeedsReview))?;
    if !waiting.is_empty() {
        println!("\nWaiting on a human:");
        for task in waiting {
            let asked = task.last_comment().map(|c| c.text.as_str()).unwrap_or("");
            let first_line = asked.lines().next().unwrap_or("");
            println!("  {:<12} {first_line}", task.id);
        }
    }

    let (permissions, _) = PermissionService::start(Arc::clone(&db), config_path, EventBus::new())?;
    if let Some(error) = &permissions.snapshot().config_error {
        println!("\nPermissions: FAILING CLOSED ({error})");
    }

    Ok(())
}
