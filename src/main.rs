use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowline_core::config::AppConfig;
use flowline_core::event::{EventBus, WorkflowEvent};
use flowline_core::state::StateHandle;
use flowline_core::types::{Content, SessionId, StepInput, StepReturn, UnitChunk};
use flowline_store::open_store;
use flowline_workflow::{
    Condition, Parallel, RunRequest, Step, Workflow, WorkflowBuilder, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "flowline", version, about = "Workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowline.toml")]
    config: PathBuf,

    /// Session ID (auto-generated if not provided)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config,
    /// List stored sessions, most recent first
    Sessions {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List the runs of a session
    Runs {
        /// Session to inspect
        session: String,
    },
    /// Print one stored run as JSON
    ShowRun {
        session: String,
        run_id: String,
    },
    /// Delete a session and all of its runs
    DeleteSession { session: String },
    /// Run the built-in number pipeline
    Demo {
        /// Starting number
        #[arg(default_value = "3")]
        input: i64,
        /// Stream events while running
        #[arg(long)]
        stream: bool,
        /// Run detached and wait for the stored result
        #[arg(long, conflicts_with = "stream")]
        background: bool,
        /// Name the session after the run
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FLOWLINE_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    let store = open_store(&config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Sessions { limit } => {
            let sessions = store.list_sessions(limit).await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for record in sessions {
                println!(
                    "{}  {:<24}  runs={}  updated={}",
                    record.session_id,
                    record.session_name.as_deref().unwrap_or("-"),
                    record.runs.len(),
                    record.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Runs { session } => {
            let record = store
                .get_session(&SessionId::from_str(&session))
                .await?
                .ok_or_else(|| anyhow::anyhow!("session not found: {}", session))?;
            for run in &record.runs {
                println!(
                    "{}  {:<9}  {}",
                    run.run_id,
                    run.status,
                    truncate(&run.content_string().unwrap_or_default(), 60)
                );
            }
        }
        Commands::ShowRun { session, run_id } => {
            let record = store
                .get_session(&SessionId::from_str(&session))
                .await?
                .ok_or_else(|| anyhow::anyhow!("session not found: {}", session))?;
            let run = record
                .get_run(&run_id)
                .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))?;
            println!("{}", serde_json::to_string_pretty(run)?);
        }
        Commands::DeleteSession { session } => {
            if store.delete_session(&SessionId::from_str(&session)).await? {
                println!("Deleted {}", session);
            } else {
                println!("No session {}", session);
            }
        }
        Commands::Demo {
            input,
            stream,
            background,
            name,
        } => {
            let bus = Arc::new(EventBus::new(config.events.capacity));
            let engine = Arc::new(
                WorkflowEngine::new(demo_workflow(&config)?, store).with_event_bus(bus),
            );

            let mut request = RunRequest::new(input);
            if let Some(session) = &cli.session {
                request = request.with_session(SessionId::from_str(session));
            }

            if stream {
                run_streaming(&engine, request).await?;
            } else if background {
                let pending = engine.run_background(request).await?;
                info!(run_id = %pending.run_id(), "Waiting for background run");
                let run = pending.wait().await?;
                println!("{} {}", run.status, run.content_string().unwrap_or_default());
            } else {
                match engine.run(request).await {
                    Ok(run) => {
                        println!("{}", run.content_string().unwrap_or_default());
                        if let Some(metrics) = &run.metrics {
                            println!("{}", serde_json::to_string_pretty(metrics)?);
                        }
                    }
                    Err(e) => warn!(error = %e, "Demo run failed"),
                }
            }

            if let Some(name) = name {
                engine.set_session_name(Some(name)).await?;
            }
            if let Some(session) = engine.session_id() {
                eprintln!("session: {}", session);
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".flowline").join("config.toml")) {
        if home_config.exists() {
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

async fn run_streaming(engine: &Arc<WorkflowEngine>, request: RunRequest) -> anyhow::Result<()> {
    let mut events = engine.run_stream(request).await?;
    while let Some(envelope) = events.next().await {
        match envelope.event {
            WorkflowEvent::StepContent { content, .. } => {
                print!("{}", content);
                io::stdout().flush().ok();
            }
            WorkflowEvent::StepOutput { output } => {
                eprintln!(
                    "\n[{}: {}] {}",
                    output.step_name,
                    if output.success { "ok" } else { "ERROR" },
                    truncate(&output.content_string().unwrap_or_default(), 80)
                );
            }
            WorkflowEvent::WorkflowError { error } => eprintln!("[error] {}", error),
            WorkflowEvent::WorkflowCompleted { status, content } => {
                println!(
                    "\n{} {}",
                    status,
                    content.map(|c| c.render()).unwrap_or_default()
                );
            }
            other => eprintln!("[{}]", other.event_type()),
        }
    }
    Ok(())
}

fn number(content: Option<&Content>) -> i64 {
    content.and_then(Content::as_i64).unwrap_or(0)
}

/// double -> (square | plus_ten) -> big/small -> summary
fn demo_workflow(config: &AppConfig) -> anyhow::Result<Workflow> {
    let double = Step::function("double", |input: StepInput, state: StateHandle| {
        let n = number(input.input.as_ref()) * 2;
        state.set("doubled", serde_json::json!(n));
        Ok(StepReturn::from(n))
    });
    let square = Step::function("square", |input: StepInput, _state| {
        let n = number(input.previous_step_content.as_ref());
        Ok(StepReturn::from(n * n))
    });
    let plus_ten = Step::function("plus_ten", |input: StepInput, _state| {
        let n = number(input.previous_step_content.as_ref());
        Ok(StepReturn::from(n + 10))
    });

    let is_big = |input: &StepInput| {
        input
            .step_content("fan_out")
            .and_then(|c| c.field("square").and_then(|v| v.as_i64()))
            .map_or(false, |n| n > 50)
    };
    let big = Step::function("big", |_input, _state| Ok(StepReturn::from("big number")));
    let small = Step::function("small", |_input, _state| Ok(StepReturn::from("small number")));

    let summary = Step::stream_function("summary", |input: StepInput, _state| {
        let sections = input.all_previous_content();
        let chunks: Vec<flowline_core::Result<UnitChunk>> = sections
            .lines()
            .map(|line| Ok(UnitChunk::Content(format!("{}\n", line))))
            .collect();
        futures::stream::iter(chunks)
    });

    let workflow = WorkflowBuilder::from_config(&config.workflow)
        .step(double)
        .step(Parallel::new("fan_out", vec![square.into(), plus_ten.into()]))
        .step(Condition::new("size", is_big, vec![big.into()]).otherwise(vec![small.into()]))
        .step(summary)
        .build()?;
    Ok(workflow)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
