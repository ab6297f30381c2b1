use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;

use bosun::collaborators::{FileConfigResolver, FileStatusWriter};
use bosun::config::Config;
use bosun::detect::detect_project_state;
use bosun::lock::LockManager;
use bosun::router::{OrchestrationContext, OrchestrationResult, Orchestrator};
use bosun::session::{ResumeOption, SessionStore};

#[derive(Parser)]
#[command(name = "bosun")]
#[command(version, about = "Deterministic orchestration core for multi-phase delivery workflows")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestration decision tree once
    Orchestrate {
        /// Story file to execute
        #[arg(long)]
        story: Option<String>,

        /// Free-form objective to attach to the run
        #[arg(long)]
        goal: Option<String>,

        /// Route from this project state instead of detecting one
        #[arg(long)]
        state: Option<String>,
    },
    /// Show project state, session, and lock status
    Status,
    /// Apply a resume choice to the recorded session
    Resume {
        /// One of: continue, review, restart, discard
        choice: String,
    },
    /// Manage the session record
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Manage coordination locks
    Locks {
        #[command(subcommand)]
        command: LockCommands,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Delete the session record
    Discard,
}

#[derive(Subcommand)]
pub enum LockCommands {
    /// Remove lock records older than the TTL
    Cleanup,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.verbose)?;

    match &cli.command {
        Commands::Orchestrate { story, goal, state } => {
            let mut orchestrator = Orchestrator::new(config.clone())
                .with_status_writer(Box::new(FileStatusWriter::new(
                    config.control_dir.join("status.jsonl"),
                )));
            let result = orchestrator
                .orchestrate(OrchestrationContext {
                    story: story.clone(),
                    goal: goal.clone(),
                    state_override: state.clone(),
                })
                .await;
            print_result(&result)?;
        }
        Commands::Status => cmd_status(&config)?,
        Commands::Resume { choice } => {
            let choice = choice
                .parse::<ResumeOption>()
                .map_err(|e| anyhow::anyhow!(e))?;
            let mut orchestrator = Orchestrator::new(config.clone());
            let result = orchestrator.handle_resume(choice);
            print_result(&result)?;
        }
        Commands::Session { command } => match command {
            SessionCommands::Discard => {
                let store = SessionStore::new(config.session_file.clone(), config.crash_window_minutes);
                let removed = store.discard()?;
                if removed {
                    println!("{} session record removed", style("ok").green());
                } else {
                    println!("{} no session record found", style("ok").green());
                }
            }
        },
        Commands::Locks { command } => match command {
            LockCommands::Cleanup => {
                let manager = LockManager::new(config.locks_dir.clone(), config.lock_ttl_secs);
                let removed = manager.cleanup_stale_locks();
                println!("{} {removed} stale lock(s) removed", style("ok").green());
            }
        },
    }

    Ok(())
}

/// Results go to stdout as pretty JSON so callers can script against them;
/// a failed run also fails the process.
fn print_result(result: &OrchestrationResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let resolver = FileConfigResolver::new(config.config_file.clone());
    let state = detect_project_state(&config.project_dir, &resolver);
    println!(
        "{} {}",
        style("project state:").bold(),
        style(state.as_str()).cyan()
    );
    println!(
        "{} {}",
        style("initialized:").bold(),
        config.is_initialized()
    );

    let store = SessionStore::new(config.session_file.clone(), config.crash_window_minutes);
    if !store.exists() {
        println!("{} none", style("session:").bold());
    } else {
        match store.load() {
            Ok(session) => {
                println!(
                    "{} epic {} / phase {} / story {}",
                    style("session:").bold(),
                    session.epic.id,
                    session.workflow.current_phase,
                    session.progress.current_story.as_deref().unwrap_or("-"),
                );
                let crash = store.detect_crash(&session, chrono::Utc::now());
                if crash.is_crash {
                    println!(
                        "{} {}",
                        style("crash:").red().bold(),
                        crash.reason.as_deref().unwrap_or("session looks crashed")
                    );
                }
            }
            Err(err) => {
                println!("{} invalid ({err})", style("session:").bold());
            }
        }
    }

    let lock_file = config.locks_dir.join("orchestration.lock");
    println!("{} {}", style("lock held:").bold(), lock_file.exists());
    Ok(())
}
