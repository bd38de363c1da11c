//! Evidence-gated orchestrator CLI.
//!
//! Runs prompts through a coding agent and reports COMPLETE only for work
//! that is verifiably on disk. Results print as JSON; the exit code maps the
//! aggregate status (see [`orchestrator::exit_codes`]).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use orchestrator::core::status::aggregate_statuses;
use orchestrator::core::types::SessionState;
use orchestrator::exit_codes;
use orchestrator::io::config::{
    OrchestratorConfig, default_config_path, load_config, load_config_required,
};
use orchestrator::io::executor::ProcessExecutor;
use orchestrator::io::session_store::{FileSessionStore, SessionStore};
use orchestrator::logging;
use orchestrator::orchestrator::{ExecuteRequest, Orchestrator, SessionError};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Evidence-gated orchestrator for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a session and run each TASK prompt in order.
    Run {
        #[command(flatten)]
        project: ProjectArgs,
        /// Keep running queued tasks after one ends non-COMPLETE.
        #[arg(long)]
        continue_on_failure: bool,
        #[arg(required = true)]
        tasks: Vec<String>,
    },
    /// Reopen a saved session, optionally running more tasks in it.
    Resume {
        session_id: String,
        #[command(flatten)]
        project: ProjectArgs,
        tasks: Vec<String>,
    },
    /// Print a saved session.
    Status {
        session_id: String,
        /// Project directory.
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
}

#[derive(clap::Args)]
struct ProjectArgs {
    /// Project directory the agent works in.
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// Config file (default: <project>/.orchestrator/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

impl ProjectArgs {
    fn load_config(&self) -> Result<OrchestratorConfig> {
        match &self.config {
            Some(path) => load_config_required(path),
            None => load_config(&default_config_path(&self.project)),
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            project,
            continue_on_failure,
            tasks,
        } => cmd_run(&project, continue_on_failure, tasks),
        Command::Resume {
            session_id,
            project,
            tasks,
        } => cmd_resume(&project, &session_id, tasks),
        Command::Status {
            session_id,
            project,
        } => cmd_status(&project, &session_id),
    }
}

fn cmd_run(args: &ProjectArgs, continue_on_failure: bool, tasks: Vec<String>) -> Result<i32> {
    let mut config = args.load_config()?;
    if continue_on_failure {
        config.continue_on_task_failure = true;
    }
    let mut orch = build_orchestrator(config)?;
    orch.initialize(&args.project)?;
    let result = orch.execute(ExecuteRequest::new(tasks));
    orch.shutdown()?;
    let result = result?;
    print_json(&result)?;
    Ok(exit_codes::for_status(result.status))
}

fn cmd_resume(args: &ProjectArgs, session_id: &str, tasks: Vec<String>) -> Result<i32> {
    let mut orch = build_orchestrator(args.load_config()?)?;
    orch.attach(&args.project)?;
    let state = orch.resume(session_id)?;
    if tasks.is_empty() {
        print_json(&state)?;
        return Ok(session_exit_code(&state));
    }
    let result = orch.execute(ExecuteRequest::new(tasks));
    orch.shutdown()?;
    let result = result?;
    print_json(&result)?;
    Ok(exit_codes::for_status(result.status))
}

fn cmd_status(project: &Path, session_id: &str) -> Result<i32> {
    let config = load_config(&default_config_path(project))?;
    let store = FileSessionStore::new(&config.evidence_root(project))?;
    let state = store
        .load(session_id)?
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
    print_json(&state)?;
    Ok(session_exit_code(&state))
}

fn build_orchestrator(config: OrchestratorConfig) -> Result<Orchestrator<ProcessExecutor>> {
    let executor = ProcessExecutor::new(config.executor.clone())?;
    Ok(Orchestrator::new(executor).with_config(config))
}

fn session_exit_code(state: &SessionState) -> i32 {
    exit_codes::for_status(aggregate_statuses(state.tasks.iter().map(|t| t.status)))
}

/// Print `value` as pretty-printed JSON to stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "orchestrator",
            "run",
            "--project",
            "/tmp/p",
            "--continue-on-failure",
            "Update a.rs",
            "Update b.rs",
        ]);
        match cli.command {
            Command::Run {
                project,
                continue_on_failure,
                tasks,
            } => {
                assert_eq!(project.project, PathBuf::from("/tmp/p"));
                assert!(project.config.is_none());
                assert!(continue_on_failure);
                assert_eq!(tasks, vec!["Update a.rs", "Update b.rs"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_task() {
        assert!(Cli::try_parse_from(["orchestrator", "run"]).is_err());
    }

    #[test]
    fn parse_resume_without_tasks() {
        let cli = Cli::parse_from(["orchestrator", "resume", "session-x"]);
        assert!(matches!(
            cli.command,
            Command::Resume { ref session_id, ref tasks, .. } if session_id == "session-x" && tasks.is_empty()
        ));
    }
}
