//! `mao start`: launch the orchestrator and the terminal chat loop.
//!
//! The loop is deliberately plain: events from the core stream to stdout,
//! operator lines go to [`Orchestrator::handle_input`]. Any richer UI sits
//! on the same two surfaces.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use coordination::ProjectConfig;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::events::OrchestratorEvent;
use crate::exec;
use crate::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::telemetry;

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Initial task to hand to the CTO.
    pub prompt: Option<String>,

    /// Model for the CTO pane.
    #[arg(long, default_value = "sonnet")]
    pub model: String,

    /// Continue a specific session (id or unique trailing fragment).
    #[arg(long)]
    pub session: Option<String>,

    /// Start a fresh session instead of continuing the latest.
    #[arg(long)]
    pub new_session: bool,

    /// Title for a new session.
    #[arg(long)]
    pub title: Option<String>,

    /// Keep the tmux session alive on exit.
    #[arg(long)]
    pub keep_tmux: bool,
}

pub async fn run(project_dir: &Path, args: StartArgs) -> Result<()> {
    let config = ProjectConfig::load(project_dir)
        .context("project is not initialised (run 'mao init')")?;
    telemetry::init_orchestrator(
        &project_dir.join(&config.logging.file),
        &config.logging.level,
    )?;

    if !exec::is_available("tmux", "-V").await {
        anyhow::bail!("tmux is required but was not found on PATH");
    }
    if !exec::is_available("claude", "--version").await {
        anyhow::bail!("the claude CLI is required but was not found on PATH");
    }
    if std::env::var_os("ANTHROPIC_API_KEY").is_none() {
        eprintln!("warning: ANTHROPIC_API_KEY is not set; the claude CLI may prompt for login");
    }

    let session_id = match &args.session {
        Some(fragment) => Some(coordination::SessionManager::resolve_session_id(
            project_dir,
            fragment,
        )?),
        None => None,
    };

    let orchestrator = Orchestrator::new(
        project_dir,
        OrchestratorOptions {
            session_id,
            new_session: args.new_session,
            session_title: args.title.clone(),
            cto_model: args.model.clone(),
            feedback: None,
        },
    )?;

    run_with_orchestrator(orchestrator, args.prompt.as_deref(), args.keep_tmux).await
}

/// Drive an assembled orchestrator from the terminal. Shared with the
/// feedback/improvement flows, which pre-configure the orchestrator.
pub async fn run_with_orchestrator(
    orchestrator: Arc<Orchestrator>,
    initial_prompt: Option<&str>,
    keep_tmux: bool,
) -> Result<()> {
    orchestrator.start().await?;
    println!(
        "mao session {}: type a task for the CTO, /approve <id>, /reject <id> <feedback>, /diff <id>, or 'quit'",
        orchestrator.session_id().await
    );

    // Render core events as they arrive.
    let render = {
        let mut events = orchestrator.subscribe();
        let shutdown = orchestrator.shutdown_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => render_event(event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    },
                }
            }
        })
    };

    if let Some(prompt) = initial_prompt {
        if let Err(e) = orchestrator.handle_input(prompt).await {
            eprintln!("error: {e}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Ok(Some(line)) = lines.next_line().await else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" || line == "/quit" {
            break;
        }
        if let Err(e) = orchestrator.handle_input(&line).await {
            eprintln!("error: {e}");
        }
    }

    // Operator assent decides whether the panes survive.
    let destroy_tmux = if keep_tmux {
        false
    } else {
        println!("destroy the tmux session? [y/N]");
        matches!(
            lines.next_line().await,
            Ok(Some(answer)) if answer.trim().eq_ignore_ascii_case("y")
        )
    };

    orchestrator.shutdown(destroy_tmux).await?;
    render.abort();
    Ok(())
}

fn render_event(event: OrchestratorEvent) {
    match event {
        OrchestratorEvent::CtoOutput { chunk } => print!("{chunk}"),
        OrchestratorEvent::SystemMessage { message } => println!("* {message}"),
        OrchestratorEvent::TasksQueued { count, summaries } => {
            println!("* {count} task(s) queued:");
            for summary in summaries {
                println!("    {summary}");
            }
        }
        OrchestratorEvent::AgentStarted {
            agent_id,
            role,
            model,
            pane_id,
        } => println!("* {agent_id} started ({role}/{model}) in pane {pane_id}"),
        OrchestratorEvent::ApprovalPending { item } => {
            println!(
                "* approval pending: {} from {} ({} file(s) changed)",
                item.id,
                item.agent_id,
                item.changed_files.len()
            );
        }
        OrchestratorEvent::ApprovalResolved {
            approval_id,
            agent_id,
            approved,
        } => {
            let verdict = if approved { "approved" } else { "rejected" };
            println!("* {approval_id} {verdict} ({agent_id} released)");
        }
        OrchestratorEvent::AgentFailed {
            agent_id,
            error_type,
            message,
        } => println!("* {agent_id} failed [{error_type}]: {message}"),
        OrchestratorEvent::AllTasksCompleted => println!("* all tasks completed"),
        OrchestratorEvent::FeedbackCompleted { pr_url } => {
            println!("* feedback completed (PR: {})", pr_url.as_deref().unwrap_or("n/a"));
        }
        OrchestratorEvent::StateUpdated { .. } => {}
        OrchestratorEvent::ShuttingDown => println!("* shutting down"),
    }
}
