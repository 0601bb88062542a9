//! `mao feedback`: record, inspect, repair and work on feedback.
//!
//! `improve` is the self-improvement loop: file a GitHub issue, create a
//! feedback worktree and branch, then drive the orchestrator in feedback
//! mode until the CTO declares `[FEEDBACK_COMPLETED]`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use coordination::{FeedbackFilter, FeedbackManager};

use crate::cli::start::run_with_orchestrator;
use crate::exec::{self, SHORT_TIMEOUT};
use crate::orchestrator::{FeedbackMode, Orchestrator, OrchestratorOptions, WorkflowTarget};
use crate::worktree::WorktreeManager;

#[derive(Subcommand)]
pub enum FeedbackCommand {
    /// Record a feedback entry.
    Send {
        title: String,
        description: String,
        #[arg(long, default_value = "improvement")]
        category: String,
        #[arg(long, default_value = "medium")]
        priority: String,
    },
    /// List feedback entries.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Show one feedback entry.
    Show { id: String },
    /// Work on a feedback entry with the orchestrator (issue + PR flow).
    Improve {
        id: String,
        #[arg(long, default_value = "sonnet")]
        model: String,
        /// Skip creating a GitHub issue.
        #[arg(long)]
        no_issue: bool,
    },
    /// Rebuild index.json from the per-feedback files.
    Repair,
}

pub async fn run(project_dir: &Path, command: FeedbackCommand) -> Result<()> {
    let manager = FeedbackManager::new(project_dir)?;
    match command {
        FeedbackCommand::Send {
            title,
            description,
            category,
            priority,
        } => {
            let feedback = manager.add_feedback(
                &title,
                &description,
                &category,
                &priority,
                "operator",
                "cli",
                None,
            )?;
            println!("recorded {}", feedback.id);
            Ok(())
        }
        FeedbackCommand::List { status, category } => {
            let feedbacks = manager.list_feedbacks(&FeedbackFilter {
                status,
                category,
                priority: None,
            })?;
            if feedbacks.is_empty() {
                println!("no feedback recorded");
                return Ok(());
            }
            for feedback in feedbacks {
                println!(
                    "{}  [{}] {} ({} / {})",
                    feedback.id, feedback.status, feedback.title, feedback.category, feedback.priority
                );
            }
            Ok(())
        }
        FeedbackCommand::Show { id } => {
            let feedback = manager
                .get_feedback(&id)?
                .with_context(|| format!("feedback not found: {id}"))?;
            println!("id:       {}", feedback.id);
            println!("title:    {}", feedback.title);
            println!("category: {}", feedback.category);
            println!("priority: {}", feedback.priority);
            println!("status:   {}", feedback.status);
            println!("created:  {}", feedback.created_at);
            if let Some(pr) = feedback.metadata.get("pr_url") {
                println!("pr:       {pr}");
            }
            println!("\n{}", feedback.description);
            Ok(())
        }
        FeedbackCommand::Improve {
            id,
            model,
            no_issue,
        } => improve(project_dir, &manager, &id, &model, no_issue).await,
        FeedbackCommand::Repair => {
            let report = manager.repair_index()?;
            println!(
                "{} file(s), {} already indexed, {} added, repaired={}",
                report.total_files,
                report.in_index_before,
                report.missing_in_index.len(),
                report.repaired
            );
            Ok(())
        }
    }
}

/// Turn a feedback title into a branch-name slug.
fn slugify(title: &str) -> String {
    let mut slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-').to_string();
    slug.chars().take(30).collect::<String>().trim_matches('-').to_string()
}

/// Extract the issue number from a `gh issue create` URL.
fn issue_number_from_url(url: &str) -> Option<u64> {
    url.trim().rsplit('/').next()?.parse().ok()
}

async fn improve(
    project_dir: &Path,
    manager: &FeedbackManager,
    id: &str,
    model: &str,
    no_issue: bool,
) -> Result<()> {
    let feedback = manager
        .get_feedback(id)?
        .with_context(|| format!("feedback not found: {id}"))?;

    println!("feedback: {} ({} / {})", feedback.title, feedback.category, feedback.priority);

    let worktrees = WorktreeManager::new(project_dir)?;
    if !worktrees.is_repo().await {
        bail!("not a git repository: {}", project_dir.display());
    }

    // Optional GitHub issue; failures degrade to no issue number.
    let mut issue_number = None;
    if !no_issue {
        let github = exec::run(
            "gh",
            &["repo", "view", "--json", "nameWithOwner"],
            Some(project_dir),
            SHORT_TIMEOUT,
        )
        .await
        .map(|out| out.status.success())
        .unwrap_or(false);
        if github {
            let label = match feedback.category.as_str() {
                "bug" => "bug",
                _ => "enhancement",
            };
            match exec::run_checked(
                "gh",
                &[
                    "issue",
                    "create",
                    "--title",
                    &feedback.title,
                    "--body",
                    &feedback.description,
                    "--label",
                    label,
                ],
                Some(project_dir),
                exec::PUSH_TIMEOUT,
            )
            .await
            {
                Ok(url) => {
                    issue_number = issue_number_from_url(&url);
                    println!("issue created: {url}");
                }
                Err(e) => eprintln!("issue creation skipped: {e}"),
            }
        }
    }

    let short = feedback.id.rsplit('_').next().unwrap_or("fb").to_string();
    let branch = format!(
        "feedback/{}_{}-{}",
        issue_number.unwrap_or(0),
        short,
        slugify(&feedback.title)
    );

    let worktree = worktrees
        .create_feedback_worktree(&feedback.id, &branch)
        .await?;
    println!("worktree: {} (branch {branch})", worktree.display());
    manager.update_status(&feedback.id, "in_progress")?;

    let orchestrator = Orchestrator::new(
        project_dir,
        OrchestratorOptions {
            session_id: None,
            new_session: true,
            session_title: Some(format!("feedback: {}", feedback.title)),
            cto_model: model.to_string(),
            feedback: Some(FeedbackMode {
                branch,
                target: WorkflowTarget::Feedback {
                    feedback_id: feedback.id.clone(),
                },
            }),
        },
    )?;

    let initial_prompt = format!(
        "Work on this feedback for the MAO project itself.\n\n\
         Title: {}\nCategory: {}\nPriority: {}\n\n{}",
        feedback.title, feedback.category, feedback.priority, feedback.description
    );
    run_with_orchestrator(orchestrator, Some(&initial_prompt), false).await
}
