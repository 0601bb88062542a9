//! `mao project`: improvements scoped to an arbitrary target project.
//!
//! Same storage shape as feedback, but the orchestrator runs inside the
//! target project and the branch prefix is `improvement/`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use coordination::ImprovementManager;

use crate::cli::start::run_with_orchestrator;
use crate::orchestrator::{FeedbackMode, Orchestrator, OrchestratorOptions, WorkflowTarget};
use crate::worktree::WorktreeManager;

#[derive(Subcommand)]
pub enum ProjectCommand {
    /// Register an improvement for a target project.
    Create {
        title: String,
        description: String,
        /// Target project directory.
        #[arg(long, default_value = ".")]
        target: PathBuf,
        #[arg(long, default_value = "feature")]
        category: String,
        #[arg(long, default_value = "medium")]
        priority: String,
    },
    /// List improvements.
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one improvement.
    Show { id: String },
    /// Delete an improvement.
    Delete { id: String },
    /// Run the orchestrator on an improvement inside its target project.
    Improve {
        id: String,
        #[arg(long, default_value = "sonnet")]
        model: String,
    },
}

pub async fn run(project_dir: &Path, command: ProjectCommand) -> Result<()> {
    let manager = ImprovementManager::new(project_dir)?;
    match command {
        ProjectCommand::Create {
            title,
            description,
            target,
            category,
            priority,
        } => {
            let target = target.canonicalize().unwrap_or(target);
            let improvement = manager.add_improvement(
                &title,
                &description,
                &category,
                &priority,
                &target.display().to_string(),
            )?;
            println!("registered {}", improvement.id);
            Ok(())
        }
        ProjectCommand::List { status } => {
            let improvements = manager.list_improvements(status.as_deref())?;
            if improvements.is_empty() {
                println!("no improvements registered");
                return Ok(());
            }
            for improvement in improvements {
                println!(
                    "{}  [{}] {} → {}",
                    improvement.id, improvement.status, improvement.title, improvement.target_project
                );
            }
            Ok(())
        }
        ProjectCommand::Show { id } => {
            let improvement = manager
                .get_improvement(&id)?
                .with_context(|| format!("improvement not found: {id}"))?;
            println!("id:       {}", improvement.id);
            println!("title:    {}", improvement.title);
            println!("target:   {}", improvement.target_project);
            println!("category: {}", improvement.category);
            println!("priority: {}", improvement.priority);
            println!("status:   {}", improvement.status);
            if let Some(pr) = &improvement.pr_url {
                println!("pr:       {pr}");
            }
            if let Some(branch) = &improvement.branch_name {
                println!("branch:   {branch}");
            }
            println!("\n{}", improvement.description);
            Ok(())
        }
        ProjectCommand::Delete { id } => {
            if manager.delete_improvement(&id)? {
                println!("deleted {id}");
            } else {
                bail!("improvement not found: {id}");
            }
            Ok(())
        }
        ProjectCommand::Improve { id, model } => {
            improve(project_dir, &manager, &id, &model).await
        }
    }
}

async fn improve(
    project_dir: &Path,
    manager: &ImprovementManager,
    id: &str,
    model: &str,
) -> Result<()> {
    let improvement = manager
        .get_improvement(id)?
        .with_context(|| format!("improvement not found: {id}"))?;
    let target = PathBuf::from(&improvement.target_project);
    if !target.is_dir() {
        bail!("target project missing: {}", target.display());
    }

    let worktrees = WorktreeManager::new(&target)?;
    if !worktrees.is_repo().await {
        bail!("target is not a git repository: {}", target.display());
    }

    let short = improvement.id.rsplit('_').next().unwrap_or("imp");
    let branch = format!("improvement/{short}");
    let worktree = worktrees
        .create_worktree("mao-work", short, &branch)
        .await?;
    println!("worktree: {} (branch {branch})", worktree.display());

    manager.update_status(&improvement.id, "in_progress")?;

    let orchestrator = Orchestrator::new(
        &target,
        OrchestratorOptions {
            session_id: None,
            new_session: true,
            session_title: Some(format!("improvement: {}", improvement.title)),
            cto_model: model.to_string(),
            feedback: Some(FeedbackMode {
                branch,
                target: WorkflowTarget::Improvement {
                    improvement_id: improvement.id.clone(),
                    // The improvement lives in the registry the command ran
                    // from, not in the target project being driven.
                    registry_dir: project_dir.to_path_buf(),
                },
            }),
        },
    )?;

    let initial_prompt = format!(
        "Implement this improvement in the target project.\n\n\
         Title: {}\nCategory: {}\nPriority: {}\n\n{}",
        improvement.title, improvement.category, improvement.priority, improvement.description
    );
    run_with_orchestrator(orchestrator, Some(&initial_prompt), false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    #[tokio::test]
    async fn test_feedback_completed_records_pr_on_improvement() {
        // The improvement registry and the driven project are different
        // directories, as they are for `mao project improve`.
        let registry = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        let manager = ImprovementManager::new(registry.path()).unwrap();
        let improvement = manager
            .add_improvement(
                "Faster queue scan",
                "Avoid re-reading every file",
                "performance",
                "high",
                &target.path().display().to_string(),
            )
            .unwrap();
        manager
            .update_status(&improvement.id, "in_progress")
            .unwrap();

        let short = improvement.id.rsplit('_').next().unwrap();
        let branch = format!("improvement/{short}");
        let orchestrator = Orchestrator::new(
            target.path(),
            OrchestratorOptions {
                session_id: None,
                new_session: true,
                session_title: None,
                cto_model: "sonnet".to_string(),
                feedback: Some(FeedbackMode {
                    branch: branch.clone(),
                    target: WorkflowTarget::Improvement {
                        improvement_id: improvement.id.clone(),
                        registry_dir: registry.path().to_path_buf(),
                    },
                }),
            },
        )
        .unwrap();

        let completed = parser::extract_feedback_completed(
            "[FEEDBACK_COMPLETED]\n\
             PR: https://github.com/acme/demo/pull/9\n\
             Summary: queue scan now reads the index once\n\
             [/FEEDBACK_COMPLETED]",
        )
        .unwrap();
        orchestrator.record_workflow_completion(&completed).unwrap();

        let done = manager.get_improvement(&improvement.id).unwrap().unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(
            done.pr_url.as_deref(),
            Some("https://github.com/acme/demo/pull/9")
        );
        assert_eq!(done.branch_name.as_deref(), Some(branch.as_str()));
    }

    #[tokio::test]
    async fn test_feedback_completed_without_pr_still_completes_improvement() {
        let registry = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        let manager = ImprovementManager::new(registry.path()).unwrap();
        let improvement = manager
            .add_improvement("No PR flow", "d", "refactor", "low", "demo")
            .unwrap();

        let orchestrator = Orchestrator::new(
            target.path(),
            OrchestratorOptions {
                session_id: None,
                new_session: true,
                session_title: None,
                cto_model: "sonnet".to_string(),
                feedback: Some(FeedbackMode {
                    branch: "improvement/abc".to_string(),
                    target: WorkflowTarget::Improvement {
                        improvement_id: improvement.id.clone(),
                        registry_dir: registry.path().to_path_buf(),
                    },
                }),
            },
        )
        .unwrap();

        let completed = parser::extract_feedback_completed(
            "[FEEDBACK_COMPLETED]\nSummary: nothing to merge\n[/FEEDBACK_COMPLETED]",
        )
        .unwrap();
        orchestrator.record_workflow_completion(&completed).unwrap();

        let done = manager.get_improvement(&improvement.id).unwrap().unwrap();
        assert_eq!(done.status, "completed");
        assert!(done.pr_url.is_none());
    }

    #[tokio::test]
    async fn test_create_list_show_delete() {
        let dir = tempfile::tempdir().unwrap();
        run(
            dir.path(),
            ProjectCommand::Create {
                title: "Faster queue scan".to_string(),
                description: "Avoid re-reading every file".to_string(),
                target: dir.path().to_path_buf(),
                category: "performance".to_string(),
                priority: "high".to_string(),
            },
        )
        .await
        .unwrap();

        run(dir.path(), ProjectCommand::List { status: None })
            .await
            .unwrap();

        let manager = ImprovementManager::new(dir.path()).unwrap();
        let improvement = &manager.list_improvements(None).unwrap()[0];
        run(
            dir.path(),
            ProjectCommand::Show {
                id: improvement.id.clone(),
            },
        )
        .await
        .unwrap();

        run(
            dir.path(),
            ProjectCommand::Delete {
                id: improvement.id.clone(),
            },
        )
        .await
        .unwrap();
        assert!(manager.list_improvements(None).unwrap().is_empty());
    }
}
