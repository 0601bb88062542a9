//! Git worktree isolation for agent tasks.
//!
//! Each agent works in its own worktree under `.mao/worktrees/`, bound to
//! exactly one branch, so concurrent edits never collide. Uses direct
//! `git worktree` commands; every call carries a hard timeout.

use std::path::{Path, PathBuf};

use coordination::{MaoError, MaoResult};
use tracing::{info, warn};

use crate::exec::{self, GIT_TIMEOUT, PUSH_TIMEOUT, SHORT_TIMEOUT};

/// Info about one managed worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub name: String,
}

/// Manages the worktrees of one project.
pub struct WorktreeManager {
    project_path: PathBuf,
    worktrees_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(project_path: &Path) -> MaoResult<Self> {
        let worktrees_dir = coordination::mao_dir(project_path).join("worktrees");
        std::fs::create_dir_all(&worktrees_dir)?;
        Ok(Self {
            project_path: project_path.to_path_buf(),
            worktrees_dir,
        })
    }

    pub fn worktrees_dir(&self) -> &Path {
        &self.worktrees_dir
    }

    /// Whether the project root is inside a git work tree.
    pub async fn is_repo(&self) -> bool {
        exec::run(
            "git",
            &["rev-parse", "--is-inside-work-tree"],
            Some(&self.project_path),
            SHORT_TIMEOUT,
        )
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
    }

    /// Name of the branch currently checked out at `path`.
    pub async fn current_branch(&self, path: &Path) -> MaoResult<String> {
        exec::run_checked(
            "git",
            &["rev-parse", "--abbrev-ref", "HEAD"],
            Some(path),
            SHORT_TIMEOUT,
        )
        .await
    }

    /// Create a worktree at `.mao/worktrees/<kind>-<id>-<ts>` on a new
    /// branch; returns its path.
    pub async fn create_worktree(&self, kind: &str, id: &str, branch: &str) -> MaoResult<PathBuf> {
        self.create_worktree_from(kind, id, branch, None).await
    }

    async fn create_worktree_from(
        &self,
        kind: &str,
        id: &str,
        branch: &str,
        start_point: Option<&str>,
    ) -> MaoResult<PathBuf> {
        if !self.is_repo().await {
            return Err(MaoError::validation(format!(
                "not a git repository: {}",
                self.project_path.display()
            )));
        }

        let name = format!("{kind}-{id}-{}", coordination::compact_utc_timestamp());
        let path = self.worktrees_dir.join(name);
        let path_str = path.display().to_string();

        let mut args = vec!["worktree", "add", "-b", branch, &path_str];
        if let Some(start) = start_point {
            args.push(start);
        }
        exec::run_checked("git", &args, Some(&self.project_path), GIT_TIMEOUT).await?;

        info!(path = %path.display(), branch, "worktree created");
        Ok(path)
    }

    /// Worktree for working on a feedback item, branching off HEAD.
    pub async fn create_feedback_worktree(
        &self,
        feedback_id: &str,
        branch: &str,
    ) -> MaoResult<PathBuf> {
        let short = feedback_id
            .rsplit('_')
            .next()
            .unwrap_or(feedback_id);
        self.create_worktree("feedback", short, branch).await
    }

    /// Worktree for one worker agent, branching `<parent>-<agent_id>` off
    /// the parent (feedback) branch.
    pub async fn create_worker_worktree(
        &self,
        parent_branch: &str,
        agent_id: &str,
    ) -> MaoResult<PathBuf> {
        let branch = format!("{parent_branch}-{agent_id}");
        self.create_worktree_from("worker", agent_id, &branch, Some(parent_branch))
            .await
    }

    /// Remove a worktree; forced, then the directory itself if git left it.
    pub async fn remove_worktree(&self, path: &Path) -> MaoResult<()> {
        let path_str = path.display().to_string();
        let result = exec::run_checked(
            "git",
            &["worktree", "remove", "--force", &path_str],
            Some(&self.project_path),
            GIT_TIMEOUT,
        )
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "git worktree remove failed");
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        info!(path = %path.display(), "worktree removed");
        Ok(())
    }

    /// Remove every directory under `.mao/worktrees`; returns the count.
    pub async fn cleanup_worktrees(&self) -> MaoResult<usize> {
        let mut cleaned = 0;
        let entries = match std::fs::read_dir(&self.worktrees_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.path().is_dir() {
                match self.remove_worktree(&entry.path()).await {
                    Ok(()) => cleaned += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "cleanup skipped worktree"),
                }
            }
        }
        if cleaned > 0 {
            info!(cleaned, "worktrees cleaned up");
        }
        Ok(cleaned)
    }

    /// Directories currently present under `.mao/worktrees`.
    pub fn list_worktrees(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.worktrees_dir)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect()
    }

    /// Branch and name of a worktree on disk.
    pub async fn worktree_info(&self, path: &Path) -> MaoResult<WorktreeInfo> {
        if !path.exists() {
            return Err(MaoError::file_not_found(path));
        }
        let branch = self.current_branch(path).await?;
        Ok(WorktreeInfo {
            path: path.to_path_buf(),
            branch,
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        })
    }

    /// Names of files changed against HEAD inside `path`.
    pub async fn changed_files(&self, path: &Path) -> MaoResult<Vec<String>> {
        let output = exec::run_checked(
            "git",
            &["diff", "--name-only", "HEAD"],
            Some(path),
            GIT_TIMEOUT,
        )
        .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Full diff against HEAD inside `path`, for operator review.
    pub async fn diff(&self, path: &Path) -> MaoResult<String> {
        exec::run_checked("git", &["diff", "HEAD"], Some(path), GIT_TIMEOUT).await
    }

    /// Stage, commit and push the worktree. Returns false when there was
    /// nothing to commit.
    pub async fn commit_and_push(
        &self,
        path: &Path,
        branch: &str,
        message: &str,
    ) -> MaoResult<bool> {
        exec::run_checked("git", &["add", "."], Some(path), GIT_TIMEOUT).await?;

        let staged = exec::run("git", &["diff", "--cached", "--quiet"], Some(path), GIT_TIMEOUT)
            .await?;
        if staged.status.success() {
            info!(branch, "nothing to commit");
            return Ok(false);
        }

        exec::run_checked("git", &["commit", "-m", message], Some(path), GIT_TIMEOUT).await?;
        exec::run_checked(
            "git",
            &["push", "-u", "origin", branch],
            Some(path),
            PUSH_TIMEOUT,
        )
        .await?;
        info!(branch, "committed and pushed");
        Ok(true)
    }

    /// Merge `source_branch` into the branch checked out in
    /// `target_worktree` with a merge commit.
    pub async fn merge_branch(
        &self,
        target_worktree: &Path,
        source_branch: &str,
        message: &str,
    ) -> MaoResult<()> {
        exec::run_checked(
            "git",
            &["merge", "--no-ff", "-m", message, source_branch],
            Some(target_worktree),
            GIT_TIMEOUT,
        )
        .await?;
        info!(source_branch, "branch merged");
        Ok(())
    }

    /// Open a pull request with `gh`; returns the PR URL.
    pub async fn create_pr(
        &self,
        path: &Path,
        title: &str,
        body: &str,
        base: &str,
    ) -> MaoResult<Option<String>> {
        let output = exec::run(
            "gh",
            &[
                "pr", "create", "--title", title, "--body", body, "--base", base,
            ],
            Some(path),
            PUSH_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "gh pr create failed"
            );
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout.lines().last().map(|l| l.trim().to_string());
        info!(url = url.as_deref().unwrap_or("-"), "pull request created");
        Ok(url)
    }
}
