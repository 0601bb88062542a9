//! YAML task queue for CTO → agent dispatch.
//!
//! The CTO writes `queue/tasks/<role>.yaml`; the agent-loop process claims
//! the task by reading and unlinking that file, and writes
//! `queue/results/<role>.yaml` when done. Whoever holds the file owns the
//! task; the unlink is the ownership transfer, so a crash before the claim
//! leaves the task deliverable and a crash after it loses the task (to be
//! re-assigned).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MaoResult;
use crate::store;

/// Lifecycle of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

/// Wire form of one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: String,
    /// Target role slot (`agent-1`, `agent-2`, ...).
    pub role: String,
    /// The prompt handed to the agent's LLM process.
    pub prompt: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
}

fn default_model() -> String {
    "sonnet".to_string()
}

impl QueuedTask {
    pub fn new(task_id: impl Into<String>, role: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            role: role.into(),
            prompt: prompt.into(),
            model: default_model(),
            status: TaskStatus::Pending,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            result: String::new(),
            error: String::new(),
        }
    }
}

/// Directory pair holding unclaimed tasks and completed results.
pub struct TaskQueue {
    tasks_dir: PathBuf,
    results_dir: PathBuf,
}

impl TaskQueue {
    pub fn new(project_path: &Path) -> MaoResult<Self> {
        let queue_dir = crate::mao_dir(project_path).join("queue");
        let tasks_dir = queue_dir.join("tasks");
        let results_dir = queue_dir.join("results");
        fs::create_dir_all(&tasks_dir)?;
        fs::create_dir_all(&results_dir)?;
        Ok(Self {
            tasks_dir,
            results_dir,
        })
    }

    fn task_file(&self, role: &str) -> PathBuf {
        self.tasks_dir.join(format!("{role}.yaml"))
    }

    fn result_file(&self, role: &str) -> PathBuf {
        self.results_dir.join(format!("{role}.yaml"))
    }

    /// Assign a task to its role slot. Overwriting an unclaimed task is
    /// permitted but logged.
    pub fn assign(&self, task: &QueuedTask) -> MaoResult<()> {
        let path = self.task_file(&task.role);
        if path.exists() {
            warn!(role = %task.role, "task file already exists, overwriting");
        }
        let mut task = task.clone();
        task.status = TaskStatus::Assigned;
        task.assigned_at = Some(Utc::now());
        store::write_yaml(&path, &task)?;
        info!(role = %task.role, task_id = %task.task_id, "task assigned");
        Ok(())
    }

    /// Claim the task for `role`: read then unlink. `None` when no task is
    /// waiting. The unlink is what transfers ownership to the caller.
    pub fn claim(&self, role: &str) -> MaoResult<Option<QueuedTask>> {
        let path = self.task_file(role);
        let Some(task) = store::read_yaml::<QueuedTask>(&path)? else {
            return Ok(None);
        };
        fs::remove_file(&path)?;
        info!(role, task_id = %task.task_id, "task claimed");
        Ok(Some(task))
    }

    /// Publish a finished task under `queue/results/<role>.yaml`.
    pub fn submit_result(&self, task: &QueuedTask) -> MaoResult<()> {
        store::write_yaml(&self.result_file(&task.role), task)?;
        info!(role = %task.role, task_id = %task.task_id, "result submitted");
        Ok(())
    }

    /// Fetch (and consume) the result for `role`.
    pub fn fetch_result(&self, role: &str) -> MaoResult<Option<QueuedTask>> {
        let path = self.result_file(role);
        let Some(task) = store::read_yaml::<QueuedTask>(&path)? else {
            return Ok(None);
        };
        fs::remove_file(&path)?;
        Ok(Some(task))
    }

    pub fn has_task(&self, role: &str) -> bool {
        self.task_file(role).exists()
    }

    pub fn has_result(&self, role: &str) -> bool {
        self.result_file(role).exists()
    }

    fn list_stems(dir: &Path) -> Vec<String> {
        let mut stems: Vec<String> = fs::read_dir(dir)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                (path.extension().and_then(|x| x.to_str()) == Some("yaml"))
                    .then(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))
                    .flatten()
            })
            .collect();
        stems.sort();
        stems
    }

    /// Roles with an unclaimed task file.
    pub fn list_pending(&self) -> Vec<String> {
        Self::list_stems(&self.tasks_dir)
    }

    /// Roles with an unfetched result file.
    pub fn list_completed(&self) -> Vec<String> {
        Self::list_stems(&self.results_dir)
    }

    /// Drain both directories.
    pub fn cleanup(&self) -> MaoResult<usize> {
        let mut removed = 0;
        for dir in [&self.tasks_dir, &self.results_dir] {
            for entry in fs::read_dir(dir)?.filter_map(|e| e.ok()) {
                if entry.path().extension().and_then(|x| x.to_str()) == Some("yaml") {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "task queue cleaned up");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_claim_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::new(dir.path()).unwrap();

        let task = QueuedTask::new("task-001", "agent-1", "add a docstring to foo");
        queue.assign(&task).unwrap();
        assert!(queue.has_task("agent-1"));

        let claimed = queue.claim("agent-1").unwrap().unwrap();
        assert_eq!(claimed.task_id, "task-001");
        assert_eq!(claimed.status, TaskStatus::Assigned);
        assert_eq!(claimed.prompt, task.prompt);

        // The claim unlinked the file: a second claim finds nothing.
        assert!(queue.claim("agent-1").unwrap().is_none());
        assert!(!queue.has_task("agent-1"));
    }

    #[test]
    fn test_unclaimed_task_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = TaskQueue::new(dir.path()).unwrap();
            queue
                .assign(&QueuedTask::new("task-002", "agent-2", "write tests"))
                .unwrap();
        }
        // A fresh queue over the same directory still sees the task.
        let queue = TaskQueue::new(dir.path()).unwrap();
        assert_eq!(queue.list_pending(), vec!["agent-2".to_string()]);
        let claimed = queue.claim("agent-2").unwrap().unwrap();
        assert_eq!(claimed.task_id, "task-002");
    }

    #[test]
    fn test_assign_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::new(dir.path()).unwrap();
        queue
            .assign(&QueuedTask::new("old", "agent-1", "old prompt"))
            .unwrap();
        queue
            .assign(&QueuedTask::new("new", "agent-1", "new prompt"))
            .unwrap();
        let claimed = queue.claim("agent-1").unwrap().unwrap();
        assert_eq!(claimed.task_id, "new");
    }

    #[test]
    fn test_result_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::new(dir.path()).unwrap();

        let mut task = QueuedTask::new("task-003", "agent-1", "prompt");
        task.status = TaskStatus::Completed;
        task.result = "done".to_string();
        task.completed_at = Some(Utc::now());
        queue.submit_result(&task).unwrap();

        assert!(queue.has_result("agent-1"));
        let fetched = queue.fetch_result("agent-1").unwrap().unwrap();
        assert_eq!(fetched.result, "done");
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert!(queue.fetch_result("agent-1").unwrap().is_none());
    }

    #[test]
    fn test_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::new(dir.path()).unwrap();
        queue
            .assign(&QueuedTask::new("t1", "agent-1", "p"))
            .unwrap();
        queue
            .submit_result(&QueuedTask::new("t2", "agent-2", "p"))
            .unwrap();
        assert_eq!(queue.cleanup().unwrap(), 2);
        assert!(queue.list_pending().is_empty());
        assert!(queue.list_completed().is_empty());
    }
}
