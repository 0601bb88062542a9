//! Agent supervisor: the full lifecycle of one worker agent.
//!
//! Spawn claims a pane, builds the (optional) worktree, starts the
//! interactive LLM, sends the augmented prompt, then monitors the teed
//! pane log until a completion marker appears or the agent times out.
//! Completions become approval items; the pane is retained while the item
//! is pending and released only during gate cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use coordination::{
    AgentStatus, ApprovalQueue, MaoError, MaoResult, NewApprovalItem, ProjectConfig, StateManager,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::notify;
use crate::parser;
use crate::prompts;
use crate::roles::RoleCatalog;
use crate::tmux::TmuxManager;
use crate::worktree::WorktreeManager;

/// Log-poll cadence for agent monitors (within the 0.5–1 s band).
const MONITOR_INTERVAL: Duration = Duration::from_millis(750);

/// Grace period between starting the LLM and sending the prompt.
const LLM_STARTUP_GRACE: Duration = Duration::from_secs(3);

/// Everything needed to spawn one agent.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub description: String,
    pub role: String,
    /// Explicit model; `None` uses the role default.
    pub model: Option<String>,
    /// Position in the sequential task queue.
    pub task_number: usize,
    /// Feedback mode: branch the agent's worktree off this branch.
    pub parent_branch: Option<String>,
}

/// Supervisor-side record of a live agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub role: String,
    pub model: String,
    pub slot: String,
    pub pane_id: String,
    pub task_number: usize,
    pub description: String,
    pub worktree: Option<PathBuf>,
    pub branch: Option<String>,
    pub log_file: PathBuf,
    /// `Running` → `AwaitingApproval`; the record survives completion so
    /// the interactive LLM keeps its pane until gate cleanup.
    pub status: AgentLifecycle,
    pub started_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLifecycle {
    Running,
    AwaitingApproval,
}

/// Notice sent to the orchestrator loop when a monitor finishes.
#[derive(Debug)]
pub enum SupervisorNotice {
    /// Completion marker seen; an approval item was filed.
    Completed {
        agent_id: String,
        task_number: usize,
        approval_id: String,
    },
    /// The agent failed (spawn error or timeout without marker).
    Failed {
        agent_id: String,
        task_number: usize,
        error: MaoError,
    },
}

/// Shared dependencies of the supervisor.
pub struct AgentRuntime {
    pub project_path: PathBuf,
    pub config: ProjectConfig,
    pub catalog: RoleCatalog,
    pub tmux: Arc<TmuxManager>,
    pub worktrees: Arc<WorktreeManager>,
    pub state: Arc<StateManager>,
    pub approvals: Arc<Mutex<ApprovalQueue>>,
    pub events: Arc<EventBus>,
}

type AgentMap = Arc<Mutex<HashMap<String, AgentRecord>>>;

/// Supervises every worker agent of one orchestrator session.
pub struct AgentSupervisor {
    runtime: Arc<AgentRuntime>,
    agents: AgentMap,
    monitors: Mutex<HashMap<String, CancellationToken>>,
    counter: std::sync::atomic::AtomicUsize,
    notices: mpsc::Sender<SupervisorNotice>,
}

impl AgentSupervisor {
    pub fn new(runtime: Arc<AgentRuntime>, notices: mpsc::Sender<SupervisorNotice>) -> Self {
        Self {
            runtime,
            agents: Arc::new(Mutex::new(HashMap::new())),
            monitors: Mutex::new(HashMap::new()),
            counter: std::sync::atomic::AtomicUsize::new(0),
            notices,
        }
    }

    fn next_agent_id(&self) -> String {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        format!("agent-{n}")
    }

    pub async fn record_of(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.lock().await.get(agent_id).cloned()
    }

    pub async fn live_agents(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> =
            self.agents.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    /// Forget an agent entirely: cancel its monitor and release its pane.
    /// Called from gate cleanup and shutdown.
    pub async fn forget_agent(&self, agent_id: &str) {
        if let Some(token) = self.monitors.lock().await.remove(agent_id) {
            token.cancel();
        }
        self.agents.lock().await.remove(agent_id);
        self.runtime.tmux.release_slot(agent_id);
    }

    /// Cancel every monitor (shutdown path).
    pub async fn cancel_all(&self) {
        for (_, token) in self.monitors.lock().await.drain() {
            token.cancel();
        }
        self.agents.lock().await.clear();
    }

    /// Spawn one agent for `spec` and start monitoring it.
    ///
    /// Validation happens before any subprocess: an empty description or an
    /// unknown role never reaches tmux.
    pub async fn spawn_agent(&self, spec: SpawnSpec) -> MaoResult<String> {
        if spec.description.trim().is_empty() {
            return Err(MaoError::validation("task description must not be empty"));
        }
        if !self.runtime.catalog.contains(&spec.role) {
            return Err(MaoError::validation(format!(
                "unknown role '{}'",
                spec.role
            )));
        }

        let agent_id = self.next_agent_id();
        let model = self
            .runtime
            .catalog
            .resolve_model(&spec.role, spec.model.as_deref());

        info!(
            agent_id,
            role = %spec.role,
            model,
            task_number = spec.task_number,
            "spawning agent"
        );

        self.runtime
            .state
            .set_status(&agent_id, &spec.role, AgentStatus::Thinking, &spec.description)
            .await;

        match self.spawn_inner(&agent_id, &spec, &model).await {
            Ok(()) => Ok(agent_id),
            Err(e) => {
                // Spawn failed: release everything claimed so far.
                self.runtime.state.clear_state(&agent_id).await;
                self.runtime.tmux.release_slot(&agent_id);
                self.agents.lock().await.remove(&agent_id);
                self.runtime.events.publish(OrchestratorEvent::AgentFailed {
                    agent_id: agent_id.clone(),
                    error_type: e.error_type().to_string(),
                    message: e.to_string(),
                });
                let _ = self
                    .notices
                    .send(SupervisorNotice::Failed {
                        agent_id,
                        task_number: spec.task_number,
                        error: MaoError::subprocess("agent spawn", e.to_string()),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn spawn_inner(&self, agent_id: &str, spec: &SpawnSpec, model: &str) -> MaoResult<()> {
        let runtime = &self.runtime;

        // Feedback mode: the agent edits its own worktree off the parent
        // branch; otherwise it works in the project root.
        let (worktree, branch) = match &spec.parent_branch {
            Some(parent) => {
                let path = runtime
                    .worktrees
                    .create_worker_worktree(parent, agent_id)
                    .await?;
                (Some(path), Some(format!("{parent}-{agent_id}")))
            }
            None => (None, None),
        };
        let work_dir = worktree
            .clone()
            .unwrap_or_else(|| runtime.project_path.clone());

        let log_file = coordination::mao_dir(&runtime.project_path)
            .join("logs")
            .join(format!(
                "{agent_id}_{}.log",
                coordination::compact_utc_timestamp()
            ));
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (slot, pane_id) = runtime.tmux.claim_slot(agent_id)?;
        runtime
            .tmux
            .assign(&slot, agent_id, &work_dir, Some(&log_file))
            .await?;
        runtime
            .tmux
            .start_interactive_llm(
                &pane_id,
                model,
                Some(&work_dir),
                runtime.config.security.allow_unsafe_operations,
            )
            .await?;

        tokio::time::sleep(LLM_STARTUP_GRACE).await;

        let prompt = prompts::build_agent_prompt(
            &spec.description,
            worktree.as_deref().zip(branch.as_deref()),
        );
        runtime.tmux.send_prompt(&pane_id, &prompt).await?;

        let record = AgentRecord {
            agent_id: agent_id.to_string(),
            role: spec.role.clone(),
            model: model.to_string(),
            slot,
            pane_id: pane_id.clone(),
            task_number: spec.task_number,
            description: spec.description.clone(),
            worktree,
            branch,
            log_file,
            status: AgentLifecycle::Running,
            started_at: coordination::iso_utc_timestamp(),
        };
        self.agents
            .lock()
            .await
            .insert(agent_id.to_string(), record.clone());

        runtime
            .state
            .set_status(agent_id, &spec.role, AgentStatus::Active, &spec.description)
            .await;
        runtime.events.publish(OrchestratorEvent::AgentStarted {
            agent_id: agent_id.to_string(),
            role: spec.role.clone(),
            model: model.to_string(),
            pane_id,
        });

        let token = CancellationToken::new();
        self.monitors
            .lock()
            .await
            .insert(agent_id.to_string(), token.clone());
        tokio::spawn(monitor_agent(
            runtime.clone(),
            self.agents.clone(),
            record,
            token,
            self.notices.clone(),
        ));
        Ok(())
    }
}

/// Monitor one agent's log until completion, timeout or cancellation.
async fn monitor_agent(
    runtime: Arc<AgentRuntime>,
    agents: AgentMap,
    record: AgentRecord,
    cancel: CancellationToken,
    notices: mpsc::Sender<SupervisorNotice>,
) {
    let agent_id = record.agent_id.clone();
    let timeout = Duration::from_secs(runtime.config.agents.timeout_secs);
    let started = tokio::time::Instant::now();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(agent_id, "monitor cancelled");
                return;
            }
            () = tokio::time::sleep(MONITOR_INTERVAL) => {}
        }

        if started.elapsed() >= timeout {
            warn!(agent_id, timeout_secs = timeout.as_secs(), "agent timed out");
            let _ = runtime.tmux.disable_logging(&record.pane_id).await;
            runtime.state.clear_state(&agent_id).await;
            runtime.tmux.release_slot(&agent_id);
            agents.lock().await.remove(&agent_id);
            let error = MaoError::timeout(
                format!("agent {agent_id} completion"),
                timeout.as_secs(),
            );
            runtime.events.publish(OrchestratorEvent::AgentFailed {
                agent_id: agent_id.clone(),
                error_type: error.error_type().to_string(),
                message: error.to_string(),
            });
            let _ = notices
                .send(SupervisorNotice::Failed {
                    agent_id: agent_id.clone(),
                    task_number: record.task_number,
                    error,
                })
                .await;
            return;
        }

        let content = match std::fs::read_to_string(&record.log_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(agent_id, error = %e, "log read failed, retrying next tick");
                continue;
            }
        };

        let Some(completion) = parser::detect_task_completion(&content) else {
            continue;
        };
        info!(agent_id, pattern = completion.pattern, "completion detected");

        if let Err(e) = runtime.tmux.disable_logging(&record.pane_id).await {
            warn!(agent_id, error = %e, "failed to disable pane logging");
        }

        // The teed log is the captured output; fall back to the pane
        // scrollback when the log came back empty.
        let output = if content.is_empty() {
            runtime
                .tmux
                .capture_pane(&record.pane_id, 200)
                .await
                .unwrap_or_default()
        } else {
            content
        };

        // Ground truth for changed files is git; the marker's own list is
        // the fallback for agents without a worktree.
        let changed_files = match &record.worktree {
            Some(worktree) => runtime
                .worktrees
                .changed_files(worktree)
                .await
                .unwrap_or_else(|e| {
                    warn!(agent_id, error = %e, "changed-files lookup failed");
                    completion.changed_files.clone()
                }),
            None => completion.changed_files.clone(),
        };

        let item = {
            let mut approvals = runtime.approvals.lock().await;
            approvals.add_item(NewApprovalItem {
                agent_id: agent_id.clone(),
                task_number: record.task_number,
                task_description: record.description.clone(),
                role: record.role.clone(),
                model: record.model.clone(),
                pane_id: Some(record.pane_id.clone()),
                worktree: record.worktree.clone(),
                branch: record.branch.clone(),
                changed_files,
                output: Some(output),
            })
        };
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                error!(agent_id, error = %e, "failed to persist approval item");
                let _ = notices
                    .send(SupervisorNotice::Failed {
                        agent_id: agent_id.clone(),
                        task_number: record.task_number,
                        error: e,
                    })
                    .await;
                return;
            }
        };

        // Keep the record (the interactive LLM still owns the pane), but
        // flip it to awaiting-approval.
        if let Some(rec) = agents.lock().await.get_mut(&agent_id) {
            rec.status = AgentLifecycle::AwaitingApproval;
        }
        runtime
            .state
            .set_status(
                &agent_id,
                &record.role,
                AgentStatus::Waiting,
                "awaiting approval",
            )
            .await;

        notify::approval_pending(&agent_id, &item.id).await;
        runtime.events.publish(OrchestratorEvent::ApprovalPending {
            item: item.clone(),
        });
        let _ = notices
            .send(SupervisorNotice::Completed {
                agent_id: agent_id.clone(),
                task_number: record.task_number,
                approval_id: item.id,
            })
            .await;
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runtime(dir: &std::path::Path) -> Arc<AgentRuntime> {
        let config = ProjectConfig::new("test");
        Arc::new(AgentRuntime {
            project_path: dir.to_path_buf(),
            config,
            catalog: RoleCatalog::builtin(),
            tmux: Arc::new(TmuxManager::new("mao-test-sup", 240, 60, 2)),
            worktrees: Arc::new(WorktreeManager::new(dir).unwrap()),
            state: Arc::new(StateManager::new()),
            approvals: Arc::new(Mutex::new(ApprovalQueue::new(dir).unwrap())),
            events: Arc::new(EventBus::new()),
        })
    }

    #[tokio::test]
    async fn test_empty_description_is_validation_error_before_any_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let supervisor = AgentSupervisor::new(test_runtime(dir.path()), tx);

        let err = supervisor
            .spawn_agent(SpawnSpec {
                description: "   ".to_string(),
                role: "coder_backend".to_string(),
                model: None,
                task_number: 1,
                parent_branch: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "validation");
        // Nothing was claimed or recorded.
        assert!(supervisor.live_agents().await.is_empty());
        assert!(supervisor
            .runtime
            .state
            .get_all_states()
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_role_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let supervisor = AgentSupervisor::new(test_runtime(dir.path()), tx);

        let err = supervisor
            .spawn_agent(SpawnSpec {
                description: "do something".to_string(),
                role: "astronaut".to_string(),
                model: None,
                task_number: 1,
                parent_branch: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "validation");
    }

    #[tokio::test]
    async fn test_agent_ids_are_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let supervisor = AgentSupervisor::new(test_runtime(dir.path()), tx);
        assert_eq!(supervisor.next_agent_id(), "agent-1");
        assert_eq!(supervisor.next_agent_id(), "agent-2");
    }

    #[tokio::test]
    async fn test_forget_agent_releases_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let supervisor = AgentSupervisor::new(test_runtime(dir.path()), tx);

        // Simulate a registered agent without going through tmux.
        supervisor.agents.lock().await.insert(
            "agent-1".to_string(),
            AgentRecord {
                agent_id: "agent-1".to_string(),
                role: "tester".to_string(),
                model: "sonnet".to_string(),
                slot: "agent-1".to_string(),
                pane_id: "mao-test-sup:0.1".to_string(),
                task_number: 1,
                description: "d".to_string(),
                worktree: None,
                branch: None,
                log_file: dir.path().join("log"),
                status: AgentLifecycle::Running,
                started_at: coordination::iso_utc_timestamp(),
            },
        );

        supervisor.forget_agent("agent-1").await;
        assert!(supervisor.record_of("agent-1").await.is_none());
    }
}
