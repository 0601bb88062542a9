//! Orchestrator shell: wires the components together and runs the loop.
//!
//! One orchestrator owns one tmux session, one chat session, one pipeline
//! and one CTO pane. Cooperative tasks: the CTO log monitor (500 ms), the
//! periodic state reconcile (1 Hz), the CTO message poll (1 Hz) and one
//! monitor per live agent. Shutdown cancels them in that order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordination::{
    AgentStatus, ApprovalQueue, FeedbackManager, ImprovementManager, MaoError, MaoResult,
    MessageQueue, ProjectConfig, SessionManager, StateManager,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::gate::{self, ApprovalGate, GateDecision, OperatorCommand};
use crate::parser;
use crate::pipeline::{AgentLauncher, TaskPipeline};
use crate::prompts;
use crate::roles::RoleCatalog;
use crate::supervisor::{AgentRuntime, AgentSupervisor, SpawnSpec, SupervisorNotice};
use crate::tmux::TmuxManager;
use crate::worktree::WorktreeManager;

/// CTO log poll cadence.
const CTO_MONITOR_INTERVAL: Duration = Duration::from_millis(500);
/// State reconcile cadence.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);
/// Message poll cadence for the CTO receiver.
const MESSAGE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Settled ticks of CTO silence before the decomposition fallback fires.
const FALLBACK_QUIET_TICKS: u32 = 20;
/// Grace period before tearing down after `[FEEDBACK_COMPLETED]`.
const FEEDBACK_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Which persisted entity a finished workflow annotates.
#[derive(Debug, Clone)]
pub enum WorkflowTarget {
    /// Feedback on MAO itself, stored under this project's `.mao/feedback/`.
    Feedback { feedback_id: String },
    /// An improvement registered in `registry_dir` (the directory
    /// `mao project` ran from), which may differ from the project the
    /// orchestrator is driving.
    Improvement {
        improvement_id: String,
        registry_dir: PathBuf,
    },
}

/// Improvement-workflow context: the orchestrator drives agents on worker
/// branches off `branch` and, on `[FEEDBACK_COMPLETED]`, annotates
/// `target` and shuts down.
#[derive(Debug, Clone)]
pub struct FeedbackMode {
    pub branch: String,
    pub target: WorkflowTarget,
}

/// Startup options for one orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Continue this session instead of the latest one.
    pub session_id: Option<String>,
    /// Force a new session.
    pub new_session: bool,
    pub session_title: Option<String>,
    /// Model for the CTO pane.
    pub cto_model: String,
    pub feedback: Option<FeedbackMode>,
}

/// Incremental scan state over the cumulative CTO log.
///
/// The parser re-reads the whole text each time; this tracker records the
/// consumed byte offset so each directive and feedback block fires once.
pub struct CtoScan {
    consumed: usize,
    feedback_done: bool,
}

/// What one scan pass produced.
#[derive(Debug, Default)]
pub struct CtoScanResult {
    pub directives: Vec<parser::SpawnDirective>,
    pub warnings: Vec<String>,
    pub feedbacks: Vec<parser::FeedbackBlock>,
    pub feedback_completed: Option<parser::FeedbackCompleted>,
}

impl CtoScan {
    pub fn new() -> Self {
        Self {
            consumed: 0,
            feedback_done: false,
        }
    }

    /// Scan the cumulative text, returning only blocks past the consumed
    /// offset, then advance the offset.
    pub fn scan(&mut self, cumulative: &str) -> CtoScanResult {
        let mut result = CtoScanResult::default();
        let mut high_water = self.consumed;

        let extraction = parser::extract_agent_spawns(cumulative);
        result.warnings = extraction.warnings;
        for directive in extraction.directives {
            if directive.span.start >= self.consumed {
                high_water = high_water.max(directive.span.end);
                result.directives.push(directive);
            }
        }

        for feedback in parser::extract_feedbacks(cumulative) {
            if feedback.span.start >= self.consumed {
                high_water = high_water.max(feedback.span.end);
                result.feedbacks.push(feedback);
            }
        }

        if !self.feedback_done {
            if let Some(completed) = parser::extract_feedback_completed(cumulative) {
                self.feedback_done = true;
                high_water = high_water.max(completed.span.end);
                result.feedback_completed = Some(completed);
            }
        }

        self.consumed = high_water;
        result
    }
}

impl Default for CtoScan {
    fn default() -> Self {
        Self::new()
    }
}

/// The launcher seam the pipeline uses to reach the supervisor.
struct SupervisorLauncher(Arc<AgentSupervisor>);

#[async_trait]
impl AgentLauncher for SupervisorLauncher {
    async fn launch(&self, spec: SpawnSpec) -> MaoResult<String> {
        self.0.spawn_agent(spec).await
    }
}

/// The assembled orchestrator.
pub struct Orchestrator {
    project_path: PathBuf,
    config: ProjectConfig,
    catalog: RoleCatalog,
    options: OrchestratorOptions,

    tmux: Arc<TmuxManager>,
    worktrees: Arc<WorktreeManager>,
    state: Arc<StateManager>,
    approvals: Arc<Mutex<ApprovalQueue>>,
    messages: Arc<MessageQueue>,
    feedback: Arc<FeedbackManager>,
    session: Arc<Mutex<SessionManager>>,
    events: Arc<EventBus>,

    supervisor: Arc<AgentSupervisor>,
    launcher: Arc<dyn AgentLauncher>,
    pipeline: Arc<Mutex<TaskPipeline>>,
    gate: Arc<ApprovalGate>,

    notices: Mutex<Option<mpsc::Receiver<SupervisorNotice>>>,
    cto_started: AtomicBool,
    cto_log: PathBuf,
    /// Operator prompt awaiting decomposition (fallback bookkeeping).
    pending_user_task: Arc<Mutex<Option<String>>>,

    shutdown: CancellationToken,
    reconcile_cancel: CancellationToken,
    poller_cancel: CancellationToken,
}

impl Orchestrator {
    /// Assemble an orchestrator for `project_path`.
    pub fn new(project_path: &Path, options: OrchestratorOptions) -> MaoResult<Arc<Self>> {
        let config = ProjectConfig::load_or_default(project_path);
        let catalog = RoleCatalog::builtin();

        let tmux = Arc::new(TmuxManager::new(
            &config.tmux.session_name,
            config.tmux.grid_width,
            config.tmux.grid_height,
            config.tmux.num_agents,
        ));
        let worktrees = Arc::new(WorktreeManager::new(project_path)?);
        let state = Arc::new(StateManager::new());
        let approvals = Arc::new(Mutex::new(ApprovalQueue::new(project_path)?));
        let messages = Arc::new(MessageQueue::new(project_path)?);
        let feedback = Arc::new(FeedbackManager::new(project_path)?);
        let events = Arc::new(EventBus::new());

        let session = if options.new_session {
            SessionManager::create_new(project_path, options.session_title.as_deref())?
        } else {
            SessionManager::open(
                project_path,
                options.session_id.as_deref(),
                options.session_title.as_deref(),
            )?
        };
        let session = Arc::new(Mutex::new(session));

        let runtime = Arc::new(AgentRuntime {
            project_path: project_path.to_path_buf(),
            config: config.clone(),
            catalog: catalog.clone(),
            tmux: tmux.clone(),
            worktrees: worktrees.clone(),
            state: state.clone(),
            approvals: approvals.clone(),
            events: events.clone(),
        });

        let (notice_tx, notice_rx) = mpsc::channel(64);
        let supervisor = Arc::new(AgentSupervisor::new(runtime, notice_tx));
        let launcher: Arc<dyn AgentLauncher> =
            Arc::new(SupervisorLauncher(supervisor.clone()));

        let pipeline = Arc::new(Mutex::new(TaskPipeline::new(
            config.agents.max_retries,
            options.feedback.as_ref().map(|f| f.branch.clone()),
        )));

        let gate = Arc::new(ApprovalGate::new(
            approvals.clone(),
            state.clone(),
            worktrees.clone(),
            tmux.clone(),
            events.clone(),
        ));

        let cto_log = coordination::mao_dir(project_path)
            .join("logs")
            .join("cto_output.log");

        Ok(Arc::new(Self {
            project_path: project_path.to_path_buf(),
            config,
            catalog,
            options,
            tmux,
            worktrees,
            state,
            approvals,
            messages,
            feedback,
            session,
            events,
            supervisor,
            launcher,
            pipeline,
            gate,
            notices: Mutex::new(Some(notice_rx)),
            cto_started: AtomicBool::new(false),
            cto_log,
            pending_user_task: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            reconcile_cancel: CancellationToken::new(),
            poller_cancel: CancellationToken::new(),
        }))
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub async fn session_id(&self) -> String {
        self.session.lock().await.session_id.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bring up the tmux session and the background tasks.
    pub async fn start(self: &Arc<Self>) -> MaoResult<()> {
        if !self.tmux.is_available().await {
            return Err(MaoError::validation(
                "tmux is required but was not found on PATH",
            ));
        }
        self.tmux.create_session().await?;

        // Periodic reconcile.
        {
            let this = self.clone();
            let cancel = self.reconcile_cancel.clone();
            tokio::spawn(async move { this.reconcile_loop(cancel).await });
        }
        // CTO message poll.
        {
            let messages = self.messages.clone();
            let cancel = self.poller_cancel.clone();
            tokio::spawn(async move {
                messages
                    .start_polling("cto", MESSAGE_POLL_INTERVAL, cancel)
                    .await;
            });
        }

        // Notice drain: supervisor completions and failures drive the
        // pipeline without the supervisor ever owning it.
        if let Some(mut notices) = self.notices.lock().await.take() {
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    this.handle_notice(notice).await;
                }
            });
        }

        self.events.publish(OrchestratorEvent::SystemMessage {
            message: format!("session {}", self.session_id().await),
        });
        Ok(())
    }

    /// Handle one line of operator input: a gate command or a CTO message.
    pub async fn handle_input(self: &Arc<Self>, line: &str) -> MaoResult<()> {
        match gate::parse_command(line) {
            Ok(Some(command)) => return self.handle_command(command).await,
            Ok(None) => {}
            Err(e) => {
                self.system_message(&e.to_string()).await;
                return Ok(());
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(MaoError::validation("empty prompt"));
        }

        self.session
            .lock()
            .await
            .add_message("user", trimmed, None)?;
        *self.pending_user_task.lock().await = Some(trimmed.to_string());
        self.send_to_cto(trimmed).await
    }

    async fn handle_command(self: &Arc<Self>, command: OperatorCommand) -> MaoResult<()> {
        match command {
            OperatorCommand::Approve { id, feedback } => {
                match self.gate.approve(&id, feedback.as_deref()).await {
                    Ok(decision) => self.apply_decision(decision).await?,
                    Err(e) => self.system_message(&e.to_string()).await,
                }
            }
            OperatorCommand::Reject { id, feedback } => {
                match self.gate.reject(&id, &feedback).await {
                    Ok(decision) => self.apply_decision(decision).await?,
                    Err(e) => self.system_message(&e.to_string()).await,
                }
            }
            OperatorCommand::Diff { id } => match self.gate.diff(&id).await {
                Ok(diff) => {
                    let mut shown = diff;
                    if shown.len() > 2000 {
                        shown.truncate(2000);
                        shown.push_str("\n... (truncated)");
                    }
                    self.system_message(&format!("diff {id}:\n{shown}")).await;
                }
                Err(e) => self.system_message(&e.to_string()).await,
            },
        }
        Ok(())
    }

    /// Feed a gate decision into the pipeline and release the agent.
    async fn apply_decision(self: &Arc<Self>, decision: GateDecision) -> MaoResult<()> {
        let item = decision.item().clone();
        self.supervisor.forget_agent(&item.agent_id).await;

        let more = match &decision {
            GateDecision::Approved { .. } => {
                self.system_message(&format!("approved {}", item.id)).await;
                self.pipeline
                    .lock()
                    .await
                    .on_approved(item.task_number, self.launcher.as_ref())
                    .await?
            }
            GateDecision::RejectedWithFeedback { feedback, .. } => {
                self.system_message(&format!("rejected {}: {feedback}", item.id))
                    .await;
                self.pipeline
                    .lock()
                    .await
                    .on_rejected(item.task_number, feedback, self.launcher.as_ref())
                    .await?
            }
        };

        if !more {
            self.events.publish(OrchestratorEvent::AllTasksCompleted);
            self.system_message("all tasks completed").await;
        }
        Ok(())
    }

    async fn handle_notice(self: &Arc<Self>, notice: SupervisorNotice) {
        match notice {
            SupervisorNotice::Completed {
                agent_id,
                task_number,
                approval_id,
            } => {
                info!(agent_id, approval_id, "agent awaiting approval");
                let output = {
                    let approvals = self.approvals.lock().await;
                    approvals
                        .get_item(&approval_id)
                        .ok()
                        .and_then(|item| item.output.clone())
                        .unwrap_or_default()
                };
                if let Err(e) = self
                    .pipeline
                    .lock()
                    .await
                    .on_agent_completed(task_number, &output)
                {
                    warn!(error = %e, "completion bookkeeping failed");
                }
                self.system_message(&format!(
                    "{agent_id} finished task {task_number}: /approve {approval_id} or /reject {approval_id} <feedback>"
                ))
                .await;
            }
            SupervisorNotice::Failed {
                agent_id,
                task_number,
                error,
            } => {
                warn!(agent_id, task_number, error = %error, "agent failed");
                self.system_message(&format!(
                    "{agent_id} failed task {task_number}: {error}"
                ))
                .await;
                let result = self
                    .pipeline
                    .lock()
                    .await
                    .on_agent_failed(task_number, &error, self.launcher.as_ref())
                    .await;
                match result {
                    Ok(false) => {
                        self.events.publish(OrchestratorEvent::AllTasksCompleted);
                    }
                    Ok(true) => {}
                    Err(e) => error!(error = %e, "failure handling failed"),
                }
            }
        }
    }

    /// Send one message to the CTO pane, starting the interactive LLM on
    /// first use and the log monitor with it.
    async fn send_to_cto(self: &Arc<Self>, message: &str) -> MaoResult<()> {
        let pane = self
            .tmux
            .pane_for_slot("cto")
            .ok_or_else(|| MaoError::process("cto pane missing from grid"))?;

        if !self.cto_started.swap(true, Ordering::SeqCst) {
            if let Some(parent) = self.cto_log.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.cto_log, "")?;
            self.tmux.enable_logging(&pane, &self.cto_log).await?;
            // The CTO runs with full permissions in the project root.
            self.tmux
                .start_interactive_llm(
                    &pane,
                    &self.options.cto_model,
                    Some(&self.project_path),
                    true,
                )
                .await?;
            self.state
                .set_status("cto", "cto", AgentStatus::Thinking, message)
                .await;

            let this = self.clone();
            let cancel = self.shutdown.clone();
            tokio::spawn(async move { this.cto_monitor_loop(cancel).await });

            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        let history: Vec<(String, String)> = {
            let session = self.session.lock().await;
            session
                .get_messages(None, Some(10))
                .into_iter()
                .filter(|m| m.role != "system")
                .map(|m| (m.role, m.content))
                .collect()
        };
        let prompt = prompts::build_cto_prompt(
            message,
            &history,
            &self.catalog,
            self.options.feedback.as_ref().map(|f| f.branch.as_str()),
        );
        self.tmux.send_prompt(&pane, &prompt).await
    }

    /// Poll the CTO log for new bytes; parse, ingest, and stream chunks.
    async fn cto_monitor_loop(self: Arc<Self>, cancel: CancellationToken) {
        /// Quiet ticks after which the settled response joins the session
        /// transcript as one `cto` message.
        const RESPONSE_SETTLE_TICKS: u32 = 6;

        let mut offset: usize = 0;
        let mut recorded: usize = 0;
        let mut scan = CtoScan::new();
        let mut quiet_ticks: u32 = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(CTO_MONITOR_INTERVAL) => {}
            }

            let content = match std::fs::read_to_string(&self.cto_log) {
                Ok(content) => content,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(error = %e, "cto log read failed");
                    }
                    continue;
                }
            };

            if content.len() > offset {
                let chunk = content[offset..].to_string();
                offset = content.len();
                quiet_ticks = 0;
                self.events
                    .publish(OrchestratorEvent::CtoOutput { chunk });

                let result = scan.scan(&content);
                self.apply_scan(result).await;
            } else {
                quiet_ticks += 1;
                if quiet_ticks == RESPONSE_SETTLE_TICKS && content.len() > recorded {
                    let response = content[recorded..].trim().to_string();
                    recorded = content.len();
                    if !response.is_empty() {
                        if let Err(e) = self.record_cto_response(&response).await {
                            warn!(error = %e, "failed to persist cto response");
                        }
                    }
                }
                self.maybe_run_fallback(quiet_ticks).await;
            }
        }
    }

    async fn apply_scan(self: &Arc<Self>, result: CtoScanResult) {
        for warning in &result.warnings {
            warn!(warning, "spawn block skipped");
        }

        if !result.directives.is_empty() {
            let parent_task_id = self.session_id().await;
            let report = {
                let mut pipeline = self.pipeline.lock().await;
                pipeline.ingest_directives(&result.directives, &self.catalog, &parent_task_id)
            };
            for skipped in &report.skipped {
                self.system_message(&format!("spawn directive skipped: {skipped}"))
                    .await;
            }
            if report.queued > 0 {
                *self.pending_user_task.lock().await = None;
                self.events.publish(OrchestratorEvent::TasksQueued {
                    count: report.queued,
                    summaries: report.summaries.clone(),
                });
                let started = {
                    let mut pipeline = self.pipeline.lock().await;
                    pipeline.start_next(self.launcher.as_ref()).await
                };
                if let Err(e) = started {
                    self.system_message(&format!("failed to start first task: {e}"))
                        .await;
                }
            }
        }

        for block in &result.feedbacks {
            let session_id = self.session_id().await;
            match self.feedback.add_feedback(
                &block.title,
                &block.description,
                &block.category,
                &block.priority,
                "cto",
                &session_id,
                None,
            ) {
                Ok(feedback) => {
                    self.system_message(&format!(
                        "feedback recorded: {} ({})",
                        feedback.title, feedback.id
                    ))
                    .await;
                }
                Err(e) => warn!(error = %e, "failed to persist feedback block"),
            }
        }

        if let Some(completed) = result.feedback_completed {
            self.handle_feedback_completed(completed).await;
        }
    }

    /// Decomposition fallback for a CTO response that settled without any
    /// structured directive: first try the legacy `Task N:` text form, and
    /// only then queue the whole operator prompt as one generic sub-task.
    /// Structured directives always pre-empt this path.
    async fn maybe_run_fallback(self: &Arc<Self>, quiet_ticks: u32) {
        if quiet_ticks != FALLBACK_QUIET_TICKS {
            return;
        }
        let Some(user_prompt) = self.pending_user_task.lock().await.take() else {
            return;
        };
        {
            let pipeline = self.pipeline.lock().await;
            if !pipeline.tasks().is_empty() {
                return;
            }
        }

        self.dump_cto_debug().await;
        let response = std::fs::read_to_string(&self.cto_log).unwrap_or_default();
        let legacy = parser::extract_legacy_tasks(&response);
        let parent_task_id = self.session_id().await;

        let started = {
            let mut pipeline = self.pipeline.lock().await;
            let report = if legacy.is_empty() {
                warn!("no directives in CTO response, dispatching one general task");
                pipeline.ingest_fallback(&user_prompt, &parent_task_id)
            } else {
                warn!(count = legacy.len(), "no structured directives, using legacy task form");
                pipeline.ingest_legacy(&legacy, &self.catalog, &parent_task_id)
            };
            self.events.publish(OrchestratorEvent::TasksQueued {
                count: report.queued,
                summaries: report.summaries.clone(),
            });
            pipeline.start_next(self.launcher.as_ref()).await
        };
        if let Err(e) = started {
            self.system_message(&format!("fallback dispatch failed: {e}"))
                .await;
        }
    }

    /// Save the raw CTO response for offline debugging.
    async fn dump_cto_debug(&self) {
        let debug_dir = coordination::mao_dir(&self.project_path).join("debug");
        let path = debug_dir.join(format!(
            "cto_response_{}.txt",
            coordination::compact_utc_timestamp()
        ));
        let content = std::fs::read_to_string(&self.cto_log).unwrap_or_default();
        if let Err(e) =
            std::fs::create_dir_all(&debug_dir).and_then(|()| std::fs::write(&path, content))
        {
            warn!(error = %e, "failed to dump cto response");
        }
    }

    /// Annotate the workflow's target entity after the CTO declared
    /// `[FEEDBACK_COMPLETED]`: a feedback row gets its status and PR
    /// metadata, an improvement gets `record_pr` against the registry that
    /// owns it (not necessarily the project being driven).
    pub fn record_workflow_completion(
        &self,
        completed: &parser::FeedbackCompleted,
    ) -> MaoResult<()> {
        let Some(mode) = &self.options.feedback else {
            return Ok(());
        };
        match &mode.target {
            WorkflowTarget::Feedback { feedback_id } => {
                self.feedback.update_status(feedback_id, "completed")?;
                if let Some(pr_url) = &completed.pr_url {
                    self.feedback.set_metadata(
                        feedback_id,
                        "pr_url",
                        serde_json::Value::String(pr_url.clone()),
                    )?;
                }
            }
            WorkflowTarget::Improvement {
                improvement_id,
                registry_dir,
            } => {
                let improvements = ImprovementManager::new(registry_dir)?;
                match &completed.pr_url {
                    Some(pr_url) => {
                        improvements.record_pr(improvement_id, pr_url, &mode.branch)?;
                    }
                    None => {
                        improvements.update_status(improvement_id, "completed")?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_feedback_completed(self: &Arc<Self>, completed: parser::FeedbackCompleted) {
        let Some(mode) = &self.options.feedback else {
            // Not in an improvement workflow; nothing to complete.
            return;
        };
        info!(
            branch = %mode.branch,
            pr = completed.pr_url.as_deref().unwrap_or("-"),
            "improvement workflow completed"
        );

        if let Err(e) = self.record_workflow_completion(&completed) {
            warn!(error = %e, "failed to annotate completed workflow");
        }

        self.events.publish(OrchestratorEvent::FeedbackCompleted {
            pr_url: completed.pr_url.clone(),
        });
        self.system_message(&format!(
            "feedback improvement completed (PR: {}), shutting down",
            completed.pr_url.as_deref().unwrap_or("n/a")
        ))
        .await;

        tokio::time::sleep(FEEDBACK_SHUTDOWN_GRACE).await;
        if let Err(e) = self.shutdown(true).await {
            error!(error = %e, "shutdown after feedback completion failed");
        }
    }

    /// 1 Hz reconcile: publish the observable state surface.
    async fn reconcile_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(RECONCILE_INTERVAL) => {}
            }
            let stats = self.state.get_stats().await;
            let task_info = self.pipeline.lock().await.task_info();
            self.events.publish(OrchestratorEvent::StateUpdated {
                total_agents: stats.total_agents,
                active_agents: stats.active_agents,
                total_tokens: stats.total_tokens,
                total_cost: stats.total_cost,
                task_info,
            });
        }
    }

    async fn system_message(&self, message: &str) {
        if let Err(e) = self
            .session
            .lock()
            .await
            .add_message("system", message, None)
        {
            warn!(error = %e, "failed to persist system message");
        }
        self.events.publish(OrchestratorEvent::SystemMessage {
            message: message.to_string(),
        });
    }

    /// Append a settled CTO response to the session transcript.
    pub async fn record_cto_response(&self, response: &str) -> MaoResult<()> {
        self.session
            .lock()
            .await
            .add_message("cto", response, None)?;
        Ok(())
    }

    /// Orderly shutdown: cancel the reconcile, the poller, then every
    /// agent monitor; clear state; remove worktrees; optionally destroy
    /// the tmux session.
    pub async fn shutdown(self: &Arc<Self>, destroy_tmux: bool) -> MaoResult<()> {
        self.events.publish(OrchestratorEvent::ShuttingDown);

        let pending = self.approvals.lock().await.get_pending_items().len();
        if pending > 0 {
            warn!(pending, "shutting down with approvals still pending");
        }

        self.reconcile_cancel.cancel();
        self.poller_cancel.cancel();
        self.supervisor.cancel_all().await;
        self.shutdown.cancel();

        self.state.clear_all_states().await;
        self.pipeline.lock().await.clear();
        if let Err(e) = self.approvals.lock().await.clear_approved() {
            warn!(error = %e, "failed to clear approved items");
        }

        match self.worktrees.cleanup_worktrees().await {
            Ok(cleaned) if cleaned > 0 => info!(cleaned, "removed leftover worktrees"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "worktree cleanup failed"),
        }

        if destroy_tmux {
            if let Err(e) = self.tmux.destroy_session().await {
                warn!(error = %e, "failed to destroy tmux session");
            }
        }
        info!("orchestrator shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_block(task: &str) -> String {
        format!(
            "[MAO_AGENT_SPAWN]\n{{\"task\": \"{task}\", \"role\": \"tester\"}}\n[/MAO_AGENT_SPAWN]"
        )
    }

    #[test]
    fn test_cto_scan_deduplicates_by_offset() {
        let mut scan = CtoScan::new();
        let first = spawn_block("one");
        let result = scan.scan(&first);
        assert_eq!(result.directives.len(), 1);

        // Same cumulative text again: nothing new.
        let result = scan.scan(&first);
        assert!(result.directives.is_empty());

        // Text grows with a second block: only the new one fires.
        let grown = format!("{first}\nprose in between\n{}", spawn_block("two"));
        let result = scan.scan(&grown);
        assert_eq!(result.directives.len(), 1);
        assert_eq!(result.directives[0].task, "two");
    }

    #[test]
    fn test_cto_scan_feedback_completed_fires_once() {
        let mut scan = CtoScan::new();
        let text = "[FEEDBACK_COMPLETED]\nPR: https://x/1\nSummary: s\n[/FEEDBACK_COMPLETED]";
        assert!(scan.scan(text).feedback_completed.is_some());
        assert!(scan.scan(text).feedback_completed.is_none());
    }

    #[test]
    fn test_cto_scan_mixed_blocks() {
        let mut scan = CtoScan::new();
        let text = format!(
            "{}\n[MAO_FEEDBACK_START]\nTitle: t\nDescription: d\n[MAO_FEEDBACK_END]\n",
            spawn_block("task")
        );
        let result = scan.scan(&text);
        assert_eq!(result.directives.len(), 1);
        assert_eq!(result.feedbacks.len(), 1);
    }

    #[tokio::test]
    async fn test_orchestrator_assembles() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dir.path(),
            OrchestratorOptions {
                cto_model: "sonnet".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!orchestrator.session_id().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dir.path(),
            OrchestratorOptions {
                cto_model: "sonnet".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let err = orchestrator.handle_input("   ").await.unwrap_err();
        assert_eq!(err.error_type(), "validation");
    }

    #[tokio::test]
    async fn test_unknown_command_becomes_system_message() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dir.path(),
            OrchestratorOptions {
                cto_model: "sonnet".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let mut events = orchestrator.subscribe();
        orchestrator.handle_input("/bogus x").await.unwrap();
        match events.recv().await.unwrap() {
            OrchestratorEvent::SystemMessage { message } => {
                assert!(message.contains("unknown command"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_record_workflow_completion_feedback_target() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let feedback = manager
            .add_feedback("fix retries", "d", "bug", "high", "cto", "s", None)
            .unwrap();

        let orchestrator = Orchestrator::new(
            dir.path(),
            OrchestratorOptions {
                cto_model: "sonnet".to_string(),
                feedback: Some(FeedbackMode {
                    branch: "feedback/1_ab-fix".to_string(),
                    target: WorkflowTarget::Feedback {
                        feedback_id: feedback.id.clone(),
                    },
                }),
                ..Default::default()
            },
        )
        .unwrap();

        let completed = parser::extract_feedback_completed(
            "[FEEDBACK_COMPLETED]\nPR: https://x/7\nSummary: s\n[/FEEDBACK_COMPLETED]",
        )
        .unwrap();
        orchestrator.record_workflow_completion(&completed).unwrap();

        let updated = manager.get_feedback(&feedback.id).unwrap().unwrap();
        assert_eq!(updated.status, "completed");
        assert_eq!(
            updated.metadata.get("pr_url"),
            Some(&serde_json::Value::String("https://x/7".to_string()))
        );
    }

    #[tokio::test]
    async fn test_approve_missing_id_reports_without_crashing() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dir.path(),
            OrchestratorOptions {
                cto_model: "sonnet".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let mut events = orchestrator.subscribe();
        orchestrator.handle_input("/approve deadbeef").await.unwrap();
        match events.recv().await.unwrap() {
            OrchestratorEvent::SystemMessage { message } => {
                assert!(message.contains("deadbeef"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
