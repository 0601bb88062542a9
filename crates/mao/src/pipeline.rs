//! Sequential task pipeline.
//!
//! Holds the sub-tasks the CTO produced, starts them one at a time, and
//! applies the retry semantics: an approval advances the queue, a
//! rejection restarts the same task with the operator's feedback folded
//! into the prompt, and repeated failures fail the task terminally.
//!
//! The pipeline never owns the supervisor; it reaches it through the
//! [`AgentLauncher`] seam, and gate outcomes arrive as plain method calls.

use async_trait::async_trait;
use coordination::{MaoError, MaoResult};
use serde::Serialize;
use tracing::{info, warn};

use crate::parser::{LegacyTask, SpawnDirective, TaskPriority};
use crate::prompts;
use crate::roles::RoleCatalog;
use crate::supervisor::SpawnSpec;

/// Lifecycle of one sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
}

/// One decomposed unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct SubTask {
    pub subtask_id: String,
    /// The operator request this task was decomposed from.
    pub parent_task_id: String,
    /// Queue position, 1-based (shown to the operator).
    pub number: usize,
    pub description: String,
    pub role: String,
    pub model: Option<String>,
    pub priority: TaskPriority,
    pub status: SubTaskStatus,
    pub retry_count: u32,
    pub agent_id: Option<String>,
    pub result: Option<String>,
    pub started_at: Option<String>,
    pub approved_at: Option<String>,
}

/// The seam through which the pipeline starts agents.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Launch an agent; returns its id.
    async fn launch(&self, spec: SpawnSpec) -> MaoResult<String>;
}

/// Outcome the pipeline reports after ingesting a CTO response.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub queued: usize,
    pub skipped: Vec<String>,
    pub summaries: Vec<String>,
}

/// Sequential queue of sub-tasks with gated progression.
pub struct TaskPipeline {
    tasks: Vec<SubTask>,
    current_index: usize,
    sequential: bool,
    max_retries: u32,
    /// Feedback mode: worker worktrees branch off this.
    parent_branch: Option<String>,
}

impl TaskPipeline {
    pub fn new(max_retries: u32, parent_branch: Option<String>) -> Self {
        Self {
            tasks: Vec::new(),
            current_index: 0,
            sequential: true,
            max_retries,
            parent_branch,
        }
    }

    pub fn tasks(&self) -> &[SubTask] {
        &self.tasks
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn is_done(&self) -> bool {
        self.current_index >= self.tasks.len()
    }

    /// Short "task info" summary for the observable state surface.
    pub fn task_info(&self) -> String {
        if self.tasks.is_empty() {
            return "no tasks queued".to_string();
        }
        let mut lines = vec![format!(
            "{} task(s), current {}/{}",
            self.tasks.len(),
            (self.current_index + 1).min(self.tasks.len()),
            self.tasks.len()
        )];
        for task in self.tasks.iter().take(3) {
            let mut description = task.description.clone();
            if description.len() > 40 {
                description.truncate(40);
                description.push_str("...");
            }
            lines.push(format!("  {}. {}", task.number, description));
        }
        if self.tasks.len() > 3 {
            lines.push(format!("  ... and {} more", self.tasks.len() - 3));
        }
        lines.join("\n")
    }

    fn push_task(
        &mut self,
        parent_task_id: &str,
        description: String,
        role: String,
        model: Option<String>,
        priority: TaskPriority,
    ) -> SubTask {
        let number = self.tasks.len() + 1;
        let task = SubTask {
            subtask_id: coordination::short_id(),
            parent_task_id: parent_task_id.to_string(),
            number,
            description,
            role,
            model,
            priority,
            status: SubTaskStatus::Queued,
            retry_count: 0,
            agent_id: None,
            result: None,
            started_at: None,
            approved_at: None,
        };
        self.tasks.push(task.clone());
        task
    }

    /// Queue sub-tasks from structured spawn directives. Directives whose
    /// role does not resolve in the catalogue are skipped and reported.
    pub fn ingest_directives(
        &mut self,
        directives: &[SpawnDirective],
        catalog: &RoleCatalog,
        parent_task_id: &str,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        for directive in directives {
            if !catalog.contains(&directive.role) {
                report
                    .skipped
                    .push(format!("unknown role '{}'", directive.role));
                continue;
            }
            let task = self.push_task(
                parent_task_id,
                directive.task.clone(),
                directive.role.clone(),
                directive.model.clone(),
                directive.priority,
            );
            report.summaries.push(format!(
                "{}. {} ({}/{})",
                task.number,
                task.description,
                task.role,
                catalog.resolve_model(&task.role, task.model.as_deref())
            ));
            report.queued += 1;
        }
        info!(queued = report.queued, skipped = report.skipped.len(), "directives ingested");
        report
    }

    /// Queue sub-tasks from the legacy `Task N:` text form. Only used when
    /// a response carried no structured directives at all.
    pub fn ingest_legacy(
        &mut self,
        tasks: &[LegacyTask],
        catalog: &RoleCatalog,
        parent_task_id: &str,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        for legacy in tasks {
            let role = if catalog.contains(&legacy.role) {
                legacy.role.clone()
            } else {
                warn!(role = %legacy.role, "legacy task names unknown role, using general");
                "general".to_string()
            };
            let task = self.push_task(
                parent_task_id,
                legacy.description.clone(),
                role,
                legacy.model.clone(),
                TaskPriority::Medium,
            );
            report.summaries.push(format!(
                "{}. {} ({})",
                task.number, task.description, task.role
            ));
            report.queued += 1;
        }
        report
    }

    /// Decomposition fallback: the whole operator prompt as one `general`
    /// sub-task. No splitting by sentence or line.
    pub fn ingest_fallback(&mut self, user_prompt: &str, parent_task_id: &str) -> IngestReport {
        let task = self.push_task(
            parent_task_id,
            user_prompt.to_string(),
            "general".to_string(),
            None,
            TaskPriority::Medium,
        );
        IngestReport {
            queued: 1,
            skipped: Vec::new(),
            summaries: vec![format!("{}. {}", task.number, task.description)],
        }
    }

    fn spawn_spec(&self, task: &SubTask, description: String) -> SpawnSpec {
        SpawnSpec {
            description,
            role: task.role.clone(),
            model: task.model.clone(),
            task_number: task.number,
            parent_branch: self.parent_branch.clone(),
        }
    }

    /// Start the task at `current_index` if one is waiting.
    ///
    /// Returns `Ok(false)` when the queue is exhausted (all tasks done).
    pub async fn start_next(&mut self, launcher: &dyn AgentLauncher) -> MaoResult<bool> {
        if !self.sequential {
            return Err(MaoError::process(
                "start_next is only meaningful in sequential mode",
            ));
        }
        let Some(task) = self.tasks.get(self.current_index) else {
            info!("all tasks completed");
            return Ok(false);
        };
        if task.status == SubTaskStatus::InProgress {
            return Ok(true);
        }

        let spec = self.spawn_spec(task, task.description.clone());
        let number = task.number;
        let agent_id = launcher.launch(spec).await?;

        let task = &mut self.tasks[self.current_index];
        task.status = SubTaskStatus::InProgress;
        task.agent_id = Some(agent_id);
        task.started_at = Some(coordination::iso_utc_timestamp());
        info!(task_number = number, "task started");
        Ok(true)
    }

    fn task_by_number_mut(&mut self, number: usize) -> MaoResult<&mut SubTask> {
        self.tasks
            .iter_mut()
            .find(|t| t.number == number)
            .ok_or_else(|| MaoError::validation(format!("no task number {number}")))
    }

    /// Record an agent completion (the result text awaiting approval).
    pub fn on_agent_completed(&mut self, number: usize, result: &str) -> MaoResult<()> {
        let task = self.task_by_number_mut(number)?;
        task.result = Some(result.to_string());
        Ok(())
    }

    /// Gate said "approved": complete the current task, advance, start the
    /// next one. Returns `true` while tasks remain.
    pub async fn on_approved(
        &mut self,
        number: usize,
        launcher: &dyn AgentLauncher,
    ) -> MaoResult<bool> {
        let index = self.current_index;
        let task = self.task_by_number_mut(number)?;
        task.status = SubTaskStatus::Completed;
        task.approved_at = Some(coordination::iso_utc_timestamp());

        // Sequential mode: approval of the current task moves the cursor.
        if self
            .tasks
            .get(index)
            .map(|t| t.number == number)
            .unwrap_or(false)
        {
            self.current_index += 1;
        }
        self.start_next(launcher).await
    }

    /// Gate said "rejected with feedback": restart the same task from
    /// scratch with the feedback folded into the prompt. Past the retry
    /// ceiling the task fails terminally and the queue advances.
    pub async fn on_rejected(
        &mut self,
        number: usize,
        feedback: &str,
        launcher: &dyn AgentLauncher,
    ) -> MaoResult<bool> {
        let max_retries = self.max_retries;
        let (retry_count, snapshot) = {
            let task = self.task_by_number_mut(number)?;
            task.retry_count += 1;
            (task.retry_count, task.clone())
        };

        if retry_count > max_retries {
            warn!(
                task_number = number,
                retries = retry_count,
                "retry ceiling reached, failing task"
            );
            self.task_by_number_mut(number)?.status = SubTaskStatus::Failed;
            self.current_index += 1;
            return self.start_next(launcher).await;
        }

        let retry_prompt = prompts::build_retry_prompt(&snapshot.description, feedback);
        let spec = self.spawn_spec(&snapshot, retry_prompt);
        {
            let task = self.task_by_number_mut(number)?;
            task.status = SubTaskStatus::Queued;
            task.agent_id = None;
        }

        let agent_id = launcher.launch(spec).await?;
        let task = self.task_by_number_mut(number)?;
        task.status = SubTaskStatus::InProgress;
        task.agent_id = Some(agent_id);
        task.started_at = Some(coordination::iso_utc_timestamp());
        info!(task_number = number, retry = retry_count, "task restarted with feedback");
        Ok(true)
    }

    /// An agent died without a completion marker. Retries the task until
    /// the ceiling, then fails it terminally and advances.
    pub async fn on_agent_failed(
        &mut self,
        number: usize,
        error: &MaoError,
        launcher: &dyn AgentLauncher,
    ) -> MaoResult<bool> {
        let max_retries = self.max_retries;
        let (retry_count, snapshot) = {
            let task = self.task_by_number_mut(number)?;
            task.retry_count += 1;
            (task.retry_count, task.clone())
        };

        if retry_count > max_retries {
            warn!(task_number = number, error = %error, "task failed terminally");
            self.task_by_number_mut(number)?.status = SubTaskStatus::Failed;
            self.current_index += 1;
            return self.start_next(launcher).await;
        }

        warn!(task_number = number, retry = retry_count, error = %error, "retrying failed task");
        let spec = self.spawn_spec(&snapshot, snapshot.description.clone());
        {
            let task = self.task_by_number_mut(number)?;
            task.status = SubTaskStatus::Queued;
            task.agent_id = None;
        }

        let agent_id = launcher.launch(spec).await?;
        let task = self.task_by_number_mut(number)?;
        task.status = SubTaskStatus::InProgress;
        task.agent_id = Some(agent_id);
        task.started_at = Some(coordination::iso_utc_timestamp());
        Ok(true)
    }

    /// Drop everything (operator quit).
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.current_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Span;
    use std::sync::Mutex as StdMutex;

    /// Launcher that records specs instead of touching tmux.
    #[derive(Default)]
    struct RecordingLauncher {
        launches: StdMutex<Vec<SpawnSpec>>,
        fail: bool,
    }

    #[async_trait]
    impl AgentLauncher for RecordingLauncher {
        async fn launch(&self, spec: SpawnSpec) -> MaoResult<String> {
            if self.fail {
                return Err(MaoError::subprocess("claude", "spawn failed"));
            }
            let mut launches = self.launches.lock().unwrap();
            launches.push(spec);
            Ok(format!("agent-{}", launches.len()))
        }
    }

    fn directive(task: &str, role: &str) -> SpawnDirective {
        SpawnDirective {
            task: task.to_string(),
            role: role.to_string(),
            model: None,
            priority: TaskPriority::Medium,
            span: Span { start: 0, end: 0 },
        }
    }

    fn pipeline() -> TaskPipeline {
        TaskPipeline::new(3, None)
    }

    #[tokio::test]
    async fn test_ingest_and_sequential_start() {
        let mut pipeline = pipeline();
        let catalog = RoleCatalog::builtin();
        let report = pipeline.ingest_directives(
            &[
                directive("first task", "coder_backend"),
                directive("second task", "tester"),
            ],
            &catalog,
            "parent-1",
        );
        assert_eq!(report.queued, 2);
        assert!(report.skipped.is_empty());

        let launcher = RecordingLauncher::default();
        assert!(pipeline.start_next(&launcher).await.unwrap());

        // Only the first task started.
        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].description, "first task");
        drop(launches);
        assert_eq!(pipeline.tasks()[0].status, SubTaskStatus::InProgress);
        assert_eq!(pipeline.tasks()[1].status, SubTaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_unknown_role_is_skipped() {
        let mut pipeline = pipeline();
        let catalog = RoleCatalog::builtin();
        let report = pipeline.ingest_directives(
            &[
                directive("good", "tester"),
                directive("bad", "wizard"),
            ],
            &catalog,
            "parent-1",
        );
        assert_eq!(report.queued, 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].contains("wizard"));
    }

    #[tokio::test]
    async fn test_approval_advances_strictly_in_order() {
        let mut pipeline = pipeline();
        let catalog = RoleCatalog::builtin();
        pipeline.ingest_directives(
            &[directive("one", "tester"), directive("two", "tester")],
            &catalog,
            "p",
        );
        let launcher = RecordingLauncher::default();
        pipeline.start_next(&launcher).await.unwrap();

        let more = pipeline.on_approved(1, &launcher).await.unwrap();
        assert!(more);
        assert_eq!(pipeline.tasks()[0].status, SubTaskStatus::Completed);
        assert_eq!(pipeline.tasks()[1].status, SubTaskStatus::InProgress);

        // Task two starts strictly after task one's approval.
        let t1_approved = pipeline.tasks()[0].approved_at.clone().unwrap();
        let t2_started = pipeline.tasks()[1].started_at.clone().unwrap();
        assert!(t2_started >= t1_approved);

        let more = pipeline.on_approved(2, &launcher).await.unwrap();
        assert!(!more);
        assert!(pipeline.is_done());
    }

    #[tokio::test]
    async fn test_rejection_restarts_with_feedback() {
        let mut pipeline = pipeline();
        let catalog = RoleCatalog::builtin();
        pipeline.ingest_directives(&[directive("fix foo", "coder_backend")], &catalog, "p");
        let launcher = RecordingLauncher::default();
        pipeline.start_next(&launcher).await.unwrap();

        pipeline
            .on_rejected(1, "please add a type annotation", &launcher)
            .await
            .unwrap();

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches.len(), 2);
        let retry = &launches[1];
        assert!(retry.description.starts_with("fix foo\n\n【前回の指摘事項】"));
        assert!(retry.description.contains("please add a type annotation"));
        drop(launches);

        // Index unchanged: still on task 1.
        assert_eq!(pipeline.current_index(), 0);
        assert_eq!(pipeline.tasks()[0].retry_count, 1);
        assert_eq!(pipeline.tasks()[0].status, SubTaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_retry_ceiling_fails_terminally_and_advances() {
        let mut pipeline = TaskPipeline::new(1, None);
        let catalog = RoleCatalog::builtin();
        pipeline.ingest_directives(
            &[directive("flaky", "tester"), directive("next", "tester")],
            &catalog,
            "p",
        );
        let launcher = RecordingLauncher::default();
        pipeline.start_next(&launcher).await.unwrap();

        // First rejection: retry (count 1 <= ceiling 1).
        pipeline.on_rejected(1, "nope", &launcher).await.unwrap();
        assert_eq!(pipeline.tasks()[0].status, SubTaskStatus::InProgress);

        // Second rejection: beyond the ceiling, fail and advance.
        pipeline.on_rejected(1, "still no", &launcher).await.unwrap();
        assert_eq!(pipeline.tasks()[0].status, SubTaskStatus::Failed);
        assert_eq!(pipeline.tasks()[1].status, SubTaskStatus::InProgress);
        assert_eq!(pipeline.current_index(), 1);
    }

    #[tokio::test]
    async fn test_agent_failure_retries_same_description() {
        let mut pipeline = pipeline();
        let catalog = RoleCatalog::builtin();
        pipeline.ingest_directives(&[directive("crashy", "tester")], &catalog, "p");
        let launcher = RecordingLauncher::default();
        pipeline.start_next(&launcher).await.unwrap();

        let error = MaoError::timeout("agent agent-1 completion", 1800);
        pipeline.on_agent_failed(1, &error, &launcher).await.unwrap();

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[1].description, "crashy");
    }

    #[tokio::test]
    async fn test_fallback_queues_single_general_task() {
        let mut pipeline = pipeline();
        let report = pipeline.ingest_fallback("do the whole thing. all of it.", "p");
        assert_eq!(report.queued, 1);
        assert_eq!(pipeline.tasks().len(), 1);
        assert_eq!(pipeline.tasks()[0].role, "general");
        assert_eq!(
            pipeline.tasks()[0].description,
            "do the whole thing. all of it."
        );
    }

    #[tokio::test]
    async fn test_feedback_mode_sets_parent_branch() {
        let mut pipeline = TaskPipeline::new(3, Some("feedback/1_ab-fix".to_string()));
        let catalog = RoleCatalog::builtin();
        pipeline.ingest_directives(&[directive("work", "coder_backend")], &catalog, "p");
        let launcher = RecordingLauncher::default();
        pipeline.start_next(&launcher).await.unwrap();

        let launches = launcher.launches.lock().unwrap();
        assert_eq!(
            launches[0].parent_branch.as_deref(),
            Some("feedback/1_ab-fix")
        );
    }

    #[tokio::test]
    async fn test_task_info_summary() {
        let mut pipeline = pipeline();
        let catalog = RoleCatalog::builtin();
        pipeline.ingest_directives(
            &[
                directive("a very long description that should be truncated in the summary", "tester"),
                directive("b", "tester"),
                directive("c", "tester"),
                directive("d", "tester"),
            ],
            &catalog,
            "p",
        );
        let info = pipeline.task_info();
        assert!(info.contains("4 task(s)"));
        assert!(info.contains("..."));
        assert!(info.contains("and 1 more"));
    }
}
