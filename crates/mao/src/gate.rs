//! Approval gate: correlates agent completions with operator decisions.
//!
//! Operator commands arrive as chat lines (`/approve`, `/reject`,
//! `/diff`). Approve and reject both run the ordered cleanup (state
//! record, worktree, index entry, pane), then report the decision so the
//! pipeline can advance or retry. `/diff` is side-effect-free.

use std::sync::Arc;

use coordination::{ApprovalItem, ApprovalQueue, MaoError, MaoResult, StateManager};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::tmux::TmuxManager;
use crate::worktree::WorktreeManager;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Approve {
        id: String,
        feedback: Option<String>,
    },
    Reject {
        id: String,
        feedback: String,
    },
    Diff {
        id: String,
    },
}

/// Parse a chat line starting with `/` into a command.
///
/// Returns `Ok(None)` for lines that are not commands; unknown or
/// malformed commands are validation errors carrying a usage hint.
pub fn parse_command(line: &str) -> MaoResult<Option<OperatorCommand>> {
    let line = line.trim();
    if !line.starts_with('/') {
        return Ok(None);
    }
    // Split into command, id and free-form remainder, tolerating runs of
    // whitespace between them.
    let mut head = line.splitn(2, char::is_whitespace);
    let command = head.next().unwrap_or_default().to_lowercase();
    let after_command = head.next().map(str::trim_start).unwrap_or_default();
    let mut tail = after_command.splitn(2, char::is_whitespace);
    let id = tail
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let rest = tail
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    match command.as_str() {
        "/approve" => {
            let id = id.ok_or_else(|| {
                MaoError::validation("usage: /approve <approval_id> [feedback]")
            })?;
            Ok(Some(OperatorCommand::Approve { id, feedback: rest }))
        }
        "/reject" => {
            let id = id
                .ok_or_else(|| MaoError::validation("usage: /reject <approval_id> <feedback>"))?;
            let feedback = rest.filter(|f| !f.is_empty()).ok_or_else(|| {
                MaoError::validation("usage: /reject <approval_id> <feedback>")
            })?;
            Ok(Some(OperatorCommand::Reject { id, feedback }))
        }
        "/diff" => {
            let id =
                id.ok_or_else(|| MaoError::validation("usage: /diff <approval_id>"))?;
            Ok(Some(OperatorCommand::Diff { id }))
        }
        other => Err(MaoError::validation(format!(
            "unknown command '{other}' (available: /approve, /reject, /diff)"
        ))),
    }
}

/// What the gate decided, handed to the pipeline by the orchestrator.
#[derive(Debug, Clone)]
pub enum GateDecision {
    Approved { item: ApprovalItem },
    RejectedWithFeedback { item: ApprovalItem, feedback: String },
}

impl GateDecision {
    pub fn item(&self) -> &ApprovalItem {
        match self {
            Self::Approved { item } => item,
            Self::RejectedWithFeedback { item, .. } => item,
        }
    }
}

/// The approval gate.
pub struct ApprovalGate {
    approvals: Arc<Mutex<ApprovalQueue>>,
    state: Arc<StateManager>,
    worktrees: Arc<WorktreeManager>,
    tmux: Arc<TmuxManager>,
    events: Arc<EventBus>,
}

impl ApprovalGate {
    pub fn new(
        approvals: Arc<Mutex<ApprovalQueue>>,
        state: Arc<StateManager>,
        worktrees: Arc<WorktreeManager>,
        tmux: Arc<TmuxManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            approvals,
            state,
            worktrees,
            tmux,
            events,
        }
    }

    /// Approve an item: record the decision, clean up, emit the decision.
    pub async fn approve(&self, id: &str, feedback: Option<&str>) -> MaoResult<GateDecision> {
        let item = {
            let mut approvals = self.approvals.lock().await;
            approvals.approve(id, feedback)?
        };
        self.cleanup(&item).await;
        self.events.publish(OrchestratorEvent::ApprovalResolved {
            approval_id: item.id.clone(),
            agent_id: item.agent_id.clone(),
            approved: true,
        });
        info!(id = %item.id, agent_id = %item.agent_id, "approved");
        Ok(GateDecision::Approved { item })
    }

    /// Reject an item with feedback: record, clean up, emit.
    pub async fn reject(&self, id: &str, feedback: &str) -> MaoResult<GateDecision> {
        let item = {
            let mut approvals = self.approvals.lock().await;
            approvals.reject(id, feedback)?
        };
        self.cleanup(&item).await;
        self.events.publish(OrchestratorEvent::ApprovalResolved {
            approval_id: item.id.clone(),
            agent_id: item.agent_id.clone(),
            approved: false,
        });
        info!(id = %item.id, agent_id = %item.agent_id, "rejected");
        Ok(GateDecision::RejectedWithFeedback {
            item,
            feedback: feedback.to_string(),
        })
    }

    /// Side-effect-free diff of the item's worktree for operator review.
    pub async fn diff(&self, id: &str) -> MaoResult<String> {
        let item = {
            let approvals = self.approvals.lock().await;
            approvals.get_item(id)?.clone()
        };
        let Some(worktree) = &item.worktree else {
            return Err(MaoError::validation(format!(
                "approval {} has no worktree to diff",
                item.id
            )));
        };
        self.worktrees.diff(worktree).await
    }

    /// Ordered cleanup after a decision: state record first, then the
    /// worktree, then the index entry, then the pane. Failing steps are
    /// logged and later steps still run; after this the agent_id is gone
    /// from every public accessor.
    async fn cleanup(&self, item: &ApprovalItem) {
        self.state.clear_state(&item.agent_id).await;

        if let Some(worktree) = &item.worktree {
            if worktree.exists() {
                if let Err(e) = self.worktrees.remove_worktree(worktree).await {
                    warn!(
                        agent_id = %item.agent_id,
                        worktree = %worktree.display(),
                        error = %e,
                        "worktree removal failed during cleanup"
                    );
                }
            }
        }

        {
            let mut approvals = self.approvals.lock().await;
            if let Err(e) = approvals.delete_item(&item.id) {
                warn!(id = %item.id, error = %e, "approval index delete failed during cleanup");
            }
        }

        self.tmux.release_slot(&item.agent_id);
    }
}
