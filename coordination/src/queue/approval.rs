//! Approval index: completed agent work awaiting an operator decision.
//!
//! The index at `approval_queue/index.json` is the single durable record;
//! every mutation rewrites it atomically, so lock-free readers are safe.
//! Items are addressed by full id or unique prefix (ids are 8 hex chars).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MaoError, MaoResult};
use crate::store;

/// Review state of one approval item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    InReview,
}

/// One completed agent task awaiting operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalItem {
    pub id: String,
    pub agent_id: String,
    /// Position of the task in the sequential queue.
    pub task_number: usize,
    pub task_description: String,
    pub role: String,
    pub model: String,
    pub status: ApprovalStatus,
    pub created_at: String,
    #[serde(default)]
    pub reviewed_at: Option<String>,
    #[serde(default)]
    pub reviewer_feedback: Option<String>,
    /// Opaque multiplexer pane handle the agent is still attached to.
    #[serde(default)]
    pub pane_id: Option<String>,
    #[serde(default)]
    pub worktree: Option<PathBuf>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Captured agent output (the teed pane log).
    #[serde(default)]
    pub output: Option<String>,
}

/// Index counters by status.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
}

/// Everything the supervisor knows when it files a completion for review.
pub struct NewApprovalItem {
    pub agent_id: String,
    pub task_number: usize,
    pub task_description: String,
    pub role: String,
    pub model: String,
    pub pane_id: Option<String>,
    pub worktree: Option<PathBuf>,
    pub branch: Option<String>,
    pub changed_files: Vec<String>,
    pub output: Option<String>,
}

/// The approval queue, backed by `approval_queue/index.json`.
pub struct ApprovalQueue {
    index_file: PathBuf,
    items: Vec<ApprovalItem>,
}

impl ApprovalQueue {
    pub fn new(project_path: &Path) -> MaoResult<Self> {
        let queue_dir = crate::mao_dir(project_path).join("approval_queue");
        std::fs::create_dir_all(&queue_dir)?;
        let index_file = queue_dir.join("index.json");
        let items = store::read_json::<Vec<ApprovalItem>>(&index_file)?.unwrap_or_default();
        Ok(Self { index_file, items })
    }

    fn save(&self) -> MaoResult<()> {
        store::write_json(&self.index_file, &self.items)
    }

    /// File a new pending item; returns it with its generated id.
    pub fn add_item(&mut self, new: NewApprovalItem) -> MaoResult<ApprovalItem> {
        let item = ApprovalItem {
            id: crate::short_id(),
            agent_id: new.agent_id,
            task_number: new.task_number,
            task_description: new.task_description,
            role: new.role,
            model: new.model,
            status: ApprovalStatus::Pending,
            created_at: crate::iso_utc_timestamp(),
            reviewed_at: None,
            reviewer_feedback: None,
            pane_id: new.pane_id,
            worktree: new.worktree,
            branch: new.branch,
            changed_files: new.changed_files,
            output: new.output,
        };
        self.items.push(item.clone());
        self.save()?;
        info!(id = %item.id, agent_id = %item.agent_id, "approval item added");
        Ok(item)
    }

    /// Resolve an id or unique prefix to an item.
    pub fn get_item(&self, id_or_prefix: &str) -> MaoResult<&ApprovalItem> {
        if id_or_prefix.is_empty() {
            return Err(MaoError::validation("empty approval id"));
        }
        if let Some(exact) = self.items.iter().find(|i| i.id == id_or_prefix) {
            return Ok(exact);
        }
        let matches: Vec<&ApprovalItem> = self
            .items
            .iter()
            .filter(|i| i.id.starts_with(id_or_prefix))
            .collect();
        match matches.as_slice() {
            [only] => Ok(only),
            [] => Err(MaoError::validation(format!(
                "no approval item matches '{id_or_prefix}'"
            ))),
            _ => Err(MaoError::validation(format!(
                "approval id prefix '{id_or_prefix}' is ambiguous"
            ))),
        }
    }

    fn get_item_mut(&mut self, id_or_prefix: &str) -> MaoResult<&mut ApprovalItem> {
        let id = self.get_item(id_or_prefix)?.id.clone();
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| MaoError::process("approval index mutated during lookup"))
    }

    pub fn get_pending_items(&self) -> Vec<&ApprovalItem> {
        self.items
            .iter()
            .filter(|i| i.status == ApprovalStatus::Pending)
            .collect()
    }

    /// Mark an item approved. Unknown id leaves the index unchanged.
    pub fn approve(&mut self, id: &str, feedback: Option<&str>) -> MaoResult<ApprovalItem> {
        let now = crate::iso_utc_timestamp();
        let item = self.get_item_mut(id)?;
        item.status = ApprovalStatus::Approved;
        item.reviewed_at = Some(now);
        item.reviewer_feedback = feedback.map(str::to_string);
        let item = item.clone();
        self.save()?;
        info!(id = %item.id, "approval item approved");
        Ok(item)
    }

    /// Mark an item rejected; feedback is mandatory for rejections.
    pub fn reject(&mut self, id: &str, feedback: &str) -> MaoResult<ApprovalItem> {
        if feedback.trim().is_empty() {
            return Err(MaoError::validation("rejection requires feedback"));
        }
        let now = crate::iso_utc_timestamp();
        let item = self.get_item_mut(id)?;
        item.status = ApprovalStatus::Rejected;
        item.reviewed_at = Some(now);
        item.reviewer_feedback = Some(feedback.to_string());
        let item = item.clone();
        self.save()?;
        info!(id = %item.id, "approval item rejected");
        Ok(item)
    }

    /// Remove an item from the index.
    pub fn delete_item(&mut self, id: &str) -> MaoResult<ApprovalItem> {
        let resolved = self.get_item(id)?.id.clone();
        let position = self
            .items
            .iter()
            .position(|i| i.id == resolved)
            .ok_or_else(|| MaoError::process("approval index mutated during lookup"))?;
        let item = self.items.remove(position);
        self.save()?;
        info!(id = %item.id, "approval item deleted");
        Ok(item)
    }

    /// Drop all approved items; returns how many were removed.
    pub fn clear_approved(&mut self) -> MaoResult<usize> {
        let before = self.items.len();
        self.items.retain(|i| i.status != ApprovalStatus::Approved);
        let removed = before - self.items.len();
        if removed > 0 {
            self.save()?;
            info!(removed, "cleared approved items");
        }
        Ok(removed)
    }

    pub fn get_stats(&self) -> ApprovalStats {
        let count = |status: ApprovalStatus| {
            self.items.iter().filter(|i| i.status == status).count()
        };
        ApprovalStats {
            total: self.items.len(),
            pending: count(ApprovalStatus::Pending),
            approved: count(ApprovalStatus::Approved),
            rejected: count(ApprovalStatus::Rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(agent: &str, task_number: usize) -> NewApprovalItem {
        NewApprovalItem {
            agent_id: agent.to_string(),
            task_number,
            task_description: "add a docstring to foo".to_string(),
            role: "coder_backend".to_string(),
            model: "sonnet".to_string(),
            pane_id: Some("mao:0.1".to_string()),
            worktree: None,
            branch: None,
            changed_files: vec!["src/foo.py".to_string()],
            output: Some("[MAO_TASK_COMPLETE]...".to_string()),
        }
    }

    #[test]
    fn test_add_persists_to_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = ApprovalQueue::new(dir.path()).unwrap();
        let item = queue.add_item(sample("agent-1", 1)).unwrap();
        assert_eq!(item.id.len(), 8);
        assert_eq!(item.status, ApprovalStatus::Pending);

        // A fresh queue over the same directory sees the item.
        let reloaded = ApprovalQueue::new(dir.path()).unwrap();
        assert_eq!(reloaded.get_pending_items().len(), 1);
    }

    #[test]
    fn test_prefix_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = ApprovalQueue::new(dir.path()).unwrap();
        let item = queue.add_item(sample("agent-1", 1)).unwrap();

        let by_prefix = queue.get_item(&item.id[..4]).unwrap();
        assert_eq!(by_prefix.id, item.id);
    }

    #[test]
    fn test_approve_unknown_id_is_error_not_crash() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = ApprovalQueue::new(dir.path()).unwrap();
        queue.add_item(sample("agent-1", 1)).unwrap();

        let err = queue.approve("ffffffff", None).unwrap_err();
        assert_eq!(err.error_type(), "validation");
        // Index unchanged.
        assert_eq!(queue.get_stats().pending, 1);
        assert_eq!(queue.get_stats().approved, 0);
    }

    #[test]
    fn test_approve_and_reject_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = ApprovalQueue::new(dir.path()).unwrap();
        let a = queue.add_item(sample("agent-1", 1)).unwrap();
        let b = queue.add_item(sample("agent-2", 2)).unwrap();

        let approved = queue.approve(&a.id, Some("nice work")).unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert!(approved.reviewed_at.is_some());

        let rejected = queue.reject(&b.id, "missing type annotation").unwrap();
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert_eq!(
            rejected.reviewer_feedback.as_deref(),
            Some("missing type annotation")
        );

        assert!(queue.reject(&a.id, "   ").is_err());
    }

    #[test]
    fn test_delete_and_clear_approved() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = ApprovalQueue::new(dir.path()).unwrap();
        let a = queue.add_item(sample("agent-1", 1)).unwrap();
        let b = queue.add_item(sample("agent-2", 2)).unwrap();

        queue.approve(&a.id, None).unwrap();
        assert_eq!(queue.clear_approved().unwrap(), 1);
        assert_eq!(queue.get_stats().total, 1);

        queue.delete_item(&b.id).unwrap();
        assert_eq!(queue.get_stats().total, 0);
        assert!(queue.get_item(&b.id).is_err());
    }
}
