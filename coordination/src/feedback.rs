//! Feedback persistence: suggestions for improving the orchestrator itself.
//!
//! Each feedback is one JSON file (`feedback/<id>.json`) plus an entry in
//! `feedback/index.json`. The per-entity file is written first; if the
//! index write then fails, the entity file is deleted so the two can never
//! disagree. The index is rebuildable from the per-entity files via
//! [`FeedbackManager::repair_index`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MaoError, MaoResult};
use crate::store;

/// One persisted feedback entry.
///
/// `category` ∈ {bug, feature, improvement, documentation};
/// `priority` ∈ {low, medium, high, critical};
/// `status` ∈ {open, in_progress, completed, rejected}.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: String,
    pub agent_id: String,
    pub session_id: String,
    pub created_at: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_status() -> String {
    "open".to_string()
}

/// Filter for [`FeedbackManager::list_feedbacks`].
#[derive(Debug, Clone, Default)]
pub struct FeedbackFilter {
    pub status: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
}

/// Result of an index repair run.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub total_files: usize,
    pub in_index_before: usize,
    pub missing_in_index: Vec<String>,
    pub repaired: bool,
}

/// Counters by status, category and priority.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub rejected: usize,
    pub by_category: HashMap<String, usize>,
    pub by_priority: HashMap<String, usize>,
}

/// Manages the feedback store under `.mao/feedback/`.
pub struct FeedbackManager {
    feedback_dir: PathBuf,
    index_file: PathBuf,
}

impl FeedbackManager {
    pub fn new(project_path: &Path) -> MaoResult<Self> {
        let feedback_dir = crate::mao_dir(project_path).join("feedback");
        fs::create_dir_all(&feedback_dir)?;
        let index_file = feedback_dir.join("index.json");
        Ok(Self {
            feedback_dir,
            index_file,
        })
    }

    fn entity_file(&self, id: &str) -> PathBuf {
        self.feedback_dir.join(format!("{id}.json"))
    }

    fn load_index(&self) -> MaoResult<Vec<Feedback>> {
        Ok(store::read_json(&self.index_file)?.unwrap_or_default())
    }

    fn save_index(&self, feedbacks: &[Feedback]) -> MaoResult<()> {
        store::write_json(&self.index_file, &feedbacks)
    }

    /// Persist a new feedback entry: entity file first, then the index,
    /// rolling the entity back if the index write fails.
    #[allow(clippy::too_many_arguments)]
    pub fn add_feedback(
        &self,
        title: &str,
        description: &str,
        category: &str,
        priority: &str,
        agent_id: &str,
        session_id: &str,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> MaoResult<Feedback> {
        if title.trim().is_empty() {
            return Err(MaoError::validation("feedback title must not be empty"));
        }
        let _lock_feedback = store::named_lock("feedback");
            let _guard = _lock_feedback
            .lock()
            .map_err(|_| MaoError::process("feedback lock poisoned"))?;

        let id = format!("fb_{}_{}", crate::compact_utc_timestamp(), crate::short_id());
        let feedback = Feedback {
            id: id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            priority: priority.to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            created_at: crate::iso_utc_timestamp(),
            status: default_status(),
            metadata: metadata.unwrap_or_default(),
        };

        let entity_path = self.entity_file(&id);
        store::write_json(&entity_path, &feedback)?;
        store::append_to_index(&self.index_file, &entity_path, &feedback)?;

        info!(%id, title, "feedback added");
        Ok(feedback)
    }

    /// Fetch by exact id, or unique trailing fragment (CLI convenience).
    pub fn get_feedback(&self, id_or_suffix: &str) -> MaoResult<Option<Feedback>> {
        if let Some(feedback) = store::read_json::<Feedback>(&self.entity_file(id_or_suffix))? {
            return Ok(Some(feedback));
        }
        let matches: Vec<Feedback> = self
            .load_index()?
            .into_iter()
            .filter(|f| f.id.ends_with(id_or_suffix))
            .collect();
        match matches.len() {
            1 => Ok(matches.into_iter().next()),
            0 => Ok(None),
            _ => Err(MaoError::validation(format!(
                "feedback fragment '{id_or_suffix}' is ambiguous"
            ))),
        }
    }

    /// All feedback entries matching `filter`, newest first.
    pub fn list_feedbacks(&self, filter: &FeedbackFilter) -> MaoResult<Vec<Feedback>> {
        let mut feedbacks: Vec<Feedback> = self
            .load_index()?
            .into_iter()
            .filter(|f| {
                filter.status.as_deref().map_or(true, |s| f.status == s)
                    && filter.category.as_deref().map_or(true, |c| f.category == c)
                    && filter.priority.as_deref().map_or(true, |p| f.priority == p)
            })
            .collect();
        feedbacks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(feedbacks)
    }

    /// Update the status field; entity file first, index second, with the
    /// entity rolled back to its old status if the index write fails.
    pub fn update_status(&self, id: &str, status: &str) -> MaoResult<Feedback> {
        let _lock_feedback = store::named_lock("feedback");
            let _guard = _lock_feedback
            .lock()
            .map_err(|_| MaoError::process("feedback lock poisoned"))?;

        let mut feedback = self
            .get_feedback(id)?
            .ok_or_else(|| MaoError::validation(format!("feedback not found: {id}")))?;
        let old_status = feedback.status.clone();
        feedback.status = status.to_string();

        let entity_path = self.entity_file(&feedback.id);
        store::write_json(&entity_path, &feedback)?;

        let mut index = self.load_index()?;
        for entry in index.iter_mut() {
            if entry.id == feedback.id {
                entry.status = status.to_string();
            }
        }
        if let Err(e) = self.save_index(&index) {
            feedback.status = old_status;
            let _ = store::write_json(&entity_path, &feedback);
            return Err(e);
        }
        Ok(feedback)
    }

    /// Record an update to arbitrary metadata keys (e.g. the PR URL once a
    /// feedback improvement lands).
    pub fn set_metadata(&self, id: &str, key: &str, value: serde_json::Value) -> MaoResult<()> {
        let _lock_feedback = store::named_lock("feedback");
            let _guard = _lock_feedback
            .lock()
            .map_err(|_| MaoError::process("feedback lock poisoned"))?;

        let mut feedback = self
            .get_feedback(id)?
            .ok_or_else(|| MaoError::validation(format!("feedback not found: {id}")))?;
        feedback.metadata.insert(key.to_string(), value);

        store::write_json(&self.entity_file(&feedback.id), &feedback)?;
        let mut index = self.load_index()?;
        for entry in index.iter_mut() {
            if entry.id == feedback.id {
                entry.metadata = feedback.metadata.clone();
            }
        }
        self.save_index(&index)
    }

    pub fn delete_feedback(&self, id: &str) -> MaoResult<bool> {
        let _lock_feedback = store::named_lock("feedback");
            let _guard = _lock_feedback
            .lock()
            .map_err(|_| MaoError::process("feedback lock poisoned"))?;

        let Some(feedback) = self.get_feedback(id)? else {
            return Ok(false);
        };
        let mut index = self.load_index()?;
        index.retain(|f| f.id != feedback.id);
        self.save_index(&index)?;

        let entity_path = self.entity_file(&feedback.id);
        if entity_path.exists() {
            fs::remove_file(&entity_path)?;
        }
        info!(id = %feedback.id, "feedback deleted");
        Ok(true)
    }

    pub fn get_stats(&self) -> MaoResult<FeedbackStats> {
        let feedbacks = self.load_index()?;
        let count = |status: &str| feedbacks.iter().filter(|f| f.status == status).count();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut by_priority: HashMap<String, usize> = HashMap::new();
        for feedback in &feedbacks {
            *by_category.entry(feedback.category.clone()).or_default() += 1;
            *by_priority.entry(feedback.priority.clone()).or_default() += 1;
        }
        Ok(FeedbackStats {
            total: feedbacks.len(),
            open: count("open"),
            in_progress: count("in_progress"),
            completed: count("completed"),
            rejected: count("rejected"),
            by_category,
            by_priority,
        })
    }

    /// Rebuild `index.json` from the per-entity files.
    ///
    /// Entries already present are kept; missing ones are added, and the
    /// rebuilt index is ordered by `created_at`. The report lists exactly
    /// the ids that were missing.
    pub fn repair_index(&self) -> MaoResult<RepairReport> {
        let _lock_feedback = store::named_lock("feedback");
            let _guard = _lock_feedback
            .lock()
            .map_err(|_| MaoError::process("feedback lock poisoned"))?;

        let existing = self.load_index()?;
        let existing_ids: std::collections::HashSet<&str> =
            existing.iter().map(|f| f.id.as_str()).collect();

        let mut all = Vec::new();
        let mut missing = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.feedback_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("fb_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        entries.sort();

        for path in entries {
            match store::read_json::<Feedback>(&path) {
                Ok(Some(feedback)) => {
                    if !existing_ids.contains(feedback.id.as_str()) {
                        missing.push(feedback.id.clone());
                    }
                    all.push(feedback);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable feedback file");
                }
            }
        }

        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let repaired = !missing.is_empty();
        if repaired {
            self.save_index(&all)?;
            info!(added = missing.len(), "repaired feedback index");
        }

        Ok(RepairReport {
            total_files: all.len(),
            in_index_before: existing_ids.len(),
            missing_in_index: missing,
            repaired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(manager: &FeedbackManager, title: &str) -> Feedback {
        manager
            .add_feedback(
                title,
                "details",
                "improvement",
                "medium",
                "cto",
                "session-1",
                None,
            )
            .unwrap()
    }

    #[test]
    fn test_entity_and_index_agree() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let feedback = add(&manager, "Improve retry messages");

        // Both the per-entity file and the index entry exist.
        let from_entity = manager.get_feedback(&feedback.id).unwrap().unwrap();
        assert_eq!(from_entity, feedback);
        let listed = manager.list_feedbacks(&FeedbackFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, feedback.id);
    }

    #[test]
    fn test_empty_title_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let err = manager
            .add_feedback("  ", "d", "bug", "high", "cto", "s", None)
            .unwrap_err();
        assert_eq!(err.error_type(), "validation");
    }

    #[test]
    fn test_suffix_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let feedback = add(&manager, "Suffix me");
        let suffix = &feedback.id[feedback.id.len() - 8..];
        let found = manager.get_feedback(suffix).unwrap().unwrap();
        assert_eq!(found.id, feedback.id);
    }

    #[test]
    fn test_update_status() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let feedback = add(&manager, "Status walk");

        manager.update_status(&feedback.id, "in_progress").unwrap();
        let updated = manager.get_feedback(&feedback.id).unwrap().unwrap();
        assert_eq!(updated.status, "in_progress");

        // Index reflects the same status.
        let listed = manager.list_feedbacks(&FeedbackFilter::default()).unwrap();
        assert_eq!(listed[0].status, "in_progress");
    }

    #[test]
    fn test_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        manager
            .add_feedback("A bug", "d", "bug", "high", "cto", "s", None)
            .unwrap();
        manager
            .add_feedback("A feature", "d", "feature", "low", "cto", "s", None)
            .unwrap();

        let bugs = manager
            .list_feedbacks(&FeedbackFilter {
                category: Some("bug".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].title, "A bug");
    }

    #[test]
    fn test_delete_removes_both() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let feedback = add(&manager, "Doomed");

        assert!(manager.delete_feedback(&feedback.id).unwrap());
        assert!(manager.get_feedback(&feedback.id).unwrap().is_none());
        assert!(manager
            .list_feedbacks(&FeedbackFilter::default())
            .unwrap()
            .is_empty());
        assert!(!manager.delete_feedback(&feedback.id).unwrap());
    }

    #[test]
    fn test_repair_missing_index() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let a = add(&manager, "first");
        let b = add(&manager, "second");

        let index_before: Vec<Feedback> =
            store::read_json(&manager.index_file).unwrap().unwrap();

        // Simulate a lost index.
        fs::remove_file(&manager.index_file).unwrap();
        let report = manager.repair_index().unwrap();
        assert!(report.repaired);
        assert_eq!(report.total_files, 2);
        assert_eq!(report.missing_in_index.len(), 2);

        let index_after: Vec<Feedback> =
            store::read_json(&manager.index_file).unwrap().unwrap();
        let mut before_ids: Vec<&str> =
            index_before.iter().map(|f| f.id.as_str()).collect();
        before_ids.sort();
        let mut after_ids: Vec<&str> = index_after.iter().map(|f| f.id.as_str()).collect();
        after_ids.sort();
        assert_eq!(before_ids, after_ids);
        assert!(after_ids.contains(&a.id.as_str()));
        assert!(after_ids.contains(&b.id.as_str()));
    }

    #[test]
    fn test_repair_adds_exactly_missing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let keep = add(&manager, "kept");
        let lost = add(&manager, "lost from index");

        // Drop one entry from the index while its entity file remains.
        let mut index = manager.load_index().unwrap();
        index.retain(|f| f.id != lost.id);
        manager.save_index(&index).unwrap();

        let report = manager.repair_index().unwrap();
        assert!(report.repaired);
        assert_eq!(report.missing_in_index, vec![lost.id.clone()]);

        let ids: Vec<String> = manager
            .list_feedbacks(&FeedbackFilter::default())
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert!(ids.contains(&keep.id));
        assert!(ids.contains(&lost.id));

        // A second run finds nothing to do.
        let report = manager.repair_index().unwrap();
        assert!(!report.repaired);
        assert!(report.missing_in_index.is_empty());
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FeedbackManager::new(dir.path()).unwrap();
        let a = add(&manager, "one");
        add(&manager, "two");
        manager.update_status(&a.id, "completed").unwrap();

        let stats = manager.get_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.by_category.get("improvement"), Some(&2));
    }
}
