//! Improvement persistence: planned changes to an arbitrary target project.
//!
//! Same storage shape as [`crate::feedback`] (per-entity JSON plus a
//! rebuildable index), but scoped to a target project and annotated with
//! the PR URL and branch once the work lands.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MaoError, MaoResult};
use crate::feedback::RepairReport;
use crate::store;

/// One persisted improvement.
///
/// `category` ∈ {feature, bug, refactor, performance, documentation};
/// `status` ∈ {pending, in_progress, completed, cancelled}.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Improvement {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: String,
    /// The project this improvement targets (not necessarily MAO itself).
    pub target_project: String,
    pub created_at: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_status() -> String {
    "pending".to_string()
}

/// Manages the improvement store under `.mao/improvements/`.
pub struct ImprovementManager {
    improvements_dir: PathBuf,
    index_file: PathBuf,
}

impl ImprovementManager {
    pub fn new(project_path: &Path) -> MaoResult<Self> {
        let improvements_dir = crate::mao_dir(project_path).join("improvements");
        fs::create_dir_all(&improvements_dir)?;
        let index_file = improvements_dir.join("index.json");
        Ok(Self {
            improvements_dir,
            index_file,
        })
    }

    fn entity_file(&self, id: &str) -> PathBuf {
        self.improvements_dir.join(format!("{id}.json"))
    }

    fn load_index(&self) -> MaoResult<Vec<Improvement>> {
        Ok(store::read_json(&self.index_file)?.unwrap_or_default())
    }

    fn save_index(&self, improvements: &[Improvement]) -> MaoResult<()> {
        store::write_json(&self.index_file, &improvements)
    }

    /// Persist a new improvement with the entity-then-index discipline.
    pub fn add_improvement(
        &self,
        title: &str,
        description: &str,
        category: &str,
        priority: &str,
        target_project: &str,
    ) -> MaoResult<Improvement> {
        if title.trim().is_empty() {
            return Err(MaoError::validation("improvement title must not be empty"));
        }
        let _lock_improvement = store::named_lock("improvement");
            let _guard = _lock_improvement
            .lock()
            .map_err(|_| MaoError::process("improvement lock poisoned"))?;

        let id = format!(
            "imp_{}_{}",
            crate::compact_utc_timestamp(),
            crate::short_id()
        );
        let improvement = Improvement {
            id: id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            priority: priority.to_string(),
            target_project: target_project.to_string(),
            created_at: crate::iso_utc_timestamp(),
            status: default_status(),
            pr_url: None,
            branch_name: None,
            metadata: HashMap::new(),
        };

        let entity_path = self.entity_file(&id);
        store::write_json(&entity_path, &improvement)?;
        store::append_to_index(&self.index_file, &entity_path, &improvement)?;

        info!(%id, title, "improvement added");
        Ok(improvement)
    }

    /// Fetch by exact id or unique trailing fragment.
    pub fn get_improvement(&self, id_or_suffix: &str) -> MaoResult<Option<Improvement>> {
        if let Some(improvement) =
            store::read_json::<Improvement>(&self.entity_file(id_or_suffix))?
        {
            return Ok(Some(improvement));
        }
        let matches: Vec<Improvement> = self
            .load_index()?
            .into_iter()
            .filter(|i| i.id.ends_with(id_or_suffix))
            .collect();
        match matches.len() {
            1 => Ok(matches.into_iter().next()),
            0 => Ok(None),
            _ => Err(MaoError::validation(format!(
                "improvement fragment '{id_or_suffix}' is ambiguous"
            ))),
        }
    }

    /// All improvements, optionally filtered by status, newest first.
    pub fn list_improvements(&self, status: Option<&str>) -> MaoResult<Vec<Improvement>> {
        let mut improvements: Vec<Improvement> = self
            .load_index()?
            .into_iter()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .collect();
        improvements.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(improvements)
    }

    fn write_both(&self, improvement: &Improvement) -> MaoResult<()> {
        store::write_json(&self.entity_file(&improvement.id), improvement)?;
        let mut index = self.load_index()?;
        let mut found = false;
        for entry in index.iter_mut() {
            if entry.id == improvement.id {
                *entry = improvement.clone();
                found = true;
            }
        }
        if !found {
            index.push(improvement.clone());
        }
        self.save_index(&index)
    }

    pub fn update_status(&self, id: &str, status: &str) -> MaoResult<Improvement> {
        let _lock_improvement = store::named_lock("improvement");
            let _guard = _lock_improvement
            .lock()
            .map_err(|_| MaoError::process("improvement lock poisoned"))?;

        let mut improvement = self
            .get_improvement(id)?
            .ok_or_else(|| MaoError::validation(format!("improvement not found: {id}")))?;
        improvement.status = status.to_string();
        self.write_both(&improvement)?;
        Ok(improvement)
    }

    /// Annotate a completed improvement with its PR URL and branch.
    pub fn record_pr(&self, id: &str, pr_url: &str, branch_name: &str) -> MaoResult<Improvement> {
        let _lock_improvement = store::named_lock("improvement");
            let _guard = _lock_improvement
            .lock()
            .map_err(|_| MaoError::process("improvement lock poisoned"))?;

        let mut improvement = self
            .get_improvement(id)?
            .ok_or_else(|| MaoError::validation(format!("improvement not found: {id}")))?;
        improvement.pr_url = Some(pr_url.to_string());
        improvement.branch_name = Some(branch_name.to_string());
        improvement.status = "completed".to_string();
        self.write_both(&improvement)?;
        info!(%id, pr_url, "improvement completed");
        Ok(improvement)
    }

    pub fn delete_improvement(&self, id: &str) -> MaoResult<bool> {
        let _lock_improvement = store::named_lock("improvement");
            let _guard = _lock_improvement
            .lock()
            .map_err(|_| MaoError::process("improvement lock poisoned"))?;

        let Some(improvement) = self.get_improvement(id)? else {
            return Ok(false);
        };
        let mut index = self.load_index()?;
        index.retain(|i| i.id != improvement.id);
        self.save_index(&index)?;
        let entity_path = self.entity_file(&improvement.id);
        if entity_path.exists() {
            fs::remove_file(&entity_path)?;
        }
        Ok(true)
    }

    /// Rebuild the index from per-entity files (same contract as the
    /// feedback repair).
    pub fn repair_index(&self) -> MaoResult<RepairReport> {
        let _lock_improvement = store::named_lock("improvement");
            let _guard = _lock_improvement
            .lock()
            .map_err(|_| MaoError::process("improvement lock poisoned"))?;

        let existing = self.load_index()?;
        let existing_ids: std::collections::HashSet<&str> =
            existing.iter().map(|i| i.id.as_str()).collect();

        let mut all = Vec::new();
        let mut missing = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.improvements_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("imp_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        entries.sort();

        for path in entries {
            match store::read_json::<Improvement>(&path) {
                Ok(Some(improvement)) => {
                    if !existing_ids.contains(improvement.id.as_str()) {
                        missing.push(improvement.id.clone());
                    }
                    all.push(improvement);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable improvement file");
                }
            }
        }

        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let repaired = !missing.is_empty();
        if repaired {
            self.save_index(&all)?;
            info!(added = missing.len(), "repaired improvement index");
        }

        Ok(RepairReport {
            total_files: all.len(),
            in_index_before: existing_ids.len(),
            missing_in_index: missing,
            repaired,
        })
    }
}
