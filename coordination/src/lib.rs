//! File-backed coordination layer for the MAO orchestrator.
//!
//! Everything durable in MAO lives under a project-local `.mao/` directory
//! and is written with the atomic replace discipline in [`store`]:
//!
//! - [`queue::task`]: one YAML file per agent role; unlink is the claim
//! - [`queue::message`]: priority message queue, moved on acknowledge
//! - [`queue::approval`]: JSON index of completions awaiting review
//! - [`session`]: append-only chat log per orchestrator session
//! - [`feedback`] / [`improvement`]: per-entity JSON plus a rebuildable index
//! - [`state`]: in-memory agent state registry
//! - [`config`]: `.mao/config.yaml` plus the pricing table
//!
//! The orchestrator binary (`mao`) composes these with the tmux driver,
//! worktree manager and approval gate.

pub mod config;
pub mod error;
pub mod feedback;
pub mod improvement;
pub mod queue;
pub mod session;
pub mod state;
pub mod store;

pub use config::{ModelTier, PricingConfig, ProjectConfig};
pub use error::{MaoError, MaoResult};
pub use feedback::{Feedback, FeedbackFilter, FeedbackManager, RepairReport};
pub use improvement::{Improvement, ImprovementManager};
pub use queue::approval::{ApprovalItem, ApprovalQueue, ApprovalStatus, NewApprovalItem};
pub use queue::message::{Message, MessageFilter, MessagePriority, MessageQueue, MessageType};
pub use queue::task::{QueuedTask, TaskQueue, TaskStatus};
pub use session::{ChatMessage, SessionManager, SessionMetadata, SessionStats};
pub use state::{AgentState, AgentStatus, StateManager, StateStats};

use std::path::{Path, PathBuf};

/// Name of the project-local state directory.
pub const MAO_DIR: &str = ".mao";

/// Resolve the `.mao` root for a project.
pub fn mao_dir(project_path: &Path) -> PathBuf {
    project_path.join(MAO_DIR)
}

/// A short random identifier: 8 lowercase hex characters.
///
/// Used for approval item ids and as the random suffix of session,
/// feedback and improvement ids.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Compact UTC timestamp for file-system names: `YYYYmmdd_HHMMSS`.
pub fn compact_utc_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// ISO-8601 UTC timestamp used in persisted entities.
pub fn iso_utc_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_shape() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_compact_timestamp_shape() {
        let ts = compact_utc_timestamp();
        assert_eq!(ts.len(), 15);
        assert_eq!(&ts[8..9], "_");
    }
}
