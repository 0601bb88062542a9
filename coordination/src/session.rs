//! Chat session persistence.
//!
//! One directory per session under `.mao/sessions/<session-id>/` holding
//! `chat.json` (the ordered message list) and `metadata.json`. Append
//! rewrites both files atomically; `message_count` in the metadata always
//! equals the length of `chat.json`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MaoError, MaoResult};
use crate::store;

/// A single message in the operator ↔ CTO conversation.
///
/// `role` is one of `user`, `cto`, `system`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Session metadata cached beside the chat log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default)]
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: usize,
}

/// Exported session document: metadata plus the full message list.
#[derive(Debug, Serialize, Deserialize)]
struct SessionExport {
    metadata: SessionMetadata,
    messages: Vec<ChatMessage>,
}

/// Manages one chat session and enumerates its siblings.
pub struct SessionManager {
    sessions_dir: PathBuf,
    session_dir: PathBuf,
    chat_file: PathBuf,
    metadata_file: PathBuf,
    pub session_id: String,
    messages: Vec<ChatMessage>,
    metadata: SessionMetadata,
}

impl SessionManager {
    /// Open a session for `project_path`.
    ///
    /// With `session_id` set, that session is loaded (created if absent).
    /// Otherwise the most recently updated session is continued, or a new
    /// one is created when none exists. `title` applies only to sessions
    /// that do not already carry one.
    pub fn open(
        project_path: &Path,
        session_id: Option<&str>,
        title: Option<&str>,
    ) -> MaoResult<Self> {
        let sessions_dir = crate::mao_dir(project_path).join("sessions");
        fs::create_dir_all(&sessions_dir)?;

        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => match Self::latest_session_id(project_path)? {
                Some(latest) => latest,
                None => Self::generate_session_id(),
            },
        };

        let session_dir = sessions_dir.join(&session_id);
        fs::create_dir_all(&session_dir)?;

        let chat_file = session_dir.join("chat.json");
        let metadata_file = session_dir.join("metadata.json");

        let now = crate::iso_utc_timestamp();
        let mut manager = Self {
            sessions_dir,
            session_dir,
            chat_file,
            metadata_file,
            session_id: session_id.clone(),
            messages: Vec::new(),
            metadata: SessionMetadata {
                session_id,
                title: String::new(),
                created_at: now.clone(),
                updated_at: now,
                message_count: 0,
            },
        };
        manager.load()?;

        if let Some(title) = title {
            if manager.metadata.title.is_empty() && !title.is_empty() {
                manager.metadata.title = title.to_string();
                manager.save()?;
            }
        }

        Ok(manager)
    }

    /// Force a brand-new session regardless of existing ones.
    pub fn create_new(project_path: &Path, title: Option<&str>) -> MaoResult<Self> {
        let id = Self::generate_session_id();
        Self::open(project_path, Some(&id), title)
    }

    fn generate_session_id() -> String {
        format!("{}_{}", crate::compact_utc_timestamp(), crate::short_id())
    }

    fn load(&mut self) -> MaoResult<()> {
        if let Some(messages) = store::read_json::<Vec<ChatMessage>>(&self.chat_file)? {
            info!(
                session_id = %self.session_id,
                count = messages.len(),
                "loaded session history"
            );
            self.messages = messages;
        }
        if let Some(metadata) = store::read_json::<SessionMetadata>(&self.metadata_file)? {
            self.metadata = metadata;
        }
        Ok(())
    }

    fn save(&mut self) -> MaoResult<()> {
        store::write_json(&self.chat_file, &self.messages)?;
        self.metadata.updated_at = crate::iso_utc_timestamp();
        self.metadata.message_count = self.messages.len();
        store::write_json(&self.metadata_file, &self.metadata)
    }

    /// Append a message and persist the session.
    pub fn add_message(
        &mut self,
        role: &str,
        content: &str,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> MaoResult<ChatMessage> {
        let message = ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: crate::iso_utc_timestamp(),
            metadata: metadata.unwrap_or_default(),
        };
        self.messages.push(message.clone());
        self.save()?;
        Ok(message)
    }

    /// Messages, optionally filtered by role and limited to the newest N.
    pub fn get_messages(&self, role: Option<&str>, limit: Option<usize>) -> Vec<ChatMessage> {
        let filtered: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|m| role.map_or(true, |r| m.role == r))
            .cloned()
            .collect();
        match limit {
            Some(n) if n < filtered.len() => filtered[filtered.len() - n..].to_vec(),
            _ => filtered,
        }
    }

    /// Case-insensitive substring search over message content.
    pub fn search_messages(&self, query: &str) -> Vec<ChatMessage> {
        let needle = query.to_lowercase();
        self.messages
            .iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Drop all messages but keep the session.
    pub fn clear_messages(&mut self) -> MaoResult<()> {
        self.messages.clear();
        self.save()?;
        info!(session_id = %self.session_id, "cleared session messages");
        Ok(())
    }

    /// Delete the session directory entirely.
    pub fn delete_session(self) -> MaoResult<()> {
        fs::remove_dir_all(&self.session_dir)?;
        info!(session_id = %self.session_id, "deleted session");
        Ok(())
    }

    pub fn set_title(&mut self, title: &str) -> MaoResult<()> {
        self.metadata.title = title.to_string();
        self.save()
    }

    pub fn title(&self) -> &str {
        &self.metadata.title
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Per-role message counts and timestamps for this session.
    pub fn get_session_stats(&self) -> SessionStats {
        let count_role =
            |role: &str| self.messages.iter().filter(|m| m.role == role).count();
        SessionStats {
            session_id: self.session_id.clone(),
            title: self.metadata.title.clone(),
            total_messages: self.messages.len(),
            user_messages: count_role("user"),
            cto_messages: count_role("cto"),
            system_messages: count_role("system"),
            created_at: self.metadata.created_at.clone(),
            updated_at: self.metadata.updated_at.clone(),
        }
    }

    /// Export the session as a single JSON document.
    pub fn export_session(&self, output: &Path) -> MaoResult<()> {
        let export = SessionExport {
            metadata: self.metadata.clone(),
            messages: self.messages.clone(),
        };
        store::write_json(output, &export)?;
        info!(session_id = %self.session_id, path = %output.display(), "exported session");
        Ok(())
    }

    /// Replace this session's contents from an exported document.
    pub fn import_session(&mut self, input: &Path) -> MaoResult<()> {
        let export: SessionExport = store::read_json(input)?
            .ok_or_else(|| MaoError::file_not_found(input))?;
        self.metadata = export.metadata;
        self.metadata.session_id = self.session_id.clone();
        self.messages = export.messages;
        self.save()
    }

    /// Metadata of every session under the project, newest first.
    pub fn get_all_sessions(project_path: &Path) -> MaoResult<Vec<SessionMetadata>> {
        let sessions_dir = crate::mao_dir(project_path).join("sessions");
        let mut sessions = Vec::new();
        let entries = match fs::read_dir(&sessions_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.path().is_dir() {
                continue;
            }
            let metadata_file = entry.path().join("metadata.json");
            match store::read_json::<SessionMetadata>(&metadata_file) {
                Ok(Some(metadata)) => sessions.push(metadata),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %metadata_file.display(), error = %e, "skipping unreadable session");
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Id of the most recently updated session, if any.
    pub fn latest_session_id(project_path: &Path) -> MaoResult<Option<String>> {
        Ok(Self::get_all_sessions(project_path)?
            .into_iter()
            .next()
            .map(|m| m.session_id))
    }

    /// Find a session by full id or unique trailing fragment.
    pub fn resolve_session_id(project_path: &Path, fragment: &str) -> MaoResult<String> {
        let sessions = Self::get_all_sessions(project_path)?;
        if sessions.iter().any(|s| s.session_id == fragment) {
            return Ok(fragment.to_string());
        }
        let matches: Vec<&SessionMetadata> = sessions
            .iter()
            .filter(|s| s.session_id.ends_with(fragment))
            .collect();
        match matches.as_slice() {
            [only] => Ok(only.session_id.clone()),
            [] => Err(MaoError::validation(format!(
                "no session matches '{fragment}'"
            ))),
            _ => Err(MaoError::validation(format!(
                "session fragment '{fragment}' is ambiguous"
            ))),
        }
    }

    /// The directory holding all sessions (used by the CLI listing).
    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }
}

/// Aggregate counters for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub title: String,
    pub total_messages: usize,
    pub user_messages: usize,
    pub cto_messages: usize,
    pub system_messages: usize,
    pub created_at: String,
    pub updated_at: String,
}
