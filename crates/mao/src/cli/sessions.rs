//! `mao session`: list, inspect, rename and delete chat sessions.

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;
use coordination::SessionManager;

#[derive(Subcommand)]
pub enum SessionCommand {
    /// List sessions, newest first.
    List,
    /// Show a session's messages. Accepts an id or unique trailing fragment.
    Show {
        id: String,
        /// Only show the newest N messages.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rename a session.
    Rename { id: String, title: String },
    /// Delete a session and its history.
    Delete { id: String },
}

pub fn run(project_dir: &Path, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::List => {
            let sessions = SessionManager::get_all_sessions(project_dir)?;
            if sessions.is_empty() {
                println!("no sessions yet; run 'mao start' to create one");
                return Ok(());
            }
            for meta in sessions {
                let title = if meta.title.is_empty() {
                    "(untitled)"
                } else {
                    meta.title.as_str()
                };
                println!(
                    "{}  {:<30}  {:>4} messages  updated {}",
                    meta.session_id, title, meta.message_count, meta.updated_at
                );
            }
            Ok(())
        }
        SessionCommand::Show { id, limit } => {
            let session_id = SessionManager::resolve_session_id(project_dir, &id)?;
            let session = SessionManager::open(project_dir, Some(&session_id), None)?;
            let stats = session.get_session_stats();
            println!(
                "session {}: {} messages (user {}, cto {}, system {})",
                stats.session_id,
                stats.total_messages,
                stats.user_messages,
                stats.cto_messages,
                stats.system_messages
            );
            for message in session.get_messages(None, limit) {
                println!("[{}] {}: {}", message.timestamp, message.role, message.content);
            }
            Ok(())
        }
        SessionCommand::Rename { id, title } => {
            let session_id = SessionManager::resolve_session_id(project_dir, &id)?;
            let mut session = SessionManager::open(project_dir, Some(&session_id), None)?;
            session.set_title(&title)?;
            println!("renamed {session_id} to '{title}'");
            Ok(())
        }
        SessionCommand::Delete { id } => {
            let session_id = SessionManager::resolve_session_id(project_dir, &id)?;
            let session = SessionManager::open(project_dir, Some(&session_id), None)?;
            session.delete_session()?;
            println!("deleted {session_id}");
            Ok(())
        }
    }
}
