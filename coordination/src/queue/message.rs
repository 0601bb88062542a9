//! YAML message queue for agent ↔ CTO communication.
//!
//! One file per message under `queue/messages/`; acknowledged messages are
//! renamed (not copied) into `queue/processed/`. Delivery is at-least-once:
//! a crash between running the handlers and the rename replays the message
//! on the next poll, so handlers must be idempotent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::MaoResult;
use crate::store;

/// Kinds of inter-agent messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    Question,
    Response,
    ReassignRequest,
}

/// Delivery priority. Higher priorities are always seen first when both
/// are pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl MessagePriority {
    /// Sort rank: lower sorts first.
    fn rank(self) -> u8 {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub message_type: MessageType,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    #[serde(default)]
    pub priority: MessagePriority,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Filter for [`MessageQueue::get_messages`].
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub receiver: Option<String>,
    pub message_type: Option<MessageType>,
    pub priority: Option<MessagePriority>,
}

impl MessageFilter {
    pub fn for_receiver(receiver: &str) -> Self {
        Self {
            receiver: Some(receiver.to_string()),
            ..Self::default()
        }
    }

    fn matches(&self, message: &Message) -> bool {
        if let Some(receiver) = &self.receiver {
            if &message.receiver != receiver {
                return false;
            }
        }
        if let Some(message_type) = self.message_type {
            if message.message_type != message_type {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if message.priority != priority {
                return false;
            }
        }
        true
    }
}

type Handler = Box<dyn Fn(&Message) + Send + Sync>;

/// Queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MessageStats {
    pub unprocessed: usize,
    pub processed: usize,
    pub total: usize,
}

/// File-backed priority message queue with typed handlers.
pub struct MessageQueue {
    messages_dir: PathBuf,
    processed_dir: PathBuf,
    counter: AtomicU64,
    handlers: Mutex<HashMap<MessageType, Vec<Handler>>>,
}

impl MessageQueue {
    pub fn new(project_path: &Path) -> MaoResult<Self> {
        let queue_dir = crate::mao_dir(project_path).join("queue");
        let messages_dir = queue_dir.join("messages");
        let processed_dir = queue_dir.join("processed");
        fs::create_dir_all(&messages_dir)?;
        fs::create_dir_all(&processed_dir)?;
        Ok(Self {
            messages_dir,
            processed_dir,
            counter: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Time-ordered message id: compact timestamp plus a per-process
    /// counter, so ids sort in send order even within one second.
    fn next_message_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
        format!("msg-{ts}-{n:04}")
    }

    /// Write a message to the queue; returns its id.
    pub fn send_message(
        &self,
        message_type: MessageType,
        sender: &str,
        receiver: &str,
        content: &str,
        priority: MessagePriority,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> MaoResult<String> {
        let message_id = self.next_message_id();
        let message = Message {
            message_id: message_id.clone(),
            message_type,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content: content.to_string(),
            priority,
            timestamp: crate::iso_utc_timestamp(),
            metadata: metadata.unwrap_or_default(),
        };
        let path = self.messages_dir.join(format!("{message_id}.yaml"));
        store::write_yaml(&path, &message)?;
        info!(%message_id, sender, receiver, "message sent");
        Ok(message_id)
    }

    /// Pending messages matching `filter`, ordered by priority descending
    /// then timestamp ascending.
    pub fn get_messages(&self, filter: &MessageFilter) -> MaoResult<Vec<Message>> {
        let mut messages = Vec::new();
        for entry in fs::read_dir(&self.messages_dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|x| x.to_str()) != Some("yaml") {
                continue;
            }
            match store::read_yaml::<Message>(&path) {
                Ok(Some(message)) => {
                    if filter.matches(&message) {
                        messages.push(message);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to load message");
                }
            }
        }
        messages.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(messages)
    }

    /// Acknowledge a message: rename it into `processed/`.
    pub fn mark_as_processed(&self, message_id: &str) -> MaoResult<bool> {
        let from = self.messages_dir.join(format!("{message_id}.yaml"));
        if !from.exists() {
            return Ok(false);
        }
        let to = self.processed_dir.join(format!("{message_id}.yaml"));
        fs::rename(&from, &to)?;
        Ok(true)
    }

    /// Delete a message from either directory.
    pub fn delete_message(&self, message_id: &str) -> MaoResult<bool> {
        for dir in [&self.messages_dir, &self.processed_dir] {
            let path = dir.join(format!("{message_id}.yaml"));
            if path.exists() {
                fs::remove_file(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drain both directories.
    pub fn clear_all(&self) -> MaoResult<()> {
        for dir in [&self.messages_dir, &self.processed_dir] {
            for entry in fs::read_dir(dir)?.filter_map(|e| e.ok()) {
                if entry.path().extension().and_then(|x| x.to_str()) == Some("yaml") {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        info!("all messages cleared");
        Ok(())
    }

    /// Register a handler for one message type. Handlers must be
    /// idempotent (at-least-once delivery).
    pub fn register_handler<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(message_type)
            .or_default()
            .push(Box::new(handler));
    }

    /// Run handlers for every pending message addressed to `receiver`,
    /// then move each into `processed/`. Returns the number handled.
    pub fn process_messages(&self, receiver: &str) -> MaoResult<usize> {
        let messages = self.get_messages(&MessageFilter::for_receiver(receiver))?;
        let mut processed = 0;
        for message in &messages {
            {
                let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(list) = handlers.get(&message.message_type) {
                    for handler in list {
                        handler(message);
                    }
                }
            }
            if let Err(e) = self.mark_as_processed(&message.message_id) {
                warn!(message_id = %message.message_id, error = %e, "failed to acknowledge message");
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Poll loop for a receiver; honours cancellation within one interval.
    pub async fn start_polling(
        &self,
        receiver: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        info!(receiver, interval_ms = interval.as_millis() as u64, "message polling started");
        loop {
            if let Err(e) = self.process_messages(receiver) {
                if e.is_retryable() {
                    warn!(receiver, error = %e, "message poll failed, retrying next tick");
                } else {
                    error!(receiver, error = %e, "message poll failed");
                }
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(receiver, "message polling stopped");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    pub fn get_stats(&self) -> MessageStats {
        let count = |dir: &Path| {
            fs::read_dir(dir)
                .into_iter()
                .flatten()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("yaml"))
                .count()
        };
        let unprocessed = count(&self.messages_dir);
        let processed = count(&self.processed_dir);
        MessageStats {
            unprocessed,
            processed,
            total: unprocessed + processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_send_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();

        queue
            .send_message(
                MessageType::TaskStarted,
                "agent-1",
                "cto",
                "starting work",
                MessagePriority::Medium,
                None,
            )
            .unwrap();

        let messages = queue
            .get_messages(&MessageFilter::for_receiver("cto"))
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "agent-1");
        assert_eq!(messages[0].message_type, MessageType::TaskStarted);
    }

    #[test]
    fn test_priority_before_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();

        // Low priority sent first, urgent second: urgent must come back first.
        queue
            .send_message(
                MessageType::TaskProgress,
                "agent-1",
                "cto",
                "low first",
                MessagePriority::Low,
                None,
            )
            .unwrap();
        queue
            .send_message(
                MessageType::TaskFailed,
                "agent-2",
                "cto",
                "urgent second",
                MessagePriority::Urgent,
                None,
            )
            .unwrap();

        let messages = queue
            .get_messages(&MessageFilter::for_receiver("cto"))
            .unwrap();
        assert_eq!(messages[0].content, "urgent second");
        assert_eq!(messages[1].content, "low first");
    }

    #[test]
    fn test_same_priority_orders_by_send_time() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        for i in 0..3 {
            queue
                .send_message(
                    MessageType::TaskProgress,
                    "agent-1",
                    "cto",
                    &format!("update {i}"),
                    MessagePriority::Medium,
                    None,
                )
                .unwrap();
        }
        let messages = queue
            .get_messages(&MessageFilter::for_receiver("cto"))
            .unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["update 0", "update 1", "update 2"]);
    }

    #[test]
    fn test_mark_processed_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        let id = queue
            .send_message(
                MessageType::Question,
                "agent-1",
                "cto",
                "may I?",
                MessagePriority::High,
                None,
            )
            .unwrap();

        assert!(queue.mark_as_processed(&id).unwrap());
        assert!(!queue.mark_as_processed(&id).unwrap());

        let stats = queue.get_stats();
        assert_eq!(stats.unprocessed, 0);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.total, 1);
    }

    #[test]
    fn test_handlers_run_then_ack() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        queue.register_handler(MessageType::TaskCompleted, move |_m| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        queue
            .send_message(
                MessageType::TaskCompleted,
                "agent-1",
                "cto",
                "done",
                MessagePriority::Medium,
                None,
            )
            .unwrap();
        // Message of another type has no handler but is still acknowledged.
        queue
            .send_message(
                MessageType::TaskProgress,
                "agent-1",
                "cto",
                "halfway",
                MessagePriority::Medium,
                None,
            )
            .unwrap();

        let handled = queue.process_messages("cto").unwrap();
        assert_eq!(handled, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get_stats().unprocessed, 0);
    }

    #[test]
    fn test_receiver_filter() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        queue
            .send_message(
                MessageType::Response,
                "cto",
                "agent-1",
                "for one",
                MessagePriority::Medium,
                None,
            )
            .unwrap();
        queue
            .send_message(
                MessageType::Response,
                "cto",
                "agent-2",
                "for two",
                MessagePriority::Medium,
                None,
            )
            .unwrap();

        let messages = queue
            .get_messages(&MessageFilter::for_receiver("agent-1"))
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "for one");
    }

    #[tokio::test]
    async fn test_polling_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MessageQueue::new(dir.path()).unwrap());
        let cancel = CancellationToken::new();

        let poller = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                queue
                    .start_polling("cto", Duration::from_millis(20), cancel)
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(200), poller)
            .await
            .expect("poller must stop within one interval")
            .unwrap();
    }
}
