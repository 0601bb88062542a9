//! Orchestrator event stream.
//!
//! The core exposes observable state plus this broadcast stream; any UI
//! (the bundled terminal loop, a TUI, tests) subscribes and renders.
//! Publishing never fails when nobody listens.

use coordination::ApprovalItem;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the orchestrator core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Streamed CTO output (new bytes from the CTO pane log).
    CtoOutput { chunk: String },
    /// The CTO queued new sub-tasks.
    TasksQueued { count: usize, summaries: Vec<String> },
    /// An agent was spawned into a pane.
    AgentStarted {
        agent_id: String,
        role: String,
        model: String,
        pane_id: String,
    },
    /// An agent finished and awaits operator review.
    ApprovalPending { item: ApprovalItem },
    /// The operator decided; cleanup has run.
    ApprovalResolved {
        approval_id: String,
        agent_id: String,
        approved: bool,
    },
    /// An agent failed (spawn failure, timeout, terminal retry).
    AgentFailed {
        agent_id: String,
        error_type: String,
        message: String,
    },
    /// All queued tasks are done.
    AllTasksCompleted,
    /// A system line worth showing in the chat transcript.
    SystemMessage { message: String },
    /// Periodic reconcile tick: the observable state surface.
    StateUpdated {
        total_agents: usize,
        active_agents: usize,
        total_tokens: u64,
        total_cost: f64,
        task_info: String,
    },
    /// The feedback workflow finished; the orchestrator is shutting down.
    FeedbackCompleted { pr_url: Option<String> },
    /// Shutdown has begun.
    ShuttingDown,
}

/// Broadcast bus for [`OrchestratorEvent`].
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to all subscribers; silently drops when nobody listens.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(OrchestratorEvent::SystemMessage {
            message: "hello".to_string(),
        });

        match receiver.recv().await.unwrap() {
            OrchestratorEvent::SystemMessage { message } => assert_eq!(message, "hello"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(OrchestratorEvent::AllTasksCompleted);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_the_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(OrchestratorEvent::ShuttingDown);
        assert!(matches!(
            a.recv().await.unwrap(),
            OrchestratorEvent::ShuttingDown
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            OrchestratorEvent::ShuttingDown
        ));
    }
}
