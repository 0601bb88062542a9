//! In-memory agent state registry.
//!
//! Tracks what every agent (including the CTO) is doing right now. The
//! registry is the source the periodic reconcile reads for the observable
//! state surface; durable entities (queues, approvals, sessions) have their
//! own file-backed stores.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::PricingConfig;

/// What an agent is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Idle,
    Active,
    Thinking,
    Waiting,
    Error,
    Completed,
}

/// One agent's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub role: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Aggregate counters across all tracked agents.
#[derive(Debug, Clone, Serialize)]
pub struct StateStats {
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Registry of live agent states behind an async mutex.
#[derive(Default)]
pub struct StateManager {
    states: Mutex<HashMap<String, AgentState>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the state for `agent_id`.
    pub async fn update_state(&self, mut state: AgentState) {
        state.last_updated = crate::iso_utc_timestamp();
        let mut states = self.states.lock().await;
        states.insert(state.agent_id.clone(), state);
    }

    /// Convenience update for the common status-only transition.
    pub async fn set_status(&self, agent_id: &str, role: &str, status: AgentStatus, task: &str) {
        self.update_state(AgentState {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            status,
            current_task: task.to_string(),
            tokens_used: 0,
            cost: 0.0,
            last_updated: String::new(),
            error_message: None,
        })
        .await;
    }

    pub async fn get_state(&self, agent_id: &str) -> Option<AgentState> {
        self.states.lock().await.get(agent_id).cloned()
    }

    pub async fn get_all_states(&self) -> Vec<AgentState> {
        let mut states: Vec<AgentState> =
            self.states.lock().await.values().cloned().collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        states
    }

    /// Remove an agent's record. Idempotent.
    pub async fn clear_state(&self, agent_id: &str) {
        self.states.lock().await.remove(agent_id);
    }

    pub async fn clear_all_states(&self) {
        self.states.lock().await.clear();
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.states.lock().await.contains_key(agent_id)
    }

    /// Aggregate stats for the observable state surface.
    pub async fn get_stats(&self) -> StateStats {
        let states = self.states.lock().await;
        let active_agents = states
            .values()
            .filter(|s| matches!(s.status, AgentStatus::Active | AgentStatus::Thinking))
            .count();
        StateStats {
            total_agents: states.len(),
            active_agents,
            total_tokens: states.values().map(|s| s.tokens_used).sum(),
            total_cost: states.values().map(|s| s.cost).sum(),
        }
    }

    /// Record token usage for an agent, pricing it with `pricing`.
    pub async fn record_usage(
        &self,
        agent_id: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        pricing: &PricingConfig,
    ) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(agent_id) {
            state.tokens_used += input_tokens + output_tokens;
            state.cost += pricing.estimate_cost(model, input_tokens, output_tokens);
            state.last_updated = crate::iso_utc_timestamp();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_and_get() {
        let manager = StateManager::new();
        manager
            .set_status("agent-1", "coder_backend", AgentStatus::Thinking, "fix bug")
            .await;

        let state = manager.get_state("agent-1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Thinking);
        assert_eq!(state.role, "coder_backend");
        assert!(!state.last_updated.is_empty());
    }

    #[tokio::test]
    async fn test_clear_state_is_idempotent() {
        let manager = StateManager::new();
        manager
            .set_status("agent-1", "tester", AgentStatus::Active, "")
            .await;
        manager.clear_state("agent-1").await;
        manager.clear_state("agent-1").await;
        assert!(!manager.contains("agent-1").await);
    }

    #[tokio::test]
    async fn test_stats() {
        let manager = StateManager::new();
        manager
            .set_status("cto", "cto", AgentStatus::Idle, "")
            .await;
        manager
            .set_status("agent-1", "coder_backend", AgentStatus::Active, "task")
            .await;
        manager
            .set_status("agent-2", "tester", AgentStatus::Thinking, "task")
            .await;

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_agents, 3);
        assert_eq!(stats.active_agents, 2);
    }

    #[tokio::test]
    async fn test_record_usage() {
        let manager = StateManager::new();
        let pricing = PricingConfig::default();
        manager
            .set_status("agent-1", "coder_backend", AgentStatus::Active, "task")
            .await;
        manager
            .record_usage("agent-1", "sonnet", 1_000_000, 0, &pricing)
            .await;

        let state = manager.get_state("agent-1").await.unwrap();
        assert_eq!(state.tokens_used, 1_000_000);
        assert!((state.cost - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_status_serialization_is_uppercase() {
        let json = serde_json::to_string(&AgentStatus::Thinking).unwrap();
        assert_eq!(json, "\"THINKING\"");
    }
}
