//! MAO: hierarchical multi-agent orchestrator.
//!
//! The operator talks to a CTO agent (an interactive `claude` process in a
//! tmux pane). The CTO decomposes the request into sub-tasks via
//! `[MAO_AGENT_SPAWN]` directives; each sub-task runs as its own `claude`
//! process in its own pane and, in feedback mode, its own git worktree.
//! Agents report completion with `[MAO_TASK_COMPLETE]` markers; completions
//! queue for the operator, who approves, rejects with feedback, or inspects
//! the diff. Approved work advances the sequential pipeline; rejected work
//! is retried with the feedback injected into the prompt.
//!
//! Layering, leaves first:
//!
//! - [`exec`]: subprocess invocation with hard timeouts
//! - [`tmux`]: multiplexer driver (panes, key sends, pane-tee logging)
//! - [`worktree`]: per-agent git worktrees, commit/push/PR
//! - [`parser`]: pure extraction of the marker grammars
//! - [`roles`] / [`prompts`]: role catalogue and prompt construction
//! - [`supervisor`]: one agent's lifecycle, spawn to approval item
//! - [`pipeline`]: sequential sub-task queue with retry semantics
//! - [`gate`]: the human approval state machine
//! - [`orchestrator`]: assembles everything and runs the event loop
//!
//! Durable state lives in the [`coordination`] crate.

pub mod cli;
pub mod events;
pub mod exec;
pub mod gate;
pub mod notify;
pub mod orchestrator;
pub mod parser;
pub mod pipeline;
pub mod prompts;
pub mod roles;
pub mod supervisor;
pub mod telemetry;
pub mod tmux;
pub mod worktree;
