//! File-backed inter-process queues.
//!
//! Three queues with different ownership rules:
//!
//! - [`task`]: one YAML file per agent role under `queue/tasks/`; reading
//!   and unlinking the file is the atomic claim.
//! - [`message`]: one YAML file per message under `queue/messages/`;
//!   acknowledged messages are renamed into `queue/processed/`.
//! - [`approval`]: a JSON index of completions awaiting operator review.

pub mod approval;
pub mod message;
pub mod task;
