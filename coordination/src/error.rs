//! Error kinds for the orchestrator.
//!
//! One variant per failure kind the system distinguishes; every error
//! carries a short human line (the `Display` impl) and a machine
//! `error_type` string for structured events.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used across the coordination layer.
pub type MaoResult<T> = Result<T, MaoError>;

/// Errors raised by the coordination layer and the orchestrator core.
#[derive(Error, Debug)]
pub enum MaoError {
    /// Caller error; returned immediately, never retried.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Transport or network failure; retryable at the caller's discretion.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An external command hit its deadline.
    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// A required file is missing.
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Filesystem permission failure.
    #[error("Permission denied: {path}")]
    Permission { path: PathBuf },

    /// A local subprocess invocation failed.
    #[error("Subprocess '{command}' failed: {message}")]
    Subprocess { command: String, message: String },

    /// The LLM child process returned non-zero or refused.
    #[error("LLM error: {message}")]
    Api { message: String },

    /// A required structured block could not be recovered from text.
    #[error("Parse error: {message}")]
    Tool { message: String },

    /// An internal invariant was violated; fatal for the offending agent.
    #[error("Process error: {message}")]
    Process { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl MaoError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub fn subprocess(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subprocess {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    /// Machine-readable error kind for structured events.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::FileNotFound { .. } => "file_not_found",
            Self::Permission { .. } => "permission",
            Self::Subprocess { .. } => "subprocess",
            Self::Api { .. } => "api_error",
            Self::Tool { .. } => "tool_error",
            Self::Process { .. } => "process_error",
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => "file_not_found",
                std::io::ErrorKind::PermissionDenied => "permission",
                _ => "process_error",
            },
            Self::Json(_) | Self::Yaml(_) => "tool_error",
        }
    }

    /// Whether the failure is transient and worth retrying on the next tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(MaoError::validation("bad").error_type(), "validation");
        assert_eq!(MaoError::timeout("git push", 60).error_type(), "timeout");
        assert_eq!(MaoError::api("refused").error_type(), "api_error");
        assert_eq!(MaoError::tool("no block").error_type(), "tool_error");
        assert_eq!(
            MaoError::file_not_found("/tmp/x").error_type(),
            "file_not_found"
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let missing: MaoError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(missing.error_type(), "file_not_found");

        let denied: MaoError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(denied.error_type(), "permission");
    }

    #[test]
    fn test_retryability() {
        assert!(MaoError::connection("reset").is_retryable());
        assert!(MaoError::timeout("capture-pane", 5).is_retryable());
        assert!(!MaoError::validation("empty prompt").is_retryable());
        assert!(!MaoError::process("pane leaked").is_retryable());

        let interrupted: MaoError =
            std::io::Error::new(std::io::ErrorKind::Interrupted, "sig").into();
        assert!(interrupted.is_retryable());
    }

    #[test]
    fn test_display_is_short_human_line() {
        let err = MaoError::subprocess("tmux send-keys", "no such pane");
        let line = err.to_string();
        assert!(line.contains("tmux send-keys"));
        assert!(!line.contains('\n'));
    }
}
