//! Tracing setup.
//!
//! CLI subcommands log to stderr; the orchestrator additionally appends to
//! the project log file so pane output and UI rendering stay readable.
//! Filter via `MAO_LOG` (falls back to the configured level).

use std::path::Path;

use coordination::MaoResult;
use tracing_subscriber::EnvFilter;

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env("MAO_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

/// Stderr-only logging for short-lived CLI commands.
pub fn init_cli(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// File logging for the long-running orchestrator.
pub fn init_orchestrator(log_file: &Path, default_level: &str) -> MaoResult<()> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::sync::Arc::new(file))
        .with_ansi(false)
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(".mao").join("orchestrator.log");
        init_orchestrator(&log, "info").unwrap();
        assert!(log.exists());
    }

    #[test]
    fn test_double_init_is_harmless() {
        init_cli("info");
        init_cli("debug");
    }
}
