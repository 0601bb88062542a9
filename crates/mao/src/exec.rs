//! Subprocess invocation with hard timeouts.
//!
//! Every external tool MAO shells out to (tmux, git, gh, claude, osascript)
//! goes through here so no invocation can hang the event loop. Timeouts
//! kill the child and surface as a `timeout` error.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use coordination::{MaoError, MaoResult};
use tokio::process::Command;

/// Timeout for short control operations (tmux, status checks).
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for local git operations.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for network pushes and PR creation.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for a single-shot LLM invocation.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(600);

fn describe(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

/// Run a command to completion, enforcing `timeout`.
pub async fn run(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> MaoResult<Output> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let child = command.output();
    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(MaoError::subprocess(
            describe(program, args),
            format!("{program} not found on PATH"),
        )),
        Ok(Err(e)) => Err(MaoError::Io(e)),
        Err(_) => Err(MaoError::timeout(
            describe(program, args),
            timeout.as_secs(),
        )),
    }
}

/// Run a command and require exit status zero; returns trimmed stdout.
pub async fn run_checked(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> MaoResult<String> {
    let output = run(program, args, cwd, timeout).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MaoError::subprocess(
            describe(program, args),
            stderr.trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether `program` resolves on PATH.
pub async fn is_available(program: &str, probe_arg: &str) -> bool {
    run(program, &[probe_arg], None, SHORT_TIMEOUT)
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_checked_captures_stdout() {
        let out = run_checked("echo", &["hello"], None, SHORT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_subprocess_error() {
        let err = run_checked("false", &[], None, SHORT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "subprocess");
    }

    #[tokio::test]
    async fn test_missing_binary_is_subprocess_error() {
        let err = run_checked("mao-definitely-not-a-binary", &[], None, SHORT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "subprocess");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let err = run_checked("sleep", &["5"], None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "timeout");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cwd_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_checked("pwd", &[], Some(dir.path()), SHORT_TIMEOUT)
            .await
            .unwrap();
        // Canonicalise both sides: macOS tempdirs go through /private.
        let left = std::fs::canonicalize(&out).unwrap();
        let right = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(left, right);
    }
}
