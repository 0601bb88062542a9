//! Desktop notification side channel.
//!
//! Advisory only: a popup when an approval becomes pending. Absence of a
//! notifier or any failure here never changes logical state.

use std::time::Duration;

use tracing::debug;

use crate::exec;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Notify the operator that an agent is waiting for review.
pub async fn approval_pending(agent_id: &str, approval_id: &str) {
    let title = "MAO approval pending";
    let body = format!("{agent_id} finished; review with /approve {approval_id}");
    send(title, &body).await;
}

async fn send(title: &str, body: &str) {
    if cfg!(target_os = "macos") {
        // osascript string literals only need quote/backslash escaping.
        let escaped_body = body.replace('\\', "\\\\").replace('"', "\\\"");
        let escaped_title = title.replace('\\', "\\\\").replace('"', "\\\"");
        let script =
            format!("display notification \"{escaped_body}\" with title \"{escaped_title}\"");
        if let Err(e) = exec::run("osascript", &["-e", &script], None, NOTIFY_TIMEOUT).await {
            debug!(error = %e, "osascript notification failed");
        }
    } else if let Err(e) = exec::run("notify-send", &[title, body], None, NOTIFY_TIMEOUT).await {
        debug!(error = %e, "notify-send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notification_failure_is_silent() {
        // Whatever the host has (or lacks), this must not error or panic.
        approval_pending("agent-1", "abcd1234").await;
    }
}
