//! Per-instance process supervision.
//!
//! One lightweight task per running instance blocks on process exit and
//! publishes a status-change event to the orchestrator's transition handler.

use tokio::process::Child;
use tokio::sync::mpsc;

/// Published when a supervised process exits for any reason.
#[derive(Debug)]
pub struct ExitEvent {
    pub subdomain: String,
    pub project_id: i64,
    pub pid: u32,
    /// Exit code when the process exited normally; None when killed by a
    /// signal or when waiting itself failed.
    pub exit_code: Option<i32>,
}

/// Spawn the monitor task for a freshly launched instance.
pub fn spawn_monitor(
    mut child: Child,
    subdomain: String,
    project_id: i64,
    events: mpsc::UnboundedSender<ExitEvent>,
) {
    tokio::spawn(async move {
        let pid = child.id().unwrap_or_default();
        let exit_code = match child.wait().await {
            Ok(status) => {
                tracing::debug!("Instance {} (pid {}) exited: {}", subdomain, pid, status);
                status.code()
            }
            Err(e) => {
                tracing::warn!("Waiting on instance {} (pid {}) failed: {}", subdomain, pid, e);
                None
            }
        };

        // The receiver only disappears during shutdown.
        let _ = events.send(ExitEvent {
            subdomain,
            project_id,
            pid,
            exit_code,
        });
    });
}
