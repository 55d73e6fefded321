//! Periodic removal of abandoned build workspaces.
//!
//! Workspaces are normally destroyed by their worker. This sweep catches
//! the ones left behind by a crash, skipping the active job's workspace and
//! the protected dependency caches.

use std::time::Duration;

use brandkit_pipeline::BuildJobManager;
use tokio_util::sync::CancellationToken;

/// Run the sweep loop every `every` until `cancel` is triggered.
///
/// The first tick fires immediately, so a restart cleans up at once.
pub async fn run(manager: BuildJobManager, every: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = every.as_secs(),
        retention_secs = manager.config().workspace_retention.as_secs(),
        "Workspace sweep started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Workspace sweep stopping");
                break;
            }
            _ = interval.tick() => {
                let report = manager.sweep_stale().await;
                if report.removed.is_empty() {
                    tracing::debug!(kept = report.kept, "Workspace sweep: nothing to remove");
                } else {
                    tracing::info!(
                        removed = report.removed.len(),
                        kept = report.kept,
                        "Workspace sweep: removed stale workspaces"
                    );
                }
                for error in &report.errors {
                    tracing::warn!(error = %error, "Workspace sweep: removal failed");
                }
            }
        }
    }
}
