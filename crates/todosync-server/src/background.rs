//! Periodic maintenance tasks.

use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use crate::sync::SyncCore;

/// Starts a background task that evicts sessions which stopped heartbeating.
///
/// Runs every `sweep_interval_secs`. This task runs indefinitely.
pub async fn start_presence_sweeper(sync: SyncCore) {
    let interval_seconds = sync.policy().sweep_interval_secs.max(1);
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(
        interval_seconds,
        timeout_seconds = sync.policy().heartbeat_timeout_secs,
        "starting presence sweeper"
    );

    loop {
        sleep(interval).await;

        match sync.sweep_presence().await {
            Ok(0) => tracing::debug!("no silent sessions"),
            Ok(count) => tracing::info!(count, "evicted silent sessions"),
            Err(e) => tracing::error!(error = %e, "presence sweep failed"),
        }
    }
}

/// Starts a background task that applies event retention.
///
/// Runs every `expiry_interval_secs`. This task runs indefinitely.
pub async fn start_retention_task(sync: SyncCore) {
    let interval_seconds = sync.policy().expiry_interval_secs.max(1);
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(
        interval_seconds,
        retention_seconds = sync.policy().retention_secs,
        "starting event retention task"
    );

    loop {
        sleep(interval).await;

        match sync.run_retention(Utc::now()).await {
            Ok((report, pruned)) => {
                if report.compacted + report.force_expired + pruned > 0 {
                    tracing::info!(
                        compacted = report.compacted,
                        force_expired = report.force_expired,
                        sessions_flagged = report.sessions_flagged,
                        sessions_pruned = pruned,
                        "applied event retention"
                    );
                } else {
                    tracing::debug!("nothing to expire");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "event retention failed");
            }
        }
    }
}
