//! Shutdown coordination.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::Result;
use crate::types::Event;

use super::DownloadManager;

/// How long shutdown waits for running members to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for running members
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl DownloadManager {
    /// Gracefully shut down the manager
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new groups
    /// 2. Cancels every group (settled groups ignore it)
    /// 3. Waits for running members to stop, with a timeout (30 seconds)
    /// 4. Closes the concurrency limiter so the queue processor exits
    /// 5. Marks a clean shutdown in the history database, if there is one
    /// 6. Emits [`Event::Shutdown`]
    ///
    /// Failures in individual steps are logged and the sequence continues.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.queue_state.accepting_new.store(false, Ordering::SeqCst);
        tracing::info!("Stopped accepting new groups");

        self.cancel_all().await;

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.wait_for_active()).await {
            Ok(()) => tracing::info!("All running members stopped"),
            Err(_) => tracing::warn!(
                active = self.active_count(),
                "Timeout waiting for members to stop, proceeding with shutdown"
            ),
        }

        self.queue_state.concurrent_limit.close();

        if let Some(db) = &self.db {
            if let Err(e) = db.set_clean_shutdown().await {
                tracing::error!(error = %e, "Failed to mark clean shutdown in database");
            } else {
                tracing::info!("Marked clean shutdown in database");
            }
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has begun
    pub fn is_shutting_down(&self) -> bool {
        !self.queue_state.accepting_new.load(Ordering::SeqCst)
    }

    async fn cancel_all(&self) {
        let groups = self.groups();
        tracing::debug!(groups = groups.len(), "Cancelling all groups");

        for group in groups {
            if let Err(e) = group.cancel().await {
                tracing::warn!(group_id = group.id().0, error = %e, "Failed to cancel group");
            }
        }
    }

    async fn wait_for_active(&self) {
        loop {
            let active_count = self.active_count();
            if active_count == 0 {
                return;
            }
            tracing::debug!(active_count, "Waiting for running members to stop");
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }
    }
}
