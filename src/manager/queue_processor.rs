//! Queue processor: drains the priority queue and spawns member runs.

use std::time::Duration;

use super::DownloadManager;
use crate::types::DownloadState;

/// Interval between queue polling attempts when the queue is empty
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl DownloadManager {
    /// Start the queue processor task
    ///
    /// This method spawns a background task that continuously:
    /// 1. Pops the highest-priority member from the queue
    /// 2. Acquires a permit from the concurrency limiter (respects max_concurrent_downloads)
    /// 3. Drops it if its group is gone or it is no longer Queued
    /// 4. Puts it back if a previous attempt of the same member hasn't returned yet
    /// 5. Spawns the member's run, which releases the permit when it finishes
    ///
    /// The loop ends once shutdown closes the concurrency limiter.
    pub fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            let queue = manager.queue_state.queue.clone();
            let concurrent_limit = manager.queue_state.concurrent_limit.clone();

            loop {
                let queued_item = {
                    let mut queue_guard = queue.lock().await;
                    queue_guard.pop()
                };

                let Some(item) = queued_item else {
                    if concurrent_limit.is_closed() {
                        break;
                    }
                    tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                    continue;
                };

                let permit = match concurrent_limit.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        // Limiter closed: re-push the item so it isn't lost
                        let mut queue_guard = queue.lock().await;
                        queue_guard.push(item);
                        break;
                    }
                };

                // Checked after the permit: the member may have changed while waiting
                let Some(group) = manager.group(item.group_id) else {
                    tracing::debug!(group_id = item.group_id.0, "group gone, dropping queued member");
                    continue;
                };
                let Some(task) = group.task(item.index) else {
                    continue;
                };
                if task.state() != DownloadState::Queued {
                    tracing::debug!(
                        group_id = item.group_id.0,
                        index = item.index,
                        state = %task.state(),
                        "member no longer queued, skipping"
                    );
                    continue;
                }
                let key = (item.group_id, item.index);
                if !manager.queue_state.active.lock().insert(key) {
                    // An earlier attempt is still unwinding; run this one after it
                    tracing::debug!(
                        group_id = item.group_id.0,
                        index = item.index,
                        "member still active, requeueing"
                    );
                    drop(permit);
                    queue.lock().await.push(item);
                    tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                    continue;
                }

                let ctx = manager.ctx.clone();
                let active = manager.queue_state.active.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = group.run_task(item.index, &ctx).await {
                        tracing::warn!(
                            group_id = item.group_id.0,
                            index = item.index,
                            error = %e,
                            "member run failed"
                        );
                    }
                    active.lock().remove(&key);
                });
            }

            tracing::debug!("queue processor stopped");
        })
    }

    /// Number of members currently executing
    pub fn active_count(&self) -> usize {
        self.queue_state.active.lock().len()
    }
}
