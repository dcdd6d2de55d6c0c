//! Priority queue management and group admission.

use crate::error::{Error, Result};
use crate::group::{DownloadTaskGroup, GroupRequest};
use crate::types::{DownloadState, Event, GroupId};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::{DownloadManager, QueuedTask};

impl DownloadManager {
    /// Persist a new group and queue its members
    ///
    /// A relative destination template is placed under the download
    /// directory. The history record is written before any member can run.
    /// A group without members settles immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown) has
    /// begun, or the history store's error if the record can't be created.
    pub async fn add_group(&self, mut request: GroupRequest) -> Result<Arc<DownloadTaskGroup>> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        request.destination = self
            .config
            .download_dir()
            .join(&request.destination)
            .to_string_lossy()
            .into_owned();

        let group = Arc::new(
            DownloadTaskGroup::create(request, self.history.clone(), self.event_tx.clone())
                .await?,
        );
        let id = group.id();
        self.groups.write().insert(id, group.clone());

        let tasks = group.count();
        self.emit_event(Event::Queued {
            group_id: id,
            tasks,
        });

        if tasks == 0 {
            group.sync_record().await?;
        } else {
            self.enqueue_queued_members(&group).await;
        }

        Ok(group)
    }

    /// Add one member to the in-memory priority queue
    pub(crate) async fn add_to_queue(&self, group_id: GroupId, index: usize) {
        let priority = match self.group(group_id) {
            Some(group) => group.priority(),
            None => return,
        };
        let queued = QueuedTask {
            group_id,
            index,
            priority,
            seq: self.queue_state.next_seq.fetch_add(1, Ordering::Relaxed),
        };

        let mut queue = self.queue_state.queue.lock().await;
        queue.push(queued);
    }

    /// Queue every member of `group` that is currently Queued
    pub(crate) async fn enqueue_queued_members(&self, group: &DownloadTaskGroup) -> usize {
        let mut queued = 0;
        for task in group.tasks() {
            if task.state() == DownloadState::Queued {
                self.add_to_queue(group.id(), task.index()).await;
                queued += 1;
            }
        }
        tracing::debug!(group_id = group.id().0, queued, "members queued");
        queued
    }

    /// Drop every queued entry of a group
    ///
    /// Returns how many entries were removed.
    pub(crate) async fn remove_from_queue(&self, group_id: GroupId) -> usize {
        let mut queue = self.queue_state.queue.lock().await;

        let original_len = queue.len();
        let items: Vec<_> = queue
            .drain()
            .filter(|item| item.group_id != group_id)
            .collect();
        let removed = original_len - items.len();
        *queue = items.into_iter().collect();

        removed
    }

    /// Number of members waiting in the queue
    pub async fn queued_len(&self) -> usize {
        self.queue_state.queue.lock().await.len()
    }

    /// Load every history record as a restored group
    ///
    /// Settled records stay restored: they report their persisted state
    /// and get members only when retried. A record still Queued belongs to
    /// a group that never settled in an earlier session; it is initialized
    /// and its members are queued again.
    ///
    /// Returns the ids of the groups that were restored.
    pub async fn restore_history(&self) -> Result<Vec<GroupId>> {
        tracing::info!("Restoring groups from history");

        let records = self.history.list().await?;
        if records.is_empty() {
            tracing::info!("No history to restore");
            return Ok(Vec::new());
        }

        let mut restored = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            if self.groups.read().contains_key(&id) {
                tracing::debug!(group_id = id.0, "group already known, skipping restore");
                continue;
            }

            let unsettled = !record.state.is_settled();
            let group = Arc::new(DownloadTaskGroup::from_record(
                record,
                self.history.clone(),
                self.event_tx.clone(),
            ));
            self.groups.write().insert(id, group.clone());

            if unsettled {
                tracing::info!(group_id = id.0, "re-queueing group interrupted before settling");
                group.initialize();
                if group.count() == 0 {
                    group.sync_record().await?;
                } else {
                    self.enqueue_queued_members(&group).await;
                }
            }
            restored.push(id);
        }

        tracing::info!(restored_count = restored.len(), "History restoration complete");
        Ok(restored)
    }
}
