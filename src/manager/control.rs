//! Group commands by id: pause, resume, cancel, retry, remove, add task.

use crate::error::Result;
use crate::types::{Event, GroupId};

use super::DownloadManager;

impl DownloadManager {
    /// Pause a group
    ///
    /// Running members stop at their next checkpoint; members that haven't
    /// started stay Queued and run when a permit frees up.
    ///
    /// # Returns
    ///
    /// How many members actually paused.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::GroupNotFound`](crate::error::DownloadError::GroupNotFound)
    /// for an unknown id.
    pub async fn pause(&self, id: GroupId) -> Result<usize> {
        let group = self.require_group(id)?;
        Ok(group.pause())
    }

    /// Resume a paused group
    ///
    /// Paused members continue from the byte they stopped at.
    pub async fn resume(&self, id: GroupId) -> Result<usize> {
        let group = self.require_group(id)?;
        Ok(group.try_resume())
    }

    /// Cancel a group
    ///
    /// Queued members are left in the queue; the processor discards them
    /// when it reaches them. Returns `Ok(false)` if the group had already
    /// settled.
    pub async fn cancel(&self, id: GroupId) -> Result<bool> {
        let group = self.require_group(id)?;
        group.cancel().await
    }

    /// Reset a settled group and queue its members again
    ///
    /// A group restored from history gets its members here. Returns
    /// `Ok(false)` if the group hasn't settled yet.
    ///
    /// A member whose cancelled attempt is still unwinding runs again once
    /// that attempt has returned.
    pub async fn retry(&self, id: GroupId) -> Result<bool> {
        let group = self.require_group(id)?;
        if !group.try_reset()? {
            return Ok(false);
        }
        // Entries left over from the previous cycle
        self.remove_from_queue(id).await;

        if group.count() == 0 {
            group.sync_record().await?;
        } else {
            self.enqueue_queued_members(&group).await;
        }
        tracing::info!(group_id = id.0, "group retried");
        Ok(true)
    }

    /// Cancel a group, delete its artifacts and history record, and forget it
    pub async fn remove(&self, id: GroupId) -> Result<()> {
        let group = self.require_group(id)?;
        group.cancel().await?;
        self.remove_from_queue(id).await;
        group.delete().await?;
        self.groups.write().remove(&id);

        tracing::info!(group_id = id.0, "group removed");
        self.emit_event(Event::Removed { group_id: id });
        Ok(())
    }

    /// Append a member to a group and queue it
    ///
    /// A restored group gets its recorded members first, and they are
    /// queued along with the new one. Returns the new member's index.
    pub async fn add_task(&self, id: GroupId, source: impl Into<String>) -> Result<usize> {
        let group = self.require_group(id)?;
        let was_restored = group.is_restored();
        let index = group.add_task(source);
        if was_restored {
            self.enqueue_queued_members(&group).await;
        } else {
            self.add_to_queue(id, index).await;
        }
        Ok(index)
    }
}
