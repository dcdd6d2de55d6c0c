//! Post-completion hooks: the kind-specific step after every member completed.

use super::GroupSnapshot;
use crate::error::{Error, Result};
use crate::types::WorkKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// File written beside a batch's pages by [`ManifestHook`]
pub const MANIFEST_FILE: &str = "manifest.json";

/// Kind-specific behavior of a group
#[async_trait::async_trait]
pub trait PostCompletionHook: Send + Sync {
    /// Runs once per completion cycle after every member reached Completed
    ///
    /// `token` is the group's own cancellation token. Returning
    /// [`Error::Cancelled`] (or any error after the token triggered) is a
    /// benign abort; any other error puts the group into Error.
    async fn after_all_downloaded(
        &self,
        group: &GroupSnapshot,
        token: CancellationToken,
    ) -> Result<()>;

    /// Remove the group's on-disk artifacts
    async fn delete_artifacts(&self, group: &GroupSnapshot) -> Result<()> {
        remove_member_files(group).await
    }
}

/// Hook for single works and multi-page works: nothing to do after download
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

#[async_trait::async_trait]
impl PostCompletionHook for NoopHook {
    async fn after_all_downloaded(
        &self,
        _group: &GroupSnapshot,
        _token: CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}

/// Hook for batches: records what was downloaded in a JSON manifest
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestHook;

impl ManifestHook {
    /// Where the manifest of `group` lives: beside its first member
    pub fn manifest_path(group: &GroupSnapshot) -> Option<PathBuf> {
        let first = group.entries.first()?;
        let parent = Path::new(&first.destination).parent()?;
        Some(parent.join(MANIFEST_FILE))
    }
}

#[async_trait::async_trait]
impl PostCompletionHook for ManifestHook {
    async fn after_all_downloaded(
        &self,
        group: &GroupSnapshot,
        token: CancellationToken,
    ) -> Result<()> {
        let Some(path) = Self::manifest_path(group) else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(group)?;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::fs::write(&path, body).await?;
        tracing::debug!(group_id = group.id.0, path = %path.display(), "manifest written");
        Ok(())
    }

    async fn delete_artifacts(&self, group: &GroupSnapshot) -> Result<()> {
        remove_member_files(group).await?;
        if let Some(path) = Self::manifest_path(group) {
            remove_if_exists(&path).await?;
        }
        Ok(())
    }
}

/// Default hook for a work kind
pub fn for_kind(kind: WorkKind) -> Arc<dyn PostCompletionHook> {
    match kind {
        WorkKind::Single | WorkKind::MultiPage => Arc::new(NoopHook),
        WorkKind::Batch => Arc::new(ManifestHook),
    }
}

/// Delete every member's destination file, ignoring files that don't exist
pub async fn remove_member_files(group: &GroupSnapshot) -> Result<()> {
    for entry in &group.entries {
        remove_if_exists(Path::new(&entry.destination)).await?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
