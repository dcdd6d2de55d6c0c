//! Transfer attempt: the lifecycle of one scheduled run of a task.

use super::{DownloadTask, TaskContext};
use crate::destination;
use crate::error::{Error, Result, TransferError};
use crate::retry::fetch_with_retry;
use crate::transport::ByteStream;
use crate::types::DownloadState;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

impl DownloadTask {
    /// Run one attempt of this task
    ///
    /// Phases:
    /// 1. Queued -> Running, taking the attempt's cancellation token
    /// 2. Resolve the deferred destination tokens against the source
    /// 3. Skip the transfer if the file exists and overwriting is off
    /// 4. Serve from the resource cache, or fetch with retry
    /// 5. Stream chunks into a part file, checking for pause/cancel between chunks
    /// 6. Pending while the part file is moved into place, then Completed
    ///
    /// Transfer failures are absorbed into the task's state. The only error
    /// returned is an [`Error::InvariantViolation`] when the task wasn't Queued.
    pub(crate) async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let (token, generation) = self.begin()?;

        let resolved = destination::finalize(&self.template, &self.source);
        let path = ctx.destination_path(&resolved);
        self.set_destination(path.to_string_lossy().into_owned());

        match self.transfer(ctx, &path, &token).await {
            Ok(()) => {
                if let Err(e) = self.mark_completed() {
                    // Cancel raced the final move; cancellation wins
                    tracing::debug!(index = self.index, error = %e, "completion superseded");
                }
            }
            Err(e) if token.is_cancelled() || e.is_cancellation() => {
                remove_part_file(&path).await;
                if self.cancellation_generation() != generation {
                    tracing::debug!(index = self.index, "stale attempt unwound after reset");
                } else {
                    // Normally already Cancelled by the command that triggered the token
                    self.cancel_attempt(generation);
                }
                tracing::info!(index = self.index, source = %self.source, "task cancelled");
            }
            Err(e) => {
                remove_part_file(&path).await;
                tracing::warn!(
                    index = self.index,
                    source = %self.source,
                    error = %e,
                    "task failed"
                );
                if let Err(violation) = self.mark_failed(e) {
                    tracing::debug!(index = self.index, error = %violation, "failure superseded");
                }
            }
        }

        Ok(())
    }

    async fn transfer(&self, ctx: &TaskContext, path: &Path, token: &CancellationToken) -> Result<()> {
        let settings = &ctx.config.download;

        if !settings.overwrite_existing && tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::debug!(
                index = self.index,
                destination = %path.display(),
                "destination exists, skipping transfer"
            );
            self.enter_pending(token).await?;
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| TransferError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let cached = if settings.use_file_cache {
            ctx.cache.get(&self.source).await
        } else {
            None
        };
        let from_cache = cached.is_some();

        let stream = match cached {
            Some(bytes) => {
                tracing::debug!(index = self.index, source = %self.source, "serving from cache");
                ByteStream::from_bytes(bytes)
            }
            None => {
                fetch_with_retry(&ctx.config.retry, token, || {
                    ctx.transport.fetch(&self.source, token.clone())
                })
                .await?
            }
        };

        let part = part_path(path);
        let keep = settings.use_file_cache && !from_cache;
        let body = self.write_stream(stream, &part, token, keep).await?;

        self.enter_pending(token).await?;

        tokio::fs::rename(&part, path)
            .await
            .map_err(|source| TransferError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(body) = body {
            ctx.cache.put(&self.source, body).await;
        }

        Ok(())
    }

    /// Drain `stream` into `part`, returning the collected body when `keep` is set
    async fn write_stream(
        &self,
        mut stream: ByteStream,
        part: &Path,
        token: &CancellationToken,
        keep: bool,
    ) -> Result<Option<Bytes>> {
        let io_error = |source| TransferError::Io {
            path: part.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::create(part).await.map_err(io_error)?;
        let mut received: u64 = 0;
        let mut body = keep.then(BytesMut::new);

        loop {
            self.checkpoint(token).await?;

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                chunk = stream.chunks.next() => chunk,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            file.write_all(&chunk).await.map_err(io_error)?;
            received += chunk.len() as u64;
            if let Some(body) = body.as_mut() {
                body.extend_from_slice(&chunk);
            }

            if let Some(total) = stream.content_length.filter(|total| *total > 0) {
                self.set_progress(received as f64 * 100.0 / total as f64);
            }
        }

        file.flush().await.map_err(io_error)?;

        if received == 0 {
            return Err(TransferError::EmptyBody(self.source.clone()).into());
        }

        Ok(body.map(BytesMut::freeze))
    }

    /// Cooperative checkpoint: wait while Paused, abort once cancelled
    async fn checkpoint(&self, token: &CancellationToken) -> Result<()> {
        let mut rx = self.state_receiver();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            resumed = rx.wait_for(|state| *state != DownloadState::Paused) => {
                drop(resumed);
                if token.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Move to Pending, waiting out a pause that arrived after the last chunk
    async fn enter_pending(&self, token: &CancellationToken) -> Result<()> {
        loop {
            self.checkpoint(token).await?;
            match self.state() {
                DownloadState::Paused => continue,
                DownloadState::Cancelled => return Err(Error::Cancelled),
                _ => match self.mark_pending() {
                    Ok(()) => return Ok(()),
                    // A pause may land between the checkpoint and the transition
                    Err(_) if self.state() == DownloadState::Paused => continue,
                    Err(_) if token.is_cancelled() => return Err(Error::Cancelled),
                    Err(e) => return Err(e),
                },
            }
        }
    }
}

/// Scratch file the body is streamed into before it's moved into place
pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_part_file(destination: &Path) {
    let part = part_path(destination);
    if let Err(e) = tokio::fs::remove_file(&part).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %part.display(), error = %e, "failed to remove part file");
    }
}
