//! # illust-dl
//!
//! Download orchestration engine for grouped illustration downloads.
//!
//! ## Design Philosophy
//!
//! illust-dl is designed to be:
//! - **Group-oriented** - A work's pages are downloaded, paused, cancelled and retried together
//! - **Interruptible** - Pause and cancel take effect between chunks, never mid-write
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use illust_dl::{Config, DownloadManager, GroupRequest, WorkKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = DownloadManager::open(Config::default()).await?;
//!     manager.restore_history().await?;
//!     manager.start_queue_processor();
//!
//!     // Subscribe to events
//!     let mut events = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     manager
//!         .add_group(GroupRequest::new(
//!             WorkKind::MultiPage,
//!             "1234/1234_p<page><ext>",
//!             vec![
//!                 "https://i.example.net/img/1234_p0.png".to_string(),
//!                 "https://i.example.net/img/1234_p1.png".to_string(),
//!             ],
//!         ))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Resource cache consulted before transfers
pub mod cache;
/// Cancellation handles with renewable tokens
pub mod cancellation;
/// Configuration types
pub mod config;
/// History persistence layer
pub mod db;
/// Destination template tokens
pub mod destination;
/// Error types
pub mod error;
/// Download task groups and post-completion hooks
pub mod group;
/// Download manager: queue, scheduling and lifecycle
pub mod manager;
/// Retry logic with exponential backoff
pub mod retry;
/// Single download tasks
pub mod task;
/// Transport collaborator and its HTTP implementation
pub mod transport;
/// Core types and events
pub mod types;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use cache::{MemoryCache, NoCache, ResourceCache};
pub use config::{Config, DownloadConfig, PersistenceConfig, RetryConfig};
pub use db::{Database, HistoryRecord, HistoryStore, NewHistoryRecord};
pub use error::{DatabaseError, DownloadError, Error, Result, TransferError};
pub use group::{
    DownloadTaskGroup, GroupRequest, GroupSnapshot, ManifestHook, NoopHook, PostCompletionHook,
};
pub use manager::DownloadManager;
pub use task::{DownloadTask, SubscriptionId, TaskContext, TaskObserver};
pub use transport::{ByteStream, HttpTransport, Transport};
pub use types::{
    DownloadState, Event, GroupField, GroupId, Priority, TaskEvent, TaskField, WorkKind,
};

/// Run the manager until the process is asked to stop, then shut it down
///
/// Listens for SIGTERM and Ctrl+C on Unix, Ctrl+C elsewhere. See
/// [`run_until`] for what happens once the signal arrives.
///
/// # Example
///
/// ```no_run
/// use illust_dl::{Config, DownloadManager, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = DownloadManager::open(Config::default()).await?;
///     manager.restore_history().await?;
///     manager.start_queue_processor();
///
///     run_with_shutdown(manager).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(manager: DownloadManager) -> Result<()> {
    run_until(manager, termination_signal()).await
}

/// Wait for `shutdown_signal`, then run [`DownloadManager::shutdown`]
///
/// Groups that haven't settled by then are cancelled, and their history
/// records say so.
pub async fn run_until<F>(manager: DownloadManager, shutdown_signal: F) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    shutdown_signal.await;

    let unsettled = manager
        .groups()
        .iter()
        .filter(|group| !matches!(group.current_state(), Ok(state) if state.is_settled()))
        .count();
    let queued = manager.queued_len().await;
    tracing::info!(
        unsettled,
        queued,
        active = manager.active_count(),
        "shutdown requested"
    );
    manager.shutdown().await
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = interrupt() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not listen for SIGTERM, waiting for Ctrl+C only");
            interrupt().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    interrupt().await;
}

/// Resolves on Ctrl+C; never resolves if the handler can't be installed
async fn interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => {
            tracing::error!(error = %e, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
