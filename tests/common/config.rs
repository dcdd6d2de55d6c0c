//! Test configuration helpers for creating managers over a scratch directory

use illust_dl::{Config, DownloadManager, RetryConfig};
use std::time::Duration;
use tempfile::TempDir;

/// Configuration rooted in `dir` with fast retries
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.download_dir = dir.path().join("downloads");
    config.download.request_timeout = Duration::from_secs(5);
    config.persistence.database_path = dir.path().join("history.db");
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// Open a manager (SQLite history, HTTP transport) and start its queue processor
///
/// Returns the manager and the directory it lives in. Keep the directory
/// alive for as long as the manager is used.
pub async fn create_test_manager() -> (DownloadManager, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_in(&dir).await;
    (manager, dir)
}

/// Open a manager on an existing scratch directory and start its queue processor
pub async fn open_in(dir: &TempDir) -> DownloadManager {
    let manager = DownloadManager::open(test_config(dir)).await.unwrap();
    manager.start_queue_processor();
    manager
}
