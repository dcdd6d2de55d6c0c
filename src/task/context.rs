//! Task context: collaborators injected into every transfer attempt.

use crate::cache::{NoCache, ResourceCache};
use crate::config::Config;
use crate::transport::Transport;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a running task needs from the outside world
///
/// Built once by the manager and shared by every attempt.
#[derive(Clone)]
pub struct TaskContext {
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cache: Arc<dyn ResourceCache>,
}

impl TaskContext {
    /// Create a context from its collaborators
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn ResourceCache>,
    ) -> Self {
        Self {
            config,
            transport,
            cache,
        }
    }

    /// Context without a resource cache
    pub fn uncached(config: Arc<Config>, transport: Arc<dyn Transport>) -> Self {
        Self::new(config, transport, Arc::new(NoCache))
    }

    /// Configuration the context was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Absolute destination for a resolved path; relative paths land in the download dir
    pub(crate) fn destination_path(&self, destination: &str) -> PathBuf {
        self.config.download_dir().join(destination)
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("download_dir", self.config.download_dir())
            .finish_non_exhaustive()
    }
}
