//! Download manager split into focused submodules.
//!
//! The `DownloadManager` struct and its methods are organized by domain:
//! - [`queue`] - Priority queue management and history restore
//! - [`control`] - Group commands by id (pause/resume/cancel/retry/remove)
//! - [`lifecycle`] - Startup flags and shutdown coordination
//! - [`queue_processor`] - Queue processing and task spawning

mod control;
mod lifecycle;
mod queue;
mod queue_processor;


use crate::cache::{MemoryCache, NoCache, ResourceCache};
use crate::config::Config;
use crate::db::{Database, HistoryStore};
use crate::error::{DownloadError, Error, Result};
use crate::group::DownloadTaskGroup;
use crate::task::TaskContext;
use crate::transport::{HttpTransport, Transport};
use crate::types::{Event, GroupId, Priority};
use parking_lot::{Mutex, RwLock};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};

/// Capacity of the shared event bus
const EVENT_CAPACITY: usize = 1000;

/// Queue and admission state
#[derive(Clone)]
pub(crate) struct QueueState {
    /// Members waiting to run, highest priority first
    pub(crate) queue: Arc<tokio::sync::Mutex<BinaryHeap<QueuedTask>>>,
    /// Limits concurrent transfers to `max_concurrent_downloads`
    pub(crate) concurrent_limit: Arc<tokio::sync::Semaphore>,
    /// Members currently executing
    pub(crate) active: Arc<Mutex<HashSet<(GroupId, usize)>>>,
    /// Tie-breaker handing out FIFO sequence numbers
    pub(crate) next_seq: Arc<AtomicU64>,
    /// Set to false during shutdown
    pub(crate) accepting_new: Arc<AtomicBool>,
}

/// Coordinator owning every group, the run queue and the shared event bus
///
/// Cloneable: all fields are Arc-wrapped.
#[derive(Clone)]
pub struct DownloadManager {
    pub(crate) config: Arc<Config>,
    pub(crate) history: Arc<dyn HistoryStore>,
    /// Set when the history store is the SQLite database, for the shutdown flag
    pub(crate) db: Option<Arc<Database>>,
    pub(crate) ctx: TaskContext,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    pub(crate) groups: Arc<RwLock<HashMap<GroupId, Arc<DownloadTaskGroup>>>>,
    pub(crate) queue_state: QueueState,
}

/// A member waiting in the priority queue
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct QueuedTask {
    pub(crate) group_id: GroupId,
    pub(crate) index: usize,
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
}

// Max-heap: higher priority first, then lower sequence number (FIFO)
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl DownloadManager {
    /// Create a manager from its collaborators
    ///
    /// Nothing runs until [`start_queue_processor`](Self::start_queue_processor)
    /// is called. The resource cache is only consulted when
    /// `use_file_cache` is enabled.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryStore>,
        cache: Arc<dyn ResourceCache>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let cache = if config.download.use_file_cache {
            cache
        } else {
            Arc::new(NoCache)
        };
        let ctx = TaskContext::new(Arc::clone(&config), transport, cache);

        let (event_tx, _rx) = tokio::sync::broadcast::channel(EVENT_CAPACITY);

        let queue_state = QueueState {
            queue: Arc::new(tokio::sync::Mutex::new(BinaryHeap::new())),
            concurrent_limit: Arc::new(tokio::sync::Semaphore::new(
                config.download.max_concurrent_downloads,
            )),
            active: Arc::new(Mutex::new(HashSet::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
            accepting_new: Arc::new(AtomicBool::new(true)),
        };

        Ok(Self {
            config,
            history,
            db: None,
            ctx,
            event_tx,
            groups: Arc::new(RwLock::new(HashMap::new())),
            queue_state,
        })
    }

    /// Create a manager backed by the SQLite history database, the HTTP
    /// transport and an in-memory cache, all taken from `config`
    ///
    /// Marks the session as started in the database so an unclean shutdown
    /// is detected on the next open.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(config.download_dir())
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download_dir().display(),
                        e
                    ),
                ))
            })?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        if db.was_unclean_shutdown().await? {
            tracing::warn!("previous session did not shut down cleanly");
        }
        db.set_clean_start().await?;

        let transport = Arc::new(HttpTransport::new(&config.download)?);
        let cache = Arc::new(MemoryCache::new(config.persistence.cache_capacity_bytes));

        let mut manager = Self::new(config, transport, db.clone(), cache)?;
        manager.db = Some(db);
        Ok(manager)
    }

    /// Subscribe to the shared event bus
    ///
    /// Every group the manager creates or restores publishes here. A
    /// subscriber that falls more than 1000 events behind receives
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The manager's configuration
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Look up a group by id
    pub fn group(&self, id: GroupId) -> Option<Arc<DownloadTaskGroup>> {
        self.groups.read().get(&id).cloned()
    }

    /// Every known group, ordered by id
    pub fn groups(&self) -> Vec<Arc<DownloadTaskGroup>> {
        let mut groups: Vec<_> = self.groups.read().values().cloned().collect();
        groups.sort_by_key(|g| g.id());
        groups
    }

    pub(crate) fn require_group(&self, id: GroupId) -> Result<Arc<DownloadTaskGroup>> {
        self.group(id)
            .ok_or(Error::Download(DownloadError::GroupNotFound { id: id.0 }))
    }

    // send() only fails without receivers, which is fine
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("groups", &self.groups.read().len())
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}
