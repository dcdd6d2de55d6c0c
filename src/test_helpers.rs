//! Shared test helpers: scripted collaborators and a scratch configuration.

use crate::config::{Config, RetryConfig};
use crate::db::{HistoryRecord, HistoryStore, NewHistoryRecord};
use crate::error::{DatabaseError, Error, Result, TransferError};
use crate::transport::{ByteStream, Transport};
use crate::types::{DownloadState, GroupId};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Configuration rooted in `dir` with fast, jitter-free retries
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.download.download_dir = dir.join("downloads");
    config.persistence.database_path = dir.join("history.db");
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// One scripted answer to a fetch
pub(crate) enum Step {
    /// Respond with these chunks
    Body(Vec<&'static [u8]>),
    /// Respond with the first chunk, then hold the rest until the gate is notified
    Gated {
        first: &'static [u8],
        rest: &'static [u8],
        gate: Arc<Notify>,
    },
    /// Don't answer until the gate is notified, ignoring the token meanwhile
    Held {
        body: &'static [u8],
        gate: Arc<Notify>,
    },
    /// Fail with an HTTP status
    Status(u16),
    /// Fail with a network error
    Network,
}

/// Transport answering from per-source scripts
///
/// Each fetch consumes the next step for its source. A source with no steps
/// left answers 404.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a step for `source`
    pub(crate) fn script(&self, source: &str, step: Step) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .push_back(step);
        self
    }

    /// Total number of fetches made
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        source: &str,
        token: CancellationToken,
    ) -> std::result::Result<ByteStream, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(source)
            .and_then(|steps| steps.pop_front());

        match step {
            Some(Step::Body(chunks)) => Ok(ByteStream::from_chunks(
                chunks.into_iter().map(Bytes::from_static).collect(),
            )),
            Some(Step::Gated { first, rest, gate }) => {
                let total = (first.len() + rest.len()) as u64;
                let head = futures::stream::once(async move {
                    Ok::<_, TransferError>(Bytes::from_static(first))
                });
                let tail = futures::stream::once(async move {
                    gate.notified().await;
                    Ok::<_, TransferError>(Bytes::from_static(rest))
                });
                Ok(ByteStream::new(Some(total), head.chain(tail).boxed()))
            }
            Some(Step::Held { body, gate }) => {
                gate.notified().await;
                Ok(ByteStream::from_chunks(vec![Bytes::from_static(body)]))
            }
            Some(Step::Status(status)) => Err(TransferError::Http {
                status,
                url: source.to_string(),
            }),
            Some(Step::Network) => Err(TransferError::Network("connection reset".to_string())),
            None => Err(TransferError::Http {
                status: 404,
                url: source.to_string(),
            }),
        }
    }
}

/// In-memory history store recording every update it receives
#[derive(Default)]
pub(crate) struct MemoryHistory {
    records: Mutex<BTreeMap<GroupId, HistoryRecord>>,
    updates: Mutex<Vec<(GroupId, DownloadState)>>,
    next_id: Mutex<i64>,
}

impl MemoryHistory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every `(id, state)` passed to `update`, in order
    pub(crate) fn updates(&self) -> Vec<(GroupId, DownloadState)> {
        self.updates.lock().unwrap().clone()
    }

    /// Persisted state of a record
    pub(crate) fn state_of(&self, id: GroupId) -> Option<DownloadState> {
        self.records.lock().unwrap().get(&id).map(|r| r.state)
    }

    /// Insert a record as if it had been persisted by an earlier session
    pub(crate) fn seed(&self, record: HistoryRecord) {
        let mut next = self.next_id.lock().unwrap();
        *next = (*next).max(record.id.get());
        self.records.lock().unwrap().insert(record.id, record);
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistory {
    async fn create(&self, record: &NewHistoryRecord) -> Result<HistoryRecord> {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            GroupId(*next)
        };
        let now = chrono::Utc::now();
        let created = HistoryRecord {
            id,
            kind: record.kind,
            destination: record.destination.clone(),
            state: record.state,
            priority: record.priority,
            sources: record.sources.clone(),
            created_at: now,
            updated_at: now,
        };
        self.records.lock().unwrap().insert(id, created.clone());
        Ok(created)
    }

    async fn update(&self, record: &HistoryRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let existing = records.get_mut(&record.id).ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!("history record {}", record.id)))
        })?;
        *existing = record.clone();
        self.updates
            .lock()
            .unwrap()
            .push((record.id, record.state));
        Ok(())
    }

    async fn delete(&self, id: GroupId) -> Result<bool> {
        Ok(self.records.lock().unwrap().remove(&id).is_some())
    }

    async fn get(&self, id: GroupId) -> Result<Option<HistoryRecord>> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<HistoryRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }
}

/// Poll `condition` until it holds or two seconds pass
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
