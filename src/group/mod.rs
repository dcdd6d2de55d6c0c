//! Download task groups: related tasks with one derived state.
//!
//! - [`hook`] - Kind-specific post-completion step and artifact removal
//!
//! A group never stores its state. [`DownloadTaskGroup::current_state`] scans
//! the members on every read, so the result is correct under any interleaving
//! of member transitions. Cascading commands hold the member list exclusively
//! while they run, which keeps scans from observing a half-applied cascade.
//!
//! The history record is written only when the derived state settles into
//! Completed, Error or Cancelled.

pub mod hook;


pub use hook::{ManifestHook, NoopHook, PostCompletionHook};

use crate::cancellation::CancellationHandle;
use crate::db::{HistoryRecord, HistoryStore, NewHistoryRecord};
use crate::destination;
use crate::error::{DownloadError, Error, Result};
use crate::task::{DownloadTask, SubscriptionId, TaskContext, TaskObserver};
use crate::types::{DownloadState, Event, GroupField, GroupId, Priority, TaskEvent, WorkKind};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Work description a group is built from
#[derive(Clone)]
pub struct GroupRequest {
    /// Kind of work
    pub kind: WorkKind,
    /// Destination template shared by members (`<page>`, `<ext>` tokens allowed)
    pub destination: String,
    /// Source locators in page order
    pub sources: Vec<String>,
    /// Scheduling priority of the members
    pub priority: Priority,
    /// Overrides the kind's default post-completion hook
    pub hook: Option<Arc<dyn PostCompletionHook>>,
}

impl GroupRequest {
    /// Request with normal priority and the kind's default hook
    pub fn new(kind: WorkKind, destination: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            kind,
            destination: destination.into(),
            sources,
            priority: Priority::Normal,
            hook: None,
        }
    }

    /// Set the scheduling priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Use a custom post-completion hook
    pub fn with_hook(mut self, hook: Arc<dyn PostCompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }
}

impl std::fmt::Debug for GroupRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRequest")
            .field("kind", &self.kind)
            .field("destination", &self.destination)
            .field("sources", &self.sources)
            .field("priority", &self.priority)
            .field("custom_hook", &self.hook.is_some())
            .finish()
    }
}

/// Member as seen by hooks
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SnapshotEntry {
    /// Member index
    pub index: usize,
    /// Source locator
    pub source: String,
    /// Resolved destination path
    pub destination: String,
}

/// Point-in-time view of a group handed to hooks
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupSnapshot {
    /// Group id
    pub id: GroupId,
    /// Kind of work
    pub kind: WorkKind,
    /// Destination template
    pub destination: String,
    /// Members in order
    pub entries: Vec<SnapshotEntry>,
}

/// Resolve a group state from member states
///
/// Priority: Error > Cancelled > Paused > Running > Queued > Pending >
/// Completed. `pending` is the group's own post-processing flag and
/// `hook_failed` counts as an Error member. Paused and Cancelled members
/// together are an invariant violation.
pub fn derive_state<I>(states: I, pending: bool, hook_failed: bool) -> Result<DownloadState>
where
    I: IntoIterator<Item = DownloadState>,
{
    let mut any_error = hook_failed;
    let mut any_running = false;
    let mut any_paused = false;
    let mut any_cancelled = false;
    let mut any_queued = false;
    let mut any_pending = pending;

    for state in states {
        match state {
            DownloadState::Queued => any_queued = true,
            DownloadState::Running => any_running = true,
            DownloadState::Paused => any_paused = true,
            DownloadState::Cancelled => any_cancelled = true,
            DownloadState::Error => any_error = true,
            DownloadState::Pending => any_pending = true,
            DownloadState::Completed => {}
        }
        if any_paused && any_cancelled {
            return Err(Error::InvariantViolation(
                "group has Paused and Cancelled members at the same time".to_string(),
            ));
        }
    }

    Ok(if any_error {
        DownloadState::Error
    } else if any_cancelled {
        DownloadState::Cancelled
    } else if any_paused {
        DownloadState::Paused
    } else if any_running {
        DownloadState::Running
    } else if any_queued {
        DownloadState::Queued
    } else if any_pending {
        DownloadState::Pending
    } else {
        DownloadState::Completed
    })
}

/// Forwards member notifications onto the group's event bus
struct EventRelay {
    group_id: GroupId,
    event_tx: broadcast::Sender<Event>,
}

impl EventRelay {
    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

impl TaskObserver for EventRelay {
    fn on_task_event(&self, task: &DownloadTask, event: &TaskEvent) {
        let group_id = self.group_id;
        let index = task.index();
        match event {
            TaskEvent::Started => self.emit(Event::ItemStarted { group_id, index }),
            TaskEvent::Stopped => self.emit(Event::ItemStopped { group_id, index }),
            TaskEvent::Errored => self.emit(Event::ItemFailed {
                group_id,
                index,
                error: task
                    .error_cause()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
            }),
            TaskEvent::AfterDownload => self.emit(Event::ItemDownloaded { group_id, index }),
            TaskEvent::Changed(field) => {
                self.emit(Event::ItemChanged {
                    group_id,
                    index,
                    field: *field,
                });
                self.emit(Event::GroupChanged {
                    group_id,
                    field: GroupField::from(*field),
                });
            }
        }
    }
}

struct Member {
    task: Arc<DownloadTask>,
    subscription: SubscriptionId,
}

/// Last record written to history and the completion cycle it belongs to
struct Persisted {
    record: HistoryRecord,
    cycle: Option<u64>,
}

/// An ordered set of related download tasks with one derived state
pub struct DownloadTaskGroup {
    id: GroupId,
    kind: WorkKind,
    template: String,
    priority: Priority,
    members: RwLock<Vec<Member>>,
    /// Restored from history and not yet initialized
    restored: AtomicBool,
    pending: AtomicBool,
    hook_started: AtomicBool,
    hook_finished: AtomicBool,
    hook_error: Mutex<Option<Arc<Error>>>,
    cancel: Mutex<CancellationHandle>,
    /// Bumped whenever a new completion cycle begins (reset, added member)
    cycle: AtomicU64,
    persisted: Mutex<Persisted>,
    persist_lock: tokio::sync::Mutex<()>,
    hook: Arc<dyn PostCompletionHook>,
    history: Arc<dyn HistoryStore>,
    relay: Arc<EventRelay>,
}

impl DownloadTaskGroup {
    /// Persist a new record for `request`, then build the group on it
    pub async fn create(
        request: GroupRequest,
        history: Arc<dyn HistoryStore>,
        event_tx: broadcast::Sender<Event>,
    ) -> Result<Self> {
        let record = history
            .create(&NewHistoryRecord {
                kind: request.kind,
                destination: request.destination.clone(),
                state: DownloadState::Queued,
                priority: request.priority,
                sources: request.sources.clone(),
            })
            .await?;

        let hook = request
            .hook
            .unwrap_or_else(|| hook::for_kind(request.kind));
        let group = Self::build(record, request.priority, hook, history, event_tx, false);
        group.populate(&request.sources);

        tracing::info!(
            group_id = group.id.0,
            kind = ?group.kind,
            tasks = request.sources.len(),
            "group created"
        );
        Ok(group)
    }

    /// Rebuild a group from a history record
    ///
    /// The group reports the record's state and has no members until
    /// [`initialize`](Self::initialize) is called.
    pub fn from_record(
        record: HistoryRecord,
        history: Arc<dyn HistoryStore>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        let hook = hook::for_kind(record.kind);
        let priority = record.priority;
        Self::build(record, priority, hook, history, event_tx, true)
    }

    fn build(
        record: HistoryRecord,
        priority: Priority,
        hook: Arc<dyn PostCompletionHook>,
        history: Arc<dyn HistoryStore>,
        event_tx: broadcast::Sender<Event>,
        restored: bool,
    ) -> Self {
        let id = record.id;
        Self {
            id,
            kind: record.kind,
            template: record.destination.clone(),
            priority,
            members: RwLock::new(Vec::new()),
            restored: AtomicBool::new(restored),
            pending: AtomicBool::new(false),
            hook_started: AtomicBool::new(false),
            hook_finished: AtomicBool::new(false),
            hook_error: Mutex::new(None),
            cancel: Mutex::new(CancellationHandle::new()),
            cycle: AtomicU64::new(0),
            persisted: Mutex::new(Persisted {
                record,
                cycle: None,
            }),
            persist_lock: tokio::sync::Mutex::new(()),
            hook,
            history,
            relay: Arc::new(EventRelay {
                group_id: id,
                event_tx,
            }),
        }
    }

    fn populate(&self, sources: &[String]) {
        let mut members = self.members.write();
        for source in sources {
            let index = members.len();
            members.push(self.member(index, source));
        }
    }

    fn member(&self, index: usize, source: &str) -> Member {
        let task = Arc::new(DownloadTask::new(index, source, &self.template));
        let subscription = task.subscribe(self.relay.clone());
        Member { task, subscription }
    }

    /// Materialize the members of a restored group from its record
    ///
    /// Returns `false` if the group already had its members.
    pub fn initialize(&self) -> bool {
        if !self.restored.swap(false, Ordering::AcqRel) {
            return false;
        }
        let sources = self.persisted.lock().record.sources.clone();
        self.populate(&sources);
        tracing::debug!(group_id = self.id.0, tasks = sources.len(), "restored group initialized");
        self.emit(Event::GroupChanged {
            group_id: self.id,
            field: GroupField::CurrentState,
        });
        true
    }

    /// Whether the group still mirrors a history record without members
    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::Acquire)
    }

    /// Group id (the history record id)
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Kind of work
    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    /// Scheduling priority of the members
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Destination template shared by members
    pub fn destination(&self) -> &str {
        &self.template
    }

    /// Subscribe to the group's event bus
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.relay.event_tx.subscribe()
    }

    /// Derived state, recomputed from the members on every call
    pub fn current_state(&self) -> Result<DownloadState> {
        if self.is_restored() {
            return Ok(self.persisted.lock().record.state);
        }
        let members = self.members.read();
        derive_state(
            members.iter().map(|m| m.task.state()),
            self.pending.load(Ordering::Acquire),
            self.hook_error.lock().is_some(),
        )
    }

    /// First member failure, or the hook failure if no member failed
    pub fn error_cause(&self) -> Option<Arc<Error>> {
        let members = self.members.read();
        members
            .iter()
            .find_map(|m| m.task.error_cause())
            .or_else(|| self.hook_error.lock().clone())
    }

    /// Whether every member is Completed (vacuously true with no members)
    pub fn is_all_completed(&self) -> bool {
        if self.is_restored() {
            return self.persisted.lock().record.state == DownloadState::Completed;
        }
        self.members
            .read()
            .iter()
            .all(|m| m.task.state() == DownloadState::Completed)
    }

    /// Whether any member is in Error
    pub fn is_any_error(&self) -> bool {
        self.members
            .read()
            .iter()
            .any(|m| m.task.state() == DownloadState::Error)
    }

    /// Mean member progress; 100 for a group without members
    pub fn progress_percentage(&self) -> f64 {
        if self.is_restored() {
            let completed = self.persisted.lock().record.state == DownloadState::Completed;
            return if completed { 100.0 } else { 0.0 };
        }
        let members = self.members.read();
        if members.is_empty() {
            return 100.0;
        }
        members.iter().map(|m| m.task.progress()).sum::<f64>() / members.len() as f64
    }

    /// Number of members
    pub fn count(&self) -> usize {
        self.members.read().len()
    }

    /// Member destinations in order
    pub fn destinations(&self) -> Vec<String> {
        self.members
            .read()
            .iter()
            .map(|m| m.task.destination())
            .collect()
    }

    /// Member source locators in order; the record's sources while restored
    pub fn sources(&self) -> Vec<String> {
        if self.is_restored() {
            return self.persisted.lock().record.sources.clone();
        }
        self.members
            .read()
            .iter()
            .map(|m| m.task.source().to_string())
            .collect()
    }

    /// Members in order
    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.members.read().iter().map(|m| m.task.clone()).collect()
    }

    /// Member at `index`
    pub fn task(&self, index: usize) -> Option<Arc<DownloadTask>> {
        self.members.read().get(index).map(|m| m.task.clone())
    }

    /// State of the last written history record
    pub fn persisted_state(&self) -> DownloadState {
        self.persisted.lock().record.state
    }

    /// Append a member; returns its index
    ///
    /// Starts a new completion cycle, so the hook runs again once the new
    /// member completes.
    pub fn add_task(&self, source: impl Into<String>) -> usize {
        self.initialize();
        let source = source.into();
        let index = {
            let mut members = self.members.write();
            let index = members.len();
            members.push(self.member(index, &source));
            self.start_new_cycle();
            index
        };
        tracing::debug!(group_id = self.id.0, index, source = %source, "task added");
        index
    }

    /// Pause every member; members not Running ignore it
    ///
    /// Returns how many members actually paused.
    pub fn pause(&self) -> usize {
        let members = self.members.write();
        let paused = members.iter().filter(|m| m.task.pause()).count();
        tracing::debug!(group_id = self.id.0, paused, "group paused");
        paused
    }

    /// Resume every member; members not Paused ignore it
    pub fn try_resume(&self) -> usize {
        let members = self.members.write();
        let resumed = members.iter().filter(|m| m.task.try_resume()).count();
        tracing::debug!(group_id = self.id.0, resumed, "group resumed");
        resumed
    }

    /// Reset every member back to Queued
    ///
    /// Legal only once the group has settled; returns `Ok(false)` otherwise. A
    /// triggered group cancellation handle is replaced. A restored group
    /// gets its members instead.
    pub fn try_reset(&self) -> Result<bool> {
        let state = self.current_state()?;
        if !state.is_settled() {
            tracing::debug!(group_id = self.id.0, state = %state, "reset ignored");
            return Ok(false);
        }
        if self.initialize() {
            return Ok(true);
        }

        let had_hook_error = {
            let members = self.members.write();
            for member in members.iter() {
                member.task.try_reset();
            }
            self.cancel.lock().renew();
            self.start_new_cycle();
            self.hook_error.lock().take().is_some()
        };
        if had_hook_error {
            self.emit(Event::GroupChanged {
                group_id: self.id,
                field: GroupField::ErrorCause,
            });
        }

        tracing::info!(group_id = self.id.0, from = %state, "group reset");
        Ok(true)
    }

    /// Cancel every member and the post-completion hook
    ///
    /// Legal while Queued, Running, Paused or Pending; returns `Ok(false)`
    /// otherwise. The cascade doesn't wait for members to stop. If the group
    /// settles as a result, the record is written before returning.
    pub async fn cancel(&self) -> Result<bool> {
        let state = self.current_state()?;
        if !matches!(
            state,
            DownloadState::Queued
                | DownloadState::Running
                | DownloadState::Paused
                | DownloadState::Pending
        ) {
            tracing::debug!(group_id = self.id.0, state = %state, "cancel ignored");
            return Ok(false);
        }
        self.initialize();

        {
            let members = self.members.write();
            for member in members.iter() {
                member.task.cancel();
            }
            self.cancel.lock().trigger();
        }
        tracing::info!(group_id = self.id.0, from = %state, "group cancelled");

        self.sync_record().await?;
        Ok(true)
    }

    /// Remove the group's artifacts and its history record
    pub async fn delete(&self) -> Result<()> {
        let snapshot = self.snapshot();
        self.hook.delete_artifacts(&snapshot).await?;
        self.history.delete(self.id).await?;
        tracing::info!(group_id = self.id.0, "group deleted");
        Ok(())
    }

    /// Run member `index` once, then finish the group if it was the last one
    pub async fn run_task(&self, index: usize, ctx: &TaskContext) -> Result<()> {
        let task = self.task(index).ok_or(DownloadError::TaskNotFound {
            group: self.id.0,
            index,
        })?;
        task.execute(ctx).await?;

        if self.count() > 0 && self.is_all_completed() {
            self.run_hook_once().await;
        }
        self.sync_record().await?;
        Ok(())
    }

    /// Point-in-time view of the members with their expected destinations
    pub fn snapshot(&self) -> GroupSnapshot {
        let entries = if self.is_restored() {
            let sources = self.persisted.lock().record.sources.clone();
            sources
                .into_iter()
                .enumerate()
                .map(|(index, source)| SnapshotEntry {
                    index,
                    destination: destination::finalize(
                        &destination::resolve_page(&self.template, index),
                        &source,
                    ),
                    source,
                })
                .collect()
        } else {
            self.members
                .read()
                .iter()
                .map(|m| SnapshotEntry {
                    index: m.task.index(),
                    source: m.task.source().to_string(),
                    destination: destination::finalize(&m.task.destination(), m.task.source()),
                })
                .collect()
        };
        GroupSnapshot {
            id: self.id,
            kind: self.kind,
            destination: self.template.clone(),
            entries,
        }
    }

    /// Write the derived state through to history if it has settled
    ///
    /// Transient states are never written, and neither is Completed while the
    /// completion hook of the current cycle hasn't finished. Each settled
    /// state is written once per cycle. Returns the state written, if any.
    pub async fn sync_record(&self) -> Result<Option<DownloadState>> {
        if self.is_restored() {
            return Ok(None);
        }
        let _guard = self.persist_lock.lock().await;

        let state = self.current_state()?;
        if !state.is_settled() {
            return Ok(None);
        }
        if state == DownloadState::Completed
            && self.count() > 0
            && !self.hook_finished.load(Ordering::Acquire)
        {
            return Ok(None);
        }

        let cycle = self.cycle.load(Ordering::Acquire);
        let mut record = {
            let persisted = self.persisted.lock();
            if persisted.cycle == Some(cycle) && persisted.record.state == state {
                return Ok(None);
            }
            persisted.record.clone()
        };
        record.state = state;
        record.sources = self.sources();
        record.updated_at = chrono::Utc::now();

        self.history.update(&record).await?;
        *self.persisted.lock() = Persisted {
            record,
            cycle: Some(cycle),
        };

        tracing::info!(group_id = self.id.0, state = %state, "group settled");
        self.emit(Event::Settled {
            group_id: self.id,
            state,
        });
        Ok(Some(state))
    }

    /// Run the post-completion hook unless this cycle already ran it
    async fn run_hook_once(&self) {
        if self
            .hook_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let token = self.cancel.lock().token();
        self.set_pending(true);
        self.emit(Event::PostProcessing { group_id: self.id });

        let snapshot = self.snapshot();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = self.hook.after_all_downloaded(&snapshot, token.clone()) => result,
        };

        match result {
            Ok(()) => {
                tracing::debug!(group_id = self.id.0, "post-completion hook finished");
            }
            Err(e) if e.is_cancellation() || token.is_cancelled() => {
                tracing::info!(group_id = self.id.0, "post-completion hook aborted");
                self.emit(Event::HookAborted { group_id: self.id });
            }
            Err(e) => {
                tracing::warn!(group_id = self.id.0, error = %e, "post-completion hook failed");
                *self.hook_error.lock() = Some(Arc::new(Error::Hook(e.to_string())));
                self.emit(Event::GroupChanged {
                    group_id: self.id,
                    field: GroupField::ErrorCause,
                });
            }
        }

        self.hook_finished.store(true, Ordering::Release);
        self.set_pending(false);
    }

    fn set_pending(&self, pending: bool) {
        if self.pending.swap(pending, Ordering::AcqRel) != pending {
            self.emit(Event::GroupChanged {
                group_id: self.id,
                field: GroupField::CurrentState,
            });
        }
    }

    fn start_new_cycle(&self) {
        self.hook_started.store(false, Ordering::Release);
        self.hook_finished.store(false, Ordering::Release);
        self.cycle.fetch_add(1, Ordering::AcqRel);
    }

    fn emit(&self, event: Event) {
        self.relay.emit(event);
    }
}

impl Drop for DownloadTaskGroup {
    fn drop(&mut self) {
        for member in self.members.get_mut().iter() {
            member.task.unsubscribe(member.subscription);
        }
    }
}

impl std::fmt::Debug for DownloadTaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTaskGroup")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("destination", &self.template)
            .field("count", &self.count())
            .field("restored", &self.is_restored())
            .finish()
    }
}
