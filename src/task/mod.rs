//! Download task: one resource fetched to one destination.
//!
//! Split into focused submodules:
//! - [`context`] - Collaborators a task needs while it runs
//! - [`execution`] - The transfer attempt driven by the scheduler
//!
//! A [`DownloadTask`] serializes its own transitions: every state-changing
//! operation takes the task's notification lock, mutates the state under a
//! short inner lock and then publishes to observers in order. Readers only take
//! the inner lock, so observers may read the task they are notified about but
//! must not issue commands on it from inside the callback.
//!
//! Commands and execution are crate-internal: outside the crate a task is
//! only observed, and every change goes through its owning group.

mod context;
mod execution;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use context::TaskContext;

use crate::cancellation::CancellationHandle;
use crate::destination;
use crate::error::{Error, Result};
use crate::types::{DownloadState, TaskEvent, TaskField};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Receives lifecycle and field-change notifications from a task
///
/// Callbacks run synchronously on whichever worker drove the transition, in the
/// order the task made them.
pub trait TaskObserver: Send + Sync {
    /// Called once per published event
    fn on_task_event(&self, task: &DownloadTask, event: &TaskEvent);
}

/// Handle returned by [`DownloadTask::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct TaskInner {
    state: DownloadState,
    progress: f64,
    error: Option<Arc<Error>>,
    destination: String,
    cancel: CancellationHandle,
}

/// One unit of work: download one source to one destination
///
/// Only the owning [`DownloadTaskGroup`](crate::DownloadTaskGroup) can drive it:
///
/// ```compile_fail
/// use illust_dl::DownloadTask;
///
/// let task = DownloadTask::new(0, "https://i.example.net/img/1_p0.png", "1_p0<ext>");
/// task.cancel();
/// ```
pub struct DownloadTask {
    index: usize,
    source: String,
    template: String,
    inner: Mutex<TaskInner>,
    state_tx: watch::Sender<DownloadState>,
    notify: Mutex<()>,
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn TaskObserver>)>>,
    next_subscription: AtomicU64,
}

impl DownloadTask {
    /// Create a Queued task for member `index`
    ///
    /// The page token of `destination` is resolved immediately; the extension
    /// token stays until the task runs.
    pub fn new(index: usize, source: impl Into<String>, destination: &str) -> Self {
        let template = destination::resolve_page(destination, index);
        let (state_tx, _) = watch::channel(DownloadState::Queued);
        Self {
            index,
            source: source.into(),
            inner: Mutex::new(TaskInner {
                state: DownloadState::Queued,
                progress: 0.0,
                error: None,
                destination: template.clone(),
                cancel: CancellationHandle::new(),
            }),
            template,
            state_tx,
            notify: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Position of this task in its group
    pub fn index(&self) -> usize {
        self.index
    }

    /// Source locator
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Current state
    pub fn state(&self) -> DownloadState {
        self.inner.lock().state
    }

    /// Progress percentage in `[0, 100]`
    pub fn progress(&self) -> f64 {
        self.inner.lock().progress
    }

    /// Failure detail, present only while in Error
    pub fn error_cause(&self) -> Option<Arc<Error>> {
        self.inner.lock().error.clone()
    }

    /// Destination path; fully resolved once the task has started
    pub fn destination(&self) -> String {
        self.inner.lock().destination.clone()
    }

    /// Generation of the task's cancellation handle
    pub fn cancellation_generation(&self) -> u64 {
        self.inner.lock().cancel.generation()
    }

    /// Wait until the task reaches Completed, Error or Cancelled
    ///
    /// A task that is never scheduled never settles.
    pub async fn wait_until_settled(&self) -> DownloadState {
        let mut rx = self.state_tx.subscribe();
        let settled = rx.wait_for(|state| state.is_settled()).await.map(|s| *s);
        settled.unwrap_or_else(|_| self.state())
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn TaskObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Suspend a Running task. No-op in any other state.
    pub(crate) fn pause(&self) -> bool {
        self.apply(&[DownloadState::Running], DownloadState::Paused, |_| {})
            .is_some()
    }

    /// Resume a Paused task. No-op in any other state.
    pub(crate) fn try_resume(&self) -> bool {
        self.apply(&[DownloadState::Paused], DownloadState::Running, |_| {})
            .is_some()
    }

    /// Cancel a task that hasn't settled yet. No-op once settled.
    ///
    /// Triggers the task's cancellation handle so an in-flight transfer stops
    /// at its next checkpoint.
    pub(crate) fn cancel(&self) -> bool {
        self.apply(
            &[
                DownloadState::Queued,
                DownloadState::Running,
                DownloadState::Paused,
                DownloadState::Pending,
            ],
            DownloadState::Cancelled,
            |inner| inner.cancel.trigger(),
        )
        .is_some()
    }

    /// Return a settled task to Queued, discarding progress and error
    ///
    /// A triggered cancellation handle is replaced with a fresh one. No-op
    /// unless the task is Completed, Error or Cancelled.
    pub(crate) fn try_reset(&self) -> bool {
        let template = self.template.clone();
        self.apply(
            &[
                DownloadState::Completed,
                DownloadState::Error,
                DownloadState::Cancelled,
            ],
            DownloadState::Queued,
            move |inner| {
                inner.cancel.renew();
                inner.destination = template;
            },
        )
        .is_some()
    }

    /// Queued -> Running, handing out the token scoped to this attempt and
    /// the handle generation it belongs to
    pub(crate) fn begin(&self) -> Result<(CancellationToken, u64)> {
        let mut attempt = None;
        self.strict(&[DownloadState::Queued], DownloadState::Running, |inner| {
            attempt = Some((inner.cancel.token(), inner.cancel.generation()));
        })?;
        attempt.ok_or_else(|| Error::InvariantViolation("task began without a token".to_string()))
    }

    /// Cancel on behalf of the attempt started at `generation`
    ///
    /// No-op once the task has been reset past that attempt, so a stale
    /// attempt never cancels the run queued after it.
    pub(crate) fn cancel_attempt(&self, generation: u64) -> bool {
        self.apply_if(
            |inner| inner.cancel.generation() == generation,
            &[
                DownloadState::Queued,
                DownloadState::Running,
                DownloadState::Paused,
                DownloadState::Pending,
            ],
            DownloadState::Cancelled,
            |inner| inner.cancel.trigger(),
        )
        .is_some()
    }

    /// Running -> Pending: bytes are in, finalization follows
    pub(crate) fn mark_pending(&self) -> Result<()> {
        self.strict(&[DownloadState::Running], DownloadState::Pending, |inner| {
            inner.progress = 100.0;
        })
    }

    /// Pending -> Completed
    pub(crate) fn mark_completed(&self) -> Result<()> {
        self.strict(&[DownloadState::Pending], DownloadState::Completed, |_| {})
    }

    /// Running | Paused | Pending -> Error with `cause`
    pub(crate) fn mark_failed(&self, cause: Error) -> Result<()> {
        let cause = Arc::new(cause);
        self.strict(
            &[
                DownloadState::Running,
                DownloadState::Paused,
                DownloadState::Pending,
            ],
            DownloadState::Error,
            move |inner| inner.error = Some(cause),
        )
    }

    /// Record a destination resolved at run time
    pub(crate) fn set_destination(&self, destination: String) {
        self.inner.lock().destination = destination;
    }

    /// Raise progress while Running; lower or out-of-state values are ignored
    pub(crate) fn set_progress(&self, percentage: f64) {
        let _guard = self.notify.lock();
        let percentage = percentage.clamp(0.0, 100.0);
        let changed = {
            let mut inner = self.inner.lock();
            if inner.state == DownloadState::Running && percentage > inner.progress {
                inner.progress = percentage;
                true
            } else {
                false
            }
        };
        if changed {
            self.publish(&[TaskEvent::Changed(TaskField::Progress)]);
        }
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<DownloadState> {
        self.state_tx.subscribe()
    }

    fn strict<F>(&self, allowed: &[DownloadState], to: DownloadState, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut TaskInner),
    {
        match self.apply(allowed, to, mutate) {
            Some(_) => Ok(()),
            None => Err(Error::InvariantViolation(format!(
                "task {} cannot move from {} to {}",
                self.index,
                self.state(),
                to
            ))),
        }
    }

    /// Perform `from -> to` if the current state is in `allowed`
    ///
    /// Returns the previous state on a genuine transition. Nothing is
    /// published when the transition is refused.
    fn apply<F>(&self, allowed: &[DownloadState], to: DownloadState, mutate: F) -> Option<DownloadState>
    where
        F: FnOnce(&mut TaskInner),
    {
        self.apply_if(|_| true, allowed, to, mutate)
    }

    /// [`apply`](Self::apply) with an extra precondition checked under the same lock
    fn apply_if<P, F>(
        &self,
        precondition: P,
        allowed: &[DownloadState],
        to: DownloadState,
        mutate: F,
    ) -> Option<DownloadState>
    where
        P: FnOnce(&TaskInner) -> bool,
        F: FnOnce(&mut TaskInner),
    {
        let _guard = self.notify.lock();
        let (from, progress_reset, error_changed) = {
            let mut inner = self.inner.lock();
            if !allowed.contains(&inner.state) || !precondition(&inner) {
                return None;
            }
            let from = inner.state;
            let had_progress = inner.progress > 0.0;
            let had_error = inner.error.is_some();
            if to == DownloadState::Queued {
                inner.progress = 0.0;
                inner.error = None;
            }
            mutate(&mut inner);
            inner.state = to;
            (
                from,
                to == DownloadState::Queued && had_progress,
                had_error != inner.error.is_some(),
            )
        };
        self.state_tx.send_replace(to);

        tracing::debug!(
            index = self.index,
            source = %self.source,
            from = %from,
            to = %to,
            "task transition"
        );

        let mut events = vec![TaskEvent::Changed(TaskField::State)];
        if progress_reset || to == DownloadState::Pending {
            events.push(TaskEvent::Changed(TaskField::Progress));
        }
        if error_changed {
            events.push(TaskEvent::Changed(TaskField::Error));
        }
        match to {
            DownloadState::Running => events.push(TaskEvent::Started),
            DownloadState::Paused => events.push(TaskEvent::Stopped),
            DownloadState::Cancelled
                if matches!(from, DownloadState::Running | DownloadState::Paused) =>
            {
                events.push(TaskEvent::Stopped)
            }
            DownloadState::Error => events.push(TaskEvent::Errored),
            DownloadState::Completed => events.push(TaskEvent::AfterDownload),
            _ => {}
        }
        self.publish(&events);
        Some(from)
    }

    // Caller holds the notification lock
    fn publish(&self, events: &[TaskEvent]) {
        let observers: Vec<Arc<dyn TaskObserver>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for event in events {
            for observer in &observers {
                observer.on_task_event(self, event);
            }
        }
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DownloadTask")
            .field("index", &self.index)
            .field("source", &self.source)
            .field("state", &inner.state)
            .field("progress", &inner.progress)
            .field("destination", &inner.destination)
            .finish()
    }
}
