use super::*;
use crate::cache::{MemoryCache, ResourceCache};
use crate::error::TransferError;
use crate::test_helpers::{ScriptedTransport, Step, eventually, test_config};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::Notify;

const SOURCE: &str = "https://i.example.net/img/1234_p0.png";

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    fn count(&self, wanted: &TaskEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == wanted).count()
    }
}

impl TaskObserver for RecordingObserver {
    fn on_task_event(&self, _task: &DownloadTask, event: &TaskEvent) {
        self.events.lock().push(event.clone());
    }
}

fn context(dir: &std::path::Path, transport: Arc<ScriptedTransport>) -> TaskContext {
    TaskContext::uncached(Arc::new(test_config(dir)), transport)
}

fn template(dir: &std::path::Path) -> String {
    format!("{}/art/1234_p<page><ext>", dir.display())
}

#[test]
fn test_new_task_is_queued_with_page_resolved() {
    let task = DownloadTask::new(2, SOURCE, "art/1234_p<page><ext>");
    assert_eq!(task.state(), DownloadState::Queued);
    assert_eq!(task.progress(), 0.0);
    assert!(task.error_cause().is_none());
    assert_eq!(task.destination(), "art/1234_p2<ext>");
    assert_eq!(task.index(), 2);
    assert_eq!(task.source(), SOURCE);
}

#[test]
fn test_commands_outside_legal_states_are_silent_noops() {
    let task = DownloadTask::new(0, SOURCE, "x");
    let observer = Arc::new(RecordingObserver::default());
    task.subscribe(observer.clone());

    assert!(!task.pause(), "cannot pause a Queued task");
    assert!(!task.try_resume(), "cannot resume a Queued task");
    assert!(!task.try_reset(), "cannot reset a Queued task");
    assert_eq!(task.state(), DownloadState::Queued);
    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn test_successful_transfer_writes_file_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(SOURCE, Step::Body(vec![b"abcd", b"efgh"]));
    let ctx = context(dir.path(), transport.clone());

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    let observer = Arc::new(RecordingObserver::default());
    task.subscribe(observer.clone());

    task.execute(&ctx).await.unwrap();

    assert_eq!(task.state(), DownloadState::Completed);
    assert_eq!(task.progress(), 100.0);
    let expected = dir.path().join("art/1234_p0.png");
    assert_eq!(task.destination(), expected.to_string_lossy());
    assert_eq!(std::fs::read(&expected).unwrap(), b"abcdefgh");
    assert!(!execution::part_path(&expected).exists());

    let events = observer.events();
    assert_eq!(events.first(), Some(&TaskEvent::Changed(TaskField::State)));
    assert_eq!(observer.count(&TaskEvent::Started), 1);
    assert_eq!(observer.count(&TaskEvent::AfterDownload), 1);
    assert_eq!(events.last(), Some(&TaskEvent::AfterDownload));
    assert!(observer.count(&TaskEvent::Changed(TaskField::Progress)) >= 2);
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(SOURCE, Step::Body(vec![b"aa", b"bb", b"cc", b"dd"]));
    let ctx = context(dir.path(), transport);

    struct ProgressLog(Mutex<Vec<f64>>);
    impl TaskObserver for ProgressLog {
        fn on_task_event(&self, task: &DownloadTask, event: &TaskEvent) {
            if *event == TaskEvent::Changed(TaskField::Progress) {
                self.0.lock().push(task.progress());
            }
        }
    }

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    let log = Arc::new(ProgressLog(Mutex::new(Vec::new())));
    task.subscribe(log.clone());
    task.execute(&ctx).await.unwrap();

    let seen = log.0.lock().clone();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
    assert_eq!(seen.last(), Some(&100.0));
}

#[tokio::test]
async fn test_transfer_failure_sets_error_cause() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(SOURCE, Step::Status(403));
    let ctx = context(dir.path(), transport.clone());

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    let observer = Arc::new(RecordingObserver::default());
    task.subscribe(observer.clone());
    task.execute(&ctx).await.unwrap();

    assert_eq!(task.state(), DownloadState::Error);
    let cause = task.error_cause().unwrap();
    assert!(matches!(
        cause.as_ref(),
        Error::Transfer(TransferError::Http { status: 403, .. })
    ));
    assert_eq!(transport.calls(), 1, "403 is not retried");
    assert_eq!(observer.count(&TaskEvent::Errored), 1);
    assert_eq!(observer.count(&TaskEvent::Changed(TaskField::Error)), 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried_within_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .script(SOURCE, Step::Network)
        .script(SOURCE, Step::Body(vec![b"ok"]));
    let ctx = context(dir.path(), transport.clone());

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    let observer = Arc::new(RecordingObserver::default());
    task.subscribe(observer.clone());
    task.execute(&ctx).await.unwrap();

    assert_eq!(task.state(), DownloadState::Completed);
    assert_eq!(transport.calls(), 2);
    assert_eq!(observer.count(&TaskEvent::Started), 1);
}

#[tokio::test]
async fn test_existing_destination_is_not_downloaded_again() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let ctx = context(dir.path(), transport.clone());

    let existing = dir.path().join("art/1234_p0.png");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, b"old").unwrap();

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    task.execute(&ctx).await.unwrap();

    assert_eq!(task.state(), DownloadState::Completed);
    assert_eq!(task.progress(), 100.0);
    assert_eq!(transport.calls(), 0);
    assert_eq!(std::fs::read(&existing).unwrap(), b"old");
}

#[tokio::test]
async fn test_overwrite_existing_fetches_anyway() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(SOURCE, Step::Body(vec![b"new"]));
    let mut config = test_config(dir.path());
    config.download.overwrite_existing = true;
    let ctx = TaskContext::uncached(Arc::new(config), transport.clone());

    let existing = dir.path().join("art/1234_p0.png");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, b"old").unwrap();

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    task.execute(&ctx).await.unwrap();

    assert_eq!(task.state(), DownloadState::Completed);
    assert_eq!(std::fs::read(&existing).unwrap(), b"new");
}

#[tokio::test]
async fn test_cache_hit_skips_transport_and_miss_fills_cache() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("https://i.example.net/miss.jpg", Step::Body(vec![b"fetched"]));
    let cache = Arc::new(MemoryCache::new(1_024));
    cache.put(SOURCE, Bytes::from_static(b"cached")).await;
    let ctx = TaskContext::new(
        Arc::new(test_config(dir.path())),
        transport.clone(),
        cache.clone(),
    );

    let hit = DownloadTask::new(0, SOURCE, &template(dir.path()));
    hit.execute(&ctx).await.unwrap();
    assert_eq!(hit.state(), DownloadState::Completed);
    assert_eq!(transport.calls(), 0);
    assert_eq!(
        std::fs::read(dir.path().join("art/1234_p0.png")).unwrap(),
        b"cached"
    );

    let miss = DownloadTask::new(
        1,
        "https://i.example.net/miss.jpg",
        &template(dir.path()),
    );
    miss.execute(&ctx).await.unwrap();
    assert_eq!(miss.state(), DownloadState::Completed);
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        cache.get("https://i.example.net/miss.jpg").await,
        Some(Bytes::from_static(b"fetched"))
    );
}

#[tokio::test]
async fn test_pause_holds_transfer_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        SOURCE,
        Step::Gated {
            first: b"abcd",
            rest: b"efgh",
            gate: gate.clone(),
        },
    );
    let ctx = context(dir.path(), transport);

    let task = Arc::new(DownloadTask::new(0, SOURCE, &template(dir.path())));
    let observer = Arc::new(RecordingObserver::default());
    task.subscribe(observer.clone());

    let runner = {
        let task = task.clone();
        tokio::spawn(async move { task.execute(&ctx).await })
    };

    assert!(eventually(|| task.progress() >= 50.0).await);

    assert!(task.pause());
    assert!(!task.pause(), "second pause is a no-op");
    assert_eq!(task.state(), DownloadState::Paused);
    assert_eq!(observer.count(&TaskEvent::Stopped), 1);

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(task.state(), DownloadState::Paused, "paused task must not finish");

    assert!(task.try_resume());
    assert!(!task.try_resume());
    assert_eq!(task.wait_until_settled().await, DownloadState::Completed);
    runner.await.unwrap().unwrap();

    assert_eq!(observer.count(&TaskEvent::Started), 2);
    assert_eq!(
        std::fs::read(dir.path().join("art/1234_p0.png")).unwrap(),
        b"abcdefgh"
    );
}

#[tokio::test]
async fn test_cancel_mid_transfer_settles_cancelled_without_cause() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        SOURCE,
        Step::Gated {
            first: b"abcd",
            rest: b"efgh",
            gate,
        },
    );
    let ctx = context(dir.path(), transport);

    let task = Arc::new(DownloadTask::new(0, SOURCE, &template(dir.path())));
    let runner = {
        let task = task.clone();
        tokio::spawn(async move { task.execute(&ctx).await })
    };

    assert!(eventually(|| task.progress() >= 50.0).await);
    assert!(task.cancel());
    assert!(!task.cancel(), "cancel is idempotent");

    runner.await.unwrap().unwrap();
    assert_eq!(task.state(), DownloadState::Cancelled);
    assert!(task.error_cause().is_none());

    let destination = dir.path().join("art/1234_p0.png");
    assert!(!destination.exists());
    assert!(!execution::part_path(&destination).exists());
}

#[tokio::test]
async fn test_cancel_while_paused() {
    let task = DownloadTask::new(0, SOURCE, "x");
    let observer = Arc::new(RecordingObserver::default());
    task.subscribe(observer.clone());

    task.begin().unwrap();
    assert!(task.pause());
    assert!(task.cancel());
    assert_eq!(task.state(), DownloadState::Cancelled);
    assert!(!task.try_resume(), "cancelled task cannot resume");
    assert_eq!(observer.count(&TaskEvent::Stopped), 2);
}

#[tokio::test]
async fn test_execute_requires_queued() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), Arc::new(ScriptedTransport::new()));

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    assert!(task.cancel());
    let err = task.execute(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));
    assert_eq!(task.state(), DownloadState::Cancelled);
}

#[test]
fn test_strict_transition_from_wrong_state_is_violation() {
    let task = DownloadTask::new(0, SOURCE, "x");
    assert!(matches!(
        task.mark_completed(),
        Err(Error::InvariantViolation(_))
    ));
    assert!(matches!(task.mark_pending(), Err(Error::InvariantViolation(_))));
    assert_eq!(task.state(), DownloadState::Queued);
}

#[tokio::test]
async fn test_reset_clears_progress_and_error() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .script(SOURCE, Step::Status(404))
        .script(SOURCE, Step::Body(vec![b"ok"]));
    let ctx = context(dir.path(), transport);

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    task.execute(&ctx).await.unwrap();
    assert_eq!(task.state(), DownloadState::Error);

    assert!(task.try_reset());
    assert_eq!(task.state(), DownloadState::Queued);
    assert_eq!(task.progress(), 0.0);
    assert!(task.error_cause().is_none());
    assert_eq!(task.destination(), template(dir.path()).replace("<page>", "0"));
    assert_eq!(task.cancellation_generation(), 0, "untriggered handle is kept");

    task.execute(&ctx).await.unwrap();
    assert_eq!(task.state(), DownloadState::Completed);
}

#[tokio::test]
async fn test_reset_after_cancel_renews_handle() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(SOURCE, Step::Body(vec![b"ok"]));
    let ctx = context(dir.path(), transport);

    let task = DownloadTask::new(0, SOURCE, &template(dir.path()));
    assert!(task.cancel());
    assert!(task.try_reset());
    assert_eq!(task.cancellation_generation(), 1);

    task.execute(&ctx).await.unwrap();
    assert_eq!(task.state(), DownloadState::Completed);
}

#[tokio::test]
async fn test_unsubscribed_observer_hears_nothing() {
    let task = DownloadTask::new(0, SOURCE, "x");
    let kept = Arc::new(RecordingObserver::default());
    let dropped = Arc::new(RecordingObserver::default());
    task.subscribe(kept.clone());
    let id = task.subscribe(dropped.clone());

    assert!(task.unsubscribe(id));
    assert!(!task.unsubscribe(id));
    task.cancel();

    assert!(!kept.events().is_empty());
    assert!(dropped.events().is_empty());
}

#[tokio::test]
async fn test_wait_until_settled_returns_immediately_when_settled() {
    let task = DownloadTask::new(0, SOURCE, "x");
    task.cancel();
    let state = tokio::time::timeout(Duration::from_secs(1), task.wait_until_settled())
        .await
        .unwrap();
    assert_eq!(state, DownloadState::Cancelled);
}

#[test]
fn test_wait_until_settled_wakes_on_cancel() {
    let task = DownloadTask::new(0, SOURCE, "x");
    let mut waiter = tokio_test::task::spawn(task.wait_until_settled());
    tokio_test::assert_pending!(waiter.poll());

    assert!(task.cancel());
    assert!(waiter.is_woken());
    assert_eq!(
        tokio_test::assert_ready!(waiter.poll()),
        DownloadState::Cancelled
    );
}

#[test]
fn test_stale_attempt_cannot_cancel_after_reset() {
    let task = DownloadTask::new(0, SOURCE, "1234_p<page><ext>");
    let (_, stale) = task.begin().unwrap();
    assert!(task.cancel());
    assert!(task.try_reset());

    assert!(!task.cancel_attempt(stale));
    assert_eq!(task.state(), DownloadState::Queued);

    let (_, current) = task.begin().unwrap();
    assert_ne!(current, stale);
    assert!(task.cancel_attempt(current));
    assert_eq!(task.state(), DownloadState::Cancelled);
}
