//! Custom test assertions for end-to-end tests

use illust_dl::{DownloadState, Event, GroupId};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

/// Result of waiting for a group to settle
#[derive(Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The group settled and persisted this state
    Settled(DownloadState),
    /// Timeout waiting for the group
    Timeout,
    /// Channel closed unexpectedly
    ChannelClosed,
}

/// Wait for the next `Settled` event of group `id`
///
/// Subscribe before issuing the command whose outcome is awaited, or the
/// event may be missed.
pub async fn wait_for_settled(
    events: &mut Receiver<Event>,
    id: GroupId,
    timeout: Duration,
) -> WaitResult {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::Settled { group_id, state }) if group_id == id => {
                    return WaitResult::Settled(state);
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return WaitResult::ChannelClosed,
            }
        }
    })
    .await;

    result.unwrap_or(WaitResult::Timeout)
}

/// Assert that a file exists and holds exactly `expected`
pub fn assert_file_contents(path: impl AsRef<Path>, expected: &[u8]) {
    let path = path.as_ref();
    let actual = std::fs::read(path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
    assert_eq!(actual, expected, "unexpected contents in {}", path.display());
}
