//! How `reserve` waits between polls of the store.
//!
//! Everything that blocks a consumer goes through [`poll_wait`], so replacing
//! the sleep with a change notification from the store only touches this file.
use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Shortest pause allowed between two polls.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Sleeps for `pause`, returning early with `false` if `cancel` fires.
pub(crate) async fn poll_wait(
    pause: Duration,
    cancel: Option<&CancellationToken>,
) -> bool {
    let pause = pause.max(MIN_POLL_INTERVAL);

    match cancel {
        Some(cancel) => select! {
            _ = sleep(pause) => true,
            _ = cancel.cancelled() => false,
        },
        None => {
            sleep(pause).await;
            true
        },
    }
}
