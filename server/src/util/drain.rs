//! In-flight work tracking used to delay shutdown until handlers finish.

use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;

/// Tracks in-flight calls. Clones share the same tracker.
#[derive(Debug, Clone, Default)]
pub struct Drain {
    tracker: TaskTracker,
}

impl Drain {
    /// New idle tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one unit of work as started. The work counts until the token
    /// is dropped.
    #[must_use]
    pub fn enter(&self) -> TaskTrackerToken {
        self.tracker.token()
    }

    /// Number of tokens alive.
    #[must_use]
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Closes the tracker and waits until no token is alive.
    ///
    /// Tokens handed out after closing are still waited for.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
