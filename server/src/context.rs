//! Call context handed to handlers and subscribers.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metadata::Metadata;

/// Per call state: metadata, an optional deadline and a cancellation token.
///
/// The token is cancelled when the call's stream ends, when the deadline
/// passes, or when the server shuts down. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct Context {
    metadata: Arc<Metadata>,
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// Creates a context without deadline.
    #[must_use]
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata: Arc::new(metadata),
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    /// Sets the deadline to `timeout` from now.
    ///
    /// A timeout too large to represent leaves the call without deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        self
    }

    /// Uses a child of `parent` as this context's token.
    #[must_use]
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.token = parent.child_token();
        self
    }

    /// Incoming metadata.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Deadline, if the caller set a timeout.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Cancellation token for this call.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the call was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the call is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parent_cancellation_reaches_call() {
        let root = CancellationToken::new();
        let ctx = Context::new(Metadata::new()).with_parent(&root);
        assert!(!ctx.is_cancelled());
        root.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let ctx = Context::new(Metadata::new()).with_timeout(Some(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(3)));
        assert_eq!(Context::default().remaining(), None);
    }

    #[test]
    fn unrepresentable_deadline_is_ignored() {
        let ctx = Context::new(Metadata::new()).with_timeout(Some(Duration::MAX));
        assert_eq!(ctx.deadline(), None);
        assert_eq!(ctx.remaining(), None);
    }
}
