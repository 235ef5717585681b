//! Cancellation and deadlines for sync operations.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`SyncContext`] stopped an operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("deadline exceeded")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

/// Carries a cancellation token and an optional deadline through every
/// network step of a sync.
///
/// Cloning shares the token; [`SyncContext::child`] derives a context that is
/// cancelled with its parent but may carry a tighter deadline.
#[derive(Clone, Debug, Default)]
pub struct SyncContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl SyncContext {
    /// A context that never times out and is only stopped by [`cancel`](Self::cancel).
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derives a context cancelled together with `self` whose deadline is the
    /// earlier of the parent's and `now + timeout`.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Reports whether the context has already fired.
    pub fn interrupted(&self) -> Option<Interrupted> {
        if self.cancel.is_cancelled() {
            Some(Interrupted::Cancelled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Interrupted::Timeout)
        } else {
            None
        }
    }

    /// Drives `fut` until it completes or the context fires, whichever is
    /// first. Cancellation wins over an expired deadline.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            () = expired => Err(Interrupted::Timeout),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn given_fast_future_when_run_then_output_returned() {
        let ctx = SyncContext::with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run(async { 42 }).await, Ok(42));
    }

    #[tokio::test]
    async fn given_slow_future_when_deadline_passes_then_timeout() {
        let ctx = SyncContext::with_timeout(Duration::from_millis(20));
        let result = ctx.run(tokio::time::sleep(Duration::from_secs(10))).await;
        assert_eq!(result, Err(Interrupted::Timeout));
        assert_eq!(ctx.interrupted(), Some(Interrupted::Timeout));
    }

    #[tokio::test]
    async fn given_cancelled_context_when_run_then_cancelled() {
        let ctx = SyncContext::background();
        ctx.cancel();
        let result = ctx.run(async { 1 }).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn given_parent_cancelled_when_child_runs_then_cancelled() {
        let parent = SyncContext::background();
        let child = parent.child(Some(Duration::from_secs(10)));
        let handle = tokio::spawn(async move { child.run(std::future::pending::<()>()).await });
        parent.cancel();
        assert_eq!(handle.await.unwrap(), Err(Interrupted::Cancelled));
    }

    #[test]
    fn given_parent_deadline_when_child_asks_longer_then_parent_deadline_kept() {
        let parent = SyncContext::with_timeout(Duration::from_secs(1));
        let child = parent.child(Some(Duration::from_secs(60)));
        assert_eq!(child.deadline(), parent.deadline());
        let tighter = parent.child(Some(Duration::from_millis(1)));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[test]
    fn given_background_context_when_queried_then_no_deadline() {
        let ctx = SyncContext::background();
        assert_eq!(ctx.remaining(), None);
        assert_eq!(ctx.interrupted(), None);
    }
}
