//! Cancellation and deadlines for a single call.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a [`CallContext`] is done.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    /// The owner of the context cancelled it
    #[error("context canceled")]
    Canceled,
    /// The deadline of the context passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancels every [`CallContext`] derived from the one it was created with.
///
/// Dropping the canceller does not cancel; it only means nobody can cancel
/// anymore.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    /// Cancel the associated contexts. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// A cheaply cloneable handle carrying cancellation and an optional deadline.
#[derive(Clone, Debug)]
pub struct CallContext {
    cancelled: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Create a fresh context and the handle that cancels it.
    pub fn new() -> (Canceller, Self) {
        let (tx, rx) = watch::channel(false);
        (
            Canceller { tx },
            Self {
                cancelled: rx,
                deadline: None,
            },
        )
    }

    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        let (_, ctx) = Self::new();
        ctx
    }

    /// Derive a child context that also expires after `timeout`.
    ///
    /// The child keeps the parent's cancellation and the earlier of the two
    /// deadlines.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancelled: self.cancelled.clone(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// The deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context is done, or `None` if it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if *self.cancelled.borrow() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Returns true once the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is done.
    pub async fn done(&self) -> ContextError {
        let mut cancelled = self.cancelled.clone();
        let cancel = async move {
            if cancelled.wait_for(|c| *c).await.is_err() {
                // Canceller dropped without cancelling: can never fire.
                std::future::pending::<()>().await;
            }
        };
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = cancel => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                cancel.await;
                ContextError::Canceled
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_done() {
        let (canceller, ctx) = CallContext::new();
        assert!(!ctx.is_done());

        let child = ctx.clone();
        let waiter = tokio::spawn(async move { child.done().await });
        canceller.cancel();

        assert_eq!(waiter.await.unwrap(), ContextError::Canceled);
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_timeout_expires() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(20));
        assert!(!ctx.is_done());
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_child_keeps_earlier_deadline() {
        let parent = CallContext::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let (canceller, parent) = CallContext::new();
        let child = parent.with_timeout(Duration::from_secs(60));
        canceller.cancel();
        assert_eq!(child.done().await, ContextError::Canceled);
    }

    #[tokio::test]
    async fn test_dropped_canceller_never_cancels() {
        let ctx = CallContext::background();
        let result = tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(result.is_err());
        assert!(!ctx.is_done());
    }
}
