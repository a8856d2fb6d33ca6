//! Cancellation tokens (spec §9: "Async callbacks & event listeners").
//!
//! Permits, worker handles, and workflow contexts all share this one type.
//! Wraps `tokio_util::sync::CancellationToken` with a fire-once reason so
//! callers can distinguish a user cancel from a sentinel-triggered abort or
//! a deadline auto-revoke.

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    UserCancel,
    DeadlineExpired,
    Sentinel(String),
    ParentCancelled,
    Other(String),
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserCancel => write!(f, "user_cancel"),
            CancelReason::DeadlineExpired => write!(f, "deadline_expired"),
            CancelReason::Sentinel(tag) => write!(f, "sentinel:{tag}"),
            CancelReason::ParentCancelled => write!(f, "parent_cancelled"),
            CancelReason::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A cancellation token with subscribe-once reason tracking. Cloning shares
/// the same underlying cancellation state; `child()` derives a token that
/// cancels when the parent does (parent→child wiring, spec §5).
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: CancellationToken,
    reason: Arc<RwLock<Option<CancelReason>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: CancellationToken::new(),
            reason: Arc::new(RwLock::new(None)),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
            reason: Arc::new(RwLock::new(None)),
        }
    }

    /// Fires the token with a reason. Idempotent: firing an already-fired
    /// token is a no-op and does not overwrite the original reason.
    pub async fn cancel(&self, reason: CancelReason) {
        let mut guard = self.reason.write().await;
        if guard.is_none() {
            *guard = Some(reason);
        }
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub async fn reason(&self) -> Option<CancelReason> {
        self.reason.read().await.clone()
    }

    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_idempotent_and_keeps_first_reason() {
        let token = CancelToken::new();
        token.cancel(CancelReason::UserCancel).await;
        token.cancel(CancelReason::DeadlineExpired).await;
        assert!(token.is_cancelled());
        assert_eq!(token.reason().await, Some(CancelReason::UserCancel));
    }

    #[tokio::test]
    async fn child_token_cancels_when_parent_does() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel(CancelReason::ParentCancelled).await;
        child.cancelled().await;
        assert!(child.is_cancelled());
    }
}
