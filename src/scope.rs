//! Cancellable scope propagation (spec §4.4, §4.5: "starts it under a
//! cancellable scope").
//!
//! The original threads a `context.Context`/`CancelFunc` pair from the
//! driver root down through the coordinator into each twin runner and its
//! watcher goroutines. `tokio_util::sync::CancellationToken` is this
//! crate's analogue: a `Scope` wraps a child token so cancelling a parent
//! cancels every scope derived from it, without each layer having to poll
//! the others.

use tokio_util::sync::CancellationToken;

/// A cancellable scope handed down the root -> coordinator -> runner ->
/// watcher/auto-reconnect chain.
#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
}

impl Scope {
    /// A fresh root scope, owned by the process entrypoint.
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derive a child scope: cancelling `self` cancels the child, but
    /// cancelling the child alone leaves `self` (and siblings) running.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Cancel this scope and every scope derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this scope (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelling_parent_cancels_child() {
        let parent = Scope::root();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_child_does_not_cancel_parent() {
        let parent = Scope::root();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
