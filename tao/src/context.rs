//! Cancellation context threaded through every task run.
//!
//! A [`Context`] is cheap to clone and forms a tree: a child is done as soon
//! as its own cancel handle fires, its deadline passes, or any ancestor is
//! done. The framework only checks [`Context::is_done`] at `run` entry; task
//! bodies check it themselves (or race [`Context::done`]) for cooperative
//! cancellation.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Context {
    token: CancellationToken,
    /// Earliest deadline along the ancestor chain.
    deadline: Option<Instant>,
}

/// Cancels the context it was created with, and every context derived from it.
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Context {
    /// Root context that is never done.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let token = self.token.child_token();
        let child = Context {
            token: token.clone(),
            deadline: self.deadline,
        };
        (child, CancelHandle { token })
    }

    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Context {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking checkpoint.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is done. Never resolves for `background()`.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.token.clone();
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    }
                }
                None => token.cancelled().await,
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("done", &self.is_done())
            .field("deadline", &self.deadline())
            .finish()
    }
}
