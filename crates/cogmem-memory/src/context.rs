//! Per-call deadline and cancellation.
//!
//! Every persistence call is made under a [`CallContext`].  When the deadline
//! passes or the token is cancelled while a statement is running, the store
//! interrupts the SQLite connection and reports a timeout instead of hanging.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation token carried by one logical request.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// A context with no deadline of its own.  The store falls back to its
    /// configured operation timeout.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind this context to an externally owned token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `true` once the deadline has passed or the token was cancelled.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Effective deadline given the store's default timeout.
    pub(crate) fn effective_deadline(&self, fallback: Duration) -> Instant {
        self.deadline.unwrap_or_else(|| Instant::now() + fallback)
    }
}
