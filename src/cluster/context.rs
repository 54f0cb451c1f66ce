//! Per-cycle deadline and cancellation

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Checked between pool-level steps; never inside a provider call.
#[derive(Debug, Clone)]
pub struct SyncContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl SyncContext {
    /// A context that is never cancelled and never expires
    pub fn unbounded() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn new(cancel: CancellationToken, budget: Duration) -> Self {
        Self {
            cancel,
            deadline: Some(Instant::now() + budget),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if the cycle was cancelled or ran out of time before `step`.
    pub fn checkpoint(&self, step: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(step.to_string()));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded(step.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_always_passes() {
        let ctx = SyncContext::unbounded();
        assert!(ctx.checkpoint("node sync").is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_checkpoint() {
        let token = CancellationToken::new();
        let ctx = SyncContext::new(token.clone(), Duration::from_secs(60));
        token.cancel();
        assert!(matches!(
            ctx.checkpoint("backend sync"),
            Err(Error::Cancelled(step)) if step == "backend sync"
        ));
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_checkpoint() {
        let ctx = SyncContext::new(CancellationToken::new(), Duration::ZERO);
        assert!(matches!(
            ctx.checkpoint("lb sync"),
            Err(Error::DeadlineExceeded(_))
        ));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }
}
