//! Per-operation cancellation and deadline.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::{PersistenceError, PersistenceResult};

/// Caller-supplied cancellation signal for one persistence operation.
///
/// Checked before a transaction opens and again right before it commits;
/// a tripped context aborts the transaction so nothing becomes durable.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl OpContext {
    /// A context that never cancels.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Cancel once the watched value becomes `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn check(&self) -> PersistenceResult<()> {
        if let Some(cancel) = &self.cancel {
            if *cancel.borrow() {
                return Err(PersistenceError::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(PersistenceError::Timeout);
            }
        }
        Ok(())
    }
}
