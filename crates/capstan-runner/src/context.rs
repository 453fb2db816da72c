//! Cooperative cancellation and deadline context.
//!
//! Handlers may call external services, so pre-emption is off the
//! table: the runner checks this context between nodes, and handlers
//! are expected to check it between external calls. Mid-node
//! cancellation is not guaranteed.

use capstan_core::{Error, Result, Ring};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    pub ring: Ring,
    /// Self-heal attempts already spent on this execution.
    pub healing_count: u32,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Ring::Trusted)
    }
}

impl RunContext {
    pub fn new(ring: Ring) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            ring,
            healing_count: 0,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_healing_count(mut self, healing_count: u32) -> Self {
        self.healing_count = healing_count;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Between-steps check. Cancellation surfaces as a conflict (the
    /// driver maps it to ABORTED); a blown deadline is resource
    /// exhaustion.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Conflict("execution cancelled".into()));
        }
        if self.deadline_exceeded() {
            return Err(Error::ResourceExhaustion(
                "segment wall-clock budget exceeded".into(),
            ));
        }
        Ok(())
    }
}
