//! Presenter update coalescing.
//!
//! Fragment arrival can be high-frequency; updates are limited to at most one
//! per interval so presentation never falls behind ingestion. This is a rate
//! policy, not a correctness mechanism: the reconciler flushes the pending
//! snapshot before committing, so the final update always reflects the full
//! accumulation.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct UpdateThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    dirty: bool,
}

impl UpdateThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            dirty: false,
        }
    }

    /// Record fresh content. Returns true when an update should go out now;
    /// otherwise the content stays pending until the next emit or the final
    /// flush.
    pub fn offer(&mut self, now: Instant) -> bool {
        self.dirty = true;
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                self.dirty = false;
                true
            }
        }
    }

    /// Whether suppressed content is still waiting for the final flush.
    pub fn pending(&self) -> bool {
        self.dirty
    }

    /// Consume the pending flag for the mandatory final flush.
    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Reset for a fresh attempt.
    pub fn reset(&mut self) {
        self.last_emit = None;
        self.dirty = false;
    }
}
