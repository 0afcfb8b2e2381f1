//! A single deadline shared across a connection's handshake and detection phases.
//!
//! The design notes call this out explicitly: the source shares one timeout budget
//! across both phases, anchored at handshake start, and its `next_check_interval`
//! computes `min(deadline - now, 0)`, always non-positive, clearly a bug. This
//! implementation uses `max(deadline - now, 0)` instead, and a transition from
//! handshaking to detecting never resets the anchor.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Time remaining until the deadline, clamped to zero. Never negative.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn has_elapsed(&self) -> bool {
        Instant::now() >= self.at
    }
}
