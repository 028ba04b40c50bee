//! Sequence numbers for request/response correlation

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic sequence generator shared by every endpoint of one node.
///
/// Values wrap at 2^32 and skip zero, so a sequence is only unique among the
/// requests currently in flight on a connection.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicU32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Generator whose first value is `last + 1`
    pub fn starting_at(last: u32) -> Self {
        Self {
            last: AtomicU32::new(last),
        }
    }

    /// Allocate the next sequence number
    pub fn next(&self) -> u32 {
        loop {
            let seq = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }
}
