use std::sync::atomic::{AtomicU16, Ordering};

/// Allocator for the two-byte message serial embedded in every
/// device-originated frame.
///
/// Serials start at 1, strictly increase, and wrap 0xFFFF → 1 so that 0
/// is never issued. Two concurrent frame builds never receive the same
/// serial.
#[derive(Debug)]
pub struct SerialNo {
    next: AtomicU16,
}

impl SerialNo {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start the sequence at `start` instead of 1. A `start` of 0 is
    /// bumped to 1.
    pub fn starting_at(start: u16) -> Self {
        Self {
            next: AtomicU16::new(start.max(1)),
        }
    }

    /// Take the next serial from the sequence.
    pub fn next(&self) -> u16 {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current == 0xFFFF { 1 } else { current + 1 })
            })
            .unwrap_or(1)
    }
}

impl Default for SerialNo {
    fn default() -> Self {
        Self::new()
    }
}
