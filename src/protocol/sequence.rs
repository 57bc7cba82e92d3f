use std::sync::atomic::{AtomicU8, Ordering};

/// Stamps outgoing requests with a wrapping 8-bit sequence number that the
///  endpoint echoes in its response. Since the channel allows only a single
///  outstanding request, plain wraparound is enough to keep a stale or
///  duplicate echo from being mistaken for the awaited response.
pub struct SequenceCounter(AtomicU8);

impl SequenceCounter {
    pub fn new() -> SequenceCounter {
        SequenceCounter(AtomicU8::new(0))
    }

    /// returns the current value and increments, wrapping at 256
    pub fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
