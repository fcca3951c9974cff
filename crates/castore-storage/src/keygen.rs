//! Monotonic queue key generator.
//!
//! Queue tables are ordered by their key, so every key minted by a process
//! must be strictly greater than the previous one, even when two entries are
//! created within the same nanosecond.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Process-wide source of strictly increasing queue keys.
#[derive(Debug, Default)]
pub struct KeyGenerator {
    last: Mutex<u64>,
}

impl KeyGenerator {
    /// Creates a generator with no minted keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints `max(wall_clock_ns, last + 1)`.
    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let mut last = self.last.lock();
        let key = now.max(last.saturating_add(1));
        *last = key;
        key
    }

    /// Encodes a key so byte order matches numeric order.
    pub fn encode(key: u64) -> [u8; 8] {
        key.to_be_bytes()
    }
}
