//! Token-bucket traffic shaper (spec §4.G), bounds lifted from
//! `original_source/shaper.h`: nominal rate in `[100, 100_000_000]` bytes/sec, a
//! write that would exceed the bucket computes a wait instead of busy-looping.

use std::time::{Duration, Instant};

pub const MIN_BYTES_PER_SECOND: u64 = 100;
pub const MAX_BYTES_PER_SECOND: u64 = 100_000_000;
pub const MAX_TIMEOUT: Duration = Duration::from_secs(10);

/// A single-bucket shaper: `bucket` accumulates a debit (in bytes-equivalent
/// microseconds) each time a write is charged, and drains over time at `rate`.
pub struct Shaper {
    rate_bytes_per_sec: u64,
    debit: i64,
    last_update: Instant,
}

impl Shaper {
    pub fn new(rate_bytes_per_sec: u64, now: Instant) -> Shaper {
        assert!(
            rate_bytes_per_sec >= MIN_BYTES_PER_SECOND && rate_bytes_per_sec <= MAX_BYTES_PER_SECOND,
            "shaper rate out of bounds [{}, {}]: {}",
            MIN_BYTES_PER_SECOND,
            MAX_BYTES_PER_SECOND,
            rate_bytes_per_sec
        );

        Shaper {
            rate_bytes_per_sec,
            debit: 0,
            last_update: now,
        }
    }

    fn drain(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        let drained = (elapsed.as_micros() as i64).saturating_mul(self.rate_bytes_per_sec as i64) / 1_000_000;
        self.debit = (self.debit - drained).max(0);
        self.last_update = now;
    }

    /// Charges `bytes` against the bucket. Call before actually writing them.
    pub fn charge(&mut self, bytes: usize, now: Instant) {
        self.drain(now);
        self.debit += (bytes as i64).saturating_mul(1_000_000) / self.rate_bytes_per_sec as i64;
    }

    /// How long the caller must wait before its next write won't exceed the bucket,
    /// capped at `MAX_TIMEOUT` (spec §4.G: "thread that wait into the next select
    /// timeout; no busy-wait").
    pub fn wait(&mut self, now: Instant) -> Duration {
        self.drain(now);
        if self.debit <= 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.debit as u64).min(MAX_TIMEOUT)
        }
    }
}
