//! Coarse vs fine timer planes (spec §4.G). Coarse timers (pings, inactivity,
//! ping-restart, OCC, packet-id persistence flush, route retries, status-file
//! update) are evaluated at most once per second; fine timers (TLS/reliability
//! retransmits, fragment housekeeping, shaper delay) drive the select timeout
//! directly, with a small jitter to decorrelate peers.

use rand::Rng;
use std::time::{Duration, Instant};

pub const COARSE_TICK: Duration = Duration::from_secs(1);
pub const MAX_JITTER_MICROS: u64 = 1000;

/// Fires its associated work at most once per `COARSE_TICK`.
pub struct CoarseTimer {
    next_due: Instant,
}

impl CoarseTimer {
    pub fn new(now: Instant) -> CoarseTimer {
        CoarseTimer {
            next_due: now + COARSE_TICK,
        }
    }

    /// Returns `true` (and reschedules) if a second has elapsed since the last run.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now >= self.next_due {
            self.next_due = now + COARSE_TICK;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn next_due(&self) -> Instant {
        self.next_due
    }
}

/// Computes the select timeout for one loop iteration: the earliest of all
/// supplied fine-timer deadlines, the next coarse tick, and a sentinel ceiling, plus
/// a decorrelating jitter.
pub fn compute_timeout<R: Rng>(
    now: Instant,
    fine_deadlines: &[Instant],
    coarse_next_due: Instant,
    sentinel: Duration,
    rng: &mut R,
) -> Duration {
    let mut earliest = now + sentinel;

    if coarse_next_due < earliest {
        earliest = coarse_next_due;
    }

    for &deadline in fine_deadlines {
        if deadline < earliest {
            earliest = deadline;
        }
    }

    let base = earliest.saturating_duration_since(now);
    let jitter = Duration::from_micros(rng.gen_range(0, MAX_JITTER_MICROS));
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_coarse_timer_fires_once_per_second() {
        let now = Instant::now();
        let mut timer = CoarseTimer::new(now);

        assert!(!timer.poll(now + Duration::from_millis(500)));
        assert!(timer.poll(now + Duration::from_millis(1001)));
        assert!(!timer.poll(now + Duration::from_millis(1002)));
    }

    #[test]
    fn test_compute_timeout_picks_earliest_fine_deadline() {
        let now = Instant::now();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);

        let deadlines = [now + Duration::from_millis(500), now + Duration::from_millis(100)];
        let coarse_due = now + Duration::from_secs(1);

        let timeout = compute_timeout(now, &deadlines, coarse_due, Duration::from_secs(60), &mut rng);

        assert!(timeout >= Duration::from_millis(100));
        assert!(timeout < Duration::from_millis(100) + Duration::from_micros(MAX_JITTER_MICROS) + Duration::from_millis(1));
    }

    #[test]
    fn test_compute_timeout_falls_back_to_sentinel_when_nothing_pending() {
        let now = Instant::now();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let timeout = compute_timeout(now, &[], now + Duration::from_secs(120), Duration::from_secs(60), &mut rng);

        assert!(timeout >= Duration::from_secs(60));
        assert!(timeout < Duration::from_secs(61));
    }
}
