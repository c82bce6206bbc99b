//! Packet-ID generation, replay-window admission, and on-disk persistence
//! (spec §4.B).

use crate::support::{ErrorType, NetworkError, NetworkResult};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MIN_WINDOW_SIZE: usize = 64;
pub const MAX_WINDOW_SIZE: usize = 1024;
pub const DEFAULT_WINDOW_SIZE: usize = 64;
pub const DEFAULT_REPLAY_TIME_SECS: u64 = 15;

/// The point at which a sequence counter must trigger a soft reset rather than risk
/// wrapping (spec §4.B: "must not wrap; ... triggers a soft reset").
pub const SEQUENCE_SOFT_RESET_THRESHOLD: u32 = u32::MAX - (1 << 16);

/// Monotonic per-direction send counter. Never wraps in practice: callers are
/// expected to check [`PacketIdSend::should_rekey`] and trigger a soft reset before
/// it would.
#[derive(Debug, Default)]
pub struct PacketIdSend {
    next: u32,
}

impl PacketIdSend {
    pub fn new() -> PacketIdSend {
        PacketIdSend { next: 0 }
    }

    /// Returns the next packet id and advances the counter. Panics if called again
    /// after wrap would occur; callers must have already rekeyed per
    /// `should_rekey`.
    pub fn next_id(&mut self) -> u32 {
        assert!(self.next < u32::MAX, "packet id counter exhausted");
        let id = self.next;
        self.next += 1;
        id
    }

    #[inline]
    pub fn should_rekey(&self) -> bool {
        self.next >= SEQUENCE_SOFT_RESET_THRESHOLD
    }
}

/// Bitset-backed sliding replay window plus `max_seen` high-water mark (spec §4.B
/// admission algorithm).
pub struct ReplayWindow {
    window_size: usize,
    slots: Vec<bool>,
    max_seen: Option<u32>,
    replay_time: Duration,
}

impl ReplayWindow {
    pub fn new(window_size: usize) -> ReplayWindow {
        assert!(
            window_size >= MIN_WINDOW_SIZE && window_size <= MAX_WINDOW_SIZE,
            "window_size out of bounds [{}, {}]: {}",
            MIN_WINDOW_SIZE,
            MAX_WINDOW_SIZE,
            window_size
        );

        ReplayWindow {
            window_size,
            slots: vec![false; window_size],
            max_seen: None,
            replay_time: Duration::from_secs(DEFAULT_REPLAY_TIME_SECS),
        }
    }

    pub fn with_replay_time(mut self, replay_time: Duration) -> ReplayWindow {
        self.replay_time = replay_time;
        self
    }

    /// Restores state from a persisted (sequence, epoch) checkpoint, per spec §4.B:
    /// "the stored value initializes `max_seen`".
    pub fn restore(&mut self, sequence: u32) {
        self.max_seen = Some(sequence);
    }

    #[inline]
    fn slot_index(&self, id: u32) -> usize {
        (id as usize) % self.window_size
    }

    /// Runs the five-step admission algorithm from spec §4.B. `epoch` and `now_secs`
    /// are only consulted when long-form (epoch-prefixed) packet ids are in use.
    pub fn admit(
        &mut self,
        id: u32,
        epoch: Option<u32>,
        now_secs: u64,
    ) -> NetworkResult<()> {
        if let Some(epoch) = epoch {
            let delta = (now_secs as i64 - epoch as i64).abs();
            if delta > self.replay_time.as_secs() as i64 {
                return Err(NetworkError::Fatal(ErrorType::Expired));
            }
        }

        match self.max_seen {
            None => {
                self.max_seen = Some(id);
                self.slots.iter_mut().for_each(|slot| *slot = false);
                self.slots[self.slot_index(id)] = true;
                Ok(())
            }
            Some(max_seen) if id > max_seen => {
                let shift = (id - max_seen) as usize;
                if shift >= self.window_size {
                    self.slots.iter_mut().for_each(|slot| *slot = false);
                } else {
                    // The new high-water mark vacates every slot strictly between
                    // the old and new mark (each one fell outside the window).
                    for offset in 1..shift {
                        let vacated = max_seen.wrapping_add(offset as u32);
                        self.slots[self.slot_index(vacated)] = false;
                    }
                }
                self.max_seen = Some(id);
                self.slots[self.slot_index(id)] = true;
                Ok(())
            }
            Some(max_seen) => {
                if id <= max_seen.saturating_sub(self.window_size as u32) {
                    return Err(NetworkError::Fatal(ErrorType::ReplayRejected));
                }

                let idx = self.slot_index(id);
                if self.slots[idx] {
                    return Err(NetworkError::Fatal(ErrorType::ReplayRejected));
                }

                self.slots[idx] = true;
                Ok(())
            }
        }
    }

    #[inline]
    pub fn max_seen(&self) -> Option<u32> {
        self.max_seen
    }
}

/// Magic number stamping a valid persistence record (spec §6).
const PERSIST_MAGIC: u32 = 0x5056_4944; // "PVID"
const PERSIST_RECORD_SIZE: usize = 16;

/// Additive (non-cryptographic) checksum over `magic || packet_id || epoch`, matching
/// the spec's "fixed-size record ... checksum mismatch ⇒ treat as empty" contract.
/// A cheap fold is sufficient here: the checksum only needs to detect torn/partial
/// writes from a previous crash, not adversarial tampering (that's the job of the
/// crypto envelope and tls-auth HMAC elsewhere in the wire protocol).
fn record_checksum(magic: u32, packet_id: u32, epoch: u32) -> u32 {
    magic
        .wrapping_add(packet_id.wrapping_mul(2654435761))
        .wrapping_add(epoch.wrapping_mul(0x9E3779B1))
}

/// Most-recently-accepted (sequence, epoch) checkpoint, flushed to disk at most once
/// per minute and on clean shutdown (spec §4.B persistence). On-disk layout is the
/// fixed-size record from spec §6: `{ magic(4), packet_id(4), epoch(4), checksum(4) }`.
pub struct PersistedState {
    path: PathBuf,
    last_flush: Option<SystemTime>,
    flush_interval: Duration,
}

const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;

impl PersistedState {
    pub fn new<P: AsRef<Path>>(path: P) -> PersistedState {
        PersistedState {
            path: path.as_ref().to_path_buf(),
            last_flush: None,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }

    /// Loads the stored (sequence, epoch) checkpoint, if the file exists and is
    /// well-formed. Missing files, malformed records, and checksum mismatches are
    /// all treated as "no prior state" (cold start), per spec §6.
    pub fn load(&self) -> Option<(u32, u32)> {
        let mut file = fs::File::open(&self.path).ok()?;
        let mut buf = [0u8; PERSIST_RECORD_SIZE];
        file.read_exact(&mut buf).ok()?;

        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let sequence = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let epoch = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let checksum = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if magic != PERSIST_MAGIC || checksum != record_checksum(magic, sequence, epoch) {
            return None;
        }

        Some((sequence, epoch))
    }

    /// Flushes unconditionally, e.g. at clean shutdown. Writes via a temp file and
    /// atomic rename so a crash mid-write never truncates the existing record (spec
    /// §6: "only written with valid content; never truncated on failure").
    pub fn flush(&mut self, sequence: u32, epoch: u32) -> io::Result<()> {
        let checksum = record_checksum(PERSIST_MAGIC, sequence, epoch);

        let mut buf = [0u8; PERSIST_RECORD_SIZE];
        buf[0..4].copy_from_slice(&PERSIST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&sequence.to_be_bytes());
        buf[8..12].copy_from_slice(&epoch.to_be_bytes());
        buf[12..16].copy_from_slice(&checksum.to_be_bytes());

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.last_flush = Some(SystemTime::now());
        Ok(())
    }

    /// Flushes only if at least `flush_interval` has elapsed since the last flush
    /// (spec §4.B: "at most once per minute").
    pub fn maybe_flush(&mut self, sequence: u32, epoch: u32, now: SystemTime) -> io::Result<bool> {
        let due = match self.last_flush {
            None => true,
            Some(last) => now.duration_since(last).unwrap_or(Duration::ZERO) >= self.flush_interval,
        };

        if due {
            self.flush(sequence, epoch)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[inline]
pub fn now_epoch32() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}
