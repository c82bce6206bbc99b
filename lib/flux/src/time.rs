use std::time::SystemTime;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current unix timestamp truncated to a 32-bit epoch, as carried in the
/// long-form packet-ID wire field (spec §4.B).
#[inline]
pub fn timestamp_epoch32() -> u32 {
    timestamp_secs() as u32
}
