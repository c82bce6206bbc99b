//! Fragmentation and reassembly (spec §4.F): outgoing datagrams larger than the link
//! MTU are split into `{ fragment_id(16) || which(8) || size }`-tagged fragments; the
//! receiver holds a fixed number of reassembly slots keyed by `fragment_id`, each
//! with its own deadline.

use std::time::{Duration, Instant};

pub const FRAGMENT_HEADER_SIZE: usize = 2 + 1 + 2;
pub const DEFAULT_REASSEMBLY_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_SLOT_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Mid,
    Last,
}

impl Which {
    #[inline]
    fn to_byte(self) -> u8 {
        match self {
            Which::Mid => 0,
            Which::Last => 1,
        }
    }

    #[inline]
    fn from_byte(byte: u8) -> Which {
        if byte == 1 {
            Which::Last
        } else {
            Which::Mid
        }
    }
}

/// Splits `payload` into wire-ready fragments, each no larger than `max_fragment_size`
/// of payload bytes plus the fixed fragment header.
pub fn split(fragment_id: u16, payload: &[u8], max_fragment_size: usize) -> Vec<Vec<u8>> {
    assert!(max_fragment_size > 0);

    let mut fragments = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let end = (offset + max_fragment_size).min(payload.len());
        let chunk = &payload[offset..end];
        let which = if end == payload.len() { Which::Last } else { Which::Mid };

        let mut out = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
        out.extend_from_slice(&fragment_id.to_be_bytes());
        out.push(which.to_byte());
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);

        fragments.push(out);
        offset = end;
    }

    fragments
}

struct ParsedFragment<'a> {
    fragment_id: u16,
    which: Which,
    data: &'a [u8],
}

fn parse(wire: &[u8]) -> Option<ParsedFragment<'_>> {
    if wire.len() < FRAGMENT_HEADER_SIZE {
        return None;
    }

    let fragment_id = u16::from_be_bytes([wire[0], wire[1]]);
    let which = Which::from_byte(wire[2]);
    let size = u16::from_be_bytes([wire[3], wire[4]]) as usize;

    if wire.len() < FRAGMENT_HEADER_SIZE + size {
        return None;
    }

    Some(ParsedFragment {
        fragment_id,
        which,
        data: &wire[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + size],
    })
}

struct ReassemblySlot {
    fragment_id: u16,
    buffer: Vec<u8>,
    complete: bool,
    deadline: Instant,
}

/// Fixed number of in-flight reassembly slots, each evicted independently once its
/// deadline expires (spec §4.F).
pub struct Reassembler {
    slots: Vec<Option<ReassemblySlot>>,
    deadline: Duration,
}

impl Reassembler {
    pub fn new(slot_count: usize) -> Reassembler {
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, || None);

        Reassembler {
            slots,
            deadline: DEFAULT_REASSEMBLY_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Reassembler {
        self.deadline = deadline;
        self
    }

    fn slot_for(&mut self, fragment_id: u16, now: Instant) -> usize {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.fragment_id == fragment_id))
        {
            return idx;
        }

        // Prefer an empty slot; otherwise evict the slot with the earliest deadline
        // (oldest fragment in flight loses its place to a new fragment_id).
        if let Some(idx) = self.slots.iter().position(|slot| slot.is_none()) {
            self.slots[idx] = Some(ReassemblySlot {
                fragment_id,
                buffer: Vec::new(),
                complete: false,
                deadline: now + self.deadline,
            });
            return idx;
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.as_ref().unwrap().deadline)
            .map(|(idx, _)| idx)
            .expect("at least one slot exists");

        self.slots[victim] = Some(ReassemblySlot {
            fragment_id,
            buffer: Vec::new(),
            complete: false,
            deadline: now + self.deadline,
        });
        victim
    }

    /// Feeds one fragment in. Returns the fully reassembled payload once the
    /// terminating (`Last`) fragment for its `fragment_id` arrives.
    pub fn ingest(&mut self, wire: &[u8], now: Instant) -> Option<Vec<u8>> {
        self.evict_expired(now);

        let parsed = parse(wire)?;
        let idx = self.slot_for(parsed.fragment_id, now);
        let slot = self.slots[idx].as_mut().unwrap();

        slot.buffer.extend_from_slice(parsed.data);
        if parsed.which == Which::Last {
            slot.complete = true;
        }

        if slot.complete {
            let slot = self.slots[idx].take().unwrap();
            Some(slot.buffer)
        } else {
            None
        }
    }

    /// Evicts slots whose deadline has passed, dropping their partial content
    /// (spec §4.F: "slots whose deadline expires are evicted and their partial
    /// content dropped").
    pub fn evict_expired(&mut self, now: Instant) {
        for slot in self.slots.iter_mut() {
            if let Some(s) = slot {
                if now >= s.deadline {
                    *slot = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_reassemble_roundtrip() {
        let payload: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let fragments = split(7, &payload, 100);
        assert_eq!(fragments.len(), 3);

        let mut reassembler = Reassembler::new(DEFAULT_SLOT_COUNT);
        let now = Instant::now();

        assert!(reassembler.ingest(&fragments[0], now).is_none());
        assert!(reassembler.ingest(&fragments[1], now).is_none());
        let result = reassembler.ingest(&fragments[2], now).unwrap();

        assert_eq!(result, payload);
    }

    #[test]
    fn test_single_fragment_payload() {
        let payload = b"short".to_vec();
        let fragments = split(1, &payload, 1500);
        assert_eq!(fragments.len(), 1);

        let mut reassembler = Reassembler::new(DEFAULT_SLOT_COUNT);
        let result = reassembler.ingest(&fragments[0], Instant::now()).unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn test_interleaved_fragment_ids() {
        let a = split(1, b"aaaaaaaaaa", 4);
        let b = split(2, b"bbbbbbbbbb", 4);

        let mut reassembler = Reassembler::new(DEFAULT_SLOT_COUNT);
        let now = Instant::now();

        assert!(reassembler.ingest(&a[0], now).is_none());
        assert!(reassembler.ingest(&b[0], now).is_none());
        assert!(reassembler.ingest(&a[1], now).is_none());
        assert!(reassembler.ingest(&b[1], now).is_none());

        let result_a = reassembler.ingest(&a[2], now).unwrap();
        let result_b = reassembler.ingest(&b[2], now).unwrap();

        assert_eq!(result_a, b"aaaaaaaaaa");
        assert_eq!(result_b, b"bbbbbbbbbb");
    }

    #[test]
    fn test_expired_slot_drops_partial_content() {
        let fragments = split(9, b"0123456789", 4);
        let mut reassembler = Reassembler::new(DEFAULT_SLOT_COUNT).with_deadline(Duration::from_secs(1));
        let now = Instant::now();

        assert!(reassembler.ingest(&fragments[0], now).is_none());

        // Past the deadline, the slot is evicted before the final fragment arrives,
        // so the same fragment_id starts a brand new (empty) reassembly.
        let later = now + Duration::from_secs(2);
        let result = reassembler.ingest(&fragments[2], later);
        assert!(result.is_none());
    }

    #[test]
    fn test_slot_eviction_when_all_occupied() {
        let mut reassembler = Reassembler::new(2);
        let now = Instant::now();

        let f1 = split(1, b"111", 1);
        let f2 = split(2, b"222", 10);
        let f3 = split(3, b"333", 10);

        reassembler.ingest(&f1[0], now);
        reassembler.ingest(&f2[0], now + Duration::from_millis(10));
        // Slot 1 (oldest deadline) gets evicted to make room for fragment_id 3.
        reassembler.ingest(&f3[0], now + Duration::from_millis(20));

        // fragment_id 1's original slot is gone; a mid-fragment for it now starts a
        // brand new (incomplete) reassembly rather than resuming the evicted one.
        let result = reassembler.ingest(&f1[1], now + Duration::from_millis(30));
        assert!(result.is_none());
    }
}
