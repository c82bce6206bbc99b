//! Reliability layer for the control channel (spec §4.C): a fixed-capacity send ring
//! with exponential-backoff retransmission, and a fixed-capacity receive ring that
//! only releases packets to the TLS consumer in strict packet-id order.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_SEND_RING_CAPACITY: usize = 4;
pub const DEFAULT_RECV_RING_CAPACITY: usize = 8;
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_ACKS_PER_PACKET: usize = 4;

/// One outstanding sent packet awaiting acknowledgement.
struct SendSlot {
    packet_id: u32,
    payload: Vec<u8>,
    next_retransmit_at: Instant,
    timeout: Duration,
}

/// Fixed-capacity send ring with exponential backoff (spec §4.C: "if a send-ring
/// entry has not been acknowledged by its `next_retransmit_at`, it is retransmitted
/// and its deadline doubled").
pub struct SendRing {
    capacity: usize,
    slots: VecDeque<SendSlot>,
    initial_timeout: Duration,
    max_timeout: Duration,
}

impl SendRing {
    pub fn new(capacity: usize) -> SendRing {
        SendRing {
            capacity,
            slots: VecDeque::with_capacity(capacity),
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
            max_timeout: Duration::from_secs(60),
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Queues a freshly-sent packet. Returns `Err(())` if the ring is full — the
    /// caller must wait for an ACK to free a slot before sending more.
    pub fn push(&mut self, packet_id: u32, payload: Vec<u8>, now: Instant) -> Result<(), ()> {
        if self.is_full() {
            return Err(());
        }

        self.slots.push_back(SendSlot {
            packet_id,
            payload,
            next_retransmit_at: now + self.initial_timeout,
            timeout: self.initial_timeout,
        });
        Ok(())
    }

    /// Removes every slot whose packet-id is in `acked`, freeing capacity.
    pub fn acknowledge(&mut self, acked: &[u32]) {
        self.slots.retain(|slot| !acked.contains(&slot.packet_id));
    }

    /// Returns the payloads of every slot due for retransmission at `now`, doubling
    /// each one's deadline (capped at `max_timeout`).
    pub fn due_for_retransmit(&mut self, now: Instant) -> Vec<(u32, Vec<u8>)> {
        let mut due = Vec::new();

        for slot in self.slots.iter_mut() {
            if now >= slot.next_retransmit_at {
                due.push((slot.packet_id, slot.payload.clone()));
                slot.timeout = (slot.timeout * 2).min(self.max_timeout);
                slot.next_retransmit_at = now + slot.timeout;
            }
        }

        due
    }

    /// Earliest `next_retransmit_at` across all outstanding slots, for the fine
    /// timer plane (spec §4.G).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().map(|slot| slot.next_retransmit_at).min()
    }
}

enum RecvSlot {
    Empty,
    Occupied(u32, Vec<u8>),
}

/// Fixed-capacity receive ring that only releases packets in strict packet-id order
/// (spec §4.C: "out-of-order packets occupy a ring slot but are not consumed until
/// the gap fills").
pub struct RecvRing {
    capacity: usize,
    slots: Vec<RecvSlot>,
    next_expected: u32,
    pending_acks: VecDeque<u32>,
}

impl RecvRing {
    pub fn new(capacity: usize) -> RecvRing {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || RecvSlot::Empty);

        RecvRing {
            capacity,
            slots,
            next_expected: 0,
            pending_acks: VecDeque::new(),
        }
    }

    /// Admits an incoming packet. Returns `false` (refused, per spec §4.C
    /// "Admission") if accepting it would place it farther than ring capacity ahead
    /// of the last released id — the peer is expected to retransmit.
    pub fn admit(&mut self, packet_id: u32, payload: Vec<u8>) -> bool {
        if packet_id < self.next_expected {
            // Already released; this is a redundant retransmit. ACK it again but
            // otherwise discard.
            self.pending_acks.push_back(packet_id);
            return true;
        }

        let slot_offset = (packet_id - self.next_expected) as usize;
        if slot_offset >= self.capacity {
            return false;
        }

        let idx = (packet_id as usize) % self.capacity;
        self.slots[idx] = RecvSlot::Occupied(packet_id, payload);
        self.pending_acks.push_back(packet_id);
        true
    }

    /// Drains every packet now releasable in order, advancing `next_expected` as far
    /// as the contiguous run of filled slots allows.
    pub fn release_ready(&mut self) -> Vec<Vec<u8>> {
        let mut released = Vec::new();

        loop {
            let idx = (self.next_expected as usize) % self.capacity;
            match std::mem::replace(&mut self.slots[idx], RecvSlot::Empty) {
                RecvSlot::Occupied(id, payload) if id == self.next_expected => {
                    released.push(payload);
                    self.next_expected = self.next_expected.wrapping_add(1);
                }
                other => {
                    self.slots[idx] = other;
                    break;
                }
            }
        }

        released
    }

    /// Drains up to [`MAX_ACKS_PER_PACKET`] pending ack ids to piggyback on the next
    /// outgoing control packet.
    pub fn drain_acks(&mut self) -> Vec<u32> {
        let mut acks = Vec::with_capacity(MAX_ACKS_PER_PACKET);
        for _ in 0..MAX_ACKS_PER_PACKET {
            match self.pending_acks.pop_front() {
                Some(id) => acks.push(id),
                None => break,
            }
        }
        acks
    }

    #[inline]
    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_ring_rejects_push_past_capacity() {
        let mut ring = SendRing::new(2);
        let now = Instant::now();

        assert!(ring.push(0, vec![1], now).is_ok());
        assert!(ring.push(1, vec![2], now).is_ok());
        assert!(ring.push(2, vec![3], now).is_err());
    }

    #[test]
    fn test_send_ring_acknowledge_frees_capacity() {
        let mut ring = SendRing::new(2);
        let now = Instant::now();

        ring.push(0, vec![1], now).unwrap();
        ring.push(1, vec![2], now).unwrap();
        ring.acknowledge(&[0]);

        assert_eq!(ring.len(), 1);
        assert!(ring.push(2, vec![3], now).is_ok());
    }

    #[test]
    fn test_send_ring_retransmit_doubles_timeout() {
        let mut ring = SendRing::new(1);
        let now = Instant::now();
        ring.push(7, vec![9], now).unwrap();

        let due_at_t1 = ring.due_for_retransmit(now + DEFAULT_INITIAL_TIMEOUT);
        assert_eq!(due_at_t1.len(), 1);
        assert_eq!(due_at_t1[0].0, 7);

        // Immediately after, it should not be due again until the doubled timeout.
        let due_immediately = ring.due_for_retransmit(now + DEFAULT_INITIAL_TIMEOUT);
        assert!(due_immediately.is_empty());

        let due_at_t2 = ring.due_for_retransmit(now + DEFAULT_INITIAL_TIMEOUT * 3);
        assert_eq!(due_at_t2.len(), 1);
    }

    #[test]
    fn test_recv_ring_releases_in_order() {
        let mut ring = RecvRing::new(4);

        assert!(ring.admit(1, vec![1]));
        assert!(ring.admit(2, vec![2]));
        // Gap at 0: nothing releases yet.
        assert!(ring.release_ready().is_empty());

        assert!(ring.admit(0, vec![0]));
        let released = ring.release_ready();
        assert_eq!(released, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_recv_ring_refuses_too_far_ahead() {
        let mut ring = RecvRing::new(2);
        assert!(ring.admit(0, vec![0]));
        assert!(ring.admit(1, vec![1]));
        // 2 slots ahead of next_expected (0) exceeds capacity 2.
        assert!(!ring.admit(2, vec![2]));
    }

    #[test]
    fn test_recv_ring_drain_acks_caps_at_four() {
        let mut ring = RecvRing::new(8);
        for id in 0..6 {
            ring.admit(id, vec![id as u8]);
        }

        let first_batch = ring.drain_acks();
        assert_eq!(first_batch.len(), MAX_ACKS_PER_PACKET);

        let second_batch = ring.drain_acks();
        assert_eq!(second_batch.len(), 2);
        assert!(!ring.has_pending_acks());
    }
}
