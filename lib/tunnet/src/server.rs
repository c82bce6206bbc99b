//! Server multiplex engine (spec §4.J): real-address and virtual-address hash
//! tables, a per-instance schedule, the bounded TCP deferred queue, and the bucketed
//! instance reaper. Virtual-address keys follow `original_source/mroute.h`'s
//! `{ Ipv4([u8;4]), Ether([u8;6]) }` shape.

use flux::logging::{self, Logger};
use hashbrown::HashMap;
use std::collections::{BinaryHeap, VecDeque};
use std::cmp::Reverse;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A real (network-layer) address identifying an inbound datagram's source, or a
/// TCP connection's peer.
pub type RealAddr = SocketAddr;

/// A virtual (tunneled L2/L3) address, keyed either by MAC or IPv4 (spec §4.J,
/// `original_source/mroute.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualAddr {
    Ipv4([u8; 4]),
    Ether([u8; 6]),
}

pub type ClientId = u32;

/// Minimal bitflags-without-the-crate helper: the teacher's dependency stack favors
/// small hand-rolled bit twiddling over pulling in `bitflags` for a two-bit set.
macro_rules! bitflags_like {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(u8);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn empty() -> $name {
                $name(0)
            }

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Route table entry flags (spec §4.J).
    RouteFlags {
        CACHE = 0b01,
        AGEABLE = 0b10,
    }
}

/// One entry in the virtual-address hash.
pub struct Route {
    pub owner: ClientId,
    pub flags: RouteFlags,
    pub cache_generation: u64,
    pub last_reference: Instant,
    pub ttl: Duration,
}

/// TCP-only bounded per-instance outgoing queue (spec §4.J "Outbound queue").
pub struct DeferredQueue {
    capacity: usize,
    queue: VecDeque<Vec<u8>>,
    pub dropped: u64,
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> DeferredQueue {
        DeferredQueue {
            capacity,
            queue: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Pushes a packet; on overflow the oldest is dropped and counted (spec §4.J).
    pub fn push(&mut self, packet: Vec<u8>) {
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(packet);
    }

    pub fn pop_head(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// `tcp_rwflags` mirrors non-emptiness: write-interest when nonempty,
    /// read-interest when empty (spec §4.J).
    #[inline]
    pub fn wants_write(&self) -> bool {
        !self.is_empty()
    }
}

/// One connected client's per-instance state relevant to the multiplex engine
/// (session/crypto state lives in `tunnet::session`).
pub struct ClientInstance {
    pub id: ClientId,
    pub real_addr: RealAddr,
    pub deferred: DeferredQueue,
    pub wakeup_at: Instant,
    log: Logger,
}

#[derive(PartialEq, Eq)]
struct ScheduleEntry {
    wakeup_at: Reverse<Instant>,
    client_id: ClientId,
}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.wakeup_at.cmp(&other.wakeup_at)
    }
}

/// Rate limiter bounding new-connection frequency, from `original_source/multi.c`
/// (supplemented per SPEC_FULL.md §11): a token bucket over connection attempts
/// rather than bytes.
pub struct ConnectionRateLimiter {
    max_per_window: u32,
    window: Duration,
    attempts: VecDeque<Instant>,
}

impl ConnectionRateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> ConnectionRateLimiter {
        ConnectionRateLimiter {
            max_per_window,
            window,
            attempts: VecDeque::new(),
        }
    }

    /// Records a new-connection attempt at `now`; returns `false` if it should be
    /// rejected for exceeding the configured rate.
    pub fn admit(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.attempts.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }

        if self.attempts.len() as u32 >= self.max_per_window {
            return false;
        }

        self.attempts.push_back(now);
        true
    }
}

/// One packet queued for client-to-client broadcast, refcounted across every
/// instance it is still pending delivery to (SPEC_FULL.md §11, `original_source/mbuf.c`'s
/// `mbuf_buffer { refcount }`). A shared `Rc` stands in for the C refcount: dropping
/// the last clone frees the payload.
pub type MulticastBuffer = std::rc::Rc<Vec<u8>>;

/// Bounded ring of `(recipient, buffer)` pairs awaiting delivery to client
/// instances (`mbuf.c`'s `mbuf_set`). On overflow the oldest entry is dropped,
/// matching `mbuf_add_item`'s eviction.
pub struct MulticastQueue {
    capacity: usize,
    items: VecDeque<(ClientId, MulticastBuffer)>,
    pub dropped: u64,
}

impl MulticastQueue {
    pub fn new(capacity: usize) -> MulticastQueue {
        MulticastQueue {
            capacity,
            items: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Fans a buffer out to every recipient in `recipients`, refcounting the shared
    /// payload rather than copying it per recipient.
    pub fn broadcast(&mut self, payload: Vec<u8>, recipients: impl IntoIterator<Item = ClientId>) {
        let shared = std::rc::Rc::new(payload);
        for recipient in recipients {
            self.push(recipient, shared.clone());
        }
    }

    fn push(&mut self, recipient: ClientId, buffer: MulticastBuffer) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back((recipient, buffer));
    }

    /// Drops every queued entry addressed to `recipient` (`mbuf_dereference`, used
    /// when an instance halts while broadcasts to it are still in flight).
    pub fn dereference(&mut self, recipient: ClientId) {
        self.items.retain(|(id, _)| *id != recipient);
    }

    pub fn pop_for(&mut self, recipient: ClientId) -> Option<MulticastBuffer> {
        let position = self.items.iter().position(|(id, _)| *id == recipient)?;
        Some(self.items.remove(position).unwrap().1)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Dispatch tag for the server TCP action machine (spec §4.J): each I/O-ready event
/// starts in `Initial` and each step may produce a follow-on action until none is
/// producible without another `select` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpAction {
    Initial,
    SocketRead,
    SocketReadResidual,
    SocketWrite,
    SocketWriteReady,
    SocketWriteDeferred,
    TunRead,
    TunWrite,
    Timeout,
}

/// What the action loop should do once it has dispatched the current tag: either
/// stop (no action producible without another select) or chain into the next tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpActionResult {
    Done,
    Chain(TcpAction),
}

/// Per-instance hints the action machine consults to decide follow-on actions:
/// whether the instance has bytes still buffered from the socket (residual),
/// whether it has a tun-bound packet ready, and whether its deferred queue is
/// nonempty.
#[derive(Default, Clone, Copy)]
pub struct TcpActionHints {
    pub residual_pending: bool,
    pub tun_output_pending: bool,
    pub deferred_nonempty: bool,
}

/// Advances the TCP server action machine by one step (spec §4.J "TCP server action
/// machine"). `hints` must reflect instance state *after* the side effects of
/// `action` have already been carried out by the caller; this function only decides
/// what runs next.
pub fn tcp_action_step(action: TcpAction, hints: TcpActionHints) -> TcpActionResult {
    match action {
        TcpAction::Initial => TcpActionResult::Chain(TcpAction::SocketRead),
        TcpAction::SocketRead => {
            if hints.residual_pending {
                TcpActionResult::Chain(TcpAction::SocketReadResidual)
            } else if hints.tun_output_pending {
                TcpActionResult::Chain(TcpAction::TunWrite)
            } else {
                TcpActionResult::Done
            }
        }
        TcpAction::SocketReadResidual => {
            if hints.tun_output_pending {
                TcpActionResult::Chain(TcpAction::TunWrite)
            } else {
                TcpActionResult::Done
            }
        }
        TcpAction::TunRead => {
            if hints.deferred_nonempty {
                TcpActionResult::Chain(TcpAction::SocketWrite)
            } else {
                TcpActionResult::Done
            }
        }
        TcpAction::SocketWrite => {
            if hints.deferred_nonempty {
                TcpActionResult::Chain(TcpAction::SocketWriteDeferred)
            } else {
                TcpActionResult::Done
            }
        }
        TcpAction::SocketWriteReady => TcpActionResult::Chain(TcpAction::SocketWriteDeferred),
        TcpAction::SocketWriteDeferred | TcpAction::TunWrite | TcpAction::Timeout => TcpActionResult::Done,
    }
}

const DEFAULT_REAP_MAX_WAKEUP: Duration = Duration::from_secs(10);

/// Top-level server multiplex state: the two hash tables, the per-instance
/// schedule, and reaper bucket cursor.
pub struct Multiplexer {
    real_address_hash: HashMap<RealAddr, ClientId>,
    virtual_address_hash: HashMap<VirtualAddr, Route>,
    instances: HashMap<ClientId, ClientInstance>,
    schedule: BinaryHeap<ScheduleEntry>,
    next_client_id: ClientId,
    cache_generation: u64,
    reap_bucket_cursor: usize,
    reap_bucket_count: usize,
    log: Logger,
}

impl Multiplexer {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(reap_bucket_count: usize, log: L) -> Multiplexer {
        let mux_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        Multiplexer {
            real_address_hash: HashMap::new(),
            virtual_address_hash: HashMap::new(),
            instances: HashMap::new(),
            schedule: BinaryHeap::new(),
            next_client_id: 0,
            cache_generation: 0,
            reap_bucket_cursor: 0,
            reap_bucket_count: reap_bucket_count.max(1),
            log: mux_log,
        }
    }

    /// Client creation for UDP (spec §4.J): allocates an instance for a real address
    /// not already present, inserting it into the real-address hash and schedule.
    /// Callers are expected to have already verified the datagram is a hard-reset
    /// and checked the rate limiter.
    pub fn create_instance(&mut self, real_addr: RealAddr, now: Instant, deferred_capacity: usize) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;

        logging::debug!(self.log, "creating client instance";
                        "context" => "create_instance",
                        "client_id" => id,
                        "real_addr" => ?real_addr);

        self.real_address_hash.insert(real_addr, id);
        self.instances.insert(
            id,
            ClientInstance {
                id,
                real_addr,
                deferred: DeferredQueue::new(deferred_capacity),
                wakeup_at: now,
                log: self.log.new(logging::o!("client_id" => id, "real_addr" => format!("{:?}", real_addr))),
            },
        );
        self.schedule.push(ScheduleEntry {
            wakeup_at: Reverse(now),
            client_id: id,
        });

        id
    }

    /// TCP client creation: preempts any pre-existing instance bound to the same
    /// source (spec §4.J: "the real-address hash resolves conflicts by preempting
    /// any pre-existing instance for the same source").
    pub fn create_instance_tcp(&mut self, real_addr: RealAddr, now: Instant, deferred_capacity: usize) -> ClientId {
        if let Some(&existing) = self.real_address_hash.get(&real_addr) {
            self.remove_instance(existing);
        }
        self.create_instance(real_addr, now, deferred_capacity)
    }

    pub fn lookup_by_real_addr(&self, real_addr: &RealAddr) -> Option<ClientId> {
        self.real_address_hash.get(real_addr).copied()
    }

    pub fn lookup_by_virtual_addr(&self, virtual_addr: &VirtualAddr) -> Option<ClientId> {
        self.virtual_address_hash
            .get(virtual_addr)
            .filter(|route| route.cache_generation == self.cache_generation || !route.flags.contains(RouteFlags::CACHE))
            .map(|route| route.owner)
    }

    pub fn learn_virtual_addr(&mut self, virtual_addr: VirtualAddr, owner: ClientId, flags: RouteFlags, ttl: Duration, now: Instant) {
        self.virtual_address_hash.insert(
            virtual_addr,
            Route {
                owner,
                flags,
                cache_generation: self.cache_generation,
                last_reference: now,
                ttl,
            },
        );
    }

    pub fn touch_route(&mut self, virtual_addr: &VirtualAddr, now: Instant) {
        if let Some(route) = self.virtual_address_hash.get_mut(virtual_addr) {
            route.last_reference = now;
        }
    }

    /// Bumps the cache generation, atomically invalidating every `CACHE`-flagged
    /// route (spec §4.J).
    pub fn bump_cache_generation(&mut self) {
        self.cache_generation += 1;
    }

    pub fn instance_mut(&mut self, id: ClientId) -> Option<&mut ClientInstance> {
        self.instances.get_mut(&id)
    }

    pub fn remove_instance(&mut self, id: ClientId) {
        if let Some(instance) = self.instances.remove(&id) {
            logging::debug!(instance.log, "client instance removed"; "context" => "remove_instance");
            self.real_address_hash.remove(&instance.real_addr);
        }
        self.virtual_address_hash.retain(|_, route| route.owner != id);
    }

    /// Scans one bucket of the virtual-address hash, evicting routes whose cache
    /// generation is stale or whose `last_reference` has exceeded their TTL (spec
    /// §4.J instance reaper). A full sweep completes over `reap_bucket_count` calls,
    /// each covering roughly `1/reap_bucket_count` of the table, bounding a full
    /// pass to within `REAP_MAX_WAKEUP`.
    pub fn reap_bucket(&mut self, now: Instant) -> usize {
        let bucket = self.reap_bucket_cursor;
        self.reap_bucket_cursor = (self.reap_bucket_cursor + 1) % self.reap_bucket_count;

        let cache_generation = self.cache_generation;
        let bucket_count = self.reap_bucket_count;

        let before = self.virtual_address_hash.len();
        self.virtual_address_hash.retain(|key, route| {
            let key_bucket = addr_bucket(key, bucket_count);
            if key_bucket != bucket {
                return true;
            }

            let stale_cache = route.flags.contains(RouteFlags::CACHE) && route.cache_generation != cache_generation;
            let expired_ttl = route.flags.contains(RouteFlags::AGEABLE)
                && now.saturating_duration_since(route.last_reference) > route.ttl;

            !(stale_cache || expired_ttl)
        });

        let evicted = before - self.virtual_address_hash.len();
        if evicted > 0 {
            logging::trace!(self.log, "reaped stale routes"; "context" => "reap_bucket", "bucket" => bucket, "evicted" => evicted);
        }

        evicted
    }

    #[inline]
    pub fn reap_interval(&self) -> Duration {
        DEFAULT_REAP_MAX_WAKEUP / self.reap_bucket_count as u32
    }
}

fn addr_bucket(addr: &VirtualAddr, bucket_count: usize) -> usize {
    let sum: usize = match addr {
        VirtualAddr::Ipv4(bytes) => bytes.iter().map(|&b| b as usize).sum(),
        VirtualAddr::Ether(bytes) => bytes.iter().map(|&b| b as usize).sum(),
    };
    sum % bucket_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> RealAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn test_create_and_lookup_instance() {
        let mut mux = Multiplexer::new(4, None);
        let now = Instant::now();
        let id = mux.create_instance(addr(1), now, 16);

        assert_eq!(mux.lookup_by_real_addr(&addr(1)), Some(id));
    }

    #[test]
    fn test_tcp_create_preempts_existing_instance() {
        let mut mux = Multiplexer::new(4, None);
        let now = Instant::now();
        let first = mux.create_instance_tcp(addr(1), now, 16);
        let second = mux.create_instance_tcp(addr(1), now, 16);

        assert_ne!(first, second);
        assert_eq!(mux.lookup_by_real_addr(&addr(1)), Some(second));
        assert!(mux.instance_mut(first).is_none());
    }

    #[test]
    fn test_virtual_addr_lookup_and_cache_invalidation() {
        let mut mux = Multiplexer::new(4, None);
        let now = Instant::now();
        let id = mux.create_instance(addr(1), now, 16);
        let vaddr = VirtualAddr::Ipv4([10, 0, 0, 5]);

        mux.learn_virtual_addr(vaddr, id, RouteFlags::CACHE, Duration::from_secs(60), now);
        assert_eq!(mux.lookup_by_virtual_addr(&vaddr), Some(id));

        mux.bump_cache_generation();
        assert_eq!(mux.lookup_by_virtual_addr(&vaddr), None);
    }

    #[test]
    fn test_deferred_queue_drops_oldest_on_overflow() {
        let mut queue = DeferredQueue::new(2);
        queue.push(vec![1]);
        queue.push(vec![2]);
        queue.push(vec![3]);

        assert_eq!(queue.dropped, 1);
        assert_eq!(queue.pop_head(), Some(vec![2]));
        assert_eq!(queue.pop_head(), Some(vec![3]));
    }

    #[test]
    fn test_connection_rate_limiter_admits_within_window() {
        let mut limiter = ConnectionRateLimiter::new(2, Duration::from_secs(1));
        let now = Instant::now();

        assert!(limiter.admit(now));
        assert!(limiter.admit(now));
        assert!(!limiter.admit(now));

        assert!(limiter.admit(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_multicast_queue_fans_out_with_shared_refcount() {
        let mut queue = MulticastQueue::new(8);
        queue.broadcast(vec![1, 2, 3], [10, 11, 12]);

        assert_eq!(queue.len(), 3);
        let a = queue.pop_for(11).unwrap();
        let b = queue.pop_for(10).unwrap();
        assert_eq!(&*a, &*b);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_multicast_queue_drops_oldest_on_overflow() {
        let mut queue = MulticastQueue::new(2);
        queue.broadcast(vec![1], [1]);
        queue.broadcast(vec![2], [2]);
        queue.broadcast(vec![3], [3]);

        assert_eq!(queue.dropped, 1);
        assert!(queue.pop_for(1).is_none());
    }

    #[test]
    fn test_multicast_queue_dereference_on_halt() {
        let mut queue = MulticastQueue::new(8);
        queue.broadcast(vec![9], [5, 6]);

        queue.dereference(5);

        assert!(queue.pop_for(5).is_none());
        assert!(queue.pop_for(6).is_some());
    }

    #[test]
    fn test_tcp_action_machine_chains_read_to_tun_write() {
        let hints = TcpActionHints {
            tun_output_pending: true,
            ..Default::default()
        };

        assert_eq!(
            tcp_action_step(TcpAction::Initial, hints),
            TcpActionResult::Chain(TcpAction::SocketRead)
        );
        assert_eq!(
            tcp_action_step(TcpAction::SocketRead, hints),
            TcpActionResult::Chain(TcpAction::TunWrite)
        );
        assert_eq!(tcp_action_step(TcpAction::TunWrite, hints), TcpActionResult::Done);
    }

    #[test]
    fn test_tcp_action_machine_terminates_with_no_followon() {
        let hints = TcpActionHints::default();
        assert_eq!(tcp_action_step(TcpAction::SocketRead, hints), TcpActionResult::Done);
    }

    #[test]
    fn test_reap_evicts_expired_ageable_route() {
        let mut mux = Multiplexer::new(1, None);
        let now = Instant::now();
        let id = mux.create_instance(addr(1), now, 16);
        let vaddr = VirtualAddr::Ipv4([10, 0, 0, 9]);

        mux.learn_virtual_addr(vaddr, id, RouteFlags::AGEABLE, Duration::from_secs(1), now);

        let evicted = mux.reap_bucket(now + Duration::from_secs(5));
        assert_eq!(evicted, 1);
        assert_eq!(mux.lookup_by_virtual_addr(&vaddr), None);
    }
}
