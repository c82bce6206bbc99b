//! Peer-mode I/O event loop (spec §4.H), adapted from the teacher's
//! `neutronium::net::endpoint::Endpoint`: a single `mio::Poll` driving one tunnel
//! instance, one action per iteration, fairness enforced by construction.

use crate::shaper::Shaper;
use crate::signal::SignalSource;
use crate::timers::CoarseTimer;
use flux::logging::{self, Logger};
use mio::{Events, Poll, PollOpt, Ready, Token};
use rand::rngs::ThreadRng;
use std::time::{Duration, Instant};

const TOKEN_ENDPOINT: Token = Token(0);
const TOKEN_TUN: Token = Token(1);

const SENTINEL_TIMEOUT: Duration = Duration::from_secs(3600);

/// What the loop should do next, decided once per iteration and acted on exactly
/// once (spec §4.H step 9: "at most one of the following fires").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    EndpointWrite,
    TunWrite,
    EndpointRead,
    TunRead,
    Signal,
    None,
}

/// Tracks the two pending-output flags the loop's wait mask is built from.
#[derive(Default)]
pub struct PendingOutput {
    pub to_link: bool,
    pub to_tun: bool,
}

impl PendingOutput {
    /// Builds the readiness interest set for this iteration (spec §4.H step 7).
    pub fn wait_mask(&self, fragment_pending: bool) -> (Ready, Ready) {
        let endpoint_interest = if self.to_link {
            Ready::writable()
        } else {
            Ready::readable()
        };

        let tun_interest = if self.to_tun {
            Ready::writable()
        } else if self.to_link && !fragment_pending {
            Ready::readable()
        } else if !self.to_link {
            Ready::readable()
        } else {
            Ready::empty()
        };

        (endpoint_interest, tun_interest)
    }
}

/// One full iteration of the peer-mode loop body (spec §4.H steps 1-9), excluding
/// the actual select call, which the caller drives via `Poll`/`Events`.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    coarse: CoarseTimer,
    shaper: Shaper,
    signals: SignalSource,
    rng: ThreadRng,
    log: Logger,
}

impl EventLoop {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(shaper_rate: u64, now: Instant, log: L) -> std::io::Result<EventLoop> {
        let loop_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            coarse: CoarseTimer::new(now),
            shaper: Shaper::new(shaper_rate, now),
            signals: SignalSource::new()?,
            rng: rand::thread_rng(),
            log: loop_log,
        })
    }

    pub fn register_endpoint<E: mio::Evented>(&self, source: &E) -> std::io::Result<()> {
        self.poll
            .register(source, TOKEN_ENDPOINT, Ready::readable(), PollOpt::edge())
    }

    pub fn register_tun<E: mio::Evented>(&self, source: &E) -> std::io::Result<()> {
        self.poll
            .register(source, TOKEN_TUN, Ready::readable(), PollOpt::edge())
    }

    pub fn reregister_endpoint<E: mio::Evented>(&self, source: &E, interest: Ready) -> std::io::Result<()> {
        self.poll.reregister(source, TOKEN_ENDPOINT, interest, PollOpt::edge())
    }

    pub fn reregister_tun<E: mio::Evented>(&self, source: &E, interest: Ready) -> std::io::Result<()> {
        self.poll.reregister(source, TOKEN_TUN, interest, PollOpt::edge())
    }

    /// Runs steps 1, 2, 6, 8 of spec §4.H: computes the select timeout (coarse tick
    /// clamped in, jitter added) and blocks in `Poll::poll` for at most that long.
    /// `fine_deadlines` are this iteration's outstanding retransmit/fragment/shaper
    /// wakeups.
    pub fn select(&mut self, now: Instant, fine_deadlines: &[Instant]) -> std::io::Result<bool> {
        let coarse_due = self.coarse.next_due();
        let shaper_wait = now + self.shaper.wait(now);

        let mut deadlines: Vec<Instant> = fine_deadlines.to_vec();
        deadlines.push(shaper_wait);

        let timeout = crate::timers::compute_timeout(now, &deadlines, coarse_due, SENTINEL_TIMEOUT, &mut self.rng);

        logging::trace!(self.log, "blocking in poll"; "context" => "select", "timeout" => ?timeout);

        self.poll.poll(&mut self.events, Some(timeout))?;

        let woke = !self.events.is_empty();
        logging::trace!(self.log, "poll returned"; "context" => "select", "woke" => woke, "event_count" => self.events.iter().count());

        Ok(woke)
    }

    /// Step 2: whether a coarse tick is due this iteration.
    pub fn coarse_due(&mut self, now: Instant) -> bool {
        self.coarse.poll(now)
    }

    /// Step 9: decides which single action fires, in priority order
    /// (endpoint-write, tun-write, endpoint-read, tun-read), given which readiness
    /// events actually arrived.
    pub fn decide_action(&self, pending: &PendingOutput) -> LoopAction {
        let action = self.decide_action_inner(pending);
        logging::trace!(self.log, "action decided"; "context" => "decide_action", "action" => ?action);
        action
    }

    fn decide_action_inner(&self, pending: &PendingOutput) -> LoopAction {
        for event in self.events.iter() {
            let is_endpoint = event.token() == TOKEN_ENDPOINT;
            let is_tun = event.token() == TOKEN_TUN;

            if is_endpoint && event.readiness().is_writable() && pending.to_link {
                return LoopAction::EndpointWrite;
            }
            if is_tun && event.readiness().is_writable() && pending.to_tun {
                return LoopAction::TunWrite;
            }
        }

        for event in self.events.iter() {
            if event.token() == TOKEN_ENDPOINT && event.readiness().is_readable() {
                return LoopAction::EndpointRead;
            }
        }

        for event in self.events.iter() {
            if event.token() == TOKEN_TUN && event.readiness().is_readable() {
                return LoopAction::TunRead;
            }
        }

        LoopAction::None
    }

    pub fn poll_signals(&mut self) -> Vec<crate::signal::SignalInfo> {
        let signals = self.signals.poll();
        if !signals.is_empty() {
            logging::debug!(self.log, "signals received"; "context" => "poll_signals", "count" => signals.len());
        }
        signals
    }

    pub fn shaper_mut(&mut self) -> &mut Shaper {
        &mut self.shaper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_mask_prefers_writable_when_output_pending() {
        let pending = PendingOutput {
            to_link: true,
            to_tun: false,
        };

        let (endpoint_interest, tun_interest) = pending.wait_mask(false);
        assert!(endpoint_interest.is_writable());
        assert!(tun_interest.is_readable());
    }

    #[test]
    fn test_wait_mask_suppresses_tun_read_when_fragment_pending() {
        let pending = PendingOutput {
            to_link: true,
            to_tun: false,
        };

        let (_, tun_interest) = pending.wait_mask(true);
        assert!(tun_interest.is_empty());
    }

    #[test]
    fn test_wait_mask_defaults_to_readable_both_sides() {
        let pending = PendingOutput::default();
        let (endpoint_interest, tun_interest) = pending.wait_mask(false);

        assert!(endpoint_interest.is_readable());
        assert!(tun_interest.is_readable());
    }
}
