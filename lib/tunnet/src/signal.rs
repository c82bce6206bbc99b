//! External signal to abstract lifecycle condition mapping (spec §4.L), modeled on
//! `original_source/sig.h`'s `signal_info` struct. OS signal delivery itself is
//! handled by `signal-hook`; this module only owns the abstract taxonomy and the
//! explicit-exit-notify behavior built on top of it.

use signal_hook::iterator::Signals;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Abstract conditions signals map to (spec §4.L).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Retry with preserved transient state.
    SoftRestart,
    /// Reset level-1 state too, reread keys.
    HardRestart,
    Terminate,
}

/// Mirrors `original_source/sig.h`'s `signal_info { signal_received, hard }`: the
/// abstract kind plus whether it escalates to the "hard" variant of its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub kind: SignalKind,
    pub hard: bool,
}

impl SignalInfo {
    pub fn soft_restart() -> SignalInfo {
        SignalInfo {
            kind: SignalKind::SoftRestart,
            hard: false,
        }
    }

    pub fn hard_restart() -> SignalInfo {
        SignalInfo {
            kind: SignalKind::HardRestart,
            hard: true,
        }
    }

    pub fn terminate() -> SignalInfo {
        SignalInfo {
            kind: SignalKind::Terminate,
            hard: true,
        }
    }

    /// Fatal TLS errors in connection-oriented mode escalate to soft-restart rather
    /// than terminating (spec §4.L).
    pub fn from_fatal_tls_error(connection_oriented: bool) -> SignalInfo {
        if connection_oriented {
            SignalInfo::soft_restart()
        } else {
            SignalInfo::terminate()
        }
    }
}

fn map_os_signal(signal: i32) -> Option<SignalInfo> {
    match signal {
        signal_hook::SIGHUP => Some(SignalInfo::soft_restart()),
        signal_hook::SIGUSR1 => Some(SignalInfo::soft_restart()),
        signal_hook::SIGUSR2 => Some(SignalInfo::hard_restart()),
        signal_hook::SIGTERM | signal_hook::SIGINT => Some(SignalInfo::terminate()),
        _ => None,
    }
}

/// Registers the process-level handlers and exposes pending signals as
/// [`SignalInfo`] values via [`SignalSource::poll`], so the event loop (spec §4.H
/// step 7: "platform signal source is always waited on") can treat OS signals the
/// same as any other readiness source.
pub struct SignalSource {
    signals: Signals,
    shutdown: Arc<AtomicBool>,
}

impl SignalSource {
    pub fn new() -> io::Result<SignalSource> {
        let signals = Signals::new(&[
            signal_hook::SIGHUP,
            signal_hook::SIGUSR1,
            signal_hook::SIGUSR2,
            signal_hook::SIGTERM,
            signal_hook::SIGINT,
        ])?;

        Ok(SignalSource {
            signals,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Drains and maps all signals received since the last poll.
    pub fn poll(&mut self) -> Vec<SignalInfo> {
        self.signals
            .pending()
            .filter_map(map_os_signal)
            .inspect(|info| {
                if info.kind == SignalKind::Terminate {
                    self.shutdown.store(true, Ordering::SeqCst);
                }
            })
            .collect()
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// `explicit-exit-notify` support (spec §4.L): the opcode-carrying datagram is sent
/// `repeat_count` times before the process actually terminates, so the counterparty
/// restarts promptly instead of waiting for its ping timeout.
pub struct ExplicitExitNotify {
    remaining: u32,
}

impl ExplicitExitNotify {
    pub fn new(repeat_count: u32) -> ExplicitExitNotify {
        ExplicitExitNotify { remaining: repeat_count }
    }

    /// Returns `true` if another notify datagram should be sent, decrementing the
    /// remaining count.
    pub fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            false
        } else {
            self.remaining -= 1;
            true
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }
}
