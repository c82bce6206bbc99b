//! Session and key-negotiation state machine (spec §4.E): per-slot FSM, key-method-2
//! handshake messages, PRF-based key expansion, rekey policy, and server-side
//! session promotion. TLS byte plumbing itself lives in `tunnet::tls`; this module
//! owns the state around it.

use crate::support::{ErrorType, NetworkError, NetworkResult};
use flux::crypto::{self, KeyBlock};
use flux::logging::{self, Logger};
use flux::session::SessionId;
use std::time::{Duration, Instant};

pub const DEFAULT_HANDSHAKE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_TRANSITION_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Per key-slot FSM (spec §4.E states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Undef,
    Initial,
    PreStart,
    Start,
    SentKey,
    GotKey,
    Active,
    Normal,
    Error,
}

impl KeyState {
    #[inline]
    pub fn is_usable(self) -> bool {
        matches!(self, KeyState::Active | KeyState::Normal)
    }
}

/// Client random + optional pre-master material exchanged in a key-method-2 payload
/// (spec §4.E).
#[derive(Clone)]
pub struct KeyMethod2Payload {
    pub random: [u8; 64],
    pub pre_master: Option<[u8; crypto::MASTER_SECRET_SIZE]>,
    pub options: String,
}

impl KeyMethod2Payload {
    /// Serializes as `uint32 zero || uint8 method_flags || random(64) ||
    /// [pre_master(48) if present] || uint16 options_len || options`.
    pub fn encode(&self) -> Vec<u8> {
        let method_flags: u8 = if self.pre_master.is_some() { 1 } else { 0 };
        let options_bytes = self.options.as_bytes();

        let mut out = Vec::with_capacity(4 + 1 + 64 + 48 + 2 + options_bytes.len());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.push(method_flags);
        out.extend_from_slice(&self.random);
        if let Some(pre_master) = &self.pre_master {
            out.extend_from_slice(pre_master);
        }
        out.extend_from_slice(&(options_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(options_bytes);
        out
    }

    pub fn decode(buf: &[u8]) -> NetworkResult<KeyMethod2Payload> {
        if buf.len() < 4 + 1 + 64 + 2 {
            return Err(NetworkError::Fatal(ErrorType::Serialization));
        }

        let method_flags = buf[4];
        let mut cursor = 5usize;

        let mut random = [0u8; 64];
        random.copy_from_slice(&buf[cursor..cursor + 64]);
        cursor += 64;

        let pre_master = if method_flags & 1 != 0 {
            if buf.len() < cursor + crypto::MASTER_SECRET_SIZE {
                return Err(NetworkError::Fatal(ErrorType::Serialization));
            }
            let mut pm = [0u8; crypto::MASTER_SECRET_SIZE];
            pm.copy_from_slice(&buf[cursor..cursor + crypto::MASTER_SECRET_SIZE]);
            cursor += crypto::MASTER_SECRET_SIZE;
            Some(pm)
        } else {
            None
        };

        if buf.len() < cursor + 2 {
            return Err(NetworkError::Fatal(ErrorType::Serialization));
        }
        let options_len = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]) as usize;
        cursor += 2;

        if buf.len() < cursor + options_len {
            return Err(NetworkError::Fatal(ErrorType::Serialization));
        }
        let options = String::from_utf8_lossy(&buf[cursor..cursor + options_len]).into_owned();

        Ok(KeyMethod2Payload {
            random,
            pre_master,
            options,
        })
    }
}

/// One negotiated (or negotiating) key slot.
pub struct KeySlot {
    pub state: KeyState,
    pub role: Role,
    pub local_session_id: SessionId,
    pub remote_session_id: Option<SessionId>,
    pub must_negotiate_by: Option<Instant>,
    pub must_die_at: Option<Instant>,
    pub established_at: Option<Instant>,
    pub local_random: Option<[u8; 64]>,
    pub remote_random: Option<[u8; 64]>,
    pub pre_master: Option<[u8; crypto::MASTER_SECRET_SIZE]>,
    pub keys: Option<KeyBlock>,
    pub bytes_on_key: u64,
    pub packets_on_key: u64,
    log: Logger,
}

impl KeySlot {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(role: Role, log: L) -> KeySlot {
        let local_session_id = flux::session::random_session_id();
        let slot_log = match log.into() {
            Some(log) => log.new(logging::o!("session_id" => local_session_id)),
            None => logging::discard(),
        };

        KeySlot {
            state: KeyState::Undef,
            role,
            local_session_id,
            remote_session_id: None,
            must_negotiate_by: None,
            must_die_at: None,
            established_at: None,
            local_random: None,
            remote_random: None,
            pre_master: None,
            keys: None,
            bytes_on_key: 0,
            packets_on_key: 0,
            log: slot_log,
        }
    }

    /// `INITIAL -> PRE_START`: arms a transmission of the hard-reset plus the
    /// handshake-window deadline.
    pub fn queue_hard_reset(&mut self, now: Instant, handshake_window: Duration) {
        self.state = KeyState::PreStart;
        self.must_negotiate_by = Some(now + handshake_window);

        logging::debug!(self.log, "hard reset queued"; "context" => "queue_hard_reset", "state" => ?self.state);
    }

    /// `PRE_START -> START` once the hard-reset has been acknowledged by the peer.
    pub fn hard_reset_acknowledged(&mut self) {
        self.state = KeyState::Start;

        logging::debug!(self.log, "hard reset acknowledged"; "context" => "hard_reset_acknowledged", "state" => ?self.state);
    }

    /// Records this side's key-method-2 payload and advances `START -> SENT_KEY`
    /// (or leaves `GOT_KEY -> ACTIVE` if the peer's material already arrived).
    pub fn send_key(&mut self, payload: &KeyMethod2Payload, now: Instant) {
        self.local_random = Some(payload.random);
        if let Some(pre_master) = payload.pre_master {
            self.pre_master = Some(pre_master);
        }

        self.state = match self.state {
            KeyState::GotKey => {
                self.established_at = Some(now);
                KeyState::Active
            }
            _ => KeyState::SentKey,
        };

        logging::debug!(self.log, "local key material sent"; "context" => "send_key", "state" => ?self.state);

        if self.state == KeyState::Active {
            self.derive_keys();
        }
    }

    /// Records the peer's key-method-2 payload and advances `START -> GOT_KEY` (or
    /// `SENT_KEY -> ACTIVE`).
    pub fn recv_key(&mut self, payload: &KeyMethod2Payload, now: Instant) {
        self.remote_random = Some(payload.random);
        if let Some(pre_master) = payload.pre_master {
            self.pre_master = Some(pre_master);
        }

        self.state = match self.state {
            KeyState::SentKey => {
                self.established_at = Some(now);
                KeyState::Active
            }
            _ => KeyState::GotKey,
        };

        logging::debug!(self.log, "peer key material received"; "context" => "recv_key", "state" => ?self.state);

        if self.state == KeyState::Active {
            self.derive_keys();
        }
    }

    fn derive_keys(&mut self) {
        let pre_master = self
            .pre_master
            .expect("pre_master must be present before key derivation");
        let (client_random, server_random) = match self.role {
            Role::Client => (
                self.local_random.expect("local random set"),
                self.remote_random.expect("remote random set"),
            ),
            Role::Server => (
                self.remote_random.expect("remote random set"),
                self.local_random.expect("local random set"),
            ),
        };
        let (client_sid, server_sid) = match self.role {
            Role::Client => (
                self.local_session_id,
                self.remote_session_id.unwrap_or(0),
            ),
            Role::Server => (
                self.remote_session_id.unwrap_or(0),
                self.local_session_id,
            ),
        };

        let block = crypto::expand_keys(&pre_master, &client_random, &server_random, client_sid, server_sid);

        let weak = crypto::is_weak_key(&block.client_to_server.cipher_key)
            || crypto::is_weak_key(&block.server_to_client.cipher_key);
        if weak {
            logging::warn!(self.log, "derived a weak key, failing slot"; "context" => "derive_keys");
            self.state = KeyState::Error;
            return;
        }

        logging::debug!(self.log, "keys derived"; "context" => "derive_keys");
        self.keys = Some(block);
    }

    /// The local encrypt-direction keys, per spec §4.E: "the local encrypt key is the
    /// block for role `server ? 1 : 0`".
    pub fn encrypt_keys(&self) -> Option<&flux::crypto::DirectionKeys> {
        self.keys.as_ref().map(|block| match self.role {
            Role::Server => &block.server_to_client,
            Role::Client => &block.client_to_server,
        })
    }

    pub fn decrypt_keys(&self) -> Option<&flux::crypto::DirectionKeys> {
        self.keys.as_ref().map(|block| match self.role {
            Role::Server => &block.client_to_server,
            Role::Client => &block.server_to_client,
        })
    }

    /// `ACTIVE -> NORMAL` once the handshake timer has elapsed.
    pub fn mature(&mut self, now: Instant) {
        if self.state == KeyState::Active {
            if let Some(deadline) = self.must_negotiate_by {
                if now >= deadline {
                    self.state = KeyState::Normal;
                    logging::debug!(self.log, "slot matured"; "context" => "mature", "state" => ?self.state);
                }
            }
        }
    }
}

/// Rekey thresholds (spec §4.E rekey policy).
pub struct RekeyPolicy {
    pub renegotiate_seconds: Duration,
    pub renegotiate_bytes: u64,
    pub renegotiate_packets: u64,
}

impl Default for RekeyPolicy {
    fn default() -> RekeyPolicy {
        RekeyPolicy {
            renegotiate_seconds: Duration::from_secs(3600),
            renegotiate_bytes: 64 * 1024 * 1024,
            renegotiate_packets: 1 << 24,
        }
    }
}

impl RekeyPolicy {
    pub fn should_rekey(&self, slot: &KeySlot, send_packet_id: u32, now: Instant) -> bool {
        if let Some(established_at) = slot.established_at {
            if now.duration_since(established_at) > self.renegotiate_seconds {
                return true;
            }
        }
        if slot.bytes_on_key > self.renegotiate_bytes {
            return true;
        }
        if slot.packets_on_key > self.renegotiate_packets {
            return true;
        }
        if send_packet_id >= crate::packet_id::SEQUENCE_SOFT_RESET_THRESHOLD {
            return true;
        }
        false
    }
}

/// Holds the primary key slot plus an optional retiring ("lame duck") slot for the
/// duration of a rekey transition, and (server-side only) an `UNTRUSTED` slot used
/// while a new peer's handshake is still unauthenticated.
pub struct Session {
    pub role: Role,
    pub primary: KeySlot,
    pub lame_duck: Option<KeySlot>,
    pub untrusted: Option<KeySlot>,
    pub single_session_mode: bool,
    promoted_once: bool,
    log: Logger,
}

impl Session {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(role: Role, single_session_mode: bool, log: L) -> Session {
        let session_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        Session {
            role,
            primary: KeySlot::new(role, &session_log),
            lame_duck: None,
            untrusted: None,
            single_session_mode,
            promoted_once: false,
            log: session_log,
        }
    }

    /// Soft reset (spec §4.E): moves `primary` to `lame_duck` armed with
    /// `must_die_at`, and spawns a fresh primary slot to renegotiate into.
    pub fn soft_reset(&mut self, now: Instant, transition_window: Duration) {
        logging::debug!(self.log, "soft reset: retiring primary to lame duck"; "context" => "soft_reset");

        let mut retiring = std::mem::replace(&mut self.primary, KeySlot::new(self.role, &self.log));
        retiring.must_die_at = Some(now + transition_window);
        self.lame_duck = Some(retiring);
    }

    /// Drops the lame-duck slot once its `must_die_at` has passed.
    pub fn reap_lame_duck(&mut self, now: Instant) {
        if let Some(slot) = &self.lame_duck {
            if let Some(must_die_at) = slot.must_die_at {
                if now >= must_die_at {
                    logging::debug!(self.log, "lame duck slot reaped"; "context" => "reap_lame_duck");
                    self.lame_duck = None;
                }
            }
        }
    }

    /// Fatal error in any slot (spec §4.E: `* -> ERROR`): promote lame-duck to
    /// primary if one exists and is usable, else reinitialize.
    pub fn handle_error(&mut self) {
        self.primary.state = KeyState::Error;
        logging::warn!(self.log, "primary slot errored"; "context" => "handle_error");

        match self.lame_duck.take() {
            Some(slot) if slot.state.is_usable() => {
                logging::debug!(self.log, "promoting lame duck to primary"; "context" => "handle_error");
                self.primary = slot;
            }
            _ => {
                logging::debug!(self.log, "reinitializing primary"; "context" => "handle_error");
                self.primary = KeySlot::new(self.role, &self.log);
            }
        }
    }

    /// Server-side session promotion (spec §4.E): once `UNTRUSTED`'s decrypt key is
    /// usable, its contents replace the active primary session ("usurp"), and
    /// `UNTRUSTED` is reinitialized. No-op once `single_session_mode` has already
    /// promoted a session.
    pub fn try_promote_untrusted(&mut self) {
        if self.single_session_mode && self.promoted_once {
            self.untrusted = None;
            return;
        }

        let ready = self
            .untrusted
            .as_ref()
            .map(|slot| slot.decrypt_keys().is_some())
            .unwrap_or(false);

        if ready {
            logging::debug!(self.log, "promoting untrusted slot to primary"; "context" => "try_promote_untrusted");
            let promoted = self.untrusted.take().expect("checked above");
            self.primary = promoted;
            self.promoted_once = true;
            self.untrusted = Some(KeySlot::new(self.role, &self.log));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_method2_payload_roundtrip_with_pre_master() {
        let payload = KeyMethod2Payload {
            random: [7u8; 64],
            pre_master: Some([3u8; crypto::MASTER_SECRET_SIZE]),
            options: "V4,dev-type tun,link-mtu 1500".to_string(),
        };

        let encoded = payload.encode();
        let decoded = KeyMethod2Payload::decode(&encoded).unwrap();

        assert_eq!(decoded.random, payload.random);
        assert_eq!(decoded.pre_master, payload.pre_master);
        assert_eq!(decoded.options, payload.options);
    }

    #[test]
    fn test_key_method2_payload_roundtrip_without_pre_master() {
        let payload = KeyMethod2Payload {
            random: [1u8; 64],
            pre_master: None,
            options: String::new(),
        };

        let encoded = payload.encode();
        let decoded = KeyMethod2Payload::decode(&encoded).unwrap();

        assert!(decoded.pre_master.is_none());
    }

    #[test]
    fn test_slot_fsm_reaches_active_client_then_server() {
        let now = Instant::now();
        let mut client = KeySlot::new(Role::Client, None);
        let mut server = KeySlot::new(Role::Server, None);

        client.queue_hard_reset(now, DEFAULT_HANDSHAKE_WINDOW);
        client.hard_reset_acknowledged();
        server.queue_hard_reset(now, DEFAULT_HANDSHAKE_WINDOW);
        server.hard_reset_acknowledged();

        client.remote_session_id = Some(server.local_session_id);
        server.remote_session_id = Some(client.local_session_id);

        let client_payload = KeyMethod2Payload {
            random: [11u8; 64],
            pre_master: Some([4u8; crypto::MASTER_SECRET_SIZE]),
            options: "opts".into(),
        };
        let server_payload = KeyMethod2Payload {
            random: [22u8; 64],
            pre_master: None,
            options: "opts".into(),
        };

        client.send_key(&client_payload, now);
        assert_eq!(client.state, KeyState::SentKey);

        server.recv_key(&client_payload, now);
        assert_eq!(server.state, KeyState::GotKey);

        server.send_key(&server_payload, now);
        assert_eq!(server.state, KeyState::Active);
        assert!(server.keys.is_some());

        client.recv_key(&server_payload, now);
        assert_eq!(client.state, KeyState::Active);

        assert!(client.keys.is_some());
        assert!(server.keys.is_some());

        // Client's encrypt keys must equal server's decrypt keys.
        assert_eq!(
            client.encrypt_keys().unwrap().cipher_key,
            server.decrypt_keys().unwrap().cipher_key
        );
    }

    #[test]
    fn test_rekey_policy_triggers_on_elapsed_time() {
        let policy = RekeyPolicy {
            renegotiate_seconds: Duration::from_secs(1),
            ..RekeyPolicy::default()
        };
        let mut slot = KeySlot::new(Role::Client, None);
        let now = Instant::now();
        slot.established_at = Some(now);

        assert!(!policy.should_rekey(&slot, 0, now));
        assert!(policy.should_rekey(&slot, 0, now + Duration::from_secs(2)));
    }

    #[test]
    fn test_rekey_policy_triggers_near_sequence_wrap() {
        let policy = RekeyPolicy::default();
        let slot = KeySlot::new(Role::Client, None);
        let now = Instant::now();

        assert!(policy.should_rekey(
            &slot,
            crate::packet_id::SEQUENCE_SOFT_RESET_THRESHOLD,
            now
        ));
    }

    #[test]
    fn test_soft_reset_moves_primary_to_lame_duck() {
        let mut session = Session::new(Role::Client, false, None);
        let now = Instant::now();
        let old_id = session.primary.local_session_id;

        session.soft_reset(now, DEFAULT_TRANSITION_WINDOW);

        assert_eq!(session.lame_duck.as_ref().unwrap().local_session_id, old_id);
        assert_ne!(session.primary.local_session_id, old_id);
    }

    #[test]
    fn test_handle_error_promotes_usable_lame_duck() {
        let mut session = Session::new(Role::Client, false, None);
        let now = Instant::now();
        session.soft_reset(now, DEFAULT_TRANSITION_WINDOW);
        session.lame_duck.as_mut().unwrap().state = KeyState::Normal;
        let lame_duck_id = session.lame_duck.as_ref().unwrap().local_session_id;

        session.handle_error();

        assert_eq!(session.primary.local_session_id, lame_duck_id);
        assert!(session.lame_duck.is_none());
    }

    #[test]
    fn test_reap_lame_duck_after_deadline() {
        let mut session = Session::new(Role::Client, false, None);
        let now = Instant::now();
        session.soft_reset(now, Duration::from_secs(10));

        session.reap_lame_duck(now + Duration::from_secs(5));
        assert!(session.lame_duck.is_some());

        session.reap_lame_duck(now + Duration::from_secs(11));
        assert!(session.lame_duck.is_none());
    }
}
