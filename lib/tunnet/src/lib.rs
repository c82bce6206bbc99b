//! Protocol core for a user-space VPN tunneling daemon: buffer/frame accounting,
//! packet-id replay protection, the control-channel reliability layer, the
//! crypto envelope, session/key negotiation, fragmentation, shaping, the peer and
//! server I/O loops, wire opcodes, signal handling, and OCC.

pub mod buffer;
pub mod channel;
pub mod crypto_envelope;
pub mod endpoint;
pub mod fragment;
pub mod frame;
pub mod occ;
pub mod opcode;
pub mod packet_id;
pub mod reliable;
pub mod server;
pub mod session;
pub mod shaper;
pub mod signal;
pub mod support;
pub mod timers;
pub mod tls;
