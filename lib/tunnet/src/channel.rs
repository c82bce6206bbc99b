//! Length-prefixed TCP stream framing (spec §4.I), adapted from the teacher's
//! `neutronium::net::channel::Channel`: a `Buffer`-backed reader/writer pair plus a
//! small state machine tracking partial reads across `stream_buf` states.

use crate::buffer::Buffer;
use crate::signal::SignalKind;
use crate::support::{NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use flux::logging::{self, Logger};
use std::io;
use std::net::TcpStream;

const LENGTH_PREFIX_SIZE: usize = 2;
const READ_BUFFER_SIZE: usize = 65536;
const WRITE_BUFFER_SIZE: usize = 65536;

/// Tracks progress reading one length-prefixed packet off the stream (spec §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBufState {
    Empty,
    ReadingLength,
    ReadingPayload,
    Complete,
    /// The last `read()` returned bytes belonging to the *next* packet; a following
    /// loop iteration must drain them without waiting for readability again.
    Residual,
}

/// A TCP-backed control/data stream with length-prefixed framing.
pub struct Channel {
    stream: TcpStream,
    read_buffer: Buffer,
    write_buffer: Buffer,
    state: StreamBufState,
    pending_length: Option<u16>,
    log: Logger,
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(stream: TcpStream, log: L) -> NetworkResult<Channel> {
        stream.set_nonblocking(true)?;

        let peer = stream.peer_addr().ok();
        let channel_log = match log.into() {
            Some(log) => log.new(logging::o!("peer_addr" => format!("{:?}", peer))),
            None => logging::discard(),
        };

        logging::debug!(channel_log, "channel opened"; "context" => "new");

        Ok(Channel {
            stream,
            read_buffer: Buffer::new(READ_BUFFER_SIZE),
            write_buffer: Buffer::new(WRITE_BUFFER_SIZE),
            state: StreamBufState::Empty,
            pending_length: None,
            log: channel_log,
        })
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Queues `packet` for transmission, prefixed with its big-endian 16-bit length.
    pub fn write_packet(&mut self, packet: &[u8]) -> NetworkResult<()> {
        assert!(packet.len() <= u16::MAX as usize, "packet too large for length prefix");

        logging::trace!(self.log, "queuing packet for transmission";
                        "context" => "write_packet",
                        "packet_len" => packet.len());

        let mut header = [0u8; LENGTH_PREFIX_SIZE];
        BigEndian::write_u16(&mut header, packet.len() as u16);

        self.write_buffer.write_slice()[..LENGTH_PREFIX_SIZE].copy_from_slice(&header);
        self.write_buffer.move_tail(LENGTH_PREFIX_SIZE);
        self.write_buffer.write_slice()[..packet.len()].copy_from_slice(packet);
        self.write_buffer.move_tail(packet.len());
        Ok(())
    }

    /// Flushes as much of the write buffer to the socket as is currently writable.
    pub fn flush(&mut self) -> NetworkResult<usize> {
        match self.write_buffer.egress(&mut self.stream) {
            Ok(count) => {
                logging::trace!(self.log, "flushed write buffer"; "context" => "flush", "sent" => count);
                Ok(count)
            }
            Err(e) => {
                logging::debug!(self.log, "flush failed"; "context" => "flush", "error" => ?e);
                Err(e.into())
            }
        }
    }

    /// Reads available bytes off the socket into the read buffer, then attempts to
    /// parse one complete packet. Returns `Ok(None)` if a full packet isn't
    /// available yet; `Ok(Some(signal))` if the peer reset the connection.
    pub fn read_packet(&mut self) -> NetworkResult<Option<Vec<u8>>> {
        match self.read_buffer.ingress(&mut self.stream) {
            Ok(0) => {}
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                return Err(NetworkError::from(e));
            }
            Err(e) => return Err(e.into()),
        }

        self.try_parse()
    }

    fn try_parse(&mut self) -> NetworkResult<Option<Vec<u8>>> {
        loop {
            match self.state {
                StreamBufState::Empty | StreamBufState::Residual => {
                    self.state = StreamBufState::ReadingLength;
                }
                StreamBufState::ReadingLength => {
                    if self.read_buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }
                    let header = &self.read_buffer.read_slice()[..LENGTH_PREFIX_SIZE];
                    self.pending_length = Some(BigEndian::read_u16(header));
                    self.read_buffer.move_head(LENGTH_PREFIX_SIZE);
                    self.state = StreamBufState::ReadingPayload;
                }
                StreamBufState::ReadingPayload => {
                    let length = self.pending_length.expect("set when entering ReadingPayload") as usize;
                    if self.read_buffer.len() < length {
                        return Ok(None);
                    }
                    let packet = self.read_buffer.read_slice()[..length].to_vec();
                    self.read_buffer.move_head(length);
                    self.pending_length = None;
                    self.state = StreamBufState::Complete;
                    return Ok(Some(packet));
                }
                StreamBufState::Complete => {
                    // Whatever remains in the buffer belongs to the next packet.
                    self.state = if self.read_buffer.is_empty() {
                        StreamBufState::Empty
                    } else {
                        StreamBufState::Residual
                    };
                    if self.state == StreamBufState::Empty {
                        return Ok(None);
                    }
                }
            }

            logging::trace!(self.log, "stream buffer state advanced";
                            "context" => "try_parse",
                            "state" => ?self.state);
        }
    }

    /// What signal a reset-by-peer should raise (spec §4.I): soft-restart normally,
    /// or hard-terminate when running under an inetd-style supervisor that expects
    /// the process to exit rather than recycle.
    pub fn reset_signal(inetd_mode: bool) -> SignalKind {
        if inetd_mode {
            SignalKind::Terminate
        } else {
            SignalKind::SoftRestart
        }
    }
}
