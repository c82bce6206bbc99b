//! Frame parameters and MTU arithmetic (spec §4.A, §3 "Frame parameters"). The
//! `Frame` accumulates the additive per-layer overheads (crypto, packet-id,
//! fragment, opcode, compression, proxy) and derives the sizes every other module
//! needs to budget its buffers against.

/// One encapsulation layer's contribution to the total per-packet overhead. Layers
/// are applied outermost-last on the wire (tun payload is innermost).
#[derive(Debug, Clone, Copy)]
pub struct Overhead {
    pub crypto: usize,
    pub packet_id: usize,
    pub fragment: usize,
    pub opcode: usize,
    pub compression: usize,
    pub proxy: usize,
}

impl Overhead {
    pub const fn zero() -> Overhead {
        Overhead {
            crypto: 0,
            packet_id: 0,
            fragment: 0,
            opcode: 0,
            compression: 0,
            proxy: 0,
        }
    }

    #[inline]
    fn total(&self) -> usize {
        self.crypto + self.packet_id + self.fragment + self.opcode + self.compression + self.proxy
    }

    #[inline]
    fn total_excluding_tun(&self) -> usize {
        // "tun" itself carries no fixed overhead of its own; this alias exists so
        // call sites read the way the spec's formula does.
        self.total()
    }
}

/// Tracks the link/tun MTUs plus the accumulated per-layer overhead, and derives the
/// sizes referenced throughout §4 (`expanded_size`, `payload_size_dynamic`).
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    link_mtu: usize,
    tun_mtu: usize,
    overhead: Overhead,
}

impl Frame {
    pub fn new(link_mtu: usize, tun_mtu: usize) -> Frame {
        Frame {
            link_mtu,
            tun_mtu,
            overhead: Overhead::zero(),
        }
    }

    #[inline]
    pub fn link_mtu(&self) -> usize {
        self.link_mtu
    }

    #[inline]
    pub fn tun_mtu(&self) -> usize {
        self.tun_mtu
    }

    #[inline]
    pub fn overhead(&self) -> &Overhead {
        &self.overhead
    }

    pub fn add_crypto_overhead(&mut self, bytes: usize) -> &mut Self {
        self.overhead.crypto += bytes;
        self
    }

    pub fn add_packet_id_overhead(&mut self, bytes: usize) -> &mut Self {
        self.overhead.packet_id += bytes;
        self
    }

    pub fn add_fragment_overhead(&mut self, bytes: usize) -> &mut Self {
        self.overhead.fragment += bytes;
        self
    }

    pub fn add_opcode_overhead(&mut self, bytes: usize) -> &mut Self {
        self.overhead.opcode += bytes;
        self
    }

    pub fn add_compression_overhead(&mut self, bytes: usize) -> &mut Self {
        self.overhead.compression += bytes;
        self
    }

    pub fn add_proxy_overhead(&mut self, bytes: usize) -> &mut Self {
        self.overhead.proxy += bytes;
        self
    }

    /// `tun_mtu + sum(overheads)`: the largest a fully-encapsulated packet can grow
    /// to starting from a tun-sized payload. Buffers on the encrypt path are sized to
    /// this plus the buffer's own headroom/tailroom margin.
    #[inline]
    pub fn expanded_size(&self) -> usize {
        self.tun_mtu + self.overhead.total()
    }

    /// `link_mtu - sum(overheads_excluding_tun)`: the largest dynamic payload that
    /// still fits under the link MTU once every layer's overhead is subtracted. Used
    /// by the fragmenter to pick fragment size.
    #[inline]
    pub fn payload_size_dynamic(&self) -> usize {
        self.link_mtu
            .saturating_sub(self.overhead.total_excluding_tun())
    }

    /// A stage receiving a buffer bigger than `expanded_size` is a protocol
    /// violation (spec §4.A: "drop, log").
    #[inline]
    pub fn is_oversized(&self, len: usize) -> bool {
        len > self.expanded_size()
    }
}

const IPV4_PROTO_TCP: u8 = 6;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_OPT_KIND_MSS: u8 = 2;
const TCP_OPT_LEN_MSS: u8 = 4;
const TCP_OPT_KIND_EOL: u8 = 0;
const TCP_OPT_KIND_NOP: u8 = 1;

/// `--mssfix` clamps the TCP MSS option on outgoing SYN segments so neither peer
/// negotiates a segment size that would overflow the tunnel's payload budget once
/// encapsulation overhead is added. Per spec §9 this is a documented no-op on
/// anything but IPv4 TCP SYN segments — UDP and non-SYN TCP traffic pass through
/// unexamined, exactly the dispatch-on-protocol-byte behavior the original sources
/// use rather than rewriting every packet's framing.
///
/// `packet` must be a full IPv4 datagram (the tun-side plaintext, pre-encryption).
/// Returns `true` if an MSS option was clamped in place.
pub fn mssfix_ipv4(packet: &mut [u8], max_mss: u16) -> bool {
    if packet.len() < 20 || (packet[0] >> 4) != 4 {
        return false;
    }

    let ihl = ((packet[0] & 0x0f) as usize) * 4;
    if ihl < 20 || packet.len() < ihl + 20 {
        return false;
    }
    if packet[9] != IPV4_PROTO_TCP {
        return false;
    }

    let tcp = &packet[ihl..];
    if tcp[13] & TCP_FLAG_SYN == 0 {
        return false;
    }

    let tcp_header_len = ((tcp[12] >> 4) as usize) * 4;
    if tcp_header_len <= 20 || packet.len() < ihl + tcp_header_len {
        return false;
    }

    let opts_start = ihl + 20;
    let opts_end = ihl + tcp_header_len;
    let mut cursor = opts_start;
    let mut clamped = false;

    while cursor < opts_end {
        let kind = packet[cursor];
        if kind == TCP_OPT_KIND_EOL {
            break;
        }
        if kind == TCP_OPT_KIND_NOP {
            cursor += 1;
            continue;
        }
        if cursor + 1 >= opts_end {
            break;
        }
        let opt_len = packet[cursor + 1] as usize;
        if opt_len < 2 || cursor + opt_len > opts_end {
            break;
        }

        if kind == TCP_OPT_KIND_MSS && opt_len as u8 == TCP_OPT_LEN_MSS {
            let current = u16::from_be_bytes([packet[cursor + 2], packet[cursor + 3]]);
            if current > max_mss {
                packet[cursor + 2..cursor + 4].copy_from_slice(&max_mss.to_be_bytes());
                clamped = true;
            }
        }

        cursor += opt_len;
    }

    clamped
}
