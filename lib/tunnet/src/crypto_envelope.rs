//! Data and control packet crypto envelopes (spec §4.D): authenticate-then-decrypt
//! on the way in, encrypt-then-authenticate on the way out, built on the HMAC/cipher
//! primitives in `flux::crypto`.

use crate::opcode::{self, Opcode};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use flux::crypto::{self, DirectionKeys};

/// `opcode||key_id` (1) + HMAC (20) + sequence (4).
pub const DATA_OVERHEAD_SHORT: usize = 1 + crypto::HMAC_SIZE + 4;
/// Long form additionally prefixes a 32-bit epoch.
pub const DATA_OVERHEAD_LONG: usize = DATA_OVERHEAD_SHORT + 4;

/// Whether packet ids on the wire carry a leading 32-bit epoch ("long form", spec
/// §4.B) or just the bare sequence ("short form").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketIdForm {
    Short,
    Long,
}

/// Encrypts `plaintext` into a self-contained data-channel wire packet: `opcode|key_id
/// || HMAC || [epoch] || sequence || ciphertext`.
pub fn seal_data(
    opcode: Opcode,
    key_id: u8,
    keys: &DirectionKeys,
    form: PacketIdForm,
    epoch: Option<u32>,
    sequence: u32,
    plaintext: &[u8],
) -> Vec<u8> {
    let iv = crypto::iv_from_packet_id(sequence);
    let ciphertext = crypto::cbc_encrypt(&keys.cipher_key, &iv, plaintext);

    let mut body = Vec::with_capacity(8 + ciphertext.len());
    if form == PacketIdForm::Long {
        let epoch = epoch.unwrap_or(0);
        body.extend_from_slice(&epoch.to_be_bytes());
    }
    body.extend_from_slice(&sequence.to_be_bytes());
    body.extend_from_slice(&ciphertext);

    let tag = crypto::hmac_sha1(&keys.hmac_key, &body);

    let mut packet = Vec::with_capacity(1 + tag.len() + body.len());
    packet.push(opcode::pack(opcode, key_id));
    packet.extend_from_slice(&tag);
    packet.extend_from_slice(&body);
    packet
}

/// The decrypted result of [`open_data`]: the sequence (and epoch, if long-form) plus
/// the recovered plaintext.
pub struct OpenedData {
    pub epoch: Option<u32>,
    pub sequence: u32,
    pub plaintext: Vec<u8>,
}

/// Verifies and decrypts a data-channel wire packet produced by [`seal_data`].
/// Authentication runs before decryption (spec §4.D: "authenticate-then-decrypt
/// verification").
pub fn open_data(
    packet: &[u8],
    keys: &DirectionKeys,
    form: PacketIdForm,
) -> NetworkResult<OpenedData> {
    let min_len = 1 + crypto::HMAC_SIZE + if form == PacketIdForm::Long { 8 } else { 4 };
    if packet.len() < min_len {
        return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
    }

    let tag = &packet[1..1 + crypto::HMAC_SIZE];
    let body = &packet[1 + crypto::HMAC_SIZE..];

    if !crypto::verify_hmac_sha1(&keys.hmac_key, body, tag) {
        return Err(NetworkError::Fatal(ErrorType::TlsAuth));
    }

    let (epoch, sequence, ciphertext) = match form {
        PacketIdForm::Long => (
            Some(BigEndian::read_u32(&body[0..4])),
            BigEndian::read_u32(&body[4..8]),
            &body[8..],
        ),
        PacketIdForm::Short => (None, BigEndian::read_u32(&body[0..4]), &body[4..]),
    };

    let iv = crypto::iv_from_packet_id(sequence);
    let plaintext = crypto::cbc_decrypt(&keys.cipher_key, &iv, ciphertext)
        .ok_or_else(|| NetworkError::Fatal(ErrorType::Crypto))?;

    Ok(OpenedData {
        epoch,
        sequence,
        plaintext,
    })
}

/// Parsed control-packet header fields (spec §4.D / §4.K), before the tls-auth swap
/// is undone.
pub struct ControlHeader {
    pub opcode: Opcode,
    pub key_id: u8,
    pub session_id: u64,
    pub ack_ids: Vec<u32>,
    pub remote_session_id: Option<u64>,
    pub own_packet_id: Option<u32>,
}

/// Serializes a control packet: `opcode||key_id || session_id || ack_count ||
/// ack_ids[] || [remote_session_id] || [own_packet_id] || payload`. The tls-auth HMAC
/// block, if any, is applied by the caller (the swap described in spec §4.D is a
/// transport-level concern of `tunnet::channel`/`tunnet::endpoint`, not this codec).
pub fn encode_control(header: &ControlHeader, payload: &[u8]) -> Vec<u8> {
    assert!(header.ack_ids.len() <= crate::reliable::MAX_ACKS_PER_PACKET);

    let mut out = Vec::with_capacity(1 + 8 + 1 + header.ack_ids.len() * 4 + 8 + 4 + payload.len());
    out.push(opcode::pack(header.opcode, header.key_id));
    out.extend_from_slice(&header.session_id.to_be_bytes());
    out.push(header.ack_ids.len() as u8);
    for ack in &header.ack_ids {
        out.extend_from_slice(&ack.to_be_bytes());
    }
    if !header.ack_ids.is_empty() {
        let remote = header
            .remote_session_id
            .expect("remote_session_id required when ack_count > 0");
        out.extend_from_slice(&remote.to_be_bytes());
    }
    if let Some(packet_id) = header.own_packet_id {
        out.extend_from_slice(&packet_id.to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Parses a control packet produced by [`encode_control`], returning the header and a
/// slice into `packet` for the payload.
pub fn decode_control(packet: &[u8]) -> NetworkResult<(ControlHeader, &[u8])> {
    if packet.is_empty() {
        return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
    }

    let (opcode, key_id) = opcode::unpack(packet[0])?;
    let mut cursor = 1usize;

    let read = |cursor: &mut usize, n: usize, packet: &[u8]| -> NetworkResult<()> {
        if packet.len() < *cursor + n {
            return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
        }
        Ok(())
    };

    read(&mut cursor, 8, packet)?;
    let session_id = BigEndian::read_u64(&packet[cursor..cursor + 8]);
    cursor += 8;

    read(&mut cursor, 1, packet)?;
    let ack_count = packet[cursor] as usize;
    cursor += 1;

    if ack_count > crate::reliable::MAX_ACKS_PER_PACKET {
        return Err(NetworkError::Fatal(ErrorType::Serialization));
    }

    read(&mut cursor, ack_count * 4, packet)?;
    let mut ack_ids = Vec::with_capacity(ack_count);
    for _ in 0..ack_count {
        ack_ids.push(BigEndian::read_u32(&packet[cursor..cursor + 4]));
        cursor += 4;
    }

    let remote_session_id = if ack_count > 0 {
        read(&mut cursor, 8, packet)?;
        let value = BigEndian::read_u64(&packet[cursor..cursor + 8]);
        cursor += 8;
        Some(value)
    } else {
        None
    };

    let is_pure_ack = opcode == Opcode::AckV1;
    let own_packet_id = if is_pure_ack {
        None
    } else {
        read(&mut cursor, 4, packet)?;
        let value = BigEndian::read_u32(&packet[cursor..cursor + 4]);
        cursor += 4;
        Some(value)
    };

    Ok((
        ControlHeader {
            opcode,
            key_id,
            session_id,
            ack_ids,
            remote_session_id,
            own_packet_id,
        },
        &packet[cursor..],
    ))
}

/// Applies tls-auth HMAC+packet-id front-swap (spec §4.D): a permutation that is its
/// own inverse, used both to authenticate inbound control packets before decoding and
/// to restore wire order before transport.
pub fn tls_auth_swap(packet: &mut [u8], front_len: usize) {
    debug_assert!(front_len * 2 <= packet.len());
    let (front, rest) = packet.split_at_mut(front_len);
    let back = &mut rest[..front_len];
    front.swap_with_slice(back);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux::crypto::{CIPHER_KEY_SIZE, HMAC_KEY_SIZE};

    fn test_keys() -> DirectionKeys {
        DirectionKeys {
            cipher_key: [5u8; CIPHER_KEY_SIZE],
            hmac_key: [9u8; HMAC_KEY_SIZE],
        }
    }

    #[test]
    fn test_seal_open_data_roundtrip_short_form() {
        let keys = test_keys();
        let plaintext = b"hello tunnel";

        let packet = seal_data(Opcode::DataV1, 2, &keys, PacketIdForm::Short, None, 42, plaintext);
        let opened = open_data(&packet, &keys, PacketIdForm::Short).unwrap();

        assert_eq!(opened.sequence, 42);
        assert_eq!(opened.epoch, None);
        assert_eq!(opened.plaintext, plaintext);
    }

    #[test]
    fn test_seal_open_data_roundtrip_long_form() {
        let keys = test_keys();
        let plaintext = b"payload with epoch";

        let packet = seal_data(
            Opcode::DataV1,
            0,
            &keys,
            PacketIdForm::Long,
            Some(1000),
            7,
            plaintext,
        );
        let opened = open_data(&packet, &keys, PacketIdForm::Long).unwrap();

        assert_eq!(opened.epoch, Some(1000));
        assert_eq!(opened.sequence, 7);
        assert_eq!(opened.plaintext, plaintext);
    }

    #[test]
    fn test_open_data_rejects_tampered_hmac() {
        let keys = test_keys();
        let mut packet = seal_data(Opcode::DataV1, 0, &keys, PacketIdForm::Short, None, 1, b"x");
        let last = packet.len() - 1;
        packet[last] ^= 0xff;

        let result = open_data(&packet, &keys, PacketIdForm::Short);
        assert_eq!(result.err(), Some(NetworkError::Fatal(ErrorType::TlsAuth)));
    }

    #[test]
    fn test_control_header_roundtrip_with_acks() {
        let header = ControlHeader {
            opcode: Opcode::ControlV1,
            key_id: 3,
            session_id: 0xdead_beef_cafe_babe,
            ack_ids: vec![1, 2, 3],
            remote_session_id: Some(0x1122_3344_5566_7788),
            own_packet_id: Some(99),
        };

        let encoded = encode_control(&header, b"control payload");
        let (decoded, payload) = decode_control(&encoded).unwrap();

        assert_eq!(decoded.opcode, Opcode::ControlV1);
        assert_eq!(decoded.key_id, 3);
        assert_eq!(decoded.session_id, header.session_id);
        assert_eq!(decoded.ack_ids, header.ack_ids);
        assert_eq!(decoded.remote_session_id, header.remote_session_id);
        assert_eq!(decoded.own_packet_id, header.own_packet_id);
        assert_eq!(payload, b"control payload");
    }

    #[test]
    fn test_control_header_roundtrip_pure_ack() {
        let header = ControlHeader {
            opcode: Opcode::AckV1,
            key_id: 0,
            session_id: 123,
            ack_ids: vec![5],
            remote_session_id: Some(456),
            own_packet_id: None,
        };

        let encoded = encode_control(&header, b"");
        let (decoded, payload) = decode_control(&encoded).unwrap();

        assert_eq!(decoded.own_packet_id, None);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_tls_auth_swap_is_involution() {
        let mut packet = b"AAAABBBBrest-of-the-packet".to_vec();
        let original = packet.clone();

        tls_auth_swap(&mut packet, 4);
        assert_ne!(packet, original);

        tls_auth_swap(&mut packet, 4);
        assert_eq!(packet, original);
    }

    #[test]
    fn test_decode_control_rejects_truncated_packet() {
        let result = decode_control(&[opcode::pack(Opcode::ControlV1, 0)]);
        assert!(result.is_err());
    }
}
