//! Wire protocol opcodes (spec §4.K). The first byte of every packet on the wire is
//! `opcode << 3 | key_id`: a 5-bit opcode selecting the packet's role plus a 3-bit key
//! id selecting which key slot it belongs to.

use crate::support::{ErrorType, NetworkError, NetworkResult};

/// Five-bit opcode space. Values line up with the bit layout in spec §4.K; the
/// control-channel reliability layer and the session FSM both switch on these.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum Opcode {
    ControlHardResetClientV1,
    ControlHardResetServerV1,
    ControlHardResetClientV2,
    ControlHardResetServerV2,
    ControlSoftResetV1,
    ControlV1,
    AckV1,
    DataV1,
}

impl Opcode {
    #[inline]
    fn code(self) -> u8 {
        match self {
            Opcode::ControlHardResetClientV1 => 1,
            Opcode::ControlHardResetServerV1 => 2,
            Opcode::ControlSoftResetV1 => 3,
            Opcode::ControlV1 => 4,
            Opcode::AckV1 => 5,
            Opcode::ControlHardResetClientV2 => 7,
            Opcode::ControlHardResetServerV2 => 8,
            Opcode::DataV1 => 9,
        }
    }

    fn from_code(code: u8) -> Option<Opcode> {
        Some(match code {
            1 => Opcode::ControlHardResetClientV1,
            2 => Opcode::ControlHardResetServerV1,
            3 => Opcode::ControlSoftResetV1,
            4 => Opcode::ControlV1,
            5 => Opcode::AckV1,
            7 => Opcode::ControlHardResetClientV2,
            8 => Opcode::ControlHardResetServerV2,
            9 => Opcode::DataV1,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_control(self) -> bool {
        !matches!(self, Opcode::DataV1)
    }

    #[inline]
    pub fn is_hard_reset(self) -> bool {
        matches!(
            self,
            Opcode::ControlHardResetClientV1
                | Opcode::ControlHardResetServerV1
                | Opcode::ControlHardResetClientV2
                | Opcode::ControlHardResetServerV2
        )
    }

    #[inline]
    pub fn is_client_reset(self) -> bool {
        matches!(
            self,
            Opcode::ControlHardResetClientV1 | Opcode::ControlHardResetClientV2
        )
    }

    /// The paired key-method version associated with a hard-reset opcode (1 or 2).
    pub fn key_method(self) -> Option<u8> {
        match self {
            Opcode::ControlHardResetClientV1 | Opcode::ControlHardResetServerV1 => Some(1),
            Opcode::ControlHardResetClientV2 | Opcode::ControlHardResetServerV2 => Some(2),
            _ => None,
        }
    }
}

pub const MAX_KEY_ID: u8 = 0b111;

/// Packs `opcode` and `key_id` (0..=7) into the first wire byte.
#[inline]
pub fn pack(opcode: Opcode, key_id: u8) -> u8 {
    debug_assert!(key_id <= MAX_KEY_ID);
    (opcode.code() << 3) | (key_id & MAX_KEY_ID)
}

/// Unpacks the first wire byte into `(opcode, key_id)`. Fails with
/// `ErrorType::IncorrectOpcode` if the high 5 bits don't correspond to a known opcode.
pub fn unpack(byte: u8) -> NetworkResult<(Opcode, u8)> {
    let code = byte >> 3;
    let key_id = byte & MAX_KEY_ID;

    match Opcode::from_code(code) {
        Some(opcode) => Ok((opcode, key_id)),
        None => Err(NetworkError::Fatal(ErrorType::IncorrectOpcode)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        for &opcode in &[
            Opcode::ControlHardResetClientV1,
            Opcode::ControlHardResetServerV1,
            Opcode::ControlHardResetClientV2,
            Opcode::ControlHardResetServerV2,
            Opcode::ControlSoftResetV1,
            Opcode::ControlV1,
            Opcode::AckV1,
            Opcode::DataV1,
        ] {
            for key_id in 0..=MAX_KEY_ID {
                let byte = pack(opcode, key_id);
                let (decoded_opcode, decoded_key_id) = unpack(byte).unwrap();
                assert_eq!(decoded_opcode, opcode);
                assert_eq!(decoded_key_id, key_id);
            }
        }
    }

    #[test]
    fn test_unpack_rejects_unknown_opcode() {
        // Code 31 (all five high bits set) never maps to a defined opcode.
        let byte = pack(Opcode::DataV1, 0) | 0b1111_1000;
        let result = unpack(byte);
        assert_eq!(result.err(), Some(NetworkError::Fatal(ErrorType::IncorrectOpcode)));
    }

    #[test]
    fn test_is_control_and_hard_reset() {
        assert!(!Opcode::DataV1.is_control());
        assert!(Opcode::ControlV1.is_control());
        assert!(Opcode::ControlHardResetClientV2.is_hard_reset());
        assert!(!Opcode::ControlSoftResetV1.is_hard_reset());
    }

    #[test]
    fn test_key_method() {
        assert_eq!(Opcode::ControlHardResetClientV1.key_method(), Some(1));
        assert_eq!(Opcode::ControlHardResetServerV2.key_method(), Some(2));
        assert_eq!(Opcode::ControlV1.key_method(), None);
    }

    #[test]
    fn test_is_client_reset() {
        assert!(Opcode::ControlHardResetClientV1.is_client_reset());
        assert!(Opcode::ControlHardResetClientV2.is_client_reset());
        assert!(!Opcode::ControlHardResetServerV1.is_client_reset());
    }
}
