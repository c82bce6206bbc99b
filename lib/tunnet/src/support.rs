//! Shared error and (de)serialization plumbing used across every module. Kept
//! deliberately small and allocation-free on the hot path: `NetworkError` is a plain
//! two-variant enum (`Wait` vs `Fatal`), and `Serialize`/`Deserialize` write directly
//! into caller-owned buffers rather than producing an intermediate `Vec`.

use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Transient ("try again later", spec §7) vs fatal distinction. Every fallible
/// network operation in this crate returns one of these two shapes; the taxonomy of
/// *why* a `Fatal` occurred lives in `ErrorType`.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ErrorType {
    Expired,
    Duplicate,
    AlreadyConnected,
    PayloadTooLarge,
    EmptyPayload,
    IncorrectOpcode,
    ProtocolMismatch,
    VersionMismatch,
    SequenceMismatch,
    ReplayRejected,
    RingFull,
    OutOfOrder,
    Serialization,
    Crypto,
    TlsAuth,
    Tls,
    AddrParse,
    BufferOverrun,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

/// Ergonomic helper for "was this an error other than would-block" checks, used
/// pervasively by the event loops to decide whether to tear a connection down.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in
/// the destination, so serializers can bail out with `NetworkError::Wait` instead of
/// panicking or silently truncating.
pub trait SizedWrite: io::Write {
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_failed() {
        let ok: NetworkResult<()> = Ok(());
        let wait: NetworkResult<()> = Err(NetworkError::Wait);
        let fatal: NetworkResult<()> = Err(NetworkError::Fatal(ErrorType::Crypto));

        assert!(!ok.has_failed());
        assert!(!wait.has_failed());
        assert!(fatal.has_failed());
    }

    #[test]
    fn test_io_error_would_block_maps_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);
    }

    #[test]
    fn test_io_error_other_maps_to_fatal() {
        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(
            err,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset))
        );
    }
}
