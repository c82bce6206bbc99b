//! Shared key material newtypes, serializable in config/token files via base64.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::ops::{Deref, DerefMut};

const STATIC_KEY_SIZE: usize = 32;

/// A 32-byte pre-shared key, loaded from a `--secret`/`--tls-auth` file or a config
/// entry. Serializes as base64 so it can live in a TOML config alongside everything
/// else rather than requiring a separate binary blob.
#[derive(Clone)]
pub struct StaticKey([u8; STATIC_KEY_SIZE]);

impl StaticKey {
    pub const SIZE: usize = STATIC_KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> StaticKey {
        StaticKey(key)
    }

    #[inline]
    pub fn zero() -> StaticKey {
        StaticKey([0u8; Self::SIZE])
    }

    #[inline]
    pub fn random() -> StaticKey {
        let mut key = [0u8; Self::SIZE];
        crate::crypto::random_bytes(&mut key);
        StaticKey(key)
    }
}

impl Deref for StaticKey {
    type Target = [u8; StaticKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; StaticKey::SIZE] {
        &self.0
    }
}

impl DerefMut for StaticKey {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8; StaticKey::SIZE] {
        &mut self.0
    }
}

impl Serialize for StaticKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(&self.0[..]))
    }
}

impl<'de> Deserialize<'de> for StaticKey {
    fn deserialize<D>(deserializer: D) -> Result<StaticKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <&str>::deserialize(deserializer)?;
        let decoded = base64::decode(s).map_err(de::Error::custom)?;

        if decoded.len() != STATIC_KEY_SIZE {
            return Err(de::Error::custom(format!(
                "expected a {}-byte key, got {}",
                STATIC_KEY_SIZE,
                decoded.len()
            )));
        }

        let mut key = [0u8; STATIC_KEY_SIZE];
        key.copy_from_slice(&decoded);
        Ok(StaticKey(key))
    }
}

/// A random 64-bit session identifier (spec §3, `Session.session_id`).
pub type SessionId = u64;

#[inline]
pub fn random_session_id() -> SessionId {
    let mut buf = [0u8; 8];
    crate::crypto::random_bytes(&mut buf);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[test]
    fn test_roundtrip_via_toml() {
        let key = StaticKey::new([7u8; StaticKey::SIZE]);

        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            key: StaticKey,
        }

        let encoded = serdeconv::to_toml_string(&Wrapper { key: key.clone() }).unwrap();
        let decoded: Wrapper = serdeconv::from_toml_str(&encoded).unwrap();

        assert_eq!(*decoded.key, *key);
    }

    #[test]
    fn test_random_session_ids_differ() {
        assert_ne!(random_session_id(), random_session_id());
    }
}
