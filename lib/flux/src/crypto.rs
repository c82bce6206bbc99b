//! Primitive crypto operations backing the data/control envelope (spec §4.D) and the
//! key-method-2 PRF (spec §4.E). These are deliberately low-level: composition into
//! "authenticate-then-decrypt" / "encrypt-then-authenticate" envelopes lives in
//! `tunnet::crypto_envelope`, which is the only caller that knows about opcodes,
//! packet IDs or additional data layout.

use aes::Aes256;
use block_modes::block_padding::Pkcs7;
use block_modes::{BlockMode, Cbc};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;

pub const CIPHER_KEY_SIZE: usize = 32;
pub const CIPHER_BLOCK_SIZE: usize = 16;
pub const HMAC_KEY_SIZE: usize = 20;
pub const HMAC_SIZE: usize = 20;
pub const MASTER_SECRET_SIZE: usize = 48;

type Aes256Cbc = Cbc<Aes256, Pkcs7>;
type HmacSha1 = Hmac<Sha1>;
type HmacMd5 = Hmac<Md5>;

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(out);
}

/// Computes `HMAC-SHA1(key, data)`.
#[inline]
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; HMAC_SIZE] {
    let mut mac = HmacSha1::new_varkey(key).expect("HMAC accepts any key length");
    mac.input(data);
    let mut out = [0u8; HMAC_SIZE];
    out.copy_from_slice(&mac.result().code());
    out
}

/// Verifies `HMAC-SHA1(key, data) == tag` in constant time.
#[inline]
pub fn verify_hmac_sha1(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha1::new_varkey(key).expect("HMAC accepts any key length");
    mac.input(data);
    mac.verify(tag).is_ok()
}

/// Encrypts `plain` under AES-256-CBC with the given key and IV. Returns the
/// ciphertext (PKCS7-padded, so it may be up to one block larger than `plain`).
pub fn cbc_encrypt(key: &[u8; CIPHER_KEY_SIZE], iv: &[u8; CIPHER_BLOCK_SIZE], plain: &[u8]) -> Vec<u8> {
    let cipher = Aes256Cbc::new_var(key, iv).expect("key/iv sizes are fixed and valid");
    cipher.encrypt_vec(plain)
}

/// Decrypts `cipher` produced by [`cbc_encrypt`]. Fails (returns `None`) on a padding
/// or length error, which on the wire indicates a corrupted or forged packet.
pub fn cbc_decrypt(
    key: &[u8; CIPHER_KEY_SIZE],
    iv: &[u8; CIPHER_BLOCK_SIZE],
    cipher: &[u8],
) -> Option<Vec<u8>> {
    let decryptor = Aes256Cbc::new_var(key, iv).ok()?;
    decryptor.decrypt_vec(cipher).ok()
}

/// Derives an IV for IV-less cipher configurations straight from the packet ID
/// (spec §4.D: "the packet-ID serves as the IV source for IV-less modes").
#[inline]
pub fn iv_from_packet_id(packet_id: u32) -> [u8; CIPHER_BLOCK_SIZE] {
    let mut iv = [0u8; CIPHER_BLOCK_SIZE];
    iv[..4].copy_from_slice(&packet_id.to_be_bytes());
    iv
}

/// Rejects cipher keys with no useful entropy (a constant key, or the zero key). Real
/// DES-style "weak key" tables don't apply to AES, but the state machine still must
/// abort a handshake that derived garbage (spec §4.E: "must pass a weak-key check;
/// on failure, abort the session").
pub fn is_weak_key(key: &[u8]) -> bool {
    key.iter().all(|&b| b == key[0])
}

/// `P_hash` from RFC 2246 §5: `HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || ...`
/// where `A(0) = seed` and `A(i) = HMAC(secret, A(i-1))`.
fn p_hash<M: Mac>(mut mac: M, seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(out_len + HMAC_SIZE);
    let mut a = {
        let mut m = mac.clone();
        m.input(seed);
        m.result().code().to_vec()
    };

    while result.len() < out_len {
        let mut step = mac.clone();
        step.input(&a);
        step.input(seed);
        result.extend_from_slice(&step.result().code());

        let mut next_a = mac.clone();
        next_a.input(&a);
        a = next_a.result().code().to_vec();
    }

    result.truncate(out_len);
    result
}

/// The TLS-1.0 style PRF (spec §4.E): XOR of an MD5-HMAC chain and a SHA1-HMAC chain,
/// each keyed off half of `secret` (the halves overlap by one byte when `secret`'s
/// length is odd, per RFC 2246 §5).
pub fn prf(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let mut labeled_seed = Vec::with_capacity(label.len() + seed.len());
    labeled_seed.extend_from_slice(label);
    labeled_seed.extend_from_slice(seed);

    let md5_mac = HmacMd5::new_varkey(s1).expect("HMAC accepts any key length");
    let sha1_mac = HmacSha1::new_varkey(s2).expect("HMAC accepts any key length");

    let md5_stream = p_hash(md5_mac, &labeled_seed, out_len);
    let sha1_stream = p_hash(sha1_mac, &labeled_seed, out_len);

    md5_stream
        .into_iter()
        .zip(sha1_stream.into_iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Combined per-direction key material derived for the data channel (spec §4.E: "the
/// key block sized for two directions of cipher+HMAC keys").
#[derive(Clone)]
pub struct DirectionKeys {
    pub cipher_key: [u8; CIPHER_KEY_SIZE],
    pub hmac_key: [u8; HMAC_KEY_SIZE],
}

/// One block of key material per direction (client->server, server->client).
pub struct KeyBlock {
    pub client_to_server: DirectionKeys,
    pub server_to_client: DirectionKeys,
}

const DIRECTION_KEY_SIZE: usize = CIPHER_KEY_SIZE + HMAC_KEY_SIZE;
const KEY_BLOCK_SIZE: usize = DIRECTION_KEY_SIZE * 2;

/// Runs the two-stage PRF: `pre_master -> master secret (48B) -> key block`, using
/// the seed `client_random || server_random || client_session_id || server_session_id`
/// for both stages, per spec §4.E.
pub fn expand_keys(
    pre_master: &[u8; 48],
    client_random: &[u8; 64],
    server_random: &[u8; 64],
    client_session_id: u64,
    server_session_id: u64,
) -> KeyBlock {
    let mut seed = Vec::with_capacity(64 + 64 + 8 + 8);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(&client_session_id.to_be_bytes());
    seed.extend_from_slice(&server_session_id.to_be_bytes());

    let master = prf(pre_master, b"master secret", &seed, MASTER_SECRET_SIZE);
    let block = prf(&master, b"key expansion", &seed, KEY_BLOCK_SIZE);

    let read_direction = |offset: usize| -> DirectionKeys {
        let mut cipher_key = [0u8; CIPHER_KEY_SIZE];
        let mut hmac_key = [0u8; HMAC_KEY_SIZE];
        cipher_key.copy_from_slice(&block[offset..offset + CIPHER_KEY_SIZE]);
        hmac_key.copy_from_slice(&block[offset + CIPHER_KEY_SIZE..offset + DIRECTION_KEY_SIZE]);
        DirectionKeys { cipher_key, hmac_key }
    };

    KeyBlock {
        client_to_server: read_direction(0),
        server_to_client: read_direction(DIRECTION_KEY_SIZE),
    }
}
