//! Cryptographic primitives for Burrow.
//!
//! Provides four things:
//!   1. The Salsa20 keystream XOR used for datagram confidentiality
//!   2. The Poly1305 one-time authenticator (16-byte tags, constant-time verify)
//!   3. The keyed 8-byte nonce permutation that hides the monotonic counter
//!      on the wire
//!   4. `SessionKey` / `PeerId` — key material handed over by the handshake
//!      collaborator
//!
//! The per-datagram MAC key is the leading 32 bytes of the same keystream
//! that encrypts the payload, so authentication costs no extra cipher call.
//! Key material is wiped from memory when dropped. The nonce permutation is
//! a wire-format detail, not a confidentiality primitive: its key is derived
//! deterministically from the session key and both ends must derive it
//! bit-identically.

use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{Block, BlockDecrypt, BlockEncrypt};
use blowfish::Blowfish;
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use rand::RngCore;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::wire::{NONCE_SIZE, SSIZE, TAG_SIZE};

// ── Session key ───────────────────────────────────────────────────────────────

/// The 32-byte shared symmetric key produced by the handshake collaborator.
///
/// Immutable for the lifetime of a peer; zeroized on drop. A peer that has
/// moved more than `MAX_BYTES_PER_KEY` under one key must be destroyed and a
/// fresh key negotiated.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a key from 64 hex characters, as stored in the config file.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let raw = hex::decode(s.trim())?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| KeyError::BadLength(v.len()))?;
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Generate a random key. Stands in for the handshake when provisioning
    /// a new peer pair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key must be 32 bytes, got {0}")]
    BadLength(usize),

    #[error("key is not valid hex: {0}")]
    BadHex(#[from] hex::FromHexError),
}

// ── Peer identity ─────────────────────────────────────────────────────────────

/// 16-byte peer identifier bound during the handshake.
///
/// With statically configured keys it is derived from the key itself, so
/// both ends of a session log the same identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive the identity of the peer that shares `key`.
    ///
    ///   id = first 16 bytes of BLAKE3(key)
    pub fn derive(key: &SessionKey) -> Self {
        let digest = blake3::hash(key.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest.as_bytes()[..16]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

// ── Stream cipher ─────────────────────────────────────────────────────────────

/// XOR `buf` in place with the Salsa20 keystream of `(key, nonce)`.
///
/// A zero-filled `buf` comes out as pure keystream; the datagram framing
/// relies on this to derive the one-time MAC key from the first `SSIZE`
/// bytes.
pub fn xor_stream(buf: &mut [u8], nonce: &[u8; NONCE_SIZE], key: &SessionKey) {
    let mut cipher = Salsa20::new(key.as_bytes().into(), nonce.into());
    cipher.apply_keystream(buf);
}

// ── One-time MAC ──────────────────────────────────────────────────────────────

/// Authenticate `msg` under a one-time key.
///
/// `key_auth` must never be reused across messages — the caller takes it
/// from the keystream prefix of each datagram.
pub fn mac(msg: &[u8], key_auth: &[u8; SSIZE]) -> [u8; TAG_SIZE] {
    let tag = Poly1305::new(key_auth.into()).compute_unpadded(msg);
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(tag.as_slice());
    out
}

/// Verify `tag` over `msg` in constant time.
pub fn mac_verify(tag: &[u8; TAG_SIZE], msg: &[u8], key_auth: &[u8; SSIZE]) -> bool {
    let expected = Poly1305::new(key_auth.into()).compute_unpadded(msg);
    expected.as_slice().ct_eq(tag.as_slice()).into()
}

// ── Nonce permutation ─────────────────────────────────────────────────────────

/// Keyed, invertible permutation over the 8-byte nonce field.
///
/// The outbound counter increments by two per datagram; encrypting it under
/// a 64-bit block cipher stops a passive observer from reading session
/// progress off the wire. The cipher key is the first 16 bytes of the
/// session keystream under a zero nonce, so both sides derive the same
/// permutation without extra negotiation.
pub struct NonceCipher(Blowfish);

impl NonceCipher {
    pub fn new(key: &SessionKey) -> Self {
        let mut keystream = Zeroizing::new([0u8; SSIZE]);
        xor_stream(&mut keystream[..], &[0u8; NONCE_SIZE], key);
        let cipher = Blowfish::new_from_slice(&keystream[..16])
            .expect("16-byte keys are within the Blowfish range");
        Self(cipher)
    }

    /// Encrypt a clear nonce field in place, producing the on-wire form.
    pub fn obfuscate(&self, nonce: &mut [u8; NONCE_SIZE]) {
        let block = Block::<Blowfish>::from_mut_slice(nonce);
        self.0.encrypt_block(block);
    }

    /// Decrypt an on-wire nonce field into `out`.
    pub fn clarify(&self, out: &mut [u8; NONCE_SIZE], wire: &[u8; NONCE_SIZE]) {
        let src = GenericArray::from_slice(wire);
        let dst = GenericArray::from_mut_slice(out);
        self.0.decrypt_block_b2b(src, dst);
    }
}

// ── Payload transform ─────────────────────────────────────────────────────────

/// The confidentiality seam of the datagram framing.
///
/// The default is the Salsa20 XOR; an alternative mode (e.g. the
/// all-or-nothing encryptionless construction) plugs in here without
/// touching the peer datapath. `seal` and `open` operate in place over the
/// whole plaintext region, keystream prefix included.
pub trait PayloadTransform: Send + Sync {
    fn seal(&self, key: &SessionKey, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]);
    fn open(&self, key: &SessionKey, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]);
}

/// Stream-cipher transform: XOR both ways.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTransform;

impl PayloadTransform for StreamTransform {
    fn seal(&self, key: &SessionKey, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        xor_stream(buf, nonce, key);
    }

    fn open(&self, key: &SessionKey, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        xor_stream(buf, nonce, key);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
