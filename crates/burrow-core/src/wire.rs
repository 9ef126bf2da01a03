//! Burrow wire format — layout constants and field encodings for the
//! ciphertext datagram.
//!
//! A datagram on the wire is:
//!
//! ```text
//!   offset 0      obfuscated nonce        (NONCE_SIZE = 8 bytes)
//!   offset 8      ciphertext payload      (C bytes)
//!   offset 8+C    Poly1305 tag            (TAG_SIZE = 16 bytes)
//! ```
//!
//! The decrypted payload region of a peer's scratch buffer is:
//!
//! ```text
//!   buf[0..32]     per-datagram one-time MAC key (pure keystream)
//!   buf[32..64]    keystream filler
//!   buf[64..66]    plaintext length varint, zero padded
//!   buf[66..66+L]  Ethernet frame
//!   buf[66+L..]    zero padding (encrypted when the datagram is padded)
//! ```
//!
//! The nonce and the plaintext length are unsigned LEB128 varints written
//! into zero-padded fixed-width fields. This is interop-critical: a plain
//! little-endian u64 is NOT an equivalent encoding for values >= 2^56, even
//! though the two coincide for small counters.

use static_assertions::{const_assert, const_assert_eq};
use thiserror::Error;

// ── Constants ─────────────────────────────────────────────────────────────────

/// On-wire nonce field width in bytes.
pub const NONCE_SIZE: usize = 8;

/// Salsa20 block size; also the width of the keystream prefix reserved in
/// front of the plaintext.
pub const S20BS: usize = 64;

/// Width of the plaintext-length varint field.
pub const PKT_SIZE_SIZE: usize = 2;

/// Size of the per-datagram derived MAC key (equals the stream cipher key
/// size).
pub const SSIZE: usize = 32;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// Entries per replay-window bucket.
pub const NONCE_BUCKET_SIZE: usize = 128;

/// Per-key traffic budget. Once `bytes_in + bytes_out` exceeds this, the
/// peer must be torn down and rekeyed.
pub const MAX_BYTES_PER_KEY: u64 = 1 << 32;

/// Heartbeats per nominal timeout when no packet-rate shaping is active.
pub const TIMEOUT_HEARTBEAT: u32 = 4;

/// Smallest datagram that can possibly authenticate: nonce, length field,
/// tag.
pub const MIN_PKT_LENGTH: usize = NONCE_SIZE + PKT_SIZE_SIZE + TAG_SIZE;

/// Default tunnel MTU.
pub const DEFAULT_MTU: usize = 1452;

// The MAC key must fit inside the keystream prefix, and the nonce overlay
// must fit in front of the length field.
const_assert!(SSIZE <= S20BS);
const_assert!(NONCE_SIZE <= S20BS - SSIZE);
const_assert_eq!(MIN_PKT_LENGTH, 26);

/// Largest Ethernet frame a datagram can carry at the given MTU.
pub const fn max_frame_len(mtu: usize) -> usize {
    mtu - S20BS - PKT_SIZE_SIZE - TAG_SIZE
}

// ── Varint fields ─────────────────────────────────────────────────────────────

/// Encode a nonce counter into its zero-padded 8-byte wire field.
pub fn encode_nonce(value: u64, out: &mut [u8; NONCE_SIZE]) -> Result<(), WireError> {
    out.fill(0);
    let mut buf = unsigned_varint::encode::u64_buffer();
    let bytes = unsigned_varint::encode::u64(value, &mut buf);
    if bytes.len() > NONCE_SIZE {
        return Err(WireError::NonceOverflow(value));
    }
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Decode a nonce counter from its zero-padded 8-byte field.
pub fn decode_nonce(raw: &[u8; NONCE_SIZE]) -> Result<u64, WireError> {
    let (value, _) = unsigned_varint::decode::u64(raw).map_err(|_| WireError::BadVarint)?;
    Ok(value)
}

/// Encode a plaintext length into the zero-padded 2-byte field.
/// Lengths above 2^14 - 1 do not fit in two varint bytes.
pub fn encode_frame_len(len: usize, out: &mut [u8]) -> Result<(), WireError> {
    debug_assert_eq!(out.len(), PKT_SIZE_SIZE);
    if len >= 1 << 14 {
        return Err(WireError::FrameTooLarge {
            len,
            max: (1 << 14) - 1,
        });
    }
    out.fill(0);
    let mut buf = unsigned_varint::encode::u64_buffer();
    let bytes = unsigned_varint::encode::u64(len as u64, &mut buf);
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Decode a plaintext length from the 2-byte field.
pub fn decode_frame_len(raw: &[u8]) -> Result<usize, WireError> {
    let (value, _) =
        unsigned_varint::decode::u64(&raw[..PKT_SIZE_SIZE]).map_err(|_| WireError::BadVarint)?;
    Ok(value as usize)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("nonce counter {0} does not fit the 8-byte wire field")]
    NonceOverflow(u64),

    #[error("malformed varint field")]
    BadVarint,

    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
