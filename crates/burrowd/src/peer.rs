//! Peer datapath — the two hot paths of the tunnel.
//!
//! One `Peer` per authenticated remote endpoint, owned exclusively by its
//! datapath task, so the scratch buffers and nonce counters never need a
//! lock. `eth_process` turns an Ethernet frame (or a heartbeat tick) into
//! one ciphertext datagram; `pkt_process` turns a received datagram back
//! into a TAP write.
//!
//! Framing: the sender writes plaintext at offset `S20BS` of its scratch
//! buffer and XORs the whole region with the Salsa20 keystream, so the first
//! `SSIZE` bytes come out as pure keystream and serve as the one-time
//! Poly1305 key for that datagram. The obfuscated nonce is overlaid just in
//! front of the length field and the MAC covers nonce + ciphertext.
//!
//! The `ready` channels carry the shared read buffers back to their reader
//! tasks. A buffer is returned exactly once per consumed frame/datagram, as
//! soon as its bytes are dead — before any cipher work on the outbound path,
//! right after nonce decryption on the inbound path.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use zeroize::Zeroize;

use burrow_core::config::PeerConf;
use burrow_core::crypto::{self, NonceCipher, PayloadTransform, PeerId, SessionKey, StreamTransform};
use burrow_core::shaper;
use burrow_core::replay::NonceWindow;
use burrow_core::wire::{
    self, WireError, MAX_BYTES_PER_KEY, NONCE_SIZE, PKT_SIZE_SIZE, S20BS, SSIZE, TAG_SIZE,
    TIMEOUT_HEARTBEAT,
};

use crate::device::FrameWrite;

// ── Transport sink ────────────────────────────────────────────────────────────

/// Where ciphertext datagrams go — in practice a connected UDP socket.
#[async_trait]
pub trait DatagramSink: Send + 'static {
    async fn send_datagram(&mut self, datagram: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl DatagramSink for Arc<UdpSocket> {
    async fn send_datagram(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.send(datagram).await.map(|_| ())
    }
}

// Channel-backed sink for tests and in-process loopbacks.
#[async_trait]
impl DatagramSink for mpsc::Sender<Vec<u8>> {
    async fn send_datagram(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.send(datagram.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "datagram sink closed"))
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// Per-peer traffic counters. Wire bytes include nonce and tag; payload
/// bytes count only the Ethernet frames themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bytes_payload_in: u64,
    pub bytes_payload_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_unauth: u64,
    pub frames_dup: u64,
    pub heartbeat_recv: u64,
    pub heartbeat_sent: u64,
}

/// What became of one received datagram.
///
/// Everything except `Unauthenticated` proves the remote side holds the
/// session key, so the liveness timer resets on duplicates and heartbeats
/// too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    /// Authenticated frame, written to the TAP.
    Frame,
    /// Authenticated zero-length keep-alive.
    Heartbeat,
    /// Authenticated but already inside the replay window. Dropped.
    Duplicate,
    /// Failed the MAC (or was too short/long to carry one). Dropped.
    Unauthenticated,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ── Peer ──────────────────────────────────────────────────────────────────────

/// Per-peer state: key material, nonce counters, replay window, traffic
/// counters and the scratch buffers both hot paths work in.
///
/// Not reentrant and not `Sync` by design — exactly one datapath task drives
/// `pkt_process` and `eth_process` in strict sequence.
pub struct Peer {
    addr: String,
    id: PeerId,
    key: SessionKey,
    nonce_cipher: NonceCipher,
    transform: Arc<dyn PayloadTransform>,

    nonce_our: u64,
    nonce_recv: u64,
    window: NonceWindow,

    mtu: usize,
    noise: bool,
    cpr_cycle: std::time::Duration,
    timeout: std::time::Duration,

    established: Instant,
    last_ping: Instant,
    last_sent: Instant,

    pub stats: PeerStats,

    // Scratch, reused across calls to keep the hot paths allocation-free.
    buf: Vec<u8>,
    tag: [u8; TAG_SIZE],
    key_auth: [u8; SSIZE],
    nonce_buf: [u8; NONCE_SIZE],
}

impl Peer {
    /// Build a peer from handshake output: the shared key, the peer
    /// parameters and the initial outbound nonce (1 for the initiating
    /// side, 0 for the responding side).
    pub fn new(
        addr: impl Into<String>,
        conf: &PeerConf,
        key: SessionKey,
        initial_nonce: u64,
        mtu: usize,
    ) -> Self {
        let cpr_cycle = shaper::cpr_cycle(conf.cpr_kibps, mtu);
        // Under CPR every datagram must look identical and heartbeats fill
        // the exact send cadence. Unshaped, a heartbeat goes out after a
        // quarter of the liveness timeout so four keep-alives fit into one
        // teardown window.
        let shaped = conf.cpr_kibps > 0;
        let now = Instant::now();
        let nonce_cipher = NonceCipher::new(&key);
        Self {
            addr: addr.into(),
            id: conf.id,
            key,
            nonce_cipher,
            transform: Arc::new(StreamTransform),
            nonce_our: initial_nonce,
            nonce_recv: 0,
            window: NonceWindow::new(),
            mtu,
            noise: conf.noise || shaped,
            cpr_cycle,
            timeout: if shaped {
                cpr_cycle
            } else {
                conf.timeout / TIMEOUT_HEARTBEAT
            },
            established: now,
            last_ping: now,
            last_sent: now,
            stats: PeerStats::default(),
            buf: vec![0u8; S20BS + mtu + TAG_SIZE],
            tag: [0u8; TAG_SIZE],
            key_auth: [0u8; SSIZE],
            nonce_buf: [0u8; NONCE_SIZE],
        }
    }

    /// Swap in an alternative confidentiality transform.
    pub fn with_transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn nonce_our(&self) -> u64 {
        self.nonce_our
    }

    pub fn nonce_recv(&self) -> u64 {
        self.nonce_recv
    }

    /// Heartbeat threshold: a heartbeat tick produces a datagram only when
    /// nothing was sent for this long. One CPR cycle when shaped, a quarter
    /// of the liveness timeout otherwise.
    pub fn timeout(&self) -> std::time::Duration {
        self.timeout
    }

    pub fn established(&self) -> Instant {
        self.established
    }

    /// The per-key byte budget is spent; the host must tear this peer down
    /// and negotiate a fresh key.
    pub fn key_exhausted(&self) -> bool {
        self.stats.bytes_in + self.stats.bytes_out > MAX_BYTES_PER_KEY
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Encrypt one Ethernet frame (or emit a heartbeat) as a ciphertext
    /// datagram on `conn`.
    ///
    /// An empty `frame` is a heartbeat tick: it produces a datagram only if
    /// nothing was sent for a full timeout. A non-empty frame's buffer is
    /// handed back on `ready` as soon as it has been copied into scratch, so
    /// the TAP reader can refill it while we do cipher work and pacing.
    ///
    /// Returns true iff a datagram was written.
    pub async fn eth_process(
        &mut self,
        frame: BytesMut,
        conn: &mut dyn DatagramSink,
        ready: &mpsc::Sender<BytesMut>,
    ) -> Result<bool, PeerError> {
        let now = Instant::now();
        if frame.is_empty() && now < self.last_sent + self.timeout {
            return Ok(false);
        }

        let len = frame.len();
        if len > wire::max_frame_len(self.mtu) {
            tracing::warn!(peer = %self.id, len, mtu = self.mtu, "dropping oversized tap frame");
            let _ = ready.send(frame).await;
            return Ok(false);
        }

        self.buf.fill(0);
        if len > 0 {
            self.buf[S20BS + PKT_SIZE_SIZE..S20BS + PKT_SIZE_SIZE + len].copy_from_slice(&frame);
            // The TAP read buffer is dead from here on — release it early.
            let _ = ready.send(frame).await;
            wire::encode_frame_len(len, &mut self.buf[S20BS..S20BS + PKT_SIZE_SIZE])?;
            self.stats.bytes_payload_out += len as u64;
        } else {
            self.stats.heartbeat_sent += 1;
        }

        self.nonce_our += 2;
        wire::encode_nonce(self.nonce_our, &mut self.nonce_buf)?;
        self.nonce_cipher.obfuscate(&mut self.nonce_buf);

        // Padded datagrams occupy a fixed mtu-sized wire frame; bare ones
        // stop right after the payload.
        let end = if self.noise {
            S20BS - NONCE_SIZE + self.mtu
        } else {
            S20BS + PKT_SIZE_SIZE + len
        };
        self.transform
            .seal(&self.key, &self.nonce_buf, &mut self.buf[..end]);

        self.key_auth.copy_from_slice(&self.buf[..SSIZE]);
        self.buf[S20BS - NONCE_SIZE..S20BS].copy_from_slice(&self.nonce_buf);
        self.tag = crypto::mac(&self.buf[S20BS - NONCE_SIZE..end], &self.key_auth);

        let wire_len = end - (S20BS - NONCE_SIZE) + TAG_SIZE;
        self.stats.bytes_out += wire_len as u64;
        self.stats.frames_out += 1;

        let mut now = Instant::now();
        if self.cpr_cycle > std::time::Duration::ZERO {
            let due = self.last_sent + self.cpr_cycle;
            if due > now {
                tokio::time::sleep_until(due).await;
                now = due;
            }
        }
        self.last_sent = now;

        self.buf[end..end + TAG_SIZE].copy_from_slice(&self.tag);
        conn.send_datagram(&self.buf[S20BS - NONCE_SIZE..end + TAG_SIZE])
            .await?;
        Ok(true)
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Authenticate and decrypt one received datagram; deliver its frame to
    /// the TAP writer.
    ///
    /// The UDP read buffer travels back on `ready` exactly once per call:
    /// immediately on MAC failure, otherwise right after the on-wire nonce
    /// has been decrypted (nothing reads the datagram bytes after that).
    /// Replay and MAC failures are silent on the wire — counters only.
    pub async fn pkt_process(
        &mut self,
        data: BytesMut,
        tap: &mut dyn FrameWrite,
        ready: &mpsc::Sender<BytesMut>,
    ) -> Result<RxVerdict, PeerError> {
        let n = data.len();
        if n < wire::MIN_PKT_LENGTH || n > self.mtu + TAG_SIZE {
            self.stats.frames_unauth += 1;
            let _ = ready.send(data).await;
            return Ok(RxVerdict::Unauthenticated);
        }
        let ciphertext_len = n - NONCE_SIZE - TAG_SIZE;

        self.buf.fill(0);
        self.tag.copy_from_slice(&data[n - TAG_SIZE..]);
        self.buf[S20BS..S20BS + ciphertext_len].copy_from_slice(&data[NONCE_SIZE..n - TAG_SIZE]);

        let wire_nonce: [u8; NONCE_SIZE] = data[..NONCE_SIZE]
            .try_into()
            .expect("slice is NONCE_SIZE long");
        self.transform
            .open(&self.key, &wire_nonce, &mut self.buf[..S20BS + ciphertext_len]);
        self.key_auth.copy_from_slice(&self.buf[..SSIZE]);

        if !crypto::mac_verify(&self.tag, &data[..n - TAG_SIZE], &self.key_auth) {
            self.stats.frames_unauth += 1;
            tracing::debug!(peer = %self.id, len = n, "datagram failed authentication");
            let _ = ready.send(data).await;
            return Ok(RxVerdict::Unauthenticated);
        }

        self.nonce_cipher.clarify(&mut self.nonce_buf, &wire_nonce);
        let _ = ready.send(data).await;

        let clear = wire::decode_nonce(&self.nonce_buf)?;
        if !self.window.insert(clear) {
            self.stats.frames_dup += 1;
            tracing::debug!(peer = %self.id, nonce = clear, "duplicate datagram");
            return Ok(RxVerdict::Duplicate);
        }

        self.stats.frames_in += 1;
        self.stats.bytes_in += n as u64;
        self.last_ping = Instant::now();
        self.nonce_recv = clear;

        let len = wire::decode_frame_len(&self.buf[S20BS..S20BS + PKT_SIZE_SIZE])?;
        if len == 0 {
            self.stats.heartbeat_recv += 1;
            return Ok(RxVerdict::Heartbeat);
        }
        if PKT_SIZE_SIZE + len > ciphertext_len {
            return Err(WireError::FrameTooLarge {
                len,
                max: ciphertext_len - PKT_SIZE_SIZE,
            }
            .into());
        }

        self.stats.bytes_payload_in += len as u64;
        tap.write_frame(&self.buf[S20BS + PKT_SIZE_SIZE..S20BS + PKT_SIZE_SIZE + len])
            .await?;
        Ok(RxVerdict::Frame)
    }

    /// Wipe every scratch region holding key-derived material. The session
    /// key zeroizes itself on drop.
    pub fn scrub(&mut self) {
        self.buf.zeroize();
        self.tag.zeroize();
        self.key_auth.zeroize();
        self.nonce_buf.zeroize();
        self.window.clear();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.scrub();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
