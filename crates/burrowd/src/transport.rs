//! Per-peer transport tasks.
//!
//! Each peer gets two tasks: a UDP reader that turns the socket into a
//! stream of datagram events (with a one-second read deadline reported as a
//! `Tick`, so the datapath can count quiet seconds), and the datapath task
//! that exclusively owns the `Peer` and drives `pkt_process` / `eth_process`
//! in strict sequence. The supervisor rebuilds the whole arrangement on
//! timeout or key exhaustion — the slot where a real re-handshake would run.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use burrow_core::config::{NetworkConfig, PeerConf, PeerStatic};
use burrow_core::wire::TAG_SIZE;

use crate::device::{self, FrameWrite};
use crate::peer::{DatagramSink, Peer, PeerStats, RxVerdict};
use crate::tap::{self, TapConf, TapHandle, TapRegistry};

/// Read deadline on the peer socket. Every expiry surfaces as one quiet
/// tick; `timeout` consecutive ticks tear the peer down.
pub const UDP_READ_DEADLINE: Duration = Duration::from_secs(1);

/// Why a datapath run ended. I/O failures surface as errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Shutdown was requested.
    Terminated,
    /// No authenticated inbound datagram for a full timeout.
    Timeout,
    /// The per-key byte budget is spent; rekey and rebuild.
    KeyExhausted,
}

/// One unit out of the UDP reader.
pub enum PktEvent {
    /// A received datagram; the buffer goes back through the ready channel.
    Datagram(BytesMut),
    /// The read deadline expired with nothing received.
    Tick,
    /// The socket failed; the reader is gone.
    Fatal(io::Error),
}

// ── UDP reader ────────────────────────────────────────────────────────────────

/// Read datagrams into a single recycled buffer and hand them to the
/// datapath, waiting for the buffer to come back before the next read.
pub async fn udp_reader(
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<PktEvent>,
    mut ready: mpsc::Receiver<BytesMut>,
    buf_len: usize,
) {
    let mut buf = BytesMut::zeroed(buf_len);
    loop {
        buf.resize(buf_len, 0);
        match tokio::time::timeout(UDP_READ_DEADLINE, socket.recv(&mut buf[..])).await {
            Err(_deadline) => {
                if events.send(PktEvent::Tick).await.is_err() {
                    return;
                }
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                if events.send(PktEvent::Datagram(buf)).await.is_err() {
                    return;
                }
                match ready.recv().await {
                    Some(returned) => buf = returned,
                    None => return,
                }
            }
            Ok(Err(e)) => {
                let _ = events.send(PktEvent::Fatal(e)).await;
                return;
            }
        }
    }
}

/// Spawn the reader task; returns the event stream and the buffer-return
/// channel for the datapath.
pub fn spawn_udp_reader(
    socket: Arc<UdpSocket>,
    buf_len: usize,
) -> (mpsc::Receiver<PktEvent>, mpsc::Sender<BytesMut>) {
    let (event_tx, event_rx) = mpsc::channel(1);
    let (ready_tx, ready_rx) = mpsc::channel(1);
    tokio::spawn(udp_reader(socket, event_tx, ready_rx, buf_len));
    (event_rx, ready_tx)
}

// ── Datapath ──────────────────────────────────────────────────────────────────

/// The single task that owns a `Peer` and both of its hot paths.
pub struct Datapath {
    peer: Peer,
    /// Full liveness timeout; the peer's own threshold only paces
    /// heartbeats.
    liveness: Duration,
    tap: TapHandle,
    tap_writer: Box<dyn FrameWrite>,
    conn: Box<dyn DatagramSink>,
    events: mpsc::Receiver<PktEvent>,
    ready: mpsc::Sender<BytesMut>,
    shutdown: broadcast::Receiver<()>,
}

impl Datapath {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: Peer,
        liveness: Duration,
        tap: TapHandle,
        tap_writer: Box<dyn FrameWrite>,
        conn: Box<dyn DatagramSink>,
        events: mpsc::Receiver<PktEvent>,
        ready: mpsc::Sender<BytesMut>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            peer,
            liveness,
            tap,
            tap_writer,
            conn,
            events,
            ready,
            shutdown,
        }
    }

    /// Drive the peer until shutdown, timeout or key exhaustion. Returns
    /// the exit reason and the final counters.
    pub async fn run(mut self) -> Result<(LoopExit, PeerStats)> {
        let quiet_limit = self.liveness.as_secs().max(1) as u32;
        let mut quiet = 0u32;

        loop {
            tokio::select! { biased;
                _ = self.shutdown.recv() => {
                    tracing::info!(peer = %self.peer.id(), "datapath shutting down");
                    return Ok((LoopExit::Terminated, self.peer.stats));
                }

                event = self.events.recv() => match event {
                    None => bail!("udp reader ended unexpectedly"),
                    Some(PktEvent::Fatal(e)) => {
                        return Err(e).context("udp receive failed");
                    }
                    Some(PktEvent::Tick) => {
                        quiet += 1;
                        if quiet >= quiet_limit {
                            return Ok((LoopExit::Timeout, self.peer.stats));
                        }
                    }
                    Some(PktEvent::Datagram(data)) => {
                        let verdict = self
                            .peer
                            .pkt_process(data, self.tap_writer.as_mut(), &self.ready)
                            .await?;
                        if verdict != RxVerdict::Unauthenticated {
                            quiet = 0;
                        }
                    }
                },

                frame = self.tap.sink.recv() => match frame {
                    None => bail!("tap multiplexer closed"),
                    Some(frame) => {
                        self.peer
                            .eth_process(frame, self.conn.as_mut(), &self.tap.ready)
                            .await?;
                    }
                },
            }

            if self.peer.key_exhausted() {
                return Ok((LoopExit::KeyExhausted, self.peer.stats));
            }
        }
    }
}

// ── Socket setup ──────────────────────────────────────────────────────────────

/// Bind the local UDP endpoint and connect it to the peer.
pub async fn bind_udp(bind: &str, remote: &str) -> Result<Arc<UdpSocket>> {
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("bad bind address {bind:?}"))?;

    let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&bind_addr.into()).context("bind()")?;

    let socket = UdpSocket::from_std(socket.into()).context("tokio socket")?;
    socket
        .connect(remote)
        .await
        .with_context(|| format!("connect {remote}"))?;
    Ok(Arc::new(socket))
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Run one peer forever: build it, drive it, and rebuild it whenever the
/// key budget runs out or the remote goes quiet. With statically configured
/// keys the rebuild stands in for re-running the handshake.
pub async fn supervise_peer(
    registry: TapRegistry,
    net: NetworkConfig,
    peer_cfg: PeerStatic,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let conf = peer_cfg.peer_conf()?;

    loop {
        let (exit, stats) = run_once(&registry, &net, &peer_cfg, &conf, shutdown.resubscribe())
            .await
            .with_context(|| format!("peer {}", conf.id))?;

        tracing::info!(
            peer = %conf.id,
            frames_in = stats.frames_in,
            frames_out = stats.frames_out,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            frames_unauth = stats.frames_unauth,
            frames_dup = stats.frames_dup,
            heartbeat_recv = stats.heartbeat_recv,
            heartbeat_sent = stats.heartbeat_sent,
            "datapath finished"
        );

        match exit {
            LoopExit::Terminated => return Ok(()),
            LoopExit::Timeout => {
                tracing::warn!(peer = %conf.id, addr = %peer_cfg.addr, "peer timed out, re-establishing");
            }
            LoopExit::KeyExhausted => {
                tracing::info!(peer = %conf.id, "key budget exhausted, rekeying");
            }
        }
    }
}

async fn run_once(
    registry: &TapRegistry,
    net: &NetworkConfig,
    peer_cfg: &PeerStatic,
    conf: &PeerConf,
    shutdown: broadcast::Receiver<()>,
) -> Result<(LoopExit, PeerStats)> {
    let key = peer_cfg.session_key()?;
    let peer = Peer::new(
        peer_cfg.addr.clone(),
        conf,
        key,
        peer_cfg.initial_nonce(),
        net.mtu,
    );

    let socket = bind_udp(&net.bind, &peer_cfg.addr).await?;

    let tap_conf = TapConf {
        timeout: conf.timeout,
        cpr_kibps: conf.cpr_kibps,
        mtu: net.mtu,
    };
    let iface = net.interface.clone();
    let (tap_handle, tap_writer) = tap::listen(registry, &net.interface, &tap_conf, move || {
        device::open_tap(&iface)
    })
    .context("tap attach")?;

    let (events, ready) = spawn_udp_reader(socket.clone(), net.mtu + TAG_SIZE + 64);

    tracing::info!(peer = %conf.id, addr = %peer_cfg.addr, "peer established");
    Datapath::new(
        peer,
        conf.timeout,
        tap_handle,
        tap_writer,
        Box::new(socket),
        events,
        ready,
        shutdown,
    )
    .run()
    .await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
