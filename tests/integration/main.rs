//! Burrow integration test harness.
//!
//! Each test wires up one or two complete datapaths — peer, TAP
//! multiplexer, UDP reader — over loopback UDP sockets, with channel-backed
//! TAP devices standing in for the kernel. No root, interfaces or
//! namespaces required; the suite always runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use burrow_core::config::PeerConf;
use burrow_core::crypto::{PeerId, SessionKey};
use burrow_core::wire;
use burrowd::device::channel_writer_factory;
use burrowd::peer::{Peer, PeerStats};
use burrowd::tap::{self, TapConf};
use burrowd::transport::{spawn_udp_reader, Datapath, LoopExit};

mod liveness;
mod tunnel;

pub const MTU: usize = 1452;

// ── Harness ───────────────────────────────────────────────────────────────────

/// One running datapath and its observation points.
pub struct Node {
    /// Inject frames as if the kernel TAP delivered them.
    pub tap_in: mpsc::Sender<Vec<u8>>,
    /// Frames the datapath wrote back to its TAP.
    pub tap_out: mpsc::Receiver<Vec<u8>>,
    /// The node's own socket — handy for injecting junk datagrams.
    pub socket: Arc<UdpSocket>,
    handle: JoinHandle<Result<(LoopExit, PeerStats)>>,
}

impl Node {
    /// Wait for the datapath to finish; returns its exit reason and final
    /// counters.
    pub async fn finish(self) -> (LoopExit, PeerStats) {
        self.handle
            .await
            .expect("datapath panicked")
            .expect("datapath failed")
    }
}

/// The session key both ends share in these tests.
pub fn shared_key() -> SessionKey {
    let mut bytes = [0u8; 32];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = i as u8;
    }
    SessionKey::from_bytes(bytes)
}

/// Two loopback UDP sockets connected to each other.
pub async fn socket_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.connect(b.local_addr().unwrap()).await.unwrap();
    b.connect(a.local_addr().unwrap()).await.unwrap();
    (Arc::new(a), Arc::new(b))
}

/// Spawn a complete datapath over `socket` with a channel-backed TAP.
pub fn spawn_node(
    socket: Arc<UdpSocket>,
    key: SessionKey,
    initiator: bool,
    timeout: Duration,
    shutdown: &broadcast::Sender<()>,
) -> Node {
    let conf = PeerConf {
        id: PeerId::derive(&key),
        timeout,
        noise: false,
        cpr_kibps: 0,
    };
    let peer = Peer::new(
        socket.peer_addr().unwrap().to_string(),
        &conf,
        key,
        if initiator { 1 } else { 0 },
        MTU,
    );

    let registry = tap::new_registry();
    let (tap_in, frames_rx) = mpsc::channel::<Vec<u8>>(64);
    let (written_tx, tap_out) = mpsc::channel::<Vec<u8>>(64);
    let tap_conf = TapConf {
        timeout,
        cpr_kibps: 0,
        mtu: MTU,
    };
    let iface = if initiator { "mock-a" } else { "mock-b" };
    let (tap_handle, tap_writer) = tap::listen(&registry, iface, &tap_conf, || {
        Ok((frames_rx, channel_writer_factory(written_tx)))
    })
    .expect("tap listen");

    let (events, ready) = spawn_udp_reader(socket.clone(), MTU + wire::TAG_SIZE + 64);
    let datapath = Datapath::new(
        peer,
        timeout,
        tap_handle,
        tap_writer,
        Box::new(socket.clone()),
        events,
        ready,
        shutdown.subscribe(),
    );

    Node {
        tap_in,
        tap_out,
        socket,
        handle: tokio::spawn(datapath.run()),
    }
}

/// Receive one tunnelled frame, failing loudly instead of hanging.
pub async fn recv_frame(node: &mut Node) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), node.tap_out.recv())
        .await
        .expect("timed out waiting for a tunnelled frame")
        .expect("tap channel closed")
}
