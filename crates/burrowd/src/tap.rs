//! TAP multiplexer — one shared reader per interface name, fanned out to one
//! peer datapath at a time, with heartbeat ticks injected on a timer.
//!
//! The reader and its consumer exchange a single read buffer in a strict
//! rendezvous: the reader only reads from the device while it holds the
//! buffer, and the consumer hands the buffer back on `ready` once it has
//! copied the frame out. Heartbeats are empty frames and carry no buffer, so
//! they flow in either state. On rekey the old consumer disappears and a new
//! one attaches to the same reader; if the reader is still armed with the
//! circulating buffer, the newcomer's initial arming signal is skipped —
//! arming twice would let the reader overwrite an unreleased frame.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use burrow_core::shaper;

use crate::device::{FrameRead, FrameWrite, WriterFactory};

// ── Registry ──────────────────────────────────────────────────────────────────

/// Per-consumer parameters for one attachment.
#[derive(Debug, Clone)]
pub struct TapConf {
    pub timeout: Duration,
    pub cpr_kibps: u32,
    pub mtu: usize,
}

/// Consumer side of an attachment.
pub struct TapHandle {
    /// Frames from the device; an empty frame is a heartbeat tick.
    pub sink: mpsc::Receiver<BytesMut>,
    /// Returns the read buffer, re-arming the reader.
    pub ready: mpsc::Sender<BytesMut>,
    /// An explicit send stops the reader task. Dropping the handle merely
    /// detaches, leaving the reader parked for the next consumer.
    pub terminate: mpsc::Sender<()>,
}

/// Reader side of an attachment.
struct Consumer {
    sink: mpsc::Sender<BytesMut>,
    ready: mpsc::Receiver<BytesMut>,
    terminate: mpsc::Receiver<()>,
    heartbeat: Duration,
}

pub struct TapEntry {
    attach: mpsc::Sender<Consumer>,
    /// True while the reader holds the circulating buffer (is armed). A new
    /// consumer must not arm an already-armed reader.
    synced: Arc<AtomicBool>,
    writer: WriterFactory,
}

/// Process-wide interface-name → reader map, created once at startup and
/// handed to everything that needs a TAP. Never two readers on one name.
pub type TapRegistry = Arc<DashMap<String, TapEntry>>;

pub fn new_registry() -> TapRegistry {
    Arc::new(DashMap::new())
}

// ── Attachment ────────────────────────────────────────────────────────────────

/// Attach a consumer to the named interface, opening the device via `open`
/// if this is the first attachment. Returns the consumer channels and a
/// fresh writer for the same device.
pub fn listen<D, F>(
    registry: &TapRegistry,
    name: &str,
    conf: &TapConf,
    open: F,
) -> io::Result<(TapHandle, Box<dyn FrameWrite>)>
where
    D: FrameRead,
    F: FnOnce() -> io::Result<(D, WriterFactory)>,
{
    let heartbeat = shaper::heartbeat_period(conf.timeout, conf.cpr_kibps, conf.mtu);
    let (sink_tx, sink_rx) = mpsc::channel(1);
    let (ready_tx, ready_rx) = mpsc::channel(1);
    let (term_tx, term_rx) = mpsc::channel(1);
    let consumer = Consumer {
        sink: sink_tx,
        ready: ready_rx,
        terminate: term_rx,
        heartbeat,
    };
    let handle = TapHandle {
        sink: sink_rx,
        ready: ready_tx.clone(),
        terminate: term_tx,
    };

    if let Some(entry) = registry.get(name) {
        let armed = entry.synced.load(Ordering::Acquire);
        entry.attach.try_send(consumer).map_err(|_| {
            io::Error::new(io::ErrorKind::WouldBlock, "tap attach already pending")
        })?;
        if !armed {
            // The reader is parked without a buffer; arm it with a fresh one.
            let _ = ready_tx.try_send(BytesMut::zeroed(conf.mtu));
        }
        // Armed case: skip the initial signal — the circulating buffer is
        // already with the reader.
        let writer = (entry.writer)()?;
        return Ok((handle, writer));
    }

    let (device, writer_factory) = open()?;
    let writer = (writer_factory)()?;
    let synced = Arc::new(AtomicBool::new(false));
    let (attach_tx, attach_rx) = mpsc::channel(1);
    attach_tx
        .try_send(consumer)
        .expect("fresh attach channel has capacity");
    registry.insert(
        name.to_string(),
        TapEntry {
            attach: attach_tx,
            synced: synced.clone(),
            writer: writer_factory,
        },
    );
    tokio::spawn(reader_loop(
        name.to_string(),
        device,
        attach_rx,
        synced,
        registry.clone(),
        conf.mtu,
    ));
    let _ = ready_tx.try_send(BytesMut::zeroed(conf.mtu));
    Ok((handle, writer))
}

// ── Reader task ───────────────────────────────────────────────────────────────

async fn reader_loop<D: FrameRead>(
    name: String,
    mut device: D,
    mut attach_rx: mpsc::Receiver<Consumer>,
    synced: Arc<AtomicBool>,
    registry: TapRegistry,
    mtu: usize,
) {
    tracing::info!(iface = %name, "tap reader starting");
    let mut pending: Option<Consumer> = None;
    let mut read_buf: Option<BytesMut> = None;

    'consumers: loop {
        let mut consumer = match pending.take() {
            Some(c) => c,
            None => match attach_rx.recv().await {
                Some(c) => c,
                None => break 'consumers,
            },
        };
        let mut tick = interval_at(Instant::now() + consumer.heartbeat, consumer.heartbeat);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(mut buf) = read_buf.take() {
                // FORWARD_NEXT: armed. Read one frame, emitting heartbeats
                // while we wait.
                synced.store(true, Ordering::Release);
                buf.resize(mtu, 0);
                tokio::select! { biased;
                    t = consumer.terminate.recv() => {
                        read_buf = Some(buf);
                        match t {
                            Some(()) => break 'consumers,
                            None => continue 'consumers,
                        }
                    }
                    result = device.read_frame(&mut buf[..]) => match result {
                        Ok(0) => {
                            read_buf = Some(buf);
                        }
                        Ok(n) => {
                            buf.truncate(n);
                            match consumer.sink.send(buf).await {
                                // Only a successful handoff disarms us; a
                                // vanished consumer leaves the buffer here.
                                Ok(()) => synced.store(false, Ordering::Release),
                                Err(mpsc::error::SendError(b)) => {
                                    read_buf = Some(b);
                                    continue 'consumers;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(iface = %name, error = %e, "tap read failed, stopping reader");
                            break 'consumers;
                        }
                    },
                    _ = tick.tick() => {
                        read_buf = Some(buf);
                        if consumer.sink.send(BytesMut::new()).await.is_err() {
                            continue 'consumers;
                        }
                    }
                    newc = attach_rx.recv() => {
                        read_buf = Some(buf);
                        match newc {
                            Some(c) => { pending = Some(c); continue 'consumers; }
                            None => break 'consumers,
                        }
                    }
                }
            } else {
                // WAIT_READY: the consumer holds the buffer. Heartbeats
                // still flow.
                synced.store(false, Ordering::Release);
                tokio::select! { biased;
                    t = consumer.terminate.recv() => match t {
                        Some(()) => break 'consumers,
                        None => continue 'consumers,
                    },
                    b = consumer.ready.recv() => match b {
                        Some(b) => read_buf = Some(b),
                        None => continue 'consumers,
                    },
                    _ = tick.tick() => {
                        if consumer.sink.send(BytesMut::new()).await.is_err() {
                            continue 'consumers;
                        }
                    }
                    newc = attach_rx.recv() => match newc {
                        Some(c) => { pending = Some(c); continue 'consumers; }
                        None => break 'consumers,
                    },
                }
            }
        }
    }

    registry.remove(&name);
    tracing::info!(iface = %name, "tap reader stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
