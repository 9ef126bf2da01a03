//! TAP device collaborator — frame-oriented read/write seams and the Linux
//! `/dev/net/tun` implementation.
//!
//! The datapath only sees the `FrameRead` / `FrameWrite` traits: the
//! multiplexer owns a reader, each peer datapath owns a writer. On Linux the
//! two sides are dup'ed fds over one TAP attachment (a second TUNSETIFF on
//! the same name would fail with EBUSY). Channel-backed implementations
//! stand in for the kernel in tests and loopback setups.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

/// Source of Ethernet frames. Each call yields exactly one frame.
#[async_trait]
pub trait FrameRead: Send + 'static {
    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sink of Ethernet frames. Each call writes exactly one frame.
#[async_trait]
pub trait FrameWrite: Send + 'static {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Produces an independent writer for the device an interface name maps to.
/// The TAP registry caches one per interface so every peer bound to it can
/// write concurrently with the shared reader.
pub type WriterFactory = Arc<dyn Fn() -> io::Result<Box<dyn FrameWrite>> + Send + Sync>;

// ── Channel-backed frame endpoints ────────────────────────────────────────────

// In-memory stand-ins for the kernel device: tests inject frames through a
// sender and observe TAP writes on a receiver.

#[async_trait]
impl FrameRead for mpsc::Receiver<Vec<u8>> {
    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.recv().await {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame source closed",
            )),
        }
    }
}

#[async_trait]
impl FrameWrite for mpsc::Sender<Vec<u8>> {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.send(frame.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame sink closed"))
    }
}

/// Writer factory over a frame channel.
pub fn channel_writer_factory(tx: mpsc::Sender<Vec<u8>>) -> WriterFactory {
    Arc::new(move || Ok(Box::new(tx.clone()) as Box<dyn FrameWrite>))
}

// ── Linux TAP ─────────────────────────────────────────────────────────────────

/// Reader half of a Linux TAP attachment.
pub struct TapReader {
    fd: AsyncFd<OwnedFd>,
}

/// Writer half of a Linux TAP attachment.
pub struct TapWriter {
    fd: AsyncFd<OwnedFd>,
}

/// Open the named TAP interface and split it into the shared reader plus a
/// factory for per-peer writers.
///
/// Requires CAP_NET_ADMIN (or an existing persistent TAP owned by this
/// user). The fd is non-blocking; reads and writes go through tokio's
/// readiness machinery.
pub fn open_tap(name: &str) -> io::Result<(TapReader, WriterFactory)> {
    let master = Arc::new(tun_attach(name)?);

    let reader = TapReader {
        fd: AsyncFd::new(master.try_clone()?)?,
    };

    let factory: WriterFactory = Arc::new(move || {
        let fd = AsyncFd::new(master.try_clone()?)?;
        Ok(Box::new(TapWriter { fd }) as Box<dyn FrameWrite>)
    });

    Ok((reader, factory))
}

/// Attach to `/dev/net/tun` as an IFF_TAP (raw Ethernet, no packet-info
/// header) interface. FFI is confined to this function.
fn tun_attach(name: &str) -> io::Result<OwnedFd> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bad interface name {name:?}"),
        ));
    }

    let raw = unsafe {
        libc::open(
            c"/dev/net/tun".as_ptr(),
            libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF, &ifr) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

#[async_trait]
impl FrameRead for TapReader {
    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl FrameWrite for TapWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                // TAP writes are frame-atomic; a short count is a kernel bug.
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("partial tap write: {n} of {}", frame.len()),
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
