//! Async packet I/O over the tunnel descriptor.
//!
//! A fixed pool of blocking read slots polls the descriptor and hands
//! inbound packets to the async side over a channel; writes are
//! synchronous on the caller. When the session uses address-family
//! framing, reads strip the 4-byte network-order prefix and writes
//! prepend one derived from the IP version nibble.
//!
//! The descriptor is owned by at most one engine. In owned mode it closes
//! once the last read slot has drained after `stop`; in retained mode it
//! is never closed here.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::ErrorKind;
use crate::stats::SessionStats;

/// Address-family prefix length when framing is enabled.
pub const PREFIX_LEN: usize = 4;

/// Read buffer size; must cover MTU plus the framing prefix.
const BUFFER_SIZE: usize = 4096;

/// Pooled buffers: two per read slot at the default slot count.
const POOL_BUFFERS: usize = 16;

/// Inbound packet channel depth before read slots back off.
const QUEUE_DEPTH: usize = 256;

/// Poll timeout; bounds how long a halted slot keeps running.
const POLL_TIMEOUT_MS: i32 = 50;

/// Recycles read buffers between the slots and the packet consumer.
///
/// Buffers come out as `BytesMut`, travel as frozen `Bytes`, and return
/// via [`try_reclaim`](Self::try_reclaim) once the consumer holds the
/// last reference. Misses fall back to fresh allocations, so a consumer
/// that keeps packets alive only costs allocation, never correctness.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buffers: Mutex<VecDeque<BytesMut>>,
    buffer_size: usize,
    max_pooled: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let buffers = (0..pool_size)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(buffers),
                buffer_size,
                max_pooled: pool_size,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Take a buffer, recycling when possible.
    pub fn get(&self) -> BytesMut {
        match self.lock().pop_front() {
            Some(buf) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.inner.buffer_size)
            }
        }
    }

    /// Return a buffer. Beyond `max_pooled` it is simply dropped.
    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let mut q = self.lock();
        if q.len() < self.inner.max_pooled {
            q.push_back(buf);
        }
    }

    /// Recover a frozen packet's storage if this was the last reference.
    pub fn try_reclaim(&self, bytes: Bytes) {
        if let Ok(buf) = bytes.try_into_mut() {
            self.put(buf);
        }
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.inner.hits.load(Ordering::Relaxed),
            self.inner.misses.load(Ordering::Relaxed),
        )
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.stats();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BytesMut>> {
        self.inner.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct IoShared {
    fd: RawFd,
    retain_fd: bool,
    tun_prefix: bool,
    halt: AtomicBool,
    stats: Arc<SessionStats>,
    pool: BufferPool,
}

impl Drop for IoShared {
    fn drop(&mut self) {
        // last slot out closes the descriptor in owned mode
        if !self.retain_fd && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// Packet engine over one tunnel descriptor.
pub struct TunIo {
    shared: Arc<IoShared>,
    tx: Option<mpsc::Sender<Bytes>>,
    rx: Option<mpsc::Receiver<Bytes>>,
    slots: Vec<JoinHandle<()>>,
}

impl TunIo {
    pub fn new(fd: RawFd, retain_fd: bool, tun_prefix: bool, stats: Arc<SessionStats>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        Self {
            shared: Arc::new(IoShared {
                fd,
                retain_fd,
                tun_prefix,
                halt: AtomicBool::new(false),
                stats,
                pool: BufferPool::new(POOL_BUFFERS, BUFFER_SIZE),
            }),
            tx: Some(tx),
            rx: Some(rx),
            slots: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        "tun"
    }

    /// Launch `n_parallel` read slots and hand back the packet receiver.
    /// Returns `None` on a halted or already-started engine.
    pub fn start(&mut self, n_parallel: usize) -> Option<mpsc::Receiver<Bytes>> {
        if self.shared.halt.load(Ordering::SeqCst) {
            return None;
        }
        let tx = self.tx.take()?;
        let rx = self.rx.take()?;
        let n = n_parallel.max(1);
        for slot in 0..n {
            let shared = self.shared.clone();
            let tx = tx.clone();
            self.slots
                .push(tokio::task::spawn_blocking(move || read_slot(slot, shared, tx)));
        }
        info!(slots = n, prefix = self.shared.tun_prefix, "tun packet engine started");
        Some(rx)
    }

    /// Handle for returning delivered packet buffers to the read slots.
    pub fn pool(&self) -> BufferPool {
        self.shared.pool.clone()
    }

    /// Write one packet. With framing enabled the address-family prefix
    /// is derived from the first payload nibble; a packet whose version
    /// cannot be identified is refused. Success means the whole frame was
    /// accepted in one write.
    pub fn write(&self, pkt: &[u8]) -> bool {
        if self.shared.halt.load(Ordering::SeqCst) {
            return false;
        }
        if self.shared.tun_prefix {
            let af = match pkt.first().map(|b| b >> 4) {
                Some(4) => libc::AF_INET as u32,
                Some(6) => libc::AF_INET6 as u32,
                _ => {
                    error!("tun write: cannot derive address-family prefix");
                    self.shared.stats.error(ErrorKind::TunFramingError);
                    return false;
                }
            };
            let mut frame = BytesMut::with_capacity(PREFIX_LEN + pkt.len());
            frame.put_u32(af);
            frame.extend_from_slice(pkt);
            self.write_frame(&frame)
        } else {
            self.write_frame(pkt)
        }
    }

    fn write_frame(&self, frame: &[u8]) -> bool {
        let n = unsafe {
            libc::write(
                self.shared.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
            )
        };
        if n < 0 {
            error!("tun write error: {}", std::io::Error::last_os_error());
            self.shared.stats.error(ErrorKind::TunWriteError);
            return false;
        }
        let n = n as usize;
        self.shared.stats.add_tun_out(n as u64);
        if n == frame.len() {
            true
        } else {
            error!("tun partial write ({} of {} bytes)", n, frame.len());
            self.shared.stats.error(ErrorKind::TunWriteError);
            false
        }
    }

    /// One-shot halt. Read slots drain within the poll timeout; the
    /// descriptor closes after the last of them in owned mode.
    pub fn stop(&mut self) {
        if !self.shared.halt.swap(true, Ordering::SeqCst) {
            debug!("tun packet engine stopping");
        }
    }
}

impl Drop for TunIo {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_slot(slot: usize, shared: Arc<IoShared>, tx: mpsc::Sender<Bytes>) {
    debug!(slot, "tun read slot up");
    while !shared.halt.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd: shared.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let pr = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if pr < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            if !shared.halt.load(Ordering::SeqCst) {
                error!(slot, "tun poll error: {}", err);
                shared.stats.error(ErrorKind::TunReadError);
            }
            break;
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
            && pfd.revents & libc::POLLIN == 0
        {
            if !shared.halt.load(Ordering::SeqCst) {
                error!(slot, revents = pfd.revents, "tun descriptor failed");
                shared.stats.error(ErrorKind::TunReadError);
            }
            break;
        }
        if pr == 0 || pfd.revents & libc::POLLIN == 0 {
            continue;
        }

        let mut buf = shared.pool.get();
        buf.resize(shared.pool.buffer_size(), 0);
        let n = unsafe { libc::read(shared.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            shared.pool.put(buf);
            match err.kind() {
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => continue,
                _ => {
                    if !shared.halt.load(Ordering::SeqCst) {
                        error!(slot, "tun read error: {}", err);
                        shared.stats.error(ErrorKind::TunReadError);
                    }
                    continue;
                }
            }
        }
        if n == 0 {
            debug!(slot, "tun descriptor EOF");
            break;
        }

        buf.truncate(n as usize);
        shared.stats.add_tun_in(n as u64);

        let packet = if shared.tun_prefix {
            if buf.len() >= PREFIX_LEN {
                buf.freeze().slice(PREFIX_LEN..)
            } else {
                error!(slot, "tun read error: cannot read prefix");
                shared.stats.error(ErrorKind::TunReadError);
                shared.pool.put(buf);
                continue;
            }
        } else {
            buf.freeze()
        };

        if tx.blocking_send(packet).is_err() {
            // consumer gone
            break;
        }
    }
    debug!(slot, "tun read slot down");
}
