//! Per-socket connection state
//!
//! A `Conn` is owned by exactly one reactor and only ever touched on that
//! reactor's thread, so none of its state is locked. The inbound and
//! outbound ring buffers are borrowed from the shared buffer pool on
//! creation and returned on release.
//!
//! Inbound bytes live in two places: the ring buffer (residue of earlier
//! reads) and a staging scratch holding the bytes of the current `read(2)`.
//! `read`/`read_n` present the two as one span, borrowing an aggregator
//! from the byte-buffer pool when they actually straddle the seam;
//! `shift_n` consumes across the seam, ring first.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::bufpool;
use crate::error::{Error, Result};
use crate::eventloop::{EventLoop, LoopHandle};
use crate::ringbuf::RingBuffer;
use crate::socket::{self, NetAddr, RawAddr};

pub struct Conn {
    pub(crate) fd: RawFd,
    /// Kernel-form peer address; the reply target for UDP.
    pub(crate) sa: Option<RawAddr>,
    pub(crate) local_addr: Option<NetAddr>,
    pub(crate) remote_addr: Option<NetAddr>,
    pub(crate) opened: bool,
    ctx: Option<Box<dyn Any + Send>>,
    /// Bytes of the current read, not yet consumed past `buf_pos`.
    buffer: Vec<u8>,
    buf_pos: usize,
    pub(crate) inbound: RingBuffer,
    pub(crate) outbound: RingBuffer,
    /// Aggregator borrowed while a contiguous view spans ring + staging.
    byte_buffer: Option<Vec<u8>>,
    handle: ConnHandle,
}

impl Conn {
    pub(crate) fn new_tcp(fd: RawFd, sa: RawAddr, loop_handle: Arc<LoopHandle>) -> Conn {
        Conn {
            fd,
            sa: Some(sa),
            local_addr: None,
            remote_addr: None,
            opened: false,
            ctx: None,
            buffer: Vec::new(),
            buf_pos: 0,
            inbound: bufpool::get_ring_buffer(),
            outbound: bufpool::get_ring_buffer(),
            byte_buffer: None,
            handle: ConnHandle { fd, loop_handle },
        }
    }

    /// Throwaway connection synthesized per datagram. No pooled buffers:
    /// the frame is handed to the handler straight from the staging area.
    pub(crate) fn new_udp(
        fd: RawFd,
        sa: RawAddr,
        local_addr: Option<NetAddr>,
        loop_handle: Arc<LoopHandle>,
    ) -> Conn {
        let remote_addr = socket::raw_to_net_addr(&sa);
        Conn {
            fd,
            sa: Some(sa),
            local_addr,
            remote_addr,
            opened: false,
            ctx: None,
            buffer: Vec::new(),
            buf_pos: 0,
            inbound: RingBuffer::new(0),
            outbound: RingBuffer::new(0),
            byte_buffer: None,
            handle: ConnHandle { fd, loop_handle },
        }
    }

    /// Return pooled buffers and drop per-connection state.
    pub(crate) fn release(&mut self) {
        self.opened = false;
        self.sa = None;
        self.ctx = None;
        self.local_addr = None;
        self.remote_addr = None;
        self.buffer = Vec::new();
        self.buf_pos = 0;
        bufpool::put_ring_buffer(std::mem::replace(&mut self.inbound, RingBuffer::new(0)));
        bufpool::put_ring_buffer(std::mem::replace(&mut self.outbound, RingBuffer::new(0)));
        if let Some(bb) = self.byte_buffer.take() {
            bufpool::put_byte_buffer(bb);
        }
    }

    // ── Reactor-internal buffer management ───────────────────────────

    /// Load the bytes of a fresh `read(2)` into the staging scratch.
    pub(crate) fn stage(&mut self, data: &[u8]) {
        self.buffer.clear();
        self.buffer.extend_from_slice(data);
        self.buf_pos = 0;
    }

    fn staged(&self) -> &[u8] {
        &self.buffer[self.buf_pos..]
    }

    /// Move whatever the codec left in staging into the inbound ring for
    /// a future decode.
    pub(crate) fn absorb_staged(&mut self) {
        if self.buf_pos < self.buffer.len() {
            let (buffer, pos) = (&self.buffer, self.buf_pos);
            self.inbound.write(&buffer[pos..]);
        }
        self.buffer.clear();
        self.buf_pos = 0;
        if let Some(bb) = self.byte_buffer.take() {
            bufpool::put_byte_buffer(bb);
        }
    }

    /// Initial write on open: push what the socket takes, queue the rest.
    pub(crate) fn open(&mut self, buf: &[u8]) {
        match socket::write_fd(self.fd, buf) {
            Ok(n) if n < buf.len() => {
                self.outbound.write(&buf[n..]);
            }
            Ok(_) => {}
            Err(_) => {
                self.outbound.write(buf);
            }
        }
    }

    // ── User-facing buffer API (codec and handler side) ──────────────

    /// The whole readable span. Borrows an aggregator only when bytes sit
    /// in both the ring and the staging scratch.
    pub fn read(&mut self) -> &[u8] {
        if self.inbound.is_empty() {
            return self.staged();
        }
        let bb = {
            let staged = &self.buffer[self.buf_pos..];
            self.inbound.with_byte_buffer(staged)
        };
        if let Some(old) = self.byte_buffer.take() {
            bufpool::put_byte_buffer(old);
        }
        self.byte_buffer.insert(bb).as_slice()
    }

    /// Up to `n` readable bytes; `n == 0` or `n` past the end yields the
    /// whole span. Returns `(actual, bytes)`.
    pub fn read_n(&mut self, n: usize) -> (usize, &[u8]) {
        let in_len = self.inbound.length();
        let total = in_len + self.staged().len();
        let n = if n == 0 || n > total { total } else { n };
        if n == 0 {
            return (0, &[]);
        }
        if self.inbound.is_empty() {
            return (n, &self.buffer[self.buf_pos..self.buf_pos + n]);
        }

        let mut bb = bufpool::get_byte_buffer();
        {
            let (head, tail) = self.inbound.lazy_read(n);
            bb.extend_from_slice(head);
            bb.extend_from_slice(tail);
        }
        if in_len < n {
            let rest = n - in_len;
            bb.extend_from_slice(&self.buffer[self.buf_pos..self.buf_pos + rest]);
        }
        if let Some(old) = self.byte_buffer.take() {
            bufpool::put_byte_buffer(old);
        }
        (n, self.byte_buffer.insert(bb).as_slice())
    }

    /// Consume `n` bytes across ring then staging; consuming everything
    /// (or more) resets both. Returns the number actually consumed.
    pub fn shift_n(&mut self, n: usize) -> usize {
        let in_len = self.inbound.length();
        let total = in_len + self.staged().len();
        if n >= total {
            self.reset_buffer();
            return total;
        }
        if let Some(bb) = self.byte_buffer.take() {
            bufpool::put_byte_buffer(bb);
        }
        if self.inbound.is_empty() {
            self.buf_pos += n;
            return n;
        }
        if in_len > n {
            self.inbound.shift(n);
            return n;
        }
        self.inbound.shift(in_len);
        self.buf_pos += n - in_len;
        n
    }

    /// Unconsumed inbound bytes across ring + staging.
    pub fn buffer_length(&self) -> usize {
        self.inbound.length() + self.staged().len()
    }

    /// Drop all unconsumed inbound bytes.
    pub fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.buf_pos = 0;
        self.inbound.reset();
        if let Some(bb) = self.byte_buffer.take() {
            bufpool::put_byte_buffer(bb);
        }
    }

    // ── Identity and context ─────────────────────────────────────────

    pub fn local_addr(&self) -> Option<&NetAddr> {
        self.local_addr.as_ref()
    }

    pub fn remote_addr(&self) -> Option<&NetAddr> {
        self.remote_addr.as_ref()
    }

    /// Attach an opaque per-connection value.
    pub fn set_context<T: Any + Send>(&mut self, ctx: T) {
        self.ctx = Some(Box::new(ctx));
    }

    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.ctx.as_ref()?.downcast_ref()
    }

    pub fn context_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.ctx.as_mut()?.downcast_mut()
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Reply to the peer of a UDP datagram.
    pub fn send_to(&self, buf: &[u8]) -> Result<()> {
        let sa = self.sa.as_ref().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection has no peer address",
            ))
        })?;
        socket::send_to(self.fd, buf, sa)?;
        Ok(())
    }

    /// A detachable, thread-safe handle for cross-reactor operations.
    pub fn handle(&self) -> ConnHandle {
        self.handle.clone()
    }

    /// See [`ConnHandle::async_write`].
    pub fn async_write(&self, buf: Vec<u8>) -> Result<()> {
        self.handle.async_write(buf)
    }

    /// See [`ConnHandle::wake`].
    pub fn wake(&self) -> Result<()> {
        self.handle.wake()
    }

    /// See [`ConnHandle::close`].
    pub fn close(&self) -> Result<()> {
        self.handle.close()
    }
}

/// Cheap, cloneable reference to a connection usable from any thread.
/// Every operation is enqueued onto the owning reactor via its poller and
/// runs there after the current dispatch round.
#[derive(Clone)]
pub struct ConnHandle {
    fd: RawFd,
    loop_handle: Arc<LoopHandle>,
}

impl ConnHandle {
    /// Encode `buf` on the owning reactor and write it out, queueing any
    /// remainder. A no-op if the connection has closed in the meantime.
    pub fn async_write(&self, buf: Vec<u8>) -> Result<()> {
        let fd = self.fd;
        self.loop_handle
            .poller
            .trigger(Box::new(move |el: &mut EventLoop| el.async_write(fd, &buf)))?;
        Ok(())
    }

    /// Schedule a `react` invocation with an empty frame.
    pub fn wake(&self) -> Result<()> {
        let fd = self.fd;
        self.loop_handle
            .poller
            .trigger(Box::new(move |el: &mut EventLoop| el.loop_wake(fd)))?;
        Ok(())
    }

    /// Schedule the connection for closing.
    pub fn close(&self) -> Result<()> {
        let fd = self.fd;
        self.loop_handle
            .poller
            .trigger(Box::new(move |el: &mut EventLoop| {
                el.loop_close_conn(fd, None)
            }))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BuiltInFrameCodec, Codec};

    fn test_conn() -> Conn {
        let poller = crate::netpoll::Poller::open().expect("poller");
        let handle = Arc::new(LoopHandle::new(0, Arc::new(poller)));
        let raw = socket::inet_raw(&"127.0.0.1:4242".parse().unwrap());
        Conn::new_tcp(-1, raw, handle)
    }

    #[test]
    fn test_read_prefers_staging_when_ring_empty() {
        let mut c = test_conn();
        c.stage(b"hello");
        assert_eq!(c.read(), b"hello");
        assert_eq!(c.buffer_length(), 5);
    }

    #[test]
    fn test_read_spans_ring_and_staging() {
        let mut c = test_conn();
        c.inbound.write(b"abc");
        c.stage(b"def");
        assert_eq!(c.read(), b"abcdef");
    }

    #[test]
    fn test_read_n_bounded() {
        let mut c = test_conn();
        c.inbound.write(b"abc");
        c.stage(b"def");

        let (n, buf) = c.read_n(2);
        assert_eq!((n, buf), (2, &b"ab"[..]));

        // Spans the seam: part ring, part staging.
        let (n, buf) = c.read_n(5);
        assert_eq!((n, buf), (5, &b"abcde"[..]));

        // Oversized request clamps to the total.
        let (n, buf) = c.read_n(64);
        assert_eq!((n, buf), (6, &b"abcdef"[..]));
    }

    #[test]
    fn test_shift_n_consumes_ring_first() {
        let mut c = test_conn();
        c.inbound.write(b"abc");
        c.stage(b"def");

        assert_eq!(c.shift_n(4), 4);
        assert_eq!(c.buffer_length(), 2);
        assert_eq!(c.read(), b"ef");
    }

    #[test]
    fn test_shift_n_past_end_resets() {
        let mut c = test_conn();
        c.inbound.write(b"abc");
        c.stage(b"def");

        assert_eq!(c.shift_n(100), 6);
        assert_eq!(c.buffer_length(), 0);
        assert!(c.inbound.is_empty());
    }

    #[test]
    fn test_absorb_staged_moves_residue_to_ring() {
        let mut c = test_conn();
        c.stage(b"partial");
        c.shift_n(3);
        c.absorb_staged();
        assert_eq!(c.inbound.length(), 4);
        assert_eq!(c.read(), b"tial");
    }

    #[test]
    fn test_context_round_trip() {
        let mut c = test_conn();
        c.set_context(7u32);
        assert_eq!(c.context::<u32>(), Some(&7));
        assert_eq!(c.context::<String>(), None);
        *c.context_mut::<u32>().unwrap() = 8;
        assert_eq!(c.context::<u32>(), Some(&8));
    }

    #[test]
    fn test_builtin_codec_identity() {
        let codec = BuiltInFrameCodec;
        let mut c = test_conn();

        assert!(codec.decode(&mut c).unwrap().is_none());

        c.stage(b"ping");
        let frame = codec.decode(&mut c).unwrap().unwrap();
        assert_eq!(frame, b"ping");
        assert_eq!(c.buffer_length(), 0);

        let out = codec.encode(&mut c, &frame).unwrap();
        assert_eq!(out, b"ping");
    }
}
