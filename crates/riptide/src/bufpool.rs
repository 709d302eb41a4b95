//! Process-wide buffer pools
//!
//! Connections borrow their inbound/outbound ring buffers on creation and
//! return them on release; `Conn::read` borrows a growable byte buffer as
//! a scratch aggregator when it has to present ring + staging bytes as one
//! contiguous slice. Pooling both keeps the per-connection setup path
//! allocation-free in the steady state.

use std::sync::OnceLock;

use crossbeam_queue::SegQueue;

use crate::ringbuf::RingBuffer;

/// Default capacity of a pooled ring buffer.
pub(crate) const RING_BUFFER_SIZE: usize = 1 << 12;

fn byte_buffers() -> &'static SegQueue<Vec<u8>> {
    static POOL: OnceLock<SegQueue<Vec<u8>>> = OnceLock::new();
    POOL.get_or_init(SegQueue::new)
}

fn ring_buffers() -> &'static SegQueue<RingBuffer> {
    static POOL: OnceLock<SegQueue<RingBuffer>> = OnceLock::new();
    POOL.get_or_init(SegQueue::new)
}

/// Borrow an empty byte buffer.
pub(crate) fn get_byte_buffer() -> Vec<u8> {
    byte_buffers().pop().unwrap_or_default()
}

/// Return a byte buffer for reuse.
pub(crate) fn put_byte_buffer(mut b: Vec<u8>) {
    b.clear();
    byte_buffers().push(b);
}

/// Borrow an empty ring buffer.
pub(crate) fn get_ring_buffer() -> RingBuffer {
    ring_buffers()
        .pop()
        .unwrap_or_else(|| RingBuffer::new(RING_BUFFER_SIZE))
}

/// Return a ring buffer for reuse.
pub(crate) fn put_ring_buffer(mut r: RingBuffer) {
    r.reset();
    ring_buffers().push(r);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_buffer_round_trip_clears() {
        let mut b = get_byte_buffer();
        b.extend_from_slice(b"junk");
        put_byte_buffer(b);
        assert!(get_byte_buffer().is_empty());
    }

    #[test]
    fn test_ring_buffer_round_trip_resets() {
        let mut r = get_ring_buffer();
        r.write(b"junk");
        put_ring_buffer(r);
        assert!(get_ring_buffer().is_empty());
    }
}
