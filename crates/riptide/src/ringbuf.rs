//! Auto-growing power-of-two byte ring
//!
//! Backs the per-connection inbound and outbound buffers. Reads come in
//! two flavors: consuming (`read`) and lazy (`lazy_read` /
//! `lazy_read_all`), which hand out slices aliasing the backing array
//! without advancing the read index — the caller consumes explicitly with
//! `shift`. Lazy views are only valid until the next mutating call.
//!
//! `r == w` is ambiguous between full and empty; an explicit `is_empty`
//! flag disambiguates. All index arithmetic is `& mask`, so the size is
//! always a power of two.

use crate::bufpool;
use crate::error::{Error, Result};
use crate::math::{ceil_to_power_of_two, is_power_of_two};

/// Initial capacity when the first write lands in a zero-sized ring.
pub(crate) const DEFAULT_BUF_SIZE: usize = 1 << 12;

pub struct RingBuffer {
    buf: Vec<u8>,
    size: usize,
    mask: usize,
    /// Next readable index.
    r: usize,
    /// Next writable index.
    w: usize,
    is_empty: bool,
}

impl RingBuffer {
    /// A ring with at least `size` capacity, rounded up to a power of two.
    /// `size == 0` defers allocation to the first write.
    pub fn new(size: usize) -> RingBuffer {
        if size == 0 {
            return RingBuffer {
                buf: Vec::new(),
                size: 0,
                mask: 0,
                r: 0,
                w: 0,
                is_empty: true,
            };
        }
        let size = ceil_to_power_of_two(size);
        RingBuffer {
            buf: vec![0; size],
            size,
            mask: size - 1,
            r: 0,
            w: 0,
            is_empty: true,
        }
    }

    /// Append `p`, growing the ring if it does not fit. Always writes all
    /// of `p` and returns its length.
    pub fn write(&mut self, p: &[u8]) -> usize {
        let n = p.len();
        if n == 0 {
            return 0;
        }

        let free = self.free();
        if n > free {
            self.grow(n - free);
        }

        if self.w >= self.r {
            let c1 = self.size - self.w;
            if c1 >= n {
                self.buf[self.w..self.w + n].copy_from_slice(p);
                self.w += n;
            } else {
                self.buf[self.w..].copy_from_slice(&p[..c1]);
                let c2 = n - c1;
                self.buf[..c2].copy_from_slice(&p[c1..]);
                self.w = c2;
            }
        } else {
            // Free span is contiguous between w and r.
            self.buf[self.w..self.w + n].copy_from_slice(p);
            self.w += n;
        }

        if self.w == self.size {
            self.w = 0;
        }
        self.is_empty = false;
        n
    }

    /// Copy up to `p.len()` readable bytes into `p` and consume them.
    pub fn read(&mut self, p: &mut [u8]) -> Result<usize> {
        if p.is_empty() {
            return Ok(0);
        }
        if self.is_empty {
            return Err(Error::RingEmpty);
        }

        let n;
        if self.w > self.r {
            n = (self.w - self.r).min(p.len());
            p[..n].copy_from_slice(&self.buf[self.r..self.r + n]);
        } else {
            n = (self.size - self.r + self.w).min(p.len());
            if self.r + n <= self.size {
                p[..n].copy_from_slice(&self.buf[self.r..self.r + n]);
            } else {
                let c1 = self.size - self.r;
                p[..c1].copy_from_slice(&self.buf[self.r..]);
                let c2 = n - c1;
                p[c1..n].copy_from_slice(&self.buf[..c2]);
            }
        }

        self.r = (self.r + n) & self.mask;
        if self.r == self.w {
            self.is_empty = true;
        }
        Ok(n)
    }

    /// Borrow up to `n` readable bytes as (head, tail) without consuming.
    /// Valid only until the next mutating call.
    pub fn lazy_read(&self, n: usize) -> (&[u8], &[u8]) {
        if self.is_empty || n == 0 {
            return (&[], &[]);
        }

        if self.r < self.w {
            let take = (self.w - self.r).min(n);
            return (&self.buf[self.r..self.r + take], &[]);
        }

        let take = (self.size - self.r + self.w).min(n);
        if self.r + take <= self.size {
            (&self.buf[self.r..self.r + take], &[])
        } else {
            let c = take - (self.size - self.r);
            (&self.buf[self.r..], &self.buf[..c])
        }
    }

    /// Borrow the full readable span as (head, tail) without consuming.
    pub fn lazy_read_all(&self) -> (&[u8], &[u8]) {
        if self.is_empty {
            return (&[], &[]);
        }

        if self.w > self.r {
            return (&self.buf[self.r..self.w], &[]);
        }

        let head = &self.buf[self.r..];
        if self.w != 0 {
            (head, &self.buf[..self.w])
        } else {
            (head, &[])
        }
    }

    /// Consume `min(n, length)` bytes; a full drain resets the ring.
    pub fn shift(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if n < self.length() {
            self.r = (self.r + n) & self.mask;
            if self.r == self.w {
                self.is_empty = true;
            }
        } else {
            self.reset();
        }
    }

    /// Borrow an aggregator holding the readable span followed by `b`.
    /// Return it to the byte-buffer pool when done.
    pub(crate) fn with_byte_buffer(&self, b: &[u8]) -> Vec<u8> {
        let mut bb = bufpool::get_byte_buffer();
        let (head, tail) = self.lazy_read_all();
        bb.extend_from_slice(head);
        bb.extend_from_slice(tail);
        bb.extend_from_slice(b);
        bb
    }

    /// Readable byte count.
    pub fn length(&self) -> usize {
        if self.r == self.w {
            if self.is_empty {
                return 0;
            }
            return self.size;
        }
        if self.w > self.r {
            self.w - self.r
        } else {
            self.size - self.r + self.w
        }
    }

    /// Writable byte count before the next grow.
    pub fn free(&self) -> usize {
        if self.r == self.w {
            if self.is_empty {
                return self.size;
            }
            return 0;
        }
        if self.w < self.r {
            self.r - self.w
        } else {
            self.size - self.w + self.r
        }
    }

    pub fn cap(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    pub fn is_full(&self) -> bool {
        self.r == self.w && !self.is_empty
    }

    pub fn reset(&mut self) {
        self.r = 0;
        self.w = 0;
        self.is_empty = true;
    }

    /// Grow to the next power of two >= size + needed, compacting live
    /// bytes to offset 0.
    fn grow(&mut self, needed: usize) {
        let new_cap = if self.size == 0 && DEFAULT_BUF_SIZE >= needed {
            DEFAULT_BUF_SIZE
        } else {
            ceil_to_power_of_two(self.size + needed)
        };
        debug_assert!(is_power_of_two(new_cap));
        let mut new_buf = vec![0; new_cap];
        let old_len = self.length();
        {
            let (head, tail) = self.lazy_read_all();
            new_buf[..head.len()].copy_from_slice(head);
            new_buf[head.len()..head.len() + tail.len()].copy_from_slice(tail);
        }
        self.buf = new_buf;
        self.size = new_cap;
        self.mask = new_cap - 1;
        self.r = 0;
        self.w = old_len;
    }
}
