//! Idle-worker containers
//!
//! Two interchangeable containers hold workers between tasks: a LIFO stack
//! that grows on demand (bounded in practice by the pool capacity) and a
//! fixed-capacity circular queue that is pre-allocated up front. Both are
//! only ever touched under the pool spinlock.
//!
//! After `reset()` a container is *released*: inserts fail until the pool
//! is rebooted and calls `reopen()`.

use std::sync::Arc;

use crate::worker::Worker;

/// Why an insert was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertError {
    /// The circular queue is at capacity.
    Full,
    /// The container was reset and not reopened.
    Released,
}

pub(crate) trait WorkerQueue<P: Send + 'static>: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park an idle worker.
    fn insert(&mut self, w: Arc<Worker<P>>) -> Result<(), InsertError>;

    /// Take the next worker to hand to a submitter.
    fn detach(&mut self) -> Option<Arc<Worker<P>>>;

    /// Remove and return every worker whose last-recycled stamp is at or
    /// before `deadline` (nanoseconds since the pool epoch).
    fn retrieve_expiry(&mut self, deadline: u64) -> Vec<Arc<Worker<P>>>;

    /// Terminate every idle worker and mark the container released.
    fn reset(&mut self);

    /// Make the container usable again after a reset.
    fn reopen(&mut self);
}

// ── LIFO stack (grow-on-demand) ──────────────────────────────────────

/// Variable-length stack. Oldest workers sit at the bottom, so the
/// last-recycled stamps are monotonic by position and expiry can binary
/// search for the first survivor.
pub(crate) struct WorkerStack<P: Send + 'static> {
    items: Vec<Arc<Worker<P>>>,
    released: bool,
}

impl<P: Send + 'static> WorkerStack<P> {
    pub(crate) fn new() -> Self {
        WorkerStack {
            items: Vec::new(),
            released: false,
        }
    }
}

impl<P: Send + 'static> WorkerQueue<P> for WorkerStack<P> {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn insert(&mut self, w: Arc<Worker<P>>) -> Result<(), InsertError> {
        if self.released {
            return Err(InsertError::Released);
        }
        self.items.push(w);
        Ok(())
    }

    fn detach(&mut self) -> Option<Arc<Worker<P>>> {
        self.items.pop()
    }

    fn retrieve_expiry(&mut self, deadline: u64) -> Vec<Arc<Worker<P>>> {
        let n = self
            .items
            .partition_point(|w| w.recycled_at() <= deadline);
        self.items.drain(..n).collect()
    }

    fn reset(&mut self) {
        for w in self.items.drain(..) {
            w.stop();
        }
        self.released = true;
    }

    fn reopen(&mut self) {
        self.released = false;
    }
}

// ── Circular queue (pre-allocated) ───────────────────────────────────

/// Fixed-capacity ring of workers. `head` points at the next worker to
/// detach, `tail` at the next free slot; `is_full` disambiguates
/// `head == tail`.
pub(crate) struct WorkerLoopQueue<P: Send + 'static> {
    items: Vec<Option<Arc<Worker<P>>>>,
    size: usize,
    head: usize,
    tail: usize,
    is_full: bool,
    released: bool,
}

impl<P: Send + 'static> WorkerLoopQueue<P> {
    pub(crate) fn new(size: usize) -> Self {
        let mut items = Vec::with_capacity(size);
        items.resize_with(size, || None);
        WorkerLoopQueue {
            items,
            size,
            head: 0,
            tail: 0,
            is_full: false,
            released: false,
        }
    }

    fn advance(&self, i: usize) -> usize {
        let i = i + 1;
        if i == self.size {
            0
        } else {
            i
        }
    }
}

impl<P: Send + 'static> WorkerQueue<P> for WorkerLoopQueue<P> {
    fn len(&self) -> usize {
        if self.size == 0 || (self.head == self.tail && !self.is_full) {
            return 0;
        }
        if self.head == self.tail {
            return self.size;
        }
        if self.tail > self.head {
            self.tail - self.head
        } else {
            self.size - self.head + self.tail
        }
    }

    fn insert(&mut self, w: Arc<Worker<P>>) -> Result<(), InsertError> {
        if self.released || self.size == 0 {
            return Err(InsertError::Released);
        }
        if self.is_full {
            return Err(InsertError::Full);
        }
        self.items[self.tail] = Some(w);
        self.tail = self.advance(self.tail);
        if self.tail == self.head {
            self.is_full = true;
        }
        Ok(())
    }

    fn detach(&mut self) -> Option<Arc<Worker<P>>> {
        if self.is_empty() {
            return None;
        }
        let w = self.items[self.head].take();
        self.head = self.advance(self.head);
        self.is_full = false;
        w
    }

    fn retrieve_expiry(&mut self, deadline: u64) -> Vec<Arc<Worker<P>>> {
        let mut expired = Vec::new();
        while !self.is_empty() {
            let stale = match &self.items[self.head] {
                Some(w) => w.recycled_at() <= deadline,
                None => false,
            };
            if !stale {
                break;
            }
            if let Some(w) = self.items[self.head].take() {
                expired.push(w);
            }
            self.head = self.advance(self.head);
            self.is_full = false;
        }
        expired
    }

    fn reset(&mut self) {
        while let Some(w) = self.detach() {
            w.stop();
        }
        self.head = 0;
        self.tail = 0;
        self.is_full = false;
        self.released = true;
    }

    fn reopen(&mut self) {
        self.released = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker<P: Send + 'static>(recycled_at: u64) -> Arc<Worker<P>> {
        let w: Arc<Worker<P>> = Arc::new(Worker::new(1));
        w.set_recycled_at(recycled_at);
        w
    }

    #[test]
    fn test_stack_is_lifo() {
        let mut q: WorkerStack<()> = WorkerStack::new();
        let a = worker(1);
        let b = worker(2);
        q.insert(Arc::clone(&a)).unwrap();
        q.insert(Arc::clone(&b)).unwrap();

        assert!(Arc::ptr_eq(&q.detach().unwrap(), &b));
        assert!(Arc::ptr_eq(&q.detach().unwrap(), &a));
        assert!(q.detach().is_none());
    }

    #[test]
    fn test_stack_expiry_takes_prefix() {
        let mut q: WorkerStack<()> = WorkerStack::new();
        for stamp in [10, 20, 30, 40] {
            q.insert(worker(stamp)).unwrap();
        }

        let expired = q.retrieve_expiry(25);
        assert_eq!(expired.len(), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(expired[0].recycled_at(), 10);
        assert_eq!(expired[1].recycled_at(), 20);
    }

    #[test]
    fn test_stack_reset_releases() {
        let mut q: WorkerStack<()> = WorkerStack::new();
        q.insert(worker(1)).unwrap();
        q.reset();
        assert_eq!(q.len(), 0);
        assert_eq!(q.insert(worker(2)), Err(InsertError::Released));

        q.reopen();
        assert!(q.insert(worker(3)).is_ok());
    }

    #[test]
    fn test_loop_queue_wraps() {
        let mut q: WorkerLoopQueue<()> = WorkerLoopQueue::new(3);
        for stamp in [1, 2, 3] {
            q.insert(worker(stamp)).unwrap();
        }
        assert_eq!(q.insert(worker(4)), Err(InsertError::Full));
        assert_eq!(q.len(), 3);

        // FIFO from the head
        assert_eq!(q.detach().unwrap().recycled_at(), 1);
        q.insert(worker(4)).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.detach().unwrap().recycled_at(), 2);
        assert_eq!(q.detach().unwrap().recycled_at(), 3);
        assert_eq!(q.detach().unwrap().recycled_at(), 4);
        assert!(q.detach().is_none());
    }

    #[test]
    fn test_loop_queue_expiry_walks_head() {
        let mut q: WorkerLoopQueue<()> = WorkerLoopQueue::new(4);
        for stamp in [10, 20, 30] {
            q.insert(worker(stamp)).unwrap();
        }

        let expired = q.retrieve_expiry(20);
        assert_eq!(expired.len(), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.detach().unwrap().recycled_at(), 30);
    }

    #[test]
    fn test_loop_queue_zero_capacity_is_released() {
        let mut q: WorkerLoopQueue<()> = WorkerLoopQueue::new(0);
        assert_eq!(q.insert(worker(1)), Err(InsertError::Released));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_loop_queue_reset_releases() {
        let mut q: WorkerLoopQueue<()> = WorkerLoopQueue::new(2);
        q.insert(worker(1)).unwrap();
        q.reset();
        assert_eq!(q.insert(worker(2)), Err(InsertError::Released));
        q.reopen();
        assert!(q.insert(worker(3)).is_ok());
    }
}
