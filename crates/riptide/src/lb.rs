//! Load balancing across sub-reactors
//!
//! The accept path asks the balancer which reactor takes the next
//! connection. `calibrate` is the accounting hook: every accept and close
//! adjusts the owning reactor's connection count through it.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::eventloop::LoopHandle;

/// Selection policy, chosen via
/// [`Options::lb`](crate::options::Options::lb).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
    SourceAddrHash,
}

pub(crate) trait LoadBalancer: Send + Sync {
    fn register(&self, el: Arc<LoopHandle>);

    /// Pick the reactor for the next connection. `hint` is a hash of the
    /// peer address; only the source-address policy consults it.
    fn next(&self, hint: u64) -> Arc<LoopHandle>;

    /// Visit registered reactors until `f` returns false.
    fn iterate(&self, f: &mut dyn FnMut(usize, &Arc<LoopHandle>) -> bool);

    fn len(&self) -> usize;

    /// Adjust a reactor's connection count by `delta`.
    fn calibrate(&self, el: &Arc<LoopHandle>, delta: i32);
}

pub(crate) fn new_load_balancer(kind: LoadBalancing) -> Box<dyn LoadBalancer> {
    match kind {
        LoadBalancing::RoundRobin => Box::new(RoundRobinBalancer::new()),
        LoadBalancing::LeastConnections => Box::new(LeastConnectionsBalancer::new()),
        LoadBalancing::SourceAddrHash => Box::new(SourceAddrHashBalancer::new()),
    }
}

// ── Round robin ──────────────────────────────────────────────────────

struct RoundRobinBalancer {
    loops: RwLock<Vec<Arc<LoopHandle>>>,
    next_idx: AtomicUsize,
}

impl RoundRobinBalancer {
    fn new() -> Self {
        RoundRobinBalancer {
            loops: RwLock::new(Vec::new()),
            next_idx: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn register(&self, el: Arc<LoopHandle>) {
        self.loops
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(el);
    }

    fn next(&self, _hint: u64) -> Arc<LoopHandle> {
        let loops = self.loops.read().unwrap_or_else(|e| e.into_inner());
        let i = self.next_idx.fetch_add(1, Ordering::Relaxed) % loops.len();
        Arc::clone(&loops[i])
    }

    fn iterate(&self, f: &mut dyn FnMut(usize, &Arc<LoopHandle>) -> bool) {
        let loops = self.loops.read().unwrap_or_else(|e| e.into_inner());
        for (i, el) in loops.iter().enumerate() {
            if !f(i, el) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.loops.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn calibrate(&self, el: &Arc<LoopHandle>, delta: i32) {
        el.conn_count.fetch_add(delta, Ordering::AcqRel);
    }
}

// ── Least connections ────────────────────────────────────────────────

/// Min-heap over connection counts with a cached root. Heap order decays
/// as counts drift, so instead of reheapifying per connection, `calibrate`
/// bumps a counter and `next` rebuilds once the counter reaches the set
/// size, then serves the cached root until the next rebuild.
struct LeastConnectionsBalancer {
    heap: RwLock<MinHeap>,
    threshold: AtomicU32,
}

struct MinHeap {
    items: Vec<Arc<LoopHandle>>,
    root: Option<Arc<LoopHandle>>,
}

impl MinHeap {
    fn key(&self, i: usize) -> i32 {
        self.items[i].conn_count.load(Ordering::Acquire)
    }

    fn place(&mut self, i: usize) {
        self.items[i].heap_idx.store(i as i32, Ordering::Release);
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.place(a);
        self.place(b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.key(i) >= self.key(parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.items.len();
        loop {
            let mut min = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < n && self.key(child) < self.key(min) {
                    min = child;
                }
            }
            if min == i {
                break;
            }
            self.swap(i, min);
            i = min;
        }
    }

    fn push(&mut self, el: Arc<LoopHandle>) {
        self.items.push(el);
        let i = self.items.len() - 1;
        self.place(i);
        self.sift_up(i);
        self.root = Some(Arc::clone(&self.items[0]));
    }

    fn rebuild(&mut self) {
        let n = self.items.len();
        for i in (0..n / 2).rev() {
            self.sift_down(i);
        }
        if !self.items.is_empty() {
            self.root = Some(Arc::clone(&self.items[0]));
        }
    }
}

impl LeastConnectionsBalancer {
    fn new() -> Self {
        LeastConnectionsBalancer {
            heap: RwLock::new(MinHeap {
                items: Vec::new(),
                root: None,
            }),
            threshold: AtomicU32::new(0),
        }
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn register(&self, el: Arc<LoopHandle>) {
        self.heap
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(el);
    }

    fn next(&self, _hint: u64) -> Arc<LoopHandle> {
        let size = self.len() as u32;
        if self.threshold.load(Ordering::Acquire) >= size {
            let mut heap = self.heap.write().unwrap_or_else(|e| e.into_inner());
            heap.rebuild();
            self.threshold.store(0, Ordering::Release);
        }
        let heap = self.heap.read().unwrap_or_else(|e| e.into_inner());
        let root = heap.root.as_ref().expect("load balancer has no event loops");
        Arc::clone(root)
    }

    fn iterate(&self, f: &mut dyn FnMut(usize, &Arc<LoopHandle>) -> bool) {
        let heap = self.heap.read().unwrap_or_else(|e| e.into_inner());
        for (i, el) in heap.items.iter().enumerate() {
            if !f(i, el) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.heap
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .len()
    }

    fn calibrate(&self, el: &Arc<LoopHandle>, delta: i32) {
        el.conn_count.fetch_add(delta, Ordering::AcqRel);
        self.threshold.fetch_add(1, Ordering::AcqRel);
    }
}

// ── Source-address hash ──────────────────────────────────────────────

struct SourceAddrHashBalancer {
    loops: RwLock<Vec<Arc<LoopHandle>>>,
}

impl SourceAddrHashBalancer {
    fn new() -> Self {
        SourceAddrHashBalancer {
            loops: RwLock::new(Vec::new()),
        }
    }
}

impl LoadBalancer for SourceAddrHashBalancer {
    fn register(&self, el: Arc<LoopHandle>) {
        self.loops
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(el);
    }

    fn next(&self, hint: u64) -> Arc<LoopHandle> {
        let loops = self.loops.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&loops[(hint as usize) % loops.len()])
    }

    fn iterate(&self, f: &mut dyn FnMut(usize, &Arc<LoopHandle>) -> bool) {
        let loops = self.loops.read().unwrap_or_else(|e| e.into_inner());
        for (i, el) in loops.iter().enumerate() {
            if !f(i, el) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.loops.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn calibrate(&self, el: &Arc<LoopHandle>, delta: i32) {
        el.conn_count.fetch_add(delta, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netpoll::Poller;

    fn handle(idx: i32) -> Arc<LoopHandle> {
        Arc::new(LoopHandle::new(
            idx,
            Arc::new(Poller::open().expect("poller")),
        ))
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let lb = new_load_balancer(LoadBalancing::RoundRobin);
        let els = [handle(0), handle(1), handle(2)];
        for el in &els {
            lb.register(Arc::clone(el));
        }

        for round in 0..2 {
            for el in &els {
                assert!(Arc::ptr_eq(&lb.next(round), el));
            }
        }
    }

    #[test]
    fn test_least_connections_rebuilds_after_size_calibrations() {
        let lb = new_load_balancer(LoadBalancing::LeastConnections);
        let a = handle(0);
        let b = handle(1);
        let c = handle(2);
        for el in [&a, &b, &c] {
            lb.register(Arc::clone(el));
        }

        // Three calibrations = one full rebuild window for a set of three.
        for _ in 0..5 {
            lb.calibrate(&a, 1);
        }
        lb.calibrate(&b, 1);
        for _ in 0..3 {
            lb.calibrate(&c, 1);
        }

        assert!(Arc::ptr_eq(&lb.next(0), &b));
    }

    #[test]
    fn test_least_connections_count_sum() {
        let lb = new_load_balancer(LoadBalancing::LeastConnections);
        let a = handle(0);
        let b = handle(1);
        lb.register(Arc::clone(&a));
        lb.register(Arc::clone(&b));

        lb.calibrate(&a, 1);
        lb.calibrate(&a, 1);
        lb.calibrate(&b, 1);
        lb.calibrate(&a, -1);

        let mut total = 0;
        lb.iterate(&mut |_, el| {
            total += el.conn_count.load(Ordering::Acquire);
            true
        });
        assert_eq!(total, 2);
    }

    #[test]
    fn test_source_addr_hash_pins_peers() {
        let lb = new_load_balancer(LoadBalancing::SourceAddrHash);
        let els = [handle(0), handle(1), handle(2)];
        for el in &els {
            lb.register(Arc::clone(el));
        }

        for hint in [0u64, 7, 41, u64::MAX] {
            let first = lb.next(hint);
            for _ in 0..4 {
                assert!(Arc::ptr_eq(&lb.next(hint), &first));
            }
            assert!(Arc::ptr_eq(&first, &els[(hint as usize) % 3]));
        }
    }
}
