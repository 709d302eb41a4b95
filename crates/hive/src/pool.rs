//! The worker-pool scheduler
//!
//! `PoolCore` is the machinery shared by both public pool flavors: the
//! acquire/revert protocol, the blocking admission path, the idle-worker
//! reaper, and the worker cache. [`Pool`] delivers boxed task closures;
//! [`PoolWithFunc`](crate::PoolWithFunc) delivers per-call arguments to a
//! preset function. Both are thin facades over the same core.
//!
//! Ownership of a worker moves through exactly one place at a time: the
//! idle container while parked, the submitter between `detach` and
//! `deliver`, its own thread while executing, and the worker cache after
//! termination.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::condvar::Condvar;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::spinlock::SpinLock;
use crate::worker::Worker;
use crate::worker_queue::{WorkerLoopQueue, WorkerQueue, WorkerStack};

const OPENED: i32 = 0;
const CLOSED: i32 = 1;

/// Delivery-slot capacity: rendezvous on single-core machines (no wake-up
/// hop to save), one-deep otherwise.
fn worker_chan_cap() -> usize {
    if thread::available_parallelism().map_or(1, usize::from) == 1 {
        0
    } else {
        1
    }
}

/// State guarded by the pool spinlock.
struct Inner<P: Send + 'static> {
    workers: Box<dyn WorkerQueue<P>>,
    /// Submitters currently blocked on admission.
    blocking: usize,
}

pub(crate) struct PoolCore<P: Send + 'static> {
    capacity: AtomicI32,
    running: AtomicI32,
    state: AtomicI32,
    /// Capacity < 0: admission never spawns past a bound.
    infinite: bool,
    /// Base instant for worker recycle stamps.
    epoch: Instant,
    chan_cap: usize,
    lock: SpinLock<Inner<P>>,
    cond: Condvar,
    /// Reclamation pool: workers here have no live references anywhere else.
    cache: SegQueue<Arc<Worker<P>>>,
    exec: Box<dyn Fn(P) + Send + Sync>,
    options: Options,
}

impl<P: Send + 'static> PoolCore<P> {
    pub(crate) fn new(
        size: i32,
        mut options: Options,
        exec: Box<dyn Fn(P) + Send + Sync>,
    ) -> Result<Arc<Self>> {
        if options.expiry_duration.is_zero() {
            options.expiry_duration = crate::options::DEFAULT_CLEAN_INTERVAL;
        }
        let infinite = size < 0;
        if options.pre_alloc && infinite {
            return Err(Error::InvalidPreAllocSize);
        }

        let workers: Box<dyn WorkerQueue<P>> = if options.pre_alloc {
            Box::new(WorkerLoopQueue::new(size as usize))
        } else {
            Box::new(WorkerStack::new())
        };

        let core = Arc::new(PoolCore {
            capacity: AtomicI32::new(size),
            running: AtomicI32::new(0),
            state: AtomicI32::new(OPENED),
            infinite,
            epoch: Instant::now(),
            chan_cap: worker_chan_cap(),
            lock: SpinLock::new(Inner {
                workers,
                blocking: 0,
            }),
            cond: Condvar::new(),
            cache: SegQueue::new(),
            exec,
            options,
        });
        Self::spawn_reaper(&core);
        Ok(core)
    }

    // ── Admission ────────────────────────────────────────────────────

    /// Admit one payload: acquire a worker and hand the payload over.
    pub(crate) fn dispatch(core: &Arc<Self>, payload: P) -> Result<()> {
        if core.state() == CLOSED {
            return Err(Error::PoolClosed);
        }
        match Self::retrieve_worker(core) {
            Some(w) => {
                w.deliver(payload);
                Ok(())
            }
            None if core.state() == CLOSED => Err(Error::PoolClosed),
            None => Err(Error::PoolOverload),
        }
    }

    /// The acquire protocol: idle container first, then a fresh spawn while
    /// under capacity, then (unless nonblocking) the condition variable.
    fn retrieve_worker(core: &Arc<Self>) -> Option<Arc<Worker<P>>> {
        let mut inner = core.lock.lock();

        if let Some(w) = inner.workers.detach() {
            drop(inner);
            return Some(w);
        }
        if core.infinite || core.running() < core.capacity() {
            drop(inner);
            return Some(Self::spawn_worker(core));
        }
        if core.options.nonblocking {
            return None;
        }

        loop {
            if core.options.max_blocking_tasks != 0
                && inner.blocking >= core.options.max_blocking_tasks
            {
                return None;
            }
            inner.blocking += 1;
            inner = core.cond.wait(inner);
            inner.blocking -= 1;

            if core.state() == CLOSED {
                return None;
            }
            // The reaper may have terminated every worker while we slept;
            // nothing will ever land in the container, so spawn fresh.
            if core.running() == 0 {
                drop(inner);
                return Some(Self::spawn_worker(core));
            }
            if let Some(w) = inner.workers.detach() {
                drop(inner);
                return Some(w);
            }
            // Passed the baton without a worker to show for it: wait again.
        }
    }

    fn spawn_worker(core: &Arc<Self>) -> Arc<Worker<P>> {
        let w = core
            .cache
            .pop()
            .unwrap_or_else(|| Arc::new(Worker::new(core.chan_cap)));
        Worker::run(&w, Arc::clone(core));
        w
    }

    /// Re-insert a worker after it finished a task. Returns false to ask
    /// the worker's thread to terminate instead.
    pub(crate) fn revert_worker(&self, w: &Arc<Worker<P>>) -> bool {
        if self.state() == CLOSED || (!self.infinite && self.running() > self.capacity()) {
            return false;
        }
        w.mark_recycled(self.now_nanos());
        let inserted = {
            let mut inner = self.lock.lock();
            inner.workers.insert(Arc::clone(w)).is_ok()
        };
        if inserted {
            self.cond.notify_one();
        }
        inserted
    }

    // ── Reaper ───────────────────────────────────────────────────────

    fn spawn_reaper(core: &Arc<Self>) {
        let weak = Arc::downgrade(core);
        let interval = core.options.expiry_duration;
        thread::Builder::new()
            .name("hive-reaper".into())
            .spawn(move || reaper_loop(weak, interval))
            .expect("failed to spawn reaper thread");
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub(crate) fn release(&self) {
        self.state.store(CLOSED, Ordering::Release);
        {
            let mut inner = self.lock.lock();
            inner.workers.reset();
        }
        // Blocked submitters would otherwise sleep until the next reaper
        // broadcast, which no longer comes.
        self.cond.notify_all();
    }

    pub(crate) fn reboot(core: &Arc<Self>) {
        if core
            .state
            .compare_exchange(CLOSED, OPENED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            core.lock.lock().workers.reopen();
            Self::spawn_reaper(core);
        }
    }

    pub(crate) fn tune(&self, size: i32) {
        if size < 0
            || size == self.capacity()
            || self.infinite
            || self.options.pre_alloc
        {
            return;
        }
        self.capacity.store(size, Ordering::Release);
    }

    // ── Accounting ───────────────────────────────────────────────────

    pub(crate) fn execute(&self, payload: P) {
        (self.exec)(payload)
    }

    pub(crate) fn handle_panic(&self, cause: &(dyn Any + Send)) {
        if let Some(handler) = &self.options.panic_handler {
            handler(cause);
            return;
        }
        let msg = cause
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| cause.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        tracing::error!(target: "hive", "worker exits from a panic: {msg}");
    }

    pub(crate) fn cache_put(&self, w: Arc<Worker<P>>) {
        self.cache.push(w);
    }

    pub(crate) fn inc_running(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_running(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn running(&self) -> i32 {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> i32 {
        self.capacity.load(Ordering::Acquire)
    }

    pub(crate) fn free(&self) -> i32 {
        self.capacity() - self.running()
    }

    fn state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Periodically terminate workers idle beyond the expiry threshold. Exits
/// when the pool closes or is dropped; `Reboot` starts a fresh reaper.
fn reaper_loop<P: Send + 'static>(weak: Weak<PoolCore<P>>, interval: Duration) {
    loop {
        thread::sleep(interval);
        let Some(core) = weak.upgrade() else {
            return;
        };
        if core.state() == CLOSED {
            return;
        }

        let deadline = core.now_nanos().saturating_sub(interval.as_nanos() as u64);
        let expired = {
            let mut inner = core.lock.lock();
            inner.workers.retrieve_expiry(deadline)
        };
        for w in &expired {
            w.stop();
        }

        // Everything got reaped while submitters slept: wake them all so
        // each can spawn a fresh worker.
        if core.running() == 0 {
            core.cond.notify_all();
        }
    }
}

// ── Public task pool ─────────────────────────────────────────────────

/// A unit of work for [`Pool`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool executing arbitrary task closures on recycled workers.
///
/// A negative `size` makes the pool unbounded, which is occasionally
/// needed for nested submission (a task that submits another task into the
/// same pool would deadlock a saturated bounded pool).
#[derive(Clone)]
pub struct Pool {
    core: Arc<PoolCore<Task>>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(size: i32) -> Result<Pool> {
        Pool::with_options(size, Options::new())
    }

    pub fn with_options(size: i32, options: Options) -> Result<Pool> {
        let core = PoolCore::new(size, options, Box::new(|task: Task| task()))?;
        Ok(Pool { core })
    }

    /// Schedule `task` onto a worker.
    ///
    /// Fails with [`Error::PoolClosed`] after `release`, and with
    /// [`Error::PoolOverload`] when no worker can be acquired under the
    /// configured admission policy.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        PoolCore::dispatch(&self.core, Box::new(task))
    }

    /// Number of workers currently executing or idling with a live thread.
    pub fn running(&self) -> i32 {
        self.core.running()
    }

    /// Worker capacity; negative for an unbounded pool.
    pub fn cap(&self) -> i32 {
        self.core.capacity()
    }

    /// Remaining headroom (`cap - running`).
    pub fn free(&self) -> i32 {
        self.core.free()
    }

    /// Change the capacity. No-op for negative sizes, unchanged sizes,
    /// unbounded pools, and pre-allocated pools.
    pub fn tune(&self, size: i32) {
        self.core.tune(size)
    }

    /// Close the pool and terminate every idle worker.
    pub fn release(&self) {
        self.core.release()
    }

    /// Reopen a released pool and restart the reaper.
    pub fn reboot(&self) {
        PoolCore::reboot(&self.core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_size_is_infinite() {
        let pool = Pool::new(-1).unwrap();
        assert_eq!(pool.cap(), -1);
        // Tune must not resurrect a bound.
        pool.tune(10);
        assert_eq!(pool.cap(), -1);
        pool.release();
    }

    #[test]
    fn test_tune_noops() {
        let pool = Pool::new(4).unwrap();
        pool.tune(-3);
        assert_eq!(pool.cap(), 4);
        pool.tune(8);
        assert_eq!(pool.cap(), 8);
        pool.release();

        let pre = Pool::with_options(4, Options::new().with_pre_alloc(true)).unwrap();
        pre.tune(8);
        assert_eq!(pre.cap(), 4);
        pre.release();
    }

    #[test]
    fn test_pre_alloc_rejects_unbounded() {
        let err = Pool::with_options(-1, Options::new().with_pre_alloc(true)).unwrap_err();
        assert_eq!(err, Error::InvalidPreAllocSize);
    }
}
