//! Worker: a reusable execution context
//!
//! A worker owns a single-slot delivery channel and, while live, one OS
//! thread looping on it. Acquisition is exclusive — at most one submitter
//! ever holds a given worker — and the thread only pulls the next payload
//! after re-inserting itself into the idle container, so a deeper channel
//! buffer is unreachable. Capacity 0 (rendezvous) is used on single-core
//! machines to skip a wake-up hop; capacity 1 otherwise, decoupling the
//! submitter from worker scheduling.
//!
//! A `None` payload is the termination sentinel: the thread exits and the
//! worker object goes back to the pool's worker cache for reuse.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::pool::PoolCore;

pub(crate) struct Worker<P: Send + 'static> {
    tx: Sender<Option<P>>,
    rx: Receiver<Option<P>>,
    /// Nanoseconds since the pool epoch at the last recycle.
    recycled_at: AtomicU64,
}

impl<P: Send + 'static> Worker<P> {
    pub(crate) fn new(chan_cap: usize) -> Self {
        let (tx, rx) = bounded(chan_cap);
        Worker {
            tx,
            rx,
            recycled_at: AtomicU64::new(0),
        }
    }

    /// Hand a payload to the worker's thread.
    pub(crate) fn deliver(&self, payload: P) {
        // The channel never disconnects (we hold both ends), and exclusive
        // acquisition guarantees a live thread is on the receiving side.
        let _ = self.tx.send(Some(payload));
    }

    /// Send the termination sentinel. The receiving thread exits without
    /// re-inserting itself.
    pub(crate) fn stop(&self) {
        let _ = self.tx.send(None);
    }

    pub(crate) fn recycled_at(&self) -> u64 {
        self.recycled_at.load(Ordering::Acquire)
    }

    pub(crate) fn mark_recycled(&self, now_nanos: u64) {
        self.recycled_at.store(now_nanos, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set_recycled_at(&self, v: u64) {
        self.recycled_at.store(v, Ordering::Release);
    }

    /// Bring the worker live: bump the running count, then spawn the
    /// execution context. Called with no other holder of this worker.
    pub(crate) fn run(worker: &Arc<Worker<P>>, core: Arc<PoolCore<P>>) {
        core.inc_running();
        let worker = Arc::clone(worker);
        thread::Builder::new()
            .name("hive-worker".into())
            .spawn(move || worker_loop(worker, core))
            .expect("failed to spawn worker thread");
    }
}

fn worker_loop<P: Send + 'static>(worker: Arc<Worker<P>>, core: Arc<PoolCore<P>>) {
    loop {
        match worker.rx.recv() {
            Ok(Some(payload)) => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| core.execute(payload)));
                if let Err(cause) = outcome {
                    core.handle_panic(cause.as_ref());
                    break;
                }
                if !core.revert_worker(&worker) {
                    break;
                }
            }
            // Sentinel, or both ends dropped with the pool itself.
            Ok(None) | Err(_) => break,
        }
    }
    core.dec_running();
    core.cache_put(worker);
}
