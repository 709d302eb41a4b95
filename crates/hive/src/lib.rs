//! # hive — a bounded, expiry-aware worker pool
//!
//! `hive` recycles a bounded set of execution contexts (OS threads) across
//! a large stream of short tasks, instead of paying a thread spawn per
//! task. Workers idle between tasks in a container under a spinlock; a
//! periodic reaper terminates workers idle beyond an expiry threshold, and
//! a worker cache recycles the worker objects themselves.
//!
//! Two submission modes:
//!
//! - [`Pool::submit`] runs an arbitrary closure;
//! - [`PoolWithFunc::invoke`] delivers an argument to a preset function.
//!
//! Admission is non-blocking, blocking with an optional waiter cap, or
//! unbounded (`Pool` only, negative capacity), selected via [`Options`].
//!
//! ```no_run
//! let pool = hive::Pool::new(10)?;
//! for _ in 0..100 {
//!     pool.submit(|| {
//!         // short-lived work
//!     })?;
//! }
//! pool.release();
//! # Ok::<(), hive::Error>(())
//! ```
//!
//! A process-wide default pool backs the module-level free functions:
//!
//! ```no_run
//! hive::submit(|| println!("ran on the default pool"))?;
//! # Ok::<(), hive::Error>(())
//! ```

pub mod condvar;
pub mod spinlock;

mod error;
mod func;
mod options;
mod pool;
mod worker;
mod worker_queue;

pub use error::{Error, Result};
pub use func::PoolWithFunc;
pub use options::{Options, PanicHandler, DEFAULT_CLEAN_INTERVAL};
pub use pool::{Pool, Task};

use std::sync::OnceLock;

/// Capacity of the process-wide default pool.
pub const DEFAULT_POOL_SIZE: i32 = i32::MAX;

static DEFAULT_POOL: OnceLock<Pool> = OnceLock::new();

fn default_pool() -> &'static Pool {
    DEFAULT_POOL.get_or_init(|| {
        Pool::new(DEFAULT_POOL_SIZE).expect("default pool construction cannot fail")
    })
}

/// Submit a task to the process-wide default pool.
pub fn submit(task: impl FnOnce() + Send + 'static) -> Result<()> {
    default_pool().submit(task)
}

/// Workers currently live in the default pool.
pub fn running() -> i32 {
    default_pool().running()
}

/// Capacity of the default pool.
pub fn cap() -> i32 {
    default_pool().cap()
}

/// Remaining headroom of the default pool.
pub fn free() -> i32 {
    default_pool().free()
}

/// Close the default pool.
pub fn release() {
    default_pool().release()
}

/// Reopen the default pool after a release.
pub fn reboot() {
    default_pool().reboot()
}
