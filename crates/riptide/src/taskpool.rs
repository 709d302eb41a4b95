//! Shared task pool for offloading user work
//!
//! Reactor callbacks must never block their loop; anything slow belongs on
//! a worker. This is the process-wide `hive` pool servers and handlers use
//! for that: nonblocking admission (a saturated pool fails fast instead of
//! stalling a reactor) and a generous expiry so bursts keep their warm
//! workers for a while.

use std::sync::OnceLock;
use std::time::Duration;

/// Worker capacity of the shared task pool.
pub const DEFAULT_TASK_POOL_SIZE: i32 = 1 << 18;

const TASK_POOL_EXPIRY: Duration = Duration::from_secs(10);

/// The process-wide task pool, built on first use.
pub fn task_pool() -> &'static hive::Pool {
    static POOL: OnceLock<hive::Pool> = OnceLock::new();
    POOL.get_or_init(|| {
        hive::Pool::with_options(
            DEFAULT_TASK_POOL_SIZE,
            hive::Options::new()
                .with_nonblocking(true)
                .with_expiry_duration(TASK_POOL_EXPIRY),
        )
        .expect("task pool construction cannot fail")
    })
}
