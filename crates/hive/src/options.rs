//! Pool construction options

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between reaper runs, and the idle threshold beyond
/// which a worker is terminated.
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(1);

/// Callback invoked with the payload of a panic captured inside a worker.
pub type PanicHandler = Arc<dyn Fn(&(dyn Any + Send)) + Send + Sync>;

/// Tuning knobs for [`Pool`] and [`PoolWithFunc`].
///
/// [`Pool`]: crate::Pool
/// [`PoolWithFunc`]: crate::PoolWithFunc
#[derive(Clone, Default)]
pub struct Options {
    /// Interval of the idle-worker reaper. `Duration::ZERO` selects
    /// [`DEFAULT_CLEAN_INTERVAL`].
    pub expiry_duration: Duration,

    /// Pre-allocate the idle container as a fixed circular queue instead of
    /// a grow-on-demand stack. Incompatible with `tune` and with unbounded
    /// capacity.
    pub pre_alloc: bool,

    /// Fail submission immediately with `PoolOverload` instead of waiting
    /// for a worker.
    pub nonblocking: bool,

    /// Maximum number of submitters allowed to block waiting for a worker.
    /// Zero means unlimited.
    pub max_blocking_tasks: usize,

    /// Receives panics captured in worker contexts. When unset, panics are
    /// logged and the worker terminates cleanly either way.
    pub panic_handler: Option<PanicHandler>,
}

impl Options {
    pub fn new() -> Self {
        Options::default()
    }

    pub fn with_expiry_duration(mut self, d: Duration) -> Self {
        self.expiry_duration = d;
        self
    }

    pub fn with_pre_alloc(mut self, pre_alloc: bool) -> Self {
        self.pre_alloc = pre_alloc;
        self
    }

    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    pub fn with_max_blocking_tasks(mut self, max: usize) -> Self {
        self.max_blocking_tasks = max;
        self
    }

    pub fn with_panic_handler(mut self, handler: PanicHandler) -> Self {
        self.panic_handler = Some(handler);
        self
    }
}
