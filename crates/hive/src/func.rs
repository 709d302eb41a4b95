//! Fixed-function pool
//!
//! Binds every worker to one preset function; submitters deliver only the
//! per-call argument. Cheaper than [`Pool`](crate::Pool) when the work is
//! homogeneous: no closure boxing on the submit path.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::options::Options;
use crate::pool::PoolCore;

/// Pool whose workers all run one function over submitted arguments.
///
/// Unlike [`Pool`](crate::Pool), a negative capacity is rejected: the
/// unbounded escape hatch exists for nested task submission, which a
/// fixed-function pool cannot express. Capacity is fixed for the pool's
/// lifetime.
#[derive(Clone)]
pub struct PoolWithFunc<T: Send + 'static> {
    core: Arc<PoolCore<T>>,
}

impl<T: Send + 'static> fmt::Debug for PoolWithFunc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolWithFunc").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> PoolWithFunc<T> {
    pub fn new(size: i32, func: impl Fn(T) + Send + Sync + 'static) -> Result<Self> {
        Self::with_options(size, func, Options::new())
    }

    pub fn with_options(
        size: i32,
        func: impl Fn(T) + Send + Sync + 'static,
        options: Options,
    ) -> Result<Self> {
        if size < 0 {
            return Err(Error::InvalidPoolSize);
        }
        let core = PoolCore::new(size, options, Box::new(func))?;
        Ok(PoolWithFunc { core })
    }

    /// Deliver one argument to a worker running the preset function.
    pub fn invoke(&self, arg: T) -> Result<()> {
        PoolCore::dispatch(&self.core, arg)
    }

    pub fn running(&self) -> i32 {
        self.core.running()
    }

    pub fn cap(&self) -> i32 {
        self.core.capacity()
    }

    pub fn free(&self) -> i32 {
        self.core.free()
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
    fn test_negative_size_rejected() {
        let err = PoolWithFunc::<u32>::new(-1, |_| {}).unwrap_err();
        assert_eq!(err, Error::InvalidPoolSize);
    }
}
