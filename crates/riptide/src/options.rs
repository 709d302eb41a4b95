//! Server construction options

use std::sync::Arc;
use std::time::Duration;

use crate::codec::Codec;
use crate::lb::LoadBalancing;

/// Tuning knobs for [`serve`](crate::serve).
#[derive(Clone, Default)]
pub struct Options {
    /// Run one sub-reactor per CPU instead of a single one. Overridden by
    /// `num_event_loop` when that is nonzero.
    pub multicore: bool,

    /// Explicit sub-reactor count; 0 defers to `multicore`.
    pub num_event_loop: usize,

    /// Bind with `SO_REUSEPORT` and let every sub-reactor accept on its
    /// own (loops mode) instead of funneling through a main reactor.
    pub reuse_port: bool,

    /// Enable TCP keep-alive with this idle/interval period. Zero leaves
    /// it off.
    pub tcp_keep_alive: Duration,

    /// Drive the handler's `tick` callback from reactor 0.
    pub ticker: bool,

    /// How accepted connections spread across sub-reactors.
    pub lb: LoadBalancing,

    /// Frame codec; identity framing when unset.
    pub codec: Option<Arc<dyn Codec>>,
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    pub fn with_multicore(mut self, multicore: bool) -> Options {
        self.multicore = multicore;
        self
    }

    pub fn with_num_event_loop(mut self, n: usize) -> Options {
        self.num_event_loop = n;
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Options {
        self.reuse_port = reuse_port;
        self
    }

    pub fn with_tcp_keep_alive(mut self, period: Duration) -> Options {
        self.tcp_keep_alive = period;
        self
    }

    pub fn with_ticker(mut self, ticker: bool) -> Options {
        self.ticker = ticker;
        self
    }

    pub fn with_load_balancing(mut self, lb: LoadBalancing) -> Options {
        self.lb = lb;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Options {
        self.codec = Some(codec);
        self
    }
}
