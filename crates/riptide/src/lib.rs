//! # riptide — a multi-reactor non-blocking network server
//!
//! riptide serves TCP, UDP, and Unix-socket traffic from a set of
//! reactors driven by kernel readiness notification (epoll on Linux,
//! kqueue on the BSDs). One acceptor (the main reactor) spreads incoming
//! connections across N worker reactors through a pluggable load
//! balancer; each worker reactor owns its poller, its connection table,
//! and per-connection inbound/outbound ring buffers, so the per-connection
//! hot path never takes a lock.
//!
//! A user-supplied [`EventHandler`] receives framed messages, with framing
//! delegated to a pluggable [`Codec`]. Work that must not block a reactor
//! goes to the companion [`hive`] worker pool via [`task_pool`], replying
//! through [`ConnHandle::async_write`].
//!
//! ```no_run
//! use riptide::{serve, Action, Conn, EventHandler, Options};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn react(&self, frame: &[u8], _c: &mut Conn) -> (Option<Vec<u8>>, Action) {
//!         (Some(frame.to_vec()), Action::None)
//!     }
//! }
//!
//! fn main() -> riptide::Result<()> {
//!     serve(Echo, "tcp://127.0.0.1:9000", Options::new().with_multicore(true))
//! }
//! ```

mod bufpool;
mod codec;
mod conn;
mod error;
mod eventloop;
mod lb;
mod listener;
mod math;
mod netpoll;
mod options;
mod ringbuf;
mod server;
mod socket;
mod taskpool;

pub use codec::{BuiltInFrameCodec, Codec};
pub use conn::{Conn, ConnHandle};
pub use error::{Error, Result};
pub use lb::LoadBalancing;
pub use options::Options;
pub use ringbuf::RingBuffer;
pub use server::{serve, ServerInfo};
pub use socket::NetAddr;
pub use taskpool::{task_pool, DEFAULT_TASK_POOL_SIZE};

use std::io;
use std::time::Duration;

/// What the server should do after a handler callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep going.
    #[default]
    None,
    /// Close the connection the callback was invoked for.
    Close,
    /// Stop the whole server.
    Shutdown,
}

/// Server life-cycle and traffic callbacks.
///
/// Every method has a no-op default, so handlers implement only what they
/// care about. Within one connection, callbacks never overlap: the owning
/// reactor serializes them.
pub trait EventHandler: Send + Sync {
    /// The server is about to start accepting. Returning
    /// [`Action::Shutdown`] aborts startup.
    fn on_init_complete(&self, _srv: &ServerInfo) -> Action {
        Action::None
    }

    /// All reactors and connections are down.
    fn on_shutdown(&self, _srv: &ServerInfo) {}

    /// A connection was accepted. Returned bytes are encoded and written
    /// before any traffic is read.
    fn on_opened(&self, _c: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// The connection is gone; `err` is the fault that closed it, if any.
    fn on_closed(&self, _c: &mut Conn, _err: Option<&io::Error>) -> Action {
        Action::None
    }

    /// Called immediately before bytes are written to a socket.
    fn pre_write(&self) {}

    /// A complete inbound frame (empty for a [`ConnHandle::wake`]).
    /// Returned bytes are encoded and written back to the peer.
    fn react(&self, _frame: &[u8], _c: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Periodic callback on reactor 0 when the ticker option is set.
    /// Returns the delay until the next tick.
    fn tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}
