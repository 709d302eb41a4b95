//! Readiness notification
//!
//! A thin adapter over the kernel readiness mechanism — epoll on Linux,
//! kqueue on the BSDs — plus a user-triggerable wake channel and a
//! spinlock-protected async job queue for work submitted from foreign
//! threads. `trigger` enqueues a job and fires the OS wakeup only when the
//! queue was empty, so a burst of cross-thread submissions costs a single
//! `write` to the wake fd.

mod queue;

pub(crate) use queue::AsyncJobQueue;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub use epoll::Poller;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))] {
        mod kqueue;
        pub use kqueue::Poller;
    }
}

/// Initial readiness-event array length; doubled whenever a poll fills it.
pub(crate) const INIT_EVENTS: usize = 64;

/// Readiness class handed to the event-loop dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Read,
    Write,
    /// EOF or error on the socket; the connection should be closed.
    Sock,
}

/// One unit of work surfaced by `Poller::polling`: either a ready fd or a
/// drained async job. Jobs are always delivered after that iteration's fd
/// events.
pub enum Polled<J> {
    Io { fd: std::os::unix::io::RawFd, filter: Filter },
    Job(J),
}
