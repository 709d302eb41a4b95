//! Reactor event loop
//!
//! One OS thread per reactor blocks in the poller and dispatches readiness
//! callbacks. The loop owns its connection table outright — no locking on
//! any per-connection state — and everything initiated from outside the
//! loop (async writes, wakes, closes, the main reactor handing over a
//! freshly accepted fd, ticker ticks) arrives as a [`Job`] through
//! `poller.trigger`, running here after the current round of fd callbacks.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicI32;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::netpoll::{Filter, Polled, Poller};
use crate::server::ServerShared;
use crate::socket;
use crate::Action;

/// Read staging area size: one `read(2)` per readiness event lands here
/// before the codec carves it into frames.
const PACKET_SIZE: usize = 0x10000;

/// Work enqueued onto a reactor from a foreign thread.
pub(crate) type Job = Box<dyn FnOnce(&mut EventLoop) -> Result<()> + Send>;

/// The shared, thread-safe face of a reactor: what load balancers hold and
/// what cross-thread operations go through.
pub(crate) struct LoopHandle {
    /// Index in the sub-reactor set; -1 for the main reactor.
    pub(crate) idx: i32,
    /// Active connections owned by this reactor.
    pub(crate) conn_count: AtomicI32,
    /// Position in the least-connections heap; -1 while unsited.
    pub(crate) heap_idx: AtomicI32,
    pub(crate) poller: Arc<Poller<Job>>,
}

impl LoopHandle {
    pub(crate) fn new(idx: i32, poller: Arc<Poller<Job>>) -> LoopHandle {
        LoopHandle {
            idx,
            conn_count: AtomicI32::new(0),
            heap_idx: AtomicI32::new(-1),
            poller,
        }
    }
}

pub(crate) struct EventLoop {
    pub(crate) handle: Arc<LoopHandle>,
    pub(crate) srv: Arc<ServerShared>,
    /// Read staging area, shared by every connection on this reactor.
    packet: Box<[u8]>,
    connections: HashMap<RawFd, Conn>,
    /// Tick delays flow out to the ticker thread. Reactor 0 only.
    pub(crate) ticktock_tx: Option<mpsc::SyncSender<Duration>>,
    tick_rx: Option<mpsc::Receiver<Duration>>,
}

impl EventLoop {
    pub(crate) fn new(
        handle: Arc<LoopHandle>,
        srv: Arc<ServerShared>,
        ticktock: Option<(mpsc::SyncSender<Duration>, mpsc::Receiver<Duration>)>,
    ) -> EventLoop {
        let (ticktock_tx, tick_rx) = match ticktock {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };
        EventLoop {
            handle,
            srv,
            packet: vec![0; PACKET_SIZE].into_boxed_slice(),
            connections: HashMap::new(),
            ticktock_tx,
            tick_rx,
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Readiness dispatch table. Connections with queued outbound data
    /// only care about writability; drained ones only about readability.
    pub(crate) fn handle_event(&mut self, fd: RawFd, filter: Filter) -> Result<()> {
        let has_pending = match self.connections.get(&fd) {
            Some(c) => !c.outbound.is_empty(),
            None => return self.loop_accept(fd),
        };
        match filter {
            Filter::Sock => self.loop_close_conn(fd, None),
            Filter::Write if has_pending => self.loop_write(fd),
            Filter::Read if !has_pending => self.loop_read(fd),
            _ => Ok(()),
        }
    }

    // ── Accept path ──────────────────────────────────────────────────

    /// Loops mode: the listener fd sits in this reactor's own interest set.
    fn loop_accept(&mut self, fd: RawFd) -> Result<()> {
        if fd != self.srv.listener.fd() {
            return Ok(());
        }
        if self.srv.listener.is_udp() {
            return self.loop_read_udp(fd);
        }
        match socket::accept(fd) {
            Ok(Some((nfd, sa))) => {
                if let Err(err) = socket::set_nonblocking(nfd) {
                    tracing::warn!(target: "riptide", "accept fd {nfd}: {err}");
                    let _ = socket::close_fd(nfd);
                    return Ok(());
                }
                self.register(nfd, sa)
            }
            Ok(None) => Ok(()),
            Err(err) => {
                // Accept faults stay local to the listener event.
                tracing::warn!(target: "riptide", "accept on fd {fd}: {err}");
                Ok(())
            }
        }
    }

    /// Take ownership of an accepted fd: build the connection, arm read
    /// interest, account it, and run the open path. Also the target of the
    /// main reactor's hand-over job.
    pub(crate) fn register(&mut self, fd: RawFd, sa: socket::RawAddr) -> Result<()> {
        let mut c = Conn::new_tcp(fd, sa, Arc::clone(&self.handle));
        if let Err(err) = self.handle.poller.add_read(fd) {
            tracing::warn!(target: "riptide", "failed to watch fd {fd}: {err}");
            let _ = socket::close_fd(fd);
            c.release();
            return Ok(());
        }
        self.connections.insert(fd, c);
        self.srv.lb.calibrate(&self.handle, 1);
        self.loop_open(fd)
    }

    /// Main-reactor duty: accept and hand the fd to the sub-reactor the
    /// load balancer picks.
    pub(crate) fn accept_new_connection(&mut self, fd: RawFd) -> Result<()> {
        if fd != self.srv.listener.fd() {
            return Ok(());
        }
        match socket::accept(fd) {
            Ok(Some((nfd, sa))) => {
                if let Err(err) = socket::set_nonblocking(nfd) {
                    tracing::warn!(target: "riptide", "accept fd {nfd}: {err}");
                    let _ = socket::close_fd(nfd);
                    return Ok(());
                }
                let el = self.srv.lb.next(socket::addr_hash(&sa));
                if let Err(err) = el
                    .poller
                    .trigger(Box::new(move |el: &mut EventLoop| el.register(nfd, sa)))
                {
                    tracing::warn!(target: "riptide", "failed to dispatch fd {nfd}: {err}");
                    let _ = socket::close_fd(nfd);
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                tracing::warn!(target: "riptide", "accept on fd {fd}: {err}");
                Ok(())
            }
        }
    }

    // ── Open path ────────────────────────────────────────────────────

    fn loop_open(&mut self, fd: RawFd) -> Result<()> {
        let handler = Arc::clone(&self.srv.handler);
        let codec = Arc::clone(&self.srv.codec);
        let keep_alive = self.srv.opts.tcp_keep_alive;
        let is_tcp = self.srv.listener.is_tcp();
        let local = self.srv.listener.local_addr();

        let action = {
            let Some(c) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            c.opened = true;
            c.local_addr = local;
            c.remote_addr = c.sa.as_ref().and_then(socket::raw_to_net_addr);

            let (out, action) = handler.on_opened(c);

            if !keep_alive.is_zero() && is_tcp {
                if let Err(err) = socket::set_keep_alive(fd, keep_alive.as_secs() as i32) {
                    tracing::warn!(target: "riptide", "keep-alive on fd {fd}: {err}");
                }
            }
            if let Some(out) = out {
                if let Ok(frame) = codec.encode(c, &out) {
                    c.open(&frame);
                }
            }
            if !c.outbound.is_empty() {
                let _ = self.handle.poller.mod_read_write(fd);
            }
            action
        };
        self.handle_action(fd, action)
    }

    // ── Read path ────────────────────────────────────────────────────

    fn loop_read(&mut self, fd: RawFd) -> Result<()> {
        let n = match socket::read_fd(fd, &mut self.packet) {
            Ok(0) => return self.loop_close_conn(fd, None),
            Ok(n) => n,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return self.loop_close_conn(fd, Some(err)),
        };

        let handler = Arc::clone(&self.srv.handler);
        let codec = Arc::clone(&self.srv.codec);
        let poller = Arc::clone(&self.handle.poller);

        let mut pending_close: Option<Option<io::Error>> = None;
        let mut shutdown = false;
        {
            let Some(c) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            c.stage(&self.packet[..n]);

            // Drain complete frames; each may produce a reply.
            loop {
                let frame = match codec.decode(c) {
                    Ok(Some(frame)) => frame,
                    _ => break,
                };
                let (out, action) = handler.react(&frame, c);
                if let Some(out) = out {
                    handler.pre_write();
                    if let Ok(out_frame) = codec.encode(c, &out) {
                        if let Err(err) = raw_write(&poller, c, &out_frame) {
                            pending_close = Some(Some(err));
                            break;
                        }
                    }
                }
                match action {
                    Action::None => {}
                    Action::Close => {
                        pending_close = Some(None);
                        break;
                    }
                    Action::Shutdown => {
                        shutdown = true;
                        break;
                    }
                }
                if !c.opened {
                    return Ok(());
                }
            }

            if pending_close.is_none() && !shutdown {
                // Whatever the codec could not frame yet waits in the ring.
                c.absorb_staged();
            }
        }

        if shutdown {
            return Err(Error::Shutdown);
        }
        if let Some(err) = pending_close {
            return self.loop_close_conn(fd, err);
        }
        Ok(())
    }

    fn loop_read_udp(&mut self, fd: RawFd) -> Result<()> {
        let (n, sa) = match socket::recv_from(fd, &mut self.packet) {
            Ok(Some((n, sa))) if n > 0 => (n, sa),
            Ok(_) => return Ok(()),
            Err(err) => {
                tracing::warn!(target: "riptide", "failed to read UDP packet on fd {fd}: {err}");
                return Ok(());
            }
        };

        let handler = Arc::clone(&self.srv.handler);
        let mut c = Conn::new_udp(
            fd,
            sa,
            self.srv.listener.local_addr(),
            Arc::clone(&self.handle),
        );
        let (out, action) = handler.react(&self.packet[..n], &mut c);
        if let Some(out) = out {
            handler.pre_write();
            if let Err(err) = c.send_to(&out) {
                tracing::warn!(target: "riptide", "sendto on fd {fd}: {err}");
            }
        }
        if action == Action::Shutdown {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    // ── Write path ───────────────────────────────────────────────────

    fn loop_write(&mut self, fd: RawFd) -> Result<()> {
        self.srv.handler.pre_write();

        let poller = Arc::clone(&self.handle.poller);
        let mut close_err: Option<io::Error> = None;
        let mut drained = false;
        {
            let Some(c) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            // Head first; after a full head drain the ring rotates the old
            // tail into head position for the second pass.
            while !c.outbound.is_empty() {
                let (res, span) = {
                    let (head, _) = c.outbound.lazy_read_all();
                    (socket::write_fd(fd, head), head.len())
                };
                match res {
                    Ok(n) => {
                        c.outbound.shift(n);
                        if n < span {
                            break;
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        close_err = Some(err);
                        break;
                    }
                }
            }
            if close_err.is_none() && c.outbound.is_empty() {
                drained = true;
            }
        }

        if let Some(err) = close_err {
            return self.loop_close_conn(fd, Some(err));
        }
        if drained {
            // All flushed: writability is no longer interesting.
            let _ = poller.mod_read(fd);
        }
        Ok(())
    }

    /// Write through the connection, invoked by an `async_write` job on
    /// the owning reactor.
    pub(crate) fn async_write(&mut self, fd: RawFd, buf: &[u8]) -> Result<()> {
        let codec = Arc::clone(&self.srv.codec);
        let poller = Arc::clone(&self.handle.poller);

        let mut close_err: Option<io::Error> = None;
        {
            let Some(c) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            if !c.opened {
                return Ok(());
            }
            if let Ok(frame) = codec.encode(c, buf) {
                if let Err(err) = raw_write(&poller, c, &frame) {
                    close_err = Some(err);
                }
            }
        }
        match close_err {
            Some(err) => self.loop_close_conn(fd, Some(err)),
            None => Ok(()),
        }
    }

    /// Invoke `react` with an empty frame, from a `wake` job.
    pub(crate) fn loop_wake(&mut self, fd: RawFd) -> Result<()> {
        let handler = Arc::clone(&self.srv.handler);
        let codec = Arc::clone(&self.srv.codec);
        let poller = Arc::clone(&self.handle.poller);

        let mut close_err: Option<io::Error> = None;
        let action = {
            let Some(c) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            let (out, action) = handler.react(&[], c);
            if let Some(out) = out {
                if let Ok(frame) = codec.encode(c, &out) {
                    if let Err(err) = raw_write(&poller, c, &frame) {
                        close_err = Some(err);
                    }
                }
            }
            action
        };
        if let Some(err) = close_err {
            return self.loop_close_conn(fd, Some(err));
        }
        self.handle_action(fd, action)
    }

    // ── Close path ───────────────────────────────────────────────────

    pub(crate) fn loop_close_conn(&mut self, fd: RawFd, err: Option<io::Error>) -> Result<()> {
        if !self.connections.contains_key(&fd) {
            return Ok(());
        }

        // A clean close first tries to flush what the peer is owed.
        let has_pending = self
            .connections
            .get(&fd)
            .is_some_and(|c| !c.outbound.is_empty());
        if has_pending && err.is_none() {
            let _ = self.loop_write(fd);
            if !self.connections.contains_key(&fd) {
                return Ok(());
            }
        }

        if let Err(e) = self.handle.poller.delete(fd) {
            tracing::warn!(target: "riptide", "failed to delete fd {fd} from poller: {e}");
        }
        if let Err(e) = socket::close_fd(fd) {
            tracing::warn!(target: "riptide", "failed to close fd {fd}: {e}");
        }

        let Some(mut c) = self.connections.remove(&fd) else {
            return Ok(());
        };
        self.srv.lb.calibrate(&self.handle, -1);
        let action = self.srv.handler.on_closed(&mut c, err.as_ref());
        c.release();
        if action == Action::Shutdown {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn close_all_conns(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            let _ = self.loop_close_conn(fd, None);
        }
    }

    fn handle_action(&mut self, fd: RawFd, action: Action) -> Result<()> {
        match action {
            Action::None => Ok(()),
            Action::Close => self.loop_close_conn(fd, None),
            Action::Shutdown => Err(Error::Shutdown),
        }
    }

    // ── Loop entry points ────────────────────────────────────────────

    /// Sub-reactor loop: fd events and jobs until a shutdown sentinel.
    pub(crate) fn run(mut self) {
        if self.handle.idx == 0 && self.srv.opts.ticker {
            if let Some(rx) = self.tick_rx.take() {
                let poller = Arc::clone(&self.handle.poller);
                thread::Builder::new()
                    .name("riptide-ticker".into())
                    .spawn(move || ticker_loop(poller, rx))
                    .expect("failed to spawn ticker thread");
            }
        }

        let poller = Arc::clone(&self.handle.poller);
        let idx = self.handle.idx;
        let result = poller.polling(|polled| match polled {
            Polled::Io { fd, filter } => self.handle_event(fd, filter),
            Polled::Job(job) => job(&mut self),
        });
        log_loop_exit(idx, result);

        self.close_all_conns();
        self.srv.shutdown.signal();
    }

    /// Main-reactor loop: accept only, dispatching into the sub-reactors.
    pub(crate) fn run_main(mut self) {
        let poller = Arc::clone(&self.handle.poller);
        let result = poller.polling(|polled| match polled {
            Polled::Io { fd, .. } => self.accept_new_connection(fd),
            Polled::Job(job) => job(&mut self),
        });
        log_loop_exit(self.handle.idx, result);
        self.srv.shutdown.signal();
    }
}

fn log_loop_exit(idx: i32, result: Result<()>) {
    match result {
        Err(Error::Shutdown) => {
            tracing::debug!(target: "riptide", "event-loop {idx} exits on shutdown")
        }
        Err(err) => tracing::error!(target: "riptide", "event-loop {idx} exits with error: {err}"),
        Ok(()) => {}
    }
}

/// Reactor-side write: FIFO through the outbound ring. Queued bytes always
/// go behind earlier ones; a short or refused kernel write arms write
/// interest. An `Err` means the connection must be closed by the caller.
fn raw_write(poller: &Poller<Job>, c: &mut Conn, buf: &[u8]) -> io::Result<()> {
    if !c.outbound.is_empty() {
        c.outbound.write(buf);
        return Ok(());
    }
    match socket::write_fd(c.fd, buf) {
        Ok(n) if n < buf.len() => {
            c.outbound.write(&buf[n..]);
            let _ = poller.mod_read_write(c.fd);
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
            c.outbound.write(buf);
            let _ = poller.mod_read_write(c.fd);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Reactor 0's companion thread when the ticker option is on: trigger a
/// tick job, wait for the delay it reports, sleep, repeat. Stops when the
/// loop goes away (channel disconnect) or the trigger fails.
fn ticker_loop(poller: Arc<Poller<Job>>, rx: mpsc::Receiver<Duration>) {
    loop {
        let triggered = poller.trigger(Box::new(|el: &mut EventLoop| {
            let (delay, action) = el.srv.handler.tick();
            if let Some(tx) = &el.ticktock_tx {
                let _ = tx.try_send(delay);
            }
            if action == Action::Shutdown {
                return Err(Error::Shutdown);
            }
            Ok(())
        }));
        if let Err(err) = triggered {
            tracing::warn!(target: "riptide", "failed to awake poller, stopping ticker: {err}");
            break;
        }
        match rx.recv() {
            Ok(delay) => thread::sleep(delay),
            Err(_) => break,
        }
    }
}
