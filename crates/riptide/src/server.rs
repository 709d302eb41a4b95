//! Server assembly and lifecycle
//!
//! `serve` validates options, binds the listener, builds the sub-reactor
//! set behind the load balancer, and runs one of two startup modes:
//!
//! - **reactors mode** (TCP/Unix without `SO_REUSEPORT`): a dedicated main
//!   reactor owns the listener and hands accepted fds to sub-reactors;
//! - **loops mode** (`reuse_port` or UDP): every sub-reactor watches the
//!   listener fd itself and the kernel picks the waker.
//!
//! Shutdown is edge-persistent: the gate latches a flag under its mutex,
//! so a signal that fires before `stop` starts waiting is never lost.

use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Condvar, Mutex, Once};
use std::thread;
use std::time::Duration;

use crate::codec::{BuiltInFrameCodec, Codec};
use crate::error::{Error, Result};
use crate::eventloop::{EventLoop, Job, LoopHandle};
use crate::lb::{new_load_balancer, LoadBalancer};
use crate::listener::Listener;
use crate::netpoll::Poller;
use crate::options::Options;
use crate::socket::NetAddr;
use crate::{Action, EventHandler};

/// Latch + broadcast. `signal` may fire before anyone waits; the flag
/// keeps the edge.
pub(crate) struct ShutdownGate {
    flagged: Mutex<bool>,
    cond: Condvar,
    once: Once,
}

impl ShutdownGate {
    fn new() -> ShutdownGate {
        ShutdownGate {
            flagged: Mutex::new(false),
            cond: Condvar::new(),
            once: Once::new(),
        }
    }

    pub(crate) fn signal(&self) {
        self.once.call_once(|| {
            let mut flagged = self.flagged.lock().unwrap_or_else(|e| e.into_inner());
            *flagged = true;
            self.cond.notify_all();
        });
    }

    fn wait(&self) {
        let mut flagged = self.flagged.lock().unwrap_or_else(|e| e.into_inner());
        while !*flagged {
            flagged = self
                .cond
                .wait(flagged)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// State shared by every reactor of one server.
pub(crate) struct ServerShared {
    pub(crate) opts: Options,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) listener: Listener,
    pub(crate) lb: Box<dyn LoadBalancer>,
    pub(crate) shutdown: ShutdownGate,
}

/// Snapshot of the running server handed to handler callbacks.
#[derive(Clone)]
pub struct ServerInfo {
    pub multicore: bool,
    pub addr: Option<NetAddr>,
    pub num_event_loop: usize,
    pub reuse_port: bool,
    pub tcp_keep_alive: Duration,
    shared: Arc<ServerShared>,
}

impl ServerInfo {
    /// Active connections, summed over all sub-reactors.
    pub fn count_connections(&self) -> i32 {
        let mut total = 0;
        self.shared.lb.iterate(&mut |_, el| {
            total += el.conn_count.load(Ordering::Acquire);
            true
        });
        total
    }
}

/// Bind `addr` and serve events to `handler` until shutdown — a SIGINT or
/// SIGTERM, or any callback returning [`Action::Shutdown`].
///
/// The address grammar is `[scheme://]host:port` with scheme in
/// {tcp, tcp4, tcp6, udp, udp4, udp6, unix}; bare `host:port` means tcp.
pub fn serve(handler: impl EventHandler + 'static, addr: &str, opts: Options) -> Result<()> {
    let listener = Listener::bind(addr, opts.reuse_port)?;

    let num_event_loop = if opts.num_event_loop > 0 {
        opts.num_event_loop
    } else if opts.multicore {
        thread::available_parallelism().map_or(1, usize::from)
    } else {
        1
    };

    let codec: Arc<dyn Codec> = match &opts.codec {
        Some(codec) => Arc::clone(codec),
        None => Arc::new(BuiltInFrameCodec),
    };

    let shared = Arc::new(ServerShared {
        lb: new_load_balancer(opts.lb),
        handler: Arc::new(handler),
        codec,
        listener,
        shutdown: ShutdownGate::new(),
        opts,
    });

    let info = ServerInfo {
        multicore: shared.opts.multicore,
        addr: shared.listener.local_addr(),
        num_event_loop,
        reuse_port: shared.opts.reuse_port,
        tcp_keep_alive: shared.opts.tcp_keep_alive,
        shared: Arc::clone(&shared),
    };

    if shared.handler.on_init_complete(&info) == Action::Shutdown {
        return Ok(());
    }

    install_signal_watcher(Arc::clone(&shared));

    let (handles, main_loop) = start(&shared, num_event_loop)?;
    stop(&shared, handles, main_loop);

    shared.handler.on_shutdown(&info);
    Ok(())
}

/// Build and launch the reactor set. Returns the reactor thread handles
/// and, in reactors mode, the main reactor's shared handle.
fn start(
    shared: &Arc<ServerShared>,
    num_event_loop: usize,
) -> Result<(Vec<thread::JoinHandle<()>>, Option<Arc<LoopHandle>>)> {
    let loops_mode = shared.opts.reuse_port || shared.listener.is_udp();
    let mut handles = Vec::new();

    // All pollers come up before any thread starts, so a setup failure
    // here has nothing to unwind.
    let mut loops = Vec::with_capacity(num_event_loop);
    for i in 0..num_event_loop {
        let poller = Arc::new(Poller::<Job>::open()?);
        let lh = Arc::new(LoopHandle::new(i as i32, poller));
        if loops_mode {
            lh.poller.add_read(shared.listener.fd())?;
        }
        let ticktock = if i == 0 && shared.opts.ticker {
            Some(mpsc::sync_channel(1))
        } else {
            None
        };
        let el = EventLoop::new(Arc::clone(&lh), Arc::clone(shared), ticktock);
        shared.lb.register(lh);
        loops.push(el);
    }

    for el in loops {
        let name = format!("riptide-loop-{}", el.handle.idx);
        handles.push(
            thread::Builder::new()
                .name(name)
                .spawn(move || el.run())
                .expect("failed to spawn event-loop thread"),
        );
    }

    if loops_mode {
        return Ok((handles, None));
    }

    // Reactors mode: the main reactor owns the listener and only accepts.
    let main_setup = (|| -> Result<Arc<LoopHandle>> {
        let poller = Arc::new(Poller::<Job>::open()?);
        let lh = Arc::new(LoopHandle::new(-1, poller));
        lh.poller.add_read(shared.listener.fd())?;
        Ok(lh)
    })();
    let main_handle = match main_setup {
        Ok(lh) => lh,
        Err(err) => {
            // Sub-reactors are already polling; unwind them before failing.
            stop_loops(shared, &mut handles);
            return Err(err);
        }
    };

    let el = EventLoop::new(Arc::clone(&main_handle), Arc::clone(shared), None);
    handles.push(
        thread::Builder::new()
            .name("riptide-main".into())
            .spawn(move || el.run_main())
            .expect("failed to spawn main-reactor thread"),
    );
    Ok((handles, Some(main_handle)))
}

fn stop_loops(shared: &Arc<ServerShared>, handles: &mut Vec<thread::JoinHandle<()>>) {
    shared.lb.iterate(&mut |_, el| {
        if let Err(err) = el
            .poller
            .trigger(Box::new(|_: &mut EventLoop| Err(Error::Shutdown)))
        {
            tracing::warn!(target: "riptide", "failed to trigger shutdown: {err}");
        }
        true
    });
    for handle in handles.drain(..) {
        let _ = handle.join();
    }
    shared.lb.iterate(&mut |_, el| {
        let _ = el.poller.close();
        true
    });
}

/// Wait for the shutdown edge, then unwind: sentinel every reactor, close
/// the listener, join the loop threads, close the pollers.
fn stop(
    shared: &Arc<ServerShared>,
    mut handles: Vec<thread::JoinHandle<()>>,
    main_loop: Option<Arc<LoopHandle>>,
) {
    shared.shutdown.wait();

    shared.lb.iterate(&mut |_, el| {
        if let Err(err) = el
            .poller
            .trigger(Box::new(|_: &mut EventLoop| Err(Error::Shutdown)))
        {
            tracing::warn!(target: "riptide", "failed to trigger shutdown: {err}");
        }
        true
    });

    if let Some(main) = &main_loop {
        shared.listener.close();
        if let Err(err) = main
            .poller
            .trigger(Box::new(|_: &mut EventLoop| Err(Error::Shutdown)))
        {
            tracing::warn!(target: "riptide", "failed to trigger main shutdown: {err}");
        }
    }

    for handle in handles.drain(..) {
        let _ = handle.join();
    }

    shared.lb.iterate(&mut |_, el| {
        let _ = el.poller.close();
        true
    });
    if let Some(main) = &main_loop {
        let _ = main.poller.close();
    }
    shared.listener.close();
}

/// Funnel SIGINT/SIGTERM to a watcher thread via `sigwait`. The mask is
/// installed on the calling thread before the reactors spawn, so every
/// reactor inherits it and delivery lands only in the watcher.
fn install_signal_watcher(shared: Arc<ServerShared>) {
    use nix::sys::signal::{SigSet, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    if let Err(err) = set.thread_block() {
        tracing::warn!(target: "riptide", "failed to block shutdown signals: {err}");
        return;
    }

    thread::Builder::new()
        .name("riptide-signal".into())
        .spawn(move || loop {
            match set.wait() {
                Ok(_) => {
                    shared.shutdown.signal();
                    break;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    tracing::warn!(target: "riptide", "sigwait: {err}");
                    break;
                }
            }
        })
        .expect("failed to spawn signal watcher thread");
}
