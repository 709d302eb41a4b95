//! Echo server on riptide.
//!
//! ```text
//! echo [addr] [--multicore] [--offload]
//! ```
//!
//! `addr` takes the server grammar, e.g. `tcp://0.0.0.0:9000`,
//! `udp://0.0.0.0:9000`, or `unix:///tmp/echo.sock`. With `--offload`,
//! replies are produced on the shared worker pool and delivered through
//! `async_write` instead of the `react` return value.

use riptide::{serve, Action, Conn, EventHandler, Options, ServerInfo};

struct Echo {
    offload: bool,
}

impl EventHandler for Echo {
    fn on_init_complete(&self, srv: &ServerInfo) -> Action {
        if let Some(addr) = &srv.addr {
            tracing::info!(
                "echo server is listening on {addr} ({} event-loop(s))",
                srv.num_event_loop
            );
        }
        Action::None
    }

    fn react(&self, frame: &[u8], c: &mut Conn) -> (Option<Vec<u8>>, Action) {
        if !self.offload {
            return (Some(frame.to_vec()), Action::None);
        }
        let handle = c.handle();
        let reply = frame.to_vec();
        if let Err(err) = riptide::task_pool().submit(move || {
            let _ = handle.async_write(reply);
        }) {
            tracing::warn!("task pool refused echo job: {err}");
        }
        (None, Action::None)
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut addr = "tcp://127.0.0.1:9000".to_owned();
    let mut opts = Options::new();
    let mut offload = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--multicore" => opts = opts.with_multicore(true),
            "--offload" => offload = true,
            other => addr = other.to_owned(),
        }
    }

    if let Err(err) = serve(Echo { offload }, &addr, opts) {
        tracing::error!("echo server stopped with error: {err}");
        std::process::exit(1);
    }
}
