//! End-to-end serving over real sockets: TCP echo, UDP echo, cross-thread
//! replies through the task pool, and graceful shutdown from a handler.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use riptide::{serve, Action, Conn, EventHandler, NetAddr, Options, ServerInfo};

/// Echoes frames back; `stop` shuts the server down. Reports the bound
/// address (the tests bind port 0) through a channel.
struct Echo {
    addr_tx: Mutex<Option<mpsc::Sender<SocketAddr>>>,
    /// Reply via the task pool + async_write instead of the return value.
    offload: bool,
}

impl Echo {
    fn new(offload: bool) -> (Echo, mpsc::Receiver<SocketAddr>) {
        let (tx, rx) = mpsc::channel();
        (
            Echo {
                addr_tx: Mutex::new(Some(tx)),
                offload,
            },
            rx,
        )
    }
}

impl EventHandler for Echo {
    fn on_init_complete(&self, srv: &ServerInfo) -> Action {
        if let Some(NetAddr::Inet(addr)) = &srv.addr {
            if let Some(tx) = self.addr_tx.lock().unwrap().take() {
                let _ = tx.send(*addr);
            }
        }
        Action::None
    }

    fn react(&self, frame: &[u8], c: &mut Conn) -> (Option<Vec<u8>>, Action) {
        if frame == b"stop" {
            return (None, Action::Shutdown);
        }
        if self.offload {
            let handle = c.handle();
            let reply = frame.to_vec();
            riptide::task_pool()
                .submit(move || {
                    let _ = handle.async_write(reply);
                })
                .expect("task pool refused echo job");
            return (None, Action::None);
        }
        (Some(frame.to_vec()), Action::None)
    }
}

fn join_within(
    handle: thread::JoinHandle<riptide::Result<()>>,
    timeout: Duration,
) -> riptide::Result<()> {
    let start = Instant::now();
    while !handle.is_finished() {
        assert!(
            start.elapsed() < timeout,
            "server did not shut down in time"
        );
        thread::sleep(Duration::from_millis(50));
    }
    handle.join().expect("server thread panicked")
}

fn echo_round(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, payload);
}

#[test]
fn test_tcp_echo_and_graceful_shutdown() {
    let (handler, addr_rx) = Echo::new(false);
    let server = thread::spawn(move || serve(handler, "tcp://127.0.0.1:0", Options::new()));
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // The connection stays open across frames.
    echo_round(&mut stream, b"hello");
    echo_round(&mut stream, b"hello again");

    stream.write_all(b"stop").unwrap();
    join_within(server, Duration::from_secs(10)).unwrap();

    // The shutdown sequence closed the server side.
    let mut buf = [0u8; 8];
    match stream.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes after shutdown"),
    }
}

#[test]
fn test_tcp_echo_multicore_reactors() {
    let (handler, addr_rx) = Echo::new(false);
    let server = thread::spawn(move || {
        serve(
            handler,
            "tcp://127.0.0.1:0",
            Options::new().with_num_event_loop(3),
        )
    });
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Several connections, spread over the sub-reactors.
    let mut streams: Vec<TcpStream> = (0..6)
        .map(|_| {
            let s = TcpStream::connect(addr).unwrap();
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            s
        })
        .collect();
    for (i, stream) in streams.iter_mut().enumerate() {
        let payload = format!("conn-{i}");
        echo_round(stream, payload.as_bytes());
    }

    streams[0].write_all(b"stop").unwrap();
    join_within(server, Duration::from_secs(10)).unwrap();
}

#[test]
fn test_tcp_echo_via_task_pool_offload() {
    let (handler, addr_rx) = Echo::new(true);
    let server = thread::spawn(move || serve(handler, "tcp://127.0.0.1:0", Options::new()));
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    for i in 0..5 {
        echo_round(&mut stream, format!("offload-{i}").as_bytes());
    }

    stream.write_all(b"stop").unwrap();
    join_within(server, Duration::from_secs(10)).unwrap();
}

#[test]
fn test_udp_echo() {
    let (handler, addr_rx) = Echo::new(false);
    let server = thread::spawn(move || serve(handler, "udp://127.0.0.1:0", Options::new()));
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client.send_to(b"ping", addr).unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, addr);

    client.send_to(b"stop", addr).unwrap();
    join_within(server, Duration::from_secs(10)).unwrap();
}
