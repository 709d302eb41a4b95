//! Listening socket
//!
//! Resolves the `[scheme://]host:port` address grammar, builds the raw
//! listener fd (TCP, UDP packet socket, or Unix stream socket), and owns
//! its teardown. The fd is always non-blocking: in reactors mode only the
//! main reactor polls it, in loops mode every sub-reactor does and the
//! ones that lose the accept race must see `EAGAIN`, not a stall.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::socket::{self, NetAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Network {
    Tcp,
    Udp,
    Unix,
}

#[derive(Debug)]
pub(crate) struct Listener {
    fd: RawFd,
    network: Network,
    local: Option<NetAddr>,
    /// Unix socket path, unlinked again on close.
    path: Option<String>,
    closed: AtomicBool,
}

/// Split `[scheme://]address`, defaulting the scheme to `tcp`.
pub(crate) fn parse_addr(addr: &str) -> (String, String) {
    match addr.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest.to_owned()),
        None => ("tcp".to_owned(), addr.to_owned()),
    }
}

fn resolve(address: &str, scheme: &str) -> io::Result<SocketAddr> {
    let mut addrs = address.to_socket_addrs()?;
    let want_v4 = scheme.ends_with('4');
    let want_v6 = scheme.ends_with('6');
    addrs
        .find(|a| {
            if want_v4 {
                a.is_ipv4()
            } else if want_v6 {
                a.is_ipv6()
            } else {
                true
            }
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable address for {address}"),
            )
        })
}

impl Listener {
    pub(crate) fn bind(addr: &str, reuse_port: bool) -> Result<Listener> {
        let (scheme, address) = parse_addr(addr);
        match scheme.as_str() {
            "tcp" | "tcp4" | "tcp6" => {
                let sock_addr = resolve(&address, &scheme)?;
                let fd = socket::tcp_listen(sock_addr, reuse_port)?;
                Ok(Listener {
                    fd,
                    network: Network::Tcp,
                    local: socket::local_addr(fd)?,
                    path: None,
                    closed: AtomicBool::new(false),
                })
            }
            "udp" | "udp4" | "udp6" => {
                let sock_addr = resolve(&address, &scheme)?;
                let fd = socket::udp_bind(sock_addr, reuse_port)?;
                Ok(Listener {
                    fd,
                    network: Network::Udp,
                    local: socket::local_addr(fd)?,
                    path: None,
                    closed: AtomicBool::new(false),
                })
            }
            "unix" => {
                let fd = socket::unix_listen(&address)?;
                Ok(Listener {
                    fd,
                    network: Network::Unix,
                    local: Some(NetAddr::Unix(address.clone().into())),
                    path: Some(address),
                    closed: AtomicBool::new(false),
                })
            }
            _ => Err(Error::UnsupportedProtocol(scheme)),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn is_udp(&self) -> bool {
        self.network == Network::Udp
    }

    pub(crate) fn is_tcp(&self) -> bool {
        self.network == Network::Tcp
    }

    pub(crate) fn local_addr(&self) -> Option<NetAddr> {
        self.local.clone()
    }

    /// Close the fd and remove a Unix socket file. Safe to call more than
    /// once; only the first call acts.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = socket::close_fd(self.fd) {
            tracing::warn!(target: "riptide", "failed to close listener: {err}");
        }
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr_defaults_to_tcp() {
        assert_eq!(
            parse_addr("127.0.0.1:9000"),
            ("tcp".to_owned(), "127.0.0.1:9000".to_owned())
        );
        assert_eq!(
            parse_addr("udp://127.0.0.1:53"),
            ("udp".to_owned(), "127.0.0.1:53".to_owned())
        );
        assert_eq!(
            parse_addr("UNIX:///tmp/echo.sock"),
            ("unix".to_owned(), "/tmp/echo.sock".to_owned())
        );
    }

    #[test]
    fn test_bind_unsupported_scheme() {
        let err = Listener::bind("quic://127.0.0.1:9000", false).unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(s) if s == "quic"));
    }

    #[test]
    fn test_bind_ephemeral_tcp_port() {
        let ln = Listener::bind("tcp://127.0.0.1:0", false).unwrap();
        match ln.local_addr() {
            Some(NetAddr::Inet(addr)) => assert_ne!(addr.port(), 0),
            other => panic!("unexpected local addr: {other:?}"),
        }
        ln.close();
    }

    #[test]
    fn test_bind_udp() {
        let ln = Listener::bind("udp://127.0.0.1:0", false).unwrap();
        assert!(ln.is_udp());
        ln.close();
    }
}
