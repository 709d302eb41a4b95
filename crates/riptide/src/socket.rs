//! Raw socket plumbing
//!
//! All fds in the reactor path are plain `libc` descriptors: listeners,
//! accepted connections, and the UDP packet socket. Everything here is a
//! thin errno-checked wrapper; `WouldBlock` surfaces as `Ok(None)` on the
//! accept/recv paths so callers can defer to readiness.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Listen backlog for TCP and Unix listeners.
const BACKLOG: libc::c_int = 4096;

/// A peer or local address: IP for tcp/udp, filesystem path for unix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddr::Inet(addr) => write!(f, "{addr}"),
            NetAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Raw kernel sockaddr, carried across threads when an accepted fd is
/// handed from the main reactor to a sub-reactor.
#[derive(Clone, Copy)]
pub(crate) struct RawAddr {
    pub(crate) storage: libc::sockaddr_storage,
    pub(crate) len: libc::socklen_t,
}

impl RawAddr {
    fn zeroed() -> RawAddr {
        RawAddr {
            // Safety: sockaddr_storage is plain bytes
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

// ── fd I/O ───────────────────────────────────────────────────────────

pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

pub(crate) fn close_fd(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::close(fd) }).map(|_| ())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(|_| ())
}

fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    opt: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    cvt(rc).map(|_| ())
}

/// SO_KEEPALIVE plus the idle/interval seconds, spelled the platform's way.
pub(crate) fn set_keep_alive(fd: RawFd, secs: libc::c_int) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs)?;
            setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, secs)
        } else {
            setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPALIVE, secs)
        }
    }
}

fn new_socket(family: libc::c_int, ty: libc::c_int) -> io::Result<RawFd> {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            cvt(unsafe { libc::socket(family, ty | libc::SOCK_CLOEXEC, 0) })
        } else {
            let fd = cvt(unsafe { libc::socket(family, ty, 0) })?;
            let _ = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
            Ok(fd)
        }
    }
}

// ── Listener setup ───────────────────────────────────────────────────

pub(crate) fn tcp_listen(addr: SocketAddr, reuse_port: bool) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = new_socket(family, libc::SOCK_STREAM)?;
    let raw = inet_raw(&addr);
    let res = (|| {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        if reuse_port {
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }
        cvt(unsafe {
            libc::bind(
                fd,
                &raw.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                raw.len,
            )
        })?;
        cvt(unsafe { libc::listen(fd, BACKLOG) })?;
        set_nonblocking(fd)
    })();
    if let Err(err) = res {
        let _ = close_fd(fd);
        return Err(err);
    }
    Ok(fd)
}

pub(crate) fn udp_bind(addr: SocketAddr, reuse_port: bool) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = new_socket(family, libc::SOCK_DGRAM)?;
    let raw = inet_raw(&addr);
    let res = (|| {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        if reuse_port {
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }
        cvt(unsafe {
            libc::bind(
                fd,
                &raw.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                raw.len,
            )
        })?;
        set_nonblocking(fd)
    })();
    if let Err(err) = res {
        let _ = close_fd(fd);
        return Err(err);
    }
    Ok(fd)
}

pub(crate) fn unix_listen(path: &str) -> io::Result<RawFd> {
    // Stale socket files refuse the bind.
    let _ = std::fs::remove_file(path);
    let fd = new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;
    let raw = unix_raw(path)?;
    let res = (|| {
        cvt(unsafe {
            libc::bind(
                fd,
                &raw.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                raw.len,
            )
        })?;
        cvt(unsafe { libc::listen(fd, BACKLOG) })?;
        set_nonblocking(fd)
    })();
    if let Err(err) = res {
        let _ = close_fd(fd);
        return Err(err);
    }
    Ok(fd)
}

// ── Accept / datagram I/O ────────────────────────────────────────────

/// Accept one pending connection; `Ok(None)` when the backlog is empty.
pub(crate) fn accept(fd: RawFd) -> io::Result<Option<(RawFd, RawAddr)>> {
    let mut raw = RawAddr::zeroed();
    let rc = unsafe {
        libc::accept(
            fd,
            &mut raw.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut raw.len,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some((rc, raw)))
}

/// Receive one datagram; `Ok(None)` when none is pending.
pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<(usize, RawAddr)>> {
    let mut raw = RawAddr::zeroed();
    let rc = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut raw.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut raw.len,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some((rc as usize, raw)))
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], dst: &RawAddr) -> io::Result<usize> {
    let rc = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &dst.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            dst.len,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

// ── sockaddr conversion ──────────────────────────────────────────────

pub(crate) fn inet_raw(addr: &SocketAddr) -> RawAddr {
    let mut raw = RawAddr::zeroed();
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut raw.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            // Safety: sockaddr_storage is large enough for any sockaddr
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                };
            }
            raw.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        }
        SocketAddr::V6(v6) => {
            let sin6 =
                &mut raw.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            // Safety: as above
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            raw.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        }
    }
    raw
}

pub(crate) fn unix_raw(path: &str) -> io::Result<RawAddr> {
    let mut raw = RawAddr::zeroed();
    let sun = &mut raw.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_un;
    // Safety: sockaddr_storage is large enough for sockaddr_un
    let sun = unsafe { &mut *sun };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_bytes();
    if bytes.len() >= sun.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix socket path too long",
        ));
    }
    for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    raw.len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    Ok(raw)
}

pub(crate) fn raw_to_net_addr(raw: &RawAddr) -> Option<NetAddr> {
    match raw.storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin =
                &raw.storage as *const libc::sockaddr_storage as *const libc::sockaddr_in;
            // Safety: family says this is a sockaddr_in
            let sin = unsafe { &*sin };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(NetAddr::Inet(SocketAddr::new(
                ip.into(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 =
                &raw.storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6;
            // Safety: family says this is a sockaddr_in6
            let sin6 = unsafe { &*sin6 };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(NetAddr::Inet(SocketAddr::new(
                ip.into(),
                u16::from_be(sin6.sin6_port),
            )))
        }
        libc::AF_UNIX => {
            let sun =
                &raw.storage as *const libc::sockaddr_storage as *const libc::sockaddr_un;
            // Safety: family says this is a sockaddr_un
            let sun = unsafe { &*sun };
            let path: Vec<u8> = sun
                .sun_path
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8)
                .collect();
            Some(NetAddr::Unix(PathBuf::from(
                String::from_utf8_lossy(&path).into_owned(),
            )))
        }
        _ => None,
    }
}

/// Local address of a bound socket.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<Option<NetAddr>> {
    let mut raw = RawAddr::zeroed();
    cvt(unsafe {
        libc::getsockname(
            fd,
            &mut raw.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut raw.len,
        )
    })?;
    Ok(raw_to_net_addr(&raw))
}

/// Stable hash of a peer address, for source-address load balancing.
pub(crate) fn addr_hash(raw: &RawAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    let bytes = unsafe {
        std::slice::from_raw_parts(
            &raw.storage as *const libc::sockaddr_storage as *const u8,
            (raw.len as usize).min(mem::size_of::<libc::sockaddr_storage>()),
        )
    };
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inet_raw_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let raw = inet_raw(&addr);
        assert_eq!(raw_to_net_addr(&raw), Some(NetAddr::Inet(addr)));
    }

    #[test]
    fn test_inet_raw_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let raw = inet_raw(&addr);
        assert_eq!(raw_to_net_addr(&raw), Some(NetAddr::Inet(addr)));
    }

    #[test]
    fn test_unix_raw_round_trip() {
        let raw = unix_raw("/tmp/riptide-test.sock").unwrap();
        assert_eq!(
            raw_to_net_addr(&raw),
            Some(NetAddr::Unix(PathBuf::from("/tmp/riptide-test.sock")))
        );
    }

    #[test]
    fn test_addr_hash_is_stable_per_peer() {
        let a = inet_raw(&"10.0.0.1:1234".parse().unwrap());
        let b = inet_raw(&"10.0.0.2:1234".parse().unwrap());
        assert_eq!(addr_hash(&a), addr_hash(&a));
        assert_ne!(addr_hash(&a), addr_hash(&b));
    }
}
