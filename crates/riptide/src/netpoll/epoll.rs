//! epoll-backed poller (Linux)
//!
//! The wake channel is an eventfd registered for read interest. Reading
//! the eventfd clears its counter, so any number of `trigger` calls
//! between two polls collapses into one readiness event.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::netpoll::{AsyncJobQueue, Filter, Polled, INIT_EVENTS};

pub struct Poller<J> {
    epfd: RawFd,
    wake_fd: RawFd,
    jobs: AsyncJobQueue<J>,
    closed: AtomicBool,
}

impl<J: Send> Poller<J> {
    pub fn open() -> io::Result<Poller<J>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let poller = Poller {
            epfd,
            wake_fd,
            jobs: AsyncJobQueue::new(),
            closed: AtomicBool::new(false),
        };
        poller.ctl(libc::EPOLL_CTL_ADD, wake_fd, libc::EPOLLIN as u32)?;
        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)
    }

    pub fn add_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLOUT as u32)
    }

    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        )
    }

    /// Drop write interest, keeping read.
    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, libc::EPOLLIN as u32)
    }

    /// Arm write interest alongside read.
    pub fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        )
    }

    /// Remove the fd from the interest set. Required on epoll: closing an
    /// fd does not evict it while other references to the open file exist.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let rc1 = unsafe { libc::close(self.wake_fd) };
        let rc2 = unsafe { libc::close(self.epfd) };
        if rc1 < 0 || rc2 < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Enqueue a job for the polling thread; the first pending entry fires
    /// the eventfd, later pushes coalesce.
    pub fn trigger(&self, job: J) -> io::Result<()> {
        if self.jobs.push(job) == 1 {
            let one: u64 = 1;
            let rc = unsafe {
                libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                // A full eventfd counter still means a wakeup is pending.
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// The core loop: block for readiness, dispatch fd events, then drain
    /// async jobs. Returns when a callback returns an error (the shutdown
    /// sentinel included).
    pub fn polling<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Polled<J>) -> Result<()>,
    {
        let mut size = INIT_EVENTS;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; size];

        loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), size as libc::c_int, -1)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::Shutdown);
                }
                tracing::error!(target: "riptide", "epoll_wait: {err}");
                continue;
            }

            let n = n as usize;
            let mut waken_up = false;
            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                if fd == self.wake_fd {
                    waken_up = true;
                    let mut counter: u64 = 0;
                    unsafe {
                        libc::read(
                            self.wake_fd,
                            &mut counter as *mut u64 as *mut libc::c_void,
                            8,
                        )
                    };
                    continue;
                }

                let flags = ev.events;
                if flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    f(Polled::Io {
                        fd,
                        filter: Filter::Sock,
                    })?;
                    continue;
                }
                if flags & libc::EPOLLOUT as u32 != 0 {
                    f(Polled::Io {
                        fd,
                        filter: Filter::Write,
                    })?;
                }
                if flags & libc::EPOLLIN as u32 != 0 {
                    f(Polled::Io {
                        fd,
                        filter: Filter::Read,
                    })?;
                }
            }

            if waken_up {
                for job in self.jobs.drain() {
                    f(Polled::Job(job))?;
                }
            }

            if n == size {
                size <<= 1;
                events = vec![libc::epoll_event { events: 0, u64: 0 }; size];
            }
        }
    }
}

impl<J> Drop for Poller<J> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.wake_fd);
                libc::close(self.epfd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_runs_jobs_after_fd_events() {
        let poller: Poller<u32> = Poller::open().unwrap();
        poller.trigger(7).unwrap();
        poller.trigger(8).unwrap();

        let mut seen = Vec::new();
        let err = poller
            .polling(|polled| match polled {
                Polled::Job(j) => {
                    seen.push(j);
                    if seen.len() == 2 {
                        Err(Error::Shutdown)
                    } else {
                        Ok(())
                    }
                }
                Polled::Io { .. } => Ok(()),
            })
            .unwrap_err();

        assert!(matches!(err, Error::Shutdown));
        assert_eq!(seen, vec![7, 8]);
        poller.close().unwrap();
    }

    #[test]
    fn test_write_interest_lifecycle() {
        let poller: Poller<()> = Poller::open().unwrap();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        // An empty pipe is immediately writable.
        poller.add_write(wr).unwrap();
        let mut hit = None;
        let _ = poller.polling(|polled| {
            if let Polled::Io { fd, filter } = polled {
                hit = Some((fd, filter));
            }
            Err(Error::Shutdown)
        });
        assert_eq!(hit, Some((wr, Filter::Write)));

        // Swap interest down to read-only and back up.
        poller.mod_read(wr).unwrap();
        poller.mod_read_write(wr).unwrap();
        poller.delete(wr).unwrap();

        poller.add_read_write(rd).unwrap();
        poller.delete(rd).unwrap();

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
        poller.close().unwrap();
    }

    #[test]
    fn test_readable_fd_is_reported() {
        let poller: Poller<()> = Poller::open().unwrap();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);
        poller.add_read(rd).unwrap();

        let payload = b"x";
        unsafe { libc::write(wr, payload.as_ptr() as *const libc::c_void, 1) };

        let mut hit = None;
        let err = poller
            .polling(|polled| match polled {
                Polled::Io { fd, filter } => {
                    hit = Some((fd, filter));
                    Err(Error::Shutdown)
                }
                Polled::Job(()) => Ok(()),
            })
            .unwrap_err();

        assert!(matches!(err, Error::Shutdown));
        assert_eq!(hit, Some((rd, Filter::Read)));

        poller.delete(rd).unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
        poller.close().unwrap();
    }
}
