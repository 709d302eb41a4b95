//! kqueue-backed poller (macOS / BSD)
//!
//! The wake channel is `EVFILT_USER` on ident 0 with `EV_CLEAR`, so
//! repeated `NOTE_TRIGGER`s between polls collapse into one event.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::netpoll::{AsyncJobQueue, Filter, Polled, INIT_EVENTS};

fn zeroed_event() -> libc::kevent {
    libc::kevent {
        ident: 0,
        filter: 0,
        flags: 0,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

pub struct Poller<J> {
    kq: RawFd,
    jobs: AsyncJobQueue<J>,
    closed: AtomicBool,
}

impl<J: Send> Poller<J> {
    pub fn open() -> io::Result<Poller<J>> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let poller = Poller {
            kq,
            jobs: AsyncJobQueue::new(),
            closed: AtomicBool::new(false),
        };
        // Register the user-triggerable wake event.
        poller.change(0, libc::EVFILT_USER, libc::EV_ADD | libc::EV_CLEAR, 0)?;
        Ok(poller)
    }

    fn change(
        &self,
        ident: usize,
        filter: i16,
        flags: u16,
        fflags: u32,
    ) -> io::Result<()> {
        let mut ev = zeroed_event();
        ev.ident = ident;
        ev.filter = filter;
        ev.flags = flags;
        ev.fflags = fflags;
        let rc = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd as usize, libc::EVFILT_READ, libc::EV_ADD, 0)
    }

    pub fn add_write(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd as usize, libc::EVFILT_WRITE, libc::EV_ADD, 0)
    }

    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.add_read(fd)?;
        self.add_write(fd)
    }

    /// Drop write interest; read interest persists on its own filter.
    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd as usize, libc::EVFILT_WRITE, libc::EV_DELETE, 0)
    }

    /// Arm write interest alongside the existing read filter.
    pub fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd as usize, libc::EVFILT_WRITE, libc::EV_ADD, 0)
    }

    /// No-op: kqueue drops a closed fd's events on its own.
    pub fn delete(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if unsafe { libc::close(self.kq) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Enqueue a job for the polling thread; the first pending entry fires
    /// the user event, later pushes coalesce.
    pub fn trigger(&self, job: J) -> io::Result<()> {
        if self.jobs.push(job) == 1 {
            self.change(0, libc::EVFILT_USER, 0, libc::NOTE_TRIGGER)?;
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
        let mut events = vec![zeroed_event(); size];

        loop {
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    size as libc::c_int,
                    ptr::null(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::Shutdown);
                }
                tracing::error!(target: "riptide", "kevent: {err}");
                continue;
            }

            let n = n as usize;
            let mut waken_up = false;
            for ev in &events[..n] {
                if ev.ident == 0 && ev.filter == libc::EVFILT_USER {
                    waken_up = true;
                    continue;
                }

                let fd = ev.ident as RawFd;
                let filter = if ev.flags & (libc::EV_EOF | libc::EV_ERROR) != 0 {
                    Filter::Sock
                } else if ev.filter == libc::EVFILT_WRITE {
                    Filter::Write
                } else {
                    Filter::Read
                };
                f(Polled::Io { fd, filter })?;
            }

            if waken_up {
                for job in self.jobs.drain() {
                    f(Polled::Job(job))?;
                }
            }

            if n == size {
                size <<= 1;
                events = vec![zeroed_event(); size];
            }
        }
    }
}

impl<J> Drop for Poller<J> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe { libc::close(self.kq) };
        }
    }
}
