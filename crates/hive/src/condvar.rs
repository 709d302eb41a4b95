//! Condition variable bound to a [`SpinLock`]
//!
//! `std::sync::Condvar` only pairs with `std::sync::Mutex`, so the pool's
//! blocking admission path needs its own wait primitive on top of the
//! spinlock. Waiters park their OS thread; a per-waiter notified flag
//! absorbs spurious `park` returns, and the unpark token covers the window
//! between releasing the lock and parking.
//!
//! Callers must still re-check their predicate in a loop after `wait`
//! returns: a notification only means the state *may* have changed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::spinlock::{SpinLock, SpinLockGuard};

struct Waiter {
    thread: Thread,
    notified: AtomicBool,
}

/// A wait queue whose `wait` atomically releases a [`SpinLock`] guard and
/// reacquires the lock before returning.
pub struct Condvar {
    waiters: SpinLock<VecDeque<Arc<Waiter>>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Condvar {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Release `guard`, sleep until notified, then reacquire the lock.
    pub fn wait<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let waiter = Arc::new(Waiter {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        });
        self.waiters.lock().push_back(Arc::clone(&waiter));

        let lock = guard.source();
        drop(guard);

        while !waiter.notified.load(Ordering::Acquire) {
            thread::park();
        }

        lock.lock()
    }

    /// Wake exactly one waiter, if any.
    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().pop_front();
        if let Some(w) = waiter {
            w.notified.store(true, Ordering::Release);
            w.thread.unpark();
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock();
            waiters.drain(..).collect()
        };
        for w in drained {
            w.notified.store(true, Ordering::Release);
            w.thread.unpark();
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_notify_one_wakes_waiter() {
        let lock = Arc::new(SpinLock::new(false));
        let cond = Arc::new(Condvar::new());

        let handle = {
            let lock = Arc::clone(&lock);
            let cond = Arc::clone(&cond);
            thread::spawn(move || {
                let mut ready = lock.lock();
                while !*ready {
                    ready = cond.wait(ready);
                }
            })
        };

        thread::sleep(Duration::from_millis(50));
        *lock.lock() = true;
        cond.notify_one();
        handle.join().unwrap();
    }

    #[test]
    fn test_notify_all_wakes_everyone() {
        let lock = Arc::new(SpinLock::new(false));
        let cond = Arc::new(Condvar::new());
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let cond = Arc::clone(&cond);
            handles.push(thread::spawn(move || {
                let mut ready = lock.lock();
                while !*ready {
                    ready = cond.wait(ready);
                }
            }));
        }

        thread::sleep(Duration::from_millis(50));
        *lock.lock() = true;
        cond.notify_all();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_notify_before_park_is_not_lost() {
        // The unpark token is sticky: a notify that lands between releasing
        // the lock and parking must still wake the waiter.
        let lock = Arc::new(SpinLock::new(0u32));
        let cond = Arc::new(Condvar::new());

        for _ in 0..100 {
            let handle = {
                let lock = Arc::clone(&lock);
                let cond = Arc::clone(&cond);
                thread::spawn(move || {
                    let mut n = lock.lock();
                    while *n == 0 {
                        n = cond.wait(n);
                    }
                })
            };
            *lock.lock() = 1;
            // Race the notify against the wait on purpose.
            loop {
                cond.notify_one();
                if handle.is_finished() {
                    break;
                }
                thread::yield_now();
            }
            handle.join().unwrap();
            *lock.lock() = 0;
        }
    }
}
