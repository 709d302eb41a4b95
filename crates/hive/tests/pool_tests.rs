//! End-to-end pool behavior over real threads.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use hive::{Error, Options, Pool, PoolWithFunc};

/// Poll `cond` until it holds or `timeout` elapses.
fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_hundred_tasks_on_ten_workers() {
    let pool = Pool::new(10).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let done = Arc::clone(&done);
        pool.submit(move || {
            thread::sleep(Duration::from_millis(10));
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        done.load(Ordering::SeqCst) == 100
    }));
    assert!(pool.running() <= 10);

    // Idle workers expire on the next reaper ticks (default 1 s interval).
    assert!(wait_until(Duration::from_secs(5), || pool.running() == 0));
    assert_eq!(pool.free(), pool.cap());
    pool.release();
}

#[test]
fn test_nonblocking_overload() {
    let pool = Pool::with_options(1, Options::new().with_nonblocking(true)).unwrap();
    let (hold_tx, hold_rx) = mpsc::channel::<()>();

    pool.submit(move || {
        let _ = hold_rx.recv();
    })
    .unwrap();
    assert!(wait_until(Duration::from_secs(2), || pool.running() == 1));

    assert_eq!(pool.submit(|| {}), Err(Error::PoolOverload));

    hold_tx.send(()).unwrap();
    pool.release();
}

#[test]
fn test_max_blocking_tasks_caps_waiters() {
    let pool = Pool::with_options(1, Options::new().with_max_blocking_tasks(1)).unwrap();
    let (hold_tx, hold_rx) = mpsc::channel::<()>();

    pool.submit(move || {
        let _ = hold_rx.recv();
    })
    .unwrap();
    assert!(wait_until(Duration::from_secs(2), || pool.running() == 1));

    // One submitter is admitted to wait...
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.submit(|| {}))
    };
    thread::sleep(Duration::from_millis(200));

    // ...the next one is refused outright.
    assert_eq!(pool.submit(|| {}), Err(Error::PoolOverload));

    hold_tx.send(()).unwrap();
    assert_eq!(waiter.join().unwrap(), Ok(()));
    pool.release();
}

#[test]
fn test_release_then_reboot() {
    let pool = Pool::new(4).unwrap();
    pool.release();
    assert_eq!(pool.submit(|| {}), Err(Error::PoolClosed));

    pool.reboot();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    pool.submit(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert!(wait_until(Duration::from_secs(2), || ran.load(Ordering::SeqCst)));
    pool.release();
}

#[test]
fn test_reaper_terminates_idle_workers() {
    let pool = Pool::with_options(
        4,
        Options::new().with_expiry_duration(Duration::from_millis(100)),
    )
    .unwrap();

    for _ in 0..4 {
        pool.submit(|| {}).unwrap();
    }
    assert!(wait_until(Duration::from_secs(3), || pool.running() == 0));
    pool.release();
}

#[test]
fn test_panic_routes_to_handler_and_pool_survives() {
    let caught = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&caught);
    let pool = Pool::with_options(
        2,
        Options::new().with_panic_handler(Arc::new(move |_| {
            flag.store(true, Ordering::SeqCst);
        })),
    )
    .unwrap();

    pool.submit(|| panic!("boom")).unwrap();
    assert!(wait_until(Duration::from_secs(2), || caught.load(Ordering::SeqCst)));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    pool.submit(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert!(wait_until(Duration::from_secs(2), || ran.load(Ordering::SeqCst)));
    pool.release();
}

#[test]
fn test_unbounded_pool() {
    let pool = Pool::new(-1).unwrap();
    assert_eq!(pool.cap(), -1);

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let done = Arc::clone(&done);
        pool.submit(move || {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 100
    }));
    pool.release();
}

#[test]
fn test_pre_alloc_pool_runs_tasks() {
    let pool = Pool::with_options(8, Options::new().with_pre_alloc(true)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..32 {
        let done = Arc::clone(&done);
        pool.submit(move || {
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 32
    }));
    pool.release();
}

#[test]
fn test_invoke_delivers_args() {
    let sum = Arc::new(AtomicI64::new(0));
    let total = Arc::clone(&sum);
    let pool = PoolWithFunc::new(10, move |ms: i64| {
        thread::sleep(Duration::from_millis(ms as u64));
        total.fetch_add(ms, Ordering::SeqCst);
    })
    .unwrap();

    pool.invoke(10).unwrap();
    pool.invoke(20).unwrap();
    pool.invoke(30).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        sum.load(Ordering::SeqCst) == 60
    }));

    pool.release();
    assert!(wait_until(Duration::from_secs(2), || pool.running() == 0));
    assert_eq!(pool.invoke(40), Err(Error::PoolClosed));
}
