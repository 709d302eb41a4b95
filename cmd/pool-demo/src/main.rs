//! Fixed-function pool demo: three invocations on ten workers.

use std::thread;
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt::init();

    let pool = hive::PoolWithFunc::new(10, |ms: u64| {
        thread::sleep(Duration::from_millis(ms));
        println!("{ms}");
    })
    .expect("pool construction");

    pool.invoke(10).expect("invoke");
    pool.invoke(20).expect("invoke");
    pool.invoke(30).expect("invoke");

    thread::sleep(Duration::from_secs(1));
    pool.release();
}
