//! Multi-threaded target program for trying out strand
//!
//! Spawns a few worker threads that loop through nested calls, so there is
//! always something to step over, step into, and stop.
//!
//! ```text
//! cargo build --example threaded_target
//! strand launch target/debug/examples/threaded_target 3
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

static RUNNING: AtomicBool = AtomicBool::new(true);

fn main()
{
    let workers: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2);

    println!("threaded_target pid {} with {workers} workers", std::process::id());

    if let Err(e) = ctrlc::set_handler(|| RUNNING.store(false, Ordering::Relaxed)) {
        eprintln!("cannot install interrupt handler: {e}");
    }

    let total = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..workers)
        .map(|index| {
            let total = Arc::clone(&total);
            thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker(index as u64, &total))
        })
        .collect();

    let mut ticks = 0u64;
    while RUNNING.load(Ordering::Relaxed) && ticks < 600 {
        ticks += 1;
        if ticks % 10 == 0 {
            println!("tick {ticks}, total {}", total.load(Ordering::Relaxed));
        }
        thread::sleep(Duration::from_millis(100));
    }
    RUNNING.store(false, Ordering::Relaxed);

    for handle in handles.into_iter().flatten() {
        let _ = handle.join();
    }
    println!("done, total {}", total.load(Ordering::Relaxed));
}

fn worker(seed: u64, total: &AtomicU64)
{
    let mut value = seed;
    while RUNNING.load(Ordering::Relaxed) {
        value = mix(value);
        total.fetch_add(value % 7, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
    }
}

#[inline(never)]
fn mix(value: u64) -> u64
{
    scramble(value.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1))
}

#[inline(never)]
fn scramble(value: u64) -> u64
{
    value ^ (value >> 29)
}
