//! Shared Region Demo (Writer + Reader)
//!
//! A writer thread creates a named region and repeatedly fills it with one
//! byte value. A reader thread attaches by name and checks that every load
//! it gets back is uniform.
//!
//! Run with `RUST_LOG=debug` to see the segment lifecycle.

use seqlock_shm::{SharedMemory, SingleWriterRegion};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SIZE: usize = 1024;
const ITERATIONS: usize = 1_000_000;

type Region = SingleWriterRegion<SIZE>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("/seqlock_demo_{}", std::process::id()));

    let writer_region = match SharedMemory::open(&name, 0, Region::new) {
        Ok(opened) => {
            info!(name = %name, role = ?opened.role(), "opened writer side");
            opened.into_inner()
        }
        Err(e) => {
            error!(name = %name, error = %e, "failed to open region");
            std::process::exit(1);
        }
    };

    let reader_region = match SharedMemory::open(&name, 0, Region::new) {
        Ok(opened) => {
            info!(name = %name, role = ?opened.role(), "opened reader side");
            opened.into_inner()
        }
        Err(e) => {
            error!(name = %name, error = %e, "failed to attach region");
            std::process::exit(1);
        }
    };

    let done = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let reader = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut buf = [0u8; SIZE];
            let mut loads = 0u64;
            let mut torn = 0u64;
            loop {
                reader_region.load(&mut buf);
                loads += 1;
                if buf.iter().any(|&b| b != buf[0]) {
                    torn += 1;
                }
                if done.load(Ordering::Acquire) {
                    break;
                }
            }
            (loads, torn)
        })
    };

    for i in 0..ITERATIONS {
        writer_region.set((i & 127) as u8);
    }
    done.store(true, Ordering::Release);

    let (loads, torn) = match reader.join() {
        Ok(counts) => counts,
        Err(_) => {
            error!("reader thread panicked");
            std::process::exit(1);
        }
    };
    let elapsed = start.elapsed();

    println!("Stores:   {}", ITERATIONS);
    println!("Loads:    {}", loads);
    println!("Torn:     {}", torn);
    println!("Sequence: {}", writer_region.sequence());
    println!(
        "Store rate: {:.1} M/s",
        ITERATIONS as f64 / elapsed.max(Duration::from_nanos(1)).as_secs_f64() / 1e6
    );

    if let Err(e) = writer_region.close() {
        error!(name = %name, error = %e, "teardown failed");
    }

    if torn > 0 {
        std::process::exit(2);
    }
}
