//! Cross-Process Publisher
//!
//! Start a writer in one terminal and any number of readers in others:
//!
//! ```text
//! cargo run --example writer -- /ticker write
//! cargo run --example writer -- /ticker read
//! ```
//!
//! The writer publishes a text record into a page-sized region ten times a
//! second; readers print whatever record is current.

use seqlock_shm::{Opened, SharedMemory, SingleWriterRegion};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CAPACITY: usize = 4096;
const TICKS: u64 = 600;

type Region = SingleWriterRegion<CAPACITY>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let name = args.next().unwrap_or_else(|| "/seqlock_ticker".to_string());
    let mode = args.next().unwrap_or_else(|| "write".to_string());

    let opened = match SharedMemory::open(&name, 0, Region::new) {
        Ok(opened) => opened,
        Err(e) => {
            error!(name = %name, error = %e, "failed to open region");
            std::process::exit(1);
        }
    };

    match mode.as_str() {
        "write" => publish(opened),
        "read" => follow(opened),
        other => {
            eprintln!("unknown mode {:?}, expected \"write\" or \"read\"", other);
            std::process::exit(2);
        }
    }
}

fn publish(opened: Opened<Region>) {
    if !opened.is_creator() {
        warn!("region already existed; another writer may be running");
    }
    let region = opened.into_inner();
    info!(name = %region.name(), size = region.size(), "publishing");

    let start = Instant::now();
    let mut record = Vec::with_capacity(CAPACITY);

    for tick in 0..TICKS {
        record.clear();
        record.extend_from_slice(
            format!(
                "tick={} pid={} uptime_ms={}",
                tick,
                std::process::id(),
                start.elapsed().as_millis()
            )
            .as_bytes(),
        );
        // Pad so readers never see a stale tail from a longer record
        record.resize(CAPACITY, 0);
        region.store(&record);
        thread::sleep(Duration::from_millis(100));
    }

    info!(sequence = region.sequence(), "writer finished");
    if let Err(e) = region.close() {
        error!(error = %e, "teardown failed");
    }
}

fn follow(opened: Opened<Region>) {
    if opened.is_creator() {
        // dropping the handle unlinks the name again
        error!("no writer is running; start one with the \"write\" mode first");
        drop(opened);
        std::process::exit(1);
    }
    let region = opened.into_inner();
    info!(name = %region.name(), "following");

    let mut buf = vec![0u8; CAPACITY];
    let mut last_sequence = u64::MAX;

    for _ in 0..TICKS {
        let sequence = region.sequence();
        if sequence != last_sequence {
            region.load(&mut buf);
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            println!("[seq {:>6}] {}", sequence, String::from_utf8_lossy(&buf[..end]));
            last_sequence = sequence;
        }
        thread::sleep(Duration::from_millis(100));
    }
}
