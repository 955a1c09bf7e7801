//! Concurrent sleepers on one worker thread
//!
//! Ten fibers each "block" in sleep; wall time is the longest sleep, not the
//! sum, because sleeping parks the fiber rather than the thread.

use std::time::Instant;
use weft::{sleep_ms, winfo, IoManager};

fn main() {
    let iom = IoManager::new(1, false, "sleepers");
    let start = Instant::now();

    let (tx, rx) = std::sync::mpsc::channel();
    for i in 1..=10u64 {
        let tx = tx.clone();
        iom.schedule(move || {
            sleep_ms(i * 100);
            winfo!("sleeper {} woke after {:?}", i, start.elapsed());
            tx.send(i).unwrap();
        });
    }
    drop(tx);

    let woken: Vec<u64> = rx.iter().collect();
    winfo!(
        "{} sleepers done in {:?} (sequential would be {:?})",
        woken.len(),
        start.elapsed(),
        std::time::Duration::from_millis((1..=10u64).map(|i| i * 100).sum())
    );
    iom.stop();
}
