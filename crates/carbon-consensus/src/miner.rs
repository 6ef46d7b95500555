//! Proof-of-work mining.
//!
//! Workers iterate disjoint nonce ranges over a candidate header, polling a
//! shared cancellation flag between hash batches. The first solution wins and
//! stops the others. Nonce-range exhaustion bumps the header timestamp by one
//! second and restarts the range; the caller's template timestamp already
//! respects the median-time rule, and a one-second bump stays far inside the
//! future-drift allowance.
//!
//! The hash loop never takes a lock; coordination is a pair of atomics plus a
//! mutex touched only on success.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use carbon_core::types::{Block, BlockHeader};

/// Nonces tried between cancellation checks.
///
/// The scrypt hash dominates per-iteration cost, so a small batch keeps
/// cancellation latency in the tens of milliseconds.
const CANCEL_POLL_BATCH: u64 = 8;

/// Shared switch for stopping in-flight mining jobs.
///
/// Set on a new best tip or on shutdown; workers observe it between batches.
#[derive(Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Re-arm the flag for a new job.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Search a nonce range, returning the solved header if one is found.
///
/// Returns `None` on cancellation or when the range is exhausted.
fn search_range(
    template: &BlockHeader,
    start: u64,
    end: u64,
    cancel: &CancelFlag,
    solved: &AtomicBool,
) -> Option<BlockHeader> {
    let mut header = template.clone();
    let mut nonce = start;
    loop {
        for _ in 0..CANCEL_POLL_BATCH {
            if nonce >= end {
                return None;
            }
            header.nonce = nonce;
            if header.meets_difficulty() {
                return Some(header);
            }
            nonce += 1;
        }
        if cancel.is_cancelled() || solved.load(Ordering::Relaxed) {
            return None;
        }
    }
}

/// Mine a header with `workers` parallel threads over disjoint nonce ranges.
///
/// Returns the first header satisfying the target, or `None` if the job was
/// cancelled. When every range is exhausted without a solution, the timestamp
/// is advanced one second and the search restarts.
pub fn mine_header(template: &BlockHeader, workers: usize, cancel: &CancelFlag) -> Option<BlockHeader> {
    let workers = workers.max(1);
    let mut template = template.clone();

    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let solved = AtomicBool::new(false);
        let winner: Mutex<Option<BlockHeader>> = Mutex::new(None);
        let range = u64::MAX / workers as u64;

        std::thread::scope(|scope| {
            for w in 0..workers {
                let template = &template;
                let solved = &solved;
                let winner = &winner;
                let start = w as u64 * range;
                let end = if w == workers - 1 { u64::MAX } else { start + range };
                scope.spawn(move || {
                    if let Some(header) = search_range(template, start, end, cancel, solved) {
                        solved.store(true, Ordering::Relaxed);
                        *winner.lock().expect("winner lock is never poisoned") = Some(header);
                    }
                });
            }
        });

        let found = winner.into_inner().expect("winner lock is never poisoned");
        if let Some(header) = found {
            return Some(header);
        }
        if cancel.is_cancelled() {
            return None;
        }

        // Exhausted every range: refresh the timestamp and go again.
        template.timestamp += 1;
        debug!(height = template.height, "nonce space exhausted, bumping timestamp");
    }
}

/// Mine a block in place on the current thread. Returns `false` only on
/// cancellation.
pub fn mine_block(block: &mut Block, cancel: &CancelFlag) -> bool {
    match mine_header(&block.header, 1, cancel) {
        Some(header) => {
            block.header = header;
            true
        }
        None => false,
    }
}
