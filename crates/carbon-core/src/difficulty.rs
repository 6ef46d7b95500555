//! Difficulty retargeting.
//!
//! `difficulty` is the number of leading zero bits the PoW hash must carry:
//! a header is valid iff `pow_hash < 2^(256 - difficulty)`. Higher is harder.
//!
//! Every [`RETARGET_INTERVAL`](crate::constants::RETARGET_INTERVAL) blocks the
//! elapsed time over the interval is compared against
//! `RETARGET_INTERVAL * TARGET_BLOCK_TIME`. The ratio is clamped to [¼, 4]
//! and applied to the 256-bit target domain in whole-bit steps: each
//! factor-of-two of the clamped ratio moves the difficulty by one bit, so a
//! single retarget changes difficulty by at most ±2 bits. Between retargets
//! the difficulty is inherited unchanged. The result never drops below
//! [`MIN_DIFFICULTY`](crate::constants::MIN_DIFFICULTY) (the genesis
//! difficulty).

use crate::constants::{
    MAX_DIFFICULTY, MIN_DIFFICULTY, RETARGET_INTERVAL, TARGET_BLOCK_TIME,
};

/// Whether the block at `height` begins a new retarget window.
pub fn is_retarget_height(height: u64) -> bool {
    height > 0 && height % RETARGET_INTERVAL == 0
}

/// Compute the difficulty for a retarget block from the previous window.
///
/// `actual_timespan` is `timestamp[last] - timestamp[last - interval + 1]`
/// over the window that just closed; `prev_difficulty` is the difficulty of
/// the window's blocks.
pub fn next_difficulty(prev_difficulty: u32, actual_timespan: i64) -> u32 {
    let expected = RETARGET_INTERVAL as i64 * TARGET_BLOCK_TIME;

    // Clamp the ratio to [¼, 4] before converting to bit steps.
    let clamped = actual_timespan.clamp(expected / 4, expected * 4).max(1);

    let adjusted = if clamped <= expected {
        // Blocks arrived fast: raise difficulty one bit per factor of two.
        let mut bits = 0u32;
        while bits < 2 && clamped * (1 << (bits + 1)) <= expected {
            bits += 1;
        }
        prev_difficulty.saturating_add(bits)
    } else {
        // Blocks arrived slow: lower difficulty one bit per factor of two.
        let mut bits = 0u32;
        while bits < 2 && expected * (1 << (bits + 1)) <= clamped {
            bits += 1;
        }
        prev_difficulty.saturating_sub(bits)
    };

    adjusted.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

/// Expected difficulty for the block at `height`.
///
/// `prev_difficulty` is the parent block's difficulty. `get_timestamp` maps a
/// height on the same branch to its header timestamp; it is only consulted at
/// retarget heights and must cover the closed window.
pub fn expected_difficulty(
    height: u64,
    prev_difficulty: u32,
    get_timestamp: impl Fn(u64) -> Option<i64>,
) -> u32 {
    if height == 0 {
        return MIN_DIFFICULTY;
    }
    if !is_retarget_height(height) {
        return prev_difficulty;
    }

    let last = height - 1;
    let first = height - RETARGET_INTERVAL;
    match (get_timestamp(first), get_timestamp(last)) {
        (Some(start), Some(end)) => next_difficulty(prev_difficulty, end - start),
        // Window not available (should not happen on a connected chain):
        // keep the parent difficulty rather than inventing one.
        _ => prev_difficulty,
    }
}
