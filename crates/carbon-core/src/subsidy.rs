//! Block subsidy schedule.
//!
//! The subsidy starts at [`INITIAL_SUBSIDY`](crate::constants::INITIAL_SUBSIDY)
//! and halves every [`HALVING_INTERVAL`](crate::constants::HALVING_INTERVAL)
//! blocks: `INITIAL_SUBSIDY >> (height / HALVING_INTERVAL)`, reaching zero
//! once the shift exhausts. The cumulative schedule never exceeds
//! [`MAX_SUPPLY`](crate::constants::MAX_SUPPLY).

use crate::constants::{HALVING_INTERVAL, INITIAL_SUBSIDY};

/// Base mining subsidy for a block at `height`.
pub fn block_subsidy(height: u64) -> u64 {
    let epoch = halving_epoch(height);
    if epoch >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> epoch
}

/// Which halving epoch `height` falls in.
pub fn halving_epoch(height: u64) -> u64 {
    height / HALVING_INTERVAL
}

/// Total subsidy issued by all blocks up to and including `height`.
///
/// Used by supply-invariant checks; walks epochs, not blocks.
pub fn cumulative_subsidy(height: u64) -> u64 {
    let mut total: u64 = 0;
    let mut epoch = 0u64;
    loop {
        let reward = if epoch >= 64 { 0 } else { INITIAL_SUBSIDY >> epoch };
        if reward == 0 {
            break;
        }
        let epoch_start = epoch * HALVING_INTERVAL;
        if epoch_start > height {
            break;
        }
        let blocks_in_epoch = (height - epoch_start + 1).min(HALVING_INTERVAL);
        total += reward * blocks_in_epoch;
        epoch += 1;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{COIN, MAX_SUPPLY};

    #[test]
    fn genesis_epoch_subsidy() {
        assert_eq!(block_subsidy(0), 50 * COIN);
        assert_eq!(block_subsidy(HALVING_INTERVAL - 1), 50 * COIN);
    }

    #[test]
    fn first_halving() {
        assert_eq!(block_subsidy(HALVING_INTERVAL), 25 * COIN);
    }

    #[test]
    fn subsidy_exhausts() {
        assert_eq!(block_subsidy(64 * HALVING_INTERVAL), 0);
        // Exhausts earlier: 50 * 10^8 < 2^33, so by epoch 33 the shift is zero.
        assert_eq!(block_subsidy(33 * HALVING_INTERVAL), 0);
    }

    #[test]
    fn cumulative_never_exceeds_cap() {
        assert!(cumulative_subsidy(u64::MAX / 2) <= MAX_SUPPLY);
        assert!(cumulative_subsidy(100 * HALVING_INTERVAL) <= MAX_SUPPLY);
    }

    #[test]
    fn cumulative_counts_blocks() {
        assert_eq!(cumulative_subsidy(0), 50 * COIN);
        assert_eq!(cumulative_subsidy(2), 150 * COIN);
    }

    #[test]
    fn cumulative_spans_epochs() {
        let at_boundary = cumulative_subsidy(HALVING_INTERVAL);
        assert_eq!(at_boundary, 50 * COIN * HALVING_INTERVAL + 25 * COIN);
    }
}
