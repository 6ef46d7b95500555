//! Protocol constants. All monetary values in base units (1 coin = 10^8 units).

pub const COIN: u64 = 100_000_000;

/// Hard cap on total supply.
pub const MAX_SUPPLY: u64 = 21_000_000 * COIN;

pub const INITIAL_SUBSIDY: u64 = 50 * COIN;
pub const HALVING_INTERVAL: u64 = 210_000;
pub const TARGET_BLOCK_TIME: i64 = 600;
pub const RETARGET_INTERVAL: u64 = 2016;

/// Genesis difficulty: required leading zero bits in the PoW hash.
/// Also the floor the retarget algorithm never drops below.
pub const MIN_DIFFICULTY: u32 = 1;
pub const MAX_DIFFICULTY: u32 = 255;

pub const MAX_TX_SIZE: usize = 100_000;
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_TXS_PER_BLOCK: usize = 10_000;
pub const MAX_TX_METADATA: usize = 1024;

/// Window for the median-time-past timestamp rule.
pub const TIMESTAMP_MEDIAN_WINDOW: usize = 11;
/// Maximum allowed drift of a block timestamp past wall-clock time.
pub const MAX_FUTURE_DRIFT: i64 = 2 * 60 * 60;

/// Confirmations before a coinbase output becomes spendable.
///
/// Short window: a subsidy is spendable once its block is buried under two
/// more, which still keeps freshly mined value out of the mempool while the
/// block is most likely to be reorged away.
pub const COINBASE_MATURITY: u64 = 2;

pub const MEMPOOL_MAX_BYTES: usize = 300 * 1024 * 1024;
pub const MEMPOOL_EXPIRY_SECS: i64 = 72 * 60 * 60;

/// Scrypt PoW parameters: N = 2^POW_SCRYPT_LOG_N, r, p, 32-byte output.
pub const POW_SCRYPT_LOG_N: u8 = 14;
pub const POW_SCRYPT_R: u32 = 8;
pub const POW_SCRYPT_P: u32 = 1;

/// Base58Check address version bytes.
pub const ADDRESS_VERSION_MAINNET: u8 = 0x00;
pub const ADDRESS_VERSION_TESTNET: u8 = 0x6F;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MIN_PROTOCOL_VERSION: u32 = 1;
pub const USER_AGENT: &str = "/carbonchain:0.1.0/";

pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;
pub const MAX_HEADERS_PER_MSG: usize = 2000;
pub const MAX_LOCATOR_SIZE: usize = 64;
pub const MAX_INV_PER_MSG: usize = 50_000;
pub const BLOCK_DOWNLOAD_WINDOW: usize = 16;

pub const DEFAULT_P2P_PORT: u16 = 28333;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supply_covers_halving_schedule() {
        // Geometric series of halvings stays under the cap.
        let mut total: u64 = 0;
        let mut subsidy = INITIAL_SUBSIDY;
        while subsidy > 0 {
            total += subsidy * HALVING_INTERVAL;
            subsidy >>= 1;
        }
        assert!(total <= MAX_SUPPLY);
    }

    #[test]
    fn retarget_window_spans_two_weeks() {
        assert_eq!(RETARGET_INTERVAL as i64 * TARGET_BLOCK_TIME, 14 * 24 * 60 * 60);
    }
}
