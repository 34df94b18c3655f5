// Canonical chain parameters and the monetary schedule.
//
// All parameters are powers of two where possible: initial reward 2^6,
// halving interval 2^18 blocks, total supply 2^25 units over 64 halvings.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const START_DIFFICULTY: Decimal = dec!(6.0);
pub const BLOCK_TIME: u64 = 180;
pub const BLOCKS_PER_ADJUSTMENT: u64 = 512;

pub const INITIAL_REWARD: Decimal = dec!(64);
pub const HALVING_INTERVAL: u64 = 262_144;
pub const MAX_HALVINGS: u64 = 64;
pub const MAX_SUPPLY: Decimal = dec!(33554432);

/// Atomic unit divisor: one coin = 10^6 atomic units
pub const SMALLEST: u64 = 1_000_000;

/// Block content cap: 4 MiB of hex, 2 MiB raw
pub const MAX_BLOCK_SIZE_HEX: usize = 4096 * 1024;

/// Blocks may not claim a timestamp further than this past local now
pub const MAX_FUTURE_DRIFT_SECS: u64 = 120;

/// Block subsidy at a given height. The first block is #1; using
/// `block_number - 1` puts the first halving exactly at block 262,144.
/// The subsidy ends permanently after 64 halvings.
pub fn get_block_reward(block_number: u64) -> Decimal {
    if block_number == 0 {
        return Decimal::ZERO;
    }
    let halvings = (block_number - 1) / HALVING_INTERVAL;
    if halvings >= MAX_HALVINGS {
        return Decimal::ZERO;
    }
    let mut reward = INITIAL_REWARD;
    for _ in 0..halvings {
        reward /= dec!(2);
    }
    reward
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_has_no_subsidy() {
        assert_eq!(get_block_reward(0), Decimal::ZERO);
    }

    #[test]
    fn test_first_period() {
        assert_eq!(get_block_reward(1), dec!(64));
        assert_eq!(get_block_reward(HALVING_INTERVAL), dec!(64));
        assert_eq!(get_block_reward(HALVING_INTERVAL + 1), dec!(32));
    }

    #[test]
    fn test_halving_boundaries() {
        for h in 0..8u64 {
            let start = h * HALVING_INTERVAL + 1;
            let expected = dec!(64) / Decimal::from(1u64 << h);
            assert_eq!(get_block_reward(start), expected);
            assert_eq!(get_block_reward(start + HALVING_INTERVAL - 1), expected);
        }
    }

    #[test]
    fn test_subsidy_ends_after_64_halvings() {
        let last_paying = MAX_HALVINGS * HALVING_INTERVAL;
        assert!(get_block_reward(last_paying) > Decimal::ZERO);
        assert_eq!(get_block_reward(last_paying + 1), Decimal::ZERO);
    }

    #[test]
    fn test_emission_bounded_by_max_supply() {
        // Sum one block per period, scaled by the period length.
        let mut total = Decimal::ZERO;
        for h in 0..MAX_HALVINGS {
            let reward = get_block_reward(h * HALVING_INTERVAL + 1);
            total += reward * Decimal::from(HALVING_INTERVAL);
        }
        assert!(total <= MAX_SUPPLY);
        // The schedule asymptotically approaches the cap.
        assert!(total > MAX_SUPPLY - dec!(1));
    }

    #[test]
    fn test_monotonic_decrease() {
        let mut prev = get_block_reward(1);
        for h in 1..MAX_HALVINGS {
            let r = get_block_reward(h * HALVING_INTERVAL + 1);
            assert!(r < prev);
            prev = r;
        }
    }
}
