// Fractional-difficulty proof of work.
//
// Difficulty is a decimal D = i + f. A hash is valid against the previous
// block hash when it starts with the last i hex chars of that hash, and,
// when f > 0, its char at position i falls in the first ceil(16·(1−f))
// chars of the hex charset. The retarget curve converts difficulty to an
// equivalent hashrate, scales it by the observed block-time ratio, and
// converts back on a 0.1-step grid.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::consensus::chain::{BLOCKS_PER_ADJUSTMENT, BLOCK_TIME, START_DIFFICULTY};

const HEX_CHARSET: &str = "0123456789abcdef";

/// Split a difficulty into its integer part and fractional remainder.
pub fn split_difficulty(difficulty: Decimal) -> (usize, Decimal) {
    let integer = difficulty.floor();
    let fractional = difficulty - integer;
    (integer.to_usize().unwrap_or(0), fractional)
}

fn charset_count(fractional: Decimal) -> usize {
    // ceil(16 * (1 - f)), the number of hex chars still accepted
    ((dec!(16) * (Decimal::ONE - fractional)).ceil())
        .to_usize()
        .unwrap_or(16)
        .clamp(1, 16)
}

/// The PoW predicate. A genesis candidate (no previous hash) is exempt.
pub fn check_proof_of_work(
    block_hash: &str,
    difficulty: Decimal,
    previous_hash: Option<&str>,
) -> bool {
    let previous = match previous_hash {
        Some(h) => h,
        None => return true,
    };
    let (integer, fractional) = split_difficulty(difficulty);
    if integer > previous.len() || integer >= block_hash.len() {
        return false;
    }
    let chunk = &previous[previous.len() - integer..];
    if !block_hash.starts_with(chunk) {
        return false;
    }
    if fractional > Decimal::ZERO {
        let count = charset_count(fractional);
        let position_char = match block_hash.as_bytes().get(integer) {
            Some(&b) => b as char,
            None => return false,
        };
        return HEX_CHARSET[..count].contains(position_char);
    }
    true
}

/// Approximate hashrate required to solve a block at the given difficulty:
/// 16^i · (16 / ceil(16·(1−f))).
pub fn difficulty_to_hashrate(difficulty: Decimal) -> Decimal {
    let (integer, fractional) = split_difficulty(difficulty);
    let mut base = Decimal::ONE;
    for _ in 0..integer {
        base *= dec!(16);
    }
    base * (dec!(16) / Decimal::from(charset_count(fractional) as u64))
}

/// Invert `difficulty_to_hashrate` on the 0.1-step grid: find the smallest
/// fractional step whose acceptance coefficient covers the hashrate ratio.
pub fn hashrate_to_difficulty(hashrate: Decimal) -> Decimal {
    if hashrate < Decimal::ONE {
        return START_DIFFICULTY;
    }
    let mut integer = 0u32;
    let mut scaled = hashrate;
    while scaled >= dec!(16) {
        scaled /= dec!(16);
        integer += 1;
    }
    let ratio = scaled;
    for step in 0..10u32 {
        let fractional = Decimal::new(step as i64, 1);
        let coeff = dec!(16) / Decimal::from(charset_count(fractional) as u64);
        if coeff >= ratio {
            return Decimal::from(integer) + fractional;
        }
    }
    Decimal::from(integer) + dec!(0.9)
}

/// New difficulty after a full adjustment window. `elapsed_secs` is the time
/// between the first and last block of the window, clamped to at least one
/// second; the block-time ratio is clamped to [0.25, 4.0].
pub fn retarget_difficulty(last_difficulty: Decimal, elapsed_secs: u64) -> Decimal {
    let elapsed = Decimal::from(elapsed_secs.max(1));
    let avg_block_time = elapsed / Decimal::from(BLOCKS_PER_ADJUSTMENT);
    let ratio = (Decimal::from(BLOCK_TIME) / avg_block_time).clamp(dec!(0.25), dec!(4.0));
    hashrate_to_difficulty(difficulty_to_hashrate(last_difficulty) * ratio)
}
