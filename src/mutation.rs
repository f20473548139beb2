//! Background mutation of cell tapes.
//!
//! Each tape byte consumes exactly one 32-bit draw from the cell's own
//! stream: the low 8 bits are the replacement byte and the upper 24 bits
//! decide whether the replacement happens.

use crate::rng::CellRng;
use rand::RngCore;

const PROB_BITS: u32 = 24;
const PROB_SCALE: f64 = (1u64 << PROB_BITS) as f64;

/// Convert a per-byte rate into a 24-bit threshold
#[inline]
pub fn rate_threshold(rate: f32) -> u32 {
    if rate.is_nan() || rate <= 0.0 {
        0
    } else if rate >= 1.0 {
        1 << PROB_BITS
    } else {
        (rate as f64 * PROB_SCALE).round() as u32
    }
}

/// Replace each byte of `tape` with probability `rate`.
///
/// Returns the number of replacement events. A replacement may write the
/// byte that was already there.
pub fn mutate(tape: &mut [u8], rate: f32, rng: &mut CellRng<'_>) -> usize {
    let threshold = rate_threshold(rate);
    let mut mutations = 0;
    for byte in tape.iter_mut() {
        let draw = rng.next_u32();
        let replacement = (draw & 0xFF) as u8;
        let prob = draw >> 8;
        if prob < threshold {
            *byte = replacement;
            mutations += 1;
        }
    }
    mutations
}
