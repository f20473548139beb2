//! Per-cell pseudo-random streams.
//!
//! Every cell owns a single `u64` of generator state. Outputs come from a
//! PCG-XSH-RR step with a fixed stream increment, so the whole generator fits
//! in the cell record. Initial states are derived from the grid seed and the
//! cell coordinates with SplitMix64 finalisers.

use rand::RngCore;

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const PCG_INCREMENT: u64 = 1442695040888963407;

/// SplitMix64 finaliser. A bijection on `u64`.
#[inline]
pub fn split_mix_64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Advance `state` by one step, returning the 32-bit output and the new state.
#[inline]
pub fn next(state: u64) -> (u32, u64) {
    let new_state = state
        .wrapping_mul(PCG_MULTIPLIER)
        .wrapping_add(PCG_INCREMENT);
    let xorshifted = (((state >> 18) ^ state) >> 27) as u32;
    let rot = (state >> 59) as u32;
    (xorshifted.rotate_right(rot), new_state)
}

/// Initial generator state for the cell at `(x, y)`.
///
/// For a fixed seed the mapping is injective over coordinates, so no two
/// cells of a grid start from the same state.
#[inline]
pub fn seed_state(seed: u64, x: u32, y: u32) -> u64 {
    let coord = ((y as u64) << 32) | x as u64;
    split_mix_64(split_mix_64(seed) ^ coord)
}

/// Borrowing view over a cell's generator state.
///
/// Implements [`RngCore`] so the `rand` helpers run directly on the cell's
/// stream; the state is written back as values are drawn.
pub struct CellRng<'a> {
    state: &'a mut u64,
}

impl<'a> CellRng<'a> {
    pub fn new(state: &'a mut u64) -> Self {
        Self { state }
    }

    /// Next byte of the stream. Consumes one full 32-bit draw.
    #[inline]
    pub fn next_byte(&mut self) -> u8 {
        (self.next_u32() >> 24) as u8
    }
}

impl RngCore for CellRng<'_> {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        let (value, state) = next(*self.state);
        *self.state = state;
        value
    }

    fn next_u64(&mut self) -> u64 {
        let lo = self.next_u32() as u64;
        let hi = self.next_u32() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        for chunk in dst.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn test_next_is_pure() {
        let (a, s1) = next(12345);
        let (b, s2) = next(12345);
        assert_eq!(a, b);
        assert_eq!(s1, s2);
        assert_ne!(s1, 12345);
    }

    #[test]
    fn test_seed_state_distinct_per_cell() {
        let mut seen = HashSet::new();
        for y in 0..64 {
            for x in 0..64 {
                assert!(seen.insert(seed_state(7, x, y)));
            }
        }
    }

    #[test]
    fn test_seed_state_depends_on_seed() {
        assert_eq!(seed_state(1, 3, 4), seed_state(1, 3, 4));
        assert_ne!(seed_state(1, 3, 4), seed_state(2, 3, 4));
        assert_ne!(seed_state(1, 3, 4), seed_state(1, 4, 3));
    }

    #[test]
    fn test_cell_rng_advances_state() {
        let mut state = seed_state(42, 0, 0);
        let start = state;
        let mut rng = CellRng::new(&mut state);
        let first = rng.next_u32();
        assert_eq!(first, next(start).0);
        assert_eq!(state, next(start).1);
    }

    #[test]
    fn test_output_roughly_uniform() {
        let mut state = seed_state(99, 5, 5);
        let mut rng = CellRng::new(&mut state);
        let mut buckets = [0u32; 16];
        let draws = 160_000;
        for _ in 0..draws {
            buckets[(rng.next_u32() >> 28) as usize] += 1;
        }
        let expected = draws as f64 / 16.0;
        for &count in &buckets {
            let deviation = (count as f64 - expected).abs() / expected;
            assert!(deviation < 0.05, "bucket deviates by {:.3}", deviation);
        }
    }

    #[test]
    fn test_neighbouring_cells_uncorrelated() {
        let mut a = seed_state(3, 10, 10);
        let mut b = seed_state(3, 11, 10);
        let mut ra = CellRng::new(&mut a);
        let mut rb = CellRng::new(&mut b);
        let equal_bits: u32 = (0..1000)
            .map(|_| (!(ra.next_u32() ^ rb.next_u32())).count_ones())
            .sum();
        // Independent streams agree on about half of all bits.
        let fraction = equal_bits as f64 / 32_000.0;
        assert!((fraction - 0.5).abs() < 0.02, "bit agreement {:.3}", fraction);
    }

    #[test]
    fn test_rng_helpers_work_on_cell_stream() {
        let mut state = seed_state(0, 1, 2);
        let mut rng = CellRng::new(&mut state);
        for _ in 0..100 {
            let v = rng.random_range(0..10u32);
            assert!(v < 10);
        }
    }
}
