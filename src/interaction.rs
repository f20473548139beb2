//! Per-epoch interaction planning
//!
//! Every epoch the scheduler walks the cells in a shuffled order and tries to
//! pair each one with a random partner inside the `max_dist` window on the
//! torus. A pair is formed only if both cells can be claimed through their
//! `locked` flags at once; a failed claim drops that candidate for the epoch.
//! Planning stops once a quarter of the population worth of pairs exists, so
//! about half the cells interact per epoch.
//!
//! Formed pairs are striped over `PAIR_BUFFERS` buffers by a hash of their
//! coordinates. Since a cell is claimed by at most one pair, the buffers can
//! be executed in parallel.

use crate::rng::split_mix_64;
use crate::world::{Cell, WorldParams};
use rayon::prelude::*;

/// Number of scheduling buffers pairs are striped over
pub const PAIR_BUFFERS: usize = 10;

/// Partner offsets tried per cell before it gives up for the epoch
pub const PAIR_ATTEMPTS: u64 = 4;

/// Two claimed cells, by row-major index. The initiator's program drives the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pair {
    pub initiator: usize,
    pub partner: usize,
}

/// Conflict-free set of pairs for one epoch.
#[derive(Debug, Clone)]
pub struct InteractionPlan {
    buffers: Vec<Vec<Pair>>,
    /// Candidate interactions abandoned because a claim failed
    pub dropped: usize,
}

impl Default for InteractionPlan {
    fn default() -> Self {
        Self {
            buffers: vec![Vec::new(); PAIR_BUFFERS],
            dropped: 0,
        }
    }
}

impl InteractionPlan {
    pub fn len(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(Vec::is_empty)
    }

    pub fn buffers(&self) -> &[Vec<Pair>] {
        &self.buffers
    }

    pub fn pairs(&self) -> impl Iterator<Item = &Pair> {
        self.buffers.iter().flatten()
    }

    /// Per-cell flag: true if the cell takes part in a pair
    pub fn membership(&self, num_cells: usize) -> Vec<bool> {
        let mut member = vec![false; num_cells];
        for pair in self.pairs() {
            member[pair.initiator] = true;
            member[pair.partner] = true;
        }
        member
    }

    /// Run `f` on every pair in parallel. Results come back in plan order.
    pub fn par_map<R, F>(&self, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(&Pair) -> R + Sync + Send,
    {
        let f = &f;
        self.buffers
            .par_iter()
            .flat_map(|buffer| buffer.par_iter().map(f))
            .collect()
    }

    fn push(&mut self, pair: Pair, width: usize) {
        let idx = buffer_index(&pair, width);
        self.buffers[idx].push(pair);
    }
}

/// Claim both cells, or neither.
pub fn try_claim(cells: &mut [Cell], a: usize, b: usize) -> bool {
    if a == b || cells[a].locked || cells[b].locked {
        return false;
    }
    cells[a].locked = true;
    cells[b].locked = true;
    true
}

/// Release both cells of a pair
pub fn release(cells: &mut [Cell], pair: &Pair) {
    cells[pair.initiator].locked = false;
    cells[pair.partner].locked = false;
}

/// Buffer a pair is assigned to: a stripe over the coordinates of both cells
pub fn buffer_index(pair: &Pair, width: usize) -> usize {
    let (ax, ay) = (pair.initiator % width, pair.initiator / width);
    let (bx, by) = (pair.partner % width, pair.partner / width);
    let a = ((ay as u64) << 32) | ax as u64;
    let b = ((by as u64) << 32) | bx as u64;
    (split_mix_64(split_mix_64(a) ^ b) % PAIR_BUFFERS as u64) as usize
}

/// Key for this epoch's shuffle and partner choices.
///
/// With `fixed_shuffle` it depends only on the epoch and grid shape. Otherwise
/// a fresh draw from the thread-local entropy source is mixed in, so runs from
/// the same seed diverge.
fn epoch_key(epoch: u32, params: &WorldParams) -> u64 {
    let shape = ((params.height as u64) << 32) | params.width as u64;
    let key = split_mix_64(split_mix_64(epoch as u64) ^ shape);
    if params.fixed_shuffle {
        key
    } else {
        split_mix_64(key ^ rand::random::<u64>())
    }
}

/// Order in which cells get to pick a partner (seeded Fisher-Yates)
pub fn processing_order(num_cells: usize, key: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..num_cells).collect();
    for i in (1..order.len()).rev() {
        let j = (split_mix_64(key ^ split_mix_64(i as u64)) % (i as u64 + 1)) as usize;
        order.swap(i, j);
    }
    order
}

/// Uniform non-zero offset inside the `(2d+1)^2` window
fn partner_offset(key: u64, cell: usize, attempt: u64, max_dist: u32) -> (i64, i64) {
    let d = max_dist as u64;
    let side = 2 * d + 1;
    let centre = d * side + d;
    let r = split_mix_64(key.rotate_left(17) ^ split_mix_64(cell as u64 * PAIR_ATTEMPTS + attempt));
    let mut k = r % (side * side - 1);
    if k >= centre {
        k += 1;
    }
    ((k % side) as i64 - d as i64, (k / side) as i64 - d as i64)
}

/// Build this epoch's plan, claiming every paired cell.
///
/// Cells that are already locked are treated as claimed and never paired.
pub fn plan(cells: &mut [Cell], params: &WorldParams, epoch: u32) -> InteractionPlan {
    let mut plan = InteractionPlan::default();
    let width = params.width as usize;
    let height = params.height as usize;
    let num_cells = cells.len();
    debug_assert_eq!(num_cells, width * height);

    if params.max_dist == 0 || num_cells < 2 {
        return plan;
    }

    let key = epoch_key(epoch, params);
    let order = processing_order(num_cells, key);
    let max_pairs = (num_cells / 4).max(1);
    let mut formed = 0usize;

    for &i in &order {
        if formed >= max_pairs {
            break;
        }
        if cells[i].locked {
            continue;
        }
        let (x, y) = ((i % width) as i64, (i / width) as i64);

        for attempt in 0..PAIR_ATTEMPTS {
            let (dx, dy) = partner_offset(key, i, attempt, params.max_dist);
            let nx = (x + dx).rem_euclid(width as i64) as usize;
            let ny = (y + dy).rem_euclid(height as i64) as usize;
            let j = ny * width + nx;
            if j == i {
                // Window wrapped onto the cell itself on a small torus.
                continue;
            }
            if try_claim(cells, i, j) {
                plan.push(Pair { initiator: i, partner: j }, width);
                formed += 1;
                break;
            }
            plan.dropped += 1;
        }
    }

    log::trace!(
        "epoch {}: planned {} pairs, {} dropped claims",
        epoch,
        formed,
        plan.dropped
    );
    plan
}

/// Chebyshev distance between two cells on the torus
pub fn torus_distance(a: usize, b: usize, width: usize, height: usize) -> usize {
    let (ax, ay) = (a % width, a / width);
    let (bx, by) = (b % width, b / width);
    let dx = ax.abs_diff(bx);
    let dy = ay.abs_diff(by);
    dx.min(width - dx).max(dy.min(height - dy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn params(width: u32, height: u32, max_dist: u32) -> WorldParams {
        WorldParams {
            width,
            height,
            max_dist,
            ..WorldParams::default()
        }
    }

    fn cells(n: usize) -> Vec<Cell> {
        (0..n).map(|i| Cell::new(i as u64)).collect()
    }

    #[test]
    fn test_plan_is_a_matching() {
        let p = params(32, 20, 3);
        let mut grid = cells(640);
        let plan = plan(&mut grid, &p, 7);
        assert!(!plan.is_empty());

        let mut seen = HashSet::new();
        for pair in plan.pairs() {
            assert!(seen.insert(pair.initiator), "cell {} paired twice", pair.initiator);
            assert!(seen.insert(pair.partner), "cell {} paired twice", pair.partner);
        }
        assert!(plan.len() <= 640 / 4);
    }

    #[test]
    fn test_pairs_within_max_dist() {
        let p = params(40, 30, 2);
        let mut grid = cells(1200);
        let plan = plan(&mut grid, &p, 3);
        for pair in plan.pairs() {
            let d = torus_distance(pair.initiator, pair.partner, 40, 30);
            assert!(d >= 1 && d <= 2, "distance {} out of range", d);
        }
    }

    #[test]
    fn test_planned_cells_are_claimed() {
        let p = params(16, 16, 4);
        let mut grid = cells(256);
        let plan = plan(&mut grid, &p, 0);
        let member = plan.membership(256);
        for (i, cell) in grid.iter().enumerate() {
            assert_eq!(cell.locked, member[i]);
        }
        for pair in plan.pairs() {
            release(&mut grid, pair);
        }
        assert!(grid.iter().all(|c| !c.locked));
    }

    #[test]
    fn test_locked_cells_are_skipped() {
        let p = params(8, 8, 7);
        let mut grid = cells(64);
        for cell in grid.iter_mut().take(32) {
            cell.locked = true;
        }
        let plan = plan(&mut grid, &p, 5);
        for pair in plan.pairs() {
            assert!(pair.initiator >= 32 && pair.partner >= 32);
        }
    }

    #[test]
    fn test_try_claim_is_both_or_neither() {
        let mut grid = cells(4);
        grid[1].locked = true;
        assert!(!try_claim(&mut grid, 0, 1));
        assert!(!grid[0].locked, "failed claim must not hold a lock");
        assert!(!try_claim(&mut grid, 2, 2));
        assert!(try_claim(&mut grid, 2, 3));
        assert!(grid[2].locked && grid[3].locked);
    }

    #[test]
    fn test_zero_max_dist_disables_interaction() {
        let p = params(10, 10, 0);
        let mut grid = cells(100);
        assert!(plan(&mut grid, &p, 0).is_empty());
    }

    #[test]
    fn test_fixed_shuffle_ignores_seed() {
        let mut a = params(20, 10, 3);
        let mut b = a.clone();
        a.seed = 1;
        b.seed = 999;
        let pa = plan(&mut cells(200), &a, 12);
        let pb = plan(&mut cells(200), &b, 12);
        let va: Vec<_> = pa.pairs().copied().collect();
        let vb: Vec<_> = pb.pairs().copied().collect();
        assert_eq!(va, vb);

        let pc = plan(&mut cells(200), &a, 13);
        let vc: Vec<_> = pc.pairs().copied().collect();
        assert_ne!(va, vc, "different epochs should pair differently");
    }

    #[test]
    fn test_processing_order_is_permutation() {
        let order = processing_order(100, 42);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_ne!(order, sorted);
    }

    #[test]
    fn test_partner_offset_never_zero() {
        for cell in 0..500 {
            for attempt in 0..PAIR_ATTEMPTS {
                let (dx, dy) = partner_offset(77, cell, attempt, 1);
                assert!((dx, dy) != (0, 0));
                assert!(dx.abs() <= 1 && dy.abs() <= 1);
            }
        }
    }

    #[test]
    fn test_buffers_spread_pairs() {
        let p = params(64, 64, 5);
        let mut grid = cells(4096);
        let plan = plan(&mut grid, &p, 1);
        let used = plan.buffers().iter().filter(|b| !b.is_empty()).count();
        assert_eq!(plan.buffers().len(), PAIR_BUFFERS);
        assert!(used > PAIR_BUFFERS / 2);
    }

    #[test]
    fn test_no_concurrent_writers_per_cell() {
        let p = params(48, 48, 6);
        let mut grid = cells(48 * 48);
        let plan = plan(&mut grid, &p, 2);
        let writers: Vec<AtomicU32> = (0..grid.len()).map(|_| AtomicU32::new(0)).collect();
        let max_seen = AtomicU32::new(0);

        let done = plan.par_map(|pair| {
            for &idx in &[pair.initiator, pair.partner] {
                let now = writers[idx].fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
            }
            std::hint::spin_loop();
            for &idx in &[pair.initiator, pair.partner] {
                writers[idx].fetch_sub(1, Ordering::SeqCst);
            }
            1usize
        });

        assert_eq!(done.len(), plan.len());
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_torus_distance_wraps() {
        assert_eq!(torus_distance(0, 9, 10, 10), 1);
        assert_eq!(torus_distance(0, 90, 10, 10), 1);
        assert_eq!(torus_distance(0, 55, 10, 10), 5);
    }
}
