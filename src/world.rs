//! World grid - owns every cell and drives epochs.
//!
//! One epoch: plan interactions (claiming both cells of every pair), run the
//! paired VM passes and the solo VM passes in parallel, mutate every cell
//! with its own stream, write results back, release claims, advance the
//! epoch counter.

use crate::error::{Result, WorldError};
use crate::interaction::{self, Pair};
use crate::mutation;
use crate::persist;
use crate::programs::Program;
use crate::rng::{self, CellRng};
use crate::vm::{self, ExecSummary, Tape, TAPE_SIZE};
use rand::RngCore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_WIDTH: u32 = 196;
pub const DEFAULT_HEIGHT: u32 = 120;
pub const DEFAULT_MAX_DIST: u32 = 30;
pub const DEFAULT_MAX_STEPS: u32 = 256;
pub const DEFAULT_BACKGROUND_MUTATION_RATE: f32 = 0.024;

/// Largest interaction radius accepted by [`WorldParams::validate`]
pub const MAX_DIST_LIMIT: u32 = 1 << 15;

/// One grid cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    /// Held while an interaction owns the cell
    pub locked: bool,
    pub tape: Tape,
    /// Private generator state, see [`crate::rng`]
    pub rand_state: u64,
}

impl Cell {
    /// Empty, unlocked cell with the given generator state
    pub fn new(rand_state: u64) -> Self {
        Self {
            locked: false,
            tape: [0u8; TAPE_SIZE],
            rand_state,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tape.iter().all(|&b| b == 0)
    }
}

/// World configuration, fixed for a run unless the grid is reset or loaded
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldParams {
    pub seed: u64,
    /// Pairing order depends only on (epoch, width, height) when set
    pub fixed_shuffle: bool,
    /// VM step budget per cell per epoch
    pub max_steps: u32,
    /// Chebyshev interaction radius on the torus; 0 disables interaction
    pub max_dist: u32,
    /// Per-byte replacement probability per epoch
    pub background_mutation_rate: f32,
    pub width: u32,
    pub height: u32,
}

impl Default for WorldParams {
    fn default() -> Self {
        Self {
            seed: 0,
            fixed_shuffle: true,
            max_steps: DEFAULT_MAX_STEPS,
            max_dist: DEFAULT_MAX_DIST,
            background_mutation_rate: DEFAULT_BACKGROUND_MUTATION_RATE,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl WorldParams {
    pub fn num_cells(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(WorldError::InvalidParams(format!(
                "grid dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if (self.width as u64) * (self.height as u64) > i32::MAX as u64 {
            return Err(WorldError::InvalidParams(format!(
                "grid {}x{} has too many cells",
                self.width, self.height
            )));
        }
        let rate = self.background_mutation_rate;
        if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
            return Err(WorldError::InvalidParams(format!(
                "background_mutation_rate must be within [0, 1], got {}",
                rate
            )));
        }
        if self.max_dist > MAX_DIST_LIMIT {
            return Err(WorldError::InvalidParams(format!(
                "max_dist {} exceeds limit {}",
                self.max_dist, MAX_DIST_LIMIT
            )));
        }
        Ok(())
    }
}

/// How `reset_with` fills the tapes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapeFill {
    /// All-zero tapes
    #[default]
    Zero,
    /// Bytes drawn from each cell's own stream
    Random,
}

/// Totals over one or more epochs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComputeSummary {
    pub epochs: u32,
    /// Paired VM runs
    pub interactions: usize,
    /// Unpaired VM runs
    pub solo_runs: usize,
    /// Candidate interactions dropped on a failed claim
    pub dropped_claims: usize,
    pub steps: u64,
    pub ops: u64,
    pub halted: usize,
    pub channel_writes: u64,
    pub mutations: u64,
}

impl ComputeSummary {
    fn add_run(&mut self, exec: &ExecSummary, mutations: usize) {
        self.steps += exec.steps as u64;
        self.ops += exec.ops as u64;
        self.halted += exec.halted as usize;
        self.channel_writes += exec.channel_writes as u64;
        self.mutations += mutations as u64;
    }

    pub fn merge(&mut self, other: &ComputeSummary) {
        self.epochs += other.epochs;
        self.interactions += other.interactions;
        self.solo_runs += other.solo_runs;
        self.dropped_claims += other.dropped_claims;
        self.steps += other.steps;
        self.ops += other.ops;
        self.halted += other.halted;
        self.channel_writes += other.channel_writes;
        self.mutations += other.mutations;
    }
}

/// The grid of cells plus epoch counter and parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct WorldGrid {
    cells: Vec<Cell>,
    epoch: u32,
    params: WorldParams,
}

impl WorldGrid {
    /// Create a grid with empty tapes seeded from `params.seed`
    pub fn new(params: WorldParams) -> Result<Self> {
        params.validate()?;
        let seed = params.seed;
        let mut grid = Self {
            cells: Vec::new(),
            epoch: 0,
            params,
        };
        grid.reset(seed);
        Ok(grid)
    }

    /// Assemble a grid from decoded parts. Used by persistence.
    pub(crate) fn from_parts(params: WorldParams, epoch: u32, cells: Vec<Cell>) -> Result<Self> {
        params.validate()?;
        if cells.len() != params.num_cells() {
            return Err(WorldError::Format(format!(
                "expected {} cells for a {}x{} grid, got {}",
                params.num_cells(),
                params.width,
                params.height,
                cells.len()
            )));
        }
        Ok(Self {
            cells,
            epoch,
            params,
        })
    }

    /// Empty every tape, reseed every cell, and set the epoch to 0
    pub fn reset(&mut self, seed: u64) {
        self.reset_with(seed, TapeFill::Zero);
    }

    pub fn reset_with(&mut self, seed: u64, fill: TapeFill) {
        self.params.seed = seed;
        self.epoch = 0;
        let width = self.params.width;
        self.cells = (0..self.params.num_cells())
            .into_par_iter()
            .map(|idx| {
                let x = (idx % width as usize) as u32;
                let y = (idx / width as usize) as u32;
                let mut cell = Cell::new(rng::seed_state(seed, x, y));
                if fill == TapeFill::Random {
                    CellRng::new(&mut cell.rand_state).fill_bytes(&mut cell.tape);
                }
                cell
            })
            .collect();
        log::debug!(
            "reset {}x{} grid with seed {} ({:?} tapes)",
            self.params.width,
            self.params.height,
            seed,
            fill
        );
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn params(&self) -> &WorldParams {
        &self.params
    }

    pub fn width(&self) -> u32 {
        self.params.width
    }

    pub fn height(&self) -> u32 {
        self.params.height
    }

    /// All cells, row-major
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    fn index(&self, x: i32, y: i32) -> Result<usize> {
        let (w, h) = (self.params.width, self.params.height);
        if x < 0 || y < 0 || x as u32 >= w || y as u32 >= h {
            return Err(WorldError::OutOfBounds {
                x,
                y,
                width: w,
                height: h,
            });
        }
        Ok(y as usize * w as usize + x as usize)
    }

    /// Snapshot of the cell at `(x, y)`
    pub fn get_cell(&self, x: i32, y: i32) -> Result<Cell> {
        let idx = self.index(x, y)?;
        Ok(self.cells[idx].clone())
    }

    /// Overwrite the tape at `(x, y)` with `program` and clear its lock.
    ///
    /// Must not be called while an epoch is in flight; `compute` holds
    /// `&mut self`, so that is enforced by the borrow checker.
    pub fn set_cell(&mut self, x: i32, y: i32, program: &Program) -> Result<()> {
        let idx = self.index(x, y)?;
        let cell = &mut self.cells[idx];
        program.write_into(cell);
        cell.locked = false;
        Ok(())
    }

    /// `set_cell` with a built-in program id
    pub fn set_cell_id(&mut self, x: i32, y: i32, program_id: i32) -> Result<()> {
        let program = Program::from_id(program_id).ok_or(WorldError::UnknownProgram(program_id))?;
        self.set_cell(x, y, &program)
    }

    /// Advance `speed` epochs. Never fails.
    pub fn compute(&mut self, speed: u32) -> ComputeSummary {
        let mut total = ComputeSummary::default();
        for _ in 0..speed {
            let summary = self.run_epoch();
            total.merge(&summary);
        }
        total
    }

    fn run_epoch(&mut self) -> ComputeSummary {
        let plan = interaction::plan(&mut self.cells, &self.params, self.epoch);
        let in_pair = plan.membership(self.cells.len());
        let budget = self.params.max_steps as usize;
        let rate = self.params.background_mutation_rate;

        // Paired runs read a snapshot of both cells and hand back new values.
        let cells = &self.cells;
        let paired: Vec<(Pair, Cell, Cell, ExecSummary, usize)> = plan.par_map(|pair| {
            debug_assert!(cells[pair.initiator].locked && cells[pair.partner].locked);
            let mut a = cells[pair.initiator].clone();
            let mut b = cells[pair.partner].clone();
            let exec = vm::execute(&mut a, budget, Some(&mut b.tape));
            let mutations = mutate_cell(&mut a, rate) + mutate_cell(&mut b, rate);
            (*pair, a, b, exec, mutations)
        });

        // Unpaired cells are disjoint from every pair, so they run in place.
        let solo: Vec<(ExecSummary, usize)> = self
            .cells
            .par_iter_mut()
            .zip(in_pair.par_iter())
            .filter(|(_, &member)| !member)
            .map(|(cell, _)| {
                let exec = vm::execute(cell, budget, None);
                let mutations = mutate_cell(cell, rate);
                (exec, mutations)
            })
            .collect();

        let mut summary = ComputeSummary {
            epochs: 1,
            interactions: paired.len(),
            solo_runs: solo.len(),
            dropped_claims: plan.dropped,
            ..ComputeSummary::default()
        };

        for (pair, a, b, exec, mutations) in paired {
            self.cells[pair.initiator] = a;
            self.cells[pair.partner] = b;
            interaction::release(&mut self.cells, &pair);
            summary.add_run(&exec, mutations);
        }
        for (exec, mutations) in &solo {
            summary.add_run(exec, *mutations);
        }

        // Claims never outlive the epoch, including stale ones from a load.
        let mut stale = 0usize;
        for cell in self.cells.iter_mut().filter(|c| c.locked) {
            cell.locked = false;
            stale += 1;
        }
        if stale > 0 {
            log::debug!("released {} stale cell locks at epoch {}", stale, self.epoch);
        }

        self.epoch = self.epoch.saturating_add(1);
        log::trace!(
            "epoch {} done: {} pairs, {} solo, {} ops, {} mutations",
            self.epoch,
            summary.interactions,
            summary.solo_runs,
            summary.ops,
            summary.mutations
        );
        summary
    }

    /// Encode the grid in the binary world format
    pub fn save(&self) -> Vec<u8> {
        persist::encode(self)
    }

    /// Write the encoded grid to `path`, creating parent directories
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        persist::write_file(path.as_ref(), &self.save())
    }

    /// Replace this grid with the decoded `bytes`. On error the grid is untouched.
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let decoded = persist::decode(bytes)?;
        *self = decoded;
        Ok(())
    }

    pub fn load_from<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let bytes = std::fs::read(path)?;
        self.load(&bytes)
    }
}

fn mutate_cell(cell: &mut Cell, rate: f32) -> usize {
    let mut rng = CellRng::new(&mut cell.rand_state);
    mutation::mutate(&mut cell.tape, rate, &mut rng)
}
