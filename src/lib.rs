//! Cell soup: a 2-D torus of cells, each carrying a 64-byte program tape and
//! its own random stream.
//!
//! Every epoch each cell runs its tape for a bounded number of steps, either
//! alone or paired with a neighbour inside `max_dist` whose tape it can read
//! and write, and then every tape byte is replaced with probability
//! `background_mutation_rate`.
//!
//! ```no_run
//! use cell_soup::{Program, WorldGrid, WorldParams};
//!
//! let mut grid = WorldGrid::new(WorldParams::default())?;
//! grid.set_cell(10, 10, &Program::Replicator)?;
//! grid.compute(100);
//! grid.save_to("world.bfsw")?;
//! # Ok::<(), cell_soup::WorldError>(())
//! ```

pub mod config;
pub mod error;
pub mod interaction;
pub mod mutation;
pub mod persist;
pub mod programs;
pub mod rng;
pub mod stats;
pub mod vm;
pub mod world;

pub use config::{Config, ConfigError};
pub use error::{Result, WorldError};
pub use programs::Program;
pub use stats::SoupStats;
pub use vm::{Tape, TAPE_SIZE};
pub use world::{Cell, ComputeSummary, TapeFill, WorldGrid, WorldParams};
