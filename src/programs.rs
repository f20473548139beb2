//! Built-in seed programs for `set_cell`.

use crate::rng::CellRng;
use crate::vm::{Tape, TAPE_SIZE};
use crate::world::Cell;
use rand::RngCore;

/// Copies its own non-zero prefix through head 1 into the paired neighbour.
pub const REPLICATOR: &[u8] = b"[.>}]";

/// A program that can be written into a cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Program {
    /// All-zero tape (id 0)
    Empty,
    /// [`REPLICATOR`] followed by zeros (id 1)
    Replicator,
    /// Tape filled from the cell's own random stream (id 2)
    Noise,
    /// Literal tape
    Tape(Tape),
}

impl Program {
    /// Look up a built-in program by id
    pub fn from_id(id: i32) -> Option<Program> {
        match id {
            0 => Some(Program::Empty),
            1 => Some(Program::Replicator),
            2 => Some(Program::Noise),
            _ => None,
        }
    }

    /// Program from text, truncated or zero-padded to a full tape
    pub fn parse(text: &str) -> Program {
        Program::Tape(tape_from_bytes(text.as_bytes()))
    }

    /// Overwrite `cell`'s tape. `Noise` advances the cell's stream.
    pub fn write_into(&self, cell: &mut Cell) {
        match self {
            Program::Empty => cell.tape = [0u8; TAPE_SIZE],
            Program::Replicator => cell.tape = tape_from_bytes(REPLICATOR),
            Program::Noise => CellRng::new(&mut cell.rand_state).fill_bytes(&mut cell.tape),
            Program::Tape(tape) => cell.tape = *tape,
        }
    }
}

fn tape_from_bytes(bytes: &[u8]) -> Tape {
    let mut tape = [0u8; TAPE_SIZE];
    let n = bytes.len().min(TAPE_SIZE);
    tape[..n].copy_from_slice(&bytes[..n]);
    tape
}
