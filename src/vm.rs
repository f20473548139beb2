//! Cell VM - a two-head tape language with an accumulator
//!
//! A cell runs its own 64-byte tape. When it is paired with a neighbour the
//! VM runs on the 128-byte concatenation `[cell | neighbour]` and head 1
//! starts at the first neighbour byte, which makes head 1 the interaction
//! channel.
//!
//! | byte      | effect                                         |
//! |-----------|------------------------------------------------|
//! | `<` `>`   | move head 0                                    |
//! | `{` `}`   | move head 1                                    |
//! | `+` `-`   | increment / decrement `tape[head0]`            |
//! | `.`       | `tape[head1] = tape[head0]`                    |
//! | `,`       | `tape[head0] = tape[head1]`                    |
//! | `[`       | if `tape[head0] == 0` jump past matching `]`   |
//! | `]`       | if `tape[head0] != 0` jump back to matching `[`|
//! | `(`       | `acc = tape[head0]`                            |
//! | `)`       | `tape[head0] = acc`                            |
//! | `?`       | `acc =` next byte of the cell's random stream  |
//! | `!`       | halt                                           |
//!
//! Every other byte, including `0x00`, is a no-op. The instruction pointer
//! and both heads start from scratch on every run.

use crate::rng::CellRng;
use crate::world::Cell;

pub const TAPE_SIZE: usize = 64;
pub const PAIRED_TAPE_SIZE: usize = 2 * TAPE_SIZE;

pub type Tape = [u8; TAPE_SIZE];

/// Decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Head0Left,
    Head0Right,
    Head1Left,
    Head1Right,
    Inc,
    Dec,
    CopyOut,
    CopyIn,
    LoopStart,
    LoopEnd,
    Load,
    Store,
    Random,
    Halt,
    Nop,
}

impl Op {
    #[inline]
    pub fn decode(byte: u8) -> Op {
        match byte {
            b'<' => Op::Head0Left,
            b'>' => Op::Head0Right,
            b'{' => Op::Head1Left,
            b'}' => Op::Head1Right,
            b'+' => Op::Inc,
            b'-' => Op::Dec,
            b'.' => Op::CopyOut,
            b',' => Op::CopyIn,
            b'[' => Op::LoopStart,
            b']' => Op::LoopEnd,
            b'(' => Op::Load,
            b')' => Op::Store,
            b'?' => Op::Random,
            b'!' => Op::Halt,
            _ => Op::Nop,
        }
    }
}

/// Check if a byte decodes to anything other than a no-op
#[inline]
pub fn is_instruction(byte: u8) -> bool {
    Op::decode(byte) != Op::Nop
}

/// What a single run did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecSummary {
    /// Steps consumed from the budget
    pub steps: usize,
    /// Steps that executed an instruction
    pub ops: usize,
    /// Steps spent on no-op bytes
    pub skipped: usize,
    /// Whether `!` stopped the run
    pub halted: bool,
    /// Writes that landed on the neighbour's tape
    pub channel_writes: usize,
    /// Bytes drawn from the cell's random stream
    pub random_draws: usize,
}

/// Run `cell` for at most `budget` steps, with `neighbor` attached when paired.
///
/// Only the cell's tape and random state and the neighbour's tape change.
pub fn execute(cell: &mut Cell, budget: usize, neighbor: Option<&mut Tape>) -> ExecSummary {
    let mut rng = CellRng::new(&mut cell.rand_state);
    match neighbor {
        None => run(&mut cell.tape, 0, &mut rng, budget),
        Some(other) => {
            let mut tape = [0u8; PAIRED_TAPE_SIZE];
            tape[..TAPE_SIZE].copy_from_slice(&cell.tape);
            tape[TAPE_SIZE..].copy_from_slice(other);

            let summary = run(&mut tape, TAPE_SIZE, &mut rng, budget);

            cell.tape.copy_from_slice(&tape[..TAPE_SIZE]);
            other.copy_from_slice(&tape[TAPE_SIZE..]);
            summary
        }
    }
}

/// Interpreter core. `tape.len()` must be a power of two.
fn run(tape: &mut [u8], head1_start: usize, rng: &mut CellRng<'_>, budget: usize) -> ExecSummary {
    debug_assert!(tape.len().is_power_of_two());
    let len = tape.len();
    let mask = len - 1;

    let mut summary = ExecSummary::default();
    let mut pos = 0usize;
    let mut head0 = 0usize;
    let mut head1 = head1_start & mask;
    let mut acc = 0u8;

    while summary.steps < budget {
        summary.steps += 1;

        let op = Op::decode(tape[pos]);
        let mut written = None;

        match op {
            Op::Head0Left => head0 = head0.wrapping_sub(1) & mask,
            Op::Head0Right => head0 = (head0 + 1) & mask,
            Op::Head1Left => head1 = head1.wrapping_sub(1) & mask,
            Op::Head1Right => head1 = (head1 + 1) & mask,
            Op::Inc => {
                tape[head0] = tape[head0].wrapping_add(1);
                written = Some(head0);
            }
            Op::Dec => {
                tape[head0] = tape[head0].wrapping_sub(1);
                written = Some(head0);
            }
            Op::CopyOut => {
                tape[head1] = tape[head0];
                written = Some(head1);
            }
            Op::CopyIn => {
                tape[head0] = tape[head1];
                written = Some(head0);
            }
            Op::LoopStart => {
                if tape[head0] == 0 {
                    match matching_close(tape, pos) {
                        Some(close) => pos = close,
                        None => {
                            summary.ops += 1;
                            break;
                        }
                    }
                }
            }
            Op::LoopEnd => {
                if tape[head0] != 0 {
                    match matching_open(tape, pos) {
                        Some(open) => pos = open,
                        None => {
                            summary.ops += 1;
                            break;
                        }
                    }
                }
            }
            Op::Load => acc = tape[head0],
            Op::Store => {
                tape[head0] = acc;
                written = Some(head0);
            }
            Op::Random => {
                acc = rng.next_byte();
                summary.random_draws += 1;
            }
            Op::Halt => {
                summary.ops += 1;
                summary.halted = true;
                break;
            }
            Op::Nop => summary.skipped += 1,
        }

        if op != Op::Nop {
            summary.ops += 1;
        }
        if matches!(written, Some(idx) if idx >= TAPE_SIZE) {
            summary.channel_writes += 1;
        }

        pos += 1;
        if pos >= len {
            break;
        }
    }

    summary
}

/// Position of the `]` closing the `[` at `open`, if any
fn matching_close(tape: &[u8], open: usize) -> Option<usize> {
    let mut depth = 1usize;
    for (idx, &byte) in tape.iter().enumerate().skip(open + 1) {
        match byte {
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Position of the `[` opening the `]` at `close`, if any
fn matching_open(tape: &[u8], close: usize) -> Option<usize> {
    let mut depth = 1usize;
    for idx in (0..close).rev() {
        match tape[idx] {
            b']' => depth += 1,
            b'[' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Render a tape for logs: instructions verbatim, everything else as `·`
pub fn tape_to_string(tape: &[u8]) -> String {
    tape.iter()
        .map(|&b| if is_instruction(b) { b as char } else { '·' })
        .collect()
}
