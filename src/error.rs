//! Error types for grid boundary operations.

use std::io;

/// Errors reported by the world grid's boundary operations.
///
/// Anomalies inside the cell VM are never reported here: unknown bytes run as
/// no-ops and `compute` always completes.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("cell ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("malformed world data: {0}")]
    Format(String),

    #[error("invalid world parameters: {0}")]
    InvalidParams(String),

    #[error("unknown program id {0}")]
    UnknownProgram(i32),
}

pub type Result<T> = std::result::Result<T, WorldError>;
