//! Soup statistics for progress reporting
//!
//! The Brotli compression ratio over live tapes rises sharply once
//! replicators take over, so it is the headline number in run logs.

use crate::vm::{self, TAPE_SIZE};
use crate::world::WorldGrid;
use brotli::enc::BrotliEncoderParams;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Number of most frequent bytes kept in [`SoupStats::top_bytes`]
pub const TOP_BYTES: usize = 8;

/// Default Brotli quality (1-11, lower = faster)
pub const DEFAULT_BROTLI_QUALITY: u32 = 4;

/// Statistics over every tape in the grid at one epoch
#[derive(Clone, Debug, PartialEq)]
pub struct SoupStats {
    pub epoch: u32,
    pub byte_counts: [u64; 256],
    /// Zero-order entropy of the byte distribution, in bits
    pub h0: f64,
    /// Instruction bytes over all bytes of live tapes
    pub instruction_fraction: f64,
    pub zero_fraction: f64,
    /// All-zero tapes
    pub empty_tapes: usize,
    pub total_tapes: usize,
    /// Most frequent bytes with counts, highest first
    pub top_bytes: Vec<(u8, u64)>,
}

impl SoupStats {
    pub fn collect(grid: &WorldGrid) -> Self {
        let mut byte_counts = [0u64; 256];
        let mut empty_tapes = 0usize;
        let mut live_bytes = 0u64;
        let mut live_instructions = 0u64;

        for cell in grid.cells() {
            for &b in &cell.tape {
                byte_counts[b as usize] += 1;
            }
            if cell.is_empty() {
                empty_tapes += 1;
            } else {
                live_bytes += TAPE_SIZE as u64;
                live_instructions += cell.tape.iter().filter(|&&b| vm::is_instruction(b)).count() as u64;
            }
        }

        let total: u64 = byte_counts.iter().sum();
        let h0 = entropy(&byte_counts, total);
        let zero_fraction = if total == 0 {
            0.0
        } else {
            byte_counts[0] as f64 / total as f64
        };
        let instruction_fraction = if live_bytes == 0 {
            0.0
        } else {
            live_instructions as f64 / live_bytes as f64
        };

        let mut ranked: Vec<(u8, u64)> = byte_counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(b, &c)| (b as u8, c))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(TOP_BYTES);

        Self {
            epoch: grid.epoch(),
            byte_counts,
            h0,
            instruction_fraction,
            zero_fraction,
            empty_tapes,
            total_tapes: grid.cells().len(),
            top_bytes: ranked,
        }
    }

    pub fn live_tapes(&self) -> usize {
        self.total_tapes - self.empty_tapes
    }

    /// Distinct byte values present anywhere in the soup
    pub fn unique_bytes(&self) -> usize {
        self.byte_counts.iter().filter(|&&c| c > 0).count()
    }

    /// Top bytes rendered as `'c':count` pairs, non-printables in hex
    pub fn top_bytes_string(&self) -> String {
        self.top_bytes
            .iter()
            .map(|&(b, c)| {
                if b.is_ascii_graphic() {
                    format!("'{}':{}", b as char, c)
                } else {
                    format!("0x{:02x}:{}", b, c)
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn entropy(counts: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            p * (1.0 / p).log2()
        })
        .sum()
}

/// Concatenated tapes of every non-empty cell
pub fn live_tapes(grid: &WorldGrid) -> Vec<u8> {
    grid.cells()
        .iter()
        .filter(|c| !c.is_empty())
        .flat_map(|c| c.tape.iter().copied())
        .collect()
}

/// Brotli compression ratio of the live tapes. 1.0 when nothing is alive.
pub fn compression_ratio(grid: &WorldGrid, quality: u32) -> f64 {
    let data = live_tapes(grid);
    if data.is_empty() {
        return 1.0;
    }

    let mut compressed = Vec::new();
    let mut params = BrotliEncoderParams::default();
    params.quality = quality.min(11) as i32;

    match brotli::BrotliCompress(&mut io::Cursor::new(&data), &mut compressed, &params) {
        Ok(_) if !compressed.is_empty() => data.len() as f64 / compressed.len() as f64,
        Ok(_) => 1.0,
        Err(e) => {
            log::warn!("brotli compression failed: {}", e);
            1.0
        }
    }
}

/// CSV sink for periodic stats rows
pub struct StatsLog {
    writer: Option<BufWriter<File>>,
}

impl StatsLog {
    pub const HEADER: &'static str =
        "epoch,compression_ratio,h0,instruction_fraction,zero_fraction,unique_bytes,live_tapes,total_tapes";

    /// Open `path` for writing, or log nothing when `path` is `None`
    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        let writer = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                let mut writer = BufWriter::new(file);
                writeln!(writer, "{}", Self::HEADER)?;
                Some(writer)
            }
            None => None,
        };
        Ok(Self { writer })
    }

    pub fn record(&mut self, stats: &SoupStats, ratio: f64) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writeln!(
                writer,
                "{},{:.4},{:.4},{:.4},{:.4},{},{},{}",
                stats.epoch,
                ratio,
                stats.h0,
                stats.instruction_fraction,
                stats.zero_fraction,
                stats.unique_bytes(),
                stats.live_tapes(),
                stats.total_tapes
            )?;
            writer.flush()?;
        }
        Ok(())
    }
}
