//! Binary world format and checkpoint files
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "BFSW" | version u16
//! width u32 | height u32 | epoch u32
//! seed u64 | fixed_shuffle u8 | max_steps u32 | max_dist u32
//!   | background_mutation_rate f32 | width u32 | height u32
//! width*height records: locked u8 | tape [u8; 64] | rand_state u64
//! ```
//!
//! The header is validated against the payload length before any cell is
//! decoded, and a grid is only produced once every record decoded cleanly.

use crate::error::{Result, WorldError};
use crate::vm::TAPE_SIZE;
use crate::world::{Cell, WorldGrid, WorldParams};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

/// Magic bytes identifying a saved world
pub const WORLD_MAGIC: &[u8; 4] = b"BFSW";

/// Current format version
pub const WORLD_VERSION: u16 = 1;

/// Bytes per cell record
pub const CELL_RECORD_SIZE: usize = 1 + TAPE_SIZE + 8;

/// Fixed-size header preceding the cell records.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldHeader {
    pub width: u32,
    pub height: u32,
    pub epoch: u32,
    pub params: WorldParams,
}

impl WorldHeader {
    /// Magic(4) + Version(2) + Width(4) + Height(4) + Epoch(4) +
    /// Seed(8) + FixedShuffle(1) + MaxSteps(4) + MaxDist(4) + Rate(4) +
    /// Width(4) + Height(4) = 47
    pub const SIZE: usize = 47;

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(WORLD_MAGIC)?;
        w.write_all(&WORLD_VERSION.to_le_bytes())?;
        w.write_all(&self.width.to_le_bytes())?;
        w.write_all(&self.height.to_le_bytes())?;
        w.write_all(&self.epoch.to_le_bytes())?;

        let p = &self.params;
        w.write_all(&p.seed.to_le_bytes())?;
        w.write_all(&[p.fixed_shuffle as u8])?;
        w.write_all(&p.max_steps.to_le_bytes())?;
        w.write_all(&p.max_dist.to_le_bytes())?;
        w.write_all(&p.background_mutation_rate.to_le_bytes())?;
        w.write_all(&p.width.to_le_bytes())?;
        w.write_all(&p.height.to_le_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact(r, &mut magic)?;
        if &magic != WORLD_MAGIC {
            return Err(WorldError::Format("bad magic bytes".into()));
        }

        let mut buf1 = [0u8; 1];
        let mut buf2 = [0u8; 2];
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];

        read_exact(r, &mut buf2)?;
        let version = u16::from_le_bytes(buf2);
        if version != WORLD_VERSION {
            return Err(WorldError::Format(format!(
                "unsupported format version {}",
                version
            )));
        }

        read_exact(r, &mut buf4)?;
        let width = u32::from_le_bytes(buf4);
        read_exact(r, &mut buf4)?;
        let height = u32::from_le_bytes(buf4);
        read_exact(r, &mut buf4)?;
        let epoch = u32::from_le_bytes(buf4);

        read_exact(r, &mut buf8)?;
        let seed = u64::from_le_bytes(buf8);
        read_exact(r, &mut buf1)?;
        let fixed_shuffle = decode_bool(buf1[0], "fixed_shuffle")?;
        read_exact(r, &mut buf4)?;
        let max_steps = u32::from_le_bytes(buf4);
        read_exact(r, &mut buf4)?;
        let max_dist = u32::from_le_bytes(buf4);
        read_exact(r, &mut buf4)?;
        let background_mutation_rate = f32::from_le_bytes(buf4);
        read_exact(r, &mut buf4)?;
        let params_width = u32::from_le_bytes(buf4);
        read_exact(r, &mut buf4)?;
        let params_height = u32::from_le_bytes(buf4);

        Ok(Self {
            width,
            height,
            epoch,
            params: WorldParams {
                seed,
                fixed_shuffle,
                max_steps,
                max_dist,
                background_mutation_rate,
                width: params_width,
                height: params_height,
            },
        })
    }

    /// Check the header describes a consistent, loadable grid
    pub fn validate(&self) -> Result<()> {
        if self.width != self.params.width || self.height != self.params.height {
            return Err(WorldError::Format(format!(
                "header dimensions {}x{} disagree with params {}x{}",
                self.width, self.height, self.params.width, self.params.height
            )));
        }
        self.params
            .validate()
            .map_err(|e| WorldError::Format(e.to_string()))
    }

    /// Payload size implied by the header
    pub fn payload_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(CELL_RECORD_SIZE)
    }
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf)
        .map_err(|_| WorldError::Format("truncated header".into()))
}

fn decode_bool(byte: u8, field: &str) -> Result<bool> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WorldError::Format(format!(
            "{} must be 0 or 1, got {}",
            field, other
        ))),
    }
}

fn encode_cell(cell: &Cell, out: &mut Vec<u8>) {
    out.push(cell.locked as u8);
    out.extend_from_slice(&cell.tape);
    out.extend_from_slice(&cell.rand_state.to_le_bytes());
}

fn decode_cell(record: &[u8]) -> Result<Cell> {
    debug_assert_eq!(record.len(), CELL_RECORD_SIZE);
    let locked = decode_bool(record[0], "locked")?;
    let mut tape = [0u8; TAPE_SIZE];
    tape.copy_from_slice(&record[1..1 + TAPE_SIZE]);
    let mut state = [0u8; 8];
    state.copy_from_slice(&record[1 + TAPE_SIZE..]);
    Ok(Cell {
        locked,
        tape,
        rand_state: u64::from_le_bytes(state),
    })
}

/// Encode a grid
pub fn encode(grid: &WorldGrid) -> Vec<u8> {
    let header = WorldHeader {
        width: grid.width(),
        height: grid.height(),
        epoch: grid.epoch(),
        params: grid.params().clone(),
    };
    let mut out = Vec::with_capacity(WorldHeader::SIZE + grid.cells().len() * CELL_RECORD_SIZE);
    // Writing into a Vec cannot fail.
    let _ = header.write_to(&mut out);
    for cell in grid.cells() {
        encode_cell(cell, &mut out);
    }
    out
}

/// Decode a grid. Nothing is allocated for cells until the header checks out.
pub fn decode(bytes: &[u8]) -> Result<WorldGrid> {
    let mut reader = bytes;
    let header = WorldHeader::read_from(&mut reader)?;
    header.validate()?;

    let expected = header
        .payload_size()
        .ok_or_else(|| WorldError::Format("grid size overflows".into()))?;
    if reader.len() != expected {
        return Err(WorldError::Format(format!(
            "expected {} bytes of cell data for a {}x{} grid, found {}",
            expected,
            header.width,
            header.height,
            reader.len()
        )));
    }

    let cells = reader
        .chunks_exact(CELL_RECORD_SIZE)
        .map(decode_cell)
        .collect::<Result<Vec<_>>>()?;

    WorldGrid::from_parts(header.params, header.epoch, cells)
}

/// Write `data` to `path`, creating parent directories as needed
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(data)?;
    writer.flush()?;
    Ok(())
}

/// Checkpoint file name for `epoch` inside `dir`
pub fn checkpoint_filename<P: AsRef<Path>>(dir: P, epoch: u32) -> PathBuf {
    dir.as_ref().join(format!("checkpoint_epoch_{}.bfsw", epoch))
}

/// Checkpoints in `dir` as `(epoch, path)`, oldest first
pub fn list_checkpoints<P: AsRef<Path>>(dir: P) -> io::Result<Vec<(u32, PathBuf)>> {
    let mut found: Vec<(u32, PathBuf)> = fs::read_dir(dir.as_ref())?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let epoch = name
                .to_str()?
                .strip_prefix("checkpoint_epoch_")?
                .strip_suffix(".bfsw")?
                .parse::<u32>()
                .ok()?;
            Some((epoch, entry.path()))
        })
        .collect();
    found.sort();
    Ok(found)
}

/// Checkpoint in `dir` with the highest epoch, if any
pub fn find_latest_checkpoint<P: AsRef<Path>>(dir: P) -> Option<PathBuf> {
    list_checkpoints(dir).ok()?.pop().map(|(_, path)| path)
}

enum WriterMessage {
    Save { path: PathBuf, data: Vec<u8>, epoch: u32 },
    Shutdown,
}

/// Writes encoded grids on a background thread so the run loop keeps going.
///
/// Pending writes are flushed by `shutdown` or on drop.
pub struct CheckpointWriter {
    sender: Sender<WriterMessage>,
    handle: Option<JoinHandle<usize>>,
}

impl CheckpointWriter {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<WriterMessage>();

        let handle = thread::spawn(move || {
            let mut failures = 0usize;
            while let Ok(msg) = receiver.recv() {
                match msg {
                    WriterMessage::Save { path, data, epoch } => match write_file(&path, &data) {
                        Ok(()) => log::info!("checkpoint saved: {} (epoch {})", path.display(), epoch),
                        Err(e) => {
                            failures += 1;
                            log::error!("checkpoint {} failed: {}", path.display(), e);
                        }
                    },
                    WriterMessage::Shutdown => break,
                }
            }
            failures
        });

        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Queue a snapshot of `grid` for writing to `path`
    pub fn save(&self, grid: &WorldGrid, path: PathBuf) {
        let msg = WriterMessage::Save {
            path,
            data: grid.save(),
            epoch: grid.epoch(),
        };
        if self.sender.send(msg).is_err() {
            log::warn!("checkpoint writer is gone, snapshot at epoch {} dropped", grid.epoch());
        }
    }

    /// Flush pending writes and stop the thread. Returns the number of failed writes.
    pub fn shutdown(&mut self) -> usize {
        let _ = self.sender.send(WriterMessage::Shutdown);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(failures)) => failures,
            Some(Err(_)) => {
                log::error!("checkpoint writer thread panicked");
                1
            }
            None => 0,
        }
    }
}

impl Default for CheckpointWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::Program;
    use crate::world::TapeFill;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn test_grid() -> WorldGrid {
        let params = WorldParams {
            seed: 5,
            width: 9,
            height: 7,
            max_dist: 3,
            max_steps: 96,
            background_mutation_rate: 0.02,
            fixed_shuffle: true,
        };
        let mut grid = WorldGrid::new(params).unwrap();
        grid.reset_with(5, TapeFill::Random);
        grid.set_cell(2, 2, &Program::Replicator).unwrap();
        grid.compute(4);
        grid
    }

    #[test]
    fn test_round_trip() {
        let grid = test_grid();
        let bytes = grid.save();
        assert_eq!(bytes.len(), WorldHeader::SIZE + 63 * CELL_RECORD_SIZE);

        let mut loaded = WorldGrid::new(WorldParams::default()).unwrap();
        loaded.load(&bytes).unwrap();
        assert_eq!(loaded, grid);
        assert_eq!(loaded.epoch(), 4);
    }

    #[test]
    fn test_round_trip_continues_identically() {
        let mut original = test_grid();
        let mut restored = decode(&original.save()).unwrap();
        original.compute(6);
        restored.compute(6);
        assert_eq!(original.cells(), restored.cells());
        assert_eq!(original.epoch(), restored.epoch());
    }

    #[test]
    fn test_locked_flag_persists() {
        let mut bytes = test_grid().save();
        bytes[WorldHeader::SIZE] = 1;
        let grid = decode(&bytes).unwrap();
        assert!(grid.cells()[0].locked);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = test_grid().save();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(WorldError::Format(_))));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = test_grid().save();
        bytes[4] = 9;
        assert!(matches!(decode(&bytes), Err(WorldError::Format(_))));
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = test_grid().save();
        assert!(matches!(decode(&bytes[..bytes.len() - 1]), Err(WorldError::Format(_))));
        assert!(matches!(decode(&bytes[..10]), Err(WorldError::Format(_))));
        assert!(matches!(decode(&[]), Err(WorldError::Format(_))));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = test_grid().save();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(WorldError::Format(_))));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut bytes = test_grid().save();
        // Header width says 10, params still say 9.
        bytes[6..10].copy_from_slice(&10u32.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(WorldError::Format(_))));
    }

    #[test]
    fn test_huge_dimensions_rejected_before_allocation() {
        let grid = test_grid();
        let mut header = WorldHeader {
            width: 40_000,
            height: 40_000,
            epoch: 0,
            params: grid.params().clone(),
        };
        header.params.width = 40_000;
        header.params.height = 40_000;
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert!(matches!(decode(&bytes), Err(WorldError::Format(_))));
    }

    #[test]
    fn test_bad_locked_byte() {
        let mut bytes = test_grid().save();
        bytes[WorldHeader::SIZE] = 2;
        assert!(matches!(decode(&bytes), Err(WorldError::Format(_))));
    }

    #[test]
    fn test_failed_load_leaves_grid_untouched() {
        let mut grid = test_grid();
        let snapshot = grid.clone();
        let mut bytes = grid.save();
        bytes.truncate(bytes.len() - CELL_RECORD_SIZE);
        assert!(grid.load(&bytes).is_err());
        assert_eq!(grid, snapshot);
    }

    #[test]
    fn test_save_to_and_load_from() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("world.bfsw");
        let grid = test_grid();
        grid.save_to(&path).unwrap();

        let mut loaded = WorldGrid::new(WorldParams::default()).unwrap();
        loaded.load_from(&path).unwrap();
        assert_eq!(loaded, grid);
    }

    #[test]
    fn test_save_to_unwritable_destination() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"file").unwrap();
        let grid = test_grid();
        let result = grid.save_to(blocker.join("world.bfsw"));
        assert!(matches!(result, Err(WorldError::Io(_))));
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempdir().unwrap();
        let mut grid = test_grid();
        let snapshot = grid.clone();
        let result = grid.load_from(dir.path().join("missing.bfsw"));
        assert!(matches!(result, Err(WorldError::Io(_))));
        assert_eq!(grid, snapshot);
    }

    #[test]
    fn test_find_latest_checkpoint() {
        let dir = tempdir().unwrap();
        assert_eq!(find_latest_checkpoint(dir.path()), None);
        for epoch in [5u32, 120, 40] {
            fs::write(checkpoint_filename(dir.path(), epoch), b"x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let epochs: Vec<u32> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(epoch, _)| epoch)
            .collect();
        assert_eq!(epochs, vec![5, 40, 120]);
        assert_eq!(
            find_latest_checkpoint(dir.path()),
            Some(checkpoint_filename(dir.path(), 120))
        );
    }

    #[test]
    fn test_checkpoint_writer() {
        let dir = tempdir().unwrap();
        let grid = test_grid();
        let path = checkpoint_filename(dir.path().join("ckpt"), grid.epoch());

        let mut writer = CheckpointWriter::new();
        writer.save(&grid, path.clone());
        assert_eq!(writer.shutdown(), 0);

        let restored = decode(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(restored, grid);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&bytes);
        }

        #[test]
        fn prop_corrupt_header_is_rejected_or_consistent(idx in 0usize..WorldHeader::SIZE, value in any::<u8>()) {
            let grid = test_grid();
            let mut bytes = grid.save();
            bytes[idx] = value;
            if let Ok(decoded) = decode(&bytes) {
                prop_assert_eq!(decoded.cells().len(), grid.cells().len());
            }
        }
    }
}
