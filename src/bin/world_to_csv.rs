//! Export saved worlds to CSV (offline).
//!
//! Typical usage:
//!   # Export a single saved world
//!   cargo run --release --bin world_to_csv -- --input world.bfsw --out world.csv
//!
//!   # Export every 10th checkpoint in a directory
//!   cargo run --release --bin world_to_csv -- --input checkpoints --stride 10 --out soup.csv
//!
//! Output columns:
//!   epoch,x,y,hash64,is_zero,locked,rand_state[,bytes_hex]
//!
//! Use `--bytes-hex N` to include the first N bytes of each 64-byte tape in hex.

use cell_soup::persist;
use cell_soup::{WorldGrid, WorldParams, TAPE_SIZE};
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

struct Args {
    input: PathBuf,
    out: PathBuf,
    stride: usize,
    bytes_hex: usize,
    exclude_zero: bool,
}

fn usage_and_exit(msg: Option<&str>) -> ! {
    if let Some(m) = msg {
        eprintln!("Error: {m}\n");
    }
    eprintln!("world_to_csv (offline saved-world exporter)");
    eprintln!();
    eprintln!("REQUIRED:");
    eprintln!("  --input <FILE|DIR>      Saved world, or a directory of checkpoint_epoch_*.bfsw");
    eprintln!("  --out <FILE.csv>        Output CSV file");
    eprintln!();
    eprintln!("OPTIONAL:");
    eprintln!("  --stride <N>            Export every Nth checkpoint (default: 1)");
    eprintln!("  --bytes-hex <N>         Include first N bytes of each tape as hex (default: 0)");
    eprintln!("  --exclude-zero          Skip all-zero tapes");
    eprintln!();
    std::process::exit(2);
}

fn parse_usize(argv: &[String], i: usize, flag: &str) -> usize {
    argv.get(i)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| usage_and_exit(Some(&format!("Invalid {flag} value"))))
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut input: Option<PathBuf> = None;
    let mut out: Option<PathBuf> = None;
    let mut stride: usize = 1;
    let mut bytes_hex: usize = 0;
    let mut exclude_zero = false;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--input" | "-i" => {
                i += 1;
                input = argv.get(i).map(PathBuf::from);
            }
            "--out" | "-o" => {
                i += 1;
                out = argv.get(i).map(PathBuf::from);
            }
            "--stride" => {
                i += 1;
                stride = parse_usize(&argv, i, "--stride");
                if stride == 0 {
                    usage_and_exit(Some("--stride must be > 0"));
                }
            }
            "--bytes-hex" => {
                i += 1;
                bytes_hex = parse_usize(&argv, i, "--bytes-hex").min(TAPE_SIZE);
            }
            "--exclude-zero" => exclude_zero = true,
            "--help" | "-h" => usage_and_exit(None),
            other => usage_and_exit(Some(&format!("Unknown argument: {other}"))),
        }
        i += 1;
    }

    Args {
        input: input.unwrap_or_else(|| usage_and_exit(Some("--input is required"))),
        out: out.unwrap_or_else(|| usage_and_exit(Some("--out is required"))),
        stride,
        bytes_hex,
        exclude_zero,
    }
}

fn input_files(input: &Path, stride: usize) -> std::io::Result<Vec<PathBuf>> {
    if !input.is_dir() {
        return Ok(vec![input.to_path_buf()]);
    }
    Ok(persist::list_checkpoints(input)?
        .into_iter()
        .step_by(stride)
        .map(|(_, path)| path)
        .collect())
}

/// Fast, stable 64-bit hash (FNV-1a)
fn hash64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 1469598103934665603;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX[(b >> 4) as usize] as char);
        s.push(HEX[(b & 0xF) as usize] as char);
    }
    s
}

fn write_world<W: Write>(w: &mut W, grid: &WorldGrid, args: &Args) -> std::io::Result<usize> {
    let width = grid.width() as usize;
    let mut rows = 0;
    for (idx, cell) in grid.cells().iter().enumerate() {
        let zero = cell.is_empty();
        if args.exclude_zero && zero {
            continue;
        }
        let (x, y) = (idx % width, idx / width);
        write!(
            w,
            "{},{},{},{:016x},{},{},{:016x}",
            grid.epoch(),
            x,
            y,
            hash64(&cell.tape),
            zero,
            cell.locked,
            cell.rand_state
        )?;
        if args.bytes_hex > 0 {
            write!(w, ",{}", bytes_to_hex(&cell.tape[..args.bytes_hex]))?;
        }
        writeln!(w)?;
        rows += 1;
    }
    Ok(rows)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let files = input_files(&args.input, args.stride)?;
    if files.is_empty() {
        usage_and_exit(Some("No checkpoint_epoch_*.bfsw files found in --input"));
    }

    let mut w = BufWriter::new(File::create(&args.out)?);
    if args.bytes_hex > 0 {
        writeln!(w, "epoch,x,y,hash64,is_zero,locked,rand_state,bytes_hex")?;
    } else {
        writeln!(w, "epoch,x,y,hash64,is_zero,locked,rand_state")?;
    }

    let mut grid = WorldGrid::new(WorldParams {
        width: 1,
        height: 1,
        ..WorldParams::default()
    })?;
    for path in &files {
        if let Err(e) = grid.load_from(path) {
            eprintln!("Warning: skipping {}: {}", path.display(), e);
            continue;
        }
        let rows = write_world(&mut w, &grid, &args)?;
        // keep IO streaming
        w.flush()?;
        println!("Exported epoch {} ({} rows, {})", grid.epoch(), rows, path.display());
    }

    println!("Wrote CSV: {}", args.out.display());
    Ok(())
}
