//! Headless cell soup runner

use cell_soup::config::Config;
use cell_soup::persist::{self, CheckpointWriter};
use cell_soup::stats::{self, SoupStats, StatsLog};
use cell_soup::vm::tape_to_string;
use cell_soup::{ComputeSummary, WorldGrid};
use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Instant;

/// Tapes printed at start-up and on each progress report
const SAMPLE_TAPES: usize = 4;

enum Command {
    Run(Box<Config>),
    Exit,
}

fn parse_value<T: FromStr>(argv: &[String], i: usize, flag: &str) -> Result<T, String> {
    let raw = argv
        .get(i)
        .ok_or_else(|| format!("{} expects a value", flag))?;
    raw.parse()
        .map_err(|_| format!("invalid value for {}: {}", flag, raw))
}

fn parse_args() -> Result<Command, String> {
    let argv: Vec<String> = env::args().collect();
    let mut config = Config::default();

    // First pass: config file, template generation, help
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let path = argv
                    .get(i)
                    .ok_or_else(|| "--config expects a file".to_string())?;
                config = Config::from_yaml(path)
                    .map_err(|e| format!("error loading config file '{}': {}", path, e))?;
                log::info!("loaded config from {}", path);
            }
            "--generate-config" => {
                let output_path = match argv.get(i + 1) {
                    Some(path) if !path.starts_with('-') => path.clone(),
                    _ => "config.yaml".to_string(),
                };
                Config::write_template(&output_path)
                    .map_err(|e| format!("error writing config template: {}", e))?;
                println!("Generated config template: {}", output_path);
                return Ok(Command::Exit);
            }
            "--help" => {
                print_help();
                return Ok(Command::Exit);
            }
            _ => {}
        }
        i += 1;
    }

    // Second pass: CLI args override config file values
    i = 1;
    while i < argv.len() {
        let flag = argv[i].as_str();
        match flag {
            "--config" | "-c" => {
                i += 1;
            }
            "--width" | "-w" => {
                i += 1;
                config.world.width = parse_value(&argv, i, flag)?;
            }
            "--height" => {
                i += 1;
                config.world.height = parse_value(&argv, i, flag)?;
            }
            "--seed" | "-s" => {
                i += 1;
                config.world.seed = parse_value(&argv, i, flag)?;
            }
            "--max-steps" => {
                i += 1;
                config.world.max_steps = parse_value(&argv, i, flag)?;
            }
            "--max-dist" | "-n" => {
                i += 1;
                config.world.max_dist = parse_value(&argv, i, flag)?;
            }
            "--mutation-rate" | "-m" => {
                i += 1;
                config.world.background_mutation_rate = parse_value(&argv, i, flag)?;
            }
            "--random-shuffle" => {
                config.world.fixed_shuffle = false;
            }
            "--epochs" | "-e" => {
                i += 1;
                config.run.epochs = parse_value(&argv, i, flag)?;
            }
            "--speed" => {
                i += 1;
                config.run.speed = parse_value(&argv, i, flag)?;
            }
            "--report-interval" => {
                i += 1;
                config.run.report_interval = parse_value(&argv, i, flag)?;
            }
            "--checkpoint-dir" => {
                i += 1;
                config.checkpoint.path = parse_value(&argv, i, flag)?;
                config.checkpoint.enabled = true;
            }
            "--checkpoint-interval" => {
                i += 1;
                config.checkpoint.interval = parse_value(&argv, i, flag)?;
                config.checkpoint.enabled = true;
            }
            "--resume" => {
                i += 1;
                config.checkpoint.resume_from = parse_value(&argv, i, flag)?;
            }
            "--metrics" => {
                config.metrics.enabled = true;
            }
            "--metrics-file" => {
                i += 1;
                config.metrics.output_file = parse_value(&argv, i, flag)?;
                config.metrics.enabled = true;
            }
            other => {
                print_help();
                return Err(format!("unknown argument: {}", other));
            }
        }
        i += 1;
    }

    let warnings = config
        .validate()
        .map_err(|e| format!("config validation error: {}", e))?;
    for warning in warnings {
        log::warn!("config: {}", warning);
    }

    Ok(Command::Run(Box::new(config)))
}

fn print_help() {
    println!("Cell Soup Simulation");
    println!();
    println!("USAGE:");
    println!("    cell-soup [OPTIONS]");
    println!("    cell-soup --config config.yaml");
    println!("    cell-soup --generate-config [output.yaml]");
    println!();
    println!("CONFIG FILE:");
    println!("    -c, --config <FILE>        Load settings from YAML config file");
    println!("    --generate-config [FILE]   Generate template config (default: config.yaml)");
    println!();
    println!("WORLD (override config file values):");
    println!("    -w, --width <N>            Grid width (default: 196)");
    println!("    --height <N>               Grid height (default: 120)");
    println!("    -s, --seed <N>             Random seed (default: 0)");
    println!("    --max-steps <N>            VM steps per cell per epoch (default: 256)");
    println!("    -n, --max-dist <N>         Interaction radius, 0 = no interaction (default: 30)");
    println!("    -m, --mutation-rate <P>    Per-byte mutation probability (default: 0.024)");
    println!("    --random-shuffle           Randomize pairing order every run");
    println!();
    println!("RUN:");
    println!("    -e, --epochs <N>           Total epochs (default: 10000)");
    println!("    --speed <N>                Epochs per compute batch (default: 16)");
    println!("    --report-interval <N>      Log progress every N epochs, 0 = never (default: 256)");
    println!();
    println!("CHECKPOINTS:");
    println!("    --checkpoint-dir <DIR>     Enable checkpoints in DIR");
    println!("    --checkpoint-interval <N>  Checkpoint every N epochs, 0 = only at end");
    println!("    --resume <FILE|latest>     Resume from a saved world");
    println!();
    println!("METRICS:");
    println!("    --metrics                  Log soup statistics");
    println!("    --metrics-file <FILE>      Also write statistics as CSV");
    println!();
    println!("    --help                     Print this help message");
    println!();
    println!("Log level is controlled by RUST_LOG (default: info).");
}

/// Whether an epoch counter moving from `before` to `after` crossed a multiple of `interval`
fn crossed(before: u32, after: u32, interval: u32) -> bool {
    interval > 0 && before / interval != after / interval
}

fn resume_path(config: &Config) -> Option<PathBuf> {
    match config.checkpoint.resume_from.as_str() {
        "" => None,
        "latest" => persist::find_latest_checkpoint(&config.checkpoint.path),
        path => Some(PathBuf::from(path)),
    }
}

fn build_grid(config: &Config) -> Result<WorldGrid, Box<dyn Error>> {
    let mut grid = WorldGrid::new(config.world.clone())?;

    if let Some(path) = resume_path(config) {
        grid.load_from(&path)?;
        log::info!(
            "resumed from {} at epoch {} ({}x{})",
            path.display(),
            grid.epoch(),
            grid.width(),
            grid.height()
        );
        if grid.params() != &config.world {
            log::warn!("checkpoint parameters differ from the config, using the checkpoint's");
        }
        return Ok(grid);
    }
    if config.checkpoint.resume_from == "latest" {
        log::warn!("no checkpoint found in {}, starting fresh", config.checkpoint.path);
    }

    grid.reset_with(config.world.seed, config.run.init);
    for seed in &config.seeds {
        grid.set_cell(seed.x, seed.y, &seed.to_program()?)?;
    }
    Ok(grid)
}

fn log_samples(grid: &WorldGrid) {
    for (i, cell) in grid.cells().iter().take(SAMPLE_TAPES).enumerate() {
        log::info!("  [{:>3}] {}", i, tape_to_string(&cell.tape));
    }
}

fn log_metrics(grid: &WorldGrid, config: &Config, stats_log: &mut StatsLog) {
    let soup = SoupStats::collect(grid);
    let ratio = stats::compression_ratio(grid, config.metrics.brotli_quality);
    log::info!(
        "epoch {}: ratio {:.3}, h0 {:.3}, instructions {:.1}%, live {}/{}, top {}",
        soup.epoch,
        ratio,
        soup.h0,
        soup.instruction_fraction * 100.0,
        soup.live_tapes(),
        soup.total_tapes,
        soup.top_bytes_string()
    );
    if let Err(e) = stats_log.record(&soup, ratio) {
        log::warn!("could not write metrics row: {}", e);
    }
}

fn run(config: &Config) -> Result<(), Box<dyn Error>> {
    let mut grid = build_grid(config)?;
    let params = grid.params().clone();

    log::info!("Cell Soup Simulation");
    log::info!(
        "  grid {}x{} ({} cells), seed {}",
        params.width,
        params.height,
        params.num_cells(),
        params.seed
    );
    log::info!(
        "  max_steps {}, max_dist {}, mutation rate {}, {} shuffle",
        params.max_steps,
        params.max_dist,
        params.background_mutation_rate,
        if params.fixed_shuffle { "fixed" } else { "random" }
    );
    log::info!(
        "  epochs {} (speed {}), {} threads",
        config.run.epochs,
        config.run.speed,
        rayon::current_num_threads()
    );
    log_samples(&grid);

    let metrics_file = if config.metrics.output_file.is_empty() {
        None
    } else {
        Some(Path::new(&config.metrics.output_file))
    };
    let mut stats_log = StatsLog::open(metrics_file.filter(|_| config.metrics.enabled))?;
    let mut writer = config.checkpoint.enabled.then(CheckpointWriter::new);

    let start = Instant::now();
    let start_epoch = grid.epoch();
    let mut total = ComputeSummary::default();
    let mut report_start = Instant::now();
    let mut report_epoch = grid.epoch();

    while grid.epoch() < config.run.epochs {
        let before = grid.epoch();
        let batch = config.run.speed.min(config.run.epochs - before);
        let summary = grid.compute(batch);
        total.merge(&summary);
        let after = grid.epoch();

        if crossed(before, after, config.run.report_interval) {
            let elapsed = report_start.elapsed().as_secs_f64();
            let rate = (after - report_epoch) as f64 / elapsed.max(1e-9);
            log::info!(
                "epoch {}: {:.1} epochs/s, {} pairs, {} ops, {} mutations, {} dropped claims",
                after,
                rate,
                summary.interactions,
                summary.ops,
                summary.mutations,
                summary.dropped_claims
            );
            log_samples(&grid);
            report_start = Instant::now();
            report_epoch = after;
        }

        if config.metrics.enabled && crossed(before, after, config.metrics.interval) {
            log_metrics(&grid, config, &mut stats_log);
        }

        if let Some(w) = writer.as_ref() {
            if crossed(before, after, config.checkpoint.interval) {
                w.save(&grid, persist::checkpoint_filename(&config.checkpoint.path, after));
            }
        }
    }

    if let Some(mut w) = writer.take() {
        w.save(&grid, persist::checkpoint_filename(&config.checkpoint.path, grid.epoch()));
        let failures = w.shutdown();
        if failures > 0 {
            log::warn!("{} checkpoint writes failed", failures);
        }
    }

    if config.metrics.enabled {
        log_metrics(&grid, config, &mut stats_log);
    }

    let elapsed = start.elapsed().as_secs_f64();
    log::info!(
        "Simulation complete: {} epochs in {:.2}s ({} interactions, {} solo runs, {} halted)",
        grid.epoch() - start_epoch,
        elapsed,
        total.interactions,
        total.solo_runs,
        total.halted
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match parse_args() {
        Ok(Command::Run(config)) => config,
        Ok(Command::Exit) => return ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crossed() {
        assert!(crossed(0, 16, 16));
        assert!(crossed(10, 20, 16));
        assert!(!crossed(16, 31, 16));
        assert!(!crossed(0, 100, 0));
    }

    #[test]
    fn test_parse_value() {
        let argv: Vec<String> = ["prog", "--seed", "12", "--width", "x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(parse_value::<u64>(&argv, 2, "--seed"), Ok(12));
        assert!(parse_value::<u32>(&argv, 4, "--width").is_err());
        assert!(parse_value::<u32>(&argv, 5, "--width").is_err());
    }
}
