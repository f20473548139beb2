//! Run configuration (can be loaded from YAML)

use crate::error::WorldError;
use crate::programs::Program;
use crate::stats::DEFAULT_BROTLI_QUALITY;
use crate::world::{TapeFill, WorldParams};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Simulation configuration. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Grid and per-epoch parameters
    pub world: WorldParams,
    /// Run length and initial soup
    pub run: RunConfig,
    /// Programs written into the grid before the first epoch
    pub seeds: Vec<SeedProgram>,
    pub checkpoint: CheckpointConfig,
    /// Soup statistics (compression ratio tracking)
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Epochs to run in total (counted from epoch 0, so a resumed run stops at the same point)
    pub epochs: u32,
    /// Epochs per `compute` call
    pub speed: u32,
    /// Initial tape contents
    pub init: TapeFill,
    /// Log progress every N epochs (0 = never)
    pub report_interval: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epochs: 10_000,
            speed: 16,
            init: TapeFill::Random,
            report_interval: 256,
        }
    }
}

/// A program placed at `(x, y)` before the run starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedProgram {
    pub x: i32,
    pub y: i32,
    /// Built-in program id, used when `code` is empty
    pub program: i32,
    /// Literal tape text
    pub code: String,
}

impl Default for SeedProgram {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            program: 1,
            code: String::new(),
        }
    }
}

impl SeedProgram {
    pub fn to_program(&self) -> Result<Program, WorldError> {
        if self.code.is_empty() {
            Program::from_id(self.program).ok_or(WorldError::UnknownProgram(self.program))
        } else {
            Ok(Program::parse(&self.code))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Enable checkpointing
    pub enabled: bool,
    /// Save checkpoint every N epochs (0 = only at end)
    pub interval: u32,
    /// Directory for checkpoint files
    pub path: String,
    /// Resume from this checkpoint file (empty = start fresh, "latest" = newest in `path`)
    pub resume_from: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 10_000,
            path: "checkpoints".to_string(),
            resume_from: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    /// Collect metrics every N epochs
    pub interval: u32,
    /// CSV output file (optional, metrics are always logged)
    pub output_file: String,
    /// Brotli compression quality (1-11, lower = faster)
    pub brotli_quality: u32,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 1000,
            output_file: String::new(),
            brotli_quality: DEFAULT_BROTLI_QUALITY,
        }
    }
}

impl Config {
    /// Load config from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Save config to a YAML file
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Generate a template config file
    pub fn write_template<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            seeds: vec![SeedProgram::default()],
            ..Config::default()
        };
        config.to_yaml(path)
    }

    /// Validate configuration and return warnings.
    /// Returns Err if there are fatal configuration errors.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        let world = &self.world;

        world.validate().map_err(|e| e.to_string())?;

        if self.run.speed == 0 {
            return Err("run.speed must be greater than 0".to_string());
        }
        if self.run.epochs == 0 {
            warnings.push("run.epochs is 0, nothing will be computed".to_string());
        }

        if world.max_steps == 0 {
            warnings.push("max_steps is 0, tapes will only change through mutation".to_string());
        }

        // The window covers the whole torus; pairing stays valid but locality is lost.
        let min_dim = world.width.min(world.height);
        if world.max_dist > 0 && world.max_dist * 2 + 1 >= min_dim {
            warnings.push(format!(
                "max_dist {} spans the whole {}x{} grid, interactions are no longer local",
                world.max_dist, world.width, world.height
            ));
        }

        for (i, seed) in self.seeds.iter().enumerate() {
            if seed.x < 0 || seed.y < 0 || seed.x as u32 >= world.width || seed.y as u32 >= world.height {
                return Err(format!(
                    "seeds[{}] at ({}, {}) is outside the {}x{} grid",
                    i, seed.x, seed.y, world.width, world.height
                ));
            }
            seed.to_program()
                .map_err(|e| format!("seeds[{}]: {}", i, e))?;
        }

        if self.checkpoint.enabled {
            if self.checkpoint.path.is_empty() {
                return Err("checkpoint.path must be set when checkpointing is enabled".to_string());
            }
            if self.checkpoint.interval == 0 {
                warnings.push("checkpoint.interval is 0, only the final state will be saved".to_string());
            } else if self.checkpoint.interval % self.run.speed != 0 {
                warnings.push(format!(
                    "checkpoint.interval {} is not a multiple of run.speed {}, checkpoints land on the next batch boundary",
                    self.checkpoint.interval, self.run.speed
                ));
            }
        }

        if self.metrics.enabled {
            if self.metrics.interval == 0 {
                return Err("metrics.interval must be greater than 0".to_string());
            }
            if !(1..=11).contains(&self.metrics.brotli_quality) {
                warnings.push(format!(
                    "metrics.brotli_quality {} is outside 1-11 and will be clamped",
                    self.metrics.brotli_quality
                ));
            }
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let warnings = Config::default().validate().unwrap();
        assert!(warnings.is_empty(), "{:?}", warnings);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = Config::from_yaml_str(
            "world:\n  width: 32\n  height: 16\n  seed: 7\nrun:\n  epochs: 50\n",
        )
        .unwrap();
        assert_eq!(config.world.width, 32);
        assert_eq!(config.world.height, 16);
        assert_eq!(config.world.seed, 7);
        assert_eq!(config.world.max_dist, WorldParams::default().max_dist);
        assert_eq!(config.run.epochs, 50);
        assert_eq!(config.run.speed, RunConfig::default().speed);
        assert!(!config.checkpoint.enabled);
    }

    #[test]
    fn test_seeds_and_init() {
        let yaml = "run:\n  init: zero\nseeds:\n  - x: 3\n    y: 4\n  - x: 1\n    y: 1\n    code: \"[.>}]\"\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.run.init, TapeFill::Zero);
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.seeds[0].to_program().unwrap(), Program::Replicator);
        assert!(matches!(config.seeds[1].to_program().unwrap(), Program::Tape(_)));
    }

    #[test]
    fn test_bad_yaml() {
        assert!(matches!(
            Config::from_yaml_str("world: [1, 2"),
            Err(ConfigError::Yaml(_))
        ));
        assert!(matches!(
            Config::from_yaml_str("world:\n  width: -4\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Config::from_yaml(dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_template_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        Config::write_template(&path).unwrap();
        let loaded = Config::from_yaml(&path).unwrap();
        assert_eq!(loaded.seeds, vec![SeedProgram::default()]);
        assert_eq!(loaded.world, WorldParams::default());
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_validate_errors() {
        let mut config = Config::default();
        config.world.width = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.run.speed = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.world.background_mutation_rate = -0.1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.seeds.push(SeedProgram {
            x: config.world.width as i32,
            ..SeedProgram::default()
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.seeds.push(SeedProgram {
            program: 42,
            ..SeedProgram::default()
        });
        assert!(config.validate().unwrap_err().contains("unknown program id 42"));

        let mut config = Config::default();
        config.metrics.enabled = true;
        config.metrics.interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = Config::default();
        config.world.width = 20;
        config.world.height = 20;
        config.world.max_dist = 10;
        config.world.max_steps = 0;
        config.checkpoint.enabled = true;
        config.checkpoint.interval = 0;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 3, "{:?}", warnings);
    }
}
