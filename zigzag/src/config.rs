use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be at least 1, got {value}")]
    BelowOne { field: &'static str, value: usize },
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("pe_array_scaling must be a power of two from 1/8 to 4, got {0}")]
    InvalidScaling(f64),
    #[error("Could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// The metric the reducers minimize.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display,
)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Opt {
    Energy,
    #[default]
    Latency,
    Edp,
}

/// How temporal mappings are found for a spatial mapping.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display,
)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TemporalEngine {
    /// Every loop ordering, allocated bottom-up.
    #[default]
    Loma,
    /// Simulated annealing over loop orderings.
    Salsa,
}

/// Settings of the annealing temporal engine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SalsaConfig {
    /// Swaps tried per chain.
    pub iterations: usize,
    /// Cooled by a factor 0.995 per iteration.
    pub start_temperature: f64,
    pub opt: Opt,
    /// Independent chains, run on the rayon pool. The best of them wins.
    pub chains: usize,
    /// Chain `i` draws from a generator seeded with `seed + i`.
    pub seed: u64,
}

impl Default for SalsaConfig {
    fn default() -> Self {
        SalsaConfig {
            iterations: 1000,
            start_temperature: 0.05,
            opt: Opt::Energy,
            chains: 1,
            seed: 0,
        }
    }
}

/// Every knob of a design space exploration run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DseConfig {
    pub opt: Opt,
    pub lpf_limit: usize,
    pub nb_spatial_mappings_generated: usize,
    pub enable_mix_spatial_mapping_generation: bool,
    pub access_same_data_considered_as_no_access: bool,
    pub remove_unused_memory: bool,
    /// Width of the worker pool evaluating layers. 1 runs everything on the calling thread.
    pub jobs: usize,
    pub dump_folder: PathBuf,
    pub pickle_filename: PathBuf,
    pub skip_if_dump_exists: bool,
    /// Report loop ordering progress at `info` level.
    pub verbose: bool,
    pub temporal_engine: TemporalEngine,
    pub salsa: SalsaConfig,
    /// Scales every operational array dimension, and user spatial mappings with it. 1 leaves
    /// the accelerator as it is.
    pub pe_array_scaling: f64,
}

impl Default for DseConfig {
    fn default() -> Self {
        DseConfig {
            opt: Opt::default(),
            lpf_limit: 6,
            nb_spatial_mappings_generated: 3,
            enable_mix_spatial_mapping_generation: false,
            access_same_data_considered_as_no_access: true,
            remove_unused_memory: false,
            jobs: 1,
            dump_folder: PathBuf::from("outputs"),
            pickle_filename: PathBuf::from("outputs/list_of_cmes.bin"),
            skip_if_dump_exists: false,
            verbose: false,
            temporal_engine: TemporalEngine::default(),
            salsa: SalsaConfig::default(),
            pe_array_scaling: 1.0,
        }
    }
}

impl DseConfig {
    /// Reads a configuration; fields missing from the file keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let config: DseConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("lpf_limit", self.lpf_limit),
            ("nb_spatial_mappings_generated", self.nb_spatial_mappings_generated),
            ("jobs", self.jobs),
            ("salsa.iterations", self.salsa.iterations),
            ("salsa.chains", self.salsa.chains),
        ] {
            if value < 1 {
                return Err(ConfigError::BelowOne { field, value });
            }
        }
        let t = self.salsa.start_temperature;
        if t.is_nan() || t <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "salsa.start_temperature",
                value: t,
            });
        }
        if !(-3..=2).any(|e| self.pe_array_scaling == 2f64.powi(e)) {
            return Err(ConfigError::InvalidScaling(self.pe_array_scaling));
        }
        Ok(())
    }

    /// The pattern complete and simple dumps are written to; `?` stands for the dump's name.
    pub fn dump_pattern(&self) -> PathBuf {
        self.dump_folder.join("?.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"opt": "edp", "lpf_limit": 3}}"#).unwrap();
        let config = DseConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.opt, Opt::Edp);
        assert_eq!(config.lpf_limit, 3);
        assert_eq!(config.nb_spatial_mappings_generated, 3);
        assert!(config.access_same_data_considered_as_no_access);
        assert_eq!(config.pickle_filename, PathBuf::from("outputs/list_of_cmes.bin"));
    }

    #[test]
    fn test_zero_jobs_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"jobs": 0}}"#).unwrap();
        assert!(matches!(
            DseConfig::from_json_file(file.path()),
            Err(ConfigError::BelowOne { field: "jobs", value: 0 })
        ));
    }

    #[test]
    fn test_unknown_opt_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"opt": "area"}}"#).unwrap();
        assert!(matches!(
            DseConfig::from_json_file(file.path()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_salsa_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"temporal_engine": "salsa", "salsa": {{"chains": 4, "opt": "latency"}}}}"#
        )
        .unwrap();
        let config = DseConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.temporal_engine, TemporalEngine::Salsa);
        assert_eq!(config.salsa.chains, 4);
        assert_eq!(config.salsa.opt, Opt::Latency);
        assert_eq!(config.salsa.iterations, 1000);

        let cold = DseConfig {
            salsa: SalsaConfig {
                start_temperature: 0.0,
                ..SalsaConfig::default()
            },
            ..DseConfig::default()
        };
        assert!(matches!(
            cold.validate(),
            Err(ConfigError::NotPositive { field: "salsa.start_temperature", .. })
        ));
    }

    #[test]
    fn test_pe_array_scaling_is_a_power_of_two() {
        for ok in [0.125, 0.5, 1.0, 4.0] {
            let config = DseConfig {
                pe_array_scaling: ok,
                ..DseConfig::default()
            };
            assert!(config.validate().is_ok(), "{ok}");
        }
        for bad in [3.0, 8.0, 0.0625, -1.0] {
            let config = DseConfig {
                pe_array_scaling: bad,
                ..DseConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidScaling(_))
            ));
        }
    }

    #[test]
    fn test_dump_pattern() {
        let config = DseConfig {
            dump_folder: PathBuf::from("out/run1"),
            ..DseConfig::default()
        };
        assert_eq!(config.dump_pattern(), PathBuf::from("out/run1/?.json"));
        assert_eq!(Opt::Edp.to_string(), "edp");
    }
}
