use std::path::PathBuf;
use std::str::FromStr;

use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::error::{ParticleError, Result};

/// How the dark-matter container is populated at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitMode {
    Random,
    RandomPerBox,
    AsciiFile,
    BinaryFile,
    BinaryMetaFile,
}

impl FromStr for InitMode {
    type Err = ParticleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Random" => Ok(InitMode::Random),
            "RandomPerBox" => Ok(InitMode::RandomPerBox),
            "AsciiFile" => Ok(InitMode::AsciiFile),
            "BinaryFile" => Ok(InitMode::BinaryFile),
            "BinaryMetaFile" => Ok(InitMode::BinaryMetaFile),
            other => Err(ParticleError::config(format!(
                "not a valid input for particle_init_type: {other:?}"
            ))),
        }
    }
}

/// How particles move each step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePolicy {
    /// Kick-drift-kick in the solved gravitational field.
    Gravitational,
    /// Uncorrelated random walk, coarsest level only.
    Random,
}

impl FromStr for MovePolicy {
    type Err = ParticleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Gravitational" => Ok(MovePolicy::Gravitational),
            "Random" => Ok(MovePolicy::Random),
            other => Err(ParticleError::config(format!(
                "not a valid input for particle_move_type: {other:?}"
            ))),
        }
    }
}

/// A fully validated initialization request.
#[derive(Clone, Debug, PartialEq)]
pub enum InitSpec {
    Random {
        count: u64,
        seed: u64,
        mass: f64,
        serialize: bool,
    },
    RandomPerBox {
        count_per_box: u64,
        seed: u64,
        mass: f64,
    },
    AsciiFile {
        path: PathBuf,
        replicate: IVec3,
    },
    BinaryFile {
        path: PathBuf,
    },
    BinaryMetaFile {
        path: PathBuf,
    },
}

/// Particle options, named after the run-file keys they come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleConfig {
    pub do_dm_particles: bool,
    pub do_agn_particles: bool,
    pub do_neutrino_particles: bool,
    pub particle_init_type: String,
    pub particle_move_type: String,
    pub particle_initrandom_count: i64,
    pub particle_initrandom_count_per_box: i64,
    pub particle_initrandom_mass: f64,
    pub particle_initrandom_iseed: i64,
    pub particle_initrandom_serialize: bool,
    pub ascii_particle_file: String,
    pub binary_particle_file: String,
    pub agn_particle_file: String,
    pub neutrino_particle_file: String,
    /// Fraction of a cell a particle may cross in one step.
    pub cfl: f64,
    pub neutrino_cfl: f64,
    /// Speed of light squared for the neutrino Lorentz factor.
    pub neutrino_c_squared: f64,
    /// 0 silent, 1 summaries, 2 per-level detail.
    pub verbose: u32,
    pub replicate: [i32; 3],
    /// ASCII dump written after a restart, if non-empty.
    pub particle_output_file: String,
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            do_dm_particles: false,
            do_agn_particles: false,
            do_neutrino_particles: false,
            particle_init_type: String::new(),
            particle_move_type: "Gravitational".to_string(),
            particle_initrandom_count: 0,
            particle_initrandom_count_per_box: 0,
            particle_initrandom_mass: 0.0,
            particle_initrandom_iseed: 0,
            particle_initrandom_serialize: false,
            ascii_particle_file: String::new(),
            binary_particle_file: String::new(),
            agn_particle_file: String::new(),
            neutrino_particle_file: String::new(),
            cfl: 0.5,
            neutrino_cfl: 0.5,
            neutrino_c_squared: 1.0,
            verbose: 1,
            replicate: [1, 1, 1],
            particle_output_file: String::new(),
        }
    }
}

impl ParticleConfig {
    pub fn move_policy(&self) -> Result<MovePolicy> {
        self.particle_move_type.parse()
    }

    pub fn replication(&self) -> IVec3 {
        IVec3::from_array(self.replicate)
    }

    /// Validate the dark-matter initialization options and resolve them.
    pub fn init_spec(&self) -> Result<InitSpec> {
        let mode: InitMode = self.particle_init_type.parse()?;

        if !self.ascii_particle_file.is_empty() && mode != InitMode::AsciiFile {
            return Err(ParticleError::config(
                "particle_init_type is not AsciiFile but you specified ascii_particle_file",
            ));
        }
        if !self.binary_particle_file.is_empty()
            && !matches!(mode, InitMode::BinaryFile | InitMode::BinaryMetaFile)
        {
            return Err(ParticleError::config(
                "particle_init_type is not BinaryFile or BinaryMetaFile but you specified binary_particle_file",
            ));
        }

        match mode {
            InitMode::Random => Ok(InitSpec::Random {
                count: positive("particle_initrandom_count", self.particle_initrandom_count)?,
                seed: positive("particle_initrandom_iseed", self.particle_initrandom_iseed)?,
                mass: self.random_mass()?,
                serialize: self.particle_initrandom_serialize,
            }),
            InitMode::RandomPerBox => Ok(InitSpec::RandomPerBox {
                count_per_box: positive(
                    "particle_initrandom_count_per_box",
                    self.particle_initrandom_count_per_box,
                )?,
                seed: positive("particle_initrandom_iseed", self.particle_initrandom_iseed)?,
                mass: self.random_mass()?,
            }),
            InitMode::AsciiFile => Ok(InitSpec::AsciiFile {
                path: required_path("ascii_particle_file", &self.ascii_particle_file)?,
                replicate: self.replication(),
            }),
            InitMode::BinaryFile => Ok(InitSpec::BinaryFile {
                path: required_path("binary_particle_file", &self.binary_particle_file)?,
            }),
            InitMode::BinaryMetaFile => Ok(InitSpec::BinaryMetaFile {
                path: required_path("binary_particle_file", &self.binary_particle_file)?,
            }),
        }
    }

    fn random_mass(&self) -> Result<f64> {
        if self.particle_initrandom_mass > 0.0 {
            Ok(self.particle_initrandom_mass)
        } else {
            Err(ParticleError::config(format!(
                "particle_initrandom_mass must be > 0, got {}",
                self.particle_initrandom_mass
            )))
        }
    }

    /// Check everything that does not depend on the initialization mode.
    pub fn validate(&self, run: &RunConfig) -> Result<()> {
        let any_species = self.do_dm_particles || self.do_agn_particles || self.do_neutrino_particles;
        if any_species && self.move_policy()? == MovePolicy::Gravitational && !run.do_grav {
            return Err(ParticleError::config(
                "doesn't make sense to have do_grav = false but particle_move_type = Gravitational",
            ));
        }
        if self.cfl <= 0.0 {
            return Err(ParticleError::config(format!("particle cfl must be > 0, got {}", self.cfl)));
        }
        if self.do_neutrino_particles && self.neutrino_cfl <= 0.0 {
            return Err(ParticleError::config(format!(
                "neutrino cfl must be > 0, got {}",
                self.neutrino_cfl
            )));
        }
        if self.neutrino_c_squared <= 0.0 {
            return Err(ParticleError::config("neutrino_c_squared must be > 0"));
        }
        if self.replicate.iter().any(|&n| n < 1) {
            return Err(ParticleError::config(format!(
                "replicate factors must be >= 1, got {:?}",
                self.replicate
            )));
        }
        let ascii = self.particle_init_type == "AsciiFile";
        if !self.agn_particle_file.is_empty() && !ascii {
            return Err(ParticleError::config(
                "particle_init_type is not AsciiFile but you specified agn_particle_file",
            ));
        }
        if !self.neutrino_particle_file.is_empty()
            && !matches!(self.particle_init_type.as_str(), "AsciiFile" | "BinaryFile")
        {
            return Err(ParticleError::config(
                "particle_init_type is not AsciiFile or BinaryFile but you specified neutrino_particle_file",
            ));
        }
        if self.do_neutrino_particles
            && !matches!(self.particle_init_type.as_str(), "AsciiFile" | "BinaryFile")
        {
            return Err(ParticleError::config(
                "neutrino particles can only be initialized from an ascii or binary file",
            ));
        }
        if self.do_dm_particles {
            self.init_spec()?;
        }
        Ok(())
    }
}

/// Which physics the run carries alongside the particles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub do_hydro: bool,
    pub do_grav: bool,
    pub do_reflux: bool,
    /// Advance only the calling level even when finer levels don't subcycle.
    pub strict_subcycling: bool,
    pub verbose: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            do_hydro: false,
            do_grav: true,
            do_reflux: true,
            strict_subcycling: false,
            verbose: 1,
        }
    }
}

fn positive(name: &str, value: i64) -> Result<u64> {
    if value > 0 {
        Ok(value as u64)
    } else {
        Err(ParticleError::config(format!("{name} must be > 0, got {value}")))
    }
}

fn required_path(name: &str, value: &str) -> Result<PathBuf> {
    if value.is_empty() {
        Err(ParticleError::config(format!("{name} must be set for this particle_init_type")))
    } else {
        Ok(PathBuf::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_config() -> ParticleConfig {
        ParticleConfig {
            do_dm_particles: true,
            particle_init_type: "Random".into(),
            particle_initrandom_count: 1000,
            particle_initrandom_iseed: 42,
            particle_initrandom_mass: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_values() {
        let config = ParticleConfig::default();
        assert_eq!(config.cfl, 0.5);
        assert_eq!(config.verbose, 1);
        assert_eq!(config.replicate, [1, 1, 1]);
        assert_eq!(config.move_policy().unwrap(), MovePolicy::Gravitational);
    }

    #[test]
    fn test_random_spec() {
        let spec = random_config().init_spec().unwrap();
        assert_eq!(
            spec,
            InitSpec::Random {
                count: 1000,
                seed: 42,
                mass: 1.0,
                serialize: false
            }
        );
    }

    #[test]
    fn test_rejects_non_positive_seed() {
        let config = ParticleConfig {
            particle_initrandom_iseed: 0,
            ..random_config()
        };
        assert!(matches!(config.init_spec(), Err(ParticleError::Config(_))));
    }

    #[test]
    fn test_rejects_file_for_random_mode() {
        let config = ParticleConfig {
            ascii_particle_file: "particles.txt".into(),
            ..random_config()
        };
        assert!(matches!(config.init_spec(), Err(ParticleError::Config(_))));
    }

    #[test]
    fn test_unknown_mode() {
        let config = ParticleConfig {
            particle_init_type: "Uniform".into(),
            ..random_config()
        };
        assert!(matches!(config.init_spec(), Err(ParticleError::Config(_))));
    }

    #[test]
    fn test_gravitational_requires_gravity() {
        let run = RunConfig {
            do_grav: false,
            ..Default::default()
        };
        assert!(random_config().validate(&run).is_err());

        let random_walk = ParticleConfig {
            particle_move_type: "Random".into(),
            ..random_config()
        };
        assert!(random_walk.validate(&run).is_ok());
    }

    #[test]
    fn test_rejects_zero_cfl() {
        let config = ParticleConfig {
            cfl: 0.0,
            ..random_config()
        };
        assert!(config.validate(&RunConfig::default()).is_err());
    }
}
