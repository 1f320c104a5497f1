//! Error types for amr-particles.
//!
//! Every variant except the soft warnings (which are only logged) is fatal to
//! a run: callers propagate them to the driver, which reports and exits.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParticleError {
    /// Contradictory, missing or out-of-range configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A programming error such as building a second container for a species.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed particle file {path}: {msg} (at {location})")]
    Parse {
        path: PathBuf,
        location: usize,
        msg: String,
    },

    /// The sampled field does not cover the interpolation stencil of a particle.
    #[error("particle at ({x}, {y}, {z}) on level {level} lies outside the sampled field")]
    FieldOutOfRange {
        level: usize,
        x: f64,
        y: f64,
        z: f64,
    },
}

impl ParticleError {
    pub fn config(msg: impl Into<String>) -> Self {
        ParticleError::Config(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        ParticleError::Invariant(msg.into())
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, location: usize, msg: impl Into<String>) -> Self {
        ParticleError::Parse {
            path: path.into(),
            location,
            msg: msg.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParticleError>;
