//! Collective operations between the ranks that share the particle data.

use crate::error::{ParticleError, Result};
use crate::particle::Particle;

/// A particle addressed to its destination (level, box).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Routed {
    pub level: usize,
    pub box_index: usize,
    pub particle: Particle,
}

/// Blocking collectives used by redistribution and reductions.
///
/// Every rank must call each collective in the same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn n_ranks(&self) -> usize;

    /// All-to-all exchange. `outgoing[r]` goes to rank `r`; the return value
    /// is everything addressed to this rank (including what it sent itself).
    fn exchange(&self, outgoing: Vec<Vec<Routed>>) -> Result<Vec<Routed>>;

    fn all_reduce_min(&self, value: f64) -> f64;

    fn all_reduce_sum(&self, value: f64) -> f64;

    /// The rank that prints run summaries.
    fn is_io_rank(&self) -> bool {
        self.rank() == 0
    }
}

/// A run with exactly one rank.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn n_ranks(&self) -> usize {
        1
    }

    fn exchange(&self, outgoing: Vec<Vec<Routed>>) -> Result<Vec<Routed>> {
        let mut batches = outgoing.into_iter();
        let mine = batches.next().unwrap_or_default();
        if let Some((r, _)) = batches.enumerate().find(|(_, b)| !b.is_empty()) {
            return Err(ParticleError::invariant(format!(
                "particles addressed to rank {} but the run has a single rank",
                r + 1
            )));
        }
        Ok(mine)
    }

    fn all_reduce_min(&self, value: f64) -> f64 {
        value
    }

    fn all_reduce_sum(&self, value: f64) -> f64 {
        value
    }
}
