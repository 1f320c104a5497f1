//! Skip particle redistribution when the domain decomposition has not
//! changed since the last one.

use log::info;

use crate::amr::{AmrHierarchy, BoxArray, DistributionMap};
use crate::comm::Communicator;
use crate::container::RedistributeStats;
use crate::error::Result;
use crate::registry::ContainerRegistry;

/// Box layout and rank map of every level, as of the last redistribution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecompositionSnapshot {
    pub boxes: Vec<BoxArray>,
    pub dmaps: Vec<DistributionMap>,
}

impl DecompositionSnapshot {
    pub fn capture(hierarchy: &AmrHierarchy) -> Self {
        Self {
            boxes: hierarchy.levels().iter().map(|l| l.boxes.clone()).collect(),
            dmaps: hierarchy.levels().iter().map(|l| l.dmap.clone()).collect(),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.boxes.len()
    }
}

/// What `maybe_redistribute` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// Redistributed unconditionally after initialization.
    Forced(RedistributeStats),
    /// The layout changed; particles were redistributed.
    Changed(RedistributeStats),
    /// Nothing changed; no particle was touched.
    Unchanged,
}

impl GateOutcome {
    pub fn stats(&self) -> Option<RedistributeStats> {
        match *self {
            GateOutcome::Forced(s) | GateOutcome::Changed(s) => Some(s),
            GateOutcome::Unchanged => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RedistributionGate {
    cached: DecompositionSnapshot,
    verbose: u32,
}

impl RedistributionGate {
    pub fn new(verbose: u32) -> Self {
        Self {
            cached: DecompositionSnapshot::default(),
            verbose,
        }
    }

    pub fn snapshot(&self) -> &DecompositionSnapshot {
        &self.cached
    }

    /// Whether the live layout differs from the cached one on any level.
    /// Resizes the cache when the number of levels changed.
    fn detect_change(&mut self, hierarchy: &AmrHierarchy) -> bool {
        let n = hierarchy.num_levels();
        let mut changed = false;
        if self.cached.num_levels() != n {
            self.cached.boxes.resize_with(n, BoxArray::default);
            self.cached.dmaps.resize_with(n, DistributionMap::default);
            changed = true;
        }
        for (l, lev) in hierarchy.levels().iter().enumerate() {
            if self.cached.boxes[l] != lev.boxes || self.cached.dmaps[l] != lev.dmap {
                changed = true;
            }
        }
        changed
    }

    /// Redistribute every active container from `from_level` up if `init`
    /// is set or the decomposition changed since the last redistribution.
    ///
    /// A forced call leaves the cache untouched, so the first ordinary call
    /// afterwards always sees a change.
    pub fn maybe_redistribute(
        &mut self,
        registry: &mut ContainerRegistry,
        hierarchy: &AmrHierarchy,
        comm: &dyn Communicator,
        from_level: usize,
        init: bool,
    ) -> Result<GateOutcome> {
        if registry.is_empty() {
            return Ok(GateOutcome::Unchanged);
        }
        if init {
            let stats = redistribute_all(registry, hierarchy, comm, from_level)?;
            return Ok(GateOutcome::Forced(stats));
        }

        if self.detect_change(hierarchy) {
            if self.verbose > 0 && comm.is_io_rank() {
                info!("Calling redistribute because changed");
            }
            let stats = redistribute_all(registry, hierarchy, comm, from_level)?;
            self.cached = DecompositionSnapshot::capture(hierarchy);
            Ok(GateOutcome::Changed(stats))
        } else {
            if self.verbose > 0 && comm.is_io_rank() {
                info!("NOT calling redistribute because NOT changed");
            }
            Ok(GateOutcome::Unchanged)
        }
    }
}

fn redistribute_all(
    registry: &mut ContainerRegistry,
    hierarchy: &AmrHierarchy,
    comm: &dyn Communicator,
    from_level: usize,
) -> Result<RedistributeStats> {
    let mut total = RedistributeStats::default();
    for entry in registry.entries_mut() {
        let s = entry.active.redistribute(hierarchy, comm, from_level)?;
        total.examined += s.examined;
        total.moved += s.moved;
        total.dropped += s.dropped;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amr::Geometry;
    use crate::comm::SerialCommunicator;
    use crate::species::SpeciesKind;

    #[test]
    fn test_forced_then_changed_then_unchanged() {
        let h = AmrHierarchy::single_box(Geometry::unit_periodic(8)).unwrap();
        let mut reg = ContainerRegistry::new();
        reg.register(SpeciesKind::DarkMatter, false).unwrap();
        let mut gate = RedistributionGate::new(0);
        let comm = SerialCommunicator;

        let out = gate.maybe_redistribute(&mut reg, &h, &comm, 0, true).unwrap();
        assert!(matches!(out, GateOutcome::Forced(_)));
        assert_eq!(gate.snapshot().num_levels(), 0);

        let out = gate.maybe_redistribute(&mut reg, &h, &comm, 0, false).unwrap();
        assert!(matches!(out, GateOutcome::Changed(_)));

        let out = gate.maybe_redistribute(&mut reg, &h, &comm, 0, false).unwrap();
        assert_eq!(out, GateOutcome::Unchanged);
    }
}
