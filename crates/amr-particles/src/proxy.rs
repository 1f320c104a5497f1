//! Virtual and ghost particles: read-only copies that let a level's field
//! solve and deposition see mass owned by neighbouring levels.
//!
//! Virtual particles at level `L` stand in for every particle on levels finer
//! than `L`. Ghost particles at level `L + 1` are copies of level-`L` particles
//! near the coarse/fine interface.

use log::debug;

use crate::amr::AmrHierarchy;
use crate::registry::ContainerRegistry;

/// Builds and removes proxy particles, tracking which levels already hold a
/// virtual set for the current advance.
#[derive(Clone, Debug, Default)]
pub struct ProxyFactory {
    virtuals_built: Vec<bool>,
}

impl ProxyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn virtuals_built(&self, level: usize) -> bool {
        self.virtuals_built.get(level).copied().unwrap_or(false)
    }

    fn mark(&mut self, level: usize, built: bool) {
        if self.virtuals_built.len() <= level {
            self.virtuals_built.resize(level + 1, false);
        }
        self.virtuals_built[level] = built;
    }

    /// Build virtual particles at `level` from everything finer, finest
    /// levels first. Does nothing if `level` is already built.
    pub fn setup_virtual_particles(
        &mut self,
        registry: &mut ContainerRegistry,
        hierarchy: &AmrHierarchy,
        level: usize,
    ) {
        if self.virtuals_built(level) {
            return;
        }
        if level < hierarchy.finest_level() {
            self.setup_virtual_particles(registry, hierarchy, level + 1);
            for entry in registry.entries_mut() {
                let Some(virtuals) = entry.virtuals.as_mut() else {
                    continue;
                };
                let mut copies = virtuals.create_virtual_particles(level + 1);
                copies.extend(entry.active.create_virtual_particles(level + 1));
                let n = copies.len();
                virtuals.add_particles_at_level(copies, level, hierarchy, 0);
                debug!("{n} {} virtual particles at level {level}", entry.active.kind());
            }
        }
        self.mark(level, true);
    }

    pub fn remove_virtual_particles(&mut self, registry: &mut ContainerRegistry, level: usize) {
        for entry in registry.entries_mut() {
            if let Some(v) = entry.virtuals.as_mut() {
                v.remove_particles_at_level(level);
            }
        }
        self.mark(level, false);
    }

    /// Copy level-`level` particles within `n_grow` fine cells of level
    /// `level + 1` into the ghost containers at `level + 1`, replacing any
    /// ghosts already there.
    pub fn setup_ghost_particles(
        &self,
        registry: &mut ContainerRegistry,
        hierarchy: &AmrHierarchy,
        level: usize,
        n_grow: i32,
    ) {
        if level >= hierarchy.finest_level() {
            return;
        }
        for entry in registry.entries_mut() {
            let Some(ghosts) = entry.ghosts.as_mut() else {
                continue;
            };
            let copies = entry.active.create_ghost_particles(hierarchy, level, n_grow);
            ghosts.remove_particles_at_level(level + 1);
            ghosts.add_particles_at_level(copies, level + 1, hierarchy, n_grow);
        }
    }

    /// Drop the ghosts that `setup_ghost_particles(level)` created.
    pub fn remove_ghost_particles(&self, registry: &mut ContainerRegistry, level: usize) {
        for entry in registry.entries_mut() {
            if let Some(g) = entry.ghosts.as_mut() {
                g.remove_particles_at_level(level + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amr::{BoxArray, DistributionMap, Geometry, IndexBox};
    use crate::particle::Particle;
    use crate::species::{Role, SpeciesKind};
    use glam::{DVec3, IVec3};

    fn three_levels() -> AmrHierarchy {
        let mut h = AmrHierarchy::single_box(Geometry::unit_periodic(8)).unwrap();
        let l1 = IndexBox::new(IVec3::splat(4), IVec3::splat(11));
        h.push_level(2, BoxArray::single(l1), DistributionMap::new(vec![0]))
            .unwrap();
        let l2 = IndexBox::new(IVec3::splat(12), IVec3::splat(19));
        h.push_level(2, BoxArray::single(l2), DistributionMap::new(vec![0]))
            .unwrap();
        h
    }

    fn registry_with(h: &AmrHierarchy) -> ContainerRegistry {
        let mut reg = ContainerRegistry::new();
        let entry = reg.register(SpeciesKind::DarkMatter, true).unwrap();
        let p = |id, x: f64| Particle::new(id, DVec3::splat(x), DVec3::ZERO, 1.0);
        entry.active.add_particles_at_level(vec![p(1, 0.1)], 0, h, 0);
        entry.active.add_particles_at_level(vec![p(2, 0.4), p(3, 0.65)], 1, h, 0);
        entry.active.add_particles_at_level(vec![p(4, 0.5)], 2, h, 0);
        reg
    }

    fn virtual_count(reg: &ContainerRegistry, level: usize) -> usize {
        reg.containers(Role::Virtual)
            .map(|c| c.num_particles_at_level(level))
            .sum()
    }

    #[test]
    fn test_virtuals_cover_all_finer_levels() {
        let h = three_levels();
        let mut reg = registry_with(&h);
        let mut proxies = ProxyFactory::new();
        proxies.setup_virtual_particles(&mut reg, &h, 0);
        assert_eq!(virtual_count(&reg, 1), 1);
        assert_eq!(virtual_count(&reg, 0), 3);
        assert!(proxies.virtuals_built(0) && proxies.virtuals_built(2));
    }

    #[test]
    fn test_virtual_setup_is_idempotent() {
        let h = three_levels();
        let mut reg = registry_with(&h);
        let mut proxies = ProxyFactory::new();
        proxies.setup_virtual_particles(&mut reg, &h, 0);
        let once = virtual_count(&reg, 0);
        proxies.setup_virtual_particles(&mut reg, &h, 0);
        assert_eq!(virtual_count(&reg, 0), once);

        proxies.remove_virtual_particles(&mut reg, 0);
        assert_eq!(virtual_count(&reg, 0), 0);
        assert!(!proxies.virtuals_built(0));
    }

    #[test]
    fn test_ghosts_replace_previous_set() {
        let h = three_levels();
        let mut reg = registry_with(&h);
        let proxies = ProxyFactory::new();
        proxies.setup_ghost_particles(&mut reg, &h, 1, 2);
        let first = reg.get(SpeciesKind::DarkMatter).unwrap().ghosts.as_ref().unwrap().num_particles_at_level(2);
        proxies.setup_ghost_particles(&mut reg, &h, 1, 2);
        let ghosts = reg.get(SpeciesKind::DarkMatter).unwrap().ghosts.as_ref().unwrap();
        assert_eq!(ghosts.num_particles_at_level(2), first);

        proxies.remove_ghost_particles(&mut reg, 1);
        let ghosts = reg.get(SpeciesKind::DarkMatter).unwrap().ghosts.as_ref().unwrap();
        assert_eq!(ghosts.num_particles(), 0);
    }
}
