//! The set of particle containers a run owns, one entry per species.

use log::debug;

use crate::container::SpeciesContainer;
use crate::error::{ParticleError, Result};
use crate::species::{Role, SpeciesKind};

/// Active container of one species plus its proxy containers, which exist
/// only when the hierarchy subcycles.
#[derive(Clone, Debug)]
pub struct SpeciesEntry {
    pub active: SpeciesContainer,
    pub virtuals: Option<SpeciesContainer>,
    pub ghosts: Option<SpeciesContainer>,
}

impl SpeciesEntry {
    pub fn kind(&self) -> SpeciesKind {
        self.active.kind()
    }

    pub fn container(&self, role: Role) -> Option<&SpeciesContainer> {
        match role {
            Role::Active => Some(&self.active),
            Role::Virtual => self.virtuals.as_ref(),
            Role::Ghost => self.ghosts.as_ref(),
        }
    }

    pub fn container_mut(&mut self, role: Role) -> Option<&mut SpeciesContainer> {
        match role {
            Role::Active => Some(&mut self.active),
            Role::Virtual => self.virtuals.as_mut(),
            Role::Ghost => self.ghosts.as_mut(),
        }
    }
}

/// Containers in registration order. At most one entry per species.
#[derive(Clone, Debug, Default)]
pub struct ContainerRegistry {
    entries: Vec<SpeciesEntry>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the containers of `kind`. Registering a species twice is an
    /// invariant violation.
    pub fn register(&mut self, kind: SpeciesKind, with_proxies: bool) -> Result<&mut SpeciesEntry> {
        if self.contains(kind) {
            return Err(ParticleError::invariant(format!(
                "a {kind} particle container already exists"
            )));
        }
        let proxy = |role| with_proxies.then(|| SpeciesContainer::new(kind, role));
        self.entries.push(SpeciesEntry {
            active: SpeciesContainer::new(kind, Role::Active),
            virtuals: proxy(Role::Virtual),
            ghosts: proxy(Role::Ghost),
        });
        debug!("registered {kind} particle containers (proxies: {with_proxies})");
        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }

    pub fn contains(&self, kind: SpeciesKind) -> bool {
        self.entries.iter().any(|e| e.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, kind: SpeciesKind) -> Option<&SpeciesEntry> {
        self.entries.iter().find(|e| e.kind() == kind)
    }

    pub fn get_mut(&mut self, kind: SpeciesKind) -> Option<&mut SpeciesEntry> {
        self.entries.iter_mut().find(|e| e.kind() == kind)
    }

    pub fn active(&self, kind: SpeciesKind) -> Option<&SpeciesContainer> {
        self.get(kind).map(|e| &e.active)
    }

    pub fn active_mut(&mut self, kind: SpeciesKind) -> Option<&mut SpeciesContainer> {
        self.get_mut(kind).map(|e| &mut e.active)
    }

    pub fn entries(&self) -> &[SpeciesEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [SpeciesEntry] {
        &mut self.entries
    }

    /// Every existing container with the given role.
    pub fn containers(&self, role: Role) -> impl Iterator<Item = &SpeciesContainer> + '_ {
        self.entries.iter().filter_map(move |e| e.container(role))
    }

    pub fn containers_mut(&mut self, role: Role) -> impl Iterator<Item = &mut SpeciesContainer> + '_ {
        self.entries.iter_mut().filter_map(move |e| e.container_mut(role))
    }

    /// Release every container. Returns how many were released.
    pub fn teardown(&mut self) -> usize {
        let released: usize = self
            .entries
            .iter()
            .map(|e| 1 + usize::from(e.virtuals.is_some()) + usize::from(e.ghosts.is_some()))
            .sum();
        self.entries.clear();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_species_is_invariant_violation() {
        let mut reg = ContainerRegistry::new();
        reg.register(SpeciesKind::DarkMatter, true).unwrap();
        let err = reg.register(SpeciesKind::DarkMatter, false).unwrap_err();
        assert!(matches!(err, ParticleError::Invariant(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_roles() {
        let mut reg = ContainerRegistry::new();
        reg.register(SpeciesKind::DarkMatter, true).unwrap();
        reg.register(SpeciesKind::Agn, false).unwrap();
        assert_eq!(reg.containers(Role::Active).count(), 2);
        assert_eq!(reg.containers(Role::Virtual).count(), 1);
        assert!(reg
            .containers(Role::Ghost)
            .all(|c| c.role() == Role::Ghost && c.kind() == SpeciesKind::DarkMatter));
        assert_eq!(reg.teardown(), 4);
        assert!(reg.is_empty());
    }
}
