use serde::{Deserialize, Serialize};

/// The closed set of particle species a run can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpeciesKind {
    DarkMatter,
    Agn,
    Neutrino,
}

/// What a container holds relative to the real particle data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Active,
    Virtual,
    Ghost,
}

impl SpeciesKind {
    pub const ALL: [SpeciesKind; 3] = [
        SpeciesKind::DarkMatter,
        SpeciesKind::Agn,
        SpeciesKind::Neutrino,
    ];

    /// Reals read after the position by the file initializers:
    /// mass and velocity, plus angle terms for neutrinos.
    pub fn n_file_reals(self) -> usize {
        match self {
            SpeciesKind::Neutrino => 2 * 3 + 1,
            _ => 3 + 1,
        }
    }

    /// Whether deposited density is weighted by the Lorentz factor.
    pub fn is_relativistic(self) -> bool {
        matches!(self, SpeciesKind::Neutrino)
    }

    /// Directory name of this species inside a checkpoint.
    pub fn checkpoint_tag(self) -> &'static str {
        match self {
            SpeciesKind::DarkMatter => "DM",
            SpeciesKind::Agn => "AGN",
            SpeciesKind::Neutrino => "NPC",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpeciesKind::DarkMatter => "dark matter",
            SpeciesKind::Agn => "AGN",
            SpeciesKind::Neutrino => "neutrino",
        }
    }
}

impl std::fmt::Display for SpeciesKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_its_own_checkpoint_tag() {
        let tags: Vec<&str> = SpeciesKind::ALL.iter().map(|k| k.checkpoint_tag()).collect();
        assert_eq!(tags, ["DM", "AGN", "NPC"]);
        assert_eq!(SpeciesKind::Neutrino.n_file_reals(), 7);
        assert!(!SpeciesKind::Agn.is_relativistic());
    }
}
