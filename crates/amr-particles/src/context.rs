//! The simulation context: the single owner of every particle container and
//! of the state the level advance shares between calls.

use std::ops::AddAssign;
use std::path::Path;

use log::{debug, info};

use crate::amr::{AmrHierarchy, BoxArray, DistributionMap};
use crate::comm::{Communicator, SerialCommunicator};
use crate::config::{InitSpec, MovePolicy, ParticleConfig, RunConfig};
use crate::cosmology::{ScaleFactor, Static};
use crate::error::{ParticleError, Result};
use crate::gate::{GateOutcome, RedistributionGate};
use crate::gravity::{GravitySolver, SolveInputs};
use crate::io;
use crate::orchestrator::HydroSolver;
use crate::particle::Particle;
use crate::proxy::ProxyFactory;
use crate::registry::ContainerRegistry;
use crate::species::{Role, SpeciesKind};

/// Energy put into the gas by the gravity source correction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EnergyAdded {
    /// Into internal energy.
    pub e_added: f64,
    /// Into kinetic energy.
    pub ke_added: f64,
}

impl AddAssign for EnergyAdded {
    fn add_assign(&mut self, rhs: Self) {
        self.e_added += rhs.e_added;
        self.ke_added += rhs.ke_added;
    }
}

pub struct SimulationContext {
    pub(crate) run: RunConfig,
    pub(crate) particles: ParticleConfig,
    pub(crate) hierarchy: AmrHierarchy,
    pub(crate) comm: Box<dyn Communicator>,
    pub(crate) registry: ContainerRegistry,
    pub(crate) gate: RedistributionGate,
    pub(crate) proxies: ProxyFactory,
    pub(crate) gravity: Option<Box<dyn GravitySolver>>,
    pub(crate) hydro: Option<Box<dyn HydroSolver>>,
    pub(crate) cosmology: Box<dyn ScaleFactor>,
    /// Ghost cells the sampled field carries; `ncycle + 2` of the last advance.
    pub(crate) grav_n_grow: i32,
    pub(crate) energy: EnergyAdded,
    /// Finest level each level's last advance covered.
    pub(crate) finest_advanced: Vec<usize>,
}

impl SimulationContext {
    /// Validate the configuration and build an empty context.
    pub fn new(run: RunConfig, particles: ParticleConfig, hierarchy: AmrHierarchy) -> Result<Self> {
        particles.validate(&run)?;
        let gate = RedistributionGate::new(particles.verbose);
        Ok(Self {
            run,
            particles,
            hierarchy,
            comm: Box::new(SerialCommunicator),
            registry: ContainerRegistry::new(),
            gate,
            proxies: ProxyFactory::new(),
            gravity: None,
            hydro: None,
            cosmology: Box::new(Static),
            grav_n_grow: 3,
            energy: EnergyAdded::default(),
            finest_advanced: Vec::new(),
        })
    }

    pub fn with_communicator(mut self, comm: Box<dyn Communicator>) -> Self {
        self.comm = comm;
        self
    }

    pub fn with_gravity(mut self, gravity: Box<dyn GravitySolver>) -> Self {
        self.gravity = Some(gravity);
        self
    }

    pub fn with_hydro(mut self, hydro: Box<dyn HydroSolver>) -> Self {
        self.hydro = Some(hydro);
        self
    }

    pub fn with_cosmology(mut self, cosmology: Box<dyn ScaleFactor>) -> Self {
        self.cosmology = cosmology;
        self
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    pub fn particle_config(&self) -> &ParticleConfig {
        &self.particles
    }

    pub fn hierarchy(&self) -> &AmrHierarchy {
        &self.hierarchy
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ContainerRegistry {
        &mut self.registry
    }

    pub fn proxies(&self) -> &ProxyFactory {
        &self.proxies
    }

    pub fn gate(&self) -> &RedistributionGate {
        &self.gate
    }

    pub fn grav_n_grow(&self) -> i32 {
        self.grav_n_grow
    }

    pub fn energy_added(&self) -> EnergyAdded {
        self.energy
    }

    pub fn time(&self) -> f64 {
        self.hierarchy.level(0).cur_time
    }

    pub(crate) fn solve_inputs(&self) -> SolveInputs<'_> {
        SolveInputs {
            hierarchy: &self.hierarchy,
            registry: &self.registry,
            n_grow: self.grav_n_grow,
        }
    }

    fn verbose(&self) -> bool {
        self.particles.verbose > 0 && self.comm.is_io_rank()
    }

    /// Particle files are read once, on the IO rank; redistribution then
    /// hands the particles to their owners.
    fn read_on_io_rank(&self, read: impl FnOnce() -> Result<Vec<Particle>>) -> Result<Vec<Particle>> {
        if self.comm.is_io_rank() {
            read()
        } else {
            Ok(Vec::new())
        }
    }

    fn register(&mut self, kind: SpeciesKind) -> Result<()> {
        let subcycle = self.hierarchy.sub_cycle();
        let verbose = self.particles.verbose;
        let c_squared = self.particles.neutrino_c_squared;
        let entry = self.registry.register(kind, subcycle)?;
        for c in [Some(&mut entry.active), entry.virtuals.as_mut(), entry.ghosts.as_mut()]
            .into_iter()
            .flatten()
        {
            c.set_verbose(verbose);
            c.set_c_squared(c_squared);
        }
        Ok(())
    }

    /// Create the containers of every enabled species, populate them, and
    /// redistribute.
    pub fn init_particles(&mut self) -> Result<()> {
        if self.particles.do_dm_particles {
            self.register(SpeciesKind::DarkMatter)?;
            let spec = self.particles.init_spec()?;
            let particles = match &spec {
                InitSpec::Random { .. } | InitSpec::RandomPerBox { .. } => Vec::new(),
                InitSpec::AsciiFile { path, replicate } => self.read_on_io_rank(|| {
                    let ps = io::read_ascii(path, SpeciesKind::DarkMatter)?;
                    Ok(io::replicate(ps, self.hierarchy.geom(0), *replicate))
                })?,
                InitSpec::BinaryFile { path } => {
                    self.read_on_io_rank(|| io::read_binary(path, SpeciesKind::DarkMatter))?
                }
                InitSpec::BinaryMetaFile { path } => {
                    self.read_on_io_rank(|| io::read_binary_meta(path, SpeciesKind::DarkMatter))?
                }
            };

            let Some(dm) = self.registry.active_mut(SpeciesKind::DarkMatter) else {
                return Err(ParticleError::invariant("dark matter container vanished during init"));
            };
            let n = match spec {
                InitSpec::Random {
                    count,
                    seed,
                    mass,
                    serialize,
                } => {
                    if self.particles.verbose > 0 && self.comm.is_io_rank() {
                        info!("Initializing DM with cloud of {count} random particles with initial seed: {seed}");
                    }
                    dm.init_random(&self.hierarchy, self.comm.as_ref(), count, seed, mass, serialize)
                }
                InitSpec::RandomPerBox {
                    count_per_box,
                    seed,
                    mass,
                } => {
                    if self.particles.verbose > 0 && self.comm.is_io_rank() {
                        info!("Initializing DM with {count_per_box} random particles per box with initial seed: {seed}");
                    }
                    dm.init_random_per_box(&self.hierarchy, self.comm.as_ref(), count_per_box, seed, mass)
                }
                _ => dm.insert_initial(particles, &self.hierarchy),
            };
            debug!("placed {n} dark matter particles on this rank");
        }

        if self.particles.do_agn_particles {
            self.register(SpeciesKind::Agn)?;
            if !self.particles.agn_particle_file.is_empty() {
                let path = Path::new(&self.particles.agn_particle_file);
                let ps = self.read_on_io_rank(|| io::read_ascii(path, SpeciesKind::Agn))?;
                if let Some(agn) = self.registry.active_mut(SpeciesKind::Agn) {
                    agn.insert_initial(ps, &self.hierarchy);
                }
            }
        }

        if self.particles.do_neutrino_particles {
            self.register(SpeciesKind::Neutrino)?;
            if self.particles.neutrino_particle_file.is_empty() {
                return Err(ParticleError::config(
                    "neutrino particles are enabled but neutrino_particle_file is empty",
                ));
            }
            let path = Path::new(&self.particles.neutrino_particle_file);
            if self.verbose() {
                info!("Initializing Neutrino particles from {:?}", path);
            }
            let ps = match self.particles.particle_init_type.as_str() {
                "AsciiFile" => self.read_on_io_rank(|| {
                    let ps = io::read_ascii(path, SpeciesKind::Neutrino)?;
                    Ok(io::replicate(ps, self.hierarchy.geom(0), self.particles.replication()))
                })?,
                "BinaryFile" => self.read_on_io_rank(|| io::read_binary(path, SpeciesKind::Neutrino))?,
                other => {
                    return Err(ParticleError::config(format!(
                        "neutrino particles can only be initialized from an ascii or binary file, not {other:?}"
                    )))
                }
            };
            if let Some(nu) = self.registry.active_mut(SpeciesKind::Neutrino) {
                nu.insert_initial(ps, &self.hierarchy);
            }
        }

        self.particle_redistribute(0, true)?;
        Ok(())
    }

    /// Rebuild the containers from a checkpoint written by [`Self::checkpoint`].
    pub fn post_restart(&mut self, dir: &Path) -> Result<()> {
        let kinds: Vec<SpeciesKind> = [
            (self.particles.do_dm_particles, SpeciesKind::DarkMatter),
            (self.particles.do_agn_particles, SpeciesKind::Agn),
            (self.particles.do_neutrino_particles, SpeciesKind::Neutrino),
        ]
        .into_iter()
        .filter_map(|(on, kind)| on.then_some(kind))
        .collect();

        for kind in kinds {
            self.register(kind)?;
            let levels = self.read_on_io_rank(|| Ok(io::read_checkpoint(dir, kind)?.concat()))?;
            if let Some(c) = self.registry.active_mut(kind) {
                c.add_particles_at_level(levels, 0, &self.hierarchy, 0);
            }
        }
        self.particle_redistribute(0, true)?;

        if !self.particles.particle_output_file.is_empty() {
            if let Some(dm) = self.registry.active(SpeciesKind::DarkMatter) {
                io::write_ascii(Path::new(&self.particles.particle_output_file), dm)?;
            }
        }
        Ok(())
    }

    /// Write every active container under `dir`.
    pub fn checkpoint(&self, dir: &Path) -> Result<()> {
        for c in self.registry.containers(Role::Active) {
            io::write_checkpoint(dir, c)?;
        }
        Ok(())
    }

    /// Split the matter budget between particles and gas: level-0 dark
    /// matter keeps `1 - frac` of its mass.
    pub fn apply_baryon_fraction(&mut self, frac: f64) {
        if frac == 1.0 {
            return;
        }
        if let Some(dm) = self.registry.active_mut(SpeciesKind::DarkMatter) {
            dm.multiply_mass(0, 1.0 - frac);
        }
    }

    /// Redistribute from `lbase` up, skipping the exchange when the layout
    /// has not changed (unless `init`).
    pub fn particle_redistribute(&mut self, lbase: usize, init: bool) -> Result<GateOutcome> {
        self.gate
            .maybe_redistribute(&mut self.registry, &self.hierarchy, self.comm.as_ref(), lbase, init)
    }

    /// Replace the layout of `level` and bring the particles along.
    pub fn regrid(&mut self, level: usize, boxes: BoxArray, dmap: DistributionMap) -> Result<GateOutcome> {
        self.hierarchy.set_level_layout(level, boxes, dmap)?;
        self.particle_redistribute(level, false)
    }

    /// Add a finer level and move the particles it covers onto it.
    pub fn add_level(&mut self, ratio: i32, boxes: BoxArray, dmap: DistributionMap) -> Result<GateOutcome> {
        self.hierarchy.push_level(ratio, boxes, dmap)?;
        let level = self.hierarchy.finest_level();
        self.particle_redistribute(level - 1, false)
    }

    /// Solve the new-time field on every level, so the first timestep
    /// estimate has something to sample.
    pub fn init_gravity(&mut self) -> Result<()> {
        let Some(mut gravity) = self.gravity.take() else {
            return Ok(());
        };
        let finest = self.hierarchy.finest_level();
        let result = gravity.solve_new(self.solve_inputs(), 0, finest, false);
        self.gravity = Some(gravity);
        result
    }

    pub fn move_policy(&self) -> Result<MovePolicy> {
        self.particles.move_policy()
    }

    pub fn num_particles(&self) -> usize {
        self.registry
            .containers(Role::Active)
            .map(|c| c.num_particles())
            .sum()
    }

    pub fn total_particle_mass(&self) -> f64 {
        self.registry
            .containers(Role::Active)
            .map(|c| c.total_mass())
            .sum()
    }

    /// Mass the active particles deposit on the coarsest level, finer
    /// levels included.
    pub fn deposited_mass(&self) -> f64 {
        let vol = self.hierarchy.geom(0).cell_volume();
        self.registry
            .containers(Role::Active)
            .map(|c| c.assign_density(&self.hierarchy, 0)[0].valid_sum(0) * vol)
            .sum()
    }
}

impl Drop for SimulationContext {
    fn drop(&mut self) {
        let released = self.registry.teardown();
        if released > 0 {
            debug!("released {released} particle containers");
        }
    }
}
