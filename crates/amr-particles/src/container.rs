//! Per-species particle storage across the level hierarchy.
//!
//! Particles are kept per level and, within a level, per box ("tile") of the
//! layout used at the last redistribution. Tiles never overlap, so loops over
//! the tiles of one level are independent and run in parallel with the
//! `parallel` feature.

use std::collections::BTreeMap;

use glam::DVec3;
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::amr::{AmrHierarchy, Geometry};
use crate::comm::{Communicator, Routed};
use crate::error::{ParticleError, Result};
use crate::field::MultiField;
use crate::particle::{drift, kick, Particle};
use crate::species::{Role, SpeciesKind};

type Tiles = BTreeMap<usize, Vec<Particle>>;

/// Result of one redistribution pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedistributeStats {
    /// Particles taken out of their tiles and re-placed.
    pub examined: usize,
    /// Particles whose (level, box) changed.
    pub moved: usize,
    /// Particles that left the domain or every box.
    pub dropped: usize,
}

/// One species' particles (in one role) on every level they exist on.
#[derive(Clone, Debug)]
pub struct SpeciesContainer {
    kind: SpeciesKind,
    role: Role,
    levels: Vec<Tiles>,
    next_id: u64,
    verbose: u32,
    c_squared: f64,
    rng: ChaCha8Rng,
}

fn for_each_tile<F>(tiles: &mut Tiles, f: F) -> Result<()>
where
    F: Fn(usize, &mut [Particle]) -> Result<()> + Send + Sync,
{
    #[cfg(feature = "parallel")]
    {
        tiles.par_iter_mut().try_for_each(|(b, ps)| f(*b, ps))
    }

    #[cfg(not(feature = "parallel"))]
    {
        tiles.iter_mut().try_for_each(|(b, ps)| f(*b, ps))
    }
}

fn out_of_range(level: usize, pos: DVec3) -> ParticleError {
    ParticleError::FieldOutOfRange {
        level,
        x: pos.x,
        y: pos.y,
        z: pos.z,
    }
}

impl SpeciesContainer {
    /// Empty container; levels appear as particles are placed on them.
    pub fn new(kind: SpeciesKind, role: Role) -> Self {
        Self {
            kind,
            role,
            levels: Vec::new(),
            next_id: 1,
            verbose: 0,
            c_squared: 1.0,
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    pub fn kind(&self) -> SpeciesKind {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Above 1, every redistribute reports its counts.
    pub fn set_verbose(&mut self, verbose: u32) {
        self.verbose = verbose;
    }

    /// Speed of light squared used for the Lorentz factor of relativistic kinds.
    pub fn set_c_squared(&mut self, c_squared: f64) {
        self.c_squared = c_squared;
    }

    /// Seed the stream used by the random-walk move policy.
    pub fn seed_random_walk(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    fn level_mut(&mut self, level: usize) -> &mut Tiles {
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Tiles::new);
        }
        &mut self.levels[level]
    }

    /// Levels this container has tiles for. Can lag the hierarchy until the
    /// next redistribute.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Particles held on this rank over all levels.
    pub fn num_particles(&self) -> usize {
        (0..self.levels.len()).map(|l| self.num_particles_at_level(l)).sum()
    }

    pub fn num_particles_at_level(&self, level: usize) -> usize {
        self.levels
            .get(level)
            .map_or(0, |t| t.values().map(Vec::len).sum())
    }

    /// Every particle of `level`, tile by tile in box order.
    pub fn particles_at_level(&self, level: usize) -> impl Iterator<Item = &Particle> + '_ {
        self.levels
            .get(level)
            .into_iter()
            .flat_map(|t| t.values().flatten())
    }

    /// Every particle, coarsest level first.
    pub fn particles(&self) -> impl Iterator<Item = &Particle> + '_ {
        self.levels.iter().flat_map(|t| t.values().flatten())
    }

    /// Mutable access for setting velocities or masses in place. Moving a
    /// particle this way leaves it in its old tile until the next
    /// redistribution.
    pub fn particles_mut(&mut self) -> impl Iterator<Item = &mut Particle> + '_ {
        self.levels.iter_mut().flat_map(|t| t.values_mut().flatten())
    }

    /// Particles of one tile.
    pub fn tile(&self, level: usize, box_index: usize) -> &[Particle] {
        self.levels
            .get(level)
            .and_then(|t| t.get(&box_index))
            .map_or(&[], Vec::as_slice)
    }

    /// Sum of particle masses on this rank (no Lorentz weighting).
    pub fn total_mass(&self) -> f64 {
        self.particles().map(|p| p.mass).sum()
    }

    pub fn total_mass_at_level(&self, level: usize) -> f64 {
        self.particles_at_level(level).map(|p| p.mass).sum()
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Place particles on `level`, in the box whose region grown by `n_grow`
    /// cells contains them. Returns how many were placed.
    pub fn add_particles_at_level(
        &mut self,
        particles: Vec<Particle>,
        level: usize,
        hierarchy: &AmrHierarchy,
        n_grow: i32,
    ) -> usize {
        if level > hierarchy.finest_level() {
            warn!("cannot add {} particles to missing level {level}", particles.len());
            return 0;
        }
        let lev = hierarchy.level(level);
        let total = particles.len();
        if let Some(max_id) = particles.iter().map(|p| p.id).max() {
            self.next_id = self.next_id.max(max_id + 1);
        }
        let tiles = self.level_mut(level);
        let mut placed = 0;
        for p in particles {
            if let Some(b) = lev.locate_grown(p.pos, n_grow) {
                tiles.entry(b).or_default().push(p);
                placed += 1;
            }
        }
        if placed < total {
            warn!(
                "{} of {total} {} particles are outside every box of level {level}",
                total - placed,
                self.kind
            );
        }
        placed
    }

    /// Assign new ids and place the particles on level 0, wrapping periodic
    /// positions. Used by the initializers.
    pub fn insert_initial(&mut self, particles: Vec<Particle>, hierarchy: &AmrHierarchy) -> usize {
        let geom = hierarchy.geom(0).clone();
        let mut inside = Vec::with_capacity(particles.len());
        for mut p in particles {
            if let Some(pos) = geom.wrap_periodic(p.pos) {
                p.pos = pos;
                p.id = self.fresh_id();
                inside.push(p);
            }
        }
        self.add_particles_at_level(inside, 0, hierarchy, 0)
    }

    /// Empty every tile of `level`; the level itself stays.
    pub fn remove_particles_at_level(&mut self, level: usize) {
        if let Some(t) = self.levels.get_mut(level) {
            t.clear();
        }
    }

    /// Drop all particles and levels.
    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Uniform random cloud of `count` particles over the whole domain.
    ///
    /// With `serialize`, the IO rank draws every particle from one stream so
    /// the result does not depend on the number of ranks.
    pub fn init_random(
        &mut self,
        hierarchy: &AmrHierarchy,
        comm: &dyn Communicator,
        count: u64,
        seed: u64,
        mass: f64,
        serialize: bool,
    ) -> usize {
        let geom = hierarchy.geom(0);
        let (local, stream_seed) = if serialize {
            (if comm.is_io_rank() { count } else { 0 }, seed)
        } else {
            let n = comm.n_ranks() as u64;
            let r = comm.rank() as u64;
            (count / n + u64::from(r < count % n), seed + r)
        };
        let mut rng = ChaCha8Rng::seed_from_u64(stream_seed);
        let len = geom.prob_length();
        let particles: Vec<Particle> = (0..local)
            .map(|_| {
                let u = DVec3::new(rng.random::<f64>(), rng.random::<f64>(), rng.random::<f64>());
                Particle::new(0, geom.prob_lo + u * len, DVec3::ZERO, mass)
            })
            .collect();
        self.insert_initial(particles, hierarchy)
    }

    /// `count_per_box` random particles inside every level-0 box this rank owns.
    pub fn init_random_per_box(
        &mut self,
        hierarchy: &AmrHierarchy,
        comm: &dyn Communicator,
        count_per_box: u64,
        seed: u64,
        mass: f64,
    ) -> usize {
        let lev = hierarchy.level(0);
        let dx = lev.geom.cell_size();
        let mut particles = Vec::new();
        for (b, bx) in lev.boxes.iter().enumerate() {
            if lev.dmap.rank(b) != Some(comm.rank()) {
                continue;
            }
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(b as u64));
            let lo = lev.geom.prob_lo + (bx.lo - lev.geom.domain.lo).as_dvec3() * dx;
            let extent = bx.size().as_dvec3() * dx;
            particles.extend((0..count_per_box).map(|_| {
                let u = DVec3::new(rng.random::<f64>(), rng.random::<f64>(), rng.random::<f64>());
                Particle::new(0, lo + u * extent, DVec3::ZERO, mass)
            }));
        }
        self.insert_initial(particles, hierarchy)
    }

    /// Scale the mass of every particle on `level`.
    pub fn multiply_mass(&mut self, level: usize, factor: f64) {
        if let Some(tiles) = self.levels.get_mut(level) {
            tiles
                .values_mut()
                .flatten()
                .for_each(|p| p.mass *= factor);
        }
    }

    /// First half of kick-drift-kick: half-step kick with the old field, then
    /// a full drift with the half-time velocity.
    pub fn move_kick_drift(
        &mut self,
        field: &MultiField,
        geom: &Geometry,
        level: usize,
        dt: f64,
        a_old: f64,
        a_half: f64,
    ) -> Result<()> {
        let Some(tiles) = self.levels.get_mut(level) else {
            return Ok(());
        };
        let half_dt = 0.5 * dt;
        for_each_tile(tiles, |b, ps| {
            for p in ps.iter_mut() {
                let accel = field
                    .interpolate_cic(geom, Some(b), p.pos)
                    .ok_or_else(|| out_of_range(level, p.pos))?;
                kick(p, accel, half_dt, a_old, a_half);
                drift(p, dt, a_half);
            }
            Ok(())
        })
    }

    /// Second half of kick-drift-kick: velocity-only kick with the new field.
    pub fn move_kick(
        &mut self,
        field: &MultiField,
        geom: &Geometry,
        level: usize,
        dt: f64,
        a_new: f64,
        a_half: f64,
    ) -> Result<()> {
        let Some(tiles) = self.levels.get_mut(level) else {
            return Ok(());
        };
        let half_dt = 0.5 * dt;
        for_each_tile(tiles, |b, ps| {
            for p in ps.iter_mut() {
                let accel = field
                    .interpolate_cic(geom, Some(b), p.pos)
                    .ok_or_else(|| out_of_range(level, p.pos))?;
                kick(p, accel, half_dt, a_half, a_new);
            }
            Ok(())
        })
    }

    /// Uncorrelated random walk of up to half a cell per axis, level 0 only.
    pub fn move_random(&mut self, hierarchy: &AmrHierarchy) {
        let dx = hierarchy.geom(0).cell_size();
        let Some(tiles) = self.levels.get_mut(0) else {
            return;
        };
        for p in tiles.values_mut().flatten() {
            let step = DVec3::new(
                self.rng.random_range(-0.5..0.5),
                self.rng.random_range(-0.5..0.5),
                self.rng.random_range(-0.5..0.5),
            );
            p.pos += step * dx;
        }
    }

    /// Largest timestep keeping every particle on `level` within `cfl` of a
    /// cell, or `-1.0` when the level holds no particles anywhere.
    pub fn est_timestep(
        &self,
        field: &MultiField,
        geom: &Geometry,
        a: f64,
        level: usize,
        cfl: f64,
        comm: &dyn Communicator,
    ) -> Result<f64> {
        let count = comm.all_reduce_sum(self.num_particles_at_level(level) as f64);
        if count == 0.0 {
            return Ok(-1.0);
        }
        let dx = geom.cell_size().min_element();
        let mut max_vel: f64 = 0.0;
        let mut max_acc: f64 = 0.0;
        if let Some(tiles) = self.levels.get(level) {
            for (&b, ps) in tiles {
                for p in ps {
                    max_vel = max_vel.max(p.vel.abs().max_element() / a);
                    let g = field
                        .interpolate_cic(geom, Some(b), p.pos)
                        .ok_or_else(|| out_of_range(level, p.pos))?;
                    max_acc = max_acc.max(g.abs().max_element());
                }
            }
        }
        let mut dt = f64::MAX;
        if max_vel > 0.0 {
            dt = dt.min(cfl * dx / max_vel);
        }
        if max_acc > 0.0 {
            dt = dt.min((2.0 * cfl * dx / max_acc).sqrt());
        }
        Ok(comm.all_reduce_min(dt))
    }

    fn deposit_weight(&self, p: &Particle) -> f64 {
        if self.kind.is_relativistic() {
            p.mass * p.gamma(self.c_squared)
        } else {
            p.mass
        }
    }

    /// Cloud-in-cell deposit of this level's particles into `field`
    /// (component 0 density; components 1..=3 momentum density if present).
    /// Returns the number of particles whose stencil had no home.
    pub fn assign_density_single_level(
        &self,
        field: &mut MultiField,
        hierarchy: &AmrHierarchy,
        level: usize,
    ) -> usize {
        let geom = hierarchy.geom(level);
        let inv_vol = 1.0 / geom.cell_volume();
        let with_momentum = field.n_comp() >= 4;
        let mut skipped = 0;
        if let Some(tiles) = self.levels.get(level) {
            for (&b, ps) in tiles {
                for p in ps {
                    let rho = self.deposit_weight(p) * inv_vol;
                    let ok = if with_momentum {
                        let m = p.vel * rho;
                        field.deposit_cic(geom, Some(b), p.pos, &[rho, m.x, m.y, m.z])
                    } else {
                        field.deposit_cic(geom, Some(b), p.pos, &[rho])
                    };
                    skipped += usize::from(!ok);
                }
            }
        }
        field.sum_boundary(geom);
        if skipped > 0 {
            warn!("{skipped} {} particles on level {level} were not deposited", self.kind);
        }
        skipped
    }

    /// Density on every level from `base_level` up. The field of level `l`
    /// holds the particles of level `l` plus everything finer summed down
    /// into the covered cells, so the base field carries the total mass.
    pub fn assign_density(&self, hierarchy: &AmrHierarchy, base_level: usize) -> Vec<MultiField> {
        self.assign_multilevel(hierarchy, base_level, 1)
    }

    /// Like `assign_density`, with three extra components holding the
    /// mass-weighted velocity.
    pub fn assign_density_and_velocity(
        &self,
        hierarchy: &AmrHierarchy,
        base_level: usize,
    ) -> Vec<MultiField> {
        let mut fields = self.assign_multilevel(hierarchy, base_level, 4);
        for mf in &mut fields {
            for i in 0..mf.fabs().len() {
                let valid = *mf.fab(i).valid_box();
                let fab = mf.fab_mut(i);
                for iv in valid.cells() {
                    let rho = fab.get(iv, 0);
                    for c in 1..4 {
                        let v = if rho > 0.0 { fab.get(iv, c) / rho } else { 0.0 };
                        fab.set(iv, c, v);
                    }
                }
            }
        }
        fields
    }

    fn assign_multilevel(&self, hierarchy: &AmrHierarchy, base_level: usize, n_comp: usize) -> Vec<MultiField> {
        let finest = hierarchy.finest_level();
        let mut fields: Vec<MultiField> = (base_level..=finest)
            .map(|l| {
                let mut mf = MultiField::new(hierarchy.box_array(l), n_comp, 1);
                self.assign_density_single_level(&mut mf, hierarchy, l);
                mf
            })
            .collect();
        for l in (base_level..finest).rev() {
            let i = l - base_level;
            let (coarse, fine) = fields.split_at_mut(i + 1);
            fine[0].sum_into_coarse(hierarchy.geom(l + 1), &mut coarse[i], hierarchy.ref_ratio(l));
        }
        fields
    }

    /// Move every particle on levels `>= from_level` to the finest level and
    /// box containing it under the current layout, and to the rank owning
    /// that box.
    pub fn redistribute(
        &mut self,
        hierarchy: &AmrHierarchy,
        comm: &dyn Communicator,
        from_level: usize,
    ) -> Result<RedistributeStats> {
        self.redistribute_from(hierarchy, comm, from_level, None)
    }

    /// Redistribution between sub-steps of `from_level`.
    ///
    /// Coarser levels have already finished their step, so particles never
    /// move below `from_level`: its boxes are grown by `n_grow` cells, and a
    /// particle found nowhere stays in its current tile until the next
    /// coarse redistribute.
    pub fn redistribute_grown(
        &mut self,
        hierarchy: &AmrHierarchy,
        comm: &dyn Communicator,
        from_level: usize,
        n_grow: i32,
    ) -> Result<RedistributeStats> {
        self.redistribute_from(hierarchy, comm, from_level, Some(n_grow))
    }

    fn redistribute_from(
        &mut self,
        hierarchy: &AmrHierarchy,
        comm: &dyn Communicator,
        from_level: usize,
        n_grow: Option<i32>,
    ) -> Result<RedistributeStats> {
        let geom0 = hierarchy.geom(0).clone();
        let mut stats = RedistributeStats::default();
        let mut outgoing: Vec<Vec<Routed>> = vec![Vec::new(); comm.n_ranks()];

        for level in from_level..self.levels.len() {
            let tiles = std::mem::take(&mut self.levels[level]);
            for (b, ps) in tiles {
                for mut p in ps {
                    stats.examined += 1;
                    let Some(pos) = geom0.wrap_periodic(p.pos) else {
                        stats.dropped += 1;
                        continue;
                    };
                    p.pos = pos;
                    let target = match n_grow {
                        None => hierarchy.where_is(pos, from_level),
                        Some(n) => hierarchy
                            .where_is_grown(pos, from_level, n)
                            .or(Some((level, b))),
                    };
                    let Some((new_level, new_box)) = target else {
                        stats.dropped += 1;
                        continue;
                    };
                    let rank = hierarchy
                        .distribution_map(new_level)
                        .rank(new_box)
                        .ok_or_else(|| {
                            ParticleError::invariant(format!(
                                "box {new_box} of level {new_level} has no owning rank"
                            ))
                        })?;
                    if rank >= outgoing.len() {
                        return Err(ParticleError::invariant(format!(
                            "box {new_box} of level {new_level} is mapped to rank {rank} of {}",
                            outgoing.len()
                        )));
                    }
                    if (new_level, new_box) != (level, b) {
                        stats.moved += 1;
                    }
                    outgoing[rank].push(Routed {
                        level: new_level,
                        box_index: new_box,
                        particle: p,
                    });
                }
            }
        }
        self.levels.truncate(hierarchy.num_levels());

        for r in comm.exchange(outgoing)? {
            self.level_mut(r.level)
                .entry(r.box_index)
                .or_default()
                .push(r.particle);
        }
        for tiles in &mut self.levels {
            tiles.retain(|_, ps| !ps.is_empty());
        }

        if stats.dropped > 0 {
            warn!(
                "redistribute dropped {} {} particles that left the domain",
                stats.dropped, self.kind
            );
        }
        if self.verbose > 1 {
            info!(
                "redistributed {} {} particles from level {from_level}: {} moved",
                stats.examined, self.kind, stats.moved
            );
        }
        Ok(stats)
    }

    /// Copies of every particle on `level`, to be re-tagged onto a coarser level.
    pub fn create_virtual_particles(&self, level: usize) -> Vec<Particle> {
        self.particles_at_level(level).copied().collect()
    }

    /// Copies of the particles on `level` lying within `n_grow` cells (at the
    /// resolution of `level + 1`) of a box on `level + 1`.
    pub fn create_ghost_particles(
        &self,
        hierarchy: &AmrHierarchy,
        level: usize,
        n_grow: i32,
    ) -> Vec<Particle> {
        if level >= hierarchy.finest_level() {
            return Vec::new();
        }
        let fine = hierarchy.level(level + 1);
        let ghosts: Vec<Particle> = self
            .particles_at_level(level)
            .filter(|p| fine.locate_grown(p.pos, n_grow).is_some())
            .copied()
            .collect();
        debug!(
            "{} {} ghost particles from level {level} for level {}",
            ghosts.len(),
            self.kind,
            level + 1
        );
        ghosts
    }
}
