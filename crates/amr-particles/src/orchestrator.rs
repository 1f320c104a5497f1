//! One level's advance: proxy setup, the two gravity solves, the
//! kick-drift-kick around the hydro update, and the cleanup that follows.

use log::{info, warn};

use crate::config::MovePolicy;
use crate::context::{EnergyAdded, SimulationContext};
use crate::error::{ParticleError, Result};
use crate::field::MultiField;
use crate::gravity::{GravitySolver, TimeLevel};
use crate::species::SpeciesKind;

/// The gas side of a coupled run. Particles never touch the gas state; the
/// orchestrator only calls these at the right points of the advance.
pub trait HydroSolver {
    fn swap_time_levels(&mut self, level: usize, dt: f64);

    fn advance(&mut self, level: usize, time: f64, dt: f64, a_old: f64, a_new: f64) -> Result<()>;

    fn reflux(&mut self, level: usize) -> Result<()>;

    /// Average `level + 1` onto `level`.
    fn average_down(&mut self, level: usize) -> Result<()>;

    /// Replace the old-time gravity source with the time-centered one.
    fn correct_gravity_source(
        &mut self,
        level: usize,
        grav_old: &MultiField,
        grav_new: &MultiField,
        a_old: f64,
        a_new: f64,
        dt: f64,
    ) -> Result<EnergyAdded>;

    fn reset_internal_energy(&mut self, level: usize) -> Result<()>;
}

fn missing_gravity() -> ParticleError {
    ParticleError::config("do_grav is set but no gravity solver was supplied")
}

fn missing_hydro() -> ParticleError {
    ParticleError::config("do_hydro is set but no hydro solver was supplied")
}

impl SimulationContext {
    /// Advance `level` by `dt`; `iteration` counts from 1 to `ncycle` within
    /// the coarser step. Returns the step actually taken.
    pub fn advance(&mut self, level: usize, time: f64, dt: f64, iteration: usize, ncycle: usize) -> Result<f64> {
        // One cell per sub-step a particle may travel before the next
        // redistribute, plus one for the interpolation stencil.
        self.grav_n_grow = ncycle as i32 + 2;

        let policy = self.particles.move_policy()?;
        let mut gravity = self.gravity.take();
        let mut hydro = self.hydro.take();

        let result = match (self.run.do_hydro, self.run.do_grav) {
            (true, _) if self.registry.is_empty() => match hydro.as_deref_mut() {
                Some(h) => self.advance_hydro(gravity.as_mut(), h, level, time, dt),
                None => Err(missing_hydro()),
            },
            (true, true) => match (gravity.as_deref_mut(), hydro.as_deref_mut()) {
                (Some(g), Some(h)) => self.advance_with_particles(g, Some(h), policy, level, time, dt, iteration, ncycle),
                (None, _) => Err(missing_gravity()),
                (_, None) => Err(missing_hydro()),
            },
            (true, false) => Err(ParticleError::invariant(
                "advancing hydro together with particles requires gravity",
            )),
            (false, true) => match gravity.as_deref_mut() {
                Some(g) => self.advance_with_particles(g, None, policy, level, time, dt, iteration, ncycle),
                None => Err(missing_gravity()),
            },
            (false, false) if policy == MovePolicy::Random => self.advance_random_walk(level, dt),
            (false, false) => Err(ParticleError::invariant(
                "advancing particles without gravity needs particle_move_type = Random",
            )),
        };

        self.gravity = gravity;
        self.hydro = hydro;
        result
    }

    /// Finest level a call to `advance(level)` moves, or `None` when a
    /// coarser level's advance has already covered `level`.
    pub fn finest_level_to_advance(&self, level: usize, ncycle: usize) -> Option<usize> {
        let finest = self.hierarchy.finest_level();
        if !self.hierarchy.sub_cycle() {
            return (level == 0).then_some(finest);
        }
        if self.run.strict_subcycling {
            return Some(level);
        }
        if level > 0 && ncycle == 1 {
            return None;
        }
        // Finer levels that take a single step ride along with this one.
        let mut lev = level;
        while lev < finest && self.hierarchy.n_cycle(lev + 1) == 1 {
            lev += 1;
        }
        Some(lev)
    }

    fn record_finest_advanced(&mut self, level: usize, finest_to_advance: usize) {
        if self.finest_advanced.len() <= level {
            self.finest_advanced.resize(level + 1, level);
        }
        self.finest_advanced[level] = finest_to_advance;
    }

    #[allow(clippy::too_many_arguments)]
    fn advance_with_particles(
        &mut self,
        gravity: &mut dyn GravitySolver,
        mut hydro: Option<&mut dyn HydroSolver>,
        policy: MovePolicy,
        level: usize,
        time: f64,
        dt: f64,
        iteration: usize,
        ncycle: usize,
    ) -> Result<f64> {
        let finest = self.hierarchy.finest_level();
        let Some(finest_to_advance) = self.finest_level_to_advance(level, ncycle) else {
            return Ok(dt);
        };
        self.record_finest_advanced(level, finest_to_advance);
        let verbose = self.particles.verbose > 0 && self.comm.is_io_rank();

        if self.hierarchy.sub_cycle() {
            self.proxies
                .setup_virtual_particles(&mut self.registry, &self.hierarchy, level);
            for lev in (level..=finest_to_advance).filter(|&l| l < finest) {
                self.proxies.setup_ghost_particles(
                    &mut self.registry,
                    &self.hierarchy,
                    lev,
                    self.grav_n_grow - 1,
                );
            }
        }

        // The first sub-step of a finer level reuses the time levels the
        // coarser advance already swapped.
        if level == 0 || iteration > 1 {
            for lev in level..=finest {
                let dt_lev = if lev == level { dt } else { self.hierarchy.dt_level(lev) };
                self.hierarchy.swap_time_levels(lev, dt_lev);
                if let Some(h) = hydro.as_deref_mut() {
                    h.swap_time_levels(lev, dt_lev);
                }
                gravity.swap_time_levels(lev);
            }
            gravity.solve_old(self.solve_inputs(), level, finest, true)?;
        }

        let lev0 = self.hierarchy.level(level);
        let a = self.cosmology.step_factors(lev0.prev_time, lev0.cur_time);
        let has_particles = !self.registry.is_empty();

        if policy == MovePolicy::Gravitational && has_particles {
            if verbose {
                info!("moveKickDrift ... updating particle positions and velocity");
            }
            for lev in level..=finest_to_advance {
                let g = gravity.grav_vector(&self.hierarchy, lev, TimeLevel::Old, self.grav_n_grow)?;
                let geom = self.hierarchy.geom(lev);
                for entry in self.registry.entries_mut() {
                    entry.active.move_kick_drift(&g, geom, lev, dt, a.a_old, a.a_half)?;
                    // Virtuals only feed the coarse solve of the level that
                    // owns them.
                    if lev == level && level < finest {
                        if let Some(v) = entry.virtuals.as_mut() {
                            v.move_kick_drift(&g, geom, lev, dt, a.a_old, a.a_half)?;
                        }
                    }
                    if let Some(gh) = entry.ghosts.as_mut() {
                        gh.move_kick_drift(&g, geom, lev, dt, a.a_old, a.a_half)?;
                    }
                }
            }
        } else if policy == MovePolicy::Random && level == 0 {
            self.particle_move_random();
        }

        if let Some(h) = hydro.as_deref_mut() {
            for lev in level..=finest_to_advance {
                h.advance(lev, time, dt, a.a_old, a.a_new)?;
            }
            if self.run.do_reflux {
                for lev in level..finest_to_advance {
                    h.reflux(lev)?;
                }
            }
            for lev in (level..finest_to_advance).rev() {
                h.average_down(lev)?;
            }
        }

        gravity.solve_new(self.solve_inputs(), level, finest_to_advance, true)?;
        if self.run.do_reflux {
            for lev in level..=finest_to_advance {
                gravity.add_to_fluxes(lev, iteration, ncycle)?;
            }
        }

        if let Some(h) = hydro.as_deref_mut() {
            for lev in level..=finest_to_advance {
                let old = gravity.grav_vector(&self.hierarchy, lev, TimeLevel::Old, 0)?;
                let new = gravity.grav_vector(&self.hierarchy, lev, TimeLevel::New, 0)?;
                let added = h.correct_gravity_source(lev, &old, &new, a.a_old, a.a_new, dt)?;
                self.energy += added;
                if self.run.verbose > 1 && self.comm.is_io_rank() {
                    info!(
                        "gravity source correction at level {lev}: e_added {:.6e}, ke_added {:.6e}",
                        added.e_added, added.ke_added
                    );
                }
            }
            for lev in (level..finest_to_advance).rev() {
                h.average_down(lev)?;
            }
        }

        if policy == MovePolicy::Gravitational && has_particles {
            if verbose {
                info!("moveKick ... updating velocity only");
            }
            for lev in level..=finest_to_advance {
                let g = gravity.grav_vector(&self.hierarchy, lev, TimeLevel::New, self.grav_n_grow)?;
                let geom = self.hierarchy.geom(lev);
                for entry in self.registry.entries_mut() {
                    entry.active.move_kick(&g, geom, lev, dt, a.a_new, a.a_half)?;
                    // The last sub-step leaves ghosts half-kicked: they are
                    // removed right after, so the missing kick is only seen
                    // if something reads them before post_timestep.
                    if iteration != ncycle {
                        if let Some(gh) = entry.ghosts.as_mut() {
                            gh.move_kick(&g, geom, lev, dt, a.a_new, a.a_half)?;
                        }
                    }
                }
            }
        }

        if let Some(h) = hydro {
            for lev in level..=finest_to_advance {
                h.reset_internal_energy(lev)?;
            }
        }
        Ok(dt)
    }

    /// Gas-only advance of a single level.
    fn advance_hydro(
        &mut self,
        mut gravity: Option<&mut Box<dyn GravitySolver>>,
        hydro: &mut dyn HydroSolver,
        level: usize,
        time: f64,
        dt: f64,
    ) -> Result<f64> {
        self.hierarchy.swap_time_levels(level, dt);
        hydro.swap_time_levels(level, dt);
        if let Some(g) = gravity.as_mut() {
            g.swap_time_levels(level);
            g.solve_old(self.solve_inputs(), level, level, true)?;
        }
        let lev = self.hierarchy.level(level);
        let a = self.cosmology.step_factors(lev.prev_time, lev.cur_time);

        hydro.advance(level, time, dt, a.a_old, a.a_new)?;
        if let Some(g) = gravity {
            g.solve_new(self.solve_inputs(), level, level, true)?;
            let old = g.grav_vector(&self.hierarchy, level, TimeLevel::Old, 0)?;
            let new = g.grav_vector(&self.hierarchy, level, TimeLevel::New, 0)?;
            self.energy += hydro.correct_gravity_source(level, &old, &new, a.a_old, a.a_new, dt)?;
        }
        hydro.reset_internal_energy(level)?;
        Ok(dt)
    }

    /// Particles without gravity: a random walk on the coarsest level.
    fn advance_random_walk(&mut self, level: usize, dt: f64) -> Result<f64> {
        self.hierarchy.swap_time_levels(level, dt);
        if level == 0 {
            self.particle_move_random();
        }
        Ok(dt)
    }

    /// Random-walk every active species on level 0.
    pub fn particle_move_random(&mut self) {
        if self.particles.move_policy().ok() != Some(MovePolicy::Random) {
            return;
        }
        for entry in self.registry.entries_mut() {
            entry.active.move_random(&self.hierarchy);
        }
    }

    /// Cleanup after `level` finished its step: drop the proxies the advance
    /// built and bring the actives back to their owners.
    pub fn post_timestep(&mut self, level: usize, iteration: usize, ncycle: usize) -> Result<()> {
        let finest = self.hierarchy.finest_level();
        if self.hierarchy.sub_cycle() {
            let advanced = self.finest_advanced.get(level).copied().unwrap_or(level).max(level);
            for lev in level..=advanced {
                self.proxies.remove_virtual_particles(&mut self.registry, lev);
                self.proxies.remove_ghost_particles(&mut self.registry, lev);
            }
        }

        if level == 0 {
            for entry in self.registry.entries_mut() {
                entry.active.redistribute(&self.hierarchy, self.comm.as_ref(), 0)?;
            }
        } else if iteration < ncycle && level < finest {
            // Mid-cycle: level-1 and coarser are done, so particles that
            // drifted out of `level` stay on it within `iteration` cells.
            let n_grow = iteration as i32;
            for entry in self.registry.entries_mut() {
                entry
                    .active
                    .redistribute_grown(&self.hierarchy, self.comm.as_ref(), level, n_grow)?;
            }
        }
        Ok(())
    }

    /// Particle limit on the timestep of `level`, folded into `est_dt`.
    pub fn particle_est_time_step(&self, level: usize, est_dt: f64) -> Result<f64> {
        if self.particles.move_policy()? != MovePolicy::Gravitational || self.registry.is_empty() {
            return Ok(est_dt);
        }
        let gravity = self.gravity.as_deref().ok_or_else(missing_gravity)?;
        let a = self.cosmology.comoving_a(self.hierarchy.level(level).cur_time);
        let g = gravity.grav_vector(&self.hierarchy, level, TimeLevel::New, self.grav_n_grow)?;
        let geom = self.hierarchy.geom(level);
        let verbose = self.particles.verbose > 0 && self.comm.is_io_rank();

        let mut est = est_dt;
        for entry in self.registry.entries() {
            let kind = entry.kind();
            let cfl = if kind == SpeciesKind::Neutrino {
                self.particles.neutrino_cfl
            } else {
                self.particles.cfl
            };
            let dt_part = entry.active.est_timestep(&g, geom, a, level, cfl, self.comm.as_ref())?;
            if dt_part > 0.0 {
                est = est.min(dt_part);
                if verbose {
                    info!("...estdt from {kind} particles at level {level}: {dt_part}");
                }
            } else if verbose {
                warn!("...there are no {kind} particles at level {level}");
            }
        }
        Ok(est)
    }

    /// Coarse timestep the particles allow, each level's estimate scaled by
    /// the sub-steps it takes per coarse step. `None` when nothing limits it.
    pub fn estimate_coarse_dt(&self) -> Result<Option<f64>> {
        let mut dt = f64::MAX;
        let mut n_factor = 1.0;
        for lev in 0..=self.hierarchy.finest_level() {
            n_factor *= self.hierarchy.n_cycle(lev) as f64;
            let est = self.particle_est_time_step(lev, f64::MAX)?;
            if est < f64::MAX {
                dt = dt.min(est * n_factor);
            }
        }
        Ok((dt < f64::MAX).then_some(dt))
    }

    /// One full coarse step: every level advances through its sub-steps and
    /// is cleaned up afterwards.
    pub fn coarse_timestep(&mut self, dt: f64) -> Result<f64> {
        self.hierarchy.set_coarse_dt(dt);
        let time = self.hierarchy.level(0).cur_time;
        self.timestep(0, time, 1, 1)?;
        Ok(dt)
    }

    fn timestep(&mut self, level: usize, time: f64, iteration: usize, ncycle: usize) -> Result<()> {
        let dt = self.hierarchy.dt_level(level);
        self.advance(level, time, dt, iteration, ncycle)?;
        if level < self.hierarchy.finest_level() {
            let n = self.hierarchy.n_cycle(level + 1);
            let dt_fine = self.hierarchy.dt_level(level + 1);
            for i in 1..=n {
                self.timestep(level + 1, time + (i - 1) as f64 * dt_fine, i, n)?;
            }
        }
        self.post_timestep(level, iteration, ncycle)
    }
}
