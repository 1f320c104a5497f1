use std::cell::RefCell;
use std::rc::Rc;

use amr_particles::{
    AmrHierarchy, BoxArray, DistributionMap, EnergyAdded, Geometry, GravitySolver, HydroSolver, IndexBox,
    MultiField, Particle, ParticleConfig, ParticleError, Role, RunConfig, SimulationContext, SolveInputs,
    SpeciesKind, TimeLevel, UniformGravity,
};
use approx::assert_relative_eq;
use glam::{DVec3, IVec3};

const G: DVec3 = DVec3::new(0.0, 0.0, -1.0);

fn two_levels() -> AmrHierarchy {
    let mut h = AmrHierarchy::single_box(Geometry::unit_periodic(16)).unwrap();
    let fine = IndexBox::new(IVec3::splat(8), IVec3::splat(23));
    h.push_level(2, BoxArray::single(fine), DistributionMap::new(vec![0]))
        .unwrap();
    h
}

fn gravity_context(h: AmrHierarchy) -> SimulationContext {
    let particles = ParticleConfig {
        verbose: 0,
        ..Default::default()
    };
    SimulationContext::new(RunConfig::default(), particles, h)
        .unwrap()
        .with_gravity(Box::new(UniformGravity::new(G)))
}

fn add_particles(ctx: &mut SimulationContext, level: usize, particles: Vec<Particle>) {
    let h = ctx.hierarchy().clone();
    let subcycle = h.sub_cycle();
    let reg = ctx.registry_mut();
    if !reg.contains(SpeciesKind::DarkMatter) {
        reg.register(SpeciesKind::DarkMatter, subcycle).unwrap();
    }
    let dm = reg.active_mut(SpeciesKind::DarkMatter).unwrap();
    assert_eq!(dm.add_particles_at_level(particles, level, &h, 0), 1);
}

fn dm_particle(ctx: &SimulationContext, id: u64) -> Particle {
    *ctx.registry()
        .active(SpeciesKind::DarkMatter)
        .unwrap()
        .particles()
        .find(|p| p.id == id)
        .unwrap()
}

#[test]
fn test_leapfrog_matches_free_fall() {
    let h = AmrHierarchy::single_box(Geometry::unit_periodic(16)).unwrap();
    let mut ctx = gravity_context(h);
    let x0 = DVec3::new(0.5, 0.5, 0.6);
    add_particles(&mut ctx, 0, vec![Particle::new(1, x0, DVec3::ZERO, 1.0)]);

    let dt = 0.05;
    for _ in 0..4 {
        ctx.coarse_timestep(dt).unwrap();
    }
    let t = 4.0 * dt;
    let p = dm_particle(&ctx, 1);
    assert_relative_eq!(p.pos.z, x0.z - 0.5 * t * t, epsilon = 1e-12);
    assert_relative_eq!(p.vel.z, -t, epsilon = 1e-12);
    assert_relative_eq!(ctx.time(), t, epsilon = 1e-12);
}

#[test]
fn test_subcycled_step_keeps_levels_in_step() {
    let mut ctx = gravity_context(two_levels());
    add_particles(&mut ctx, 0, vec![Particle::new(1, DVec3::new(0.1, 0.1, 0.5), DVec3::ZERO, 1.0)]);
    add_particles(&mut ctx, 1, vec![Particle::new(2, DVec3::new(0.5, 0.5, 0.5), DVec3::ZERO, 2.0)]);
    // Within two fine cells of the refined region: becomes a ghost.
    add_particles(&mut ctx, 0, vec![Particle::new(3, DVec3::new(0.24, 0.5, 0.5), DVec3::ZERO, 1.0)]);

    let dt = 0.1;
    ctx.coarse_timestep(dt).unwrap();

    let h = ctx.hierarchy();
    assert_relative_eq!(h.level(1).cur_time, h.level(0).cur_time, epsilon = 1e-12);
    assert_relative_eq!(h.dt_level(1), dt / 2.0);

    // Constant acceleration: every sub-stepping reproduces the exact fall.
    for id in 1..=3 {
        let p = dm_particle(&ctx, id);
        assert_relative_eq!(p.vel.z, -dt, epsilon = 1e-12);
        assert_relative_eq!(p.pos.z, 0.5 - 0.5 * dt * dt, epsilon = 1e-12);
    }

    let reg = ctx.registry();
    assert_eq!(reg.containers(Role::Virtual).map(|c| c.num_particles()).sum::<usize>(), 0);
    assert_eq!(reg.containers(Role::Ghost).map(|c| c.num_particles()).sum::<usize>(), 0);
    assert!(!ctx.proxies().virtuals_built(0));
    assert_relative_eq!(ctx.total_particle_mass(), 4.0);
    assert_eq!(ctx.grav_n_grow(), 4);
}

fn three_levels() -> AmrHierarchy {
    let mut h = two_levels();
    // Level 2 covers [0.375, 0.625) in every direction.
    let finest = IndexBox::new(IVec3::splat(24), IVec3::splat(39));
    h.push_level(2, BoxArray::single(finest), DistributionMap::new(vec![0]))
        .unwrap();
    h
}

fn ids_in(ctx: &SimulationContext, role: Role) -> Vec<u64> {
    let mut ids: Vec<u64> = ctx
        .registry()
        .containers(role)
        .flat_map(|c| c.particles().map(|p| p.id).collect::<Vec<_>>())
        .collect();
    ids.sort_unstable();
    ids
}

#[test]
fn test_particle_leaving_middle_level_keeps_its_sub_steps() {
    let particles = ParticleConfig {
        verbose: 0,
        ..Default::default()
    };
    let mut ctx = SimulationContext::new(RunConfig::default(), particles, three_levels())
        .unwrap()
        .with_gravity(Box::new(UniformGravity::new(DVec3::ZERO)));
    // Level 1 ends at x = 0.75; the first fine sub-step carries it across.
    let x0 = DVec3::new(0.745, 0.5, 0.5);
    let vel = DVec3::new(0.2, 0.0, 0.0);
    add_particles(&mut ctx, 1, vec![Particle::new(1, x0, vel, 1.0)]);

    let dt = 0.1;
    ctx.coarse_timestep(dt).unwrap();

    let p = dm_particle(&ctx, 1);
    assert_relative_eq!(p.pos.x, x0.x + vel.x * dt, epsilon = 1e-12);
    assert_eq!(p.vel, vel);
    // The coarse sync hands it to level 0 once the whole step is done.
    let dm = ctx.registry().active(SpeciesKind::DarkMatter).unwrap();
    assert_eq!(dm.num_particles_at_level(0), 1);
    assert_eq!(dm.num_particles(), 1);
}

#[test]
fn test_ghosts_cover_the_fine_boundary_band_during_the_step() {
    let mut ctx = gravity_context(two_levels());
    // Fine cells 7, 6 and 5 along x: one, two and three cells off the box.
    let coarse = vec![
        Particle::new(10, DVec3::new(0.24, 0.5, 0.5), DVec3::ZERO, 1.0),
        Particle::new(11, DVec3::new(0.2, 0.5, 0.5), DVec3::ZERO, 1.0),
        Particle::new(12, DVec3::new(0.18, 0.5, 0.5), DVec3::ZERO, 1.0),
        Particle::new(13, DVec3::new(0.1, 0.1, 0.1), DVec3::ZERO, 1.0),
    ];
    add_particles(&mut ctx, 0, coarse);

    let time = ctx.time();
    ctx.advance(0, time, 0.05, 1, 1).unwrap();

    // grav_n_grow = ncycle + 2; ghosts reach grav_n_grow - 1 fine cells out.
    assert_eq!(ctx.grav_n_grow(), 3);
    assert_eq!(ids_in(&ctx, Role::Ghost), vec![10, 11]);
    let fine = ctx.hierarchy().level(1);
    for c in ctx.registry().containers(Role::Ghost) {
        assert_eq!(c.num_particles_at_level(0), 0);
        for p in c.particles() {
            assert!(fine.locate(p.pos).is_none());
            assert!(fine.locate_grown(p.pos, ctx.grav_n_grow() - 1).is_some());
        }
    }

    ctx.post_timestep(0, 1, 1).unwrap();
    assert!(ids_in(&ctx, Role::Ghost).is_empty());
    assert!(ids_in(&ctx, Role::Virtual).is_empty());
    assert_eq!(ids_in(&ctx, Role::Active), vec![10, 11, 12, 13]);
}

#[test]
fn test_particle_timestep_estimate() {
    let mut ctx = gravity_context(two_levels());
    add_particles(&mut ctx, 0, vec![Particle::new(1, DVec3::splat(0.1), DVec3::ZERO, 1.0)]);

    // dx = 1/16, cfl = 0.5, |g| = 1: sqrt(2 * 0.5 / 16).
    assert_relative_eq!(ctx.particle_est_time_step(0, 1.0).unwrap(), 0.25);
    assert_relative_eq!(ctx.particle_est_time_step(0, 0.1).unwrap(), 0.1);
    // Nothing on level 1 constrains it.
    assert_relative_eq!(ctx.particle_est_time_step(1, 1.0).unwrap(), 1.0);
    assert_relative_eq!(ctx.estimate_coarse_dt().unwrap().unwrap(), 0.25);
}

#[test]
fn test_random_walk_without_gravity() {
    let run = RunConfig {
        do_grav: false,
        ..Default::default()
    };
    let particles = ParticleConfig {
        do_dm_particles: true,
        particle_init_type: "Random".into(),
        particle_move_type: "Random".into(),
        particle_initrandom_count: 50,
        particle_initrandom_iseed: 3,
        particle_initrandom_mass: 1.0,
        verbose: 0,
        ..Default::default()
    };
    let h = AmrHierarchy::single_box(Geometry::unit_periodic(8)).unwrap();
    let mut ctx = SimulationContext::new(run, particles, h).unwrap();
    ctx.init_particles().unwrap();
    let before: Vec<Particle> = ctx.registry().active(SpeciesKind::DarkMatter).unwrap().particles().copied().collect();

    ctx.coarse_timestep(0.1).unwrap();

    let dm = ctx.registry().active(SpeciesKind::DarkMatter).unwrap();
    assert_eq!(dm.num_particles(), 50);
    let dx = 1.0 / 8.0;
    for old in &before {
        let new = dm.particles().find(|p| p.id == old.id).unwrap();
        let mut d = (new.pos - old.pos).abs();
        // Undo periodic wrapping.
        d = d.min(DVec3::ONE - d);
        assert!(d.max_element() <= 0.5 * dx + 1e-12);
        assert!(d.max_element() > 0.0);
    }
    // Positions changed, particle-only time advanced.
    assert_relative_eq!(ctx.time(), 0.1);
}

#[test]
fn test_end_to_end_zero_field_drift() {
    let particles = ParticleConfig {
        do_dm_particles: true,
        particle_init_type: "Random".into(),
        particle_initrandom_count: 1000,
        particle_initrandom_iseed: 42,
        particle_initrandom_mass: 1.0,
        verbose: 0,
        ..Default::default()
    };
    let h = AmrHierarchy::single_box(Geometry::unit_periodic(16))
        .unwrap()
        .with_subcycling(false);
    let mut ctx = SimulationContext::new(RunConfig::default(), particles, h)
        .unwrap()
        .with_gravity(Box::new(UniformGravity::new(DVec3::ZERO)));
    ctx.init_particles().unwrap();

    let vel = DVec3::new(0.01, -0.02, 0.005);
    ctx.registry_mut()
        .active_mut(SpeciesKind::DarkMatter)
        .unwrap()
        .particles_mut()
        .for_each(|p| p.vel = vel);
    let before: Vec<Particle> = ctx.registry().active(SpeciesKind::DarkMatter).unwrap().particles().copied().collect();

    let dt = 0.1;
    let hierarchy = ctx.hierarchy().clone();
    let field = MultiField::uniform_vector(hierarchy.box_array(0), 1, DVec3::ZERO);
    let dm = ctx.registry_mut().active_mut(SpeciesKind::DarkMatter).unwrap();
    dm.move_kick_drift(&field, hierarchy.geom(0), 0, dt, 1.0, 1.0).unwrap();
    dm.move_kick(&field, hierarchy.geom(0), 0, dt, 1.0, 1.0).unwrap();

    for old in &before {
        let new = dm.particles().find(|p| p.id == old.id).unwrap();
        assert_relative_eq!(new.pos.x, old.pos.x + vel.x * dt, epsilon = 1e-12);
        assert_relative_eq!(new.pos.y, old.pos.y + vel.y * dt, epsilon = 1e-12);
        assert_relative_eq!(new.pos.z, old.pos.z + vel.z * dt, epsilon = 1e-12);
        assert_eq!(new.vel, vel);
    }

    assert_eq!(ctx.num_particles(), 1000);
    assert_relative_eq!(ctx.deposited_mass(), 1000.0, epsilon = 1e-9);
}

#[test]
fn test_ascii_mode_without_file_is_rejected() {
    let particles = ParticleConfig {
        do_dm_particles: true,
        particle_init_type: "AsciiFile".into(),
        ..Default::default()
    };
    let h = AmrHierarchy::single_box(Geometry::unit_periodic(8)).unwrap();
    let err = SimulationContext::new(RunConfig::default(), particles, h).err().unwrap();
    assert!(matches!(err, ParticleError::Config(_)));
}

/// Records every call the orchestrator makes into the shared log.
#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<String>>>);

impl Recorder {
    fn push(&self, entry: String) {
        self.0.borrow_mut().push(entry);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

struct RecordingGravity(Recorder);

impl GravitySolver for RecordingGravity {
    fn swap_time_levels(&mut self, level: usize) {
        self.0.push(format!("grav.swap {level}"));
    }

    fn solve_old(&mut self, _: SolveInputs<'_>, base: usize, finest: usize, _: bool) -> amr_particles::Result<()> {
        self.0.push(format!("grav.solve_old {base}..={finest}"));
        Ok(())
    }

    fn solve_new(&mut self, _: SolveInputs<'_>, base: usize, finest: usize, _: bool) -> amr_particles::Result<()> {
        self.0.push(format!("grav.solve_new {base}..={finest}"));
        Ok(())
    }

    fn grav_vector(
        &self,
        hierarchy: &AmrHierarchy,
        level: usize,
        time: TimeLevel,
        n_grow: i32,
    ) -> amr_particles::Result<MultiField> {
        self.0.push(format!("grav.vector {time:?} {level}"));
        Ok(MultiField::uniform_vector(hierarchy.box_array(level), n_grow, DVec3::ZERO))
    }

    fn add_to_fluxes(&mut self, level: usize, _: usize, _: usize) -> amr_particles::Result<()> {
        self.0.push(format!("grav.add_to_fluxes {level}"));
        Ok(())
    }
}

struct RecordingHydro(Recorder);

impl HydroSolver for RecordingHydro {
    fn swap_time_levels(&mut self, level: usize, _: f64) {
        self.0.push(format!("hydro.swap {level}"));
    }

    fn advance(&mut self, level: usize, _: f64, _: f64, _: f64, _: f64) -> amr_particles::Result<()> {
        self.0.push(format!("hydro.advance {level}"));
        Ok(())
    }

    fn reflux(&mut self, level: usize) -> amr_particles::Result<()> {
        self.0.push(format!("hydro.reflux {level}"));
        Ok(())
    }

    fn average_down(&mut self, level: usize) -> amr_particles::Result<()> {
        self.0.push(format!("hydro.average_down {level}"));
        Ok(())
    }

    fn correct_gravity_source(
        &mut self,
        level: usize,
        _: &MultiField,
        _: &MultiField,
        _: f64,
        _: f64,
        _: f64,
    ) -> amr_particles::Result<EnergyAdded> {
        self.0.push(format!("hydro.correct {level}"));
        Ok(EnergyAdded {
            e_added: 1.0,
            ke_added: 2.0,
        })
    }

    fn reset_internal_energy(&mut self, level: usize) -> amr_particles::Result<()> {
        self.0.push(format!("hydro.reset {level}"));
        Ok(())
    }
}

fn recording_context(h: AmrHierarchy) -> (SimulationContext, Recorder) {
    let log = Recorder::default();
    let run = RunConfig {
        do_hydro: true,
        ..Default::default()
    };
    let particles = ParticleConfig {
        verbose: 0,
        ..Default::default()
    };
    let ctx = SimulationContext::new(run, particles, h)
        .unwrap()
        .with_gravity(Box::new(RecordingGravity(log.clone())))
        .with_hydro(Box::new(RecordingHydro(log.clone())));
    (ctx, log)
}

#[test]
fn test_coupled_advance_call_order() {
    let h = AmrHierarchy::single_box(Geometry::unit_periodic(8)).unwrap();
    let (mut ctx, log) = recording_context(h);
    add_particles(&mut ctx, 0, vec![Particle::new(1, DVec3::splat(0.5), DVec3::ZERO, 1.0)]);

    ctx.advance(0, 0.0, 0.1, 1, 1).unwrap();

    assert_eq!(
        log.take(),
        [
            "hydro.swap 0",
            "grav.swap 0",
            "grav.solve_old 0..=0",
            "grav.vector Old 0",
            "hydro.advance 0",
            "grav.solve_new 0..=0",
            "grav.add_to_fluxes 0",
            "grav.vector Old 0",
            "grav.vector New 0",
            "hydro.correct 0",
            "grav.vector New 0",
            "hydro.reset 0",
        ]
    );
    assert_eq!(
        ctx.energy_added(),
        EnergyAdded {
            e_added: 1.0,
            ke_added: 2.0
        }
    );
}

#[test]
fn test_coupled_advance_spans_unsubcycled_levels() {
    let h = two_levels().with_subcycling(false);
    let (mut ctx, log) = recording_context(h);
    add_particles(&mut ctx, 1, vec![Particle::new(1, DVec3::splat(0.5), DVec3::ZERO, 1.0)]);

    ctx.advance(0, 0.0, 0.1, 1, 1).unwrap();
    let calls = log.take();
    let pos = |s: &str| calls.iter().position(|c| c == s).unwrap();

    assert!(pos("hydro.advance 1") < pos("hydro.reflux 0"));
    assert!(pos("hydro.reflux 0") < pos("hydro.average_down 0"));
    assert!(pos("hydro.average_down 0") < pos("grav.solve_new 0..=1"));
    assert!(pos("grav.add_to_fluxes 1") < pos("hydro.correct 0"));
    assert_eq!(calls.iter().filter(|c| *c == "hydro.average_down 0").count(), 2);
    assert_eq!(calls.last().map(String::as_str), Some("hydro.reset 1"));

    // A finer level has nothing left to do.
    ctx.advance(1, 0.0, 0.1, 1, 1).unwrap();
    assert!(log.take().is_empty());
}

#[test]
fn test_hydro_only_advance() {
    let h = AmrHierarchy::single_box(Geometry::unit_periodic(8)).unwrap();
    let (mut ctx, log) = recording_context(h);

    ctx.advance(0, 0.0, 0.1, 1, 1).unwrap();

    assert_eq!(
        log.take(),
        [
            "hydro.swap 0",
            "grav.swap 0",
            "grav.solve_old 0..=0",
            "hydro.advance 0",
            "grav.solve_new 0..=0",
            "grav.vector Old 0",
            "grav.vector New 0",
            "hydro.correct 0",
            "hydro.reset 0",
        ]
    );
}
