//! Drive a particle-only run from a JSON run file.
//!
//! ```text
//! amr-particles run.json
//! ```

use std::path::{Path, PathBuf};
use std::process;

use amr_particles::{
    AmrHierarchy, BoxArray, DistributionMap, EinsteinDeSitter, Geometry, IndexBox, ParticleConfig,
    RunConfig, SimulationContext, TreeGravity, TreeGravityConfig, UniformGravity,
};
use glam::{DVec3, IVec3};
use log::{error, info};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DomainConfig {
    n_cell: i32,
    prob_lo: [f64; 3],
    prob_hi: [f64; 3],
    periodic: [bool; 3],
    max_grid_size: i32,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            n_cell: 32,
            prob_lo: [0.0; 3],
            prob_hi: [1.0; 3],
            periodic: [true; 3],
            max_grid_size: 32,
        }
    }
}

/// A refined region, in the index space of the level it creates.
#[derive(Debug, Deserialize)]
struct LevelConfig {
    ratio: i32,
    lo: [i32; 3],
    hi: [i32; 3],
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum GravityConfig {
    Uniform { g: [f64; 3] },
    Tree(TreeGravityConfig),
}

impl Default for GravityConfig {
    fn default() -> Self {
        GravityConfig::Tree(TreeGravityConfig::default())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunFile {
    domain: DomainConfig,
    levels: Vec<LevelConfig>,
    subcycle: bool,
    run: RunConfig,
    particles: ParticleConfig,
    gravity: GravityConfig,
    /// Einstein-de Sitter expansion from this redshift; static space if absent.
    initial_redshift: Option<f64>,
    steps: usize,
    /// Fixed coarse step; estimated from the particles if absent.
    dt: Option<f64>,
    max_dt: Option<f64>,
    baryon_fraction: Option<f64>,
    restart_dir: Option<PathBuf>,
    checkpoint_dir: Option<PathBuf>,
}

fn build_hierarchy(file: &RunFile) -> amr_particles::Result<AmrHierarchy> {
    let d = &file.domain;
    let geom = Geometry::new(
        DVec3::from_array(d.prob_lo),
        DVec3::from_array(d.prob_hi),
        IndexBox::cube(d.n_cell),
        d.periodic,
    );
    let boxes = BoxArray::single(geom.domain).max_size(d.max_grid_size);
    let dmap = DistributionMap::round_robin(boxes.len(), 1);
    let mut hierarchy = AmrHierarchy::new(geom, boxes, dmap)?.with_subcycling(file.subcycle);
    for level in &file.levels {
        let region = IndexBox::new(IVec3::from_array(level.lo), IVec3::from_array(level.hi));
        let boxes = BoxArray::single(region).max_size(d.max_grid_size);
        let dmap = DistributionMap::round_robin(boxes.len(), 1);
        hierarchy.push_level(level.ratio, boxes, dmap)?;
    }
    Ok(hierarchy)
}

fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let file: RunFile = serde_json::from_str(&text)?;

    let hierarchy = build_hierarchy(&file)?;
    let mut ctx = SimulationContext::new(file.run.clone(), file.particles.clone(), hierarchy)?;
    if file.run.do_grav {
        ctx = match file.gravity {
            GravityConfig::Uniform { g } => ctx.with_gravity(Box::new(UniformGravity::new(DVec3::from_array(g)))),
            GravityConfig::Tree(config) => ctx.with_gravity(Box::new(TreeGravity::new(config))),
        };
    }
    if let Some(z) = file.initial_redshift {
        ctx = ctx.with_cosmology(Box::new(EinsteinDeSitter::from_redshift(z, 1.0)));
    }

    match &file.restart_dir {
        Some(dir) => ctx.post_restart(dir)?,
        None => {
            ctx.init_particles()?;
            if let Some(frac) = file.baryon_fraction {
                ctx.apply_baryon_fraction(frac);
            }
        }
    }
    ctx.init_gravity()?;
    info!(
        "{} particles on {} levels, total mass {:.6e}",
        ctx.num_particles(),
        ctx.hierarchy().num_levels(),
        ctx.total_particle_mass()
    );

    for step in 1..=file.steps {
        let dt = match file.dt {
            Some(dt) => dt,
            None => {
                let est = ctx.estimate_coarse_dt()?.ok_or("no particle limits the timestep; set dt")?;
                file.max_dt.map_or(est, |max| est.min(max))
            }
        };
        ctx.coarse_timestep(dt)?;
        info!(
            "STEP {step} TIME = {:.6e} DT = {dt:.6e} particles = {} deposited mass = {:.6e}",
            ctx.time(),
            ctx.num_particles(),
            ctx.deposited_mass()
        );
    }

    if let Some(dir) = &file.checkpoint_dir {
        ctx.checkpoint(dir)?;
        info!("wrote checkpoint to {}", dir.display());
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: amr-particles <run.json>");
        process::exit(2);
    };
    if let Err(e) = run(Path::new(&path)) {
        error!("{e}");
        process::exit(1);
    }
}
