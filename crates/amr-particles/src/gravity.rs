//! Gravitational field solvers sampled by the particle integrator.
//!
//! The orchestrator only sees the [`GravitySolver`] trait: it swaps time
//! levels, asks for old/new solves over a level range and samples the
//! resulting acceleration as a [`MultiField`] with enough ghost cells for the
//! particles' interpolation stencils.

use std::sync::Arc;

use glam::{BVec3, DVec3, IVec3};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::amr::{AmrHierarchy, Geometry};
use crate::error::{ParticleError, Result};
use crate::field::MultiField;
use crate::registry::ContainerRegistry;
use crate::species::Role;

/// Which of the two stored field states to sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeLevel {
    Old,
    New,
}

/// Everything a solve may read.
#[derive(Clone, Copy)]
pub struct SolveInputs<'a> {
    pub hierarchy: &'a AmrHierarchy,
    pub registry: &'a ContainerRegistry,
    /// Ghost cells the sampled field must carry.
    pub n_grow: i32,
}

/// Level-by-level gravity as the orchestrator drives it.
///
/// A solver keeps an old and a new field per level. `solve_old` and
/// `solve_new` refresh one of them over a level range; `swap_time_levels`
/// shifts new to old before a level starts its next step.
pub trait GravitySolver {
    /// Make the new state of `level` the old one.
    fn swap_time_levels(&mut self, level: usize);

    /// Solve for the old-time field on `base..=finest`.
    fn solve_old(&mut self, inputs: SolveInputs<'_>, base: usize, finest: usize, use_previous_as_guess: bool)
        -> Result<()>;

    /// Solve for the new-time field on `base..=finest`; a single-level solve
    /// when `base == finest`.
    fn solve_new(&mut self, inputs: SolveInputs<'_>, base: usize, finest: usize, use_previous_as_guess: bool)
        -> Result<()>;

    /// Acceleration on `level` with at least `n_grow` ghost cells.
    fn grav_vector(&self, hierarchy: &AmrHierarchy, level: usize, time: TimeLevel, n_grow: i32)
        -> Result<MultiField>;

    /// Fold the field's coarse/fine flux mismatch into the reflux registers.
    fn add_to_fluxes(&mut self, _level: usize, _iteration: usize, _ncycle: usize) -> Result<()> {
        Ok(())
    }
}

/// The same acceleration everywhere, at all times.
///
/// Solves are no-ops; sampling returns `g` on every valid and ghost cell.
/// Useful for free-fall checks where the exact trajectory is known.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UniformGravity {
    pub g: DVec3,
}

impl UniformGravity {
    pub fn new(g: DVec3) -> Self {
        Self { g }
    }
}

impl GravitySolver for UniformGravity {
    fn swap_time_levels(&mut self, _level: usize) {}

    fn solve_old(&mut self, _: SolveInputs<'_>, _: usize, _: usize, _: bool) -> Result<()> {
        Ok(())
    }

    fn solve_new(&mut self, _: SolveInputs<'_>, _: usize, _: usize, _: bool) -> Result<()> {
        Ok(())
    }

    fn grav_vector(&self, hierarchy: &AmrHierarchy, level: usize, _: TimeLevel, n_grow: i32) -> Result<MultiField> {
        Ok(MultiField::uniform_vector(hierarchy.box_array(level), n_grow, self.g))
    }
}

/// Parameters of the tree solver.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeGravityConfig {
    /// Gravitational constant.
    pub g_const: f64,
    /// Plummer softening length.
    pub softening: f64,
    /// Opening angle; 0 is exact summation.
    pub theta: f64,
}

impl Default for TreeGravityConfig {
    fn default() -> Self {
        Self {
            g_const: 1.0,
            softening: 0.01,
            theta: 0.5,
        }
    }
}

/// Barnes-Hut octree node over a cube given by its center and half width.
///
/// Leaves hold one mass point; internal nodes hold the aggregate mass and
/// center of mass of their children. Children split the cube at `center`.
struct OctreeNode {
    center_of_mass: DVec3,
    total_mass: f64,
    center: DVec3,
    half_width: f64,
    children: [Option<Box<OctreeNode>>; 8],
    is_leaf: bool,
}

impl OctreeNode {
    fn new_leaf(pos: DVec3, mass: f64, center: DVec3, half_width: f64) -> Self {
        Self {
            center_of_mass: pos,
            total_mass: mass,
            center,
            half_width,
            children: Default::default(),
            is_leaf: true,
        }
    }

    fn new_internal(center: DVec3, half_width: f64) -> Self {
        Self {
            total_mass: 0.0,
            is_leaf: false,
            ..Self::new_leaf(DVec3::ZERO, 0.0, center, half_width)
        }
    }

    /// Child slot of `pos`: bit `d` is set on the upper half along axis `d`.
    fn child_slot(&self, pos: DVec3) -> usize {
        pos.cmpge(self.center).bitmask() as usize
    }

    fn child_center(&self, slot: usize) -> DVec3 {
        let upper = BVec3::new(slot & 1 != 0, slot & 2 != 0, slot & 4 != 0);
        let q = 0.5 * self.half_width;
        self.center + DVec3::select(upper, DVec3::splat(q), DVec3::splat(-q))
    }

    fn insert_into_child(&mut self, pos: DVec3, mass: f64, depth: u32) {
        let slot = self.child_slot(pos);
        match self.children[slot].as_mut() {
            Some(child) => child.insert(pos, mass, depth + 1),
            None => {
                let leaf = OctreeNode::new_leaf(pos, mass, self.child_center(slot), 0.5 * self.half_width);
                self.children[slot] = Some(Box::new(leaf));
            }
        }
    }

    fn absorb(&mut self, pos: DVec3, mass: f64) {
        let total = self.total_mass + mass;
        self.center_of_mass = (self.center_of_mass * self.total_mass + pos * mass) / total;
        self.total_mass = total;
    }

    fn insert(&mut self, pos: DVec3, mass: f64, depth: u32) {
        // Coincident points past this depth are merged into the leaf.
        if self.is_leaf && depth > 48 {
            self.absorb(pos, mass);
            return;
        }
        if self.is_leaf {
            // Split: push the existing point down; the aggregate stays as is.
            self.is_leaf = false;
            self.insert_into_child(self.center_of_mass, self.total_mass, depth);
        }
        self.insert_into_child(pos, mass, depth);
        self.absorb(pos, mass);
    }

    fn side(&self) -> f64 {
        2.0 * self.half_width
    }
}

/// Tree over `points`, rooted on the smallest cube that encloses them
/// with a small margin.
fn build_octree(points: &[(DVec3, f64)]) -> OctreeNode {
    let Some((first, _)) = points.first() else {
        return OctreeNode::new_internal(DVec3::ZERO, 0.0);
    };
    let (mut bmin, mut bmax) = (*first, *first);
    for (p, _) in points {
        bmin = bmin.min(*p);
        bmax = bmax.max(*p);
    }
    let extent = (bmax - bmin).max_element();
    let half_width = 0.5 * extent + 1e-6 + 1e-3 * extent;
    let mut root = OctreeNode::new_internal(0.5 * (bmin + bmax), half_width);
    for &(p, m) in points {
        root.insert(p, m, 0);
    }
    root
}

/// Acceleration at `pos` from every mass in the tree.
fn traverse_octree(root: &OctreeNode, pos: DVec3, cfg: &TreeGravityConfig) -> DVec3 {
    let softening_sq = cfg.softening * cfg.softening;
    let mut acc = DVec3::ZERO;
    let mut stack: Vec<&OctreeNode> = vec![root];

    while let Some(node) = stack.pop() {
        if node.total_mass <= 0.0 {
            continue;
        }
        let diff = node.center_of_mass - pos;
        let dist_sq = diff.length_squared() + softening_sq;
        let s = node.side();
        if node.is_leaf || s * s < cfg.theta * cfg.theta * dist_sq {
            let dist = dist_sq.sqrt();
            if dist > 1e-12 {
                acc += diff * (cfg.g_const * node.total_mass / (dist_sq * dist));
            }
        } else {
            stack.extend(node.children.iter().flatten().map(|c| c.as_ref()));
        }
    }
    acc
}

/// Self-gravity of the particles from a Barnes-Hut tree, evaluated at cell
/// centers (ghost cells included) when a level's field is sampled.
///
/// A solve snapshots the active particles into a tree; sampling evaluates
/// that tree on the level's current layout, so any ghost width can be served.
/// Free-space boundaries: periodic images are not summed.
#[derive(Default)]
pub struct TreeGravity {
    config: TreeGravityConfig,
    old: Vec<Option<Arc<OctreeNode>>>,
    new: Vec<Option<Arc<OctreeNode>>>,
}

impl TreeGravity {
    /// Solver with no field solved on any level yet.
    pub fn new(config: TreeGravityConfig) -> Self {
        Self {
            config,
            old: Vec::new(),
            new: Vec::new(),
        }
    }

    /// Every active particle on every level.
    fn snapshot(registry: &ContainerRegistry) -> Arc<OctreeNode> {
        let points: Vec<(DVec3, f64)> = registry
            .containers(Role::Active)
            .flat_map(|c| c.particles())
            .map(|p| (p.pos, p.mass))
            .collect();
        Arc::new(build_octree(&points))
    }

    /// Share `tree` across the slots of `base..=finest`.
    fn store(slots: &mut Vec<Option<Arc<OctreeNode>>>, tree: &Arc<OctreeNode>, base: usize, finest: usize) {
        if slots.len() <= finest {
            slots.resize_with(finest + 1, || None);
        }
        for slot in &mut slots[base..=finest] {
            *slot = Some(Arc::clone(tree));
        }
    }

    /// Acceleration at the center of every cell of `field`, ghost cells
    /// included, so the grown region needs no separate fill.
    fn evaluate(&self, tree: &OctreeNode, geom: &Geometry, field: &mut MultiField) {
        let center = |iv: IVec3| geom.cell_center(iv);
        let cfg = self.config;
        for i in 0..field.fabs().len() {
            let cells: Vec<IVec3> = field.fab(i).grown_box().cells().collect();

            #[cfg(feature = "parallel")]
            let accels: Vec<DVec3> = cells
                .par_iter()
                .map(|&iv| traverse_octree(tree, center(iv), &cfg))
                .collect();

            #[cfg(not(feature = "parallel"))]
            let accels: Vec<DVec3> = cells
                .iter()
                .map(|&iv| traverse_octree(tree, center(iv), &cfg))
                .collect();

            let fab = field.fab_mut(i);
            for (iv, a) in cells.into_iter().zip(accels) {
                for c in 0..3 {
                    fab.set(iv, c, a[c]);
                }
            }
        }
    }
}

impl GravitySolver for TreeGravity {
    fn swap_time_levels(&mut self, level: usize) {
        if self.new.len() <= level {
            self.new.resize_with(level + 1, || None);
        }
        if self.old.len() <= level {
            self.old.resize_with(level + 1, || None);
        }
        self.old[level] = self.new[level].take();
    }

    fn solve_old(&mut self, inputs: SolveInputs<'_>, base: usize, finest: usize, _: bool) -> Result<()> {
        let tree = Self::snapshot(inputs.registry);
        Self::store(&mut self.old, &tree, base, finest);
        Ok(())
    }

    fn solve_new(&mut self, inputs: SolveInputs<'_>, base: usize, finest: usize, _: bool) -> Result<()> {
        let tree = Self::snapshot(inputs.registry);
        Self::store(&mut self.new, &tree, base, finest);
        Ok(())
    }

    fn grav_vector(&self, hierarchy: &AmrHierarchy, level: usize, time: TimeLevel, n_grow: i32) -> Result<MultiField> {
        let slots = match time {
            TimeLevel::Old => &self.old,
            TimeLevel::New => &self.new,
        };
        let tree = slots.get(level).and_then(Option::as_ref).ok_or_else(|| {
            ParticleError::invariant(format!("no {time:?} gravity has been solved on level {level}"))
        })?;
        let mut mf = MultiField::new(hierarchy.box_array(level), 3, n_grow);
        self.evaluate(tree, hierarchy.geom(level), &mut mf);
        Ok(mf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accel_on(points: &[(DVec3, f64)], pos: DVec3, theta: f64) -> DVec3 {
        let cfg = TreeGravityConfig {
            g_const: 1.0,
            softening: 0.0,
            theta,
        };
        traverse_octree(&build_octree(points), pos, &cfg)
    }

    #[test]
    fn test_point_mass_attraction() {
        let a = accel_on(&[(DVec3::new(1.0, 0.0, 0.0), 2.0)], DVec3::ZERO, 0.0);
        assert!((a - DVec3::new(2.0, 0.0, 0.0)).length() < 1e-12);
    }

    #[test]
    fn test_inverse_square_falloff() {
        let near = accel_on(&[(DVec3::new(1.0, 0.0, 0.0), 1.0)], DVec3::ZERO, 0.0);
        let far = accel_on(&[(DVec3::new(2.0, 0.0, 0.0), 1.0)], DVec3::ZERO, 0.0);
        assert!((near.x / far.x - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_barnes_hut_approximation() {
        let cluster: Vec<(DVec3, f64)> = (0..8)
            .map(|i| (DVec3::new(10.0 + 0.1 * i as f64, 0.05 * i as f64, 0.0), 1.0))
            .collect();
        let exact = accel_on(&cluster, DVec3::ZERO, 0.0);
        let approx = accel_on(&cluster, DVec3::ZERO, 0.7);
        assert!((exact - approx).length() / exact.length() < 0.05);
    }

    #[test]
    fn test_tree_solve_samples_on_demand() {
        use crate::amr::Geometry;
        use crate::particle::Particle;
        use crate::species::SpeciesKind;

        let h = AmrHierarchy::single_box(Geometry::unit_periodic(4)).unwrap();
        let mut reg = ContainerRegistry::new();
        let entry = reg.register(SpeciesKind::DarkMatter, false).unwrap();
        entry
            .active
            .add_particles_at_level(vec![Particle::new(1, DVec3::splat(0.5), DVec3::ZERO, 1.0)], 0, &h, 0);

        let mut solver = TreeGravity::new(TreeGravityConfig::default());
        let inputs = SolveInputs {
            hierarchy: &h,
            registry: &reg,
            n_grow: 1,
        };
        assert!(solver.grav_vector(&h, 0, TimeLevel::New, 1).is_err());
        solver.solve_new(inputs, 0, 0, true).unwrap();
        let g = solver.grav_vector(&h, 0, TimeLevel::New, 3).unwrap();
        // Cell (0,0,0) is pulled toward the center of the box.
        let a = g.fab(0).get(IVec3::ZERO, 0);
        assert!(a > 0.0);

        solver.swap_time_levels(0);
        assert!(solver.grav_vector(&h, 0, TimeLevel::Old, 1).is_ok());
        assert!(solver.grav_vector(&h, 0, TimeLevel::New, 1).is_err());
    }

    #[test]
    fn test_children_tile_the_parent_cube() {
        let node = OctreeNode::new_internal(DVec3::ZERO, 2.0);
        for slot in 0..8 {
            let c = node.child_center(slot);
            assert_eq!(c.abs(), DVec3::ONE);
            assert_eq!(node.child_slot(c), slot);
        }
        assert_eq!(node.child_slot(DVec3::new(0.5, -0.5, 0.5)), 0b101);
    }

    #[test]
    fn test_coincident_points_do_not_recurse_forever() {
        let same = vec![(DVec3::splat(0.5), 1.0); 4];
        let a = accel_on(&same, DVec3::ZERO, 0.0);
        assert!(a.length() > 0.0);
    }
}
