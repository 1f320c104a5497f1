use glam::{DVec3, IVec3};
use serde::{Deserialize, Serialize};

use crate::error::{ParticleError, Result};

/// Inclusive, cell-centered integer box `[lo, hi]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexBox {
    pub lo: IVec3,
    pub hi: IVec3,
}

impl IndexBox {
    pub fn new(lo: IVec3, hi: IVec3) -> Self {
        Self { lo, hi }
    }

    /// Box of `n` cells per side starting at the origin.
    pub fn cube(n: i32) -> Self {
        Self::new(IVec3::ZERO, IVec3::splat(n - 1))
    }

    pub fn is_empty(&self) -> bool {
        self.hi.cmplt(self.lo).any()
    }

    /// Number of cells along each axis.
    pub fn size(&self) -> IVec3 {
        self.hi - self.lo + IVec3::ONE
    }

    pub fn num_cells(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let s = self.size();
        s.x as usize * s.y as usize * s.z as usize
    }

    #[inline]
    pub fn contains(&self, iv: IVec3) -> bool {
        iv.cmpge(self.lo).all() && iv.cmple(self.hi).all()
    }

    pub fn contains_box(&self, other: &IndexBox) -> bool {
        self.contains(other.lo) && self.contains(other.hi)
    }

    pub fn grow(&self, n: i32) -> Self {
        Self::new(self.lo - IVec3::splat(n), self.hi + IVec3::splat(n))
    }

    pub fn refine(&self, ratio: i32) -> Self {
        Self::new(self.lo * ratio, (self.hi + IVec3::ONE) * ratio - IVec3::ONE)
    }

    pub fn coarsen(&self, ratio: i32) -> Self {
        Self::new(
            self.lo.div_euclid(IVec3::splat(ratio)),
            self.hi.div_euclid(IVec3::splat(ratio)),
        )
    }

    pub fn shift(&self, offset: IVec3) -> Self {
        Self::new(self.lo + offset, self.hi + offset)
    }

    pub fn intersection(&self, other: &IndexBox) -> Option<IndexBox> {
        let b = IndexBox::new(self.lo.max(other.lo), self.hi.min(other.hi));
        (!b.is_empty()).then_some(b)
    }

    /// Split along `axis` so that the first half ends at cell `at - 1`.
    pub fn split(&self, axis: usize, at: i32) -> Option<(IndexBox, IndexBox)> {
        if at <= self.lo[axis] || at > self.hi[axis] {
            return None;
        }
        let mut left = *self;
        let mut right = *self;
        left.hi[axis] = at - 1;
        right.lo[axis] = at;
        Some((left, right))
    }

    /// Split in half along the longest axis.
    pub fn bisect(&self) -> Option<(IndexBox, IndexBox)> {
        let s = self.size();
        let axis = if s.x >= s.y && s.x >= s.z {
            0
        } else if s.y >= s.z {
            1
        } else {
            2
        };
        self.split(axis, self.lo[axis] + s[axis] / 2)
    }

    /// Iterate every cell index in the box, x fastest.
    pub fn cells(&self) -> impl Iterator<Item = IVec3> + '_ {
        let (lo, hi) = (self.lo, self.hi);
        (lo.z..=hi.z).flat_map(move |k| {
            (lo.y..=hi.y).flat_map(move |j| (lo.x..=hi.x).map(move |i| IVec3::new(i, j, k)))
        })
    }
}

/// Ordered collection of disjoint boxes making up one level.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxArray(Vec<IndexBox>);

impl BoxArray {
    pub fn new(boxes: Vec<IndexBox>) -> Self {
        Self(boxes)
    }

    pub fn single(bx: IndexBox) -> Self {
        Self(vec![bx])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&IndexBox> {
        self.0.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IndexBox> {
        self.0.iter()
    }

    pub fn boxes(&self) -> &[IndexBox] {
        &self.0
    }

    /// Index of the box containing `iv`.
    pub fn find(&self, iv: IVec3) -> Option<usize> {
        self.0.iter().position(|b| b.contains(iv))
    }

    /// Index of the first box which, grown by `n` cells, contains `iv`.
    pub fn find_grown(&self, iv: IVec3, n: i32) -> Option<usize> {
        self.find(iv)
            .or_else(|| self.0.iter().position(|b| b.grow(n).contains(iv)))
    }

    pub fn refine(&self, ratio: i32) -> Self {
        Self(self.0.iter().map(|b| b.refine(ratio)).collect())
    }

    pub fn num_cells(&self) -> usize {
        self.0.iter().map(IndexBox::num_cells).sum()
    }

    /// Chop boxes until no side exceeds `max_size` cells.
    pub fn max_size(&self, max_size: i32) -> Self {
        let mut out = Vec::with_capacity(self.0.len());
        let mut stack: Vec<IndexBox> = self.0.iter().rev().copied().collect();
        while let Some(b) = stack.pop() {
            if b.size().max_element() > max_size {
                if let Some((l, r)) = b.bisect() {
                    stack.push(r);
                    stack.push(l);
                    continue;
                }
            }
            out.push(b);
        }
        Self(out)
    }

    /// Replace box `i` with its two halves (the second half is appended).
    pub fn split_box(&mut self, i: usize) -> Option<usize> {
        let (l, r) = self.0.get(i)?.bisect()?;
        self.0[i] = l;
        self.0.push(r);
        Some(self.0.len() - 1)
    }
}

/// Box index -> owning rank.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionMap(Vec<usize>);

impl DistributionMap {
    pub fn new(ranks: Vec<usize>) -> Self {
        Self(ranks)
    }

    pub fn round_robin(n_boxes: usize, n_ranks: usize) -> Self {
        Self((0..n_boxes).map(|i| i % n_ranks.max(1)).collect())
    }

    pub fn rank(&self, box_index: usize) -> Option<usize> {
        self.0.get(box_index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Physical extent and index space of one level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub prob_lo: DVec3,
    pub prob_hi: DVec3,
    pub domain: IndexBox,
    pub periodic: [bool; 3],
}

impl Geometry {
    pub fn new(prob_lo: DVec3, prob_hi: DVec3, domain: IndexBox, periodic: [bool; 3]) -> Self {
        Self {
            prob_lo,
            prob_hi,
            domain,
            periodic,
        }
    }

    /// Unit cube, `n` cells per side, periodic in every direction.
    pub fn unit_periodic(n: i32) -> Self {
        Self::new(DVec3::ZERO, DVec3::ONE, IndexBox::cube(n), [true; 3])
    }

    pub fn prob_length(&self) -> DVec3 {
        self.prob_hi - self.prob_lo
    }

    pub fn cell_size(&self) -> DVec3 {
        self.prob_length() / self.domain.size().as_dvec3()
    }

    pub fn cell_volume(&self) -> f64 {
        let dx = self.cell_size();
        dx.x * dx.y * dx.z
    }

    pub fn refine(&self, ratio: i32) -> Self {
        Self {
            domain: self.domain.refine(ratio),
            ..self.clone()
        }
    }

    /// Cell containing `pos`.
    #[inline]
    pub fn cell_index(&self, pos: DVec3) -> IVec3 {
        ((pos - self.prob_lo) / self.cell_size()).floor().as_ivec3() + self.domain.lo
    }

    /// Physical position of the center of cell `iv`. Ghost cells outside
    /// the domain map past its faces.
    pub fn cell_center(&self, iv: IVec3) -> DVec3 {
        self.prob_lo + ((iv - self.domain.lo).as_dvec3() + 0.5) * self.cell_size()
    }

    pub fn in_domain(&self, pos: DVec3) -> bool {
        pos.cmpge(self.prob_lo).all() && pos.cmplt(self.prob_hi).all()
    }

    /// Map `pos` back into the domain across periodic faces.
    ///
    /// Returns `None` if the position leaves the domain through a
    /// non-periodic face.
    pub fn wrap_periodic(&self, pos: DVec3) -> Option<DVec3> {
        let len = self.prob_length();
        let mut p = pos;
        for d in 0..3 {
            if p[d] >= self.prob_lo[d] && p[d] < self.prob_hi[d] {
                continue;
            }
            if !self.periodic[d] {
                return None;
            }
            p[d] = self.prob_lo[d] + (p[d] - self.prob_lo[d]).rem_euclid(len[d]);
            // rem_euclid can round up to exactly the upper face
            if p[d] >= self.prob_hi[d] {
                p[d] = self.prob_lo[d];
            }
        }
        Some(p)
    }
}

/// One level of the hierarchy: its layout plus the old/new time stamps.
#[derive(Clone, Debug)]
pub struct AmrLevel {
    pub geom: Geometry,
    pub boxes: BoxArray,
    pub dmap: DistributionMap,
    pub prev_time: f64,
    pub cur_time: f64,
    pub dt: f64,
}

impl AmrLevel {
    /// Box containing `pos`, if any.
    pub fn locate(&self, pos: DVec3) -> Option<usize> {
        self.boxes.find(self.geom.cell_index(pos))
    }

    /// Box which, grown by `n` cells, contains `pos`.
    pub fn locate_grown(&self, pos: DVec3, n: i32) -> Option<usize> {
        self.boxes.find_grown(self.geom.cell_index(pos), n)
    }
}

/// Nested level hierarchy supplying box layouts and rank assignments.
#[derive(Clone, Debug)]
pub struct AmrHierarchy {
    levels: Vec<AmrLevel>,
    /// Refinement ratio between level `l` and `l + 1`.
    ref_ratio: Vec<i32>,
    n_cycle: Vec<usize>,
    subcycle: bool,
}

impl AmrHierarchy {
    pub fn new(geom: Geometry, boxes: BoxArray, dmap: DistributionMap) -> Result<Self> {
        check_layout(&geom, &boxes, &dmap)?;
        Ok(Self {
            levels: vec![AmrLevel {
                geom,
                boxes,
                dmap,
                prev_time: 0.0,
                cur_time: 0.0,
                dt: 0.0,
            }],
            ref_ratio: Vec::new(),
            n_cycle: vec![1],
            subcycle: true,
        })
    }

    /// Single-level hierarchy covering the whole domain with one box on rank 0.
    pub fn single_box(geom: Geometry) -> Result<Self> {
        let boxes = BoxArray::single(geom.domain);
        Self::new(geom, boxes, DistributionMap::new(vec![0]))
    }

    pub fn with_subcycling(mut self, subcycle: bool) -> Self {
        self.subcycle = subcycle;
        self.reset_n_cycle();
        self
    }

    /// Add a finer level. `boxes` are in the index space of the new level.
    pub fn push_level(&mut self, ratio: i32, boxes: BoxArray, dmap: DistributionMap) -> Result<()> {
        if ratio < 1 {
            return Err(ParticleError::config(format!("refinement ratio {ratio} must be >= 1")));
        }
        let coarse = self.finest();
        let geom = coarse.geom.refine(ratio);
        check_layout(&geom, &boxes, &dmap)?;
        let (prev_time, cur_time) = (coarse.prev_time, coarse.cur_time);
        self.levels.push(AmrLevel {
            geom,
            boxes,
            dmap,
            prev_time,
            cur_time,
            dt: 0.0,
        });
        self.ref_ratio.push(ratio);
        self.reset_n_cycle();
        Ok(())
    }

    /// Replace the layout of an existing level (a regrid).
    pub fn set_level_layout(
        &mut self,
        level: usize,
        boxes: BoxArray,
        dmap: DistributionMap,
    ) -> Result<()> {
        let lev = self
            .levels
            .get_mut(level)
            .ok_or_else(|| ParticleError::invariant(format!("level {level} does not exist")))?;
        check_layout(&lev.geom, &boxes, &dmap)?;
        lev.boxes = boxes;
        lev.dmap = dmap;
        Ok(())
    }

    /// Drop every level finer than `level`.
    pub fn truncate(&mut self, level: usize) {
        self.levels.truncate(level + 1);
        self.ref_ratio.truncate(level);
        self.reset_n_cycle();
    }

    fn reset_n_cycle(&mut self) {
        self.n_cycle = std::iter::once(1)
            .chain(
                self.ref_ratio
                    .iter()
                    .map(|&r| if self.subcycle { r as usize } else { 1 }),
            )
            .collect();
    }

    /// Override the number of sub-steps level `level` takes per coarser step.
    pub fn set_n_cycle(&mut self, level: usize, n: usize) {
        if let Some(c) = self.n_cycle.get_mut(level) {
            *c = n.max(1);
        }
    }

    pub fn sub_cycle(&self) -> bool {
        self.subcycle
    }

    pub fn n_cycle(&self, level: usize) -> usize {
        self.n_cycle.get(level).copied().unwrap_or(1)
    }

    pub fn finest_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &AmrLevel {
        &self.levels[level]
    }

    pub fn level_mut(&mut self, level: usize) -> &mut AmrLevel {
        &mut self.levels[level]
    }

    pub fn levels(&self) -> &[AmrLevel] {
        &self.levels
    }

    fn finest(&self) -> &AmrLevel {
        &self.levels[self.levels.len() - 1]
    }

    pub fn geom(&self, level: usize) -> &Geometry {
        &self.levels[level].geom
    }

    pub fn box_array(&self, level: usize) -> &BoxArray {
        &self.levels[level].boxes
    }

    pub fn distribution_map(&self, level: usize) -> &DistributionMap {
        &self.levels[level].dmap
    }

    pub fn ref_ratio(&self, level: usize) -> i32 {
        self.ref_ratio.get(level).copied().unwrap_or(1)
    }

    pub fn dt_level(&self, level: usize) -> f64 {
        self.levels[level].dt
    }

    /// Set the coarse timestep and derive finer-level steps from `n_cycle`.
    pub fn set_coarse_dt(&mut self, dt: f64) {
        let mut dt_lev = dt;
        for l in 0..self.levels.len() {
            dt_lev /= self.n_cycle(l) as f64;
            self.levels[l].dt = dt_lev;
        }
    }

    /// Move the new time to the old time and advance the new time by `dt`.
    pub fn swap_time_levels(&mut self, level: usize, dt: f64) {
        let lev = &mut self.levels[level];
        lev.prev_time = lev.cur_time;
        lev.cur_time += dt;
    }

    /// Finest level in `[lev_min, finest]` whose boxes contain `pos`,
    /// falling back to coarser levels below `lev_min`.
    pub fn where_is(&self, pos: DVec3, lev_min: usize) -> Option<(usize, usize)> {
        let finer = (lev_min..self.levels.len()).rev();
        let coarser = (0..lev_min.min(self.levels.len())).rev();
        finer
            .chain(coarser)
            .find_map(|l| self.levels[l].locate(pos).map(|b| (l, b)))
    }

    /// Finest level in `[lev_min, finest]` containing `pos`, where the boxes
    /// of `lev_min` are grown by `n_grow` cells. Never falls back below
    /// `lev_min`.
    pub fn where_is_grown(&self, pos: DVec3, lev_min: usize, n_grow: i32) -> Option<(usize, usize)> {
        if lev_min >= self.levels.len() {
            return None;
        }
        ((lev_min + 1)..self.levels.len())
            .rev()
            .find_map(|l| self.levels[l].locate(pos).map(|b| (l, b)))
            .or_else(|| self.levels[lev_min].locate_grown(pos, n_grow).map(|b| (lev_min, b)))
    }
}

fn check_layout(geom: &Geometry, boxes: &BoxArray, dmap: &DistributionMap) -> Result<()> {
    if boxes.len() != dmap.len() {
        return Err(ParticleError::invariant(format!(
            "box array has {} boxes but distribution map has {} entries",
            boxes.len(),
            dmap.len()
        )));
    }
    if let Some(b) = boxes.iter().find(|b| !geom.domain.contains_box(b)) {
        return Err(ParticleError::config(format!(
            "box {:?}..{:?} lies outside the level domain",
            b.lo, b.hi
        )));
    }
    Ok(())
}
