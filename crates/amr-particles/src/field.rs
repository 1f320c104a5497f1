//! Cell-centered multi-component grid data over one level.
//!
//! A `MultiField` holds one `FieldBox` per box of the level, each grown by
//! `n_grow` ghost cells. Particles interact with it through the cloud-in-cell
//! kernel: `deposit_cic` scatters, `interpolate_cic` gathers.

use glam::{DVec3, IVec3};

use crate::amr::{BoxArray, Geometry, IndexBox};

/// Data for one box, including its ghost region.
#[derive(Clone, Debug)]
pub struct FieldBox {
    valid: IndexBox,
    grown: IndexBox,
    n_comp: usize,
    data: Vec<f64>,
}

impl FieldBox {
    pub fn new(valid: IndexBox, n_grow: i32, n_comp: usize) -> Self {
        let grown = valid.grow(n_grow);
        Self {
            valid,
            grown,
            n_comp,
            data: vec![0.0; grown.num_cells() * n_comp],
        }
    }

    pub fn valid_box(&self) -> &IndexBox {
        &self.valid
    }

    pub fn grown_box(&self) -> &IndexBox {
        &self.grown
    }

    #[inline]
    fn offset(&self, iv: IVec3, comp: usize) -> usize {
        let s = self.grown.size();
        let r = iv - self.grown.lo;
        let cell = r.x as usize + s.x as usize * (r.y as usize + s.y as usize * r.z as usize);
        comp * self.grown.num_cells() + cell
    }

    #[inline]
    pub fn get(&self, iv: IVec3, comp: usize) -> f64 {
        self.data[self.offset(iv, comp)]
    }

    #[inline]
    pub fn set(&mut self, iv: IVec3, comp: usize, value: f64) {
        let o = self.offset(iv, comp);
        self.data[o] = value;
    }

    #[inline]
    pub fn add(&mut self, iv: IVec3, comp: usize, value: f64) {
        let o = self.offset(iv, comp);
        self.data[o] += value;
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }
}

/// Lower corner of the 2x2x2 CIC stencil and the weights toward the upper corner.
#[inline]
fn cic_stencil(geom: &Geometry, pos: DVec3) -> (IVec3, DVec3) {
    let lx = (pos - geom.prob_lo) / geom.cell_size() + geom.domain.lo.as_dvec3() - DVec3::splat(0.5);
    let base = lx.floor();
    (base.as_ivec3(), lx - base)
}

#[inline]
fn cic_weight(frac: DVec3, corner: IVec3) -> f64 {
    let w = |d: usize| if corner[d] == 1 { frac[d] } else { 1.0 - frac[d] };
    w(0) * w(1) * w(2)
}

const CORNERS: [IVec3; 8] = [
    IVec3::new(0, 0, 0),
    IVec3::new(1, 0, 0),
    IVec3::new(0, 1, 0),
    IVec3::new(1, 1, 0),
    IVec3::new(0, 0, 1),
    IVec3::new(1, 0, 1),
    IVec3::new(0, 1, 1),
    IVec3::new(1, 1, 1),
];

/// A field defined on every box of one level.
#[derive(Clone, Debug)]
pub struct MultiField {
    boxes: BoxArray,
    n_grow: i32,
    n_comp: usize,
    fabs: Vec<FieldBox>,
}

impl MultiField {
    pub fn new(boxes: &BoxArray, n_comp: usize, n_grow: i32) -> Self {
        Self {
            boxes: boxes.clone(),
            n_grow,
            n_comp,
            fabs: boxes.iter().map(|b| FieldBox::new(*b, n_grow, n_comp)).collect(),
        }
    }

    /// Field with the same constant vector in every cell (ghosts included).
    pub fn uniform_vector(boxes: &BoxArray, n_grow: i32, value: DVec3) -> Self {
        let mut mf = Self::new(boxes, 3, n_grow);
        for fab in &mut mf.fabs {
            let n = fab.grown.num_cells();
            for c in 0..3 {
                fab.data[c * n..(c + 1) * n].fill(value[c]);
            }
        }
        mf
    }

    pub fn n_grow(&self) -> i32 {
        self.n_grow
    }

    pub fn n_comp(&self) -> usize {
        self.n_comp
    }

    pub fn box_array(&self) -> &BoxArray {
        &self.boxes
    }

    pub fn fab(&self, i: usize) -> &FieldBox {
        &self.fabs[i]
    }

    pub fn fab_mut(&mut self, i: usize) -> &mut FieldBox {
        &mut self.fabs[i]
    }

    pub fn fabs(&self) -> &[FieldBox] {
        &self.fabs
    }

    pub fn set_val(&mut self, value: f64) {
        self.fabs.iter_mut().for_each(|f| f.fill(value));
    }

    /// Box whose grown region holds the whole stencil, trying `hint` first.
    fn fab_for_stencil(&self, hint: Option<usize>, lo: IVec3) -> Option<usize> {
        let covers = |f: &FieldBox| f.grown.contains(lo) && f.grown.contains(lo + IVec3::ONE);
        if let Some(h) = hint {
            if self.fabs.get(h).is_some_and(covers) {
                return Some(h);
            }
        }
        self.fabs.iter().position(covers)
    }

    /// Scatter `values` (one per component) with cloud-in-cell weights.
    ///
    /// Returns `false` when no box's grown region covers the stencil.
    pub fn deposit_cic(
        &mut self,
        geom: &Geometry,
        hint: Option<usize>,
        pos: DVec3,
        values: &[f64],
    ) -> bool {
        let (lo, frac) = cic_stencil(geom, pos);
        let Some(b) = self.fab_for_stencil(hint, lo) else {
            return false;
        };
        let fab = &mut self.fabs[b];
        for corner in CORNERS {
            let w = cic_weight(frac, corner);
            for (c, v) in values.iter().enumerate().take(fab.n_comp) {
                fab.add(lo + corner, c, v * w);
            }
        }
        true
    }

    /// Gather the first three components at `pos` with cloud-in-cell weights.
    pub fn interpolate_cic(&self, geom: &Geometry, hint: Option<usize>, pos: DVec3) -> Option<DVec3> {
        let (lo, frac) = cic_stencil(geom, pos);
        let fab = &self.fabs[self.fab_for_stencil(hint, lo)?];
        let mut out = DVec3::ZERO;
        for corner in CORNERS {
            let w = cic_weight(frac, corner);
            for c in 0..3.min(fab.n_comp) {
                out[c] += w * fab.get(lo + corner, c);
            }
        }
        Some(out)
    }

    /// Map a cell index into the domain across periodic faces.
    fn periodic_image(geom: &Geometry, iv: IVec3) -> Option<IVec3> {
        let dom = geom.domain;
        let n = dom.size();
        let mut out = iv;
        for d in 0..3 {
            if iv[d] >= dom.lo[d] && iv[d] <= dom.hi[d] {
                continue;
            }
            if !geom.periodic[d] {
                return None;
            }
            out[d] = dom.lo[d] + (iv[d] - dom.lo[d]).rem_euclid(n[d]);
        }
        Some(out)
    }

    fn ghost_cells(fab: &FieldBox) -> impl Iterator<Item = IVec3> + '_ {
        fab.grown.cells().filter(move |iv| !fab.valid.contains(*iv))
    }

    /// Fold ghost-cell contents into the valid cells that own them.
    ///
    /// Contributions landing outside every box of the level (or outside a
    /// non-periodic domain) stay in the ghost cells and are not counted by
    /// `valid_sum`.
    pub fn sum_boundary(&mut self, geom: &Geometry) {
        let mut moves: Vec<(usize, IVec3, usize, IVec3)> = Vec::new();
        for (src, fab) in self.fabs.iter().enumerate() {
            for g in Self::ghost_cells(fab) {
                let Some(img) = Self::periodic_image(geom, g) else {
                    continue;
                };
                if let Some(dst) = self.boxes.find(img) {
                    moves.push((src, g, dst, img));
                }
            }
        }
        for (src, g, dst, img) in moves {
            for c in 0..self.n_comp {
                let v = self.fabs[src].get(g, c);
                if v != 0.0 {
                    self.fabs[src].set(g, c, 0.0);
                    self.fabs[dst].add(img, c, v);
                }
            }
        }
    }

    /// Copy valid values into every ghost cell that has an owner.
    pub fn fill_boundary(&mut self, geom: &Geometry) {
        let mut copies: Vec<(usize, IVec3, usize, IVec3)> = Vec::new();
        for (dst, fab) in self.fabs.iter().enumerate() {
            for g in Self::ghost_cells(fab) {
                let Some(img) = Self::periodic_image(geom, g) else {
                    continue;
                };
                if let Some(src) = self.boxes.find(img) {
                    copies.push((dst, g, src, img));
                }
            }
        }
        for (dst, g, src, img) in copies {
            for c in 0..self.n_comp {
                let v = self.fabs[src].get(img, c);
                self.fabs[dst].set(g, c, v);
            }
        }
    }

    /// Add this (finer) field's contents into `coarse`, conserving the
    /// volume integral: each fine cell contributes `value / ratio^3` to the
    /// coarse cell covering it.
    ///
    /// Unowned ghost contents left by `sum_boundary` are carried down as well,
    /// so mass deposited just outside the fine boxes is not lost.
    pub fn sum_into_coarse(
        &self,
        fine_geom: &Geometry,
        coarse: &mut MultiField,
        ratio: i32,
    ) {
        let scale = 1.0 / (ratio * ratio * ratio) as f64;
        for fab in &self.fabs {
            for iv in fab.grown.cells() {
                let Some(img) = Self::periodic_image(fine_geom, iv) else {
                    continue;
                };
                let civ = img.div_euclid(IVec3::splat(ratio));
                let Some(dst) = coarse.boxes.find(civ) else {
                    continue;
                };
                for c in 0..self.n_comp.min(coarse.n_comp) {
                    let v = fab.get(iv, c);
                    if v != 0.0 {
                        coarse.fabs[dst].add(civ, c, v * scale);
                    }
                }
            }
        }
    }

    /// Sum of component `comp` over valid cells only.
    pub fn valid_sum(&self, comp: usize) -> f64 {
        self.fabs
            .iter()
            .map(|f| f.valid.cells().map(|iv| f.get(iv, comp)).sum::<f64>())
            .sum()
    }

    /// Largest magnitude of component `comp` over valid cells.
    pub fn max_abs(&self, comp: usize) -> f64 {
        self.fabs
            .iter()
            .flat_map(|f| f.valid.cells().map(move |iv| f.get(iv, comp).abs()))
            .fold(0.0, f64::max)
    }
}
