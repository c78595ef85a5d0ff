//! The method callback surface of expression elements, plus the built-in
//! keyword methods.
//!
//! A compiled METHOD/MODIFIER element owns a boxed [`SelectionMethod`].
//! The evaluator drives it through three hooks: an optional per-frame
//! initialization (run once per frame, on first use), a plain per-atom
//! update, and a position-based update used when a reference-position
//! calculation is attached or the element is a modifier.

use rustc_hash::FxHashSet;

use crate::selection::error::{EvalError, EvalResult};
use crate::selection::eval::EvalContext;
use crate::selection::index::IndexGroup;
use crate::selection::position::PositionSet;
use crate::selection::value::Value;
use crate::util::distance_squared;

/// Compiled method callbacks for one expression element.
pub trait SelectionMethod {
    fn name(&self) -> &'static str;

    /// Whether [`init_frame`](Self::init_frame) must run once per frame.
    fn has_frame_init(&self) -> bool {
        false
    }

    /// Per-frame initialization hook.
    fn init_frame(&mut self, _ctx: &EvalContext<'_>) -> EvalResult {
        Ok(())
    }

    /// Evaluate the method for the atoms in `g`, writing into `out`.
    fn update(&mut self, ctx: &EvalContext<'_>, g: &IndexGroup, out: &mut Value) -> EvalResult;

    /// Evaluate the method from reference positions instead of raw atoms.
    fn pos_update(
        &mut self,
        _ctx: &EvalContext<'_>,
        _pos: &PositionSet,
        _out: &mut Value,
    ) -> EvalResult {
        Err(EvalError::internal(format!(
            "method '{}' has no position-based update",
            self.name()
        )))
    }
}

/// `mass` — per-atom mass from the topology.
pub struct MassKeyword;

impl SelectionMethod for MassKeyword {
    fn name(&self) -> &'static str {
        "mass"
    }

    fn update(&mut self, ctx: &EvalContext<'_>, g: &IndexGroup, out: &mut Value) -> EvalResult {
        let vals = out.data.reals_mut()?;
        vals.clear();
        vals.extend(g.as_slice().iter().map(|&i| ctx.top.masses[i]));
        out.nr = g.len();
        Ok(())
    }
}

/// `charge` — per-atom partial charge from the topology.
pub struct ChargeKeyword;

impl SelectionMethod for ChargeKeyword {
    fn name(&self) -> &'static str {
        "charge"
    }

    fn update(&mut self, ctx: &EvalContext<'_>, g: &IndexGroup, out: &mut Value) -> EvalResult {
        let vals = out.data.reals_mut()?;
        vals.clear();
        vals.extend(g.as_slice().iter().map(|&i| ctx.top.charges[i]));
        out.nr = g.len();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// `x`/`y`/`z` — one coordinate component per atom from the current frame.
pub struct CoordinateKeyword {
    pub axis: Axis,
}

impl SelectionMethod for CoordinateKeyword {
    fn name(&self) -> &'static str {
        match self.axis {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }

    fn update(&mut self, ctx: &EvalContext<'_>, g: &IndexGroup, out: &mut Value) -> EvalResult {
        let dim = match self.axis {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        };
        let vals = out.data.reals_mut()?;
        vals.clear();
        vals.extend(g.as_slice().iter().map(|&i| ctx.frame.coords[i][dim]));
        out.nr = g.len();
        Ok(())
    }
}

/// Frame time as a single scalar, broadcast over the evaluation group.
pub struct FrameTimeKeyword;

impl SelectionMethod for FrameTimeKeyword {
    fn name(&self) -> &'static str {
        "time"
    }

    fn update(&mut self, ctx: &EvalContext<'_>, _g: &IndexGroup, out: &mut Value) -> EvalResult {
        let vals = out.data.reals_mut()?;
        vals.clear();
        vals.push(ctx.frame.time);
        out.nr = 1;
        Ok(())
    }
}

/// `resname` — atoms whose residue label is in a fixed name set.
pub struct ResnameKeyword {
    names: FxHashSet<String>,
}

impl ResnameKeyword {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl SelectionMethod for ResnameKeyword {
    fn name(&self) -> &'static str {
        "resname"
    }

    fn update(&mut self, ctx: &EvalContext<'_>, g: &IndexGroup, out: &mut Value) -> EvalResult {
        let mut hits = Vec::new();
        for &i in g.as_slice() {
            if self.names.contains(ctx.top.residue_label_of(i).trim()) {
                hits.push(i);
            }
        }
        let group = out.data.group_mut()?;
        *group = IndexGroup::from_indices(hits);
        out.nr = group.len();
        Ok(())
    }
}

/// Uniform cell grid over a fixed set of source atoms, rebuilt per frame.
#[derive(Debug, Default)]
struct CellGrid {
    cell_size: f64,
    dims: [usize; 3],
    min: [f64; 3],
    cells: Vec<Vec<usize>>,
}

impl CellGrid {
    fn build(&mut self, coords: &[[f64; 3]], source: &IndexGroup, cell_size: f64) {
        self.cell_size = cell_size.max(0.1);
        let mut min = [f64::MAX; 3];
        let mut max = [f64::MIN; 3];
        for &i in source.as_slice() {
            for d in 0..3 {
                min[d] = min[d].min(coords[i][d]);
                max[d] = max[d].max(coords[i][d]);
            }
        }
        if source.is_empty() {
            min = [0.0; 3];
            max = [0.0; 3];
        }
        self.min = min;
        for d in 0..3 {
            self.dims[d] = ((max[d] - min[d]) / self.cell_size).ceil() as usize + 1;
        }
        let total = self.dims[0] * self.dims[1] * self.dims[2];
        self.cells.iter_mut().for_each(Vec::clear);
        self.cells.resize(total, Vec::new());
        for &i in source.as_slice() {
            let c = self.coords_of(&coords[i]);
            let idx = self.flat_index(c);
            self.cells[idx].push(i);
        }
    }

    /// Grid cell containing `p`, clamped to the grid bounds.
    fn coords_of(&self, p: &[f64; 3]) -> [usize; 3] {
        let mut c = [0usize; 3];
        for d in 0..3 {
            let raw = (p[d] - self.min[d]) / self.cell_size;
            c[d] = if raw < 0.0 {
                0
            } else {
                (raw as usize).min(self.dims[d] - 1)
            };
        }
        c
    }

    fn flat_index(&self, c: [usize; 3]) -> usize {
        c[0] * self.dims[1] * self.dims[2] + c[1] * self.dims[2] + c[2]
    }

    /// True if any source atom lies within `cutoff_sq` of `p`.
    fn any_within(&self, coords: &[[f64; 3]], p: &[f64; 3], cutoff_sq: f64) -> bool {
        let c = self.coords_of(p);
        let lo = |v: usize| v.saturating_sub(1);
        let hi = |v: usize, d: usize| (v + 1).min(self.dims[d] - 1);
        for ix in lo(c[0])..=hi(c[0], 0) {
            for iy in lo(c[1])..=hi(c[1], 1) {
                for iz in lo(c[2])..=hi(c[2], 2) {
                    let cell = self.flat_index([ix, iy, iz]);
                    for &j in &self.cells[cell] {
                        if distance_squared(p, &coords[j]) <= cutoff_sq {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }
}

/// `within <cutoff> of <reference>` — atoms within a distance of any
/// reference atom. The cell grid over the reference atoms is rebuilt once
/// per frame via the frame-init hook.
pub struct WithinKeyword {
    cutoff: f64,
    reference: IndexGroup,
    grid: CellGrid,
}

impl WithinKeyword {
    pub fn new(cutoff: f64, reference: IndexGroup) -> Self {
        Self {
            cutoff,
            reference,
            grid: CellGrid::default(),
        }
    }
}

impl SelectionMethod for WithinKeyword {
    fn name(&self) -> &'static str {
        "within"
    }

    fn has_frame_init(&self) -> bool {
        true
    }

    fn init_frame(&mut self, ctx: &EvalContext<'_>) -> EvalResult {
        self.grid
            .build(&ctx.frame.coords, &self.reference, self.cutoff);
        Ok(())
    }

    fn update(&mut self, ctx: &EvalContext<'_>, g: &IndexGroup, out: &mut Value) -> EvalResult {
        let cutoff_sq = self.cutoff * self.cutoff;
        let group = out.data.group_mut()?;
        group.clear();
        let mut hits = Vec::new();
        if !self.reference.is_empty() {
            for &i in g.as_slice() {
                if self
                    .grid
                    .any_within(&ctx.frame.coords, &ctx.frame.coords[i], cutoff_sq)
                {
                    hits.push(i);
                }
            }
        }
        *group = IndexGroup::from_indices(hits);
        out.nr = group.len();
        Ok(())
    }
}

/// A position-consuming modifier that records the reference positions it
/// is handed each frame (e.g. for trajectory-wide post-processing).
#[derive(Default)]
pub struct RecordPositionsModifier {
    pub history: Vec<Vec<[f64; 3]>>,
}

impl SelectionMethod for RecordPositionsModifier {
    fn name(&self) -> &'static str {
        "record_positions"
    }

    fn update(&mut self, _ctx: &EvalContext<'_>, _g: &IndexGroup, _out: &mut Value) -> EvalResult {
        Err(EvalError::internal(
            "record_positions only supports position input",
        ))
    }

    fn pos_update(
        &mut self,
        _ctx: &EvalContext<'_>,
        pos: &PositionSet,
        out: &mut Value,
    ) -> EvalResult {
        self.history.push(pos.coords.clone());
        out.nr = 0;
        Ok(())
    }
}
