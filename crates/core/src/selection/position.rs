//! Reference positions for selection values and their per-frame update.
//!
//! A position set pairs coordinates with the index group they were
//! computed from. Position calculations are deliberately minimal: per-atom
//! passthrough, center of geometry, and mass-weighted center of mass.

use crate::selection::index::IndexGroup;
use crate::topology::{Frame, Topology};

/// A set of reference positions together with the atoms they represent.
#[derive(Debug, Clone, Default)]
pub struct PositionSet {
    pub group: IndexGroup,
    pub coords: Vec<[f64; 3]>,
}

impl PositionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Structural copy of another position set.
    pub fn copy_from(&mut self, src: &PositionSet) {
        self.group.copy_from(&src.group, false);
        self.coords.clear();
        self.coords.extend_from_slice(&src.coords);
    }

    pub fn clear(&mut self) {
        self.group.clear();
        self.coords.clear();
    }
}

/// How reference positions are derived from an atom group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionKind {
    /// One position per atom, straight from the frame coordinates.
    Atom,
    /// A single unweighted centroid for the whole group.
    CenterOfGeometry,
    /// A single mass-weighted center for the whole group.
    CenterOfMass,
}

/// Recomputes a [`PositionSet`] for the current frame.
#[derive(Debug, Clone, Copy)]
pub struct PositionCalc {
    pub kind: PositionKind,
}

impl PositionCalc {
    pub fn new(kind: PositionKind) -> Self {
        Self { kind }
    }

    /// Update `pos` to cover `group` using the coordinates in `frame`.
    pub fn update(
        &self,
        pos: &mut PositionSet,
        group: &IndexGroup,
        top: &Topology,
        frame: &Frame,
    ) {
        pos.group.copy_from(group, false);
        pos.coords.clear();
        match self.kind {
            PositionKind::Atom => {
                pos.coords
                    .extend(group.as_slice().iter().map(|&i| frame.coords[i]));
            }
            PositionKind::CenterOfGeometry => {
                pos.coords.push(centroid(group, frame, None));
            }
            PositionKind::CenterOfMass => {
                pos.coords.push(centroid(group, frame, Some(&top.masses)));
            }
        }
    }
}

fn centroid(group: &IndexGroup, frame: &Frame, weights: Option<&[f64]>) -> [f64; 3] {
    let mut sum = [0.0f64; 3];
    let mut wsum = 0.0;
    for &i in group.as_slice() {
        let w = weights.map_or(1.0, |m| m[i]);
        sum[0] += w * frame.coords[i][0];
        sum[1] += w * frame.coords[i][1];
        sum[2] += w * frame.coords[i][2];
        wsum += w;
    }
    if wsum > 0.0 {
        [sum[0] / wsum, sum[1] / wsum, sum[2] / wsum]
    } else {
        [0.0; 3]
    }
}
