//! Slim topology and trajectory-frame types consumed by the selection engine.
//!
//! No file I/O lives here; trajectory and topology readers are a separate
//! concern. These structs carry exactly the per-atom annotations the
//! keyword methods and per-selection statistics need.

/// Static per-atom information for one molecular system.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub n_atoms: usize,
    pub atom_names: Vec<String>,
    /// Residue label per residue (e.g. "ALA", "WAT").
    pub residue_labels: Vec<String>,
    /// Residue index per atom (0-based).
    pub residue_indices: Vec<usize>,
    pub masses: Vec<f64>,
    pub charges: Vec<f64>,
}

impl Topology {
    /// Residue label for a given atom.
    pub fn residue_label_of(&self, atom: usize) -> &str {
        &self.residue_labels[self.residue_indices[atom]]
    }
}

/// One trajectory frame: coordinates in Angstroms plus the frame time.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub time: f64,
    pub coords: Vec<[f64; 3]>,
}

impl Frame {
    pub fn new(time: f64, coords: Vec<[f64; 3]>) -> Self {
        Self { time, coords }
    }
}

/// Periodic boundary information (orthorhombic box edge lengths).
#[derive(Debug, Clone, Copy)]
pub struct Pbc {
    pub box_lengths: [f64; 3],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residue_label_of() {
        let top = Topology {
            n_atoms: 2,
            atom_names: vec!["N".to_string(), "O".to_string()],
            residue_labels: vec!["ALA".to_string(), "WAT".to_string()],
            residue_indices: vec![0, 1],
            masses: vec![14.0, 16.0],
            charges: vec![-0.4, -0.8],
        };
        assert_eq!(top.residue_label_of(0), "ALA");
        assert_eq!(top.residue_label_of(1), "WAT");
    }
}
