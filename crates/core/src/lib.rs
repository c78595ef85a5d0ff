//! Core library for trajsel.
//!
//! Pure Rust implementation of the atom-selection evaluation engine:
//! compiled selection trees are evaluated frame by frame against a
//! topology and trajectory coordinates, producing atom index sets,
//! numeric scalars, or reference positions.

pub mod selection;
pub mod topology;
pub mod util;
