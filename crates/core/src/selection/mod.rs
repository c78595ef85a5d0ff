//! Selection expression evaluation.
//!
//! A selection is compiled (elsewhere) into a tree of [`element::Element`]
//! nodes owned by an [`element::ElementTree`]; this module evaluates such
//! trees frame by frame over a trajectory. The pieces:
//!
//! - [`index`] — sorted atom index groups and their set algebra
//! - [`value`] — typed value buffers attached to elements
//! - [`mempool`] — the frame-scoped scratch buffer pool
//! - [`position`] — reference positions and their per-frame update
//! - [`methods`] — the method callback surface plus built-in keywords
//! - [`element`] — the compiled tree and its builder API
//! - [`eval`] — per-kind evaluation routines and the RAII guards
//! - [`collection`] — the frame evaluation driver and selection stats

pub mod collection;
pub mod element;
pub mod error;
pub mod eval;
pub mod index;
pub mod mempool;
pub mod methods;
pub mod position;
pub mod value;

pub use collection::{Selection, SelectionCollection};
pub use element::{ArithOp, Element, ElementId, ElementKind, ElementTree, Evaluator, RootScope};
pub use error::{EvalError, EvalResult};
pub use eval::{evaluate_element, EvalContext};
pub use index::IndexGroup;
pub use mempool::MemPool;
pub use value::{Value, ValueData, ValueKind};
