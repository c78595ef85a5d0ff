//! Typed value buffers attached to selection tree elements.
//!
//! Each element materializes its result in a [`Value`]: a tagged buffer
//! plus the count of valid entries. The buffer length always equals the
//! cardinality of the group the element was last evaluated over (or 1 for
//! single-valued elements).

use crate::selection::error::{EvalError, EvalResult};
use crate::selection::index::IndexGroup;
use crate::selection::position::PositionSet;

/// Declared result type of a selection element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    None,
    Int,
    Real,
    Str,
    Position,
    Group,
}

/// The materialized value storage for one element.
#[derive(Debug, Clone)]
pub enum ValueData {
    None,
    Int(Vec<i64>),
    Real(Vec<f64>),
    Str(Vec<String>),
    Position(PositionSet),
    Group(IndexGroup),
}

impl ValueData {
    pub fn empty_of(kind: ValueKind) -> Self {
        match kind {
            ValueKind::None => ValueData::None,
            ValueKind::Int => ValueData::Int(Vec::new()),
            ValueKind::Real => ValueData::Real(Vec::new()),
            ValueKind::Str => ValueData::Str(Vec::new()),
            ValueKind::Position => ValueData::Position(PositionSet::new()),
            ValueKind::Group => ValueData::Group(IndexGroup::new()),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ValueData::None => ValueKind::None,
            ValueData::Int(_) => ValueKind::Int,
            ValueData::Real(_) => ValueKind::Real,
            ValueData::Str(_) => ValueKind::Str,
            ValueData::Position(_) => ValueKind::Position,
            ValueData::Group(_) => ValueKind::Group,
        }
    }

    pub fn group(&self) -> EvalResult<&IndexGroup> {
        match self {
            ValueData::Group(g) => Ok(g),
            other => Err(kind_error("group", other.kind())),
        }
    }

    pub fn group_mut(&mut self) -> EvalResult<&mut IndexGroup> {
        match self {
            ValueData::Group(g) => Ok(g),
            other => Err(kind_error("group", other.kind())),
        }
    }

    pub fn ints(&self) -> EvalResult<&Vec<i64>> {
        match self {
            ValueData::Int(v) => Ok(v),
            other => Err(kind_error("integer", other.kind())),
        }
    }

    pub fn ints_mut(&mut self) -> EvalResult<&mut Vec<i64>> {
        match self {
            ValueData::Int(v) => Ok(v),
            other => Err(kind_error("integer", other.kind())),
        }
    }

    pub fn reals(&self) -> EvalResult<&Vec<f64>> {
        match self {
            ValueData::Real(v) => Ok(v),
            other => Err(kind_error("real", other.kind())),
        }
    }

    pub fn reals_mut(&mut self) -> EvalResult<&mut Vec<f64>> {
        match self {
            ValueData::Real(v) => Ok(v),
            other => Err(kind_error("real", other.kind())),
        }
    }

    pub fn strings(&self) -> EvalResult<&Vec<String>> {
        match self {
            ValueData::Str(v) => Ok(v),
            other => Err(kind_error("string", other.kind())),
        }
    }

    pub fn strings_mut(&mut self) -> EvalResult<&mut Vec<String>> {
        match self {
            ValueData::Str(v) => Ok(v),
            other => Err(kind_error("string", other.kind())),
        }
    }

    pub fn positions(&self) -> EvalResult<&PositionSet> {
        match self {
            ValueData::Position(p) => Ok(p),
            other => Err(kind_error("position", other.kind())),
        }
    }

    pub fn positions_mut(&mut self) -> EvalResult<&mut PositionSet> {
        match self {
            ValueData::Position(p) => Ok(p),
            other => Err(kind_error("position", other.kind())),
        }
    }

    /// Reserve capacity for `count` entries without changing contents.
    pub fn reserve(&mut self, count: usize) {
        match self {
            ValueData::None => {}
            ValueData::Int(v) => v.reserve(count.saturating_sub(v.len())),
            ValueData::Real(v) => v.reserve(count.saturating_sub(v.len())),
            ValueData::Str(v) => v.reserve(count.saturating_sub(v.len())),
            ValueData::Position(p) => p.coords.reserve(count.saturating_sub(p.coords.len())),
            ValueData::Group(g) => {
                let mut storage = g.take_storage();
                storage.reserve(count.saturating_sub(storage.len()));
                g.replace_storage(storage);
            }
        }
    }
}

fn kind_error(wanted: &str, got: ValueKind) -> EvalError {
    EvalError::internal(format!("expected {wanted} value, found {got:?}"))
}

/// An element's value buffer plus its valid-entry count.
#[derive(Debug, Clone)]
pub struct Value {
    pub data: ValueData,
    /// Number of valid entries (1 for single-valued elements).
    pub nr: usize,
}

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Self {
            data: ValueData::empty_of(kind),
            nr: 0,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.data.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            ValueKind::None,
            ValueKind::Int,
            ValueKind::Real,
            ValueKind::Str,
            ValueKind::Position,
            ValueKind::Group,
        ] {
            assert_eq!(ValueData::empty_of(kind).kind(), kind);
        }
    }

    #[test]
    fn test_accessor_mismatch_is_internal_error() {
        let v = ValueData::empty_of(ValueKind::Real);
        assert!(v.group().is_err());
        assert!(v.ints().is_err());
        assert!(v.reals().is_ok());
    }
}
