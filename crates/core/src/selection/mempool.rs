//! Frame-scoped buffer pool for intermediate evaluation values.
//!
//! Boolean and subexpression evaluation constantly needs scratch buffers
//! sized to the current evaluation group. Rather than heap-allocating per
//! node per frame, the pool keeps freelists of typed buffers that are
//! handed out and returned within one evaluation call. Reservation
//! bookkeeping is exposed so tests can prove the RAII guards never leak a
//! buffer, even on an error path.

use std::cell::{Cell, RefCell};

use crate::selection::error::{EvalError, EvalResult};
use crate::selection::index::IndexGroup;
use crate::selection::position::PositionSet;
use crate::selection::value::{ValueData, ValueKind};

/// Pool of reusable evaluation buffers. Owned by one selection collection;
/// never shared across concurrently running collections.
#[derive(Debug, Default)]
pub struct MemPool {
    groups: RefCell<Vec<Vec<usize>>>,
    ints: RefCell<Vec<Vec<i64>>>,
    reals: RefCell<Vec<Vec<f64>>>,
    strings: RefCell<Vec<Vec<String>>>,
    positions: RefCell<Vec<PositionSet>>,
    outstanding: Cell<usize>,
    peak: Cell<usize>,
}

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers currently reserved.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// High-water mark of simultaneous reservations.
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    fn note_acquire(&self) {
        let n = self.outstanding.get() + 1;
        self.outstanding.set(n);
        if n > self.peak.get() {
            self.peak.set(n);
        }
    }

    fn note_release(&self) {
        self.outstanding.set(self.outstanding.get() - 1);
    }

    /// Take an index buffer with capacity for at least `count` entries.
    pub fn acquire_group(&self, count: usize) -> Vec<usize> {
        self.note_acquire();
        let mut buf = self.groups.borrow_mut().pop().unwrap_or_default();
        buf.clear();
        buf.reserve(count);
        buf
    }

    pub fn release_group(&self, mut buf: Vec<usize>) {
        buf.clear();
        self.groups.borrow_mut().push(buf);
        self.note_release();
    }

    /// Take a typed value buffer with capacity for at least `count` entries.
    /// `ValueKind::None` carries no storage and cannot be reserved.
    pub fn acquire_value(&self, kind: ValueKind, count: usize) -> EvalResult<ValueData> {
        let data = match kind {
            ValueKind::None => {
                return Err(EvalError::internal(
                    "cannot reserve pool storage for a valueless element",
                ))
            }
            ValueKind::Int => {
                let mut v = self.ints.borrow_mut().pop().unwrap_or_default();
                v.clear();
                v.reserve(count);
                ValueData::Int(v)
            }
            ValueKind::Real => {
                let mut v = self.reals.borrow_mut().pop().unwrap_or_default();
                v.clear();
                v.reserve(count);
                ValueData::Real(v)
            }
            ValueKind::Str => {
                let mut v = self.strings.borrow_mut().pop().unwrap_or_default();
                v.clear();
                v.reserve(count);
                ValueData::Str(v)
            }
            ValueKind::Position => {
                let mut p = self.positions.borrow_mut().pop().unwrap_or_default();
                p.clear();
                p.coords.reserve(count);
                ValueData::Position(p)
            }
            ValueKind::Group => {
                let mut g = IndexGroup::new();
                g.replace_storage({
                    let mut buf = self.groups.borrow_mut().pop().unwrap_or_default();
                    buf.clear();
                    buf.reserve(count);
                    buf
                });
                ValueData::Group(g)
            }
        };
        self.note_acquire();
        Ok(data)
    }

    pub fn release_value(&self, data: ValueData) {
        match data {
            ValueData::None => return,
            ValueData::Int(mut v) => {
                v.clear();
                self.ints.borrow_mut().push(v);
            }
            ValueData::Real(mut v) => {
                v.clear();
                self.reals.borrow_mut().push(v);
            }
            ValueData::Str(mut v) => {
                v.clear();
                self.strings.borrow_mut().push(v);
            }
            ValueData::Position(mut p) => {
                p.clear();
                self.positions.borrow_mut().push(p);
            }
            ValueData::Group(mut g) => {
                let mut buf = g.take_storage();
                buf.clear();
                self.groups.borrow_mut().push(buf);
            }
        }
        self.note_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_buffers_are_recycled() {
        let pool = MemPool::new();
        let mut buf = pool.acquire_group(100);
        buf.extend(0..100);
        let cap = buf.capacity();
        pool.release_group(buf);
        assert_eq!(pool.outstanding(), 0);

        let buf = pool.acquire_group(10);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn test_peak_tracks_simultaneous_reservations() {
        let pool = MemPool::new();
        let a = pool.acquire_group(4);
        let b = pool.acquire_group(4);
        assert_eq!(pool.outstanding(), 2);
        pool.release_group(a);
        pool.release_group(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.peak(), 2);
    }

    #[test]
    fn test_valueless_reservation_fails() {
        let pool = MemPool::new();
        assert!(pool.acquire_value(ValueKind::None, 4).is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_typed_value_roundtrip() {
        let pool = MemPool::new();
        let v = pool.acquire_value(ValueKind::Real, 8).unwrap();
        assert_eq!(v.kind(), ValueKind::Real);
        pool.release_value(v);
        assert_eq!(pool.outstanding(), 0);
    }
}
