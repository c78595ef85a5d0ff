//! Sorted atom index groups and the set algebra the evaluator is built on.
//!
//! A group is a strictly increasing, duplicate-free array of atom indices,
//! optionally named. All binary operations exploit the ordering and run in
//! a single merge-style pass.

use crate::selection::error::{EvalError, EvalResult};

/// A sorted, duplicate-free set of atom indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexGroup {
    name: Option<String>,
    index: Vec<usize>,
}

impl IndexGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a group from indices. The slice must already be sorted and
    /// duplicate-free; this is checked in debug builds only.
    pub fn from_indices(index: Vec<usize>) -> Self {
        debug_assert!(is_sorted_unique(&index));
        Self { name: None, index }
    }

    /// The group of all atoms `0..n_atoms`.
    pub fn universe(n_atoms: usize) -> Self {
        Self {
            name: Some("all".to_string()),
            index: (0..n_atoms).collect(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.index
    }

    pub fn contains(&self, atom: usize) -> bool {
        self.index.binary_search(&atom).is_ok()
    }

    pub fn clear(&mut self) {
        self.index.clear();
    }

    /// Replace the backing storage (used by the memory pool); the previous
    /// storage is returned so it can go back to the pool.
    pub fn replace_storage(&mut self, storage: Vec<usize>) -> Vec<usize> {
        std::mem::replace(&mut self.index, storage)
    }

    pub fn take_storage(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.index)
    }

    /// Copy `src` into `self`. With `keep_name` the current name survives
    /// the copy; otherwise the source name is cloned as well.
    pub fn copy_from(&mut self, src: &IndexGroup, keep_name: bool) {
        self.index.clear();
        self.index.extend_from_slice(&src.index);
        if !keep_name {
            self.name.clone_from(&src.name);
        }
    }

    /// self = a ∩ b.
    pub fn intersection_of(&mut self, a: &IndexGroup, b: &IndexGroup) {
        self.index.clear();
        let (mut i, mut j) = (0, 0);
        while i < a.index.len() && j < b.index.len() {
            if a.index[i] < b.index[j] {
                i += 1;
            } else if a.index[i] > b.index[j] {
                j += 1;
            } else {
                self.index.push(a.index[i]);
                i += 1;
                j += 1;
            }
        }
    }

    /// self = self ∩ other, in place.
    pub fn intersect_with(&mut self, other: &IndexGroup) {
        let mut j = 0;
        self.index.retain(|&atom| {
            while j < other.index.len() && other.index[j] < atom {
                j += 1;
            }
            j < other.index.len() && other.index[j] == atom
        });
    }

    /// self = a − b.
    pub fn difference_of(&mut self, a: &IndexGroup, b: &IndexGroup) {
        self.index.clear();
        let mut j = 0;
        for &atom in &a.index {
            while j < b.index.len() && b.index[j] < atom {
                j += 1;
            }
            if j >= b.index.len() || b.index[j] != atom {
                self.index.push(atom);
            }
        }
    }

    /// self = self ∪ other, in place via a reverse two-pointer merge so no
    /// scratch array is needed. The operands must be disjoint; a shared
    /// index is an internal error (duplicates would corrupt the sorted-
    /// unique invariant downstream).
    pub fn union_with(&mut self, other: &IndexGroup) -> EvalResult {
        let n_old = self.index.len();
        let n_other = other.index.len();
        self.index.resize(n_old + n_other, 0);
        let mut i = n_old as isize - 1;
        let mut j = n_other as isize - 1;
        for k in (0..n_old + n_other).rev() {
            if i >= 0 && j >= 0 && self.index[i as usize] == other.index[j as usize] {
                return Err(EvalError::internal(format!(
                    "duplicate index {} in group union",
                    other.index[j as usize]
                )));
            }
            if i < 0 || (j >= 0 && self.index[i as usize] < other.index[j as usize]) {
                self.index[k] = other.index[j as usize];
                j -= 1;
            } else {
                self.index[k] = self.index[i as usize];
                i -= 1;
            }
        }
        Ok(())
    }

    /// Split `src` into members of `mask` (into `matched`) and non-members
    /// (into `remainder`), preserving order.
    pub fn partition(
        matched: &mut IndexGroup,
        remainder: &mut IndexGroup,
        src: &IndexGroup,
        mask: &IndexGroup,
    ) {
        matched.index.clear();
        remainder.index.clear();
        let mut j = 0;
        for &atom in &src.index {
            while j < mask.index.len() && mask.index[j] < atom {
                j += 1;
            }
            if j < mask.index.len() && mask.index[j] == atom {
                matched.index.push(atom);
            } else {
                remainder.index.push(atom);
            }
        }
    }

    /// Restore sorted order after out-of-order appends.
    pub fn sort_ascending(&mut self) {
        self.index.sort_unstable();
    }

    /// Append the contents of another group; the result may need
    /// [`sort_ascending`](Self::sort_ascending) afterwards.
    pub fn append(&mut self, other: &IndexGroup) {
        self.index.extend_from_slice(&other.index);
    }

    pub fn is_sorted_unique(&self) -> bool {
        is_sorted_unique(&self.index)
    }
}

fn is_sorted_unique(index: &[usize]) -> bool {
    index.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(v: &[usize]) -> IndexGroup {
        IndexGroup::from_indices(v.to_vec())
    }

    #[test]
    fn test_universe() {
        let u = IndexGroup::universe(4);
        assert_eq!(u.as_slice(), &[0, 1, 2, 3]);
        assert_eq!(u.name(), Some("all"));
    }

    #[test]
    fn test_intersection() {
        let mut out = IndexGroup::new();
        out.intersection_of(&g(&[1, 3, 5, 7, 9]), &g(&[4, 5, 6, 7, 8, 9, 10]));
        assert_eq!(out.as_slice(), &[5, 7, 9]);
    }

    #[test]
    fn test_intersect_with() {
        let mut acc = g(&[1, 2, 3, 4, 5]);
        acc.intersect_with(&g(&[2, 4, 6]));
        assert_eq!(acc.as_slice(), &[2, 4]);
    }

    #[test]
    fn test_difference() {
        let mut out = IndexGroup::new();
        out.difference_of(&g(&[1, 2, 3, 4, 5]), &g(&[2, 4]));
        assert_eq!(out.as_slice(), &[1, 3, 5]);
        out.difference_of(&g(&[1, 2]), &g(&[]));
        assert_eq!(out.as_slice(), &[1, 2]);
    }

    #[test]
    fn test_union_with_disjoint() {
        let mut acc = g(&[2, 4, 6]);
        acc.union_with(&g(&[1, 5, 8])).unwrap();
        assert_eq!(acc.as_slice(), &[1, 2, 4, 5, 6, 8]);
    }

    #[test]
    fn test_union_with_duplicate_is_error() {
        let mut acc = g(&[2, 4, 6]);
        assert!(acc.union_with(&g(&[4])).is_err());
    }

    #[test]
    fn test_partition() {
        let mut matched = IndexGroup::new();
        let mut remainder = IndexGroup::new();
        IndexGroup::partition(
            &mut matched,
            &mut remainder,
            &g(&[1, 2, 3, 4, 5]),
            &g(&[2, 5, 9]),
        );
        assert_eq!(matched.as_slice(), &[2, 5]);
        assert_eq!(remainder.as_slice(), &[1, 3, 4]);
    }

    #[test]
    fn test_copy_from_keep_name() {
        let mut dst = IndexGroup::new().with_name("cache");
        let src = g(&[1, 2]).with_name("incoming");
        dst.copy_from(&src, true);
        assert_eq!(dst.as_slice(), &[1, 2]);
        assert_eq!(dst.name(), Some("cache"));
        dst.copy_from(&src, false);
        assert_eq!(dst.name(), Some("incoming"));
    }
}
