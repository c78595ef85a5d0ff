//! The selection collection and its frame evaluation driver.
//!
//! A collection owns one compiled element tree, the memory pool its
//! evaluation borrows scratch buffers from, the universe group, and the
//! chain of top-level roots. `evaluate` runs one trajectory frame through
//! every root; `evaluate_final` closes out trajectory-wide statistics
//! after the last frame.

use crate::selection::element::{ElementId, ElementKind, ElementTree, Evaluator};
use crate::selection::error::EvalResult;
use crate::selection::eval::{evaluate_element, EvalContext};
use crate::selection::index::IndexGroup;
use crate::selection::mempool::MemPool;
use crate::selection::value::ValueData;
use crate::topology::{Frame, Pbc, Topology};

/// One registered selection: a root in the chain plus the element whose
/// GROUP value is the selection's per-frame result, with trajectory-wide
/// statistics maintained by the driver.
pub struct Selection {
    name: String,
    root: ElementId,
    elem: ElementId,
    /// Compile-time maximal group the selection can evaluate to.
    full_group: IndexGroup,
    current: IndexGroup,
    masses: Vec<f64>,
    charges: Vec<f64>,
    covered_fraction: f64,
    coverage_sum: f64,
    average_covered_fraction: f64,
}

impl Selection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    /// The atoms selected in the most recently evaluated frame.
    pub fn atom_indices(&self) -> &IndexGroup {
        &self.current
    }

    /// Masses of the currently selected atoms, in index order.
    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    /// Charges of the currently selected atoms, in index order.
    pub fn charges(&self) -> &[f64] {
        &self.charges
    }

    /// Fraction of the maximal group selected in the last frame.
    pub fn covered_fraction(&self) -> f64 {
        self.covered_fraction
    }

    /// Covered fraction averaged over all frames, available after
    /// [`SelectionCollection::evaluate_final`].
    pub fn average_covered_fraction(&self) -> f64 {
        self.average_covered_fraction
    }

    fn refresh_masses_and_charges(&mut self, top: &Topology) {
        self.masses.clear();
        self.charges.clear();
        for &i in self.current.as_slice() {
            self.masses.push(top.masses[i]);
            self.charges.push(top.charges[i]);
        }
    }

    fn update_covered_fraction_for_frame(&mut self) {
        self.covered_fraction = if self.full_group.is_empty() {
            1.0
        } else {
            self.current.len() as f64 / self.full_group.len() as f64
        };
        self.coverage_sum += self.covered_fraction;
    }

    /// Reset the selection back to its maximal compile-time group, as the
    /// last frame's restriction no longer applies after the trajectory.
    fn restore_original_positions(&mut self, top: &Topology) {
        self.current.copy_from(&self.full_group, false);
        self.refresh_masses_and_charges(top);
    }

    fn compute_average_covered_fraction(&mut self, nframes: usize) {
        self.average_covered_fraction = if nframes == 0 {
            0.0
        } else {
            self.coverage_sum / nframes as f64
        };
    }
}

/// A compiled set of selections sharing one element tree and memory pool.
pub struct SelectionCollection {
    tree: ElementTree,
    pool: MemPool,
    gall: IndexGroup,
    top: Topology,
    /// Top-level roots, evaluated in registration order each frame.
    roots: Vec<ElementId>,
    selections: Vec<Selection>,
}

impl SelectionCollection {
    pub fn new(tree: ElementTree, top: Topology) -> Self {
        let gall = IndexGroup::universe(top.n_atoms);
        Self {
            tree,
            pool: MemPool::new(),
            gall,
            top,
            roots: Vec::new(),
            selections: Vec::new(),
        }
    }

    pub fn tree(&self) -> &ElementTree {
        &self.tree
    }

    pub fn pool(&self) -> &MemPool {
        &self.pool
    }

    /// Append a root to the top-level chain. Roots that back shared
    /// subexpressions must precede the roots that reference them.
    pub fn add_root(&mut self, root: ElementId) {
        self.roots.push(root);
    }

    /// Register a user-visible selection: `elem` is the GROUP-valued
    /// element holding its per-frame result, `full_group` its maximal
    /// compile-time group. Returns the selection's index.
    pub fn register_selection(
        &mut self,
        name: impl Into<String>,
        root: ElementId,
        elem: ElementId,
        full_group: IndexGroup,
    ) -> usize {
        self.selections.push(Selection {
            name: name.into(),
            root,
            elem,
            full_group,
            current: IndexGroup::new(),
            masses: Vec::new(),
            charges: Vec::new(),
            covered_fraction: 0.0,
            coverage_sum: 0.0,
            average_covered_fraction: 0.0,
        });
        self.selections.len() - 1
    }

    pub fn selections(&self) -> &[Selection] {
        &self.selections
    }

    pub fn selection(&self, i: usize) -> &Selection {
        &self.selections[i]
    }

    /// Evaluate every selection for one trajectory frame.
    pub fn evaluate(&mut self, frame: &Frame, pbc: Option<&Pbc>) -> EvalResult {
        for &root in &self.roots {
            init_frame_eval(&self.tree, root);
        }
        let ctx = EvalContext {
            pool: &self.pool,
            gall: &self.gall,
            top: &self.top,
            frame,
            pbc,
        };
        for &root in &self.roots {
            reset_subexpr_cache(&self.tree, root);
            evaluate_element(&self.tree, &ctx, root, None)?;
        }
        log::debug!(
            "evaluated {} selection root(s) at t={}",
            self.roots.len(),
            frame.time
        );
        for sel in &mut self.selections {
            let result = self.tree.get(sel.elem);
            sel.current.copy_from(result.v.data.group()?, false);
            drop(result);
            sel.refresh_masses_and_charges(&self.top);
            sel.update_covered_fraction_for_frame();
        }
        Ok(())
    }

    /// Close out trajectory-wide statistics after the last frame.
    pub fn evaluate_final(&mut self, nframes: usize) -> EvalResult {
        for sel in &mut self.selections {
            sel.restore_original_positions(&self.top);
            sel.compute_average_covered_fraction(nframes);
            log::debug!(
                "selection '{}': average covered fraction {:.3} over {} frame(s)",
                sel.name,
                sel.average_covered_fraction,
                nframes
            );
        }
        Ok(())
    }
}

/// Per-frame flag walk: clear the shared-parameter flag everywhere, arm
/// the frame-init hook of methods that declare one, and empty the cache
/// group of non-static subexpressions so memoization restarts. The walk
/// does not descend through subexpression references; the referenced
/// subexpression is reached through its own root.
fn init_frame_eval(tree: &ElementTree, id: ElementId) {
    let children = {
        let mut el = tree.get_mut(id);
        el.flags.eval_frame = false;
        match el.kind {
            ElementKind::Expression | ElementKind::Modifier => {
                if el.method.as_ref().map_or(false, |m| m.has_frame_init()) {
                    el.flags.init_frame = true;
                }
            }
            ElementKind::Subexpr => {
                if el.evaluator != Some(Evaluator::SubexprStaticEval) {
                    el.cgrp.clear();
                }
            }
            _ => {}
        }
        if el.kind == ElementKind::SubexprRef {
            Vec::new()
        } else {
            el.children.clone()
        }
    };
    for child in children {
        init_frame_eval(tree, child);
    }
}

/// Empty the cache group (and a GROUP-typed value) of a root's direct
/// subexpression child so the new frame starts from a clean cache. The
/// value reset is not strictly required, the next evaluation overwrites
/// it, but it releases the previous frame's contents early.
fn reset_subexpr_cache(tree: &ElementTree, root: ElementId) {
    let Some(child) = tree.get(root).children.first().copied() else {
        return;
    };
    let mut el = tree.get_mut(child);
    if el.kind != ElementKind::Subexpr || el.evaluator.is_none() {
        return;
    }
    el.cgrp.clear();
    if let ValueData::Group(grp) = &mut el.v.data {
        grp.clear();
        el.v.nr = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::selection::element::RootScope;
    use crate::selection::error::EvalResult as TestResult;
    use crate::selection::methods::{SelectionMethod, WithinKeyword};
    use crate::selection::value::{Value, ValueKind};

    fn topology(n_atoms: usize) -> Topology {
        Topology {
            n_atoms,
            atom_names: (0..n_atoms).map(|i| format!("A{i}")).collect(),
            residue_labels: vec!["SOL".into()],
            residue_indices: vec![0; n_atoms],
            masses: (0..n_atoms).map(|i| i as f64 + 1.0).collect(),
            charges: (0..n_atoms).map(|i| i as f64 / 10.0).collect(),
        }
    }

    fn g(v: &[usize]) -> IndexGroup {
        IndexGroup::from_indices(v.to_vec())
    }

    /// Selects atoms whose x coordinate is below a threshold, counting
    /// invocations.
    struct BelowX {
        threshold: f64,
        calls: Rc<Cell<usize>>,
    }

    impl SelectionMethod for BelowX {
        fn name(&self) -> &'static str {
            "below_x"
        }

        fn update(
            &mut self,
            ctx: &EvalContext<'_>,
            grp: &IndexGroup,
            out: &mut Value,
        ) -> TestResult {
            self.calls.set(self.calls.get() + 1);
            let hits: Vec<usize> = grp
                .as_slice()
                .iter()
                .copied()
                .filter(|&i| ctx.frame.coords[i][0] < self.threshold)
                .collect();
            *out.data.group_mut()? = IndexGroup::from_indices(hits);
            out.nr = out.data.group()?.len();
            Ok(())
        }
    }

    struct InitCounting {
        inits: Rc<Cell<usize>>,
    }

    impl SelectionMethod for InitCounting {
        fn name(&self) -> &'static str {
            "init_counting"
        }

        fn has_frame_init(&self) -> bool {
            true
        }

        fn init_frame(&mut self, _ctx: &EvalContext<'_>) -> TestResult {
            self.inits.set(self.inits.get() + 1);
            Ok(())
        }

        fn update(
            &mut self,
            _ctx: &EvalContext<'_>,
            grp: &IndexGroup,
            out: &mut Value,
        ) -> TestResult {
            let dst = out.data.group_mut()?;
            dst.copy_from(grp, false);
            out.nr = dst.len();
            Ok(())
        }
    }

    struct SingleReal {
        value: f64,
        calls: Rc<Cell<usize>>,
    }

    impl SelectionMethod for SingleReal {
        fn name(&self) -> &'static str {
            "single_real"
        }

        fn update(
            &mut self,
            _ctx: &EvalContext<'_>,
            _grp: &IndexGroup,
            out: &mut Value,
        ) -> TestResult {
            self.calls.set(self.calls.get() + 1);
            let vals = out.data.reals_mut()?;
            vals.clear();
            vals.push(self.value);
            out.nr = 1;
            Ok(())
        }
    }

    fn line_frame(time: f64, xs: &[f64]) -> Frame {
        Frame::new(time, xs.iter().map(|&x| [x, 0.0, 0.0]).collect())
    }

    #[test]
    fn test_per_frame_results_follow_coordinates() {
        let mut tree = ElementTree::new();
        let calls = Rc::new(Cell::new(0));
        let m = tree.add_method(
            Box::new(BelowX {
                threshold: 2.5,
                calls: Rc::clone(&calls),
            }),
            ValueKind::Group,
            vec![],
        );
        let root = tree.add_root(m, RootScope::Fixed(g(&[0, 1, 2, 3])));
        let mut coll = SelectionCollection::new(tree, topology(4));
        coll.add_root(root);
        coll.register_selection("low_x", root, m, g(&[0, 1, 2, 3]));

        coll.evaluate(&line_frame(0.0, &[0.0, 1.0, 2.0, 3.0]), None)
            .unwrap();
        assert_eq!(coll.selection(0).atom_indices().as_slice(), &[0, 1, 2]);
        assert!((coll.selection(0).covered_fraction() - 0.75).abs() < 1e-12);

        coll.evaluate(&line_frame(1.0, &[5.0, 5.0, 2.0, 0.0]), None)
            .unwrap();
        assert_eq!(coll.selection(0).atom_indices().as_slice(), &[2, 3]);
        assert_eq!(calls.get(), 2);
        assert_eq!(coll.pool().outstanding(), 0);
    }

    #[test]
    fn test_subexpr_cache_resets_between_frames() {
        let mut tree = ElementTree::new();
        let calls = Rc::new(Cell::new(0));
        let m = tree.add_method(
            Box::new(BelowX {
                threshold: 1.5,
                calls: Rc::clone(&calls),
            }),
            ValueKind::Group,
            vec![],
        );
        let sub = tree.add_subexpr(m, Evaluator::Subexpr);
        let sub_root = tree.add_root(sub, RootScope::Unrestricted);
        let r = tree.add_subexpr_ref(sub, false);
        let ref_root = tree.add_root(r, RootScope::Fixed(g(&[0, 1, 2])));
        let mut coll = SelectionCollection::new(tree, topology(3));
        coll.add_root(sub_root);
        coll.add_root(ref_root);
        coll.register_selection("cached", ref_root, r, g(&[0, 1, 2]));

        coll.evaluate(&line_frame(0.0, &[0.0, 1.0, 2.0]), None).unwrap();
        assert_eq!(coll.selection(0).atom_indices().as_slice(), &[0, 1]);
        // the cache must not survive into the next frame
        coll.evaluate(&line_frame(1.0, &[9.0, 1.0, 0.0]), None).unwrap();
        assert_eq!(coll.selection(0).atom_indices().as_slice(), &[1, 2]);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_frame_init_rearmed_every_frame() {
        let mut tree = ElementTree::new();
        let inits = Rc::new(Cell::new(0));
        let m = tree.add_method(
            Box::new(InitCounting {
                inits: Rc::clone(&inits),
            }),
            ValueKind::Group,
            vec![],
        );
        let root = tree.add_root(m, RootScope::Unrestricted);
        let mut coll = SelectionCollection::new(tree, topology(2));
        coll.add_root(root);
        for i in 0..3 {
            coll.evaluate(&line_frame(i as f64, &[0.0, 1.0]), None).unwrap();
        }
        assert_eq!(inits.get(), 3);
    }

    #[test]
    fn test_shared_param_reevaluated_next_frame() {
        let mut tree = ElementTree::new();
        let scalar_calls = Rc::new(Cell::new(0));
        let p = tree.add_method(
            Box::new(SingleReal {
                value: 1.0,
                calls: Rc::clone(&scalar_calls),
            }),
            ValueKind::Real,
            vec![],
        );
        tree.set_single_valued(p);
        let outer_calls = Rc::new(Cell::new(0));
        let m = tree.add_method(
            Box::new(BelowX {
                threshold: 10.0,
                calls: Rc::clone(&outer_calls),
            }),
            ValueKind::Group,
            vec![p],
        );
        let root = tree.add_root(m, RootScope::Unrestricted);
        let mut coll = SelectionCollection::new(tree, topology(2));
        coll.add_root(root);
        coll.evaluate(&line_frame(0.0, &[0.0, 1.0]), None).unwrap();
        coll.evaluate(&line_frame(1.0, &[0.0, 1.0]), None).unwrap();
        // once per frame, not once overall and not once per use
        assert_eq!(scalar_calls.get(), 2);
        assert_eq!(outer_calls.get(), 2);
    }

    #[test]
    fn test_selection_statistics_and_finalization() {
        let mut tree = ElementTree::new();
        let calls = Rc::new(Cell::new(0));
        let m = tree.add_method(
            Box::new(BelowX {
                threshold: 1.5,
                calls,
            }),
            ValueKind::Group,
            vec![],
        );
        let root = tree.add_root(m, RootScope::Fixed(g(&[0, 1, 2, 3])));
        let mut coll = SelectionCollection::new(tree, topology(4));
        coll.add_root(root);
        coll.register_selection("stat", root, m, g(&[0, 1, 2, 3]));

        coll.evaluate(&line_frame(0.0, &[0.0, 1.0, 9.0, 9.0]), None)
            .unwrap();
        let sel = coll.selection(0);
        assert_eq!(sel.name(), "stat");
        assert_eq!(sel.masses(), &[1.0, 2.0]);
        assert_eq!(sel.charges(), &[0.0, 0.1]);
        assert!((sel.covered_fraction() - 0.5).abs() < 1e-12);

        coll.evaluate(&line_frame(1.0, &[0.0, 9.0, 9.0, 9.0]), None)
            .unwrap();
        coll.evaluate_final(2).unwrap();
        let sel = coll.selection(0);
        // (0.5 + 0.25) / 2
        assert!((sel.average_covered_fraction() - 0.375).abs() < 1e-12);
        // restored to the maximal group
        assert_eq!(sel.atom_indices().as_slice(), &[0, 1, 2, 3]);
        assert_eq!(sel.masses().len(), 4);
    }

    #[test]
    fn test_within_method_rebuilds_grid_each_frame() {
        let mut tree = ElementTree::new();
        let m = tree.add_method(
            Box::new(WithinKeyword::new(1.5, g(&[0]))),
            ValueKind::Group,
            vec![],
        );
        let root = tree.add_root(m, RootScope::Unrestricted);
        let mut coll = SelectionCollection::new(tree, topology(3));
        coll.add_root(root);
        coll.register_selection("near", root, m, g(&[0, 1, 2]));

        coll.evaluate(&line_frame(0.0, &[0.0, 1.0, 5.0]), None).unwrap();
        assert_eq!(coll.selection(0).atom_indices().as_slice(), &[0, 1]);
        // atom 2 moves next to the reference atom
        coll.evaluate(&line_frame(1.0, &[0.0, 5.0, 1.0]), None).unwrap();
        assert_eq!(coll.selection(0).atom_indices().as_slice(), &[0, 2]);
    }

    #[test]
    fn test_roots_evaluated_in_registration_order() {
        let mut tree = ElementTree::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        struct OrderProbe {
            tag: u8,
            order: Rc<RefCell<Vec<u8>>>,
        }
        impl SelectionMethod for OrderProbe {
            fn name(&self) -> &'static str {
                "order_probe"
            }
            fn update(
                &mut self,
                _ctx: &EvalContext<'_>,
                grp: &IndexGroup,
                out: &mut Value,
            ) -> TestResult {
                self.order.borrow_mut().push(self.tag);
                out.data.group_mut()?.copy_from(grp, false);
                out.nr = grp.len();
                Ok(())
            }
        }
        let a = tree.add_method(
            Box::new(OrderProbe {
                tag: 1,
                order: Rc::clone(&order),
            }),
            ValueKind::Group,
            vec![],
        );
        let b = tree.add_method(
            Box::new(OrderProbe {
                tag: 2,
                order: Rc::clone(&order),
            }),
            ValueKind::Group,
            vec![],
        );
        let ra = tree.add_root(a, RootScope::Unrestricted);
        let rb = tree.add_root(b, RootScope::Unrestricted);
        let mut coll = SelectionCollection::new(tree, topology(2));
        coll.add_root(ra);
        coll.add_root(rb);
        coll.evaluate(&line_frame(0.0, &[0.0, 1.0]), None).unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
