//! Compiled selection tree elements and the arena that owns them.
//!
//! Elements are constructed once, when an expression is compiled, and
//! persist across all trajectory frames; only their value buffers, cached
//! groups, and per-frame flags mutate during evaluation. Each element
//! carries the evaluation routine chosen for it at compile time, so
//! evaluation itself is a uniform dispatch on [`Evaluator`].
//!
//! Combinator operands live in `children`; the chaining of top-level
//! expressions is a separate concern owned by the selection collection.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::selection::index::IndexGroup;
use crate::selection::methods::SelectionMethod;
use crate::selection::position::{PositionCalc, PositionSet};
use crate::selection::value::{Value, ValueKind};

/// Index of an element within its [`ElementTree`].
pub type ElementId = usize;

/// Structural kind of a tree element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Root,
    Const,
    Expression,
    Modifier,
    Boolean,
    Arithmetic,
    Subexpr,
    SubexprRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    Not,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Neg,
    Mul,
    Div,
    Exp,
}

/// The evaluation routine assigned to an element at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluator {
    Root,
    ConstGroup,
    SubexprSimple,
    SubexprStaticEval,
    Subexpr,
    SubexprRefSimple,
    SubexprRef,
    Method,
    Modifier,
    Not,
    And,
    Or,
    Arithmetic,
}

impl Evaluator {
    /// Human-readable routine name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Evaluator::Root => "root",
            Evaluator::ConstGroup => "static",
            Evaluator::SubexprSimple => "subexpr_simple",
            Evaluator::SubexprStaticEval => "subexpr_staticeval",
            Evaluator::Subexpr => "subexpr",
            Evaluator::SubexprRefSimple => "ref_simple",
            Evaluator::SubexprRef => "ref",
            Evaluator::Method => "method",
            Evaluator::Modifier => "mod",
            Evaluator::Not => "not",
            Evaluator::And => "and",
            Evaluator::Or => "or",
            Evaluator::Arithmetic => "arithmetic",
        }
    }
}

/// Per-element transient flags, reset by the driver at each new frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementFlags {
    /// The method's per-frame init hook still has to run this frame.
    pub init_frame: bool,
    /// A shared parameter child has already been evaluated this frame.
    pub eval_frame: bool,
    /// The result varies per atom (as opposed to once per frame).
    pub atom_val: bool,
    /// The result is one scalar broadcast over the evaluation group.
    pub single_val: bool,
}

/// Evaluation scope stored on a root element.
#[derive(Debug, Clone)]
pub enum RootScope {
    /// No restriction; the child decides its own evaluation group.
    Unrestricted,
    /// The child is always evaluated over this fixed group. An empty group
    /// disables the root entirely.
    Fixed(IndexGroup),
}

/// One node of a compiled selection tree.
pub struct Element {
    pub kind: ElementKind,
    pub evaluator: Option<Evaluator>,
    pub flags: ElementFlags,
    pub v: Value,
    /// Value storage is borrowed from the memory pool for the duration of
    /// one evaluation call instead of being owned by the element.
    pub pool_backed: bool,
    /// For subexpressions: the group the cached value is valid for
    /// (empty means "not yet evaluated this frame"). For constants: the
    /// stored constant group.
    pub cgrp: IndexGroup,
    /// Only meaningful for root elements.
    pub scope: RootScope,
    pub children: Vec<ElementId>,
    pub arith_op: Option<ArithOp>,
    pub bool_op: Option<BoolOp>,
    pub method: Option<Box<dyn SelectionMethod>>,
    pub pos_calc: Option<PositionCalc>,
    /// Reference positions maintained for a method with a position calc.
    pub pos: PositionSet,
    /// Published value count for a method parameter bound to this element.
    pub param_count: Option<Rc<Cell<usize>>>,
}

impl Element {
    pub fn new(kind: ElementKind, value_kind: ValueKind) -> Self {
        Self {
            kind,
            evaluator: None,
            flags: ElementFlags::default(),
            v: Value::new(value_kind),
            pool_backed: false,
            cgrp: IndexGroup::new(),
            scope: RootScope::Unrestricted,
            children: Vec::new(),
            arith_op: None,
            bool_op: None,
            method: None,
            pos_calc: None,
            pos: PositionSet::new(),
            param_count: None,
        }
    }
}

/// Arena owning the elements of one compiled selection tree.
///
/// Elements are stored in `RefCell`s so the recursive evaluators can
/// borrow parent and child nodes independently; evaluation never takes a
/// long-lived borrow of an element it recurses through.
#[derive(Default)]
pub struct ElementTree {
    elems: Vec<RefCell<Element>>,
}

impl ElementTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn add(&mut self, elem: Element) -> ElementId {
        self.elems.push(RefCell::new(elem));
        self.elems.len() - 1
    }

    pub fn get(&self, id: ElementId) -> Ref<'_, Element> {
        self.elems[id].borrow()
    }

    pub fn get_mut(&self, id: ElementId) -> RefMut<'_, Element> {
        self.elems[id].borrow_mut()
    }

    // ---- builder API (the interface the expression compiler drives) ----

    /// A constant GROUP-valued element holding a fixed atom group.
    pub fn add_constant_group(&mut self, group: IndexGroup) -> ElementId {
        let mut el = Element::new(ElementKind::Const, ValueKind::Group);
        el.evaluator = Some(Evaluator::ConstGroup);
        el.flags.atom_val = true;
        el.cgrp = group;
        self.add(el)
    }

    pub fn add_not(&mut self, child: ElementId) -> ElementId {
        let mut el = Element::new(ElementKind::Boolean, ValueKind::Group);
        el.evaluator = Some(Evaluator::Not);
        el.bool_op = Some(BoolOp::Not);
        el.flags.atom_val = true;
        el.children = vec![child];
        self.add(el)
    }

    pub fn add_and(&mut self, children: Vec<ElementId>) -> ElementId {
        let mut el = Element::new(ElementKind::Boolean, ValueKind::Group);
        el.evaluator = Some(Evaluator::And);
        el.bool_op = Some(BoolOp::And);
        el.flags.atom_val = true;
        el.children = children;
        self.add(el)
    }

    pub fn add_or(&mut self, children: Vec<ElementId>) -> ElementId {
        let mut el = Element::new(ElementKind::Boolean, ValueKind::Group);
        el.evaluator = Some(Evaluator::Or);
        el.bool_op = Some(BoolOp::Or);
        el.flags.atom_val = true;
        el.children = children;
        self.add(el)
    }

    /// An arithmetic element over REAL-valued operands. `right` is absent
    /// only for unary negation. The result is single-valued exactly when
    /// every operand is.
    pub fn add_arithmetic(
        &mut self,
        op: ArithOp,
        left: ElementId,
        right: Option<ElementId>,
    ) -> ElementId {
        let single = self.get(left).flags.single_val
            && right.map_or(true, |r| self.get(r).flags.single_val);
        let mut el = Element::new(ElementKind::Arithmetic, ValueKind::Real);
        el.evaluator = Some(Evaluator::Arithmetic);
        el.arith_op = Some(op);
        el.flags.atom_val = !single;
        el.flags.single_val = single;
        el.children = std::iter::once(left).chain(right).collect();
        self.add(el)
    }

    /// A method expression element. Parameter children are evaluated before
    /// the method's update hook runs.
    pub fn add_method(
        &mut self,
        method: Box<dyn SelectionMethod>,
        value_kind: ValueKind,
        params: Vec<ElementId>,
    ) -> ElementId {
        let mut el = Element::new(ElementKind::Expression, value_kind);
        el.evaluator = Some(Evaluator::Method);
        el.flags.atom_val = true;
        el.method = Some(method);
        el.children = params;
        self.add(el)
    }

    /// A modifier element; its single child must be POSITION-valued.
    pub fn add_modifier(
        &mut self,
        method: Box<dyn SelectionMethod>,
        children: Vec<ElementId>,
    ) -> ElementId {
        let mut el = Element::new(ElementKind::Modifier, ValueKind::None);
        el.evaluator = Some(Evaluator::Modifier);
        el.method = Some(method);
        el.children = children;
        self.add(el)
    }

    /// A subexpression wrapper around `child`, using the given evaluation
    /// strategy (one of the three `Subexpr*` evaluators).
    pub fn add_subexpr(&mut self, child: ElementId, evaluator: Evaluator) -> ElementId {
        debug_assert!(matches!(
            evaluator,
            Evaluator::SubexprSimple | Evaluator::SubexprStaticEval | Evaluator::Subexpr
        ));
        let (value_kind, atom_val) = {
            let c = self.get(child);
            (c.v.kind(), c.flags.atom_val)
        };
        let mut el = Element::new(ElementKind::Subexpr, value_kind);
        el.evaluator = Some(evaluator);
        el.flags.atom_val = atom_val;
        el.children = vec![child];
        self.add(el)
    }

    /// A reference to a shared subexpression.
    pub fn add_subexpr_ref(&mut self, subexpr: ElementId, simple: bool) -> ElementId {
        let (value_kind, atom_val) = {
            let s = self.get(subexpr);
            (s.v.kind(), s.flags.atom_val)
        };
        let mut el = Element::new(ElementKind::SubexprRef, value_kind);
        el.evaluator = Some(if simple {
            Evaluator::SubexprRefSimple
        } else {
            Evaluator::SubexprRef
        });
        el.flags.atom_val = atom_val;
        el.children = vec![subexpr];
        self.add(el)
    }

    /// A top-level root driving `child` over the given scope.
    pub fn add_root(&mut self, child: ElementId, scope: RootScope) -> ElementId {
        let mut el = Element::new(ElementKind::Root, ValueKind::None);
        el.evaluator = Some(Evaluator::Root);
        el.scope = scope;
        el.children = vec![child];
        self.add(el)
    }

    /// Mark an element's value storage as borrowed from the memory pool.
    pub fn set_pool_backed(&mut self, id: ElementId, pool_backed: bool) {
        self.get_mut(id).pool_backed = pool_backed;
    }

    /// Mark an element as producing one scalar per frame rather than one
    /// value per atom.
    pub fn set_single_valued(&mut self, id: ElementId) {
        let mut el = self.get_mut(id);
        el.flags.single_val = true;
        el.flags.atom_val = false;
    }

    /// Attach a reference-position calculation to a method element.
    pub fn set_position_calc(&mut self, id: ElementId, calc: PositionCalc) {
        self.get_mut(id).pos_calc = Some(calc);
    }

    /// Bind a shared value-count cell to a subexpression reference, as a
    /// method parameter binding would.
    pub fn bind_param_count(&mut self, id: ElementId) -> Rc<Cell<usize>> {
        let cell = Rc::new(Cell::new(0));
        self.get_mut(id).param_count = Some(Rc::clone(&cell));
        cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluator_names() {
        assert_eq!(Evaluator::Root.name(), "root");
        assert_eq!(Evaluator::SubexprStaticEval.name(), "subexpr_staticeval");
        assert_eq!(Evaluator::Modifier.name(), "mod");
    }

    #[test]
    fn test_arithmetic_single_valued_propagation() {
        let mut tree = ElementTree::new();
        let a = tree.add_constant_group(IndexGroup::from_indices(vec![0]));
        let b = tree.add_constant_group(IndexGroup::from_indices(vec![1]));
        tree.set_single_valued(a);
        let both_single = {
            let b2 = tree.add_constant_group(IndexGroup::new());
            tree.set_single_valued(b2);
            tree.add_arithmetic(ArithOp::Add, a, Some(b2))
        };
        assert!(tree.get(both_single).flags.single_val);
        let mixed = tree.add_arithmetic(ArithOp::Add, a, Some(b));
        assert!(!tree.get(mixed).flags.single_val);
        let neg = tree.add_arithmetic(ArithOp::Neg, a, None);
        assert!(tree.get(neg).flags.single_val);
    }

    #[test]
    fn test_builder_wires_children() {
        let mut tree = ElementTree::new();
        let c = tree.add_constant_group(IndexGroup::from_indices(vec![1, 2]));
        let n = tree.add_not(c);
        let root = tree.add_root(n, RootScope::Unrestricted);
        assert_eq!(tree.get(n).children, vec![c]);
        assert_eq!(tree.get(root).children, vec![n]);
        assert_eq!(tree.get(n).evaluator, Some(Evaluator::Not));
        assert_eq!(tree.get(c).v.kind(), ValueKind::Group);
    }
}
