//! Frame evaluation of compiled selection trees.
//!
//! Each element kind has one evaluation routine with the uniform shape
//! `(tree, context, element, restricting group) -> Result`. The routine
//! chosen at compile time is stored on the element and dispatched through
//! [`evaluate_element`]. Scratch buffers come from the collection's memory
//! pool and are managed by RAII guards so that no reservation or
//! temporary buffer redirection outlives the call, even when evaluation
//! fails partway through.

use crate::selection::element::{ArithOp, Element, ElementId, ElementTree, Evaluator, RootScope};
use crate::selection::error::{EvalError, EvalResult};
use crate::selection::index::IndexGroup;
use crate::selection::mempool::MemPool;
use crate::selection::value::ValueData;
use crate::topology::{Frame, Pbc, Topology};

/// Frame-scoped evaluation context, passed explicitly through every call.
/// Holds no mutable process-wide state; independent collections can
/// evaluate concurrently on separate threads.
pub struct EvalContext<'a> {
    pub pool: &'a MemPool,
    /// The group of all atoms in the system.
    pub gall: &'a IndexGroup,
    pub top: &'a Topology,
    pub frame: &'a Frame,
    pub pbc: Option<&'a Pbc>,
}

/// A null restricting group means "no restriction": the whole universe.
fn full_group<'a>(g: Option<&'a IndexGroup>, ctx: &EvalContext<'a>) -> &'a IndexGroup {
    g.unwrap_or(ctx.gall)
}

fn only_child(tree: &ElementTree, id: ElementId) -> EvalResult<ElementId> {
    tree.get(id)
        .children
        .first()
        .copied()
        .ok_or_else(|| EvalError::internal("element requires a child"))
}

/// Reserves value storage for one element, sourcing it from the memory
/// pool when the element is pool-backed and returning it on scope exit.
/// For heap-owned elements only capacity is ensured; the element keeps
/// its buffer for reuse across frames.
pub struct MempoolElemReserver<'t> {
    tree: &'t ElementTree,
    pool: &'t MemPool,
    used: bool,
    release: Option<ElementId>,
}

impl<'t> MempoolElemReserver<'t> {
    pub fn new(tree: &'t ElementTree, pool: &'t MemPool) -> Self {
        Self {
            tree,
            pool,
            used: false,
            release: None,
        }
    }

    /// Reserve space for `count` values in `id`'s buffer. Reserving twice
    /// through the same instance is a programming error and fails before
    /// any pool interaction.
    pub fn reserve(&mut self, id: ElementId, count: usize) -> EvalResult {
        if self.used {
            return Err(EvalError::internal(
                "only one element reservation per reserver instance",
            ));
        }
        self.used = true;
        let mut el = self.tree.get_mut(id);
        if el.pool_backed {
            let kind = el.v.kind();
            el.v.data = self.pool.acquire_value(kind, count)?;
            el.v.nr = 0;
            self.release = Some(id);
        } else {
            el.v.data.reserve(count);
        }
        Ok(())
    }
}

impl Drop for MempoolElemReserver<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.release {
            let mut el = self.tree.get_mut(id);
            let kind = el.v.kind();
            let data = std::mem::replace(&mut el.v.data, ValueData::empty_of(kind));
            el.v.nr = 0;
            self.pool.release_value(data);
        }
    }
}

/// Reserves a standalone index group from the memory pool, returning its
/// storage on scope exit. Before `reserve` the group is simply empty.
pub struct MempoolGroupReserver<'p> {
    pool: &'p MemPool,
    group: IndexGroup,
    reserved: bool,
}

impl<'p> MempoolGroupReserver<'p> {
    pub fn new(pool: &'p MemPool) -> Self {
        Self {
            pool,
            group: IndexGroup::new(),
            reserved: false,
        }
    }

    pub fn reserve(&mut self, count: usize) -> EvalResult {
        if self.reserved {
            return Err(EvalError::internal(
                "only one group reservation per reserver instance",
            ));
        }
        self.reserved = true;
        let storage = self.pool.acquire_group(count);
        self.group.replace_storage(storage);
        Ok(())
    }

    pub fn group(&self) -> &IndexGroup {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut IndexGroup {
        &mut self.group
    }
}

impl Drop for MempoolGroupReserver<'_> {
    fn drop(&mut self) {
        if self.reserved {
            self.pool.release_group(self.group.take_storage());
        }
    }
}

/// Temporarily lends one element's value buffer to another so a child can
/// write its result directly into the parent's storage, eliding a copy.
/// The buffers are swapped back on scope exit, normal or error.
pub struct TemporaryValueAssigner<'t> {
    tree: &'t ElementTree,
    pair: Option<(ElementId, ElementId)>,
}

impl<'t> TemporaryValueAssigner<'t> {
    pub fn new(tree: &'t ElementTree) -> Self {
        Self { tree, pair: None }
    }

    /// Redirect `sel`'s value buffer to `source`'s storage. The two
    /// elements must have the same declared value type.
    pub fn assign(&mut self, sel: ElementId, source: ElementId) -> EvalResult {
        if self.pair.is_some() {
            return Err(EvalError::internal(
                "only one assignment per assigner instance",
            ));
        }
        if sel == source {
            return Err(EvalError::internal("cannot alias an element to itself"));
        }
        {
            let mut a = self.tree.get_mut(sel);
            let mut b = self.tree.get_mut(source);
            if a.v.kind() != b.v.kind() {
                return Err(EvalError::internal("mismatching selection value types"));
            }
            std::mem::swap(&mut a.v, &mut b.v);
        }
        self.pair = Some((sel, source));
        Ok(())
    }
}

impl Drop for TemporaryValueAssigner<'_> {
    fn drop(&mut self) {
        if let Some((sel, source)) = self.pair {
            let mut a = self.tree.get_mut(sel);
            let mut b = self.tree.get_mut(source);
            std::mem::swap(&mut a.v, &mut b.v);
        }
    }
}

/// Evaluate one element via its compile-time dispatch routine. Elements
/// without a routine (compile-time constants folded away) are skipped.
pub fn evaluate_element(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let Some(evaluator) = tree.get(id).evaluator else {
        return Ok(());
    };
    match evaluator {
        Evaluator::Root => evaluate_root(tree, ctx, id),
        Evaluator::ConstGroup => evaluate_const_group(tree, ctx, id, g),
        Evaluator::SubexprSimple => evaluate_subexpr_simple(tree, ctx, id, g),
        Evaluator::SubexprStaticEval => evaluate_subexpr_staticeval(tree, ctx, id, g),
        Evaluator::Subexpr => evaluate_subexpr(tree, ctx, id, g),
        Evaluator::SubexprRefSimple => evaluate_subexprref_simple(tree, ctx, id, g),
        Evaluator::SubexprRef => evaluate_subexprref(tree, ctx, id, g),
        Evaluator::Method => evaluate_method(tree, ctx, id, g),
        Evaluator::Modifier => evaluate_modifier(tree, ctx, id, g),
        Evaluator::Not => evaluate_not(tree, ctx, id, g),
        Evaluator::And => evaluate_and(tree, ctx, id, g),
        Evaluator::Or => evaluate_or(tree, ctx, id, g),
        Evaluator::Arithmetic => evaluate_arithmetic(tree, ctx, id, g),
    }
}

/// Evaluate every child of `id` in the given group, in order.
pub fn evaluate_children(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let children = tree.get(id).children.clone();
    for child in children {
        evaluate_element(tree, ctx, child, g)?;
    }
    Ok(())
}

/// Roots carry no value; they evaluate their child over the stored scope.
/// An empty fixed scope, or a child without an evaluator, disables the
/// root for this frame.
fn evaluate_root(tree: &ElementTree, ctx: &EvalContext<'_>, id: ElementId) -> EvalResult {
    let Some(child) = tree.get(id).children.first().copied() else {
        return Ok(());
    };
    if tree.get(child).evaluator.is_none() {
        return Ok(());
    }
    // Take the scope out for the duration of the recursion so no element
    // borrow is held across it.
    let scope = std::mem::replace(&mut tree.get_mut(id).scope, RootScope::Unrestricted);
    let result = match &scope {
        RootScope::Fixed(grp) if grp.is_empty() => Ok(()),
        RootScope::Fixed(grp) => evaluate_element(tree, ctx, child, Some(grp)),
        RootScope::Unrestricted => evaluate_element(tree, ctx, child, None),
    };
    tree.get_mut(id).scope = scope;
    result
}

/// Constant group: result = stored group ∩ incoming group.
fn evaluate_const_group(
    tree: &ElementTree,
    _ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let mut el = tree.get_mut(id);
    let el = &mut *el;
    let out = el.v.data.group_mut()?;
    match g {
        Some(g) => out.intersection_of(&el.cgrp, g),
        None => out.copy_from(&el.cgrp, true),
    }
    el.v.nr = out.len();
    Ok(())
}

/// Subexpression with exactly one consumer: no caching needed. The
/// consumer reference has already lent this element's buffer down the
/// chain, so only the child evaluation and the count copy remain.
fn evaluate_subexpr_simple(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let child = only_child(tree, id)?;
    if tree.get(child).evaluator.is_some() {
        evaluate_element(tree, ctx, child, g)?;
    }
    let nr = tree.get(child).v.nr;
    tree.get_mut(id).v.nr = nr;
    Ok(())
}

/// Subexpression whose evaluation group is the same every frame: evaluate
/// the child on first use this frame, then become a no-op.
fn evaluate_subexpr_staticeval(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    if !tree.get(id).cgrp.is_empty() {
        return Ok(());
    }
    let child = only_child(tree, id)?;
    evaluate_element(tree, ctx, child, g)?;
    {
        // Move the freshly evaluated buffer up; the child rewrites its
        // buffer from scratch on its next evaluation.
        let mut sel = tree.get_mut(id);
        let mut ch = tree.get_mut(child);
        if sel.v.kind() != ch.v.kind() {
            return Err(EvalError::internal("mismatching selection value types"));
        }
        std::mem::swap(&mut sel.v, &mut ch.v);
    }
    let g = full_group(g, ctx);
    tree.get_mut(id).cgrp.copy_from(g, true);
    Ok(())
}

/// General memoized subexpression. Evaluates the child only for the part
/// of the incoming group not covered by the cached group, then merges the
/// fresh values into the cached ones, keeping everything ordered by atom
/// index. The cached group only grows within one frame.
fn evaluate_subexpr(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let child = only_child(tree, id)?;
    let g = full_group(g, ctx);
    let mut gmiss = MempoolGroupReserver::new(ctx.pool);
    if tree.get(id).cgrp.is_empty() {
        {
            let mut assigner = TemporaryValueAssigner::new(tree);
            assigner.assign(child, id)?;
            evaluate_element(tree, ctx, child, Some(g))?;
        }
        // Keep the cache group's name across the copy in case the
        // incoming group carries one.
        tree.get_mut(id).cgrp.copy_from(g, true);
    } else {
        gmiss.reserve(g.len())?;
        let el = tree.get(id);
        gmiss.group_mut().difference_of(g, &el.cgrp);
    }
    if !gmiss.group().is_empty() {
        let mut reserver = MempoolElemReserver::new(tree, ctx.pool);
        reserver.reserve(child, gmiss.group().len())?;
        evaluate_element(tree, ctx, child, Some(gmiss.group()))?;
        merge_cached_values(tree, id, child, gmiss.group())?;
        tree.get_mut(id).cgrp.union_with(gmiss.group())?;
    }
    Ok(())
}

/// Merge the child's freshly evaluated values (for `missing`) into the
/// cached values held by the subexpression, in place from the tail so the
/// per-index order is preserved without scratch storage.
fn merge_cached_values(
    tree: &ElementTree,
    id: ElementId,
    child: ElementId,
    missing: &IndexGroup,
) -> EvalResult {
    let mut sel = tree.get_mut(id);
    let sel = &mut *sel;
    let child_el = tree.get(child);
    let Element { v, cgrp, .. } = sel;
    let total = match (&mut v.data, &child_el.v.data) {
        (ValueData::Group(dst), ValueData::Group(src)) => {
            dst.union_with(src)?;
            dst.len()
        }
        (ValueData::Int(dst), ValueData::Int(src)) => {
            merge_tail(dst, src, cgrp.as_slice(), missing.as_slice())?
        }
        (ValueData::Real(dst), ValueData::Real(src)) => {
            merge_tail(dst, src, cgrp.as_slice(), missing.as_slice())?
        }
        (ValueData::Str(dst), ValueData::Str(src)) => {
            merge_tail(dst, src, cgrp.as_slice(), missing.as_slice())?
        }
        (ValueData::Position(_), _) => {
            return Err(EvalError::NotImplemented(
                "position subexpressions not implemented properly",
            ))
        }
        _ => return Err(EvalError::internal("invalid subexpression value type")),
    };
    v.nr = total;
    Ok(())
}

/// Reverse two-pointer merge: `dst[0..cached.len()]` holds values for the
/// cached indices, `src[0..missing.len()]` the fresh ones; afterwards
/// `dst` holds all values ordered by the union of both index sets. A
/// duplicate index between the two sets is an internal error.
fn merge_tail<T: Clone + Default>(
    dst: &mut Vec<T>,
    src: &[T],
    cached: &[usize],
    missing: &[usize],
) -> EvalResult<usize> {
    let n_old = cached.len();
    let n_miss = missing.len();
    if dst.len() < n_old || src.len() < n_miss {
        return Err(EvalError::internal(
            "subexpression value buffer shorter than its evaluation group",
        ));
    }
    dst.resize(n_old + n_miss, T::default());
    let mut i = n_old as isize - 1;
    let mut j = n_miss as isize - 1;
    for k in (0..n_old + n_miss).rev() {
        if i >= 0 && j >= 0 && cached[i as usize] == missing[j as usize] {
            return Err(EvalError::internal(format!(
                "duplicate index {} in subexpression merge",
                missing[j as usize]
            )));
        }
        if i < 0 || (j >= 0 && cached[i as usize] < missing[j as usize]) {
            dst[k] = src[j as usize].clone();
            j -= 1;
        } else {
            dst[k] = dst[i as usize].clone();
            i -= 1;
        }
    }
    Ok(n_old + n_miss)
}

/// Reference to a subexpression with a single consumer: lend this
/// element's buffer down through the subexpression to its child, so the
/// result is materialized here without copying.
fn evaluate_subexprref_simple(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let child = only_child(tree, id)?;
    let nr = if let Some(g) = g {
        let grandchild = only_child(tree, child)?;
        {
            let mut outer = TemporaryValueAssigner::new(tree);
            let mut inner = TemporaryValueAssigner::new(tree);
            outer.assign(child, id)?;
            inner.assign(grandchild, child)?;
            evaluate_element(tree, ctx, child, Some(g))?;
        }
        tree.get(id).v.nr
    } else {
        // Already evaluated through its own root this frame; mirror the
        // subexpression's value.
        let ch = tree.get(child);
        let mut sel = tree.get_mut(id);
        sel.v.data.clone_from(&ch.v.data);
        sel.v.nr = ch.v.nr;
        ch.v.nr
    };
    tree.get_mut(id).v.nr = nr;
    if let Some(count) = &tree.get(id).param_count {
        count.set(nr);
    }
    Ok(())
}

/// General reference to a shared subexpression: extract the subset of the
/// cached values matching the requested group via a forward co-merge walk
/// over the two sorted index arrays.
fn evaluate_subexprref(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let child = only_child(tree, id)?;
    if let Some(g) = g {
        evaluate_element(tree, ctx, child, Some(g))?;
    }
    {
        let mut sel = tree.get_mut(id);
        let sel = &mut *sel;
        let expr = tree.get(child);
        let nr = match &mut sel.v.data {
            ValueData::Int(dst) => extract_values(
                dst,
                expr.v.data.ints()?,
                expr.cgrp.as_slice(),
                g,
                expr.v.nr,
            )?,
            ValueData::Real(dst) => extract_values(
                dst,
                expr.v.data.reals()?,
                expr.cgrp.as_slice(),
                g,
                expr.v.nr,
            )?,
            ValueData::Str(dst) => extract_values(
                dst,
                expr.v.data.strings()?,
                expr.cgrp.as_slice(),
                g,
                expr.v.nr,
            )?,
            ValueData::Position(dst) => {
                dst.copy_from(expr.v.data.positions()?);
                dst.len()
            }
            ValueData::Group(dst) => {
                let src = expr.v.data.group()?;
                match g {
                    None => dst.copy_from(src, false),
                    Some(g) => dst.intersection_of(src, g),
                }
                dst.len()
            }
            ValueData::None => {
                return Err(EvalError::internal("invalid subexpression reference type"))
            }
        };
        sel.v.nr = nr;
    }
    let nr = tree.get(id).v.nr;
    if let Some(count) = &tree.get(id).param_count {
        count.set(nr);
    }
    Ok(())
}

fn extract_values<T: Clone>(
    dst: &mut Vec<T>,
    src: &[T],
    cache: &[usize],
    g: Option<&IndexGroup>,
    src_nr: usize,
) -> EvalResult<usize> {
    dst.clear();
    match g {
        None => {
            if src_nr > src.len() {
                return Err(EvalError::internal(
                    "subexpression value count exceeds its buffer",
                ));
            }
            dst.extend_from_slice(&src[..src_nr]);
            Ok(src_nr)
        }
        Some(g) => {
            let mut j = 0;
            for &atom in g.as_slice() {
                while j < cache.len() && cache[j] < atom {
                    j += 1;
                }
                if j >= cache.len() || cache[j] != atom || j >= src.len() {
                    return Err(EvalError::internal(
                        "requested group is not covered by the cached subexpression group",
                    ));
                }
                dst.push(src[j].clone());
                j += 1;
            }
            Ok(g.len())
        }
    }
}

/// Evaluate the parameter children of a method or modifier element.
/// Children whose value does not vary per atom are evaluated once per
/// frame, unrestricted, and flagged so later uses this frame skip them.
fn evaluate_method_params(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let children = tree.get(id).children.clone();
    for child in children {
        let (has_eval, done, atom_val) = {
            let el = tree.get(child);
            (el.evaluator.is_some(), el.flags.eval_frame, el.flags.atom_val)
        };
        if !has_eval || done {
            continue;
        }
        if atom_val {
            evaluate_element(tree, ctx, child, g)?;
        } else {
            tree.get_mut(child).flags.eval_frame = true;
            evaluate_element(tree, ctx, child, None)?;
        }
    }
    Ok(())
}

fn run_frame_init(tree: &ElementTree, ctx: &EvalContext<'_>, id: ElementId) -> EvalResult {
    if !tree.get(id).flags.init_frame {
        return Ok(());
    }
    let mut el = tree.get_mut(id);
    el.flags.init_frame = false;
    let method = el
        .method
        .as_mut()
        .ok_or_else(|| EvalError::internal("expression element without a method"))?;
    method.init_frame(ctx)
}

/// Method expression: evaluate parameters, run the per-frame init hook on
/// first use, then invoke the update callback — position-based when a
/// reference-position calculation is attached, per-atom otherwise.
fn evaluate_method(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    evaluate_method_params(tree, ctx, id, g)?;
    run_frame_init(tree, ctx, id)?;
    let g = full_group(g, ctx);
    let mut el = tree.get_mut(id);
    let el = &mut *el;
    let method = el
        .method
        .as_mut()
        .ok_or_else(|| EvalError::internal("expression element without a method"))?;
    if let Some(calc) = &el.pos_calc {
        calc.update(&mut el.pos, g, ctx.top, ctx.frame);
        method.pos_update(ctx, &el.pos, &mut el.v)
    } else {
        method.update(ctx, g, &mut el.v)
    }
}

/// Modifier: like a method, but consumes the evaluated positions of its
/// single POSITION-valued child.
fn evaluate_modifier(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    evaluate_method_params(tree, ctx, id, g)?;
    run_frame_init(tree, ctx, id)?;
    let child = tree
        .get(id)
        .children
        .first()
        .copied()
        .ok_or_else(|| EvalError::internal("modifier element must have a child"))?;
    let child_el = tree.get(child);
    let positions = match &child_el.v.data {
        ValueData::Position(p) => p,
        _ => {
            return Err(EvalError::NotImplemented(
                "non-position valued modifiers not implemented",
            ))
        }
    };
    let mut el = tree.get_mut(id);
    let el = &mut *el;
    let method = el
        .method
        .as_mut()
        .ok_or_else(|| EvalError::internal("modifier element without a method"))?;
    method.pos_update(ctx, positions, &mut el.v)
}

/// Boolean NOT: result = incoming group − child result.
fn evaluate_not(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let child = only_child(tree, id)?;
    let g = full_group(g, ctx);
    let mut reserver = MempoolElemReserver::new(tree, ctx.pool);
    reserver.reserve(child, g.len())?;
    evaluate_element(tree, ctx, child, Some(g))?;
    let mut sel = tree.get_mut(id);
    let child_el = tree.get(child);
    let n = {
        let out = sel.v.data.group_mut()?;
        out.difference_of(g, child_el.v.data.group()?);
        out.len()
    };
    sel.v.nr = n;
    Ok(())
}

/// Short-circuiting boolean AND: each child is evaluated in the
/// intersection of all previous results; evaluation stops as soon as the
/// running intersection is empty.
fn evaluate_and(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let g = full_group(g, ctx);
    let children = tree.get(id).children.clone();
    let mut iter = children.into_iter();
    let mut first = iter
        .next()
        .ok_or_else(|| EvalError::internal("boolean element without children"))?;
    // A first child without an evaluator is a compile-time-proven
    // superset of the evaluation group; skip it.
    if tree.get(first).evaluator.is_none() {
        first = iter
            .next()
            .ok_or_else(|| EvalError::internal("boolean AND with no evaluable children"))?;
    }
    // Accumulate locally, reusing this element's buffer.
    let mut acc = std::mem::take(tree.get_mut(id).v.data.group_mut()?);
    {
        let mut reserver = MempoolElemReserver::new(tree, ctx.pool);
        reserver.reserve(first, g.len())?;
        evaluate_element(tree, ctx, first, Some(g))?;
        acc.copy_from(tree.get(first).v.data.group()?, true);
    }
    for child in iter {
        if acc.is_empty() {
            break;
        }
        let mut reserver = MempoolElemReserver::new(tree, ctx.pool);
        reserver.reserve(child, acc.len())?;
        evaluate_element(tree, ctx, child, Some(&acc))?;
        acc.intersect_with(tree.get(child).v.data.group()?);
    }
    let mut sel = tree.get_mut(id);
    let n = acc.len();
    *sel.v.data.group_mut()? = acc;
    sel.v.nr = n;
    Ok(())
}

/// Short-circuiting boolean OR: each child is evaluated only in the part
/// of the incoming group no previous child matched; newly matched atoms
/// are appended and the result is sorted at the end.
fn evaluate_or(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let g = full_group(g, ctx);
    let children = tree.get(id).children.clone();
    let mut iter = children.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| EvalError::internal("boolean element without children"))?;
    let mut acc = std::mem::take(tree.get_mut(id).v.data.group_mut()?);
    acc.clear();
    let mut remaining = MempoolGroupReserver::new(ctx.pool);
    remaining.reserve(g.len())?;
    if tree.get(first).evaluator.is_some() {
        let mut reserver = MempoolElemReserver::new(tree, ctx.pool);
        reserver.reserve(first, g.len())?;
        evaluate_element(tree, ctx, first, Some(g))?;
        let child_el = tree.get(first);
        IndexGroup::partition(&mut acc, remaining.group_mut(), g, child_el.v.data.group()?);
    } else {
        // A first child without an evaluator already holds a valid subset
        // of the evaluation group.
        let child_el = tree.get(first);
        IndexGroup::partition(&mut acc, remaining.group_mut(), g, child_el.v.data.group()?);
    }
    let mut matched = MempoolGroupReserver::new(ctx.pool);
    let mut scratch = MempoolGroupReserver::new(ctx.pool);
    matched.reserve(g.len())?;
    scratch.reserve(g.len())?;
    for child in iter {
        if remaining.group().is_empty() {
            break;
        }
        remaining.group_mut().set_name(None);
        {
            let mut reserver = MempoolElemReserver::new(tree, ctx.pool);
            reserver.reserve(child, remaining.group().len())?;
            evaluate_element(tree, ctx, child, Some(remaining.group()))?;
            let child_el = tree.get(child);
            IndexGroup::partition(
                matched.group_mut(),
                scratch.group_mut(),
                remaining.group(),
                child_el.v.data.group()?,
            );
        }
        acc.append(matched.group());
        std::mem::swap(remaining.group_mut(), scratch.group_mut());
    }
    acc.sort_ascending();
    let mut sel = tree.get_mut(id);
    let n = acc.len();
    *sel.v.data.group_mut()? = acc;
    sel.v.nr = n;
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AliasedOperand {
    None,
    Left,
    Right,
}

/// Type-polymorphic arithmetic over REAL operands, with scalar broadcast
/// for single-valued operands. A pool-backed operand lends its slot to
/// this element's buffer so the combine can run in place.
fn evaluate_arithmetic(
    tree: &ElementTree,
    ctx: &EvalContext<'_>,
    id: ElementId,
    g: Option<&IndexGroup>,
) -> EvalResult {
    let g = full_group(g, ctx);
    let (left, right, op) = {
        let el = tree.get(id);
        let left = *el
            .children
            .first()
            .ok_or_else(|| EvalError::internal("arithmetic element without operands"))?;
        let op = el
            .arith_op
            .ok_or_else(|| EvalError::internal("arithmetic element without an operator"))?;
        (left, el.children.get(1).copied(), op)
    };
    let neg = op == ArithOp::Neg;
    if neg && right.is_some() {
        return Err(EvalError::internal(
            "unary negation cannot take a right operand",
        ));
    }
    if !neg && right.is_none() {
        return Err(EvalError::internal(
            "binary arithmetic requires a right operand",
        ));
    }

    let mut aliased = AliasedOperand::None;
    let mut assigner = TemporaryValueAssigner::new(tree);
    let mut reserver = MempoolElemReserver::new(tree, ctx.pool);
    if tree.get(left).pool_backed {
        assigner.assign(left, id)?;
        aliased = AliasedOperand::Left;
        if let Some(r) = right {
            reserver.reserve(r, g.len())?;
        }
    } else if let Some(r) = right {
        if tree.get(r).pool_backed {
            assigner.assign(r, id)?;
            aliased = AliasedOperand::Right;
        }
    }
    let evaluated = evaluate_children(tree, ctx, id, Some(g));
    // The assigner is released here so the aliased operand's values sit
    // in this element's buffer for the in-place combine; the reserver
    // stays alive while the combine reads the other operand.
    drop(assigner);
    evaluated?;

    combine_arithmetic(tree, id, left, right, op, aliased, g.len())?;
    drop(reserver);
    Ok(())
}

fn combine_arithmetic(
    tree: &ElementTree,
    id: ElementId,
    left: ElementId,
    right: Option<ElementId>,
    op: ArithOp,
    aliased: AliasedOperand,
    group_len: usize,
) -> EvalResult {
    use std::cell::Ref;

    let neg = op == ArithOp::Neg;
    let n = if tree.get(id).flags.single_val {
        1
    } else {
        group_len
    };
    let left_single = tree.get(left).flags.single_val;
    let right_single = right.map_or(true, |r| tree.get(r).flags.single_val);

    let mut sel = tree.get_mut(id);
    let left_vals: Option<Ref<'_, [f64]>> = if aliased == AliasedOperand::Left {
        None
    } else {
        let el = tree.get(left);
        el.v.data.reals()?;
        Some(Ref::map(el, |e| match &e.v.data {
            ValueData::Real(v) => v.as_slice(),
            _ => &[],
        }))
    };
    let right_vals: Option<Ref<'_, [f64]>> = match right {
        Some(r) if aliased != AliasedOperand::Right => {
            let el = tree.get(r);
            el.v.data.reals()?;
            Some(Ref::map(el, |e| match &e.v.data {
                ValueData::Real(v) => v.as_slice(),
                _ => &[],
            }))
        }
        _ => None,
    };

    let dst = sel.v.data.reals_mut()?;
    let scalar = |vals: &Option<Ref<'_, [f64]>>, dst: &Vec<f64>| -> EvalResult<f64> {
        let slice: &[f64] = match vals {
            Some(v) => v,
            None => dst.as_slice(),
        };
        slice
            .first()
            .copied()
            .ok_or_else(|| EvalError::internal("empty single-valued operand"))
    };
    // Snapshot single-valued operands before touching the output so the
    // broadcast cannot observe partially written results.
    let l0 = if left_single {
        Some(scalar(&left_vals, dst)?)
    } else {
        None
    };
    let r0 = if !neg && right_single {
        Some(scalar(&right_vals, dst)?)
    } else {
        None
    };
    dst.resize(n, 0.0);
    for i in 0..n {
        let lval = match l0 {
            Some(v) => v,
            None => match &left_vals {
                Some(vals) => vals[i],
                None => dst[i],
            },
        };
        let rval = if neg {
            0.0
        } else {
            match r0 {
                Some(v) => v,
                None => match &right_vals {
                    Some(vals) => vals[i],
                    None => dst[i],
                },
            }
        };
        dst[i] = match op {
            ArithOp::Add => lval + rval,
            ArithOp::Sub => lval - rval,
            ArithOp::Neg => -lval,
            ArithOp::Mul => lval * rval,
            ArithOp::Div => lval / rval,
            ArithOp::Exp => lval.powf(rval),
        };
    }
    sel.v.nr = n;
    Ok(())
}
