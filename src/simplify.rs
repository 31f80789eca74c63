//! Expression simplifier.
//!
//! Rule-directed canonicalization driven by the directive tables in
//! `rules.rs`. The outer loop simplifies children bottom-up, attempts
//! join-by-value reductions (constant folding, identity elimination), then
//! the algebraic join rules under a strict complexity filter, and finally the
//! prettify pack rules when explicitly requested. Results, including
//! negative ones, are cached per thread keyed by expression hash.

use crate::core::masks::fill;
use crate::directive::transform;
use crate::expr::{Expr, ExprRef};
use crate::rules::{JOIN_DESCRIPTORS, PACK_DESCRIPTORS, UNIVERSAL_SIMPLIFIERS, UNPACK_DESCRIPTORS};
use rustc_hash::FxHashMap;
use std::cell::RefCell;

/// Hard bound on simplifier recursion; reaching it fails the current branch
/// without poisoning the cache.
const MAX_DEPTH: usize = 512;

/// Cache size bound; the map is flushed wholesale once exceeded.
const MAX_CACHE_ENTRIES: usize = 0x10000;

#[derive(Clone)]
enum CacheEntry {
    /// Recursion marker; an expression re-entered while being simplified
    /// reports no improvement.
    InProgress,
    Failed,
    Simplified(ExprRef),
}

struct SimplifierState {
    cache: FxHashMap<ExprRef, CacheEntry>,
    depth: usize,
    /// Depth bound for speculative join evaluation.
    max_depth: usize,
}

impl SimplifierState {
    fn new() -> Self {
        SimplifierState {
            cache: FxHashMap::default(),
            depth: 0,
            max_depth: usize::MAX,
        }
    }
}

thread_local! {
    static STATE: RefCell<SimplifierState> = RefCell::new(SimplifierState::new());
}

/// Drops the thread-local simplifier cache.
pub fn purge_cache() {
    STATE.with(|s| s.borrow_mut().cache.clear());
}

fn cache_lookup(exp: &ExprRef) -> Option<CacheEntry> {
    STATE.with(|s| s.borrow().cache.get(exp).cloned())
}

fn cache_store(exp: &ExprRef, entry: CacheEntry) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        if s.cache.len() >= MAX_CACHE_ENTRIES {
            s.cache.clear();
        }
        s.cache.insert(exp.clone(), entry);
    });
}

fn depth_enter() -> bool {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        if s.depth >= MAX_DEPTH.min(s.max_depth) {
            return false;
        }
        s.depth += 1;
        true
    })
}

fn depth_leave() {
    STATE.with(|s| s.borrow_mut().depth -= 1);
}

/// Simplifies the expression; returns the (possibly unchanged) canonical
/// form and whether an improvement was made. With `prettify` set the pack
/// rules run as well and the result favors readability.
pub fn simplify(exp: &ExprRef, prettify: bool) -> (ExprRef, bool) {
    if !depth_enter() {
        return (exp.clone(), false);
    }
    let result = simplify_inner(exp, prettify, prettify);
    depth_leave();
    result
}

fn clear_lazy_deep(exp: &ExprRef) -> ExprRef {
    if !exp.is_lazy {
        return exp.clone();
    }
    let mut e: Expr = (**exp).clone();
    e.is_lazy = false;
    e.lhs = e.lhs.take().map(|l| clear_lazy_deep(&l));
    e.rhs = e.rhs.take().map(|r| clear_lazy_deep(&r));
    e.update(false);
    ExprRef::from(e)
}

fn simplify_inner(input: &ExprRef, pretty: bool, unpack: bool) -> (ExprRef, bool) {
    // Clear laziness before doing any work.
    let exp = clear_lazy_deep(input);

    // Leaves cannot simplify further.
    if !exp.is_expression() {
        return (exp, false);
    }

    // The hint short-circuits everything except an explicit prettify pass.
    if exp.is_simple() {
        if pretty {
            let (p, _) = prettify_expression(&exp);
            return (p, false);
        }
        return (exp, false);
    }

    // A fully known value collapses to a constant outright.
    if exp.value.is_known() {
        return (ExprRef::from_bitvector(exp.value), true);
    }

    // Cache lookup, including negative results.
    match cache_lookup(&exp) {
        Some(CacheEntry::Simplified(cached)) => return (cached, true),
        Some(CacheEntry::Failed) | Some(CacheEntry::InProgress) => {
            return (exp, false);
        }
        None => {}
    }
    cache_store(&exp, CacheEntry::InProgress);

    let (result, success) = simplify_body(&exp, pretty, unpack);
    result.set_simple(true);
    if success {
        cache_store(&exp, CacheEntry::Simplified(result.clone()));
    } else {
        cache_store(&exp, CacheEntry::Failed);
    }
    (result, success)
}

fn simplify_body(exp: &ExprRef, pretty: bool, unpack: bool) -> (ExprRef, bool) {
    use crate::core::operators::Op;

    // Resizing is a hot path with hand-written propagation: simplify the
    // operand and retry the implicit resize instead of matching directives.
    if exp.op == Op::Ucast || exp.op == Op::Cast {
        let lhs = exp.lhs.as_ref().unwrap();
        let new_size = exp.rhs.as_ref().unwrap().get_u64().unwrap() as u32;
        let (lhs_s, simplified) = simplify(lhs, pretty);

        if let Some(resized) = lhs_s.resized_no_explicit(new_size, exp.op == Op::Cast) {
            if resized.size() == new_size && (simplified || resized.complexity < exp.complexity) {
                return (resized, true);
            }
        }
        if simplified {
            let rebuilt = ExprRef::build_binary(lhs_s, exp.op, exp.rhs.as_ref().unwrap().clone());
            return (rebuilt, true);
        }
        return (exp.clone(), false);
    }

    // A bitwise expression over a single variable normalizes to the
    // ((v & M) ^ X) | O form when that strictly reduces complexity.
    if let Some(normal) = simplify_boolean_expression(exp) {
        let (s, _) = simplify(&normal, pretty);
        return (s, true);
    }

    // Simplify operands first if not done already.
    let mut new_lhs = None;
    let mut new_rhs = None;
    let mut child_changed = false;
    if let Some(lhs) = &exp.lhs {
        if !lhs.is_simple() {
            let (s, ok) = simplify(lhs, false);
            if ok {
                new_lhs = Some(s);
                child_changed = true;
            }
        }
    }
    if let Some(rhs) = &exp.rhs {
        if !rhs.is_simple() {
            let (s, ok) = simplify(rhs, false);
            if ok {
                new_rhs = Some(s);
                child_changed = true;
            }
        }
    }
    if child_changed {
        let rhs = new_rhs.unwrap_or_else(|| exp.rhs.as_ref().unwrap().clone());
        let rebuilt = if exp.op.operand_count() == 1 {
            ExprRef::build_unary(exp.op, rhs)
        } else {
            let lhs = new_lhs.unwrap_or_else(|| exp.lhs.as_ref().unwrap().clone());
            ExprRef::build_binary(lhs, exp.op, rhs)
        };
        let (s, _) = simplify(&rebuilt, pretty);
        return (s, true);
    }

    // If the partial evaluator reduced the value, replace with a constant.
    if exp.value.is_known() {
        return (ExprRef::from_bitvector(exp.value), true);
    }

    // Join-by-value and algebraic identity rules.
    for rule in UNIVERSAL_SIMPLIFIERS.for_op(exp.op) {
        if let Some(exp_new) = transform(exp, &rule.src, &rule.dst, &rule.signatures, &mut |_| true)
        {
            log::trace!("[simplify] {} => {} on {exp}", rule.src, rule.dst);
            let (exp_new, _) = simplify(&exp_new, pretty);
            if exp.is_identical(&exp_new) {
                return (exp.clone(), false);
            }
            return (exp_new, true);
        }
    }

    // Join descriptors: distribution and re-association toward a canonical
    // spine. Results must strictly reduce complexity, checked after a
    // depth-bounded speculative simplification.
    let mut filter = |candidate: &ExprRef| -> bool {
        if candidate.complexity < exp.complexity {
            return true;
        }
        // Speculatively simplify under a depth budget proportional to the
        // candidate's own depth; pass only on a strict reduction.
        let prev_bound = STATE.with(|s| {
            let mut s = s.borrow_mut();
            let prev = s.max_depth;
            s.max_depth = s
                .max_depth
                .min(s.depth + (candidate.depth as usize) * 2 + 2);
            prev
        });
        let (s, _) = simplify(candidate, false);
        STATE.with(|st| st.borrow_mut().max_depth = prev_bound);
        s.complexity < exp.complexity
    };
    for rule in JOIN_DESCRIPTORS.for_op(exp.op) {
        if let Some(exp_new) = transform(exp, &rule.src, &rule.dst, &rule.signatures, &mut filter) {
            log::trace!("[join] {} => {} on {exp}", rule.src, rule.dst);
            let (exp_new, _) = simplify(&exp_new, pretty);
            if exp.is_identical(&exp_new) {
                return (exp.clone(), false);
            }
            if exp_new.complexity < exp.complexity {
                return (exp_new, true);
            }
            return (exp.clone(), false);
        }
    }

    // Unpack higher-level operators when requested.
    if unpack {
        let mut unpack_filter = |candidate: &ExprRef| -> bool {
            let (s, _) = simplify(candidate, true);
            s.complexity < exp.complexity
        };
        for rule in UNPACK_DESCRIPTORS.for_op(exp.op) {
            if let Some(exp_new) =
                transform(exp, &rule.src, &rule.dst, &rule.signatures, &mut unpack_filter)
            {
                let (exp_new, _) = simplify(&exp_new, true);
                if !exp.is_identical(&exp_new) {
                    return (exp_new, true);
                }
                return (exp.clone(), false);
            }
        }
    }

    if pretty {
        let (p, changed) = prettify_expression(exp);
        if changed {
            return (p, false);
        }
    }
    (exp.clone(), false)
}

/// Re-groups simple representations into the more readable operator forms.
fn prettify_expression(exp: &ExprRef) -> (ExprRef, bool) {
    if !exp.is_expression() {
        return (exp.clone(), false);
    }

    // Prettify operands first.
    let mut changed = false;
    let new_lhs = exp.lhs.as_ref().map(|l| {
        let (p, c) = prettify_expression(l);
        changed |= c;
        p
    });
    let new_rhs = exp.rhs.as_ref().map(|r| {
        let (p, c) = prettify_expression(r);
        changed |= c;
        p
    });
    let cur = if changed {
        let rhs = new_rhs.unwrap();
        if exp.op.operand_count() == 1 {
            ExprRef::build_unary(exp.op, rhs)
        } else {
            ExprRef::build_binary(new_lhs.unwrap(), exp.op, rhs)
        }
    } else {
        exp.clone()
    };

    for rule in PACK_DESCRIPTORS.for_op(cur.op) {
        if let Some(packed) = transform(&cur, &rule.src, &rule.dst, &rule.signatures, &mut |_| true)
        {
            log::trace!("[pack] {} => {} on {cur}", rule.src, rule.dst);
            return (packed, true);
        }
    }
    (cur, changed)
}

/// Checks if the expression is a bitwise circuit over (at most) one variable
/// and returns that variable leaf.
fn match_boolean_expression(exp: &ExprRef) -> Option<Option<ExprRef>> {
    use crate::core::operators::Op;
    match exp.op {
        Op::Invalid => {
            if exp.is_variable() {
                Some(Some(exp.clone()))
            } else {
                Some(None)
            }
        }
        Op::BitwiseNot => match_boolean_expression(exp.rhs.as_ref().unwrap()),
        Op::BitwiseOr | Op::BitwiseAnd | Op::BitwiseXor => {
            let p1 = match_boolean_expression(exp.lhs.as_ref().unwrap())?;
            let p2 = match_boolean_expression(exp.rhs.as_ref().unwrap())?;
            match (p1, p2) {
                (Some(a), Some(b)) => {
                    if a.uid == b.uid && a.size() == b.size() {
                        Some(Some(a))
                    } else {
                        None
                    }
                }
                (Some(a), None) => Some(Some(a)),
                (None, b) => Some(b),
            }
        }
        _ => None,
    }
}

/// Normalizes a single-variable bitwise circuit into `((v & A) ^ X) | O` by
/// evaluating it under the all-zero and all-one assignments.
fn simplify_boolean_expression(exp: &ExprRef) -> Option<ExprRef> {
    let base = match_boolean_expression(exp)??;

    let r0 = exp.evaluate(&|_| Some(0));
    let r1 = exp.evaluate(&|_| Some(u64::MAX));
    let size = exp.size();
    let mask = fill(size);

    let and_mask = !(r0.known_zero() & r1.known_zero()) & mask;
    let or_mask = r0.known_one() & r1.known_one();
    let xor_mask = r0.known_one() & r1.known_zero();

    let mut exp_new = base.resized(size, false);
    if and_mask != mask {
        exp_new = ExprRef::binary(exp_new, crate::core::operators::Op::BitwiseAnd,
                                  ExprRef::constant_u(and_mask, size));
    }
    if xor_mask != 0 {
        exp_new = ExprRef::binary(exp_new, crate::core::operators::Op::BitwiseXor,
                                  ExprRef::constant_u(xor_mask, size));
    }
    if or_mask != 0 {
        exp_new = ExprRef::binary(exp_new, crate::core::operators::Op::BitwiseOr,
                                  ExprRef::constant_u(or_mask, size));
    }

    if exp_new.complexity >= exp.complexity {
        return None;
    }
    Some(exp_new)
}

/// Test-time introspection: number of live cache entries.
#[doc(hidden)]
pub fn cache_len() -> usize {
    STATE.with(|s| s.borrow().cache.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operators::Op;

    #[test]
    fn test_xor_cancellation() {
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);
        let e = (&x ^ &y) ^ &y;
        let s = e.simplified(false);
        assert!(s.is_identical(&x), "{s}");
    }

    #[test]
    fn test_mul_collection() {
        let x = ExprRef::variable("x", 32);
        let e = (&x * 2) + (&x * 3);
        let s = e.simplified(false);
        let expected = &x * 5;
        assert!(s.is_identical(&expected), "{s}");
    }

    #[test]
    fn test_add_zero_identity() {
        let x = ExprRef::variable("x", 32);
        let e = ExprRef::build_binary(x.clone(), Op::Add, ExprRef::constant(0, 32));
        let s = e.simplified(false);
        assert!(s.is_identical(&x));
    }

    #[test]
    fn test_and_not_self() {
        let x = ExprRef::variable("x", 32);
        let e = &x & &(!&x);
        assert_eq!(e.get_u64(), Some(0));
    }

    #[test]
    fn test_idempotent() {
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);
        let e = ((&x ^ &y) | (&x & &y)) + 1;
        let once = e.simplified(false);
        let twice = once.simplified(false);
        assert!(once.is_identical(&twice));
    }

    #[test]
    fn test_double_not() {
        let x = ExprRef::variable("x", 16);
        let e = !&(!&x);
        let s = e.simplified(false);
        assert!(s.is_identical(&x));
    }

    #[test]
    fn test_sub_self() {
        let x = ExprRef::variable("x", 64);
        let e = &x - &x;
        assert_eq!(e.get_u64(), Some(0));
    }

    #[test]
    fn test_boolean_normalization() {
        // (x | c) over one variable normalizes without changing semantics.
        let x = ExprRef::variable("x", 8);
        let e = (!&(!&x)) | 0x0F;
        let s = e.simplified(false);
        let xv = x.uid.clone().unwrap();
        for probe in [0u64, 0x55, 0xAA, 0xFF] {
            let lhs = s.evaluate(&|uid| if *uid == xv { Some(probe) } else { None });
            assert_eq!(lhs.get_u64(), Some((probe | 0x0F) & 0xFF));
        }
    }

    #[test]
    fn test_negative_results_cached() {
        purge_cache();
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);
        // mul of two distinct variables cannot simplify.
        let e = ExprRef::build_binary(x, Op::Multiply, y);
        let (_, changed) = simplify(&e, false);
        assert!(!changed);
        assert!(cache_len() > 0);
    }
}
