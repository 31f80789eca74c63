//! Rewrite directives.
//!
//! A directive is a pattern expression over match-variables and operators,
//! extended with control operators evaluated at translation time:
//! `simplify(x)` requires `x` to simplify, `try_simplify(x)` attempts it,
//! `iff(c, x)` produces `x` only when `c` holds, `or_else(a, b)` picks the
//! first alternative that translates, and the `mask_*` accessors extract the
//! bit-state masks of a bound operand as constants.

use crate::core::bitvec::BitVector;
use crate::core::masks::fill;
use crate::core::operators::Op;
use crate::expr::{ExprRef, ExprSignature};
use crate::pool::ObjectPool;
use std::fmt;
use std::ops;
use std::sync::{Arc, OnceLock};

/// Shared scratch allocator for match symbol tables.
fn match_scratch_pool() -> &'static Arc<ObjectPool<Vec<SymbolTable>>> {
    static POOL: OnceLock<Arc<ObjectPool<Vec<SymbolTable>>>> = OnceLock::new();
    POOL.get_or_init(ObjectPool::new)
}

/// Constraint on what a match-variable may bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Any,
    Variable,
    Constant,
    Expression,
    NonConstant,
    NonExpression,
}

/// Operator of a directive node: either a real expression operator or a
/// translation-time control operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirOp {
    /// Leaf (constant or match-variable).
    Leaf,
    Math(Op),
    Simplify,
    TrySimplify,
    Iff,
    OrElse,
    MaskUnknown,
    MaskOne,
    MaskZero,
    Unreachable,
    Warning,
}

#[derive(Debug)]
pub struct DirNode {
    /// If a match-variable, its display name and constraints.
    id: Option<&'static str>,
    lookup_index: usize,
    mtype: MatchType,

    /// If a constant leaf, its value (64-bit, resized at match time).
    value: Option<i64>,

    op: DirOp,
    lhs: Option<Directive>,
    rhs: Option<Directive>,
    num_nodes: usize,
}

/// Shared immutable directive tree.
#[derive(Debug, Clone)]
pub struct Directive(Arc<DirNode>);

impl ops::Deref for Directive {
    type Target = DirNode;
    fn deref(&self) -> &DirNode {
        &self.0
    }
}

impl DirNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.op, DirOp::Leaf)
    }
    pub fn is_constant(&self) -> bool {
        self.value.is_some()
    }
    pub fn is_variable(&self) -> bool {
        self.id.is_some()
    }
}

/// Number of distinct match-variable slots; an arbitrary constant that keeps
/// the symbol table on the stack.
pub const NUM_LOOKUP_INDICES: usize = 12;

impl Directive {
    pub fn constant(value: i64) -> Directive {
        Directive(Arc::new(DirNode {
            id: None,
            lookup_index: 0,
            mtype: MatchType::Any,
            value: Some(value),
            op: DirOp::Leaf,
            lhs: None,
            rhs: None,
            num_nodes: 1,
        }))
    }

    pub fn matcher(id: &'static str, lookup_index: usize, mtype: MatchType) -> Directive {
        debug_assert!(lookup_index < NUM_LOOKUP_INDICES);
        Directive(Arc::new(DirNode {
            id: Some(id),
            lookup_index,
            mtype,
            value: None,
            op: DirOp::Leaf,
            lhs: None,
            rhs: None,
            num_nodes: 1,
        }))
    }

    pub fn unary(op: DirOp, rhs: &Directive) -> Directive {
        Directive(Arc::new(DirNode {
            id: None,
            lookup_index: 0,
            mtype: MatchType::Any,
            value: None,
            op,
            lhs: None,
            rhs: Some(rhs.clone()),
            num_nodes: rhs.num_nodes + 1,
        }))
    }

    pub fn binary(lhs: &Directive, op: DirOp, rhs: &Directive) -> Directive {
        Directive(Arc::new(DirNode {
            id: None,
            lookup_index: 0,
            mtype: MatchType::Any,
            value: None,
            op,
            lhs: Some(lhs.clone()),
            rhs: Some(rhs.clone()),
            num_nodes: lhs.num_nodes + rhs.num_nodes + 1,
        }))
    }

    /// Top-level expression operator this pattern matches, if any.
    pub fn head_op(&self) -> Option<Op> {
        match self.op {
            DirOp::Math(op) => Some(op),
            _ => None,
        }
    }

    /// Signature any candidate of the given width must contain to match this
    /// pattern. Match-variables contribute nothing; control operators never
    /// appear in source patterns.
    pub fn signature_for(&self, width: u32) -> ExprSignature {
        match self.op {
            DirOp::Leaf => {
                if let Some(v) = self.value {
                    ExprSignature::from_value(&BitVector::constant(v as u64, width))
                } else {
                    ExprSignature::default()
                }
            }
            DirOp::Math(op) => {
                let rhs = self.rhs.as_ref().unwrap().signature_for(width);
                match &self.lhs {
                    Some(lhs) => ExprSignature::binary(&lhs.signature_for(width), op, &rhs),
                    None => ExprSignature::unary(op, &rhs),
                }
            }
            _ => ExprSignature::default(),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lhs = self.lhs.as_ref().map_or(String::new(), |d| d.to_string());
        let rhs = self.rhs.as_ref().map_or(String::new(), |d| d.to_string());
        match self.op {
            DirOp::Leaf => {
                if let Some(id) = self.id {
                    write!(f, "{id}")
                } else {
                    write!(f, "{}", self.value.unwrap_or(0))
                }
            }
            DirOp::Math(op) => write!(f, "{}", op.format(&lhs, &rhs)),
            DirOp::Simplify => write!(f, "{{!{rhs}}}"),
            DirOp::TrySimplify => write!(f, "{{try!{rhs}}}"),
            DirOp::Iff => write!(f, "{{{lhs} ? {rhs}}}"),
            DirOp::OrElse => write!(f, "{{{lhs} <=> {rhs}}}"),
            DirOp::MaskUnknown => write!(f, "{{mask=? {rhs}}}"),
            DirOp::MaskOne => write!(f, "{{mask=1 {rhs}}}"),
            DirOp::MaskZero => write!(f, "{{mask=0 {rhs}}}"),
            DirOp::Unreachable => write!(f, "unreachable()"),
            DirOp::Warning => write!(f, "{{warning(), {rhs}}}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

/// Variable → expression mapping produced by a successful unification.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    slots: [Option<ExprRef>; NUM_LOOKUP_INDICES],
}

impl SymbolTable {
    /// Binds a match-variable, enforcing its constraint; a repeated binding
    /// must be identical to the previous one.
    fn add(&mut self, dir: &DirNode, exp: &ExprRef) -> bool {
        let slot = &mut self.slots[dir.lookup_index];
        match slot {
            None => {
                let ok = match dir.mtype {
                    MatchType::Any => true,
                    MatchType::Variable => exp.is_variable(),
                    MatchType::Constant => exp.is_constant(),
                    MatchType::Expression => exp.is_expression(),
                    MatchType::NonConstant => exp.unknown_mask() != 0,
                    MatchType::NonExpression => !exp.is_expression(),
                };
                if ok {
                    *slot = Some(exp.clone());
                }
                ok
            }
            Some(existing) => existing.is_identical(exp),
        }
    }

    /// Looks up the expression bound to a match-variable.
    pub fn translate(&self, dir: &DirNode) -> Option<ExprRef> {
        debug_assert!(dir.is_variable());
        self.slots[dir.lookup_index].clone()
    }
}

// ---------------------------------------------------------------------------
// Unification
// ---------------------------------------------------------------------------

/// Tries to match `exp` against `dir`, extending the set of candidate symbol
/// tables. Returns the number of results produced at/after `index`.
pub fn fast_match(
    results: &mut Vec<SymbolTable>,
    dir: &Directive,
    exp: &ExprRef,
    index: usize,
) -> usize {
    let mut size_0 = results.len();
    if size_0 == 0 {
        results.push(SymbolTable::default());
        size_0 = 1;
    }

    match dir.op {
        DirOp::Leaf => {
            if dir.is_variable() {
                if !results[index].add(dir, exp) {
                    results.remove(index);
                }
            } else {
                // Constant pattern: compare under the expression's mask.
                let mask = fill(exp.size());
                let matches = exp.is_constant()
                    && (exp.known_one() & mask) == (dir.value.unwrap() as u64 & mask);
                if !matches {
                    results.remove(index);
                }
            }
        }
        DirOp::Math(op) if exp.op == op => {
            let desc = op.desc();
            let exp_rhs = exp.rhs.as_ref().unwrap();
            if desc.operand_count == 1 {
                return fast_match(results, dir.rhs.as_ref().unwrap(), exp_rhs, index);
            }
            let exp_lhs = exp.lhs.as_ref().unwrap();
            let dir_lhs = dir.lhs.as_ref().unwrap();
            let dir_rhs = dir.rhs.as_ref().unwrap();

            if desc.is_commutative {
                // Fork the table: try (rhs→rhs, lhs→lhs) and the swap.
                let saved = results[index].clone();

                let n = fast_match(results, dir_rhs, exp_rhs, index);
                for k in (0..n).rev() {
                    fast_match(results, dir_lhs, exp_lhs, index + k);
                }

                results.push(saved);
                let index = results.len() - 1;
                let n = fast_match(results, dir_lhs, exp_rhs, index);
                for k in (0..n).rev() {
                    fast_match(results, dir_rhs, exp_lhs, index + k);
                }
            } else {
                let n = fast_match(results, dir_rhs, exp_rhs, index);
                for k in (0..n).rev() {
                    fast_match(results, dir_lhs, exp_lhs, index + k);
                }
            }
        }
        _ => {
            results.remove(index);
        }
    }

    (results.len() + 1) - size_0
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Translates a directive into an expression of the given width using the
/// bindings of a successful match. Returns `None` when a control operator
/// rejects the translation.
pub fn translate(sym: &SymbolTable, dir: &Directive, bit_cnt: u32) -> Option<ExprRef> {
    match dir.op {
        DirOp::Leaf => {
            if dir.is_variable() {
                sym.translate(dir)
            } else {
                let width = if bit_cnt == 0 { 64 } else { bit_cnt };
                Some(ExprRef::constant(dir.value.unwrap(), width))
            }
        }

        DirOp::Math(op) => {
            // Casts redirect to resize.
            if op == Op::Ucast || op == Op::Cast {
                let lhs = translate(sym, dir.lhs.as_ref().unwrap(), 0)?;
                let rhs = translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)?;
                let size = rhs.get_u64()? as u32;
                if size == 0 || size > 64 {
                    return None;
                }
                return Some(lhs.resized(size, op == Op::Cast));
            }
            let rhs = translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)?;
            match &dir.lhs {
                Some(lhs_dir) => {
                    let lhs = translate(sym, lhs_dir, bit_cnt)?;
                    Some(ExprRef::build_binary(lhs, op, rhs))
                }
                None => Some(ExprRef::build_unary(op, rhs)),
            }
        }

        DirOp::Simplify => {
            let e = translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)?;
            if e.is_simple() {
                return None;
            }
            let (s, changed) = crate::simplify::simplify(&e, false);
            if changed {
                Some(s)
            } else {
                None
            }
        }

        DirOp::TrySimplify => {
            let e = translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)?;
            Some(crate::simplify::simplify(&e, false).0)
        }

        DirOp::OrElse => translate(sym, dir.lhs.as_ref().unwrap(), bit_cnt)
            .or_else(|| translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)),

        DirOp::Iff => {
            let cond = translate(sym, dir.lhs.as_ref().unwrap(), 0)?;
            let cond = crate::simplify::simplify(&cond, false).0;
            if cond.get_u64().unwrap_or(0) == 0 {
                return None;
            }
            translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)
        }

        DirOp::MaskUnknown => {
            let e = translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)?;
            Some(ExprRef::constant_u(e.unknown_mask(), e.size()))
        }
        DirOp::MaskOne => {
            let e = translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)?;
            Some(ExprRef::constant_u(e.known_one(), e.size()))
        }
        DirOp::MaskZero => {
            let e = translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)?;
            Some(ExprRef::constant_u(e.known_zero(), e.size()))
        }

        DirOp::Unreachable => {
            log::error!("directive-time assertion failure");
            None
        }
        DirOp::Warning => {
            log::warn!("directive-time warning");
            translate(sym, dir.rhs.as_ref().unwrap(), bit_cnt)
        }
    }
}

// ---------------------------------------------------------------------------
// Transformation
// ---------------------------------------------------------------------------

/// Attempts to rewrite `exp` from pattern `from` into construction `to`.
/// `signatures` carries the precomputed per-width signature of `from`; the
/// filter decides whether a translated candidate is accepted.
pub fn transform(
    exp: &ExprRef,
    from: &Directive,
    to: &Directive,
    signatures: &[ExprSignature; 64],
    filter: &mut dyn FnMut(&ExprRef) -> bool,
) -> Option<ExprRef> {
    debug_assert!(0 < exp.size() && exp.size() <= 64);

    // Fast path: signature superset check.
    if !exp.signature.can_match(&signatures[exp.size() as usize - 1]) {
        return None;
    }

    // Scratch tables come from the shared pool; a recycled buffer keeps its
    // capacity and its old contents are torn down here, not at free time.
    let Ok(mut results) = match_scratch_pool().allocate_dirty(Vec::new) else {
        log::error!("match scratch pool exhausted");
        return None;
    };
    results.clear();
    if fast_match(&mut results, from, exp, 0) == 0 {
        return None;
    }

    for sym in results.iter() {
        let Some(mut exp_new) = translate(sym, to, exp.size()) else {
            continue;
        };
        if !filter(&exp_new) {
            continue;
        }
        // A directive must leave the width balanced; a constant is refit,
        // anything else is a rule bug and the candidate is skipped.
        if exp_new.size() != exp.size() {
            if exp_new.is_constant() {
                exp_new = ExprRef::constant(exp_new.get_i64().unwrap(), exp.size());
            } else {
                log::error!(
                    "directive '{from}' => '{to}' left the simplifier unbalanced \
                     ({} bits vs {} bits)",
                    exp_new.size(),
                    exp.size()
                );
                continue;
            }
        }
        return Some(exp_new);
    }
    None
}

// ---------------------------------------------------------------------------
// Pattern construction DSL
// ---------------------------------------------------------------------------

macro_rules! impl_dir_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait<&Directive> for &Directive {
            type Output = Directive;
            fn $method(self, rhs: &Directive) -> Directive {
                Directive::binary(self, DirOp::Math($op), rhs)
            }
        }
        impl ops::$trait<Directive> for Directive {
            type Output = Directive;
            fn $method(self, rhs: Directive) -> Directive {
                Directive::binary(&self, DirOp::Math($op), &rhs)
            }
        }
        impl ops::$trait<Directive> for &Directive {
            type Output = Directive;
            fn $method(self, rhs: Directive) -> Directive {
                Directive::binary(self, DirOp::Math($op), &rhs)
            }
        }
        impl ops::$trait<&Directive> for Directive {
            type Output = Directive;
            fn $method(self, rhs: &Directive) -> Directive {
                Directive::binary(&self, DirOp::Math($op), rhs)
            }
        }
        impl ops::$trait<i64> for &Directive {
            type Output = Directive;
            fn $method(self, rhs: i64) -> Directive {
                Directive::binary(self, DirOp::Math($op), &Directive::constant(rhs))
            }
        }
        impl ops::$trait<i64> for Directive {
            type Output = Directive;
            fn $method(self, rhs: i64) -> Directive {
                Directive::binary(&self, DirOp::Math($op), &Directive::constant(rhs))
            }
        }
        impl ops::$trait<&Directive> for i64 {
            type Output = Directive;
            fn $method(self, rhs: &Directive) -> Directive {
                Directive::binary(&Directive::constant(self), DirOp::Math($op), rhs)
            }
        }
        impl ops::$trait<Directive> for i64 {
            type Output = Directive;
            fn $method(self, rhs: Directive) -> Directive {
                Directive::binary(&Directive::constant(self), DirOp::Math($op), &rhs)
            }
        }
    };
}

impl_dir_binop!(Add, add, Op::Add);
impl_dir_binop!(Sub, sub, Op::Subtract);
impl_dir_binop!(Mul, mul, Op::Multiply);
impl_dir_binop!(Div, div, Op::Divide);
impl_dir_binop!(Rem, rem, Op::Remainder);
impl_dir_binop!(BitAnd, bitand, Op::BitwiseAnd);
impl_dir_binop!(BitOr, bitor, Op::BitwiseOr);
impl_dir_binop!(BitXor, bitxor, Op::BitwiseXor);
impl_dir_binop!(Shl, shl, Op::ShiftLeft);
impl_dir_binop!(Shr, shr, Op::ShiftRight);

impl ops::Neg for &Directive {
    type Output = Directive;
    fn neg(self) -> Directive {
        Directive::unary(DirOp::Math(Op::Negate), self)
    }
}
impl ops::Neg for Directive {
    type Output = Directive;
    fn neg(self) -> Directive {
        Directive::unary(DirOp::Math(Op::Negate), &self)
    }
}
impl ops::Not for &Directive {
    type Output = Directive;
    fn not(self) -> Directive {
        Directive::unary(DirOp::Math(Op::BitwiseNot), self)
    }
}
impl ops::Not for Directive {
    type Output = Directive;
    fn not(self) -> Directive {
        Directive::unary(DirOp::Math(Op::BitwiseNot), &self)
    }
}

/// Rule-building helpers; see `rules.rs` for the tables built with these.
pub mod dsl {
    use super::{DirOp, Directive, Op};

    /// Anything usable as a directive operand: a pattern, a reference to one,
    /// or an integer literal.
    pub trait IntoDir {
        fn into_dir(self) -> Directive;
    }
    impl IntoDir for Directive {
        fn into_dir(self) -> Directive {
            self
        }
    }
    impl IntoDir for &Directive {
        fn into_dir(self) -> Directive {
            self.clone()
        }
    }
    impl IntoDir for i64 {
        fn into_dir(self) -> Directive {
            Directive::constant(self)
        }
    }

    /// Integer literal operand.
    pub fn c(v: i64) -> Directive {
        Directive::constant(v)
    }

    fn un(op: DirOp, rhs: impl IntoDir) -> Directive {
        Directive::unary(op, &rhs.into_dir())
    }
    fn bin(lhs: impl IntoDir, op: DirOp, rhs: impl IntoDir) -> Directive {
        Directive::binary(&lhs.into_dir(), op, &rhs.into_dir())
    }

    /// `x` must simplify for the directive to hold.
    pub fn sim(x: impl IntoDir) -> Directive {
        un(DirOp::Simplify, x)
    }
    /// `x` is passed through the simplifier, success not required.
    pub fn try_sim(x: impl IntoDir) -> Directive {
        un(DirOp::TrySimplify, x)
    }
    /// Produces `b` when `a` evaluates true, otherwise rejects.
    pub fn iff(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Iff, b)
    }
    /// Picks `a` when it translates, otherwise `b`.
    pub fn or_else(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::OrElse, b)
    }
    pub fn mask_unk(x: impl IntoDir) -> Directive {
        un(DirOp::MaskUnknown, x)
    }
    pub fn mask_k1(x: impl IntoDir) -> Directive {
        un(DirOp::MaskOne, x)
    }
    pub fn mask_k0(x: impl IntoDir) -> Directive {
        un(DirOp::MaskZero, x)
    }

    pub fn rotl(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::RotateLeft), b)
    }
    pub fn rotr(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::RotateRight), b)
    }
    pub fn ucast(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::Ucast), b)
    }
    pub fn scast(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::Cast), b)
    }
    pub fn udiv(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::Udivide), b)
    }
    pub fn urem(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::Uremainder), b)
    }
    pub fn umul(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::Umultiply), b)
    }
    pub fn bt(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::BitTest), b)
    }
    /// `cond ? value : 0`.
    pub fn if_v(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::ValueIf), b)
    }
    pub fn vmin(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::MinValue), b)
    }
    pub fn vmax(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::MaxValue), b)
    }
    pub fn uvmin(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::UminValue), b)
    }
    pub fn uvmax(a: impl IntoDir, b: impl IntoDir) -> Directive {
        bin(a, DirOp::Math(Op::UmaxValue), b)
    }
    pub fn popcnt_of(a: impl IntoDir) -> Directive {
        un(DirOp::Math(Op::Popcnt), a)
    }
    pub fn bsf_of(a: impl IntoDir) -> Directive {
        un(DirOp::Math(Op::BitscanFwd), a)
    }
    pub fn mask_of(a: impl IntoDir) -> Directive {
        un(DirOp::Math(Op::Mask), a)
    }
    /// Bit width of the operand as an 8-bit constant.
    pub fn bcnt(a: impl IntoDir) -> Directive {
        un(DirOp::Math(Op::BitCount), a)
    }

    macro_rules! cmp_fn {
        ($name:ident, $op:expr) => {
            pub fn $name(a: impl IntoDir, b: impl IntoDir) -> Directive {
                bin(a, DirOp::Math($op), b)
            }
        };
    }
    cmp_fn!(gt, Op::Greater);
    cmp_fn!(ge, Op::GreaterEq);
    cmp_fn!(eq, Op::Equal);
    cmp_fn!(ne, Op::NotEqual);
    cmp_fn!(le, Op::LessEq);
    cmp_fn!(lt, Op::Less);
    cmp_fn!(ugt, Op::Ugreater);
    cmp_fn!(uge, Op::UgreaterEq);
    cmp_fn!(ueq, Op::Uequal);
    cmp_fn!(une, Op::UnotEqual);
    cmp_fn!(ule, Op::UlessEq);
    cmp_fn!(ult, Op::Uless);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules;

    fn a() -> Directive {
        Directive::matcher("α", 0, MatchType::Any)
    }
    fn b() -> Directive {
        Directive::matcher("β", 1, MatchType::Any)
    }

    fn sig_of(dir: &Directive) -> Box<[ExprSignature; 64]> {
        rules::signature_table(dir)
    }

    #[test]
    fn test_match_binds_variables() {
        let pat = &a() + &b();
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);
        let e = ExprRef::build_binary(x.clone(), Op::Add, y.clone());

        let mut results = Vec::new();
        let n = fast_match(&mut results, &pat, &e, 0);
        assert!(n > 0);
        assert!(!results.is_empty());
    }

    #[test]
    fn test_repeated_variable_must_unify() {
        // α ^ α only matches when both operands are identical.
        let va = a();
        let pat = &va ^ &va;
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);

        let e_ok = ExprRef::build_binary(x.clone(), Op::BitwiseXor, x.clone());
        let mut results = Vec::new();
        assert!(fast_match(&mut results, &pat, &e_ok, 0) > 0 && !results.is_empty());

        let e_bad = ExprRef::build_binary(x, Op::BitwiseXor, y);
        let mut results = Vec::new();
        fast_match(&mut results, &pat, &e_bad, 0);
        assert!(results.is_empty());
    }

    #[test]
    fn test_constant_constraint() {
        let u = Directive::matcher("Σ", 8, MatchType::Constant);
        let pat = &a() + &u;
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);

        let e = ExprRef::build_binary(x.clone(), Op::Add, ExprRef::constant(4, 32));
        let mut results = Vec::new();
        fast_match(&mut results, &pat, &e, 0);
        assert!(results.iter().any(|s| s.translate(&u).is_some()));

        let e = ExprRef::build_binary(x, Op::Add, y);
        let mut results = Vec::new();
        fast_match(&mut results, &pat, &e, 0);
        assert!(results.is_empty());
    }

    #[test]
    fn test_transform_xor_self() {
        // α ^ α => 0.
        let va = a();
        let from = &va ^ &va;
        let to = Directive::constant(0);
        let x = ExprRef::variable("x", 32);
        let e = ExprRef::build_binary(x.clone(), Op::BitwiseXor, x);
        let sigs = sig_of(&from);
        let out = transform(&e, &from, &to, &sigs, &mut |_| true).unwrap();
        assert!(out.is_constant());
        assert_eq!(out.get_u64(), Some(0));
        assert_eq!(out.size(), 32);
    }

    #[test]
    fn test_signature_rejects() {
        // Pattern headed by xor cannot match an add expression.
        let from = &a() ^ &b();
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);
        let e = ExprRef::build_binary(x, Op::Add, y);
        let sigs = sig_of(&from);
        assert!(transform(&e, &from, &Directive::constant(0), &sigs, &mut |_| true).is_none());
    }
}
