//! Symbolic expression DAG.
//!
//! Expressions are immutable after publication and shared through `ExprRef`;
//! nodes are either constants, variables identified by a [`UniqueId`], or
//! operator applications with one or two children. Construction runs a
//! fixed-point `update` that partially evaluates through the bit-vector
//! engine, collapses fully-known nodes into constants, canonicalizes unsigned
//! multiply/equality into their signed forms, resizes children to the
//! operator's natural width and computes depth, complexity and hash.

use crate::core::bitvec::{BitState, BitVector};
use crate::core::masks::{fill, msb, popcnt};
use crate::core::operators::{evaluate_partial, Op, OP_COUNT};
use crate::variable::Variable;
use std::fmt;
use std::ops;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// 64-bit finalizer (splitmix64). Deterministic per process by design so
/// simplifier cache hits reproduce across identical inputs.
pub(crate) fn hash_u64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

pub(crate) fn hash_combine(a: u64, b: u64) -> u64 {
    hash_u64(a ^ hash_u64(b).rotate_left(27))
}

fn hash_str(s: &str) -> u64 {
    // FNV-1a.
    let mut h = 0xCBF2_9CE4_8422_2325u64;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01B3);
    }
    h
}

// ---------------------------------------------------------------------------
// Expression signatures
// ---------------------------------------------------------------------------

const NUM_OPERATOR_BITS: u32 = {
    let mut n = 0;
    let mut v = OP_COUNT as u64;
    while v != 0 {
        n += 1;
        v >>= 1;
    }
    n
};
const SHRINK_TO: u32 = (64 - NUM_OPERATOR_BITS) / 2;

const fn extend_bits(i: u64, n: u32) -> u64 {
    i << (32 - n / 2)
}

const fn shrink_bits(mut i: u64, n: u32) -> u64 {
    let shr_n = 32 - n / 2;
    let shl_n = 64 - shr_n;
    i |= i >> shl_n;
    i |= i << shl_n;
    ((i >> shr_n) | (i << shl_n)) & ((1u64 << n) - 1)
}

const fn rebalance(i: u64) -> u64 {
    (i >> 32) | (i << 32)
}

/// Compressed operator/descendant fingerprint allowing O(1) rejection of
/// directive matches: a candidate expression can only match a pattern whose
/// signature bits it contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExprSignature {
    words: [u64; 3],
    hash: u64,
}

impl ExprSignature {
    pub fn from_value(value: &BitVector) -> Self {
        ExprSignature {
            words: [0, rebalance(value.known_one()), 0],
            hash: hash_u64(value.known_one()),
        }
    }

    pub fn unary(op: Op, rhs: &ExprSignature) -> Self {
        let w0 = rhs.shrink();
        ExprSignature {
            words: [w0, extend_bits(op as u64, NUM_OPERATOR_BITS), w0],
            hash: hash_combine(rhs.hash, op as u64),
        }
    }

    pub fn binary(lhs: &ExprSignature, op: Op, rhs: &ExprSignature) -> Self {
        let mut w0 = lhs.shrink();
        let w1 = extend_bits(op as u64, NUM_OPERATOR_BITS);
        let mut w2 = rhs.shrink();
        let hash;
        if op.is_commutative() {
            w0 |= w2;
            w2 = w0;
            hash = hash_combine(hash_u64(lhs.hash) ^ hash_u64(rhs.hash), op as u64);
        } else {
            hash = hash_combine(hash_combine(lhs.hash, rhs.hash), op as u64);
        }
        ExprSignature {
            words: [w0, w1, w2],
            hash,
        }
    }

    fn shrink(&self) -> u64 {
        shrink_bits(self.words[0], SHRINK_TO)
            | self.words[1]
            | (shrink_bits(self.words[2], SHRINK_TO) << (64 - SHRINK_TO))
    }

    /// Whether a value with this signature may match a pattern with `o`.
    pub fn can_match(&self, o: &ExprSignature) -> bool {
        self.words
            .iter()
            .zip(o.words.iter())
            .all(|(a, b)| (a & b) == *b)
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

// ---------------------------------------------------------------------------
// Unique identifiers
// ---------------------------------------------------------------------------

/// Opaque handle for a symbolic variable: a stable hash plus a printable
/// name. Equality is identifier equality.
#[derive(Debug, Clone)]
pub struct UniqueId {
    hash: u64,
    inner: UidInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum UidInner {
    /// Free-form named variable, used by tests and synthesized values.
    Named(Arc<str>),
    /// Register- or memory-backed variable anchored in a routine.
    Var(Arc<Variable>),
}

impl UniqueId {
    pub fn named(name: &str) -> Self {
        UniqueId {
            hash: hash_str(name),
            inner: UidInner::Named(Arc::from(name)),
        }
    }

    pub fn from_variable(var: Variable) -> Self {
        UniqueId {
            hash: var.uid_hash(),
            inner: UidInner::Var(Arc::new(var)),
        }
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match &self.inner {
            UidInner::Var(v) => Some(v),
            UidInner::Named(_) => None,
        }
    }
}

impl PartialEq for UniqueId {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.inner == other.inner
    }
}
impl Eq for UniqueId {}

impl std::hash::Hash for UniqueId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            UidInner::Named(name) => write!(f, "{name}"),
            UidInner::Var(var) => write!(f, "{var}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Expression node
// ---------------------------------------------------------------------------

/// A single node of the expression DAG.
#[derive(Debug)]
pub struct Expr {
    /// If a symbolic variable, the identifier it maps to.
    pub uid: Option<UniqueId>,

    /// If an operation, the operator and the sub-expressions.
    pub op: Op,
    pub lhs: Option<ExprRef>,
    pub rhs: Option<ExprRef>,

    /// Partially evaluated value of the node.
    pub value: BitVector,

    /// Inverse reward function of the simplifier; strictly positive.
    pub complexity: f64,

    /// Zero for leaves, `max(children) + 1` otherwise.
    pub depth: u32,

    hash_value: u64,

    /// Fingerprint for directive pre-filtering.
    pub signature: ExprSignature,

    /// Hint that the node already passed through the simplifier. Purely an
    /// optimization; a stale hint only costs a cache hit.
    simplify_hint: AtomicBool,

    /// Defers simplification until explicitly requested.
    pub is_lazy: bool,
}

impl Clone for Expr {
    fn clone(&self) -> Self {
        Expr {
            uid: self.uid.clone(),
            op: self.op,
            lhs: self.lhs.clone(),
            rhs: self.rhs.clone(),
            value: self.value,
            complexity: self.complexity,
            depth: self.depth,
            hash_value: self.hash_value,
            signature: self.signature,
            simplify_hint: AtomicBool::new(self.simplify_hint.load(Ordering::Relaxed)),
            is_lazy: self.is_lazy,
        }
    }
}

impl Expr {
    fn empty() -> Expr {
        Expr {
            uid: None,
            op: Op::Invalid,
            lhs: None,
            rhs: None,
            value: BitVector::default(),
            complexity: 0.0,
            depth: 0,
            hash_value: 0,
            signature: ExprSignature::default(),
            simplify_hint: AtomicBool::new(false),
            is_lazy: false,
        }
    }

    /// Constant node.
    pub fn constant(value: i64, bit_count: u32) -> Expr {
        let mut e = Expr::empty();
        e.value = BitVector::constant(value as u64, bit_count);
        e.update(false);
        e
    }

    /// Variable node.
    pub fn variable(uid: UniqueId, bit_count: u32) -> Expr {
        let mut e = Expr::empty();
        e.uid = Some(uid);
        e.value = BitVector::unknown(bit_count);
        e.update(false);
        e
    }

    // -- Node kind predicates ----------------------------------------------

    pub fn is_variable(&self) -> bool {
        self.uid.is_some()
    }
    pub fn is_constant(&self) -> bool {
        self.op == Op::Invalid && self.uid.is_none() && self.value.is_known()
    }
    pub fn is_expression(&self) -> bool {
        self.op != Op::Invalid
    }
    pub fn is_unary(&self) -> bool {
        self.is_expression() && self.op.operand_count() == 1
    }
    pub fn is_binary(&self) -> bool {
        self.is_expression() && self.op.operand_count() == 2
    }
    pub fn is_valid(&self) -> bool {
        self.is_expression() || self.is_variable() || self.is_constant()
    }

    pub fn size(&self) -> u32 {
        self.value.size()
    }
    pub fn known_one(&self) -> u64 {
        self.value.known_one()
    }
    pub fn known_zero(&self) -> u64 {
        self.value.known_zero()
    }
    pub fn unknown_mask(&self) -> u64 {
        self.value.unknown_mask()
    }
    pub fn hash(&self) -> u64 {
        self.hash_value
    }

    pub fn is_simple(&self) -> bool {
        self.simplify_hint.load(Ordering::Relaxed)
    }
    pub(crate) fn set_simple(&self, v: bool) {
        self.simplify_hint.store(v, Ordering::Relaxed);
    }

    // -- Tree statistics ---------------------------------------------------

    pub fn count_constants(&self) -> usize {
        if self.is_constant() {
            return 1;
        }
        self.lhs.as_ref().map_or(0, |e| e.count_constants())
            + self.rhs.as_ref().map_or(0, |e| e.count_constants())
    }

    pub fn count_variables(&self) -> usize {
        if self.is_variable() {
            return 1;
        }
        self.lhs.as_ref().map_or(0, |e| e.count_variables())
            + self.rhs.as_ref().map_or(0, |e| e.count_variables())
    }

    pub fn count_unique_variables(&self) -> usize {
        let mut seen = Vec::new();
        self.for_each(&mut |e: &Expr| {
            if let Some(uid) = &e.uid {
                if !seen.contains(uid) {
                    seen.push(uid.clone());
                }
            }
        });
        seen.len()
    }

    /// Pre-order enumeration of the whole tree.
    pub fn for_each(&self, fn_: &mut impl FnMut(&Expr)) {
        fn_(self);
        if let Some(lhs) = &self.lhs {
            lhs.for_each(fn_);
        }
        if let Some(rhs) = &self.rhs {
            rhs.for_each(fn_);
        }
    }

    // -- State update ------------------------------------------------------

    /// Recomputes value, depth, complexity, hash and signature after the node
    /// was (re)constructed. Collapses to a constant when every bit is known
    /// unless deferred by the lazy bit.
    pub(crate) fn update(&mut self, mut auto_simplify: bool) {
        // Laziness of any child infects the parent and blocks simplification.
        if self.lhs.as_ref().is_some_and(|e| e.is_lazy)
            || self.rhs.as_ref().is_some_and(|e| e.is_lazy)
        {
            auto_simplify = false;
            self.is_lazy = true;
        }

        if !self.is_expression() {
            self.depth = 0;
            if self.uid.is_none() {
                // Constant: punish for each set bit of the smaller rendering
                // of the value, at an exponentially decreasing rate.
                let cval = self.value.get_i64().unwrap_or(0);
                let pos = msb(cval as u64) + popcnt(cval as u64);
                let neg = msb(cval.unsigned_abs()) + popcnt(cval.unsigned_abs());
                self.complexity = (1.0 + pos.min(neg) as f64).sqrt();
                self.hash_value = hash_combine(
                    hash_combine(self.value.known_zero(), self.value.known_one()),
                    self.value.size() as u64,
                );
            } else {
                self.complexity = 128.0;
                self.hash_value = hash_combine(
                    self.uid.as_ref().unwrap().hash(),
                    self.value.size() as u64,
                );
            }
            self.signature = ExprSignature::from_value(&self.value);
            self.simplify_hint = AtomicBool::new(true);
            return;
        }

        let desc = self.op.desc();
        if desc.operand_count == 1 {
            let rhs = self.rhs.as_ref().expect("unary node without rhs").clone();
            self.value = evaluate_partial(self.op, &BitVector::default(), &rhs.value);

            if (self.is_lazy || auto_simplify) && self.value.is_known() {
                return self.collapse_constant();
            }

            self.depth = rhs.depth + 1;
            self.complexity = rhs.complexity * 2.0;
            self.signature = ExprSignature::unary(self.op, &rhs.signature);
            let mut h = hash_u64(rhs.hash());
            h = hash_combine(h, self.op as u64);
            h = hash_combine(h, self.depth as u64);
            self.hash_value = hash_combine(h, self.value.size() as u64);
            self.punish_hint_mismatch();
            self.simplify_hint = AtomicBool::new(false);
            return;
        }

        // Binary node. Casts propagate the left value resized, everything
        // else partially evaluates.
        let lhs_v = self.lhs.as_ref().expect("binary node without lhs").clone();
        let rhs_v = self.rhs.as_ref().expect("binary node without rhs").clone();
        if self.op == Op::Ucast || self.op == Op::Cast {
            let n = rhs_v.value.get_u64().expect("cast width must be constant") as u32;
            self.value = lhs_v.value.resize(n, self.op == Op::Cast);
        } else {
            self.value = evaluate_partial(self.op, &lhs_v.value, &rhs_v.value);
        }

        // Speculative collapse: a fully known value replaces the whole
        // subtree with a constant, avoiding child copies and deep drops.
        if (self.is_lazy || auto_simplify) && self.value.is_known() {
            return self.collapse_constant();
        }

        // Handle size mismatches, canonicalizing unsigned multiply and
        // unsigned (in)equality into the signed forms on the way.
        let optimistic_size = |lhs: &ExprRef, rhs: &ExprRef| -> u32 {
            let possibly_set = |e: &ExprRef| e.value.known_one() | e.value.unknown_mask();
            let mut op_size = lhs.size();
            if (op_size < rhs.size() && msb(possibly_set(rhs)) > op_size)
                || (op_size > rhs.size() && msb(possibly_set(lhs)) < rhs.size())
            {
                op_size = rhs.size();
            }
            op_size
        };

        match self.op {
            Op::BitwiseAnd
            | Op::BitwiseOr
            | Op::BitwiseXor
            | Op::UmultiplyHigh
            | Op::Udivide
            | Op::Uremainder
            | Op::UmaxValue
            | Op::UminValue => {
                let n = self.value.size();
                self.lhs = Some(lhs_v.resized(n, false));
                self.rhs = Some(rhs_v.resized(n, false));
            }
            Op::MultiplyHigh
            | Op::Multiply
            | Op::Divide
            | Op::Remainder
            | Op::Add
            | Op::Subtract
            | Op::MaxValue
            | Op::MinValue => {
                let n = self.value.size();
                self.lhs = Some(lhs_v.resized(n, true));
                self.rhs = Some(rhs_v.resized(n, true));
            }
            Op::Ugreater | Op::UgreaterEq | Op::UlessEq | Op::Uless => {
                let n = optimistic_size(&lhs_v, &rhs_v);
                self.lhs = Some(lhs_v.resized(n, false));
                self.rhs = Some(rhs_v.resized(n, false));
            }
            Op::Greater | Op::GreaterEq | Op::LessEq | Op::Less | Op::Equal | Op::NotEqual => {
                let n = optimistic_size(&lhs_v, &rhs_v);
                self.lhs = Some(lhs_v.resized(n, true));
                self.rhs = Some(rhs_v.resized(n, true));
            }
            Op::Umultiply => {
                let n = self.value.size();
                self.lhs = Some(lhs_v.resized(n, true));
                self.rhs = Some(rhs_v.resized(n, true));
                self.op = Op::Multiply;
            }
            Op::Uequal | Op::UnotEqual => {
                let n = optimistic_size(&lhs_v, &rhs_v);
                self.lhs = Some(lhs_v.resized(n, false));
                self.rhs = Some(rhs_v.resized(n, false));
                self.op = if self.op == Op::Uequal {
                    Op::Equal
                } else {
                    Op::NotEqual
                };
            }
            _ => {}
        }

        let lhs = self.lhs.as_ref().unwrap();
        let rhs = self.rhs.as_ref().unwrap();
        self.depth = lhs.depth.max(rhs.depth) + 1;
        self.complexity = (lhs.complexity + rhs.complexity) * 2.0 * self.op.desc().complexity_coeff;
        self.signature = ExprSignature::binary(&lhs.signature, self.op, &rhs.signature);

        // Commutative operators sort their children by hash before hashing
        // the parent, giving hash-consing up to permutation.
        let (h1, h2) = if self.op.is_commutative() && lhs.hash() > rhs.hash() {
            (rhs.hash(), lhs.hash())
        } else {
            (lhs.hash(), rhs.hash())
        };
        let mut h = hash_combine(h1, h2);
        h = hash_combine(h, self.op as u64);
        h = hash_combine(h, self.depth as u64);
        self.hash_value = hash_combine(h, self.value.size() as u64);

        self.punish_hint_mismatch();
        self.simplify_hint = AtomicBool::new(false);
    }

    fn collapse_constant(&mut self) {
        self.lhs = None;
        self.rhs = None;
        self.op = Op::Invalid;
        self.is_lazy = false;
        self.update(false);
    }

    /// ×2 penalty for every child whose bitwise hint has the opposite sign
    /// of the parent's.
    fn punish_hint_mismatch(&mut self) {
        let hint = self.op.desc().hint_bitwise as i32;
        for child in [&self.lhs, &self.rhs].into_iter().flatten() {
            if child.is_expression() {
                let child_hint = child.op.desc().hint_bitwise as i32;
                if child_hint * hint < 0 {
                    self.complexity *= 2.0;
                }
            }
        }
        debug_assert!(self.complexity > 0.0);
    }

    // -- Evaluation --------------------------------------------------------

    /// Evaluates the tree, invoking `lookup` for variable leaves. Avoids any
    /// simplifier calls and tree copies.
    pub fn evaluate(&self, lookup: &dyn Fn(&UniqueId) -> Option<u64>) -> BitVector {
        if self.value.is_known() {
            return self.value;
        }
        if let Some(uid) = &self.uid {
            if let Some(res) = lookup(uid) {
                return BitVector::constant(res, self.size());
            }
            return self.value;
        }
        if self.is_unary() {
            evaluate_partial(
                self.op,
                &BitVector::default(),
                &self.rhs.as_ref().unwrap().evaluate(lookup),
            )
        } else if self.is_binary() {
            evaluate_partial(
                self.op,
                &self.lhs.as_ref().unwrap().evaluate(lookup),
                &self.rhs.as_ref().unwrap().evaluate(lookup),
            )
        } else {
            self.value
        }
    }

    /// Concrete value under the empty assignment.
    pub fn get_u64(&self) -> Option<u64> {
        self.evaluate(&|_| None).get_u64()
    }
    pub fn get_i64(&self) -> Option<i64> {
        self.evaluate(&|_| None).get_i64()
    }

    /// Probabilistic fingerprints of the expression under the fixed keyed
    /// evaluations; mismatching arrays prove two expressions non-equal.
    pub fn xvalues(&self) -> [u64; XVALUE_KEYS.len()] {
        let mut out = [0u64; XVALUE_KEYS.len()];
        for (slot, key) in out.iter_mut().zip(XVALUE_KEYS.iter()) {
            *slot = self
                .evaluate(&|uid: &UniqueId| Some(uid.hash() ^ key))
                .known_one();
        }
        out
    }

    // -- Structural comparison ---------------------------------------------

    /// Exact structural identity, up to commutative operand permutation.
    pub fn is_identical(&self, other: &Expr) -> bool {
        if !self.is_valid() {
            return !other.is_valid();
        }
        if !other.is_valid() {
            return false;
        }
        if self.hash_value != other.hash_value {
            return false;
        }
        if self.op != other.op || self.size() != other.size() {
            return false;
        }
        if self.is_variable() {
            return other.is_variable() && self.uid == other.uid;
        }
        if self.is_constant() {
            return other.is_constant() && self.value == other.value;
        }

        let rhs = self.rhs.as_ref().unwrap();
        let orhs = other.rhs.as_ref().unwrap();
        if self.op.operand_count() == 1 {
            return rhs.is_identical(orhs);
        }

        let lhs = self.lhs.as_ref().unwrap();
        let olhs = other.lhs.as_ref().unwrap();
        if lhs.is_identical(olhs) && rhs.is_identical(orhs) {
            return true;
        }
        self.op.is_commutative() && lhs.is_identical(orhs) && rhs.is_identical(olhs)
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.is_identical(other)
    }
}
impl Eq for Expr {}

impl std::hash::Hash for Expr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value);
    }
}

fn fmt_const(v: i64) -> String {
    if v < 0 {
        format!("-0x{:x}", v.unsigned_abs())
    } else {
        format!("0x{v:x}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_expression() {
            let lhs = self.lhs.as_ref().map_or(String::new(), |e| e.to_string());
            let rhs = self.rhs.as_ref().map_or(String::new(), |e| e.to_string());
            return write!(f, "{}", self.op.format(&lhs, &rhs));
        }
        if self.is_constant() {
            return write!(f, "{}", fmt_const(self.value.get_i64().unwrap()));
        }
        if let Some(uid) = &self.uid {
            return write!(f, "{uid}");
        }
        write!(f, "null")
    }
}

/// Fixed keyings for the xvalue fingerprints. Process-wide constants so that
/// identical inputs produce identical fingerprints run to run.
pub const XVALUE_KEYS: [u64; 4] = [
    0x8A5C_D7F3_19B4_26E1,
    0x3D91_44AA_C0FE_5B08,
    0xE26B_9D01_77C3_82F5,
    0x51F0_AE8C_2B67_D934,
];

// ---------------------------------------------------------------------------
// Shared references
// ---------------------------------------------------------------------------

/// Owning shared reference to an immutable expression node.
#[derive(Clone)]
pub struct ExprRef(Arc<Expr>);

impl ops::Deref for ExprRef {
    type Target = Expr;
    fn deref(&self) -> &Expr {
        &self.0
    }
}

impl From<Expr> for ExprRef {
    fn from(e: Expr) -> Self {
        ExprRef(Arc::new(e))
    }
}

impl fmt::Debug for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExprRef({self})")
    }
}

impl fmt::Display for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for ExprRef {
    fn eq(&self, other: &Self) -> bool {
        self.is_identical(other)
    }
}
impl Eq for ExprRef {}

impl std::hash::Hash for ExprRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(Expr::hash(&self.0));
    }
}

impl ExprRef {
    pub fn constant(value: i64, bit_count: u32) -> ExprRef {
        Expr::constant(value, bit_count).into()
    }

    pub fn constant_u(value: u64, bit_count: u32) -> ExprRef {
        Expr::constant(value as i64, bit_count).into()
    }

    pub fn variable(name: &str, bit_count: u32) -> ExprRef {
        Expr::variable(UniqueId::named(name), bit_count).into()
    }

    pub fn var(uid: UniqueId, bit_count: u32) -> ExprRef {
        Expr::variable(uid, bit_count).into()
    }

    pub fn from_bitvector(value: BitVector) -> ExprRef {
        debug_assert!(value.is_known());
        Expr::constant(value.get_i64().unwrap(), value.size()).into()
    }

    pub fn ptr_eq(&self, other: &ExprRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn finish(mut e: Expr, auto_simplify: bool) -> ExprRef {
        e.update(auto_simplify);
        let r: ExprRef = e.into();
        if auto_simplify && !r.is_lazy && r.is_expression() && !r.is_simple() {
            crate::simplify::simplify(&r, false).0
        } else {
            r
        }
    }

    /// Applies a unary operator, auto-simplifying the result.
    pub fn unary(op: Op, rhs: ExprRef) -> ExprRef {
        let mut e = Expr::empty();
        e.op = op;
        e.rhs = Some(rhs);
        ExprRef::finish(e, true)
    }

    /// Applies a binary operator, auto-simplifying the result.
    pub fn binary(lhs: ExprRef, op: Op, rhs: ExprRef) -> ExprRef {
        let mut e = Expr::empty();
        e.op = op;
        e.lhs = Some(lhs);
        e.rhs = Some(rhs);
        ExprRef::finish(e, true)
    }

    /// Internal constructors skipping auto-simplification.
    pub fn build_unary(op: Op, rhs: ExprRef) -> ExprRef {
        let mut e = Expr::empty();
        e.op = op;
        e.rhs = Some(rhs);
        ExprRef::finish(e, false)
    }

    pub fn build_binary(lhs: ExprRef, op: Op, rhs: ExprRef) -> ExprRef {
        let mut e = Expr::empty();
        e.op = op;
        e.lhs = Some(lhs);
        e.rhs = Some(rhs);
        ExprRef::finish(e, false)
    }

    // -- Convenience operator wrappers not covered by std traits -----------

    pub fn rotl(self, n: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::RotateLeft, n)
    }
    pub fn rotr(self, n: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::RotateRight, n)
    }
    pub fn umul(self, o: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::Umultiply, o)
    }
    pub fn udiv(self, o: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::Udivide, o)
    }
    pub fn urem(self, o: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::Uremainder, o)
    }
    pub fn equal(self, o: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::Equal, o)
    }
    pub fn not_equal(self, o: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::NotEqual, o)
    }
    pub fn value_if(self, v: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::ValueIf, v)
    }
    pub fn bit_test(self, n: ExprRef) -> ExprRef {
        ExprRef::binary(self, Op::BitTest, n)
    }

    /// Explicit unsigned cast node.
    pub fn ucast(self, bit_count: u32) -> ExprRef {
        ExprRef::binary(self, Op::Ucast, ExprRef::constant(bit_count as i64, 8))
    }

    /// Explicit signed cast node.
    pub fn scast(self, bit_count: u32) -> ExprRef {
        ExprRef::binary(self, Op::Cast, ExprRef::constant(bit_count as i64, 8))
    }

    /// Marks the expression lazy; further construction over it defers
    /// simplification until an explicit `simplified` call.
    pub fn make_lazy(&self) -> ExprRef {
        if self.is_lazy {
            return self.clone();
        }
        let mut e = (*self.0).clone();
        e.is_lazy = true;
        ExprRef(Arc::new(e))
    }

    /// Simplifies (and optionally prettifies) the expression.
    pub fn simplified(&self, prettify: bool) -> ExprRef {
        if !prettify && self.is_simple() && !self.is_lazy {
            return self.clone();
        }
        crate::simplify::simplify(self, prettify).0
    }

    // -- Resize propagation ------------------------------------------------

    /// Resizes the expression, pushing the resize through the operator tree
    /// rather than wrapping in a cast wherever the propagation rules allow.
    pub fn resized(&self, new_size: u32, signed_cast: bool) -> ExprRef {
        self.resize_impl(new_size, signed_cast, false)
            .expect("resize with explicit casts allowed cannot fail")
    }

    /// Same as `resized` but fails instead of emitting an explicit cast.
    pub(crate) fn resized_no_explicit(&self, new_size: u32, signed_cast: bool) -> Option<ExprRef> {
        self.resize_impl(new_size, signed_cast, true)
    }

    fn wrap_cast(&self, new_size: u32, signed: bool, no_explicit: bool) -> Option<ExprRef> {
        if no_explicit {
            return None;
        }
        Some(if signed {
            self.clone().scast(new_size)
        } else {
            self.clone().ucast(new_size)
        })
    }

    fn resize_impl(&self, new_size: u32, signed_cast: bool, no_explicit: bool) -> Option<ExprRef> {
        if self.size() == new_size {
            return Some(self.clone());
        }

        // Sign is irrelevant when truncating or when the high bit is known
        // zero, so signed casts degrade to unsigned ones eagerly.
        let mut signed_cast = signed_cast;
        if signed_cast {
            if new_size == 1 || new_size < self.size() {
                signed_cast = false;
            } else if self.size() > 0 && self.value.at(self.size() - 1) == BitState::Zero {
                signed_cast = false;
            }
        }

        // Lazy expressions do not propagate; the cast is kept explicit.
        if self.is_lazy {
            if self.is_constant() {
                return Some(ExprRef::from_bitvector(self.value.resize(new_size, signed_cast)));
            }
            return self.wrap_cast(new_size, signed_cast, no_explicit);
        }

        match self.op {
            Op::Invalid => {
                if self.is_constant() {
                    Some(ExprRef::from_bitvector(self.value.resize(new_size, signed_cast)))
                } else {
                    self.wrap_cast(new_size, signed_cast, no_explicit)
                }
            }

            // Rotations unpack into two shifts when the amount is a known
            // non-zero constant; a symbolic amount stays behind a cast.
            Op::RotateLeft | Op::RotateRight => {
                let rhs = self.rhs.as_ref().unwrap();
                if rhs.is_constant() && rhs.known_one() != 0 && !signed_cast {
                    let lhs = self.lhs.as_ref().unwrap().clone();
                    let width = ExprRef::constant(lhs.size() as i64, rhs.size());
                    let inv = ExprRef::binary(width, Op::Subtract, rhs.clone());
                    let (fwd, bwd) = if self.op == Op::RotateLeft {
                        (Op::ShiftLeft, Op::ShiftRight)
                    } else {
                        (Op::ShiftRight, Op::ShiftLeft)
                    };
                    let a = ExprRef::binary(lhs.clone(), fwd, rhs.clone()).resized(new_size, false);
                    let b = ExprRef::binary(lhs, bwd, inv).resized(new_size, false);
                    Some(ExprRef::binary(a, Op::BitwiseOr, b))
                } else {
                    self.wrap_cast(new_size, signed_cast, no_explicit)
                }
            }

            Op::ShiftLeft if new_size < self.size() => {
                let lhs = self.lhs.as_ref().unwrap().resized(new_size, false);
                Some(ExprRef::binary(lhs, Op::ShiftLeft, self.rhs.as_ref().unwrap().clone()))
            }
            Op::ShiftLeft | Op::ShiftRight => {
                if !signed_cast && new_size > self.size() {
                    let lhs = self.lhs.as_ref().unwrap().resized(new_size, false);
                    Some(ExprRef::binary(lhs, self.op, self.rhs.as_ref().unwrap().clone()))
                } else {
                    self.wrap_cast(new_size, signed_cast, no_explicit)
                }
            }

            Op::BitwiseNot => {
                if signed_cast {
                    return self.wrap_cast(new_size, true, no_explicit);
                }
                let rhs = self.rhs.as_ref().unwrap();
                if new_size < self.size() {
                    Some(ExprRef::unary(Op::BitwiseNot, rhs.resized(new_size, false)))
                } else {
                    // ~x widened keeps the high bits zero: reformulate as
                    // (~x_extended) & old_mask_extended.
                    let old_mask = self.value.known_one() | self.value.unknown_mask();
                    let inv = ExprRef::unary(Op::BitwiseNot, rhs.resized(new_size, false));
                    Some(ExprRef::binary(
                        inv,
                        Op::BitwiseAnd,
                        ExprRef::constant_u(old_mask, new_size),
                    ))
                }
            }

            // Basic unsigned operations push an unsigned resize to both
            // children, except shrinking division.
            Op::BitwiseAnd
            | Op::BitwiseOr
            | Op::BitwiseXor
            | Op::Umultiply
            | Op::Udivide
            | Op::Uremainder
            | Op::UmaxValue
            | Op::UminValue => {
                if signed_cast {
                    return self.wrap_cast(new_size, true, no_explicit);
                }
                if new_size < self.size() && matches!(self.op, Op::Udivide | Op::Uremainder) {
                    return self.wrap_cast(new_size, false, no_explicit);
                }
                let lhs = self.lhs.as_ref().unwrap().resized(new_size, false);
                let rhs = self.rhs.as_ref().unwrap().resized(new_size, false);
                Some(ExprRef::binary(lhs, self.op, rhs))
            }

            // Basic signed operations push a signed resize to both children.
            Op::Multiply
            | Op::Divide
            | Op::Remainder
            | Op::Add
            | Op::Negate
            | Op::Subtract
            | Op::MaxValue
            | Op::MinValue => {
                if signed_cast {
                    let rhs = self.rhs.as_ref().unwrap().resized(new_size, true);
                    if let Some(lhs) = &self.lhs {
                        Some(ExprRef::binary(lhs.resized(new_size, true), self.op, rhs))
                    } else {
                        Some(ExprRef::unary(self.op, rhs))
                    }
                } else if new_size < self.size()
                    && !matches!(self.op, Op::Divide | Op::Remainder)
                {
                    let rhs = self.rhs.as_ref().unwrap().resized(new_size, false);
                    if let Some(lhs) = &self.lhs {
                        Some(ExprRef::binary(lhs.resized(new_size, false), self.op, rhs))
                    } else {
                        Some(ExprRef::unary(self.op, rhs))
                    }
                } else {
                    self.wrap_cast(new_size, false, no_explicit)
                }
            }

            Op::Ucast => {
                let lhs = self.lhs.as_ref().unwrap();
                let cast_size = self.rhs.as_ref().unwrap().get_u64().unwrap() as u32;
                if lhs.size() > cast_size {
                    // Was shrunk; a signed widening needs a double cast,
                    // otherwise mask and resize.
                    if signed_cast {
                        return self.wrap_cast(new_size, true, no_explicit);
                    }
                    let masked = ExprRef::binary(
                        lhs.clone(),
                        Op::BitwiseAnd,
                        ExprRef::constant_u(fill(cast_size), lhs.size()),
                    );
                    Some(masked.resized(new_size, false))
                } else if lhs.size() == new_size {
                    Some(lhs.clone())
                } else {
                    Some(lhs.resized(new_size, false))
                }
            }

            Op::Cast => {
                // A signed cast never shrinks; after a signed widening the
                // high bits carry the sign so an unsigned target falls back
                // to an explicit unsigned cast.
                let lhs = self.lhs.as_ref().unwrap();
                debug_assert!(lhs.size() <= self.rhs.as_ref().unwrap().get_u64().unwrap() as u32);
                if lhs.size() == new_size {
                    Some(lhs.clone())
                } else if signed_cast {
                    Some(lhs.resized(new_size, true))
                } else {
                    self.wrap_cast(new_size, false, no_explicit)
                }
            }

            // Condition is boolean, propagate to the value only.
            Op::ValueIf => {
                let rhs = self.rhs.as_ref().unwrap().resized(new_size, false);
                Some(ExprRef::binary(
                    self.lhs.as_ref().unwrap().clone(),
                    Op::ValueIf,
                    rhs,
                ))
            }

            _ => self.wrap_cast(new_size, signed_cast, no_explicit),
        }
    }

    // -- Equivalence -------------------------------------------------------

    /// Semantic equivalence: identity, then known-bit filtering, then keyed
    /// random evaluation, then simplified difference probing.
    pub fn equals(&self, other: &ExprRef) -> bool {
        if self.is_identical(other) {
            return true;
        }

        // Filter by known bits.
        if (other.known_one() & self.known_zero()) != 0
            || (other.known_zero() & self.known_one()) != 0
        {
            return false;
        }

        // Two keyed evaluations; mismatching values disprove equivalence.
        for key in [0x2545_F491_4F6C_DD1Du64, 0x9E6C_63D0_876A_68EE] {
            let eval = |uid: &UniqueId| Some(uid.hash() ^ key);
            if self.evaluate(&eval).known_one() != other.evaluate(&eval).known_one() {
                return false;
            }
        }

        let a = self.simplified(false);
        let b = other.simplified(false);

        // Final probing order depends on the joint bitwise hint.
        let a_hint = if a.is_expression() { a.op.desc().hint_bitwise } else { 0 };
        let b_hint = if b.is_expression() { b.op.desc().hint_bitwise } else { 0 };
        let arithmetic_first = a_hint + b_hint < 0;

        let diff_zero = |x: &ExprRef, y: &ExprRef, op: Op| {
            ExprRef::binary(x.clone(), op, y.clone())
                .get_u64()
                .map(|v| v == 0)
                .unwrap_or(false)
        };
        if arithmetic_first {
            diff_zero(&a, &b, Op::Subtract) || diff_zero(&a, &b, Op::BitwiseXor)
        } else {
            diff_zero(&a, &b, Op::BitwiseXor) || diff_zero(&a, &b, Op::Subtract)
        }
    }

    // -- Variable substitution ---------------------------------------------

    /// Rebuilds the tree, replacing every variable leaf the functor maps to a
    /// new expression. Unchanged subtrees keep their sharing.
    pub fn map_variables(&self, f: &mut impl FnMut(&UniqueId, u32) -> Option<ExprRef>) -> ExprRef {
        self.map_variables_inner(f).unwrap_or_else(|| self.clone())
    }

    fn map_variables_inner(
        &self,
        f: &mut impl FnMut(&UniqueId, u32) -> Option<ExprRef>,
    ) -> Option<ExprRef> {
        if let Some(uid) = &self.uid {
            return f(uid, self.size()).map(|e| e.resized(self.size(), false));
        }
        if !self.is_expression() {
            return None;
        }
        let new_lhs = self.lhs.as_ref().and_then(|e| e.map_variables_inner(f));
        let new_rhs = self.rhs.as_ref().and_then(|e| e.map_variables_inner(f));
        if new_lhs.is_none() && new_rhs.is_none() {
            return None;
        }
        let rhs = new_rhs.unwrap_or_else(|| self.rhs.as_ref().unwrap().clone());
        if self.op.operand_count() == 1 {
            Some(ExprRef::unary(self.op, rhs))
        } else {
            let lhs = new_lhs.unwrap_or_else(|| self.lhs.as_ref().unwrap().clone());
            Some(ExprRef::binary(lhs, self.op, rhs))
        }
    }
}

// ---------------------------------------------------------------------------
// Operator overloads
// ---------------------------------------------------------------------------

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait for ExprRef {
            type Output = ExprRef;
            fn $method(self, rhs: ExprRef) -> ExprRef {
                ExprRef::binary(self, $op, rhs)
            }
        }
        impl ops::$trait<&ExprRef> for &ExprRef {
            type Output = ExprRef;
            fn $method(self, rhs: &ExprRef) -> ExprRef {
                ExprRef::binary(self.clone(), $op, rhs.clone())
            }
        }
        impl ops::$trait<&ExprRef> for ExprRef {
            type Output = ExprRef;
            fn $method(self, rhs: &ExprRef) -> ExprRef {
                ExprRef::binary(self, $op, rhs.clone())
            }
        }
        impl ops::$trait<ExprRef> for &ExprRef {
            type Output = ExprRef;
            fn $method(self, rhs: ExprRef) -> ExprRef {
                ExprRef::binary(self.clone(), $op, rhs)
            }
        }
        impl ops::$trait<i64> for ExprRef {
            type Output = ExprRef;
            fn $method(self, rhs: i64) -> ExprRef {
                let bits = self.size();
                ExprRef::binary(self, $op, ExprRef::constant(rhs, bits))
            }
        }
        impl ops::$trait<i64> for &ExprRef {
            type Output = ExprRef;
            fn $method(self, rhs: i64) -> ExprRef {
                let bits = self.size();
                ExprRef::binary(self.clone(), $op, ExprRef::constant(rhs, bits))
            }
        }
    };
}

impl_binary_op!(Add, add, Op::Add);
impl_binary_op!(Sub, sub, Op::Subtract);
impl_binary_op!(Mul, mul, Op::Multiply);
impl_binary_op!(Div, div, Op::Divide);
impl_binary_op!(Rem, rem, Op::Remainder);
impl_binary_op!(BitAnd, bitand, Op::BitwiseAnd);
impl_binary_op!(BitOr, bitor, Op::BitwiseOr);
impl_binary_op!(BitXor, bitxor, Op::BitwiseXor);
impl_binary_op!(Shl, shl, Op::ShiftLeft);
impl_binary_op!(Shr, shr, Op::ShiftRight);

impl ops::Neg for ExprRef {
    type Output = ExprRef;
    fn neg(self) -> ExprRef {
        ExprRef::unary(Op::Negate, self)
    }
}
impl ops::Neg for &ExprRef {
    type Output = ExprRef;
    fn neg(self) -> ExprRef {
        ExprRef::unary(Op::Negate, self.clone())
    }
}
impl ops::Not for ExprRef {
    type Output = ExprRef;
    fn not(self) -> ExprRef {
        ExprRef::unary(Op::BitwiseNot, self)
    }
}
impl ops::Not for &ExprRef {
    type Output = ExprRef;
    fn not(self) -> ExprRef {
        ExprRef::unary(Op::BitwiseNot, self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_fold() {
        let a = ExprRef::constant(3, 64);
        let b = ExprRef::constant(5, 64);
        let c = a + b;
        assert!(c.is_constant());
        assert_eq!(c.get_u64(), Some(8));
    }

    #[test]
    fn test_variable_leaf() {
        let x = ExprRef::variable("x", 32);
        assert!(x.is_variable());
        assert_eq!(x.size(), 32);
        assert_eq!(x.depth, 0);
        assert_eq!(x.complexity, 128.0);
    }

    #[test]
    fn test_commutative_hash() {
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);
        let a = &x + &y;
        let b = &y + &x;
        assert_eq!(a.hash(), b.hash());
        assert!(a.is_identical(&b));

        let c = &x - &y;
        let d = &y - &x;
        assert!(!c.is_identical(&d));
    }

    #[test]
    fn test_depth_and_complexity() {
        let x = ExprRef::variable("x", 32);
        let e = &x + 1;
        assert_eq!(e.depth, 1);
        assert!(e.complexity > 0.0);
        assert!(e.complexity > x.complexity);
    }

    #[test]
    fn test_umul_canonicalized_to_signed() {
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);
        let e = x.umul(y);
        assert_eq!(e.op, Op::Multiply);
    }

    #[test]
    fn test_uequal_canonicalized() {
        let x = ExprRef::variable("x", 32);
        let y = ExprRef::variable("y", 32);
        let e = ExprRef::binary(x, Op::Uequal, y);
        assert_eq!(e.op, Op::Equal);
    }

    #[test]
    fn test_resize_roundtrip() {
        let x = ExprRef::variable("x", 16);
        let e = (&x + 7) ^ 0x55;
        for w in [16u32, 24, 32, 64] {
            let widened = e.resized(w, false);
            assert_eq!(widened.size(), w);
            let back = widened.resized(e.size(), false);
            assert_eq!(back.size(), e.size());
            assert!(back.equals(&e), "w={w}: {back} != {e}");
        }
    }

    #[test]
    fn test_resize_constant() {
        let c = ExprRef::constant(-1, 8);
        assert_eq!(c.resized(16, true).get_i64(), Some(-1));
        assert_eq!(c.resized(16, false).get_u64(), Some(0xFF));
    }

    #[test]
    fn test_ucast_drop() {
        let x = ExprRef::variable("x", 32);
        let e = x.clone().ucast(64);
        assert_eq!(e.size(), 64);
        let back = e.resized(32, false);
        assert!(back.is_identical(&x));
    }

    #[test]
    fn test_evaluate_with_lookup() {
        let x = ExprRef::variable("x", 64);
        let y = ExprRef::variable("y", 64);
        let e = (&x + &y) ^ 0xFF;
        let xv = x.uid.clone().unwrap();
        let yv = y.uid.clone().unwrap();
        let r = e.evaluate(&|uid: &UniqueId| {
            if *uid == xv {
                Some(10)
            } else if *uid == yv {
                Some(20)
            } else {
                None
            }
        });
        assert_eq!(r.get_u64(), Some(30 ^ 0xFF));
    }

    #[test]
    fn test_equals_vs_identical() {
        let x = ExprRef::variable("x", 32);
        let a = (&x + 1) + 1;
        let b = &x + 2;
        assert!(a.equals(&b));
    }

    #[test]
    fn test_xvalues_stable() {
        let x = ExprRef::variable("x", 64);
        let e = &x + 5;
        assert_eq!(e.xvalues(), e.xvalues());
        // Shifted pointer fingerprints differ.
        let f = &x + 6;
        assert_ne!(e.xvalues(), f.xvalues());
    }

    #[test]
    fn test_lazy_defers_fold() {
        let x = ExprRef::constant(3, 64).make_lazy();
        let e = ExprRef::binary(x, Op::Add, ExprRef::constant(5, 64));
        // Lazy nodes still fold known values by speculative collapse.
        assert_eq!(e.get_u64(), Some(8));
    }

    #[test]
    fn test_display() {
        let x = ExprRef::variable("x", 32);
        let e = &x + 1;
        assert_eq!(e.to_string(), "(x+0x1)");
        let n = !&x;
        assert_eq!(n.to_string(), "~x");
    }
}
