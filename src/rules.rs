//! Simplification rule tables.
//!
//! Rules are (pattern, construction) directive pairs grouped by the operator
//! at the head of the pattern. Universal simplifiers must reduce complexity
//! or keep it equal; join descriptors describe how operands of two operators
//! distribute through each other and have no obligation to produce simple
//! output, so their results go through a complexity filter. Pack/unpack
//! descriptors group simple forms into higher-level operators for readability
//! and back.

use crate::core::operators::{Op, OP_COUNT};
use crate::directive::dsl::*;
use crate::directive::{Directive, MatchType};
use crate::expr::ExprSignature;
use std::sync::LazyLock;

/// A single rewrite rule with its per-width precomputed pattern signature.
pub struct Rule {
    pub src: Directive,
    pub dst: Directive,
    pub signatures: Box<[ExprSignature; 64]>,
}

/// Precomputes the signature of a pattern for every width 1..=64.
pub fn signature_table(dir: &Directive) -> Box<[ExprSignature; 64]> {
    let mut out = Box::new([ExprSignature::default(); 64]);
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = dir.signature_for(i as u32 + 1);
    }
    out
}

/// Rules bucketed by the head operator of their pattern.
pub struct RuleSet {
    by_op: Vec<Vec<Rule>>,
}

impl RuleSet {
    fn build(pairs: Vec<(Directive, Directive)>) -> RuleSet {
        let mut by_op: Vec<Vec<Rule>> = (0..OP_COUNT).map(|_| Vec::new()).collect();
        for (src, dst) in pairs {
            let op = src
                .head_op()
                .expect("rule pattern must be headed by an expression operator");
            let signatures = signature_table(&src);
            by_op[op as usize].push(Rule {
                src,
                dst,
                signatures,
            });
        }
        RuleSet { by_op }
    }

    pub fn for_op(&self, op: Op) -> &[Rule] {
        &self.by_op[op as usize]
    }
}

/// Match-variables used across the tables. Greek ids make leaked directive
/// variables painfully obvious in dumps.
struct Vars {
    a: Directive,
    b: Directive,
    c_: Directive,
    /// Must be a constant.
    u: Directive,
}

fn vars() -> Vars {
    Vars {
        a: Directive::matcher("α", 0, MatchType::Any),
        b: Directive::matcher("β", 1, MatchType::Any),
        c_: Directive::matcher("δ", 2, MatchType::Any),
        u: Directive::matcher("Σ", 8, MatchType::Constant),
    }
}

/// Universal simplifiers: they have to reduce complexity or keep it equal at
/// the very least to not cause an infinite loop.
pub static UNIVERSAL_SIMPLIFIERS: LazyLock<RuleSet> = LazyLock::new(|| {
    let Vars { a, b, u, .. } = vars();

    RuleSet::build(vec![
        // Double inverse.
        (-(-(&a)), a.clone()),
        (!(!(&a)), a.clone()),
        (-(!(&a)), &a + 1),
        (!(-(&a)), &a - 1),
        // Identity constants.
        (&a + 0, a.clone()),
        (&a - 0, a.clone()),
        (&a | &a, a.clone()),
        (&a | 0, a.clone()),
        (&a & &a, a.clone()),
        (&a ^ 0, a.clone()),
        (&a & -1, a.clone()),
        (&a * 1, a.clone()),
        (umul(&a, c(1)), a.clone()),
        (&a / 1, a.clone()),
        (udiv(&a, c(1)), a.clone()),
        (rotl(&a, c(0)), a.clone()),
        (rotr(&a, c(0)), a.clone()),
        (&a >> 0, a.clone()),
        (&a << 0, a.clone()),
        (eq(&a, c(1)), iff(ueq(bcnt(&a), c(1)), &a)),
        (ne(&a, c(0)), iff(ueq(bcnt(&a), c(1)), &a)),
        // Constant result.
        (&a - &a, Directive::constant(0)),
        (&a + (-(&a)), Directive::constant(0)),
        (&a & 0, Directive::constant(0)),
        (&a ^ &a, Directive::constant(0)),
        (&a & (!(&a)), Directive::constant(0)),
        (&a | -1, Directive::constant(-1)),
        (&a + (!(&a)), Directive::constant(-1)),
        (&a ^ (!(&a)), Directive::constant(-1)),
        (&a | (!(&a)), Directive::constant(-1)),
        (&a / &a, Directive::constant(1)),
        (udiv(&a, &a), Directive::constant(1)),
        (&a % &a, Directive::constant(0)),
        (urem(&a, &a), Directive::constant(0)),
        (&a * 0, Directive::constant(0)),
        (umul(&a, c(0)), Directive::constant(0)),
        // SUB conversion.
        (&a + (-(&b)), &a - &b),
        (!((!(&a)) + &b), &a - &b),
        (!(&a - &b), (!(&a)) + &b),
        ((!(&a)) + &u, (&u - 1) - &a),
        // NEG conversion.
        (!(&a - 1), -(&a)),
        (0 - &a, -(&a)),
        // MUL conversion.
        (&a + &a, &a * 2),
        (&a * &u - &a, &a * (&u - 1)),
        (&a * &u + &a, &a * (&u + 1)),
        // Invert comparison.
        (!gt(&a, &b), le(&a, &b)),
        (!ge(&a, &b), lt(&a, &b)),
        (!eq(&a, &b), ne(&a, &b)),
        (!ne(&a, &b), eq(&a, &b)),
        (!le(&a, &b), gt(&a, &b)),
        (!lt(&a, &b), ge(&a, &b)),
        (!ugt(&a, &b), ule(&a, &b)),
        (!uge(&a, &b), ult(&a, &b)),
        (!ult(&a, &b), uge(&a, &b)),
        (!ule(&a, &b), ugt(&a, &b)),
        // NOT conversion.
        (&a ^ -1, !(&a)),
        (eq(&a, c(0)), iff(ueq(bcnt(&a), c(1)), &a ^ 1)),
        (ne(&a, c(1)), iff(ueq(bcnt(&a), c(1)), &a ^ 1)),
        // XOR conversion.
        ((&a | &b) & (!(&a & &b)), &a ^ &b),
        ((&a | &b) & ((!(&a)) | (!(&b))), &a ^ &b),
        ((&a & (!(&b))) | ((!(&a)) & &b), &a ^ &b),
        ((!(&a | &b)) | (&a & &b), !(&a ^ &b)),
        (((!(&a)) & (!(&b))) | (&a & &b), !(&a ^ &b)),
        // Simplify AND OR NOT XOR.
        (&a & (&a | &b), a.clone()),
        (&a | (&a & &b), a.clone()),
        (&a ^ (&a & &b), &a & !(&b)),
        (&a ^ (&a | &b), &b & !(&a)),
        // Simplify rotation count.
        (rotl(&a, &u), iff(uge(&u, bcnt(&a)), rotl(&a, sim(&u % bcnt(&a))))),
        (rotr(&a, &u), iff(uge(&u, bcnt(&a)), rotr(&a, sim(&u % bcnt(&a))))),
        // Convert SHL|SHR and OR combinations to rotate.
        ((&a >> &b) | (&a << &c2()), iff(eq(&c2(), bcnt(&a) - &b), rotr(&a, &b))),
        ((&a << &b) | (&a >> &c2()), iff(eq(&c2(), bcnt(&a) - &b), rotl(&a, &b))),
        // Drop unnecessary casts.
        (ucast(&a, &b), iff(eq(bcnt(&a), &b), &a)),
        (scast(&a, &b), iff(eq(bcnt(&a), &b), &a)),
        // Signed cast of a shifted-out low part degrades to unsigned.
        (
            scast(&a, &b) << &u,
            iff(gt(&u, (&b * 8) - bcnt(&a)), ucast(&a, &b) << &u),
        ),
        // Simplify AND/OR/NOT combinations.
        ((!(&a)) & (!(&b)), !(&a | &b)),
        ((!(&a)) | (!(&b)), !(&a & &b)),
        (!(&u & &a), sim(!(&u)) | try_sim(!(&a))),
        (!(&u | &a), sim(!(&u)) & try_sim(!(&a))),
        ((&a & &b) | (&a & &c2()), &a & (&b | &c2())),
        ((&a | &b) & (&a | &c2()), &a | (&b & &c2())),
        // Special AND OR directives to reduce unknowns.
        (&u | &b, iff(eq(&u, mask_k1(&b)), &b)),
        (&u | &b, iff(ueq((!mask_k0(&b)) & (!(&u)), c(0)), &u)),
        (&u & &b, iff(eq(&u, mask_unk(&b) | mask_k1(&b)), &b)),
        (&u & &b, iff(ueq((!mask_k0(&b)) & &u, c(0)), Directive::constant(0))),
        // Penetrate shrunk expression with shift left; without this rule a
        // shift cannot escape the cast and meet the shifted operand.
        (
            ucast(&a, &b) << &u,
            iff(gt(bcnt(&a), &b), ucast(sim(&a << &u), &b)),
        ),
        // Merge ucast combinations.
        (
            ucast(&a, &u) | ucast(&b, &u),
            iff(ge(bcnt(&a), bcnt(&b)), ucast(&a | &b, &u)),
        ),
        (
            ucast(&a, &u) & ucast(&b, &u),
            iff(ge(bcnt(&a), bcnt(&b)), ucast(&a & &b, &u)),
        ),
        (
            ucast(&a, &u) ^ ucast(&b, &u),
            iff(ge(bcnt(&a), bcnt(&b)), ucast(&a ^ &b, &u)),
        ),
        // Simplify manual sign extension.
        (
            ucast(&a, &b) | (ucast(1 + !(&a >> &u), &b) << &c2()),
            iff(
                gt(&b, bcnt(&a)) & eq(&u, bcnt(&a) - 1) & eq(&c2(), bcnt(&a)) & ne(bcnt(&a), c(1)),
                scast(&a, &b),
            ),
        ),
        (
            ucast(&a, &b) | (((!(ucast(&a, &b) >> &u)) + 1) << &c2()),
            iff(
                gt(&b, bcnt(&a)) & eq(&u, bcnt(&a) - 1) & eq(&c2(), bcnt(&a)) & ne(bcnt(&a), c(1)),
                scast(&a, &b),
            ),
        ),
        (
            (((((!(&a >> &b)) | -2) + 1) << &u) | &a),
            iff(
                eq(&u, &b + 1) & ne(bcnt(&a), c(1)),
                scast(ucast(&a, &u), bcnt(&a)),
            ),
        ),
    ])
});

// A second set of the generic variables, needed because a closure above
// already moved the first.
fn c2() -> Directive {
    Directive::matcher("δ", 2, MatchType::Any)
}

/// Join descriptors: how operands of two operators join each other. No
/// obligation to produce simple output; results are checked by the filter.
pub static JOIN_DESCRIPTORS: LazyLock<RuleSet> = LazyLock::new(|| {
    let Vars { a, b, c_, u } = vars();

    RuleSet::build(vec![
        // Special AND/OR directives to reduce unknowns.
        (
            &a | &b,
            iff(
                une(mask_k1(&a) & mask_unk(&b), 0),
                &a | sim(&b & sim(!mask_k1(&a))),
            ),
        ),
        (
            &a & &b,
            iff(
                une(mask_k0(&a) & (!mask_k0(&b)), 0),
                &a & sim(&b & sim(!mask_k0(&a))),
            ),
        ),
        // OR substitutes for ADD when no carries can meet.
        (
            &a + &b,
            iff(
                ueq(
                    (mask_k1(&a) | mask_unk(&a)) & (mask_k1(&b) | mask_unk(&b)),
                    c(0),
                ),
                &a | &b,
            ),
        ),
        // ADD.
        (&a + (&b + &c_), sim(&a + &b) + &c_),
        (&a + (&b - &c_), sim(&a + &b) - &c_),
        (&a + (&b - &c_), sim(&a - &c_) + &b),
        // SUB.
        (&a - (&b + &c_), sim(&a - &b) - &c_),
        (&a - (&b - &c_), sim(&a + &c_) - &b),
        (&a - (&b - &c_), sim(&a - &b) + &c_),
        ((&b + &c_) - &a, sim(&b - &a) + &c_),
        ((&b - &c_) - &a, &b - sim(&a + &c_)),
        ((&b - &c_) - &a, sim(&b - &a) - &c_),
        // OR.
        (&a | (&b | &c_), sim(&a | &b) | sim(&a | &c_)),
        (&a | (&b | &c_), sim(&a | &b) | or_else(sim(&a | &c_), &c_)),
        (&a | (&b & &c_), sim(&a | &b) & sim(&a | &c_)),
        (&a | (&b & &c_), &a | (sim(&a | &b) & &c_)),
        (
            &a | (&b ^ &c_),
            &a | try_sim(sim(&b & try_sim(!(&a))) ^ try_sim(&c_ & (!(&a)))),
        ),
        (
            &a | (&b << &u),
            (sim(sim(&a >> &u) | &b) << &u) | try_sim(&a & ((1 << &u) - 1)),
        ),
        (
            &a | (&b >> &u),
            (sim(sim(&a << &u) | &b) >> &u) | try_sim(&a & (!((-1 << &u) >> &u))),
        ),
        (&a | rotl(&b, &c_), rotl(sim(&b | try_sim(rotr(&a, &c_))), &c_)),
        (&a | rotr(&b, &c_), rotr(sim(&b | try_sim(rotl(&a, &c_))), &c_)),
        (&a | (!(&b)), !sim(&b & try_sim(!(&a)))),
        // AND.
        (&a & (&b | &c_), sim(&a & &b) | sim(&a & &c_)),
        (&a & (&b | &c_), &a & try_sim(sim(&a & &b) | &c_)),
        (&a & (&b & &c_), sim(&a & &b) & sim(&a & &c_)),
        (&a & (&b & &c_), sim(&a & &b) & or_else(sim(&a & &c_), &c_)),
        (&a & (&b ^ &c_), sim(&a & &b) ^ sim(&a & &c_)),
        (&a & (&b ^ &c_), &a & try_sim(sim(&a & &b) ^ &c_)),
        (&a & (&b << &u), sim(sim(&a >> &u) & &b) << &u),
        (&a & (&b >> &u), sim(sim(&a << &u) & &b) >> &u),
        (&a & rotl(&b, &c_), rotl(sim(&b & try_sim(rotr(&a, &c_))), &c_)),
        (&a & rotr(&b, &c_), rotr(sim(&b & try_sim(rotl(&a, &c_))), &c_)),
        (&a & (!(&b)), !sim(&b | try_sim(!(&a)))),
        // XOR.
        (
            &a ^ (&b & &c_),
            try_sim(&a | (&b & &c_)) & try_sim(!(&b & sim(&a & &c_))),
        ),
        (
            &a ^ (&b | &c_),
            try_sim(&b | sim(&a | &c_)) & try_sim(!(&a & (&b | &c_))),
        ),
        (&a ^ (&b ^ &c_), &b ^ sim(&a ^ &c_)),
        (
            &a ^ (&b << &u),
            (sim(sim(&a >> &u) ^ &b) << &u) | try_sim(&a & ((1 << &u) - 1)),
        ),
        (
            &a ^ (&b >> &u),
            (sim(sim(&a << &u) ^ &b) >> &u) | try_sim(&a & (!((-1 << &u) >> &u))),
        ),
        (&a ^ rotl(&b, &c_), rotl(sim(&b ^ try_sim(rotr(&a, &c_))), &c_)),
        (&a ^ rotr(&b, &c_), rotr(sim(&b ^ try_sim(rotl(&a, &c_))), &c_)),
        (&a ^ (!(&b)), sim(!(&a)) ^ &b),
        // SHL.
        ((&a | &b) << &c_, sim(&a << &c_) | try_sim(&b << &c_)),
        ((&a & &b) << &c_, sim(&a << &c_) & try_sim(&b << &c_)),
        ((&a ^ &b) << &c_, sim(&a << &c_) ^ try_sim(&b << &c_)),
        ((&a << &b) << &c_, &a << sim(&b + &c_)),
        (
            (&a >> &b) << &c_,
            iff(ge(&b, &c_), sim((-1 >> &b) << &c_) & (&a >> sim(&b - &c_))),
        ),
        (
            (&a >> &c_) << &b,
            iff(ge(&b, &c_), sim((-1 >> &c_) << &b) & (&a << sim(&b - &c_))),
        ),
        ((!(&a)) << &u, (!(&a << &u)) & (-1 << &u)),
        // SHR.
        ((&a | &b) >> &c_, sim(&a >> &c_) | try_sim(&b >> &c_)),
        ((&a & &b) >> &c_, sim(&a >> &c_) & try_sim(&b >> &c_)),
        ((&a ^ &b) >> &c_, sim(&a >> &c_) ^ try_sim(&b >> &c_)),
        (
            (&a << &c_) >> &b,
            iff(ge(&b, &c_), sim((-1 << &c_) >> &b) & (&a >> sim(&b - &c_))),
        ),
        (
            (&a << &b) >> &c_,
            iff(ge(&b, &c_), sim((-1 << &b) >> &c_) & (&a << sim(&b - &c_))),
        ),
        ((&a >> &b) >> &c_, &a >> sim(&b + &c_)),
        ((!(&a)) >> &u, (!(&a >> &u)) & (-1 >> &u)),
        // ROL.
        (rotl(&a | &b, &c_), rotl(&a, &c_) | rotl(&b, &c_)),
        (rotl(&a & &b, &c_), rotl(&a, &c_) & rotl(&b, &c_)),
        (rotl(&a ^ &b, &c_), rotl(&a, &c_) ^ rotl(&b, &c_)),
        (rotl(rotl(&a, &b), &c_), rotl(&a, sim(&b + &c_))),
        (rotl(rotr(&a, &b), &c_), iff(ge(&b, &c_), rotr(&a, sim(&b - &c_)))),
        (rotl(rotr(&a, &c_), &b), iff(ge(&b, &c_), rotl(&a, sim(&b - &c_)))),
        (rotl(!(&a), &c_), !rotl(&a, &c_)),
        // ROR.
        (rotr(&a | &b, &c_), rotr(&a, &c_) | rotr(&b, &c_)),
        (rotr(&a & &b, &c_), rotr(&a, &c_) & rotr(&b, &c_)),
        (rotr(&a ^ &b, &c_), rotr(&a, &c_) ^ rotr(&b, &c_)),
        (rotr(rotl(&a, &b), &c_), iff(ge(&b, &c_), rotl(&a, &b - &c_))),
        (rotr(rotl(&a, &c_), &b), iff(ge(&b, &c_), rotr(&a, &b - &c_))),
        (rotr(rotr(&a, &b), &c_), rotr(&a, &b + &c_)),
        (rotr(!(&a), &c_), !rotr(&a, &c_)),
        // NOT.
        (!(&a | &b), sim(!(&a)) & try_sim(!(&b))),
        (!(&a & &b), sim(!(&a)) | try_sim(!(&b))),
        (!(&a ^ &b), sim(!(&a)) ^ &b),
        (!rotl(&a, &c_), rotl(sim(!(&a)), &c_)),
        (!rotr(&a, &c_), rotr(sim(!(&a)), &c_)),
        // MUL.
        ((&a + &b) * &c_, sim(&a * &c_) + try_sim(&b * &c_)),
        ((&a + &b) * &c_, try_sim(&a * &c_) + sim(&b * &c_)),
        ((&a - &b) * &c_, sim(&a * &c_) - try_sim(&b * &c_)),
        ((&a - &b) * &c_, try_sim(&a * &c_) - sim(&b * &c_)),
        (&a * (&b * &c_), sim(&a * &c_) * &b),
        (&a * (-(&b)), sim(try_sim(-(&a)) * &b)),
        ((&a * &b) + (&a * &c_), &a * sim(&b + &c_)),
        ((&a * &b) - (&a * &c_), &a * sim(&b - &c_)),
        // Lower immediate urem/udiv/mul into and/shr/shl where possible.
        (
            &a * &u,
            iff(eq(popcnt_of(&u), c(1)), &a << sim(bsf_of(&u) - 1)),
        ),
        (&a + (&a << &u), &a * sim(1 + (1 << &u))),
        (
            urem(&a, &u),
            iff(eq(popcnt_of(&u), c(1)), &a & sim(&u - 1)),
        ),
        (
            udiv(&a, &u),
            iff(eq(popcnt_of(&u), c(1)), &a >> sim(bsf_of(&u) - 1)),
        ),
        // Comparison simplifiers.
        (
            eq(&a << &b, &c_),
            eq(try_sim((&a << &b) >> &b), try_sim(&c_ >> &b)),
        ),
        (
            eq(&a >> &b, &c_),
            eq(try_sim((&a >> &b) << &b), try_sim(&c_ << &b)),
        ),
        (
            eq((&a << &b) | &c_, c(0)),
            iff(eq(&a, (&a << &b) >> &b), ueq(&a | &c_, c(0))),
        ),
        (
            eq(&a | &b, c(0)),
            try_sim(eq(&a, c(0))) & try_sim(eq(&b, c(0))),
        ),
        (
            eq(ucast(&a, &b), &c_),
            iff(
                le(bcnt(&a), bcnt(&c_)),
                iff(
                    eq(&c_, ucast(&c_, bcnt(&a))),
                    eq(&a, try_sim(ucast(&c_, bcnt(&a)))),
                ),
            ),
        ),
        (
            eq(ucast(&a, &b), &c_),
            iff(
                le(bcnt(&a), bcnt(&c_)),
                iff(ne(&c_, ucast(&c_, bcnt(&a))), Directive::constant(0)),
            ),
        ),
    ])
});

/// Grouping of simple representations into more complex operators, used only
/// by the prettifier.
pub static PACK_DESCRIPTORS: LazyLock<RuleSet> = LazyLock::new(|| {
    let Vars { a, b, .. } = vars();

    RuleSet::build(vec![
        (ucast(&a >> &b, c(1)), bt(&a, &b)),
        ((&a >> &b) & 1, ucast(bt(&a, &b), bcnt(&a))),
        (
            (&a & &b) >> &c2(),
            iff(ueq(&b >> &c2(), c(1)), ucast(bt(&a, &c2()), bcnt(&a))),
        ),
        (
            if_v(le(&a, &b), &a) | if_v(gt(&a, &b), &b),
            vmin(&a, &b),
        ),
        (
            if_v(le(&a, &b), &a) + if_v(gt(&a, &b), &b),
            vmin(&a, &b),
        ),
        (
            if_v(ge(&a, &b), &a) | if_v(lt(&a, &b), &b),
            vmax(&a, &b),
        ),
        (
            if_v(ge(&a, &b), &a) + if_v(lt(&a, &b), &b),
            vmax(&a, &b),
        ),
        (
            if_v(ule(&a, &b), &a) | if_v(ugt(&a, &b), &b),
            uvmin(&a, &b),
        ),
        (
            if_v(ule(&a, &b), &a) + if_v(ugt(&a, &b), &b),
            uvmin(&a, &b),
        ),
        (
            if_v(uge(&a, &b), &a) | if_v(ult(&a, &b), &b),
            uvmax(&a, &b),
        ),
        (
            if_v(uge(&a, &b), &a) + if_v(ult(&a, &b), &b),
            uvmax(&a, &b),
        ),
        // Boolean select masks back into value_if.
        (
            (!(&a + (-1))) & &b,
            iff(
                ueq(mask_unk(&a) | mask_k1(&a), c(1)),
                if_v(try_sim(ucast(&a, c(1))), &b),
            ),
        ),
        (
            (!(&a - 1)) & &b,
            iff(
                ueq(mask_unk(&a) | mask_k1(&a), c(1)),
                if_v(try_sim(ucast(&a, c(1))), &b),
            ),
        ),
        (
            (-(&a)) & &b,
            iff(
                ueq(mask_unk(&a) | mask_k1(&a), c(1)),
                if_v(try_sim(ucast(&a, c(1))), &b),
            ),
        ),
        (
            (&a + (-1)) & &b,
            iff(
                ueq(mask_unk(&a) | mask_k1(&a), c(1)),
                if_v(try_sim(ucast(!(&a), c(1))), &b),
            ),
        ),
        (
            (&a - 1) & &b,
            iff(
                ueq(mask_unk(&a) | mask_k1(&a), c(1)),
                if_v(try_sim(ucast(!(&a), c(1))), &b),
            ),
        ),
    ])
});

/// Conversion from complex operators back into simple representations.
pub static UNPACK_DESCRIPTORS: LazyLock<RuleSet> = LazyLock::new(|| {
    let Vars { a, b, .. } = vars();

    RuleSet::build(vec![
        (bt(&a, &b), ucast((&a & (1 << &b)) >> &b, c(1))),
        (
            vmin(&a, &b),
            if_v(le(&a, &b), &a) | if_v(gt(&a, &b), &b),
        ),
        (
            vmax(&a, &b),
            if_v(ge(&a, &b), &a) | if_v(lt(&a, &b), &b),
        ),
        (
            uvmin(&a, &b),
            if_v(ule(&a, &b), &a) | if_v(ugt(&a, &b), &b),
        ),
        (
            uvmax(&a, &b),
            if_v(uge(&a, &b), &a) | if_v(ult(&a, &b), &b),
        ),
        (
            if_v(!(&a), &b),
            ((ucast(&a, bcnt(&b)) & 1) - 1) & &b,
        ),
        (
            if_v(&a, &b),
            (!((ucast(&a, bcnt(&b)) & 1) - 1)) & &b,
        ),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_build() {
        assert!(!UNIVERSAL_SIMPLIFIERS.for_op(Op::Add).is_empty());
        assert!(!UNIVERSAL_SIMPLIFIERS.for_op(Op::BitwiseXor).is_empty());
        assert!(!JOIN_DESCRIPTORS.for_op(Op::BitwiseOr).is_empty());
        assert!(!PACK_DESCRIPTORS.for_op(Op::ValueIf).is_empty() || !PACK_DESCRIPTORS.for_op(Op::BitwiseOr).is_empty());
        assert!(!UNPACK_DESCRIPTORS.for_op(Op::BitTest).is_empty());
    }

    #[test]
    fn test_rules_have_signatures() {
        for rule in UNIVERSAL_SIMPLIFIERS.for_op(Op::Add) {
            // Signature of a pattern headed by add must demand the add bits.
            assert!(rule.src.head_op() == Some(Op::Add));
            let _ = &rule.signatures[63];
        }
    }
}
