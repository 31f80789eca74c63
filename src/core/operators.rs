//! Operator descriptors and scalar evaluation.
//!
//! Each operator carries a static descriptor: arity, commutativity, a hint for
//! whether it prefers bitwise or arithmetic operands, and a complexity
//! coefficient used by the simplifier as an inverse reward. Evaluation comes
//! in two flavors: fully concrete (`evaluate`) and partial over bit-vectors
//! with unknowns (`evaluate_partial`).

use super::bitvec::{BitState, BitVector};
use super::masks::{fill, lsb, msb, popcnt, sign_extend, zero_extend, BIT_INDEX_SIZE};

/// Identifier of an expression operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Op {
    Invalid,

    // Bitwise operators.
    BitwiseNot,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ShiftRight,
    ShiftLeft,
    RotateRight,
    RotateLeft,

    // Arithmetic operators.
    Negate,
    Add,
    Subtract,
    MultiplyHigh,
    Multiply,
    Divide,
    Remainder,
    UmultiplyHigh,
    Umultiply,
    Udivide,
    Uremainder,

    // Special operators.
    Ucast,
    Cast,
    Popcnt,
    BitscanFwd,
    BitscanRev,
    BitTest,
    Mask,
    BitCount,
    ValueIf,

    MaxValue,
    MinValue,
    UmaxValue,
    UminValue,

    // Comparisons. Equality is always canonicalized to the signed variant.
    Greater,
    GreaterEq,
    Equal,
    NotEqual,
    LessEq,
    Less,
    Ugreater,
    UgreaterEq,
    Uequal,
    UnotEqual,
    UlessEq,
    Uless,
}

/// Total number of operators including `Invalid`.
pub const OP_COUNT: usize = Op::Uless as usize + 1;

/// Basic properties of each operator.
#[derive(Debug, Clone, Copy)]
pub struct OpDesc {
    /// `+1` if bitwise operands are preferred, `-1` if arithmetic, `0` if
    /// neutral. Mixing hints across a parent/child edge doubles complexity.
    pub hint_bitwise: i8,
    /// Whether operands are treated as signed.
    pub is_signed: bool,
    /// Number of operands, 1 or 2.
    pub operand_count: u8,
    /// Whether the operands commute.
    pub is_commutative: bool,
    /// Infix/prefix symbol if the operator has one.
    pub symbol: Option<&'static str>,
    /// Function-style name, also used by the textual dump.
    pub name: &'static str,
    /// Coefficient of the expression complexity.
    pub complexity_coeff: f64,
}

#[rustfmt::skip]
static DESCRIPTORS: [OpDesc; OP_COUNT] = [
    /* Invalid       */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 0, is_commutative: false, symbol: None,        name: "invalid",     complexity_coeff: 0.0 },
    /* BitwiseNot    */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 1, is_commutative: false, symbol: Some("~"),   name: "not",         complexity_coeff: 1.0 },
    /* BitwiseAnd    */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("&"),   name: "and",         complexity_coeff: 1.0 },
    /* BitwiseOr     */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("|"),   name: "or",          complexity_coeff: 1.0 },
    /* BitwiseXor    */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("^"),   name: "xor",         complexity_coeff: 1.0 },
    /* ShiftRight    */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some(">>"),  name: "shr",         complexity_coeff: 1.5 },
    /* ShiftLeft     */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("<<"),  name: "shl",         complexity_coeff: 1.5 },
    /* RotateRight   */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some(">]"),  name: "rotr",        complexity_coeff: 0.5 },
    /* RotateLeft    */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("[<"),  name: "rotl",        complexity_coeff: 0.5 },
    /* Negate        */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 1, is_commutative: false, symbol: Some("-"),   name: "neg",         complexity_coeff: 1.0 },
    /* Add           */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: true,  symbol: Some("+"),   name: "add",         complexity_coeff: 1.0 },
    /* Subtract      */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: false, symbol: Some("-"),   name: "sub",         complexity_coeff: 1.0 },
    /* MultiplyHigh  */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: true,  symbol: Some("h*"),  name: "mulhi",       complexity_coeff: 1.3 },
    /* Multiply      */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: true,  symbol: Some("*"),   name: "mul",         complexity_coeff: 1.3 },
    /* Divide        */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: false, symbol: Some("/"),   name: "div",         complexity_coeff: 1.3 },
    /* Remainder     */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: false, symbol: Some("%"),   name: "rem",         complexity_coeff: 1.3 },
    /* UmultiplyHigh */ OpDesc { hint_bitwise: -1, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("uh*"), name: "umulhi",      complexity_coeff: 1.3 },
    /* Umultiply     */ OpDesc { hint_bitwise: -1, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("u*"),  name: "umul",        complexity_coeff: 1.3 },
    /* Udivide       */ OpDesc { hint_bitwise: -1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("u/"),  name: "udiv",        complexity_coeff: 1.3 },
    /* Uremainder    */ OpDesc { hint_bitwise: -1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("u%"),  name: "urem",        complexity_coeff: 1.3 },
    /* Ucast         */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 2, is_commutative: false, symbol: None,        name: "__ucast",     complexity_coeff: 1.0 },
    /* Cast          */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: false, symbol: None,        name: "__cast",      complexity_coeff: 1.0 },
    /* Popcnt        */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 1, is_commutative: false, symbol: None,        name: "__popcnt",    complexity_coeff: 1.0 },
    /* BitscanFwd    */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 1, is_commutative: false, symbol: None,        name: "__bsf",       complexity_coeff: 1.0 },
    /* BitscanRev    */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 1, is_commutative: false, symbol: None,        name: "__bsr",       complexity_coeff: 1.0 },
    /* BitTest       */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: None,        name: "__bt",        complexity_coeff: 1.0 },
    /* Mask          */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 1, is_commutative: false, symbol: None,        name: "__mask",      complexity_coeff: 1.0 },
    /* BitCount      */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 1, is_commutative: false, symbol: None,        name: "__bcnt",      complexity_coeff: 1.0 },
    /* ValueIf       */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("?"),   name: "if",          complexity_coeff: 1.0 },
    /* MaxValue      */ OpDesc { hint_bitwise:  0, is_signed: true,  operand_count: 2, is_commutative: true,  symbol: None,        name: "max",         complexity_coeff: 1.0 },
    /* MinValue      */ OpDesc { hint_bitwise:  0, is_signed: true,  operand_count: 2, is_commutative: true,  symbol: None,        name: "min",         complexity_coeff: 1.0 },
    /* UmaxValue     */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 2, is_commutative: true,  symbol: None,        name: "umax",        complexity_coeff: 1.0 },
    /* UminValue     */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 2, is_commutative: true,  symbol: None,        name: "umin",        complexity_coeff: 1.0 },
    /* Greater       */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: false, symbol: Some(">"),   name: "greater",     complexity_coeff: 1.0 },
    /* GreaterEq     */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: false, symbol: Some(">="),  name: "greater_eq",  complexity_coeff: 1.2 },
    /* Equal         */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("=="),  name: "equal",       complexity_coeff: 1.0 },
    /* NotEqual      */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("!="),  name: "not_equal",   complexity_coeff: 1.0 },
    /* LessEq        */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: false, symbol: Some("<="),  name: "less_eq",     complexity_coeff: 1.2 },
    /* Less          */ OpDesc { hint_bitwise: -1, is_signed: true,  operand_count: 2, is_commutative: false, symbol: Some("<"),   name: "less",        complexity_coeff: 1.0 },
    /* Ugreater      */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("u>"),  name: "ugreater",    complexity_coeff: 1.0 },
    /* UgreaterEq    */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("u>="), name: "ugreater_eq", complexity_coeff: 1.2 },
    /* Uequal        */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("u=="), name: "uequal",      complexity_coeff: 1.0 },
    /* UnotEqual     */ OpDesc { hint_bitwise:  0, is_signed: false, operand_count: 2, is_commutative: true,  symbol: Some("u!="), name: "unot_equal",  complexity_coeff: 1.0 },
    /* UlessEq       */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("u<="), name: "uless_eq",    complexity_coeff: 1.2 },
    /* Uless         */ OpDesc { hint_bitwise:  1, is_signed: false, operand_count: 2, is_commutative: false, symbol: Some("u<"),  name: "uless",       complexity_coeff: 1.0 },
];

impl Op {
    /// Static descriptor of the operator.
    pub fn desc(self) -> &'static OpDesc {
        &DESCRIPTORS[self as usize]
    }

    pub fn is_commutative(self) -> bool {
        self.desc().is_commutative
    }

    pub fn operand_count(self) -> u8 {
        self.desc().operand_count
    }

    /// Lookup by the function-style name used in dumps and serialization.
    pub fn from_name(name: &str) -> Option<Op> {
        ALL_OPS.iter().copied().find(|op| op.desc().name == name)
    }

    /// Renders the operation over already-rendered operands.
    pub fn format(self, lhs: &str, rhs: &str) -> String {
        let desc = self.desc();
        if desc.operand_count == 1 {
            match desc.symbol {
                Some(sym) => format!("{sym}{rhs}"),
                None => format!("{}({})", desc.name, rhs),
            }
        } else {
            match desc.symbol {
                Some(sym) => format!("({lhs}{sym}{rhs})"),
                None => format!("{}({}, {})", desc.name, lhs, rhs),
            }
        }
    }
}

/// Every valid operator, in descriptor order.
pub static ALL_OPS: [Op; OP_COUNT - 1] = [
    Op::BitwiseNot,
    Op::BitwiseAnd,
    Op::BitwiseOr,
    Op::BitwiseXor,
    Op::ShiftRight,
    Op::ShiftLeft,
    Op::RotateRight,
    Op::RotateLeft,
    Op::Negate,
    Op::Add,
    Op::Subtract,
    Op::MultiplyHigh,
    Op::Multiply,
    Op::Divide,
    Op::Remainder,
    Op::UmultiplyHigh,
    Op::Umultiply,
    Op::Udivide,
    Op::Uremainder,
    Op::Ucast,
    Op::Cast,
    Op::Popcnt,
    Op::BitscanFwd,
    Op::BitscanRev,
    Op::BitTest,
    Op::Mask,
    Op::BitCount,
    Op::ValueIf,
    Op::MaxValue,
    Op::MinValue,
    Op::UmaxValue,
    Op::UminValue,
    Op::Greater,
    Op::GreaterEq,
    Op::Equal,
    Op::NotEqual,
    Op::LessEq,
    Op::Less,
    Op::Ugreater,
    Op::UgreaterEq,
    Op::Uequal,
    Op::UnotEqual,
    Op::UlessEq,
    Op::Uless,
];

/// Calculates the width of the result after applying `op` on operands of the
/// given widths. Cast operators derive their size from the immediate operand
/// and must not call into this helper.
pub fn result_size(op: Op, lhs_bits: u32, rhs_bits: u32) -> u32 {
    match op {
        // Operators that return bit indices.
        Op::Popcnt | Op::BitscanFwd | Op::BitscanRev | Op::BitCount => BIT_INDEX_SIZE,

        // Unary and parameterized unary-like operators.
        Op::Negate | Op::BitwiseNot | Op::Mask | Op::ValueIf => rhs_bits,
        Op::ShiftRight | Op::ShiftLeft | Op::RotateRight | Op::RotateLeft => lhs_bits,

        // Boolean operators.
        Op::BitTest
        | Op::Greater
        | Op::GreaterEq
        | Op::Equal
        | Op::NotEqual
        | Op::LessEq
        | Op::Less
        | Op::Ugreater
        | Op::UgreaterEq
        | Op::Uequal
        | Op::UnotEqual
        | Op::UlessEq
        | Op::Uless => 1,

        Op::Ucast | Op::Cast => unreachable!("cast operators carry their own size"),

        // Rest default to the maximum operand size.
        _ => lhs_bits.max(rhs_bits),
    }
}

fn mulhi_signed(a: i64, b: i64) -> u64 {
    (((a as i128) * (b as i128)) >> 64) as u64
}

fn mulhi_unsigned(a: u64, b: u64) -> u64 {
    (((a as u128) * (b as u128)) >> 64) as u64
}

/// Applies `op` on concrete operands, returning the masked result and its
/// width. Inputs narrower than 64 bits are extended according to the
/// signedness of the operator first.
pub fn evaluate(op: Op, lhs_bits: u32, lhs: u64, rhs_bits: u32, rhs: u64) -> (u64, u32) {
    let desc = op.desc();

    // Normalize the input.
    let mut lhs = lhs;
    let mut rhs = rhs;
    if lhs_bits != 64 && desc.operand_count != 1 {
        lhs = if desc.is_signed {
            sign_extend(lhs, lhs_bits) as u64
        } else {
            zero_extend(lhs, lhs_bits)
        };
    }
    if rhs_bits != 64 {
        rhs = if desc.is_signed {
            sign_extend(rhs, rhs_bits) as u64
        } else {
            zero_extend(rhs, rhs_bits)
        };
    }
    let ilhs = lhs as i64;
    let irhs = rhs as i64;

    // Cast operators resize the left hand side.
    if op == Op::Ucast {
        let n = rhs as u32;
        return (zero_extend(lhs, n), n);
    }
    if op == Op::Cast {
        let n = rhs as u32;
        return (sign_extend(lhs, n) as u64 & fill(n), n);
    }

    let bits = result_size(op, lhs_bits, rhs_bits);
    let result: u64 = match op {
        // Bitwise operators.
        Op::BitwiseNot => !rhs,
        Op::BitwiseAnd => lhs & rhs,
        Op::BitwiseOr => lhs | rhs,
        Op::BitwiseXor => lhs ^ rhs,
        Op::ShiftRight => {
            if rhs >= lhs_bits as u64 {
                0
            } else {
                zero_extend(lhs, lhs_bits) >> rhs
            }
        }
        Op::ShiftLeft => {
            if rhs >= lhs_bits as u64 {
                0
            } else {
                lhs << rhs
            }
        }
        Op::RotateRight => {
            let n = (rhs % lhs_bits as u64) as u32;
            let v = zero_extend(lhs, lhs_bits);
            if n == 0 {
                v
            } else {
                (v >> n) | (v << (lhs_bits - n))
            }
        }
        Op::RotateLeft => {
            let n = (rhs % lhs_bits as u64) as u32;
            let v = zero_extend(lhs, lhs_bits);
            if n == 0 {
                v
            } else {
                (v << n) | (v >> (lhs_bits - n))
            }
        }

        // Arithmetic operators.
        Op::Negate => irhs.wrapping_neg() as u64,
        Op::Add => ilhs.wrapping_add(irhs) as u64,
        Op::Subtract => ilhs.wrapping_sub(irhs) as u64,
        Op::MultiplyHigh => {
            if bits == 64 {
                mulhi_signed(ilhs, irhs)
            } else {
                (ilhs.wrapping_mul(irhs) as u64) >> bits
            }
        }
        Op::UmultiplyHigh => {
            if bits == 64 {
                mulhi_unsigned(lhs, rhs)
            } else {
                lhs.wrapping_mul(rhs) >> bits
            }
        }
        Op::Multiply => ilhs.wrapping_mul(irhs) as u64,
        Op::Umultiply => lhs.wrapping_mul(rhs),
        Op::Divide => {
            if irhs == 0 {
                log::warn!("division by immediate zero (idiv)");
                i64::MAX as u64
            } else {
                ilhs.wrapping_div(irhs) as u64
            }
        }
        Op::Udivide => {
            if rhs == 0 {
                log::warn!("division by immediate zero (div)");
                u64::MAX
            } else {
                lhs / rhs
            }
        }
        Op::Remainder => {
            if irhs == 0 {
                log::warn!("division by immediate zero (irem)");
                0
            } else {
                ilhs.wrapping_rem(irhs) as u64
            }
        }
        Op::Uremainder => {
            if rhs == 0 {
                log::warn!("division by immediate zero (rem)");
                0
            } else {
                lhs % rhs
            }
        }

        // Special operators.
        Op::Popcnt => popcnt(rhs) as u64,
        Op::BitscanFwd => lsb(rhs) as u64,
        Op::BitscanRev => msb(rhs) as u64,
        Op::BitTest => {
            if rhs >= 64 {
                0
            } else {
                (lhs >> rhs) & 1
            }
        }
        Op::Mask => fill(rhs_bits),
        Op::BitCount => rhs_bits as u64,
        Op::ValueIf => {
            if lhs & 1 != 0 {
                rhs
            } else {
                0
            }
        }

        Op::UminValue => lhs.min(rhs),
        Op::UmaxValue => lhs.max(rhs),
        Op::MinValue => ilhs.min(irhs) as u64,
        Op::MaxValue => ilhs.max(irhs) as u64,

        // Comparison operators.
        Op::Greater => (ilhs > irhs) as u64,
        Op::GreaterEq => (ilhs >= irhs) as u64,
        Op::Equal => (ilhs == irhs) as u64,
        Op::NotEqual => (ilhs != irhs) as u64,
        Op::Uequal => (lhs == rhs) as u64,
        Op::UnotEqual => (lhs != rhs) as u64,
        Op::LessEq => (ilhs <= irhs) as u64,
        Op::Less => (ilhs < irhs) as u64,
        Op::Ugreater => (lhs > rhs) as u64,
        Op::UgreaterEq => (lhs >= rhs) as u64,
        Op::UlessEq => (lhs <= rhs) as u64,
        Op::Uless => (lhs < rhs) as u64,

        Op::Invalid | Op::Ucast | Op::Cast => unreachable!(),
    };

    (result & fill(bits), bits)
}

/// Applies `op` on bit-vectors with optional unknowns, computing the tightest
/// known-one/known-zero masks the operator allows.
pub fn evaluate_partial(op: Op, lhs: &BitVector, rhs: &BitVector) -> BitVector {
    // If the operand set is incomplete, return an invalid vector.
    let known = match op.desc().operand_count {
        1 => {
            if !rhs.is_valid() {
                return BitVector::default();
            }
            rhs.is_known()
        }
        2 => {
            if !rhs.is_valid() || !lhs.is_valid() {
                return BitVector::default();
            }
            lhs.is_known() && rhs.is_known()
        }
        _ => return BitVector::default(),
    };

    // If no unknown bits, redirect to the more efficient scalar evaluator.
    if known {
        let (val, size) = evaluate(op, lhs.size(), lhs.known_one(), rhs.size(), rhs.known_one());
        return BitVector::constant(val, size);
    }

    match op {
        // Basic bitwise operators.
        Op::BitwiseNot => BitVector::partial(!rhs.known_one(), rhs.unknown_mask(), rhs.size()),
        Op::BitwiseAnd => BitVector::partial(
            lhs.known_one() & rhs.known_one(),
            (lhs.unknown_mask() | rhs.unknown_mask()) & !(lhs.known_zero() | rhs.known_zero()),
            lhs.size().min(rhs.size()),
        )
        .resize(lhs.size().max(rhs.size()), false),
        Op::BitwiseOr => BitVector::partial(
            lhs.known_one() | rhs.known_one(),
            (lhs.unknown_mask() | rhs.unknown_mask()) & !(lhs.known_one() | rhs.known_one()),
            lhs.size().max(rhs.size()),
        ),
        Op::BitwiseXor => BitVector::partial(
            lhs.known_one() ^ rhs.known_one(),
            lhs.unknown_mask() | rhs.unknown_mask(),
            lhs.size().max(rhs.size()),
        ),

        // Shifts by a known count are exact on the slice that moves.
        Op::ShiftRight => {
            if let Some(n) = rhs.get_u64() {
                if n >= lhs.size() as u64 {
                    return BitVector::constant(0, lhs.size());
                }
                BitVector::partial(
                    lhs.known_one() >> n,
                    lhs.unknown_mask() >> n,
                    lhs.size(),
                )
            } else if lhs.all_zero() {
                *lhs
            } else {
                BitVector::unknown(lhs.size())
            }
        }
        Op::ShiftLeft => {
            if let Some(n) = rhs.get_u64() {
                if n >= lhs.size() as u64 {
                    return BitVector::constant(0, lhs.size());
                }
                BitVector::partial(
                    lhs.known_one() << n,
                    lhs.unknown_mask() << n,
                    lhs.size(),
                )
            } else if lhs.all_zero() {
                *lhs
            } else {
                BitVector::unknown(lhs.size())
            }
        }
        Op::RotateRight => {
            if let Some(n) = rhs.get_u64() {
                let shr = (n % lhs.size() as u64) as u32;
                let shl = lhs.size() - shr;
                let rot = |v: u64| {
                    if shr == 0 {
                        v
                    } else {
                        (v >> shr) | (v << shl)
                    }
                };
                BitVector::partial(rot(lhs.known_one()), rot(lhs.unknown_mask()), lhs.size())
            } else if lhs.all_one() || lhs.all_zero() {
                *lhs
            } else {
                BitVector::unknown(lhs.size())
            }
        }
        Op::RotateLeft => {
            if let Some(n) = rhs.get_u64() {
                let shl = (n % lhs.size() as u64) as u32;
                let shr = lhs.size() - shl;
                let rot = |v: u64| {
                    if shl == 0 {
                        v
                    } else {
                        (v << shl) | (v >> shr)
                    }
                };
                BitVector::partial(rot(lhs.known_one()), rot(lhs.unknown_mask()), lhs.size())
            } else if lhs.all_one() || lhs.all_zero() {
                *lhs
            } else {
                BitVector::unknown(lhs.size())
            }
        }

        // Additive arithmetic propagates carries bit by bit while both sides
        // stay known, the rest of the output is unknown.
        Op::Add => {
            let out_size = lhs.size().max(rhs.size());
            if lhs.unknown_mask() == lhs.value_mask() || rhs.unknown_mask() == rhs.value_mask() {
                return BitVector::unknown(out_size);
            }
            let lhs_sx = lhs.resize(out_size, true);
            let rhs_sx = rhs.resize(out_size, true);
            let mut known_mask = 0u64;
            let mut unknown_mask = 0u64;
            let mut carry = BitState::Zero;
            for i in 0..out_size {
                let a = lhs_sx.at(i);
                let b = rhs_sx.at(i);
                let unk_count = (a == BitState::Unknown) as u32
                    + (b == BitState::Unknown) as u32
                    + (carry == BitState::Unknown) as u32;
                if unk_count != 0 {
                    let one_count = (a == BitState::One) as u32
                        + (b == BitState::One) as u32
                        + (carry == BitState::One) as u32;
                    let zero_count = 3 - one_count - unk_count;
                    carry = if one_count == 2 {
                        BitState::One
                    } else if zero_count == 2 {
                        BitState::Zero
                    } else {
                        BitState::Unknown
                    };
                    unknown_mask |= 1u64 << i;
                } else if a == b {
                    // Duplicated digit propagates as carry, output is the old carry.
                    known_mask |= ((carry == BitState::One) as u64) << i;
                    carry = a;
                } else {
                    // Carry propagates as is, output is the inverse of it.
                    known_mask |= ((carry == BitState::Zero) as u64) << i;
                }
            }
            BitVector::partial(known_mask, unknown_mask, out_size)
        }
        // -A == 0-A and A-B == ~(~A+B).
        Op::Negate => evaluate_partial(Op::Subtract, &BitVector::constant(0, rhs.size()), rhs),
        Op::Subtract => evaluate_partial(
            Op::BitwiseNot,
            &BitVector::default(),
            &evaluate_partial(
                Op::Add,
                &evaluate_partial(Op::BitwiseNot, &BitVector::default(), lhs),
                rhs,
            ),
        ),

        // Bitwise specials.
        Op::Ucast => {
            let n = rhs.get_u64().expect("cast width must be constant") as u32;
            lhs.resize(n, false)
        }
        Op::Cast => {
            let n = rhs.get_u64().expect("cast width must be constant") as u32;
            lhs.resize(n, true)
        }
        Op::Popcnt => {
            // Count cannot exceed the number of possibly-set bits, which
            // leaves the bits above that bound known zero.
            let bound = popcnt(rhs.known_one() | rhs.unknown_mask());
            BitVector::unknown(bound).resize(BIT_INDEX_SIZE, false)
        }
        Op::BitscanFwd | Op::BitscanRev => BitVector::unknown(BIT_INDEX_SIZE),
        Op::BitTest => {
            match rhs.get_u64() {
                Some(n) if n < 64 => BitVector::partial(
                    (lhs.known_one() >> n) & 1,
                    (lhs.unknown_mask() >> n) & 1,
                    1,
                ),
                Some(_) => BitVector::constant(0, 1),
                None => BitVector::unknown(1),
            }
        }
        Op::Mask => BitVector::constant(rhs.value_mask(), rhs.size()),
        Op::BitCount => BitVector::constant(rhs.size() as u64, BIT_INDEX_SIZE),
        Op::ValueIf => {
            if lhs.known_one() & 1 != 0 {
                *rhs
            } else if lhs.unknown_mask() & 1 != 0 {
                BitVector::unknown(rhs.size())
            } else {
                BitVector::constant(0, rhs.size())
            }
        }

        // Complex arithmetic does not partially evaluate.
        Op::MultiplyHigh
        | Op::Multiply
        | Op::Divide
        | Op::Remainder
        | Op::UmultiplyHigh
        | Op::Umultiply
        | Op::Udivide
        | Op::Uremainder => BitVector::unknown(lhs.size().max(rhs.size())),

        // Min/max resolve through their comparator when it is decisive.
        Op::MinValue | Op::MaxValue | Op::UminValue | Op::UmaxValue => {
            let cmp = match op {
                Op::UminValue => Op::Uless,
                Op::UmaxValue => Op::UgreaterEq,
                Op::MinValue => Op::Less,
                Op::MaxValue => Op::GreaterEq,
                _ => unreachable!(),
            };
            let out_size = lhs.size().max(rhs.size());
            match evaluate_partial(cmp, lhs, rhs).at(0) {
                BitState::One => lhs.resize(out_size, false),
                BitState::Zero => rhs.resize(out_size, false),
                BitState::Unknown => BitVector::unknown(out_size),
            }
        }

        // Signed comparisons.
        Op::Greater | Op::GreaterEq | Op::LessEq | Op::Less => {
            let rhs_sign = rhs.at(rhs.size() - 1);
            if rhs_sign == BitState::Unknown {
                return BitVector::unknown(1);
            }
            let lhs_sign = lhs.at(lhs.size() - 1);
            if lhs_sign == BitState::Unknown {
                return BitVector::unknown(1);
            }

            // Differing signs are decisive on their own.
            if lhs_sign == BitState::One && rhs_sign == BitState::Zero {
                return BitVector::bit(op == Op::Less || op == Op::LessEq);
            }
            if rhs_sign == BitState::One && lhs_sign == BitState::Zero {
                return BitVector::bit(op == Op::Greater || op == Op::GreaterEq);
            }

            let cmp_size = lhs.size().max(rhs.size());
            let lhs_sx = lhs.resize(cmp_size, true);
            let rhs_sx = rhs.resize(cmp_size, true);
            for i in (0..cmp_size).rev() {
                if lhs_sx.at(i) == BitState::Unknown || rhs_sx.at(i) == BitState::Unknown {
                    return BitVector::unknown(1);
                }
                if lhs_sx.at(i) == BitState::One && rhs_sx.at(i) == BitState::Zero {
                    return BitVector::bit(op == Op::Greater || op == Op::GreaterEq);
                }
                if rhs_sx.at(i) == BitState::One && lhs_sx.at(i) == BitState::Zero {
                    return BitVector::bit(op == Op::Less || op == Op::LessEq);
                }
            }
            BitVector::bit(op == Op::LessEq || op == Op::GreaterEq)
        }

        // Equality checks, sign-extended to the common width first.
        Op::Equal | Op::NotEqual => {
            let rhs_sign = rhs.at(rhs.size() - 1);
            if rhs_sign == BitState::Unknown {
                return BitVector::unknown(1);
            }
            let lhs_sign = lhs.at(lhs.size() - 1);
            if lhs_sign == BitState::Unknown {
                return BitVector::unknown(1);
            }
            if lhs_sign != rhs_sign {
                return BitVector::bit(op == Op::NotEqual);
            }

            let cmp_size = lhs.size().max(rhs.size());
            let lhs_sx = lhs.resize(cmp_size, true);
            let rhs_sx = rhs.resize(cmp_size, true);
            if (lhs_sx.known_zero() & rhs_sx.known_one()) != 0
                || (lhs_sx.known_one() & rhs_sx.known_zero()) != 0
            {
                return BitVector::bit(op == Op::NotEqual);
            }
            if (lhs_sx.unknown_mask() | rhs_sx.unknown_mask()) != 0 {
                return BitVector::unknown(1);
            }
            BitVector::bit((op == Op::NotEqual) ^ (lhs_sx.known_one() == rhs_sx.known_one()))
        }

        // Unsigned comparisons.
        Op::Ugreater | Op::UgreaterEq | Op::UlessEq | Op::Uless => {
            for i in (0..lhs.size().max(rhs.size())).rev() {
                let a = if i < lhs.size() { lhs.at(i) } else { BitState::Zero };
                let b = if i < rhs.size() { rhs.at(i) } else { BitState::Zero };
                if a == BitState::Unknown || b == BitState::Unknown {
                    return BitVector::unknown(1);
                }
                if a == BitState::One && b == BitState::Zero {
                    return BitVector::bit(op == Op::Ugreater || op == Op::UgreaterEq);
                }
                if b == BitState::One && a == BitState::Zero {
                    return BitVector::bit(op == Op::Uless || op == Op::UlessEq);
                }
            }
            BitVector::bit(op == Op::UlessEq || op == Op::UgreaterEq)
        }

        // Unsigned equality checks.
        Op::Uequal | Op::UnotEqual => {
            if (lhs.known_zero() & rhs.known_one()) != 0
                || (lhs.known_one() & rhs.known_zero()) != 0
            {
                return BitVector::bit(op == Op::UnotEqual);
            }
            if (lhs.unknown_mask() | rhs.unknown_mask()) != 0 {
                return BitVector::unknown(1);
            }
            BitVector::bit((op == Op::UnotEqual) ^ (lhs.known_one() == rhs.known_one()))
        }

        Op::Invalid => BitVector::default(),
    }
}
