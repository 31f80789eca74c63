//! Operator evaluation: scalar vs partial agreement and mask tightness.

use luceria::core::bitvec::BitVector;
use luceria::core::masks::fill;
use luceria::core::operators::{evaluate, evaluate_partial, result_size, Op, ALL_OPS};

const SAMPLES: [u64; 6] = [0, 1, 2, 0x7F, 0x80, 0xFF];

#[test]
fn test_partial_agrees_with_concrete() {
    // Fully-known inputs through the partial evaluator must match the
    // scalar evaluator for every operator.
    for op in ALL_OPS {
        if matches!(op, Op::Ucast | Op::Cast) {
            continue;
        }
        for &a in &SAMPLES {
            for &b in &SAMPLES {
                if matches!(op, Op::Divide | Op::Udivide | Op::Remainder | Op::Uremainder)
                    && b == 0
                {
                    continue;
                }
                let (val, size) = evaluate(op, 8, a, 8, b);
                let r = evaluate_partial(
                    op,
                    &BitVector::constant(a, 8),
                    &BitVector::constant(b, 8),
                );
                assert_eq!(r.get_u64(), Some(val), "{op:?} {a:#x} {b:#x}");
                assert_eq!(r.size(), size, "{op:?}");
            }
        }
    }
}

#[test]
fn test_partial_soundness() {
    // Whatever the partial evaluator claims known must agree with the
    // concrete result for every completion of the unknown bits.
    let lhs = BitVector::partial(0b1001, 0b0110, 4);
    let rhs = BitVector::constant(0b0011, 4);
    for op in [Op::BitwiseAnd, Op::BitwiseOr, Op::BitwiseXor, Op::Add, Op::Subtract] {
        let partial = evaluate_partial(op, &lhs, &rhs);
        for completion in 0..4u64 {
            // Expand the two unknown bits.
            let concrete = lhs.known_one()
                | ((completion & 1) << 1)
                | (((completion >> 1) & 1) << 2);
            let (val, _) = evaluate(op, 4, concrete, 4, rhs.known_one());
            let claimed = partial.known_one();
            let mask = partial.known_mask();
            assert_eq!(val & mask & fill(4), claimed & fill(4), "{op:?} c={completion}");
        }
    }
}

#[test]
fn test_comparisons_resolve_from_masks() {
    // 0b1??? vs 0b0011: the high bit proves unsigned greater.
    let a = BitVector::partial(0b1000, 0b0111, 4);
    let b = BitVector::constant(0b0011, 4);
    assert_eq!(evaluate_partial(Op::Ugreater, &a, &b).get_u64(), Some(1));
    assert_eq!(evaluate_partial(Op::Uless, &a, &b).get_u64(), Some(0));
    // Signed: the set sign bit proves less-than against a positive value.
    assert_eq!(evaluate_partial(Op::Less, &a, &b).get_u64(), Some(1));
}

#[test]
fn test_result_sizes() {
    assert_eq!(result_size(Op::Add, 32, 64), 64);
    assert_eq!(result_size(Op::ShiftLeft, 32, 8), 32);
    assert_eq!(result_size(Op::Equal, 32, 32), 1);
    assert_eq!(result_size(Op::Popcnt, 0, 64), 8);
    assert_eq!(result_size(Op::ValueIf, 1, 64), 64);
}

#[test]
fn test_rotate_concrete() {
    assert_eq!(evaluate(Op::RotateLeft, 8, 0b1000_0001, 8, 1).0, 0b0000_0011);
    assert_eq!(evaluate(Op::RotateRight, 8, 0b1000_0001, 8, 1).0, 0b1100_0000);
    // Rotation count wraps modulo the width.
    assert_eq!(evaluate(Op::RotateLeft, 8, 0x12, 8, 8).0, 0x12);
}

#[test]
fn test_division_by_zero_saturates() {
    assert_eq!(evaluate(Op::Udivide, 64, 5, 64, 0).0, u64::MAX);
    assert_eq!(evaluate(Op::Uremainder, 64, 5, 64, 0).0, 0);
}

#[test]
fn test_mulhi() {
    let (v, _) = evaluate(Op::UmultiplyHigh, 64, u64::MAX, 64, 2);
    assert_eq!(v, 1);
    let (v, _) = evaluate(Op::UmultiplyHigh, 8, 0x80, 8, 0x80);
    assert_eq!(v, 0x40);
}
