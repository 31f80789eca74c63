//! Expression DAG invariants.

use luceria::core::operators::Op;
use luceria::expr::{ExprRef, UniqueId};

fn var(name: &str, bits: u32) -> ExprRef {
    ExprRef::variable(name, bits)
}

#[test]
fn test_leaf_invariants() {
    let x = var("x", 32);
    assert_eq!(x.depth, 0);
    assert!(x.complexity > 0.0);
    assert!(x.is_variable());
    assert!(!x.is_expression());

    let c = ExprRef::constant(42, 16);
    assert_eq!(c.depth, 0);
    assert!(c.complexity > 0.0);
    assert!(c.is_constant());
}

#[test]
fn test_internal_node_depth() {
    let x = var("x", 32);
    let e1 = &x + 1;
    let e2 = &e1 ^ &x;
    assert_eq!(e1.depth, 1);
    assert!(e2.depth >= 1);
    assert!(e2.complexity > 0.0);
}

#[test]
fn test_masks_disjoint_across_construction() {
    let x = var("x", 16);
    let exprs = [
        &x + 3,
        &x & 0xF0,
        &x | 0x0F,
        (&x << 4) ^ 0xAA,
        !&x,
        -&x,
    ];
    for e in exprs {
        assert_eq!(e.known_one() & e.known_zero(), 0, "{e}");
        assert!(e.complexity > 0.0, "{e}");
    }
}

#[test]
fn test_commutative_identity_up_to_permutation() {
    let x = var("x", 32);
    let y = var("y", 32);
    for op in [Op::Add, Op::BitwiseAnd, Op::BitwiseOr, Op::BitwiseXor, Op::Multiply] {
        let a = ExprRef::build_binary(x.clone(), op, y.clone());
        let b = ExprRef::build_binary(y.clone(), op, x.clone());
        assert_eq!(a.hash(), b.hash(), "{op:?}");
        assert!(a.is_identical(&b), "{op:?}");
    }
}

#[test]
fn test_resize_roundtrip_property() {
    let x = var("x", 8);
    let samples = [
        x.clone(),
        &x + 1,
        !&x,
        (&x ^ 0x5A) & 0x0F,
        (&x << 2) | 1,
    ];
    for e in samples {
        for w in [8u32, 12, 16, 32, 64] {
            if w < e.size() {
                continue;
            }
            let back = e.resized(w, false).resized(e.size(), false);
            assert!(back.equals(&e), "w={w} {back} vs {e}");
        }
    }
}

#[test]
fn test_uid_equality() {
    let a = UniqueId::named("rax");
    let b = UniqueId::named("rax");
    let c = UniqueId::named("rbx");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.hash(), b.hash());
}

#[test]
fn test_evaluate_concrete_tree() {
    let x = var("x", 64);
    let y = var("y", 64);
    let e = ((&x * 3) + (&y << 2)) ^ 0xFF;
    let xv = x.uid.clone().unwrap();
    let r = e.evaluate(&|uid: &UniqueId| {
        if *uid == xv {
            Some(5)
        } else {
            Some(2)
        }
    });
    assert_eq!(r.get_u64(), Some(((5 * 3) + (2 << 2)) ^ 0xFF));
}

#[test]
fn test_count_helpers() {
    let x = var("x", 32);
    let y = var("y", 32);
    let e = (&x + &y) * &x;
    assert_eq!(e.count_variables(), 3);
    assert_eq!(e.count_unique_variables(), 2);
}

#[test]
fn test_signed_unsigned_equality_same_node() {
    let x = var("x", 32);
    let y = var("y", 32);
    let signed = ExprRef::build_binary(x.clone(), Op::Equal, y.clone());
    let unsigned = ExprRef::build_binary(x, Op::Uequal, y);
    assert_eq!(unsigned.op, Op::Equal);
    assert!(signed.is_identical(&unsigned));
}

#[test]
fn test_to_string_stable() {
    let x = var("x", 32);
    assert_eq!((&x + 1).to_string(), "(x+0x1)");
    assert_eq!((!&x).to_string(), "~x");
    assert_eq!(ExprRef::constant(-2, 8).to_string(), "-0x2");
}

#[test]
fn test_value_if_resize_propagates_to_value() {
    let c = var("c", 1);
    let v = var("v", 32);
    let e = c.clone().value_if(v);
    let w = e.resized(64, false);
    assert_eq!(w.size(), 64);
    assert_eq!(w.op, Op::ValueIf);
}
