//! Simplifier behaviour on the canonical identities.

use luceria::core::operators::Op;
use luceria::expr::{ExprRef, UniqueId};

fn var(name: &str, bits: u32) -> ExprRef {
    ExprRef::variable(name, bits)
}

#[test]
fn test_xor_xor_cancels() {
    let x = var("x", 32);
    let y = var("y", 32);
    let e = (&x ^ &y) ^ &y;
    let s = e.simplified(false);
    assert!(s.is_identical(&x), "{s}");
}

#[test]
fn test_distributed_multiply_collects() {
    let x = var("x", 32);
    let e = (&x * 2) + (&x * 3);
    let s = e.simplified(false);
    assert!(s.is_identical(&(&x * 5)), "{s}");
}

#[test]
fn test_double_negation_forms() {
    let x = var("x", 32);
    assert!((-(-&x)).is_identical(&x));
    assert!((!(!&x)).is_identical(&x));
    // -(~x) == x + 1
    let s = (-(!&x)).simplified(false);
    assert!(s.equals(&(&x + 1)), "{s}");
}

#[test]
fn test_identity_eliminations() {
    let x = var("x", 32);
    assert!((&x + 0).is_identical(&x));
    assert!((&x | 0).is_identical(&x));
    assert!((&x ^ 0).is_identical(&x));
    assert!((&x & -1).is_identical(&x));
    assert!((&x * 1).is_identical(&x));
    assert!((&x >> 0).is_identical(&x));
    assert!((&x << 0).is_identical(&x));
}

#[test]
fn test_neutral_absorption() {
    let x = var("x", 32);
    assert_eq!((&x & 0).get_u64(), Some(0));
    assert_eq!((&x ^ &x).get_u64(), Some(0));
    assert_eq!((&x - &x).get_u64(), Some(0));
    let all = (&x | -1).simplified(false);
    assert_eq!(all.get_i64(), Some(-1));
}

#[test]
fn test_demorgan() {
    let x = var("x", 16);
    let y = var("y", 16);
    let e = (!&x) & (!&y);
    let s = e.simplified(false);
    let expected = !(&x | &y);
    assert!(s.equals(&expected), "{s}");
}

#[test]
fn test_absorption_laws() {
    let x = var("x", 16);
    let y = var("y", 16);
    assert!((&x & (&x | &y)).simplified(false).is_identical(&x));
    assert!((&x | (&x & &y)).simplified(false).is_identical(&x));
}

#[test]
fn test_shift_composition() {
    let x = var("x", 32);
    let e = (&x << 2) << 3;
    let s = e.simplified(false);
    assert!(s.is_identical(&(&x << 5)), "{s}");
}

#[test]
fn test_add_reassociation_folds_constants() {
    let x = var("x", 64);
    let e = (&x + 3) + 5;
    let s = e.simplified(false);
    assert!(s.equals(&(&x + 8)), "{s}");
}

#[test]
fn test_simplify_idempotent() {
    let x = var("x", 32);
    let y = var("y", 32);
    let samples = [
        (&x ^ &y) ^ &y,
        (&x * 2) + (&x * 3),
        ((&x | &y) & (&x | &y)) + 1,
        !(!(&x & 0xFF)),
    ];
    for e in samples {
        let once = e.simplified(false);
        let twice = once.simplified(false);
        assert!(once.is_identical(&twice), "{once} vs {twice}");
    }
}

#[test]
fn test_strict_complexity_reduction_only() {
    // mul of two unknowns must survive untouched rather than churn.
    let x = var("x", 32);
    let y = var("y", 32);
    let e = ExprRef::build_binary(x, Op::Multiply, y);
    let s = e.simplified(false);
    assert!(s.is_identical(&e));
}

#[test]
fn test_masked_not_conversion() {
    let x = var("x", 32);
    let e = &x ^ -1;
    let s = e.simplified(false);
    assert!(s.is_identical(&(!&x)), "{s}");
}

#[test]
fn test_mba_xor_identity() {
    // (x | y) & ~(x & y) is the classic xor circuit.
    let x = var("x", 16);
    let y = var("y", 16);
    let e = (&x | &y) & (!(&x & &y));
    let s = e.simplified(false);
    assert!(s.equals(&(&x ^ &y)), "{s}");
}

#[test]
fn test_semantics_preserved_by_simplification() {
    let x = var("x", 32);
    let y = var("y", 32);
    let e = ((&x ^ &y) ^ &y) + ((&x * 2) + (&x * 3));
    let s = e.simplified(false);

    let xv = x.uid.clone().unwrap();
    let probe = |ex: &ExprRef, a: u64, b: u64| {
        ex.evaluate(&|uid: &UniqueId| if *uid == xv { Some(a) } else { Some(b) })
            .get_u64()
    };
    for (a, b) in [(0u64, 0u64), (1, 2), (0xFFFF_FFFF, 17), (1 << 31, 3)] {
        assert_eq!(probe(&e, a, b), probe(&s, a, b), "a={a:#x} b={b:#x}");
    }
}
