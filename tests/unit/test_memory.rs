//! Memory sinkhole: read-after-write, splitting and default policies.

use luceria::errors::MemoryError;
use luceria::expr::ExprRef;
use luceria::memory::{DefaultPolicy, Memory};
use luceria::pointer::Pointer;

fn ptr(off: i64) -> Pointer {
    let base = ExprRef::variable("base", 64);
    Pointer::new(&(&base + off))
}

#[test]
fn test_read_write_roundtrip_property() {
    // read(write(M, p, v), p, |v|) == v for assorted widths.
    for bits in [8u32, 16, 32, 64] {
        let mut mem = Memory::new(DefaultPolicy::Free);
        let v = ExprRef::variable("v", bits);
        mem.write(&ptr(0x40), v.clone()).unwrap();
        let r = mem.read(&ptr(0x40), bits).unwrap();
        assert!(r.is_identical(&v), "bits={bits}: {r}");
    }
}

#[test]
fn test_straddling_read_concatenates() {
    let mut mem = Memory::new(DefaultPolicy::Free);
    mem.write(&ptr(0), ExprRef::constant(0x11, 8)).unwrap();
    mem.write(&ptr(1), ExprRef::constant(0x22, 8)).unwrap();
    let r = mem.read(&ptr(0), 16).unwrap();
    assert_eq!(r.get_u64(), Some(0x2211));
}

#[test]
fn test_middle_split() {
    let mut mem = Memory::new(DefaultPolicy::Free);
    mem.write(&ptr(0), ExprRef::constant(0x8877665544332211u64 as i64, 64))
        .unwrap();
    // Overwrite bytes 3..5.
    mem.write(&ptr(3), ExprRef::constant(0xBBAA, 16)).unwrap();
    let r = mem.read(&ptr(0), 64).unwrap();
    assert_eq!(r.get_u64(), Some(0x887766BBAA332211));
}

#[test]
fn test_symbolic_fragment_merge() {
    let mut mem = Memory::new(DefaultPolicy::Free);
    let lo = ExprRef::variable("lo", 32);
    let hi = ExprRef::variable("hi", 32);
    mem.write(&ptr(0), lo.clone()).unwrap();
    mem.write(&ptr(4), hi.clone()).unwrap();
    let r = mem.read(&ptr(0), 64).unwrap();

    // Semantics: r == zext(lo) | (zext(hi) << 32).
    let lv = lo.uid.clone().unwrap();
    let eval = |e: &ExprRef, a: u64, b: u64| {
        e.evaluate(&|uid| if *uid == lv { Some(a) } else { Some(b) })
            .get_u64()
    };
    assert_eq!(eval(&r, 0x11223344, 0x55667788), Some(0x5566778811223344));
}

#[test]
fn test_relaxed_policy_synthesizes_fresh_values() {
    let mem = Memory::new(DefaultPolicy::Relaxed);
    let a = mem.read(&ptr(0), 64).unwrap();
    let b = mem.read(&ptr(0), 64).unwrap();
    // Undefined values carry no identity.
    assert!(!a.is_identical(&b));
}

#[test]
fn test_strict_policy_requires_full_coverage() {
    let mut mem = Memory::new(DefaultPolicy::Strict);
    mem.write(&ptr(0), ExprRef::constant(0x11, 8)).unwrap();
    assert!(mem.read(&ptr(0), 8).is_ok());
    assert!(matches!(
        mem.read(&ptr(0), 16),
        Err(MemoryError::StrictMiss { .. })
    ));
}

#[test]
fn test_unrelated_pointer_aliases_conservatively() {
    // Two different symbolic bases have no provable distance: under the
    // free policy the read degrades to a fresh default value.
    let mut mem = Memory::new(DefaultPolicy::Free);
    let other = Pointer::new(&ExprRef::variable("other", 64));
    mem.write(&other, ExprRef::constant(0x55, 8)).unwrap();
    let r = mem.read(&ptr(0), 8).unwrap();
    assert_eq!(r.get_u64(), None);
}
