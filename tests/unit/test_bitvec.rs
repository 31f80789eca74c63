//! Bit-vector invariants.

use luceria::core::bitvec::{BitState, BitVector};
use luceria::core::masks::fill;

#[test]
fn test_known_masks_never_intersect() {
    let cases = [
        BitVector::unknown(64),
        BitVector::constant(u64::MAX, 64),
        BitVector::partial(0xF0F0, 0x0F0F, 16),
        BitVector::partial(u64::MAX, u64::MAX, 32),
        BitVector::bit(true),
    ];
    for v in cases {
        assert_eq!(v.known_one() & v.known_zero(), 0, "{v}");
        assert_eq!(v.known_one() & v.unknown_mask(), 0, "{v}");
        assert_eq!(v.known_zero() & v.unknown_mask(), 0, "{v}");
        assert_eq!(
            v.known_one() | v.known_zero() | v.unknown_mask(),
            v.value_mask(),
            "{v}"
        );
    }
}

#[test]
fn test_resize_roundtrip() {
    for bits in [1u32, 7, 8, 16, 31, 32, 63, 64] {
        let v = BitVector::constant(0xA5A5_A5A5_A5A5_A5A5 & fill(bits), bits);
        for w in bits..=64 {
            let out = v.resize(w, false).resize(bits, false);
            assert_eq!(out, v, "bits={bits} w={w}");
        }
    }
}

#[test]
fn test_sign_extension_states() {
    // Known-one sign bit extends with ones.
    let v = BitVector::constant(0x80, 8).resize(12, true);
    assert_eq!(v.get_u64(), Some(0xF80));

    // Unknown sign bit extends with unknowns.
    let v = BitVector::partial(0, 0x80, 8).resize(12, true);
    assert_eq!(v.unknown_mask(), 0xF80);
    assert_eq!(v.at(11), BitState::Unknown);

    // Boolean widening never invents a sign.
    let v = BitVector::constant(1, 1).resize(8, true);
    assert_eq!(v.get_u64(), Some(1));
}

#[test]
fn test_accessors() {
    let v = BitVector::partial(0b0001, 0b0100, 4);
    assert_eq!(v.at(0), BitState::One);
    assert_eq!(v.at(1), BitState::Zero);
    assert_eq!(v.at(2), BitState::Unknown);
    assert!(!v.is_known());
    assert!(v.is_valid());
    assert_eq!(v.get_u64(), None);
}

#[test]
fn test_all_one_all_zero() {
    assert!(BitVector::constant(0, 16).all_zero());
    assert!(BitVector::constant(0xFFFF, 16).all_one());
    assert!(!BitVector::partial(0, 1, 16).all_zero());
}
