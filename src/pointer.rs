//! Symbolic pointers.
//!
//! A pointer wraps the symbolic expression of a virtual address together
//! with a flag set recording which restricted bases (stack pointer, image
//! base) occur in it, and a small array of xvalues: 64-bit fingerprints of
//! the base under the fixed keyed evaluations, used as a cheap inequality
//! filter when deciding whether two pointers may alias.

use crate::arch::RegisterFlags;
use crate::expr::{ExprRef, XVALUE_KEYS};
use std::fmt;

/// Flags that mark a register as a restricted pointer base.
fn restricted_base_flags() -> RegisterFlags {
    RegisterFlags::STACK_POINTER | RegisterFlags::IMAGE_BASE
}

/// Symbolic pointer value.
#[derive(Debug, Clone)]
pub struct Pointer {
    /// Address expression; must not be mutated without recomputing xvalues.
    pub base: ExprRef,
    /// Restricted register classes present in the base.
    pub flags: RegisterFlags,
    pub xvalues: [u64; XVALUE_KEYS.len()],
}

impl Pointer {
    /// Constructs from a symbolic expression, scanning the leaves for
    /// restricted bases.
    pub fn new(base: &ExprRef) -> Pointer {
        let base = base.simplified(false);
        let mut flags = RegisterFlags::empty();
        base.for_each(&mut |e| {
            if let Some(uid) = &e.uid {
                if let Some(var) = uid.as_variable() {
                    if let Some(reg) = var.as_register() {
                        flags |= reg.flags & restricted_base_flags();
                    }
                }
            }
        });
        let xvalues = base.xvalues();
        Pointer {
            base,
            flags,
            xvalues,
        }
    }

    /// Pointer displaced by a constant number of bytes.
    pub fn offset(&self, dst: i64) -> Pointer {
        let mut copy = self.clone();
        copy.base = &self.base + dst;
        for x in copy.xvalues.iter_mut() {
            *x = x.wrapping_add(dst as u64);
        }
        copy
    }

    /// Distance between two pointers as an optional constant; the xvalue
    /// arrays must agree on the delta before the bases are probed.
    pub fn sub(&self, o: &Pointer) -> Option<i64> {
        let delta = self.xvalues[0].wrapping_sub(o.xvalues[0]);
        for n in 1..self.xvalues.len() {
            if self.xvalues[n].wrapping_sub(o.xvalues[n]) != delta {
                return None;
            }
        }
        (&self.base - &o.base).get_i64()
    }

    /// Whether the two pointers can name the same destination. Note that
    /// `[sp+8]` and `[sp+16]` "can overlap" here; displacement against the
    /// access size decides actual overlap.
    pub fn can_overlap(&self, o: &Pointer) -> bool {
        (self.flags & o.flags) == self.flags || (self.flags & o.flags) == o.flags
    }

    /// Same as `can_overlap` but fails when the flag sets differ.
    pub fn can_overlap_strict(&self, o: &Pointer) -> bool {
        (self.flags & o.flags) == self.flags && (self.flags & o.flags) == o.flags
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.xvalues == other.xvalues && self.base.is_identical(&other.base)
    }
}
impl Eq for Pointer {}

impl std::hash::Hash for Pointer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(crate::expr::Expr::hash(&self.base));
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_distance() {
        let base = ExprRef::variable("p", 64);
        let a = Pointer::new(&(&base + 8));
        let b = Pointer::new(&(&base + 24));
        assert_eq!(b.sub(&a), Some(16));
        assert_eq!(a.sub(&b), Some(-16));
    }

    #[test]
    fn test_offset() {
        let base = ExprRef::variable("p", 64);
        let a = Pointer::new(&base);
        let b = a.offset(8);
        assert_eq!(b.sub(&a), Some(8));
    }

    #[test]
    fn test_unrelated_pointers() {
        let p = Pointer::new(&ExprRef::variable("p", 64));
        let q = Pointer::new(&ExprRef::variable("q", 64));
        assert_eq!(p.sub(&q), None);
        // Same (empty) flag class: may overlap.
        assert!(p.can_overlap(&q));
    }

    #[test]
    fn test_xvalues_filter_shifted() {
        let base = ExprRef::variable("p", 64);
        let a = Pointer::new(&base);
        let b = Pointer::new(&((&base * 2) + 1));
        // Distance is not a constant; the filter must reject it.
        assert_eq!(a.sub(&b), None);
    }
}
