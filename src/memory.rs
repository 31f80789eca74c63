//! Symbolic memory sinkhole.
//!
//! Memory is a write-log: an ordered sequence of (pointer, value) records.
//! A read walks the log backward, collecting fragments from overlapping
//! writes and synthesizing default values for uncovered ranges, then builds
//! the final value as the bitwise-or of the left-shifted fragments. Entries
//! never overlap each other; writes split and trim older records.

use crate::core::masks::{fill, fill_at, lsb};
use crate::errors::MemoryError;
use crate::expr::{ExprRef, UniqueId};
use crate::pointer::Pointer;
use crate::variable::Variable;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte displacement to a clamped bit displacement; anything past the word
/// is equivalent to "far away" for mask purposes.
fn bit_distance(byte_distance: i64) -> i32 {
    byte_distance.saturating_mul(8).clamp(-64, 64) as i32
}

/// How reads of bytes the log does not cover are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultPolicy {
    /// Synthesize a fresh memory-indexed variable.
    #[default]
    Free,
    /// Synthesize an undefined value with no identity.
    Relaxed,
    /// Fail the read.
    Strict,
}

static UNDEF_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write-log-backed symbolic memory.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    store: Vec<(Pointer, ExprRef)>,
    pub policy: DefaultPolicy,
}

impl Memory {
    pub fn new(policy: DefaultPolicy) -> Memory {
        Memory {
            store: Vec::new(),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Iterates the write log in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Pointer, &ExprRef)> {
        self.store.iter().map(|(p, v)| (p, v))
    }

    fn make_default(&self, ptr: &Pointer, byte_offset: i64, bits: u32) -> Result<ExprRef, MemoryError> {
        match self.policy {
            DefaultPolicy::Free => {
                let var = Variable::free_mem(ptr.offset(byte_offset), bits);
                Ok(var.to_expression())
            }
            DefaultPolicy::Relaxed => {
                let n = UNDEF_COUNTER.fetch_add(1, Ordering::Relaxed);
                Ok(ExprRef::var(UniqueId::named(&format!("UD{n}")), bits))
            }
            DefaultPolicy::Strict => Err(MemoryError::StrictMiss {
                offset: byte_offset,
                bit_count: bits,
            }),
        }
    }

    /// Mask of bits of the region that the write log covers; `None` when
    /// aliasing cannot be decided.
    pub fn known_mask(&self, ptr: &Pointer, size: u32) -> Option<u64> {
        let mut mask_pending = fill(size);
        for (p, v) in self.store.iter().rev() {
            if mask_pending == 0 {
                break;
            }
            if !p.can_overlap(ptr) {
                continue;
            }
            let byte_distance = p.sub(ptr)?;
            let relative_mask = fill_at(v.size(), bit_distance(byte_distance));
            mask_pending &= !relative_mask;
        }
        Some(fill(size) & !mask_pending)
    }

    /// Reads `size` bits from the pointer.
    pub fn read(&self, ptr: &Pointer, size: u32) -> Result<ExprRef, MemoryError> {
        let mut mask_pending = fill(size);
        let mut merge_list: Vec<(i32, ExprRef)> = Vec::new();

        for (p, v) in self.store.iter().rev() {
            if mask_pending == 0 {
                break;
            }
            if !p.can_overlap(ptr) {
                continue;
            }
            let Some(byte_distance) = p.sub(ptr) else {
                // Alias failure: strict mode reports it, otherwise the whole
                // read degrades to the default value.
                if self.policy == DefaultPolicy::Strict {
                    return Err(MemoryError::AliasFailure);
                }
                merge_list.clear();
                mask_pending = fill(size);
                break;
            };
            let bit_distance = bit_distance(byte_distance);
            let relative_mask = fill_at(v.size(), bit_distance);
            if relative_mask & mask_pending == 0 {
                continue;
            }
            merge_list.push((bit_distance, v.clone()));
            mask_pending &= !relative_mask;
        }

        // Extract the slice of a stored value that lands in our window.
        let select = |value: &ExprRef, offset: i32| -> ExprRef {
            if offset < 0 {
                (value >> (-offset) as i64).resized(size, false)
            } else if offset > 0 {
                value.resized(size, false) << offset as i64
            } else {
                value.resized(size, false)
            }
        };

        // Fast path: a single covering record.
        if mask_pending == 0 && merge_list.len() == 1 {
            let (dst, value) = &merge_list[0];
            return Ok(select(value, *dst));
        }

        // Merge fragments, filling uncovered runs from the default factory.
        let mut result: Option<ExprRef> = None;
        let mut or_into = |e: ExprRef| {
            result = Some(match result.take() {
                Some(acc) => acc | e,
                None => e,
            });
        };

        for (dst, value) in &merge_list {
            or_into(select(value, *dst));
        }

        // Uncovered bit runs, lowest first.
        let mut pending = mask_pending;
        while pending != 0 {
            let start = lsb(pending) - 1;
            let mut len = 0;
            while start + len < size && (pending >> (start + len)) & 1 != 0 {
                len += 1;
            }
            pending &= !fill_at(len, start as i32);

            let default = self.make_default(ptr, (start / 8) as i64, len)?;
            let placed = if start == 0 {
                default.resized(size, false)
            } else {
                default.resized(size, false) << start as i64
            };
            or_into(placed);
        }

        Ok(result.unwrap_or_else(|| ExprRef::constant(0, size)))
    }

    /// Appends a write, splitting and trimming any overlapped older record.
    pub fn write(&mut self, ptr: &Pointer, value: ExprRef) -> Result<(), MemoryError> {
        debug_assert!(value.size() % 8 == 0, "memory writes are byte-aligned");
        let size = value.size();
        let mut mask_pending = fill(size);
        let mut acquisition: Vec<(i32, usize)> = Vec::new();

        for idx in (0..self.store.len()).rev() {
            if mask_pending == 0 {
                break;
            }
            let (p, v) = &self.store[idx];
            if !p.can_overlap(ptr) {
                continue;
            }
            let Some(byte_distance) = p.sub(ptr) else {
                if self.policy == DefaultPolicy::Strict {
                    return Err(MemoryError::AliasFailure);
                }
                // Overlaps cannot be determined; append at the end as is.
                acquisition.clear();
                break;
            };
            let bit_distance = bit_distance(byte_distance);
            let relative_mask = fill_at(v.size(), bit_distance);
            if relative_mask & mask_pending == 0 {
                continue;
            }
            acquisition.push((bit_distance, idx));
            mask_pending &= !relative_mask;
        }

        // Indices were collected in descending order, so structural edits at
        // an index leave the not-yet-processed (smaller) ones stable.
        for (dst, idx) in acquisition {
            let entry_size = self.store[idx].1.size() as i32;
            if dst >= 0 {
                // Low bits of the record start at or above our pointer.
                let strip_low = size as i32 - dst;
                let new_size = entry_size - strip_low;
                if new_size <= 0 {
                    self.store.remove(idx);
                    continue;
                }
                let (p, v) = &self.store[idx];
                let p2 = p.offset((strip_low / 8) as i64);
                let v2 = (v >> strip_low as i64).resized(new_size as u32, false);
                self.store[idx] = (p2, v2);
            } else if (size as i32 - dst) >= entry_size {
                // High bits of the record end before or at our region limit.
                let (p, v) = &self.store[idx];
                let trimmed = v.resized((-dst) as u32, false);
                self.store[idx] = (p.clone(), trimmed);
            } else {
                // The write splits the record in two.
                let low_size = -dst;
                let high_offset = low_size + size as i32;
                let high_size = entry_size - high_offset;
                let (p, v) = &self.store[idx];
                let high_ptr = p.offset((high_offset / 8) as i64);
                let high_val = (v >> high_offset as i64).resized(high_size as u32, false);
                let low_val = v.resized(low_size as u32, false);
                let low_ptr = p.clone();
                self.store[idx] = (low_ptr, low_val);
                self.store.insert(idx, (high_ptr, high_val));
            }
        }

        self.store.push((ptr.clone(), value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprRef;

    fn sp_ptr(off: i64) -> Pointer {
        let base = ExprRef::variable("sp", 64);
        Pointer::new(&(&base + off))
    }

    #[test]
    fn test_read_after_write() {
        let mut mem = Memory::new(DefaultPolicy::Free);
        let v = ExprRef::variable("v", 64);
        mem.write(&sp_ptr(0), v.clone()).unwrap();
        let r = mem.read(&sp_ptr(0), 64).unwrap();
        assert!(r.is_identical(&v));
    }

    #[test]
    fn test_read_offset_slice() {
        let mut mem = Memory::new(DefaultPolicy::Free);
        mem.write(&sp_ptr(0), ExprRef::constant(0x1122334455667788, 64))
            .unwrap();
        // Bytes 1..5 of the little-endian value.
        let r = mem.read(&sp_ptr(1), 32).unwrap();
        assert_eq!(r.get_u64(), Some(0x44556677));
    }

    #[test]
    fn test_overwrite() {
        let mut mem = Memory::new(DefaultPolicy::Free);
        mem.write(&sp_ptr(0), ExprRef::constant(0x11, 8)).unwrap();
        mem.write(&sp_ptr(0), ExprRef::constant(0x22, 8)).unwrap();
        let r = mem.read(&sp_ptr(0), 8).unwrap();
        assert_eq!(r.get_u64(), Some(0x22));
    }

    #[test]
    fn test_partial_overwrite_merge() {
        let mut mem = Memory::new(DefaultPolicy::Free);
        mem.write(&sp_ptr(0), ExprRef::constant(0x1111, 16)).unwrap();
        mem.write(&sp_ptr(0), ExprRef::constant(0x22, 8)).unwrap();
        let r = mem.read(&sp_ptr(0), 16).unwrap();
        assert_eq!(r.get_u64(), Some(0x1122));
    }

    #[test]
    fn test_strict_miss() {
        let mem = Memory::new(DefaultPolicy::Strict);
        let err = mem.read(&sp_ptr(0), 64).unwrap_err();
        assert!(matches!(err, MemoryError::StrictMiss { .. }));
    }

    #[test]
    fn test_free_default_is_stable() {
        let mem = Memory::new(DefaultPolicy::Free);
        let a = mem.read(&sp_ptr(8), 64).unwrap();
        let b = mem.read(&sp_ptr(8), 64).unwrap();
        // The same uncovered cell reads as the same variable.
        assert!(a.is_identical(&b));
    }

    #[test]
    fn test_known_mask() {
        let mut mem = Memory::new(DefaultPolicy::Free);
        mem.write(&sp_ptr(0), ExprRef::constant(0xAA, 8)).unwrap();
        assert_eq!(mem.known_mask(&sp_ptr(0), 16), Some(0x00FF));
    }

    #[test]
    fn test_disjoint_writes_kept() {
        let mut mem = Memory::new(DefaultPolicy::Free);
        mem.write(&sp_ptr(0), ExprRef::constant(0x11, 8)).unwrap();
        mem.write(&sp_ptr(8), ExprRef::constant(0x22, 8)).unwrap();
        assert_eq!(mem.len(), 2);
        assert_eq!(mem.read(&sp_ptr(0), 8).unwrap().get_u64(), Some(0x11));
        assert_eq!(mem.read(&sp_ptr(8), 8).unwrap().get_u64(), Some(0x22));
    }
}
