//! Pseudo-SSA variables.
//!
//! A variable describes the state of a register slice or a memory cell at a
//! given index into a block's instruction stream. The tracer resolves the
//! symbolic value of a variable; until then it stands for itself as an
//! expression leaf.

use crate::arch::{RegisterDesc, RegisterFlags};
use crate::expr::{hash_combine, hash_u64, ExprRef, UniqueId};
use crate::instruction::{ins, Instruction, Vip};
use crate::pointer::Pointer;
use crate::routine::Routine;
use std::fmt;

/// Position a variable is read at: immediately before the instruction at
/// `index` inside the block entered at `block`. `index == len` anchors at
/// the end of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarAnchor {
    pub block: Vip,
    pub index: usize,
}

impl VarAnchor {
    pub fn new(block: Vip, index: usize) -> Self {
        VarAnchor { block, index }
    }
    pub fn is_begin(&self) -> bool {
        self.index == 0
    }
}

/// Memory-backed variable: an absolute symbolic pointer plus an access width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemVar {
    pub base: Pointer,
    pub bit_count: u32,
}

/// Register- or memory-backed descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarDescriptor {
    Register(RegisterDesc),
    Memory(MemVar),
}

/// How an instruction accesses a variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessDetails {
    /// Offset of the access relative to the variable, in bits.
    pub bit_offset: i32,
    /// Number of bits accessed at that offset; zero means no access.
    pub bit_count: u32,
    pub read: bool,
    pub write: bool,
    /// The access may touch the variable but its shape is unresolvable.
    pub unknown: bool,
}

impl AccessDetails {
    pub fn accessed(&self) -> bool {
        self.bit_count != 0 || self.unknown
    }
    pub fn is_unknown(&self) -> bool {
        self.unknown
    }
}

/// A variable bound to a point in the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// Anchor; `None` marks a free-form variable not tracked in a block.
    pub at: Option<VarAnchor>,
    pub descriptor: VarDescriptor,
    /// Set when the value depends on the path taken into the anchor block.
    pub is_branch_dependent: bool,
}

impl Variable {
    pub fn reg_at(at: VarAnchor, reg: RegisterDesc) -> Variable {
        Variable {
            at: Some(at),
            descriptor: VarDescriptor::Register(reg),
            is_branch_dependent: false,
        }
    }

    pub fn mem_at(at: VarAnchor, base: Pointer, bit_count: u32) -> Variable {
        Variable {
            at: Some(at),
            descriptor: VarDescriptor::Memory(MemVar { base, bit_count }),
            is_branch_dependent: false,
        }
    }

    pub fn free_reg(reg: RegisterDesc) -> Variable {
        Variable {
            at: None,
            descriptor: VarDescriptor::Register(reg),
            is_branch_dependent: false,
        }
    }

    pub fn free_mem(base: Pointer, bit_count: u32) -> Variable {
        Variable {
            at: None,
            descriptor: VarDescriptor::Memory(MemVar { base, bit_count }),
            is_branch_dependent: false,
        }
    }

    pub fn is_register(&self) -> bool {
        matches!(self.descriptor, VarDescriptor::Register(_))
    }
    pub fn is_memory(&self) -> bool {
        matches!(self.descriptor, VarDescriptor::Memory(_))
    }

    pub fn as_register(&self) -> Option<&RegisterDesc> {
        match &self.descriptor {
            VarDescriptor::Register(r) => Some(r),
            VarDescriptor::Memory(_) => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemVar> {
        match &self.descriptor {
            VarDescriptor::Memory(m) => Some(m),
            VarDescriptor::Register(_) => None,
        }
    }

    pub fn bit_count(&self) -> u32 {
        match &self.descriptor {
            VarDescriptor::Register(r) => r.bit_count,
            VarDescriptor::Memory(m) => m.bit_count,
        }
    }

    /// Rebinds the anchor.
    pub fn bind(mut self, at: VarAnchor) -> Variable {
        self.at = Some(at);
        self
    }

    /// Stable hash used as the expression-level identifier.
    pub fn uid_hash(&self) -> u64 {
        let mut h = match &self.descriptor {
            VarDescriptor::Register(r) => hash_combine(
                hash_combine(r.flags.bits(), r.local_id),
                hash_combine(
                    ((r.bit_count as u64) << 32) | (r.bit_offset as u32 as u64),
                    r.architecture as u64,
                ),
            ),
            VarDescriptor::Memory(m) => {
                hash_combine(hash_u64(0x6D656D), hash_combine(m.base.base.hash(), m.bit_count as u64))
            }
        };
        if let Some(at) = &self.at {
            h = hash_combine(h, hash_combine(at.block, at.index as u64));
        }
        if self.is_branch_dependent {
            h = hash_u64(h ^ 0x6272);
        }
        h
    }

    /// Symbolic expression standing for this variable.
    pub fn to_expression(&self) -> ExprRef {
        let bits = self.bit_count();
        ExprRef::var(UniqueId::from_variable(self.clone()), bits)
    }

    /// Checks whether the instruction writes to this variable.
    /// `mem_ptr` carries the resolved pointer of the instruction's memory
    /// operand when the variable is memory-backed.
    pub fn written_by(
        &self,
        insn: &Instruction,
        mem_ptr: Option<&Pointer>,
        rtn: &Routine,
    ) -> AccessDetails {
        self.test_access(insn, mem_ptr, rtn, true, false)
    }

    /// Checks whether the instruction reads from this variable.
    pub fn read_by(
        &self,
        insn: &Instruction,
        mem_ptr: Option<&Pointer>,
        rtn: &Routine,
    ) -> AccessDetails {
        self.test_access(insn, mem_ptr, rtn, false, true)
    }

    /// Checks whether the instruction accesses this variable in any way.
    pub fn accessed_by(
        &self,
        insn: &Instruction,
        mem_ptr: Option<&Pointer>,
        rtn: &Routine,
    ) -> AccessDetails {
        self.test_access(insn, mem_ptr, rtn, false, false)
    }

    fn test_access(
        &self,
        insn: &Instruction,
        mem_ptr: Option<&Pointer>,
        rtn: &Routine,
        write: bool,
        read: bool,
    ) -> AccessDetails {
        debug_assert!(!(write && read));

        if let VarDescriptor::Register(reg) = &self.descriptor {
            for (i, op) in insn.operands.iter().enumerate() {
                let ty = insn.base.operand_types[i];
                let crate::instruction::Operand::Reg(ref_reg) = op else {
                    continue;
                };
                if write && !ty.is_write() {
                    continue;
                }
                if read && !ty.is_read() {
                    continue;
                }
                if !ref_reg.overlaps(reg) {
                    continue;
                }
                return AccessDetails {
                    bit_offset: ref_reg.bit_offset - reg.bit_offset,
                    bit_count: ref_reg.bit_count,
                    read: ty.is_read(),
                    write: ty.is_write(),
                    unknown: false,
                };
            }
        } else if let VarDescriptor::Memory(mem) = &self.descriptor {
            let touches = insn.base.accesses_memory()
                && (!write || insn.base.writes_memory())
                && (!read || insn.base.reads_memory());
            if touches {
                if let Some(ptr) = mem_ptr {
                    if ptr.can_overlap(&mem.base) {
                        match ptr.sub(&mem.base) {
                            None => {
                                return AccessDetails {
                                    bit_offset: 0,
                                    bit_count: mem.bit_count,
                                    read: insn.base.reads_memory(),
                                    write: insn.base.writes_memory(),
                                    unknown: true,
                                };
                            }
                            Some(byte_distance) => {
                                let low = byte_distance.saturating_mul(8).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                                let high = low + insn.access_size() as i32;
                                if low < mem.bit_count as i32 && high > 0 {
                                    return AccessDetails {
                                        bit_offset: low,
                                        bit_count: insn.access_size(),
                                        read: insn.base.reads_memory(),
                                        write: insn.base.writes_memory(),
                                        unknown: false,
                                    };
                                }
                            }
                        }
                    }
                }
            }
        }

        // Branches into real code read and clobber state according to the
        // calling convention of the site.
        if insn.base.is_branching_real() {
            return self.test_external_call(insn, rtn, write, read);
        }

        AccessDetails::default()
    }

    fn test_external_call(
        &self,
        insn: &Instruction,
        rtn: &Routine,
        write: bool,
        read: bool,
    ) -> AccessDetails {
        let cc = rtn.cconv(insn.vip);
        let is_exit = std::ptr::eq(insn.base, &ins::VEXIT);

        if let VarDescriptor::Register(reg) = &self.descriptor {
            // The stack pointer is read by any real branch.
            if reg.is_stack_pointer() {
                if write {
                    return AccessDetails::default();
                }
                return AccessDetails {
                    bit_offset: 0,
                    bit_count: reg.bit_count,
                    read: true,
                    write: false,
                    unknown: false,
                };
            }

            if is_exit {
                // Leaving virtualization: return values are read, the rest
                // of the virtual state is discarded.
                for retval in &rtn.routine_convention.retval_registers {
                    if retval.overlaps(reg) {
                        if write {
                            return AccessDetails::default();
                        }
                        return AccessDetails {
                            bit_offset: retval.bit_offset - reg.bit_offset,
                            bit_count: retval.bit_count,
                            read: true,
                            write: false,
                            unknown: false,
                        };
                    }
                }
                for vol in &rtn.routine_convention.volatile_registers {
                    if vol.overlaps(reg) {
                        if read {
                            return AccessDetails::default();
                        }
                        return AccessDetails {
                            bit_offset: 0,
                            bit_count: reg.bit_count,
                            read: false,
                            write: true,
                            unknown: false,
                        };
                    }
                }
                if reg.is_virtual() {
                    if read {
                        return AccessDetails::default();
                    }
                    return AccessDetails {
                        bit_offset: 0,
                        bit_count: reg.bit_count,
                        read: false,
                        write: true,
                        unknown: false,
                    };
                }
                if write {
                    return AccessDetails::default();
                }
                return AccessDetails {
                    bit_offset: 0,
                    bit_count: reg.bit_count,
                    read: true,
                    write: false,
                    unknown: false,
                };
            }

            // External call: volatile and return-value registers are
            // clobbered, parameter registers are read.
            let mut details = AccessDetails::default();
            if !read {
                for r in cc.volatile_registers.iter().chain(&cc.retval_registers) {
                    if r.overlaps(reg) {
                        details.bit_offset = r.bit_offset - reg.bit_offset;
                        details.bit_count = r.bit_count;
                        details.write = true;
                        break;
                    }
                }
            }
            if !write {
                for r in &cc.param_registers {
                    if r.overlaps(reg) {
                        if details.accessed() {
                            details.bit_offset = details.bit_offset.min(r.bit_offset - reg.bit_offset);
                            details.bit_count = details.bit_count.max(r.bit_count);
                        } else {
                            details.bit_offset = r.bit_offset - reg.bit_offset;
                            details.bit_count = r.bit_count;
                        }
                        details.read = true;
                        break;
                    }
                }
            }
            return details;
        }

        // Memory cannot be reasoned about across an external call.
        AccessDetails {
            bit_offset: 0,
            bit_count: self.bit_count(),
            read: true,
            write: true,
            unknown: true,
        }
    }
}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.uid_hash());
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.descriptor {
            VarDescriptor::Register(r) => write!(f, "{r}")?,
            VarDescriptor::Memory(m) => write!(f, "[{}]:{}", m.base, m.bit_count)?,
        }
        if let Some(at) = &self.at {
            write!(f, "#{:x}.{}", at.block, at.index)?;
        }
        if self.is_branch_dependent {
            write!(f, "?")?;
        }
        Ok(())
    }
}

/// Helper flag set marking registers whose reads cannot be traced past.
pub fn is_tracing_opaque(reg: &RegisterDesc) -> bool {
    reg.flags
        .intersects(RegisterFlags::VOLATILE | RegisterFlags::READONLY)
}

/// Re-assembles shifted and truncated whole-register reads into slice
/// variables, turning `__ucast(reg >> k, n)` back into `reg@k:n`. Purely a
/// readability transform over tracer output.
pub fn pack_all(exp: &ExprRef) -> ExprRef {
    use crate::core::operators::Op;

    fn try_pack(exp: &ExprRef) -> Option<ExprRef> {
        if exp.op != Op::Ucast {
            return None;
        }
        let lhs = exp.lhs.as_ref().unwrap();
        let new_size = exp.size();

        let (source, offset) = if lhs.op == Op::ShiftRight {
            let count = lhs.rhs.as_ref().unwrap().get_u64()?;
            if count >= 64 {
                return None;
            }
            (lhs.lhs.as_ref().unwrap(), count as i32)
        } else {
            (lhs, 0)
        };

        let var = source.uid.as_ref()?.as_variable()?;
        let reg = *var.as_register()?;
        if offset as u32 + new_size > reg.bit_count {
            return None;
        }
        if offset == 0 && new_size == reg.bit_count {
            return Some(source.clone());
        }
        let mut packed = var.clone();
        packed.descriptor = VarDescriptor::Register(reg.select(new_size, reg.bit_offset + offset));
        Some(packed.to_expression())
    }

    fn walk(exp: &ExprRef) -> Option<ExprRef> {
        let new_lhs = exp.lhs.as_ref().and_then(walk);
        let new_rhs = exp.rhs.as_ref().and_then(walk);
        let rebuilt = if new_lhs.is_some() || new_rhs.is_some() {
            let rhs = new_rhs.unwrap_or_else(|| exp.rhs.as_ref().unwrap().clone());
            Some(if exp.op.operand_count() == 1 {
                ExprRef::build_unary(exp.op, rhs)
            } else {
                let lhs = new_lhs.unwrap_or_else(|| exp.lhs.as_ref().unwrap().clone());
                ExprRef::build_binary(lhs, exp.op, rhs)
            })
        } else {
            None
        };
        let target = rebuilt.as_ref().unwrap_or(exp);
        try_pack(target).or(rebuilt)
    }

    walk(exp).unwrap_or_else(|| exp.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::RegisterDesc;
    use crate::instruction::{Instruction, Operand};

    #[test]
    fn test_register_written_by() {
        let rtn = Routine::new(crate::arch::ArchitectureId::Virtual, 0);
        let r = RegisterDesc::virt(1, 64);
        let insn = Instruction::new(&ins::MOV, vec![r.into(), Operand::imm(5, 64)]).unwrap();
        let var = Variable::free_reg(r);
        let details = var.written_by(&insn, None, &rtn);
        assert!(details.accessed());
        assert!(details.write);
        assert_eq!(details.bit_offset, 0);

        // A different register is untouched.
        let other = Variable::free_reg(RegisterDesc::virt(2, 64));
        assert!(!other.written_by(&insn, None, &rtn).accessed());
    }

    #[test]
    fn test_slice_offsets() {
        let rtn = Routine::new(crate::arch::ArchitectureId::Virtual, 0);
        let full = RegisterDesc::virt(1, 64);
        let high8 = full.select(8, 8);
        let insn = Instruction::new(&ins::MOV, vec![high8.into(), Operand::imm(5, 8)]).unwrap();
        let var = Variable::free_reg(full);
        let details = var.written_by(&insn, None, &rtn);
        assert!(details.accessed());
        assert_eq!(details.bit_offset, 8);
        assert_eq!(details.bit_count, 8);
    }

    #[test]
    fn test_memory_overlap() {
        let rtn = Routine::new(crate::arch::ArchitectureId::Virtual, 0);
        let base = RegisterDesc::virt(1, 64);
        let src = RegisterDesc::virt(2, 64);
        let insn = Instruction::new(
            &ins::STR,
            vec![base.into(), Operand::imm(0, 64), src.into()],
        )
        .unwrap();

        let ptr = Pointer::new(&Variable::free_reg(base).to_expression());
        let var = Variable::free_mem(ptr.clone(), 64);
        let details = var.written_by(&insn, Some(&ptr), &rtn);
        assert!(details.accessed());
        assert!(details.write);
        assert_eq!(details.bit_offset, 0);

        // Disjoint cell 64 bytes away.
        let far = Variable::free_mem(ptr.offset(64), 64);
        assert!(!far.written_by(&insn, Some(&ptr), &rtn).accessed());
    }

    #[test]
    fn test_pack_all() {
        let full = RegisterDesc::virt(1, 64);
        let var = Variable::free_reg(full).to_expression();
        // __ucast(vr1 >> 8, 8) packs into vr1@8:8.
        let sliced = (var >> 8).ucast(8);
        let packed = pack_all(&sliced);
        assert!(packed.is_variable(), "{packed}");
        let reg = *packed
            .uid
            .as_ref()
            .unwrap()
            .as_variable()
            .unwrap()
            .as_register()
            .unwrap();
        assert_eq!(reg.bit_offset, 8);
        assert_eq!(reg.bit_count, 8);
    }

    #[test]
    fn test_uid_hash_stable() {
        let r = RegisterDesc::virt(7, 32);
        let a = Variable::reg_at(VarAnchor::new(0x1000, 3), r);
        let b = Variable::reg_at(VarAnchor::new(0x1000, 3), r);
        assert_eq!(a.uid_hash(), b.uid_hash());
        let c = Variable::reg_at(VarAnchor::new(0x1000, 4), r);
        assert_ne!(a.uid_hash(), c.uid_hash());
    }
}
