//! Symbolic virtual machine.
//!
//! `VmInterface` factors the state surface (register file + memory) from the
//! instruction semantics; `execute_insn` dispatches one IR instruction onto
//! that surface using the descriptor's semantic operator plus hand-written
//! handlers for data movement, memory, control flow and the pinning pseudos.
//! `SymbolicVm` keeps the state as expressions and defers simplification
//! while an instruction is in flight.

use crate::arch::RegisterDesc;
use crate::errors::VmError;
use crate::expr::{ExprRef, UniqueId};
use crate::instruction::{ins, Instruction, Operand};
use crate::memory::{DefaultPolicy, Memory};
use crate::pointer::Pointer;
use crate::variable::Variable;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static UNDEF_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh value with no identity, used when semantics cannot be tracked.
pub fn make_undefined(bit_count: u32) -> ExprRef {
    let n = UNDEF_COUNTER.fetch_add(1, Ordering::Relaxed);
    ExprRef::var(UniqueId::named(&format!("UD{n}")), bit_count)
}

/// State surface the instruction semantics run against.
pub trait VmInterface {
    /// Reads the given register slice.
    fn read_register(&mut self, desc: &RegisterDesc) -> ExprRef;
    /// Writes the given register slice.
    fn write_register(&mut self, desc: &RegisterDesc, value: ExprRef);
    /// Reads `byte_count` bytes from the address expression, `None` when the
    /// memory model cannot answer.
    fn read_memory(&mut self, pointer: &ExprRef, byte_count: u32) -> Option<ExprRef>;
    /// Writes the value to the address expression.
    fn write_memory(&mut self, pointer: &ExprRef, value: ExprRef) -> bool;

    /// Executes a single instruction against this state.
    fn execute(&mut self, insn: &Instruction) -> Result<(), VmError> {
        execute_insn(self, insn)
    }

    /// Executes a straight-line slice of instructions. An instruction with
    /// no symbolic semantics makes the locations it writes undefined instead
    /// of failing, keeping the rest of the block executable.
    fn run(&mut self, instructions: &[Instruction]) -> Result<(), VmError>
    where
        Self: Sized,
    {
        for insn in instructions {
            if self.execute(insn).is_err() {
                for (i, ty) in insn.base.operand_types.iter().enumerate() {
                    if ty.is_write() {
                        let reg = *insn.operands[i].reg();
                        self.write_register(&reg, make_undefined(reg.bit_count));
                    }
                }
                if insn.base.writes_memory() {
                    if let Some((base, offset)) = insn.memory_location() {
                        let ptr = self.read_register(&base) + offset;
                        let bits = if insn.access_size() != 0 {
                            insn.access_size()
                        } else {
                            64
                        };
                        self.write_memory(&ptr, make_undefined(bits));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Converts operand `i` of the instruction into an expression. Reads of the
/// stack pointer include the instruction's current stack displacement.
fn cvt_operand<T: VmInterface + ?Sized>(vm: &mut T, insn: &Instruction, i: usize) -> ExprRef {
    match &insn.operands[i] {
        Operand::Reg(reg) => {
            let mut result = vm.read_register(reg);
            if reg.is_stack_pointer() && insn.sp_offset != 0 {
                result = result + insn.sp_offset;
            }
            result
        }
        Operand::Imm(imm) => ExprRef::constant(imm.i64(), imm.bit_count),
    }
}

/// Default dispatch of one instruction onto a state surface.
pub fn execute_insn<T: VmInterface + ?Sized>(vm: &mut T, insn: &Instruction) -> Result<(), VmError> {
    let base = insn.base;

    // MOV and MOVSX.
    if std::ptr::eq(base, &ins::MOV) || std::ptr::eq(base, &ins::MOVSX) {
        let cast_signed = std::ptr::eq(base, &ins::MOVSX);
        let dst = *insn.operands[0].reg();
        let value = cvt_operand(vm, insn, 1).resized(dst.bit_count, cast_signed);
        vm.write_register(&dst, value);
        return Ok(());
    }

    // LDD: read through the raw base register, skipping the SP adjustment.
    if std::ptr::eq(base, &ins::LDD) {
        let (mem_base, offset) = insn.memory_location().unwrap();
        let dst = *insn.operands[0].reg();
        let address = vm.read_register(&mem_base) + offset;
        let value = vm
            .read_memory(&address, dst.bit_count.div_ceil(8))
            .unwrap_or_else(|| make_undefined(dst.bit_count));
        vm.write_register(&dst, value);
        return Ok(());
    }

    // STR: byte-align the source and write through the raw base register.
    if std::ptr::eq(base, &ins::STR) {
        let (mem_base, offset) = insn.memory_location().unwrap();
        let src = cvt_operand(vm, insn, 2);
        let src = src.resized((src.size() + 7) & !7, false);
        let address = vm.read_register(&mem_base) + offset;
        vm.write_memory(&address, src);
        return Ok(());
    }

    // Arithmetic, bitwise and conditional instructions dispatch through the
    // semantic operator of the descriptor.
    if let Some(op) = base.symbolic_operator {
        let result = if base.operand_count() == 1 {
            // X = F(X)
            ExprRef::unary(op, cvt_operand(vm, insn, 0))
        } else if base.operand_count() == 2 {
            // X = F(X, Y)
            ExprRef::binary(cvt_operand(vm, insn, 0), op, cvt_operand(vm, insn, 1))
        } else if base.operand_types[0] == crate::instruction::OperandType::Write {
            // X = F(Y, Z)
            ExprRef::binary(cvt_operand(vm, insn, 1), op, cvt_operand(vm, insn, 2))
        } else {
            // X = F(Y:X, Z), the divisor family taking a dividend pair.
            let op1_high = cvt_operand(vm, insn, 1);
            if op1_high.get_u64() == Some(0) {
                ExprRef::binary(cvt_operand(vm, insn, 0), op, cvt_operand(vm, insn, 2))
            } else if insn.operands[0].bit_count() + insn.operands[1].bit_count() <= 64 {
                let op1_low = cvt_operand(vm, insn, 0);
                let combined = op1_high.size() + op1_low.size();
                let shifted = op1_high.resized(combined, false) << op1_low.size() as i64;
                let pair = op1_low.resized(combined, false) | shifted;
                ExprRef::binary(pair, op, cvt_operand(vm, insn, 2))
            } else {
                return Err(VmError::WideArithmetic(insn.vip));
            }
        };
        let dst = *insn.operands[0].reg();
        vm.write_register(&dst, result);
        return Ok(());
    }

    // Control flow is observable-only; the state is unaffected.
    if base.is_branching() {
        return Ok(());
    }

    // Pinning pseudos: a write pin makes the pinned location externally
    // observable and thus unconstrained afterwards; read pins do nothing to
    // the state.
    if std::ptr::eq(base, &ins::VPINW) {
        let dst = *insn.operands[0].reg();
        vm.write_register(&dst, make_undefined(dst.bit_count));
        return Ok(());
    }
    if std::ptr::eq(base, &ins::VPINWM) {
        let (mem_base, offset) = insn.memory_location().unwrap();
        let address = vm.read_register(&mem_base) + offset;
        vm.write_memory(&address, make_undefined(64));
        return Ok(());
    }
    if std::ptr::eq(base, &ins::VPINR) || std::ptr::eq(base, &ins::VPINRM) {
        return Ok(());
    }

    if std::ptr::eq(base, &ins::NOP) {
        return Ok(());
    }

    // Raw opcode passthrough and anything else without semantics.
    Err(VmError::Unsupported(base.name))
}

/// Symbolic machine state: a register file of expressions plus a memory
/// sinkhole.
#[derive(Debug, Default)]
pub struct SymbolicVm {
    pub register_state: FxHashMap<RegisterDesc, ExprRef>,
    pub memory_state: Memory,
    /// While set, freshly constructed expressions defer simplification.
    pub lazy_io: bool,
}

impl SymbolicVm {
    pub fn new() -> SymbolicVm {
        SymbolicVm {
            register_state: FxHashMap::default(),
            memory_state: Memory::new(DefaultPolicy::Free),
            lazy_io: false,
        }
    }

    pub fn with_memory(memory: Memory) -> SymbolicVm {
        SymbolicVm {
            register_state: FxHashMap::default(),
            memory_state: memory,
            lazy_io: false,
        }
    }

    /// Normalized full-width descriptor backing a slice.
    fn full_register(desc: &RegisterDesc) -> RegisterDesc {
        RegisterDesc {
            flags: desc.flags,
            local_id: desc.local_id,
            bit_count: 64,
            bit_offset: 0,
            architecture: desc.architecture,
        }
    }

    pub fn reset(&mut self) {
        self.register_state.clear();
        self.memory_state = Memory::new(self.memory_state.policy);
    }
}

impl VmInterface for SymbolicVm {
    fn read_register(&mut self, desc: &RegisterDesc) -> ExprRef {
        let full = Self::full_register(desc);
        let mut exp = match self.register_state.get(&full) {
            Some(e) => e.clone(),
            None => Variable::free_reg(full).to_expression(),
        };
        if self.lazy_io {
            exp = exp.make_lazy();
        }
        if desc.bit_offset != 0 {
            exp = exp >> desc.bit_offset as i64;
        }
        let exp = exp.resized(desc.bit_count, false);
        if self.lazy_io {
            exp
        } else {
            exp.simplified(false)
        }
    }

    fn write_register(&mut self, desc: &RegisterDesc, value: ExprRef) {
        let full = Self::full_register(desc);
        if desc.bit_count == full.bit_count && desc.bit_offset == 0 {
            self.register_state.insert(full, value.resized(64, false));
            return;
        }
        // Read-modify-write of the surrounding bits.
        let old = match self.register_state.get(&full) {
            Some(e) => e.clone(),
            None => Variable::free_reg(full).to_expression(),
        };
        let placed = value.resized(desc.bit_count, false).resized(64, false)
            << desc.bit_offset as i64;
        let merged = (old & ExprRef::constant_u(!desc.mask(), 64)) | placed;
        self.register_state.insert(full, merged);
    }

    fn read_memory(&mut self, pointer: &ExprRef, byte_count: u32) -> Option<ExprRef> {
        let ptr = Pointer::new(pointer);
        let exp = self.memory_state.read(&ptr, byte_count * 8).ok()?;
        Some(if self.lazy_io {
            exp.make_lazy()
        } else {
            exp.simplified(false)
        })
    }

    fn write_memory(&mut self, pointer: &ExprRef, value: ExprRef) -> bool {
        let ptr = Pointer::new(pointer);
        let value = value.resized((value.size() + 7) & !7, false);
        self.memory_state.write(&ptr, value).is_ok()
    }

    /// Execution of one instruction runs with the lazy flag set, amortizing
    /// simplifier work until the state is read back.
    fn execute(&mut self, insn: &Instruction) -> Result<(), VmError> {
        let old = std::mem::replace(&mut self.lazy_io, true);
        let result = execute_insn(self, insn);
        self.lazy_io = old;
        result
    }
}
