//! Basic blocks.
//!
//! A basic block is a maximal straight-line sequence of IR instructions with
//! one entry and one or more terminators. Blocks are owned exclusively by
//! their routine and refer to each other by entry VIP, which breaks the
//! ownership cycles a looping control-flow graph would otherwise create.

use crate::arch::RegisterDesc;
use crate::errors::InstructionError;
use crate::instruction::{ins, Instruction, Operand, Vip};

/// A basic block of the routine control-flow graph.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Identity of the block.
    pub entry_vip: Vip,
    /// Stack pointer offset at entry.
    pub sp_offset: i64,
    /// Stack instance index at entry.
    pub sp_index: u32,
    /// Last block-local temporary allocated.
    pub last_temporary_index: u32,
    pub instructions: Vec<Instruction>,
    /// Predecessor block entry points.
    pub prev: Vec<Vip>,
    /// Successor block entry points.
    pub next: Vec<Vip>,

    /// VIP tagged onto the next emplaced instruction.
    label: Vip,
}

impl PartialEq for BasicBlock {
    fn eq(&self, other: &Self) -> bool {
        // The pending label is emission state, not block identity.
        self.entry_vip == other.entry_vip
            && self.sp_offset == other.sp_offset
            && self.sp_index == other.sp_index
            && self.last_temporary_index == other.last_temporary_index
            && self.instructions == other.instructions
            && self.prev == other.prev
            && self.next == other.next
    }
}
impl Eq for BasicBlock {}

impl BasicBlock {
    pub fn new(entry_vip: Vip) -> BasicBlock {
        BasicBlock {
            entry_vip,
            sp_offset: 0,
            sp_index: 0,
            last_temporary_index: 0,
            instructions: Vec::new(),
            prev: Vec::new(),
            next: Vec::new(),
            label: entry_vip,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Whether the block ends in a terminator.
    pub fn is_complete(&self) -> bool {
        self.instructions
            .last()
            .is_some_and(|i| i.base.is_branching())
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.base.is_branching())
    }

    /// Sets the VIP stamped onto subsequently emplaced instructions.
    pub fn label_begin(&mut self, vip: Vip) {
        self.label = vip;
    }

    /// Allocates a block-local temporary register.
    pub fn tmp(&mut self, bit_count: u32) -> RegisterDesc {
        self.last_temporary_index += 1;
        RegisterDesc::local(
            ((self.entry_vip & 0xFFFF_FFFF) << 16) | self.last_temporary_index as u64,
            bit_count,
        )
    }

    /// Emplaces a validated instruction at the end of the block, stamping
    /// the current label and stack-pointer state.
    pub fn push(&mut self, mut insn: Instruction) -> Result<&mut Self, InstructionError> {
        insn.validate()?;
        insn.vip = self.label;
        insn.sp_offset = self.sp_offset;
        insn.sp_index = self.sp_index;
        self.instructions.push(insn);
        Ok(self)
    }

    /// Shifts the stack pointer tracked by the block.
    pub fn shift_sp(&mut self, offset: i64) -> &mut Self {
        self.sp_offset += offset;
        self
    }

    // -- Typed emplacement helpers -----------------------------------------

    fn emit(
        &mut self,
        base: &'static crate::instruction::InstructionDesc,
        operands: Vec<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.push(Instruction::new(base, operands)?)
    }

    pub fn mov(
        &mut self,
        dst: RegisterDesc,
        src: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::MOV, vec![dst.into(), src.into()])
    }

    pub fn movsx(
        &mut self,
        dst: RegisterDesc,
        src: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::MOVSX, vec![dst.into(), src.into()])
    }

    /// `[base + offset] <= src`
    pub fn str_(
        &mut self,
        base: RegisterDesc,
        offset: i64,
        src: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::STR, vec![base.into(), Operand::imm(offset, 64), src.into()])
    }

    /// `dst <= [base + offset]`
    pub fn ldd(
        &mut self,
        dst: RegisterDesc,
        base: RegisterDesc,
        offset: i64,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::LDD, vec![dst.into(), base.into(), Operand::imm(offset, 64)])
    }

    pub fn neg(&mut self, dst: RegisterDesc) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::NEG, vec![dst.into()])
    }

    pub fn not(&mut self, dst: RegisterDesc) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::NOT, vec![dst.into()])
    }

    pub fn add(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::ADD, vec![dst.into(), rhs.into()])
    }

    pub fn sub(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::SUB, vec![dst.into(), rhs.into()])
    }

    pub fn mul(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::MUL, vec![dst.into(), rhs.into()])
    }

    pub fn imul(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::IMUL, vec![dst.into(), rhs.into()])
    }

    pub fn xor(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::XOR, vec![dst.into(), rhs.into()])
    }

    pub fn or(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::OR, vec![dst.into(), rhs.into()])
    }

    pub fn and(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::AND, vec![dst.into(), rhs.into()])
    }

    pub fn shl(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::SHL, vec![dst.into(), rhs.into()])
    }

    pub fn shr(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::SHR, vec![dst.into(), rhs.into()])
    }

    pub fn rol(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::ROL, vec![dst.into(), rhs.into()])
    }

    pub fn ror(
        &mut self,
        dst: RegisterDesc,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::ROR, vec![dst.into(), rhs.into()])
    }

    pub fn te(
        &mut self,
        dst: RegisterDesc,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::TE, vec![dst.into(), lhs.into(), rhs.into()])
    }

    pub fn tne(
        &mut self,
        dst: RegisterDesc,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::TNE, vec![dst.into(), lhs.into(), rhs.into()])
    }

    pub fn tl(
        &mut self,
        dst: RegisterDesc,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::TL, vec![dst.into(), lhs.into(), rhs.into()])
    }

    pub fn tg(
        &mut self,
        dst: RegisterDesc,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::TG, vec![dst.into(), lhs.into(), rhs.into()])
    }

    pub fn ifs(
        &mut self,
        dst: RegisterDesc,
        cond: impl Into<Operand>,
        val: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::IFS, vec![dst.into(), cond.into(), val.into()])
    }

    pub fn js(
        &mut self,
        cond: RegisterDesc,
        if_true: impl Into<Operand>,
        if_false: impl Into<Operand>,
    ) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::JS, vec![cond.into(), if_true.into(), if_false.into()])
    }

    pub fn jmp(&mut self, dst: impl Into<Operand>) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::JMP, vec![dst.into()])
    }

    pub fn vexit(&mut self, dst: impl Into<Operand>) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::VEXIT, vec![dst.into()])
    }

    pub fn vpinr(&mut self, reg: RegisterDesc) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::VPINR, vec![reg.into()])
    }

    pub fn vpinw(&mut self, reg: RegisterDesc) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::VPINW, vec![reg.into()])
    }

    pub fn nop(&mut self) -> Result<&mut Self, InstructionError> {
        self.emit(&ins::NOP, vec![])
    }
}
