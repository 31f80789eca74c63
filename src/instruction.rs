//! IR instruction set.
//!
//! Instructions obey two restrictions: at most a single write, whether
//! register or memory, and at most one memory access. Each descriptor names
//! its operand kinds, how the access size is derived, the semantic operator
//! where one exists, which operands are branch targets, and the memory
//! operand if any.

use crate::arch::RegisterDesc;
use crate::core::operators::Op;
use crate::errors::InstructionError;
use std::fmt;

/// Virtual instruction pointer.
pub type Vip = u64;

/// VIP of synthesized instructions with no origin in the source program.
pub const INVALID_VIP: Vip = u64::MAX;

/// How an instruction accesses one of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperandType {
    Invalid,
    /// Immediate operand, read.
    ReadImm,
    /// Register operand, read.
    ReadReg,
    /// Register or immediate, read.
    ReadAny,
    /// Register operand, written.
    Write,
    /// Register operand, read and written.
    ReadWrite,
}

impl OperandType {
    pub fn is_write(self) -> bool {
        self >= OperandType::Write
    }
    pub fn is_read(self) -> bool {
        self != OperandType::Write && self != OperandType::Invalid
    }
}

/// Sized immediate value; stored raw, interpretable either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImmediateDesc {
    value: u64,
    pub bit_count: u32,
}

impl ImmediateDesc {
    pub fn new(value: u64, bit_count: u32) -> Self {
        ImmediateDesc { value, bit_count }
    }
    pub fn from_i64(value: i64, bit_count: u32) -> Self {
        ImmediateDesc {
            value: value as u64,
            bit_count,
        }
    }
    pub fn u64(&self) -> u64 {
        self.value
    }
    pub fn i64(&self) -> i64 {
        self.value as i64
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Imm(ImmediateDesc),
    Reg(RegisterDesc),
}

impl Operand {
    pub fn imm(value: i64, bit_count: u32) -> Operand {
        Operand::Imm(ImmediateDesc::from_i64(value, bit_count))
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Operand::Reg(_))
    }
    pub fn is_immediate(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }

    pub fn reg(&self) -> &RegisterDesc {
        match self {
            Operand::Reg(r) => r,
            Operand::Imm(_) => panic!("operand is not a register"),
        }
    }

    pub fn as_imm(&self) -> Option<&ImmediateDesc> {
        match self {
            Operand::Imm(i) => Some(i),
            Operand::Reg(_) => None,
        }
    }

    pub fn bit_count(&self) -> u32 {
        match self {
            Operand::Imm(i) => i.bit_count,
            Operand::Reg(r) => r.bit_count,
        }
    }

    /// Whether the operand kind is acceptable where `ty` is expected.
    pub fn matches(&self, ty: OperandType) -> bool {
        match ty {
            OperandType::Invalid => false,
            OperandType::ReadImm => self.is_immediate(),
            OperandType::ReadReg | OperandType::Write | OperandType::ReadWrite => {
                self.is_register()
            }
            OperandType::ReadAny => true,
        }
    }
}

impl From<RegisterDesc> for Operand {
    fn from(r: RegisterDesc) -> Operand {
        Operand::Reg(r)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(i) => {
                let v = i.i64();
                if v < 0 {
                    write!(f, "-{:#x}", v.unsigned_abs())
                } else {
                    write!(f, "{:#x}", i.u64())
                }
            }
        }
    }
}

/// Which operand of the memory-accessing instruction carries the base
/// register, and whether the access is a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOp {
    pub operand_index: usize,
    pub is_write: bool,
}

/// Immutable instruction descriptor.
#[derive(Debug, PartialEq, Eq)]
pub struct InstructionDesc {
    pub name: &'static str,
    pub operand_types: &'static [OperandType],
    /// Access-size derivation: positive = bit width of operand `n-1`,
    /// negative = value of immediate operand `-n-1`, zero = none.
    pub access_size_index: i32,
    pub is_volatile: bool,
    /// Semantic operator for arithmetic/bitwise/conditional instructions.
    pub symbolic_operator: Option<Op>,
    /// Operand indices that carry branch destinations; positive 1-based for
    /// virtual branches, negative for branches into real code.
    pub branch_operands: &'static [i32],
    pub memory_op: Option<MemoryOp>,
}

impl InstructionDesc {
    pub fn operand_count(&self) -> usize {
        self.operand_types.len()
    }
    pub fn accesses_memory(&self) -> bool {
        self.memory_op.is_some()
    }
    pub fn reads_memory(&self) -> bool {
        self.memory_op.is_some_and(|m| !m.is_write)
    }
    pub fn writes_memory(&self) -> bool {
        self.memory_op.is_some_and(|m| m.is_write)
    }
    pub fn is_branching_virt(&self) -> bool {
        self.branch_operands.iter().any(|&i| i > 0)
    }
    pub fn is_branching_real(&self) -> bool {
        self.branch_operands.iter().any(|&i| i < 0)
    }
    pub fn is_branching(&self) -> bool {
        !self.branch_operands.is_empty()
    }
}

/// The instruction set.
pub mod ins {
    use super::{InstructionDesc, MemoryOp, OperandType as O};
    use crate::core::operators::Op;

    macro_rules! insn {
        ($ident:ident, $name:literal, [$($ops:expr),*], $asz:expr, $vol:expr, $sym:expr, [$($br:expr),*], $mem:expr) => {
            pub static $ident: InstructionDesc = InstructionDesc {
                name: $name,
                operand_types: &[$($ops),*],
                access_size_index: $asz,
                is_volatile: $vol,
                symbolic_operator: $sym,
                branch_operands: &[$($br),*],
                memory_op: $mem,
            };
        };
    }

    // Data and memory.
    insn!(MOV,    "mov",    [O::Write, O::ReadAny],                2, false, None, [], None);
    insn!(MOVSX,  "movsx",  [O::Write, O::ReadAny],                2, false, None, [], None);
    insn!(STR,    "str",    [O::ReadReg, O::ReadImm, O::ReadAny],  3, false, None, [], Some(MemoryOp { operand_index: 0, is_write: true }));
    insn!(LDD,    "ldd",    [O::Write, O::ReadReg, O::ReadImm],    1, false, None, [], Some(MemoryOp { operand_index: 1, is_write: false }));

    // Arithmetic.
    insn!(NEG,    "neg",    [O::ReadWrite],                        1, false, Some(Op::Negate),        [], None);
    insn!(ADD,    "add",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::Add),           [], None);
    insn!(SUB,    "sub",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::Subtract),      [], None);
    insn!(MUL,    "mul",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::Umultiply),     [], None);
    insn!(IMUL,   "imul",   [O::ReadWrite, O::ReadAny],            1, false, Some(Op::Multiply),      [], None);
    insn!(MULHI,  "mulhi",  [O::ReadWrite, O::ReadAny],            1, false, Some(Op::UmultiplyHigh), [], None);
    insn!(IMULHI, "imulhi", [O::ReadWrite, O::ReadAny],            1, false, Some(Op::MultiplyHigh),  [], None);
    insn!(DIV,    "div",    [O::ReadWrite, O::ReadAny, O::ReadAny], 1, false, Some(Op::Udivide),      [], None);
    insn!(IDIV,   "idiv",   [O::ReadWrite, O::ReadAny, O::ReadAny], 1, false, Some(Op::Divide),       [], None);
    insn!(REM,    "rem",    [O::ReadWrite, O::ReadAny, O::ReadAny], 1, false, Some(Op::Uremainder),   [], None);
    insn!(IREM,   "irem",   [O::ReadWrite, O::ReadAny, O::ReadAny], 1, false, Some(Op::Remainder),    [], None);

    // Bitwise.
    insn!(POPCNT, "popcnt", [O::ReadWrite],                        1, false, Some(Op::Popcnt),      [], None);
    insn!(BSF,    "bsf",    [O::ReadWrite],                        1, false, Some(Op::BitscanFwd),  [], None);
    insn!(BSR,    "bsr",    [O::ReadWrite],                        1, false, Some(Op::BitscanRev),  [], None);
    insn!(NOT,    "not",    [O::ReadWrite],                        1, false, Some(Op::BitwiseNot),  [], None);
    insn!(SHR,    "shr",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::ShiftRight),  [], None);
    insn!(SHL,    "shl",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::ShiftLeft),   [], None);
    insn!(XOR,    "xor",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::BitwiseXor),  [], None);
    insn!(OR,     "or",     [O::ReadWrite, O::ReadAny],            1, false, Some(Op::BitwiseOr),   [], None);
    insn!(AND,    "and",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::BitwiseAnd),  [], None);
    insn!(ROR,    "ror",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::RotateRight), [], None);
    insn!(ROL,    "rol",    [O::ReadWrite, O::ReadAny],            1, false, Some(Op::RotateLeft),  [], None);

    // Conditional set.
    insn!(TG,     "tg",     [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::Greater),     [], None);
    insn!(TGE,    "tge",    [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::GreaterEq),   [], None);
    insn!(TE,     "te",     [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::Equal),       [], None);
    insn!(TNE,    "tne",    [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::NotEqual),    [], None);
    insn!(TLE,    "tle",    [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::LessEq),      [], None);
    insn!(TL,     "tl",     [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::Less),        [], None);
    insn!(TUG,    "tug",    [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::Ugreater),    [], None);
    insn!(TUGE,   "tuge",   [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::UgreaterEq),  [], None);
    insn!(TULE,   "tule",   [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::UlessEq),     [], None);
    insn!(TUL,    "tul",    [O::Write, O::ReadAny, O::ReadAny],    1, false, Some(Op::Uless),       [], None);
    insn!(IFS,    "ifs",    [O::Write, O::ReadAny, O::ReadAny],    3, false, Some(Op::ValueIf),     [], None);

    // Control flow.
    insn!(JS,     "js",     [O::ReadReg, O::ReadAny, O::ReadAny],  2, false, None, [2, 3],  None);
    insn!(JMP,    "jmp",    [O::ReadAny],                          1, false, None, [1],     None);
    insn!(VEXIT,  "vexit",  [O::ReadAny],                          1, false, None, [-1],    None);
    insn!(VXCALL, "vxcall", [O::ReadAny],                          1, false, None, [-1],    None);

    // Special.
    insn!(NOP,    "nop",    [],                                    0, false, None, [], None);
    insn!(VEMIT,  "vemit",  [O::ReadImm],                          1, true,  None, [], None);
    insn!(VPINR,  "vpinr",  [O::ReadReg],                          1, true,  None, [], None);
    insn!(VPINW,  "vpinw",  [O::Write],                            1, true,  None, [], None);
    insn!(VPINRM, "vpinrm", [O::ReadReg, O::ReadImm],              0, true,  None, [], Some(MemoryOp { operand_index: 0, is_write: false }));
    insn!(VPINWM, "vpinwm", [O::ReadReg, O::ReadImm],              0, true,  None, [], Some(MemoryOp { operand_index: 0, is_write: true }));
}

/// Every descriptor, used by name lookup during deserialization.
static INSTRUCTION_LIST: &[&InstructionDesc] = &[
    &ins::MOV, &ins::MOVSX, &ins::STR, &ins::LDD, &ins::IFS, &ins::NEG, &ins::ADD, &ins::SUB,
    &ins::MUL, &ins::IMUL, &ins::MULHI, &ins::IMULHI, &ins::DIV, &ins::IDIV, &ins::REM,
    &ins::IREM, &ins::POPCNT, &ins::BSF, &ins::BSR, &ins::NOT, &ins::SHR, &ins::SHL,
    &ins::XOR, &ins::OR, &ins::AND, &ins::ROR, &ins::ROL, &ins::TG, &ins::TGE, &ins::TE,
    &ins::TNE, &ins::TLE, &ins::TL, &ins::TUG, &ins::TUGE, &ins::TULE, &ins::TUL, &ins::JS,
    &ins::JMP, &ins::VEXIT, &ins::VXCALL, &ins::NOP, &ins::VEMIT, &ins::VPINR, &ins::VPINW,
    &ins::VPINRM, &ins::VPINWM,
];

/// Every descriptor, used by name lookup during deserialization.
pub fn instruction_list() -> &'static [&'static InstructionDesc] {
    INSTRUCTION_LIST
}

/// Looks a descriptor up by its mnemonic.
pub fn find_instruction(name: &str) -> Option<&'static InstructionDesc> {
    instruction_list().iter().copied().find(|d| d.name == name)
}

/// A single IR instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub base: &'static InstructionDesc,
    pub operands: Vec<Operand>,
    /// Originating virtual instruction pointer, `INVALID_VIP` if synthesized.
    pub vip: Vip,
    /// Stack pointer offset at this instruction.
    pub sp_offset: i64,
    /// Stack instance index.
    pub sp_index: u32,
    /// Whether the stack pointer is reset by this instruction.
    pub sp_reset: bool,
    /// Forced volatility beyond the descriptor.
    pub explicit_volatile: bool,
}

impl Instruction {
    pub fn new(
        base: &'static InstructionDesc,
        operands: Vec<Operand>,
    ) -> Result<Instruction, InstructionError> {
        let insn = Instruction {
            base,
            operands,
            vip: INVALID_VIP,
            sp_offset: 0,
            sp_index: 0,
            sp_reset: false,
            explicit_volatile: false,
        };
        insn.validate()?;
        Ok(insn)
    }

    /// Validates the operand list against the descriptor.
    pub fn validate(&self) -> Result<(), InstructionError> {
        if self.operands.len() != self.base.operand_count() {
            return Err(InstructionError::OperandCountMismatch {
                name: self.base.name,
                expected: self.base.operand_count(),
                got: self.operands.len(),
            });
        }
        for (index, (op, ty)) in self
            .operands
            .iter()
            .zip(self.base.operand_types.iter())
            .enumerate()
        {
            if !op.matches(*ty) {
                return Err(InstructionError::OperandKindMismatch {
                    name: self.base.name,
                    index,
                });
            }
            if ty.is_write() {
                let Operand::Reg(r) = op else {
                    return Err(InstructionError::RegisterExpected {
                        name: self.base.name,
                        index,
                    });
                };
                if r.is_read_only() {
                    return Err(InstructionError::ReadOnlyDestination {
                        name: self.base.name,
                        index,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_volatile(&self) -> bool {
        self.explicit_volatile || self.base.is_volatile
    }

    /// Access size in bits as derived by the descriptor.
    pub fn access_size(&self) -> u32 {
        let idx = self.base.access_size_index;
        if idx == 0 {
            return 0;
        }
        if idx > 0 {
            self.operands
                .get(idx as usize - 1)
                .map_or(0, |op| op.bit_count())
        } else {
            self.operands
                .get((-idx) as usize - 1)
                .and_then(|op| op.as_imm().map(|i| i.u64() as u32))
                .unwrap_or(0)
        }
    }

    /// Base register and byte offset of the memory cell accessed, if any.
    pub fn memory_location(&self) -> Option<(RegisterDesc, i64)> {
        let mem = self.base.memory_op?;
        let base = *self.operands[mem.operand_index].reg();
        let offset = self.operands[mem.operand_index + 1]
            .as_imm()
            .map_or(0, |i| i.i64());
        Some((base, offset))
    }

    /// Branch target operands of a terminator.
    pub fn branch_targets(&self) -> impl Iterator<Item = &Operand> {
        self.base
            .branch_operands
            .iter()
            .map(move |&i| &self.operands[i.unsigned_abs() as usize - 1])
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base.name)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}
