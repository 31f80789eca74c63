//! Binary routine container.
//!
//! Little-endian, no padding. Layout: magic `"VTIL"`, format version,
//! architecture id, entry VIP, internal-register counter, block count, then
//! each block with its stack state, predecessor/successor VIP lists and
//! instruction stream, followed by the calling-convention tables. Block
//! references are stored as entry VIPs, so deserialization needs no fixup
//! pass.

use crate::arch::{ArchitectureId, RegisterDesc, RegisterFlags};
use crate::block::BasicBlock;
use crate::errors::SerializeError;
use crate::instruction::{find_instruction, ImmediateDesc, Instruction, Operand, Vip};
use crate::routine::{CallConvention, Routine};
use scroll::ctx::StrCtx;
use scroll::{Pread, LE};

pub const CONTAINER_MAGIC: &[u8; 4] = b"VTIL";
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn name(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn register(&mut self, r: &RegisterDesc) {
        self.u64(r.flags.bits());
        self.u64(r.local_id);
        self.u8(r.bit_count as u8);
        self.i32(r.bit_offset);
        self.u8(r.architecture as u8);
    }

    fn operand(&mut self, op: &Operand) {
        match op {
            Operand::Imm(imm) => {
                self.u8(0);
                self.u8(imm.bit_count as u8);
                self.u64(imm.u64());
            }
            Operand::Reg(reg) => {
                self.u8(1);
                self.u8(reg.bit_count as u8);
                self.u64(reg.flags.bits());
                self.u64(reg.local_id);
                self.i32(reg.bit_offset);
                self.u8(reg.architecture as u8);
            }
        }
    }

    fn instruction(&mut self, insn: &Instruction) {
        self.name(insn.base.name);
        self.u8(insn.operands.len() as u8);
        for op in &insn.operands {
            self.operand(op);
        }
        self.u64(insn.vip);
        self.i64(insn.sp_offset);
        self.u32(insn.sp_index);
        self.u8(insn.sp_reset as u8);
    }

    fn register_list(&mut self, list: &[RegisterDesc]) {
        self.u32(list.len() as u32);
        for r in list {
            self.register(r);
        }
    }

    fn convention(&mut self, cc: &CallConvention) {
        self.register_list(&cc.volatile_registers);
        self.register_list(&cc.param_registers);
        self.register_list(&cc.retval_registers);
        match &cc.frame_register {
            Some(r) => {
                self.u8(1);
                self.register(r);
            }
            None => self.u8(0),
        }
        self.u64(cc.shadow_space);
        self.u8(cc.purge_stack as u8);
    }

    fn block(&mut self, blk: &BasicBlock) {
        self.u64(blk.entry_vip);
        self.i64(blk.sp_offset);
        self.u32(blk.sp_index);
        self.u32(blk.last_temporary_index);
        self.u32(blk.prev.len() as u32);
        for v in &blk.prev {
            self.u64(*v);
        }
        self.u32(blk.next.len() as u32);
        for v in &blk.next {
            self.u64(*v);
        }
        self.u32(blk.instructions.len() as u32);
        for insn in &blk.instructions {
            self.instruction(insn);
        }
    }
}

/// Serializes a routine into the binary container format.
pub fn save_routine(rtn: &Routine) -> Vec<u8> {
    let mut w = Writer::default();
    w.buf.extend_from_slice(CONTAINER_MAGIC);
    w.u32(FORMAT_VERSION);
    w.u32(rtn.arch_id as u32);
    w.u64(rtn.entry_vip);
    w.u64(rtn.last_internal_id());
    w.u32(rtn.blocks.len() as u32);
    for blk in rtn.blocks.values() {
        w.block(blk);
    }
    w.convention(&rtn.routine_convention);
    w.u32(rtn.spec_subroutine_conventions.len() as u32);
    for (vip, cc) in &rtn.spec_subroutine_conventions {
        w.u64(*vip);
        w.convention(cc);
    }
    w.buf
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn read_register(src: &[u8], offset: &mut usize) -> Result<RegisterDesc, SerializeError> {
    let flags = RegisterFlags::from_bits_truncate(src.gread_with::<u64>(offset, LE)?);
    let local_id = src.gread_with::<u64>(offset, LE)?;
    let bit_count = src.gread::<u8>(offset)? as u32;
    let bit_offset = src.gread_with::<i32>(offset, LE)?;
    let arch = src.gread::<u8>(offset)?;
    let architecture = ArchitectureId::from_u8(arch)
        .ok_or_else(|| SerializeError::Malformed(format!("bad architecture id {arch:#x}")))?;
    Ok(RegisterDesc {
        flags,
        local_id,
        bit_count,
        bit_offset,
        architecture,
    })
}

fn read_operand(src: &[u8], offset: &mut usize) -> Result<Operand, SerializeError> {
    let kind = src.gread::<u8>(offset)?;
    let bit_count = src.gread::<u8>(offset)? as u32;
    match kind {
        0 => {
            let value = src.gread_with::<u64>(offset, LE)?;
            Ok(Operand::Imm(ImmediateDesc::new(value, bit_count)))
        }
        1 => {
            let flags = RegisterFlags::from_bits_truncate(src.gread_with::<u64>(offset, LE)?);
            let local_id = src.gread_with::<u64>(offset, LE)?;
            let bit_offset = src.gread_with::<i32>(offset, LE)?;
            let arch = src.gread::<u8>(offset)?;
            let architecture = ArchitectureId::from_u8(arch).ok_or_else(|| {
                SerializeError::Malformed(format!("bad architecture id {arch:#x}"))
            })?;
            Ok(Operand::Reg(RegisterDesc {
                flags,
                local_id,
                bit_count,
                bit_offset,
                architecture,
            }))
        }
        other => Err(SerializeError::Malformed(format!(
            "bad operand kind {other:#x}"
        ))),
    }
}

fn read_instruction(src: &[u8], offset: &mut usize) -> Result<Instruction, SerializeError> {
    let name_len = src.gread_with::<u16>(offset, LE)? as usize;
    let name: &str = src.gread_with(offset, StrCtx::Length(name_len))?;
    let base = find_instruction(name)
        .ok_or_else(|| SerializeError::UnknownOpcode(name.to_string()))?;

    let operand_count = src.gread::<u8>(offset)? as usize;
    let mut operands = Vec::with_capacity(operand_count);
    for _ in 0..operand_count {
        operands.push(read_operand(src, offset)?);
    }

    let mut insn = Instruction::new(base, operands)
        .map_err(|e| SerializeError::Malformed(e.to_string()))?;
    insn.vip = src.gread_with::<u64>(offset, LE)?;
    insn.sp_offset = src.gread_with::<i64>(offset, LE)?;
    insn.sp_index = src.gread_with::<u32>(offset, LE)?;
    insn.sp_reset = src.gread::<u8>(offset)? != 0;
    Ok(insn)
}

fn read_vip_list(src: &[u8], offset: &mut usize) -> Result<Vec<Vip>, SerializeError> {
    let count = src.gread_with::<u32>(offset, LE)? as usize;
    let mut out = Vec::with_capacity(count.min(0x10000));
    for _ in 0..count {
        out.push(src.gread_with::<u64>(offset, LE)?);
    }
    Ok(out)
}

fn read_register_list(src: &[u8], offset: &mut usize) -> Result<Vec<RegisterDesc>, SerializeError> {
    let count = src.gread_with::<u32>(offset, LE)? as usize;
    let mut out = Vec::with_capacity(count.min(0x10000));
    for _ in 0..count {
        out.push(read_register(src, offset)?);
    }
    Ok(out)
}

fn read_convention(src: &[u8], offset: &mut usize) -> Result<CallConvention, SerializeError> {
    let volatile_registers = read_register_list(src, offset)?;
    let param_registers = read_register_list(src, offset)?;
    let retval_registers = read_register_list(src, offset)?;
    let frame_register = if src.gread::<u8>(offset)? != 0 {
        Some(read_register(src, offset)?)
    } else {
        None
    };
    let shadow_space = src.gread_with::<u64>(offset, LE)?;
    let purge_stack = src.gread::<u8>(offset)? != 0;
    Ok(CallConvention {
        volatile_registers,
        param_registers,
        retval_registers,
        frame_register,
        shadow_space,
        purge_stack,
    })
}

fn read_block(src: &[u8], offset: &mut usize) -> Result<BasicBlock, SerializeError> {
    let entry_vip = src.gread_with::<u64>(offset, LE)?;
    let mut blk = BasicBlock::new(entry_vip);
    blk.sp_offset = src.gread_with::<i64>(offset, LE)?;
    blk.sp_index = src.gread_with::<u32>(offset, LE)?;
    blk.last_temporary_index = src.gread_with::<u32>(offset, LE)?;
    blk.prev = read_vip_list(src, offset)?;
    blk.next = read_vip_list(src, offset)?;

    let insn_count = src.gread_with::<u32>(offset, LE)? as usize;
    for _ in 0..insn_count {
        blk.instructions.push(read_instruction(src, offset)?);
    }
    Ok(blk)
}

/// Deserializes a routine from the binary container format.
pub fn load_routine(data: &[u8]) -> Result<Routine, SerializeError> {
    let offset = &mut 0usize;

    let magic: &[u8] = data
        .get(0..4)
        .ok_or_else(|| SerializeError::Malformed("truncated header".into()))?;
    if magic != CONTAINER_MAGIC {
        return Err(SerializeError::Malformed("bad container magic".into()));
    }
    *offset = 4;

    let version = data.gread_with::<u32>(offset, LE)?;
    if version != FORMAT_VERSION {
        return Err(SerializeError::Malformed(format!(
            "unsupported format version {version}"
        )));
    }

    let arch = data.gread_with::<u32>(offset, LE)?;
    let arch_id = ArchitectureId::from_u8(arch as u8)
        .filter(|_| arch <= u8::MAX as u32)
        .ok_or_else(|| SerializeError::Malformed(format!("bad architecture id {arch:#x}")))?;

    let entry_vip = data.gread_with::<u64>(offset, LE)?;
    let internal_counter = data.gread_with::<u64>(offset, LE)?;
    let block_count = data.gread_with::<u32>(offset, LE)? as usize;

    let mut rtn = Routine::new(arch_id, entry_vip);
    rtn.blocks.clear();
    for _ in 0..block_count {
        let blk = read_block(data, offset)?;
        rtn.blocks.insert(blk.entry_vip, blk);
    }
    if !rtn.blocks.contains_key(&entry_vip) {
        return Err(SerializeError::Malformed(
            "entry block missing from container".into(),
        ));
    }
    rtn.set_last_internal_id(internal_counter);

    rtn.routine_convention = read_convention(data, offset)?;
    let override_count = data.gread_with::<u32>(offset, LE)? as usize;
    for _ in 0..override_count {
        let vip = data.gread_with::<u64>(offset, LE)?;
        let cc = read_convention(data, offset)?;
        rtn.spec_subroutine_conventions.insert(vip, cc);
    }

    Ok(rtn)
}
