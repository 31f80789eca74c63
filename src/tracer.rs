//! Backward tracers.
//!
//! A tracer answers "what is the value of variable V at point P" with a
//! symbolic expression. The intra-block trace walks backward from the anchor
//! until an instruction writes to the queried slice, executes that single
//! instruction under a hooked symbolic machine whose reads resolve through
//! the tracer itself, and reads the slice out of the post-state. The
//! cross-block trace continues through predecessors up to a depth limit,
//! folding per-path results into a φ-like `value_if` chain when they
//! disagree and cutting loops through the routine's path cache.

use crate::arch::RegisterDesc;
use crate::expr::ExprRef;
use crate::instruction::{ins, Instruction, Vip};
use crate::pointer::Pointer;
use crate::routine::Routine;
use crate::variable::{is_tracing_opaque, AccessDetails, MemVar, VarAnchor, VarDescriptor, Variable};
use crate::vm::{execute_insn, VmInterface};
use rustc_hash::FxHashMap;
use std::sync::RwLock;

/// Symbolic query surface.
pub trait Tracer: Sync {
    /// Traces a variable across the basic block it belongs to.
    fn trace(&self, rtn: &Routine, var: &Variable) -> ExprRef;

    /// Traces a variable across the entire routine; `limit` bounds the
    /// number of blocks walked backwards, negative meaning unbounded.
    fn rtrace(&self, rtn: &Routine, var: &Variable, limit: i64) -> ExprRef
    where
        Self: Sized,
    {
        let mut path = Vec::new();
        rtrace_primitive(self, rtn, var, &mut path, limit.wrapping_add(1))
            .unwrap_or_else(|| var.to_expression())
            .simplified(false)
    }

    /// Traces every variable inside an expression.
    fn trace_exp(&self, rtn: &Routine, exp: &ExprRef) -> ExprRef
    where
        Self: Sized,
    {
        let out = exp.map_variables(&mut |uid, _| {
            uid.as_variable().map(|var| self.trace(rtn, var))
        });
        out.simplified(false)
    }

    /// Cross-block variant of `trace_exp`.
    fn rtrace_exp(&self, rtn: &Routine, exp: &ExprRef, limit: i64) -> ExprRef
    where
        Self: Sized,
    {
        let out = exp.map_variables(&mut |uid, _| {
            uid.as_variable().map(|var| self.rtrace(rtn, var, limit))
        });
        out.simplified(false)
    }
}

/// Plain tracer with no caching.
#[derive(Debug, Default)]
pub struct BasicTracer;

impl Tracer for BasicTracer {
    fn trace(&self, rtn: &Routine, var: &Variable) -> ExprRef {
        trace_primitive(self, rtn, var)
    }
}

// ---------------------------------------------------------------------------
// Intra-block trace
// ---------------------------------------------------------------------------

/// Resolves the pointer of the instruction's memory operand at the given
/// position, tracing the base register through the same tracer.
fn memory_pointer<T: Tracer + ?Sized>(
    tr: &T,
    rtn: &Routine,
    block: Vip,
    index: usize,
    insn: &Instruction,
) -> Option<Pointer> {
    let (base, offset) = insn.memory_location()?;
    let base_value = tr.trace(rtn, &Variable::reg_at(VarAnchor::new(block, index), base));
    Some(Pointer::new(&(base_value + offset)))
}

/// Determines the full value of a partially-written variable by splicing the
/// untouched slices around the written one.
fn resolve_partial(
    access: &AccessDetails,
    bit_count: u32,
    ptracer: &mut dyn FnMut(i32, u32) -> ExprRef,
) -> ExprRef {
    let mut base = ptracer(access.bit_offset, access.bit_count);

    if access.bit_offset > 0 {
        let low_bcnt = access.bit_offset as u32;
        let low = ptracer(0, low_bcnt);
        base = low | (base.resized(bit_count, false) << access.bit_offset as i64);
    } else if access.bit_offset < 0 {
        base = (base >> (-access.bit_offset) as i64).resized(bit_count, false);
    }

    let high_offset = access.bit_offset + access.bit_count as i32;
    if (bit_count as i32) > high_offset {
        let high_bcnt = bit_count - high_offset as u32;
        let high = ptracer(high_offset, high_bcnt);
        base = base | (high.resized(bit_count, false) << high_offset as i64);
    }

    base.resized(bit_count, false)
}

/// Hooked machine used to execute exactly one instruction: reads resolve to
/// pre-state traces, and the write matching the queried slice is captured.
struct LambdaVm<'a, T: Tracer + ?Sized> {
    tracer: &'a T,
    rtn: &'a Routine,
    at: VarAnchor,
    lookup: &'a Variable,
    result: Option<ExprRef>,
}

impl<T: Tracer + ?Sized> VmInterface for LambdaVm<'_, T> {
    fn read_register(&mut self, desc: &RegisterDesc) -> ExprRef {
        self.tracer
            .trace(self.rtn, &Variable::reg_at(self.at, *desc))
    }

    fn write_register(&mut self, desc: &RegisterDesc, value: ExprRef) {
        if let VarDescriptor::Register(reg) = &self.lookup.descriptor {
            if desc == reg {
                self.result = Some(value);
            }
        }
    }

    fn read_memory(&mut self, pointer: &ExprRef, byte_count: u32) -> Option<ExprRef> {
        let ptr = Pointer::new(pointer);
        let exp = self.tracer.trace(
            self.rtn,
            &Variable::mem_at(self.at, ptr, byte_count * 8),
        );
        Some(exp)
    }

    fn write_memory(&mut self, pointer: &ExprRef, value: ExprRef) -> bool {
        if let VarDescriptor::Memory(mem) = &self.lookup.descriptor {
            if pointer.equals(&mem.base.base) {
                self.result = Some(value);
            }
        }
        true
    }
}

/// Traces a variable across the basic block it belongs to, generating the
/// symbolic expression that describes its value at the bound point.
pub fn trace_primitive<T: Tracer + ?Sized>(tr: &T, rtn: &Routine, lookup: &Variable) -> ExprRef {
    // Free-form variables, begin-of-block anchors and opaque registers
    // describe themselves.
    let Some(at) = lookup.at else {
        return lookup.to_expression();
    };
    if at.is_begin() {
        return lookup.to_expression();
    }
    if let Some(reg) = lookup.as_register() {
        if is_tracing_opaque(reg) {
            return lookup.to_expression();
        }
    }
    let Some(blk) = rtn.block(at.block) else {
        return lookup.to_expression();
    };

    // Fast-forward backward until an instruction writes to the slice.
    let mut index = at.index.min(blk.len());
    let details;
    let insn;
    loop {
        if index == 0 {
            // Reached the beginning without a write.
            return lookup
                .clone()
                .bind(VarAnchor::new(at.block, 0))
                .to_expression();
        }
        index -= 1;
        let candidate = &blk.instructions[index];

        let mem_ptr = if lookup.is_memory() && candidate.base.accesses_memory() {
            memory_pointer(tr, rtn, at.block, index, candidate)
        } else {
            None
        };

        let d = lookup.written_by(candidate, mem_ptr.as_ref(), rtn);
        if d.accessed() {
            if d.is_unknown() {
                log::trace!("unknown symbolic state for {lookup}");
                return lookup.to_expression();
            }
            details = d;
            insn = candidate;
            break;
        }
    }

    // Partial writes resolve slice by slice and merge.
    let result_bcnt = lookup.bit_count();
    if details.bit_offset != 0 || details.bit_count != result_bcnt {
        let after = VarAnchor::new(at.block, index + 1);
        match &lookup.descriptor {
            VarDescriptor::Register(reg) => {
                let reg = *reg;
                return resolve_partial(&details, result_bcnt, &mut |bit_offset, bit_count| {
                    let slice = reg.select(bit_count, reg.bit_offset + bit_offset);
                    tr.trace(rtn, &Variable::reg_at(after, slice))
                });
            }
            VarDescriptor::Memory(mem) => {
                let mem = mem.clone();
                return resolve_partial(&details, result_bcnt, &mut |bit_offset, bit_count| {
                    debug_assert!(bit_offset % 8 == 0 && bit_count % 8 == 0);
                    let base = mem.base.offset((bit_offset / 8) as i64);
                    tr.trace(rtn, &Variable::mem_at(after, base, bit_count))
                });
            }
        }
    }

    // Execute the single writing instruction under the hooked machine.
    let mut lvm = LambdaVm {
        tracer: tr,
        rtn,
        at: VarAnchor::new(at.block, index),
        lookup,
        result: None,
    };
    let _ = execute_insn(&mut lvm, insn);
    if let Some(result) = lvm.result {
        return result.simplified(false);
    }

    // Behaviour could not be described; the state right after the write
    // stands for itself.
    lookup
        .clone()
        .bind(VarAnchor::new(at.block, index + 1))
        .to_expression()
}

// ---------------------------------------------------------------------------
// Cross-block trace
// ---------------------------------------------------------------------------

/// Number of times one edge may repeat on the active path before the walk
/// refuses to take it again.
const MAX_EDGE_REPEAT: usize = 2;

fn edge_count(path: &[(Vip, Vip)], src: Vip, dst: Vip) -> usize {
    path.iter().filter(|&&(s, d)| s == src && d == dst).count()
}

/// Moves every begin-anchored variable of the expression into the given
/// predecessor block and re-traces it there. Returns `None` on failure, with
/// the flag telling whether the failure was total (the expression was the
/// looping variable itself).
fn propagate<T: Tracer + ?Sized>(
    tr: &T,
    rtn: &Routine,
    exp: &ExprRef,
    pred: Vip,
    path: &mut Vec<(Vip, Vip)>,
    limit: i64,
    cross: bool,
) -> Result<ExprRef, bool> {
    let Some(pred_blk) = rtn.block(pred) else {
        return Err(false);
    };
    let pred_end = VarAnchor::new(pred, pred_blk.len());

    let mut failed: Option<bool> = None;
    let out = exp.map_variables(&mut |uid, _| {
        if failed.is_some() {
            return None;
        }
        let var = uid.as_variable()?;

        // Only variables parked at the beginning of the block move.
        let at = var.at?;
        if !at.is_begin() {
            return None;
        }

        let mut var = var.clone();
        if let Some(reg) = var.as_register() {
            // A local temporary at block entry indicates use before
            // assignment; it cannot come from a predecessor.
            if reg.is_local() {
                log::warn!("local {reg} is used before value assignment (block {:x})", at.block);
            }
            if reg.is_volatile() {
                return None;
            }
        } else if let Some(mem) = var.as_memory() {
            // Propagate the pointer itself first.
            let base = mem.base.base.clone();
            let bit_count = mem.bit_count;
            match propagate(tr, rtn, &base, pred, path, limit, false) {
                Ok(new_base) => {
                    var.descriptor = VarDescriptor::Memory(MemVar {
                        base: Pointer::new(&new_base),
                        bit_count,
                    });
                }
                Err(_) => {
                    failed = Some(false);
                    return None;
                }
            }
        }

        let is_sp = var
            .as_register()
            .is_some_and(|r| r.is_stack_pointer());
        let bound = var.bind(pred_end);

        let traced = if cross {
            match rtrace_primitive(tr, rtn, &bound, path, limit) {
                Some(e) => e,
                None => {
                    failed = Some(exp.is_variable());
                    return None;
                }
            }
        } else {
            tr.trace(rtn, &bound)
        };

        // Crossing the edge adjusts the stack pointer by the block delta.
        let traced = if is_sp && pred_blk.sp_offset != 0 {
            traced + pred_blk.sp_offset
        } else {
            traced
        };
        Some(traced)
    });

    match failed {
        Some(total) => Err(total),
        None => Ok(out.simplified(false)),
    }
}

/// Gate condition under which control flows from `pred` into `block`, when
/// the predecessor ends in a conditional branch with immediate destinations.
fn branch_gate<T: Tracer + ?Sized>(
    tr: &T,
    rtn: &Routine,
    pred: Vip,
    block: Vip,
) -> Option<ExprRef> {
    let pred_blk = rtn.block(pred)?;
    let term = pred_blk.terminator()?;
    if !std::ptr::eq(term.base, &ins::JS) {
        return None;
    }
    let t_true = term.operands[1].as_imm()?.u64();
    let t_false = term.operands[2].as_imm()?.u64();

    let cond_reg = *term.operands[0].reg();
    let cond_at = VarAnchor::new(pred, pred_blk.len() - 1);
    let cond = tr.trace(rtn, &Variable::reg_at(cond_at, cond_reg));
    let cond = cond.resized(1, false);

    if t_true == block && t_false != block {
        Some(cond)
    } else if t_false == block && t_true != block {
        Some(!cond)
    } else {
        None
    }
}

/// Internal cross-block trace with an explicit path history.
fn rtrace_primitive<T: Tracer + ?Sized>(
    tr: &T,
    rtn: &Routine,
    lookup: &Variable,
    path: &mut Vec<(Vip, Vip)>,
    mut limit: i64,
) -> Option<ExprRef> {
    // Trace through the current block first.
    let local = tr.trace(rtn, lookup);

    // Depth limit; negative limits never reach zero.
    limit -= 1;
    if limit == 0 {
        return Some(local);
    }

    // Fully-known results need no propagation.
    if local.unknown_mask() == 0 {
        return Some(local.simplified(false));
    }
    let Some(at) = lookup.at else {
        return Some(local);
    };
    let preds: Vec<Vip> = rtn
        .block(at.block)
        .map(|b| b.prev.clone())
        .unwrap_or_default();
    if preds.is_empty() {
        return Some(local.simplified(false));
    }

    // Walk each predecessor, remembering the per-path results.
    let mut results: Vec<(Vip, ExprRef)> = Vec::new();
    let mut skipped_loop = false;
    for pred in preds {
        if edge_count(path, at.block, pred) >= MAX_EDGE_REPEAT {
            log::trace!("path {:x}->{:x} not taken, n-looping", at.block, pred);
            skipped_loop = true;
            continue;
        }
        path.push((at.block, pred));
        let outcome = propagate(tr, rtn, &local, pred, path, limit, true);
        path.pop();

        match outcome {
            Ok(exp) => results.push((pred, exp)),
            Err(true) => {
                skipped_loop = true;
            }
            Err(false) => {
                // Partial failure on this path; the merged result cannot be
                // trusted, fall back to the unresolved variable.
                return Some(lookup.to_expression());
            }
        }
    }

    if results.is_empty() {
        // Every path was cut. A loop that did not settle to a constant
        // yields a fresh variable tagged to the loop header, preventing
        // divergence.
        if skipped_loop && rtn.is_looping(at.block) {
            let mut header = lookup.clone().bind(VarAnchor::new(at.block, 0));
            header.is_branch_dependent = true;
            return Some(header.to_expression());
        }
        if path.is_empty() {
            return Some(local.simplified(false));
        }
        return None;
    }

    // If all predecessors agree, that is the value.
    let first = results[0].1.clone();
    if results.iter().all(|(_, e)| e.equals(&first)) {
        return Some(first.simplified(false));
    }

    // Disagreement: build a φ-like chain gated by the branch conditions of
    // the merge, when every predecessor provides one.
    let mut gates = Vec::with_capacity(results.len());
    for (pred, _) in &results {
        match branch_gate(tr, rtn, *pred, at.block) {
            Some(g) => gates.push(g),
            None => {
                // No usable gate; mark the merged value branch-dependent.
                let tagged = local.map_variables(&mut |uid, _bits| {
                    let var = uid.as_variable()?;
                    let mut var = var.clone();
                    var.is_branch_dependent = true;
                    Some(var.to_expression())
                });
                return Some(tagged.simplified(false));
            }
        }
    }

    let mut phi: Option<ExprRef> = None;
    for (gate, (_, value)) in gates.into_iter().zip(results.into_iter()) {
        let armed = gate.value_if(value);
        phi = Some(match phi {
            Some(acc) => acc | armed,
            None => armed,
        });
    }
    Some(phi.unwrap().simplified(false))
}

// ---------------------------------------------------------------------------
// Caching tracer
// ---------------------------------------------------------------------------

/// Tracer with a reader-writer-locked result cache. Tracing is costly and a
/// cache cuts the bill by orders of magnitude; any block mutation must
/// invalidate the entries anchored in that block.
#[derive(Debug, Default)]
pub struct CachedTracer {
    cache: RwLock<FxHashMap<Variable, ExprRef>>,
}

impl CachedTracer {
    pub fn new() -> CachedTracer {
        CachedTracer {
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Drops every cached result.
    pub fn flush(&self) {
        self.cache.write().unwrap().clear();
    }

    /// Drops the results anchored inside the given block.
    pub fn flush_block(&self, vip: Vip) {
        self.cache
            .write()
            .unwrap()
            .retain(|var, _| var.at.map(|a| a.block) != Some(vip));
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().unwrap().is_empty()
    }
}

impl Tracer for CachedTracer {
    fn trace(&self, rtn: &Routine, var: &Variable) -> ExprRef {
        if let Some(hit) = self.cache.read().unwrap().get(var) {
            return hit.clone();
        }
        let result = trace_primitive(self, rtn, var);
        self.cache
            .write()
            .unwrap()
            .insert(var.clone(), result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchitectureId, RegisterDesc};
    use crate::instruction::Operand;
    use crate::routine::Routine;

    fn end_of(rtn: &Routine, vip: Vip) -> VarAnchor {
        VarAnchor::new(vip, rtn.block(vip).unwrap().len())
    }

    #[test]
    fn test_trace_constant() {
        let mut rtn = Routine::new(ArchitectureId::Virtual, 0x1000);
        let r = RegisterDesc::virt(1, 64);
        {
            let blk = rtn.block_mut(0x1000).unwrap();
            blk.mov(r, Operand::imm(3, 64)).unwrap();
            blk.add(r, Operand::imm(5, 64)).unwrap();
        }
        let tracer = BasicTracer;
        let var = Variable::reg_at(end_of(&rtn, 0x1000), r);
        let exp = tracer.trace(&rtn, &var);
        assert_eq!(exp.get_u64(), Some(8));
    }

    #[test]
    fn test_trace_partial_write() {
        let mut rtn = Routine::new(ArchitectureId::Virtual, 0x1000);
        let r = RegisterDesc::virt(1, 64);
        {
            let blk = rtn.block_mut(0x1000).unwrap();
            blk.mov(r, Operand::imm(0x1111, 64)).unwrap();
            blk.mov(r.select(8, 0), Operand::imm(0x22, 8)).unwrap();
        }
        let tracer = BasicTracer;
        let var = Variable::reg_at(end_of(&rtn, 0x1000), r);
        let exp = tracer.trace(&rtn, &var);
        assert_eq!(exp.get_u64(), Some(0x1122));
    }

    #[test]
    fn test_cached_tracer_consistent() {
        let mut rtn = Routine::new(ArchitectureId::Virtual, 0x1000);
        let r = RegisterDesc::virt(1, 64);
        {
            let blk = rtn.block_mut(0x1000).unwrap();
            blk.mov(r, Operand::imm(7, 64)).unwrap();
            blk.mul(r, Operand::imm(3, 64)).unwrap();
        }
        let cached = CachedTracer::new();
        let var = Variable::reg_at(end_of(&rtn, 0x1000), r);
        let a = cached.trace(&rtn, &var);
        let b = cached.trace(&rtn, &var);
        assert!(a.is_identical(&b));
        assert_eq!(a.get_u64(), Some(21));
        assert!(!cached.is_empty());

        cached.flush_block(0x1000);
        assert!(cached.is_empty());
    }
}
