//! Routines: the owning container of the control-flow graph.
//!
//! A routine owns its blocks keyed by entry VIP, the entry point, an atomic
//! counter for internal register allocation, per-call-site calling-convention
//! overrides, and a lazily computed reachability cache in both directions.
//! Mutation requires exclusive access; for multi-threaded pass execution the
//! routine is wrapped in a mutex at the orchestration layer, while the
//! internal-register counter stays readable without exclusivity.

use crate::arch::{ArchitectureId, RegisterDesc};
use crate::block::BasicBlock;
use crate::instruction::Vip;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Calling convention metadata attached to a routine or a call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallConvention {
    /// Registers that may change across the call and are considered trashed.
    pub volatile_registers: Vec<RegisterDesc>,
    /// Registers read as arguments.
    pub param_registers: Vec<RegisterDesc>,
    /// Registers holding the return value.
    pub retval_registers: Vec<RegisterDesc>,
    /// Frame register, if relevant.
    pub frame_register: Option<RegisterDesc>,
    /// Size of the shadow space.
    pub shadow_space: u64,
    /// Whether writes below the final stack pointer are purged.
    pub purge_stack: bool,
}

#[derive(Debug, Default)]
struct PathCache {
    /// Transitive successors per block.
    forward: FxHashMap<Vip, FxHashSet<Vip>>,
    /// Transitive predecessors per block.
    backward: FxHashMap<Vip, FxHashSet<Vip>>,
    valid: bool,
}

/// A lifted routine.
#[derive(Debug)]
pub struct Routine {
    pub arch_id: ArchitectureId,
    /// Entry point block.
    pub entry_vip: Vip,
    /// Explored blocks, keyed by entry VIP.
    pub blocks: BTreeMap<Vip, BasicBlock>,
    /// Next internal register identifier; atomic so it can be read and
    /// advanced without holding the routine lock.
    next_internal_id: AtomicU64,
    /// Default convention of the routine itself.
    pub routine_convention: CallConvention,
    /// Convention overrides per VXCALL site.
    pub spec_subroutine_conventions: BTreeMap<Vip, CallConvention>,
    path_cache: RwLock<PathCache>,
}

impl Routine {
    pub fn new(arch_id: ArchitectureId, entry_vip: Vip) -> Routine {
        let mut rtn = Routine {
            arch_id,
            entry_vip,
            blocks: BTreeMap::new(),
            next_internal_id: AtomicU64::new(0),
            routine_convention: CallConvention::default(),
            spec_subroutine_conventions: BTreeMap::new(),
            path_cache: RwLock::new(PathCache::default()),
        };
        rtn.blocks.insert(entry_vip, BasicBlock::new(entry_vip));
        rtn
    }

    pub fn entry_block(&self) -> &BasicBlock {
        &self.blocks[&self.entry_vip]
    }

    pub fn block(&self, vip: Vip) -> Option<&BasicBlock> {
        self.blocks.get(&vip)
    }

    pub fn block_mut(&mut self, vip: Vip) -> Option<&mut BasicBlock> {
        self.flush_paths();
        self.blocks.get_mut(&vip)
    }

    /// Creates (or returns) the block at the given VIP.
    pub fn create_block(&mut self, vip: Vip) -> &mut BasicBlock {
        self.flush_paths();
        self.blocks.entry(vip).or_insert_with(|| BasicBlock::new(vip))
    }

    /// Links `src -> dst`, creating the destination when missing and
    /// inheriting the stack-pointer state on first creation.
    pub fn link(&mut self, src: Vip, dst: Vip) {
        self.flush_paths();
        let (sp_offset, sp_index) = {
            let s = self.blocks.get(&src).expect("link source must exist");
            (s.sp_offset, s.sp_index)
        };
        let created = !self.blocks.contains_key(&dst);
        let d = self.blocks.entry(dst).or_insert_with(|| BasicBlock::new(dst));
        if created {
            d.sp_offset = sp_offset;
            d.sp_index = sp_index;
        }
        if !d.prev.contains(&src) {
            d.prev.push(src);
        }
        let s = self.blocks.get_mut(&src).unwrap();
        if !s.next.contains(&dst) {
            s.next.push(dst);
        }
    }

    /// Deletes a block and unlinks every reference to it.
    pub fn delete_block(&mut self, vip: Vip) {
        self.flush_paths();
        if self.blocks.remove(&vip).is_none() {
            return;
        }
        for blk in self.blocks.values_mut() {
            blk.prev.retain(|&v| v != vip);
            blk.next.retain(|&v| v != vip);
        }
    }

    /// Allocates a unique internal register.
    pub fn alloc(&self, bit_count: u32) -> RegisterDesc {
        let id = self.next_internal_id.fetch_add(1, Ordering::Relaxed);
        RegisterDesc::internal(id, bit_count)
    }

    pub fn last_internal_id(&self) -> u64 {
        self.next_internal_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_internal_id(&self, value: u64) {
        self.next_internal_id.store(value, Ordering::Relaxed);
    }

    /// Convention for the given call site, falling back to the routine's.
    pub fn cconv(&self, vip: Vip) -> &CallConvention {
        self.spec_subroutine_conventions
            .get(&vip)
            .unwrap_or(&self.routine_convention)
    }

    pub fn set_cconv(&mut self, vip: Vip, cc: CallConvention) {
        self.spec_subroutine_conventions.insert(vip, cc);
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_instructions(&self) -> usize {
        self.blocks.values().map(|b| b.len()).sum()
    }

    // -- Path cache --------------------------------------------------------

    fn ensure_paths(&self) {
        {
            let cache = self.path_cache.read().unwrap();
            if cache.valid {
                return;
            }
        }
        let mut cache = self.path_cache.write().unwrap();
        if cache.valid {
            return;
        }
        cache.forward.clear();
        cache.backward.clear();

        // Depth-first closure per block; visited marking breaks cycles.
        for &start in self.blocks.keys() {
            let mut reach = FxHashSet::default();
            let mut stack: Vec<Vip> = self.blocks[&start].next.clone();
            while let Some(v) = stack.pop() {
                if reach.insert(v) {
                    if let Some(blk) = self.blocks.get(&v) {
                        stack.extend(blk.next.iter().copied());
                    }
                }
            }
            for &dst in &reach {
                cache.backward.entry(dst).or_default().insert(start);
            }
            cache.forward.insert(start, reach);
        }
        cache.valid = true;
    }

    /// Invalidates the path cache; called on any CFG mutation.
    pub fn flush_paths(&self) {
        self.path_cache.write().unwrap().valid = false;
    }

    /// Whether `dst` is reachable from `src` following `next` edges.
    pub fn has_path(&self, src: Vip, dst: Vip) -> bool {
        self.ensure_paths();
        let cache = self.path_cache.read().unwrap();
        cache
            .forward
            .get(&src)
            .is_some_and(|set| set.contains(&dst))
    }

    /// Whether `dst` is reachable from `src` following `prev` edges.
    pub fn has_path_bwd(&self, src: Vip, dst: Vip) -> bool {
        self.ensure_paths();
        let cache = self.path_cache.read().unwrap();
        cache
            .backward
            .get(&src)
            .is_some_and(|set| set.contains(&dst))
    }

    /// Whether the block participates in a cycle.
    pub fn is_looping(&self, vip: Vip) -> bool {
        self.has_path(vip, vip)
    }

    /// Enumerates every instruction of the routine with its position.
    pub fn for_each_instruction(&self, mut f: impl FnMut(Vip, usize, &crate::instruction::Instruction)) {
        for (vip, blk) in &self.blocks {
            for (idx, insn) in blk.instructions.iter().enumerate() {
                f(*vip, idx, insn);
            }
        }
    }
}

impl Clone for Routine {
    fn clone(&self) -> Self {
        Routine {
            arch_id: self.arch_id,
            entry_vip: self.entry_vip,
            blocks: self.blocks.clone(),
            next_internal_id: AtomicU64::new(self.last_internal_id()),
            routine_convention: self.routine_convention.clone(),
            spec_subroutine_conventions: self.spec_subroutine_conventions.clone(),
            path_cache: RwLock::new(PathCache::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchitectureId;
    use crate::instruction::Operand;

    fn diamond() -> Routine {
        // 0x1000 -> {0x2000, 0x3000} -> 0x4000
        let mut rtn = Routine::new(ArchitectureId::Virtual, 0x1000);
        rtn.link(0x1000, 0x2000);
        rtn.link(0x1000, 0x3000);
        rtn.link(0x2000, 0x4000);
        rtn.link(0x3000, 0x4000);
        rtn
    }

    #[test]
    fn test_paths() {
        let rtn = diamond();
        assert!(rtn.has_path(0x1000, 0x4000));
        assert!(rtn.has_path(0x1000, 0x2000));
        assert!(!rtn.has_path(0x2000, 0x3000));
        assert!(rtn.has_path_bwd(0x4000, 0x1000));
        assert!(!rtn.has_path_bwd(0x1000, 0x4000));
        assert!(!rtn.is_looping(0x1000));
    }

    #[test]
    fn test_loop_detection() {
        let mut rtn = Routine::new(ArchitectureId::Virtual, 0x1000);
        rtn.link(0x1000, 0x2000);
        rtn.link(0x2000, 0x2000);
        rtn.link(0x2000, 0x3000);
        assert!(rtn.is_looping(0x2000));
        assert!(!rtn.is_looping(0x1000));
    }

    #[test]
    fn test_cache_invalidation() {
        let mut rtn = diamond();
        assert!(rtn.has_path(0x1000, 0x4000));
        rtn.delete_block(0x2000);
        rtn.delete_block(0x3000);
        assert!(!rtn.has_path(0x1000, 0x4000));
    }

    #[test]
    fn test_alloc_internal() {
        let rtn = Routine::new(ArchitectureId::Virtual, 0);
        let a = rtn.alloc(64);
        let b = rtn.alloc(64);
        assert_ne!(a.local_id, b.local_id);
        assert!(a.is_internal());
        assert_eq!(rtn.last_internal_id(), 2);
    }

    #[test]
    fn test_clone_deep() {
        let mut rtn = diamond();
        let r = rtn.alloc(64);
        rtn.block_mut(0x1000)
            .unwrap()
            .mov(r, Operand::imm(1, 64))
            .unwrap();
        let copy = rtn.clone();
        assert_eq!(copy.num_blocks(), rtn.num_blocks());
        assert_eq!(copy.num_instructions(), rtn.num_instructions());
        assert_eq!(copy.last_internal_id(), rtn.last_internal_id());
    }

    #[test]
    fn test_sp_inheritance_on_link() {
        let mut rtn = Routine::new(ArchitectureId::Virtual, 0x1000);
        rtn.block_mut(0x1000).unwrap().shift_sp(-16);
        rtn.link(0x1000, 0x2000);
        assert_eq!(rtn.block(0x2000).unwrap().sp_offset, -16);
    }
}
