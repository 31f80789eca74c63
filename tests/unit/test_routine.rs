//! Routine graph: reachability, lifetime and the instruction surface.

use luceria::arch::{ArchitectureId, RegisterDesc};
use luceria::instruction::Operand;
use luceria::routine::Routine;

fn chain(edges: &[(u64, u64)]) -> Routine {
    let mut rtn = Routine::new(ArchitectureId::Virtual, edges[0].0);
    for &(src, dst) in edges {
        rtn.create_block(src);
        rtn.link(src, dst);
    }
    rtn
}

#[test]
fn test_has_path_matches_reachability() {
    let rtn = chain(&[(1, 2), (2, 3), (3, 4), (2, 5)]);
    // Forward reachability along next edges.
    assert!(rtn.has_path(1, 4));
    assert!(rtn.has_path(1, 5));
    assert!(!rtn.has_path(4, 1));
    assert!(!rtn.has_path(5, 3));
    // Backward reachability along prev edges.
    assert!(rtn.has_path_bwd(4, 1));
    assert!(rtn.has_path_bwd(5, 2));
    assert!(!rtn.has_path_bwd(1, 4));
}

#[test]
fn test_self_loop_query() {
    let rtn = chain(&[(1, 2), (2, 3), (3, 2), (3, 4)]);
    assert!(rtn.is_looping(2));
    assert!(rtn.is_looping(3));
    assert!(!rtn.is_looping(1));
    assert!(!rtn.is_looping(4));
}

#[test]
fn test_mutation_invalidates_cache() {
    let mut rtn = chain(&[(1, 2), (2, 3)]);
    assert!(rtn.has_path(1, 3));
    rtn.delete_block(2);
    assert!(!rtn.has_path(1, 3));
    // Re-linking restores it.
    rtn.link(1, 3);
    assert!(rtn.has_path(1, 3));
}

#[test]
fn test_counter_survives_clone_and_keeps_monotonic() {
    let rtn = Routine::new(ArchitectureId::Virtual, 0);
    let ids: Vec<u64> = (0..16).map(|_| rtn.alloc(64).local_id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len());

    let copy = rtn.clone();
    let next = copy.alloc(64);
    assert!(!ids.contains(&next.local_id));
}

#[test]
fn test_counter_concurrent() {
    use std::sync::Arc;
    let rtn = Arc::new(Routine::new(ArchitectureId::Virtual, 0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let rtn = Arc::clone(&rtn);
            std::thread::spawn(move || (0..64).map(|_| rtn.alloc(8).local_id).collect::<Vec<_>>())
        })
        .collect();
    let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 4 * 64);
}

#[test]
fn test_instruction_emplacement_validated() {
    let mut rtn = Routine::new(ArchitectureId::Virtual, 0x1000);
    let r = rtn.alloc(64);
    let blk = rtn.block_mut(0x1000).unwrap();
    assert!(blk.mov(r, Operand::imm(1, 64)).is_ok());
    // The undefined register is read-only as a destination.
    assert!(blk.mov(luceria::REG_IMGBASE, Operand::imm(1, 64)).is_err());
    assert_eq!(rtn.num_instructions(), 1);
}

#[test]
fn test_enumeration() {
    let mut rtn = chain(&[(1, 2)]);
    let r = RegisterDesc::virt(1, 64);
    rtn.block_mut(1).unwrap().mov(r, Operand::imm(1, 64)).unwrap();
    rtn.block_mut(2).unwrap().mov(r, Operand::imm(2, 64)).unwrap();
    let mut seen = Vec::new();
    rtn.for_each_instruction(|vip, idx, insn| seen.push((vip, idx, insn.base.name)));
    assert_eq!(seen, vec![(1, 0, "mov"), (2, 0, "mov")]);
}
