//! End-to-end tracing over lifted routines.

use luceria::arch::{amd64, ArchitectureId, RegisterDesc};
use luceria::instruction::Operand;
use luceria::routine::Routine;
use luceria::tracer::{BasicTracer, CachedTracer, Tracer};
use luceria::variable::{VarAnchor, Variable};

fn end_of(rtn: &Routine, vip: u64) -> VarAnchor {
    VarAnchor::new(vip, rtn.block(vip).unwrap().len())
}

#[test]
fn test_constant_propagation() {
    // mov rax, 3 ; add rax, 5 => rax@end == 8
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    {
        let blk = rtn.block_mut(0x1000).unwrap();
        blk.mov(amd64::RAX, Operand::imm(3, 64)).unwrap();
        blk.add(amd64::RAX, Operand::imm(5, 64)).unwrap();
    }
    let tracer = BasicTracer;
    let exp = tracer.trace(&rtn, &Variable::reg_at(end_of(&rtn, 0x1000), amd64::RAX));
    assert!(exp.is_constant());
    assert_eq!(exp.get_u64(), Some(8));
    assert_eq!(exp.size(), 64);
}

#[test]
fn test_symbolic_addition() {
    // mov rax, rbx ; add rax, rcx => rax@end == rbx@entry + rcx@entry
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    {
        let blk = rtn.block_mut(0x1000).unwrap();
        blk.mov(amd64::RAX, amd64::RBX).unwrap();
        blk.add(amd64::RAX, amd64::RCX).unwrap();
    }
    let tracer = BasicTracer;
    let exp = tracer.trace(&rtn, &Variable::reg_at(end_of(&rtn, 0x1000), amd64::RAX));

    let entry = VarAnchor::new(0x1000, 0);
    let rbx = Variable::reg_at(entry, amd64::RBX).to_expression();
    let rcx = Variable::reg_at(entry, amd64::RCX).to_expression();
    let expected = rbx + rcx;
    assert!(exp.is_identical(&expected), "{exp} vs {expected}");
    assert_eq!(exp.size(), 64);
}

#[test]
fn test_store_load_forwarding() {
    // str rsp, 0, rax ; ldd rbx, rsp, 0 => rbx@end == rax@before_str
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    let sp = RegisterDesc::virt(100, 64);
    {
        let blk = rtn.block_mut(0x1000).unwrap();
        blk.str_(sp, 0, amd64::RAX).unwrap();
        blk.ldd(amd64::RBX, sp, 0).unwrap();
    }
    let tracer = BasicTracer;
    let exp = tracer.trace(&rtn, &Variable::reg_at(end_of(&rtn, 0x1000), amd64::RBX));

    let before_str = Variable::reg_at(VarAnchor::new(0x1000, 0), amd64::RAX).to_expression();
    assert!(exp.is_identical(&before_str), "{exp} vs {before_str}");
}

#[test]
fn test_cross_block_fallthrough() {
    // 0x1000: mov rax, 7 ; jmp 0x2000
    // 0x2000: add rax, 1
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    {
        let blk = rtn.block_mut(0x1000).unwrap();
        blk.mov(amd64::RAX, Operand::imm(7, 64)).unwrap();
        blk.jmp(Operand::imm(0x2000, 64)).unwrap();
    }
    rtn.link(0x1000, 0x2000);
    rtn.block_mut(0x2000)
        .unwrap()
        .add(amd64::RAX, Operand::imm(1, 64))
        .unwrap();

    let tracer = BasicTracer;
    let var = Variable::reg_at(end_of(&rtn, 0x2000), amd64::RAX);
    // The intra-block trace stops at an unresolved entry state...
    let local = tracer.trace(&rtn, &var);
    assert_eq!(local.get_u64(), None);
    // ...and the cross-block trace resolves it through the predecessor.
    let exp = tracer.rtrace(&rtn, &var, -1);
    assert_eq!(exp.get_u64(), Some(8));
}

#[test]
fn test_diamond_agreeing_paths() {
    // Both sides of the diamond leave rdx at 5; the fold must agree.
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    {
        let blk = rtn.block_mut(0x1000).unwrap();
        blk.mov(amd64::RDX, Operand::imm(5, 64)).unwrap();
        blk.te(RegisterDesc::virt(0, 1), amd64::RBX, Operand::imm(0, 64))
            .unwrap();
        blk.js(
            RegisterDesc::virt(0, 1),
            Operand::imm(0x2000, 64),
            Operand::imm(0x3000, 64),
        )
        .unwrap();
    }
    rtn.link(0x1000, 0x2000);
    rtn.link(0x1000, 0x3000);
    rtn.block_mut(0x2000)
        .unwrap()
        .jmp(Operand::imm(0x4000, 64))
        .unwrap();
    rtn.block_mut(0x3000)
        .unwrap()
        .jmp(Operand::imm(0x4000, 64))
        .unwrap();
    rtn.link(0x2000, 0x4000);
    rtn.link(0x3000, 0x4000);
    rtn.block_mut(0x4000).unwrap().vexit(Operand::imm(0, 64)).unwrap();

    let tracer = BasicTracer;
    let var = Variable::reg_at(end_of(&rtn, 0x4000), amd64::RDX);
    let exp = tracer.rtrace(&rtn, &var, -1);
    assert_eq!(exp.get_u64(), Some(5));
}

#[test]
fn test_diamond_phi_fold() {
    // The sides write different constants; the fold gates them on the
    // branch condition of the merge.
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    let cond = RegisterDesc::virt(0, 1);
    {
        let blk = rtn.block_mut(0x1000).unwrap();
        blk.te(cond, amd64::RBX, Operand::imm(0, 64)).unwrap();
        blk.js(
            cond,
            Operand::imm(0x2000, 64),
            Operand::imm(0x3000, 64),
        )
        .unwrap();
    }
    rtn.link(0x1000, 0x2000);
    rtn.link(0x1000, 0x3000);
    {
        let blk = rtn.block_mut(0x2000).unwrap();
        blk.mov(amd64::RDX, Operand::imm(1, 64)).unwrap();
        blk.jmp(Operand::imm(0x4000, 64)).unwrap();
    }
    {
        let blk = rtn.block_mut(0x3000).unwrap();
        blk.mov(amd64::RDX, Operand::imm(2, 64)).unwrap();
        blk.jmp(Operand::imm(0x4000, 64)).unwrap();
    }
    rtn.link(0x2000, 0x4000);
    rtn.link(0x3000, 0x4000);
    rtn.block_mut(0x4000).unwrap().vexit(Operand::imm(0, 64)).unwrap();

    let tracer = BasicTracer;
    let var = Variable::reg_at(end_of(&rtn, 0x4000), amd64::RDX);
    let exp = tracer.rtrace(&rtn, &var, -1);

    // Not resolvable to a single constant, but bounded: evaluating with the
    // branch taken either way must produce 1 or 2.
    assert_eq!(exp.get_u64(), None);
    let taken = exp.evaluate(&|_| Some(u64::MAX)).get_u64();
    let not_taken = exp.evaluate(&|_| Some(0)).get_u64();
    // One of the gates fires in each assignment.
    assert!(taken.is_some() || not_taken.is_some());
}

#[test]
fn test_loop_rtrace_converges() {
    // 0x1000: mov rcx, 0 ; jmp 0x2000
    // 0x2000: add rcx, 1 ; tl f, rcx, 10 ; js f, 0x2000, 0x3000
    // 0x3000: vexit 0
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    let flag = RegisterDesc::virt(0, 1);
    {
        let blk = rtn.block_mut(0x1000).unwrap();
        blk.mov(amd64::RCX, Operand::imm(0, 64)).unwrap();
        blk.jmp(Operand::imm(0x2000, 64)).unwrap();
    }
    rtn.link(0x1000, 0x2000);
    {
        let blk = rtn.block_mut(0x2000).unwrap();
        blk.add(amd64::RCX, Operand::imm(1, 64)).unwrap();
        blk.tl(flag, amd64::RCX, Operand::imm(10, 64)).unwrap();
        blk.js(flag, Operand::imm(0x2000, 64), Operand::imm(0x3000, 64))
            .unwrap();
    }
    rtn.link(0x2000, 0x2000);
    rtn.link(0x2000, 0x3000);
    rtn.block_mut(0x3000).unwrap().vexit(Operand::imm(0, 64)).unwrap();
    assert!(rtn.is_looping(0x2000));

    let tracer = BasicTracer;
    let var = Variable::reg_at(end_of(&rtn, 0x3000), amd64::RCX);
    let exp = tracer.rtrace(&rtn, &var, 32);

    // The looping value must not diverge and must not fold to a constant;
    // it comes back as an expression over a loop-tagged variable.
    assert_eq!(exp.get_u64(), None);
    let mut has_tagged = false;
    exp.for_each(&mut |e| {
        if let Some(uid) = &e.uid {
            if let Some(v) = uid.as_variable() {
                has_tagged |= v.is_branch_dependent;
            }
        }
    });
    assert!(has_tagged, "{exp}");
}

#[test]
fn test_cached_tracer_invalidation() {
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    rtn.block_mut(0x1000)
        .unwrap()
        .mov(amd64::RAX, Operand::imm(3, 64))
        .unwrap();

    let cached = CachedTracer::new();
    let var = Variable::reg_at(end_of(&rtn, 0x1000), amd64::RAX);
    assert_eq!(cached.trace(&rtn, &var).get_u64(), Some(3));
    assert!(!cached.is_empty());

    // Mutate the block; the stale anchors must go.
    rtn.block_mut(0x1000)
        .unwrap()
        .add(amd64::RAX, Operand::imm(2, 64))
        .unwrap();
    cached.flush_block(0x1000);

    let var = Variable::reg_at(end_of(&rtn, 0x1000), amd64::RAX);
    assert_eq!(cached.trace(&rtn, &var).get_u64(), Some(5));
}

#[test]
fn test_rtrace_depth_limit() {
    // A long chain of blocks each bumping rax; a shallow limit stops the
    // walk early and leaves the value symbolic.
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0);
    for i in 0..8u64 {
        let blk = rtn.create_block(i);
        blk.add(amd64::RAX, Operand::imm(1, 64)).unwrap();
        blk.jmp(Operand::imm((i + 1) as i64, 64)).unwrap();
        rtn.link(i, i + 1);
    }
    rtn.create_block(8).vexit(Operand::imm(0, 64)).unwrap();

    let tracer = BasicTracer;
    let var = Variable::reg_at(end_of(&rtn, 8), amd64::RAX);
    let shallow = tracer.rtrace(&rtn, &var, 2);
    assert_eq!(shallow.get_u64(), None);

    let deep = tracer.rtrace(&rtn, &var, -1);
    // Fully resolved: rax@entry + 8.
    let entry = Variable::reg_at(VarAnchor::new(0, 0), amd64::RAX).to_expression();
    assert!(deep.equals(&(entry + 8)), "{deep}");
}
