//! Container round-trips.

use luceria::arch::{amd64, ArchitectureId, RegisterDesc};
use luceria::instruction::Operand;
use luceria::routine::{CallConvention, Routine};
use luceria::serialize::{load_routine, save_routine, CONTAINER_MAGIC};

fn sample_routine() -> Routine {
    let mut rtn = Routine::new(ArchitectureId::Amd64, 0x1000);
    let tmp = rtn.alloc(32);
    {
        let blk = rtn.block_mut(0x1000).unwrap();
        blk.label_begin(0x4010_0000);
        blk.mov(amd64::RAX, Operand::imm(-3, 64)).unwrap();
        blk.shift_sp(-8);
        blk.str_(luceria::REG_SP, 0, amd64::RAX).unwrap();
        blk.mov(tmp, Operand::imm(0x7FFF_FFFF, 32)).unwrap();
        blk.te(RegisterDesc::virt(0, 1), amd64::RAX, Operand::imm(0, 64))
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
    {
        let blk = rtn.block_mut(0x2000).unwrap();
        blk.ldd(amd64::RBX, luceria::REG_SP, 0).unwrap();
        blk.jmp(Operand::imm(0x3000, 64)).unwrap();
    }
    rtn.link(0x2000, 0x3000);
    rtn.block_mut(0x3000)
        .unwrap()
        .vexit(Operand::imm(0, 64))
        .unwrap();

    rtn.routine_convention = CallConvention {
        volatile_registers: vec![amd64::RCX, amd64::RDX],
        param_registers: vec![amd64::RCX],
        retval_registers: vec![amd64::RAX],
        frame_register: Some(amd64::RBP),
        shadow_space: 0x20,
        purge_stack: true,
    };
    rtn.set_cconv(
        0x4010_0000,
        CallConvention {
            retval_registers: vec![amd64::RAX],
            ..CallConvention::default()
        },
    );
    rtn
}

#[test]
fn test_roundtrip_preserves_everything() {
    let rtn = sample_routine();
    let data = save_routine(&rtn);
    assert_eq!(&data[0..4], CONTAINER_MAGIC);

    let loaded = load_routine(&data).unwrap();
    assert_eq!(loaded.arch_id, rtn.arch_id);
    assert_eq!(loaded.entry_vip, rtn.entry_vip);
    assert_eq!(loaded.last_internal_id(), rtn.last_internal_id());
    assert_eq!(loaded.blocks, rtn.blocks);
    assert_eq!(loaded.routine_convention, rtn.routine_convention);
    assert_eq!(
        loaded.spec_subroutine_conventions,
        rtn.spec_subroutine_conventions
    );

    // Serializing the reloaded routine is byte-identical.
    assert_eq!(save_routine(&loaded), data);
}

#[test]
fn test_roundtrip_preserves_instruction_metadata() {
    let rtn = sample_routine();
    let loaded = load_routine(&save_routine(&rtn)).unwrap();

    let blk = loaded.block(0x1000).unwrap();
    assert_eq!(blk.instructions[0].vip, 0x4010_0000);
    assert_eq!(blk.instructions[0].sp_offset, 0);
    // The store emitted after the stack shift carries the new offset.
    assert_eq!(blk.instructions[1].sp_offset, -8);
    assert_eq!(blk.prev, Vec::<u64>::new());
    assert_eq!(blk.next, vec![0x2000, 0x3000]);
}

#[test]
fn test_malformed_inputs_rejected() {
    let rtn = sample_routine();
    let data = save_routine(&rtn);

    // Bad magic.
    let mut bad = data.clone();
    bad[0] = b'X';
    assert!(load_routine(&bad).is_err());

    // Bad version.
    let mut bad = data.clone();
    bad[4] = 0xFF;
    assert!(load_routine(&bad).is_err());

    // Truncation anywhere must not panic.
    for cut in [0, 3, 8, 20, data.len() / 2, data.len() - 1] {
        assert!(load_routine(&data[..cut]).is_err(), "cut={cut}");
    }
}

#[test]
fn test_unknown_opcode_rejected() {
    let rtn = sample_routine();
    let mut data = save_routine(&rtn);
    // The first opcode name in the stream is "mov"; corrupt it.
    let pos = data.windows(3).position(|w| w == b"mov").unwrap();
    data[pos] = b'q';
    assert!(load_routine(&data).is_err());
}
