//! Single-processor pipeline integration tests: architectural results,
//! forwarding, exceptions, and recovery, end to end through the cache
//! hierarchy.

mod common;

use common::{machine, r, run, Prog, RESULT_ADDR, SHARED_DATA, TEXT_BASE};
use mpsim_core::common::{ExceptionCode, VirtAddr};
use mpsim_core::cpu::regfile::Bank;
use mpsim_core::isa::regs::arch;
use mpsim_core::isa::Opcode;

#[test]
fn arithmetic_chain_commits_architecturally() {
    // R1: committing then reading a register yields the value written.
    let mut p = Prog::new();
    p.set(r::L0, 10);
    p.alu_imm(Opcode::Add, r::L1, r::L0, 32); // %l1 = 42
    p.set(r::L2, RESULT_ADDR as u32);
    p.st(r::L1, r::L2, 0);
    p.exit_with(0);

    let mut sim = machine(p, 1, |_| {});
    let status = run(&mut sim);
    assert_eq!(status.code, 0);
    assert_eq!(sim.space.read(0, VirtAddr(RESULT_ADDR), 4), Some(42));

    // The committed logical register agrees with memory.
    let proc = &sim.procs[0];
    let l1 = proc.regs.map.to_logical(proc.regs.cwp, r::L1);
    assert_eq!(proc.regs.read_logical(Bank::Int, l1), 42);
}

#[test]
fn store_to_load_forwarding_same_processor() {
    // R2: a store followed by a load to the same address sees the store,
    // under the default model and under SC.
    for model in ["RC", "SC"] {
        let mut p = Prog::new();
        p.set(r::L0, SHARED_DATA as u32);
        p.set(r::L1, 1234);
        p.st(r::L1, r::L0, 0);
        p.ld(r::L2, r::L0, 0);
        p.set(r::L3, RESULT_ADDR as u32);
        p.st(r::L2, r::L3, 0);
        p.exit_with(0);

        let mut sim = machine(p, 1, |cfg| {
            cfg.system.consistency_model = match model {
                "SC" => mpsim_core::config::ConsistencyModel::Sc,
                _ => mpsim_core::config::ConsistencyModel::Rc,
            };
        });
        let status = run(&mut sim);
        assert_eq!(status.code, 0, "model {model}");
        assert_eq!(
            sim.space.read(0, VirtAddr(RESULT_ADDR), 4),
            Some(1234),
            "model {model}"
        );
    }
}

#[test]
fn umulcc_serialized_retire_results() {
    // S4: UMULcc 0xFFFFFFFF * 2 → rd 0xFFFFFFFE, %y = 1, ICC.N set.
    let mut p = Prog::new();
    p.set(r::L0, 0xFFFF_FFFF);
    p.alu_imm(Opcode::UMulCc, r::L1, r::L0, 2);
    // Read %y back through the architectural register.
    p.push(mpsim_core::isa::Instr {
        op: Opcode::RdY,
        rd: r::L2,
        rscc: arch::Y,
        ..mpsim_core::isa::Instr::default()
    });
    p.set(r::L3, RESULT_ADDR as u32);
    p.st(r::L1, r::L3, 0);
    p.st(r::L2, r::L3, 4);
    p.exit_with(0);

    let mut sim = machine(p, 1, |_| {});
    let status = run(&mut sim);
    assert_eq!(status.code, 0);
    assert_eq!(
        sim.space.read(0, VirtAddr(RESULT_ADDR), 4),
        Some(0xFFFF_FFFE)
    );
    assert_eq!(sim.space.read(0, VirtAddr(RESULT_ADDR + 4), 4), Some(1));

    let proc = &sim.procs[0];
    let icc = proc.regs.map.state_logical(arch::ICC);
    let cc = proc.regs.read_logical(Bank::Int, icc);
    assert_eq!(cc & 0x8, 0x8, "ICC.N set");
    assert_eq!(cc & 0x7, 0, "ICC.Z/V/C clear");
}

#[test]
fn divide_by_zero_faults_at_retire() {
    // S3: SDIVcc with rs2 = 0 → Div0 at retire; destination unwritten.
    let mut p = Prog::new();
    p.set(r::L0, 1);
    p.alu(Opcode::SDivCc, r::L1, r::L0, 0); // %g0 = 0 divisor
    p.set(r::L2, 0xdead); // younger work, squashed
    p.exit_with(0);

    let mut sim = machine(p, 1, |_| {});
    let status = run(&mut sim);
    assert_ne!(status.code, 0);
    assert_eq!(status.fault, Some(ExceptionCode::Div0));

    let proc = &sim.procs[0];
    let l1 = proc.regs.map.to_logical(proc.regs.cwp, r::L1);
    assert_eq!(proc.regs.read_logical(Bank::Int, l1), 0, "rd not written");
    assert!(proc.stats.squashes >= 1, "younger instructions squashed");
}

#[test]
fn unmapped_load_segfaults() {
    // S2: a load of an unmapped, non-stack address raises SegV at retire.
    let mut p = Prog::new();
    p.set(r::L0, 0x2000);
    p.ld(r::L1, r::L0, 0);
    p.exit_with(0);

    let mut sim = machine(p, 1, |_| {});
    let status = run(&mut sim);
    assert_ne!(status.code, 0);
    assert_eq!(status.fault, Some(ExceptionCode::SegV));
}

#[test]
fn stack_access_grows_mapping_and_retries() {
    // A store just under the mapped stack page faults once, grows the
    // mapping, and the program completes.
    let mut sim = {
        let mut p = Prog::new();
        p.set(r::L0, 0x7ff0_0000); // deep in the stack region, unmapped
        p.set(r::L1, 7);
        p.st(r::L1, r::L0, 0);
        p.ld(r::L2, r::L0, 0);
        p.set(r::L3, RESULT_ADDR as u32);
        p.st(r::L2, r::L3, 0);
        p.exit_with(0);
        machine(p, 1, |_| {})
    };
    let status = run(&mut sim);
    assert_eq!(status.code, 0);
    assert_eq!(sim.space.read(0, VirtAddr(RESULT_ADDR), 4), Some(7));
    assert!(sim.procs[0].stats.stack_grows >= 1);
}

#[test]
fn countdown_loop_and_mispredict_recovery() {
    // Loop three times; the exit iteration mispredicts the weakly-taken
    // counter branch at least once and recovery must be exact.
    let mut p = Prog::new();
    p.set(r::L0, 3);
    p.set(r::L1, 0);
    let top = p.here();
    p.alu_imm(Opcode::Add, r::L1, r::L1, 10); // accumulate per iteration
    p.alu_imm(Opcode::SubCc, r::L0, r::L0, 1);
    p.bicc_to(9, top); // bne
    p.nop(); // delay slot
    p.set(r::L2, RESULT_ADDR as u32);
    p.st(r::L1, r::L2, 0);
    p.exit_with(0);

    let mut sim = machine(p, 1, |_| {});
    let status = run(&mut sim);
    assert_eq!(status.code, 0);
    assert_eq!(sim.space.read(0, VirtAddr(RESULT_ADDR), 4), Some(30));
    let proc = &sim.procs[0];
    assert!(proc.stats.mispredicts >= 1);
    assert!(proc.bp.lookups >= 3);
}

#[test]
fn save_restore_window_aliasing() {
    // %o1 written before SAVE is read as %i1 after it.
    let mut p = Prog::new();
    p.alu_imm(Opcode::Or, r::O1, 0, 77);
    p.save();
    p.set(r::L2, RESULT_ADDR as u32);
    p.st(r::I1, r::L2, 0);
    p.restore();
    p.exit_with(0);

    let mut sim = machine(p, 1, |_| {});
    let status = run(&mut sim);
    assert_eq!(status.code, 0);
    assert_eq!(sim.space.read(0, VirtAddr(RESULT_ADDR), 4), Some(77));
}

#[test]
fn deep_call_chain_takes_window_traps() {
    // Four SAVEs on a 4-window machine overflow twice (the reserve-window
    // rule traps one frame early); the deepest frame's locals alias the
    // outermost frame's window, so the spill is load-bearing: without it,
    // the outermost %l5 would come back clobbered.
    let mut p = Prog::new();
    p.set(r::L5, 77); // outermost frame's local
    p.save();
    p.save();
    p.save(); // overflow: spills the outermost window
    p.save(); // overflow again; this frame reuses the outermost window
    p.set(r::L5, 11); // clobbers the shared window storage
    p.restore();
    p.restore();
    p.restore(); // underflow: refill
    p.restore(); // underflow: refill restores the outermost frame
    p.set(r::L2, RESULT_ADDR as u32);
    p.st(r::L5, r::L2, 0);
    p.exit_with(0);

    let mut sim = machine(p, 1, |cfg| {
        cfg.processor.num_windows = 4;
    });
    let status = run(&mut sim);
    assert_eq!(status.code, 0);
    assert_eq!(status.fault, None, "window traps are soft, not fatal");
    assert_eq!(
        sim.space.read(0, VirtAddr(RESULT_ADDR), 4),
        Some(77),
        "spill/refill must preserve the displaced window"
    );
    let proc = &sim.procs[0];
    assert_eq!(
        proc.stats.window_traps, 4,
        "two overflows and two underflows taken at retire"
    );
}

#[test]
fn bad_pc_fetch_faults() {
    // Jump far outside the text segment: BadPc delivered at retire.
    let mut p = Prog::new();
    p.set(r::L0, (TEXT_BASE as u32) + 0x8000);
    p.push(mpsim_core::isa::Instr {
        op: Opcode::Jmpl,
        rd: 0,
        rs1: r::L0,
        aux1: 1,
        imm: 0,
        uncond_branch: 1,
        ..mpsim_core::isa::Instr::default()
    });
    p.nop(); // delay slot
    p.exit_with(0);

    let mut sim = machine(p, 1, |_| {});
    let status = run(&mut sim);
    assert_ne!(status.code, 0);
    assert_eq!(status.fault, Some(ExceptionCode::BadPc));
}
