//! Shared harness for the integration tests: a tiny assembler for
//! predecoded programs and a one-call machine builder.
//!
//! Programs are sequences of static instruction records, exactly what the
//! predecoder would emit. The builder starts every processor at the same
//! entry PC; SPMD tests steer per-processor behavior through a per-process
//! "role" word planted in private memory before the run.

#![allow(dead_code)]

use mpsim_core::common::VirtAddr;
use mpsim_core::config::Config;
use mpsim_core::isa::regs::arch;
use mpsim_core::isa::{Instr, InstrFile, Opcode, Wpc};
use mpsim_core::mem::addrspace::AddrSpace;
use mpsim_core::Simulator;

/// Base of the text segment used by all test programs.
pub const TEXT_BASE: u64 = 0x1_0000;
/// Private scratch page (per-process region).
pub const PRIV_BASE: u64 = 0x2_0000;
/// The per-process role word.
pub const ROLE_ADDR: u64 = PRIV_BASE;
/// Private result words.
pub const RESULT_ADDR: u64 = PRIV_BASE + 0x40;
/// A shared data word.
pub const SHARED_DATA: u64 = 0x8000_1000;
/// A shared flag word (different line from the data).
pub const SHARED_FLAG: u64 = 0x8000_1040;

/// Architectural register shorthands.
pub mod r {
    /// %o0 (exit code).
    pub const O0: u8 = 8;
    /// %l0..%l7.
    pub const L0: u8 = 16;
    pub const L1: u8 = 17;
    pub const L2: u8 = 18;
    pub const L3: u8 = 19;
    pub const L4: u8 = 20;
    pub const L5: u8 = 21;
    pub const L6: u8 = 22;
    pub const L7: u8 = 23;
    /// %i1 (aliases the caller's %o1 across SAVE).
    pub const I1: u8 = 25;
    /// %o1.
    pub const O1: u8 = 9;
}

/// A small program under construction.
pub struct Prog {
    instrs: Vec<Instr>,
}

impl Prog {
    pub fn new() -> Self {
        Self { instrs: Vec::new() }
    }

    /// Word index of the next instruction (branch-target bookkeeping).
    pub fn here(&self) -> usize {
        self.instrs.len()
    }

    pub fn push(&mut self, i: Instr) -> &mut Self {
        self.instrs.push(i);
        self
    }

    /// `sethi`-style load of a 32-bit constant into rd.
    pub fn set(&mut self, rd: u8, value: u32) -> &mut Self {
        self.push(Instr {
            op: Opcode::Sethi,
            rd,
            imm: value as i32,
            ..Instr::default()
        })
    }

    /// Register-immediate ALU op.
    pub fn alu_imm(&mut self, op: Opcode, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        let rcc = if opcode_sets_icc(op) { arch::ICC } else { 0 };
        self.push(Instr {
            op,
            rd,
            rcc,
            rs1,
            rscc: opcode_reads_cc(op),
            aux1: 1,
            imm,
            ..Instr::default()
        })
    }

    /// Register-register ALU op.
    pub fn alu(&mut self, op: Opcode, rd: u8, rs1: u8, rs2: u8) -> &mut Self {
        let rcc = if opcode_sets_icc(op) { arch::ICC } else { 0 };
        self.push(Instr {
            op,
            rd,
            rcc,
            rs1,
            rs2,
            rscc: opcode_reads_cc(op),
            ..Instr::default()
        })
    }

    /// Load word at `[rs1 + imm]` into rd.
    pub fn ld(&mut self, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        self.push(Instr {
            op: Opcode::Lduw,
            rd,
            rs1,
            aux1: 1,
            imm,
            ..Instr::default()
        })
    }

    /// Store word rd to `[rs1 + imm]`.
    pub fn st(&mut self, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        self.push(Instr {
            op: Opcode::Stw,
            rd,
            rs1,
            aux1: 1,
            imm,
            ..Instr::default()
        })
    }

    /// Conditional branch on icc to an absolute word index.
    pub fn bicc_to(&mut self, cond: u8, target_word: usize) -> &mut Self {
        let disp = (target_word as i64 - self.here() as i64) * 4;
        self.push(Instr {
            op: Opcode::Bicc,
            rscc: arch::ICC,
            aux1: cond as i16,
            imm: disp as i32,
            cond_branch: !matches!(cond, 0 | 8),
            ..Instr::default()
        })
    }

    /// Re-aims a previously emitted branch at an absolute word index.
    pub fn patch_branch(&mut self, at: usize, target_word: usize) {
        let disp = (target_word as i64 - at as i64) * 4;
        self.instrs[at].imm = disp as i32;
    }

    /// MEMBAR with the given ordering mask.
    pub fn membar(&mut self, mask: i32) -> &mut Self {
        self.push(Instr {
            op: Opcode::Membar,
            imm: mask,
            ..Instr::default()
        })
    }

    /// No-op (delay-slot filler).
    pub fn nop(&mut self) -> &mut Self {
        self.set(0, 0)
    }

    /// SAVE / RESTORE.
    pub fn save(&mut self) -> &mut Self {
        self.push(Instr {
            op: Opcode::Save,
            rd: 0,
            rs1: 0,
            aux1: 1,
            wpchange: Wpc::Save,
            ..Instr::default()
        })
    }

    pub fn restore(&mut self) -> &mut Self {
        self.push(Instr {
            op: Opcode::Restore,
            rd: 0,
            rs1: 0,
            aux1: 1,
            wpchange: Wpc::Restore,
            ..Instr::default()
        })
    }

    /// Exit with the value already in %o0 (trap 0), delay slot included.
    pub fn exit(&mut self) -> &mut Self {
        self.push(Instr {
            op: Opcode::Tcc,
            rscc: arch::ICC,
            aux1: 8,
            imm: 0,
            ..Instr::default()
        });
        self.nop()
    }

    /// Set %o0 to `code` and exit.
    pub fn exit_with(&mut self, code: i32) -> &mut Self {
        self.alu_imm(Opcode::Or, r::O0, 0, code);
        self.exit()
    }

    pub fn build(self) -> InstrFile {
        InstrFile::from_instrs(
            VirtAddr(TEXT_BASE),
            VirtAddr(TEXT_BASE),
            self.instrs,
        )
    }
}

fn opcode_sets_icc(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::AddCc
            | Opcode::SubCc
            | Opcode::AndCc
            | Opcode::OrCc
            | Opcode::XorCc
            | Opcode::UMulCc
            | Opcode::SMulCc
            | Opcode::MulSCc
            | Opcode::SDivCc
            | Opcode::UDivCc
    )
}

fn opcode_reads_cc(op: Opcode) -> u8 {
    match op {
        Opcode::AddC | Opcode::AddCCc | Opcode::SubC | Opcode::SubCCc => arch::ICC,
        Opcode::UDiv | Opcode::SDiv | Opcode::UDivCc | Opcode::SDivCc => arch::Y,
        _ => 0,
    }
}

/// Builds a machine for `num_procs` nodes running `prog`, with the shared
/// test page and a private scratch page per node mapped and zeroed. The
/// role word of proc `p` is set to `p`.
pub fn machine(prog: Prog, num_procs: usize, tweak: impl FnOnce(&mut Config)) -> Simulator {
    let mut cfg = Config::default();
    cfg.system.num_procs = num_procs;
    tweak(&mut cfg);

    let mut space = AddrSpace::new(num_procs);
    space.map_range(0, VirtAddr(SHARED_DATA), 0x1000);
    for p in 0..num_procs {
        space.map_range(p, VirtAddr(PRIV_BASE), 0x1000);
        assert!(space.write(p, VirtAddr(ROLE_ADDR), 4, p as u64));
        let top = space.stack_top();
        space.map_range(p, VirtAddr(top - space.page_size()), space.page_size());
    }

    Simulator::new(cfg, prog.build(), space).expect("machine construction")
}

/// Runs to completion with a generous cycle bound, panicking on fatal
/// simulator errors or timeout.
pub fn run(sim: &mut Simulator) -> mpsim_core::sim::ExitStatus {
    let status = sim.run(Some(2_000_000.0)).expect("simulator fatal");
    assert!(
        sim.procs.iter().all(|p| p.finished()),
        "timeout: processors still running"
    );
    status
}
