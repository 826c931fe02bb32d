//! Per-opcode functional execution.
//!
//! [`execute`] is the dispatch table the execute stage indexes by opcode: it
//! reads the instance's operand values, writes the result and
//! condition-code values, resolves branches, computes effective addresses,
//! and flags exceptions. It touches nothing outside the instance — memory
//! values arrive later through the memory system, and architectural state
//! changes only at retire.
//!
//! The deprecated condition-code multiplies (UMULcc/SMULcc/MULScc) only
//! flag `SerializeAfterRetire` here; [`execute_serialized`] computes them
//! for the retire stage once the instruction is the oldest in the machine,
//! so no condition code for them ever exists mid-pipeline.
//!
//! Floating point runs on the host FPU; IEEE exceptions are sampled through
//! the C floating-point environment around each operation.

use crate::common::{ExceptionCode, VirtAddr};
use crate::isa::regs::icc;
use crate::isa::{membar, MemClass, Opcode};

use super::instance::{Instance, MemProgress};

unsafe extern "C" {
    fn feclearexcept(excepts: i32) -> i32;
    fn fetestexcept(excepts: i32) -> i32;
}

/// FE_INVALID | FE_DIVBYZERO | FE_OVERFLOW on the platforms we run on.
const FE_TROUBLE: i32 = 0x01 | 0x04 | 0x08;

/// Runs a host FP computation, flagging `FpError` if it raises an IEEE
/// exception the program would trap on.
fn host_fp<T>(inst: &mut Instance, f: impl FnOnce() -> T) -> T {
    // SAFETY: fe*except only touch the thread's FP environment.
    unsafe {
        let _ = feclearexcept(FE_TROUBLE);
    }
    let v = f();
    // SAFETY: as above.
    let raised = unsafe { fetestexcept(FE_TROUBLE) };
    if raised != 0 {
        inst.exception = ExceptionCode::FpError;
    }
    v
}

#[inline]
fn f32_of(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

#[inline]
fn f64_of(bits: u64) -> f64 {
    f64::from_bits(bits)
}

/// Condition codes of a 32-/64-bit add or subtract, CCR layout
/// `(xcc << 4) | icc`, each nibble NZVC.
fn add_cc(a: u64, b: u64, r: u64, sub: bool) -> u64 {
    let nzvc = |a: u64, b: u64, r: u64, bits: u32| -> u64 {
        let sign = 1u64 << (bits - 1);
        let mask = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
        let (a, b, r) = (a & mask, b & mask, r & mask);
        let mut cc = 0;
        if r & sign != 0 {
            cc |= icc::N;
        }
        if r == 0 {
            cc |= icc::Z;
        }
        let (bv, carry) = if sub {
            // Overflow if operand signs differ and the result sign matches b.
            (
                ((a ^ b) & (a ^ r)) & sign != 0,
                b > a,
            )
        } else {
            (((!(a ^ b)) & (a ^ r)) & sign != 0, r < a)
        };
        if bv {
            cc |= icc::V;
        }
        if carry {
            cc |= icc::C;
        }
        cc
    };
    (nzvc(a, b, r, 64) << 4) | nzvc(a, b, r, 32)
}

/// Condition codes of a logical result (V and C always clear).
fn logic_cc(r: u64) -> u64 {
    let mut lo = 0;
    if r as u32 == 0 {
        lo |= icc::Z;
    }
    if (r as u32) & 0x8000_0000 != 0 {
        lo |= icc::N;
    }
    let mut hi = 0;
    if r == 0 {
        hi |= icc::Z;
    }
    if r & (1 << 63) != 0 {
        hi |= icc::N;
    }
    (hi << 4) | lo
}

/// Evaluates a SPARC integer condition against a CCR-layout value.
///
/// `use_xcc` selects the 64-bit nibble (BPcc with cc1 set).
pub fn int_cond(cond: u8, ccr: u64, use_xcc: bool) -> bool {
    let cc = if use_xcc { (ccr >> 4) & 0xf } else { ccr & 0xf };
    let n = cc & icc::N != 0;
    let z = cc & icc::Z != 0;
    let v = cc & icc::V != 0;
    let c = cc & icc::C != 0;
    match cond & 0xf {
        0x0 => false,              // never
        0x1 => z,                  // equal
        0x2 => z || (n != v),      // less or equal
        0x3 => n != v,             // less
        0x4 => c || z,             // less or equal unsigned
        0x5 => c,                  // carry set
        0x6 => n,                  // negative
        0x7 => v,                  // overflow set
        0x8 => true,               // always
        0x9 => !z,                 // not equal
        0xa => !(z || (n != v)),   // greater
        0xb => n == v,             // greater or equal
        0xc => !(c || z),          // greater unsigned
        0xd => !c,                 // carry clear
        0xe => !n,                 // positive
        _ => !v,                   // overflow clear
    }
}

/// Evaluates an FP branch condition against a 2-bit fcc value
/// (0 =, 1 <, 2 >, 3 unordered).
pub fn fp_cond(cond: u8, fcc: u64) -> bool {
    // Bit v of the mask is set when the condition holds for fcc == v.
    const MASKS: [u8; 16] = [
        0b0000, 0b1110, 0b0110, 0b1010, 0b0010, 0b1100, 0b0100, 0b1000,
        0b1111, 0b0001, 0b1001, 0b0101, 0b1101, 0b0011, 0b1011, 0b0111,
    ];
    MASKS[(cond & 0xf) as usize] & (1 << (fcc & 3)) != 0
}

/// Evaluates a BPr register condition (rcond field in aux2).
fn reg_cond(rcond: u8, v: u64) -> bool {
    let s = v as i64;
    match rcond & 0x7 {
        0x1 => s == 0,
        0x2 => s <= 0,
        0x3 => s < 0,
        0x5 => s != 0,
        0x6 => s > 0,
        _ => s >= 0,
    }
}

fn second_operand(inst: &Instance) -> u64 {
    if inst.instr.uses_imm() {
        inst.instr.imm as i64 as u64
    } else {
        inst.rs2val
    }
}

/// Executes one instance: computes results, resolves branches, binds
/// effective addresses, flags exceptions. Architectural state is untouched.
pub fn execute(inst: &mut Instance) {
    use Opcode::*;
    let op2 = second_operand(inst);
    let a = inst.rs1val;
    let pc = inst.pc;

    if inst.instr.op.mem_class().is_some() {
        execute_mem(inst, op2);
        return;
    }

    match inst.instr.op {
        Reserved | IllTrap => inst.exception = ExceptionCode::Illegal,

        Sethi => inst.rdval = inst.instr.imm as u32 as u64,

        Add => inst.rdval = a.wrapping_add(op2),
        AddCc => {
            inst.rdval = a.wrapping_add(op2);
            inst.rccval = add_cc(a, op2, inst.rdval, false);
        }
        AddC => inst.rdval = a.wrapping_add(op2).wrapping_add(inst.rsccval & icc::C),
        AddCCc => {
            inst.rdval = a.wrapping_add(op2).wrapping_add(inst.rsccval & icc::C);
            inst.rccval = add_cc(a, op2, inst.rdval, false);
        }
        Sub => inst.rdval = a.wrapping_sub(op2),
        SubCc => {
            inst.rdval = a.wrapping_sub(op2);
            inst.rccval = add_cc(a, op2, inst.rdval, true);
        }
        SubC => inst.rdval = a.wrapping_sub(op2).wrapping_sub(inst.rsccval & icc::C),
        SubCCc => {
            inst.rdval = a.wrapping_sub(op2).wrapping_sub(inst.rsccval & icc::C);
            inst.rccval = add_cc(a, op2, inst.rdval, true);
        }

        And => inst.rdval = a & op2,
        AndCc => {
            inst.rdval = a & op2;
            inst.rccval = logic_cc(inst.rdval);
        }
        AndN => inst.rdval = a & !op2,
        AndNCc => {
            inst.rdval = a & !op2;
            inst.rccval = logic_cc(inst.rdval);
        }
        Or => inst.rdval = a | op2,
        OrCc => {
            inst.rdval = a | op2;
            inst.rccval = logic_cc(inst.rdval);
        }
        OrN => inst.rdval = a | !op2,
        OrNCc => {
            inst.rdval = a | !op2;
            inst.rccval = logic_cc(inst.rdval);
        }
        Xor => inst.rdval = a ^ op2,
        XorCc => {
            inst.rdval = a ^ op2;
            inst.rccval = logic_cc(inst.rdval);
        }
        XNor => inst.rdval = !(a ^ op2),
        XNorCc => {
            inst.rdval = !(a ^ op2);
            inst.rccval = logic_cc(inst.rdval);
        }

        MulX => inst.rdval = a.wrapping_mul(op2),
        SDivX => {
            if op2 == 0 {
                inst.exception = ExceptionCode::Div0;
            } else {
                inst.rdval = (a as i64).wrapping_div(op2 as i64) as u64;
            }
        }
        UDivX => {
            if op2 == 0 {
                inst.exception = ExceptionCode::Div0;
            } else {
                inst.rdval = a / op2;
            }
        }
        UMul => {
            let p = u64::from(a as u32) * u64::from(op2 as u32);
            inst.rdval = p;
            inst.rccval = p >> 32; // %y
        }
        SMul => {
            let p = i64::from(a as i32) * i64::from(op2 as i32);
            inst.rdval = p as u64;
            inst.rccval = (p as u64) >> 32; // %y
        }
        UDiv | UDivCc => {
            if op2 as u32 == 0 {
                inst.exception = ExceptionCode::Div0;
            } else {
                let dividend = (inst.rsccval << 32) | u64::from(a as u32);
                let q = dividend / u64::from(op2 as u32);
                inst.rdval = q.min(u64::from(u32::MAX));
                if inst.instr.op == UDivCc {
                    inst.rccval = logic_cc(inst.rdval);
                }
            }
        }
        SDiv | SDivCc => {
            if op2 as u32 == 0 {
                inst.exception = ExceptionCode::Div0;
            } else {
                let dividend = (((inst.rsccval as u32 as u64) << 32) | u64::from(a as u32)) as i64;
                let q = dividend.wrapping_div(i64::from(op2 as i32));
                let q = q.clamp(i64::from(i32::MIN), i64::from(i32::MAX));
                inst.rdval = q as u64;
                if inst.instr.op == SDivCc {
                    inst.rccval = logic_cc(inst.rdval);
                }
            }
        }

        // Deprecated cc-multiplies: no result mid-pipeline, re-run at retire.
        UMulCc | SMulCc | MulSCc => {
            inst.exception = ExceptionCode::SerializeAfterRetire;
        }

        Sll => {
            inst.rdval = if inst.instr.aux2 & 2 != 0 {
                a << (op2 & 63)
            } else {
                u64::from((a as u32) << (op2 & 31))
            };
        }
        Srl => {
            inst.rdval = if inst.instr.aux2 & 2 != 0 {
                a >> (op2 & 63)
            } else {
                u64::from((a as u32) >> (op2 & 31))
            };
        }
        Sra => {
            inst.rdval = if inst.instr.aux2 & 2 != 0 {
                ((a as i64) >> (op2 & 63)) as u64
            } else {
                ((a as i32) >> (op2 & 31)) as i64 as u64
            };
        }
        Popc => inst.rdval = u64::from(op2.count_ones()),

        MovCc => {
            // rs1 carries the old destination value.
            let cond_ok = if inst.instr.aux2 & 4 != 0 {
                fp_cond(inst.instr.aux1 as u8, inst.rsccval)
            } else {
                int_cond(inst.instr.aux1 as u8, inst.rsccval, inst.instr.aux2 & 2 != 0)
            };
            inst.rdval = if cond_ok { op2 } else { a };
        }
        MovR => {
            inst.rdval = if reg_cond(inst.instr.aux2 as u8, a) {
                op2
            } else {
                inst.stval // old destination value rides the store-data slot
            };
        }

        // Control transfer. Targets were precomputed by the predecoder into
        // imm for the PC-relative forms.
        Call => {
            inst.branch.taken = true;
            inst.branch.target = VirtAddr(pc.0.wrapping_add(inst.instr.imm as i64 as u64));
            inst.rdval = pc.0; // %o7
        }
        Bicc | Bpcc => {
            let use_xcc = inst.instr.aux2 & 2 != 0;
            inst.branch.taken = int_cond(inst.instr.aux1 as u8, inst.rsccval, use_xcc);
            inst.branch.target = VirtAddr(pc.0.wrapping_add(inst.instr.imm as i64 as u64));
        }
        Fbfcc => {
            inst.branch.taken = fp_cond(inst.instr.aux1 as u8, inst.rsccval);
            inst.branch.target = VirtAddr(pc.0.wrapping_add(inst.instr.imm as i64 as u64));
        }
        Bpr => {
            inst.branch.taken = reg_cond(inst.instr.aux2 as u8, a);
            inst.branch.target = VirtAddr(pc.0.wrapping_add(inst.instr.imm as i64 as u64));
        }
        Jmpl | Return => {
            inst.branch.taken = true;
            inst.branch.target = VirtAddr(a.wrapping_add(op2) & !3);
            inst.rdval = pc.0;
        }
        Tcc => {
            if int_cond(inst.instr.aux1 as u8, inst.rsccval, false) {
                inst.exception = ExceptionCode::SysTrap;
            }
        }

        // SAVE/RESTORE moved the window at decode (serialized); here they
        // only compute their add result.
        Save | Restore => inst.rdval = a.wrapping_add(op2),
        // State-register writes apply at retire, serialized.
        Flushw | WrY | WrCcr | WrAsi | WrFprs => {
            inst.exception = ExceptionCode::SerializeAfterRetire;
        }
        RdPr | WrPr | DoneRetry => inst.exception = ExceptionCode::Privileged,
        RdY | RdCcr | RdAsi | RdFprs => inst.rdval = inst.rsccval,
        Membar => inst.rdval = 0,

        // Floating point on the host FPU.
        FMovS | FMovD => inst.rdval = inst.rs2val,
        FNegS => inst.rdval = u64::from(f32_of(inst.rs2val).to_bits() ^ 0x8000_0000),
        FNegD => inst.rdval = f64_of(inst.rs2val).to_bits() ^ (1 << 63),
        FAbsS => inst.rdval = u64::from(f32_of(inst.rs2val).abs().to_bits()),
        FAbsD => inst.rdval = f64_of(inst.rs2val).abs().to_bits(),
        FSqrtS => {
            let x = f32_of(inst.rs2val);
            inst.rdval = u64::from(host_fp(inst, || x.sqrt().to_bits()));
        }
        FSqrtD => {
            let x = f64_of(inst.rs2val);
            inst.rdval = host_fp(inst, || x.sqrt().to_bits());
        }
        FAddS | FSubS | FMulS | FDivS => {
            let (x, y) = (f32_of(a), f32_of(inst.rs2val));
            let op = inst.instr.op;
            inst.rdval = u64::from(host_fp(inst, || {
                match op {
                    FAddS => x + y,
                    FSubS => x - y,
                    FMulS => x * y,
                    _ => x / y,
                }
                .to_bits()
            }));
        }
        FAddD | FSubD | FMulD | FDivD => {
            let (x, y) = (f64_of(a), f64_of(inst.rs2val));
            let op = inst.instr.op;
            inst.rdval = host_fp(inst, || {
                match op {
                    FAddD => x + y,
                    FSubD => x - y,
                    FMulD => x * y,
                    _ => x / y,
                }
                .to_bits()
            });
        }
        FsMulD => {
            let (x, y) = (f64::from(f32_of(a)), f64::from(f32_of(inst.rs2val)));
            inst.rdval = host_fp(inst, || (x * y).to_bits());
        }
        FsToI => {
            let x = f32_of(inst.rs2val);
            inst.rdval = host_fp(inst, || x as i32 as u32 as u64);
        }
        FdToI => {
            let x = f64_of(inst.rs2val);
            inst.rdval = host_fp(inst, || x as i32 as u32 as u64);
        }
        FsToX => {
            let x = f32_of(inst.rs2val);
            inst.rdval = host_fp(inst, || x as i64 as u64);
        }
        FdToX => {
            let x = f64_of(inst.rs2val);
            inst.rdval = host_fp(inst, || x as i64 as u64);
        }
        FiToS => inst.rdval = u64::from(((inst.rs2val as u32 as i32) as f32).to_bits()),
        FiToD => inst.rdval = f64::from(inst.rs2val as u32 as i32).to_bits(),
        FxToS => inst.rdval = u64::from(((inst.rs2val as i64) as f32).to_bits()),
        FxToD => inst.rdval = ((inst.rs2val as i64) as f64).to_bits(),
        FsToD => inst.rdval = f64::from(f32_of(inst.rs2val)).to_bits(),
        FdToS => {
            let x = f64_of(inst.rs2val);
            inst.rdval = u64::from(host_fp(inst, || (x as f32).to_bits()));
        }
        FCmpS => {
            let (x, y) = (f32_of(a), f32_of(inst.rs2val));
            inst.rccval = fcc_of(x.partial_cmp(&y));
        }
        FCmpD => {
            let (x, y) = (f64_of(a), f64_of(inst.rs2val));
            inst.rccval = fcc_of(x.partial_cmp(&y));
        }

        // Memory opcodes were dispatched above.
        Lduw | Ldub | Lduh | Ldsw | Ldsb | Ldsh | Ldx | Ldd | Ldf | Lddf | Stb | Sth
        | Stw | Stx | Std | Stf | Stdf | Ldstub | Swap | Casa | Casxa | Prefetch => {}
    }
}

fn fcc_of(ord: Option<std::cmp::Ordering>) -> u64 {
    match ord {
        Some(std::cmp::Ordering::Equal) => 0,
        Some(std::cmp::Ordering::Less) => 1,
        Some(std::cmp::Ordering::Greater) => 2,
        None => 3,
    }
}

fn execute_mem(inst: &mut Instance, op2: u64) {
    // CAS addresses come from rs1 alone; everything else adds the second
    // operand.
    let ea = match inst.instr.op {
        Opcode::Casa | Opcode::Casxa => inst.rs1val,
        _ => inst.rs1val.wrapping_add(op2),
    };
    let size = inst.instr.op.access_size();
    if size > 1 && ea % size != 0 {
        // Misaligned accesses fault; delivered at retire.
        inst.exception = ExceptionCode::SegV;
        return;
    }
    inst.ea = Some(VirtAddr(ea));
    inst.memprogress = MemProgress::AddrReady;
}

/// Applies the memory value of a completed load to the instance result
/// (sign/zero extension and pair splitting).
pub fn finish_load(inst: &mut Instance, raw: u64) {
    use Opcode::*;
    inst.memval = raw;
    match inst.instr.op {
        Ldub | Lduh | Lduw | Ldx | Ldstub | Swap | Casa | Casxa | Ldf | Lddf => {
            inst.rdval = raw;
        }
        Ldsb => inst.rdval = raw as u8 as i8 as i64 as u64,
        Ldsh => inst.rdval = raw as u16 as i16 as i64 as u64,
        Ldsw => inst.rdval = raw as u32 as i32 as i64 as u64,
        Ldd => {
            // Even register gets the higher-addressed... no: big-endian LDD
            // puts the word at EA in rd and the word at EA+4 in rd+1.
            inst.rdval = raw >> 32;
            inst.rdval2 = raw & 0xffff_ffff;
        }
        _ => {}
    }
}

/// Retire-side body of `SerializeAfterRetire` instructions that produce
/// values: the deprecated cc-multiplies. Returns
/// `(rd value, %y value, icc nibble)`.
pub fn execute_serialized(inst: &Instance, y: u64, ccr: u64) -> (u64, u64, u64) {
    use Opcode::*;
    let op2 = second_operand(inst);
    match inst.instr.op {
        UMulCc => {
            let p = u64::from(inst.rs1val as u32) * u64::from(op2 as u32);
            (u64::from(p as u32), p >> 32, mul_icc(p as u32))
        }
        SMulCc => {
            let p = i64::from(inst.rs1val as i32) * i64::from(op2 as i32);
            (u64::from(p as u64 as u32), (p as u64) >> 32, mul_icc(p as u32))
        }
        MulSCc => {
            // One multiply step: Y and ICC are inputs and outputs.
            let n = ccr & icc::N != 0;
            let v = ccr & icc::V != 0;
            let nxorv = u64::from(n != v);
            let shifted = (u64::from(inst.rs1val as u32) >> 1) | (nxorv << 31);
            let addend = if y & 1 != 0 { op2 as u32 as u64 } else { 0 };
            let sum = (shifted + addend) as u32;
            let new_y = (y >> 1) | (u64::from(inst.rs1val as u32 & 1) << 31);
            let cc = add_cc(shifted, addend, u64::from(sum), false) & 0xf;
            (u64::from(sum), new_y & 0xffff_ffff, cc)
        }
        _ => (inst.rdval, y, ccr & 0xf),
    }
}

fn mul_icc(result: u32) -> u64 {
    let mut cc = 0;
    if (result as i32) < 0 {
        cc |= icc::N;
    }
    if result == 0 {
        cc |= icc::Z;
    }
    cc
}

/// True if `mask` (a MEMBAR imm) orders the given earlier→later classes.
pub fn membar_orders(mask: i32, earlier_store: bool, later_store: bool) -> bool {
    if mask & membar::MEM_ISSUE != 0 {
        return true;
    }
    let bit = match (earlier_store, later_store) {
        (false, false) => membar::LOAD_LOAD,
        (false, true) => membar::LOAD_STORE,
        (true, false) => membar::STORE_LOAD,
        (true, true) => membar::STORE_STORE,
    };
    mask & bit != 0
}

/// The memory class of an instance, `None` for non-memory ops.
pub fn mem_class(inst: &Instance) -> Option<MemClass> {
    inst.instr.op.mem_class()
}
