//! Opcodes and their pipeline-relevant classification.
//!
//! The enum lists every opcode the predecoder emits. The pipeline never
//! pattern-matches raw opcode values outside this module and
//! `cpu::funcs`; everything else asks the classification predicates
//! (memory class, branch kind, serialization) defined here.

use crate::common::SimError;

/// A predecoded SPARC-V9 opcode.
#[allow(missing_docs)] // The variants are the SPARC mnemonics themselves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    #[default]
    Reserved,
    IllTrap,

    // Control transfer.
    Call,
    Bicc,
    Bpcc,
    Bpr,
    Fbfcc,
    Jmpl,
    Return,
    Tcc,

    // Integer arithmetic and logic.
    Sethi,
    Add,
    AddC,
    AddCc,
    AddCCc,
    Sub,
    SubC,
    SubCc,
    SubCCc,
    And,
    AndCc,
    AndN,
    AndNCc,
    Or,
    OrCc,
    OrN,
    OrNCc,
    Xor,
    XorCc,
    XNor,
    XNorCc,
    MulX,
    SDivX,
    UDivX,
    UMul,
    SMul,
    UDiv,
    SDiv,
    UDivCc,
    SDivCc,
    UMulCc,
    SMulCc,
    MulSCc,
    Sll,
    Srl,
    Sra,
    Popc,
    MovCc,
    MovR,

    // Register windows and serializing state ops.
    Save,
    Restore,
    Flushw,
    RdY,
    RdCcr,
    RdAsi,
    RdFprs,
    WrY,
    WrCcr,
    WrAsi,
    WrFprs,
    RdPr,
    WrPr,
    Membar,
    DoneRetry,

    // Loads.
    Lduw,
    Ldub,
    Lduh,
    Ldsw,
    Ldsb,
    Ldsh,
    Ldx,
    Ldd,
    Ldf,
    Lddf,

    // Stores.
    Stb,
    Sth,
    Stw,
    Stx,
    Std,
    Stf,
    Stdf,

    // Read-modify-writes.
    Ldstub,
    Swap,
    Casa,
    Casxa,

    // Prefetch.
    Prefetch,

    // Floating point.
    FMovS,
    FMovD,
    FNegS,
    FNegD,
    FAbsS,
    FAbsD,
    FSqrtS,
    FSqrtD,
    FAddS,
    FAddD,
    FSubS,
    FSubD,
    FMulS,
    FMulD,
    FDivS,
    FDivD,
    FsMulD,
    FsToI,
    FdToI,
    FsToX,
    FdToX,
    FiToS,
    FiToD,
    FxToS,
    FxToD,
    FsToD,
    FdToS,
    FCmpS,
    FCmpD,
}

/// Memory-operation class of an opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemClass {
    /// Ordinary load.
    Load,
    /// Ordinary store.
    Store,
    /// Atomic read-modify-write.
    Rmw,
    /// Software prefetch (non-binding, non-faulting).
    Prefetch,
}

/// Branch classification, as the fetch unit needs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKind {
    /// Conditional branch; predicted by the PHT.
    Cond,
    /// Unconditional PC-relative call; pushes the return address.
    Call,
    /// Register-indirect jump (JMPL); target known at execute.
    Indirect,
    /// Probable return; predicted by the return-address stack.
    Return,
}

impl Opcode {
    /// Total number of opcode variants (table sizes).
    pub const COUNT: usize = Self::FCmpD as usize + 1;

    /// Decodes an on-disk opcode tag.
    pub fn from_tag(tag: u16) -> Result<Self, SimError> {
        if (tag as usize) < Self::COUNT {
            // SAFETY: repr(u16) with default discriminants assigns 0..COUNT
            // in declaration order, and the bound was just checked.
            Ok(unsafe { std::mem::transmute::<u16, Self>(tag) })
        } else {
            Err(SimError::Input(format!("unknown opcode tag {tag}")))
        }
    }

    /// Memory class, or `None` for non-memory opcodes.
    pub fn mem_class(self) -> Option<MemClass> {
        use Opcode::*;
        match self {
            Lduw | Ldub | Lduh | Ldsw | Ldsb | Ldsh | Ldx | Ldd | Ldf | Lddf => {
                Some(MemClass::Load)
            }
            Stb | Sth | Stw | Stx | Std | Stf | Stdf => Some(MemClass::Store),
            Ldstub | Swap | Casa | Casxa => Some(MemClass::Rmw),
            Prefetch => Some(MemClass::Prefetch),
            _ => None,
        }
    }

    /// Access size in bytes for memory opcodes (0 otherwise).
    pub fn access_size(self) -> u64 {
        use Opcode::*;
        match self {
            Ldub | Ldsb | Stb | Ldstub => 1,
            Lduh | Ldsh | Sth => 2,
            Lduw | Ldsw | Stw | Swap | Casa | Ldf | Stf => 4,
            Ldx | Stx | Ldd | Std | Casxa | Lddf | Stdf | Prefetch => 8,
            _ => 0,
        }
    }

    /// Branch kind, or `None` for straight-line opcodes.
    ///
    /// The record's `uncond_branch` field refines `Jmpl` into
    /// [`BranchKind::Return`] when the predecoder recognized a return idiom;
    /// this classification is by opcode alone.
    pub fn branch_kind(self) -> Option<BranchKind> {
        use Opcode::*;
        match self {
            Bicc | Bpcc | Bpr | Fbfcc => Some(BranchKind::Cond),
            Call => Some(BranchKind::Call),
            Jmpl => Some(BranchKind::Indirect),
            Return => Some(BranchKind::Return),
            _ => None,
        }
    }

    /// True for opcodes that must decode alone after the active list drains:
    /// register-window ops, architectural-state reads and writes, privileged
    /// ops, and the deprecated condition-code multiplies.
    ///
    /// The state registers (%y and friends) are not renamed, so both their
    /// writers and their readers drain the machine to stay ordered.
    pub fn serializes_decode(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Save | Restore
                | Flushw
                | WrY
                | WrCcr
                | WrAsi
                | WrFprs
                | RdY
                | RdCcr
                | RdAsi
                | RdFprs
                | RdPr
                | WrPr
                | DoneRetry
                | UMulCc
                | SMulCc
                | MulSCc
                | UDiv
                | SDiv
                | UDivCc
                | SDivCc
        )
    }

    /// True for privileged opcodes (user-mode execution raises an exception).
    pub fn privileged(self) -> bool {
        matches!(self, Self::RdPr | Self::WrPr | Self::DoneRetry)
    }

    /// True for opcodes whose destination lives in the FP register file.
    pub fn writes_fp(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Ldf | Lddf
                | FMovS
                | FMovD
                | FNegS
                | FNegD
                | FAbsS
                | FAbsD
                | FSqrtS
                | FSqrtD
                | FAddS
                | FAddD
                | FSubS
                | FSubD
                | FMulS
                | FMulD
                | FDivS
                | FDivD
                | FsMulD
                | FsToI
                | FdToI
                | FsToX
                | FdToX
                | FiToS
                | FiToD
                | FxToS
                | FxToD
                | FsToD
                | FdToS
        )
    }

    /// Static mnemonic, for diagnostics and the retire trace.
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Reserved => "reserved",
            IllTrap => "illtrap",
            Call => "call",
            Bicc => "bicc",
            Bpcc => "bpcc",
            Bpr => "bpr",
            Fbfcc => "fbfcc",
            Jmpl => "jmpl",
            Return => "return",
            Tcc => "tcc",
            Sethi => "sethi",
            Add => "add",
            AddC => "addc",
            AddCc => "addcc",
            AddCCc => "addccc",
            Sub => "sub",
            SubC => "subc",
            SubCc => "subcc",
            SubCCc => "subccc",
            And => "and",
            AndCc => "andcc",
            AndN => "andn",
            AndNCc => "andncc",
            Or => "or",
            OrCc => "orcc",
            OrN => "orn",
            OrNCc => "orncc",
            Xor => "xor",
            XorCc => "xorcc",
            XNor => "xnor",
            XNorCc => "xnorcc",
            MulX => "mulx",
            SDivX => "sdivx",
            UDivX => "udivx",
            UMul => "umul",
            SMul => "smul",
            UDiv => "udiv",
            SDiv => "sdiv",
            UDivCc => "udivcc",
            SDivCc => "sdivcc",
            UMulCc => "umulcc",
            SMulCc => "smulcc",
            MulSCc => "mulscc",
            Sll => "sll",
            Srl => "srl",
            Sra => "sra",
            Popc => "popc",
            MovCc => "movcc",
            MovR => "movr",
            Save => "save",
            Restore => "restore",
            Flushw => "flushw",
            RdY => "rdy",
            RdCcr => "rdccr",
            RdAsi => "rdasi",
            RdFprs => "rdfprs",
            WrY => "wry",
            WrCcr => "wrccr",
            WrAsi => "wrasi",
            WrFprs => "wrfprs",
            RdPr => "rdpr",
            WrPr => "wrpr",
            Membar => "membar",
            DoneRetry => "done/retry",
            Lduw => "lduw",
            Ldub => "ldub",
            Lduh => "lduh",
            Ldsw => "ldsw",
            Ldsb => "ldsb",
            Ldsh => "ldsh",
            Ldx => "ldx",
            Ldd => "ldd",
            Ldf => "ldf",
            Lddf => "lddf",
            Stb => "stb",
            Sth => "sth",
            Stw => "stw",
            Stx => "stx",
            Std => "std",
            Stf => "stf",
            Stdf => "stdf",
            Ldstub => "ldstub",
            Swap => "swap",
            Casa => "casa",
            Casxa => "casxa",
            Prefetch => "prefetch",
            FMovS => "fmovs",
            FMovD => "fmovd",
            FNegS => "fnegs",
            FNegD => "fnegd",
            FAbsS => "fabss",
            FAbsD => "fabsd",
            FSqrtS => "fsqrts",
            FSqrtD => "fsqrtd",
            FAddS => "fadds",
            FAddD => "faddd",
            FSubS => "fsubs",
            FSubD => "fsubd",
            FMulS => "fmuls",
            FMulD => "fmuld",
            FDivS => "fdivs",
            FDivD => "fdivd",
            FsMulD => "fsmuld",
            FsToI => "fstoi",
            FdToI => "fdtoi",
            FsToX => "fstox",
            FdToX => "fdtox",
            FiToS => "fitos",
            FiToD => "fitod",
            FxToS => "fxtos",
            FxToD => "fxtod",
            FsToD => "fstod",
            FdToS => "fdtos",
            FCmpS => "fcmps",
            FCmpD => "fcmpd",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for tag in 0..Opcode::COUNT as u16 {
            let op = Opcode::from_tag(tag).unwrap();
            assert_eq!(op as u16, tag);
        }
        assert!(Opcode::from_tag(Opcode::COUNT as u16).is_err());
    }

    #[test]
    fn test_mem_classification() {
        assert_eq!(Opcode::Ldsw.mem_class(), Some(MemClass::Load));
        assert_eq!(Opcode::Stx.mem_class(), Some(MemClass::Store));
        assert_eq!(Opcode::Casa.mem_class(), Some(MemClass::Rmw));
        assert_eq!(Opcode::Prefetch.mem_class(), Some(MemClass::Prefetch));
        assert_eq!(Opcode::Add.mem_class(), None);
    }

    #[test]
    fn test_serializing_set() {
        assert!(Opcode::Save.serializes_decode());
        assert!(Opcode::UMulCc.serializes_decode());
        assert!(Opcode::WrY.serializes_decode());
        assert!(!Opcode::AddCc.serializes_decode());
        assert!(!Opcode::Membar.serializes_decode());
    }

    #[test]
    fn test_branch_kinds() {
        assert_eq!(Opcode::Bicc.branch_kind(), Some(BranchKind::Cond));
        assert_eq!(Opcode::Call.branch_kind(), Some(BranchKind::Call));
        assert_eq!(Opcode::Return.branch_kind(), Some(BranchKind::Return));
        assert_eq!(Opcode::Sethi.branch_kind(), None);
    }
}
