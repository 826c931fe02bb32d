//! Dynamic instruction instances.
//!
//! An [`Instance`] is one fetched occurrence of a static instruction. It is
//! created at fetch, carries its renamed registers and operand values
//! through the pipeline, and is released at retire (or squash). Instances
//! live in a per-processor pool; the slot may be recycled immediately, so
//! every external reference (memory requests in flight, queue entries)
//! carries the instance's `tag` — a per-processor monotonically increasing
//! counter — and checks it for staleness before acting.

use crate::common::{ExceptionCode, VirtAddr};
use crate::isa::Instr;
use crate::pool_id;

pool_id! {
    /// Identifier of an instance in a processor's instance pool.
    InstId
}

/// Progress of a memory instruction through the memory system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemProgress {
    /// Not a memory operation, or address not yet computed.
    #[default]
    None,
    /// Effective address computed; waiting in the memory queue.
    AddrReady,
    /// Issued to the cache hierarchy.
    Issued,
    /// Value forwarded from the write buffer; no cache access made.
    Forwarded,
    /// The access completed.
    Done,
}

/// Branch bookkeeping carried by an instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct BranchInfo {
    /// The fetch-time prediction: taken?
    pub predicted_taken: bool,
    /// Predicted target (valid if `predicted_taken`).
    pub predicted_target: VirtAddr,
    /// Resolved at execute: actually taken?
    pub taken: bool,
    /// Resolved target.
    pub target: VirtAddr,
    /// Prediction was wrong; retire will squash and redirect.
    pub mispredicted: bool,
    /// The delay slot is annulled (branch untaken with annul bit set).
    pub annul_slot: bool,
}

/// A dynamic instruction.
#[derive(Clone, Debug, Default)]
pub struct Instance {
    /// Per-processor monotonic tag; staleness check for external references.
    pub tag: u64,
    /// Fetch PC.
    pub pc: VirtAddr,
    /// The static instruction record.
    pub instr: Instr,

    /// Renamed destination (physical), if the instruction writes one.
    pub prd: Option<u16>,
    /// Second physical destination for integer-pair writes (LDD).
    pub prd2: Option<u16>,
    /// Renamed condition-code destination.
    pub prcc: Option<u16>,
    /// Physical sources resolved at rename.
    pub prs1: Option<u16>,
    /// Physical source 2.
    pub prs2: Option<u16>,
    /// Physical condition-code source.
    pub prscc: Option<u16>,
    /// Store-data source (stores and RMWs read the rd field).
    pub prs_st: Option<u16>,
    /// Second store-data source for pair stores (STD).
    pub prs_st2: Option<u16>,

    /// Source value 1 (integer bits or FP bit pattern).
    pub rs1val: u64,
    /// Source value 2 (or immediate).
    pub rs2val: u64,
    /// Condition-code source value.
    pub rsccval: u64,
    /// Store-data value.
    pub stval: u64,
    /// Second store-data value for pair stores.
    pub stval2: u64,
    /// Result value (integer bits or FP bit pattern).
    pub rdval: u64,
    /// Second result for pair destinations.
    pub rdval2: u64,
    /// Condition-code result.
    pub rccval: u64,

    /// Effective address of a memory operation.
    pub ea: Option<VirtAddr>,
    /// Value loaded / to store (memory ops).
    pub memval: u64,
    /// Memory progress marker.
    pub memprogress: MemProgress,
    /// This instruction's prefetch came back after a demand access wanted
    /// the line (late prefetch; statistics only).
    pub late_pref: bool,

    /// Operands read; ready to execute.
    pub ops_ready: bool,
    /// Sent to a functional unit.
    pub issued: bool,
    /// Result available (retirable, barring exceptions).
    pub completed: bool,
    /// Exception delivered at retire.
    pub exception: ExceptionCode,

    /// Branch state.
    pub branch: BranchInfo,
    /// CWP this instance was decoded under (squash rollback).
    pub cwp_at_decode: usize,
}

impl Instance {
    /// Resets the slot for a fresh fetch, assigning `tag`.
    pub fn reset_for(&mut self, tag: u64, pc: VirtAddr, instr: Instr, cwp: usize) {
        *self = Self {
            tag,
            pc,
            instr,
            cwp_at_decode: cwp,
            ..Self::default()
        };
    }

    /// True once the instruction can leave the active list head.
    pub fn retirable(&self) -> bool {
        self.completed || self.exception.is_trouble()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Opcode;

    #[test]
    fn test_reset_clears_state() {
        let mut i = Instance::default();
        i.rdval = 99;
        i.issued = true;
        i.exception = ExceptionCode::SegV;
        let instr = Instr {
            op: Opcode::Add,
            ..Instr::default()
        };
        i.reset_for(7, VirtAddr(0x40), instr, 2);
        assert_eq!(i.tag, 7);
        assert_eq!(i.rdval, 0);
        assert!(!i.issued);
        assert_eq!(i.exception, ExceptionCode::Ok);
        assert_eq!(i.cwp_at_decode, 2);
    }

    #[test]
    fn test_retirable() {
        let mut i = Instance::default();
        assert!(!i.retirable());
        i.completed = true;
        assert!(i.retirable());
        i.completed = false;
        i.exception = ExceptionCode::Div0;
        assert!(i.retirable());
    }
}
