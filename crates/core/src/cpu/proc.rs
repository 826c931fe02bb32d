//! The processor pipeline.
//!
//! One `Processor` per node, activated once per cycle. The activation runs
//! the stages in reverse pipeline order — retire, execute completions,
//! issue, register read, decode/rename, fetch — so an instruction advances
//! at most one stage per cycle. Memory operations leave the pipeline
//! through the memory unit; their completions arrive back between cycles
//! via [`Processor::mem_done`].
//!
//! Squashing is the only cancellation mechanism: given a boundary tag, the
//! active list is unwound youngest-first (rolling back renames), the memory
//! queue and fetch/decode queues are truncated, and fetch restarts at the
//! resolved PC. Requests already in the memory system are not recalled;
//! they return with a stale tag snapshot and are dropped.

use std::collections::VecDeque;

use tracing::debug;

use crate::common::{ExceptionCode, SimTime, VirtAddr};
use crate::config::Config;
use crate::event::Pool;
use crate::isa::regs::arch;
use crate::isa::{BranchKind, InstrFile, MemClass, Opcode, RegType, Wpc};
use crate::mem::addrspace::AddrSpace;
use crate::mem::wbuffer::WriteBuffer;
use crate::mem::HandledBy;
use crate::stats::StatRec;

use super::active_list::{ActiveList, AlEntry, Rename};
use super::branch::BranchPredictor;
use super::funcs;
use super::instance::{InstId, Instance, MemProgress};
use super::memunit::{MemKind, MemUnit};
use super::regfile::{Bank, RegFile};

/// One memory operation the memory unit would consider issuing this cycle.
#[derive(Clone, Copy, Debug)]
pub struct MemIssueCand {
    /// Instance.
    pub inst: InstId,
    /// Its tag.
    pub tag: u64,
    /// Bound effective address.
    pub ea: VirtAddr,
    /// Opcode.
    pub op: Opcode,
    /// Opcode auxiliary field (prefetch fcn).
    pub aux1: i16,
    /// Access size in bytes.
    pub size: u64,
    /// The consistency verdict.
    pub verdict: super::memunit::IssueVerdict,
}

/// Why a processor stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltReason {
    /// The application exited (trap 0); code attached.
    Exit(u64),
    /// An unhandled application exception terminated the run.
    Fault(ExceptionCode),
}

/// Per-processor statistics.
pub struct ProcStats {
    /// Cycles simulated.
    pub cycles: u64,
    /// Instructions retired.
    pub retired: u64,
    /// Loads retired.
    pub loads: u64,
    /// Stores retired.
    pub stores: u64,
    /// RMWs retired.
    pub rmws: u64,
    /// Branches retired.
    pub branches: u64,
    /// Mispredicted branches.
    pub mispredicts: u64,
    /// Pipeline squashes (all causes).
    pub squashes: u64,
    /// Squashes caused by failed load speculation.
    pub spec_squashes: u64,
    /// Stack-growth retries.
    pub stack_grows: u64,
    /// Register-window overflow/underflow traps taken.
    pub window_traps: u64,
    /// Read latency (issue to completion), with histogram.
    pub read_lat: StatRec,
    /// Write (drain) latency.
    pub write_lat: StatRec,
    /// RMW latency.
    pub rmw_lat: StatRec,
    /// Completions classified by the level that satisfied them.
    pub handled: [u64; 7],
}

impl ProcStats {
    fn new() -> Self {
        Self {
            cycles: 0,
            retired: 0,
            loads: 0,
            stores: 0,
            rmws: 0,
            branches: 0,
            mispredicts: 0,
            squashes: 0,
            spec_squashes: 0,
            stack_grows: 0,
            window_traps: 0,
            read_lat: StatRec::point_hist("proc.read_latency", 16, 0.0, 320.0),
            write_lat: StatRec::point_hist("proc.write_latency", 16, 0.0, 320.0),
            rmw_lat: StatRec::point_hist("proc.rmw_latency", 16, 0.0, 320.0),
            handled: [0; 7],
        }
    }

    /// Buckets a completion by its handled classification.
    pub fn record_handled(&mut self, h: HandledBy) {
        self.handled[h as usize] += 1;
    }
}

/// One out-of-order processor.
pub struct Processor {
    /// Node id.
    pub id: usize,
    /// Rename state and physical registers.
    pub regs: RegFile,
    /// Reorder buffer.
    pub al: ActiveList,
    /// Branch predictor.
    pub bp: BranchPredictor,
    /// Memory queue and consistency state.
    pub mu: MemUnit,
    /// Instance pool.
    pub insts: Pool<Instance, InstId>,
    /// Statistics.
    pub stats: ProcStats,
    /// Set when the processor has stopped.
    pub halted: Option<HaltReason>,

    next_tag: u64,
    fetch_pc: VirtAddr,
    after_delay: Option<VirtAddr>,
    fetch_halted: bool,
    decode_q: VecDeque<InstId>,
    issue_q: Vec<InstId>,
    /// (completion cycle, instance, tag) for in-flight functional units.
    fu_pipe: Vec<(u64, InstId, u64)>,

    fetch_rate: usize,
    issue_rate: usize,
    retire_rate: usize,
    line_bits: u32,
}

impl Processor {
    /// Builds a processor from configuration, starting at `entry`.
    pub fn new(id: usize, cfg: &Config, entry: VirtAddr) -> Result<Self, crate::common::SimError> {
        let p = &cfg.processor;
        Ok(Self {
            id,
            regs: RegFile::new(p.num_windows, p.num_phys_int, p.num_phys_fp)?,
            al: ActiveList::new(p.active_list_size),
            bp: BranchPredictor::new(p.branch_pred_size, p.ras_size),
            mu: MemUnit::new(cfg.system.consistency_model, cfg.system.speculative_loads),
            insts: Pool::new("instance", p.active_list_size.max(16)),
            stats: ProcStats::new(),
            halted: None,
            next_tag: 1,
            fetch_pc: entry,
            after_delay: None,
            fetch_halted: false,
            decode_q: VecDeque::new(),
            issue_q: Vec::new(),
            fu_pipe: Vec::new(),
            fetch_rate: p.fetch_rate,
            issue_rate: p.issue_rate,
            retire_rate: p.retire_rate,
            line_bits: cfg.cache.line_bits,
        })
    }

    /// True once the processor has nothing left to do.
    pub fn finished(&self) -> bool {
        self.halted.is_some()
    }

    // ================= completions from the memory system ================

    /// Delivers a completed memory access for `(inst, tag)`.
    ///
    /// Returns false (and does nothing) if the instance was squashed and
    /// recycled since the request was issued — the stale-tag drop path.
    pub fn mem_done(
        &mut self,
        inst: InstId,
        tag: u64,
        value: u64,
        handled: HandledBy,
        issue_time: SimTime,
        now: SimTime,
    ) -> bool {
        if !self.insts.is_in_use(inst) || self.insts.get_ref(inst).tag != tag {
            return false;
        }
        let i = self.insts.get_mut(inst);
        funcs::finish_load(i, value);
        i.memprogress = MemProgress::Done;
        i.completed = true;
        let (prd, prd2, rdval, rdval2, is_rmw) = (
            i.prd,
            i.prd2,
            i.rdval,
            i.rdval2,
            i.instr.op.mem_class() == Some(MemClass::Rmw),
        );
        let fp = i.instr.op.writes_fp();
        let bank = if fp { Bank::Fp } else { Bank::Int };
        if let Some(p) = prd {
            self.regs.write(bank, p, rdval);
        }
        if let Some(p) = prd2 {
            self.regs.write(Bank::Int, p, rdval2);
        }
        self.stats.record_handled(handled);
        let lat = now - issue_time;
        if is_rmw {
            self.stats.rmw_lat.update(lat, 1.0);
        } else {
            self.stats.read_lat.update(lat, 1.0);
        }
        true
    }

    // ================== the memory-issue interface =======================

    /// What the memory unit would let leave for the hierarchy this cycle.
    pub fn memory_issue_plan(&self, wb_empty: bool) -> Vec<MemIssueCand> {
        self.mu
            .issue_candidates(&self.insts)
            .into_iter()
            .filter_map(|id| {
                let i = self.insts.get_ref(id);
                let ea = i.ea?;
                Some(MemIssueCand {
                    inst: id,
                    tag: i.tag,
                    ea,
                    op: i.instr.op,
                    aux1: i.instr.aux1,
                    size: i.instr.op.access_size(),
                    verdict: self.mu.verdict(id, &self.insts, wb_empty),
                })
            })
            .collect()
    }

    /// Marks a load/RMW as dispatched to the hierarchy.
    pub fn note_mem_issued(
        &mut self,
        inst: InstId,
        tag: u64,
        line: crate::common::LineTag,
        speculative: bool,
    ) {
        if !self.insts.is_in_use(inst) || self.insts.get_ref(inst).tag != tag {
            return;
        }
        self.insts.get_mut(inst).memprogress = MemProgress::Issued;
        self.mu.stats.loads_issued += 1;
        self.mu.mark_issued(inst, tag, line, speculative);
    }

    /// Backs out a dispatch that the L1 refused (port or MSHR pressure).
    pub fn note_mem_unissued(&mut self, inst: InstId, tag: u64) {
        if self.insts.is_in_use(inst) && self.insts.get_ref(inst).tag == tag {
            self.insts.get_mut(inst).memprogress = MemProgress::AddrReady;
        }
    }

    /// Completes a load from the write buffer without a cache access.
    ///
    /// A load that was already forwarded never re-forwards: this is only
    /// reachable from the `AddrReady` state.
    pub fn note_forwarded(&mut self, inst: InstId, tag: u64, value: u64, _now: SimTime) {
        if !self.insts.is_in_use(inst) || self.insts.get_ref(inst).tag != tag {
            return;
        }
        let i = self.insts.get_mut(inst);
        if i.memprogress != MemProgress::AddrReady {
            return;
        }
        funcs::finish_load(i, value);
        i.memprogress = MemProgress::Forwarded;
        i.completed = true;
        let (prd, prd2, rdval, rdval2) = (i.prd, i.prd2, i.rdval, i.rdval2);
        let fp = i.instr.op.writes_fp();
        let bank = if fp { Bank::Fp } else { Bank::Int };
        if let Some(p) = prd {
            self.regs.write(bank, p, rdval);
        }
        if let Some(p) = prd2 {
            self.regs.write(Bank::Int, p, rdval2);
        }
        self.mu.stats.forwards += 1;
        self.stats.record_handled(HandledBy::WriteBuf);
    }

    /// A prefetch left the pipeline's hands (issued or silently dropped).
    pub fn note_prefetch_gone(&mut self, inst: InstId, tag: u64) {
        if self.insts.is_in_use(inst) && self.insts.get_ref(inst).tag == tag {
            self.insts.get_mut(inst).memprogress = MemProgress::Done;
        }
    }

    /// Flags a demand access to an unmapped address; delivered at retire.
    pub fn note_segv(&mut self, inst: InstId, tag: u64) {
        if self.insts.is_in_use(inst) && self.insts.get_ref(inst).tag == tag {
            let i = self.insts.get_mut(inst);
            i.exception = ExceptionCode::SegV;
            i.completed = true;
        }
    }

    /// The speculative-load coherence upcall (forwarded from the L1).
    pub fn spec_cohe(&mut self, line: crate::common::LineTag, kind: super::memunit::CoheKind) {
        let _ = self.mu.spec_load_cohe(line, kind, &mut self.insts);
    }

    /// Performs the functional memory access of a completed load or RMW and
    /// delivers it into the pipeline. Returns false for stale completions.
    pub fn complete_mem(
        &mut self,
        inst: InstId,
        tag: u64,
        handled: HandledBy,
        issue_time: SimTime,
        now: SimTime,
        space: &mut crate::mem::addrspace::AddrSpace,
    ) -> bool {
        if !self.insts.is_in_use(inst) || self.insts.get_ref(inst).tag != tag {
            return false;
        }
        let (ea, size, op, stval, rs2val) = {
            let i = self.insts.get_ref(inst);
            let Some(ea) = i.ea else { return false };
            (ea, i.instr.op.access_size(), i.instr.op, i.stval, i.rs2val)
        };
        let raw = match op.mem_class() {
            Some(MemClass::Rmw) => {
                let old = space.read(self.id, ea, size).unwrap_or(0);
                let new = match op {
                    Opcode::Ldstub => Some(0xff),
                    Opcode::Swap => Some(stval),
                    Opcode::Casa => {
                        if (old as u32) == (rs2val as u32) {
                            Some(stval)
                        } else {
                            None
                        }
                    }
                    Opcode::Casxa => {
                        if old == rs2val {
                            Some(stval)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                if let Some(v) = new {
                    let _ = space.write(self.id, ea, size, v);
                }
                old
            }
            _ => space.read(self.id, ea, size).unwrap_or(0),
        };
        self.mem_done(inst, tag, raw, handled, issue_time, now)
    }

    // ========================== the cycle ================================

    /// Runs the in-pipeline stages of one cycle (everything except the
    /// memory-issue step, which the simulator drives against the caches).
    pub fn run_cycle(
        &mut self,
        now: SimTime,
        instrs: &InstrFile,
        wb: &mut WriteBuffer,
        space: &mut AddrSpace,
    ) {
        self.stats.cycles += 1;
        self.retire_stage(now, wb, space);
        self.complete_fus(now);
        self.issue_stage(now);
        self.regread_stage();
        self.decode_stage();
        self.fetch_stage(instrs);
    }

    // ---- retire --------------------------------------------------------

    fn retire_stage(&mut self, now: SimTime, wb: &mut WriteBuffer, space: &mut AddrSpace) {
        for _ in 0..self.retire_rate {
            if self.halted.is_some() {
                return;
            }
            let Some(head) = self.al.head() else { return };
            let inst = head.inst;
            let tag = head.tag;
            let i = self.insts.get_ref(inst);
            if !i.retirable() {
                return;
            }
            let exc = i.exception;

            if exc.is_trouble() {
                self.handle_exception(inst, tag, now, space);
                return;
            }

            if exc == ExceptionCode::SerializeAfterRetire {
                self.serialized_retire(inst);
            }

            // Stores become architecturally complete by entering the write
            // buffer; a full buffer stalls retirement. Unmapped targets
            // fault here (or grow the stack and retry).
            let i = self.insts.get_ref(inst);
            let mem = i.instr.op.mem_class();
            if mem == Some(MemClass::Store) {
                let Some(ea) = i.ea else { return };
                let size = i.instr.op.access_size();
                if !space.is_mapped(self.id, ea, size) {
                    if space.in_stack_region(ea) {
                        let _ = space.grow_stack(self.id, ea);
                        self.stats.stack_grows += 1;
                        let pc = i.pc;
                        self.squash_from(tag, pc, None, now);
                    } else {
                        self.insts.get_mut(inst).exception = ExceptionCode::SegV;
                        self.handle_exception(inst, tag, now, space);
                    }
                    return;
                }
                let line = ea.line(self.line_bits);
                if wb.full_for(line) {
                    return;
                }
                if i.instr.op == Opcode::Std {
                    wb.push(line, ea, 4, i.stval);
                    wb.push(line, VirtAddr(ea.0 + 4), 4, i.stval2);
                } else {
                    wb.push(line, ea, size, i.stval);
                }
            }

            // Branch resolution is acted on at retire.
            let op = self.insts.get_ref(inst).instr.op;
            let redirect = self.branch_retire(op, inst);

            // Commit: free shadows, drop the queue entry, release the slot.
            let Some(entry) = self.al.pop_head() else { return };
            for r in entry.renames() {
                self.regs.release(r.bank, r.old);
            }
            let i = self.insts.get_ref(inst);
            match mem {
                Some(MemClass::Load) => self.stats.loads += 1,
                Some(MemClass::Store) => self.stats.stores += 1,
                Some(MemClass::Rmw) => self.stats.rmws += 1,
                _ => {}
            }
            if i.instr.op.branch_kind().is_some() {
                self.stats.branches += 1;
            }
            self.stats.retired += 1;
            self.mu.remove(inst, tag);
            let _ = self.insts.put(inst, now);

            if let Some((restart, after)) = redirect {
                self.squash_after(tag, restart, after, now);
                return;
            }
        }
    }

    /// Retire-side branch handling: predictor update and mispredict
    /// redirect. Returns the restart point if the pipeline must squash.
    fn branch_retire(
        &mut self,
        op: Opcode,
        inst: InstId,
    ) -> Option<(VirtAddr, Option<VirtAddr>)> {
        let kind = op.branch_kind()?;
        let i = self.insts.get_ref(inst);
        let b = i.branch;
        let pc = i.pc;
        let annul = i.instr.annul;

        // Only predicted conditional branches train the PHT; an
        // always/never branch bypassed the predictor at fetch.
        if kind == BranchKind::Cond && i.instr.cond_branch {
            self.bp
                .update(pc, b.taken, b.mispredicted);
        }
        if !b.mispredicted {
            return None;
        }
        self.stats.mispredicts += 1;
        if b.taken {
            // Delay slot, then the resolved target.
            Some((VirtAddr(pc.0 + 4), Some(b.target)))
        } else if annul {
            // Untaken with annul: the delay slot never executes.
            Some((VirtAddr(pc.0 + 8), None))
        } else {
            Some((VirtAddr(pc.0 + 4), None))
        }
    }

    /// Applies the architectural effect of a `SerializeAfterRetire`
    /// instruction (cc-multiplies and state-register writes), which runs
    /// alone: decode stalled until the active list drained before it.
    fn serialized_retire(&mut self, inst: InstId) {
        let i = self.insts.get_ref(inst);
        let op = i.instr.op;
        match op {
            Opcode::UMulCc | Opcode::SMulCc | Opcode::MulSCc => {
                let y_l = self.regs.map.state_logical(arch::Y);
                let icc_l = self.regs.map.state_logical(arch::ICC);
                let y = self.regs.read_logical(Bank::Int, y_l);
                let ccr = self.regs.read_logical(Bank::Int, icc_l);
                let (rd, new_y, new_icc) = funcs::execute_serialized(i, y, ccr);
                let (prd, prcc) = (i.prd, i.prcc);
                if let Some(p) = prd {
                    self.regs.write(Bank::Int, p, rd);
                }
                self.regs.write_logical(Bank::Int, y_l, new_y);
                if let Some(p) = prcc {
                    self.regs.write(Bank::Int, p, new_icc);
                } else {
                    self.regs.write_logical(Bank::Int, icc_l, new_icc);
                }
            }
            Opcode::WrY | Opcode::WrCcr | Opcode::WrAsi | Opcode::WrFprs => {
                let target = match op {
                    Opcode::WrY => arch::Y,
                    Opcode::WrCcr => arch::CCR,
                    Opcode::WrAsi => arch::ASI,
                    _ => arch::FPRS,
                };
                let val = i.rs1val ^ if i.instr.uses_imm() {
                    i.instr.imm as i64 as u64
                } else {
                    i.rs2val
                };
                let l = self.regs.map.state_logical(target);
                self.regs.write_logical(Bank::Int, l, val);
            }
            _ => {}
        }
    }

    /// Exception delivery at the head of the active list.
    fn handle_exception(
        &mut self,
        inst: InstId,
        tag: u64,
        now: SimTime,
        space: &mut AddrSpace,
    ) {
        let i = self.insts.get_ref(inst);
        let exc = i.exception;
        let pc = i.pc;
        let ea = i.ea;
        debug!(target: "proc", proc = self.id, ?exc, pc = %pc, "exception at retire");

        match exc {
            ExceptionCode::SegV
                if ea.is_some_and(|a| space.in_stack_region(a)) =>
            {
                // Growable stack: extend the mapping and re-run from the
                // faulting instruction.
                if let Some(a) = ea {
                    let _ = space.grow_stack(self.id, a);
                }
                self.stats.stack_grows += 1;
                self.squash_from(tag, pc, None, now);
            }
            ExceptionCode::SoftSpecLoadCohe | ExceptionCode::SoftSpecLoadRepl => {
                self.stats.spec_squashes += 1;
                self.squash_from(tag, pc, None, now);
            }
            ExceptionCode::WindowOverflow | ExceptionCode::WindowUnderflow => {
                // Window trap: the register file already spilled (or
                // refilled) the affected window when the CWP moved, standing
                // in for the trap handler. The SAVE/RESTORE itself commits;
                // everything fetched in the trap shadow is squashed and
                // re-fetched behind it.
                self.stats.window_traps += 1;
                if let Some(entry) = self.al.pop_head() {
                    for r in entry.renames() {
                        self.regs.release(r.bank, r.old);
                    }
                }
                self.stats.retired += 1;
                self.mu.remove(inst, tag);
                let _ = self.insts.put(inst, now);
                self.squash_after(tag, VirtAddr(pc.0 + 4), None, now);
            }
            ExceptionCode::SysTrap => {
                let i = self.insts.get_ref(inst);
                let trapno = (i.instr.imm as u32) & 0x7f;
                if trapno == 0 {
                    // Trap 0: application exit; code in %o0.
                    let o0 = self.regs.map.to_logical(self.regs.cwp, 8);
                    let code = self.regs.read_logical(Bank::Int, o0);
                    self.halted = Some(HaltReason::Exit(code));
                } else {
                    self.halted = Some(HaltReason::Fault(exc));
                }
                self.squash_from(tag, pc, None, now);
            }
            _ => {
                // BadPc, real SegV, Div0, FpError, Privileged, Illegal: no
                // handler in this machine model — squash younger work and
                // stop the processor.
                self.squash_from(tag, pc, None, now);
                self.halted = Some(HaltReason::Fault(exc));
            }
        }
    }

    // ---- squash --------------------------------------------------------

    /// Squashes everything younger than `boundary` and restarts fetch.
    pub fn squash_after(
        &mut self,
        boundary: u64,
        restart: VirtAddr,
        after_delay: Option<VirtAddr>,
        now: SimTime,
    ) {
        self.stats.squashes += 1;
        // Fetched-but-undecoded instances are all younger than the boundary.
        while let Some(id) = self.decode_q.pop_back() {
            let _ = self.insts.put(id, now);
        }
        let mut oldest_cwp = None;
        let insts = &mut self.insts;
        let regs = &mut self.regs;
        self.al.squash_after(boundary, |e: AlEntry| {
            // Youngest first: undo renames in reverse allocation order.
            for r in e.renames().collect::<Vec<_>>().into_iter().rev() {
                regs.rollback(r.bank, r.logical, r.new, r.old);
            }
            oldest_cwp = Some(insts.get_ref(e.inst).cwp_at_decode);
            let _ = insts.put(e.inst, now);
        });
        if let Some(cwp) = oldest_cwp {
            self.regs.set_cwp(cwp);
        }
        let insts = &self.insts;
        self.issue_q
            .retain(|id| insts_alive(insts, *id, boundary));
        self.fu_pipe.retain(|(_, _, t)| *t <= boundary);
        self.mu.squash_after(boundary);
        self.fetch_pc = restart;
        self.after_delay = after_delay;
        self.fetch_halted = false;
        debug!(target: "proc", proc = self.id, boundary, restart = %restart, "squash");
    }

    /// Squashes from `tag` inclusive (exception replay path).
    fn squash_from(
        &mut self,
        tag: u64,
        restart: VirtAddr,
        after_delay: Option<VirtAddr>,
        now: SimTime,
    ) {
        self.squash_after(tag.saturating_sub(1), restart, after_delay, now);
    }

    // ---- execute completions -------------------------------------------

    fn complete_fus(&mut self, _now: SimTime) {
        let cycle = self.stats.cycles;
        let mut done = Vec::new();
        self.fu_pipe.retain(|&(ready, id, tag)| {
            if ready <= cycle {
                done.push((id, tag));
                false
            } else {
                true
            }
        });
        for (id, tag) in done {
            if !self.insts.is_in_use(id) || self.insts.get_ref(id).tag != tag {
                continue;
            }
            let i = self.insts.get_mut(id);
            i.completed = true;
            let (prd, prcc, rdval, rccval) = (i.prd, i.prcc, i.rdval, i.rccval);
            let fp = i.instr.op.writes_fp();
            let bank = if fp { Bank::Fp } else { Bank::Int };
            if let Some(p) = prd {
                self.regs.write(bank, p, rdval);
            }
            if let Some(p) = prcc {
                self.regs.write(Bank::Int, p, rccval);
            }
        }
    }

    // ---- issue / execute ------------------------------------------------

    fn issue_stage(&mut self, _now: SimTime) {
        let mut issued = 0;
        let mut k = 0;
        while k < self.issue_q.len() && issued < self.issue_rate {
            let id = self.issue_q[k];
            let i = self.insts.get_mut(id);
            if !i.ops_ready || i.issued {
                k += 1;
                continue;
            }
            i.issued = true;
            if i.exception == ExceptionCode::BadPc {
                // Fetch already attached the exception: keep it, nothing
                // to execute.
                i.completed = true;
                self.issue_q.remove(k);
                continue;
            }
            funcs::execute(i);
            issued += 1;

            let tag = i.tag;
            let op = i.instr.op;
            match op.mem_class() {
                Some(MemClass::Store) => {
                    // Stores complete once the address is bound; the data
                    // moves at retire.
                    i.completed = true;
                }
                Some(MemClass::Prefetch) => {
                    i.completed = true;
                }
                Some(_) => {} // loads and RMWs complete via mem_done
                None => {
                    // Window traps are soft: the SAVE/RESTORE still produces
                    // its add result, and the trap is taken at retire.
                    let soft_window = matches!(
                        i.exception,
                        ExceptionCode::WindowOverflow | ExceptionCode::WindowUnderflow
                    );
                    if i.exception == ExceptionCode::Ok
                        || i.exception == ExceptionCode::SerializeAfterRetire
                        || soft_window
                    {
                        let lat = fu_latency(op);
                        if i.exception == ExceptionCode::SerializeAfterRetire {
                            // Completes immediately; the real work happens
                            // at retire.
                            i.completed = true;
                        } else if lat <= 1 {
                            let (prd, prcc, rdval, rccval) =
                                (i.prd, i.prcc, i.rdval, i.rccval);
                            i.completed = true;
                            let fp = op.writes_fp();
                            let bank = if fp { Bank::Fp } else { Bank::Int };
                            if let Some(p) = prd {
                                self.regs.write(bank, p, rdval);
                            }
                            if let Some(p) = prcc {
                                self.regs.write(Bank::Int, p, rccval);
                            }
                        } else {
                            self.fu_pipe.push((self.stats.cycles + lat, id, tag));
                        }
                    } else {
                        // Faulted in execute: retirable as-is.
                        i.completed = true;
                    }
                }
            }

            // Mispredict detection happens as soon as the branch resolves.
            let i = self.insts.get_mut(id);
            if i.instr.op.branch_kind().is_some() {
                i.completed = true;
                let b = &mut i.branch;
                if b.taken != b.predicted_taken
                    || (b.taken && b.target != b.predicted_target)
                {
                    b.mispredicted = true;
                }
            }
            self.issue_q.remove(k);
        }
    }

    // ---- register read --------------------------------------------------

    fn regread_stage(&mut self) {
        for &id in &self.issue_q {
            let i = self.insts.get_ref(id);
            if i.ops_ready || i.issued {
                continue;
            }
            let ready = [
                (i.prs1, i.instr.rs1_type.is_fp()),
                (i.prs2, i.instr.rs2_type.is_fp()),
                (i.prscc, false),
                (i.prs_st, i.instr.op == Opcode::Stf || i.instr.op == Opcode::Stdf),
                (i.prs_st2, false),
            ]
            .iter()
            .all(|&(p, fp)| {
                p.is_none_or(|p| !self.regs.is_busy(if fp { Bank::Fp } else { Bank::Int }, p))
            });
            if !ready {
                continue;
            }
            let i = self.insts.get_mut(id);
            let read = |regs: &RegFile, p: Option<u16>, fp: bool| {
                p.map_or(0, |p| regs.read(if fp { Bank::Fp } else { Bank::Int }, p))
            };
            let (prs1, prs2, prscc, prs_st, prs_st2) =
                (i.prs1, i.prs2, i.prscc, i.prs_st, i.prs_st2);
            let (f1, f2) = (i.instr.rs1_type.is_fp(), i.instr.rs2_type.is_fp());
            let fst = i.instr.op == Opcode::Stf || i.instr.op == Opcode::Stdf;
            i.rs1val = read(&self.regs, prs1, f1);
            i.rs2val = read(&self.regs, prs2, f2);
            i.rsccval = read(&self.regs, prscc, false);
            i.stval = read(&self.regs, prs_st, fst);
            i.stval2 = read(&self.regs, prs_st2, false);
            i.ops_ready = true;
        }
    }

    // ---- decode / rename ------------------------------------------------

    fn decode_stage(&mut self) {
        for _ in 0..self.fetch_rate {
            let Some(&id) = self.decode_q.front() else { return };
            if self.al.is_full() {
                return;
            }
            let op = self.insts.get_ref(id).instr.op;

            // Serializing opcodes wait for the machine to drain, then
            // decode alone.
            if op.serializes_decode() && !self.al.is_empty() {
                return;
            }

            if !self.rename_one(id) {
                return; // out of physical registers
            }
            let _ = self.decode_q.pop_front();
            if op.serializes_decode() {
                return;
            }
        }
    }

    /// Renames one instruction and appends it to the active list and, for
    /// memory opcodes, the memory queue. Returns false if the free lists
    /// cannot supply the destinations (decode stalls).
    fn rename_one(&mut self, id: InstId) -> bool {
        let i = self.insts.get_ref(id);
        let instr = i.instr;
        let tag = i.tag;
        let cwp = self.regs.cwp;
        let need_int = (instr.rd != 0 && !instr.rd_type.is_fp()) as usize
            + usize::from(instr.rd_type == RegType::IntPair)
            + usize::from(instr.rcc != 0);
        let need_fp = usize::from(instr.rd_type.is_fp() && is_dest_op(instr.op));
        let (free_int, free_fp) = self.regs.free_counts();
        if free_int < need_int + 1 || free_fp < need_fp + 1 {
            return false;
        }

        // Window instructions move the CWP before younger instructions
        // rename; decode was serialized, so nothing older is in flight.
        // Overflow/underflow rides the instance to retire, where the window
        // trap is taken (the register file has already spilled or refilled
        // the affected window).
        let mut window_exc = None;
        match instr.wpchange {
            Wpc::Save => {
                if !self.regs.save_window() {
                    window_exc = Some(ExceptionCode::WindowOverflow);
                }
            }
            Wpc::Restore => {
                if !self.regs.restore_window() {
                    window_exc = Some(ExceptionCode::WindowUnderflow);
                }
            }
            Wpc::None => {}
        }
        let new_cwp = self.regs.cwp;

        // Sources rename under the *old* window for SAVE (its adds read the
        // caller frame), which is the window recorded at fetch… SAVE reads
        // rs1/rs2 in the old window and writes rd in the new one.
        let src_cwp = if instr.wpchange == Wpc::Save || instr.wpchange == Wpc::Restore {
            cwp
        } else {
            new_cwp
        };

        let m = self.regs.map;
        let mut renames: [Option<Rename>; 3] = [None, None, None];
        let mut slot = 0;

        let lookup_src = |regs: &RegFile, areg: u8, ty: RegType| -> Option<u16> {
            if areg == 0 && !ty.is_fp() {
                None
            } else if ty.is_fp() {
                Some(regs.lookup(Bank::Fp, areg as usize & 63))
            } else {
                Some(regs.lookup(Bank::Int, m.to_logical(src_cwp, areg)))
            }
        };

        let prs1 = lookup_src(&self.regs, instr.rs1, instr.rs1_type);
        let prs2 = if instr.uses_imm() {
            None
        } else {
            lookup_src(&self.regs, instr.rs2, instr.rs2_type)
        };
        let prscc = if instr.rscc != 0 {
            Some(
                self.regs
                    .lookup(Bank::Int, m.state_logical(instr.rscc)),
            )
        } else {
            None
        };

        // Stores (and MOVr, whose old destination is a source) read their
        // rd field as data.
        let mem = instr.op.mem_class();
        let (prs_st, prs_st2) = if matches!(mem, Some(MemClass::Store | MemClass::Rmw))
            || instr.op == Opcode::MovR
        {
            let fp = instr.op == Opcode::Stf || instr.op == Opcode::Stdf;
            let st = if fp {
                Some(self.regs.lookup(Bank::Fp, instr.rd as usize & 63))
            } else if instr.rd != 0 {
                Some(
                    self.regs
                        .lookup(Bank::Int, m.to_logical(new_cwp, instr.rd)),
                )
            } else {
                None
            };
            let st2 = if instr.op == Opcode::Std {
                Some(
                    self.regs
                        .lookup(Bank::Int, m.to_logical(new_cwp, instr.rd + 1)),
                )
            } else {
                None
            };
            (st, st2)
        } else {
            (None, None)
        };

        // Destination renames.
        let writes_rd = is_dest_op(instr.op) && (instr.rd != 0 || instr.rd_type.is_fp());
        let (prd, prd2) = if writes_rd {
            if instr.rd_type.is_fp() {
                let logical = instr.rd as usize & 63;
                let Some((new, old)) = self.regs.rename(Bank::Fp, logical) else {
                    return false;
                };
                renames[slot] = Some(Rename {
                    bank: Bank::Fp,
                    logical,
                    new,
                    old,
                });
                slot += 1;
                (Some(new), None)
            } else {
                let logical = m.to_logical(new_cwp, instr.rd);
                let Some((new, old)) = self.regs.rename(Bank::Int, logical) else {
                    return false;
                };
                renames[slot] = Some(Rename {
                    bank: Bank::Int,
                    logical,
                    new,
                    old,
                });
                slot += 1;
                if instr.rd_type == RegType::IntPair {
                    let logical2 = m.to_logical(new_cwp, instr.rd + 1);
                    let Some((new2, old2)) = self.regs.rename(Bank::Int, logical2) else {
                        return false;
                    };
                    renames[slot] = Some(Rename {
                        bank: Bank::Int,
                        logical: logical2,
                        new: new2,
                        old: old2,
                    });
                    slot += 1;
                    (Some(new), Some(new2))
                } else {
                    (Some(new), None)
                }
            }
        } else {
            (None, None)
        };

        let prcc = if instr.rcc != 0 {
            let logical = m.state_logical(instr.rcc);
            let Some((new, old)) = self.regs.rename(Bank::Int, logical) else {
                return false;
            };
            renames[slot] = Some(Rename {
                bank: Bank::Int,
                logical,
                new,
                old,
            });
            Some(new)
        } else {
            None
        };

        {
            let i = self.insts.get_mut(id);
            i.prs1 = prs1;
            i.prs2 = prs2;
            i.prscc = prscc;
            i.prs_st = prs_st;
            i.prs_st2 = prs_st2;
            i.prd = prd;
            i.prd2 = prd2;
            i.prcc = prcc;
            i.cwp_at_decode = cwp;
            if let Some(e) = window_exc {
                i.exception = e;
            }
        }

        self.al.push(AlEntry {
            inst: id,
            tag,
            renames,
        });
        if let Some(mc) = mem {
            let kind = match mc {
                MemClass::Load => MemKind::Load,
                MemClass::Store => MemKind::Store,
                MemClass::Rmw => MemKind::Rmw,
                MemClass::Prefetch => MemKind::Prefetch,
            };
            self.mu.enqueue(id, tag, kind);
        } else if instr.op == Opcode::Membar {
            self.mu.enqueue(id, tag, MemKind::Membar(instr.imm));
        }
        self.issue_q.push(id);
        true
    }

    // ---- fetch ----------------------------------------------------------

    fn fetch_stage(&mut self, instrs: &InstrFile) {
        if self.fetch_halted || self.halted.is_some() {
            return;
        }
        for _ in 0..self.fetch_rate {
            // Leave headroom: everything fetched must fit the pipeline.
            if self.decode_q.len() >= 2 * self.fetch_rate {
                return;
            }
            let pc = self.fetch_pc;
            let Some(&instr) = instrs.instr_at(pc) else {
                // Misaligned or out-of-segment PC.
                let id = self.new_instance(pc, crate::isa::Instr::default());
                let i = self.insts.get_mut(id);
                i.exception = ExceptionCode::BadPc;
                i.completed = true;
                self.decode_q.push_back(id);
                self.fetch_halted = true;
                return;
            };

            let id = self.new_instance(pc, instr);
            self.decode_q.push_back(id);

            // Branch prediction steers the next fetch PC. `redirect` is the
            // target that follows this instruction's delay slot.
            let mut next = VirtAddr(pc.0 + 4);
            let mut redirect: Option<VirtAddr> = None;
            match instr.op.branch_kind() {
                Some(BranchKind::Cond) => {
                    let static_target = VirtAddr(pc.0.wrapping_add(instr.imm as i64 as u64));
                    // Branch-never and branch-always bypass the predictor.
                    let predicted = match instr.aux1 & 0xf {
                        0x0 => false,
                        0x8 => true,
                        _ => self.bp.predict(pc),
                    };
                    let i = self.insts.get_mut(id);
                    i.branch.predicted_taken = predicted;
                    i.branch.predicted_target = static_target;
                    if predicted {
                        redirect = Some(static_target);
                    } else if instr.annul {
                        // Annulled delay slot is not fetched at all.
                        next = VirtAddr(pc.0 + 8);
                    }
                }
                Some(BranchKind::Call) => {
                    let target = VirtAddr(pc.0.wrapping_add(instr.imm as i64 as u64));
                    self.bp.ras_push(VirtAddr(pc.0 + 8));
                    let i = self.insts.get_mut(id);
                    i.branch.predicted_taken = true;
                    i.branch.predicted_target = target;
                    redirect = Some(target);
                }
                Some(BranchKind::Return) => {
                    if let Some(t) = self.bp.ras_pop() {
                        let i = self.insts.get_mut(id);
                        i.branch.predicted_taken = true;
                        i.branch.predicted_target = t;
                        redirect = Some(t);
                    } else {
                        self.fetch_delay_slot_then_halt(pc, instrs);
                        return;
                    }
                }
                Some(BranchKind::Indirect) => {
                    if instr.uncond_branch == 4 {
                        // Predecoder-identified return idiom.
                        if let Some(t) = self.bp.ras_pop() {
                            let i = self.insts.get_mut(id);
                            i.branch.predicted_taken = true;
                            i.branch.predicted_target = t;
                            redirect = Some(t);
                        } else {
                            self.fetch_delay_slot_then_halt(pc, instrs);
                            return;
                        }
                    } else {
                        // Target needs address calculation: fetch the delay
                        // slot, then wait for the redirect at retire.
                        self.fetch_delay_slot_then_halt(pc, instrs);
                        return;
                    }
                }
                None => {}
            }

            self.fetch_pc = next;
            if let Some(t) = redirect {
                // This instruction is a taken-predicted branch: its delay
                // slot comes next, the target after that.
                self.after_delay = Some(t);
            } else if let Some(t) = self.after_delay.take() {
                // This instruction was the delay slot: steer to the target.
                self.fetch_pc = t;
            }
        }
    }

    /// Fetches the delay slot of an unpredictable branch, then halts fetch
    /// until the branch retires and redirects.
    fn fetch_delay_slot_then_halt(&mut self, branch_pc: VirtAddr, instrs: &InstrFile) {
        let slot_pc = VirtAddr(branch_pc.0 + 4);
        if let Some(&instr) = instrs.instr_at(slot_pc) {
            let id = self.new_instance(slot_pc, instr);
            self.decode_q.push_back(id);
        }
        self.after_delay = None;
        self.fetch_halted = true;
    }

    fn new_instance(&mut self, pc: VirtAddr, instr: crate::isa::Instr) -> InstId {
        let id = self.insts.get();
        let tag = self.next_tag;
        self.next_tag += 1;
        self.insts
            .get_mut(id)
            .reset_for(tag, pc, instr, self.regs.cwp);
        id
    }
}

fn insts_alive(pool: &Pool<Instance, InstId>, id: InstId, boundary: u64) -> bool {
    pool.is_in_use(id) && pool.get_ref(id).tag <= boundary
}

/// True for opcodes that write an rd destination.
fn is_dest_op(op: Opcode) -> bool {
    use Opcode::*;
    !matches!(
        op,
        Stb | Sth
            | Stw
            | Stx
            | Std
            | Stf
            | Stdf
            | Bicc
            | Bpcc
            | Bpr
            | Fbfcc
            | Tcc
            | Membar
            | Flushw
            | WrY
            | WrCcr
            | WrAsi
            | WrFprs
            | Prefetch
            | Reserved
            | IllTrap
            | FCmpS
            | FCmpD
    )
}

/// Functional-unit latency in cycles.
fn fu_latency(op: Opcode) -> u64 {
    use Opcode::*;
    match op {
        MulX | UMul | SMul => 3,
        SDivX | UDivX | UDiv | SDiv | UDivCc | SDivCc => 9,
        FAddS | FAddD | FSubS | FSubD | FMulS | FMulD | FsMulD => 3,
        FDivS | FDivD => 10,
        FSqrtS | FSqrtD => 12,
        _ => 1,
    }
}
