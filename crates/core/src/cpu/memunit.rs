//! Memory queue and consistency enforcement.
//!
//! Every memory operation enters the memory queue at decode, in program
//! order. The queue decides when an operation may leave for the cache
//! hierarchy, according to the consistency model:
//!
//! - **SC**: a load issues non-speculatively only at the queue head with the
//!   write buffer empty.
//! - **PC**: a load issues non-speculatively once all earlier loads are
//!   done; it may bypass buffered stores (store→load order is relaxed).
//! - **RC**: loads issue freely once earlier acquires (RMWs) and barriers
//!   are satisfied.
//!
//! With `speculative_loads` enabled, a load that fails only the
//! model-specific test issues anyway and is recorded in the speculative-load
//! buffer. The L1 calls [`MemUnit::spec_load_cohe`] for every external
//! coherence message and every L2→L1 replacement; a match flags the load
//! `SoftSpecLoadCohe`/`SoftSpecLoadRepl`, and retire squashes and re-fetches
//! from it.
//!
//! Disambiguation: no load issues past an earlier store whose address is
//! still unknown; once known, an overlapping store stalls the load until it
//! retires into the write buffer (which then forwards). A load that was
//! forwarded never re-issues and never re-forwards.

use std::collections::VecDeque;

use tracing::debug;

use crate::common::{ExceptionCode, LineTag};
use crate::config::ConsistencyModel;
use crate::event::Pool;
use crate::isa::membar;

use super::funcs::membar_orders;
use super::instance::{InstId, Instance, MemProgress};

/// Why the speculative-load buffer flagged a load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoheKind {
    /// External invalidation (another processor wrote the line).
    Cohe,
    /// The line left the local hierarchy by replacement.
    Repl,
}

/// Queue entry classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemKind {
    /// Ordinary load.
    Load,
    /// Store (drains via the write buffer at retire).
    Store,
    /// Atomic read-modify-write.
    Rmw,
    /// Non-binding prefetch.
    Prefetch,
    /// Memory barrier with its ordering mask.
    Membar(i32),
}

impl MemKind {
    fn is_store_class(self) -> bool {
        matches!(self, Self::Store | Self::Rmw)
    }
}

/// One memory-queue entry.
#[derive(Clone, Copy, Debug)]
pub struct MemqEntry {
    /// Instance in the slot.
    pub inst: InstId,
    /// Its tag (staleness and squash boundaries).
    pub tag: u64,
    /// Classification.
    pub kind: MemKind,
}

/// A load in the speculative-load buffer.
#[derive(Clone, Copy, Debug)]
struct SpecLoad {
    inst: InstId,
    tag: u64,
    line: LineTag,
}

/// Verdict on one queue entry this cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueVerdict {
    /// May issue non-speculatively.
    Issue,
    /// May issue, but must be tracked as a speculative load.
    IssueSpeculative,
    /// Must wait.
    Hold,
}

/// Counters for the memory unit.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemUnitStats {
    /// Loads issued to the hierarchy.
    pub loads_issued: u64,
    /// Loads issued speculatively.
    pub spec_loads: u64,
    /// Loads forwarded from the write buffer.
    pub forwards: u64,
    /// Speculation squashes from coherence hits.
    pub cohe_squashes: u64,
    /// Speculation squashes from replacements.
    pub repl_squashes: u64,
}

/// The memory queue and consistency state of one processor.
pub struct MemUnit {
    model: ConsistencyModel,
    spec_enabled: bool,
    queue: VecDeque<MemqEntry>,
    spec_loads: Vec<SpecLoad>,
    /// Counters.
    pub stats: MemUnitStats,
}

impl MemUnit {
    /// Creates the memory unit.
    pub fn new(model: ConsistencyModel, spec_enabled: bool) -> Self {
        Self {
            model,
            spec_enabled,
            queue: VecDeque::new(),
            spec_loads: Vec::new(),
            stats: MemUnitStats::default(),
        }
    }

    /// Entries currently queued (oldest first).
    pub fn iter(&self) -> impl Iterator<Item = &MemqEntry> {
        self.queue.iter()
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no memory operations are in flight.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Loads currently tracked as speculative (the RC load queue / SC-PC
    /// speculative tracker).
    pub fn spec_load_count(&self) -> usize {
        self.spec_loads.len()
    }

    /// Appends a decoded memory operation in program order.
    pub fn enqueue(&mut self, inst: InstId, tag: u64, kind: MemKind) {
        self.queue.push_back(MemqEntry { inst, tag, kind });
    }

    /// Decides whether the queue entry for `inst` may issue this cycle.
    ///
    /// `wb_empty` reports whether the write buffer has drained; forwarding
    /// candidates are probed separately by the issuing path.
    pub fn verdict(
        &self,
        inst: InstId,
        insts: &Pool<Instance, InstId>,
        wb_empty: bool,
    ) -> IssueVerdict {
        let Some(pos) = self.queue.iter().position(|e| e.inst == inst) else {
            return IssueVerdict::Hold;
        };
        let entry = self.queue[pos];
        let me = insts.get_ref(entry.inst);
        if me.memprogress != MemProgress::AddrReady {
            return IssueVerdict::Hold;
        }
        let my_ea = me.ea.map(|a| (a, me.instr.op.access_size()));

        // Universal constraints: barriers, RMW serialization, and store
        // disambiguation apply under every model.
        let mut earlier_load_pending = false;
        let mut earlier_any_pending = false;
        for e in self.queue.iter().take(pos) {
            let other = insts.get_ref(e.inst);
            match e.kind {
                MemKind::Membar(mask) => {
                    // A barrier gates us if it orders anything before it
                    // against our class; it is satisfied only when all
                    // earlier constrained entries are done, which we fold
                    // into "anything before the barrier still pending".
                    let later_store = entry.kind.is_store_class();
                    if membar_orders(mask, false, later_store)
                        || membar_orders(mask, true, later_store)
                    {
                        if earlier_any_pending {
                            return IssueVerdict::Hold;
                        }
                        if mask & membar::MEM_ISSUE != 0 && !wb_empty {
                            return IssueVerdict::Hold;
                        }
                    }
                }
                MemKind::Rmw => {
                    if other.memprogress != MemProgress::Done {
                        return IssueVerdict::Hold;
                    }
                }
                MemKind::Store => {
                    match other.memprogress {
                        MemProgress::None => return IssueVerdict::Hold, // address unknown
                        _ => {
                            if let (Some((a, sz)), Some(oa)) = (my_ea, other.ea) {
                                let osz = other.instr.op.access_size();
                                if a.0 < oa.0 + osz && oa.0 < a.0 + sz {
                                    // Overlap with an unretired store: wait
                                    // for it to reach the write buffer.
                                    return IssueVerdict::Hold;
                                }
                            }
                            earlier_any_pending = true;
                        }
                    }
                }
                MemKind::Load => {
                    if other.memprogress != MemProgress::Done
                        && other.memprogress != MemProgress::Forwarded
                    {
                        earlier_load_pending = true;
                        earlier_any_pending = true;
                    }
                }
                MemKind::Prefetch => {}
            }
        }

        match entry.kind {
            MemKind::Prefetch => IssueVerdict::Issue,
            MemKind::Rmw => {
                // Serialize: oldest memory operation, stores drained.
                if pos == 0 && wb_empty {
                    IssueVerdict::Issue
                } else {
                    IssueVerdict::Hold
                }
            }
            MemKind::Store | MemKind::Membar(_) => IssueVerdict::Hold,
            MemKind::Load => {
                let non_spec = match self.model {
                    ConsistencyModel::Sc => pos == 0 && wb_empty,
                    ConsistencyModel::Pc => !earlier_load_pending,
                    ConsistencyModel::Rc => true,
                };
                if non_spec {
                    IssueVerdict::Issue
                } else if self.spec_enabled {
                    IssueVerdict::IssueSpeculative
                } else {
                    IssueVerdict::Hold
                }
            }
        }
    }

    /// Entries worth attempting to issue this cycle, oldest first.
    pub fn issue_candidates(&self, insts: &Pool<Instance, InstId>) -> Vec<InstId> {
        self.queue
            .iter()
            .filter(|e| {
                let i = insts.get_ref(e.inst);
                i.tag == e.tag
                    && i.memprogress == MemProgress::AddrReady
                    && !matches!(e.kind, MemKind::Store | MemKind::Membar(_))
            })
            .map(|e| e.inst)
            .collect()
    }

    /// Records that a load/RMW left for the hierarchy.
    pub fn mark_issued(&mut self, inst: InstId, tag: u64, line: LineTag, speculative: bool) {
        if speculative {
            self.stats.spec_loads += 1;
            self.spec_loads.push(SpecLoad { inst, tag, line });
        }
    }

    /// Removes a retired (or squashed) operation from the queue and the
    /// speculative tracker.
    pub fn remove(&mut self, inst: InstId, tag: u64) {
        if let Some(pos) = self
            .queue
            .iter()
            .position(|e| e.inst == inst && e.tag == tag)
        {
            let _ = self.queue.remove(pos);
        }
        self.spec_loads.retain(|s| !(s.inst == inst && s.tag == tag));
    }

    /// Squash support: drops every entry younger than `boundary`.
    pub fn squash_after(&mut self, boundary: u64) {
        self.queue.retain(|e| e.tag <= boundary);
        self.spec_loads.retain(|s| s.tag <= boundary);
    }

    /// The speculative-load coherence upcall.
    ///
    /// Called by the L1 on every incoming external coherence message and on
    /// every replacement pushed down from the L2. Flags every tracked
    /// speculative load of `line` whose instance is still current; retire
    /// will squash from the oldest flagged one.
    pub fn spec_load_cohe(
        &mut self,
        line: LineTag,
        kind: CoheKind,
        insts: &mut Pool<Instance, InstId>,
    ) -> usize {
        let mut hit = 0;
        for s in &self.spec_loads {
            if s.line != line {
                continue;
            }
            let i = insts.get_mut(s.inst);
            if i.tag != s.tag || i.exception.is_trouble() {
                continue;
            }
            i.exception = match kind {
                CoheKind::Cohe => ExceptionCode::SoftSpecLoadCohe,
                CoheKind::Repl => ExceptionCode::SoftSpecLoadRepl,
            };
            hit += 1;
        }
        if hit > 0 {
            match kind {
                CoheKind::Cohe => self.stats.cohe_squashes += hit as u64,
                CoheKind::Repl => self.stats.repl_squashes += hit as u64,
            }
            debug!(target: "memunit", ?line, ?kind, hit, "speculative loads flagged");
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::VirtAddr;
    use crate::isa::{Instr, Opcode};

    fn pool_with(n: usize) -> (Pool<Instance, InstId>, Vec<InstId>) {
        let mut pool: Pool<Instance, InstId> = Pool::new("inst", 8);
        let ids = (0..n).map(|_| pool.get()).collect();
        (pool, ids)
    }

    fn mk_load(pool: &mut Pool<Instance, InstId>, id: InstId, tag: u64, ea: u64) {
        let i = pool.get_mut(id);
        i.tag = tag;
        i.instr = Instr {
            op: Opcode::Ldsw,
            ..Instr::default()
        };
        i.ea = Some(VirtAddr(ea));
        i.memprogress = MemProgress::AddrReady;
    }

    fn mk_store(pool: &mut Pool<Instance, InstId>, id: InstId, tag: u64, ea: Option<u64>) {
        let i = pool.get_mut(id);
        i.tag = tag;
        i.instr = Instr {
            op: Opcode::Stw,
            ..Instr::default()
        };
        i.ea = ea.map(VirtAddr);
        i.memprogress = if ea.is_some() {
            MemProgress::AddrReady
        } else {
            MemProgress::None
        };
    }

    #[test]
    fn test_sc_load_waits_for_head() {
        let (mut pool, ids) = pool_with(2);
        let mut mu = MemUnit::new(ConsistencyModel::Sc, true);
        mk_load(&mut pool, ids[0], 1, 0x1000);
        mk_load(&mut pool, ids[1], 2, 0x2000);
        mu.enqueue(ids[0], 1, MemKind::Load);
        mu.enqueue(ids[1], 2, MemKind::Load);

        assert_eq!(mu.verdict(ids[0], &pool, true), IssueVerdict::Issue);
        // Younger load is speculative under SC.
        assert_eq!(
            mu.verdict(ids[1], &pool, true),
            IssueVerdict::IssueSpeculative
        );
        // With speculation off it holds.
        let mut mu2 = MemUnit::new(ConsistencyModel::Sc, false);
        mu2.enqueue(ids[0], 1, MemKind::Load);
        mu2.enqueue(ids[1], 2, MemKind::Load);
        assert_eq!(mu2.verdict(ids[1], &pool, true), IssueVerdict::Hold);
    }

    #[test]
    fn test_pc_load_passes_stores_not_loads() {
        let (mut pool, ids) = pool_with(2);
        let mut mu = MemUnit::new(ConsistencyModel::Pc, true);
        mk_store(&mut pool, ids[0], 1, Some(0x3000));
        mk_load(&mut pool, ids[1], 2, 0x1000);
        mu.enqueue(ids[0], 1, MemKind::Store);
        mu.enqueue(ids[1], 2, MemKind::Load);
        // Store→load reordering is allowed non-speculatively under PC.
        assert_eq!(mu.verdict(ids[1], &pool, false), IssueVerdict::Issue);
    }

    #[test]
    fn test_rc_load_issues_freely() {
        let (mut pool, ids) = pool_with(2);
        let mut mu = MemUnit::new(ConsistencyModel::Rc, true);
        mk_load(&mut pool, ids[0], 1, 0x1000);
        mk_load(&mut pool, ids[1], 2, 0x2000);
        mu.enqueue(ids[0], 1, MemKind::Load);
        mu.enqueue(ids[1], 2, MemKind::Load);
        assert_eq!(mu.verdict(ids[1], &pool, false), IssueVerdict::Issue);
    }

    #[test]
    fn test_unknown_store_address_blocks_loads() {
        let (mut pool, ids) = pool_with(2);
        let mut mu = MemUnit::new(ConsistencyModel::Rc, true);
        mk_store(&mut pool, ids[0], 1, None);
        mk_load(&mut pool, ids[1], 2, 0x1000);
        mu.enqueue(ids[0], 1, MemKind::Store);
        mu.enqueue(ids[1], 2, MemKind::Load);
        assert_eq!(mu.verdict(ids[1], &pool, true), IssueVerdict::Hold);
    }

    #[test]
    fn test_overlapping_store_blocks_load() {
        let (mut pool, ids) = pool_with(2);
        let mut mu = MemUnit::new(ConsistencyModel::Rc, true);
        mk_store(&mut pool, ids[0], 1, Some(0x1000));
        mk_load(&mut pool, ids[1], 2, 0x1000);
        mu.enqueue(ids[0], 1, MemKind::Store);
        mu.enqueue(ids[1], 2, MemKind::Load);
        assert_eq!(mu.verdict(ids[1], &pool, true), IssueVerdict::Hold);
    }

    #[test]
    fn test_rmw_serializes() {
        let (mut pool, ids) = pool_with(3);
        let mut mu = MemUnit::new(ConsistencyModel::Rc, true);
        mk_load(&mut pool, ids[0], 1, 0x1000);
        {
            let i = pool.get_mut(ids[1]);
            i.tag = 2;
            i.instr = Instr {
                op: Opcode::Casa,
                ..Instr::default()
            };
            i.ea = Some(VirtAddr(0x2000));
            i.memprogress = MemProgress::AddrReady;
        }
        mk_load(&mut pool, ids[2], 3, 0x3000);
        mu.enqueue(ids[0], 1, MemKind::Load);
        mu.enqueue(ids[1], 2, MemKind::Rmw);
        mu.enqueue(ids[2], 3, MemKind::Load);

        // Not at head: holds.
        assert_eq!(mu.verdict(ids[1], &pool, true), IssueVerdict::Hold);
        // Later load held by incomplete RMW even under RC.
        assert_eq!(mu.verdict(ids[2], &pool, true), IssueVerdict::Hold);

        // Head load done and removed: RMW may go (wb empty).
        pool.get_mut(ids[0]).memprogress = MemProgress::Done;
        mu.remove(ids[0], 1);
        assert_eq!(mu.verdict(ids[1], &pool, true), IssueVerdict::Issue);
        assert_eq!(mu.verdict(ids[1], &pool, false), IssueVerdict::Hold);
    }

    #[test]
    fn test_membar_gates() {
        let (mut pool, ids) = pool_with(3);
        let mut mu = MemUnit::new(ConsistencyModel::Rc, true);
        mk_load(&mut pool, ids[0], 1, 0x1000);
        mu.enqueue(ids[0], 1, MemKind::Load);
        mu.enqueue(ids[1], 2, MemKind::Membar(membar::LOAD_LOAD));
        mk_load(&mut pool, ids[2], 3, 0x2000);
        mu.enqueue(ids[2], 3, MemKind::Load);

        // Earlier load pending: the barrier holds the younger load even
        // under RC.
        assert_eq!(mu.verdict(ids[2], &pool, true), IssueVerdict::Hold);
        pool.get_mut(ids[0]).memprogress = MemProgress::Done;
        assert_eq!(mu.verdict(ids[2], &pool, true), IssueVerdict::Issue);
    }

    #[test]
    fn test_spec_load_cohe_flags_violators() {
        let (mut pool, ids) = pool_with(2);
        let mut mu = MemUnit::new(ConsistencyModel::Sc, true);
        mk_load(&mut pool, ids[0], 1, 0x1000);
        mk_load(&mut pool, ids[1], 2, 0x2040);
        mu.enqueue(ids[0], 1, MemKind::Load);
        mu.enqueue(ids[1], 2, MemKind::Load);
        let line = VirtAddr(0x2040).line(6);
        mu.mark_issued(ids[1], 2, line, true);

        assert_eq!(mu.spec_load_cohe(line, CoheKind::Cohe, &mut pool), 1);
        assert_eq!(
            pool.get_ref(ids[1]).exception,
            ExceptionCode::SoftSpecLoadCohe
        );
        // A different line touches nothing.
        assert_eq!(
            mu.spec_load_cohe(LineTag(0xdead), CoheKind::Repl, &mut pool),
            0
        );
    }

    #[test]
    fn test_squash_after_truncates() {
        let (mut pool, ids) = pool_with(3);
        let mut mu = MemUnit::new(ConsistencyModel::Sc, true);
        for (k, id) in ids.iter().enumerate() {
            mk_load(&mut pool, *id, k as u64 + 1, 0x1000 + k as u64 * 0x40);
            mu.enqueue(*id, k as u64 + 1, MemKind::Load);
            mu.mark_issued(*id, k as u64 + 1, LineTag(k as u64), true);
        }
        mu.squash_after(1);
        assert_eq!(mu.len(), 1);
        assert_eq!(mu.spec_load_count(), 1);
    }
}
