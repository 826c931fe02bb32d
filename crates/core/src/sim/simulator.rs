//! The simulator: one value owning the whole machine.
//!
//! Construction wires up N processor nodes (pipeline + L1 + write buffer +
//! L2 + bus + memory bank + directory slice), two mesh networks, the
//! descriptor pools, and the event driver. `run` drives the event list:
//! every activity body names a component and a transaction leg; the
//! dispatcher below is the hub that moves requests between them.
//!
//! Processor nodes are periodic activities (one cycle per activation);
//! everything else is reactive, advancing only when a message arrives or a
//! timer it scheduled fires.

use tracing::{debug, info, trace};

use crate::common::{LineTag, SimError, SimTime};
use crate::config::Config;
use crate::cpu::proc::{HaltReason, MemIssueCand};
use crate::cpu::memunit::{CoheKind, IssueVerdict};
use crate::cpu::Processor;
use crate::event::{ActId, EventDriver, Pool, ScheduleMode};
use crate::isa::pref_fcn;
use crate::isa::{InstrFile, MemClass, Opcode};
use crate::mem::addrspace::AddrSpace;
use crate::mem::bus::{Bus, MemoryBank};
use crate::mem::directory::{DirAction, Directory};
use crate::mem::l1::{L1Cache, L1Outcome};
use crate::mem::l2::{L2Cache, L2Outcome};
use crate::mem::wbuffer::{WbForward, WriteBuffer};
use crate::mem::{HandledBy, Req, ReqId, ReqType};
use crate::net::packet::NetMsg;
use crate::net::{Mesh, Packet, PacketId};

use super::events::EventBody;

/// Per-node memory hierarchy.
pub struct NodeMem {
    /// L1 cache.
    pub l1: L1Cache,
    /// Write buffer.
    pub wb: WriteBuffer,
    /// Inclusive L2 cache.
    pub l2: L2Cache,
    /// Node bus.
    pub bus: Bus,
    /// Memory bank (home slice).
    pub mem: MemoryBank,
    /// Directory slice (home lines).
    pub dir: Directory,
    /// Prefetches issued from this node.
    pub pref_issued: u64,
    /// Prefetches dropped (unmapped or conflicting).
    pub pref_dropped: u64,
    /// Prefetched lines that came back after a demand access wanted them.
    pub pref_late: u64,
}

/// Outcome of a finished run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process exit code: 0 for a clean application exit.
    pub code: i32,
    /// Faulting exception, if the run ended on one.
    pub fault: Option<crate::common::ExceptionCode>,
}

/// The simulator.
pub struct Simulator {
    /// Configuration the machine was built from.
    pub cfg: Config,
    /// Event driver.
    pub driver: EventDriver<EventBody>,
    /// Processor pipelines, one per node.
    pub procs: Vec<Processor>,
    /// Memory hierarchies, one per node.
    pub nodes: Vec<NodeMem>,
    /// Request and reply meshes.
    pub meshes: [Mesh; 2],
    /// Simulated application address space.
    pub space: AddrSpace,
    /// Predecoded instruction stream (shared by all nodes).
    pub instrs: InstrFile,
    /// Request descriptor pool.
    pub reqs: Pool<Req, ReqId>,
    /// Packet descriptor pool.
    pub pkts: Pool<Packet, PacketId>,

    cpu_acts: Vec<ActId>,
    line_bits: u32,
    line_bytes: u64,
}

impl Simulator {
    /// Builds the machine. `space` must already hold the application image.
    pub fn new(cfg: Config, instrs: InstrFile, space: AddrSpace) -> Result<Self, SimError> {
        cfg.validate()?;
        let n = cfg.system.num_procs;
        let (cols, rows) = cfg.mesh_shape();
        let entry = instrs.entry_pc;

        let mut procs = Vec::with_capacity(n);
        let mut nodes = Vec::with_capacity(n);
        for id in 0..n {
            procs.push(Processor::new(id, &cfg, entry)?);
            nodes.push(NodeMem {
                l1: L1Cache::new(&cfg.cache),
                wb: WriteBuffer::new(cfg.cache.write_buffer_size, 1 << cfg.cache.line_bits),
                l2: L2Cache::new(&cfg.cache),
                bus: Bus::new(cfg.memory.bus_width, cfg.memory.bus_latency),
                mem: MemoryBank::new(cfg.memory.mem_latency),
                dir: Directory::new(id, cfg.memory.directory_entries),
                pref_issued: 0,
                pref_dropped: 0,
                pref_late: 0,
            });
        }

        let mut driver = EventDriver::new(cfg.system.event_list_type);
        let mut cpu_acts = Vec::with_capacity(n);
        for p in 0..n {
            cpu_acts.push(driver.schedule(
                EventBody::CpuCycle { proc: p },
                0.0,
                ScheduleMode::Independent,
            )?);
        }

        Ok(Self {
            line_bits: cfg.cache.line_bits,
            line_bytes: 1 << cfg.cache.line_bits,
            meshes: [
                Mesh::new(cols, rows, &cfg.network, "reqnet"),
                Mesh::new(cols, rows, &cfg.network, "replynet"),
            ],
            cfg,
            driver,
            procs,
            nodes,
            space,
            instrs,
            reqs: Pool::new("request", 64),
            pkts: Pool::new("packet", 64),
            cpu_acts,
        })
    }

    /// Runs until every processor halts, the event list drains, or
    /// simulated time reaches `until`.
    pub fn run(&mut self, until: Option<SimTime>) -> Result<ExitStatus, SimError> {
        info!(target: "sim", procs = self.procs.len(), "simulation start");
        while let Some((id, body)) = self.driver.pop_next(until)? {
            trace!(target: "sim", t = self.driver.now(), ?body, "dispatch");
            self.dispatch(body)?;
            self.driver.complete(id)?;
        }
        let mut code = 0i32;
        let mut fault = None;
        for p in &self.procs {
            match p.halted {
                Some(HaltReason::Exit(c)) => code = code.max(c as i32),
                Some(HaltReason::Fault(e)) => {
                    fault = Some(e);
                    code = code.max(1);
                }
                None => {}
            }
        }
        info!(target: "sim", t = self.driver.now(), code, "simulation end");
        Ok(ExitStatus { code, fault })
    }

    /// Schedules an independent one-shot event.
    pub(super) fn sched(&mut self, body: EventBody, delta: f64) -> Result<(), SimError> {
        let _ = self.driver.schedule(body, delta, ScheduleMode::Independent)?;
        Ok(())
    }

    fn dispatch(&mut self, body: EventBody) -> Result<(), SimError> {
        match body {
            EventBody::Idle => Ok(()),
            EventBody::CpuCycle { proc } => self.cpu_cycle(proc),
            EventBody::L2Access { node, req } => self.l2_access(node, req),
            EventBody::L1Fill { node, req, excl } => self.l1_fill(node, req, excl),
            EventBody::DirService { node, req } => self.dir_service(node, req),
            EventBody::MemFetchDone { node, req } => self.mem_fetch_done(node, req),
            EventBody::ToHome { from, req } => self.to_home(from, req),
            EventBody::ReplyOut {
                from,
                req,
                excl,
                dirty,
            } => self.reply_out(from, req, excl, dirty),
            EventBody::ReplyArrived {
                node,
                req,
                excl,
                dirty,
            } => self.reply_arrived(node, req, excl, dirty),
            EventBody::ReqDone { node, req } => self.req_done(node, req),
            EventBody::InvalAt { node, line, home } => self.inval_at(node, line, home),
            EventBody::InvalAckAt { home, line, from } => self.inval_ack_at(home, line, from),
            EventBody::WritebackAt { home, line, from } => self.writeback_at(home, line, from),
            EventBody::TransferAt { node, req } => self.transfer_at(node, req),
            EventBody::FwdDoneAt { home, line, from } => self.fwd_done_at(home, line, from),
            EventBody::DrainWb { node } => self.drain_wb_event(node),
            EventBody::NetHead { vnet, pkt } => self.net_head(vnet, pkt),
            EventBody::NetTail { vnet, pkt } => self.net_tail(vnet, pkt),
        }
    }

    // ====================== processor cycles ===========================

    fn cpu_cycle(&mut self, p: usize) -> Result<(), SimError> {
        let now = self.driver.now();
        {
            let proc = &mut self.procs[p];
            let node = &mut self.nodes[p];
            proc.run_cycle(now, &self.instrs, &mut node.wb, &mut self.space);
        }
        self.memory_issue(p, now)?;
        self.pump_wb(p, now)?;

        if self.procs[p].finished() {
            if !self.nodes[p].wb.is_empty() {
                self.sched(EventBody::DrainWb { node: p }, 1.0)?;
            }
            // The cycle activity dies by not rescheduling itself; in-flight
            // memory and network work drains the event list naturally.
            return Ok(());
        }
        let act = self.cpu_acts[p];
        self.driver
            .schedule_existing(act, 1.0, ScheduleMode::Independent)
    }

    /// The memory-issue step: asks the memory unit what may leave this
    /// cycle and presents it to the L1 (or the write buffer's forward path).
    fn memory_issue(&mut self, p: usize, now: SimTime) -> Result<(), SimError> {
        let wb_empty = self.nodes[p].wb.is_empty();
        let plan: Vec<MemIssueCand> = self.procs[p].memory_issue_plan(wb_empty);

        for c in plan {
            if c.verdict == IssueVerdict::Hold {
                continue;
            }
            let line = c.ea.line(self.line_bits);
            let is_pref = c.op.mem_class() == Some(MemClass::Prefetch);

            if !self.space.is_mapped(p, c.ea, c.size.max(1)) {
                if is_pref {
                    // Prefetches to unmapped addresses vanish silently.
                    self.nodes[p].pref_dropped += 1;
                    self.procs[p].note_prefetch_gone(c.inst, c.tag);
                } else {
                    self.procs[p].note_segv(c.inst, c.tag);
                }
                continue;
            }

            let (ty, needs_excl) = classify_req(c.op, c.aux1);

            if c.op.mem_class() == Some(MemClass::Load) {
                match self.nodes[p].wb.forward(c.ea, c.size) {
                    WbForward::Hit(v) => {
                        self.procs[p].note_forwarded(c.inst, c.tag, v, now);
                        continue;
                    }
                    WbForward::Stall => continue,
                    WbForward::Miss => {}
                }
            }

            // Build the request descriptor.
            let req = self.reqs.get();
            self.reqs.get_mut(req).prepare(
                ty,
                c.ea,
                self.line_bits,
                c.size,
                p,
                if is_pref { None } else { Some((c.inst, c.tag)) },
                now,
            );

            if is_pref {
                self.nodes[p].pref_issued += 1;
                self.procs[p].note_prefetch_gone(c.inst, c.tag);
                if ty.is_l2_prefetch() {
                    let l1_lat = self.nodes[p].l1.latency();
                    self.sched(EventBody::L2Access { node: p, req }, l1_lat as f64)?;
                    continue;
                }
            }

            let outcome =
                self.nodes[p]
                    .l1
                    .access(now, line, req, needs_excl, is_pref);
            match outcome {
                L1Outcome::Hit => {
                    let lat = self.nodes[p].l1.latency() as f64;
                    self.reqs.get_mut(req).handled = HandledBy::L1;
                    self.sched(EventBody::ReqDone { node: p, req }, lat)?;
                    if !is_pref {
                        self.procs[p].note_mem_issued(
                            c.inst,
                            c.tag,
                            line,
                            c.verdict == IssueVerdict::IssueSpeculative,
                        );
                    }
                }
                L1Outcome::MissPrimary => {
                    let lat = self.nodes[p].l1.latency() as f64;
                    self.reqs.get_mut(req).mem_start_time = now;
                    self.sched(EventBody::L2Access { node: p, req }, lat)?;
                    if !is_pref {
                        self.procs[p].note_mem_issued(
                            c.inst,
                            c.tag,
                            line,
                            c.verdict == IssueVerdict::IssueSpeculative,
                        );
                    }
                }
                L1Outcome::MissSecondary => {
                    if !is_pref {
                        self.procs[p].note_mem_issued(
                            c.inst,
                            c.tag,
                            line,
                            c.verdict == IssueVerdict::IssueSpeculative,
                        );
                    }
                }
                L1Outcome::MshrFull | L1Outcome::PortFull => {
                    // Prefetch: drop. Demand: retry next cycle.
                    self.reqs.put(req, now)?;
                    if is_pref {
                        self.nodes[p].pref_dropped += 1;
                    } else {
                        self.procs[p].note_mem_unissued(c.inst, c.tag);
                    }
                }
            }
        }
        Ok(())
    }

    // ======================= write-buffer drain =========================

    fn drain_wb_event(&mut self, node: usize) -> Result<(), SimError> {
        let now = self.driver.now();
        self.pump_wb(node, now)?;
        // Keep pumping while the owner processor is halted.
        if self.procs[node].finished() && !self.nodes[node].wb.is_empty() {
            self.sched(EventBody::DrainWb { node }, 1.0)?;
        }
        Ok(())
    }

    fn pump_wb(&mut self, node: usize, now: SimTime) -> Result<(), SimError> {
        if self.nodes[node].wb.draining() {
            return Ok(());
        }
        let Some((line, addr)) = self.nodes[node].wb.start_drain() else {
            return Ok(());
        };
        let req = self.reqs.get();
        self.reqs
            .get_mut(req)
            .prepare(ReqType::Write, addr, self.line_bits, self.line_bytes, node, None, now);

        let outcome = self.nodes[node].l1.access(now, line, req, true, false);
        match outcome {
            L1Outcome::Hit => {
                let lat = self.nodes[node].l1.latency() as f64;
                self.reqs.get_mut(req).handled = HandledBy::L1;
                self.sched(EventBody::ReqDone { node, req }, lat)
            }
            L1Outcome::MissPrimary => {
                let lat = self.nodes[node].l1.latency() as f64;
                self.sched(EventBody::L2Access { node, req }, lat)
            }
            L1Outcome::MissSecondary => Ok(()),
            L1Outcome::MshrFull | L1Outcome::PortFull => {
                self.nodes[node].wb.abort_drain(line);
                self.reqs.put(req, now)
            }
        }
    }

    // =========================== L2 and fills ===========================

    fn l2_access(&mut self, node: usize, req: ReqId) -> Result<(), SimError> {
        let now = self.driver.now();
        let (line, ty) = {
            let r = self.reqs.get_ref(req);
            (r.line, r.ty)
        };
        let needs_excl = ty.needs_excl();
        let is_pref = ty.is_prefetch();
        let outcome = self.nodes[node]
            .l2
            .access(now, line, req, needs_excl, is_pref);
        let l2_lat = self.nodes[node].l2.latency() as f64;

        match outcome {
            L2Outcome::Hit => {
                if ty.is_l2_prefetch() {
                    return self.reqs.put(req, now);
                }
                {
                    let r = self.reqs.get_mut(req);
                    if r.handled == HandledBy::Unknown {
                        r.handled = HandledBy::L2;
                    }
                }
                self.sched(
                    EventBody::L1Fill {
                        node,
                        req,
                        excl: needs_excl,
                    },
                    l2_lat,
                )
            }
            L2Outcome::MissPrimary { victim } | L2Outcome::UpgradeMiss { victim } => {
                if let Some(v) = victim {
                    self.evict_from_node(node, v.line, v.dirty, v.state.writable(), now)?;
                }
                // Toward the home directory over the node bus.
                let grant = self.nodes[node].bus.acquire(now, 16);
                self.sched(EventBody::ToHome { from: node, req }, grant - now)
            }
            L2Outcome::MissSecondary => Ok(()),
            L2Outcome::MshrFull | L2Outcome::Blocked => {
                if is_pref {
                    self.nodes[node].pref_dropped += 1;
                    self.reqs.put(req, now)
                } else {
                    self.sched(EventBody::L2Access { node, req }, l2_lat)
                }
            }
        }
    }

    /// Disposes of an L2 victim: back-invalidates the inclusive L1, informs
    /// the speculative-load buffer, and notifies the line's home.
    fn evict_from_node(
        &mut self,
        node: usize,
        line: LineTag,
        dirty: bool,
        _owned: bool,
        now: SimTime,
    ) -> Result<(), SimError> {
        let _ = self.nodes[node].l1.ext_invalidate(line);
        self.procs[node].spec_cohe(line, CoheKind::Repl);
        let bytes = if dirty { 16 + self.line_bytes } else { 16 };
        let grant = self.nodes[node].bus.acquire(now, bytes);
        let home = line.home(self.nodes.len());
        self.send_msg(
            node,
            home,
            NetMsg::Writeback { line, from: node },
            grant - now,
        )
    }

    fn l1_fill(&mut self, node: usize, req: ReqId, excl: bool) -> Result<(), SimError> {
        let now = self.driver.now();
        let line = self.reqs.get_ref(req).line;
        let (fill, mshr) = self.nodes[node].l1.fill(line, excl);
        if let Some(v) = fill.victim() {
            if v.dirty {
                // Inclusion holds: the L2 has the line; its copy is stale
                // until the dirty data logically moves down.
                self.nodes[node].l2.mark_written(v.line);
            }
        }
        let l1_lat = self.nodes[node].l1.latency() as f64;
        let Some(m) = mshr else {
            // The line was already installed by an earlier fill (the MSHR
            // went with it); complete this request alone.
            return self.sched(EventBody::ReqDone { node, req }, l1_lat);
        };
        if m.prefetch && m.demand_coalesced {
            self.nodes[node].pref_late += 1;
            self.reqs.get_mut(m.primary).pref_late = true;
        }
        // The classification rides on whichever request the reply resolved.
        let mut handled = self.reqs.get_ref(req).handled;
        if handled == HandledBy::Unknown {
            handled = self.reqs.get_ref(m.primary).handled;
        }
        for r in std::iter::once(m.primary).chain(m.waiters) {
            {
                let rr = self.reqs.get_mut(r);
                if rr.handled == HandledBy::Unknown {
                    rr.handled = handled;
                }
            }
            self.sched(EventBody::ReqDone { node, req: r }, l1_lat)?;
        }
        Ok(())
    }

    /// Final completion: the value crosses back into the pipeline (or the
    /// write buffer finishes its drain).
    fn req_done(&mut self, node: usize, req: ReqId) -> Result<(), SimError> {
        let now = self.driver.now();
        let r = self.reqs.get_ref(req).clone();
        match r.ty {
            ReqType::Write => {
                if let Some(entry) = self.nodes[node].wb.finish_drain(r.line) {
                    for s in &entry.stores {
                        // Globally visible point of the coalesced stores.
                        let _ = self.space.write(node, s.addr, s.size, s.value);
                    }
                }
                self.procs[node]
                    .stats
                    .write_lat
                    .update(now - r.issue_time, 1.0);
                self.reqs.put(req, now)?;
                self.pump_wb(node, now)
            }
            ReqType::Read | ReqType::Rmw => {
                if let Some((inst, tag)) = r.inst {
                    let delivered = self.procs[node].complete_mem(
                        inst,
                        tag,
                        r.handled,
                        r.issue_time,
                        now,
                        &mut self.space,
                    );
                    if !delivered {
                        trace!(target: "sim", node, ?req, "stale completion dropped");
                    }
                }
                self.reqs.put(req, now)
            }
            _ => {
                // Prefetch fill: nothing waits on it.
                self.reqs.put(req, now)
            }
        }
    }

    // ===================== directory transactions =======================

    fn to_home(&mut self, from: usize, req: ReqId) -> Result<(), SimError> {
        let line = self.reqs.get_ref(req).line;
        let home = line.home(self.nodes.len());
        self.send_msg(from, home, NetMsg::Request { req }, 0.0)
    }

    fn dir_service(&mut self, node: usize, req: ReqId) -> Result<(), SimError> {
        let now = self.driver.now();
        let (line, requester, excl) = {
            let r = self.reqs.get_ref(req);
            (r.line, r.proc, r.ty.needs_excl())
        };
        let action = self.nodes[node].dir.begin(line, req, requester, excl);
        debug!(target: "dir", node, %line, requester, ?action, "service");
        match action {
            DirAction::Queued => Ok(()),
            DirAction::MemFetch { .. } => {
                let done = self.nodes[node].mem.access(now);
                self.sched(EventBody::MemFetchDone { node, req }, done - now)
            }
            DirAction::Invalidate { sharers, upgrade } => {
                self.reqs.get_mut(req).upgrade = upgrade;
                if sharers == 0 {
                    let grant = self.nodes[node].bus.acquire(now, 16);
                    self.sched(
                        EventBody::ReplyOut {
                            from: node,
                            req,
                            excl: true,
                            dirty: false,
                        },
                        grant - now,
                    )
                } else {
                    for s in 0..self.nodes.len() {
                        if sharers & (1 << s) != 0 {
                            self.send_msg(node, s, NetMsg::Inval { line, home: node }, 0.0)?;
                        }
                    }
                    Ok(())
                }
            }
            DirAction::Forward { owner, .. } => {
                self.reqs.get_mut(req).forward_to = Some(requester);
                self.send_msg(node, owner, NetMsg::Transfer { req }, 0.0)
            }
        }
    }

    fn mem_fetch_done(&mut self, node: usize, req: ReqId) -> Result<(), SimError> {
        let now = self.driver.now();
        let excl = self.reqs.get_ref(req).ty.needs_excl();
        let grant = self.nodes[node].bus.acquire(now, 16 + self.line_bytes);
        self.sched(
            EventBody::ReplyOut {
                from: node,
                req,
                excl,
                dirty: false,
            },
            grant - now,
        )
    }

    /// The home commits the transaction and sends the reply.
    fn reply_out(
        &mut self,
        from: usize,
        req: ReqId,
        excl: bool,
        dirty: bool,
    ) -> Result<(), SimError> {
        let now = self.driver.now();
        let (line, requester) = {
            let r = self.reqs.get_ref(req);
            (r.line, r.proc)
        };
        if let Some(next) = self.nodes[from].dir.complete(line, now)? {
            self.sched(EventBody::DirService { node: from, req: next }, 1.0)?;
        }
        {
            let r = self.reqs.get_mut(req);
            if r.handled == HandledBy::Unknown {
                r.handled = if requester == from {
                    HandledBy::LocalMem
                } else {
                    HandledBy::RemoteHome
                };
            }
        }
        self.send_msg(from, requester, NetMsg::Reply { req, excl, dirty }, 0.0)
    }

    fn reply_arrived(
        &mut self,
        node: usize,
        req: ReqId,
        excl: bool,
        dirty: bool,
    ) -> Result<(), SimError> {
        let now = self.driver.now();
        let line = self.reqs.get_ref(req).line;
        let l2_lat = self.nodes[node].l2.latency() as f64;
        let Some(m) = self.nodes[node].l2.fill(line, excl, dirty) else {
            // No MSHR: a stray reply. Drop the descriptor.
            return self.reqs.put(req, now);
        };
        let handled = self.reqs.get_ref(req).handled;
        for r in std::iter::once(m.primary).chain(m.waiters) {
            let ty = {
                let rr = self.reqs.get_mut(r);
                if rr.handled == HandledBy::Unknown {
                    rr.handled = handled;
                }
                rr.ty
            };
            if ty.is_l2_prefetch() {
                if m.prefetch && m.demand_coalesced {
                    self.nodes[node].pref_late += 1;
                }
                self.reqs.put(r, now)?;
            } else {
                self.sched(EventBody::L1Fill { node, req: r, excl }, l2_lat)?;
            }
        }
        Ok(())
    }

    // =================== external coherence messages ====================

    fn inval_at(&mut self, node: usize, line: LineTag, home: usize) -> Result<(), SimError> {
        let now = self.driver.now();
        if let Some(v) = self.nodes[node].l2.ext_invalidate(line) {
            if v.state == crate::mem::cache::LineState::Modified {
                return Err(SimError::DirectoryInconsistency {
                    node: home,
                    line,
                    detail: format!("invalidation hit a modified copy at node {node}"),
                    now,
                });
            }
        }
        let _ = self.nodes[node].l1.ext_invalidate(line);
        self.procs[node].spec_cohe(line, CoheKind::Cohe);
        self.send_msg(node, home, NetMsg::InvalAck { line, from: node }, 0.0)
    }

    fn inval_ack_at(&mut self, home: usize, line: LineTag, from: usize) -> Result<(), SimError> {
        let now = self.driver.now();
        let ready = self.nodes[home].dir.inval_ack(line, from, now)?;
        let Some(req) = ready else { return Ok(()) };
        if self.reqs.get_ref(req).upgrade {
            // Pure permission upgrade: no memory data needed.
            let grant = self.nodes[home].bus.acquire(now, 16);
            self.sched(
                EventBody::ReplyOut {
                    from: home,
                    req,
                    excl: true,
                    dirty: false,
                },
                grant - now,
            )
        } else {
            let done = self.nodes[home].mem.access(now);
            self.sched(EventBody::MemFetchDone { node: home, req }, done - now)
        }
    }

    fn writeback_at(&mut self, home: usize, line: LineTag, from: usize) -> Result<(), SimError> {
        let now = self.driver.now();
        if self.nodes[home].dir.forwarding_owner(line) == Some(from) {
            // The owner's writeback crossed a forward request in flight;
            // the forward supersedes it.
            return Ok(());
        }
        self.nodes[home].dir.writeback(line, from, now)
    }

    fn transfer_at(&mut self, node: usize, req: ReqId) -> Result<(), SimError> {
        let now = self.driver.now();
        let (line, excl, requester, home) = {
            let r = self.reqs.get_ref(req);
            let home = r.line.home(self.nodes.len());
            (r.line, r.ty.needs_excl(), r.forward_to.unwrap_or(r.proc), home)
        };
        let dirty = if excl {
            let _ = self.nodes[node].l2.ext_invalidate(line);
            let _ = self.nodes[node].l1.ext_invalidate(line);
            self.procs[node].spec_cohe(line, CoheKind::Cohe);
            true
        } else {
            let was_dirty = self.nodes[node].l2.ext_downgrade(line).unwrap_or(false);
            let _ = self.nodes[node].l1.ext_downgrade(line);
            let _ = was_dirty;
            false
        };
        self.reqs.get_mut(req).handled = HandledBy::RemoteOwner;

        let grant = self.nodes[node].bus.acquire(now, 16 + self.line_bytes);
        let delay = grant - now;
        self.send_msg(node, requester, NetMsg::Reply { req, excl, dirty }, delay)?;
        self.send_msg(node, home, NetMsg::FwdDone { line, from: node }, delay)
    }

    fn fwd_done_at(&mut self, home: usize, line: LineTag, from: usize) -> Result<(), SimError> {
        let now = self.driver.now();
        let _ = from;
        let _ = self.nodes[home].dir.forward_done(line, now)?;
        if let Some(next) = self.nodes[home].dir.complete(line, now)? {
            self.sched(EventBody::DirService { node: home, req: next }, 1.0)?;
        }
        Ok(())
    }

    // ===================== message transport ============================

    /// Hands a message to `to`, `extra_delay` from now: directly for the
    /// local node, as a network packet otherwise.
    pub(super) fn send_msg(
        &mut self,
        from: usize,
        to: usize,
        msg: NetMsg,
        extra_delay: f64,
    ) -> Result<(), SimError> {
        if from == to {
            let body = Self::deliver_body(to, msg);
            return self.sched(body, extra_delay + 1.0);
        }
        self.inject_packet(from, to, msg, extra_delay)
    }

    /// The event a delivered message turns into.
    pub(super) fn deliver_body(to: usize, msg: NetMsg) -> EventBody {
        match msg {
            NetMsg::Request { req } => EventBody::DirService { node: to, req },
            NetMsg::Writeback { line, from } => EventBody::WritebackAt {
                home: to,
                line,
                from,
            },
            NetMsg::Transfer { req } => EventBody::TransferAt { node: to, req },
            NetMsg::Inval { line, home } => EventBody::InvalAt {
                node: to,
                line,
                home,
            },
            NetMsg::InvalAck { line, from } => EventBody::InvalAckAt {
                home: to,
                line,
                from,
            },
            NetMsg::Reply { req, excl, dirty } => EventBody::ReplyArrived {
                node: to,
                req,
                excl,
                dirty,
            },
            NetMsg::FwdDone { line, from } => EventBody::FwdDoneAt {
                home: to,
                line,
                from,
            },
            NetMsg::None => EventBody::Idle,
        }
    }

    /// Line size in bytes (network payload sizing).
    pub(super) fn line_bytes(&self) -> u64 {
        self.line_bytes
    }
}

/// Classifies a memory opcode into a request type.
fn classify_req(op: Opcode, aux1: i16) -> (ReqType, bool) {
    match op.mem_class() {
        Some(MemClass::Rmw) => (ReqType::Rmw, true),
        Some(MemClass::Prefetch) => {
            let ty = match aux1 {
                pref_fcn::ONE_READ => ReqType::L1ReadPref,
                pref_fcn::MANY_WRITES => ReqType::L2WritePref,
                pref_fcn::ONE_WRITE => ReqType::L1WritePref,
                _ => ReqType::L2ReadPref,
            };
            (ty, ty.needs_excl())
        }
        _ => (ReqType::Read, false),
    }
}
