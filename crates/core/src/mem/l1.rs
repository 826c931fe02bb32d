//! L1 cache front end.
//!
//! Non-blocking: misses allocate an MSHR and later requests for the same
//! line coalesce onto it. The L1 has one read port and one write port per
//! cycle; a request that loses port arbitration is retried by the memory
//! unit next cycle. Lookup outcomes are returned to the caller — the L1
//! never schedules events itself.

use crate::common::{LineTag, SimTime};
use crate::config::{CacheConfig, L1WritePolicy};

use super::cache::{CacheArray, Fill, LineState, Victim};
use super::mshr::{Mshr, MshrFile, MshrOutcome};
use super::req::ReqId;

/// Outcome of presenting a request to the L1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L1Outcome {
    /// Line present with sufficient permission.
    Hit,
    /// Primary miss: an MSHR was allocated; forward the request to the L2.
    MissPrimary,
    /// Secondary miss: coalesced onto an outstanding MSHR.
    MissSecondary,
    /// MSHR permission conflict or file full; retry next cycle.
    MshrFull,
    /// Out of ports this cycle; retry next cycle.
    PortFull,
}

/// Per-L1 access counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct L1Stats {
    /// Port-arbitrated lookups that hit.
    pub hits: u64,
    /// Primary misses.
    pub miss_primary: u64,
    /// Coalesced secondary misses.
    pub miss_secondary: u64,
    /// Retries due to MSHR exhaustion or conflicts.
    pub mshr_full: u64,
    /// Retries due to port exhaustion.
    pub port_full: u64,
    /// External invalidations received.
    pub invals: u64,
}

/// The L1 cache of one node.
pub struct L1Cache {
    /// Line array.
    pub array: CacheArray,
    /// Miss-status holding registers.
    pub mshrs: MshrFile,
    /// Access counters.
    pub stats: L1Stats,
    policy: L1WritePolicy,
    latency: u64,
    // Port arbitration: counts reset each new cycle timestamp.
    port_cycle: SimTime,
    reads_this_cycle: u32,
    writes_this_cycle: u32,
}

impl L1Cache {
    /// Builds the L1 from configuration.
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            array: CacheArray::new(cfg.l1_size, cfg.l1_assoc, cfg.line_bits),
            mshrs: MshrFile::new(cfg.mshrs_l1),
            stats: L1Stats::default(),
            policy: cfg.l1_write_policy,
            latency: cfg.l1_latency,
            port_cycle: -1.0,
            reads_this_cycle: 0,
            writes_this_cycle: 0,
        }
    }

    /// Access latency in cycles.
    #[inline]
    pub fn latency(&self) -> u64 {
        self.latency
    }

    /// Write policy.
    #[inline]
    pub fn policy(&self) -> L1WritePolicy {
        self.policy
    }

    fn take_port(&mut self, now: SimTime, write: bool) -> bool {
        if now != self.port_cycle {
            self.port_cycle = now;
            self.reads_this_cycle = 0;
            self.writes_this_cycle = 0;
        }
        let used = if write {
            &mut self.writes_this_cycle
        } else {
            &mut self.reads_this_cycle
        };
        if *used >= 1 {
            return false;
        }
        *used += 1;
        true
    }

    /// Presents a request to the L1.
    ///
    /// `needs_excl` is true for store drains and RMWs. Write-through L1s
    /// never satisfy a store locally: stores always miss down to the L2
    /// (coalescing onto an MSHR like any other miss).
    pub fn access(
        &mut self,
        now: SimTime,
        line: LineTag,
        req: ReqId,
        needs_excl: bool,
        is_prefetch: bool,
    ) -> L1Outcome {
        if !self.take_port(now, needs_excl) {
            self.stats.port_full += 1;
            return L1Outcome::PortFull;
        }

        let state = self.array.touch(line);
        let write_through_store = needs_excl && self.policy == L1WritePolicy::WriteThrough;
        let satisfied = if needs_excl {
            state.writable() && !write_through_store
        } else {
            state.readable()
        };
        if satisfied {
            self.stats.hits += 1;
            if needs_excl {
                self.array.mark_dirty(line);
            }
            return L1Outcome::Hit;
        }

        match self.mshrs.present(line, req, needs_excl, is_prefetch) {
            MshrOutcome::Primary => {
                self.stats.miss_primary += 1;
                L1Outcome::MissPrimary
            }
            MshrOutcome::Secondary => {
                self.stats.miss_secondary += 1;
                L1Outcome::MissSecondary
            }
            MshrOutcome::Conflict | MshrOutcome::Full => {
                self.stats.mshr_full += 1;
                L1Outcome::MshrFull
            }
        }
    }

    /// Installs a filled line and returns the MSHR whose waiters must be
    /// replayed, plus any displaced victim.
    ///
    /// Write-through L1s install exclusively granted lines as `Exclusive`
    /// but never mark them dirty.
    pub fn fill(&mut self, line: LineTag, excl: bool) -> (Fill, Option<Mshr>) {
        let state = if excl {
            match self.policy {
                L1WritePolicy::WriteBack => LineState::Modified,
                L1WritePolicy::WriteThrough => LineState::Exclusive,
            }
        } else {
            LineState::Shared
        };
        let fill = self.array.fill(line, state);
        let mshr = if fill.installed() {
            self.mshrs.take(line)
        } else {
            None
        };
        (fill, mshr)
    }

    /// External invalidation (coherence). Returns the victim if resident.
    pub fn ext_invalidate(&mut self, line: LineTag) -> Option<Victim> {
        self.stats.invals += 1;
        self.array.invalidate(line)
    }

    /// External downgrade to shared (a remote reader hit our dirty line).
    pub fn ext_downgrade(&mut self, line: LineTag) -> bool {
        self.array.set_state(line, LineState::Shared)
    }
}
