//! Inclusive L2 cache.
//!
//! Same MSHR discipline as the L1, larger and slower, and the unit the
//! directory protocol talks to. Inclusion: every line resident in the L1 is
//! resident here, so an L2 eviction or external invalidation must
//! back-invalidate the L1 before the line leaves (the simulator orchestrates
//! that; the L2 reports what must happen through its return values).
//!
//! On an MSHR allocation the L2 reserves the victim way immediately
//! (`PendingShared`/`PendingExcl`), so the displaced line is disposed of at
//! miss time and the fill cannot fail for lack of a way.

use crate::common::{LineTag, SimTime};
use crate::config::CacheConfig;

use super::cache::{CacheArray, LineState, Victim};
use super::mshr::{Mshr, MshrFile, MshrOutcome};
use super::req::ReqId;

/// Outcome of presenting a request to the L2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L2Outcome {
    /// Line present with sufficient permission.
    Hit,
    /// Line present Shared but exclusive permission is needed: an MSHR was
    /// allocated for an upgrade transaction to the home directory.
    UpgradeMiss {
        /// Victim displaced by way reservation (never for upgrades).
        victim: Option<Victim>,
    },
    /// Primary miss: MSHR allocated, way reserved; go to the home directory.
    MissPrimary {
        /// Victim displaced by the way reservation.
        victim: Option<Victim>,
    },
    /// Secondary miss: coalesced.
    MissSecondary,
    /// MSHR file full or permission conflict; retry later.
    MshrFull,
    /// Every way in the set is transaction-reserved; retry later.
    Blocked,
}

/// Per-L2 access counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct L2Stats {
    /// Lookups that hit with sufficient permission.
    pub hits: u64,
    /// Primary misses (including upgrades).
    pub miss_primary: u64,
    /// Coalesced secondary misses.
    pub miss_secondary: u64,
    /// Retries due to MSHR exhaustion or reserved sets.
    pub rejected: u64,
    /// External invalidations received.
    pub invals: u64,
    /// Lines written back on eviction.
    pub writebacks: u64,
}

/// The inclusive L2 cache of one node.
pub struct L2Cache {
    /// Line array.
    pub array: CacheArray,
    /// Miss-status holding registers.
    pub mshrs: MshrFile,
    /// Access counters.
    pub stats: L2Stats,
    latency: u64,
}

impl L2Cache {
    /// Builds the L2 from configuration.
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            array: CacheArray::new(cfg.l2_size, cfg.l2_assoc, cfg.line_bits),
            mshrs: MshrFile::new(cfg.mshrs_l2),
            stats: L2Stats::default(),
            latency: cfg.l2_latency,
        }
    }

    /// Access latency in cycles.
    #[inline]
    pub fn latency(&self) -> u64 {
        self.latency
    }

    /// Presents a request to the L2.
    pub fn access(
        &mut self,
        _now: SimTime,
        line: LineTag,
        req: ReqId,
        needs_excl: bool,
        is_prefetch: bool,
    ) -> L2Outcome {
        let state = self.array.touch(line);
        let satisfied = if needs_excl {
            state.writable()
        } else {
            state.readable()
        };
        if satisfied {
            self.stats.hits += 1;
            return L2Outcome::Hit;
        }

        let upgrade = state == LineState::Shared && needs_excl;
        match self.mshrs.present(line, req, needs_excl, is_prefetch) {
            MshrOutcome::Primary => {
                self.stats.miss_primary += 1;
                let pending = if needs_excl {
                    LineState::PendingExcl
                } else {
                    LineState::PendingShared
                };
                // Reserve the way now; eviction happens at miss time.
                let fill = self.array.fill(line, pending);
                if !fill.installed() {
                    // Undo the MSHR: the set has no victim to give.
                    let _ = self.mshrs.take(line);
                    self.stats.miss_primary -= 1;
                    self.stats.rejected += 1;
                    return L2Outcome::Blocked;
                }
                let victim = fill.victim();
                if victim.is_some() {
                    self.stats.writebacks +=
                        u64::from(victim.is_some_and(|v| v.dirty));
                }
                if upgrade {
                    L2Outcome::UpgradeMiss { victim }
                } else {
                    L2Outcome::MissPrimary { victim }
                }
            }
            MshrOutcome::Secondary => {
                self.stats.miss_secondary += 1;
                L2Outcome::MissSecondary
            }
            MshrOutcome::Conflict | MshrOutcome::Full => {
                self.stats.rejected += 1;
                L2Outcome::MshrFull
            }
        }
    }

    /// Installs a reply from the directory, flipping the reserved way to its
    /// stable state. Returns the MSHR whose waiters replay through the L1.
    pub fn fill(&mut self, line: LineTag, excl: bool, dirty: bool) -> Option<Mshr> {
        let state = match (excl, dirty) {
            (true, true) => LineState::Modified,
            (true, false) => LineState::Exclusive,
            _ => LineState::Shared,
        };
        let _ = self.array.fill(line, state);
        self.mshrs.take(line)
    }

    /// Store completion: the line is exclusive here; mark it modified.
    pub fn mark_written(&mut self, line: LineTag) {
        let _ = self.array.set_state(line, LineState::Modified);
    }

    /// External invalidation from the home directory.
    ///
    /// Returns the displaced victim; the caller must back-invalidate the L1
    /// and write dirty data back to home.
    pub fn ext_invalidate(&mut self, line: LineTag) -> Option<Victim> {
        self.stats.invals += 1;
        self.array.invalidate(line)
    }

    /// External downgrade: a remote reader wants a copy of our exclusive or
    /// modified line. Returns true (and whether it was dirty) if resident.
    pub fn ext_downgrade(&mut self, line: LineTag) -> Option<bool> {
        let state = self.array.probe(line);
        if state.writable() {
            let dirty = state == LineState::Modified;
            let _ = self.array.set_state(line, LineState::Shared);
            Some(dirty)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PoolId;

    fn l2() -> L2Cache {
        L2Cache::new(&CacheConfig::default())
    }

    fn rid(n: usize) -> ReqId {
        ReqId::from_index(n)
    }

    #[test]
    fn test_miss_reserves_way() {
        let mut c = l2();
        let line = LineTag(0x30);
        match c.access(0.0, line, rid(0), false, false) {
            L2Outcome::MissPrimary { victim: None } => {}
            o => panic!("unexpected outcome {o:?}"),
        }
        assert_eq!(c.array.probe(line), LineState::PendingShared);
        let mshr = c.fill(line, false, false).unwrap();
        assert_eq!(mshr.primary, rid(0));
        assert_eq!(c.array.probe(line), LineState::Shared);
    }

    #[test]
    fn test_upgrade_miss() {
        let mut c = l2();
        let line = LineTag(0x31);
        let _ = c.array.fill(line, LineState::Shared);
        match c.access(0.0, line, rid(0), true, false) {
            L2Outcome::UpgradeMiss { victim: None } => {}
            o => panic!("unexpected outcome {o:?}"),
        }
        let _ = c.fill(line, true, true).unwrap();
        assert_eq!(c.array.probe(line), LineState::Modified);
    }

    #[test]
    fn test_exclusive_fill_clean() {
        let mut c = l2();
        let line = LineTag(0x32);
        let _ = c.access(0.0, line, rid(0), false, false);
        let _ = c.fill(line, true, false);
        assert_eq!(c.array.probe(line), LineState::Exclusive);
        // A later store hits without a new transaction.
        assert_eq!(c.access(1.0, line, rid(1), true, false), L2Outcome::Hit);
    }

    #[test]
    fn test_downgrade_reports_dirty() {
        let mut c = l2();
        let line = LineTag(0x33);
        let _ = c.array.fill(line, LineState::Modified);
        assert_eq!(c.ext_downgrade(line), Some(true));
        assert_eq!(c.array.probe(line), LineState::Shared);
        assert_eq!(c.ext_downgrade(line), None);
    }
}
