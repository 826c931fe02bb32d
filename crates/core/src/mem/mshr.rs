//! Miss-status holding registers.
//!
//! One MSHR tracks one outstanding line miss. Any later request for the same
//! line coalesces onto the existing MSHR as a secondary waiter instead of
//! issuing a duplicate transaction; when the line fills, every coalesced
//! waiter is replayed. A waiter that needs more permission than the
//! outstanding transaction will bring back (a writer behind a read miss)
//! cannot coalesce and must retry after the fill.

use crate::common::LineTag;

use super::req::ReqId;

/// One miss-status holding register.
#[derive(Clone, Debug)]
pub struct Mshr {
    /// The missing line.
    pub line: LineTag,
    /// Primary request that started the transaction.
    pub primary: ReqId,
    /// Exclusive permission is being fetched.
    pub excl: bool,
    /// The primary was a prefetch.
    pub prefetch: bool,
    /// A demand access coalesced onto a prefetch primary (late prefetch).
    pub demand_coalesced: bool,
    /// Coalesced secondary requests, replayed at fill in arrival order.
    pub waiters: Vec<ReqId>,
}

/// Outcome of presenting a request to an MSHR file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MshrOutcome {
    /// No MSHR held the line; one was allocated (primary miss).
    Primary,
    /// Coalesced onto an existing MSHR (secondary miss).
    Secondary,
    /// An MSHR holds the line but with insufficient permission; retry later.
    Conflict,
    /// All MSHRs are busy with other lines.
    Full,
}

/// A bounded file of MSHRs.
pub struct MshrFile {
    entries: Vec<Option<Mshr>>,
}

impl MshrFile {
    /// Creates a file with `n` registers.
    pub fn new(n: usize) -> Self {
        Self {
            entries: (0..n.max(1)).map(|_| None).collect(),
        }
    }

    /// Index of the MSHR holding `line`, if any.
    pub fn find(&self, line: LineTag) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|m| m.line == line))
    }

    /// Number of busy registers.
    pub fn busy(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// True if every register is busy.
    pub fn is_full(&self) -> bool {
        self.entries.iter().all(Option::is_some)
    }

    /// Presents a request for `line` to the file.
    ///
    /// On a primary miss an MSHR is allocated and the caller starts the
    /// transaction. On a secondary the request is queued on the existing
    /// MSHR (a demand request landing on a prefetch primary marks it late).
    pub fn present(
        &mut self,
        line: LineTag,
        req: ReqId,
        needs_excl: bool,
        is_prefetch: bool,
    ) -> MshrOutcome {
        if let Some(idx) = self.find(line) {
            // find() returned an occupied slot.
            let Some(m) = self.entries[idx].as_mut() else {
                return MshrOutcome::Full;
            };
            if needs_excl && !m.excl {
                return MshrOutcome::Conflict;
            }
            if m.prefetch && !is_prefetch {
                m.demand_coalesced = true;
            }
            m.waiters.push(req);
            return MshrOutcome::Secondary;
        }
        let Some(slot) = self.entries.iter_mut().find(|e| e.is_none()) else {
            return MshrOutcome::Full;
        };
        *slot = Some(Mshr {
            line,
            primary: req,
            excl: needs_excl,
            prefetch: is_prefetch,
            demand_coalesced: false,
            waiters: Vec::new(),
        });
        MshrOutcome::Primary
    }

    /// Removes and returns the MSHR for `line` (the fill arrived).
    pub fn take(&mut self, line: LineTag) -> Option<Mshr> {
        let idx = self.find(line)?;
        self.entries[idx].take()
    }

    /// Removes every waiter satisfying the predicate from every MSHR
    /// (squash support: drop stale requests without cancelling transactions).
    pub fn retain_waiters(&mut self, mut keep: impl FnMut(ReqId) -> bool) {
        for e in self.entries.iter_mut().flatten() {
            e.waiters.retain(|r| keep(*r));
        }
    }

    /// Iterates over busy MSHRs.
    pub fn iter(&self) -> impl Iterator<Item = &Mshr> {
        self.entries.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PoolId;

    fn rid(n: usize) -> ReqId {
        ReqId::from_index(n)
    }

    #[test]
    fn test_primary_then_secondary() {
        let mut f = MshrFile::new(2);
        let line = LineTag(0x40);
        assert_eq!(f.present(line, rid(0), false, false), MshrOutcome::Primary);
        assert_eq!(f.present(line, rid(1), false, false), MshrOutcome::Secondary);
        let m = f.take(line).unwrap();
        assert_eq!(m.primary, rid(0));
        assert_eq!(m.waiters, vec![rid(1)]);
        assert!(f.find(line).is_none());
    }

    #[test]
    fn test_full_file() {
        let mut f = MshrFile::new(1);
        assert_eq!(f.present(LineTag(1), rid(0), false, false), MshrOutcome::Primary);
        assert_eq!(f.present(LineTag(2), rid(1), false, false), MshrOutcome::Full);
    }

    #[test]
    fn test_writer_behind_read_conflicts() {
        let mut f = MshrFile::new(2);
        let line = LineTag(3);
        assert_eq!(f.present(line, rid(0), false, false), MshrOutcome::Primary);
        assert_eq!(f.present(line, rid(1), true, false), MshrOutcome::Conflict);
        // Reader behind an exclusive fetch is fine.
        let line2 = LineTag(4);
        assert_eq!(f.present(line2, rid(2), true, false), MshrOutcome::Primary);
        assert_eq!(f.present(line2, rid(3), false, false), MshrOutcome::Secondary);
    }

    #[test]
    fn test_demand_on_prefetch_marks_late() {
        let mut f = MshrFile::new(2);
        let line = LineTag(9);
        assert_eq!(f.present(line, rid(0), false, true), MshrOutcome::Primary);
        assert_eq!(f.present(line, rid(1), false, false), MshrOutcome::Secondary);
        assert!(f.take(line).unwrap().demand_coalesced);
    }
}
