//! Home-node coherence directory.
//!
//! Each node owns the directory slice for the lines that hash to it. The
//! directory serializes transactions per line: while one is outstanding,
//! later requests for the same line sit on that line's pending list and are
//! serviced in arrival order when the transaction completes.
//!
//! Three-hop transactions (requester → home → owner → requester) are
//! expressed by a [`DirAction::Forward`]: the home tells the current owner
//! to send the line onward, carrying the requester in the request's
//! `forward_to` field.
//!
//! Any disagreement between a cache and the directory (an ack from a
//! non-sharer, a writeback from a non-owner) is a protocol violation and
//! fatal.

use std::collections::{HashMap, VecDeque};

use crate::common::{LineTag, SimError, SimTime};

use super::req::ReqId;

/// Sharer set as a bitmask over node ids (the mesh caps at 64 nodes).
pub type SharerSet = u64;

/// Stable directory state of a line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DirState {
    /// No cached copies exist.
    #[default]
    Uncached,
    /// Read-only copies at the set bits.
    Shared(SharerSet),
    /// Exclusively owned (possibly dirty) by one node.
    Modified(usize),
}

/// What the home node must do to service a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirAction {
    /// A transaction for the line is outstanding; the request was queued.
    Queued,
    /// Fetch the line from the local memory bank, then reply.
    MemFetch {
        /// Grant exclusive ownership in the reply.
        excl: bool,
    },
    /// Invalidate every set sharer, collect acks, then reply exclusively.
    Invalidate {
        /// Sharers to invalidate (the requester is never in this set).
        sharers: SharerSet,
        /// The requester already held a shared copy (pure upgrade: reply
        /// needs no data, only permission).
        upgrade: bool,
    },
    /// Tell the current owner to forward the line to the requester.
    Forward {
        /// Current owner node.
        owner: usize,
        /// The requester wants exclusive ownership.
        excl: bool,
    },
}

/// Kind of transaction in flight for a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BusyKind {
    MemFetch,
    Invalidate { acks_left: u32 },
    Forward { owner: usize },
}

#[derive(Debug)]
struct Busy {
    req: ReqId,
    requester: usize,
    excl: bool,
    kind: BusyKind,
}

#[derive(Debug, Default)]
struct DirEntry {
    state: DirState,
    busy: Option<Busy>,
    pending: VecDeque<ReqId>,
}

/// Directory activity counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirStats {
    /// Requests serviced (excluding writebacks).
    pub requests: u64,
    /// Requests that had to queue behind an outstanding transaction.
    pub queued: u64,
    /// Three-hop forwards issued.
    pub forwards: u64,
    /// Invalidations sent.
    pub invals_sent: u64,
    /// Writebacks absorbed.
    pub writebacks: u64,
}

/// The directory slice of one home node.
pub struct Directory {
    node: usize,
    entries: HashMap<LineTag, DirEntry>,
    /// Activity counters.
    pub stats: DirStats,
}

impl Directory {
    /// Creates the slice for `node`. `_capacity` sizes the backing store.
    pub fn new(node: usize, _capacity: usize) -> Self {
        Self {
            node,
            entries: HashMap::new(),
            stats: DirStats::default(),
        }
    }

    /// Stable state of a line (tests and invariant checks).
    pub fn state_of(&self, line: LineTag) -> DirState {
        self.entries.get(&line).map_or(DirState::Uncached, |e| e.state)
    }

    /// True if a transaction is outstanding for the line.
    pub fn busy(&self, line: LineTag) -> bool {
        self.entries.get(&line).is_some_and(|e| e.busy.is_some())
    }

    /// Begins servicing `req` (from `requester`, wanting `excl` or not).
    ///
    /// Returns the action the home node must carry out. `Queued` means the
    /// line is busy; the directory holds the request and will hand it back
    /// from [`Directory::complete`].
    pub fn begin(
        &mut self,
        line: LineTag,
        req: ReqId,
        requester: usize,
        excl: bool,
    ) -> DirAction {
        let e = self.entries.entry(line).or_default();
        if e.busy.is_some() {
            e.pending.push_back(req);
            self.stats.queued += 1;
            return DirAction::Queued;
        }
        self.stats.requests += 1;

        let (action, kind) = match (e.state, excl) {
            (DirState::Uncached, _) => (
                DirAction::MemFetch { excl },
                BusyKind::MemFetch,
            ),
            (DirState::Shared(_), false) => (
                DirAction::MemFetch { excl: false },
                BusyKind::MemFetch,
            ),
            (DirState::Shared(sharers), true) => {
                let requester_bit = 1u64 << requester;
                let others = sharers & !requester_bit;
                let upgrade = sharers & requester_bit != 0;
                let acks = others.count_ones();
                self.stats.invals_sent += u64::from(acks);
                if acks == 0 {
                    // Sole sharer upgrading: no invalidations to wait for.
                    (
                        DirAction::Invalidate {
                            sharers: 0,
                            upgrade,
                        },
                        BusyKind::Invalidate { acks_left: 0 },
                    )
                } else {
                    (
                        DirAction::Invalidate {
                            sharers: others,
                            upgrade,
                        },
                        BusyKind::Invalidate { acks_left: acks },
                    )
                }
            }
            (DirState::Modified(owner), _) => {
                self.stats.forwards += 1;
                (
                    DirAction::Forward { owner, excl },
                    BusyKind::Forward { owner },
                )
            }
        };
        e.busy = Some(Busy {
            req,
            requester,
            excl,
            kind,
        });
        action
    }

    /// Records an invalidation ack from `from`. Returns the transaction's
    /// request when the last ack arrives (the reply may now be sent).
    pub fn inval_ack(
        &mut self,
        line: LineTag,
        from: usize,
        now: SimTime,
    ) -> Result<Option<ReqId>, SimError> {
        let Some(e) = self.entries.get_mut(&line) else {
            return Err(self.inconsistency(line, "ack for unknown line", now));
        };
        let Some(busy) = e.busy.as_mut() else {
            return Err(self.inconsistency(line, "ack with no transaction", now));
        };
        let BusyKind::Invalidate { acks_left } = &mut busy.kind else {
            return Err(self.inconsistency(line, "ack outside invalidation", now));
        };
        if *acks_left == 0 {
            return Err(self.inconsistency(line, "surplus invalidation ack", now));
        }
        let _ = from;
        *acks_left -= 1;
        if *acks_left == 0 {
            Ok(Some(busy.req))
        } else {
            Ok(None)
        }
    }

    /// The owner forwarded the line (three-hop leg done); for a read the
    /// owner keeps a shared copy, for an exclusive transfer it invalidates.
    pub fn forward_done(&mut self, line: LineTag, now: SimTime) -> Result<ReqId, SimError> {
        let Some(e) = self.entries.get_mut(&line) else {
            return Err(self.inconsistency(line, "forward-done for unknown line", now));
        };
        let Some(busy) = e.busy.as_ref() else {
            return Err(self.inconsistency(line, "forward-done with no transaction", now));
        };
        if !matches!(busy.kind, BusyKind::Forward { .. }) {
            return Err(self.inconsistency(line, "forward-done outside forward", now));
        }
        Ok(busy.req)
    }

    /// Completes the outstanding transaction for `line`: commits the new
    /// stable state and returns the next pending request, if any, which the
    /// caller must re-enter through [`Directory::begin`].
    pub fn complete(&mut self, line: LineTag, now: SimTime) -> Result<Option<ReqId>, SimError> {
        let Some(e) = self.entries.get_mut(&line) else {
            return Err(self.inconsistency(line, "complete for unknown line", now));
        };
        let Some(busy) = e.busy.take() else {
            return Err(self.inconsistency(line, "complete with no transaction", now));
        };

        let requester_bit = 1u64 << busy.requester;
        e.state = if busy.excl {
            DirState::Modified(busy.requester)
        } else {
            match (e.state, busy.kind) {
                // Read forwarded from an owner: owner downgrades to sharer.
                (DirState::Modified(owner), BusyKind::Forward { .. }) => {
                    DirState::Shared((1u64 << owner) | requester_bit)
                }
                (DirState::Shared(s), _) => DirState::Shared(s | requester_bit),
                _ => DirState::Shared(requester_bit),
            }
        };
        Ok(e.pending.pop_front())
    }

    /// Absorbs a writeback of a dirty (or clean-exclusive) line from `from`.
    ///
    /// Legal only from the recorded owner; a writeback racing a forward is
    /// resolved by the caller before it gets here.
    pub fn writeback(&mut self, line: LineTag, from: usize, now: SimTime) -> Result<(), SimError> {
        self.stats.writebacks += 1;
        let Some(e) = self.entries.get_mut(&line) else {
            return Err(self.inconsistency(line, "writeback for unknown line", now));
        };
        match e.state {
            DirState::Modified(owner) if owner == from => {
                e.state = DirState::Uncached;
                Ok(())
            }
            DirState::Shared(sharers) if sharers & (1 << from) != 0 => {
                // Replacement hint from a sharer: drop it from the set.
                let rest = sharers & !(1 << from);
                e.state = if rest == 0 {
                    DirState::Uncached
                } else {
                    DirState::Shared(rest)
                };
                Ok(())
            }
            _ => Err(self.inconsistency(line, "writeback from non-owner", now)),
        }
    }

    /// The owner a forward transaction is waiting on, if any (race checks).
    pub fn forwarding_owner(&self, line: LineTag) -> Option<usize> {
        let busy = self.entries.get(&line)?.busy.as_ref()?;
        match busy.kind {
            BusyKind::Forward { owner } => Some(owner),
            _ => None,
        }
    }

    fn inconsistency(&self, line: LineTag, detail: &str, now: SimTime) -> SimError {
        SimError::DirectoryInconsistency {
            node: self.node,
            line,
            detail: detail.to_owned(),
            now,
        }
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
    fn test_read_uncached_then_shared() {
        let mut d = Directory::new(0, 16);
        let line = LineTag(0x100);
        assert_eq!(
            d.begin(line, rid(0), 1, false),
            DirAction::MemFetch { excl: false }
        );
        assert_eq!(d.complete(line, 0.0).unwrap(), None);
        assert_eq!(d.state_of(line), DirState::Shared(1 << 1));

        // Second reader joins the sharer set.
        assert_eq!(
            d.begin(line, rid(1), 2, false),
            DirAction::MemFetch { excl: false }
        );
        let _ = d.complete(line, 1.0).unwrap();
        assert_eq!(d.state_of(line), DirState::Shared(0b110));
    }

    #[test]
    fn test_write_invalidates_sharers() {
        let mut d = Directory::new(0, 16);
        let line = LineTag(0x200);
        for (r, n) in [(0, 1), (1, 2)] {
            let _ = d.begin(line, rid(r), n, false);
            let _ = d.complete(line, 0.0).unwrap();
        }
        // Node 3 writes: both sharers must be invalidated.
        match d.begin(line, rid(2), 3, true) {
            DirAction::Invalidate { sharers, upgrade } => {
                assert_eq!(sharers, 0b110);
                assert!(!upgrade);
            }
            a => panic!("unexpected {a:?}"),
        }
        assert!(d.inval_ack(line, 1, 1.0).unwrap().is_none());
        assert_eq!(d.inval_ack(line, 2, 1.0).unwrap(), Some(rid(2)));
        let _ = d.complete(line, 2.0).unwrap();
        assert_eq!(d.state_of(line), DirState::Modified(3));
    }

    #[test]
    fn test_upgrade_by_sole_sharer() {
        let mut d = Directory::new(0, 16);
        let line = LineTag(0x240);
        let _ = d.begin(line, rid(0), 2, false);
        let _ = d.complete(line, 0.0).unwrap();
        match d.begin(line, rid(1), 2, true) {
            DirAction::Invalidate { sharers: 0, upgrade: true } => {}
            a => panic!("unexpected {a:?}"),
        }
        let _ = d.complete(line, 1.0).unwrap();
        assert_eq!(d.state_of(line), DirState::Modified(2));
    }

    #[test]
    fn test_three_hop_read() {
        let mut d = Directory::new(0, 16);
        let line = LineTag(0x300);
        let _ = d.begin(line, rid(0), 1, true);
        let _ = d.complete(line, 0.0).unwrap();
        assert_eq!(d.state_of(line), DirState::Modified(1));

        match d.begin(line, rid(1), 2, false) {
            DirAction::Forward { owner: 1, excl: false } => {}
            a => panic!("unexpected {a:?}"),
        }
        assert_eq!(d.forward_done(line, 1.0).unwrap(), rid(1));
        let _ = d.complete(line, 1.0).unwrap();
        // Owner keeps a shared copy alongside the requester.
        assert_eq!(d.state_of(line), DirState::Shared(0b110));
    }

    #[test]
    fn test_busy_line_queues() {
        let mut d = Directory::new(0, 16);
        let line = LineTag(0x400);
        let _ = d.begin(line, rid(0), 1, false);
        assert_eq!(d.begin(line, rid(1), 2, false), DirAction::Queued);
        assert_eq!(d.stats.queued, 1);
        // Completion hands back the queued request.
        assert_eq!(d.complete(line, 1.0).unwrap(), Some(rid(1)));
    }

    #[test]
    fn test_writeback_from_owner() {
        let mut d = Directory::new(0, 16);
        let line = LineTag(0x500);
        let _ = d.begin(line, rid(0), 1, true);
        let _ = d.complete(line, 0.0).unwrap();
        d.writeback(line, 1, 1.0).unwrap();
        assert_eq!(d.state_of(line), DirState::Uncached);
    }

    #[test]
    fn test_writeback_from_stranger_is_fatal() {
        let mut d = Directory::new(0, 16);
        let line = LineTag(0x600);
        let _ = d.begin(line, rid(0), 1, true);
        let _ = d.complete(line, 0.0).unwrap();
        assert!(d.writeback(line, 2, 1.0).is_err());
    }

    #[test]
    fn test_surplus_ack_is_fatal() {
        let mut d = Directory::new(0, 16);
        let line = LineTag(0x700);
        let _ = d.begin(line, rid(0), 1, false);
        assert!(d.inval_ack(line, 2, 0.0).is_err());
    }
}
