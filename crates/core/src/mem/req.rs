//! Memory request descriptors.
//!
//! A [`Req`] is the unit of hand-off between the processor and the memory
//! hierarchy, and between levels of the hierarchy. Requests are drawn from a
//! pool; the pool's in-use guard is the request's in-use flag, so a request
//! freed twice (or reachable while free) is a simulator-fatal bug.
//!
//! A request that belongs to an instruction carries the instance id *and a
//! snapshot of the instance's tag*: after a squash the instance slot may be
//! recycled for a younger instruction, and a returning request whose snapshot
//! no longer matches is stale and must be dropped, not delivered.

use crate::common::{LineTag, SimTime, VirtAddr};
use crate::cpu::instance::InstId;
use crate::pool_id;

pool_id! {
    /// Identifier of a request descriptor in the request pool.
    ReqId
}

/// What the processor asked the hierarchy to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReqType {
    /// Demand load.
    #[default]
    Read,
    /// Store acquiring write permission (write-buffer drain).
    Write,
    /// Atomic read-modify-write; needs exclusive ownership.
    Rmw,
    /// Prefetch into L1, read permission.
    L1ReadPref,
    /// Prefetch into L1, exclusive permission.
    L1WritePref,
    /// Prefetch into L2, read permission.
    L2ReadPref,
    /// Prefetch into L2, exclusive permission.
    L2WritePref,
}

impl ReqType {
    /// True if the request needs exclusive ownership of the line.
    #[inline]
    pub fn needs_excl(self) -> bool {
        matches!(
            self,
            Self::Write | Self::Rmw | Self::L1WritePref | Self::L2WritePref
        )
    }

    /// True for the four prefetch flavors.
    #[inline]
    pub fn is_prefetch(self) -> bool {
        matches!(
            self,
            Self::L1ReadPref | Self::L1WritePref | Self::L2ReadPref | Self::L2WritePref
        )
    }

    /// True for prefetches that stop at the L2.
    #[inline]
    pub fn is_l2_prefetch(self) -> bool {
        matches!(self, Self::L2ReadPref | Self::L2WritePref)
    }
}

/// Which level of the hierarchy satisfied a request.
///
/// Recorded when the data (or permission) source is known; the processor
/// classifies completion latency histograms by this.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandledBy {
    /// Not yet determined.
    #[default]
    Unknown,
    /// Hit in the local L1.
    L1,
    /// Forwarded from the local write buffer.
    WriteBuf,
    /// Hit in the local L2.
    L2,
    /// Satisfied by the local memory bank (this node is home).
    LocalMem,
    /// Satisfied by a remote home node's memory or directory.
    RemoteHome,
    /// Satisfied by a dirty copy forwarded from a remote owner cache.
    RemoteOwner,
}

/// A memory request descriptor.
#[derive(Clone, Debug, Default)]
pub struct Req {
    /// Request type.
    pub ty: ReqType,
    /// Full virtual address of the access.
    pub addr: VirtAddr,
    /// Cache-line tag of `addr`.
    pub line: LineTag,
    /// Access size in bytes.
    pub size: u64,
    /// Issuing processor/node.
    pub proc: usize,
    /// Issuing instance and its tag snapshot; `None` for prefetches and
    /// write-buffer drains.
    pub inst: Option<(InstId, u64)>,
    /// Time the processor issued the operation.
    pub issue_time: SimTime,
    /// Time the request entered the memory hierarchy (left the L1 port).
    pub mem_start_time: SimTime,
    /// Time the request's current transaction leg started (directory
    /// service, bus grant); used for occupancy statistics.
    pub active_start_time: SimTime,
    /// Level that satisfied the request.
    pub handled: HandledBy,
    /// Routing override for three-hop transactions: the node the eventual
    /// data reply must go to instead of the home node.
    pub forward_to: Option<usize>,
    /// A demand access coalesced onto this prefetch's MSHR before the line
    /// came back; reported as a late prefetch.
    pub pref_late: bool,
    /// The requester already held the line shared (pure permission upgrade;
    /// the home reply carries no data).
    pub upgrade: bool,
}

impl Req {
    /// Resets lifecycle fields for re-dispatch of a recycled descriptor.
    pub fn prepare(
        &mut self,
        ty: ReqType,
        addr: VirtAddr,
        line_bits: u32,
        size: u64,
        proc: usize,
        inst: Option<(InstId, u64)>,
        now: SimTime,
    ) {
        self.ty = ty;
        self.addr = addr;
        self.line = addr.line(line_bits);
        self.size = size;
        self.proc = proc;
        self.inst = inst;
        self.issue_time = now;
        self.mem_start_time = now;
        self.active_start_time = now;
        self.handled = HandledBy::Unknown;
        self.forward_to = None;
        self.pref_late = false;
        self.upgrade = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excl_classification() {
        assert!(ReqType::Write.needs_excl());
        assert!(ReqType::Rmw.needs_excl());
        assert!(ReqType::L2WritePref.needs_excl());
        assert!(!ReqType::Read.needs_excl());
        assert!(!ReqType::L1ReadPref.needs_excl());
    }

    #[test]
    fn test_prefetch_classification() {
        assert!(ReqType::L1ReadPref.is_prefetch());
        assert!(ReqType::L2WritePref.is_l2_prefetch());
        assert!(!ReqType::L1WritePref.is_l2_prefetch());
        assert!(!ReqType::Rmw.is_prefetch());
    }

    #[test]
    fn test_prepare_sets_line() {
        let mut r = Req::default();
        r.prepare(
            ReqType::Read,
            VirtAddr(0x12345),
            6,
            4,
            2,
            None,
            10.0,
        );
        assert_eq!(r.line, VirtAddr(0x12345).line(6));
        assert_eq!(r.proc, 2);
        assert_eq!(r.handled, HandledBy::Unknown);
    }
}
