//! Event bodies.
//!
//! Every activity in the event list carries one of these. The variants are
//! the resume points of the historical coroutine-style simulator: each
//! names the component to run and the leg of its transaction to continue.

use crate::common::LineTag;
use crate::mem::ReqId;
use crate::net::PacketId;

/// What an activity does when it fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventBody {
    /// Pool default; never dispatched.
    #[default]
    Idle,
    /// One processor cycle; reschedules itself while the processor runs.
    CpuCycle {
        /// Processor index.
        proc: usize,
    },
    /// A request leaves the L1 miss path into the L2.
    L2Access {
        /// Node.
        node: usize,
        /// Request.
        req: ReqId,
    },
    /// A filled line installs into the L1 and its waiters replay.
    L1Fill {
        /// Node.
        node: usize,
        /// Primary request of the fill.
        req: ReqId,
        /// Exclusive permission granted.
        excl: bool,
    },
    /// The home directory services a request.
    DirService {
        /// Home node.
        node: usize,
        /// Request.
        req: ReqId,
    },
    /// The home memory bank finished fetching a line.
    MemFetchDone {
        /// Home node.
        node: usize,
        /// Request.
        req: ReqId,
    },
    /// The request leaves its node's bus toward the home directory.
    ToHome {
        /// Requesting node.
        from: usize,
        /// Request.
        req: ReqId,
    },
    /// The home sends the reply (data or permission) to the requester.
    ReplyOut {
        /// Home (or forwarding owner) node.
        from: usize,
        /// Request.
        req: ReqId,
        /// Exclusive ownership granted.
        excl: bool,
        /// Data travels dirty (forwarded from a modified copy).
        dirty: bool,
    },
    /// A reply reached the requesting node's L2.
    ReplyArrived {
        /// Requesting node.
        node: usize,
        /// Request.
        req: ReqId,
        /// Exclusive ownership granted.
        excl: bool,
        /// Data arrived dirty.
        dirty: bool,
    },
    /// A completed request reaches the processor (or write buffer).
    ReqDone {
        /// Node.
        node: usize,
        /// Request.
        req: ReqId,
    },
    /// An invalidation arrives at a sharer.
    InvalAt {
        /// Sharer node.
        node: usize,
        /// Line.
        line: LineTag,
        /// Home expecting the ack.
        home: usize,
    },
    /// An invalidation ack arrives back at the home.
    InvalAckAt {
        /// Home node.
        home: usize,
        /// Line.
        line: LineTag,
        /// Acking node.
        from: usize,
    },
    /// A writeback (dirty or replacement notice) arrives at the home.
    WritebackAt {
        /// Home node.
        home: usize,
        /// Line.
        line: LineTag,
        /// Evicting node.
        from: usize,
    },
    /// A three-hop forward request arrives at the owning cache.
    TransferAt {
        /// Owner node.
        node: usize,
        /// Request (its `forward_to` names the requester).
        req: ReqId,
    },
    /// The owner tells the home a three-hop forward completed.
    FwdDoneAt {
        /// Home node.
        home: usize,
        /// Line.
        line: LineTag,
        /// Former owner.
        from: usize,
    },
    /// Pump the write buffer of a node.
    DrainWb {
        /// Node.
        node: usize,
    },
    /// A packet's head event resumes.
    NetHead {
        /// Virtual network (0 = request, 1 = reply).
        vnet: u8,
        /// Packet.
        pkt: PacketId,
    },
    /// A packet's tail event resumes.
    NetTail {
        /// Virtual network.
        vnet: u8,
        /// Packet.
        pkt: PacketId,
    },
}
