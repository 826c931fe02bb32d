//! Network packets.
//!
//! A packet descriptor lives in a pool and carries: the coherence message it
//! transports, endpoints, flit count, and the progress of its two live
//! events — the head and the tail. The invariant is one live head and one
//! live tail at most, each owning one activity; the path the head reserves
//! (muxes acquired, buffers entered) is recorded so the tail can release
//! everything in acquisition order.

use crate::common::{LineTag, SimTime};
use crate::event::ActId;
use crate::mem::ReqId;
use crate::pool_id;

pool_id! {
    /// Identifier of a packet descriptor in the packet pool.
    PacketId
}

/// Coherence message carried by a packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetMsg {
    /// Nothing (pool default).
    #[default]
    None,
    /// Requester → home: service this request (read or exclusive per the
    /// request's type).
    Request {
        /// The transaction descriptor.
        req: ReqId,
    },
    /// Cache → home: dirty or replaced line leaving a cache.
    Writeback {
        /// The line being written back.
        line: LineTag,
        /// Evicting node.
        from: usize,
    },
    /// Home → owner: forward the line to the requester named in the
    /// request's `forward_to`.
    Transfer {
        /// The transaction descriptor.
        req: ReqId,
    },
    /// Home → sharer: invalidate your copy and ack.
    Inval {
        /// Line to invalidate.
        line: LineTag,
        /// Home node expecting the ack.
        home: usize,
    },
    /// Sharer → home: invalidation done.
    InvalAck {
        /// Line that was invalidated.
        line: LineTag,
        /// Acking node.
        from: usize,
    },
    /// Home or owner → requester: data and/or permission.
    Reply {
        /// The transaction descriptor.
        req: ReqId,
        /// Exclusive ownership granted.
        excl: bool,
        /// The data arrives dirty (forwarded from a modified copy).
        dirty: bool,
    },
    /// Owner → home: three-hop forward completed; commit directory state.
    FwdDone {
        /// The forwarded line.
        line: LineTag,
        /// The (former) owner.
        from: usize,
    },
}

impl NetMsg {
    /// True for messages that carry a whole cache line of data.
    pub fn carries_data(self) -> bool {
        matches!(self, Self::Writeback { .. } | Self::Reply { .. })
    }
}

/// Resume point of a head event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeadState {
    /// Packet queued at the source input port.
    #[default]
    Start,
    /// Deciding / arbitrating for the next module.
    NextModule,
    /// Suspended on a busy multiplexer's waiter queue.
    WaitMux,
    /// Suspended until the next buffer has threshold space.
    WaitBuffer,
    /// Suspended until an output-port slot frees.
    WaitOport,
    /// Wait-for-tail stall: head may not leave this buffer yet.
    WaitTail,
    /// Head reached the destination output port.
    Done,
}

/// Resume point of a tail event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TailState {
    /// Tail still at the source input port.
    #[default]
    Start,
    /// Moving hop by hop behind the head.
    Move,
    /// Suspended because the head has not cleared the next module.
    SleepBehindHead,
    /// Tail reached the destination output port; packet done.
    Done,
}

/// One reserved hop of a packet's path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hop {
    /// Multiplexer index acquired to enter the link.
    pub mux: usize,
    /// Link buffer index entered.
    pub buf: usize,
    /// Node the link leads to.
    pub to_node: usize,
    /// Flit slots held in the buffer until the tail leaves it.
    pub flits_held: usize,
    /// Time the head finished this hop (paces the tail: interior flits
    /// stream one flit time apart behind the head).
    pub head_done: SimTime,
}

/// A packet descriptor.
#[derive(Clone, Debug, Default)]
pub struct Packet {
    /// Payload.
    pub msg: NetMsg,
    /// Source node.
    pub src: usize,
    /// Destination node.
    pub dest: usize,
    /// Total flits (head + interior + tail).
    pub flits: usize,
    /// Hops reserved by the head so far, in acquisition order.
    pub path: Vec<Hop>,
    /// Node the head currently sits at (switch of this node).
    pub head_node: usize,
    /// Hops the head has completed (index into `path` + 1).
    pub head_hop: usize,
    /// Hops the tail has completed.
    pub tail_hop: usize,
    /// Head resume point.
    pub head_state: HeadState,
    /// Tail resume point.
    pub tail_state: TailState,
    /// Head activity (at most one live).
    pub head_act: Option<ActId>,
    /// Tail activity (at most one live).
    pub tail_act: Option<ActId>,
    /// Creation (injection request) time.
    pub create_time: SimTime,
    /// Time the head left the input port.
    pub inject_time: SimTime,
    /// Accumulated time the head spent blocked.
    pub blocked_time: SimTime,
    /// Start of the current blocking episode, if blocked.
    pub block_start: Option<SimTime>,
}

impl Packet {
    /// Begins a blocking episode at `now` (idempotent).
    pub fn block(&mut self, now: SimTime) {
        if self.block_start.is_none() {
            self.block_start = Some(now);
        }
    }

    /// Ends a blocking episode at `now`, accumulating the blocked time.
    pub fn unblock(&mut self, now: SimTime) {
        if let Some(t) = self.block_start.take() {
            self.blocked_time += now - t;
        }
    }

    /// Number of network hops the head has taken.
    pub fn hops(&self) -> usize {
        self.path.len()
    }
}
