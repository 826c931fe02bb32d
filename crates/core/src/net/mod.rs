//! Wormhole-routed 2-D mesh network.
//!
//! Two physically separate networks (request and reply) connect the nodes,
//! avoiding protocol deadlock. Each is a grid of switches; a switch has a
//! demultiplexer per ingress, a multiplexer guarding each output channel,
//! a flit buffer per link, and an input/output port pair to the local node.
//!
//! A packet is a head flit, interior flits, and a tail flit. The head
//! reserves the path hop by hop (dimension-ordered, X before Y); interior
//! flits stream behind it; the tail releases buffers and multiplexer
//! semaphores in the order the head acquired them. The head advances into a
//! buffer only when `buffer_threshold` flits fit; in wait-for-tail mode the
//! head additionally stalls in each buffer until the tail catches up, which
//! degenerates wormhole into store-and-forward.
//!
//! The state machines driving heads and tails live in the simulator's
//! dispatcher; this module owns the structural state (switch arrays, ports,
//! semaphores, per-packet progress) and the routing function.

/// Mesh structure: buffers, muxes, ports, routing.
pub mod mesh;
/// Packet descriptors, head/tail progress, message payloads.
pub mod packet;

pub use mesh::{Mesh, MeshTiming};
pub use packet::{NetMsg, Packet, PacketId};

/// Virtual-network index of the request mesh.
pub const VNET_REQUEST: u8 = 0;
/// Virtual-network index of the reply mesh.
pub const VNET_REPLY: u8 = 1;
