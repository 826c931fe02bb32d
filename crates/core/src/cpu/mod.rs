//! Processor core.
//!
//! One [`proc::Processor`] per node, driven one simulated cycle per
//! activation. Within a cycle the stages run in reverse pipeline order —
//! retire, execute completions, issue, register read, decode/rename, fetch —
//! so an instruction cannot fall through more than one stage per cycle.
//!
//! The memory unit ([`memunit`]) sits between the pipeline and the L1: it
//! owns the memory queue, the consistency-model issue rules, and the
//! speculative-load tracker the L1 calls into on external coherence events.

/// Reorder buffer (active list).
pub mod active_list;
/// Branch predictor: 2-bit counter PHT and return-address stack.
pub mod branch;
/// Per-opcode functional execution bodies.
pub mod funcs;
/// Dynamic instruction instances.
pub mod instance;
/// Memory queue and consistency enforcement.
pub mod memunit;
/// The processor pipeline.
pub mod proc;
/// Physical register files, rename maps, free lists, register windows.
pub mod regfile;

pub use instance::{InstId, Instance, MemProgress};
pub use proc::Processor;
