//! Cycle-accurate multiprocessor simulator library.
//!
//! This crate implements a discrete-event simulator for a mesh of out-of-order,
//! superscalar, release-consistent processor nodes with the following:
//! 1. **Engine:** Event driver with a calendar-queue event list and pooled descriptors.
//! 2. **Processor:** Fetch, decode/rename, issue, execute, memory queue, active list,
//!    commit, branch prediction, and speculative-load recovery.
//! 3. **Memory:** Non-blocking L1/L2 caches with MSHRs, write buffer, bus, memory
//!    banks, and a directory-based invalidation coherence protocol.
//! 4. **Network:** Wormhole-routed 2-D mesh with separate request and reply networks.
//! 5. **Consistency:** Sequential, processor, and release consistency enforcement.
//! 6. **Simulation:** `Simulator` (owns nodes + network + driver), loader, configuration,
//!    and statistics.

/// Common types (addresses, line tags, exception and error definitions).
pub mod common;
/// Simulator configuration (defaults, enums, hierarchical config structures).
pub mod config;
/// Processor core: pipeline stages, rename state, memory unit, functional execution.
pub mod cpu;
/// Discrete-event engine: driver, event list, descriptor pools.
pub mod event;
/// Instruction set: opcodes, static instruction records, predecoded input files.
pub mod isa;
/// Memory subsystem: caches, MSHRs, write buffer, bus, directory, address space.
pub mod mem;
/// Wormhole-routed mesh network: packets, switches, routing.
pub mod net;
/// Simulation: `Simulator`, application loader.
pub mod sim;
/// Sampled/interval statistics records and report printing.
pub mod stats;

/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// Top-level simulator; owns the processors, memory hierarchy, and network.
pub use crate::sim::simulator::Simulator;
