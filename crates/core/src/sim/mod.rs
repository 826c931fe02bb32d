//! Simulation top level.
//!
//! [`simulator::Simulator`] is the single value that owns everything: the
//! event driver, the processors, the per-node memory hierarchies, the two
//! mesh networks, the descriptor pools, and the simulated address space.
//! The event bodies it dispatches are defined in [`events`]; the network
//! head/tail state machines live in [`netwalk`]; the final report in
//! [`report`]; application loading in [`loader`].

/// Event bodies dispatched by the simulator.
pub mod events;
/// Application (SPARC ELF) and predecoded-file loading.
pub mod loader;
/// Wormhole head/tail event state machines.
pub mod netwalk;
/// End-of-run statistics report.
pub mod report;
/// The simulator itself.
pub mod simulator;

pub use simulator::{ExitStatus, Simulator};
