//! Common types shared by every component.
//!
//! This module collects the small vocabulary types the rest of the simulator
//! speaks in: simulated addresses and cache-line tags, the per-instruction
//! exception codes, and the simulator-fatal error enum.

/// Address newtypes and the home-node hash.
pub mod addr;
/// Exception codes and simulator-fatal errors.
pub mod error;

pub use addr::{LineTag, VirtAddr};
pub use error::{ExceptionCode, SimError};

/// Simulated time. The event list orders activities by this value; ties are
/// broken FIFO by enqueue sequence.
pub type SimTime = f64;
