//! Discrete-event engine.
//!
//! The engine is three pieces:
//! 1. **Pools** ([`pool`]): fixed-block descriptor recyclers with in-use
//!    guards. Every descriptor that crosses a component boundary (requests,
//!    packets, activities) is drawn from a pool and returned to it.
//! 2. **Event list** ([`queue`]): Brown's calendar queue (or a sorted linear
//!    list) of pending activities keyed by wakeup time, FIFO at ties.
//! 3. **Driver** ([`driver`]): owns the current simulated time and the event
//!    list, pops the earliest activity, and hands its body back to the caller
//!    for dispatch.

/// Event driver: simulated time, scheduling, interrupt.
pub mod driver;
/// Fixed-block descriptor pools with in-use guards.
pub mod pool;
/// Calendar-queue and linear event lists.
pub mod queue;

pub use driver::{ActId, ActState, Activity, EventDriver, ScheduleMode};
pub use pool::{Pool, PoolId};
pub use queue::{EventKey, EventQueue};
