//! Exception codes and simulator-fatal errors.
//!
//! Two distinct failure planes exist:
//! 1. **Application-visible exceptions** ride on an instruction instance and
//!    are delivered when that instance reaches the head of the active list.
//!    They never abort the simulator by themselves.
//! 2. **Simulator-internal fatals** mean the model itself is broken (pool
//!    double-free, event-list corruption, protocol inconsistency). They abort
//!    the run after the accumulated statistics are printed.

use thiserror::Error;

use super::SimTime;

/// Exception attached to an instruction instance, delivered at retire.
///
/// `Ok` means no exception. `SerializeAfterRetire` is not an error at all: it
/// marks instructions whose architectural effect must be re-computed once the
/// instruction is the oldest in the machine (condition-code multiplies,
/// state-register writes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExceptionCode {
    /// No exception; the instance retires normally.
    #[default]
    Ok,
    /// Re-execute the instruction's functional body at retire, alone.
    SerializeAfterRetire,
    /// Fetch reached a misaligned or out-of-segment PC.
    BadPc,
    /// Load or store touched an unmapped address.
    ///
    /// Inside the growable stack region this is not delivered: retire extends
    /// the stack mapping and re-runs the instruction.
    SegV,
    /// Integer divide by zero.
    Div0,
    /// Host floating-point operation raised an IEEE exception.
    FpError,
    /// Privileged opcode in user code.
    Privileged,
    /// Undecodable or reserved opcode.
    Illegal,
    /// A speculative load's line was invalidated by external coherence
    /// activity before the load retired; squash and re-fetch from the load.
    SoftSpecLoadCohe,
    /// A speculative load's line was replaced from the cache before the load
    /// retired; squash and re-fetch from the load.
    SoftSpecLoadRepl,
    /// Trap instruction (Tcc) with a true condition.
    SysTrap,
    /// SAVE with no clean register window available.
    WindowOverflow,
    /// RESTORE with no saved register window available.
    WindowUnderflow,
}

impl ExceptionCode {
    /// True if retirement must stop and squash younger instructions.
    ///
    /// `Ok` and `SerializeAfterRetire` retire normally; everything else
    /// invokes an exception handler at the head of the active list.
    #[inline]
    pub fn is_trouble(self) -> bool {
        !matches!(self, Self::Ok | Self::SerializeAfterRetire)
    }

    /// True for the soft speculation failures that re-fetch from the
    /// offending instruction rather than raising an application trap.
    #[inline]
    pub fn is_soft_spec(self) -> bool {
        matches!(self, Self::SoftSpecLoadCohe | Self::SoftSpecLoadRepl)
    }
}

/// Fatal simulator-internal errors.
///
/// Any of these aborts the run: they indicate the simulation model violated
/// one of its own invariants, so no further result can be trusted.
#[derive(Debug, Error)]
pub enum SimError {
    /// A descriptor was returned to a pool it is not checked out of.
    #[error("pool double-free of {kind} descriptor {index} at t={now}")]
    PoolDoubleFree {
        /// Descriptor kind name (for diagnostics).
        kind: &'static str,
        /// Arena index of the descriptor.
        index: usize,
        /// Simulated time of the second free.
        now: SimTime,
    },

    /// An activity was scheduled with a negative delta.
    #[error("scheduling into the past: delta={delta} at t={now}")]
    ScheduleIntoPast {
        /// The offending (negative) delta.
        delta: f64,
        /// Simulated time of the attempt.
        now: SimTime,
    },

    /// The directory and a cache disagree about the state of a line.
    #[error("directory protocol inconsistency at node {node} for {line}: {detail} (t={now})")]
    DirectoryInconsistency {
        /// Home node of the line.
        node: usize,
        /// The line in question.
        line: crate::common::LineTag,
        /// Human-readable description of the disagreement.
        detail: String,
        /// Simulated time of detection.
        now: SimTime,
    },

    /// A completing request carried a hierarchy-level classification the
    /// processor does not understand.
    #[error("unknown miss classification on completing request at t={now}")]
    UnknownHandled {
        /// Simulated time of detection.
        now: SimTime,
    },

    /// A memory module received a request type it cannot service.
    #[error("unknown memory request type {ty} at node {node} (t={now})")]
    UnknownReqType {
        /// Raw request-type discriminant.
        ty: u32,
        /// Node that received it.
        node: usize,
        /// Simulated time of detection.
        now: SimTime,
    },

    /// The event list lost or duplicated an activity.
    #[error("event list corruption: {detail} (t={now})")]
    EventListCorrupt {
        /// Human-readable description.
        detail: String,
        /// Simulated time of detection.
        now: SimTime,
    },

    /// Rejected configuration (for example a buffer threshold larger than
    /// the buffer itself in wait-for-tail mode).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Input file could not be read or failed validation.
    #[error("input error: {0}")]
    Input(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trouble_classification() {
        assert!(!ExceptionCode::Ok.is_trouble());
        assert!(!ExceptionCode::SerializeAfterRetire.is_trouble());
        assert!(ExceptionCode::SegV.is_trouble());
        assert!(ExceptionCode::SoftSpecLoadCohe.is_trouble());
        assert!(ExceptionCode::SoftSpecLoadCohe.is_soft_spec());
        assert!(!ExceptionCode::Div0.is_soft_spec());
    }

    #[test]
    fn test_error_display_mentions_time() {
        let e = SimError::ScheduleIntoPast {
            delta: -1.0,
            now: 42.0,
        };
        let msg = e.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("past"));
    }
}
