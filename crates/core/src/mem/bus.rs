//! Node bus arbitration and memory-bank timing.
//!
//! Each node has one split-transaction bus connecting its L2, its memory
//! bank, its directory slice, and the network interface, plus one memory
//! bank with a fixed access latency. Both are pure timing models: callers
//! ask when a transfer/access they start *now* would complete, and the
//! component advances its busy horizon. Utilization is recorded as an
//! interval statistic.

use crate::common::SimTime;
use crate::stats::StatRec;

/// The node-local bus.
pub struct Bus {
    width: u64,
    latency: u64,
    busy_until: SimTime,
    /// Fraction-of-time-busy statistic.
    pub busy: StatRec,
    /// Transactions granted.
    pub transactions: u64,
}

impl Bus {
    /// Creates a bus of `width` bytes per cycle with `latency` cycles of
    /// arbitration overhead per transaction.
    pub fn new(width: u64, latency: u64) -> Self {
        Self {
            width: width.max(1),
            latency,
            busy_until: 0.0,
            busy: StatRec::interval("bus.busy"),
            transactions: 0,
        }
    }

    /// Cycles to move `bytes` across the bus, excluding queueing.
    pub fn transfer_cycles(&self, bytes: u64) -> u64 {
        self.latency + bytes.div_ceil(self.width)
    }

    /// Grants the bus for a `bytes`-byte transfer starting no earlier than
    /// `now`; returns the completion time.
    pub fn acquire(&mut self, now: SimTime, bytes: u64) -> SimTime {
        let start = if self.busy_until > now {
            self.busy_until
        } else {
            now
        };
        let done = start + self.transfer_cycles(bytes) as SimTime;
        self.busy.update(1.0, start);
        self.busy.update(0.0, done);
        self.busy_until = done;
        self.transactions += 1;
        done
    }
}

/// The node-local memory bank.
pub struct MemoryBank {
    latency: u64,
    busy_until: SimTime,
    /// Accesses serviced.
    pub accesses: u64,
    /// Fraction-of-time-busy statistic.
    pub busy: StatRec,
}

impl MemoryBank {
    /// Creates a bank with a fixed `latency`.
    pub fn new(latency: u64) -> Self {
        Self {
            latency,
            busy_until: 0.0,
            accesses: 0,
            busy: StatRec::interval("mem.busy"),
        }
    }

    /// Starts an access no earlier than `now`; returns the completion time.
    pub fn access(&mut self, now: SimTime) -> SimTime {
        let start = if self.busy_until > now {
            self.busy_until
        } else {
            now
        };
        let done = start + self.latency as SimTime;
        self.busy.update(1.0, start);
        self.busy.update(0.0, done);
        self.busy_until = done;
        self.accesses += 1;
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_cycles() {
        let b = Bus::new(32, 3);
        assert_eq!(b.transfer_cycles(32), 4);
        assert_eq!(b.transfer_cycles(33), 5);
        assert_eq!(b.transfer_cycles(1), 4);
    }

    #[test]
    fn test_back_to_back_serializes() {
        let mut b = Bus::new(32, 3);
        let d1 = b.acquire(0.0, 32);
        assert_eq!(d1, 4.0);
        // Second transaction at the same instant queues behind the first.
        let d2 = b.acquire(0.0, 32);
        assert_eq!(d2, 8.0);
        // After the bus drains, a later request starts immediately.
        let d3 = b.acquire(20.0, 32);
        assert_eq!(d3, 24.0);
        assert_eq!(b.transactions, 3);
    }

    #[test]
    fn test_memory_bank_latency() {
        let mut m = MemoryBank::new(18);
        assert_eq!(m.access(10.0), 28.0);
        assert_eq!(m.access(10.0), 46.0);
    }
}
