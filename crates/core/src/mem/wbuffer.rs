//! Coalescing write buffer.
//!
//! Retired stores land here: a store is architecturally complete the moment
//! it enters the buffer, but globally visible only when its line drains to
//! the cache with write permission. Consecutive stores to the same line
//! coalesce into one entry up to a per-entry store limit. Loads may bypass
//! the buffer when the consistency model permits, forwarding the value of a
//! covering store.

use crate::common::{LineTag, VirtAddr};

/// One pending (possibly coalesced) store.
#[derive(Clone, Copy, Debug)]
pub struct PendingStore {
    /// Store address.
    pub addr: VirtAddr,
    /// Store size in bytes.
    pub size: u64,
    /// Value, right-aligned (big-endian byte order applies at memory).
    pub value: u64,
}

/// One write-buffer entry: a line and the stores coalesced onto it.
#[derive(Clone, Debug)]
pub struct WbEntry {
    /// Line the stores fall in.
    pub line: LineTag,
    /// Stores in arrival order.
    pub stores: Vec<PendingStore>,
    /// A drain request for this entry is in the memory system.
    pub draining: bool,
}

/// Result of a forwarding probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WbForward {
    /// A buffered store fully covers the load; use this value.
    Hit(u64),
    /// No buffered store overlaps the load.
    Miss,
    /// Partial overlap: the load must wait for the entry to drain.
    Stall,
}

/// The write buffer of one node.
pub struct WriteBuffer {
    entries: Vec<WbEntry>,
    capacity: usize,
    max_stores_per_entry: usize,
    /// Stores accepted (coalesced or not).
    pub stores_accepted: u64,
    /// Stores that coalesced onto an existing entry.
    pub stores_coalesced: u64,
    /// Loads forwarded from the buffer.
    pub forwards: u64,
}

impl WriteBuffer {
    /// Creates a buffer of `capacity` line entries.
    pub fn new(capacity: usize, line_bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
            max_stores_per_entry: line_bytes.max(1),
            stores_accepted: 0,
            stores_coalesced: 0,
            forwards: 0,
        }
    }

    /// Number of occupied entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no stores are buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if a store to `line` could not be accepted right now.
    pub fn full_for(&self, line: LineTag) -> bool {
        if let Some(e) = self.entries.iter().find(|e| e.line == line) {
            // An entry mid-drain no longer accepts coalesced stores.
            e.draining || e.stores.len() >= self.max_stores_per_entry
        } else {
            self.entries.len() >= self.capacity
        }
    }

    /// Accepts a retired store, coalescing onto an existing entry when
    /// possible. The caller must have checked [`WriteBuffer::full_for`].
    pub fn push(&mut self, line: LineTag, addr: VirtAddr, size: u64, value: u64) {
        self.stores_accepted += 1;
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.line == line && !e.draining)
        {
            self.stores_coalesced += 1;
            // A store exactly over a previous one replaces it.
            if let Some(prev) = e
                .stores
                .iter_mut()
                .find(|s| s.addr == addr && s.size == size)
            {
                prev.value = value;
            } else {
                e.stores.push(PendingStore { addr, size, value });
            }
        } else {
            self.entries.push(WbEntry {
                line,
                stores: vec![PendingStore { addr, size, value }],
                draining: false,
            });
        }
    }

    /// Probes for a forwarding candidate, newest store first.
    pub fn forward(&mut self, addr: VirtAddr, size: u64) -> WbForward {
        let lo = addr.0;
        let hi = addr.0 + size;
        for e in self.entries.iter().rev() {
            for s in e.stores.iter().rev() {
                let s_lo = s.addr.0;
                let s_hi = s.addr.0 + s.size;
                if lo < s_hi && hi > s_lo {
                    if s_lo <= lo && s_hi >= hi {
                        // Big-endian: the load's bytes sit (s_hi - hi) bytes
                        // up from the store value's low end.
                        let shift = 8 * (s_hi - hi);
                        let mask = if size >= 8 {
                            u64::MAX
                        } else {
                            (1u64 << (8 * size)) - 1
                        };
                        self.forwards += 1;
                        return WbForward::Hit((s.value >> shift) & mask);
                    }
                    return WbForward::Stall;
                }
            }
        }
        WbForward::Miss
    }

    /// The oldest entry not yet draining, if any; marks it draining.
    pub fn start_drain(&mut self) -> Option<(LineTag, VirtAddr)> {
        let e = self.entries.iter_mut().find(|e| !e.draining)?;
        e.draining = true;
        Some((e.line, e.stores[0].addr))
    }

    /// True if any entry is mid-drain.
    pub fn draining(&self) -> bool {
        self.entries.iter().any(|e| e.draining)
    }

    /// Backs out a drain that could not be dispatched (port or MSHR
    /// pressure); the entry becomes drainable again.
    pub fn abort_drain(&mut self, line: LineTag) {
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.line == line && e.draining)
        {
            e.draining = false;
        }
    }

    /// Completes the drain of `line`: removes and returns the entry so the
    /// caller can apply its stores to memory.
    pub fn finish_drain(&mut self, line: LineTag) -> Option<WbEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.line == line && e.draining)?;
        Some(self.entries.remove(idx))
    }

    /// True if a store to `line` is buffered (drain-ordering checks).
    pub fn holds_line(&self, line: LineTag) -> bool {
        self.entries.iter().any(|e| e.line == line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wb() -> WriteBuffer {
        WriteBuffer::new(4, 64)
    }

    #[test]
    fn test_push_and_drain() {
        let mut b = wb();
        let line = LineTag(0x40);
        b.push(line, VirtAddr(0x1000), 4, 42);
        assert_eq!(b.len(), 1);
        let (l, _) = b.start_drain().unwrap();
        assert_eq!(l, line);
        let e = b.finish_drain(line).unwrap();
        assert_eq!(e.stores.len(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn test_coalesce_same_line() {
        let mut b = wb();
        let line = LineTag(0x40);
        b.push(line, VirtAddr(0x1000), 4, 1);
        b.push(line, VirtAddr(0x1004), 4, 2);
        assert_eq!(b.len(), 1);
        assert_eq!(b.stores_coalesced, 1);
        // Exact overwrite replaces in place.
        b.push(line, VirtAddr(0x1000), 4, 9);
        let (l, _) = b.start_drain().unwrap();
        let e = b.finish_drain(l);
        let e = e.unwrap();
        assert_eq!(e.stores.len(), 2);
        assert_eq!(e.stores[0].value, 9);
    }

    #[test]
    fn test_forward_exact_and_partial() {
        let mut b = wb();
        b.push(LineTag(0x40), VirtAddr(0x1000), 4, 0x1234_5678);
        assert_eq!(b.forward(VirtAddr(0x1000), 4), WbForward::Hit(0x1234_5678));
        // Big-endian sub-word: byte 0 is the MSB.
        assert_eq!(b.forward(VirtAddr(0x1000), 1), WbForward::Hit(0x12));
        assert_eq!(b.forward(VirtAddr(0x1003), 1), WbForward::Hit(0x78));
        // Wider than the store: partial overlap stalls.
        assert_eq!(b.forward(VirtAddr(0x1000), 8), WbForward::Stall);
        assert_eq!(b.forward(VirtAddr(0x2000), 4), WbForward::Miss);
    }

    #[test]
    fn test_capacity() {
        let mut b = WriteBuffer::new(2, 64);
        b.push(LineTag(1), VirtAddr(0x40), 4, 0);
        b.push(LineTag(2), VirtAddr(0x80), 4, 0);
        assert!(b.full_for(LineTag(3)));
        assert!(!b.full_for(LineTag(1)));
    }

    #[test]
    fn test_draining_entry_rejects_coalesce() {
        let mut b = WriteBuffer::new(1, 64);
        b.push(LineTag(1), VirtAddr(0x40), 4, 0);
        let _ = b.start_drain();
        assert!(b.full_for(LineTag(1)));
    }
}
