//! The active list (reorder buffer).
//!
//! A bounded FIFO of in-flight instructions in program order. Each entry
//! records the renames its instruction performed — (logical dest, new
//! physical, old physical) for the destination, the pair half, and the
//! condition-code register — which is exactly what retire needs to free
//! shadows and what squash needs to roll the maps back.
//!
//! Fetch appends; retire removes from the head in order; an entry whose
//! instance flags an exception stops retirement and triggers a squash of
//! everything younger.

use super::instance::InstId;
use super::regfile::Bank;

/// One recorded rename.
#[derive(Clone, Copy, Debug)]
pub struct Rename {
    /// Register bank.
    pub bank: Bank,
    /// Logical register renamed.
    pub logical: usize,
    /// Fresh physical register allocated.
    pub new: u16,
    /// Previous mapping (the shadow to free at retire / restore at squash).
    pub old: u16,
}

/// One active-list entry.
#[derive(Clone, Debug)]
pub struct AlEntry {
    /// Instance occupying this slot.
    pub inst: InstId,
    /// Instance tag (squash boundaries are expressed in tags).
    pub tag: u64,
    /// Renames performed at decode, in allocation order.
    pub renames: [Option<Rename>; 3],
}

impl AlEntry {
    /// Iterates the recorded renames.
    pub fn renames(&self) -> impl Iterator<Item = Rename> + '_ {
        self.renames.iter().flatten().copied()
    }
}

/// The active list.
pub struct ActiveList {
    entries: std::collections::VecDeque<AlEntry>,
    capacity: usize,
}

impl ActiveList {
    /// Creates an active list of `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of occupied entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no instructions are in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if decode must stall.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Appends a decoded instruction (program order).
    pub fn push(&mut self, entry: AlEntry) {
        debug_assert!(!self.is_full());
        self.entries.push_back(entry);
    }

    /// The oldest in-flight entry.
    pub fn head(&self) -> Option<&AlEntry> {
        self.entries.front()
    }

    /// Removes the head (it retired).
    pub fn pop_head(&mut self) -> Option<AlEntry> {
        self.entries.pop_front()
    }

    /// Removes every entry with `tag > boundary`, youngest first, handing
    /// each to `undo` (which rolls back its renames and frees its instance).
    pub fn squash_after(&mut self, boundary: u64, mut undo: impl FnMut(AlEntry)) {
        while let Some(back) = self.entries.back() {
            if back.tag <= boundary {
                break;
            }
            // The while-let guard just confirmed a back entry exists.
            if let Some(e) = self.entries.pop_back() {
                undo(e);
            }
        }
    }

    /// Iterates entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &AlEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PoolId;

    fn entry(tag: u64) -> AlEntry {
        AlEntry {
            inst: InstId::from_index(tag as usize),
            tag,
            renames: [None, None, None],
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut al = ActiveList::new(4);
        al.push(entry(1));
        al.push(entry(2));
        assert_eq!(al.head().map(|e| e.tag), Some(1));
        assert_eq!(al.pop_head().map(|e| e.tag), Some(1));
        assert_eq!(al.pop_head().map(|e| e.tag), Some(2));
        assert!(al.is_empty());
    }

    #[test]
    fn test_capacity() {
        let mut al = ActiveList::new(2);
        al.push(entry(1));
        assert!(!al.is_full());
        al.push(entry(2));
        assert!(al.is_full());
    }

    #[test]
    fn test_squash_after_walks_youngest_first() {
        let mut al = ActiveList::new(8);
        for t in 1..=5 {
            al.push(entry(t));
        }
        let mut undone = Vec::new();
        al.squash_after(2, |e| undone.push(e.tag));
        assert_eq!(undone, vec![5, 4, 3]);
        assert_eq!(al.len(), 2);
        // P7: nothing younger than the boundary survives.
        assert!(al.iter().all(|e| e.tag <= 2));
    }
}
