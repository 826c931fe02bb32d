//! Set-associative cache arrays.
//!
//! Both cache levels share this array: sets × ways of lines carrying an
//! MSI-with-upgrade coherence state, an LRU counter, and a dirty bit.
//! Replacement is LRU within the set; lines in a pending state are
//! transaction-reserved and never chosen as victims.

use crate::common::LineTag;

/// Coherence state of a cache line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LineState {
    /// No valid data.
    #[default]
    Invalid,
    /// Read permission; other caches may also hold the line.
    Shared,
    /// Exclusive clean: only copy, but memory is up to date (granted by an
    /// exclusive fetch that has not been written yet).
    Exclusive,
    /// Exclusive dirty: only copy, memory is stale.
    Modified,
    /// Way reserved for an outstanding shared fill.
    PendingShared,
    /// Way reserved for an outstanding exclusive fill.
    PendingExcl,
}

impl LineState {
    /// True if the line holds valid data the local processor may read.
    #[inline]
    pub fn readable(self) -> bool {
        matches!(self, Self::Shared | Self::Exclusive | Self::Modified)
    }

    /// True if the local processor may write without a directory transaction.
    #[inline]
    pub fn writable(self) -> bool {
        matches!(self, Self::Exclusive | Self::Modified)
    }

    /// True while a fill is outstanding for the way.
    #[inline]
    pub fn pending(self) -> bool {
        matches!(self, Self::PendingShared | Self::PendingExcl)
    }
}

/// One cache line.
#[derive(Clone, Debug, Default)]
pub struct Line {
    /// Line tag (full line address, not the set-local partial tag).
    pub tag: LineTag,
    /// Coherence state.
    pub state: LineState,
    /// Dirty bit (meaningful in Modified; kept for write-through checks).
    pub dirty: bool,
    lru: u64,
}

/// Result of installing a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    /// Installed (or upgraded in place) without displacing anything.
    Installed,
    /// Installed; the caller must dispose of the displaced victim.
    Evicted(Victim),
    /// Every way in the set is transaction-reserved; retry later.
    Blocked,
}

impl Fill {
    /// The victim, if one was displaced.
    pub fn victim(self) -> Option<Victim> {
        match self {
            Self::Evicted(v) => Some(v),
            _ => None,
        }
    }

    /// True unless the fill was blocked.
    pub fn installed(self) -> bool {
        !matches!(self, Self::Blocked)
    }
}

/// An evicted victim the caller must dispose of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Victim {
    /// The displaced line.
    pub line: LineTag,
    /// It held dirty data that must be written back.
    pub dirty: bool,
    /// State it was in when displaced.
    pub state: LineState,
}

/// A set-associative array of cache lines.
pub struct CacheArray {
    lines: Vec<Line>,
    sets: usize,
    ways: usize,
    lru_clock: u64,
}

impl CacheArray {
    /// Creates an array of `size` bytes, `ways`-associative, with
    /// `1 << line_bits`-byte lines. Geometry is validated by `Config`.
    pub fn new(size: usize, ways: usize, line_bits: u32) -> Self {
        let num_lines = (size >> line_bits).max(1);
        let ways = ways.clamp(1, num_lines);
        Self {
            lines: vec![Line::default(); num_lines],
            sets: num_lines / ways,
            ways,
            lru_clock: 0,
        }
    }

    #[inline]
    fn set_of(&self, line: LineTag) -> usize {
        (line.0 as usize) % self.sets
    }

    #[inline]
    fn set_range(&self, line: LineTag) -> std::ops::Range<usize> {
        let base = self.set_of(line) * self.ways;
        base..base + self.ways
    }

    /// Looks up a line, returning its state without touching LRU.
    pub fn probe(&self, line: LineTag) -> LineState {
        for i in self.set_range(line) {
            if self.lines[i].state != LineState::Invalid && self.lines[i].tag == line {
                return self.lines[i].state;
            }
        }
        LineState::Invalid
    }

    /// Looks up a line and, if present, marks it most recently used.
    pub fn touch(&mut self, line: LineTag) -> LineState {
        self.lru_clock += 1;
        let clock = self.lru_clock;
        for i in self.set_range(line) {
            if self.lines[i].state != LineState::Invalid && self.lines[i].tag == line {
                self.lines[i].lru = clock;
                return self.lines[i].state;
            }
        }
        LineState::Invalid
    }

    /// Changes the state of a resident line. Returns false if absent.
    pub fn set_state(&mut self, line: LineTag, state: LineState) -> bool {
        for i in self.set_range(line) {
            if self.lines[i].state != LineState::Invalid && self.lines[i].tag == line {
                self.lines[i].state = state;
                if state == LineState::Modified {
                    self.lines[i].dirty = true;
                }
                return true;
            }
        }
        false
    }

    /// Invalidates a line, returning whether it was dirty (needs writeback).
    pub fn invalidate(&mut self, line: LineTag) -> Option<Victim> {
        for i in self.set_range(line) {
            if self.lines[i].state != LineState::Invalid && self.lines[i].tag == line {
                let v = Victim {
                    line,
                    dirty: self.lines[i].dirty,
                    state: self.lines[i].state,
                };
                self.lines[i] = Line::default();
                return Some(v);
            }
        }
        None
    }

    /// Installs (or upgrades) a line in `state`, evicting the LRU victim if
    /// every way holds valid data.
    pub fn fill(&mut self, line: LineTag, state: LineState) -> Fill {
        self.lru_clock += 1;
        let clock = self.lru_clock;
        let range = self.set_range(line);

        // Upgrade in place if already resident (or reserved).
        for i in range.clone() {
            if self.lines[i].state != LineState::Invalid && self.lines[i].tag == line {
                self.lines[i].state = state;
                self.lines[i].lru = clock;
                if state == LineState::Modified {
                    self.lines[i].dirty = true;
                }
                return Fill::Installed;
            }
        }

        // Free way?
        for i in range.clone() {
            if self.lines[i].state == LineState::Invalid {
                self.lines[i] = Line {
                    tag: line,
                    state,
                    dirty: state == LineState::Modified,
                    lru: clock,
                };
                return Fill::Installed;
            }
        }

        // Evict the least recently used non-pending way.
        let victim_idx = range
            .filter(|&i| !self.lines[i].state.pending())
            .min_by_key(|&i| self.lines[i].lru);
        let Some(idx) = victim_idx else {
            // Every way is transaction-reserved; the caller retries later.
            return Fill::Blocked;
        };
        let v = Victim {
            line: self.lines[idx].tag,
            dirty: self.lines[idx].dirty,
            state: self.lines[idx].state,
        };
        self.lines[idx] = Line {
            tag: line,
            state,
            dirty: state == LineState::Modified,
            lru: clock,
        };
        Fill::Evicted(v)
    }

    /// Marks a resident line dirty (store hit).
    pub fn mark_dirty(&mut self, line: LineTag) {
        for i in self.set_range(line) {
            if self.lines[i].state != LineState::Invalid && self.lines[i].tag == line {
                self.lines[i].dirty = true;
                return;
            }
        }
    }

    /// Iterates resident lines (protocol-invariant checks in tests).
    pub fn resident(&self) -> impl Iterator<Item = &Line> {
        self.lines
            .iter()
            .filter(|l| l.state != LineState::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr() -> CacheArray {
        // 4 lines of 64 B, 2-way: 2 sets.
        CacheArray::new(256, 2, 6)
    }

    #[test]
    fn test_fill_and_probe() {
        let mut c = arr();
        assert_eq!(c.probe(LineTag(0x10)), LineState::Invalid);
        assert_eq!(c.fill(LineTag(0x10), LineState::Shared), Fill::Installed);
        assert_eq!(c.probe(LineTag(0x10)), LineState::Shared);
    }

    #[test]
    fn test_lru_eviction() {
        let mut c = arr();
        // Same set: tags congruent mod 2.
        let a = LineTag(0);
        let b = LineTag(2);
        let d = LineTag(4);
        let _ = c.fill(a, LineState::Shared);
        let _ = c.fill(b, LineState::Shared);
        // Touch a so b becomes LRU.
        let _ = c.touch(a);
        let v = c.fill(d, LineState::Shared).victim().unwrap();
        assert_eq!(v.line, b);
        assert!(!v.dirty);
        assert_eq!(c.probe(a), LineState::Shared);
        assert_eq!(c.probe(d), LineState::Shared);
    }

    #[test]
    fn test_dirty_victim_reported() {
        let mut c = arr();
        let _ = c.fill(LineTag(0), LineState::Modified);
        let _ = c.fill(LineTag(2), LineState::Shared);
        let v = c.fill(LineTag(4), LineState::Shared).victim().unwrap();
        assert_eq!(v.line, LineTag(0));
        assert!(v.dirty);
    }

    #[test]
    fn test_pending_ways_not_evicted() {
        let mut c = arr();
        let _ = c.fill(LineTag(0), LineState::PendingExcl);
        let _ = c.fill(LineTag(2), LineState::PendingShared);
        assert_eq!(c.fill(LineTag(4), LineState::Shared), Fill::Blocked);
    }

    #[test]
    fn test_upgrade_in_place() {
        let mut c = arr();
        let _ = c.fill(LineTag(0), LineState::PendingShared);
        assert_eq!(c.fill(LineTag(0), LineState::Shared), Fill::Installed);
        assert_eq!(c.probe(LineTag(0)), LineState::Shared);
    }

    #[test]
    fn test_invalidate() {
        let mut c = arr();
        let _ = c.fill(LineTag(0), LineState::Modified);
        let v = c.invalidate(LineTag(0)).unwrap();
        assert!(v.dirty);
        assert_eq!(c.probe(LineTag(0)), LineState::Invalid);
        assert!(c.invalidate(LineTag(0)).is_none());
    }
}
