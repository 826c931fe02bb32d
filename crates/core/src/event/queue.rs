//! Event lists: calendar queue and sorted linear list.
//!
//! The calendar queue hashes activities into time-width bins and keeps a
//! cursor (`lastbin`, `lastprio`, `bintop`) pointing at the current minimum,
//! giving O(1) insert and pop for well-behaved workloads. When the population
//! doubles or halves, the queue resizes itself: it samples up to 25 held
//! entries, averages the gaps between adjacent wakeup times (discarding gaps
//! more than twice the first-pass average), and adopts three times that
//! trimmed mean as the new bin width.
//!
//! Ties are broken FIFO: every insert stamps a monotonically increasing
//! sequence number, and ordering is (time, seq).

use std::cmp::Ordering;
use std::collections::VecDeque;

use super::driver::ActId;
use crate::common::SimTime;
use crate::config::EventListKind;

/// Ordering key for a pending activity: wakeup time, then insert sequence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EventKey {
    /// Simulated wakeup time.
    pub time: SimTime,
    /// Insert sequence number; breaks ties FIFO.
    pub seq: u64,
}

impl Eq for EventKey {}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

type Entry = (EventKey, ActId);

/// An event list: either a calendar queue or a sorted linear list.
pub enum EventQueue {
    /// Brown's calendar queue with automatic resizing.
    Calendar(CalendarQueue),
    /// Sorted vector; O(n) insert, kept for debugging comparisons.
    Linear(LinearQueue),
}

impl EventQueue {
    /// Creates the queue kind selected by configuration.
    pub fn new(kind: EventListKind) -> Self {
        match kind {
            EventListKind::Calendar => Self::Calendar(CalendarQueue::new(16, 1.0)),
            EventListKind::Linear => Self::Linear(LinearQueue::default()),
        }
    }

    /// Inserts an activity.
    pub fn insert(&mut self, key: EventKey, id: ActId) {
        match self {
            Self::Calendar(q) => q.insert(key, id),
            Self::Linear(q) => q.insert(key, id),
        }
    }

    /// Removes and returns the earliest activity.
    pub fn pop_min(&mut self) -> Option<Entry> {
        match self {
            Self::Calendar(q) => q.pop_min(),
            Self::Linear(q) => q.pop_min(),
        }
    }

    /// The earliest key without removing it.
    pub fn peek_min(&mut self) -> Option<EventKey> {
        match self {
            Self::Calendar(q) => q.peek_min(),
            Self::Linear(q) => q.peek_min(),
        }
    }

    /// Removes an arbitrary pending activity. Returns true if it was held.
    pub fn delete(&mut self, id: ActId) -> bool {
        match self {
            Self::Calendar(q) => q.delete(id),
            Self::Linear(q) => q.delete(id),
        }
    }

    /// Number of pending activities.
    pub fn len(&self) -> usize {
        match self {
            Self::Calendar(q) => q.size,
            Self::Linear(q) => q.entries.len(),
        }
    }

    /// True if no activities are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sorted linear event list.
#[derive(Default)]
pub struct LinearQueue {
    entries: VecDeque<Entry>,
}

impl LinearQueue {
    fn insert(&mut self, key: EventKey, id: ActId) {
        let pos = self.entries.partition_point(|(k, _)| *k <= key);
        self.entries.insert(pos, (key, id));
    }

    fn pop_min(&mut self) -> Option<Entry> {
        self.entries.pop_front()
    }

    fn peek_min(&self) -> Option<EventKey> {
        self.entries.front().map(|(k, _)| *k)
    }

    fn delete(&mut self, id: ActId) -> bool {
        if let Some(pos) = self.entries.iter().position(|(_, a)| *a == id) {
            let _ = self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Brown's calendar queue.
pub struct CalendarQueue {
    bins: Vec<VecDeque<Entry>>,
    width: f64,
    size: usize,
    /// Bin holding the current minimum.
    lastbin: usize,
    /// Time of the current minimum (or of the last pop).
    lastprio: f64,
    /// Upper time bound of the cursor's current sweep position.
    bintop: f64,
    /// Population above which the bin count doubles.
    thtop: usize,
    /// Population below which the bin count halves.
    thbot: usize,
    resize_enabled: bool,
}

impl CalendarQueue {
    /// Creates a calendar queue with `nbins` bins of width `width`.
    pub fn new(nbins: usize, width: f64) -> Self {
        let mut q = Self {
            bins: Vec::new(),
            width: 1.0,
            size: 0,
            lastbin: 0,
            lastprio: 0.0,
            bintop: 0.0,
            thtop: 0,
            thbot: 0,
            resize_enabled: true,
        };
        q.init(nbins, width, 0.0);
        q
    }

    fn init(&mut self, nbins: usize, width: f64, startprio: f64) {
        self.bins.clear();
        self.bins.resize_with(nbins.max(2), VecDeque::new);
        let nbins = self.bins.len();
        self.width = width;
        self.size = 0;
        self.lastprio = startprio;
        let n = (startprio / width) as usize;
        self.lastbin = n % nbins;
        self.bintop = (n + 1) as f64 * width + 0.5 * width;
        self.thtop = 2 * nbins;
        self.thbot = (nbins / 2).saturating_sub(1);
    }

    fn insert(&mut self, key: EventKey, id: ActId) {
        let nbins = self.bins.len();
        let i = ((key.time / self.width) as usize) % nbins;

        if self.size == 0 || key.time < self.lastprio {
            // This activity becomes the new head.
            self.lastprio = key.time;
            self.lastbin = i;
            self.bintop = (i + 1) as f64 * self.width + 0.5 * self.width;
        }
        self.size += 1;

        let bin = &mut self.bins[i];
        let pos = bin.partition_point(|(k, _)| *k <= key);
        bin.insert(pos, (key, id));

        if self.size > self.thtop {
            self.resize(nbins * 2);
        }
    }

    fn pop_min(&mut self) -> Option<Entry> {
        let entry = self.take_head()?;
        if self.size < self.thbot {
            let nbins = self.bins.len();
            self.resize(nbins / 2);
        }
        Some(entry)
    }

    fn peek_min(&mut self) -> Option<EventKey> {
        if self.size == 0 {
            return None;
        }
        self.position_cursor();
        self.bins[self.lastbin].front().map(|(k, _)| *k)
    }

    fn take_head(&mut self) -> Option<Entry> {
        if self.size == 0 {
            return None;
        }
        self.position_cursor();
        let entry = self.bins[self.lastbin].pop_front()?;
        self.size -= 1;
        self.lastprio = entry.0.time;
        Some(entry)
    }

    /// Moves the cursor (`lastbin`, `bintop`) to the bin holding the minimum.
    fn position_cursor(&mut self) {
        let nbins = self.bins.len();

        // Sweep forward from the cursor: the head is the first entry whose
        // time falls inside the current bin-year window.
        let mut i = self.lastbin;
        let mut bintop = self.bintop;
        for _ in 0..nbins {
            if let Some((k, _)) = self.bins[i].front() {
                if k.time < bintop {
                    self.lastbin = i;
                    self.bintop = bintop;
                    self.lastprio = k.time;
                    return;
                }
            }
            i = (i + 1) % nbins;
            bintop += self.width;
        }

        // A full sweep found nothing in-window (sparse far-future entries):
        // fall back to a direct search for the minimum.
        let mut best: Option<(EventKey, usize)> = None;
        for (idx, bin) in self.bins.iter().enumerate() {
            if let Some((k, _)) = bin.front() {
                if best.is_none_or(|(bk, _)| *k < bk) {
                    best = Some((*k, idx));
                }
            }
        }
        if let Some((k, idx)) = best {
            self.lastbin = idx;
            self.lastprio = k.time;
            let year = (k.time / self.width) as usize + 1;
            self.bintop = year as f64 * self.width + 0.5 * self.width;
        }
    }

    fn delete(&mut self, id: ActId) -> bool {
        for bin in &mut self.bins {
            if let Some(pos) = bin.iter().position(|(_, a)| *a == id) {
                let _ = bin.remove(pos);
                self.size -= 1;
                return true;
            }
        }
        false
    }

    /// Estimates a new bin width from a sample of held activities: three
    /// times the trimmed mean gap between adjacent wakeup times.
    fn new_width(&mut self) -> f64 {
        if self.size < 2 {
            return 1.0;
        }
        let nsamples = if self.size <= 5 {
            self.size
        } else {
            (5 + self.size / 10).min(25)
        };

        let save = (self.lastbin, self.lastprio, self.bintop);
        self.resize_enabled = false;
        let mut samples = Vec::with_capacity(nsamples);
        for _ in 0..nsamples {
            if let Some(e) = self.take_head() {
                samples.push(e);
            }
        }
        for &(k, id) in samples.iter().rev() {
            self.insert(k, id);
        }
        self.resize_enabled = true;
        (self.lastbin, self.lastprio, self.bintop) = save;

        let mut sum = 0.0;
        for w in samples.windows(2) {
            sum += (w[1].0.time - w[0].0.time).abs();
        }
        let ave = sum / (samples.len() - 1) as f64;

        let mut trimmed = 0.0;
        let mut n = 0usize;
        for w in samples.windows(2) {
            let x = (w[1].0.time - w[0].0.time).abs();
            if x <= 2.0 * ave {
                trimmed += x;
                n += 1;
            }
        }
        if n == 0 {
            return 1.0;
        }
        3.0 * (trimmed / n as f64)
    }

    fn resize(&mut self, newbins: usize) {
        if !self.resize_enabled || newbins < 2 {
            return;
        }
        let mut width = self.new_width();
        if width <= 0.0 {
            width = 1.0;
        }

        let old_bins = std::mem::take(&mut self.bins);
        self.init(newbins, width, self.lastprio);

        self.resize_enabled = false;
        for bin in old_bins {
            for (k, id) in bin {
                self.insert(k, id);
            }
        }
        self.resize_enabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PoolId;
    use proptest::prelude::*;

    fn key(t: f64, s: u64) -> EventKey {
        EventKey { time: t, seq: s }
    }

    fn id(n: usize) -> ActId {
        ActId::from_index(n)
    }

    #[test]
    fn test_linear_orders_by_time_then_seq() {
        let mut q = EventQueue::new(EventListKind::Linear);
        q.insert(key(5.0, 1), id(1));
        q.insert(key(3.0, 2), id(2));
        q.insert(key(5.0, 0), id(3));
        assert_eq!(q.pop_min().map(|e| e.1), Some(id(2)));
        assert_eq!(q.pop_min().map(|e| e.1), Some(id(3)));
        assert_eq!(q.pop_min().map(|e| e.1), Some(id(1)));
        assert!(q.pop_min().is_none());
    }

    #[test]
    fn test_calendar_basic_order() {
        let mut q = EventQueue::new(EventListKind::Calendar);
        for (i, t) in [7.5, 0.25, 3.0, 3.0, 100.0, 1.0].iter().enumerate() {
            q.insert(key(*t, i as u64), id(i));
        }
        let mut popped = Vec::new();
        while let Some((k, _)) = q.pop_min() {
            popped.push(k);
        }
        for w in popped.windows(2) {
            assert!(w[0] <= w[1], "{:?} before {:?}", w[0], w[1]);
        }
        assert_eq!(popped.len(), 6);
    }

    #[test]
    fn test_calendar_fifo_at_ties() {
        let mut q = EventQueue::new(EventListKind::Calendar);
        for i in 0..10u64 {
            q.insert(key(4.0, i), id(i as usize));
        }
        for i in 0..10usize {
            assert_eq!(q.pop_min().map(|e| e.1), Some(id(i)));
        }
    }

    #[test]
    fn test_calendar_resize_keeps_contents() {
        let mut q = EventQueue::new(EventListKind::Calendar);
        // Push enough to trigger at least one doubling (thtop = 2 * 16).
        for i in 0..200u64 {
            q.insert(key((i % 37) as f64 * 0.5, i), id(i as usize));
        }
        assert_eq!(q.len(), 200);
        let mut last = key(f64::NEG_INFINITY, 0);
        let mut n = 0;
        while let Some((k, _)) = q.pop_min() {
            assert!(last.time <= k.time);
            last = k;
            n += 1;
        }
        assert_eq!(n, 200);
    }

    #[test]
    fn test_delete_arbitrary() {
        let mut q = EventQueue::new(EventListKind::Calendar);
        q.insert(key(1.0, 0), id(0));
        q.insert(key(2.0, 1), id(1));
        q.insert(key(3.0, 2), id(2));
        assert!(q.delete(id(1)));
        assert!(!q.delete(id(1)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_min().map(|e| e.1), Some(id(0)));
        assert_eq!(q.pop_min().map(|e| e.1), Some(id(2)));
    }

    proptest! {
        // P6: pop order is monotonic in time, FIFO at ties, for both kinds.
        #[test]
        fn prop_pop_order_monotone(times in proptest::collection::vec(0.0f64..1e4, 1..300)) {
            for kind in [EventListKind::Calendar, EventListKind::Linear] {
                let mut q = EventQueue::new(kind);
                for (i, t) in times.iter().enumerate() {
                    q.insert(key(*t, i as u64), id(i));
                }
                let mut prev: Option<EventKey> = None;
                let mut count = 0;
                while let Some((k, _)) = q.pop_min() {
                    if let Some(p) = prev {
                        prop_assert!(p <= k);
                    }
                    prev = Some(k);
                    count += 1;
                }
                prop_assert_eq!(count, times.len());
            }
        }
    }
}
