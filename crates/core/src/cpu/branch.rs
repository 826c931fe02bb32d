//! Branch prediction: a 2-bit-counter PHT and a return-address stack.
//!
//! Fetch consults the predictor; retire updates it with the resolved
//! outcome. Only conditional branches touch the pattern history table —
//! calls push the RAS, returns pop it, and unconditional branches bypass
//! prediction entirely.

use crate::common::VirtAddr;

/// 2-bit saturating counter states: 0,1 predict not-taken; 2,3 taken.
const WEAK_TAKEN: u8 = 2;
const MAX_COUNTER: u8 = 3;

/// The branch predictor of one processor.
pub struct BranchPredictor {
    pht: Vec<u8>,
    ras: Vec<VirtAddr>,
    ras_ptr: usize,
    ras_cap: usize,
    /// Conditional-branch predictions made.
    pub lookups: u64,
    /// Mispredictions recorded at update.
    pub mispredicts: u64,
}

impl BranchPredictor {
    /// Creates a predictor with `pht_size` counters and `ras_size` RAS
    /// entries.
    pub fn new(pht_size: usize, ras_size: usize) -> Self {
        Self {
            // Initialize weakly taken: loop branches start out right.
            pht: vec![WEAK_TAKEN; pht_size.max(1)],
            ras: vec![VirtAddr(0); ras_size.max(1)],
            ras_ptr: 0,
            ras_cap: ras_size.max(1),
            lookups: 0,
            mispredicts: 0,
        }
    }

    #[inline]
    fn index(&self, pc: VirtAddr) -> usize {
        ((pc.0 >> 2) as usize) % self.pht.len()
    }

    /// Predicts a conditional branch at `pc`.
    pub fn predict(&mut self, pc: VirtAddr) -> bool {
        self.lookups += 1;
        self.pht[self.index(pc)] >= WEAK_TAKEN
    }

    /// Retire-side update with the resolved direction.
    pub fn update(&mut self, pc: VirtAddr, taken: bool, mispredicted: bool) {
        if mispredicted {
            self.mispredicts += 1;
        }
        let i = self.index(pc);
        let c = &mut self.pht[i];
        if taken {
            *c = (*c + 1).min(MAX_COUNTER);
        } else {
            *c = c.saturating_sub(1);
        }
    }

    /// Pushes a return address (fetch saw a call).
    ///
    /// A full stack overwrites its top entry, keeping the most recent call.
    pub fn ras_push(&mut self, ret: VirtAddr) {
        if self.ras_ptr < self.ras_cap {
            self.ras[self.ras_ptr] = ret;
            self.ras_ptr += 1;
        } else {
            self.ras[self.ras_cap - 1] = ret;
        }
    }

    /// Pops the predicted return target (fetch saw a return).
    pub fn ras_pop(&mut self) -> Option<VirtAddr> {
        if self.ras_ptr == 0 {
            None
        } else {
            self.ras_ptr -= 1;
            Some(self.ras[self.ras_ptr])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_learn_direction() {
        let mut bp = BranchPredictor::new(16, 4);
        let pc = VirtAddr(0x100);
        // Starts weakly taken.
        assert!(bp.predict(pc));
        // Two not-taken outcomes flip it.
        bp.update(pc, false, true);
        bp.update(pc, false, false);
        assert!(!bp.predict(pc));
        // Hysteresis: one taken outcome does not flip back.
        bp.update(pc, true, true);
        assert!(!bp.predict(pc));
        bp.update(pc, true, false);
        assert!(bp.predict(pc));
    }

    #[test]
    fn test_ras_lifo() {
        let mut bp = BranchPredictor::new(16, 2);
        bp.ras_push(VirtAddr(0x10));
        bp.ras_push(VirtAddr(0x20));
        assert_eq!(bp.ras_pop(), Some(VirtAddr(0x20)));
        assert_eq!(bp.ras_pop(), Some(VirtAddr(0x10)));
        assert_eq!(bp.ras_pop(), None);
    }

    #[test]
    fn test_ras_overflow_keeps_recent() {
        let mut bp = BranchPredictor::new(16, 2);
        bp.ras_push(VirtAddr(0x10));
        bp.ras_push(VirtAddr(0x20));
        bp.ras_push(VirtAddr(0x30)); // overwrites the top
        assert_eq!(bp.ras_pop(), Some(VirtAddr(0x30)));
        assert_eq!(bp.ras_pop(), Some(VirtAddr(0x10)));
    }

    #[test]
    fn test_mispredict_counting() {
        let mut bp = BranchPredictor::new(4, 2);
        bp.update(VirtAddr(0), true, true);
        bp.update(VirtAddr(0), true, false);
        assert_eq!(bp.mispredicts, 1);
    }
}
