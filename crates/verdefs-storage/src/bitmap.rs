//! Word-packed allocation bitmap with a next-free hint.
//!
//! One bit per block/inode. The hint is scanned forward and wraps once, which
//! makes allocation amortized O(1) under typical fragmentation. Worst case is
//! O(n) when the map is nearly full; that degradation is expected and callers
//! should not assume otherwise.

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

const WORD_BITS: u64 = 64;

/// Allocation bitmap: one bit per slot, packed into u64 words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    words: Vec<u64>,
    bits: u64,
    hint: u64,
    set_count: u64,
}

impl Bitmap {
    /// Creates a bitmap with `bits` slots, all clear.
    pub fn new(bits: u64) -> Self {
        let word_count = bits.div_ceil(WORD_BITS) as usize;
        Self {
            words: vec![0; word_count],
            bits,
            hint: 0,
            set_count: 0,
        }
    }

    /// Number of slots in this bitmap.
    pub fn len(&self) -> u64 {
        self.bits
    }

    /// True if the bitmap has zero slots.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of set (allocated) slots.
    pub fn set_count(&self) -> u64 {
        self.set_count
    }

    /// Number of clear (free) slots.
    pub fn free_count(&self) -> u64 {
        self.bits - self.set_count
    }

    /// Returns the bit at `idx`.
    pub fn get(&self, idx: u64) -> StorageResult<bool> {
        self.check_range(idx)?;
        Ok(self.words[(idx / WORD_BITS) as usize] & (1u64 << (idx % WORD_BITS)) != 0)
    }

    /// Sets the bit at `idx`. Setting an already-set bit is a bookkeeping
    /// error and fails loudly rather than silently corrupting the map.
    pub fn set(&mut self, idx: u64) -> StorageResult<()> {
        self.check_range(idx)?;
        let word = (idx / WORD_BITS) as usize;
        let mask = 1u64 << (idx % WORD_BITS);
        if self.words[word] & mask != 0 {
            return Err(StorageError::invariant(format!(
                "bit {} already set",
                idx
            )));
        }
        self.words[word] |= mask;
        self.set_count += 1;
        Ok(())
    }

    /// Clears the bit at `idx`. Clearing an already-clear bit fails loudly.
    pub fn clear(&mut self, idx: u64) -> StorageResult<()> {
        self.check_range(idx)?;
        let word = (idx / WORD_BITS) as usize;
        let mask = 1u64 << (idx % WORD_BITS);
        if self.words[word] & mask == 0 {
            return Err(StorageError::invariant(format!(
                "bit {} already clear",
                idx
            )));
        }
        self.words[word] &= !mask;
        self.set_count -= 1;
        Ok(())
    }

    /// Finds and sets the first clear bit, scanning forward from the hint and
    /// wrapping once. Advances the hint past the allocated index.
    /// Returns `None` when every bit is set.
    pub fn allocate(&mut self) -> Option<u64> {
        let idx = self
            .scan_clear(self.hint, self.bits)
            .or_else(|| self.scan_clear(0, self.hint))?;
        let word = (idx / WORD_BITS) as usize;
        self.words[word] |= 1u64 << (idx % WORD_BITS);
        self.set_count += 1;
        self.hint = if idx + 1 >= self.bits { 0 } else { idx + 1 };
        Some(idx)
    }

    /// Scans `[from, to)` for the first clear bit, word at a time.
    fn scan_clear(&self, from: u64, to: u64) -> Option<u64> {
        if from >= to {
            return None;
        }
        let mut idx = from;
        while idx < to {
            let word = self.words[(idx / WORD_BITS) as usize];
            let bit_in_word = idx % WORD_BITS;
            // Mask off bits below the scan position, then find the lowest zero.
            let masked = word | ((1u64 << bit_in_word) - 1);
            if masked != u64::MAX {
                let found = (idx - bit_in_word) + masked.trailing_ones() as u64;
                if found < to {
                    return Some(found);
                }
                return None;
            }
            idx = (idx - bit_in_word) + WORD_BITS;
        }
        None
    }

    fn check_range(&self, idx: u64) -> StorageResult<()> {
        if idx >= self.bits {
            return Err(StorageError::invariant(format!(
                "bit index {} out of range ({} bits)",
                idx, self.bits
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bitmap_all_clear() {
        let bm = Bitmap::new(100);
        assert_eq!(bm.len(), 100);
        assert_eq!(bm.set_count(), 0);
        assert_eq!(bm.free_count(), 100);
        for i in 0..100 {
            assert!(!bm.get(i).unwrap());
        }
    }

    #[test]
    fn test_set_clear_roundtrip() {
        let mut bm = Bitmap::new(128);
        bm.set(5).unwrap();
        assert!(bm.get(5).unwrap());
        assert_eq!(bm.set_count(), 1);
        bm.clear(5).unwrap();
        assert!(!bm.get(5).unwrap());
        assert_eq!(bm.set_count(), 0);
    }

    #[test]
    fn test_double_set_fails() {
        let mut bm = Bitmap::new(64);
        bm.set(3).unwrap();
        assert!(matches!(
            bm.set(3),
            Err(StorageError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_double_clear_fails() {
        let mut bm = Bitmap::new(64);
        assert!(matches!(
            bm.clear(3),
            Err(StorageError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_out_of_range() {
        let mut bm = Bitmap::new(64);
        assert!(bm.get(64).is_err());
        assert!(bm.set(1000).is_err());
    }

    #[test]
    fn test_allocate_sequential() {
        let mut bm = Bitmap::new(10);
        for expect in 0..10 {
            assert_eq!(bm.allocate(), Some(expect));
        }
        assert_eq!(bm.allocate(), None);
        assert_eq!(bm.set_count(), 10);
    }

    #[test]
    fn test_allocate_wraps_past_hint() {
        let mut bm = Bitmap::new(8);
        for _ in 0..8 {
            bm.allocate();
        }
        bm.clear(2).unwrap();
        // Hint wrapped to 0 after exhausting; the freed bit is found again.
        assert_eq!(bm.allocate(), Some(2));
        assert_eq!(bm.allocate(), None);
    }

    #[test]
    fn test_allocate_skips_full_words() {
        let mut bm = Bitmap::new(200);
        for i in 0..130 {
            bm.set(i).unwrap();
        }
        assert_eq!(bm.allocate(), Some(130));
    }

    #[test]
    fn test_hint_advances() {
        let mut bm = Bitmap::new(16);
        assert_eq!(bm.allocate(), Some(0));
        bm.clear(0).unwrap();
        // Hint is past 0, so the next allocation comes from the hint, not 0.
        assert_eq!(bm.allocate(), Some(1));
    }

    #[test]
    fn test_partial_last_word() {
        let mut bm = Bitmap::new(65);
        for i in 0..65 {
            assert_eq!(bm.allocate(), Some(i));
        }
        assert_eq!(bm.allocate(), None);
        bm.clear(64).unwrap();
        assert_eq!(bm.allocate(), Some(64));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut bm = Bitmap::new(100);
        bm.allocate();
        bm.allocate();
        bm.clear(0).unwrap();
        let encoded = bincode::serialize(&bm).unwrap();
        let decoded: Bitmap = bincode::deserialize(&encoded).unwrap();
        assert_eq!(bm, decoded);
    }
}
