//! Atomic extent bitmap
//!
//! One bit per extent; a set bit means the extent is allocated. The
//! test-and-set on a word is the single source of truth for ownership, so two
//! concurrent claims can never return the same bit.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const WORD_BITS: usize = 64;

/// Fixed-size atomic bitset with a rotating allocation cursor
#[derive(Debug)]
pub struct ExtentBitmap {
    words: Box<[AtomicU64]>,
    nbits: usize,
    cursor: AtomicUsize,
}

impl ExtentBitmap {
    pub fn new(nbits: usize) -> Self {
        let words = (0..nbits.div_ceil(WORD_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words,
            nbits,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    #[inline]
    fn locate(bit: usize) -> (usize, u64) {
        (bit / WORD_BITS, 1u64 << (bit % WORD_BITS))
    }

    pub fn test(&self, bit: usize) -> bool {
        let (word, mask) = Self::locate(bit);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Set `bit`, returning its previous value
    pub fn test_and_set(&self, bit: usize) -> bool {
        let (word, mask) = Self::locate(bit);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clear `bit`, returning its previous value
    pub fn test_and_clear(&self, bit: usize) -> bool {
        let (word, mask) = Self::locate(bit);
        self.words[word].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// First clear bit in `[from, nbits)`
    pub fn find_next_zero(&self, from: usize) -> Option<usize> {
        let mut bit = from;
        while bit < self.nbits {
            let (word, _) = Self::locate(bit);
            let shift = bit % WORD_BITS;
            // Bits below `shift` were already scanned; treat them as set.
            let free = !self.words[word].load(Ordering::Acquire) & (u64::MAX << shift);
            if free != 0 {
                let found = word * WORD_BITS + free.trailing_zeros() as usize;
                return (found < self.nbits).then_some(found);
            }
            bit = (word + 1) * WORD_BITS;
        }
        None
    }

    /// Claim a clear bit, scanning `[cursor, nbits)` first and then `[0, nbits)`
    ///
    /// Returns `None` when every bit is set. Losing a race on a bit just moves
    /// the scan forward.
    pub fn claim(&self) -> Option<usize> {
        let start = self.cursor.load(Ordering::Relaxed).min(self.nbits);
        let bit = self
            .claim_from(start)
            .or_else(|| if start == 0 { None } else { self.claim_from(0) })?;
        self.cursor.store(bit, Ordering::Relaxed);
        Some(bit)
    }

    fn claim_from(&self, mut from: usize) -> Option<usize> {
        while let Some(bit) = self.find_next_zero(from) {
            if !self.test_and_set(bit) {
                return Some(bit);
            }
            from = bit + 1;
        }
        None
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Population count
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}
