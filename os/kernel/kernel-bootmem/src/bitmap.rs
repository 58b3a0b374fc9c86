//! One bit per page frame, 1 = reserved.

const WORD_BITS: usize = u64::BITS as usize;

/// A bit vector over borrowed words, usually living in the physical memory it
/// describes.
///
/// Bits past [`len`](Self::len) in the last word are never reported.
pub struct PageBitmap<'m> {
    words: &'m mut [u64],
    bits: usize,
}

impl<'m> PageBitmap<'m> {
    /// Wrap `words` as a bitmap of `bits` bits. Contents are left as they are.
    ///
    /// # Panics
    /// If `words` holds fewer than `bits` bits.
    #[must_use]
    pub fn new(words: &'m mut [u64], bits: usize) -> Self {
        assert!(
            words.len() * WORD_BITS >= bits,
            "{} words cannot hold {bits} bits",
            words.len()
        );
        Self { words, bits }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Mark every bit reserved.
    pub fn fill(&mut self) {
        self.words.fill(u64::MAX);
    }

    #[inline]
    const fn locate(idx: usize) -> (usize, u64) {
        (idx / WORD_BITS, 1 << (idx % WORD_BITS))
    }

    #[inline]
    fn check(&self, idx: usize) {
        assert!(
            idx < self.bits,
            "bit {idx} out of range (len {})",
            self.bits
        );
    }

    #[must_use]
    pub fn test(&self, idx: usize) -> bool {
        self.check(idx);
        let (w, mask) = Self::locate(idx);
        self.words[w] & mask != 0
    }

    /// Set bit `idx`, returning its previous value.
    pub fn test_and_set(&mut self, idx: usize) -> bool {
        self.check(idx);
        let (w, mask) = Self::locate(idx);
        let old = self.words[w] & mask != 0;
        self.words[w] |= mask;
        old
    }

    /// Clear bit `idx`, returning its previous value.
    pub fn test_and_clear(&mut self, idx: usize) -> bool {
        self.check(idx);
        let (w, mask) = Self::locate(idx);
        let old = self.words[w] & mask != 0;
        self.words[w] &= !mask;
        old
    }

    fn find_next(&self, from: usize, end: usize, set: bool) -> usize {
        let end = end.min(self.bits);
        let mut idx = from;
        while idx < end {
            let w = idx / WORD_BITS;
            let raw = if set { self.words[w] } else { !self.words[w] };
            let word = raw & (u64::MAX << (idx % WORD_BITS));
            if word != 0 {
                return (w * WORD_BITS + word.trailing_zeros() as usize).min(end);
            }
            idx = (w + 1) * WORD_BITS;
        }
        end
    }

    /// First clear bit in `[from, end)`, or `end` if there is none.
    #[must_use]
    pub fn find_next_zero(&self, from: usize, end: usize) -> usize {
        self.find_next(from, end, false)
    }

    /// First set bit in `[from, end)`, or `end` if there is none.
    #[must_use]
    pub fn find_next_set(&self, from: usize, end: usize) -> usize {
        self.find_next(from, end, true)
    }

    /// First set bit in `[from, end)`, if any.
    #[must_use]
    pub fn first_set_in(&self, from: usize, end: usize) -> Option<usize> {
        let idx = self.find_next_set(from, end);
        (idx < end.min(self.bits)).then_some(idx)
    }

    /// Runs of clear bits as `[start, end)` index pairs, ascending.
    pub fn zero_runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut pos = 0;
        core::iter::from_fn(move || {
            let start = self.find_next_zero(pos, self.bits);
            if start >= self.bits {
                return None;
            }
            let end = self.find_next_set(start, self.bits);
            pos = end;
            Some((start, end))
        })
    }

    /// Number of clear bits.
    #[must_use]
    pub fn count_zeros(&self) -> usize {
        self.zero_runs().map(|(s, e)| e - s).sum()
    }
}

impl core::fmt::Debug for PageBitmap<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageBitmap")
            .field("bits", &self.bits)
            .field("free", &self.count_zeros())
            .finish()
    }
}
