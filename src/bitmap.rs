use core::fmt;

use crate::geometry::{BITMAP_WORDS, TRAMP_COUNT};

/// Occupancy of the slots in one heap page, one bit per slot.
///
/// Bits past `TRAMP_COUNT` in the last word are permanently set, so a full
/// word always means "no free slot here".
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    words: [u32; BITMAP_WORDS],
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    pub const fn new() -> Self {
        let mut words = [0u32; BITMAP_WORDS];
        let tail = TRAMP_COUNT % 32;
        if tail != 0 {
            words[BITMAP_WORDS - 1] = !0u32 << tail;
        }
        SlotBitmap { words }
    }

    fn split(slot: usize) -> (usize, u32) {
        (slot / 32, 1u32 << (slot % 32))
    }

    pub fn is_set(&self, slot: usize) -> bool {
        let (word, mask) = Self::split(slot);
        self.words[word] & mask != 0
    }

    /// Claim a free slot, trying `hint` first.
    ///
    /// On collision the words are scanned from `hint`'s word onward, wrapping
    /// around, and the lowest clear bit of the first non-full word is taken.
    ///
    /// Panics if every slot is taken.
    pub fn claim(&mut self, hint: usize) -> usize {
        let (mut word, mut mask) = Self::split(hint);

        if self.words[word] & mask != 0 {
            let start = word;
            while self.words[word] == !0u32 {
                word = (word + 1) % BITMAP_WORDS;
                assert_ne!(word, start, "claiming a slot in a full page");
            }
            mask = 1u32 << self.words[word].trailing_ones();
        }

        self.words[word] |= mask;
        word * 32 + mask.trailing_zeros() as usize
    }

    /// Mark `slot` free again. Panics if it was not occupied.
    pub fn release(&mut self, slot: usize) {
        let (word, mask) = Self::split(slot);
        assert!(
            self.words[word] & mask != 0,
            "releasing free trampoline slot {}",
            slot
        );
        self.words[word] &= !mask;
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        let padding = BITMAP_WORDS * 32 - TRAMP_COUNT;
        self.words
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum::<usize>()
            - padding
    }
}

impl fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotBitmap(")?;
        for (i, w) in self.words.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "{:08x}", w)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn hint_is_taken_when_free() {
        let mut bits = SlotBitmap::new();
        assert_eq!(bits.claim(5), 5);
        assert_eq!(bits.claim(0), 0);
        assert_eq!(bits.count(), 2);
    }

    #[test]
    fn collision_takes_lowest_clear_bit_of_the_hint_word() {
        let mut bits = SlotBitmap::new();
        for slot in 0..3 {
            assert_eq!(bits.claim(slot), slot);
        }
        // Slot 1 is taken, so the scan starts at word 0 and finds slot 3.
        assert_eq!(bits.claim(1), 3);
    }

    #[test]
    fn scan_wraps_around() {
        let mut bits = SlotBitmap::new();
        for slot in 0..TRAMP_COUNT {
            bits.claim(slot);
        }
        bits.release(2);
        // Start in the last word, which is full, and wrap to find slot 2.
        assert_eq!(bits.claim(TRAMP_COUNT - 1), 2);
        assert_eq!(bits.count(), TRAMP_COUNT);
    }

    #[test]
    fn released_slots_are_reused() {
        let mut bits = SlotBitmap::new();
        for slot in 0..64usize.min(TRAMP_COUNT) {
            bits.claim(slot);
        }
        bits.release(40);
        bits.release(10);
        assert!(!bits.is_set(10));
        assert_eq!(bits.claim(40), 40);
        // Slot 20 is still taken, and slot 10 is the only hole in its word.
        assert_eq!(bits.claim(20), 10);
    }

    #[test]
    #[should_panic(expected = "releasing free trampoline slot")]
    fn double_release_panics() {
        let mut bits = SlotBitmap::new();
        bits.claim(0);
        bits.release(0);
        bits.release(0);
    }
}
