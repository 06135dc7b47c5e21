//! Bloom-filter gate in front of the frequency sketch.
//!
//! The first sighting of a key is recorded here and **not** in the sketch;
//! only the second and later sightings increment sketch counters.  One-hit
//! wonders — the majority of keys in most workloads — therefore never
//! consume the sketch's limited counter range.
//!
//! The doorkeeper is cleared whenever the sketch ages, so "seen before"
//! stays consistent with the halved counters.

/// Bloom filter seeds, one per probe.
const SEEDS: [u64; 4] = [
    0x8E51_AFB5_C95A_1B01,
    0x6C62_272E_07BB_0142,
    0xD6E8_FEB8_6659_FD93,
    0xA3B1_9535_4A39_B70D,
];

/// A k=4 Bloom filter sized at ~10 bits per expected item (≈1 % false
/// positive rate).
pub struct Doorkeeper {
    words: Vec<u64>,
    /// Total bits; always a power of two.
    bit_mask: usize,
}

impl Doorkeeper {
    pub fn new(expected_items: usize) -> Self {
        let bits = (expected_items.saturating_mul(10))
            .next_power_of_two()
            .max(64);
        Doorkeeper {
            words: vec![0u64; bits / 64],
            bit_mask: bits - 1,
        }
    }

    /// `true` if `h` is (probably) already recorded.  False positives are
    /// possible; false negatives are not.
    #[inline]
    pub fn contains(&self, h: u64) -> bool {
        SEEDS.iter().all(|&seed| {
            let bit = self.bit_index(h, seed);
            (self.words[bit >> 6] >> (bit & 63)) & 1 == 1
        })
    }

    /// Records `h`; returns `true` when it was **already present**, which
    /// is the signal that the sketch should now be incremented.
    #[inline]
    pub fn insert(&mut self, h: u64) -> bool {
        let already = self.contains(h);
        if !already {
            for &seed in &SEEDS {
                let bit = self.bit_index(h, seed);
                self.words[bit >> 6] |= 1u64 << (bit & 63);
            }
        }
        already
    }

    /// Empties the filter.  Called when the sketch ages.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    #[inline]
    fn bit_index(&self, h: u64, seed: u64) -> usize {
        (h.wrapping_mul(seed) >> 32) as usize & self.bit_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_returns_false() {
        let mut dk = Doorkeeper::new(128);
        assert!(!dk.insert(42));
    }

    #[test]
    fn second_insert_returns_true() {
        let mut dk = Doorkeeper::new(128);
        dk.insert(42);
        assert!(dk.insert(42));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut dk = Doorkeeper::new(128);
        for i in 0..50u64 {
            dk.insert(i);
        }
        dk.clear();
        for i in 0..50u64 {
            assert!(!dk.contains(i), "key {i} should be gone after clear");
        }
    }

    #[test]
    fn false_positive_rate_stays_low() {
        // 100 inserted keys, 10 000 probes of absent keys.  Theoretical FPR
        // at 10 bits/item with k=4 is under 1 %; allow 5× slack.
        let mut dk = Doorkeeper::new(100);
        for i in 0..100u64 {
            dk.insert(i);
        }
        let fp = (1_000..11_000u64).filter(|&h| dk.contains(h)).count();
        assert!(fp < 500, "false positive count {fp} too high");
    }
}
