use bit_vec::BitVec;
use seahash::hash;

/// Probabilistic membership over vector ids. Lets `get` skip the catalog
/// lock for ids that were never written.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: BitVec,
    num_hashes: u32,
    inserted: usize,
}

impl BloomFilter {
    /// expected_items: How many ids you plan to store.
    /// false_positive_rate: Acceptable error rate (e.g., 0.01 for 1%).
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);

        // m = -(n * ln(p)) / (ln(2)^2)
        let ln2 = 2.0f64.ln();
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(8.0);

        // k = (m / n) * ln(2)
        let k = ((m / n) * ln2).ceil().max(1.0);

        Self {
            bits: BitVec::from_elem(m as usize, false),
            num_hashes: k as u32,
            inserted: 0,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        let m = self.bits.len() as u64;

        for i in 0..self.num_hashes {
            // Double Hashing: g(x) = h1(x) + i * h2(x)
            let idx = h1.wrapping_add((i as u64).wrapping_mul(h2)) % m;
            self.bits.set(idx as usize, true);
        }
        self.inserted += 1;
    }

    /// FALSE means definitely absent. TRUE means it MIGHT be present.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        let m = self.bits.len() as u64;

        (0..self.num_hashes).all(|i| {
            let idx = h1.wrapping_add((i as u64).wrapping_mul(h2)) % m;
            self.bits.get(idx as usize).unwrap_or(false)
        })
    }

    pub fn clear(&mut self) {
        self.bits.clear();
        self.inserted = 0;
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let h1 = hash(key);
        // Golden ratio tweak gives a second hash without rehashing the key
        let h2 = h1.wrapping_add(0x9E37_79B9_7F4A_7C15);
        (h1, h2)
    }
}
