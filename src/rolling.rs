//! Seeded rolling weak checksum.
//!
//! Each byte is first mapped through a 256-entry substitution table derived
//! from a seed, then folded into two 16-bit sums: `low` is the sum of the
//! substituted bytes, `high` the sum of the running `low` values. Two
//! instances with different seeds hash the same window independently, which
//! is what duplicate-checksum mode relies on.

/// Seed of the primary checksum.
pub const PRIMARY_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Seed of the secondary checksum used in duplicate-checksum mode.
pub const SECONDARY_SEED: u64 = 0xd1b5_4a32_d192_ed03;

/// Rolling checksum over a fixed-size window of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeakChecksum {
    seed: u64,
    table: [u16; 256],
}

impl WeakChecksum {
    /// Creates a checksum whose substitution table is derived from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            table: substitution_table(seed),
        }
    }

    /// Returns the seed this checksum was built from.
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Computes the checksum of `window` from scratch.
    #[inline]
    pub fn compute(&self, window: &[u8]) -> u32 {
        let mut low = 0u32;
        let mut high = 0u32;
        for &byte in window {
            low = low.wrapping_add(u32::from(self.table[byte as usize]));
            high = high.wrapping_add(low);
        }
        ((high & 0xffff) << 16) | (low & 0xffff)
    }

    /// Slides a window of `window_len` bytes forward by one.
    ///
    /// `outgoing` is the byte leaving the front of the window and `incoming`
    /// the byte entering at the back.
    #[inline]
    pub fn roll(&self, hash: u32, outgoing: u8, incoming: u8, window_len: usize) -> u32 {
        let old = u32::from(self.table[outgoing as usize]);
        let new = u32::from(self.table[incoming as usize]);

        let low = (hash & 0xffff).wrapping_sub(old).wrapping_add(new) & 0xffff;
        let high = (hash >> 16)
            .wrapping_sub(old.wrapping_mul(window_len as u32))
            .wrapping_add(low)
            & 0xffff;

        (high << 16) | low
    }
}

impl Default for WeakChecksum {
    fn default() -> Self {
        Self::new(PRIMARY_SEED)
    }
}

/// Derives the substitution table with splitmix64.
fn substitution_table(seed: u64) -> [u16; 256] {
    let mut state = seed;
    let mut table = [0u16; 256];
    for slot in table.iter_mut() {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        *slot = (z >> 48) as u16;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_matches_fresh_compute() {
        let checksum = WeakChecksum::default();
        let data = b"The quick brown fox jumps over the lazy dog";
        let window = 16;

        let mut hash = checksum.compute(&data[..window]);
        for start in 1..=data.len() - window {
            hash = checksum.roll(hash, data[start - 1], data[start + window - 1], window);
            assert_eq!(hash, checksum.compute(&data[start..start + window]));
        }
    }

    #[test]
    fn test_roll_single_byte_window() {
        let checksum = WeakChecksum::new(7);
        let hash = checksum.compute(b"a");
        assert_eq!(checksum.roll(hash, b'a', b'b', 1), checksum.compute(b"b"));
    }

    #[test]
    fn test_seeds_produce_independent_tables() {
        let primary = WeakChecksum::new(PRIMARY_SEED);
        let secondary = WeakChecksum::new(SECONDARY_SEED);
        assert_ne!(primary, secondary);
        assert_ne!(
            primary.compute(b"0123456789abcdef"),
            secondary.compute(b"0123456789abcdef")
        );
        assert_eq!(WeakChecksum::new(PRIMARY_SEED), primary);
    }

    #[test]
    fn test_empty_window_is_zero() {
        assert_eq!(WeakChecksum::default().compute(&[]), 0);
    }
}
