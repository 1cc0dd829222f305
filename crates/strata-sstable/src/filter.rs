use std::sync::Arc;


/// A policy for condensing a set of keys into a small filter which can cheaply report whether a
/// key might be in the set.
pub trait FilterPolicy {
    /// The policy's persistent name, recorded in the table's metaindex block. The name must
    /// change whenever the filter encoding changes incompatibly.
    #[must_use]
    fn name(&self) -> &'static str;

    /// Append a filter for the given keys to `filter`, without touching its existing contents.
    ///
    /// Each element of `key_offsets` is the index of the start of one key in `flattened_keys`;
    /// the final key extends to the end of `flattened_keys`.
    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>);

    /// Return `true` if `key` may have been among the keys the `filter` was generated from.
    ///
    /// False positives are permitted, false negatives never.
    #[must_use]
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

impl<Policy: FilterPolicy + ?Sized> FilterPolicy for Arc<Policy> {
    #[inline]
    fn name(&self) -> &'static str {
        (**self).name()
    }

    #[inline]
    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>) {
        (**self).create_filter(flattened_keys, key_offsets, filter);
    }

    #[inline]
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        (**self).key_may_match(key, filter)
    }
}

/// LevelDB-compatible hash function for Bloom filters.
fn bloom_hash(data: &[u8]) -> u32 {
    let seed:       u32 = 0x_bc9f_1d34;
    let multiplier: u32 = 0x_c6a4_a793;

    let mut hash: u32 = seed ^ (data.len() as u32).wrapping_mul(multiplier);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes(chunk.try_into().expect("chunks are 4 bytes"));
        hash = hash.wrapping_add(word).wrapping_mul(multiplier);
        hash ^= hash >> 16_u8;
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        for (index, &byte) in remainder.iter().enumerate() {
            hash = hash.wrapping_add(u32::from(byte) << (8 * index));
        }
        hash = hash.wrapping_mul(multiplier);
        // Not a typo: the tail mixes with a 24-bit shift where the word loop uses 16.
        hash ^= hash >> 24_u8;
    }

    hash
}

/// A Bloom filter policy, bit-compatible with LevelDB's built-in one.
#[derive(Debug, Clone, Copy)]
pub struct BloomFilterPolicy {
    bits_per_key:       u8,
    /// Also known as `k`.
    num_hash_functions: u8,
}

impl BloomFilterPolicy {
    /// `bits_per_key` is the number of filter bits to use per key; 10 bits per key gives a false
    /// positive rate just under 1%. The derived hash-function count is clamped to `1..=30`
    /// (tag values above 30 are reserved for future filter encodings).
    #[must_use]
    pub fn new(bits_per_key: u8) -> Self {
        let num_hash_functions = (f32::from(bits_per_key) * std::f32::consts::LN_2) as u8;

        Self {
            bits_per_key,
            num_hash_functions: num_hash_functions.clamp(1, 30),
        }
    }

    #[must_use]
    pub const fn bits_per_key(&self) -> u8 {
        self.bits_per_key
    }
}

impl Default for BloomFilterPolicy {
    /// 10 bits per key, for an error rate just under 1%.
    fn default() -> Self {
        Self::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "leveldb.BuiltinBloomFilter2"
    }

    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>) {
        let unadjusted_num_filter_bits = key_offsets.len() * usize::from(self.bits_per_key);

        // Enforce a minimum of 64 filter bits; tiny filters have terrible false-positive rates.
        let num_filter_bytes = if unadjusted_num_filter_bits < 64 {
            8
        } else {
            unadjusted_num_filter_bits.div_ceil(8)
        };
        let num_filter_bits = (num_filter_bytes * 8) as u32;

        let old_filter_len = filter.len();
        filter.reserve(num_filter_bytes + 1);
        filter.resize(old_filter_len + num_filter_bytes, 0);
        // The probe count is recorded after the bits, for `key_may_match`.
        filter.push(self.num_hash_functions);

        let filter_bits = &mut filter[old_filter_len..old_filter_len + num_filter_bytes];

        let mut key_offsets_iter = key_offsets.iter().peekable();
        while let Some(&key_offset) = key_offsets_iter.next() {
            let upper_bound = key_offsets_iter
                .peek()
                .map(|&&next_offset| next_offset)
                .unwrap_or(flattened_keys.len());
            let key = &flattened_keys[key_offset..upper_bound];

            let mut hash = bloom_hash(key);
            let delta = hash.rotate_right(17);
            for _ in 0..self.num_hash_functions {
                let bit_to_set = (hash % num_filter_bits) as usize;
                filter_bits[bit_to_set / 8] |= 1 << (bit_to_set % 8);
                hash = hash.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            // Too short to carry any key data; there were no keys.
            return false;
        }

        let num_hash_functions = *filter.last().expect("filter is nonempty");
        if num_hash_functions > 30 {
            // Possibly a future filter encoding we don't know; err towards matching.
            return true;
        }

        let num_filter_bits = (filter.len() - 1) as u32 * 8;

        let mut hash = bloom_hash(key);
        let delta = hash.rotate_right(17);
        for _ in 0..num_hash_functions {
            let bit_to_test = (hash % num_filter_bits) as usize;
            if filter[bit_to_test / 8] & (1 << (bit_to_test % 8)) == 0 {
                return false;
            }
            hash = hash.wrapping_add(delta);
        }

        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    fn build_filter(policy: &BloomFilterPolicy, keys: &[&[u8]]) -> Vec<u8> {
        let mut flattened = Vec::new();
        let mut offsets = Vec::new();
        for key in keys {
            offsets.push(flattened.len());
            flattened.extend(*key);
        }

        let mut filter = Vec::new();
        policy.create_filter(&flattened, &offsets, &mut filter);
        filter
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let policy = BloomFilterPolicy::default();
        assert!(!policy.key_may_match(b"anything", &[]));
    }

    #[test]
    fn added_keys_always_match() {
        let policy = BloomFilterPolicy::default();
        let keys: Vec<Vec<u8>> = (0..1_000_u32).map(|key| key.to_le_bytes().to_vec()).collect();
        let key_refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let filter = build_filter(&policy, &key_refs);

        for key in &keys {
            assert!(policy.key_may_match(key, &filter));
        }
    }

    #[test]
    fn false_positive_rate_is_low() {
        let policy = BloomFilterPolicy::default();
        let keys: Vec<Vec<u8>> = (0..10_000_u32).map(|key| key.to_le_bytes().to_vec()).collect();
        let key_refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let filter = build_filter(&policy, &key_refs);

        let mut false_positives = 0_u32;
        for key in 10_000..20_000_u32 {
            if policy.key_may_match(&key.to_le_bytes(), &filter) {
                false_positives += 1;
            }
        }
        // 10 bits per key should give just under 1%; 2% is a generous bound.
        assert!(false_positives < 200, "false positive count: {false_positives}");
    }

    #[test]
    fn hash_probe_count_is_clamped() {
        assert_eq!(BloomFilterPolicy::new(1).num_hash_functions, 1);
        assert_eq!(BloomFilterPolicy::new(100).num_hash_functions, 30);
    }
}
