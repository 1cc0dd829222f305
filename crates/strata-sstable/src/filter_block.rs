use crate::filter::FilterPolicy;


/// Generate a new filter once every `1 << FILTER_BASE_LG` bytes of data-block output.
const FILTER_BASE_LG: u8    = 11;
const FILTER_BASE:    usize = 1 << FILTER_BASE_LG;


/// Builds the filter block of a table.
///
/// The block holds one filter per [`FILTER_BASE`]-byte range of data-block offsets, followed by
/// a `u32` offset per filter, the `u32` offset of that offset array, and the base-lg byte.
#[derive(Debug)]
pub(crate) struct FilterBlockBuilder<Policy> {
    policy:         Policy,
    /// All keys added since the last generated filter, flattened.
    flattened_keys: Vec<u8>,
    /// Start of each key in `flattened_keys`.
    key_offsets:    Vec<usize>,
    filter_data:    Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl<Policy: FilterPolicy> FilterBlockBuilder<Policy> {
    #[must_use]
    pub(crate) fn new(policy: Policy) -> Self {
        Self {
            policy,
            flattened_keys: Vec::new(),
            key_offsets:    Vec::new(),
            filter_data:    Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Announce that a data block begins at `block_offset` in the table file.
    ///
    /// Must be called with non-decreasing offsets, interleaved with [`Self::add_key`] calls for
    /// the keys of each block.
    pub(crate) fn start_block(&mut self, block_offset: u64) {
        let filter_index = usize::try_from(block_offset).unwrap_or(usize::MAX) / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len());

        while filter_index > self.filter_offsets.len() {
            self.generate_filter();
        }
    }

    pub(crate) fn add_key(&mut self, key: &[u8]) {
        self.key_offsets.push(self.flattened_keys.len());
        self.flattened_keys.extend(key);
    }

    /// An estimate of the encoded filter block length if [`Self::finish`] were called now.
    #[must_use]
    pub(crate) fn finished_length(&self) -> usize {
        self.filter_data.len() + 4 * (self.filter_offsets.len() + 1) + 1
    }

    /// Finish the filter block and return its contents. No other method may be called afterward.
    #[must_use]
    pub(crate) fn finish(&mut self) -> &[u8] {
        if !self.key_offsets.is_empty() {
            self.generate_filter();
        }

        let array_offset = u32::try_from(self.filter_data.len())
            .expect("filter block exceeded 4 GiB");
        for &filter_offset in &self.filter_offsets {
            self.filter_data.extend(filter_offset.to_le_bytes());
        }
        self.filter_data.extend(array_offset.to_le_bytes());
        self.filter_data.push(FILTER_BASE_LG);

        &self.filter_data
    }

    fn generate_filter(&mut self) {
        let filter_offset = u32::try_from(self.filter_data.len())
            .expect("filter block exceeded 4 GiB");
        self.filter_offsets.push(filter_offset);

        if self.key_offsets.is_empty() {
            // No keys for this range; the empty filter matches nothing.
            return;
        }

        self.policy
            .create_filter(&self.flattened_keys, &self.key_offsets, &mut self.filter_data);
        self.flattened_keys.clear();
        self.key_offsets.clear();
    }
}

/// Reads the filter block of a table.
///
/// Malformed filter blocks are tolerated by treating every query as a possible match.
#[derive(Debug)]
pub(crate) struct FilterBlockReader<Policy> {
    policy:        Policy,
    contents:      Vec<u8>,
    base_lg:       u8,
    /// Byte index of the offset array within `contents`.
    offsets_start: usize,
    num_filters:   usize,
}

impl<Policy: FilterPolicy> FilterBlockReader<Policy> {
    #[must_use]
    pub(crate) fn new(policy: Policy, contents: Vec<u8>) -> Self {
        let mut reader = Self {
            policy,
            contents,
            base_lg:       0,
            offsets_start: 0,
            num_filters:   0,
        };

        let len = reader.contents.len();
        if len < 5 {
            return reader;
        }

        let base_lg = reader.contents[len - 1];
        let array_offset_bytes: [u8; 4] = reader.contents[len - 5..len - 1]
            .try_into()
            .expect("slice is 4 bytes");
        let offsets_start = u32::from_le_bytes(array_offset_bytes) as usize;
        if offsets_start > len - 5 {
            return reader;
        }

        reader.base_lg = base_lg;
        reader.offsets_start = offsets_start;
        reader.num_filters = (len - 5 - offsets_start) / 4;
        reader
    }

    #[must_use]
    pub(crate) fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let filter_index = (block_offset >> self.base_lg) as usize;
        if filter_index >= self.num_filters {
            // Out of range; err towards a match.
            return true;
        }

        let start = self.read_offset(filter_index);
        // For the final filter, this reads the array-offset word, which equals the end of the
        // filter data.
        let limit = self.read_offset(filter_index + 1);

        if start <= limit && limit <= self.offsets_start {
            let filter = &self.contents[start..limit];
            self.policy.key_may_match(key, filter)
        } else {
            // Corrupt offsets; err towards a match.
            true
        }
    }

    fn read_offset(&self, index: usize) -> usize {
        let at = self.offsets_start + 4 * index;
        let bytes: [u8; 4] = self.contents[at..at + 4].try_into().expect("slice is 4 bytes");
        u32::from_le_bytes(bytes) as usize
    }
}


#[cfg(test)]
mod tests {
    use crate::filter::BloomFilterPolicy;
    use super::*;


    #[test]
    fn empty_builder_matches_everything() {
        let mut builder = FilterBlockBuilder::new(BloomFilterPolicy::default());
        let contents = builder.finish().to_vec();
        assert_eq!(contents, b"\x00\x00\x00\x00\x0b");

        let reader = FilterBlockReader::new(BloomFilterPolicy::default(), contents);
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100_000, b"foo"));
    }

    #[test]
    fn single_filter_chunk() {
        let mut builder = FilterBlockBuilder::new(BloomFilterPolicy::default());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");
        let contents = builder.finish().to_vec();

        let reader = FilterBlockReader::new(BloomFilterPolicy::default(), contents);
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(reader.key_may_match(100, b"hello"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn filters_are_split_by_block_offset() {
        let mut builder = FilterBlockBuilder::new(BloomFilterPolicy::default());

        // First filter range.
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2000);
        builder.add_key(b"bar");

        // Second filter range.
        builder.start_block(3100);
        builder.add_key(b"box");

        // Third range is empty.

        // Fourth filter range.
        builder.start_block(9000);
        builder.add_key(b"box");
        builder.add_key(b"hello");

        let contents = builder.finish().to_vec();
        let reader = FilterBlockReader::new(BloomFilterPolicy::default(), contents);

        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));
        assert!(!reader.key_may_match(0, b"hello"));

        assert!(reader.key_may_match(3100, b"box"));
        assert!(!reader.key_may_match(3100, b"foo"));
        assert!(!reader.key_may_match(3100, b"bar"));

        assert!(!reader.key_may_match(4100, b"foo"));
        assert!(!reader.key_may_match(4100, b"box"));

        assert!(reader.key_may_match(9000, b"box"));
        assert!(reader.key_may_match(9000, b"hello"));
        assert!(!reader.key_may_match(9000, b"foo"));
    }
}
