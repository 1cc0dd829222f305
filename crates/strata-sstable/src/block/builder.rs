use integer_encoding::VarIntWriter as _;


/// Length of the common prefix of two byte slices.
pub(crate) fn common_prefix_len(lhs: &[u8], rhs: &[u8]) -> usize {
    lhs.iter()
        .zip(rhs)
        .take_while(|(lhs_byte, rhs_byte)| lhs_byte == rhs_byte)
        .count()
}

/// Builds the serialized contents of a [`Block`].
///
/// Entries must be added in strictly increasing key order under whichever comparator the block
/// will later be read with; the builder does not validate this. Every
/// `block_restart_interval`-th entry is a restart: its key is stored whole, and its offset is
/// recorded in the restart array so that iterators can binary-search and walk backwards.
///
/// [`Block`]: super::Block
#[derive(Debug)]
pub struct BlockBuilder {
    block_buffer:     Vec<u8>,
    last_key:         Vec<u8>,
    num_entries:      usize,
    restarts:         Vec<u32>,
    /// Counts entries since the last restart.
    restart_counter:  usize,
    restart_interval: usize,
}

impl BlockBuilder {
    /// # Panics
    /// Panics if `block_restart_interval == 0`.
    #[must_use]
    pub fn new(block_restart_interval: usize) -> Self {
        assert!(block_restart_interval > 0, "interval must be at least 1");
        Self {
            block_buffer:     Vec::new(),
            last_key:         Vec::new(),
            num_entries:      0,
            restarts:         Vec::new(),
            restart_counter:  0,
            restart_interval: block_restart_interval,
        }
    }

    #[inline]
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// The most recently added key. Empty if no entry has been added since the last reset.
    #[inline]
    #[must_use]
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// The exact length of the slice which would be returned by [`Self::finish_block_contents`]
    /// if it were called now.
    #[must_use]
    pub fn finished_length(&self) -> usize {
        self.block_buffer.len() + 4 * (self.restarts.len() + 1)
    }

    /// The new key must be strictly greater than every key previously added since the last
    /// reset, or an invalid block may be produced.
    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        // The counter is zero when the builder is fresh or reset, so the first entry is always
        // a restart and is stored with a whole key.
        let shared = if self.restart_counter % self.restart_interval == 0 {
            let restart_offset = u32::try_from(self.block_buffer.len())
                .expect("block exceeded 4 GiB");
            self.restarts.push(restart_offset);
            self.restart_counter = 1;
            0
        } else {
            self.restart_counter += 1;
            common_prefix_len(&self.last_key, key)
        };

        let non_shared_key = &key[shared..];

        self.block_buffer.write_varint(shared).expect("writing to a Vec does not fail");
        self.block_buffer
            .write_varint(non_shared_key.len())
            .expect("writing to a Vec does not fail");
        self.block_buffer.write_varint(value.len()).expect("writing to a Vec does not fail");
        self.block_buffer.extend(non_shared_key);
        self.block_buffer.extend(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(non_shared_key);

        self.num_entries += 1;
    }

    /// Append the restart array and count, and return the completed block contents.
    ///
    /// [`Self::reset`] must be called before any other method is used afterward.
    #[must_use]
    pub fn finish_block_contents(&mut self) -> &[u8] {
        self.block_buffer.reserve(4 * (self.restarts.len() + 1));
        for &restart in &self.restarts {
            self.block_buffer.extend(restart.to_le_bytes());
        }
        let num_restarts = u32::try_from(self.restarts.len()).expect("block exceeded 4 GiB");
        self.block_buffer.extend(num_restarts.to_le_bytes());
        &self.block_buffer
    }

    /// Discard all entries (keeping buffer capacity) so the builder can produce another block.
    pub fn reset(&mut self) {
        self.block_buffer.clear();
        self.last_key.clear();
        self.num_entries = 0;
        self.restarts.clear();
        self.restart_counter = 0;
    }
}
