use integer_encoding::VarInt as _;

use crate::error::{TableError, TableResult};


/// One byte to indicate the compression type, and 4 bytes for a masked checksum.
pub(crate) const BLOCK_TRAILER_LEN: usize = 5;
/// The hardcoded `filter.` prefix used before a filter's name, in meta index block entries
/// corresponding to filters.
pub(crate) const FILTER_META_PREFIX: &str = "filter.";


/// The offset and size of a block within a table. Can be converted to and from varints.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHandle {
    pub offset:     u64,
    pub block_size: u64,
}

impl BlockHandle {
    /// Each varint64 could take up to 10 bytes.
    pub(crate) const MAX_ENCODED_LENGTH: usize = 20;

    /// Attempts to decode a block handle, returning it and how many bytes were read.
    pub(crate) fn decode_from(input: &[u8]) -> TableResult<(Self, usize)> {
        let (offset, offset_size) = u64::decode_var(input)
            .ok_or_else(|| TableError::corruption("bad block handle offset"))?;
        let (block_size, size_size) = u64::decode_var(&input[offset_size..])
            .ok_or_else(|| TableError::corruption("bad block handle size"))?;

        Ok((
            Self { offset, block_size },
            offset_size + size_size,
        ))
    }

    /// Appends the two varints to `output`.
    pub(crate) fn encode_to(self, output: &mut Vec<u8>) {
        let mut encoded = [0_u8; Self::MAX_ENCODED_LENGTH];
        let mut encoded_len = self.offset.encode_var(&mut encoded);
        encoded_len += self.block_size.encode_var(&mut encoded[encoded_len..]);
        output.extend(&encoded[..encoded_len]);
    }
}

/// The fixed-size footer at the end of every table file: the metaindex and index block handles,
/// zero-padded to their maximum encoded length, followed by the magic number.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TableFooter {
    pub metaindex: BlockHandle,
    pub index:     BlockHandle,
}

impl TableFooter {
    /// The exact length of the table footer (when encoded).
    pub(crate) const ENCODED_LENGTH: usize   = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;
    pub(crate) const MAGIC:          u64     = 0x_db47_7524_8b80_fb57;
    pub(crate) const ENCODED_MAGIC:  [u8; 8] = Self::MAGIC.to_le_bytes();

    pub(crate) fn decode_from(input: &[u8]) -> TableResult<Self> {
        if input.len() < Self::ENCODED_LENGTH {
            return Err(TableError::corruption("table footer is truncated"));
        }

        let magic = &input[Self::ENCODED_LENGTH - 8..Self::ENCODED_LENGTH];
        if magic != Self::ENCODED_MAGIC {
            return Err(TableError::corruption("bad table magic number"));
        }

        let (metaindex, metaindex_size) = BlockHandle::decode_from(input)?;
        let (index, _) = BlockHandle::decode_from(&input[metaindex_size..])?;

        Ok(Self { metaindex, index })
    }

    pub(crate) fn encode_to(self, output: &mut Vec<u8>) {
        let start_len = output.len();
        self.metaindex.encode_to(output);
        self.index.encode_to(output);
        output.resize(start_len + 2 * BlockHandle::MAX_ENCODED_LENGTH, 0);
        output.extend(Self::ENCODED_MAGIC);
    }
}

const CHECKSUM_MASK_DELTA: u32 = 0x_a282_ead8;

/// Mask a CRC so that checksums of data containing embedded checksums do not collide with the
/// framing checksums.
#[inline]
#[must_use]
pub(crate) const fn mask_checksum(unmasked: u32) -> u32 {
    unmasked.rotate_right(15).wrapping_add(CHECKSUM_MASK_DELTA)
}

#[inline]
#[must_use]
pub(crate) const fn unmask_checksum(masked: u32) -> u32 {
    masked.wrapping_sub(CHECKSUM_MASK_DELTA).rotate_left(15)
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn handle_round_trip() {
        let handle = BlockHandle { offset: 9_000_123, block_size: 4096 };
        let mut encoded = Vec::new();
        handle.encode_to(&mut encoded);

        let (decoded, read_len) = BlockHandle::decode_from(&encoded).unwrap();
        assert_eq!(read_len, encoded.len());
        assert_eq!(decoded.offset, handle.offset);
        assert_eq!(decoded.block_size, handle.block_size);
    }

    #[test]
    fn footer_round_trip() {
        let footer = TableFooter {
            metaindex: BlockHandle { offset: 1234, block_size: 77 },
            index:     BlockHandle { offset: 5678, block_size: 88 },
        };
        let mut encoded = Vec::new();
        footer.encode_to(&mut encoded);
        assert_eq!(encoded.len(), TableFooter::ENCODED_LENGTH);

        let decoded = TableFooter::decode_from(&encoded).unwrap();
        assert_eq!(decoded.metaindex.offset, 1234);
        assert_eq!(decoded.index.block_size, 88);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let footer = TableFooter {
            metaindex: BlockHandle { offset: 0, block_size: 0 },
            index:     BlockHandle { offset: 0, block_size: 0 },
        };
        let mut encoded = Vec::new();
        footer.encode_to(&mut encoded);
        *encoded.last_mut().unwrap() ^= 0xff;

        assert!(TableFooter::decode_from(&encoded).is_err());
    }

    #[test]
    fn checksum_mask_round_trips_and_changes_value() {
        for checksum in [0, 1, 0x_dead_beef, u32::MAX] {
            let masked = mask_checksum(checksum);
            assert_ne!(masked, checksum);
            assert_eq!(unmask_checksum(masked), checksum);
        }
    }
}
