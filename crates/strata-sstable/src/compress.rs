use crate::error::{TableError, TableResult};


/// The block codecs understood by the table format. The discriminant is the on-disk tag byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    None   = 0,
    Snappy = 1,
}

impl CompressionType {
    #[must_use]
    pub(crate) const fn tag(self) -> u8 {
        self as u8
    }
}

/// Encode `contents` into `output` using `requested`, returning the tag byte actually used.
///
/// Like LevelDB, a compressed block that does not save at least 12.5% is stored raw instead.
pub(crate) fn compress_block(
    requested: CompressionType,
    contents:  &[u8],
    output:    &mut Vec<u8>,
) -> TableResult<u8> {
    output.clear();

    match requested {
        CompressionType::None => {
            output.extend(contents);
            Ok(CompressionType::None.tag())
        }
        #[cfg(feature = "snappy-compression")]
        CompressionType::Snappy => {
            output.resize(snap::raw::max_compress_len(contents.len()), 0);
            let compressed_len = snap::raw::Encoder::new()
                .compress(contents, output)
                .map_err(|error| TableError::corruption(format!("snappy: {error}")))?;
            output.truncate(compressed_len);

            if output.len() < contents.len() - contents.len() / 8 {
                Ok(CompressionType::Snappy.tag())
            } else {
                output.clear();
                output.extend(contents);
                Ok(CompressionType::None.tag())
            }
        }
        #[cfg(not(feature = "snappy-compression"))]
        CompressionType::Snappy => {
            // Snappy was requested but the codec is not compiled in; fall back to storing raw.
            output.extend(contents);
            Ok(CompressionType::None.tag())
        }
    }
}

/// Decode a block that was stored with the given tag byte.
pub(crate) fn decompress_block(tag: u8, contents: &[u8]) -> TableResult<Vec<u8>> {
    if tag == CompressionType::None.tag() {
        return Ok(contents.to_vec());
    }

    #[cfg(feature = "snappy-compression")]
    if tag == CompressionType::Snappy.tag() {
        let decompressed_len = snap::raw::decompress_len(contents)
            .map_err(|error| TableError::corruption(format!("snappy: {error}")))?;
        let mut output = vec![0; decompressed_len];
        snap::raw::Decoder::new()
            .decompress(contents, &mut output)
            .map_err(|error| TableError::corruption(format!("snappy: {error}")))?;
        return Ok(output);
    }

    Err(TableError::corruption(format!("unknown block compression tag {tag}")))
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn uncompressed_round_trip() {
        let contents = b"some block contents".repeat(10);
        let mut encoded = Vec::new();
        let tag = compress_block(CompressionType::None, &contents, &mut encoded).unwrap();

        assert_eq!(tag, 0);
        assert_eq!(decompress_block(tag, &encoded).unwrap(), contents);
    }

    #[cfg(feature = "snappy-compression")]
    #[test]
    fn snappy_round_trip() {
        // Highly repetitive contents, so the compressed form passes the 12.5% savings bar.
        let contents = b"abcdefgh".repeat(500);
        let mut encoded = Vec::new();
        let tag = compress_block(CompressionType::Snappy, &contents, &mut encoded).unwrap();

        assert_eq!(tag, 1);
        assert!(encoded.len() < contents.len());
        assert_eq!(decompress_block(tag, &encoded).unwrap(), contents);
    }

    #[cfg(feature = "snappy-compression")]
    #[test]
    fn incompressible_blocks_are_stored_raw() {
        // A short pseudo-random byte string that snappy cannot shrink by 12.5%.
        let contents: Vec<u8> = (0..64_u32)
            .map(|index| (index.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut encoded = Vec::new();
        let tag = compress_block(CompressionType::Snappy, &contents, &mut encoded).unwrap();

        assert_eq!(tag, 0);
        assert_eq!(encoded, contents);
    }

    #[test]
    fn unknown_tag_is_corruption() {
        assert!(decompress_block(17, b"junk").is_err());
    }
}
