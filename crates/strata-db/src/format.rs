//! Internal keys and the sequence/type tag appended to every stored key.

use std::fmt::{Debug, Formatter, Result as FmtResult};

use crate::error::{Error, Result};


/// A write's position in the total order of all writes. 56 bits; assigned by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub(crate) const ZERO: Self = Self(0);
    /// The largest sequence number that may be assigned to a write. The one value above it is
    /// reserved for lookup keys.
    pub(crate) const MAX_USABLE: Self = Self((1 << 56) - 2);
    /// The largest representable sequence number, used in lookup keys so that every entry for a
    /// user key sorts at or after the lookup key.
    pub(crate) const MAX: Self = Self((1 << 56) - 1);

    #[inline]
    #[must_use]
    pub(crate) const fn new_unchecked(sequence: u64) -> Self {
        Self(sequence)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn inner(self) -> u64 {
        self.0
    }

    /// `self + additional`, checked against the usable maximum. Exhausting the 56-bit sequence
    /// space is an invariant violation, not an expected failure.
    pub(crate) fn checked_add(self, additional: u64) -> Result<Self> {
        let sequence = self
            .0
            .checked_add(additional)
            .filter(|&sequence| sequence <= Self::MAX_USABLE.0)
            .ok_or_else(|| Error::corruption("sequence number space exhausted"))?;
        Ok(Self(sequence))
    }
}

/// What an entry means for its user key. The discriminant is the low byte of the on-disk tag.
///
/// Ordering note: when two internal keys share a user key and a sequence number, the higher
/// type sorts first; `Value` doubles as the sentinel type used for lookup keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum EntryType {
    Deletion = 0,
    Value    = 1,
}

impl EntryType {
    /// The type used when constructing lookup keys; numerically the greatest tag, so a lookup
    /// key sorts before every entry with the same user key and sequence number.
    pub(crate) const SEEK: Self = Self::Value;

    pub(crate) fn try_from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Deletion),
            1 => Ok(Self::Value),
            _ => Err(Error::corruption(format!("unknown entry type tag {tag}"))),
        }
    }
}

#[inline]
#[must_use]
pub(crate) fn sequence_and_type_tag(sequence: SequenceNumber, entry_type: EntryType) -> u64 {
    (sequence.inner() << 8) | entry_type as u64
}

/// An internal key split into its parts, borrowing the user key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParsedInternalKey<'a> {
    pub user_key:   &'a [u8],
    pub sequence:   SequenceNumber,
    pub entry_type: EntryType,
}

/// Split an encoded internal key into its user key, sequence number, and entry type.
pub(crate) fn parse_internal_key(encoded: &[u8]) -> Result<ParsedInternalKey<'_>> {
    let user_key_len = encoded
        .len()
        .checked_sub(8)
        .ok_or_else(|| Error::corruption("internal key shorter than its tag"))?;

    let (user_key, tag_bytes) = encoded.split_at(user_key_len);
    let tag = u64::from_le_bytes(tag_bytes.try_into().expect("tag is 8 bytes"));

    Ok(ParsedInternalKey {
        user_key,
        sequence:   SequenceNumber::new_unchecked(tag >> 8),
        entry_type: EntryType::try_from_u8((tag & 0xff) as u8)?,
    })
}

/// The user-key prefix of an encoded internal key.
///
/// # Panics
/// Panics if `encoded` is shorter than the 8-byte tag.
#[inline]
#[must_use]
pub(crate) fn extract_user_key(encoded: &[u8]) -> &[u8] {
    &encoded[..encoded.len() - 8]
}

pub(crate) fn append_internal_key(
    output:     &mut Vec<u8>,
    user_key:   &[u8],
    sequence:   SequenceNumber,
    entry_type: EntryType,
) {
    output.extend(user_key);
    output.extend(sequence_and_type_tag(sequence, entry_type).to_le_bytes());
}

/// An owned, encoded internal key: user key bytes followed by the 8-byte tag.
#[derive(Clone, PartialEq, Eq, Default)]
pub(crate) struct InternalKey(Vec<u8>);

impl InternalKey {
    #[must_use]
    pub(crate) fn new(user_key: &[u8], sequence: SequenceNumber, entry_type: EntryType) -> Self {
        let mut encoded = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut encoded, user_key, sequence, entry_type);
        Self(encoded)
    }

    /// Wrap an already-encoded internal key, validating its shape.
    pub(crate) fn decode(encoded: &[u8]) -> Result<Self> {
        parse_internal_key(encoded)?;
        Ok(Self(encoded.to_vec()))
    }

    #[inline]
    #[must_use]
    pub(crate) fn encoded(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    #[must_use]
    pub(crate) fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }
}

impl Debug for InternalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match parse_internal_key(&self.0) {
            Ok(parsed) => write!(
                f,
                "InternalKey({:?} @ {} : {:?})",
                String::from_utf8_lossy(parsed.user_key),
                parsed.sequence.inner(),
                parsed.entry_type,
            ),
            Err(_) => write!(f, "InternalKey(<invalid> {:02x?})", self.0),
        }
    }
}

/// A key for point lookups at a given snapshot: the internal key built from the user key, the
/// snapshot sequence number, and the seek sentinel type, so the first entry at or after it for
/// that user key is the newest one visible at the snapshot.
#[derive(Debug, Clone)]
pub(crate) struct LookupKey {
    encoded: Vec<u8>,
}

impl LookupKey {
    #[must_use]
    pub(crate) fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let mut encoded = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut encoded, user_key, sequence, EntryType::SEEK);
        Self { encoded }
    }

    #[inline]
    #[must_use]
    pub(crate) fn internal_key(&self) -> &[u8] {
        &self.encoded
    }

    #[inline]
    #[must_use]
    pub(crate) fn user_key(&self) -> &[u8] {
        extract_user_key(&self.encoded)
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
    fn internal_key_round_trips() {
        for (user_key, sequence, entry_type) in [
            (b"".as_slice(), 0, EntryType::Value),
            (b"k".as_slice(), 1, EntryType::Deletion),
            (b"longer user key".as_slice(), (1 << 56) - 2, EntryType::Value),
        ] {
            let sequence = SequenceNumber::new_unchecked(sequence);
            let key = InternalKey::new(user_key, sequence, entry_type);
            let parsed = parse_internal_key(key.encoded()).unwrap();

            assert_eq!(parsed.user_key, user_key);
            assert_eq!(parsed.sequence, sequence);
            assert_eq!(parsed.entry_type, entry_type);
            assert_eq!(key.user_key(), user_key);
        }
    }

    #[test]
    fn short_keys_are_corrupt() {
        assert!(parse_internal_key(b"1234567").is_err());
        assert!(InternalKey::decode(b"").is_err());
    }

    #[test]
    fn unknown_type_is_corrupt() {
        let mut encoded = b"key".to_vec();
        encoded.extend(((7_u64 << 8) | 0x42).to_le_bytes());
        assert!(parse_internal_key(&encoded).is_err());
    }

    #[test]
    fn sequence_add_is_checked() {
        let near_max = SequenceNumber::new_unchecked((1 << 56) - 3);
        assert!(near_max.checked_add(1).is_ok());
        assert!(near_max.checked_add(2).is_err());
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
