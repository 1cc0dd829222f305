use std::sync::Arc;

use strata_sstable::FilterPolicy;

use crate::format::extract_user_key;


/// The filter policy as configured by the user, matching on user keys.
pub(crate) type UserFilterPolicy = Arc<dyn FilterPolicy + Send + Sync>;

/// Adapts a user filter policy to the internal keys stored in tables: keys are stripped of
/// their 8-byte tag before they reach the user policy, both when building filters and when
/// querying them.
#[derive(Clone)]
pub(crate) struct InternalFilterPolicy {
    user: UserFilterPolicy,
}

impl std::fmt::Debug for InternalFilterPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalFilterPolicy")
            .field("user", &self.user.name())
            .finish()
    }
}

impl InternalFilterPolicy {
    #[must_use]
    pub(crate) fn new(user: UserFilterPolicy) -> Self {
        Self { user }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        // Deliberately the user policy's name: the tag stripping does not change the filter
        // encoding, and LevelDB-written tables remain readable.
        self.user.name()
    }

    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>) {
        let mut stripped_keys = Vec::with_capacity(flattened_keys.len());
        let mut stripped_offsets = Vec::with_capacity(key_offsets.len());

        for (position, &key_offset) in key_offsets.iter().enumerate() {
            let key_end = key_offsets
                .get(position + 1)
                .copied()
                .unwrap_or(flattened_keys.len());
            let internal_key = &flattened_keys[key_offset..key_end];

            stripped_offsets.push(stripped_keys.len());
            stripped_keys.extend(extract_user_key(internal_key));
        }

        self.user.create_filter(&stripped_keys, &stripped_offsets, filter);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user.key_may_match(extract_user_key(key), filter)
    }
}


#[cfg(test)]
mod tests {
    use strata_sstable::BloomFilterPolicy;

    use crate::format::{EntryType, InternalKey, SequenceNumber};
    use super::*;


    #[test]
    fn tags_do_not_perturb_the_filter() {
        let policy = InternalFilterPolicy::new(Arc::new(BloomFilterPolicy::default()));

        let keys: Vec<InternalKey> = (0..100_u64)
            .map(|index| {
                InternalKey::new(
                    format!("user{index:03}").as_bytes(),
                    SequenceNumber::new_unchecked(index),
                    EntryType::Value,
                )
            })
            .collect();

        let mut flattened = Vec::new();
        let mut offsets = Vec::new();
        for key in &keys {
            offsets.push(flattened.len());
            flattened.extend(key.encoded());
        }

        let mut filter = Vec::new();
        policy.create_filter(&flattened, &offsets, &mut filter);

        // The same user key under a completely different tag must still match.
        for index in 0..100_u64 {
            let probe = InternalKey::new(
                format!("user{index:03}").as_bytes(),
                SequenceNumber::new_unchecked(9_999),
                EntryType::Deletion,
            );
            assert!(policy.key_may_match(probe.encoded(), &filter));
        }

        let absent = InternalKey::new(b"user999", SequenceNumber::new_unchecked(1), EntryType::Value);
        assert!(!policy.key_may_match(absent.encoded(), &filter));
    }
}
