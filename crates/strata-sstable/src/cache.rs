use std::sync::Arc;

use quick_cache::sync::Cache;


/// Identifies one decompressed block within one table.
///
/// `table_id` must be unique among all tables sharing a cache; the engine uses its table file
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub table_id:     u64,
    pub block_offset: u64,
}

/// A shared cache for decompressed block contents, safe to hand to any number of tables.
///
/// Clones share the same cache.
#[derive(Debug, Clone)]
pub struct BlockCache {
    cache: Arc<Cache<CacheKey, Arc<Vec<u8>>>>,
}

impl BlockCache {
    /// `capacity` is a block count, not a byte count; callers typically divide their byte budget
    /// by the configured block size.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Arc::new(Cache::new(capacity.max(1))),
        }
    }

    pub(crate) fn insert(&self, cache_key: CacheKey, block: &Arc<Vec<u8>>) {
        self.cache.insert(cache_key, Arc::clone(block));
    }

    #[must_use]
    pub(crate) fn get(&self, cache_key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        self.cache.get(cache_key)
    }
}
