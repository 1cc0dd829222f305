#![expect(
    unsafe_code,
    reason = "nodes are reachable from raw pointers into the arena; readers traverse them \
              without locking",
)]

use std::{ptr, slice};
use std::cmp::Ordering as CmpOrdering;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use bumpalo::Bump;
use oorandom::Rand32;
use parking_lot::Mutex;

use crate::comparator::Comparator;
use crate::node_heights::{MAX_HEIGHT, random_node_height};


/// A skiplist node. The node struct, its skip-pointer array, and its entry bytes are all
/// allocated in the list's arena, and are never deallocated or moved while the arena is alive.
struct Node {
    entry_ptr: *const u8,
    entry_len: usize,
    /// Points to `height`-many `AtomicPtr<Node>` slots in the arena.
    skips:     *const AtomicPtr<Node>,
    height:    usize,
}

impl Node {
    /// # Safety
    /// The arena which allocated this node's entry must still be alive, and the returned slice
    /// must not outlive that arena.
    #[inline]
    unsafe fn entry<'a>(&self) -> &'a [u8] {
        // SAFETY: `entry_ptr` was created from a valid slice of `entry_len` initialized bytes in
        // the arena, which the caller asserts is still alive. Entry bytes are never mutated after
        // the node is linked into the list.
        unsafe { slice::from_raw_parts(self.entry_ptr, self.entry_len) }
    }

    /// # Panics
    /// May panic (in debug builds) if `level >= self.height`.
    #[inline]
    fn skip(&self, level: usize) -> &AtomicPtr<Node> {
        debug_assert!(level < self.height, "skip level out of bounds");
        // SAFETY: `skips` points to `height`-many consecutive slots, and `level < height`.
        unsafe { &*self.skips.add(level) }
    }
}

/// Single-writer state. Holding the mutex makes the holder the unique writer; the arena and the
/// height PRNG are only touched on the write path.
struct WriterState {
    arena: Bump,
    rng:   Rand32,
}

struct Inner<Cmp> {
    cmp:            Cmp,
    /// Skip pointers out of the imaginary head node, one per level.
    head_skips:     [AtomicPtr<Node>; MAX_HEIGHT],
    /// Highest level currently in use, in `1..=MAX_HEIGHT`.
    current_height: AtomicUsize,
    num_entries:    AtomicUsize,
    writer:         Mutex<WriterState>,
}

// SAFETY: the raw pointers all target arena memory owned by this very struct. Readers only
// follow pointers published with `Release` stores, and nodes are fully initialized before
// publication.
unsafe impl<Cmp: Send> Send for Inner<Cmp> {}
// SAFETY: see above; additionally, all mutation goes through the writer mutex.
unsafe impl<Cmp: Sync> Sync for Inner<Cmp> {}

impl<Cmp> Inner<Cmp> {
    /// Loads the skip pointer at `level` out of `node`, or out of the head if `node` is null.
    #[inline]
    fn load_skip(&self, node: *const Node, level: usize, order: Ordering) -> *const Node {
        let slot = self.skip_slot(node, level);
        slot.load(order)
    }

    #[inline]
    fn skip_slot(&self, node: *const Node, level: usize) -> &AtomicPtr<Node> {
        if node.is_null() {
            &self.head_skips[level]
        } else {
            // SAFETY: non-null node pointers always target live, initialized arena nodes.
            unsafe { (*node).skip(level) }
        }
    }
}

impl<Cmp: Comparator> Inner<Cmp> {
    /// Returns the first node whose entry is greater than or equal to `target`, or null if every
    /// entry is less than `target`.
    ///
    /// If `prevs` is `Some`, it is filled with the last node strictly less than `target` at each
    /// level (null standing for the head).
    fn find_greater_or_equal(
        &self,
        target:    &[u8],
        mut prevs: Option<&mut [*const Node; MAX_HEIGHT]>,
    ) -> *const Node {
        let mut level = self.current_height.load(Ordering::Relaxed) - 1;
        let mut prev: *const Node = ptr::null();

        loop {
            let next = self.load_skip(prev, level, Ordering::Acquire);

            let next_is_less = if next.is_null() {
                false
            } else {
                // SAFETY: `next` is a published node of this list; the arena is alive.
                let entry = unsafe { (*next).entry() };
                self.cmp.cmp(entry, target) == CmpOrdering::Less
            };

            if next_is_less {
                prev = next;
            } else {
                if let Some(prevs) = prevs.as_deref_mut() {
                    prevs[level] = prev;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Returns the last node whose entry is strictly less than `target`, or null if there is no
    /// such node (null standing for the head).
    fn find_less_than(&self, target: &[u8]) -> *const Node {
        let mut level = self.current_height.load(Ordering::Relaxed) - 1;
        let mut prev: *const Node = ptr::null();

        loop {
            let next = self.load_skip(prev, level, Ordering::Acquire);

            let next_is_less = if next.is_null() {
                false
            } else {
                // SAFETY: `next` is a published node of this list; the arena is alive.
                let entry = unsafe { (*next).entry() };
                self.cmp.cmp(entry, target) == CmpOrdering::Less
            };

            if next_is_less {
                prev = next;
            } else if level == 0 {
                return prev;
            } else {
                level -= 1;
            }
        }
    }

    /// Returns the last node of the list, or null if the list is empty.
    fn find_last(&self) -> *const Node {
        let mut level = self.current_height.load(Ordering::Relaxed) - 1;
        let mut prev: *const Node = ptr::null();

        loop {
            let next = self.load_skip(prev, level, Ordering::Acquire);

            if !next.is_null() {
                prev = next;
            } else if level == 0 {
                return prev;
            } else {
                level -= 1;
            }
        }
    }
}

/// An arena-backed skiplist over opaque byte entries, ordered by a [`Comparator`].
///
/// Entries are immutable once inserted and are never removed. Clones share the same list.
///
/// Any number of threads may read concurrently without locking; inserts are serialized through
/// an internal writer mutex. Inserting an entry that compares equal to an existing entry is a
/// caller bug: the insert is discarded (and its arena bytes are not reclaimed until the whole
/// list is dropped).
pub struct Skiplist<Cmp> {
    inner: Arc<Inner<Cmp>>,
}

impl<Cmp> Clone for Skiplist<Cmp> {
    #[inline]
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<Cmp: Comparator> Skiplist<Cmp> {
    #[must_use]
    pub fn new(cmp: Cmp, seed: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                cmp,
                head_skips:     [const { AtomicPtr::new(ptr::null_mut()) }; MAX_HEIGHT],
                current_height: AtomicUsize::new(1),
                num_entries:    AtomicUsize::new(0),
                writer:         Mutex::new(WriterState {
                    arena: Bump::new(),
                    rng:   Rand32::new(seed),
                }),
            }),
        }
    }

    /// Create and insert an entry of length `entry_len`, initializing it with `init_entry`.
    ///
    /// Returns `false` (discarding the new entry) if an equal entry was already present.
    pub fn insert_with<F>(&self, entry_len: usize, init_entry: F) -> bool
    where
        F: FnOnce(&mut [u8]),
    {
        let inner = &*self.inner;
        let mut writer = inner.writer.lock();
        let WriterState { arena, rng } = &mut *writer;

        let entry: &mut [u8] = arena.alloc_slice_fill_copy(entry_len, 0);
        init_entry(entry);
        let entry_ptr: *const u8 = entry.as_ptr();

        let mut prevs: [*const Node; MAX_HEIGHT] = [ptr::null(); MAX_HEIGHT];
        let greater_or_equal = inner.find_greater_or_equal(entry, Some(&mut prevs));

        if !greater_or_equal.is_null() {
            // SAFETY: published node; arena is alive.
            let existing = unsafe { (*greater_or_equal).entry() };
            if inner.cmp.cmp(existing, entry) == CmpOrdering::Equal {
                debug_assert!(false, "duplicate entry inserted into skiplist");
                return false;
            }
        }

        let height = random_node_height(rng);
        let current_height = inner.current_height.load(Ordering::Relaxed);
        if height > current_height {
            // Levels above the old height start at the head. A concurrent reader that observes
            // the new height before the new node is linked just sees null head skips there and
            // descends, which is harmless.
            for prev in &mut prevs[current_height..height] {
                *prev = ptr::null();
            }
            inner.current_height.store(height, Ordering::Relaxed);
        }

        let skips: &[AtomicPtr<Node>] =
            arena.alloc_slice_fill_with(height, |_| AtomicPtr::new(ptr::null_mut()));
        let node: &Node = arena.alloc(Node {
            entry_ptr,
            entry_len,
            skips: skips.as_ptr(),
            height,
        });
        let node_ptr: *mut Node = ptr::from_ref(node).cast_mut();

        for level in 0..height {
            // No other writer can race us here: we hold the writer mutex. The `Release` store
            // is what publishes the fully-initialized node to readers.
            let next = inner.load_skip(prevs[level], level, Ordering::Relaxed);
            node.skip(level).store(next.cast_mut(), Ordering::Relaxed);
            inner.skip_slot(prevs[level], level).store(node_ptr, Ordering::Release);
        }

        inner.num_entries.fetch_add(1, Ordering::Relaxed);
        true
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.num_entries.load(Ordering::Relaxed)
    }

    /// A close lower bound for the total number of bytes allocated by this list, including entry
    /// bytes and node overhead.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.inner.writer.lock().arena.allocated_bytes()
    }

    /// An iterator sharing ownership of the list. Newly created iterators are not positioned at
    /// any entry; `seek` or `next` first.
    #[inline]
    #[must_use]
    pub fn iter(&self) -> SkiplistIter<Cmp> {
        SkiplistIter {
            list:    Arc::clone(&self.inner),
            current: ptr::null(),
        }
    }
}

impl<Cmp> Debug for Skiplist<Cmp> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Skiplist")
            .field("num_entries",    &self.inner.num_entries.load(Ordering::Relaxed))
            .field("current_height", &self.inner.current_height.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A cursor over a [`Skiplist`], sharing ownership of the list's arena.
///
/// The cursor sees entries inserted after its creation; the skiplist only ever grows.
pub struct SkiplistIter<Cmp> {
    list:    Arc<Inner<Cmp>>,
    current: *const Node,
}

// SAFETY: the raw pointer targets arena memory kept alive by the `Arc`, and the iterator only
// reads published nodes.
unsafe impl<Cmp: Send + Sync> Send for SkiplistIter<Cmp> {}

impl<Cmp> Clone for SkiplistIter<Cmp> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            list:    Arc::clone(&self.list),
            current: self.current,
        }
    }
}

impl<Cmp: Comparator> SkiplistIter<Cmp> {
    #[inline]
    #[must_use]
    pub fn valid(&self) -> bool {
        !self.current.is_null()
    }

    /// The entry the cursor is positioned at, if any.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<&[u8]> {
        if self.current.is_null() {
            None
        } else {
            // SAFETY: `current` is a published node, and the arena is kept alive by `self.list`.
            Some(unsafe { (*self.current).entry() })
        }
    }

    /// Advance to the next entry and return it. From an unpositioned cursor, this moves to the
    /// first entry.
    pub fn next(&mut self) -> Option<&[u8]> {
        if self.current.is_null() {
            self.seek_to_first();
        } else {
            // SAFETY: `current` is a published node.
            self.current = unsafe { (*self.current).skip(0).load(Ordering::Acquire) };
        }
        self.current()
    }

    /// Step back to the previous entry and return it. There is no back-pointer in the nodes, so
    /// this re-searches from the head.
    pub fn prev(&mut self) -> Option<&[u8]> {
        if self.current.is_null() {
            return None;
        }
        // SAFETY: `current` is a published node, and the arena is kept alive by `self.list`.
        let current_entry = unsafe { (*self.current).entry() };
        self.current = self.list.find_less_than(current_entry);
        self.current()
    }

    /// Position the cursor at the first entry greater than or equal to `min_bound`.
    pub fn seek(&mut self, min_bound: &[u8]) {
        self.current = self.list.find_greater_or_equal(min_bound, None);
    }

    pub fn seek_to_first(&mut self) {
        self.current = self.list.load_skip(ptr::null(), 0, Ordering::Acquire);
    }

    pub fn seek_to_last(&mut self) {
        self.current = self.list.find_last();
    }

    /// Un-position the cursor, as if it were newly created.
    pub fn reset(&mut self) {
        self.current = ptr::null();
    }
}

impl<Cmp> Debug for SkiplistIter<Cmp> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("SkiplistIter")
            .field("valid", &!self.current.is_null())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use std::thread;

    use crate::comparator::LexicographicComparator;
    use super::*;


    fn list_with(entries: &[&[u8]]) -> Skiplist<LexicographicComparator> {
        let list = Skiplist::new(LexicographicComparator, 0xfeed);
        for entry in entries {
            assert!(list.insert_with(entry.len(), |buffer| buffer.copy_from_slice(entry)));
        }
        list
    }

    #[test]
    fn empty_list() {
        let list = list_with(&[]);
        assert!(list.is_empty());

        let mut iter = list.iter();
        assert!(!iter.valid());
        assert_eq!(iter.next(), None);
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
    }

    #[test]
    fn iterates_in_sorted_order() {
        let list = list_with(&[b"delta", b"alpha", b"echo", b"bravo", b"charlie"]);
        assert_eq!(list.len(), 5);

        let mut iter = list.iter();
        let mut collected = Vec::new();
        while let Some(entry) = iter.next() {
            collected.push(entry.to_vec());
        }
        assert_eq!(
            collected,
            vec![
                b"alpha".to_vec(),
                b"bravo".to_vec(),
                b"charlie".to_vec(),
                b"delta".to_vec(),
                b"echo".to_vec(),
            ],
        );
    }

    #[test]
    fn seek_positions_at_lower_bound() {
        let list = list_with(&[b"bb", b"dd", b"ff"]);
        let mut iter = list.iter();

        iter.seek(b"cc");
        assert_eq!(iter.current(), Some(b"dd".as_slice()));
        iter.seek(b"dd");
        assert_eq!(iter.current(), Some(b"dd".as_slice()));
        iter.seek(b"ff\0");
        assert!(!iter.valid());
        iter.seek(b"");
        assert_eq!(iter.current(), Some(b"bb".as_slice()));
    }

    #[test]
    fn prev_steps_backwards() {
        let list = list_with(&[b"a", b"b", b"c"]);
        let mut iter = list.iter();

        iter.seek_to_last();
        assert_eq!(iter.current(), Some(b"c".as_slice()));
        assert_eq!(iter.prev(), Some(b"b".as_slice()));
        assert_eq!(iter.prev(), Some(b"a".as_slice()));
        assert_eq!(iter.prev(), None);
        assert!(!iter.valid());
    }

    #[test]
    fn duplicate_inserts_are_rejected() {
        let list = list_with(&[b"same"]);
        // The debug assertion would fire under `cfg(debug_assertions)`; the release behavior is
        // to discard the duplicate.
        if cfg!(not(debug_assertions)) {
            assert!(!list.insert_with(4, |buffer| buffer.copy_from_slice(b"same")));
            assert_eq!(list.len(), 1);
        }
    }

    #[test]
    fn allocated_bytes_grows() {
        let list = Skiplist::new(LexicographicComparator, 7);
        let before = list.allocated_bytes();
        for index in 0..100_u32 {
            let entry = index.to_be_bytes();
            assert!(list.insert_with(entry.len(), |buffer| buffer.copy_from_slice(&entry)));
        }
        assert!(list.allocated_bytes() > before);
    }

    #[test]
    fn readers_observe_concurrent_inserts() {
        let list = Skiplist::new(LexicographicComparator, 99);
        let reader_list = list.clone();

        let writer = thread::spawn(move || {
            for index in 0..1_000_u32 {
                let entry = index.to_be_bytes();
                list.insert_with(entry.len(), |buffer| buffer.copy_from_slice(&entry));
            }
        });

        // Entries are inserted in increasing order, so any snapshot a reader takes must itself
        // be sorted and contiguous from zero.
        for _ in 0..100 {
            let mut iter = reader_list.iter();
            let mut expected = 0_u32;
            while let Some(entry) = iter.next() {
                let value = u32::from_be_bytes(entry.try_into().unwrap());
                assert_eq!(value, expected);
                expected += 1;
            }
        }

        writer.join().unwrap();

        let mut iter = reader_list.iter();
        let mut count = 0;
        while iter.next().is_some() {
            count += 1;
        }
        assert_eq!(count, 1_000);
    }
}
