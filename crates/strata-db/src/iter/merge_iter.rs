use strata_sstable::TableComparator as _;

use crate::comparator::InternalKeyComparator;
use crate::error::Result;
use super::InternalIter;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Reverse,
}

/// Merges any number of sorted child cursors into one sorted cursor over their union.
///
/// The children produce internal keys, which are unique across the tree (no two entries share
/// a sequence number), so ties cannot arise.
#[derive(Debug)]
pub(crate) struct MergingIter {
    icmp:      InternalKeyComparator,
    children:  Vec<InternalIter>,
    current:   Option<usize>,
    direction: Direction,
}

impl MergingIter {
    #[must_use]
    pub(crate) fn new(icmp: InternalKeyComparator, children: Vec<InternalIter>) -> Self {
        Self {
            icmp,
            children,
            current:   None,
            direction: Direction::Forward,
        }
    }

    pub(crate) fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// # Panics
    /// May panic if the iterator is not valid.
    pub(crate) fn key(&self) -> &[u8] {
        self.children[self.current.expect("iterator is valid")].key()
    }

    /// # Panics
    /// May panic if the iterator is not valid.
    pub(crate) fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator is valid")].value()
    }

    pub(crate) fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    pub(crate) fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    pub(crate) fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    pub(crate) fn next(&mut self) {
        let Some(current) = self.current else { return };

        // After reverse iteration, the non-current children sit before the current key; put
        // every one of them at its first entry past the current key before stepping.
        if self.direction != Direction::Forward {
            let current_key = self.children[current].key().to_vec();
            for (index, child) in self.children.iter_mut().enumerate() {
                if index == current {
                    continue;
                }
                child.seek(&current_key);
                if child.valid() && self.icmp.cmp(&current_key, child.key()).is_eq() {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    pub(crate) fn prev(&mut self) {
        let Some(current) = self.current else { return };

        // After forward iteration, the non-current children sit past the current key; put
        // every one of them at its last entry before the current key before stepping.
        if self.direction != Direction::Reverse {
            let current_key = self.children[current].key().to_vec();
            for (index, child) in self.children.iter_mut().enumerate() {
                if index == current {
                    continue;
                }
                child.seek(&current_key);
                if child.valid() {
                    // Child is at the first entry at or after `current_key`; step back once.
                    child.prev();
                } else {
                    // Every entry in this child is before `current_key`.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    pub(crate) fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (index, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            let is_smaller = smallest
                .map(|at| self.icmp.cmp(child.key(), self.children[at].key()).is_lt())
                .unwrap_or(true);
            if is_smaller {
                smallest = Some(index);
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (index, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            let is_larger = largest
                .map(|at| self.icmp.cmp(child.key(), self.children[at].key()).is_gt())
                .unwrap_or(true);
            if is_larger {
                largest = Some(index);
            }
        }
        self.current = largest;
    }
}
