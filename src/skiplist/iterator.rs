//! Iterators over the skiplist.
//!
//! Any number of independent iterators may run concurrently with inserters,
//! but a single iterator is not safe for concurrent use by multiple
//! threads. An iterator created after an insert returns will observe the
//! inserted record if it is within bounds; a backward walk may transiently
//! miss the most recently inserted node, which is consistent with a
//! snapshot taken just before the insert.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::key::{Kind, Trailer};
use crate::seqnum::SeqNum;

use super::Skiplist;

/// Runs when an iterator is dropped; typically the owning memtable's
/// reference-count decrement.
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// A bounded bidirectional iterator over a skiplist.
///
/// `lower_node` and `upper_node` are lazily populated with an arbitrary
/// node beyond the lower or upper bound respectively ("arbitrary" because
/// concurrent inserts may introduce nodes that exceed the bound but sit
/// closer to it). Once populated they detect an exhausted direction without
/// a key comparison, which pays off on repeated seeks with the
/// try-seek-using-next hint.
pub struct Iter {
    list: Arc<Skiplist>,
    nd: usize,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    lower_node: usize,
    upper_node: usize,
    close: Option<CloseHook>,
}

impl Iter {
    pub(super) fn new(
        list: Arc<Skiplist>,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
        close: Option<CloseHook>,
    ) -> Iter {
        let nd = list.head();
        Iter {
            list,
            nd,
            lower,
            upper,
            lower_node: 0,
            upper_node: 0,
            close,
        }
    }

    /// True when the iterator is positioned at a record.
    pub fn valid(&self) -> bool {
        self.nd != self.list.head() && self.nd != self.list.tail()
    }

    /// Positions at the first in-bounds record. Returns validity.
    pub fn first(&mut self) -> bool {
        self.nd = self.list.get_next(self.list.head(), 0);
        self.check_forward()
    }

    /// Positions at the last in-bounds record. Returns validity.
    pub fn last(&mut self) -> bool {
        self.nd = self.list.get_prev(self.list.tail(), 0);
        self.check_backward()
    }

    /// Moves to the next record. Requires a valid position.
    pub fn next(&mut self) -> bool {
        debug_assert!(self.valid());
        self.nd = self.list.get_next(self.nd, 0);
        self.check_forward()
    }

    /// Moves to the previous record. Requires a valid position.
    pub fn prev(&mut self) -> bool {
        debug_assert!(self.valid());
        self.nd = self.list.get_prev(self.nd, 0);
        self.check_backward()
    }

    /// Positions at the first record whose user key is greater than or
    /// equal to `key`. Only the upper bound is checked; the caller ensures
    /// `key` is at or above the lower bound.
    pub fn seek_ge(&mut self, key: &[u8]) -> bool {
        self.seek_ge_with(key, false)
    }

    /// `seek_ge` with an optional hint that the sought key is close ahead
    /// of the current position. When the hint holds, a bounded number of
    /// forward steps replaces the full descent, which amortises repeated
    /// ascending seeks.
    pub fn seek_ge_with(&mut self, key: &[u8], try_seek_using_next: bool) -> bool {
        if try_seek_using_next {
            if self.nd == self.list.tail() {
                // Iterator is exhausted; repeated seeks stay done.
                return false;
            }
            if self.valid() {
                // Arbitrary constant. By measuring seek cost as a function
                // of list size and fitting a model, the step count could
                // scale with the list instead.
                const NUM_NEXTS: usize = 5;
                let mut less = self.list.compare(self.key(), key) == Ordering::Less;
                let mut steps = 0;
                while less && steps < NUM_NEXTS {
                    if !self.next() {
                        return false;
                    }
                    less = self.list.compare(self.key(), key) == Ordering::Less;
                    steps += 1;
                }
                if !less {
                    return true;
                }
            }
        }

        let (_, next) = self.list.seek_for_base_splice(key);
        self.nd = next;
        self.check_forward()
    }

    /// Positions at the last record whose user key is strictly less than
    /// `key`. Only the lower bound is checked.
    pub fn seek_lt(&mut self, key: &[u8]) -> bool {
        let (prev, _) = self.list.seek_for_base_splice(key);
        self.nd = prev;
        self.check_backward()
    }

    /// The current record's user key.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.list.node_key(self.nd)
    }

    /// The current record's trailer.
    pub fn trailer(&self) -> Trailer {
        debug_assert!(self.valid());
        self.list.node_trailer(self.nd)
    }

    pub fn seq_num(&self) -> SeqNum {
        self.trailer().seq_num()
    }

    pub fn kind(&self) -> Kind {
        self.trailer().kind()
    }

    /// The current record's value.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.list.node_value(self.nd)
    }

    fn check_forward(&mut self) -> bool {
        if self.nd == self.list.tail() {
            return false;
        }
        if self.upper_node != 0 && self.nd == self.upper_node {
            // Reached the memoised out-of-bound node; no key comparison
            // needed.
            self.nd = self.list.tail();
            return false;
        }
        if let Some(upper) = &self.upper {
            if self.list.compare(upper, self.list.node_key(self.nd)) != Ordering::Greater {
                // Memoise the first observed out-of-bound node; later walks
                // stop here without comparing keys.
                self.upper_node = self.nd;
                self.nd = self.list.tail();
                return false;
            }
        }
        true
    }

    fn check_backward(&mut self) -> bool {
        if self.nd == self.list.head() {
            return false;
        }
        if self.lower_node != 0 && self.nd == self.lower_node {
            self.nd = self.list.head();
            return false;
        }
        if let Some(lower) = &self.lower {
            if self.list.compare(lower, self.list.node_key(self.nd)) == Ordering::Greater {
                self.lower_node = self.nd;
                self.nd = self.list.head();
                return false;
            }
        }
        true
    }
}

impl Drop for Iter {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

/// The forward-only, unbounded iterator handed to the sstable writer after
/// a memtable freezes. Traverses level 0 once from first to exhaustion;
/// there is no backward direction and no bound checking.
pub struct FlushIter {
    list: Arc<Skiplist>,
    nd: usize,
}

impl FlushIter {
    pub(super) fn new(list: Arc<Skiplist>) -> FlushIter {
        let nd = list.head();
        FlushIter { list, nd }
    }

    pub fn valid(&self) -> bool {
        self.nd != self.list.head() && self.nd != self.list.tail()
    }

    pub fn first(&mut self) -> bool {
        self.nd = self.list.get_next(self.list.head(), 0);
        self.valid()
    }

    pub fn next(&mut self) -> bool {
        debug_assert!(self.valid());
        self.nd = self.list.get_next(self.nd, 0);
        self.valid()
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.list.node_key(self.nd)
    }

    pub fn trailer(&self) -> Trailer {
        debug_assert!(self.valid());
        self.list.node_trailer(self.nd)
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.list.node_value(self.nd)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{Skiplist, MAX_UNUSED_TOWER};
    use super::*;
    use crate::arena::Arena;
    use crate::key::{bytewise_compare, InternalKey, Kind};
    use crate::seqnum::SeqNum;

    fn new_list() -> Arc<Skiplist> {
        let arena = Arc::new(Arena::heap(1 << 20).overflow(MAX_UNUSED_TOWER));
        Arc::new(Skiplist::new(arena, bytewise_compare).unwrap())
    }

    fn populate(list: &Arc<Skiplist>, keys: &[&[u8]]) {
        for key in keys {
            list.add(InternalKey::new(key, SeqNum::START, Kind::Set), key)
                .unwrap();
        }
    }

    #[test]
    fn test_bounds_exclude_records() {
        let list = new_list();
        populate(&list, &[b"a", b"b", b"c", b"d", b"e"]);

        let mut iter = list.iter(Some(b"b".to_vec()), Some(b"d".to_vec()), None);
        assert!(iter.first());
        assert_eq!(iter.key(), b"b");
        assert!(iter.next());
        assert_eq!(iter.key(), b"c");
        // "d" is at the exclusive upper bound.
        assert!(!iter.next());

        // The upper bound is not checked on last(); that is the caller's
        // concern. The lower bound is enforced walking backward.
        assert!(iter.last());
        assert_eq!(iter.key(), b"e");
        assert!(iter.prev());
        assert!(iter.prev());
        assert!(iter.prev());
        assert_eq!(iter.key(), b"b");
        assert!(!iter.prev());
    }

    #[test]
    fn test_bound_nodes_memoised() {
        let list = new_list();
        populate(&list, &[b"a", b"b", b"c"]);

        let mut iter = list.iter(None, Some(b"c".to_vec()), None);
        assert!(iter.first());
        assert!(iter.next());
        assert!(!iter.next());
        let memoised = iter.upper_node;
        assert_ne!(memoised, 0);

        // A later forward walk stops at the memoised node without a key
        // comparison.
        assert!(iter.first());
        assert!(iter.next());
        assert!(!iter.next());
        assert_eq!(iter.upper_node, memoised);
    }

    #[test]
    fn test_empty_range_yields_nothing() {
        let list = new_list();
        populate(&list, &[b"a", b"z"]);

        // Seeking into a bound-excluded range finds nothing: seek_ge
        // enforces the upper bound, seek_lt the lower.
        let mut iter = list.iter(Some(b"m".to_vec()), Some(b"n".to_vec()), None);
        assert!(!iter.seek_ge(b"m"));
        assert!(!iter.seek_lt(b"n"));
    }

    #[test]
    fn test_empty_list_iteration() {
        let list = new_list();
        let mut iter = list.iter(None, None, None);
        assert!(!iter.first());
        assert!(!iter.last());
        assert!(!iter.seek_ge(b"a"));
        assert!(!iter.seek_lt(b"z"));
    }

    #[test]
    fn test_seek_ge() {
        let list = new_list();
        populate(&list, &[b"aaa", b"ccc", b"eee"]);

        let mut iter = list.iter(None, None, None);
        assert!(iter.seek_ge(b"bbb"));
        assert_eq!(iter.key(), b"ccc");
        assert!(iter.seek_ge(b"ccc"));
        assert_eq!(iter.key(), b"ccc");
        assert!(!iter.seek_ge(b"fff"));
    }

    #[test]
    fn test_seek_ge_with_next_hint() {
        let list = new_list();
        let keys: Vec<Vec<u8>> = (0..100u32).map(|i| format!("key{i:04}").into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        populate(&list, &refs);

        let mut iter = list.iter(None, None, None);
        assert!(iter.seek_ge(b"key0010"));
        // Close ahead: served by forward steps.
        assert!(iter.seek_ge_with(b"key0012", true));
        assert_eq!(iter.key(), b"key0012");
        // Far ahead: falls back to a full descent.
        assert!(iter.seek_ge_with(b"key0090", true));
        assert_eq!(iter.key(), b"key0090");
        // Behind the current position: the full descent still lands right.
        assert!(iter.seek_ge_with(b"key0005", false));
        assert_eq!(iter.key(), b"key0005");
    }

    #[test]
    fn test_seek_lt() {
        let list = new_list();
        populate(&list, &[b"aaa", b"ccc", b"eee"]);

        let mut iter = list.iter(None, None, None);
        assert!(iter.seek_lt(b"ddd"));
        assert_eq!(iter.key(), b"ccc");
        assert!(iter.seek_lt(b"ccc"));
        assert_eq!(iter.key(), b"aaa");
        assert!(!iter.seek_lt(b"aaa"));
    }

    #[test]
    fn test_seek_lt_respects_lower_bound() {
        let list = new_list();
        populate(&list, &[b"a", b"b", b"c"]);

        let mut iter = list.iter(Some(b"b".to_vec()), None, None);
        assert!(iter.seek_lt(b"c"));
        assert_eq!(iter.key(), b"b");
        assert!(!iter.prev());
        // The out-of-bound node is memoised for later backward walks.
        assert_ne!(iter.lower_node, 0);
    }

    #[test]
    fn test_close_hook_runs_once_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let list = new_list();
        let closed = Arc::new(AtomicUsize::new(0));
        let hook: CloseHook = {
            let closed = Arc::clone(&closed);
            Box::new(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            })
        };
        let iter = list.iter(None, None, Some(hook));
        drop(iter);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_iter_drains_forward() {
        let list = new_list();
        populate(&list, &[b"c", b"a", b"b"]);

        let mut iter = list.flush_iter();
        let mut keys = Vec::new();
        let mut valid = iter.first();
        while valid {
            keys.push(iter.key().to_vec());
            valid = iter.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_iterator_sees_concurrent_inserts_after_creation() {
        let list = new_list();
        populate(&list, &[b"a"]);

        let mut iter = list.iter(None, None, None);
        // Insert after the iterator exists but before it is positioned.
        populate(&list, &[b"b"]);

        assert!(iter.first());
        assert_eq!(iter.key(), b"a");
        assert!(iter.next());
        assert_eq!(iter.key(), b"b");
    }
}
