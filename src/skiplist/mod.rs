//! Fast, concurrent, doubly-linked skiplist backed by an arena.
//!
//! Keys and values are immutable once added and deletion is not supported;
//! higher-level code adds new records that shadow existing ones and encodes
//! deletion with tombstone kinds. Nodes reference each other by arena
//! offsets rather than raw pointers, with offset 0 as the nil sentinel, so
//! every forward and backward link is one plain atomic integer.
//!
//! # Insert protocol
//!
//! ```text
//! +----------------+     +------------+     +----------------+
//! |      prev      |     |     nd     |     |      next      |
//! | prevNextOffset |---->|            |     |                |
//! |                |<----| prevOffset |     |                |
//! |                |     | nextOffset |---->|                |
//! |                |     |            |<----| nextPrevOffset |
//! +----------------+     +------------+     +----------------+
//! ```
//!
//! 1. Initialise prevOffset and nextOffset to point to prev and next.
//! 2. CAS prevNextOffset to repoint from next to nd.
//! 3. CAS nextPrevOffset to repoint from prev to nd.
//!
//! Insertion always proceeds from the base level upward: once a node is
//! linked at level 0 it is discoverable, and no search can find it at a
//! higher level before then. A reader may transiently observe a node
//! reachable forward but not yet back-linked (step 3 pending); both
//! traversal directions follow only the dimension they walk, so neither
//! needs the two link sets to agree.

mod iterator;
mod node;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::key::{Compare, InternalKey};

pub use iterator::{CloseHook, FlushIter, Iter};
pub use node::max_node_size;
pub(crate) use node::{MAX_HEIGHT, MAX_UNUSED_TOWER};

use node::Node;

/// Probability of extending a tower by one level: the inverse of Euler's
/// number, the value that minimises expected comparisons per lookup.
/// The table is computed once so that height selection needs only a single
/// 32-bit random draw.
fn probabilities() -> &'static [u32; MAX_HEIGHT] {
    static PROBABILITIES: OnceLock<[u32; MAX_HEIGHT]> = OnceLock::new();
    PROBABILITIES.get_or_init(|| {
        let mut table = [0u32; MAX_HEIGHT];
        let mut p = 1.0f64;
        for slot in table.iter_mut() {
            *slot = (u32::MAX as f64 * p) as u32;
            p /= std::f64::consts::E;
        }
        table
    })
}

fn random_height() -> usize {
    let rnd: u32 = rand::random();
    let probabilities = probabilities();
    let mut h = 1;
    while h < MAX_HEIGHT && rnd <= probabilities[h] {
        h += 1;
    }
    h
}

/// The pair of nodes bracketing an insertion point at one level.
#[derive(Clone, Copy, Default)]
struct Splice {
    prev: usize,
    next: usize,
}

/// A caller-owned splice cache carried across successive [`Inserter::add`]
/// calls. When keys arrive in ascending order the cached splices let the
/// next insert skip most of the descent. A zeroed inserter is always safe;
/// it is simply a cold cache.
///
/// The cache is single-threaded by construction: it is owned by one caller
/// and passed by `&mut`, so repeated inserts from one thread never contend
/// with another thread's cache.
pub struct Inserter {
    spl: [Splice; MAX_HEIGHT],
    height: usize,
}

impl Inserter {
    pub fn new() -> Inserter {
        Inserter {
            spl: [Splice::default(); MAX_HEIGHT],
            height: 0,
        }
    }

    /// Adds a record, reusing this inserter's splice cache.
    pub fn add(&mut self, list: &Skiplist, key: InternalKey, value: &[u8]) -> Result<()> {
        list.add_internal(key, value, self)
    }
}

impl Default for Inserter {
    fn default() -> Self {
        Inserter::new()
    }
}

/// A concurrent skiplist over internal keys.
///
/// All nodes, keys and values live in the owned arena. Any number of
/// threads may insert and iterate concurrently; no lock is taken anywhere.
pub struct Skiplist {
    arena: Arc<Arena>,
    cmp: Compare,
    head: usize,
    tail: usize,
    height: AtomicUsize,
}

impl Skiplist {
    /// Constructs an empty skiplist, allocating its head and tail sentinels
    /// from `arena`. Fails with `ArenaFull` when the arena cannot hold the
    /// two full-height sentinels.
    pub fn new(arena: Arc<Arena>, cmp: Compare) -> Result<Skiplist> {
        let head = Node::alloc_raw(&arena, MAX_HEIGHT, 0, 0)?;
        let tail = Node::alloc_raw(&arena, MAX_HEIGHT, 0, 0)?;
        unsafe {
            Node::clear_key(&arena, head);
            Node::clear_key(&arena, tail);
        }

        let list = Skiplist {
            arena,
            cmp,
            head,
            tail,
            height: AtomicUsize::new(1),
        };

        // Link every head level forward to tail and every tail level
        // backward to head.
        for i in 0..MAX_HEIGHT {
            list.node(head).tower(i).init(0, tail);
            list.node(tail).tower(i).init(head, 0);
        }

        Ok(list)
    }

    /// The arena backing this skiplist.
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Consumes the skiplist and returns the backing arena.
    pub fn into_arena(self) -> Arc<Arena> {
        self.arena
    }

    /// Height of the highest tower ever allocated in this skiplist.
    pub fn height(&self) -> usize {
        self.height.load(AtomicOrdering::Acquire)
    }

    /// Bytes allocated from the arena so far.
    pub fn size(&self) -> usize {
        self.arena.len()
    }

    /// Adds a new record if it does not yet exist. Returns `RecordExists`
    /// when a record with an equal user key and trailer is already present,
    /// and `ArenaFull` when there is no room left in the arena.
    pub fn add(&self, key: InternalKey, value: &[u8]) -> Result<()> {
        let mut ins = Inserter::new();
        self.add_internal(key, value, &mut ins)
    }

    /// Returns a bounded bidirectional iterator. `None` for a bound
    /// disables the check for that boundary. The lower bound is not checked
    /// on `seek_ge`/`first` and the upper bound is not checked on
    /// `seek_lt`/`last`; the caller is expected to perform those checks.
    /// The close hook runs when the iterator is dropped.
    pub fn iter(
        self: &Arc<Self>,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
        close: Option<CloseHook>,
    ) -> Iter {
        Iter::new(Arc::clone(self), lower, upper, close)
    }

    /// Returns the forward-only, unbounded iterator used to drain the list
    /// into an sstable.
    pub fn flush_iter(self: &Arc<Self>) -> FlushIter {
        FlushIter::new(Arc::clone(self))
    }

    fn add_internal(&self, key: InternalKey, value: &[u8], ins: &mut Inserter) -> Result<()> {
        if self.find_splice(key, ins) {
            return Err(Error::RecordExists);
        }

        let (nd, height) = self.new_node(key, value)?;

        // Insert from the base level up. A node linked at level 0 is
        // discoverable, so any concurrent search that would conflict at a
        // higher level must already have seen it below.
        let mut invalidate_splice = false;
        for i in 0..height {
            let mut prev = ins.spl[i].prev;
            let mut next = ins.spl[i].next;

            if prev == 0 {
                // The new node increased the height of the skiplist; this
                // level has no cached splice and is still empty.
                debug_assert_eq!(next, 0);
                prev = self.head;
                next = self.tail;
            }

            loop {
                self.node(nd).tower(i).init(prev, next);

                // If next does not yet link back to prev, either the thread
                // that inserted next has not back-linked it yet, or another
                // node landed between prev and next. prev still pointing
                // forward to next distinguishes the former; help the slower
                // inserter along in that case. A failed repair is benign.
                let next_prev = self.node(next).prev_offset(i);
                if next_prev != prev && self.node(prev).next_offset(i) == next {
                    self.node(next).cas_prev_offset(i, next_prev, prev);
                }

                if self.node(prev).cas_next_offset(i, next, nd) {
                    // Linked in. Update the back link and move one level up.
                    // Failure is benign: the next inserter will repair it.
                    self.node(next).cas_prev_offset(i, prev, nd);
                    break;
                }

                // CAS failed: recompute the splice for this level only.
                let (p, n, found) = self.find_splice_for_level(key, i, prev);
                if found {
                    if i != 0 {
                        panic!("concurrent insert discovered a key above the base level");
                    }
                    // Another writer won the base-level race for this exact
                    // internal key.
                    return Err(Error::RecordExists);
                }
                prev = p;
                next = n;
                invalidate_splice = true;
            }
        }

        if invalidate_splice {
            ins.height = 0;
        } else {
            // The splice stayed valid: remember the new node as the
            // predecessor so an ascending-key caller starts right of it.
            for i in 0..height {
                ins.spl[i].prev = nd;
            }
        }

        Ok(())
    }

    fn new_node(&self, key: InternalKey, value: &[u8]) -> Result<(usize, usize)> {
        let height = random_height();
        let nd = Node::alloc(&self.arena, height, key, value)?;

        // Raise the list height via CAS, tolerating concurrent raises.
        let mut list_height = self.height();
        while height > list_height {
            match self.height.compare_exchange_weak(
                list_height,
                height,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => list_height = current,
            }
        }

        Ok((nd, height))
    }

    fn find_splice(&self, key: InternalKey, ins: &mut Inserter) -> bool {
        let list_height = self.height();
        let mut level = 0;
        let mut prev = self.head;

        if ins.height < list_height {
            // The list has grown past the cache; recompute from scratch.
            ins.height = list_height;
            level = list_height;
        } else {
            while level < list_height {
                let spl = ins.spl[level];
                if self.get_next(spl.prev, level) != spl.next {
                    // A node was inserted through this splice; the level
                    // above may still be intact.
                    level += 1;
                    continue;
                }
                if spl.prev != self.head && !self.key_is_after_node(spl.prev, key) {
                    // Key lies before the splice.
                    level = list_height;
                    break;
                }
                if spl.next != self.tail && self.key_is_after_node(spl.next, key) {
                    // Key lies after the splice.
                    level = list_height;
                    break;
                }
                // The splice brackets the key.
                prev = spl.prev;
                break;
            }
        }

        let mut found = false;
        for level in (0..level).rev() {
            let (p, n, f) = self.find_splice_for_level(key, level, prev);
            found = f;
            debug_assert_ne!(n, 0);
            ins.spl[level] = Splice { prev: p, next: n };
            prev = p;
        }

        found
    }

    /// Scans right at `level` from `start` until the key lies between two
    /// adjacent nodes. Returns `found` when a node matches both the user
    /// key and the trailer.
    fn find_splice_for_level(
        &self,
        key: InternalKey,
        level: usize,
        start: usize,
    ) -> (usize, usize, bool) {
        let mut prev = start;
        loop {
            // Assume prev.key < key.
            let next = self.get_next(prev, level);
            if next == self.tail {
                return (prev, next, false);
            }

            match (self.cmp)(key.user_key, self.node_key(next)) {
                Ordering::Less => return (prev, next, false),
                Ordering::Equal => {
                    let next_trailer = self.node(next).trailer();
                    if key.trailer == next_trailer {
                        return (prev, next, true);
                    }
                    if key.trailer > next_trailer {
                        // Descending trailer order: key sorts before next.
                        return (prev, next, false);
                    }
                    // Key sorts after next at an equal user key.
                    prev = next;
                }
                Ordering::Greater => prev = next,
            }
        }
    }

    /// Descends to the base level bracketing the first record whose user
    /// key is `>= key`, using a search key that sorts before every record
    /// of that user key.
    pub(crate) fn seek_for_base_splice(&self, key: &[u8]) -> (usize, usize) {
        let ikey = InternalKey::search(key);
        let mut level = self.height() - 1;
        let mut prev = self.head;
        loop {
            let (p, n, found) = self.find_splice_for_level(ikey, level, prev);
            prev = p;
            if found || level == 0 {
                return (p, n);
            }
            level -= 1;
        }
    }

    fn key_is_after_node(&self, nd: usize, key: InternalKey) -> bool {
        match (self.cmp)(self.node_key(nd), key.user_key) {
            Ordering::Less => true,
            Ordering::Greater => false,
            // Equal user keys order by descending trailer; an equal trailer
            // means the internal keys are equal, which is not "after".
            Ordering::Equal => key.trailer < self.node(nd).trailer(),
        }
    }

    fn node(&self, offset: usize) -> &Node {
        debug_assert_ne!(offset, 0);
        unsafe { &*(self.arena.ptr(offset) as *const Node) }
    }

    pub(crate) fn head(&self) -> usize {
        self.head
    }

    pub(crate) fn tail(&self) -> usize {
        self.tail
    }

    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.cmp)(a, b)
    }

    pub(crate) fn get_next(&self, nd: usize, level: usize) -> usize {
        self.node(nd).next_offset(level)
    }

    pub(crate) fn get_prev(&self, nd: usize, level: usize) -> usize {
        self.node(nd).prev_offset(level)
    }

    pub(crate) fn node_key(&self, nd: usize) -> &[u8] {
        let nd = self.node(nd);
        self.arena.bytes(nd.key_offset(), nd.key_size())
    }

    pub(crate) fn node_value(&self, nd: usize) -> &[u8] {
        let nd = self.node(nd);
        self.arena
            .bytes(nd.key_offset() + nd.key_size(), nd.value_size())
    }

    pub(crate) fn node_trailer(&self, nd: usize) -> crate::key::Trailer {
        self.node(nd).trailer()
    }
}

impl std::fmt::Debug for Skiplist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skiplist")
            .field("height", &self.height())
            .field("size", &self.size())
            .finish()
    }
}
