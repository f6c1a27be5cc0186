use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::{Arena, WORD};
use crate::error::Result;
use crate::key::{InternalKey, Trailer};

/// Maximum height of any tower. With p = 1/e this comfortably covers
/// memtables far larger than an arena can hold.
pub(crate) const MAX_HEIGHT: usize = 20;

pub(super) const LINKS_SIZE: usize = mem::size_of::<Links>();
pub(super) const MAX_NODE_SIZE: usize = mem::size_of::<Node>();

/// The largest tower suffix a truncated node leaves unallocated. An arena
/// must reserve this many overflow bytes so that a node at the very end of
/// the live region can still be addressed as a full [`Node`] without
/// leaving the buffer.
pub(crate) const MAX_UNUSED_TOWER: usize = (MAX_HEIGHT - 1) * LINKS_SIZE;

/// One level of a node's tower: the forward and backward offsets, both
/// CAS-able without locks.
#[repr(C)]
pub(super) struct Links {
    next: AtomicUsize,
    prev: AtomicUsize,
}

impl Links {
    pub(super) fn init(&self, prev: usize, next: usize) {
        self.next.store(next, Ordering::Release);
        self.prev.store(prev, Ordering::Release);
    }
}

/// An arena-resident skiplist element.
///
/// The struct declares the full tower, but a node of height `h` is
/// allocated with only `h` link slots; the remaining slots fall inside the
/// arena's overflow region or a neighbouring allocation and are never
/// accessed, because a node is only ever linked at levels below its height.
/// Key and value bytes follow the truncated tower inside the same
/// allocation.
///
/// All fields except the tower links are written before the node's first
/// insertion CAS publishes it, and are immutable afterwards.
#[repr(C)]
pub(super) struct Node {
    key_offset: usize,
    key_size: usize,
    value_size: usize,
    alloc_size: usize,
    trailer: Trailer,
    tower: [Links; MAX_HEIGHT],
}

impl Node {
    /// Allocates a node for `key`/`value` with a truncated `height`-level
    /// tower and copies both byte strings into the allocation. Returns the
    /// node's arena offset.
    pub(super) fn alloc(
        arena: &Arena,
        height: usize,
        key: InternalKey,
        value: &[u8],
    ) -> Result<usize> {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        let key_size = key.user_key.len();
        let value_size = value.len();

        let offset = Self::alloc_raw(arena, height, key_size, value_size)?;
        unsafe {
            let nd = arena.ptr(offset) as *mut Node;
            (*nd).trailer = key.trailer;
            let key_offset = (*nd).key_offset;
            arena
                .bytes_mut(key_offset, key_size)
                .copy_from_slice(key.user_key);
            arena
                .bytes_mut(key_offset + key_size, value_size)
                .copy_from_slice(value);
        }
        Ok(offset)
    }

    /// Allocates an uninitialised node: header plus `height` link slots plus
    /// room for the key and value bytes, word-aligned.
    pub(super) fn alloc_raw(
        arena: &Arena,
        height: usize,
        key_size: usize,
        value_size: usize,
    ) -> Result<usize> {
        let unused = (MAX_HEIGHT - height) * LINKS_SIZE;
        let node_size = MAX_NODE_SIZE - unused;
        let alloc_size = node_size + key_size + value_size;

        let offset = arena.alloc(alloc_size, WORD)?;
        unsafe {
            let nd = arena.ptr(offset) as *mut Node;
            (*nd).key_offset = offset + node_size;
            (*nd).key_size = key_size;
            (*nd).value_size = value_size;
            (*nd).alloc_size = alloc_size;
            (*nd).trailer = Trailer::default();
        }
        Ok(offset)
    }

    pub(super) fn key_offset(&self) -> usize {
        self.key_offset
    }

    pub(super) fn key_size(&self) -> usize {
        self.key_size
    }

    pub(super) fn value_size(&self) -> usize {
        self.value_size
    }

    pub(super) fn alloc_size(&self) -> usize {
        self.alloc_size
    }

    pub(super) fn trailer(&self) -> Trailer {
        self.trailer
    }

    /// Zeroes the key offset so sentinel keys read back as empty views.
    pub(super) unsafe fn clear_key(arena: &Arena, offset: usize) {
        let nd = arena.ptr(offset) as *mut Node;
        (*nd).key_offset = 0;
        (*nd).key_size = 0;
    }

    pub(super) fn tower(&self, level: usize) -> &Links {
        &self.tower[level]
    }

    pub(super) fn next_offset(&self, level: usize) -> usize {
        self.tower[level].next.load(Ordering::Acquire)
    }

    pub(super) fn prev_offset(&self, level: usize) -> usize {
        self.tower[level].prev.load(Ordering::Acquire)
    }

    pub(super) fn cas_next_offset(&self, level: usize, old: usize, new: usize) -> bool {
        self.tower[level]
            .next
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(super) fn cas_prev_offset(&self, level: usize, old: usize, new: usize) -> bool {
        self.tower[level]
            .prev
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The worst-case allocation size of a node for the given key and value
/// sizes, padding included.
pub fn max_node_size(key_size: usize, value_size: usize) -> usize {
    MAX_NODE_SIZE + key_size + value_size + WORD - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::key::Kind;
    use crate::seqnum::SeqNum;

    #[test]
    fn test_truncated_tower_size() {
        // A single-level node saves the full unused tower suffix.
        assert_eq!(MAX_UNUSED_TOWER, (MAX_HEIGHT - 1) * LINKS_SIZE);
        assert!(MAX_NODE_SIZE > MAX_UNUSED_TOWER);
    }

    #[test]
    fn test_node_at_arena_boundary() {
        // Allocate a node with successively larger arena sizes until one
        // fits. Every failing attempt exercises the boundary where a node
        // would straddle the live region; the overflow reservation keeps
        // the full struct addressable within the buffer.
        let key = InternalKey::new(b"a", SeqNum::START, Kind::Set);
        let mut fit = None;
        for size in 1..512usize {
            let arena = Arena::heap(size).overflow(MAX_UNUSED_TOWER.min(size));
            match Node::alloc(&arena, 1, key, b"b") {
                Ok(offset) => {
                    let nd = unsafe { &*(arena.ptr(offset) as *const Node) };
                    assert!(offset + nd.alloc_size() <= arena.cap() + 1);
                    fit = Some(size);
                    break;
                }
                Err(err) => assert_eq!(err, Error::ArenaFull),
            }
        }
        assert!(fit.is_some(), "no arena size fit a single node");
    }

    #[test]
    fn test_max_node_size_is_an_upper_bound() {
        let arena = Arena::heap(4096).overflow(MAX_UNUSED_TOWER);
        let key = InternalKey::new(b"k", SeqNum::START, Kind::Set);
        let before = arena.len();
        Node::alloc(&arena, MAX_HEIGHT, key, b"v").unwrap();
        assert!(arena.len() - before <= max_node_size(1, 1));
    }

    #[test]
    fn test_key_value_round_trip() {
        let arena = Arena::heap(4096).overflow(MAX_UNUSED_TOWER);
        let key = InternalKey::new(b"user-key", SeqNum(42), Kind::Set);
        let offset = Node::alloc(&arena, 3, key, &[1, 0, 1, 0]).unwrap();

        let nd = unsafe { &*(arena.ptr(offset) as *const Node) };
        assert_eq!(arena.bytes(nd.key_offset(), nd.key_size()), b"user-key");
        assert_eq!(
            arena.bytes(nd.key_offset() + nd.key_size(), nd.value_size()),
            &[1, 0, 1, 0]
        );
        assert_eq!(nd.trailer(), Trailer::new(SeqNum(42), Kind::Set));
    }
}
