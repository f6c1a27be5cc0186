//! Lock-free bump allocator backing a single skiplist.
//!
//! The arena hands out aligned byte ranges from a fixed buffer by atomically
//! advancing a watermark; memory is never reclaimed until the whole arena is
//! reset. Offset 0 is reserved as the arena's nil pointer, which lets the
//! skiplist store "no node" as a plain zero offset.
//!
//! The buffer is preferably an anonymous page mapping: it keeps multi-
//! megabyte write buffers out of the allocator's heap and gets lazy paging
//! from the OS, so an arena sized for the worst case only faults in the
//! pages it actually touches. When mapping fails the arena falls back to an
//! ordinary zeroed heap buffer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Alignment of every node allocation: the machine word size.
pub(crate) const WORD: usize = mem::align_of::<usize>();

enum Backing {
    Mapped(#[allow(dead_code)] MmapMut),
    Heap(Layout),
}

/// A fixed-size byte buffer with a single atomic watermark.
///
/// Allocation is wait-free modulo one fetch-add. Readers may translate
/// offsets to byte views or raw addresses from any thread once the owning
/// allocation has been published.
pub struct Arena {
    position: AtomicUsize,
    base: *mut u8,
    len: usize,
    overflow: usize,
    backing: Backing,
}

// The buffer is only written through freshly allocated, disjoint ranges,
// and the watermark is atomic.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an arena backed by an anonymous page mapping of `size` bytes,
    /// falling back to an ordinary heap buffer if the mapping fails.
    pub fn new(size: usize) -> Arena {
        match MmapMut::map_anon(size.max(1)) {
            Ok(mut map) => {
                let base = map.as_mut_ptr();
                let len = map.len();
                Arena {
                    position: AtomicUsize::new(1),
                    base,
                    len,
                    overflow: 0,
                    backing: Backing::Mapped(map),
                }
            }
            Err(err) => {
                tracing::warn!(size, %err, "anonymous mapping failed, using heap buffer");
                Arena::heap(size)
            }
        }
    }

    /// Creates an arena backed by an ordinary zeroed heap buffer.
    pub fn heap(size: usize) -> Arena {
        let layout = Layout::from_size_align(size.max(1), WORD)
            .expect("arena layout is valid for any practical size");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "arena buffer allocation failed");
        Arena {
            position: AtomicUsize::new(1),
            base,
            len: layout.size(),
            overflow: 0,
            backing: Backing::Heap(layout),
        }
    }

    /// Reserves `overflow` bytes at the tail of the buffer. Allocation fails
    /// once it would cross `len - overflow`, so a caller may dereference a
    /// maximum-size structure at the end of the live region without reading
    /// outside the buffer. Must be set before the first allocation.
    pub fn overflow(mut self, overflow: usize) -> Arena {
        self.overflow = overflow.min(self.len);
        self
    }

    /// Reserves `size + align - 1` bytes by atomically advancing the
    /// watermark and returns the first `align`-aligned offset inside the
    /// reserved range. `align` must be a power of two.
    pub fn alloc(&self, size: usize, align: usize) -> Result<usize> {
        debug_assert!(align.is_power_of_two());
        let limit = self.len - self.overflow;

        // Cheap early reject before touching the watermark.
        if self.position.load(Ordering::Relaxed) > limit {
            return Err(Error::ArenaFull);
        }

        // Pad with enough bytes to guarantee the requested alignment, then
        // re-check: the fetch-add is the authoritative reservation.
        let padded = size + align - 1;
        let position = self.position.fetch_add(padded, Ordering::Relaxed) + padded;
        if position > limit {
            return Err(Error::ArenaFull);
        }

        Ok((position - padded + align) & !(align - 1))
    }

    /// Returns the byte view backing the allocation at `offset`. Offset 0
    /// yields an empty view. The view covers exactly `size` bytes, so a
    /// caller cannot extend it into a neighbouring allocation.
    pub fn bytes(&self, offset: usize, size: usize) -> &[u8] {
        if offset == 0 {
            return &[];
        }
        debug_assert!(offset + size <= self.len);
        unsafe { std::slice::from_raw_parts(self.base.add(offset), size) }
    }

    /// Mutable view of an allocation. Callers must hold the only reference
    /// to the range, which is true exactly once: between `alloc` returning
    /// the offset and the owning node being published.
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, size: usize) -> &mut [u8] {
        debug_assert!(offset != 0 && offset + size <= self.len);
        std::slice::from_raw_parts_mut(self.base.add(offset), size)
    }

    /// Stable raw address of `buffer[offset]`. Offset 0 yields null.
    pub fn ptr(&self, offset: usize) -> *mut u8 {
        if offset == 0 {
            return std::ptr::null_mut();
        }
        debug_assert!(offset < self.len);
        unsafe { self.base.add(offset) }
    }

    /// The offset of a pointer previously obtained from [`Arena::ptr`].
    /// Null yields 0.
    pub fn offset_of(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        ptr as usize - self.base as usize
    }

    /// Bytes handed out so far, padding included.
    pub fn len(&self) -> usize {
        self.position.load(Ordering::Relaxed) - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available to allocations over the arena's lifetime.
    pub fn cap(&self) -> usize {
        self.len - self.overflow - 1
    }

    /// True when the buffer is an anonymous page mapping.
    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Rewinds the watermark, forgetting every allocation. Buffer contents
    /// are unspecified afterwards. Taking `&mut self` proves no view into
    /// the arena outlives the reset.
    pub fn reset(&mut self) {
        self.position.store(1, Ordering::Relaxed);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Backing::Heap(layout) = self.backing {
            unsafe { dealloc(self.base, layout) };
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len())
            .field("cap", &self.cap())
            .field("overflow", &self.overflow)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
