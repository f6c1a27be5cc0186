//! The in-memory write buffer fronting the on-disk store.
//!
//! A memtable is one skiplist plus lifecycle state. Writers insert through
//! it, readers iterate through it, and exactly one flush drains it:
//!
//! ```text
//!  Writable ──TransitionToReadOnly──► ReadOnly ──flush handoff──► Flushed
//!     │                                  │                           │
//!     └── inserts, iterators ────────────┴── iterators only ─────────┘
//!                                                                    │
//!                         refs == 0 ◄── readers close, OnFlushed ────┘
//!                             │
//!                       ReleaseArena (arena reused by a new memtable)
//! ```
//!
//! The transition is a single atomic CAS, so any number of concurrent
//! triggers elect exactly one. Inserts double-check the read-only flag
//! around joining the inflight-writer count, which lets the transition
//! drain every writer that slipped past the first check before the flush
//! iterator is handed out.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::arena::Arena;
use crate::config::{MemtableOptions, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::key::{bytewise_compare, InternalKey};
use crate::log::{self, Log};
use crate::seqnum::SeqNum;
use crate::skiplist::{FlushIter, Iter, Skiplist, MAX_UNUSED_TOWER};

/// The sstable-writer handoff: invoked exactly once with the flush
/// iterator after the read-only transition drains inflight writers. The
/// writer must call [`Memtable::on_flushed`] exactly once when it finishes,
/// on success or failure.
pub type FlushHandoff = Box<dyn FnOnce(FlushIter) + Send>;

/// Arena bytes consumed by an empty skiplist (its two sentinel towers).
/// Computed once per process by constructing a throwaway skiplist, which
/// avoids any static initialisation order hazard.
fn empty_skiplist_size() -> usize {
    static EMPTY: OnceLock<usize> = OnceLock::new();
    *EMPTY.get_or_init(|| {
        let arena = Arena::heap(BLOCK_SIZE).overflow(MAX_UNUSED_TOWER);
        let skiplist = Skiplist::new(Arc::new(arena), bytewise_compare)
            .expect("a block-sized arena holds an empty skiplist");
        skiplist.size()
    })
}

struct State {
    /// Readers plus the current-writer slot. Starts at 1; the slot
    /// reference is released by `on_flushed`. The memtable is quiescent at
    /// zero, at which point the arena may be recycled.
    refs: AtomicUsize,
    /// Inserts currently between the double-checks.
    writers: AtomicUsize,
    /// One-way. Set by the elected flush trigger.
    read_only: AtomicBool,
    /// Guards `on_flushed` against double decrements.
    flushed: AtomicBool,
}

struct WriterGuard<'a> {
    state: &'a State,
}

impl<'a> WriterGuard<'a> {
    // The counter increment and the read-only re-check form a
    // store-buffer pair with the transition's flag store and counter
    // read; both sides need sequential consistency or the drain can miss
    // an inflight writer.
    fn enter(state: &'a State) -> WriterGuard<'a> {
        state.writers.fetch_add(1, Ordering::SeqCst);
        WriterGuard { state }
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.state.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A single skiplist with lifecycle state: reference counting, an
/// inflight-writer barrier, the one-way read-only transition, and the
/// at-most-once flush handoff.
pub struct Memtable {
    /// Sequence number at creation; a lower bound for every record written
    /// to this memtable.
    seq_num: SeqNum,
    /// `None` once the arena has been released; the memtable is unusable
    /// from then on.
    skiplist: Option<Arc<Skiplist>>,
    log: Option<Arc<dyn Log>>,
    flush: Mutex<Option<FlushHandoff>>,
    state: Arc<State>,
}

impl Memtable {
    /// Creates a memtable with a fresh arena. The configured arena size is
    /// rounded down to a disk-block multiple, with one block as the floor.
    pub fn new(options: MemtableOptions) -> Result<Memtable> {
        let size = if options.arena_size < BLOCK_SIZE {
            BLOCK_SIZE
        } else {
            options.arena_size - options.arena_size % BLOCK_SIZE
        };
        let arena = Arena::new(size).overflow(MAX_UNUSED_TOWER);
        Memtable::build(arena, options)
    }

    /// Creates a memtable reusing the arena of a retired memtable. The
    /// arena is reset; its previous contents are forgotten.
    pub fn with_arena(mut arena: Arena, options: MemtableOptions) -> Result<Memtable> {
        arena.reset();
        tracing::debug!(cap = arena.cap(), "reusing retired arena");
        Memtable::build(arena, options)
    }

    fn build(arena: Arena, options: MemtableOptions) -> Result<Memtable> {
        let skiplist = Skiplist::new(Arc::new(arena), options.comparator)?;
        Ok(Memtable {
            seq_num: options.seq_num,
            skiplist: Some(Arc::new(skiplist)),
            log: options.log,
            flush: Mutex::new(options.flush),
            state: Arc::new(State {
                refs: AtomicUsize::new(1),
                writers: AtomicUsize::new(0),
                read_only: AtomicBool::new(false),
                flushed: AtomicBool::new(false),
            }),
        })
    }

    /// Inserts one record, appending it to the log first. Never partially
    /// inserts.
    ///
    /// Advisory failures: `Flushed` after the read-only transition,
    /// `MemtableFull` when the arena is exhausted (the caller rotates to a
    /// new memtable), `RecordExists` for a duplicate (user key, trailer)
    /// pair (the caller retries with a higher sequence number).
    /// `InvalidSeqNum` is a programmer error: the record predates this
    /// memtable.
    pub fn insert(&self, key: InternalKey, value: &[u8]) -> Result<()> {
        let skiplist = self.skiplist.as_ref().ok_or(Error::NoBuffer)?;
        if key.seq_num() < self.seq_num {
            return Err(Error::InvalidSeqNum);
        }
        if self.state.read_only.load(Ordering::SeqCst) {
            return Err(Error::Flushed);
        }

        let result = {
            let _inflight = WriterGuard::enter(&self.state);
            // Re-check after joining the writer count: the transition sets
            // the flag before draining writers, so a writer passing both
            // checks is guaranteed to be waited on.
            if self.state.read_only.load(Ordering::SeqCst) {
                return Err(Error::Flushed);
            }
            if let Some(log) = &self.log {
                log.append(&log::encode_record(key, value))?;
            }
            skiplist.add(key, value)
        };

        match result {
            Err(Error::ArenaFull) => {
                // This writer is the candidate to freeze the table; the CAS
                // inside the transition elects exactly one. Having left the
                // writer count above, it can wait out its peers safely.
                self.transition_to_read_only();
                Err(Error::MemtableFull)
            }
            other => other,
        }
    }

    /// Returns a bounded iterator holding a reference on this memtable.
    /// The reference is released when the iterator is dropped.
    pub fn iter(&self, lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) -> Result<Iter> {
        let skiplist = self.skiplist.as_ref().ok_or(Error::NoBuffer)?;
        self.state.refs.fetch_add(1, Ordering::AcqRel);
        let state = Arc::clone(&self.state);
        Ok(skiplist.iter(
            lower,
            upper,
            Some(Box::new(move || {
                state.refs.fetch_sub(1, Ordering::AcqRel);
            })),
        ))
    }

    /// The flush iterator, for the single sstable writer. Meaningful only
    /// after the read-only transition.
    pub fn flush_iterate(&self) -> Result<FlushIter> {
        let skiplist = self.skiplist.as_ref().ok_or(Error::NoBuffer)?;
        Ok(skiplist.flush_iter())
    }

    /// Flips the memtable to read-only, waits for inflight writers to
    /// drain, and delivers the flush iterator to the registered handoff.
    /// Idempotent: concurrent and repeated calls elect exactly one
    /// transition, and only that call returns `true`.
    pub fn transition_to_read_only(&self) -> bool {
        if self
            .state
            .read_only
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        tracing::info!(size = self.size(), "memtable transitioning to read-only");

        // Bounded by the longest running insert.
        while self.state.writers.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }

        let handoff = self.flush.lock().unwrap().take();
        if let Some(handoff) = handoff {
            if let Some(skiplist) = &self.skiplist {
                tracing::debug!("delivering flush iterator");
                handoff(skiplist.flush_iter());
            }
        }
        true
    }

    /// Called by the sstable writer when the flush completes, on success or
    /// failure. Releases the current-writer slot reference; extra calls are
    /// ignored.
    pub fn on_flushed(&self) {
        if !self.state.flushed.swap(true, Ordering::AcqRel) {
            tracing::debug!("flush complete, releasing writer slot reference");
            self.state.refs.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// True while anything still references the memtable. The arena may be
    /// recycled only once this returns false.
    pub fn is_active(&self) -> bool {
        self.state.refs.load(Ordering::Acquire) != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.state.read_only.load(Ordering::Acquire)
    }

    /// True when no record has ever been inserted.
    pub fn empty(&self) -> bool {
        match &self.skiplist {
            Some(skiplist) => skiplist.size() == empty_skiplist_size(),
            None => true,
        }
    }

    /// Arena bytes consumed, padding included. Zero after the arena has
    /// been released.
    pub fn size(&self) -> usize {
        self.skiplist.as_ref().map_or(0, |s| s.size())
    }

    /// Arena bytes available over the memtable's lifetime. Zero after the
    /// arena has been released.
    pub fn cap(&self) -> usize {
        self.skiplist.as_ref().map_or(0, |s| s.arena().cap())
    }

    /// The creation sequence number: a lower bound for every record.
    pub fn seq_num(&self) -> SeqNum {
        self.seq_num
    }

    /// Detaches and returns the arena for reuse in a new memtable. Fails
    /// with `Active` while references remain. The memtable is unusable
    /// afterwards: inserts and iterators fail with `NoBuffer` and sizes
    /// report zero.
    pub fn release_arena(&mut self) -> Result<Arena> {
        if self.is_active() {
            return Err(Error::Active);
        }
        let skiplist = self.skiplist.take().ok_or(Error::NoBuffer)?;
        let skiplist = match Arc::try_unwrap(skiplist) {
            Ok(skiplist) => skiplist,
            Err(shared) => {
                self.skiplist = Some(shared);
                return Err(Error::Active);
            }
        };
        match Arc::try_unwrap(skiplist.into_arena()) {
            Ok(arena) => {
                tracing::debug!(cap = arena.cap(), "arena detached from quiescent memtable");
                Ok(arena)
            }
            // Unreachable once refs hit zero: iterators hold the skiplist,
            // not the arena.
            Err(_) => Err(Error::Active),
        }
    }

    /// Closes the log handle and releases the arena's backing mapping.
    pub fn close(self) -> Result<()> {
        if let Some(log) = &self.log {
            log.close()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("seq_num", &self.seq_num)
            .field("size", &self.size())
            .field("read_only", &self.is_read_only())
            .field("refs", &self.state.refs.load(Ordering::Relaxed))
            .finish()
    }
}
