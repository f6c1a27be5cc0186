//! Cinder: the concurrent in-memory write path of an LSM-tree store.
//!
//! The crate implements the write buffer that fronts an on-disk
//! log-structured store: a lock-free, arena-backed skiplist keyed by
//! (user key, sequence number, kind), wrapped in a memtable that
//! coordinates writers, readers, and a single asynchronous flush.
//!
//! ```text
//!             writers                readers
//!                │                      │
//!                ▼                      ▼
//!          ┌──────────┐   iterators ┌───────┐
//!   log ◄──│ Memtable │─────────────│ Iter  │
//!          └──────────┘             └───────┘
//!                │
//!                ▼
//!          ┌──────────┐  offsets  ┌───────┐
//!          │ Skiplist │───────────│ Arena │
//!          └──────────┘           └───────┘
//!                │
//!                ▼  read-only transition
//!          ┌───────────┐
//!          │ FlushIter │──► sstable writer
//!          └───────────┘
//! ```
//!
//! # Write path
//!
//! 1. The façade draws a sequence number from its [`AtomicSeqNum`] and
//!    calls [`Memtable::insert`] with an [`InternalKey`].
//! 2. The memtable appends the record to its log handle, then splices a
//!    node into the skiplist; the node, its key and its value live in one
//!    arena allocation.
//! 3. When the arena fills, the insert that observed exhaustion triggers
//!    the read-only transition; exactly one flush iterator is handed to
//!    the sstable writer, and the façade rotates to a new memtable.
//! 4. Once the flush completes and all readers close, the memtable is
//!    quiescent and its arena can back the next memtable.
//!
//! All shared mutation is through atomic operations; no mutex sits on the
//! hot path.

pub mod arena;
pub mod config;
pub mod error;
pub mod key;
pub mod log;
pub mod memtable;
pub mod seqnum;
pub mod skiplist;

pub use arena::Arena;
pub use config::{MemtableOptions, BLOCK_SIZE};
pub use error::{Error, Result};
pub use key::{bytewise_compare, Compare, InternalKey, Kind, Trailer};
pub use log::Log;
pub use memtable::{FlushHandoff, Memtable};
pub use seqnum::{AtomicSeqNum, SeqNum};
pub use skiplist::{max_node_size, FlushIter, Inserter, Iter, Skiplist};
