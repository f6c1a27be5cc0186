use std::sync::Arc;

use crate::key::{bytewise_compare, Compare};
use crate::log::Log;
use crate::memtable::FlushHandoff;
use crate::seqnum::SeqNum;

/// Disk block size. Arena sizes are rounded to block multiples so a flushed
/// memtable maps cleanly onto aligned table writes.
pub const BLOCK_SIZE: usize = 4096;

/// Default arena size for a memtable (64MB).
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for a memtable.
pub struct MemtableOptions {
    /// Arena capacity in bytes; rounded down to a block multiple with one
    /// block as the floor (default: 64MB).
    pub arena_size: usize,

    /// Creation sequence number: a lower bound for every record written to
    /// the memtable (default: [`SeqNum::START`]).
    pub seq_num: SeqNum,

    /// User-key comparator (default: bytewise lexicographic).
    pub comparator: Compare,

    /// The log handle appended to before every insert (default: none).
    pub log: Option<Arc<dyn Log>>,

    /// The sstable-writer handoff invoked once by the read-only transition
    /// (default: none).
    pub flush: Option<FlushHandoff>,
}

impl Default for MemtableOptions {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            seq_num: SeqNum::START,
            comparator: bytewise_compare,
            log: None,
            flush: None,
        }
    }
}

impl MemtableOptions {
    /// Create options with the given arena size.
    pub fn new(arena_size: usize) -> Self {
        Self {
            arena_size,
            ..Default::default()
        }
    }

    /// Set the arena size.
    pub fn arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    /// Set the creation sequence number.
    pub fn seq_num(mut self, seq: SeqNum) -> Self {
        self.seq_num = seq;
        self
    }

    /// Set the user-key comparator.
    pub fn comparator(mut self, comparator: Compare) -> Self {
        self.comparator = comparator;
        self
    }

    /// Attach a log handle.
    pub fn log(mut self, log: Arc<dyn Log>) -> Self {
        self.log = Some(log);
        self
    }

    /// Register the flush handoff.
    pub fn flush(mut self, flush: FlushHandoff) -> Self {
        self.flush = Some(flush);
        self
    }
}

impl std::fmt::Debug for MemtableOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemtableOptions")
            .field("arena_size", &self.arena_size)
            .field("seq_num", &self.seq_num)
            .field("log", &self.log.is_some())
            .field("flush", &self.flush.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = MemtableOptions::default();
        assert_eq!(options.arena_size, DEFAULT_ARENA_SIZE);
        assert_eq!(options.seq_num, SeqNum::START);
        assert!(options.log.is_none());
        assert!(options.flush.is_none());
    }

    #[test]
    fn test_options_builder() {
        let options = MemtableOptions::new(BLOCK_SIZE * 8).seq_num(SeqNum(42));
        assert_eq!(options.arena_size, BLOCK_SIZE * 8);
        assert_eq!(options.seq_num, SeqNum(42));
    }
}
