use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

/// A sequence number defining precedence among identical user keys. A record
/// with a higher sequence number takes precedence over a record with an equal
/// user key and a lower sequence number. Sequence numbers are stored within
/// the internal key trailer as a 7-byte (uint56) integer, so the maximum
/// sequence number is 2^56-1. As records are committed, they are assigned
/// increasing sequence numbers by the database façade. Readers use sequence
/// numbers to read a consistent database state, ignoring records with
/// sequence numbers larger than their visible sequence number.
///
/// The store maintains an invariant that no two point records with equal
/// user keys may have equal sequence numbers; records with differing user
/// keys may. A memtable reports a violation of this invariant as
/// [`Error::RecordExists`](crate::Error::RecordExists).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum(pub u64);

impl SeqNum {
    /// The zero sequence number. Not assigned to live writes; kept for
    /// compaction layers that can prove no records exist underneath a key.
    pub const ZERO: SeqNum = SeqNum(0);

    /// The first sequence number assigned to a record. Sequence numbers
    /// 1-9 are reserved for potential future use.
    pub const START: SeqNum = SeqNum(10);

    /// The largest valid sequence number.
    pub const MAX: SeqNum = SeqNum((1 << 56) - 1);

    /// Set on batch sequence numbers by the façade. Transparent to the
    /// memtable; it orders like any other bit of the sequence number.
    pub const BATCH_BIT: SeqNum = SeqNum(1 << 55);
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if *self == SeqNum::MAX {
            return write!(f, "inf");
        }
        let mut n = self.0;
        let mut batch = "";
        if n & SeqNum::BATCH_BIT.0 != 0 {
            batch = "b";
            n &= !SeqNum::BATCH_BIT.0;
        }
        write!(f, "{batch}{n}")
    }
}

impl FromStr for SeqNum {
    type Err = Error;

    /// Parses the diagnostic string form of a sequence number: `inf` for
    /// the maximum, a leading `b` for the batch bit, otherwise decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "inf" {
            return Ok(SeqNum::MAX);
        }
        let (batch, digits) = match s.strip_prefix('b') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let n = digits
            .parse::<u64>()
            .map_err(|err| Error::InvalidData(format!("bad seqnum {s:?}: {err}")))?;
        let mut seq = SeqNum(n);
        if batch {
            seq.0 |= SeqNum::BATCH_BIT.0;
        }
        Ok(seq)
    }
}

/// An atomic [`SeqNum`]. The database façade draws one value per write from
/// a single shared counter; the memtable only ever reads them.
#[derive(Debug, Default)]
pub struct AtomicSeqNum {
    value: AtomicU64,
}

impl AtomicSeqNum {
    pub fn new(seq: SeqNum) -> Self {
        Self {
            value: AtomicU64::new(seq.0),
        }
    }

    /// Atomically loads and returns the stored sequence number.
    pub fn load(&self) -> SeqNum {
        SeqNum(self.value.load(Ordering::Acquire))
    }

    /// Atomically stores `seq`.
    pub fn store(&self, seq: SeqNum) {
        self.value.store(seq.0, Ordering::Release);
    }

    /// Atomically adds `delta` and returns the new value.
    pub fn add(&self, delta: u64) -> SeqNum {
        SeqNum(self.value.fetch_add(delta, Ordering::AcqRel) + delta)
    }

    /// Executes the compare-and-swap operation.
    pub fn compare_and_swap(&self, old: SeqNum, new: SeqNum) -> bool {
        self.value
            .compare_exchange(old.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_form() {
        assert_eq!(SeqNum(42).to_string(), "42");
        assert_eq!(SeqNum::MAX.to_string(), "inf");
        assert_eq!(SeqNum(SeqNum::BATCH_BIT.0 | 7).to_string(), "b7");
    }

    #[test]
    fn test_parse() {
        assert_eq!("42".parse::<SeqNum>().unwrap(), SeqNum(42));
        assert_eq!("inf".parse::<SeqNum>().unwrap(), SeqNum::MAX);
        assert_eq!(
            "b7".parse::<SeqNum>().unwrap(),
            SeqNum(SeqNum::BATCH_BIT.0 | 7)
        );
        assert!("x7".parse::<SeqNum>().is_err());
    }

    #[test]
    fn test_parse_round_trip() {
        for seq in [
            SeqNum::ZERO,
            SeqNum::START,
            SeqNum(12345),
            SeqNum(SeqNum::BATCH_BIT.0 | 12345),
            SeqNum::MAX,
        ] {
            assert_eq!(seq.to_string().parse::<SeqNum>().unwrap(), seq);
        }
    }

    #[test]
    fn test_atomic_counter() {
        let counter = AtomicSeqNum::new(SeqNum::START);
        assert_eq!(counter.load(), SeqNum::START);
        assert_eq!(counter.add(1), SeqNum(11));
        assert_eq!(counter.add(5), SeqNum(16));

        assert!(!counter.compare_and_swap(SeqNum(11), SeqNum(20)));
        assert!(counter.compare_and_swap(SeqNum(16), SeqNum(20)));
        assert_eq!(counter.load(), SeqNum(20));

        counter.store(SeqNum(100));
        assert_eq!(counter.load(), SeqNum(100));
    }
}
