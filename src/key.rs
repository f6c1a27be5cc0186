use std::cmp::Ordering;
use std::fmt::Display;

use crate::seqnum::SeqNum;

/// The kind byte classifying an internal key. The numeric values are fixed
/// on the wire; changing them breaks compatibility with existing tables and
/// logs.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Delete = 0,
    Set = 1,
    Merge = 2,
    LogData = 3,
    SingleDelete = 7,
    RangeDelete = 15,
    /// A separator / successor key written to sstable block indexes. Never
    /// stored in a memtable.
    Separator = 17,
    RangeKeyDelete = 19,
    RangeKeyUnset = 20,
    RangeKeySet = 21,
    /// Distinguishes a log entry for ingested sstables added to the flush
    /// queue. Cannot appear amongst other kinds in a batch or in a table.
    IngestSst = 22,
    /// Sorts before every other kind at an equal user key and sequence
    /// number. Used to build search keys; not part of the file format.
    Max = 23,
}

impl Kind {
    pub fn from_u8(b: u8) -> Option<Kind> {
        match b {
            0 => Some(Kind::Delete),
            1 => Some(Kind::Set),
            2 => Some(Kind::Merge),
            3 => Some(Kind::LogData),
            7 => Some(Kind::SingleDelete),
            15 => Some(Kind::RangeDelete),
            17 => Some(Kind::Separator),
            19 => Some(Kind::RangeKeyDelete),
            20 => Some(Kind::RangeKeyUnset),
            21 => Some(Kind::RangeKeySet),
            22 => Some(Kind::IngestSst),
            23 => Some(Kind::Max),
            _ => None,
        }
    }

    /// True for kinds that logically delete a point record.
    pub fn is_tombstone(self) -> bool {
        matches!(self, Kind::Delete | Kind::SingleDelete)
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Kind::Delete => "DEL",
            Kind::Set => "SET",
            Kind::Merge => "MERGE",
            Kind::LogData => "LOGDATA",
            Kind::SingleDelete => "SINGLEDEL",
            Kind::RangeDelete => "RANGEDEL",
            Kind::Separator => "SEPARATOR",
            Kind::RangeKeyDelete => "RANGEKEYDEL",
            Kind::RangeKeyUnset => "RANGEKEYUNSET",
            Kind::RangeKeySet => "RANGEKEYSET",
            Kind::IngestSst => "INGESTSST",
            Kind::Max => "MAX",
        };
        write!(f, "{name}")
    }
}

/// The packed `(sequence << 8) | kind` tail of an internal key. Trailers
/// order descending among records with an equal user key, so a newer write
/// sorts before the records it shadows. When persisted, the 64-bit value is
/// stored little-endian.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Trailer(u64);

impl Trailer {
    /// Constructs an internal key trailer from the specified sequence
    /// number and kind.
    pub fn new(seq: SeqNum, kind: Kind) -> Trailer {
        Trailer((seq.0 << 8) | kind as u64)
    }

    /// Returns the sequence number component of the trailer.
    pub fn seq_num(self) -> SeqNum {
        SeqNum(self.0 >> 8)
    }

    /// Returns the key kind component of the trailer.
    ///
    /// Trailers are only ever built from a [`Kind`], so the low byte is
    /// always a valid kind; [`Trailer::from_raw`] validates before
    /// constructing.
    pub fn kind(self) -> Kind {
        match Kind::from_u8(self.0 as u8) {
            Some(kind) => kind,
            None => unreachable!("trailer holds an invalid kind byte"),
        }
    }

    /// The raw packed representation, as persisted.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Reconstructs a trailer from its raw representation, validating the
    /// kind byte.
    pub fn from_raw(raw: u64) -> Option<Trailer> {
        Kind::from_u8(raw as u8).map(|_| Trailer(raw))
    }
}

impl Display for Trailer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{},{}", self.seq_num(), self.kind())
    }
}

/// An internal key: the caller-provided user key plus the packed trailer.
///
/// Internal keys order by user key ascending, then sequence number
/// descending, then kind descending. Two internal keys are equal only when
/// both the user key and the trailer are equal.
#[derive(Clone, Copy, Debug)]
pub struct InternalKey<'a> {
    pub user_key: &'a [u8],
    pub trailer: Trailer,
}

impl<'a> InternalKey<'a> {
    /// Constructs an internal key from a user key, sequence number and kind.
    pub fn new(user_key: &'a [u8], seq: SeqNum, kind: Kind) -> InternalKey<'a> {
        InternalKey {
            user_key,
            trailer: Trailer::new(seq, kind),
        }
    }

    /// Constructs an internal key appropriate for searching for the given
    /// user key. The search key carries the maximal sequence number and
    /// kind, ensuring it sorts before any record with the same user key.
    pub fn search(user_key: &'a [u8]) -> InternalKey<'a> {
        InternalKey::new(user_key, SeqNum::MAX, Kind::Max)
    }

    pub fn seq_num(&self) -> SeqNum {
        self.trailer.seq_num()
    }

    pub fn kind(&self) -> Kind {
        self.trailer.kind()
    }
}

/// A user-key comparator. The default is bytewise lexicographic order; a
/// caller may inject its own as long as it defines a total order.
pub type Compare = fn(&[u8], &[u8]) -> Ordering;

/// The default bytewise user-key comparator.
pub fn bytewise_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [Kind; 12] = [
        Kind::Delete,
        Kind::Set,
        Kind::Merge,
        Kind::LogData,
        Kind::SingleDelete,
        Kind::RangeDelete,
        Kind::Separator,
        Kind::RangeKeyDelete,
        Kind::RangeKeyUnset,
        Kind::RangeKeySet,
        Kind::IngestSst,
        Kind::Max,
    ];

    #[test]
    fn test_trailer_round_trip() {
        let seqs = [
            SeqNum::ZERO,
            SeqNum(1),
            SeqNum::START,
            SeqNum(123_456_789),
            SeqNum(SeqNum::BATCH_BIT.0 | 42),
            SeqNum::MAX,
        ];
        for seq in seqs {
            for kind in ALL_KINDS {
                let trailer = Trailer::new(seq, kind);
                assert_eq!(trailer.seq_num(), seq);
                assert_eq!(trailer.kind(), kind);
                assert_eq!(Trailer::from_raw(trailer.raw()), Some(trailer));
            }
        }
    }

    #[test]
    fn test_trailer_from_raw_rejects_bad_kind() {
        assert_eq!(Trailer::from_raw((10 << 8) | 0xff), None);
        assert_eq!(Trailer::from_raw((10 << 8) | 4), None);
    }

    #[test]
    fn test_trailer_orders_descending_by_seq_then_kind() {
        // Higher sequence numbers produce larger trailers; the skiplist
        // inverts the comparison so newer records sort first.
        assert!(Trailer::new(SeqNum(11), Kind::Set) > Trailer::new(SeqNum(10), Kind::Set));
        assert!(Trailer::new(SeqNum(10), Kind::Max) > Trailer::new(SeqNum(10), Kind::Set));
        assert!(Trailer::new(SeqNum(10), Kind::Set) > Trailer::new(SeqNum(10), Kind::Delete));
    }

    #[test]
    fn test_search_key_sorts_before_records() {
        let search = InternalKey::search(b"a");
        let record = InternalKey::new(b"a", SeqNum::MAX, Kind::Set);
        // Equal user keys order by descending trailer.
        assert!(search.trailer > record.trailer);
    }

    #[test]
    fn test_tombstone_kinds() {
        assert!(Kind::Delete.is_tombstone());
        assert!(Kind::SingleDelete.is_tombstone());
        assert!(!Kind::Set.is_tombstone());
        assert!(!Kind::RangeDelete.is_tombstone());
    }

    #[test]
    fn test_display_forms() {
        let key = InternalKey::new(b"a", SeqNum(42), Kind::Set);
        assert_eq!(key.kind(), Kind::Set);
        assert_eq!(key.trailer.to_string(), "#42,SET");
        assert_eq!(Kind::RangeDelete.to_string(), "RANGEDEL");
    }

    #[test]
    fn test_kind_byte_values() {
        assert_eq!(Kind::Delete as u8, 0);
        assert_eq!(Kind::Set as u8, 1);
        assert_eq!(Kind::Merge as u8, 2);
        assert_eq!(Kind::LogData as u8, 3);
        assert_eq!(Kind::SingleDelete as u8, 7);
        assert_eq!(Kind::RangeDelete as u8, 15);
        assert_eq!(Kind::Separator as u8, 17);
        assert_eq!(Kind::RangeKeyDelete as u8, 19);
        assert_eq!(Kind::RangeKeyUnset as u8, 20);
        assert_eq!(Kind::RangeKeySet as u8, 21);
        assert_eq!(Kind::IngestSst as u8, 22);
        assert_eq!(Kind::Max as u8, 23);
    }
}
