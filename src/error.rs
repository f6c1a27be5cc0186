use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Cinder errors.
///
/// Advisory errors (`ArenaFull`, `MemtableFull`, `Flushed`, `RecordExists`)
/// are part of the normal control flow of the database façade: it reacts by
/// rotating to a new memtable or retrying at a higher sequence number.
/// The remaining kinds indicate programmer error or I/O failure and should
/// abort the current request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The memtable still has reader or flush references; the arena cannot
    /// be released yet.
    Active,
    /// The arena cannot satisfy the requested allocation. Capacity only
    /// returns with a reset; the caller must switch to a different arena.
    ArenaFull,
    /// A write was attempted after the memtable transitioned to read-only.
    Flushed,
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values.
    InvalidData(String),
    /// A record carried a sequence number below the memtable's creation
    /// sequence.
    InvalidSeqNum,
    /// An IO error.
    IO(String),
    /// The memtable's arena is exhausted. The caller should rotate to a new
    /// memtable and retry the write there.
    MemtableFull,
    /// The memtable's arena has been released; the table is unusable.
    NoBuffer,
    /// A record with this user key and trailer already exists. The caller
    /// should retry with a larger sequence number.
    RecordExists,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Active => write!(f, "memtable still has active references"),
            Error::ArenaFull => write!(f, "allocation failed because arena is full"),
            Error::Flushed => write!(f, "memtable flushed"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidSeqNum => write!(f, "sequence number below memtable creation sequence"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::MemtableFull => write!(f, "memtable is full"),
            Error::NoBuffer => write!(f, "memtable has no arena"),
            Error::RecordExists => write!(f, "record with this key already exists"),
        }
    }
}

/// A Cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
