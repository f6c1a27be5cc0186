//! The memtable's log collaborator.
//!
//! Durability belongs to the log, not the skiplist: the memtable appends an
//! encoded record to its log handle before the skiplist observes the write,
//! so a crash can always be replayed from the log tail.
//!
//! # Record format
//!
//! Each record is variable-length:
//!
//! ```text
//! +-----------+-------+------------+-----------+-------+----------+
//! |key_len:u32| key   |trailer:u64 |val_len:u32| value |crc32:u32 |
//! +-----------+-------+------------+-----------+-------+----------+
//! |  4 bytes  |var len|  8 bytes   |  4 bytes  |var len| 4 bytes  |
//! +-----------+-------+------------+-----------+-------+----------+
//! ```
//!
//! Lengths use big-endian encoding; the trailer is persisted little-endian,
//! matching its on-disk form everywhere else in the store. The CRC32
//! checksum covers the entire record excluding the checksum itself.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::key::{InternalKey, Trailer};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A log handle owned by a memtable. Append must succeed before the
/// skiplist insert proceeds.
pub trait Log: Send + Sync {
    fn append(&self, record: &[u8]) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// Encodes one internal key-value pair as a log record.
pub fn encode_record(key: InternalKey, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.user_key.len() + 8 + 4 + value.len() + 4);
    let mut scratch = [0u8; 8];

    BigEndian::write_u32(&mut scratch[..4], key.user_key.len() as u32);
    buf.extend_from_slice(&scratch[..4]);
    buf.extend_from_slice(key.user_key);

    LittleEndian::write_u64(&mut scratch, key.trailer.raw());
    buf.extend_from_slice(&scratch);

    BigEndian::write_u32(&mut scratch[..4], value.len() as u32);
    buf.extend_from_slice(&scratch[..4]);
    buf.extend_from_slice(value);

    let crc = CRC32.checksum(&buf);
    BigEndian::write_u32(&mut scratch[..4], crc);
    buf.extend_from_slice(&scratch[..4]);

    buf
}

/// Decodes a log record, verifying the checksum and the kind byte.
pub fn decode_record(buf: &[u8]) -> Result<(Vec<u8>, Trailer, Vec<u8>)> {
    if buf.len() < 4 + 8 + 4 + 4 {
        return Err(Error::InvalidData("log record too short".to_string()));
    }
    let (body, crc_bytes) = buf.split_at(buf.len() - 4);
    let crc = BigEndian::read_u32(crc_bytes);
    if crc != CRC32.checksum(body) {
        return Err(Error::InvalidData("log record checksum mismatch".to_string()));
    }

    let key_len = BigEndian::read_u32(&body[..4]) as usize;
    let rest = &body[4..];
    if rest.len() < key_len + 8 + 4 {
        return Err(Error::InvalidData("log record truncated".to_string()));
    }
    let (key, rest) = rest.split_at(key_len);
    let trailer = LittleEndian::read_u64(&rest[..8]);
    let trailer = Trailer::from_raw(trailer)
        .ok_or_else(|| Error::InvalidData(format!("bad kind byte in trailer {trailer:#x}")))?;
    let value_len = BigEndian::read_u32(&rest[8..12]) as usize;
    let value = &rest[12..];
    if value.len() != value_len {
        return Err(Error::InvalidData("log record length mismatch".to_string()));
    }

    Ok((key.to_vec(), trailer, value.to_vec()))
}

/// A file-backed log. Records are buffered and framed with a big-endian
/// length prefix; `sync` makes everything appended so far durable.
pub struct FileLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl FileLog {
    pub fn create(path: impl AsRef<Path>) -> Result<FileLog> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(FileLog {
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes buffered records and syncs the file to disk.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Reads back every intact record in the file. A torn record at the
    /// tail is tolerated and ends the replay.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<(Vec<u8>, Trailer, Vec<u8>)>> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let mut records = Vec::new();
        loop {
            let len = match reader.read_u32::<BigEndian>() {
                Ok(len) => len as usize,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            };
            let mut record = vec![0u8; len];
            match reader.read_exact(&mut record) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            records.push(decode_record(&record)?);
        }
        Ok(records)
    }
}

impl Log for FileLog {
    fn append(&self, record: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_u32::<BigEndian>(record.len() as u32)?;
        writer.write_all(record)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.sync()
    }
}

impl std::fmt::Debug for FileLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLog").field("path", &self.path).finish()
    }
}

/// An in-memory log, used in tests and by callers that provide durability
/// elsewhere.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<Vec<u8>>>,
}

impl MemoryLog {
    pub fn new() -> MemoryLog {
        MemoryLog::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<Vec<u8>> {
        self.records.lock().unwrap().clone()
    }
}

impl Log for MemoryLog {
    fn append(&self, record: &[u8]) -> Result<()> {
        self.records.lock().unwrap().push(record.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Kind;
    use crate::seqnum::SeqNum;

    #[test]
    fn test_record_round_trip() {
        let key = InternalKey::new(b"key1", SeqNum(42), Kind::Set);
        let record = encode_record(key, b"value1");
        let (user_key, trailer, value) = decode_record(&record).unwrap();
        assert_eq!(user_key, b"key1");
        assert_eq!(trailer, Trailer::new(SeqNum(42), Kind::Set));
        assert_eq!(value, b"value1");
    }

    #[test]
    fn test_record_round_trip_empty_key_and_value() {
        let key = InternalKey::new(b"", SeqNum(1), Kind::Delete);
        let record = encode_record(key, b"");
        let (user_key, trailer, value) = decode_record(&record).unwrap();
        assert!(user_key.is_empty());
        assert_eq!(trailer.kind(), Kind::Delete);
        assert!(value.is_empty());
    }

    #[test]
    fn test_corruption_detected() {
        let key = InternalKey::new(b"key1", SeqNum(42), Kind::Set);
        let mut record = encode_record(key, b"value1");
        record[6] ^= 0x01;
        assert!(matches!(
            decode_record(&record),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let key = InternalKey::new(b"key1", SeqNum(42), Kind::Set);
        let record = encode_record(key, b"value1");
        assert!(decode_record(&record[..record.len() - 5]).is_err());
        assert!(decode_record(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_file_log_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001.log");

        let log = FileLog::create(&path).unwrap();
        for i in 10u64..20 {
            let key_str = format!("key{i}");
            let key = InternalKey::new(key_str.as_bytes(), SeqNum(i), Kind::Set);
            log.append(&encode_record(key, b"value")).unwrap();
        }
        log.close().unwrap();

        let records = FileLog::replay(&path).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[0].0, b"key10");
        assert_eq!(records[9].1.seq_num(), SeqNum(19));
    }

    #[test]
    fn test_file_log_replay_tolerates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0002.log");

        let log = FileLog::create(&path).unwrap();
        let key = InternalKey::new(b"key", SeqNum(10), Kind::Set);
        log.append(&encode_record(key, b"value")).unwrap();
        log.close().unwrap();

        // Append a length prefix with no body, as a crash mid-write would.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 0, 99, 1, 2]).unwrap();
        file.sync_all().unwrap();

        let records = FileLog::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_memory_log_collects_records() {
        let log = MemoryLog::new();
        assert!(log.is_empty());
        log.append(b"abc").unwrap();
        log.append(b"def").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.records()[1], b"def");
        log.close().unwrap();
    }
}
