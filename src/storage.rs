use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::model::VectorRecord;

/// Frame header: little-endian payload length.
const LEN_PREFIX: u64 = 4;

/// Refuse frames larger than this when scanning; anything bigger is a torn length.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Append-only record log. Offsets returned by `append` stay valid until the
/// next `rewrite`.
pub trait RecordLog: Send {
    fn append(&mut self, record: &VectorRecord) -> Result<u64>;

    fn read(&self, offset: u64) -> Result<VectorRecord>;

    /// Every frame in write order, with its offset.
    fn scan(&self) -> Result<Vec<(u64, VectorRecord)>>;

    /// Atomically replace the log contents. Returns the new offsets in input order.
    fn rewrite(&mut self, records: &[VectorRecord]) -> Result<Vec<u64>>;

    fn sync(&mut self) -> Result<()>;

    fn len_bytes(&self) -> u64;
}

pub(crate) fn encode(record: &VectorRecord) -> Result<rkyv::AlignedVec> {
    rkyv::to_bytes::<_, 1024>(record).map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn decode(bytes: &[u8], offset: u64) -> Result<VectorRecord> {
    // rkyv validation needs an aligned buffer
    let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    rkyv::from_bytes::<VectorRecord>(&aligned).map_err(|e| StoreError::Corrupt {
        offset,
        reason: format!("{e:?}"),
    })
}

// --- FILE SEGMENT ---

/// Length-prefixed rkyv frames in a single file: [Length (4b)][Data (N bytes)]
#[derive(Debug)]
pub struct Segment {
    pub file_path: PathBuf,
    file: File,
    current_offset: u64,
    strict_durability: bool,
}

impl Segment {
    /// Opens (or creates) the segment. A torn trailing frame from an interrupted
    /// append is truncated away; a bad frame anywhere else is `Corrupt`.
    pub fn open(path: &Path, strict_durability: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let valid_len = Self::valid_prefix(&file, file_len)?;

        if valid_len < file_len {
            warn!(
                path = %path.display(),
                file_len,
                valid_len,
                "truncating torn tail of segment"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), bytes = valid_len, "segment opened");

        Ok(Self {
            file_path: path.to_path_buf(),
            file,
            current_offset: valid_len,
            strict_durability,
        })
    }

    /// Length of the prefix made of complete, decodable frames.
    ///
    /// Only the last frame may be bad; it is a torn append. A frame that fails
    /// to decode with more data after it is reported as corruption.
    fn valid_prefix(file: &File, file_len: u64) -> Result<u64> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut offset = 0u64;
        while offset + LEN_PREFIX <= file_len {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf);
            let end = offset + LEN_PREFIX + len as u64;
            if end > file_len {
                break;
            }
            if len > MAX_FRAME {
                return Err(StoreError::Corrupt {
                    offset,
                    reason: format!("frame length {len} exceeds {MAX_FRAME}"),
                });
            }

            let mut bytes = vec![0u8; len as usize];
            reader.read_exact(&mut bytes)?;
            match decode(&bytes, offset) {
                Ok(_) => offset = end,
                Err(_) if end == file_len => break,
                Err(e) => return Err(e),
            }
        }
        Ok(offset)
    }

    fn write_frame<W: Write>(writer: &mut W, record: &VectorRecord) -> Result<u64> {
        let bytes = encode(record)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| StoreError::Encode(format!("record too large: {} bytes", bytes.len())))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&bytes)?;
        Ok(LEN_PREFIX + bytes.len() as u64)
    }

    fn read_frame(file: &mut File, offset: u64) -> Result<(VectorRecord, u64)> {
        file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes)?;
        let record = decode(&bytes, offset)?;
        Ok((record, LEN_PREFIX + len as u64))
    }
}

impl RecordLog for Segment {
    fn append(&mut self, record: &VectorRecord) -> Result<u64> {
        let start = self.current_offset;
        self.file.seek(SeekFrom::Start(start))?;
        let written = Self::write_frame(&mut self.file, record)?;
        if self.strict_durability {
            self.file.sync_data()?;
        }
        self.current_offset += written;
        Ok(start)
    }

    fn read(&self, offset: u64) -> Result<VectorRecord> {
        if offset >= self.current_offset {
            return Err(StoreError::Corrupt {
                offset,
                reason: "offset past end of segment".into(),
            });
        }
        // Clone file handle so reads don't move the writer's cursor
        let mut file = self.file.try_clone()?;
        Self::read_frame(&mut file, offset).map(|(record, _)| record)
    }

    fn scan(&self) -> Result<Vec<(u64, VectorRecord)>> {
        let mut file = self.file.try_clone()?;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.current_offset {
            let (record, size) = Self::read_frame(&mut file, offset)?;
            out.push((offset, record));
            offset += size;
        }
        Ok(out)
    }

    fn rewrite(&mut self, records: &[VectorRecord]) -> Result<Vec<u64>> {
        let new_path = self.file_path.with_extension("compacted");

        let mut offsets = Vec::with_capacity(records.len());
        {
            let file = File::create(&new_path)?;
            let mut writer = BufWriter::new(file);
            let mut offset = 0;
            for record in records {
                offsets.push(offset);
                offset += Self::write_frame(&mut writer, record)?;
            }
            let file = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
            file.sync_all()?;
        }

        fs::rename(&new_path, &self.file_path)?;
        // Re-open at original path to keep a consistent file handle
        *self = Segment::open(&self.file_path.clone(), self.strict_durability)?;

        info!(
            path = %self.file_path.display(),
            records = records.len(),
            bytes = self.current_offset,
            "segment rewritten"
        );
        Ok(offsets)
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len_bytes(&self) -> u64 {
        self.current_offset
    }
}

// --- IN-MEMORY ---

/// Same framing as `Segment`, kept in a byte buffer.
#[derive(Debug, Default)]
pub struct MemoryLog {
    buf: Vec<u8>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame_at(&self, offset: u64) -> Result<(VectorRecord, u64)> {
        let corrupt = |reason: &str| StoreError::Corrupt { offset, reason: reason.to_string() };

        let start = usize::try_from(offset).map_err(|_| corrupt("offset overflow"))?;
        let len_bytes: [u8; 4] = self
            .buf
            .get(start..start + LEN_PREFIX as usize)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| corrupt("offset past end of log"))?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let body_start = start + LEN_PREFIX as usize;
        let body = self
            .buf
            .get(body_start..body_start + len)
            .ok_or_else(|| corrupt("truncated frame"))?;
        Ok((decode(body, offset)?, LEN_PREFIX + len as u64))
    }
}

impl RecordLog for MemoryLog {
    fn append(&mut self, record: &VectorRecord) -> Result<u64> {
        let start = self.buf.len() as u64;
        Segment::write_frame(&mut self.buf, record)?;
        Ok(start)
    }

    fn read(&self, offset: u64) -> Result<VectorRecord> {
        self.frame_at(offset).map(|(record, _)| record)
    }

    fn scan(&self) -> Result<Vec<(u64, VectorRecord)>> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.buf.len() as u64 {
            let (record, size) = self.frame_at(offset)?;
            out.push((offset, record));
            offset += size;
        }
        Ok(out)
    }

    fn rewrite(&mut self, records: &[VectorRecord]) -> Result<Vec<u64>> {
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            offsets.push(buf.len() as u64);
            Segment::write_frame(&mut buf, record)?;
        }
        self.buf = buf;
        Ok(offsets)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn len_bytes(&self) -> u64 {
        self.buf.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{VectorStatus, VectorType, VECTOR_DIM};

    fn record(id: &str, fill: f32) -> VectorRecord {
        VectorRecord::new(id, VectorType::Message, "agent-1", vec![fill; VECTOR_DIM], "test")
            .with_tags(["inbox"])
            .with_property("subject", "hello")
    }

    fn exercise(log: &mut dyn RecordLog) {
        let a = record("message_a", 0.25);
        let b = record("message_b", 0.5);

        let off_a = log.append(&a).unwrap();
        let off_b = log.append(&b).unwrap();
        assert_eq!(off_a, 0);
        assert!(off_b > off_a);

        assert_eq!(log.read(off_a).unwrap(), a);
        assert_eq!(log.read(off_b).unwrap(), b);

        let scanned = log.scan().unwrap();
        assert_eq!(scanned, vec![(off_a, a.clone()), (off_b, b.clone())]);

        let archived = b.transitioned(VectorStatus::Archived).unwrap();
        let offsets = log.rewrite(&[archived.clone()]).unwrap();
        assert_eq!(offsets, vec![0]);
        assert_eq!(log.read(0).unwrap(), archived);
        assert_eq!(log.scan().unwrap().len(), 1);
    }

    #[test]
    fn memory_log_contract() {
        let mut log = MemoryLog::new();
        exercise(&mut log);
        assert!(log.read(10_000).is_err());
    }

    #[test]
    fn segment_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = Segment::open(&dir.path().join("records.seg"), false).unwrap();
        exercise(&mut seg);
        assert!(seg.read(seg.len_bytes()).is_err());
        assert!(!dir.path().join("records.compacted").exists());
    }

    #[test]
    fn segment_reopen_sees_previous_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.seg");

        let r = record("message_a", 0.75);
        {
            let mut seg = Segment::open(&path, true).unwrap();
            seg.append(&r).unwrap();
        }

        let seg = Segment::open(&path, true).unwrap();
        let scanned = seg.scan().unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].1, r);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.seg");

        let good_len = {
            let mut seg = Segment::open(&path, false).unwrap();
            seg.append(&record("message_a", 0.1)).unwrap();
            seg.len_bytes()
        };

        // Simulate a crash mid-append: length header promising more than was written
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&500u32.to_le_bytes()).unwrap();
            f.write_all(&[0xAB; 17]).unwrap();
        }

        let mut seg = Segment::open(&path, false).unwrap();
        assert_eq!(seg.len_bytes(), good_len);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        let off = seg.append(&record("message_b", 0.2)).unwrap();
        assert_eq!(off, good_len);
        assert_eq!(seg.scan().unwrap().len(), 2);
    }

    /// Overwrites the payload of the frame at `offset` with 0xFF.
    fn smash_frame(path: &Path, offset: u64, end: u64) {
        let mut f = OpenOptions::new().write(true).open(path).unwrap();
        f.seek(SeekFrom::Start(offset + LEN_PREFIX)).unwrap();
        f.write_all(&vec![0xFF; (end - offset - LEN_PREFIX) as usize]).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn corrupt_middle_frame_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.seg");

        let (off_b, off_c, len) = {
            let mut seg = Segment::open(&path, false).unwrap();
            seg.append(&record("message_a", 0.1)).unwrap();
            let off_b = seg.append(&record("message_b", 0.2)).unwrap();
            let off_c = seg.append(&record("message_c", 0.3)).unwrap();
            (off_b, off_c, seg.len_bytes())
        };
        smash_frame(&path, off_b, off_c);

        match Segment::open(&path, false) {
            Err(StoreError::Corrupt { offset, .. }) => assert_eq!(offset, off_b),
            other => panic!("expected Corrupt, got {other:?}"),
        }
        // nothing was cut off
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn undecodable_last_frame_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.seg");

        let (off_b, len) = {
            let mut seg = Segment::open(&path, false).unwrap();
            seg.append(&record("message_a", 0.1)).unwrap();
            let off_b = seg.append(&record("message_b", 0.2)).unwrap();
            (off_b, seg.len_bytes())
        };
        smash_frame(&path, off_b, len);

        let seg = Segment::open(&path, false).unwrap();
        assert_eq!(seg.len_bytes(), off_b);
        assert_eq!(seg.scan().unwrap().len(), 1);
    }
}
