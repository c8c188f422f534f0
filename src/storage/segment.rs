use crate::storage::bitmap::OffsetBitmap;
use crate::storage::buffer::Buffer;
use crate::storage::entry::LogEntry;
use crate::storage::index::Index;
use bytes::BytesMut;
use std::io;

/// Fixed header region at the front of every segment buffer.
///
/// ```text
/// | 0..8 | 8..16   | 16..24     | 24..32   | 32..36      | 36     | 37..45 |
/// | id   | version | base_index | max_size | max_entries | locked | bytes  |
/// ```
///
/// Offsets 45..64 are reserved. Entry records follow at 64, each framed as
/// `{record_len: u32, entry bytes}` with `record_len == 0` marking a skipped
/// offset. The clean-offset bitmap is written after the records when the
/// segment is locked; an unlocked segment's bitmap lives in memory only and is
/// reconstructed by state-machine replay after a restart.
pub const SEGMENT_HEADER_LEN: u64 = 64;

const POS_ID: u64 = 0;
const POS_VERSION: u64 = 8;
const POS_BASE_INDEX: u64 = 16;
const POS_MAX_SIZE: u64 = 24;
const POS_MAX_ENTRIES: u64 = 32;
const POS_LOCKED: u64 = 36;
const POS_BYTES: u64 = 37;

/// Identity and bounds of one segment. `version` increments each time
/// compaction rewrites the segment; `base_index` is the log index of offset 0.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentDescriptor {
    pub id: u64,
    pub version: u64,
    pub base_index: Index,
    pub max_size: u64,
    pub max_entries: u32,
}

pub struct Segment {
    descriptor: SegmentDescriptor,
    buffer: Box<dyn Buffer>,
    // Buffer position + record length per offset. None is a skipped offset.
    offsets: Vec<Option<(u64, u32)>>,
    clean_bits: OffsetBitmap,
    record_bytes: u64,
    locked: bool,
}

impl Segment {
    /// Creates a fresh segment, writing its header into `buffer`.
    pub fn create(descriptor: SegmentDescriptor, mut buffer: Box<dyn Buffer>) -> io::Result<Segment> {
        buffer.write_u64(POS_ID, descriptor.id)?;
        buffer.write_u64(POS_VERSION, descriptor.version)?;
        buffer.write_u64(POS_BASE_INDEX, descriptor.base_index.val())?;
        buffer.write_u64(POS_MAX_SIZE, descriptor.max_size)?;
        buffer.write_u32(POS_MAX_ENTRIES, descriptor.max_entries)?;
        buffer.write_u8(POS_LOCKED, 0)?;
        buffer.write_u64(POS_BYTES, 0)?;

        Ok(Segment {
            descriptor,
            buffer,
            offsets: Vec::new(),
            clean_bits: OffsetBitmap::new(),
            record_bytes: 0,
            locked: false,
        })
    }

    /// Opens an existing segment from `buffer`. The manager decides what to do
    /// with unlocked segments (the newest one is the writable tail; any other
    /// is partial compaction output and gets deleted).
    pub fn open(mut buffer: Box<dyn Buffer>) -> io::Result<Segment> {
        let descriptor = SegmentDescriptor {
            id: buffer.read_u64(POS_ID)?,
            version: buffer.read_u64(POS_VERSION)?,
            base_index: Index::new(buffer.read_u64(POS_BASE_INDEX)?),
            max_size: buffer.read_u64(POS_MAX_SIZE)?,
            max_entries: buffer.read_u32(POS_MAX_ENTRIES)?,
        };
        let locked = buffer.read_u8(POS_LOCKED)? != 0;
        let record_bytes = buffer.read_u64(POS_BYTES)?;

        // Rebuild the offset table by walking the records.
        let mut offsets = Vec::new();
        let mut pos = SEGMENT_HEADER_LEN;
        let end = SEGMENT_HEADER_LEN + record_bytes;
        while pos < end {
            let record_len = buffer.read_u32(pos)?;
            if record_len == 0 {
                offsets.push(None);
                pos += 4;
            } else {
                offsets.push(Some((pos + 4, record_len)));
                pos += 4 + record_len as u64;
            }
        }

        let clean_bits = if locked {
            let bitmap_len = (buffer.len() - end) as usize;
            let mut raw = buffer.read_bytes(end, bitmap_len)?;
            OffsetBitmap::decode(&mut raw)?
        } else {
            OffsetBitmap::new()
        };

        Ok(Segment {
            descriptor,
            buffer,
            offsets,
            clean_bits,
            record_bytes,
            locked,
        })
    }

    pub fn descriptor(&self) -> SegmentDescriptor {
        self.descriptor
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Number of allocated offsets, including skipped ones.
    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    /// Count of offsets holding a live (non-skipped) record.
    pub fn live_count(&self) -> usize {
        self.offsets.iter().filter(|o| o.is_some()).count()
    }

    pub fn cleaned_count(&self) -> u64 {
        self.clean_bits.count()
    }

    pub fn first_index(&self) -> Index {
        self.descriptor.base_index
    }

    /// Highest allocated index, or base_index - 1 when empty.
    pub fn last_index(&self) -> Index {
        if self.offsets.is_empty() {
            // base_index is always >= 1, so this cannot underflow in practice.
            Index::new(self.descriptor.base_index.val() - 1)
        } else {
            self.descriptor.base_index.plus(self.offsets.len() as u64 - 1)
        }
    }

    pub fn next_index(&self) -> Index {
        self.descriptor.base_index.plus(self.offsets.len() as u64)
    }

    /// Maps a log index to this segment's offset. None if the index precedes
    /// the segment or has not been allocated.
    pub fn offset(&self, index: Index) -> Option<u64> {
        if index < self.descriptor.base_index {
            return None;
        }
        let offset = index.val() - self.descriptor.base_index.val();
        if offset < self.offsets.len() as u64 {
            Some(offset)
        } else {
            None
        }
    }

    /// True if appending a record of `encoded_len` bytes would exceed either
    /// bound of this segment.
    pub fn is_full(&self, encoded_len: usize) -> bool {
        self.offsets.len() as u32 >= self.descriptor.max_entries
            || SEGMENT_HEADER_LEN + self.record_bytes + 4 + encoded_len as u64 > self.descriptor.max_size
    }

    pub fn append(&mut self, entry: &LogEntry) -> io::Result<Index> {
        assert!(!self.locked, "append to locked segment {}", self.descriptor.id);
        assert_eq!(
            entry.index,
            self.next_index(),
            "append must land at the segment's next index"
        );

        let encoded = entry.encode();
        let pos = SEGMENT_HEADER_LEN + self.record_bytes;
        let mut framed = BytesMut::with_capacity(4 + encoded.len());
        framed.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        framed.extend_from_slice(&encoded);
        self.buffer.write_bytes(pos, &framed)?;

        self.offsets.push(Some((pos + 4, encoded.len() as u32)));
        self.record_bytes += framed.len() as u64;
        self.buffer.write_u64(POS_BYTES, self.record_bytes)?;

        Ok(entry.index)
    }

    /// Reserves `n` indices without entries. Reads of skipped indices return
    /// None.
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        assert!(!self.locked, "skip on locked segment {}", self.descriptor.id);

        for _ in 0..n {
            let pos = SEGMENT_HEADER_LEN + self.record_bytes;
            self.buffer.write_u32(pos, 0)?;
            self.offsets.push(None);
            self.record_bytes += 4;
        }
        self.buffer.write_u64(POS_BYTES, self.record_bytes)?;
        Ok(())
    }

    pub fn get(&mut self, index: Index) -> io::Result<Option<LogEntry>> {
        let offset = match self.offset(index) {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let (pos, len) = match self.offsets[offset as usize] {
            Some(record) => record,
            None => return Ok(None),
        };
        let raw = self.buffer.read_bytes(pos, len as usize)?;
        LogEntry::decode(index, raw).map(Some)
    }

    /// Drops all offsets past `index`. Truncating into a locked segment clears
    /// the lock: the segment becomes the writable tail again, and its in-memory
    /// clean bits are re-persisted on the next lock.
    pub fn truncate(&mut self, index: Index) -> io::Result<()> {
        if self.locked {
            self.buffer.write_u8(POS_LOCKED, 0)?;
            self.locked = false;
        }

        let keep = if index < self.descriptor.base_index {
            0
        } else {
            (index.val() - self.descriptor.base_index.val() + 1) as usize
        };
        if keep >= self.offsets.len() {
            return Ok(());
        }

        let new_end = match self.offsets[keep..].iter().flatten().next() {
            Some((pos, _)) => pos - 4,
            // Everything being dropped is a skipped offset; each occupies 4 bytes.
            None => SEGMENT_HEADER_LEN + self.record_bytes - 4 * (self.offsets.len() - keep) as u64,
        };
        self.offsets.truncate(keep);
        self.record_bytes = new_end - SEGMENT_HEADER_LEN;
        self.buffer.truncate(new_end)?;
        self.buffer.write_u64(POS_BYTES, self.record_bytes)?;
        Ok(())
    }

    /// Marks the offset holding `index` clean. Returns false if the index is
    /// not allocated in this segment.
    pub fn clean(&mut self, index: Index) -> bool {
        match self.offset(index) {
            Some(offset) => {
                self.clean_bits.set(offset);
                true
            }
            None => false,
        }
    }

    pub fn clean_offset(&mut self, offset: u64) {
        self.clean_bits.set(offset);
    }

    pub fn is_clean(&self, index: Index) -> bool {
        self.offset(index).map_or(false, |offset| self.clean_bits.get(offset))
    }

    /// Immutable snapshot of the clean bitmap. Compaction captures these before
    /// rewriting so later cleans cannot leak into a running pass.
    pub fn clean_predicate(&self) -> OffsetBitmap {
        self.clean_bits.clone()
    }

    /// Seals the segment: persists the clean bitmap after the records and sets
    /// the locked flag last, so an interrupted lock leaves the flag unset.
    pub fn lock(&mut self) -> io::Result<()> {
        if self.locked {
            return Ok(());
        }
        let mut encoded = BytesMut::with_capacity(self.clean_bits.encoded_len() as usize);
        self.clean_bits.encode(&mut encoded);
        self.buffer
            .write_bytes(SEGMENT_HEADER_LEN + self.record_bytes, &encoded)?;
        self.buffer.write_u8(POS_LOCKED, 1)?;
        self.buffer.flush()?;
        self.locked = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::HeapBuffer;
    use crate::storage::entry::EntryKind;
    use crate::storage::index::Term;

    fn descriptor(base_index: u64) -> SegmentDescriptor {
        SegmentDescriptor {
            id: 1,
            version: 1,
            base_index: Index::new(base_index),
            max_size: 64 * 1024,
            max_entries: 128,
        }
    }

    fn no_op(index: u64) -> LogEntry {
        LogEntry::new(Index::new(index), Term::new(1), EntryKind::NoOp { timestamp: index * 10 })
    }

    fn new_segment(base_index: u64) -> Segment {
        Segment::create(descriptor(base_index), Box::new(HeapBuffer::allocate(64 * 1024))).unwrap()
    }

    #[test]
    fn append_get_skip() {
        let mut segment = new_segment(1);
        assert!(segment.is_empty());

        segment.append(&no_op(1)).unwrap();
        segment.append(&no_op(2)).unwrap();
        segment.skip(2).unwrap();
        segment.append(&no_op(5)).unwrap();

        assert_eq!(segment.first_index(), Index::new(1));
        assert_eq!(segment.last_index(), Index::new(5));
        assert_eq!(segment.entry_count(), 5);
        assert_eq!(segment.live_count(), 3);

        assert_eq!(segment.get(Index::new(2)).unwrap(), Some(no_op(2)));
        assert_eq!(segment.get(Index::new(3)).unwrap(), None, "skipped offset is a hole");
        assert_eq!(segment.get(Index::new(5)).unwrap(), Some(no_op(5)));
        assert_eq!(segment.get(Index::new(6)).unwrap(), None, "unallocated index");
    }

    #[test]
    #[should_panic(expected = "next index")]
    fn append_at_wrong_index_panics() {
        let mut segment = new_segment(1);
        segment.append(&no_op(5)).unwrap();
    }

    #[test]
    fn offsets_are_relative_to_base_index() {
        let mut segment = new_segment(100);
        segment.append(&no_op(100)).unwrap();
        segment.append(&no_op(101)).unwrap();

        assert_eq!(segment.offset(Index::new(100)), Some(0));
        assert_eq!(segment.offset(Index::new(101)), Some(1));
        assert_eq!(segment.offset(Index::new(99)), None);
        assert_eq!(segment.offset(Index::new(102)), None);
    }

    #[test]
    fn clean_marks_survive_lock_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment-1");

        {
            let file = crate::storage::buffer::FileBuffer::allocate(&path, 64 * 1024).unwrap();
            let mut segment = Segment::create(descriptor(1), Box::new(file)).unwrap();
            segment.append(&no_op(1)).unwrap();
            segment.append(&no_op(2)).unwrap();
            segment.append(&no_op(3)).unwrap();
            segment.clean(Index::new(2));
            segment.lock().unwrap();
        }

        let file = crate::storage::buffer::FileBuffer::allocate(&path, 64 * 1024).unwrap();
        let reopened = Segment::open(Box::new(file)).unwrap();
        assert!(reopened.is_locked());
        assert!(reopened.is_clean(Index::new(2)));
        assert!(!reopened.is_clean(Index::new(1)));
        assert_eq!(reopened.last_index(), Index::new(3));
    }

    #[test]
    fn reopen_unlocked_segment_rebuilds_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment-1");

        {
            let file = crate::storage::buffer::FileBuffer::allocate(&path, 64 * 1024).unwrap();
            let mut segment = Segment::create(descriptor(1), Box::new(file)).unwrap();
            segment.append(&no_op(1)).unwrap();
            segment.skip(1).unwrap();
            segment.append(&no_op(3)).unwrap();
        }

        let file = crate::storage::buffer::FileBuffer::allocate(&path, 64 * 1024).unwrap();
        let mut reopened = Segment::open(Box::new(file)).unwrap();
        assert!(!reopened.is_locked());
        assert_eq!(reopened.get(Index::new(1)).unwrap(), Some(no_op(1)));
        assert_eq!(reopened.get(Index::new(2)).unwrap(), None);
        assert_eq!(reopened.get(Index::new(3)).unwrap(), Some(no_op(3)));
    }

    #[test]
    fn truncate_drops_suffix() {
        let mut segment = new_segment(1);
        for i in 1..=5 {
            segment.append(&no_op(i)).unwrap();
        }

        segment.truncate(Index::new(3)).unwrap();
        assert_eq!(segment.last_index(), Index::new(3));
        assert_eq!(segment.get(Index::new(4)).unwrap(), None);

        // The segment is still writable at the truncated position.
        segment.append(&no_op(4)).unwrap();
        assert_eq!(segment.get(Index::new(4)).unwrap(), Some(no_op(4)));
    }

    #[test]
    fn is_full_by_entry_count() {
        let mut descriptor = descriptor(1);
        descriptor.max_entries = 2;
        let mut segment = Segment::create(descriptor, Box::new(HeapBuffer::allocate(64 * 1024))).unwrap();
        segment.append(&no_op(1)).unwrap();
        assert!(!segment.is_full(16));
        segment.append(&no_op(2)).unwrap();
        assert!(segment.is_full(16));
    }
}
