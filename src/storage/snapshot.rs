use crate::storage::buffer::{Buffer, FileBuffer, HeapBuffer};
use crate::storage::index::Index;
use crate::storage::manager::StorageConfig;
use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

const POS_ID: u64 = 0;
const POS_INDEX: u64 = 8;
const POS_TIMESTAMP: u64 = 16;
const POS_LOCKED: u64 = 24;
const POS_DATA_LEN: u64 = 25;
const SNAPSHOT_HEADER_LEN: u64 = 64;

/// A completed, locked snapshot of state-machine state up to `index`.
/// Only locked snapshots are ever visible through the store; an in-progress
/// snapshot is held exclusively by its writer.
pub struct Snapshot {
    id: u64,
    index: Index,
    timestamp: u64,
    data_len: u64,
    buffer: Box<dyn Buffer>,
}

impl Snapshot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn index(&self) -> Index {
        self.index
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Reads up to `max_len` bytes starting at `offset` into the snapshot's
    /// opaque data. Replication streams a snapshot to lagging peers in these
    /// chunks.
    pub fn read_chunk(&mut self, offset: u64, max_len: usize) -> io::Result<Bytes> {
        if offset >= self.data_len {
            return Ok(Bytes::new());
        }
        let len = ((self.data_len - offset) as usize).min(max_len);
        self.buffer.read_bytes(SNAPSHOT_HEADER_LEN + offset, len)
    }

    pub fn read_all(&mut self) -> io::Result<Bytes> {
        self.read_chunk(0, self.data_len as usize)
    }
}

/// SnapshotWriter accumulates opaque state-machine bytes for a snapshot in
/// progress. Nothing is visible to readers until `complete` locks it.
pub struct SnapshotWriter {
    id: u64,
    index: Index,
    timestamp: u64,
    written: u64,
    buffer: Box<dyn Buffer>,
}

impl SnapshotWriter {
    pub fn index(&self) -> Index {
        self.index
    }

    /// Bytes written so far; chunked installs use this as the expected next
    /// offset.
    pub fn offset(&self) -> u64 {
        self.written
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buffer.write_bytes(SNAPSHOT_HEADER_LEN + self.written, bytes)?;
        self.written += bytes.len() as u64;
        self.buffer.write_u64(POS_DATA_LEN, self.written)?;
        Ok(())
    }

    /// Seals the snapshot (locked flag last) and installs it in the store,
    /// superseding any older snapshot for the same state machine.
    pub fn complete(mut self, store: &mut SnapshotStore) -> io::Result<()> {
        self.buffer.write_u8(POS_LOCKED, 1)?;
        self.buffer.flush()?;

        let snapshot = Snapshot {
            id: self.id,
            index: self.index,
            timestamp: self.timestamp,
            data_len: self.written,
            buffer: self.buffer,
        };
        store.install(snapshot)
    }
}

/// SnapshotStore holds the latest completed snapshot per state-machine id and
/// hands out writers for new ones. Unlocked snapshot files found on open are
/// deleted: they are the leftover output of an interrupted snapshot.
pub struct SnapshotStore {
    logger: slog::Logger,
    config: StorageConfig,
    snapshots: HashMap<u64, Snapshot>,
    paths: HashMap<(u64, u64), PathBuf>,
}

impl SnapshotStore {
    pub fn open(logger: slog::Logger, config: StorageConfig) -> io::Result<SnapshotStore> {
        let mut store = SnapshotStore {
            logger,
            config,
            snapshots: HashMap::new(),
            paths: HashMap::new(),
        };
        if store.config.directory.is_some() {
            store.recover()?;
        }
        Ok(store)
    }

    fn recover(&mut self) -> io::Result<()> {
        let directory = self.config.directory.clone().expect("recover requires a directory");
        fs::create_dir_all(&directory)?;

        for dir_entry in fs::read_dir(&directory)? {
            let path = dir_entry?.path();
            let parsed = parse_snapshot_file_name(&path);
            let (id, raw_index) = match parsed {
                Some(parsed) => parsed,
                None => continue,
            };

            let mut buffer = FileBuffer::allocate(&path, self.config.snapshot_max_size)?;
            if buffer.read_u8(POS_LOCKED)? == 0 {
                slog::warn!(self.logger, "Deleting incomplete snapshot"; "id" => id, "index" => raw_index);
                drop(buffer);
                fs::remove_file(&path)?;
                continue;
            }

            let snapshot = Snapshot {
                id: buffer.read_u64(POS_ID)?,
                index: Index::new(buffer.read_u64(POS_INDEX)?),
                timestamp: buffer.read_u64(POS_TIMESTAMP)?,
                data_len: buffer.read_u64(POS_DATA_LEN)?,
                buffer: Box::new(buffer),
            };
            self.paths.insert((id, raw_index), path);
            self.install(snapshot)?;
        }
        Ok(())
    }

    /// The index covered by the current snapshot for `id`, or ZERO.
    pub fn snapshot_index(&self, id: u64) -> Index {
        self.snapshots.get(&id).map_or(Index::ZERO, |s| s.index)
    }

    pub fn current_snapshot(&mut self, id: u64) -> Option<&mut Snapshot> {
        self.snapshots.get_mut(&id)
    }

    pub fn create_snapshot(&mut self, id: u64, index: Index, timestamp: u64) -> io::Result<SnapshotWriter> {
        let buffer: Box<dyn Buffer> = match &self.config.directory {
            Some(directory) => {
                let path = directory.join(format!("snapshot-{}-{}.bin", id, index.val()));
                self.paths.insert((id, index.val()), path.clone());
                Box::new(FileBuffer::allocate(&path, self.config.snapshot_max_size)?)
            }
            None => Box::new(HeapBuffer::allocate(self.config.snapshot_max_size)),
        };

        let mut writer = SnapshotWriter {
            id,
            index,
            timestamp,
            written: 0,
            buffer,
        };
        writer.buffer.write_u64(POS_ID, id)?;
        writer.buffer.write_u64(POS_INDEX, index.val())?;
        writer.buffer.write_u64(POS_TIMESTAMP, timestamp)?;
        writer.buffer.write_u8(POS_LOCKED, 0)?;
        writer.buffer.write_u64(POS_DATA_LEN, 0)?;
        Ok(writer)
    }

    fn install(&mut self, snapshot: Snapshot) -> io::Result<()> {
        let id = snapshot.id;
        let index = snapshot.index;
        match self.snapshots.get(&id) {
            Some(existing) if existing.index >= index => {
                // A newer snapshot is already installed; drop the incoming one.
                if let Some(path) = self.paths.remove(&(id, index.val())) {
                    drop(snapshot);
                    fs::remove_file(&path)?;
                }
                return Ok(());
            }
            _ => {}
        }

        if let Some(superseded) = self.snapshots.insert(id, snapshot) {
            let key = (superseded.id, superseded.index.val());
            drop(superseded);
            if let Some(path) = self.paths.remove(&key) {
                fs::remove_file(&path)?;
            }
        }
        slog::debug!(self.logger, "Installed snapshot"; "id" => id, "index" => %index);
        Ok(())
    }
}

fn parse_snapshot_file_name(path: &PathBuf) -> Option<(u64, u64)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_prefix("snapshot-")?.strip_suffix(".bin")?;
    let (id, index) = stem.split_once('-')?;
    Some((id.parse().ok()?, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn write_complete_read() {
        let mut store = SnapshotStore::open(test_logger(), StorageConfig::in_memory()).unwrap();
        assert_eq!(store.snapshot_index(1), Index::ZERO);

        let mut writer = store.create_snapshot(1, Index::new(10), 12345).unwrap();
        writer.write(b"state-machine").unwrap();
        writer.write(b"-bytes").unwrap();
        writer.complete(&mut store).unwrap();

        assert_eq!(store.snapshot_index(1), Index::new(10));
        let snapshot = store.current_snapshot(1).unwrap();
        assert_eq!(snapshot.read_all().unwrap(), Bytes::from_static(b"state-machine-bytes"));
        assert_eq!(snapshot.read_chunk(13, 100).unwrap(), Bytes::from_static(b"-bytes"));
        assert_eq!(snapshot.read_chunk(100, 4).unwrap(), Bytes::new());
    }

    #[test]
    fn incomplete_writer_is_invisible() {
        let mut store = SnapshotStore::open(test_logger(), StorageConfig::in_memory()).unwrap();
        let mut writer = store.create_snapshot(1, Index::new(5), 0).unwrap();
        writer.write(b"partial").unwrap();
        drop(writer);

        assert_eq!(store.snapshot_index(1), Index::ZERO);
        assert!(store.current_snapshot(1).is_none());
    }

    #[test]
    fn unlocked_snapshot_deleted_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::on_disk(dir.path());

        {
            let mut store = SnapshotStore::open(test_logger(), config.clone()).unwrap();
            let mut complete_writer = store.create_snapshot(1, Index::new(4), 0).unwrap();
            complete_writer.write(b"done").unwrap();
            complete_writer.complete(&mut store).unwrap();

            // Never completed: the file exists but stays unlocked.
            let mut partial = store.create_snapshot(1, Index::new(9), 0).unwrap();
            partial.write(b"partial").unwrap();
            drop(partial);
        }

        let mut store = SnapshotStore::open(test_logger(), config).unwrap();
        assert_eq!(store.snapshot_index(1), Index::new(4));
        assert_eq!(store.current_snapshot(1).unwrap().read_all().unwrap(), Bytes::from_static(b"done"));
    }

    #[test]
    fn newer_snapshot_supersedes() {
        let mut store = SnapshotStore::open(test_logger(), StorageConfig::in_memory()).unwrap();

        let mut first = store.create_snapshot(1, Index::new(10), 0).unwrap();
        first.write(b"ten").unwrap();
        first.complete(&mut store).unwrap();

        let mut second = store.create_snapshot(1, Index::new(20), 0).unwrap();
        second.write(b"twenty").unwrap();
        second.complete(&mut store).unwrap();

        assert_eq!(store.snapshot_index(1), Index::new(20));
        assert_eq!(store.current_snapshot(1).unwrap().read_all().unwrap(), Bytes::from_static(b"twenty"));
    }
}
