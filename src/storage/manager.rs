use crate::storage::buffer::{Buffer, FileBuffer, HeapBuffer};
use crate::storage::index::Index;
use crate::storage::segment::{Segment, SegmentDescriptor};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

/// StorageConfig bounds the segmented log and locates it on disk. With no
/// directory the log is held in heap buffers, which is what most tests use.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub directory: Option<PathBuf>,
    pub segment_max_size: u64,
    pub segment_max_entries: u32,
    pub snapshot_max_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            directory: None,
            segment_max_size: 1024 * 1024 * 32,
            segment_max_entries: 1024 * 128,
            snapshot_max_size: 1024 * 1024 * 64,
        }
    }
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        StorageConfig::default()
    }

    pub fn on_disk(directory: impl Into<PathBuf>) -> Self {
        StorageConfig {
            directory: Some(directory.into()),
            ..StorageConfig::default()
        }
    }

    /// Buffer capacity for one segment: bounded record region plus room for
    /// the clean bitmap written at lock time.
    fn segment_capacity(&self) -> u64 {
        let bitmap_reserve = 4 + (self.segment_max_entries as u64 / 64 + 1) * 8;
        self.segment_max_size + bitmap_reserve
    }
}

/// SegmentManager owns the ordered set of segments backing the log: rollover,
/// recovery, and the atomic replace step both compaction tasks end with.
pub struct SegmentManager {
    logger: slog::Logger,
    config: StorageConfig,
    // Ascending by base_index. The last segment is the writable tail.
    segments: Vec<Segment>,
    paths: HashMap<(u64, u64), PathBuf>,
    next_segment_id: u64,
}

impl SegmentManager {
    pub fn open(logger: slog::Logger, config: StorageConfig) -> io::Result<SegmentManager> {
        let mut manager = SegmentManager {
            logger,
            config,
            segments: Vec::new(),
            paths: HashMap::new(),
            next_segment_id: 1,
        };

        if manager.config.directory.is_some() {
            manager.recover()?;
        }

        if manager.segments.is_empty() {
            manager.create_tail(Index::new(1))?;
        }
        Ok(manager)
    }

    fn recover(&mut self) -> io::Result<()> {
        let directory = self.config.directory.clone().expect("recover requires a directory");
        fs::create_dir_all(&directory)?;

        // Collect candidate files: segment-{id}-{version}.log
        let mut candidates: Vec<(u64, u64, PathBuf)> = Vec::new();
        for dir_entry in fs::read_dir(&directory)? {
            let path = dir_entry?.path();
            if let Some((id, version)) = parse_segment_file_name(&path) {
                candidates.push((id, version, path));
            }
        }

        // Keep the highest version per id whose lock state is coherent. An
        // unlocked higher version next to a locked lower version is partial
        // compaction output and gets deleted.
        let mut by_id: HashMap<u64, Vec<(u64, PathBuf)>> = HashMap::new();
        for (id, version, path) in candidates {
            by_id.entry(id).or_default().push((version, path));
        }

        let mut recovered: Vec<Segment> = Vec::new();
        let max_id = by_id.keys().copied().max().unwrap_or(0);
        for (id, mut versions) in by_id {
            versions.sort_by_key(|(version, _)| *version);
            let mut chosen: Option<(u64, PathBuf, Segment)> = None;
            for (version, path) in versions {
                let buffer = FileBuffer::allocate(&path, self.config.segment_capacity())?;
                let segment = Segment::open(Box::new(buffer))?;
                let is_writable_tail = id == max_id;
                if !segment.is_locked() && !is_writable_tail && chosen.is_some() {
                    slog::warn!(self.logger, "Deleting partial compaction output";
                        "segment_id" => id, "version" => version);
                    fs::remove_file(&path)?;
                    continue;
                }
                if let Some((_, superseded_path, _)) = chosen.replace((version, path, segment)) {
                    fs::remove_file(&superseded_path)?;
                }
            }
            if let Some((version, path, segment)) = chosen {
                self.paths.insert((id, version), path);
                recovered.push(segment);
            }
        }

        recovered.sort_by_key(|s| s.descriptor().base_index);
        self.next_segment_id = max_id + 1;
        self.segments = recovered;

        // If the tail came back locked (crash between lock and the next
        // create), open a fresh tail after it.
        if let Some(tail) = self.segments.last() {
            if tail.is_locked() {
                let next_base = tail.last_index().next();
                self.create_tail(next_base)?;
            }
        }
        Ok(())
    }

    fn allocate_buffer(&self, id: u64, version: u64) -> io::Result<(Box<dyn Buffer>, Option<PathBuf>)> {
        match &self.config.directory {
            Some(directory) => {
                let path = directory.join(format!("segment-{}-{}.log", id, version));
                let buffer = FileBuffer::allocate(&path, self.config.segment_capacity())?;
                Ok((Box::new(buffer), Some(path)))
            }
            None => Ok((Box::new(HeapBuffer::allocate(self.config.segment_capacity())), None)),
        }
    }

    fn create_tail(&mut self, base_index: Index) -> io::Result<()> {
        let descriptor = SegmentDescriptor {
            id: self.next_segment_id,
            version: 1,
            base_index,
            max_size: self.config.segment_max_size,
            max_entries: self.config.segment_max_entries,
        };
        let segment = self.create_segment(descriptor)?;
        self.next_segment_id += 1;
        self.segments.push(segment);
        slog::debug!(self.logger, "Created segment"; "segment_id" => descriptor.id, "base_index" => %base_index);
        Ok(())
    }

    /// Creates a standalone segment (compaction output). It is not part of the
    /// ordered set until `replace_segments` installs it.
    pub fn create_segment(&mut self, descriptor: SegmentDescriptor) -> io::Result<Segment> {
        let (buffer, path) = self.allocate_buffer(descriptor.id, descriptor.version)?;
        if let Some(path) = path {
            self.paths.insert((descriptor.id, descriptor.version), path);
        }
        Segment::create(descriptor, buffer)
    }

    /// Locks the tail and opens a new writable segment starting at the tail's
    /// next index.
    pub fn roll_over(&mut self) -> io::Result<()> {
        let tail = self.segments.last_mut().expect("manager always has a tail");
        let next_base = tail.next_index();
        tail.lock()?;
        self.create_tail(next_base)
    }

    pub fn current(&mut self) -> &mut Segment {
        self.segments.last_mut().expect("manager always has a tail")
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    pub fn segment_containing(&self, index: Index) -> Option<&Segment> {
        self.position_of(index).map(|i| &self.segments[i])
    }

    pub fn segment_containing_mut(&mut self, index: Index) -> Option<&mut Segment> {
        self.position_of(index).map(move |i| &mut self.segments[i])
    }

    pub fn segment_by_id(&self, id: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.descriptor().id == id)
    }

    pub fn segment_by_id_mut(&mut self, id: u64) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.descriptor().id == id)
    }

    fn position_of(&self, index: Index) -> Option<usize> {
        if index.is_zero() {
            return None;
        }
        self.segments
            .iter()
            .rposition(|s| s.first_index() <= index && index <= s.last_index())
    }

    /// Atomically swaps the consecutive run of segments with ids
    /// `first_id..=last_id` for `replacement`, then deletes the originals.
    pub fn replace_segments(&mut self, first_id: u64, last_id: u64, replacement: Segment) -> io::Result<()> {
        let start = self
            .segments
            .iter()
            .position(|s| s.descriptor().id == first_id)
            .expect("replace_segments: first segment not found");
        let end = self
            .segments
            .iter()
            .position(|s| s.descriptor().id == last_id)
            .expect("replace_segments: last segment not found");
        assert!(start <= end, "replace_segments ids out of order");

        let replaced: Vec<Segment> = self.segments.splice(start..=end, [replacement]).collect();
        for old in replaced {
            let descriptor = old.descriptor();
            drop(old);
            if let Some(path) = self.paths.remove(&(descriptor.id, descriptor.version)) {
                fs::remove_file(&path)?;
            }
            slog::debug!(self.logger, "Deleted compacted segment";
                "segment_id" => descriptor.id, "version" => descriptor.version);
        }
        Ok(())
    }

    /// Drops every segment and starts a fresh tail at `base_index`.
    pub fn reset(&mut self, base_index: Index) -> io::Result<()> {
        for old in self.segments.drain(..) {
            let descriptor = old.descriptor();
            drop(old);
            if let Some(path) = self.paths.remove(&(descriptor.id, descriptor.version)) {
                fs::remove_file(&path)?;
            }
        }
        self.create_tail(base_index)
    }

    /// Removes every allocated index greater than `index`, deleting segments
    /// that become entirely empty and re-opening the boundary segment for
    /// writing.
    pub fn truncate_to(&mut self, index: Index) -> io::Result<()> {
        while self.segments.len() > 1 {
            let tail = self.segments.last().expect("manager always has a tail");
            if tail.first_index() <= index {
                break;
            }
            let dropped = self.segments.pop().expect("checked non-empty");
            let descriptor = dropped.descriptor();
            drop(dropped);
            if let Some(path) = self.paths.remove(&(descriptor.id, descriptor.version)) {
                fs::remove_file(&path)?;
            }
        }

        let tail = self.segments.last_mut().expect("manager always has a tail");
        tail.truncate(index)?;

        // Truncation at an exact segment boundary can leave a locked tail.
        if self.segments.last().expect("manager always has a tail").is_locked() {
            let next_base = self.last_index().next();
            self.create_tail(next_base)?;
        }
        Ok(())
    }

    pub fn first_index(&self) -> Index {
        self.segments
            .first()
            .map(|s| s.first_index())
            .expect("manager always has a tail")
    }

    pub fn last_index(&self) -> Index {
        self.segments
            .last()
            .map(|s| s.last_index())
            .expect("manager always has a tail")
    }

}

fn parse_segment_file_name(path: &PathBuf) -> Option<(u64, u64)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_prefix("segment-")?.strip_suffix(".log")?;
    let (id, version) = stem.split_once('-')?;
    Some((id.parse().ok()?, version.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::EntryKind;
    use crate::storage::entry::LogEntry;
    use crate::storage::index::Term;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn no_op(index: u64) -> LogEntry {
        LogEntry::new(Index::new(index), Term::new(1), EntryKind::NoOp { timestamp: 0 })
    }

    #[test]
    fn roll_over_locks_tail_and_continues_indexing() {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        manager.current().append(&no_op(1)).unwrap();
        manager.current().append(&no_op(2)).unwrap();

        manager.roll_over().unwrap();
        assert_eq!(manager.segments().len(), 2);
        assert!(manager.segments()[0].is_locked());
        assert_eq!(manager.current().first_index(), Index::new(3));

        manager.current().append(&no_op(3)).unwrap();
        assert_eq!(manager.last_index(), Index::new(3));
    }

    #[test]
    fn segment_containing_finds_by_index() {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        manager.current().append(&no_op(1)).unwrap();
        manager.roll_over().unwrap();
        manager.current().append(&no_op(2)).unwrap();

        assert_eq!(manager.segment_containing(Index::new(1)).unwrap().descriptor().id, 1);
        assert_eq!(manager.segment_containing(Index::new(2)).unwrap().descriptor().id, 2);
        assert!(manager.segment_containing(Index::new(3)).is_none());
        assert!(manager.segment_containing(Index::ZERO).is_none());
    }

    #[test]
    fn recovery_reopens_segments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::on_disk(dir.path());

        {
            let mut manager = SegmentManager::open(test_logger(), config.clone()).unwrap();
            manager.current().append(&no_op(1)).unwrap();
            manager.roll_over().unwrap();
            manager.current().append(&no_op(2)).unwrap();
        }

        let mut manager = SegmentManager::open(test_logger(), config).unwrap();
        assert_eq!(manager.segments().len(), 2);
        assert_eq!(manager.first_index(), Index::new(1));
        assert_eq!(manager.last_index(), Index::new(2));
        let entry = manager.segment_containing_mut(Index::new(2)).unwrap().get(Index::new(2)).unwrap();
        assert_eq!(entry, Some(no_op(2)));
    }

    #[test]
    fn replace_segments_swaps_and_deletes() {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        manager.current().append(&no_op(1)).unwrap();
        manager.roll_over().unwrap();
        manager.current().append(&no_op(2)).unwrap();
        manager.roll_over().unwrap();

        // Combine segments 1 and 2 into a replacement at version 2.
        let descriptor = SegmentDescriptor {
            id: 1,
            version: 2,
            base_index: Index::new(1),
            max_size: manager.config.segment_max_size,
            max_entries: manager.config.segment_max_entries,
        };
        let mut replacement = manager.create_segment(descriptor).unwrap();
        replacement.append(&no_op(1)).unwrap();
        replacement.append(&no_op(2)).unwrap();
        replacement.lock().unwrap();

        manager.replace_segments(1, 2, replacement).unwrap();
        assert_eq!(manager.segments().len(), 2);
        assert_eq!(manager.segments()[0].descriptor().version, 2);
        assert_eq!(manager.segments()[0].last_index(), Index::new(2));
    }
}
