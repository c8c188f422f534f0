use crate::storage::bitmap::OffsetBitmap;
use crate::storage::index::Index;
use crate::storage::manager::SegmentManager;
use crate::storage::segment::{Segment, SegmentDescriptor};
use std::io;

/// Combines groups of neighboring segments and removes tombstones.
///
/// Tombstones cancel earlier state-changes, so a tombstone must stay in the
/// log as long as any prior entry it cancels might still be replayed. Three
/// rules together make removal crash-safe:
///
/// 1. Clean predicates are snapshotted for every group before any entry is
///    rewritten. A clean that lands after the snapshot cannot influence this
///    run, so "earlier entry kept, tombstone dropped" orderings can't happen
///    through racing cleans.
/// 2. Groups are processed in strictly ascending log order. A crash mid-run
///    leaves only a prefix rewritten; every tombstone cancelling that prefix
///    is in the untouched suffix.
/// 3. A tombstone is only dropped when its index is at or below the
///    major-compact index, the minimum index replicated to every stateful
///    member, so no server can still need it to cancel replayed state.
pub struct MajorCompactionTask {
    groups: Vec<Vec<u64>>,
    snapshot_index: Index,
    major_compact_index: Index,
}

impl MajorCompactionTask {
    pub fn new(groups: Vec<Vec<u64>>, snapshot_index: Index, major_compact_index: Index) -> Self {
        MajorCompactionTask {
            groups,
            snapshot_index,
            major_compact_index,
        }
    }

    pub fn run(&self, logger: &slog::Logger, manager: &mut SegmentManager) -> io::Result<()> {
        // Rule 1: snapshot every group's cleaners up front.
        let cleaners: Vec<Vec<OffsetBitmap>> = self
            .groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|id| {
                        manager
                            .segment_by_id(*id)
                            .expect("major compaction of unknown segment")
                            .clean_predicate()
                    })
                    .collect()
            })
            .collect();

        // Rule 2: ascending order, one group at a time.
        for (group, group_cleaners) in self.groups.iter().zip(cleaners.iter()) {
            self.compact_group(logger, manager, group, group_cleaners)?;
        }
        Ok(())
    }

    fn compact_group(
        &self,
        logger: &slog::Logger,
        manager: &mut SegmentManager,
        group: &[u64],
        cleaners: &[OffsetBitmap],
    ) -> io::Result<()> {
        let first = manager
            .segment_by_id(group[0])
            .expect("major compaction of unknown segment")
            .descriptor();
        let max_size = group
            .iter()
            .map(|id| manager.segment_by_id(*id).unwrap().descriptor().max_size)
            .max()
            .unwrap();
        let max_entries = group
            .iter()
            .map(|id| manager.segment_by_id(*id).unwrap().descriptor().max_entries)
            .max()
            .unwrap();

        let mut output = manager.create_segment(SegmentDescriptor {
            id: first.id,
            version: first.version + 1,
            base_index: first.base_index,
            max_size,
            max_entries,
        })?;

        for (segment_id, cleaner) in group.iter().zip(cleaners.iter()) {
            self.compact_segment(manager, *segment_id, cleaner, &mut output)?;
        }

        // Rule 1's other half: carry every snapshotted clean mark onto the
        // output so retained-but-cleaned entries keep their record.
        for (segment_id, cleaner) in group.iter().zip(cleaners.iter()) {
            let (first_index, last_index) = {
                let segment = manager.segment_by_id(*segment_id).unwrap();
                (segment.first_index(), segment.last_index())
            };
            let mut index = first_index;
            while index <= last_index {
                let source_offset = manager.segment_by_id(*segment_id).unwrap().offset(index);
                if let Some(source_offset) = source_offset {
                    if cleaner.get(source_offset) {
                        if let Some(output_offset) = output.offset(index) {
                            output.clean_offset(output_offset);
                        }
                    }
                }
                index = index.next();
            }
        }

        output.lock()?;
        slog::debug!(logger, "Major compaction combined segments";
            "first_segment" => group[0], "last_segment" => *group.last().unwrap(),
            "output_version" => first.version + 1);
        manager.replace_segments(group[0], *group.last().unwrap(), output)
    }

    fn compact_segment(
        &self,
        manager: &mut SegmentManager,
        segment_id: u64,
        cleaner: &OffsetBitmap,
        output: &mut Segment,
    ) -> io::Result<()> {
        let (first_index, last_index) = {
            let segment = manager.segment_by_id(segment_id).unwrap();
            (segment.first_index(), segment.last_index())
        };

        let mut index = first_index;
        while index <= last_index {
            self.compact_entry(manager, segment_id, cleaner, output, index)?;
            index = index.next();
        }
        Ok(())
    }

    fn compact_entry(
        &self,
        manager: &mut SegmentManager,
        segment_id: u64,
        cleaner: &OffsetBitmap,
        output: &mut Segment,
        index: Index,
    ) -> io::Result<()> {
        let segment = manager.segment_by_id_mut(segment_id).unwrap();
        let entry = match segment.get(index)? {
            Some(entry) => entry,
            // Already compacted away: keep the hole so offsets line up.
            None => return output.skip(1),
        };

        // Snapshotted entries below the snapshot index need no clean mark:
        // the snapshot supersedes them outright.
        if entry.is_snapshottable() && index <= self.snapshot_index {
            return output.skip(1);
        }

        // Rule 3: past the major-compact index a tombstone must be retained
        // no matter what. Everything else follows its clean mark.
        if !entry.is_tombstone() || index <= self.major_compact_index {
            let offset = segment.offset(index).expect("live entry has an offset");
            if cleaner.get(offset) {
                return output.skip(1);
            }
            return output.append(&entry).map(|_| ());
        }

        output.append(&entry).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::{CommandConsistency, EntryKind, LogEntry};
    use crate::storage::manager::StorageConfig;
    use crate::storage::index::Term;
    use bytes::Bytes;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn command(index: u64, tombstone: bool) -> LogEntry {
        LogEntry::new(
            Index::new(index),
            Term::new(1),
            EntryKind::Command {
                session: Index::new(1),
                sequence: index,
                timestamp: index,
                payload: Bytes::from(format!("cmd-{}", index)),
                consistency: CommandConsistency::Sequential,
                tombstone,
            },
        )
    }

    /// Two segments: `set` at index 1, filler, then its tombstone at index 4.
    fn set_and_delete_manager() -> SegmentManager {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        manager.current().append(&command(1, false)).unwrap();
        manager.current().append(&command(2, false)).unwrap();
        manager.roll_over().unwrap();
        manager.current().append(&command(3, false)).unwrap();
        manager.current().append(&command(4, true)).unwrap();
        manager.roll_over().unwrap();

        // State machine applied everything: 1 was cancelled by 4, both cleaned.
        manager.segment_by_id_mut(1).unwrap().clean(Index::new(1));
        manager.segment_by_id_mut(2).unwrap().clean(Index::new(4));
        manager
    }

    #[test]
    fn tombstone_and_victim_removed_when_fully_replicated() {
        let mut manager = set_and_delete_manager();

        let task = MajorCompactionTask::new(vec![vec![1, 2]], Index::ZERO, Index::new(4));
        task.run(&test_logger(), &mut manager).unwrap();

        let combined = manager.segment_by_id_mut(1).unwrap();
        assert_eq!(combined.descriptor().version, 2);
        assert_eq!(combined.get(Index::new(1)).unwrap(), None);
        assert_eq!(combined.get(Index::new(2)).unwrap(), Some(command(2, false)));
        assert_eq!(combined.get(Index::new(3)).unwrap(), Some(command(3, false)));
        assert_eq!(combined.get(Index::new(4)).unwrap(), None);
    }

    #[test]
    fn tombstone_retained_when_not_fully_replicated() {
        let mut manager = set_and_delete_manager();

        // Major-compact index stops short of the tombstone at 4.
        let task = MajorCompactionTask::new(vec![vec![1, 2]], Index::ZERO, Index::new(3));
        task.run(&test_logger(), &mut manager).unwrap();

        let combined = manager.segment_by_id_mut(1).unwrap();
        assert_eq!(combined.get(Index::new(1)).unwrap(), None, "victim removed");
        assert_eq!(
            combined.get(Index::new(4)).unwrap(),
            Some(command(4, true)),
            "tombstone must outlive its victim"
        );
        // Its clean mark is carried so a later pass can still drop it.
        assert!(combined.is_clean(Index::new(4)));
    }

    #[test]
    fn cleans_after_predicate_snapshot_do_not_affect_the_run() {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        manager.current().append(&command(1, false)).unwrap();
        manager.current().append(&command(2, false)).unwrap();
        manager.roll_over().unwrap();

        // Capture the predicate first (nothing cleaned yet), then let a clean
        // race in before the rewrite. The rewrite must honor the snapshot.
        let task = MajorCompactionTask::new(vec![vec![1]], Index::ZERO, Index::new(2));
        let cleaner = manager.segment_by_id(1).unwrap().clean_predicate();
        manager.segment_by_id_mut(1).unwrap().clean(Index::new(1));

        let mut output = manager
            .create_segment(SegmentDescriptor {
                id: 1,
                version: 2,
                base_index: Index::new(1),
                max_size: 1024 * 1024,
                max_entries: 1024,
            })
            .unwrap();
        task.compact_segment(&mut manager, 1, &cleaner, &mut output).unwrap();
        output.lock().unwrap();
        manager.replace_segments(1, 1, output).unwrap();

        let segment = manager.segment_by_id_mut(1).unwrap();
        assert_eq!(segment.get(Index::new(1)).unwrap(), Some(command(1, false)));
        assert_eq!(segment.get(Index::new(2)).unwrap(), Some(command(2, false)));
    }

    #[test]
    fn snapshotted_entries_removed_without_clean_marks() {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        manager.current().append(&command(1, false)).unwrap();
        manager.current().append(&command(2, false)).unwrap();
        manager.roll_over().unwrap();

        // Snapshot covers index 1 only; no cleans at all.
        let task = MajorCompactionTask::new(vec![vec![1]], Index::new(1), Index::new(2));
        task.run(&test_logger(), &mut manager).unwrap();

        let segment = manager.segment_by_id_mut(1).unwrap();
        assert_eq!(segment.get(Index::new(1)).unwrap(), None);
        assert_eq!(segment.get(Index::new(2)).unwrap(), Some(command(2, false)));
    }
}
