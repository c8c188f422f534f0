use crate::storage::index::Index;
use crate::storage::manager::SegmentManager;
use crate::storage::segment::SegmentDescriptor;
use std::io;

/// Rewrites a single segment, dropping entries the state machine has marked
/// clean. Tombstones are the exception: a cleaned tombstone may only be dropped
/// once its index is at or below the cluster-wide major-compact index, because
/// it must outlive every earlier entry it cancels.
pub struct MinorCompactionTask {
    segment_id: u64,
    major_compact_index: Index,
}

impl MinorCompactionTask {
    pub fn new(segment_id: u64, major_compact_index: Index) -> Self {
        MinorCompactionTask {
            segment_id,
            major_compact_index,
        }
    }

    pub fn run(&self, logger: &slog::Logger, manager: &mut SegmentManager) -> io::Result<()> {
        // Snapshot the clean predicate before rewriting anything: cleans that
        // arrive mid-rewrite must wait for the next pass.
        let (descriptor, cleaner, first_index, last_index) = {
            let segment = manager
                .segment_by_id(self.segment_id)
                .expect("minor compaction of unknown segment");
            assert!(segment.is_locked(), "minor compaction requires a locked segment");
            (
                segment.descriptor(),
                segment.clean_predicate(),
                segment.first_index(),
                segment.last_index(),
            )
        };

        let mut replacement = manager.create_segment(SegmentDescriptor {
            version: descriptor.version + 1,
            ..descriptor
        })?;

        let mut index = first_index;
        while index <= last_index {
            let offset = {
                let segment = manager.segment_by_id(self.segment_id).expect("segment vanished mid-run");
                segment.offset(index)
            };

            let removable = match offset {
                None => true,
                Some(offset) => cleaner.get(offset) && {
                    let segment = manager.segment_by_id_mut(self.segment_id).expect("segment vanished mid-run");
                    let entry = segment.get(index)?.expect("live offset must decode");
                    !entry.is_tombstone() || index <= self.major_compact_index
                },
            };

            if removable {
                replacement.skip(1)?;
            } else {
                let segment = manager.segment_by_id_mut(self.segment_id).expect("segment vanished mid-run");
                let entry = segment.get(index)?.expect("live offset must decode");
                replacement.append(&entry)?;
            }
            index = index.next();
        }

        // Replay the cleaned offsets so replay after a restart still knows
        // which retained entries no longer contribute to state.
        let mut index = first_index;
        while index <= last_index {
            if let Some(offset) = replacement.offset(index) {
                if cleaner.get(offset) {
                    replacement.clean_offset(offset);
                }
            }
            index = index.next();
        }

        replacement.lock()?;
        slog::debug!(logger, "Minor compaction rewrote segment";
            "segment_id" => self.segment_id, "version" => descriptor.version + 1);
        manager.replace_segments(self.segment_id, self.segment_id, replacement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::{CommandConsistency, EntryKind, LogEntry};
    use crate::storage::manager::StorageConfig;
    use crate::storage::{Index, Term};
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

    fn build_manager(entries: &[LogEntry]) -> SegmentManager {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        for entry in entries {
            manager.current().append(entry).unwrap();
        }
        manager.roll_over().unwrap();
        manager
    }

    #[test]
    fn cleaned_entries_become_holes() {
        let mut manager = build_manager(&[command(1, false), command(2, false), command(3, false)]);
        manager.segment_by_id_mut(1).unwrap().clean(Index::new(2));

        MinorCompactionTask::new(1, Index::ZERO).run(&test_logger(), &mut manager).unwrap();

        let segment = manager.segment_by_id_mut(1).unwrap();
        assert_eq!(segment.descriptor().version, 2);
        assert_eq!(segment.get(Index::new(1)).unwrap(), Some(command(1, false)));
        assert_eq!(segment.get(Index::new(2)).unwrap(), None);
        assert_eq!(segment.get(Index::new(3)).unwrap(), Some(command(3, false)));
        // Offsets are preserved so later indexes don't shift.
        assert_eq!(segment.offset(Index::new(3)), Some(2));
    }

    #[test]
    fn cleaned_tombstone_survives_above_major_compact_index() {
        let mut manager = build_manager(&[command(1, false), command(2, true)]);
        manager.segment_by_id_mut(1).unwrap().clean(Index::new(1));
        manager.segment_by_id_mut(1).unwrap().clean(Index::new(2));

        // Major-compact index below the tombstone: entry 1 goes, tombstone stays.
        MinorCompactionTask::new(1, Index::new(1)).run(&test_logger(), &mut manager).unwrap();

        let segment = manager.segment_by_id_mut(1).unwrap();
        assert_eq!(segment.get(Index::new(1)).unwrap(), None);
        assert_eq!(segment.get(Index::new(2)).unwrap(), Some(command(2, true)));
        // The retained tombstone's clean mark is carried into the rewrite.
        assert!(segment.is_clean(Index::new(2)));
    }

    #[test]
    fn cleaned_tombstone_removed_at_or_below_major_compact_index() {
        let mut manager = build_manager(&[command(1, false), command(2, true)]);
        manager.segment_by_id_mut(1).unwrap().clean(Index::new(1));
        manager.segment_by_id_mut(1).unwrap().clean(Index::new(2));

        MinorCompactionTask::new(1, Index::new(2)).run(&test_logger(), &mut manager).unwrap();

        let segment = manager.segment_by_id_mut(1).unwrap();
        assert_eq!(segment.get(Index::new(1)).unwrap(), None);
        assert_eq!(segment.get(Index::new(2)).unwrap(), None);
    }

    #[test]
    fn uncleaned_entries_are_untouched() {
        let mut manager = build_manager(&[command(1, false), command(2, false)]);

        MinorCompactionTask::new(1, Index::new(100)).run(&test_logger(), &mut manager).unwrap();

        let segment = manager.segment_by_id_mut(1).unwrap();
        assert_eq!(segment.get(Index::new(1)).unwrap(), Some(command(1, false)));
        assert_eq!(segment.get(Index::new(2)).unwrap(), Some(command(2, false)));
    }
}
