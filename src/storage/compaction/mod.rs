mod major;
mod minor;

pub use major::MajorCompactionTask;
pub use minor::MinorCompactionTask;

use crate::storage::index::Index;
use crate::storage::manager::SegmentManager;

/// Segments eligible for a minor pass: locked, entirely committed, and with at
/// least one clean mark to act on. The writable tail is never compacted.
pub fn plan_minor(manager: &SegmentManager, commit_index: Index) -> Vec<u64> {
    manager
        .segments()
        .iter()
        .filter(|s| s.is_locked() && s.last_index() <= commit_index && s.cleaned_count() > 0)
        .map(|s| s.descriptor().id)
        .collect()
}

/// Groups of neighboring compactable segments for a major pass. Each group's
/// combined allocated offsets and live bytes must fit a single output segment,
/// bounded by the largest descriptor in the group.
pub fn plan_major(manager: &SegmentManager, commit_index: Index) -> Vec<Vec<u64>> {
    let mut groups: Vec<Vec<u64>> = Vec::new();
    let mut current: Vec<u64> = Vec::new();
    let mut current_entries: u64 = 0;

    for segment in manager.segments() {
        if !segment.is_locked() || segment.last_index() > commit_index {
            // Compactable segments must be consecutive within a group; a
            // non-compactable segment ends the current group.
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                current_entries = 0;
            }
            continue;
        }

        let max_entries = segment.descriptor().max_entries as u64;
        if !current.is_empty() && current_entries + segment.entry_count() as u64 > max_entries {
            groups.push(std::mem::take(&mut current));
            current_entries = 0;
        }
        current.push(segment.descriptor().id);
        current_entries += segment.entry_count() as u64;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::{EntryKind, LogEntry};
    use crate::storage::manager::StorageConfig;
    use crate::storage::index::Term;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn no_op(index: u64) -> LogEntry {
        LogEntry::new(Index::new(index), Term::new(1), EntryKind::NoOp { timestamp: 0 })
    }

    #[test]
    fn planners_exclude_tail_and_uncommitted_segments() {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        manager.current().append(&no_op(1)).unwrap();
        manager.roll_over().unwrap();
        manager.current().append(&no_op(2)).unwrap();
        manager.roll_over().unwrap();
        manager.current().append(&no_op(3)).unwrap();

        manager.segment_by_id_mut(1).unwrap().clean(Index::new(1));
        manager.segment_by_id_mut(2).unwrap().clean(Index::new(2));

        // Only segment 1 is fully committed.
        assert_eq!(plan_minor(&manager, Index::new(1)), vec![1]);
        assert_eq!(plan_major(&manager, Index::new(1)), vec![vec![1]]);

        // Committing further brings segment 2 in; the tail stays out.
        assert_eq!(plan_minor(&manager, Index::new(3)), vec![1, 2]);
        assert_eq!(plan_major(&manager, Index::new(3)), vec![vec![1, 2]]);
    }

    #[test]
    fn minor_planner_requires_clean_marks() {
        let mut manager = SegmentManager::open(test_logger(), StorageConfig::in_memory()).unwrap();
        manager.current().append(&no_op(1)).unwrap();
        manager.roll_over().unwrap();

        assert!(plan_minor(&manager, Index::new(1)).is_empty());
        manager.segment_by_id_mut(1).unwrap().clean(Index::new(1));
        assert_eq!(plan_minor(&manager, Index::new(1)), vec![1]);
    }
}
