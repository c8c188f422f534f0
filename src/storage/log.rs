use crate::storage::entry::LogEntry;
use crate::storage::index::{Index, Term};
use crate::storage::manager::{SegmentManager, StorageConfig};
use std::io;

/// SegmentedLog is the replicated log facade: append/skip/truncate/get over the
/// ordered segment set, the per-entry clean marks the state machine feeds back,
/// and the commit floor below which truncation is a fatal bug.
///
/// A log entry has three states, none of which are modeled as data: persisted
/// (written here), committed (replicated to a quorum), applied (fed through the
/// state machine). Each server only ever knows its own local view.
pub struct SegmentedLog {
    logger: slog::Logger,
    manager: SegmentManager,
    // Highest index known committed. Truncation at or below this panics.
    commit_index: Index,
    // Term/index of the highest live (non-skipped) entry, kept so consensus can
    // answer last-entry questions without re-reading the tail.
    last_entry_id: Option<(Term, Index)>,
}

impl SegmentedLog {
    pub fn open(logger: slog::Logger, config: StorageConfig) -> io::Result<SegmentedLog> {
        let mut manager = SegmentManager::open(logger.clone(), config)?;
        let last_entry_id = recover_last_entry_id(&mut manager)?;

        Ok(SegmentedLog {
            logger,
            manager,
            commit_index: Index::ZERO,
            last_entry_id,
        })
    }

    /// First allocated index. ZERO for a log that has never held anything; a
    /// log reset around a snapshot starts past the snapshot instead.
    pub fn first_index(&self) -> Index {
        let base = self.manager.first_index();
        if self.is_empty() && base == Index::new(1) {
            Index::ZERO
        } else {
            base
        }
    }

    /// Highest allocated index (live or skipped). For an empty log this is the
    /// index just before the first writable one.
    pub fn last_index(&self) -> Index {
        self.manager.last_index()
    }

    pub fn is_empty(&self) -> bool {
        self.manager.last_index() < self.manager.first_index()
    }

    pub fn next_index(&self) -> Index {
        self.manager.last_index().next()
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Term and index of the highest live entry.
    pub fn last_entry_id(&self) -> Option<(Term, Index)> {
        self.last_entry_id
    }

    /// Appends `entry`, rolling to a new segment when the current one is full.
    /// The entry's index must be the log's next index.
    pub fn append(&mut self, entry: LogEntry) -> io::Result<Index> {
        assert_eq!(
            entry.index,
            self.next_index(),
            "append must land at the log's next index"
        );

        let encoded_len = entry.encode().len();
        if self.manager.current().is_full(encoded_len) {
            self.manager.roll_over()?;
        }

        let index = self.manager.current().append(&entry)?;
        self.last_entry_id = Some((entry.term, index));
        Ok(index)
    }

    /// Reserves `n` indices without entries.
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        let mut remaining = n;
        while remaining > 0 {
            if self.manager.current().is_full(0) {
                self.manager.roll_over()?;
            }
            self.manager.current().skip(1)?;
            remaining -= 1;
        }
        Ok(())
    }

    pub fn get(&mut self, index: Index) -> io::Result<Option<LogEntry>> {
        match self.manager.segment_containing_mut(index) {
            Some(segment) => segment.get(index),
            None => Ok(None),
        }
    }

    /// Removes every entry with index greater than `index`. Truncating below
    /// the commit floor is a programming error: committed entries are immutable.
    pub fn truncate(&mut self, index: Index) -> io::Result<()> {
        assert!(
            index >= self.commit_index,
            "truncate({:?}) below commit index {:?}; the log is unsafe",
            index,
            self.commit_index,
        );

        self.manager.truncate_to(index)?;
        self.last_entry_id = recover_last_entry_id(&mut self.manager)?;
        slog::debug!(self.logger, "Truncated log"; "to_index" => %index);
        Ok(())
    }

    /// Ratchets the commit floor forward. Panics on a backwards move.
    pub fn commit(&mut self, index: Index) {
        if index == self.commit_index {
            return;
        }
        assert!(
            index > self.commit_index,
            "commit index can only ratchet forward: {:?} -> {:?}",
            self.commit_index,
            index,
        );
        assert!(
            index <= self.last_index(),
            "cannot commit past the local log: commit {:?}, last {:?}",
            index,
            self.last_index(),
        );
        self.commit_index = index;
    }

    /// Marks `index` clean: the state machine no longer needs it for current
    /// state, so compaction may drop it subject to the tombstone rule.
    pub fn clean(&mut self, index: Index) {
        if let Some(segment) = self.manager.segment_containing_mut(index) {
            segment.clean(index);
        }
    }

    pub fn is_clean(&self, index: Index) -> bool {
        self.manager
            .segment_containing(index)
            .map_or(false, |segment| segment.is_clean(index))
    }

    /// Discards the entire log and restarts it just past `snapshot_index`.
    /// Used when a streamed snapshot replaces everything this server held.
    pub fn reset_to(&mut self, snapshot_index: Index) -> io::Result<()> {
        self.manager.reset(snapshot_index.next())?;
        self.commit_index = snapshot_index;
        self.last_entry_id = None;
        slog::info!(self.logger, "Log reset around snapshot"; "snapshot_index" => %snapshot_index);
        Ok(())
    }

    pub(crate) fn manager(&self) -> &SegmentManager {
        &self.manager
    }

    pub(crate) fn manager_mut(&mut self) -> &mut SegmentManager {
        &mut self.manager
    }
}

fn recover_last_entry_id(manager: &mut SegmentManager) -> io::Result<Option<(Term, Index)>> {
    let first = manager.first_index();
    let mut index = manager.last_index();
    while index >= first && !index.is_zero() {
        if let Some(segment) = manager.segment_containing_mut(index) {
            if let Some(entry) = segment.get(index)? {
                return Ok(Some((entry.term, index)));
            }
        }
        index = match index.checked_prev() {
            Some(prev) => prev,
            None => break,
        };
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::EntryKind;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn open_log() -> SegmentedLog {
        SegmentedLog::open(test_logger(), StorageConfig::in_memory()).unwrap()
    }

    fn no_op(index: u64, term: u64) -> LogEntry {
        LogEntry::new(Index::new(index), Term::new(term), EntryKind::NoOp { timestamp: 0 })
    }

    #[test]
    fn empty_log_boundaries() {
        let log = open_log();
        assert!(log.is_empty());
        assert_eq!(log.first_index(), Index::ZERO);
        assert_eq!(log.last_index(), Index::ZERO);
        assert_eq!(log.next_index(), Index::new(1));
        assert_eq!(log.last_entry_id(), None);
    }

    #[test]
    fn first_append_lands_at_one() {
        let mut log = open_log();
        let index = log.append(no_op(1, 1)).unwrap();
        assert_eq!(index, Index::new(1));
        assert_eq!(log.first_index(), Index::new(1));
        assert_eq!(log.get(Index::new(1)).unwrap(), Some(no_op(1, 1)));
    }

    #[test]
    fn append_get_round_trip_with_skips() {
        let mut log = open_log();
        log.append(no_op(1, 1)).unwrap();
        log.skip(3).unwrap();
        log.append(no_op(5, 2)).unwrap();

        assert_eq!(log.last_index(), Index::new(5));
        assert_eq!(log.get(Index::new(3)).unwrap(), None);
        assert_eq!(log.get(Index::new(5)).unwrap(), Some(no_op(5, 2)));
        assert_eq!(log.last_entry_id(), Some((Term::new(2), Index::new(5))));
    }

    #[test]
    fn truncate_to_zero_empties_the_log() {
        let mut log = open_log();
        log.append(no_op(1, 1)).unwrap();
        log.append(no_op(2, 1)).unwrap();

        log.truncate(Index::ZERO).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.first_index(), Index::ZERO);
        assert_eq!(log.last_entry_id(), None);

        // The log is writable again from index 1.
        log.append(no_op(1, 3)).unwrap();
        assert_eq!(log.get(Index::new(1)).unwrap(), Some(no_op(1, 3)));
    }

    #[test]
    fn truncate_recovers_last_entry_term() {
        let mut log = open_log();
        log.append(no_op(1, 1)).unwrap();
        log.append(no_op(2, 1)).unwrap();
        log.append(no_op(3, 2)).unwrap();

        log.truncate(Index::new(2)).unwrap();
        assert_eq!(log.last_entry_id(), Some((Term::new(1), Index::new(2))));
    }

    #[test]
    #[should_panic(expected = "below commit index")]
    fn truncate_below_commit_index_panics() {
        let mut log = open_log();
        log.append(no_op(1, 1)).unwrap();
        log.append(no_op(2, 1)).unwrap();
        log.commit(Index::new(2));
        let _ = log.truncate(Index::new(1));
    }

    #[test]
    #[should_panic(expected = "ratchet forward")]
    fn commit_index_cannot_move_backwards() {
        let mut log = open_log();
        log.append(no_op(1, 1)).unwrap();
        log.append(no_op(2, 1)).unwrap();
        log.commit(Index::new(2));
        log.commit(Index::new(1));
    }

    #[test]
    fn clean_marks_are_per_entry() {
        let mut log = open_log();
        log.append(no_op(1, 1)).unwrap();
        log.append(no_op(2, 1)).unwrap();

        log.clean(Index::new(1));
        assert!(log.is_clean(Index::new(1)));
        assert!(!log.is_clean(Index::new(2)));
    }

    #[test]
    fn truncate_across_segment_boundary() {
        let mut log = open_log();
        log.append(no_op(1, 1)).unwrap();
        log.append(no_op(2, 1)).unwrap();
        log.manager_mut().roll_over().unwrap();
        log.append(no_op(3, 1)).unwrap();
        log.append(no_op(4, 1)).unwrap();

        log.truncate(Index::new(2)).unwrap();
        assert_eq!(log.last_index(), Index::new(2));
        assert_eq!(log.get(Index::new(3)).unwrap(), None);
        assert_eq!(log.next_index(), Index::new(3));

        log.append(no_op(3, 5)).unwrap();
        assert_eq!(log.get(Index::new(3)).unwrap(), Some(no_op(3, 5)));
    }
}
