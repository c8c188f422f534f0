use crate::cluster::{Configuration, MemberId};
use crate::storage::buffer::{Buffer, FileBuffer, HeapBuffer};
use crate::storage::index::Term;
use bytes::BytesMut;
use std::io;
use std::path::PathBuf;

const POS_TERM: u64 = 0;
const POS_VOTED_FOR: u64 = 8;
const POS_CONFIGURATION: u64 = 12;
const META_CAPACITY: u64 = 64 * 1024;

/// MetaStore persists the algorithm-correctness-critical local state: current
/// term, the vote cast this term, and the latest committed configuration.
/// Everything else the server holds can be rebuilt from the log; this cannot.
///
/// Layout: term at 0..8, voted_for at 8..12 (0 = no vote), configuration
/// record from 12.
pub struct MetaStore {
    buffer: Box<dyn Buffer>,
    term: Term,
    voted_for: Option<MemberId>,
    configuration: Option<Configuration>,
}

impl MetaStore {
    pub fn open(directory: Option<&PathBuf>) -> io::Result<MetaStore> {
        let buffer: Box<dyn Buffer> = match directory {
            Some(directory) => {
                std::fs::create_dir_all(directory)?;
                Box::new(FileBuffer::allocate(directory.join("meta.bin"), META_CAPACITY)?)
            }
            None => Box::new(HeapBuffer::allocate(META_CAPACITY)),
        };
        Self::from_buffer(buffer)
    }

    fn from_buffer(mut buffer: Box<dyn Buffer>) -> io::Result<MetaStore> {
        let (term, voted_for, configuration) = if buffer.len() >= POS_CONFIGURATION {
            let term = Term::new(buffer.read_u64(POS_TERM)?);
            let raw_vote = buffer.read_u32(POS_VOTED_FOR)?;
            let voted_for = if raw_vote == 0 { None } else { Some(MemberId::new(raw_vote)) };

            let configuration = if buffer.len() > POS_CONFIGURATION {
                let len = (buffer.len() - POS_CONFIGURATION) as usize;
                let mut raw = buffer.read_bytes(POS_CONFIGURATION, len)?;
                Some(Configuration::decode(&mut raw)?)
            } else {
                None
            };
            (term, voted_for, configuration)
        } else {
            buffer.write_u64(POS_TERM, 0)?;
            buffer.write_u32(POS_VOTED_FOR, 0)?;
            (Term::ZERO, None, None)
        };

        Ok(MetaStore {
            buffer,
            term,
            voted_for,
            configuration,
        })
    }

    pub fn current_term(&self) -> Term {
        self.term
    }

    pub fn voted_for(&self) -> Option<MemberId> {
        self.voted_for
    }

    /// Atomic read of (term, vote) so callers can't interleave the pair.
    pub fn term_and_vote(&self) -> (Term, Option<MemberId>) {
        (self.term, self.voted_for)
    }

    /// Persists `new_term` if it is greater than the current term, clearing the
    /// vote. Returns true if the term advanced.
    pub fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        if new_term <= self.term {
            return Ok(false);
        }
        self.buffer.write_u64(POS_TERM, new_term.val())?;
        self.buffer.write_u32(POS_VOTED_FOR, 0)?;
        self.buffer.flush()?;
        self.term = new_term;
        self.voted_for = None;
        Ok(true)
    }

    /// Records a vote for `candidate` in `expected_term` if no vote has been
    /// cast this term. The vote is durable before this returns true: a vote
    /// that isn't persisted before the response is sent can be double-cast
    /// after a restart.
    pub fn store_vote_if_unvoted(&mut self, expected_term: Term, candidate: MemberId) -> io::Result<bool> {
        if expected_term != self.term || self.voted_for.is_some() {
            return Ok(false);
        }
        self.buffer.write_u32(POS_VOTED_FOR, candidate.val())?;
        self.buffer.flush()?;
        self.voted_for = Some(candidate);
        Ok(true)
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    pub fn store_configuration(&mut self, configuration: Configuration) -> io::Result<()> {
        let mut encoded = BytesMut::new();
        configuration.encode(&mut encoded);
        self.buffer.truncate(POS_CONFIGURATION)?;
        self.buffer.write_bytes(POS_CONFIGURATION, &encoded)?;
        self.buffer.flush()?;
        self.configuration = Some(configuration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Member, MemberKind};
    use crate::storage::index::Index;

    #[test]
    fn fresh_store_has_no_state() {
        let store = MetaStore::open(None).unwrap();
        assert_eq!(store.current_term(), Term::ZERO);
        assert_eq!(store.voted_for(), None);
        assert!(store.configuration().is_none());
    }

    #[test]
    fn term_only_increases_and_clears_vote() {
        let mut store = MetaStore::open(None).unwrap();
        assert!(store.store_term_if_increased(Term::new(3)).unwrap());
        assert!(store.store_vote_if_unvoted(Term::new(3), MemberId::new(2)).unwrap());

        assert!(!store.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!store.store_term_if_increased(Term::new(2)).unwrap());
        assert_eq!(store.voted_for(), Some(MemberId::new(2)));

        assert!(store.store_term_if_increased(Term::new(4)).unwrap());
        assert_eq!(store.voted_for(), None);
    }

    #[test]
    fn one_vote_per_term() {
        let mut store = MetaStore::open(None).unwrap();
        store.store_term_if_increased(Term::new(1)).unwrap();

        assert!(store.store_vote_if_unvoted(Term::new(1), MemberId::new(1)).unwrap());
        assert!(!store.store_vote_if_unvoted(Term::new(1), MemberId::new(2)).unwrap());
        assert_eq!(store.voted_for(), Some(MemberId::new(1)));

        // Votes for a stale or future term are refused outright.
        assert!(!store.store_vote_if_unvoted(Term::new(9), MemberId::new(2)).unwrap());
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let directory = dir.path().to_path_buf();

        {
            let mut store = MetaStore::open(Some(&directory)).unwrap();
            store.store_term_if_increased(Term::new(7)).unwrap();
            store.store_vote_if_unvoted(Term::new(7), MemberId::new(3)).unwrap();
            store
                .store_configuration(Configuration::new(
                    Index::new(5),
                    vec![Member::new(MemberId::new(1), MemberKind::Active, "a:1", "a:2")],
                ))
                .unwrap();
        }

        let store = MetaStore::open(Some(&directory)).unwrap();
        assert_eq!(store.current_term(), Term::new(7));
        assert_eq!(store.voted_for(), Some(MemberId::new(3)));
        assert_eq!(store.configuration().unwrap().version(), Index::new(5));
    }
}
