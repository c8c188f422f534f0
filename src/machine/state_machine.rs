use crate::storage::{Index, SessionId};
use bytes::Bytes;

/// The user-supplied deterministic state machine. Commands arrive in strictly
/// ascending index order with per-session sequence guarantees already
/// enforced; implementations only interpret payloads.
///
/// Everything here runs on the state-machine context. Time is the commit's
/// deterministic timestamp; implementations must not read the wall clock or
/// any other nondeterministic input, or replicas will diverge.
pub trait StateMachine: Send + 'static {
    /// Applies one state-changing command. The returned bytes become the
    /// client's response and are cached for duplicate suppression; an Err is
    /// cached the same way.
    fn apply(&mut self, commit: &mut Commit) -> Result<Bytes, String>;

    /// Answers a read-only query against current state.
    fn query(&self, session: SessionId, payload: &Bytes) -> Result<Bytes, String>;

    /// A new session was registered.
    fn session_registered(&mut self, _session: SessionId) {}

    /// A session was expired by the leader (missed keep-alives). Always
    /// followed by `session_closed`.
    fn session_expired(&mut self, _session: SessionId) {}

    /// A session ended, by unregistration or expiration.
    fn session_closed(&mut self, _session: SessionId) {}

    /// Serializes current state for a snapshot.
    fn snapshot(&self) -> Bytes {
        Bytes::new()
    }

    /// Replaces current state from snapshot bytes.
    fn install(&mut self, _data: Bytes) {}
}

/// One command being applied: its log position, session, deterministic time,
/// and payload, plus the channels through which the state machine publishes
/// session events and reports entries that no longer contribute to state.
pub struct Commit<'a> {
    pub index: Index,
    pub session: SessionId,
    /// Deterministic milliseconds; advances only via entry timestamps.
    pub timestamp: u64,
    pub payload: &'a Bytes,

    pub(crate) events: &'a mut Vec<(SessionId, Bytes)>,
    pub(crate) cleaned: &'a mut Vec<Index>,
}

impl<'a> Commit<'a> {
    /// Publishes an event to `session`'s client. Delivery is ordered and
    /// tracked; linearizable commands complete only after their events are
    /// acknowledged.
    pub fn publish(&mut self, session: SessionId, payload: Bytes) {
        self.events.push((session, payload));
    }

    /// Marks the entry at `index` as no longer contributing to state, making
    /// it eligible for compaction. State machines call this for entries whose
    /// effect has been superseded or erased; the tombstone rule protects
    /// erasures from premature removal.
    pub fn clean(&mut self, index: Index) {
        self.cleaned.push(index);
    }
}
