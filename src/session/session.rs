use crate::machine::{ApplyCompletion, QueryCompletion};
use crate::protocol::{QueryRequest, RequestError};
use crate::session::event::{EventHolder, EventSink};
use crate::storage::{Index, SessionId};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};

/// Session lifecycle. Suspect is a soft precursor to expiration: the
/// deterministic clock has run past the session's timeout, but only the
/// leader may turn that into an Unregister entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SessionState {
    Open,
    Suspect,
    Unregistering,
    Closed,
    Expired,
}

/// A cached command response, kept until the client acknowledges the sequence
/// so duplicates replay identically - including failures.
pub(crate) struct CachedResponse {
    pub result: Result<Bytes, RequestError>,
    /// Pending linearizable-event completion, if the command published events
    /// that haven't all been acknowledged yet.
    pub pending_events: Option<u64>,
}

/// A command that arrived ahead of its predecessors, parked until the
/// sequence gap fills.
pub(crate) struct QueuedCommand {
    pub entry_index: Index,
    pub timestamp: u64,
    pub payload: Bytes,
    pub linearizable: bool,
    pub completion: Option<ApplyCompletion>,
}

/// A query parked on a sequence or version threshold.
pub(crate) struct QueuedQuery {
    pub request: QueryRequest,
    pub completion: QueryCompletion,
}

/// Server-side session state: sequencing, the response cache, and the event
/// stream. Owned exclusively by the state-machine driver.
pub(crate) struct ServerSession {
    id: SessionId,
    client_id: String,
    timeout_ms: u64,
    state: SessionState,

    /// Deterministic time of the last liveness-bearing entry for this session.
    pub last_timestamp: u64,

    /// Highest command sequence applied to the state machine.
    pub command_sequence: u64,
    pub responses: BTreeMap<u64, CachedResponse>,
    pub queued_commands: BTreeMap<u64, QueuedCommand>,

    pub queries_by_sequence: BTreeMap<u64, Vec<QueuedQuery>>,
    pub queries_by_version: BTreeMap<Index, Vec<QueuedQuery>>,

    // Event stream state.
    pub event_version: Index,
    pub event_sequence: u64,
    pub event_queue: VecDeque<EventHolder>,
    pub event_ack_version: Index,
    pub event_ack_sequence: u64,

    /// Client-facing address this session's events are delivered to.
    pub connect_address: Option<String>,
    pub connect_index: Index,
    pub keep_alive_index: Index,
    /// Live delivery channel, present only on the server holding the
    /// connection.
    pub sink: Option<EventSink>,
}

impl ServerSession {
    pub(crate) fn new(id: SessionId, client_id: String, timeout_ms: u64, timestamp: u64) -> Self {
        ServerSession {
            id,
            client_id,
            timeout_ms,
            state: SessionState::Open,
            last_timestamp: timestamp,
            command_sequence: 0,
            responses: BTreeMap::new(),
            queued_commands: BTreeMap::new(),
            queries_by_sequence: BTreeMap::new(),
            queries_by_version: BTreeMap::new(),
            event_version: Index::ZERO,
            event_sequence: 0,
            event_queue: VecDeque::new(),
            event_ack_version: Index::ZERO,
            event_ack_sequence: 0,
            connect_address: None,
            connect_index: Index::ZERO,
            keep_alive_index: Index::ZERO,
            sink: None,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open | SessionState::Suspect)
    }

    /// A keep-alive landed: the session is trusted again regardless of how
    /// late it was.
    pub(crate) fn trust(&mut self) {
        if self.state == SessionState::Suspect {
            self.state = SessionState::Open;
        }
    }

    /// The sequence the next in-order command must carry.
    pub(crate) fn next_command_sequence(&self) -> u64 {
        self.command_sequence + 1
    }

    /// Drops cached responses the client has acknowledged.
    pub(crate) fn clear_responses(&mut self, through_sequence: u64) {
        self.responses = self.responses.split_off(&(through_sequence + 1));
    }

    /// Assigns the next (version, sequence) pair for an event published at
    /// `index`. A new index restarts the per-version sequence.
    pub(crate) fn next_event_position(&mut self, index: Index) -> (Index, u64, Index, u64) {
        let previous_version = self.event_version;
        let previous_sequence = self.event_sequence;
        if self.event_version != index {
            self.event_version = index;
            self.event_sequence = 1;
        } else {
            self.event_sequence += 1;
        }
        (self.event_version, self.event_sequence, previous_version, previous_sequence)
    }

    /// Acknowledges events through (version, sequence), returning the
    /// linearizable completions those events were holding up.
    pub(crate) fn acknowledge_events(&mut self, version: Index, sequence: u64) -> Vec<u64> {
        if version < self.event_ack_version
            || (version == self.event_ack_version && sequence < self.event_ack_sequence)
        {
            return Vec::new();
        }
        self.event_ack_version = version;
        self.event_ack_sequence = sequence;

        let mut released = Vec::new();
        while let Some(front) = self.event_queue.front() {
            if front.acked_by(version, sequence) {
                let event = self.event_queue.pop_front().expect("front checked");
                released.extend(event.completions);
            } else {
                break;
            }
        }
        released
    }

    /// Re-sends every unacknowledged event to the current sink, starting from
    /// the client's last acknowledged position.
    pub(crate) fn replay_events(&self) {
        let sink = match &self.sink {
            Some(sink) => sink,
            None => return,
        };
        for event in &self.event_queue {
            let _ = sink.send(event.to_publish(self.id));
        }
    }

    /// The index below which this session holds nothing back: with no pending
    /// events, the session is caught up through `floor`.
    pub(crate) fn completed_index(&self, floor: Index) -> Index {
        match self.event_queue.front() {
            Some(front) => front.version.checked_prev().unwrap_or(Index::ZERO),
            None => floor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ServerSession {
        ServerSession::new(Index::new(3), "client-x".to_string(), 5000, 100)
    }

    #[test]
    fn event_positions_restart_per_index() {
        let mut s = session();
        assert_eq!(s.next_event_position(Index::new(10)), (Index::new(10), 1, Index::ZERO, 0));
        assert_eq!(s.next_event_position(Index::new(10)), (Index::new(10), 2, Index::new(10), 1));
        assert_eq!(s.next_event_position(Index::new(12)), (Index::new(12), 1, Index::new(10), 2));
    }

    #[test]
    fn acknowledging_releases_completions_in_order() {
        let mut s = session();
        s.event_queue.push_back(EventHolder {
            version: Index::new(10),
            sequence: 1,
            previous_version: Index::ZERO,
            previous_sequence: 0,
            payload: Bytes::new(),
            completions: vec![7],
        });
        s.event_queue.push_back(EventHolder {
            version: Index::new(12),
            sequence: 1,
            previous_version: Index::new(10),
            previous_sequence: 1,
            payload: Bytes::new(),
            completions: vec![9],
        });

        assert_eq!(s.acknowledge_events(Index::new(10), 1), vec![7]);
        assert_eq!(s.event_queue.len(), 1);

        // A stale ack releases nothing and doesn't rewind the floor.
        assert!(s.acknowledge_events(Index::new(9), 0).is_empty());
        assert_eq!(s.event_ack_version, Index::new(10));

        assert_eq!(s.acknowledge_events(Index::new(12), 1), vec![9]);
        assert!(s.event_queue.is_empty());
    }

    #[test]
    fn response_cache_clears_through_ack() {
        let mut s = session();
        for sequence in 1..=4 {
            s.responses.insert(
                sequence,
                CachedResponse {
                    result: Ok(Bytes::new()),
                    pending_events: None,
                },
            );
        }
        s.clear_responses(2);
        assert!(!s.responses.contains_key(&1));
        assert!(!s.responses.contains_key(&2));
        assert!(s.responses.contains_key(&3));
        assert!(s.responses.contains_key(&4));
    }

    #[test]
    fn completed_index_holds_at_pending_events() {
        let mut s = session();
        assert_eq!(s.completed_index(Index::new(20)), Index::new(20));

        s.event_queue.push_back(EventHolder {
            version: Index::new(15),
            sequence: 1,
            previous_version: Index::ZERO,
            previous_sequence: 0,
            payload: Bytes::new(),
            completions: Vec::new(),
        });
        assert_eq!(s.completed_index(Index::new(20)), Index::new(14));
    }

    #[test]
    fn trust_only_recovers_suspect() {
        let mut s = session();
        s.set_state(SessionState::Suspect);
        s.trust();
        assert_eq!(s.state(), SessionState::Open);

        s.set_state(SessionState::Expired);
        s.trust();
        assert_eq!(s.state(), SessionState::Expired);
    }
}
