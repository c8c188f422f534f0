use crate::cluster::MemberId;
use crate::protocol::{QueryRequest, RequestError};
use crate::storage::{Index, LogEntry, SessionId};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

// The hand-off types crossing the server-context / state-machine-context
// boundary. Everything moves by value; results come back through one-shot
// completions so neither side shares mutable state.

/// Completion for a locally proposed entry: the state machine's result bytes,
/// or the session-level error that stops it.
pub(crate) type ApplyCompletion = oneshot::Sender<Result<Bytes, RequestError>>;

/// Completion for a query: the state-machine version observed plus the result.
pub(crate) type QueryCompletion = oneshot::Sender<Result<(Index, Bytes), RequestError>>;

/// Work items the server context feeds the state-machine driver, in strictly
/// ascending order for entries.
pub(crate) enum ApplyItem {
    /// A committed entry. `completion` is present only on the server that
    /// proposed the entry on behalf of a waiting client.
    Entry {
        entry: LogEntry,
        completion: Option<ApplyCompletion>,
    },

    /// A read-only query, materialized but never logged. Consistency gating
    /// (leader checks, quorum rounds) already happened in the server context.
    /// Queries are not committed entries and therefore never advance the
    /// deterministic clock.
    Query {
        request: QueryRequest,
        completion: QueryCompletion,
    },

    /// Client acknowledgement of events up to (version, sequence).
    EventAck {
        session: SessionId,
        version: Index,
        sequence: u64,
    },

    /// A client connection arrived on this server: events for `session` are
    /// delivered through `sink` once the matching Connect entry applies. The
    /// sink is local volatile state and is never replicated.
    ConnectSink {
        session: SessionId,
        address: String,
        sink: crate::session::EventSink,
    },

    /// Serialize current state-machine state for a snapshot. Returns the
    /// highest applied index together with the opaque bytes.
    TakeSnapshot {
        completion: oneshot::Sender<(Index, Bytes)>,
    },

    /// Replace state-machine state wholesale from a streamed snapshot.
    InstallSnapshot { index: Index, data: Bytes },
}

/// Feedback the driver posts back to the server actor as it applies entries.
#[derive(Clone, Debug)]
pub(crate) enum DriverFeedback {
    /// The entry at `index` no longer contributes to state; mark it clean in
    /// the log.
    CleanEntry { index: Index },

    /// Sessions newly marked Suspect by deterministic-time expiry checks.
    /// Only the leader acts on these.
    SuspectSessions { sessions: Vec<SessionId> },

    /// A Heartbeat entry applied: availability bookkeeping input for the
    /// leader's rebalancer and the global index.
    HeartbeatApplied {
        member: MemberId,
        commit_index: Index,
        timestamp: u64,
    },

    /// Minimum index at or below which every session has acknowledged its
    /// events; gates snapshot taking.
    LastCompleted { index: Index },
}

/// Sending half of the apply stream, owned by the server context.
#[derive(Clone)]
pub(crate) struct DriverClient {
    sender: mpsc::UnboundedSender<ApplyItem>,
}

impl DriverClient {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ApplyItem>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (DriverClient { sender }, receiver)
    }

    /// Sends an item to the driver. A dropped driver means the server is
    /// shutting down; items are silently discarded at that point.
    pub(crate) fn send(&self, item: ApplyItem) {
        let _ = self.sender.send(item);
    }
}
