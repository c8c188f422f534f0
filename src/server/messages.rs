use crate::cluster::MemberId;
use crate::protocol::{AppendResponse, InstallResponse, PollResponse, VoteResponse};
use crate::storage::{Index, SessionId, Term};

// Internal event payloads: what background RPC tasks and timers post back to
// the server actor. The originating request's identifying fields ride along so
// stale replies can be discarded.

#[derive(Debug)]
pub(crate) struct VoteReplyFromPeer {
    pub peer: MemberId,
    /// Term we were campaigning at when the request went out.
    pub term: Term,
    pub result: RpcReply<VoteResponse>,
}

#[derive(Debug)]
pub(crate) struct PollReplyFromPeer {
    pub peer: MemberId,
    pub term: Term,
    pub result: RpcReply<PollResponse>,
}

#[derive(Debug)]
pub(crate) struct AppendReplyFromPeer {
    pub peer: MemberId,
    pub term: Term,
    /// Request sequence number for this peer; replies arriving out of order
    /// are dropped.
    pub seq_no: u64,
    pub prev_log_index: Index,
    pub num_entries: usize,
    pub result: RpcReply<AppendResponse>,
}

#[derive(Debug)]
pub(crate) struct InstallReplyFromPeer {
    pub peer: MemberId,
    pub term: Term,
    /// Offset immediately after the chunk that was sent.
    pub next_offset: u64,
    pub complete: bool,
    pub snapshot_index: Index,
    pub result: RpcReply<InstallResponse>,
}

/// Outcome of one peer RPC attempt.
#[derive(Debug)]
pub(crate) enum RpcReply<R> {
    Reply(R),
    /// Transport-level failure; retried by the per-peer timer.
    Failed(String),
}

/// One tick of a leader's per-peer replication timer.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct HeartbeatTimerTick {
    pub peer: MemberId,
    pub term: Term,
}

/// Client acknowledgement of published session events, forwarded by whichever
/// connection received it.
#[derive(Clone, Debug)]
pub(crate) struct EventAcknowledgement {
    pub session: SessionId,
    pub version: Index,
    pub sequence: u64,
}
