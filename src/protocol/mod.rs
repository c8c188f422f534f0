use crate::cluster::{Configuration, Member, MemberId};
use crate::storage::{CommandConsistency, Index, LogEntry, QueryConsistency, SessionId, Term};
use bytes::Bytes;

// Message shapes for the two protocol surfaces: client <-> server session
// operations and server <-> server consensus RPCs. Framing and transport are
// a peer-client concern; these are the types every handler consumes.

// ---------- client -> server ----------

#[derive(Clone, Debug)]
pub struct RegisterRequest {
    pub client_id: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct RegisterResponse {
    /// The committed Register entry's index, which IS the session id.
    pub session: SessionId,
    pub timeout_ms: u64,
    pub leader: MemberId,
    pub members: Vec<Member>,
}

#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub session: SessionId,
    /// Client-facing address of the server now holding this session's
    /// connection; events for the session are delivered there.
    pub address: String,
}

#[derive(Clone, Debug)]
pub struct AcceptResponse {}

#[derive(Clone, Debug)]
pub struct KeepAliveRequest {
    pub session: SessionId,
    /// Highest command sequence for which the client has a response.
    pub command_seq_ack: u64,
    /// Highest event version received in order by the client.
    pub event_version_ack: u64,
}

#[derive(Clone, Debug)]
pub struct KeepAliveResponse {
    pub leader: MemberId,
    pub members: Vec<Member>,
}

#[derive(Clone, Debug)]
pub struct UnregisterRequest {
    pub session: SessionId,
}

#[derive(Clone, Debug)]
pub struct UnregisterResponse {}

#[derive(Clone, Debug)]
pub struct CommandRequest {
    pub session: SessionId,
    /// Client-assigned, strictly increasing per session.
    pub sequence: u64,
    pub payload: Bytes,
    pub consistency: CommandConsistency,
    /// True when this operation erases state written by earlier commands; the
    /// entry becomes a tombstone in the log.
    pub tombstone: bool,
}

#[derive(Clone, Debug)]
pub struct CommandResponse {
    pub index: Index,
    pub result: Bytes,
}

#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub session: SessionId,
    /// The session's command sequence at submission; the query waits for that
    /// command to apply first.
    pub sequence: u64,
    /// Highest state-machine version this client has observed; the query waits
    /// until the local state machine has advanced at least this far.
    pub version: Index,
    pub payload: Bytes,
    pub consistency: QueryConsistency,
}

#[derive(Clone, Debug)]
pub struct QueryResponse {
    /// State-machine version the query observed; clients feed it back to keep
    /// reads monotonic.
    pub version: Index,
    pub result: Bytes,
}

// ---------- server -> client ----------

#[derive(Clone, Debug)]
pub struct PublishRequest {
    pub session: SessionId,
    pub event_version: Index,
    pub event_sequence: u64,
    /// Previous (version, sequence) in the session's event stream, letting the
    /// client detect gaps and request a replay.
    pub previous_version: Index,
    pub previous_sequence: u64,
    pub payload: Bytes,
}

#[derive(Clone, Debug)]
pub struct PublishResponse {
    /// Where the client actually is in the stream. On gap detection this is
    /// behind the published event and the server re-sends from here.
    pub acknowledged_version: Index,
    pub acknowledged_sequence: u64,
}

// ---------- server -> server ----------

#[derive(Clone, Debug)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: MemberId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub commit_index: Index,
    /// Minimum match index across all stateful members; bounds tombstone
    /// compaction on every server.
    pub global_index: Index,
}

#[derive(Clone, Debug)]
pub struct AppendResponse {
    pub term: Term,
    pub succeeded: bool,
    /// On success: the highest index this server has appended. On a
    /// consistency rejection: a resync hint for the leader's next attempt.
    pub log_index: Index,
}

#[derive(Clone, Debug)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Clone, Debug)]
pub struct VoteResponse {
    pub term: Term,
    pub voted: bool,
}

/// Pre-vote probe sent by a follower before it becomes a candidate. Acceptance
/// uses the same log-up-to-date rule as voting but grants nothing durable.
#[derive(Clone, Debug)]
pub struct PollRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Clone, Debug)]
pub struct PollResponse {
    pub term: Term,
    pub accepted: bool,
}

/// One chunk of a snapshot being streamed to a peer whose log starts after the
/// leader's first index.
#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub term: Term,
    pub leader: MemberId,
    /// Index the snapshot covers.
    pub index: Index,
    pub offset: u64,
    pub data: Bytes,
    pub complete: bool,
}

#[derive(Clone, Debug)]
pub struct InstallResponse {
    pub term: Term,
    pub succeeded: bool,
}

/// Direct configuration propagation to Passive/Reserve members, which don't
/// learn configurations through normal replication fast enough to converge.
#[derive(Clone, Debug)]
pub struct ConfigureRequest {
    pub term: Term,
    pub leader: MemberId,
    pub configuration: Configuration,
}

#[derive(Clone, Debug)]
pub struct ConfigureResponse {
    pub term: Term,
}

/// Availability signal each stateful member sends the leader periodically.
#[derive(Clone, Debug)]
pub struct HeartbeatRequest {
    pub member: MemberId,
    pub commit_index: Index,
}

#[derive(Clone, Debug)]
pub struct HeartbeatResponse {
    pub term: Term,
    pub leader: Option<MemberId>,
}

#[derive(Clone, Debug)]
pub struct JoinRequest {
    pub member: Member,
}

#[derive(Clone, Debug)]
pub struct JoinResponse {
    pub configuration: Configuration,
}

#[derive(Clone, Debug)]
pub struct LeaveRequest {
    pub member: MemberId,
}

#[derive(Clone, Debug)]
pub struct LeaveResponse {
    pub configuration: Configuration,
}

// ---------- errors ----------

/// Wire-level error kinds. Every failed response carries exactly one of these;
/// clients decide retry behavior from the kind alone.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Retry against another member; an election is likely in progress.
    NoLeader,
    /// The session expired or never existed; the client must re-register.
    UnknownSession,
    /// The receiving member cannot serve this request in its current role.
    IllegalMemberState,
    /// The user state machine raised an error; propagated verbatim.
    ApplicationError,
    InternalError,
    /// The operation could not satisfy its consistency requirement.
    CommandError,
}

/// RequestError is the handler-side error for client-facing operations. It
/// carries redirect context the wire kind alone can't.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    #[error("no leader is currently elected")]
    NoLeader { leader_hint: Option<Member> },

    #[error("unknown session {0:?}")]
    UnknownSession(SessionId),

    #[error("member cannot serve this request: {0}")]
    IllegalMemberState(&'static str),

    #[error("state machine error: {0}")]
    ApplicationError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("could not satisfy consistency requirement: {0}")]
    CommandError(&'static str),
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RequestError::NoLeader { .. } => ErrorKind::NoLeader,
            RequestError::UnknownSession(_) => ErrorKind::UnknownSession,
            RequestError::IllegalMemberState(_) => ErrorKind::IllegalMemberState,
            RequestError::ApplicationError(_) => ErrorKind::ApplicationError,
            RequestError::InternalError(_) => ErrorKind::InternalError,
            RequestError::CommandError(_) => ErrorKind::CommandError,
        }
    }
}
