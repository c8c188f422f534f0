use crate::protocol::PublishRequest;
use crate::storage::{Index, SessionId};
use bytes::Bytes;
use tokio::sync::mpsc;

/// The channel through which published session events reach the connection a
/// client registered. Local and volatile: a sink never crosses servers.
pub(crate) type EventSink = mpsc::UnboundedSender<PublishRequest>;

/// One event published to a session, parked until the client acknowledges it.
///
/// Events are ordered by (version, sequence): version is the index of the
/// command that published the event, sequence distinguishes multiple events
/// published at the same index. The pair of the previous event rides along so
/// receivers can detect gaps and ask for a replay.
#[derive(Clone, Debug)]
pub(crate) struct EventHolder {
    pub version: Index,
    pub sequence: u64,
    pub previous_version: Index,
    pub previous_sequence: u64,
    pub payload: Bytes,
    /// Linearizable-command completions waiting on this event's ack.
    pub completions: Vec<u64>,
}

impl EventHolder {
    pub(crate) fn to_publish(&self, session: SessionId) -> PublishRequest {
        PublishRequest {
            session,
            event_version: self.version,
            event_sequence: self.sequence,
            previous_version: self.previous_version,
            previous_sequence: self.previous_sequence,
            payload: self.payload.clone(),
        }
    }

    /// True if this event is covered by an acknowledgement up to
    /// (version, sequence).
    pub(crate) fn acked_by(&self, version: Index, sequence: u64) -> bool {
        self.version < version || (self.version == version && self.sequence <= sequence)
    }
}
