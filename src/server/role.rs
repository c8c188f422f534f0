use crate::cluster::MemberId;
use crate::protocol::RequestError;
use crate::server::replication::Replicator;
use crate::server::timers::{ElectionTimerHandle, IntervalTimerHandle};
use crate::storage::{Index, SessionId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::oneshot;

/// Externally visible role of a server. Published through a watch channel so
/// applications can react to elections.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
    Passive,
    Reserve,
    Inactive,
}

/// Role is the server's role state machine: one variant per role, each
/// carrying exactly the state that role needs. Transitioning drops the old
/// variant, which cancels its timers through their handles, before the new
/// variant arms its own. Role-independent state lives on the Server.
pub(crate) enum Role {
    Follower(FollowerRole),
    Candidate(CandidateRole),
    Leader(LeaderRole),
    Passive(PassiveRole),
    Reserve(ReserveRole),
    /// Removed from the cluster. Terminal.
    Inactive,
}

impl Role {
    pub(crate) fn kind(&self) -> RoleKind {
        match self {
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
            Role::Passive(_) => RoleKind::Passive,
            Role::Reserve(_) => RoleKind::Reserve,
            Role::Inactive => RoleKind::Inactive,
        }
    }

    /// Who we currently believe leads the cluster.
    pub(crate) fn known_leader(&self, my_id: MemberId) -> Option<MemberId> {
        match self {
            Role::Follower(f) => f.leader,
            Role::Candidate(_) => None,
            Role::Leader(_) => Some(my_id),
            Role::Passive(p) => p.leader,
            Role::Reserve(r) => r.leader,
            Role::Inactive => None,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }

    pub(crate) fn leader_mut(&mut self) -> Option<&mut LeaderRole> {
        match self {
            Role::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    /// Reset the election timer, if this role runs one.
    pub(crate) fn reset_election_timer(&self) {
        match self {
            Role::Follower(f) => f.election_timer.reset(),
            Role::Candidate(c) => c.election_timer.reset(),
            _ => {}
        }
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower(FollowerRole { leader: Some(l), .. }) => write!(f, "Follower(leader={:?})", l),
            Role::Follower(_) => write!(f, "Follower(leader=?)"),
            Role::Candidate(_) => write!(f, "Candidate"),
            Role::Leader(_) => write!(f, "Leader"),
            Role::Passive(_) => write!(f, "Passive"),
            Role::Reserve(_) => write!(f, "Reserve"),
            Role::Inactive => write!(f, "Inactive"),
        }
    }
}

pub(crate) struct FollowerRole {
    pub leader: Option<MemberId>,
    pub election_timer: ElectionTimerHandle,
    /// Held so stateful members keep announcing liveness to the leader.
    pub _member_heartbeat_timer: IntervalTimerHandle,
    /// In-flight pre-vote, if this follower is probing for an election.
    pub poll: Option<PollTally>,
}

/// Pre-vote bookkeeping: which members accepted our probe at which term.
pub(crate) struct PollTally {
    pub term: Term,
    pub accepted: HashSet<MemberId>,
}

pub(crate) struct CandidateRole {
    pub election_timer: ElectionTimerHandle,
    pub _member_heartbeat_timer: IntervalTimerHandle,
    /// Members that granted us their vote this term, self included.
    pub votes: HashSet<MemberId>,
}

pub(crate) struct LeaderRole {
    pub replicator: Replicator,
    pub _session_check_timer: IntervalTimerHandle,
    /// Sessions the deterministic clock has marked Suspect; drained into
    /// Unregister entries by the session-check sweep.
    pub suspect_sessions: HashSet<SessionId>,
    /// Outstanding quorum verification rounds for linearizable reads.
    pub quorum_rounds: Vec<QuorumRound>,
    /// Log index of an uncommitted Configuration entry, if any. While set,
    /// further membership changes are refused.
    pub uncommitted_configuration: Option<Index>,
    /// Set once this leader's initial no-op commits; membership changes and
    /// prior-term commits wait for it.
    pub no_op_committed: bool,
}

/// One round of "prove we are still the quorum's leader": records the request
/// seq-no sent to each voting peer at round start; a peer counts once it
/// answers any request at or past that seq-no.
pub(crate) struct QuorumRound {
    pub sent: HashMap<MemberId, u64>,
    pub acked: HashSet<MemberId>,
    pub needed: usize,
    pub waiter: oneshot::Sender<Result<(), RequestError>>,
}

impl QuorumRound {
    pub(crate) fn record_ack(&mut self, peer: MemberId, seq_no: u64) {
        if let Some(sent_seq) = self.sent.get(&peer) {
            if seq_no >= *sent_seq {
                self.acked.insert(peer);
            }
        }
    }

    /// Acks needed counts the leader itself as one.
    pub(crate) fn is_satisfied(&self) -> bool {
        self.acked.len() + 1 >= self.needed
    }
}

pub(crate) struct PassiveRole {
    pub leader: Option<MemberId>,
    pub _member_heartbeat_timer: IntervalTimerHandle,
}

pub(crate) struct ReserveRole {
    pub leader: Option<MemberId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_round_counts_self() {
        let (tx, _rx) = oneshot::channel();
        let mut round = QuorumRound {
            sent: HashMap::from([(MemberId::new(2), 5), (MemberId::new(3), 9)]),
            acked: HashSet::new(),
            needed: 2,
            waiter: tx,
        };
        assert!(!round.is_satisfied());

        // A reply from before the round started doesn't count.
        round.record_ack(MemberId::new(2), 4);
        assert!(!round.is_satisfied());

        round.record_ack(MemberId::new(2), 5);
        assert!(round.is_satisfied(), "one peer plus self is a quorum of 2");
    }

    #[test]
    fn unknown_peer_ack_is_ignored() {
        let (tx, _rx) = oneshot::channel();
        let mut round = QuorumRound {
            sent: HashMap::from([(MemberId::new(2), 5)]),
            acked: HashSet::new(),
            needed: 3,
            waiter: tx,
        };
        round.record_ack(MemberId::new(9), 100);
        assert!(round.acked.is_empty());
    }
}
