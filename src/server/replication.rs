use crate::cluster::{Configuration, MemberId};
use crate::server::messages::HeartbeatTimerTick;
use crate::server::timers::HeartbeatTimerHandle;
use crate::actor::WeakActorClient;
use crate::storage::{Index, Term};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Replicator is the leader's per-peer bookkeeping: where each peer's log is,
/// what's in flight, and what that implies for the commit and global indexes.
/// It makes no decisions about *when* to send; the server drives it from
/// heartbeat ticks and RPC replies.
pub(crate) struct Replicator {
    term: Term,
    /// Index of the no-op this leader appended on election. Commit index may
    /// not advance past entries of prior terms until this one is in the
    /// quorum's logs.
    initial_entry_index: Index,
    peers: HashMap<MemberId, ReplicationState>,
}

impl Replicator {
    pub(crate) fn new(
        term: Term,
        initial_entry_index: Index,
        configuration: &Configuration,
        my_id: MemberId,
        my_last_index: Index,
        heartbeat_interval: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let mut replicator = Replicator {
            term,
            initial_entry_index,
            peers: HashMap::new(),
        };
        replicator.reconfigure(configuration, my_id, my_last_index, heartbeat_interval, actor_client);
        replicator
    }

    pub(crate) fn term(&self) -> Term {
        self.term
    }

    pub(crate) fn initial_entry_index(&self) -> Index {
        self.initial_entry_index
    }

    /// Aligns the peer set with `configuration`: new members get fresh state
    /// and a timer, removed members are dropped (their timers cancel on drop).
    pub(crate) fn reconfigure(
        &mut self,
        configuration: &Configuration,
        my_id: MemberId,
        my_last_index: Index,
        heartbeat_interval: Duration,
        actor_client: WeakActorClient,
    ) {
        let mut retained: HashMap<MemberId, ReplicationState> = HashMap::new();
        for member in configuration.members() {
            // Only stateful members receive the log; Reserve members learn
            // configurations through Configure requests instead.
            if member.id == my_id || !member.kind.is_stateful() {
                continue;
            }
            match self.peers.remove(&member.id) {
                Some(existing) => {
                    retained.insert(member.id, existing);
                }
                None => {
                    let timer = HeartbeatTimerHandle::spawn(
                        heartbeat_interval,
                        actor_client.clone(),
                        HeartbeatTimerTick {
                            peer: member.id,
                            term: self.term,
                        },
                    );
                    retained.insert(member.id, ReplicationState::new(my_last_index, timer));
                }
            }
        }
        self.peers = retained;
    }

    pub(crate) fn peer_mut(&mut self, id: MemberId) -> Option<&mut ReplicationState> {
        self.peers.get_mut(&id)
    }

    pub(crate) fn peer(&self, id: MemberId) -> Option<&ReplicationState> {
        self.peers.get(&id)
    }

    pub(crate) fn peer_ids(&self) -> Vec<MemberId> {
        self.peers.keys().copied().collect()
    }

    /// Median match index over the voting set (self included at
    /// `my_last_index`): the highest index replicated to a quorum.
    pub(crate) fn quorum_match_index(&self, configuration: &Configuration, my_last_index: Index) -> Index {
        let mut matches: Vec<Index> = configuration
            .voting_members()
            .filter(|m| self.peers.contains_key(&m.id))
            .map(|m| self.peers[&m.id].match_index)
            .collect();
        matches.push(my_last_index);
        matches.sort_unstable();
        matches.reverse();

        let quorum = configuration.quorum_size();
        if matches.len() < quorum {
            return Index::ZERO;
        }
        matches[quorum - 1]
    }

    /// Minimum match index over every stateful member (self included): the
    /// highest index known replicated everywhere state lives. This bounds
    /// tombstone removal, so unknown peers pin it at ZERO.
    pub(crate) fn global_index(&self, configuration: &Configuration, my_last_index: Index) -> Index {
        configuration
            .stateful_members()
            .filter(|m| self.peers.contains_key(&m.id))
            .map(|m| self.peers[&m.id].match_index)
            .chain(std::iter::once(my_last_index))
            .min()
            .unwrap_or(Index::ZERO)
    }

    /// Most recent instant at which a quorum of voting members had responded.
    /// A leader that can't place this within two election timeouts has lost
    /// contact and steps down.
    pub(crate) fn quorum_contact_time(&self, configuration: &Configuration, now: Instant) -> Instant {
        let mut contact_times: Vec<Instant> = configuration
            .voting_members()
            .filter(|m| self.peers.contains_key(&m.id))
            .map(|m| self.peers[&m.id].commit_time)
            .collect();
        // Self counts at `now`.
        contact_times.push(now);
        contact_times.sort_unstable();
        contact_times.reverse();

        let quorum = configuration.quorum_size();
        if contact_times.len() < quorum {
            return now;
        }
        contact_times[quorum - 1]
    }
}

/// Per-peer replication state for one leadership term.
pub(crate) struct ReplicationState {
    heartbeat_timer: HeartbeatTimerHandle,

    /// Next log index to send this peer.
    pub next_index: Index,
    /// Highest index known replicated on this peer. ZERO until the first
    /// successful round; ratchets forward only.
    pub match_index: Index,

    // Request sequencing: replies tagged with an older seq-no than the best
    // one seen are stale and dropped.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,

    pub failure_count: u32,
    /// Last time this peer answered anything.
    pub commit_time: Instant,

    /// In-flight snapshot transfer, when the peer's log starts before ours.
    pub snapshot_cursor: Option<SnapshotCursor>,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct SnapshotCursor {
    pub index: Index,
    pub offset: u64,
}

impl ReplicationState {
    fn new(my_last_index: Index, heartbeat_timer: HeartbeatTimerHandle) -> Self {
        ReplicationState {
            heartbeat_timer,
            next_index: my_last_index.next(),
            match_index: Index::ZERO,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
            failure_count: 0,
            commit_time: Instant::now(),
            snapshot_cursor: None,
        }
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    /// Ratchets the received seq-no. Returns false for stale or unknown
    /// replies, which the caller must ignore wholesale.
    pub(crate) fn accept_reply(&mut self, seq_no: u64) -> bool {
        if self.last_received_seq_no < seq_no && seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = seq_no;
            true
        } else {
            false
        }
    }

    /// Successful append: the peer holds everything through `replicated_index`.
    pub(crate) fn on_append_success(&mut self, replicated_index: Index, now: Instant) {
        self.failure_count = 0;
        self.commit_time = now;
        if replicated_index > self.match_index {
            self.match_index = replicated_index;
        }
        if self.match_index.next() > self.next_index {
            self.next_index = self.match_index.next();
        }
    }

    /// Consistency rejection: rewind to the peer's hint and try again from
    /// there.
    pub(crate) fn on_append_rejected(&mut self, hint_index: Index, log_first_index: Index, now: Instant) {
        self.failure_count = 0;
        self.commit_time = now;
        self.match_index = hint_index;
        self.next_index = if hint_index.is_zero() && !log_first_index.is_zero() {
            log_first_index
        } else {
            hint_index.next()
        };
    }

    pub(crate) fn on_transport_failure(&mut self) {
        self.failure_count += 1;
    }

    pub(crate) fn defer_heartbeat(&self) {
        self.heartbeat_timer.defer();
    }
}
