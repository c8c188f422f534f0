use crate::actor::{Callback, ConnectRequest, WeakActorClient};
use crate::cluster::{Configuration, Member, MemberId, MemberKind};
use crate::machine::{ApplyItem, DriverClient, DriverFeedback};
use crate::protocol::{
    AcceptResponse, AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigureRequest,
    ConfigureResponse, HeartbeatRequest, HeartbeatResponse, InstallRequest, InstallResponse, JoinRequest,
    JoinResponse, KeepAliveRequest, KeepAliveResponse, LeaveRequest, LeaveResponse, PollRequest, PollResponse,
    QueryRequest, QueryResponse, RegisterRequest, RegisterResponse, RequestError, UnregisterRequest,
    UnregisterResponse, VoteRequest, VoteResponse,
};
use crate::server::messages::{
    AppendReplyFromPeer, EventAcknowledgement, HeartbeatTimerTick, InstallReplyFromPeer, PollReplyFromPeer,
    RpcReply, VoteReplyFromPeer,
};
use crate::server::options::ServerOptionsValidated;
use crate::server::replication::{Replicator, SnapshotCursor};
use crate::server::role::{
    CandidateRole, LeaderRole, FollowerRole, PassiveRole, PollTally, QuorumRound, ReserveRole, Role, RoleKind,
};
use crate::server::timers::{ElectionTimerHandle, IntervalKind, IntervalTimerHandle};
use crate::storage::compaction::{plan_major, plan_minor, MajorCompactionTask, MinorCompactionTask};
use crate::storage::{
    EntryKind, Index, LogEntry, MetaStore, QueryConsistency, SegmentedLog, SnapshotStore, SnapshotWriter, Term,
};
use crate::transport::{PeerClient, Transport};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// The single state machine id this server snapshots under.
const STATE_MACHINE_ID: u64 = 1;

/// How many compaction ticks pass between major (tombstone-removing) passes;
/// minor passes run every tick.
const MAJOR_COMPACTION_CADENCE: u64 = 4;

pub(crate) struct ServerSeed {
    pub logger: slog::Logger,
    pub my_id: MemberId,
    pub initial_members: Vec<Member>,
    pub log: SegmentedLog,
    pub meta: MetaStore,
    pub snapshots: SnapshotStore,
    pub options: ServerOptionsValidated,
    pub transport: Arc<dyn Transport>,
    pub driver: DriverClient,
    pub actor_client: WeakActorClient,
    pub role_watch: tokio::sync::watch::Sender<RoleKind>,
}

/// Availability bookkeeping per stateful member, fed by applied Heartbeat
/// entries. Timestamps are deterministic entry time, never wall clock.
struct MemberHealth {
    last_heartbeat_ts: u64,
    available: bool,
}

/// Server owns all consensus state for one member: the log, durable meta
/// state, the snapshot store, the current configuration, and the role state
/// machine. Every handler runs on the server context and returns without
/// awaiting; peer RPCs and apply results come back as events.
pub(crate) struct Server {
    logger: slog::Logger,
    my_id: MemberId,
    options: ServerOptionsValidated,

    log: SegmentedLog,
    meta: MetaStore,
    snapshots: SnapshotStore,
    configuration: Configuration,
    role: Role,
    role_watch: tokio::sync::watch::Sender<RoleKind>,

    /// Minimum index replicated to every stateful member. Monotonic; bounds
    /// tombstone compaction.
    global_index: Index,
    /// Index covered by the latest completed local snapshot.
    snapshot_index: Index,
    /// Minimum index at or below which all session events are acknowledged
    /// (driver feedback); gates taking new snapshots.
    last_completed: Index,

    /// Committed entries at or below this index have been handed to the
    /// driver already.
    last_enqueued_for_apply: Index,
    /// Completions for locally proposed entries, attached when the entry is
    /// handed to the driver.
    pending_completions: HashMap<Index, oneshot::Sender<Result<Bytes, RequestError>>>,

    driver: DriverClient,
    transport: Arc<dyn Transport>,
    peer_clients: HashMap<MemberId, Arc<dyn PeerClient>>,
    actor_client: WeakActorClient,

    availability: HashMap<MemberId, MemberHealth>,
    /// In-flight snapshot transfer from the leader, if we're the lagging peer.
    pending_install: Option<SnapshotWriter>,

    _compaction_timer: IntervalTimerHandle,
    compaction_ticks: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn internal(message: impl Into<String>) -> RequestError {
    RequestError::InternalError(message.into())
}

impl Server {
    pub(crate) fn new(seed: ServerSeed) -> Server {
        let configuration = seed
            .meta
            .configuration()
            .cloned()
            .unwrap_or_else(|| Configuration::new(Index::ZERO, seed.initial_members.clone()));

        let compaction_timer = IntervalTimerHandle::spawn(
            seed.options.compaction_interval,
            IntervalKind::Compaction,
            seed.actor_client.clone(),
        );

        let snapshot_index = seed.snapshots.snapshot_index(STATE_MACHINE_ID);

        let mut server = Server {
            logger: seed.logger,
            my_id: seed.my_id,
            options: seed.options,
            log: seed.log,
            meta: seed.meta,
            snapshots: seed.snapshots,
            configuration,
            role: Role::Inactive,
            role_watch: seed.role_watch,
            global_index: Index::ZERO,
            snapshot_index,
            last_completed: Index::ZERO,
            last_enqueued_for_apply: Index::ZERO,
            pending_completions: HashMap::new(),
            driver: seed.driver,
            transport: seed.transport,
            peer_clients: HashMap::new(),
            actor_client: seed.actor_client,
            availability: HashMap::new(),
            pending_install: None,
            _compaction_timer: compaction_timer,
            compaction_ticks: 0,
        };

        server.rebuild_peer_clients();
        let initial_role = server.role_for_my_kind();
        server.install_role(initial_role);
        server
    }

    // ---------------- role transitions ----------------

    fn role_for_my_kind(&self) -> Role {
        match self.configuration.kind_of(self.my_id) {
            Some(MemberKind::Active) => Role::Follower(self.new_follower_role(None)),
            Some(MemberKind::Passive) => Role::Passive(PassiveRole {
                leader: None,
                _member_heartbeat_timer: self.new_member_heartbeat_timer(),
            }),
            Some(MemberKind::Reserve) => Role::Reserve(ReserveRole { leader: None }),
            Some(MemberKind::Inactive) | None => Role::Inactive,
        }
    }

    fn new_follower_role(&self, leader: Option<MemberId>) -> FollowerRole {
        FollowerRole {
            leader,
            election_timer: ElectionTimerHandle::spawn(
                self.options.election_timeout_min,
                self.options.election_timeout_max,
                self.actor_client.clone(),
            ),
            _member_heartbeat_timer: self.new_member_heartbeat_timer(),
            poll: None,
        }
    }

    fn new_member_heartbeat_timer(&self) -> IntervalTimerHandle {
        IntervalTimerHandle::spawn(
            self.options.member_heartbeat_interval,
            IntervalKind::MemberHeartbeat,
            self.actor_client.clone(),
        )
    }

    /// Installs `role`, dropping the previous one first so its timers are
    /// cancelled before the new role arms any.
    fn install_role(&mut self, role: Role) {
        let old = std::mem::replace(&mut self.role, role);
        let old_kind = old.kind();
        drop(old);

        let new_kind = self.role.kind();
        if old_kind != new_kind {
            slog::info!(self.logger, "Role transition";
                "from" => ?old_kind, "to" => ?new_kind, "term" => %self.meta.current_term());
        }
        let _ = self.role_watch.send(new_kind);
    }

    fn transition_to_follower(&mut self, leader: Option<MemberId>) {
        self.fail_quorum_rounds("lost leadership");
        let follower = self.new_follower_role(leader);
        self.install_role(Role::Follower(follower));
    }

    fn transition_to_candidate(&mut self) {
        let new_term = self.meta.current_term().next();
        if let Err(e) = self.meta.store_term_if_increased(new_term) {
            slog::error!(self.logger, "Failed to persist term; aborting election"; "error" => ?e);
            return;
        }
        // The self-vote must be durable before any VoteRequest leaves this
        // server.
        match self.meta.store_vote_if_unvoted(new_term, self.my_id) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist self-vote; aborting election"; "error" => ?e);
                return;
            }
        }

        let candidate = CandidateRole {
            election_timer: ElectionTimerHandle::spawn(
                self.options.election_timeout_min,
                self.options.election_timeout_max,
                self.actor_client.clone(),
            ),
            _member_heartbeat_timer: self.new_member_heartbeat_timer(),
            votes: HashSet::from([self.my_id]),
        };
        self.install_role(Role::Candidate(candidate));

        if self.has_vote_quorum() {
            // Single-member cluster: the election is already won.
            self.transition_to_leader();
            return;
        }
        self.broadcast_vote_requests(new_term);
    }

    fn has_vote_quorum(&self) -> bool {
        match &self.role {
            Role::Candidate(candidate) => candidate.votes.len() >= self.configuration.quorum_size(),
            _ => false,
        }
    }

    fn transition_to_leader(&mut self) {
        let term = self.meta.current_term();
        let no_op_index = self.log.next_index();

        let replicator = Replicator::new(
            term,
            no_op_index,
            &self.configuration,
            self.my_id,
            self.log.last_index(),
            self.options.heartbeat_interval,
            self.actor_client.clone(),
        );
        let leader = LeaderRole {
            replicator,
            _session_check_timer: IntervalTimerHandle::spawn(
                self.options.session_check_interval,
                IntervalKind::SessionCheck,
                self.actor_client.clone(),
            ),
            suspect_sessions: HashSet::new(),
            quorum_rounds: Vec::new(),
            uncommitted_configuration: None,
            no_op_committed: false,
        };
        self.install_role(Role::Leader(leader));

        // A fresh leader commits nothing from prior terms until its own no-op
        // commits; appending it is the first order of business. The mirrored
        // configuration entry re-asserts membership under the new term.
        let timestamp = now_millis();
        if let Err(e) = self.append_as_leader(EntryKind::NoOp { timestamp }) {
            slog::error!(self.logger, "Failed to append election no-op"; "error" => ?e);
            return;
        }
        let config_index = self.log.next_index();
        let mirrored = Configuration::new(config_index, self.configuration.members().to_vec());
        if let Err(e) = self.append_as_leader(EntryKind::Configuration {
            configuration: mirrored.clone(),
        }) {
            slog::error!(self.logger, "Failed to append election configuration"; "error" => ?e);
            return;
        }
        self.apply_configuration(mirrored);
        self.broadcast_configure();
        self.advance_commit_index();
        self.replicate_to_all();
    }

    fn step_down(&mut self, observed_term: Term, leader: Option<MemberId>) {
        if let Err(e) = self.meta.store_term_if_increased(observed_term) {
            slog::error!(self.logger, "Failed to persist observed term"; "error" => ?e);
        }
        self.fail_quorum_rounds("leadership lost");
        match self.configuration.kind_of(self.my_id) {
            Some(MemberKind::Active) => self.transition_to_follower(leader),
            _ => {
                let role = self.role_for_my_kind();
                self.install_role(role);
                self.set_known_leader(leader);
            }
        }
    }

    fn set_known_leader(&mut self, leader: Option<MemberId>) {
        if leader.is_none() {
            return;
        }
        match &mut self.role {
            Role::Follower(f) => f.leader = leader,
            Role::Passive(p) => p.leader = leader,
            Role::Reserve(r) => r.leader = leader,
            _ => {}
        }
    }

    // ---------------- configuration ----------------

    /// Configuration entries take effect when appended, not when committed;
    /// this is what lets reconfiguration converge across minority splits.
    fn apply_configuration(&mut self, configuration: Configuration) {
        if configuration.version() < self.configuration.version() {
            return;
        }
        self.configuration = configuration;
        self.rebuild_peer_clients();

        let my_kind = self.configuration.kind_of(self.my_id);
        let role_matches = matches!(
            (&self.role, my_kind),
            (Role::Follower(_), Some(MemberKind::Active))
                | (Role::Candidate(_), Some(MemberKind::Active))
                | (Role::Leader(_), Some(MemberKind::Active))
                | (Role::Passive(_), Some(MemberKind::Passive))
                | (Role::Reserve(_), Some(MemberKind::Reserve))
        );
        if !role_matches {
            let role = self.role_for_my_kind();
            self.install_role(role);
        } else if self.role.is_leader() {
            // Stay leader; align the replicator's peer set.
            let my_last = self.log.last_index();
            let config = self.configuration.clone();
            let heartbeat_interval = self.options.heartbeat_interval;
            let actor_client = self.actor_client.clone();
            let my_id = self.my_id;
            if let Some(leader) = self.role.leader_mut() {
                leader
                    .replicator
                    .reconfigure(&config, my_id, my_last, heartbeat_interval, actor_client);
            }
        }
    }

    fn rebuild_peer_clients(&mut self) {
        let mut clients = HashMap::new();
        for member in self.configuration.members() {
            if member.id == self.my_id {
                continue;
            }
            let client = self
                .peer_clients
                .remove(&member.id)
                .unwrap_or_else(|| self.transport.connect(&member.server_address));
            clients.insert(member.id, client);
        }
        self.peer_clients = clients;
    }

    fn peer_client(&self, id: MemberId) -> Option<Arc<dyn PeerClient>> {
        self.peer_clients.get(&id).cloned()
    }

    fn leader_hint(&self) -> Option<Member> {
        self.role
            .known_leader(self.my_id)
            .and_then(|id| self.configuration.member(id))
            .cloned()
    }

    fn not_leader<O>(&self, callback: Callback<O>) {
        callback.send(Err(RequestError::NoLeader {
            leader_hint: self.leader_hint(),
        }));
    }

    // ---------------- log helpers ----------------

    fn append_as_leader(&mut self, kind: EntryKind) -> Result<Index, RequestError> {
        let term = self.meta.current_term();
        let index = self.log.next_index();
        let entry = LogEntry::new(index, term, kind);
        self.log
            .append(entry)
            .map_err(|e| internal(format!("failed to persist log entry: {}", e)))?;
        Ok(index)
    }

    /// Registers a completion for a locally proposed entry and spawns the task
    /// that maps the apply result onto the client's response.
    fn respond_after_apply<O, F>(&mut self, index: Index, callback: Callback<O>, map: F)
    where
        O: Send + 'static,
        F: FnOnce(Bytes) -> O + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pending_completions.insert(index, tx);
        tokio::spawn(async move {
            match rx.await {
                Ok(result) => callback.send(result.map(map)),
                Err(_) => callback.send(Err(internal("entry was superseded before applying"))),
            }
        });
    }

    /// Hands newly committed entries to the driver, in strictly ascending
    /// index order, attaching any local completions.
    fn enqueue_committed_entries(&mut self) {
        let commit_index = self.log.commit_index();
        while self.last_enqueued_for_apply < commit_index {
            let index = self.last_enqueued_for_apply.next();
            self.last_enqueued_for_apply = index;
            let entry = match self.log.get(index) {
                Ok(Some(entry)) => entry,
                // Holes are compacted entries: already applied, nothing to do.
                Ok(None) => continue,
                Err(e) => {
                    slog::error!(self.logger, "Failed to read committed entry; will retry";
                        "index" => %index, "error" => ?e);
                    self.last_enqueued_for_apply = index.checked_prev().expect("index > 0");
                    return;
                }
            };
            let completion = self.pending_completions.remove(&index);
            self.driver.send(ApplyItem::Entry { entry, completion });
        }
    }

    fn post_commit_bookkeeping(&mut self) {
        let commit_index = self.log.commit_index();

        // Persist the configuration once the entry that carried it commits.
        if self.configuration.version() <= commit_index && !self.configuration.version().is_zero() {
            let persisted = self.meta.configuration().map(|c| c.version());
            if persisted != Some(self.configuration.version()) {
                if let Err(e) = self.meta.store_configuration(self.configuration.clone()) {
                    slog::error!(self.logger, "Failed to persist configuration"; "error" => ?e);
                }
            }
        }

        let mut configuration_committed = false;
        if let Some(leader) = self.role.leader_mut() {
            if !leader.no_op_committed && commit_index >= leader.replicator.initial_entry_index() {
                leader.no_op_committed = true;
            }
            if let Some(config_index) = leader.uncommitted_configuration {
                if config_index <= commit_index {
                    leader.uncommitted_configuration = None;
                    configuration_committed = true;
                }
            }
        }
        if configuration_committed {
            self.maybe_rebalance();
        }

        self.enqueue_committed_entries();
    }

    /// Leader-side commit advancement: the median match index over the voting
    /// quorum, gated on this term's no-op so prior-term entries are never
    /// committed directly.
    fn advance_commit_index(&mut self) {
        let my_last = self.log.last_index();
        let configuration = self.configuration.clone();

        let (quorum_match, no_op_index, global) = match self.role.leader_mut() {
            Some(leader) => (
                leader.replicator.quorum_match_index(&configuration, my_last),
                leader.replicator.initial_entry_index(),
                leader.replicator.global_index(&configuration, my_last),
            ),
            None => return,
        };

        if global > self.global_index {
            self.global_index = global;
        }

        if quorum_match < no_op_index {
            return;
        }
        if quorum_match > self.log.commit_index() {
            self.log.commit(quorum_match);
            self.post_commit_bookkeeping();
        }
    }

    // ---------------- client session operations ----------------

    pub(crate) fn handle_register(&mut self, request: RegisterRequest, callback: Callback<RegisterResponse>) {
        if !self.role.is_leader() {
            return self.not_leader(callback);
        }
        let kind = EntryKind::Register {
            client_id: request.client_id,
            timestamp: now_millis(),
            timeout_ms: request.timeout_ms,
        };
        let index = match self.append_as_leader(kind) {
            Ok(index) => index,
            Err(e) => return callback.send(Err(e)),
        };

        let timeout_ms = request.timeout_ms;
        let leader = self.my_id;
        let members = self.configuration.members().to_vec();
        self.respond_after_apply(index, callback, move |_| RegisterResponse {
            session: index,
            timeout_ms,
            leader,
            members,
        });
        self.advance_commit_index();
        self.replicate_to_all();
    }

    pub(crate) fn handle_connect(&mut self, request: ConnectRequest, callback: Callback<AcceptResponse>) {
        if !self.role.is_leader() {
            return self.not_leader(callback);
        }
        let session = request.request.session;
        let address = request.request.address.clone();

        // The sink is local, volatile state: hand it straight to the driver.
        self.driver.send(ApplyItem::ConnectSink {
            session,
            address: address.clone(),
            sink: request.sink,
        });

        let kind = EntryKind::Connect {
            session,
            address,
            timestamp: now_millis(),
        };
        let index = match self.append_as_leader(kind) {
            Ok(index) => index,
            Err(e) => return callback.send(Err(e)),
        };
        self.respond_after_apply(index, callback, |_| AcceptResponse {});
        self.advance_commit_index();
        self.replicate_to_all();
    }

    pub(crate) fn handle_keep_alive(&mut self, request: KeepAliveRequest, callback: Callback<KeepAliveResponse>) {
        if !self.role.is_leader() {
            return self.not_leader(callback);
        }
        let kind = EntryKind::KeepAlive {
            session: request.session,
            command_seq_ack: request.command_seq_ack,
            event_version_ack: request.event_version_ack,
            timestamp: now_millis(),
        };
        let index = match self.append_as_leader(kind) {
            Ok(index) => index,
            Err(e) => return callback.send(Err(e)),
        };

        let leader = self.my_id;
        let members = self.configuration.members().to_vec();
        self.respond_after_apply(index, callback, move |_| KeepAliveResponse { leader, members });
        self.advance_commit_index();
        self.replicate_to_all();
    }

    pub(crate) fn handle_unregister(&mut self, request: UnregisterRequest, callback: Callback<UnregisterResponse>) {
        if !self.role.is_leader() {
            return self.not_leader(callback);
        }
        let kind = EntryKind::Unregister {
            session: request.session,
            expired: false,
            timestamp: now_millis(),
        };
        let index = match self.append_as_leader(kind) {
            Ok(index) => index,
            Err(e) => return callback.send(Err(e)),
        };
        self.respond_after_apply(index, callback, |_| UnregisterResponse {});
        self.advance_commit_index();
        self.replicate_to_all();
    }

    pub(crate) fn handle_command(&mut self, request: CommandRequest, callback: Callback<CommandResponse>) {
        if !self.role.is_leader() {
            return self.not_leader(callback);
        }
        let kind = EntryKind::Command {
            session: request.session,
            sequence: request.sequence,
            timestamp: now_millis(),
            payload: request.payload,
            consistency: request.consistency,
            tombstone: request.tombstone,
        };
        let index = match self.append_as_leader(kind) {
            Ok(index) => index,
            Err(e) => return callback.send(Err(e)),
        };
        self.respond_after_apply(index, callback, move |result| CommandResponse { index, result });
        self.advance_commit_index();
        self.replicate_to_all();
    }

    pub(crate) fn handle_query(&mut self, request: QueryRequest, callback: Callback<QueryResponse>) {
        match self.role.kind() {
            RoleKind::Follower | RoleKind::Leader | RoleKind::Candidate | RoleKind::Passive => {}
            RoleKind::Reserve | RoleKind::Inactive => {
                return callback.send(Err(RequestError::IllegalMemberState(
                    "this member holds no state to query",
                )));
            }
        }

        match request.consistency {
            QueryConsistency::Causal | QueryConsistency::Sequential => {
                self.forward_query_to_driver(request, callback);
            }
            QueryConsistency::BoundedLinearizable => {
                if !self.role.is_leader() {
                    return self.not_leader(callback);
                }
                if self.quorum_contacted_within(self.options.election_timeout_min) {
                    self.forward_query_to_driver(request, callback);
                } else {
                    self.linearizable_query(request, callback);
                }
            }
            QueryConsistency::Linearizable => {
                if !self.role.is_leader() {
                    return self.not_leader(callback);
                }
                self.linearizable_query(request, callback);
            }
        }
    }

    fn quorum_contacted_within(&mut self, window: tokio::time::Duration) -> bool {
        let configuration = self.configuration.clone();
        let now = Instant::now();
        match self.role.leader_mut() {
            Some(leader) => now - leader.replicator.quorum_contact_time(&configuration, now) <= window,
            None => false,
        }
    }

    fn forward_query_to_driver(&mut self, request: QueryRequest, callback: Callback<QueryResponse>) {
        let (tx, rx) = oneshot::channel();
        self.driver.send(ApplyItem::Query { request, completion: tx });
        tokio::spawn(async move {
            match rx.await {
                Ok(result) => callback.send(result.map(|(version, result)| QueryResponse { version, result })),
                Err(_) => callback.send(Err(internal("query dropped during apply"))),
            }
        });
    }

    /// A linearizable read: prove leadership with a round to the quorum, then
    /// apply against local state.
    fn linearizable_query(&mut self, request: QueryRequest, callback: Callback<QueryResponse>) {
        let (round_tx, round_rx) = oneshot::channel();
        self.start_quorum_round(round_tx);

        let driver = self.driver.clone();
        tokio::spawn(async move {
            match round_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return callback.send(Err(e)),
                Err(_) => return callback.send(Err(internal("quorum round abandoned"))),
            }
            let (tx, rx) = oneshot::channel();
            driver.send(ApplyItem::Query { request, completion: tx });
            match rx.await {
                Ok(result) => callback.send(result.map(|(version, result)| QueryResponse { version, result })),
                Err(_) => callback.send(Err(internal("query dropped during apply"))),
            }
        });
    }

    /// Broadcasts a fresh append round to the voting set and records which
    /// seq-nos must be answered before the round counts as a quorum contact.
    fn start_quorum_round(&mut self, waiter: oneshot::Sender<Result<(), RequestError>>) {
        let quorum = self.configuration.quorum_size();
        let voting: Vec<MemberId> = self
            .configuration
            .voting_members()
            .map(|m| m.id)
            .filter(|id| *id != self.my_id)
            .collect();

        let mut sent = HashMap::new();
        for peer_id in voting {
            if let Some(seq_no) = self.send_append_to_peer(peer_id) {
                sent.insert(peer_id, seq_no);
            }
        }

        if let Some(leader) = self.role.leader_mut() {
            let round = QuorumRound {
                sent,
                acked: HashSet::new(),
                needed: quorum,
                waiter,
            };
            if round.is_satisfied() {
                // Single-member cluster: no peers to wait for.
                let _ = round.waiter.send(Ok(()));
            } else {
                leader.quorum_rounds.push(round);
            }
        } else {
            let _ = waiter.send(Err(RequestError::CommandError("leadership lost mid-round")));
        }
    }

    fn fail_quorum_rounds(&mut self, reason: &'static str) {
        if let Some(leader) = self.role.leader_mut() {
            for round in leader.quorum_rounds.drain(..) {
                let _ = round.waiter.send(Err(RequestError::CommandError(reason)));
            }
        }
    }

    pub(crate) fn handle_event_acknowledgement(&mut self, ack: EventAcknowledgement) {
        self.driver.send(ApplyItem::EventAck {
            session: ack.session,
            version: ack.version,
            sequence: ack.sequence,
        });
    }

    // ---------------- membership ----------------

    pub(crate) fn handle_join(&mut self, request: JoinRequest, callback: Callback<JoinResponse>) {
        if !self.role.is_leader() {
            return self.not_leader(callback);
        }
        if self.configuration.contains(request.member.id) {
            return callback.send(Ok(JoinResponse {
                configuration: self.configuration.clone(),
            }));
        }
        // New members always start as Reserve; the rebalancer promotes them.
        let mut joining = request.member;
        joining.kind = MemberKind::Reserve;
        self.propose_configuration_change(Some(ConfigurationWaiter::Join(callback)), move |config, version| {
            config.with_member(version, joining)
        });
    }

    pub(crate) fn handle_leave(&mut self, request: LeaveRequest, callback: Callback<LeaveResponse>) {
        if !self.role.is_leader() {
            return self.not_leader(callback);
        }
        if !self.configuration.contains(request.member) {
            return callback.send(Ok(LeaveResponse {
                configuration: self.configuration.clone(),
            }));
        }
        let leaving = request.member;
        self.propose_configuration_change(Some(ConfigurationWaiter::Leave(callback)), move |config, version| {
            config.without_member(version, leaving)
        });
    }

    /// Single-change discipline: a new configuration entry may not be logged
    /// while an earlier one is uncommitted, and never before this term's
    /// no-op commits.
    fn can_reconfigure(&mut self) -> Result<(), RequestError> {
        match self.role.leader_mut() {
            Some(leader) => {
                if !leader.no_op_committed {
                    return Err(RequestError::CommandError("leader initialization is not complete"));
                }
                if leader.uncommitted_configuration.is_some() {
                    return Err(RequestError::CommandError("a configuration change is in progress"));
                }
                Ok(())
            }
            None => Err(RequestError::CommandError("not the leader")),
        }
    }

    fn propose_configuration_change<F>(&mut self, waiter: Option<ConfigurationWaiter>, build: F)
    where
        F: FnOnce(&Configuration, Index) -> Configuration,
    {
        if let Err(e) = self.can_reconfigure() {
            if let Some(waiter) = waiter {
                waiter.fail(e);
            }
            return;
        }

        let version = self.log.next_index();
        let new_configuration = build(&self.configuration, version);
        let index = match self.append_as_leader(EntryKind::Configuration {
            configuration: new_configuration.clone(),
        }) {
            Ok(index) => index,
            Err(e) => {
                if let Some(waiter) = waiter {
                    waiter.fail(e);
                }
                return;
            }
        };
        debug_assert_eq!(index, version);

        if let Some(leader) = self.role.leader_mut() {
            leader.uncommitted_configuration = Some(index);
        }
        self.apply_configuration(new_configuration.clone());
        self.broadcast_configure();

        if let Some(waiter) = waiter {
            let (tx, rx) = oneshot::channel();
            self.pending_completions.insert(index, tx);
            tokio::spawn(async move {
                match rx.await {
                    Ok(result) => waiter.complete(result.map(|_| new_configuration)),
                    Err(_) => waiter.fail(internal("configuration entry was superseded")),
                }
            });
        }
        self.advance_commit_index();
        self.replicate_to_all();
    }

    /// Pushes the configuration straight to every member without waiting for
    /// log replication; Reserve members have no other way to learn it.
    fn broadcast_configure(&mut self) {
        let request = ConfigureRequest {
            term: self.meta.current_term(),
            leader: self.my_id,
            configuration: self.configuration.clone(),
        };
        for member in self.configuration.members() {
            if member.id == self.my_id {
                continue;
            }
            if let Some(client) = self.peer_client(member.id) {
                let request = request.clone();
                tokio::spawn(async move {
                    let _ = client.configure(request).await;
                });
            }
        }
    }

    /// The leader's rebalancer: at most one single-member change per call,
    /// re-triggered by availability changes and configuration commits.
    fn maybe_rebalance(&mut self) {
        if self.can_reconfigure().is_err() {
            return;
        }

        let my_id = self.my_id;
        let config = &self.configuration;
        let available = |id: MemberId| -> bool {
            id == my_id
                || self
                    .availability
                    .get(&id)
                    .map(|health| health.available)
                    .unwrap_or(true)
        };

        let active_available = config.voting_members().filter(|m| available(m.id)).count();
        let passive_count = config.members().iter().filter(|m| m.kind == MemberKind::Passive).count();

        // Promote Passive -> Active while the voting set is short.
        let change: Option<(MemberId, MemberKind)> = if active_available < self.options.quorum_hint {
            config
                .members()
                .iter()
                .find(|m| m.kind == MemberKind::Passive && available(m.id))
                .map(|m| (m.id, MemberKind::Active))
        } else if passive_count < self.options.passive_hint {
            // Promote Reserve -> Passive to keep warm spares holding state.
            config
                .members()
                .iter()
                .find(|m| m.kind == MemberKind::Reserve && available(m.id))
                .map(|m| (m.id, MemberKind::Passive))
        } else {
            // Swap an unavailable Active out for an available Passive. The
            // demotion happens now; the promotion follows at the next commit.
            config
                .members()
                .iter()
                .find(|m| m.kind == MemberKind::Active && m.id != my_id && !available(m.id))
                .filter(|_| {
                    config
                        .members()
                        .iter()
                        .any(|m| m.kind == MemberKind::Passive && available(m.id))
                })
                .map(|m| (m.id, MemberKind::Passive))
        };

        if let Some((member_id, new_kind)) = change {
            slog::info!(self.logger, "Rebalancing membership";
                "member" => ?member_id, "to_kind" => ?new_kind);
            self.propose_configuration_change(None, move |config, version| {
                config.with_member_kind(version, member_id, new_kind)
            });
        }
    }

    // ---------------- consensus RPC handlers ----------------

    pub(crate) fn handle_append(&mut self, request: AppendRequest, callback: Callback<AppendResponse>) {
        let current_term = self.meta.current_term();

        // Stale leader: refuse, tell it the new term.
        if request.term < current_term {
            return callback.send(Ok(AppendResponse {
                term: current_term,
                succeeded: false,
                log_index: self.log.last_index(),
            }));
        }

        if request.term > current_term {
            if let Err(e) = self.meta.store_term_if_increased(request.term) {
                return callback.send(Err(internal(format!("failed to persist term: {}", e))));
            }
        }
        // A valid AppendEntries at our term (or above) establishes the leader.
        match self.role.kind() {
            RoleKind::Leader | RoleKind::Candidate => {
                self.step_down(request.term, Some(request.leader));
            }
            _ => self.set_known_leader(Some(request.leader)),
        }
        self.role.reset_election_timer();
        // Leader contact also voids any pre-vote probe in flight.
        if let Role::Follower(follower) = &mut self.role {
            follower.poll = None;
        }

        let term = self.meta.current_term();

        // Consistency check on the previous entry.
        if !request.prev_log_index.is_zero() {
            let last_index = self.log.last_index();
            if request.prev_log_index > last_index {
                return callback.send(Ok(AppendResponse {
                    term,
                    succeeded: false,
                    log_index: last_index,
                }));
            }
            // A live local entry must agree on term. A hole is acceptable:
            // holes only exist at or below the global index, where terms are
            // long since settled.
            match self.log.get(request.prev_log_index) {
                Ok(Some(local)) if request.prev_log_term != Term::ZERO && local.term != request.prev_log_term => {
                    let hint = request
                        .prev_log_index
                        .checked_prev()
                        .unwrap_or(Index::ZERO)
                        .min(last_index);
                    return callback.send(Ok(AppendResponse {
                        term,
                        succeeded: false,
                        log_index: hint,
                    }));
                }
                Ok(_) => {}
                Err(e) => return callback.send(Err(internal(format!("log read failed: {}", e)))),
            }
        }

        // Append new entries, truncating any divergent suffix.
        let mut covered_through = request.prev_log_index;
        for entry in request.entries {
            covered_through = entry.index;
            if let Err(e) = self.append_entry_as_follower(entry) {
                return callback.send(Err(internal(format!("log write failed: {}", e))));
            }
        }

        // Advance commit: never past what this request vouched for. Entries
        // past `covered_through` may be a divergent suffix from an older
        // leader that this request didn't examine.
        let new_commit = request.commit_index.min(covered_through);
        if new_commit > self.log.commit_index() {
            self.log.commit(new_commit);
            self.post_commit_bookkeeping();
        }
        if request.global_index > self.global_index {
            self.global_index = request.global_index;
        }

        let log_index = if covered_through > request.prev_log_index {
            covered_through
        } else {
            request.prev_log_index.min(self.log.last_index())
        };
        callback.send(Ok(AppendResponse {
            term,
            succeeded: true,
            log_index,
        }));
    }

    fn append_entry_as_follower(&mut self, entry: LogEntry) -> std::io::Result<()> {
        let next_index = self.log.next_index();

        if entry.index < next_index {
            // We already hold this index. Same term: nothing to do. Different
            // term: drop the divergent suffix and re-append.
            match self.log.get(entry.index)? {
                Some(local) if local.term == entry.term => return Ok(()),
                Some(_) => {
                    let keep = entry.index.checked_prev().unwrap_or(Index::ZERO);
                    self.log.truncate(keep)?;
                    // Waiters on truncated proposals will never see them
                    // commit; dropping the completion wakes them with an
                    // error.
                    self.pending_completions.retain(|&index, _| index <= keep);
                }
                // A hole here means we compacted this entry away already.
                None => return Ok(()),
            }
        } else if entry.index > next_index {
            // Index gap: the leader compacted the middle away. Reserve holes.
            self.log.skip(entry.index.val() - next_index.val())?;
        }

        let configuration = match &entry.kind {
            EntryKind::Configuration { configuration } => Some(configuration.clone()),
            _ => None,
        };
        self.log.append(entry)?;

        if let Some(configuration) = configuration {
            self.apply_configuration(configuration);
        }
        Ok(())
    }

    pub(crate) fn handle_vote(&mut self, request: VoteRequest, callback: Callback<VoteResponse>) {
        let current_term = self.meta.current_term();
        if request.term < current_term {
            return callback.send(Ok(VoteResponse {
                term: current_term,
                voted: false,
            }));
        }

        if request.term > current_term {
            if let Err(e) = self.meta.store_term_if_increased(request.term) {
                return callback.send(Err(internal(format!("failed to persist term: {}", e))));
            }
            if matches!(self.role.kind(), RoleKind::Leader | RoleKind::Candidate) {
                self.step_down(request.term, None);
            }
        }
        let term = self.meta.current_term();

        // Only known voting members may receive votes.
        if self.configuration.kind_of(request.candidate) != Some(MemberKind::Active) {
            return callback.send(Ok(VoteResponse { term, voted: false }));
        }

        let (_, voted_for) = self.meta.term_and_vote();
        let can_vote = match voted_for {
            None => true,
            Some(existing) => existing == request.candidate,
        };
        if !can_vote || !self.is_candidate_log_up_to_date(request.last_log_term, request.last_log_index) {
            return callback.send(Ok(VoteResponse { term, voted: false }));
        }

        let voted = match self.meta.store_vote_if_unvoted(term, request.candidate) {
            Ok(stored) => stored || voted_for == Some(request.candidate),
            Err(e) => return callback.send(Err(internal(format!("failed to persist vote: {}", e)))),
        };
        if voted {
            self.role.reset_election_timer();
        }
        callback.send(Ok(VoteResponse { term, voted }))
    }

    pub(crate) fn handle_poll(&mut self, request: PollRequest, callback: Callback<PollResponse>) {
        let term = self.meta.current_term();
        // Polls never mutate term or vote; they only gauge electability.
        let accepted = request.term >= term
            && self.configuration.kind_of(request.candidate) == Some(MemberKind::Active)
            && self.is_candidate_log_up_to_date(request.last_log_term, request.last_log_index);
        callback.send(Ok(PollResponse { term, accepted }))
    }

    /// Raft's election restriction: accept only candidates whose log is at
    /// least as up to date as ours.
    fn is_candidate_log_up_to_date(&self, candidate_last_term: Term, candidate_last_index: Index) -> bool {
        match self.log.last_entry_id() {
            Some((my_last_term, my_last_index)) => {
                candidate_last_term > my_last_term
                    || (candidate_last_term == my_last_term && candidate_last_index >= my_last_index)
            }
            None => true,
        }
    }

    pub(crate) fn handle_install(&mut self, request: InstallRequest, callback: Callback<InstallResponse>) {
        let current_term = self.meta.current_term();
        if request.term < current_term {
            return callback.send(Ok(InstallResponse {
                term: current_term,
                succeeded: false,
            }));
        }
        if request.term > current_term {
            if let Err(e) = self.meta.store_term_if_increased(request.term) {
                return callback.send(Err(internal(format!("failed to persist term: {}", e))));
            }
        }
        match self.role.kind() {
            RoleKind::Leader | RoleKind::Candidate => self.step_down(request.term, Some(request.leader)),
            _ => self.set_known_leader(Some(request.leader)),
        }
        self.role.reset_election_timer();
        let term = self.meta.current_term();

        // First chunk (or a restart from zero) opens a fresh writer.
        if request.offset == 0 {
            self.pending_install =
                match self
                    .snapshots
                    .create_snapshot(STATE_MACHINE_ID, request.index, now_millis())
                {
                    Ok(writer) => Some(writer),
                    Err(e) => return callback.send(Err(internal(format!("snapshot create failed: {}", e)))),
                };
        }

        let writer = match &mut self.pending_install {
            Some(writer) if writer.index() == request.index && writer.offset() == request.offset => writer,
            _ => {
                // Out-of-sequence chunk: tell the leader to restart the
                // transfer.
                return callback.send(Ok(InstallResponse { term, succeeded: false }));
            }
        };
        if let Err(e) = writer.write(&request.data) {
            return callback.send(Err(internal(format!("snapshot write failed: {}", e))));
        }

        if request.complete {
            let writer = self.pending_install.take().expect("writer checked above");
            if let Err(e) = writer.complete(&mut self.snapshots) {
                return callback.send(Err(internal(format!("snapshot install failed: {}", e))));
            }
            self.snapshot_index = request.index;

            // Hand the full snapshot to the state machine and restart the log
            // after it.
            let data = match self.snapshots.current_snapshot(STATE_MACHINE_ID) {
                Some(snapshot) => match snapshot.read_all() {
                    Ok(data) => data,
                    Err(e) => return callback.send(Err(internal(format!("snapshot read failed: {}", e)))),
                },
                None => Bytes::new(),
            };
            self.driver.send(ApplyItem::InstallSnapshot {
                index: request.index,
                data,
            });
            if self.log.last_index() < request.index {
                if let Err(e) = self.log.reset_to(request.index) {
                    return callback.send(Err(internal(format!("log reset failed: {}", e))));
                }
                self.last_enqueued_for_apply = request.index;
            }
        }
        callback.send(Ok(InstallResponse { term, succeeded: true }))
    }

    pub(crate) fn handle_configure(&mut self, request: ConfigureRequest, callback: Callback<ConfigureResponse>) {
        let current_term = self.meta.current_term();
        if request.term < current_term {
            return callback.send(Ok(ConfigureResponse { term: current_term }));
        }
        if request.term > current_term {
            if let Err(e) = self.meta.store_term_if_increased(request.term) {
                return callback.send(Err(internal(format!("failed to persist term: {}", e))));
            }
            if matches!(self.role.kind(), RoleKind::Leader | RoleKind::Candidate) {
                self.step_down(request.term, Some(request.leader));
            }
        }
        self.set_known_leader(Some(request.leader));
        self.role.reset_election_timer();
        self.apply_configuration(request.configuration);
        callback.send(Ok(ConfigureResponse {
            term: self.meta.current_term(),
        }))
    }

    pub(crate) fn handle_heartbeat(&mut self, request: HeartbeatRequest, callback: Callback<HeartbeatResponse>) {
        let term = self.meta.current_term();
        if !self.role.is_leader() {
            return callback.send(Ok(HeartbeatResponse {
                term,
                leader: self.role.known_leader(self.my_id),
            }));
        }

        let kind = EntryKind::Heartbeat {
            member: request.member,
            commit_index: request.commit_index,
            timestamp: now_millis(),
        };
        if let Err(e) = self.append_as_leader(kind) {
            return callback.send(Err(e));
        }
        self.advance_commit_index();
        self.replicate_to_all();
        callback.send(Ok(HeartbeatResponse {
            term,
            leader: Some(self.my_id),
        }))
    }

    // ---------------- election flow ----------------

    pub(crate) fn handle_election_timeout(&mut self) {
        match self.role.kind() {
            RoleKind::Follower => {
                if self.configuration.quorum_size() <= 1 {
                    // No one to poll; win outright.
                    self.transition_to_candidate();
                    return;
                }
                // Start (or restart) a pre-vote round before disturbing the
                // cluster with a real election.
                let term = self.meta.current_term();
                let my_id = self.my_id;
                if let Role::Follower(follower) = &mut self.role {
                    follower.poll = Some(PollTally {
                        term,
                        accepted: HashSet::from([my_id]),
                    });
                    follower.leader = None;
                    follower.election_timer.reset();
                }
                self.broadcast_poll_requests();
            }
            RoleKind::Candidate => {
                // Election timed out without a quorum: start over at a higher
                // term.
                self.transition_to_candidate();
            }
            _ => {}
        }
    }

    fn broadcast_poll_requests(&mut self) {
        let term = self.meta.current_term();
        let (last_log_term, last_log_index) = self.log.last_entry_id().unwrap_or((Term::ZERO, Index::ZERO));
        let request = PollRequest {
            term,
            candidate: self.my_id,
            last_log_index,
            last_log_term,
        };

        for member in self.configuration.voting_members() {
            if member.id == self.my_id {
                continue;
            }
            let client = match self.peer_client(member.id) {
                Some(client) => client,
                None => continue,
            };
            let peer = member.id;
            let request = request.clone();
            let actor = self.actor_client.clone();
            tokio::spawn(async move {
                let result = match client.poll(request).await {
                    Ok(response) => RpcReply::Reply(response),
                    Err(e) => RpcReply::Failed(e.to_string()),
                };
                actor.notify_poll_reply(PollReplyFromPeer { peer, term, result }).await;
            });
        }
    }

    pub(crate) fn handle_poll_reply(&mut self, reply: PollReplyFromPeer) {
        let quorum = self.configuration.quorum_size();
        let mut poll_won = false;

        if let Role::Follower(follower) = &mut self.role {
            if let Some(poll) = &mut follower.poll {
                if poll.term == reply.term {
                    if let RpcReply::Reply(response) = &reply.result {
                        if response.accepted {
                            poll.accepted.insert(reply.peer);
                            poll_won = poll.accepted.len() >= quorum;
                        }
                    }
                }
            }
        }

        if poll_won {
            slog::debug!(self.logger, "Pre-vote succeeded; starting election");
            self.transition_to_candidate();
        }
    }

    fn broadcast_vote_requests(&mut self, term: Term) {
        let (last_log_term, last_log_index) = self.log.last_entry_id().unwrap_or((Term::ZERO, Index::ZERO));
        let request = VoteRequest {
            term,
            candidate: self.my_id,
            last_log_index,
            last_log_term,
        };

        for member in self.configuration.voting_members() {
            if member.id == self.my_id {
                continue;
            }
            let client = match self.peer_client(member.id) {
                Some(client) => client,
                None => continue,
            };
            let peer = member.id;
            let request = request.clone();
            let actor = self.actor_client.clone();
            tokio::spawn(async move {
                let result = match client.vote(request).await {
                    Ok(response) => RpcReply::Reply(response),
                    Err(e) => RpcReply::Failed(e.to_string()),
                };
                actor.notify_vote_reply(VoteReplyFromPeer { peer, term, result }).await;
            });
        }
    }

    pub(crate) fn handle_vote_reply(&mut self, reply: VoteReplyFromPeer) {
        let current_term = self.meta.current_term();
        if reply.term != current_term {
            return;
        }

        match reply.result {
            RpcReply::Reply(response) => {
                if response.term > current_term {
                    self.step_down(response.term, None);
                    return;
                }
                if response.voted {
                    if let Role::Candidate(candidate) = &mut self.role {
                        candidate.votes.insert(reply.peer);
                    }
                    if self.has_vote_quorum() {
                        self.transition_to_leader();
                    }
                }
            }
            RpcReply::Failed(reason) => {
                slog::debug!(self.logger, "Vote request failed"; "peer" => ?reply.peer, "reason" => reason);
            }
        }
    }

    // ---------------- replication flow ----------------

    pub(crate) fn handle_heartbeat_timer_tick(&mut self, tick: HeartbeatTimerTick) {
        let term_matches = self
            .role
            .leader_mut()
            .map(|leader| leader.replicator.term() == tick.term)
            .unwrap_or(false);
        if !term_matches {
            return;
        }
        self.send_append_to_peer(tick.peer);
    }

    fn replicate_to_all(&mut self) {
        let peer_ids = match self.role.leader_mut() {
            Some(leader) => leader.replicator.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            let outstanding = self
                .role
                .leader_mut()
                .and_then(|l| l.replicator.peer_mut(peer_id).map(|p| p.has_outstanding_request()))
                .unwrap_or(true);
            if !outstanding {
                self.send_append_to_peer(peer_id);
            }
        }
    }

    /// Builds and sends one AppendEntries (or snapshot chunk) to `peer_id`.
    /// Returns the request's seq-no, or None if nothing was sent.
    fn send_append_to_peer(&mut self, peer_id: MemberId) -> Option<u64> {
        let first_index = self.log.first_index();
        let last_index = self.log.last_index();

        let (next_index, installing) = {
            let leader = self.role.leader_mut()?;
            let peer = leader.replicator.peer_mut(peer_id)?;
            (peer.next_index, peer.snapshot_cursor.is_some())
        };

        // A peer behind our first index can't be caught up from the log.
        if installing || (!first_index.is_zero() && next_index < first_index && self.snapshot_index >= next_index) {
            self.send_install_to_peer(peer_id);
            return None;
        }

        // Batch live entries from next_index, bounded by the byte budget.
        // Holes are conveyed by index gaps between entries.
        let mut entries = Vec::new();
        let mut batch_bytes = 0usize;
        let mut index = next_index;
        while index <= last_index && batch_bytes < self.options.max_batch_bytes {
            match self.log.get(index) {
                Ok(Some(entry)) => {
                    batch_bytes += entry.encode().len();
                    entries.push(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    slog::error!(self.logger, "Log read failed while batching"; "index" => %index, "error" => ?e);
                    return None;
                }
            }
            index = index.next();
        }

        let prev_log_index = next_index.checked_prev().unwrap_or(Index::ZERO);
        let prev_log_term = match self.log.get(prev_log_index) {
            Ok(Some(entry)) => entry.term,
            // Hole or before-first: term zero tells the follower to accept on
            // index alone.
            _ => Term::ZERO,
        };

        let term = self.meta.current_term();
        let request = AppendRequest {
            term,
            leader: self.my_id,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.log.commit_index(),
            global_index: self.global_index,
        };
        let num_entries = request.entries.len();

        let client = self.peer_client(peer_id)?;
        let seq_no = {
            let leader = self.role.leader_mut()?;
            let peer = leader.replicator.peer_mut(peer_id)?;
            peer.defer_heartbeat();
            peer.next_seq_no()
        };

        let actor = self.actor_client.clone();
        tokio::spawn(async move {
            let result = match client.append(request).await {
                Ok(response) => RpcReply::Reply(response),
                Err(e) => RpcReply::Failed(e.to_string()),
            };
            actor
                .notify_append_reply(AppendReplyFromPeer {
                    peer: peer_id,
                    term,
                    seq_no,
                    prev_log_index,
                    num_entries,
                    result,
                })
                .await;
        });
        Some(seq_no)
    }

    pub(crate) fn handle_append_reply(&mut self, reply: AppendReplyFromPeer) {
        let current_term = self.meta.current_term();
        let log_first_index = self.log.first_index();
        let now = Instant::now();

        let leader_term_matches = self
            .role
            .leader_mut()
            .map(|l| l.replicator.term() == reply.term)
            .unwrap_or(false);
        if !leader_term_matches {
            return;
        }

        let mut observed_higher_term: Option<Term> = None;
        let mut send_more = false;

        {
            let last_index = self.log.last_index();
            let leader = self.role.leader_mut().expect("leader checked above");
            let peer = match leader.replicator.peer_mut(reply.peer) {
                Some(peer) => peer,
                None => return,
            };
            if !peer.accept_reply(reply.seq_no) {
                return;
            }

            match reply.result {
                RpcReply::Reply(response) => {
                    if response.term > current_term {
                        observed_higher_term = Some(response.term);
                    } else if response.succeeded {
                        peer.on_append_success(response.log_index, now);
                        send_more = peer.next_index <= last_index;
                    } else {
                        peer.on_append_rejected(response.log_index, log_first_index, now);
                        send_more = true;
                    }
                }
                RpcReply::Failed(reason) => {
                    peer.on_transport_failure();
                    slog::debug!(self.logger, "Append to peer failed";
                        "peer" => ?reply.peer, "reason" => reason, "failures" => peer.failure_count,
                        "prev_log_index" => %reply.prev_log_index, "entries" => reply.num_entries);
                }
            }
        }

        if let Some(higher_term) = observed_higher_term {
            self.step_down(higher_term, None);
            return;
        }

        // Feed quorum verification rounds.
        if let Some(leader) = self.role.leader_mut() {
            let mut satisfied = Vec::new();
            let mut index = 0;
            while index < leader.quorum_rounds.len() {
                leader.quorum_rounds[index].record_ack(reply.peer, reply.seq_no);
                if leader.quorum_rounds[index].is_satisfied() {
                    satisfied.push(leader.quorum_rounds.remove(index));
                } else {
                    index += 1;
                }
            }
            for round in satisfied {
                let _ = round.waiter.send(Ok(()));
            }
        }

        self.advance_commit_index();
        if send_more {
            self.send_append_to_peer(reply.peer);
        }
    }

    fn send_install_to_peer(&mut self, peer_id: MemberId) {
        let chunk_size = self.options.install_chunk_bytes;
        let term = self.meta.current_term();

        let cursor = {
            let snapshot_index = self.snapshot_index;
            let leader = match self.role.leader_mut() {
                Some(leader) => leader,
                None => return,
            };
            let peer = match leader.replicator.peer_mut(peer_id) {
                Some(peer) => peer,
                None => return,
            };
            *peer.snapshot_cursor.get_or_insert(SnapshotCursor {
                index: snapshot_index,
                offset: 0,
            })
        };

        let (data, data_len) = match self.snapshots.current_snapshot(STATE_MACHINE_ID) {
            Some(snapshot) => match snapshot.read_chunk(cursor.offset, chunk_size) {
                Ok(data) => (data, snapshot.data_len()),
                Err(e) => {
                    slog::error!(self.logger, "Snapshot read failed"; "error" => ?e);
                    return;
                }
            },
            None => return,
        };
        let next_offset = cursor.offset + data.len() as u64;
        let complete = next_offset >= data_len;

        let request = InstallRequest {
            term,
            leader: self.my_id,
            index: cursor.index,
            offset: cursor.offset,
            data,
            complete,
        };
        let client = match self.peer_client(peer_id) {
            Some(client) => client,
            None => return,
        };
        if let Some(leader) = self.role.leader_mut() {
            if let Some(peer) = leader.replicator.peer_mut(peer_id) {
                peer.defer_heartbeat();
            }
        }

        let actor = self.actor_client.clone();
        let snapshot_index = cursor.index;
        tokio::spawn(async move {
            let result = match client.install(request).await {
                Ok(response) => RpcReply::Reply(response),
                Err(e) => RpcReply::Failed(e.to_string()),
            };
            actor
                .notify_install_reply(InstallReplyFromPeer {
                    peer: peer_id,
                    term,
                    next_offset,
                    complete,
                    snapshot_index,
                    result,
                })
                .await;
        });
    }

    pub(crate) fn handle_install_reply(&mut self, reply: InstallReplyFromPeer) {
        let current_term = self.meta.current_term();
        let mut observed_higher_term = None;
        let mut continue_transfer = false;

        {
            let leader = match self.role.leader_mut() {
                Some(leader) => leader,
                None => return,
            };
            if leader.replicator.term() != reply.term {
                return;
            }
            let peer = match leader.replicator.peer_mut(reply.peer) {
                Some(peer) => peer,
                None => return,
            };

            match reply.result {
                RpcReply::Reply(response) => {
                    if response.term > current_term {
                        observed_higher_term = Some(response.term);
                    } else if response.succeeded {
                        if reply.complete {
                            // The peer now holds state through the snapshot.
                            peer.snapshot_cursor = None;
                            peer.on_append_success(reply.snapshot_index, Instant::now());
                        } else {
                            if let Some(cursor) = &mut peer.snapshot_cursor {
                                cursor.offset = reply.next_offset;
                            }
                            continue_transfer = true;
                        }
                    } else {
                        // Restart the transfer from scratch.
                        peer.snapshot_cursor = None;
                    }
                }
                RpcReply::Failed(_) => {
                    peer.on_transport_failure();
                }
            }
        }

        if let Some(higher_term) = observed_higher_term {
            self.step_down(higher_term, None);
            return;
        }
        if continue_transfer {
            self.send_install_to_peer(reply.peer);
        } else {
            self.advance_commit_index();
            self.send_append_to_peer(reply.peer);
        }
    }

    // ---------------- periodic chores ----------------

    pub(crate) fn handle_session_check_tick(&mut self) {
        if !self.role.is_leader() {
            return;
        }

        // Losing contact with the quorum for two election timeouts means some
        // other leader may exist; stop serving rather than stall clients.
        let window = self.options.election_timeout_min * 2;
        if !self.quorum_contacted_within(window) {
            slog::warn!(self.logger, "Lost quorum contact; stepping down");
            let term = self.meta.current_term();
            self.step_down(term, None);
            return;
        }

        // Expire Suspect sessions. Only the leader may do this, and only
        // through the log, so every replica expires identically.
        let suspects: Vec<_> = match self.role.leader_mut() {
            Some(leader) => leader.suspect_sessions.drain().collect(),
            None => return,
        };
        for session in suspects {
            let kind = EntryKind::Unregister {
                session,
                expired: true,
                timestamp: now_millis(),
            };
            if let Err(e) = self.append_as_leader(kind) {
                slog::error!(self.logger, "Failed to append session expiration"; "error" => ?e);
                return;
            }
        }
        self.advance_commit_index();
        self.replicate_to_all();
    }

    pub(crate) fn handle_member_heartbeat_tick(&mut self) {
        // Stateful non-leaders announce liveness and commit progress.
        let leader_id = match self.role.known_leader(self.my_id) {
            Some(leader_id) if leader_id != self.my_id => leader_id,
            _ => return,
        };
        let client = match self.peer_client(leader_id) {
            Some(client) => client,
            None => return,
        };
        let request = HeartbeatRequest {
            member: self.my_id,
            commit_index: self.log.commit_index(),
        };
        tokio::spawn(async move {
            let _ = client.heartbeat(request).await;
        });
    }

    pub(crate) fn handle_compaction_tick(&mut self) {
        self.compaction_ticks += 1;

        // Ask the driver for a snapshot when sessions have fully acknowledged
        // past the last one.
        if self.last_completed > self.snapshot_index {
            let (tx, rx) = oneshot::channel();
            self.driver.send(ApplyItem::TakeSnapshot { completion: tx });
            let actor = self.actor_client.clone();
            tokio::spawn(async move {
                if let Ok((index, data)) = rx.await {
                    actor.notify_snapshot_taken(index, data).await;
                }
            });
        }

        let commit_index = self.log.commit_index();
        let major_compact_index = self.global_index.min(commit_index);

        for segment_id in plan_minor(self.log.manager(), commit_index) {
            let task = MinorCompactionTask::new(segment_id, major_compact_index);
            if let Err(e) = task.run(&self.logger, self.log.manager_mut()) {
                slog::error!(self.logger, "Minor compaction failed"; "segment_id" => segment_id, "error" => ?e);
                return;
            }
        }

        if self.compaction_ticks % MAJOR_COMPACTION_CADENCE == 0 {
            let groups = plan_major(self.log.manager(), commit_index);
            if !groups.is_empty() {
                let task = MajorCompactionTask::new(groups, self.snapshot_index, major_compact_index);
                if let Err(e) = task.run(&self.logger, self.log.manager_mut()) {
                    slog::error!(self.logger, "Major compaction failed"; "error" => ?e);
                }
            }
        }
    }

    pub(crate) fn handle_snapshot_taken(&mut self, index: Index, data: Bytes) {
        if index <= self.snapshot_index {
            return;
        }
        let result = self
            .snapshots
            .create_snapshot(STATE_MACHINE_ID, index, now_millis())
            .and_then(|mut writer| {
                writer.write(&data)?;
                writer.complete(&mut self.snapshots)
            });
        match result {
            Ok(()) => {
                self.snapshot_index = index;
                slog::debug!(self.logger, "Snapshot taken"; "index" => %index);
            }
            Err(e) => slog::error!(self.logger, "Failed to store snapshot"; "error" => ?e),
        }
    }

    // ---------------- driver feedback ----------------

    pub(crate) fn handle_driver_feedback(&mut self, feedback: DriverFeedback) {
        match feedback {
            DriverFeedback::CleanEntry { index } => self.log.clean(index),
            DriverFeedback::SuspectSessions { sessions } => {
                if let Some(leader) = self.role.leader_mut() {
                    leader.suspect_sessions.extend(sessions);
                }
            }
            DriverFeedback::LastCompleted { index } => {
                if index > self.last_completed {
                    self.last_completed = index;
                }
            }
            DriverFeedback::HeartbeatApplied {
                member,
                commit_index,
                timestamp,
            } => self.handle_heartbeat_applied(member, commit_index, timestamp),
        }
    }

    /// Deterministic availability: a member is Unavailable once the entry
    /// timeline has moved more than the availability window past its last
    /// heartbeat. Every replica computes the same answer at the same index.
    fn handle_heartbeat_applied(&mut self, member: MemberId, commit_index: Index, timestamp: u64) {
        slog::debug!(self.logger, "Heartbeat applied";
            "from" => ?member, "peer_commit_index" => %commit_index);
        let health = self.availability.entry(member).or_insert(MemberHealth {
            last_heartbeat_ts: timestamp,
            available: true,
        });
        health.last_heartbeat_ts = timestamp;

        let window = self.options.availability_window_ms;
        let my_id = self.my_id;
        let mut any_changed = false;
        for (id, health) in self.availability.iter_mut() {
            if *id == my_id {
                continue;
            }
            let now_available = timestamp.saturating_sub(health.last_heartbeat_ts) <= window;
            if health.available != now_available {
                health.available = now_available;
                any_changed = true;
                slog::info!(self.logger, "Member availability changed";
                    "member" => ?id, "available" => now_available);
            }
        }

        if any_changed && self.role.is_leader() {
            self.maybe_rebalance();
        }
    }
}

/// The two membership operations wait on different response types; this keeps
/// one code path for proposing the entry.
enum ConfigurationWaiter {
    Join(Callback<JoinResponse>),
    Leave(Callback<LeaveResponse>),
}

impl ConfigurationWaiter {
    fn complete(self, result: Result<Configuration, RequestError>) {
        match self {
            ConfigurationWaiter::Join(callback) => {
                callback.send(result.map(|configuration| JoinResponse { configuration }))
            }
            ConfigurationWaiter::Leave(callback) => {
                callback.send(result.map(|configuration| LeaveResponse { configuration }))
            }
        }
    }

    fn fail(self, error: RequestError) {
        self.complete(Err(error));
    }
}
