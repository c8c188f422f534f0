use crate::actor::WeakActorClient;
use crate::machine::items::{ApplyCompletion, ApplyItem, DriverFeedback, QueryCompletion};
use crate::machine::state_machine::{Commit, StateMachine};
use crate::protocol::{QueryRequest, RequestError};
use crate::session::{CachedResponse, EventHolder, EventSink, QueuedCommand, QueuedQuery, ServerSession, SessionRegistry, SessionState};
use crate::storage::{CommandConsistency, EntryKind, Index, LogEntry, QueryConsistency, SessionId};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A linearizable command whose published events are not yet all acknowledged.
/// The response is withheld (for the original caller and any duplicate
/// resubmissions) until the last event ack releases it.
struct PendingEvents {
    remaining: usize,
    result: Result<Bytes, RequestError>,
    completion: Option<ApplyCompletion>,
    waiters: Vec<ApplyCompletion>,
}

/// StateMachineDriver is the state-machine context: a single task owning the
/// user state machine, the session registry, and the deterministic clock.
/// Entries arrive committed and in strictly ascending index order; results
/// leave through one-shot completions and feedback events to the server
/// context. No state here is reachable from any other thread.
pub(crate) struct StateMachineDriver<M: StateMachine> {
    logger: slog::Logger,
    machine: M,
    sessions: SessionRegistry,
    /// This server's client-facing address; sessions connected elsewhere get
    /// no local event delivery.
    my_client_address: String,

    /// Deterministic milliseconds: advances to max(clock, entry.timestamp) as
    /// entries apply. Never reads the wall clock, so every replica expires
    /// the same sessions at the same indices.
    clock_ms: u64,
    last_applied: Index,

    items: mpsc::UnboundedReceiver<ApplyItem>,
    server: WeakActorClient,

    /// Sinks registered by Connect requests, waiting for the matching Connect
    /// entry to apply.
    pending_sinks: HashMap<SessionId, (String, EventSink)>,

    next_pending_id: u64,
    pending_events: HashMap<u64, PendingEvents>,

    /// Index of the previous Configuration entry, cleaned when superseded.
    previous_configuration: Index,
    /// Previous Heartbeat entry per member, cleaned when superseded.
    previous_heartbeats: HashMap<u32, Index>,

    last_completed_reported: Index,
}

impl<M: StateMachine> StateMachineDriver<M> {
    pub(crate) fn new(
        logger: slog::Logger,
        machine: M,
        my_client_address: String,
        items: mpsc::UnboundedReceiver<ApplyItem>,
        server: WeakActorClient,
    ) -> Self {
        StateMachineDriver {
            logger,
            machine,
            sessions: SessionRegistry::new(),
            my_client_address,
            clock_ms: 0,
            last_applied: Index::ZERO,
            items,
            server,
            pending_sinks: HashMap::new(),
            next_pending_id: 0,
            pending_events: HashMap::new(),
            previous_configuration: Index::ZERO,
            previous_heartbeats: HashMap::new(),
            last_completed_reported: Index::ZERO,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(item) = self.items.recv().await {
            self.handle_item(item).await;
        }
        slog::info!(self.logger, "State-machine driver exiting");
    }

    async fn handle_item(&mut self, item: ApplyItem) {
        match item {
            ApplyItem::Entry { entry, completion } => self.apply_entry(entry, completion).await,
            ApplyItem::Query { request, completion } => {
                self.apply_query(request, completion).await;
            }
            ApplyItem::EventAck {
                session,
                version,
                sequence,
            } => self.acknowledge_events(session, version, sequence).await,
            ApplyItem::ConnectSink { session, address, sink } => {
                self.pending_sinks.insert(session, (address, sink));
            }
            ApplyItem::TakeSnapshot { completion } => {
                let _ = completion.send((self.last_applied, self.machine.snapshot()));
            }
            ApplyItem::InstallSnapshot { index, data } => {
                self.machine.install(data);
                if index > self.last_applied {
                    self.last_applied = index;
                }
            }
        }
    }

    /// Advances deterministic time and flags sessions whose timeout has
    /// passed. Newly Suspect sessions are reported to the server context; the
    /// leader turns them into Unregister entries.
    async fn tick(&mut self, timestamp: u64) {
        if timestamp > self.clock_ms {
            self.clock_ms = timestamp;
        }
        let now = self.clock_ms;

        let mut newly_suspect = Vec::new();
        for session in self.sessions.iter_mut() {
            if session.state() == SessionState::Open && now.saturating_sub(session.last_timestamp) > session.timeout_ms()
            {
                session.set_state(SessionState::Suspect);
                newly_suspect.push(session.id());
            }
        }
        if !newly_suspect.is_empty() {
            self.server
                .driver_feedback(DriverFeedback::SuspectSessions {
                    sessions: newly_suspect,
                })
                .await;
        }
    }

    async fn clean(&mut self, index: Index) {
        if index.is_zero() {
            return;
        }
        self.server.driver_feedback(DriverFeedback::CleanEntry { index }).await;
    }

    async fn report_last_completed(&mut self) {
        let mut completed = self.last_applied;
        for session in self.sessions.iter() {
            if session.is_open() {
                completed = completed.min(session.completed_index(self.last_applied));
            }
        }
        if completed > self.last_completed_reported {
            self.last_completed_reported = completed;
            self.server
                .driver_feedback(DriverFeedback::LastCompleted { index: completed })
                .await;
        }
    }

    async fn apply_entry(&mut self, entry: LogEntry, completion: Option<ApplyCompletion>) {
        assert!(
            entry.index > self.last_applied,
            "entries must apply in ascending order: {:?} after {:?}",
            entry.index,
            self.last_applied,
        );

        if let Some(timestamp) = entry.timestamp() {
            self.tick(timestamp).await;
        }

        let index = entry.index;
        match entry.kind {
            EntryKind::NoOp { .. } => {
                // Contributes nothing once applied; time already advanced.
                self.clean(index).await;
                complete_ok(completion);
            }
            EntryKind::Configuration { .. } => {
                // A configuration wholly replaces its predecessor.
                let previous = self.previous_configuration;
                self.previous_configuration = index;
                self.clean(previous).await;
                complete_ok(completion);
            }
            EntryKind::Register {
                client_id, timeout_ms, ..
            } => {
                let session = ServerSession::new(index, client_id, timeout_ms, self.clock_ms);
                slog::debug!(self.logger, "Session registered";
                    "session" => %index, "client" => session.client_id().to_string(), "timeout_ms" => timeout_ms);
                self.sessions.register(session);
                self.machine.session_registered(index);
                complete_ok(completion);
            }
            EntryKind::Connect { session, address, .. } => {
                self.apply_connect(session, address, index).await;
                complete_ok(completion);
            }
            EntryKind::KeepAlive {
                session,
                command_seq_ack,
                event_version_ack,
                ..
            } => {
                self.apply_keep_alive(session, command_seq_ack, event_version_ack, index, completion)
                    .await;
            }
            EntryKind::Unregister { session, expired, .. } => {
                self.apply_unregister(session, expired, index, completion).await;
            }
            EntryKind::Command {
                session,
                sequence,
                timestamp,
                payload,
                consistency,
                ..
            } => {
                let linearizable = consistency == CommandConsistency::Linearizable;
                self.apply_command(session, sequence, index, timestamp, payload, linearizable, completion)
                    .await;
            }
            EntryKind::Heartbeat {
                member, commit_index, ..
            } => {
                let previous = self.previous_heartbeats.insert(member.val(), index).unwrap_or(Index::ZERO);
                self.clean(previous).await;
                self.server
                    .driver_feedback(DriverFeedback::HeartbeatApplied {
                        member,
                        commit_index,
                        timestamp: self.clock_ms,
                    })
                    .await;
                complete_ok(completion);
            }
            EntryKind::Query { .. } => {
                // Queries are never logged; a Query entry reaching the apply
                // stream is a bug in the server context.
                unreachable!("query entries are not logged");
            }
        }

        self.last_applied = index;
        self.drain_version_queries().await;
        self.report_last_completed().await;
    }

    async fn apply_connect(&mut self, session_id: SessionId, address: String, index: Index) {
        let my_address = self.my_client_address.clone();
        let pending = self.pending_sinks.remove(&session_id);

        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let previous = session.connect_index;
        session.connect_index = index;
        session.connect_address = Some(address.clone());

        if address == my_address {
            if let Some((pending_address, sink)) = pending {
                if pending_address == address {
                    session.sink = Some(sink);
                    // The client may have missed events between connections.
                    session.replay_events();
                }
            }
        } else {
            session.sink = None;
        }
        slog::debug!(self.logger, "Session connection pinned";
            "session" => %session_id, "address" => session.connect_address.clone().unwrap_or_default());

        // Only the latest connection matters; the previous entry no longer
        // contributes.
        self.clean(previous).await;
    }

    async fn apply_keep_alive(
        &mut self,
        session_id: SessionId,
        command_seq_ack: u64,
        event_version_ack: u64,
        index: Index,
        completion: Option<ApplyCompletion>,
    ) {
        let clock = self.clock_ms;
        let (previous_keep_alive, released) = match self.sessions.get_mut(session_id) {
            None => {
                slog::warn!(self.logger, "Keep-alive for unknown session"; "session" => %session_id);
                complete_err(completion, RequestError::UnknownSession(session_id));
                self.clean(index).await;
                return;
            }
            Some(session) => {
                session.trust();
                session.last_timestamp = clock;
                session.clear_responses(command_seq_ack);
                let released = session.acknowledge_events(Index::new(event_version_ack), u64::MAX);
                let previous = session.keep_alive_index;
                session.keep_alive_index = index;
                (previous, released)
            }
        };

        self.release_pending_events(released).await;
        self.clean(previous_keep_alive).await;
        // The keep-alive itself is absorbed into session state immediately.
        self.clean(index).await;
        complete_ok(completion);
    }

    async fn apply_unregister(
        &mut self,
        session_id: SessionId,
        expired: bool,
        index: Index,
        completion: Option<ApplyCompletion>,
    ) {
        let Some(mut session) = self.sessions.unregister(session_id) else {
            slog::warn!(self.logger, "Unregister for unknown session"; "session" => %session_id);
            complete_err(completion, RequestError::UnknownSession(session_id));
            self.clean(index).await;
            return;
        };

        if expired {
            session.set_state(SessionState::Expired);
            self.machine.session_expired(session_id);
        } else {
            session.set_state(SessionState::Unregistering);
        }
        self.machine.session_closed(session_id);
        if session.state() == SessionState::Unregistering {
            session.set_state(SessionState::Closed);
        }

        // Everything the session pinned in the log goes with it: its Register
        // entry (the session id), its last keep-alive, and this entry.
        self.clean(session_id).await;
        self.clean(session.keep_alive_index).await;
        self.clean(session.connect_index).await;
        self.clean(index).await;
        complete_ok(completion);
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_command(
        &mut self,
        session_id: SessionId,
        sequence: u64,
        index: Index,
        timestamp: u64,
        payload: Bytes,
        linearizable: bool,
        completion: Option<ApplyCompletion>,
    ) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            slog::warn!(self.logger, "Command for unknown session"; "session" => %session_id);
            complete_err(completion, RequestError::UnknownSession(session_id));
            return;
        };
        if !session.is_open() {
            complete_err(completion, RequestError::UnknownSession(session_id));
            return;
        }

        if sequence != 0 && sequence < session.next_command_sequence() {
            // Duplicate: serve the cached response without re-invoking the
            // state machine. If the original is still waiting on event acks,
            // this caller waits with it.
            match session.responses.get(&sequence) {
                Some(cached) => {
                    let pending_id = cached.pending_events;
                    let result = cached.result.clone();
                    match (completion, pending_id.and_then(|id| self.pending_events.get_mut(&id))) {
                        (Some(completion), Some(pending)) => pending.waiters.push(completion),
                        (Some(completion), None) => {
                            let _ = completion.send(result);
                        }
                        (None, _) => {}
                    }
                }
                // The client already acknowledged this sequence; the cached
                // response was cleared. Nothing meaningful remains to return.
                None => complete_ok(completion),
            }
            return;
        }

        if sequence > session.next_command_sequence() {
            // Out of order: park until the gap fills. Never touches the state
            // machine.
            session.queued_commands.insert(
                sequence,
                QueuedCommand {
                    entry_index: index,
                    timestamp,
                    payload,
                    linearizable,
                    completion,
                },
            );
            return;
        }

        self.execute_command(session_id, sequence, index, timestamp, payload, linearizable, completion)
            .await;
        self.drain_session_queues(session_id).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_command(
        &mut self,
        session_id: SessionId,
        sequence: u64,
        index: Index,
        timestamp: u64,
        payload: Bytes,
        linearizable: bool,
        completion: Option<ApplyCompletion>,
    ) {
        let mut events: Vec<(SessionId, Bytes)> = Vec::new();
        let mut cleaned: Vec<Index> = Vec::new();

        let result = {
            let mut commit = Commit {
                index,
                session: session_id,
                timestamp,
                payload: &payload,
                events: &mut events,
                cleaned: &mut cleaned,
            };
            self.machine
                .apply(&mut commit)
                .map_err(RequestError::ApplicationError)
        };

        for cleaned_index in cleaned {
            self.clean(cleaned_index).await;
        }

        // Deliver published events and count how many must be acknowledged
        // before a linearizable response may leave.
        let pending_id = if linearizable && completion.is_some() && !events.is_empty() {
            self.next_pending_id += 1;
            Some(self.next_pending_id)
        } else {
            None
        };

        let mut delivered = 0usize;
        for (target_id, event_payload) in events {
            let Some(target) = self.sessions.get_mut(target_id) else {
                continue;
            };
            if !target.is_open() {
                continue;
            }
            let (version, event_sequence, previous_version, previous_sequence) = target.next_event_position(index);
            let holder = EventHolder {
                version,
                sequence: event_sequence,
                previous_version,
                previous_sequence,
                payload: event_payload,
                completions: pending_id.into_iter().collect(),
            };
            if let Some(sink) = &target.sink {
                let _ = sink.send(holder.to_publish(target_id));
            }
            target.event_queue.push_back(holder);
            delivered += 1;
        }

        let session = self.sessions.get_mut(session_id).expect("session applied above");
        session.command_sequence = sequence.max(session.command_sequence);
        session.last_timestamp = self.clock_ms;
        session.responses.insert(
            sequence,
            CachedResponse {
                result: result.clone(),
                pending_events: if delivered > 0 { pending_id } else { None },
            },
        );

        match (completion, pending_id, delivered) {
            (Some(completion), Some(id), d) if d > 0 => {
                self.pending_events.insert(
                    id,
                    PendingEvents {
                        remaining: d,
                        result,
                        completion: Some(completion),
                        waiters: Vec::new(),
                    },
                );
            }
            (Some(completion), _, _) => {
                let _ = completion.send(result);
            }
            (None, _, _) => {}
        }
    }

    /// After an in-order command applies, parked successors may now be
    /// applicable, and queries parked on the command sequence can run.
    async fn drain_session_queues(&mut self, session_id: SessionId) {
        loop {
            let next = {
                let Some(session) = self.sessions.get_mut(session_id) else { return };
                let next_sequence = session.next_command_sequence();
                match session.queued_commands.first_key_value() {
                    Some((&sequence, _)) if sequence == next_sequence => {
                        session.queued_commands.remove(&sequence).map(|queued| (sequence, queued))
                    }
                    _ => None,
                }
            };
            match next {
                Some((sequence, queued)) => {
                    self.execute_command(
                        session_id,
                        sequence,
                        queued.entry_index,
                        queued.timestamp,
                        queued.payload,
                        queued.linearizable,
                        queued.completion,
                    )
                    .await;
                }
                None => break,
            }
        }

        // Queries gated on the session's command sequence.
        let ready: Vec<QueuedQuery> = {
            let Some(session) = self.sessions.get_mut(session_id) else { return };
            let command_sequence = session.command_sequence;
            let still_waiting = session.queries_by_sequence.split_off(&(command_sequence + 1));
            let ready = std::mem::replace(&mut session.queries_by_sequence, still_waiting);
            ready.into_values().flatten().collect()
        };
        for query in ready {
            self.apply_query(query.request, query.completion).await;
        }
    }

    /// Queries parked on a state-machine version threshold, re-checked after
    /// every applied entry.
    async fn drain_version_queries(&mut self) {
        let last_applied = self.last_applied;
        let mut ready: Vec<QueuedQuery> = Vec::new();
        for session in self.sessions.iter_mut() {
            let still_waiting = session.queries_by_version.split_off(&last_applied.next());
            let drained = std::mem::replace(&mut session.queries_by_version, still_waiting);
            ready.extend(drained.into_values().flatten());
        }
        for query in ready {
            self.apply_query(query.request, query.completion).await;
        }
    }

    async fn apply_query(&mut self, request: QueryRequest, completion: QueryCompletion) {
        let last_applied = self.last_applied;
        let session_id = request.session;

        let Some(session) = self.sessions.get_mut(session_id) else {
            let _ = completion.send(Err(RequestError::UnknownSession(session_id)));
            return;
        };
        if !session.is_open() {
            let _ = completion.send(Err(RequestError::UnknownSession(session_id)));
            return;
        }

        // Gate 1: the query's causally preceding command must have applied.
        if request.sequence > session.command_sequence {
            session
                .queries_by_sequence
                .entry(request.sequence)
                .or_default()
                .push(QueuedQuery { request, completion });
            return;
        }
        // Gate 2: the state machine must have advanced to the client's
        // observed version (monotonic reads).
        if request.version > last_applied {
            session
                .queries_by_version
                .entry(request.version)
                .or_default()
                .push(QueuedQuery { request, completion });
            return;
        }

        let result = self
            .machine
            .query(session_id, &request.payload)
            .map_err(RequestError::ApplicationError);
        let version = match request.consistency {
            QueryConsistency::Sequential => Index::new(request.sequence).max(last_applied),
            QueryConsistency::Causal
            | QueryConsistency::BoundedLinearizable
            | QueryConsistency::Linearizable => last_applied,
        };
        let _ = completion.send(result.map(|bytes| (version, bytes)));
    }

    async fn acknowledge_events(&mut self, session_id: SessionId, version: Index, sequence: u64) {
        let released = match self.sessions.get_mut(session_id) {
            Some(session) => session.acknowledge_events(version, sequence),
            None => return,
        };
        self.release_pending_events(released).await;
        self.report_last_completed().await;
    }

    async fn release_pending_events(&mut self, released: Vec<u64>) {
        for id in released {
            let finished = match self.pending_events.get_mut(&id) {
                Some(pending) => {
                    pending.remaining = pending.remaining.saturating_sub(1);
                    pending.remaining == 0
                }
                None => false,
            };
            if finished {
                let pending = self.pending_events.remove(&id).expect("checked above");
                if let Some(completion) = pending.completion {
                    let _ = completion.send(pending.result.clone());
                }
                for waiter in pending.waiters {
                    let _ = waiter.send(pending.result.clone());
                }
            }
        }
    }
}

fn complete_ok(completion: Option<ApplyCompletion>) {
    if let Some(completion) = completion {
        let _ = completion.send(Ok(Bytes::new()));
    }
}

fn complete_err(completion: Option<ApplyCompletion>, error: RequestError) {
    if let Some(completion) = completion {
        let _ = completion.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::machine::items::DriverClient;
    use crate::storage::Term;
    use std::sync::{Arc, Mutex};
    use tokio::time::{timeout, Duration};

    /// Records applied payloads; optionally publishes one event per apply to a
    /// fixed session.
    struct RecordingMachine {
        applied: Arc<Mutex<Vec<String>>>,
        publish_to: Option<SessionId>,
    }

    impl StateMachine for RecordingMachine {
        fn apply(&mut self, commit: &mut Commit) -> Result<Bytes, String> {
            let text = String::from_utf8_lossy(commit.payload).into_owned();
            self.applied.lock().unwrap().push(text.clone());
            if let Some(target) = self.publish_to {
                commit.publish(target, Bytes::from_static(b"evt"));
            }
            Ok(Bytes::from(format!("applied:{}", text)))
        }

        fn query(&self, _session: SessionId, _payload: &Bytes) -> Result<Bytes, String> {
            Ok(Bytes::from(format!("seen:{}", self.applied.lock().unwrap().len())))
        }
    }

    struct Fixture {
        driver: StateMachineDriver<RecordingMachine>,
        applied: Arc<Mutex<Vec<String>>>,
        // Keeps the weak actor client upgradable.
        _actor: ActorClient,
        feedback: tokio::sync::mpsc::Receiver<Event>,
    }

    fn fixture(publish_to: Option<SessionId>) -> Fixture {
        let (actor, feedback) = ActorClient::new(100);
        let (_client, items) = DriverClient::new();
        let applied = Arc::new(Mutex::new(Vec::new()));
        let machine = RecordingMachine {
            applied: applied.clone(),
            publish_to,
        };
        let driver = StateMachineDriver::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            machine,
            "client-addr".to_string(),
            items,
            actor.weak(),
        );
        Fixture {
            driver,
            applied,
            _actor: actor,
            feedback,
        }
    }

    fn register(index: u64, timestamp: u64, timeout_ms: u64) -> LogEntry {
        LogEntry::new(
            Index::new(index),
            Term::new(1),
            EntryKind::Register {
                client_id: format!("client-{}", index),
                timestamp,
                timeout_ms,
            },
        )
    }

    fn command(index: u64, session: u64, sequence: u64, payload: &str, timestamp: u64) -> LogEntry {
        LogEntry::new(
            Index::new(index),
            Term::new(1),
            EntryKind::Command {
                session: Index::new(session),
                sequence,
                timestamp,
                payload: Bytes::from(payload.to_string()),
                consistency: CommandConsistency::Sequential,
                tombstone: false,
            },
        )
    }

    fn linearizable_command(index: u64, session: u64, sequence: u64, payload: &str) -> LogEntry {
        LogEntry::new(
            Index::new(index),
            Term::new(1),
            EntryKind::Command {
                session: Index::new(session),
                sequence,
                timestamp: index,
                payload: Bytes::from(payload.to_string()),
                consistency: CommandConsistency::Linearizable,
                tombstone: false,
            },
        )
    }

    async fn apply(fx: &mut Fixture, entry: LogEntry) -> tokio::sync::oneshot::Receiver<Result<Bytes, RequestError>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        fx.driver
            .handle_item(ApplyItem::Entry {
                entry,
                completion: Some(tx),
            })
            .await;
        rx
    }

    #[tokio::test]
    async fn in_order_commands_apply_and_duplicates_replay_from_cache() {
        let mut fx = fixture(None);
        apply(&mut fx, register(1, 100, 60_000)).await;

        let first = apply(&mut fx, command(2, 1, 1, "set-a", 200)).await;
        assert_eq!(first.await.unwrap().unwrap(), Bytes::from_static(b"applied:set-a"));
        assert_eq!(fx.applied.lock().unwrap().len(), 1);

        // Same sequence again (leader logged a client retry): cached response,
        // no second state-machine invocation.
        let duplicate = apply(&mut fx, command(3, 1, 1, "set-a", 300)).await;
        assert_eq!(duplicate.await.unwrap().unwrap(), Bytes::from_static(b"applied:set-a"));
        assert_eq!(fx.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_commands_wait_for_their_predecessor() {
        let mut fx = fixture(None);
        apply(&mut fx, register(1, 100, 60_000)).await;

        // Sequence 2 arrives first; it must not touch the state machine.
        let mut second = apply(&mut fx, command(2, 1, 2, "second", 200)).await;
        assert!(second.try_recv().is_err(), "sequence 2 must wait for sequence 1");
        assert_eq!(fx.applied.lock().unwrap().len(), 0);

        let first = apply(&mut fx, command(3, 1, 1, "first", 300)).await;
        assert_eq!(first.await.unwrap().unwrap(), Bytes::from_static(b"applied:first"));
        assert_eq!(second.await.unwrap().unwrap(), Bytes::from_static(b"applied:second"));
        assert_eq!(*fx.applied.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn commands_for_unknown_sessions_are_rejected() {
        let mut fx = fixture(None);
        let rx = apply(&mut fx, command(1, 99, 1, "orphan", 100)).await;
        match rx.await.unwrap() {
            Err(RequestError::UnknownSession(session)) => assert_eq!(session, Index::new(99)),
            other => panic!("expected UnknownSession, got {:?}", other),
        }
        assert_eq!(fx.applied.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn deterministic_clock_marks_silent_sessions_suspect() {
        let mut fx = fixture(None);
        // Session 1 times out after 500ms of deterministic time.
        apply(&mut fx, register(1, 1_000, 500)).await;
        // A later entry moves the clock past the timeout.
        apply(&mut fx, register(2, 2_000, 60_000)).await;

        let mut suspected = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(200), fx.feedback.recv()).await {
            if let Event::DriverFeedback(DriverFeedback::SuspectSessions { sessions }) = event {
                suspected = sessions;
                break;
            }
        }
        assert_eq!(suspected, vec![Index::new(1)]);

        // A keep-alive re-trusts the session: commands work again.
        apply(
            &mut fx,
            LogEntry::new(
                Index::new(3),
                Term::new(1),
                EntryKind::KeepAlive {
                    session: Index::new(1),
                    command_seq_ack: 0,
                    event_version_ack: 0,
                    timestamp: 2_100,
                },
            ),
        )
        .await;
        let rx = apply(&mut fx, command(4, 1, 1, "revived", 2_200)).await;
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn queries_wait_for_sequence_and_version_gates() {
        let mut fx = fixture(None);
        apply(&mut fx, register(1, 100, 60_000)).await;

        // Query behind a command the session has submitted but that hasn't
        // applied here yet (sequence gate), and ahead of local state
        // (version gate).
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        fx.driver
            .handle_item(ApplyItem::Query {
                request: QueryRequest {
                    session: Index::new(1),
                    sequence: 1,
                    version: Index::new(3),
                    payload: Bytes::from_static(b"peek"),
                    consistency: QueryConsistency::Sequential,
                },
                completion: tx,
            })
            .await;
        assert!(rx.try_recv().is_err(), "query must wait for its command");

        // The command applies (index 2) but the version gate (3) still holds.
        apply(&mut fx, command(2, 1, 1, "cmd", 200)).await;
        assert!(rx.try_recv().is_err(), "query must wait for version 3");

        // Index 3 applies; both gates open.
        apply(&mut fx, command(3, 1, 2, "cmd2", 300)).await;
        let (version, result) = rx.await.unwrap().unwrap();
        assert_eq!(version, Index::new(3));
        assert_eq!(result, Bytes::from_static(b"seen:2"));
    }

    #[tokio::test]
    async fn linearizable_commands_complete_only_after_event_acks() {
        let mut fx = fixture(Some(Index::new(1)));
        apply(&mut fx, register(1, 100, 60_000)).await;

        let mut pending = apply(&mut fx, linearizable_command(2, 1, 1, "notify")).await;
        assert!(
            pending.try_recv().is_err(),
            "linearizable command must wait for its event to be acknowledged"
        );

        // A duplicate submission joins the same wait.
        let mut duplicate = apply(&mut fx, linearizable_command(3, 1, 1, "notify")).await;
        assert!(duplicate.try_recv().is_err());

        // The client acknowledges the event published at index 2.
        fx.driver
            .handle_item(ApplyItem::EventAck {
                session: Index::new(1),
                version: Index::new(2),
                sequence: 1,
            })
            .await;

        assert!(pending.await.unwrap().is_ok());
        assert!(duplicate.await.unwrap().is_ok());
        assert_eq!(fx.applied.lock().unwrap().len(), 1, "duplicate never re-applied");
    }

    #[tokio::test]
    async fn unregister_closes_the_session_and_cleans_its_entries() {
        let mut fx = fixture(None);
        apply(&mut fx, register(1, 100, 60_000)).await;
        apply(&mut fx, command(2, 1, 1, "x", 200)).await;

        let rx = apply(
            &mut fx,
            LogEntry::new(
                Index::new(3),
                Term::new(1),
                EntryKind::Unregister {
                    session: Index::new(1),
                    expired: true,
                    timestamp: 300,
                },
            ),
        )
        .await;
        assert!(rx.await.unwrap().is_ok());

        // The register entry (the session id) must be among the cleans.
        let mut cleaned = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(200), fx.feedback.recv()).await {
            if let Event::DriverFeedback(DriverFeedback::CleanEntry { index }) = event {
                cleaned.push(index);
                if cleaned.contains(&Index::new(3)) {
                    break;
                }
            }
        }
        assert!(cleaned.contains(&Index::new(1)), "register entry cleaned");
        assert!(cleaned.contains(&Index::new(3)), "unregister entry cleaned");

        // The session is gone.
        let rx = apply(&mut fx, command(4, 1, 2, "late", 400)).await;
        assert!(matches!(rx.await.unwrap(), Err(RequestError::UnknownSession(_))));
    }
}
