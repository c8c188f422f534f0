use crate::machine::DriverFeedback;
use crate::protocol::{
    AcceptResponse, AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigureRequest,
    ConfigureResponse, HeartbeatRequest, HeartbeatResponse, InstallRequest, InstallResponse, JoinRequest,
    JoinResponse, KeepAliveRequest, KeepAliveResponse, LeaveRequest, LeaveResponse, PollRequest, PollResponse,
    QueryRequest, QueryResponse, RegisterRequest, RegisterResponse, RequestError, UnregisterRequest,
    UnregisterResponse, VoteRequest, VoteResponse,
};
use crate::server::messages::{
    AppendReplyFromPeer, EventAcknowledgement, HeartbeatTimerTick, InstallReplyFromPeer, PollReplyFromPeer,
    VoteReplyFromPeer,
};
use crate::server::Server;
use crate::session::EventSink;
use crate::storage::Index;
use bytes::Bytes;
use std::fmt;
use std::fmt::{Debug, Formatter};
use tokio::sync::{mpsc, oneshot};

// The server context: one event loop owns all mutable consensus state, the
// log, and membership. Every input (client operation, peer RPC, timer tick,
// RPC reply, driver feedback) arrives here as an Event; handlers run to
// completion between suspensions. Long-running work is spawned elsewhere and
// returns as another Event.

pub(crate) enum Event {
    // Client-facing session operations.
    Register(RegisterRequest, Callback<RegisterResponse>),
    Connect(ConnectRequest, Callback<AcceptResponse>),
    KeepAlive(KeepAliveRequest, Callback<KeepAliveResponse>),
    Unregister(UnregisterRequest, Callback<UnregisterResponse>),
    Command(CommandRequest, Callback<CommandResponse>),
    Query(QueryRequest, Callback<QueryResponse>),
    AcknowledgeEvents(EventAcknowledgement),

    // Peer RPCs, inbound.
    Append(AppendRequest, Callback<AppendResponse>),
    Vote(VoteRequest, Callback<VoteResponse>),
    Poll(PollRequest, Callback<PollResponse>),
    Install(InstallRequest, Callback<InstallResponse>),
    Configure(ConfigureRequest, Callback<ConfigureResponse>),
    Heartbeat(HeartbeatRequest, Callback<HeartbeatResponse>),
    Join(JoinRequest, Callback<JoinResponse>),
    Leave(LeaveRequest, Callback<LeaveResponse>),

    // Replies from RPC tasks we spawned.
    VoteReplyFromPeer(VoteReplyFromPeer),
    PollReplyFromPeer(PollReplyFromPeer),
    AppendReplyFromPeer(AppendReplyFromPeer),
    InstallReplyFromPeer(InstallReplyFromPeer),

    // Timers.
    ElectionTimeout,
    HeartbeatTimerTick(HeartbeatTimerTick),
    SessionCheckTick,
    MemberHeartbeatTick,
    CompactionTick,

    /// A snapshot the driver serialized, ready to be written to the store.
    SnapshotTaken { index: Index, data: Bytes },

    // State-machine driver feedback.
    DriverFeedback(DriverFeedback),
}

/// A Connect carries the event sink for the new connection alongside the
/// request.
pub(crate) struct ConnectRequest {
    pub request: crate::protocol::ConnectRequest,
    pub sink: EventSink,
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Register(..) => "Register",
            Event::Connect(..) => "Connect",
            Event::KeepAlive(..) => "KeepAlive",
            Event::Unregister(..) => "Unregister",
            Event::Command(..) => "Command",
            Event::Query(..) => "Query",
            Event::AcknowledgeEvents(..) => "AcknowledgeEvents",
            Event::Append(..) => "Append",
            Event::Vote(..) => "Vote",
            Event::Poll(..) => "Poll",
            Event::Install(..) => "Install",
            Event::Configure(..) => "Configure",
            Event::Heartbeat(..) => "Heartbeat",
            Event::Join(..) => "Join",
            Event::Leave(..) => "Leave",
            Event::VoteReplyFromPeer(..) => "VoteReplyFromPeer",
            Event::PollReplyFromPeer(..) => "PollReplyFromPeer",
            Event::AppendReplyFromPeer(..) => "AppendReplyFromPeer",
            Event::InstallReplyFromPeer(..) => "InstallReplyFromPeer",
            Event::ElectionTimeout => "ElectionTimeout",
            Event::HeartbeatTimerTick(..) => "HeartbeatTimerTick",
            Event::SessionCheckTick => "SessionCheckTick",
            Event::MemberHeartbeatTick => "MemberHeartbeatTick",
            Event::CompactionTick => "CompactionTick",
            Event::SnapshotTaken { .. } => "SnapshotTaken",
            Event::DriverFeedback(..) => "DriverFeedback",
        };
        write!(f, "Event::{}", name)
    }
}

/// One-shot reply channel handed to a handler along with its request.
pub(crate) struct Callback<O>(oneshot::Sender<Result<O, RequestError>>);

impl<O> Callback<O> {
    pub(crate) fn send(self, message: Result<O, RequestError>) {
        // The caller may have given up waiting; that's their prerogative.
        let _ = self.0.send(message);
    }
}

impl<O> Debug for Callback<O> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish()
    }
}

fn actor_exited() -> RequestError {
    RequestError::InternalError("server event loop has exited".to_string())
}

/// Strong handle into the server actor. Holding one keeps the actor alive.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(queue_depth: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(queue_depth);
        (ActorClient { sender }, receiver)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    async fn call<O>(&self, make_event: impl FnOnce(Callback<O>) -> Event) -> Result<O, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make_event(Callback(tx)))
            .await
            .map_err(|_| actor_exited())?;
        rx.await.map_err(|_| actor_exited())?
    }

    pub(crate) async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, RequestError> {
        self.call(|cb| Event::Register(request, cb)).await
    }

    pub(crate) async fn connect(
        &self,
        request: crate::protocol::ConnectRequest,
        sink: EventSink,
    ) -> Result<AcceptResponse, RequestError> {
        self.call(|cb| Event::Connect(ConnectRequest { request, sink }, cb)).await
    }

    pub(crate) async fn keep_alive(&self, request: KeepAliveRequest) -> Result<KeepAliveResponse, RequestError> {
        self.call(|cb| Event::KeepAlive(request, cb)).await
    }

    pub(crate) async fn unregister(&self, request: UnregisterRequest) -> Result<UnregisterResponse, RequestError> {
        self.call(|cb| Event::Unregister(request, cb)).await
    }

    pub(crate) async fn command(&self, request: CommandRequest) -> Result<CommandResponse, RequestError> {
        self.call(|cb| Event::Command(request, cb)).await
    }

    pub(crate) async fn query(&self, request: QueryRequest) -> Result<QueryResponse, RequestError> {
        self.call(|cb| Event::Query(request, cb)).await
    }

    pub(crate) async fn acknowledge_events(&self, ack: EventAcknowledgement) {
        let _ = self.sender.send(Event::AcknowledgeEvents(ack)).await;
    }

    pub(crate) async fn append(&self, request: AppendRequest) -> Result<AppendResponse, RequestError> {
        self.call(|cb| Event::Append(request, cb)).await
    }

    pub(crate) async fn vote(&self, request: VoteRequest) -> Result<VoteResponse, RequestError> {
        self.call(|cb| Event::Vote(request, cb)).await
    }

    pub(crate) async fn poll(&self, request: PollRequest) -> Result<PollResponse, RequestError> {
        self.call(|cb| Event::Poll(request, cb)).await
    }

    pub(crate) async fn install(&self, request: InstallRequest) -> Result<InstallResponse, RequestError> {
        self.call(|cb| Event::Install(request, cb)).await
    }

    pub(crate) async fn configure(&self, request: ConfigureRequest) -> Result<ConfigureResponse, RequestError> {
        self.call(|cb| Event::Configure(request, cb)).await
    }

    pub(crate) async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, RequestError> {
        self.call(|cb| Event::Heartbeat(request, cb)).await
    }

    pub(crate) async fn join(&self, request: JoinRequest) -> Result<JoinResponse, RequestError> {
        self.call(|cb| Event::Join(request, cb)).await
    }

    pub(crate) async fn leave(&self, request: LeaveRequest) -> Result<LeaveResponse, RequestError> {
        self.call(|cb| Event::Leave(request, cb)).await
    }
}

/// Weak handle used by timers, spawned RPC tasks, and the driver. A weak
/// handle never keeps a dropped server alive; sends after shutdown are no-ops.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    async fn send(&self, event: Event) {
        if let Some(sender) = self.sender.upgrade() {
            let _ = sender.send(event).await;
        }
    }

    pub(crate) fn strong(&self) -> Option<ActorClient> {
        self.sender.upgrade().map(|sender| ActorClient { sender })
    }

    pub(crate) async fn notify_vote_reply(&self, reply: VoteReplyFromPeer) {
        self.send(Event::VoteReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_poll_reply(&self, reply: PollReplyFromPeer) {
        self.send(Event::PollReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_append_reply(&self, reply: AppendReplyFromPeer) {
        self.send(Event::AppendReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_install_reply(&self, reply: InstallReplyFromPeer) {
        self.send(Event::InstallReplyFromPeer(reply)).await;
    }

    pub(crate) async fn election_timeout(&self) {
        self.send(Event::ElectionTimeout).await;
    }

    pub(crate) async fn heartbeat_timer_tick(&self, tick: HeartbeatTimerTick) {
        self.send(Event::HeartbeatTimerTick(tick)).await;
    }

    pub(crate) async fn session_check_tick(&self) {
        self.send(Event::SessionCheckTick).await;
    }

    pub(crate) async fn member_heartbeat_tick(&self) {
        self.send(Event::MemberHeartbeatTick).await;
    }

    pub(crate) async fn compaction_tick(&self) {
        self.send(Event::CompactionTick).await;
    }

    pub(crate) async fn notify_snapshot_taken(&self, index: Index, data: Bytes) {
        self.send(Event::SnapshotTaken { index, data }).await;
    }

    pub(crate) async fn driver_feedback(&self, feedback: DriverFeedback) {
        self.send(Event::DriverFeedback(feedback)).await;
    }
}

/// ServerActor drives the event loop over a Server.
pub(crate) struct ServerActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    server: Server,
}

impl ServerActor {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, server: Server) -> Self {
        ServerActor {
            logger,
            receiver,
            server,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "Received {:?}", event);
            self.handle_event(event);
        }
        slog::info!(self.logger, "Server event loop exiting");
    }

    // Handlers must not await: anything slow runs on a spawned task and comes
    // back as an event.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Register(request, callback) => self.server.handle_register(request, callback),
            Event::Connect(request, callback) => self.server.handle_connect(request, callback),
            Event::KeepAlive(request, callback) => self.server.handle_keep_alive(request, callback),
            Event::Unregister(request, callback) => self.server.handle_unregister(request, callback),
            Event::Command(request, callback) => self.server.handle_command(request, callback),
            Event::Query(request, callback) => self.server.handle_query(request, callback),
            Event::AcknowledgeEvents(ack) => self.server.handle_event_acknowledgement(ack),
            Event::Append(request, callback) => self.server.handle_append(request, callback),
            Event::Vote(request, callback) => self.server.handle_vote(request, callback),
            Event::Poll(request, callback) => self.server.handle_poll(request, callback),
            Event::Install(request, callback) => self.server.handle_install(request, callback),
            Event::Configure(request, callback) => self.server.handle_configure(request, callback),
            Event::Heartbeat(request, callback) => self.server.handle_heartbeat(request, callback),
            Event::Join(request, callback) => self.server.handle_join(request, callback),
            Event::Leave(request, callback) => self.server.handle_leave(request, callback),
            Event::VoteReplyFromPeer(reply) => self.server.handle_vote_reply(reply),
            Event::PollReplyFromPeer(reply) => self.server.handle_poll_reply(reply),
            Event::AppendReplyFromPeer(reply) => self.server.handle_append_reply(reply),
            Event::InstallReplyFromPeer(reply) => self.server.handle_install_reply(reply),
            Event::ElectionTimeout => self.server.handle_election_timeout(),
            Event::HeartbeatTimerTick(tick) => self.server.handle_heartbeat_timer_tick(tick),
            Event::SessionCheckTick => self.server.handle_session_check_tick(),
            Event::MemberHeartbeatTick => self.server.handle_member_heartbeat_tick(),
            Event::CompactionTick => self.server.handle_compaction_tick(),
            Event::SnapshotTaken { index, data } => self.server.handle_snapshot_taken(index, data),
            Event::DriverFeedback(feedback) => self.server.handle_driver_feedback(feedback),
        }
    }
}
