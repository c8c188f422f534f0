use crate::actor::{ActorClient, ServerActor};
use crate::cluster::{Configuration, Member, MemberId};
use crate::machine::{DriverClient, StateMachine, StateMachineDriver};
use crate::protocol::{
    CommandRequest, ConnectRequest, JoinRequest, KeepAliveRequest, LeaveRequest, PublishRequest, QueryRequest,
    RegisterRequest, RequestError, UnregisterRequest,
};
use crate::server::messages::EventAcknowledgement;
use crate::server::{RoleKind, Server, ServerOptions, ServerOptionsValidated, ServerSeed};
use crate::storage::{
    CommandConsistency, Index, MetaStore, QueryConsistency, SegmentedLog, SessionId, SnapshotStore, StorageConfig,
};
use crate::transport::ChannelTransport;
use bytes::Bytes;
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Everything needed to start one member of a cluster.
pub struct EngineConfig {
    pub my_id: MemberId,
    /// The initial cluster membership; superseded by any configuration the
    /// meta store recovered.
    pub members: Vec<Member>,
    pub storage: StorageConfig,
    pub options: ServerOptions,
    pub logger: slog::Logger,
    /// In-process transport shared by every member of the cluster.
    pub transport: ChannelTransport,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineStartError {
    #[error("illegal options: {0}")]
    IllegalOptions(&'static str),

    #[error("member {0:?} is not in the initial membership")]
    MeNotInCluster(MemberId),

    #[error("storage initialization failed: {0}")]
    StorageInitialization(#[from] std::io::Error),
}

/// Starts storage, the server actor, and the state-machine driver for one
/// member, and registers it with the shared transport. Must be called from
/// within a tokio runtime; the actor and driver tasks are spawned on it.
pub fn start_engine<M: StateMachine>(config: EngineConfig, machine: M) -> Result<Engine, EngineStartError> {
    let options = ServerOptionsValidated::try_from(config.options).map_err(EngineStartError::IllegalOptions)?;

    let me = config
        .members
        .iter()
        .find(|m| m.id == config.my_id)
        .ok_or(EngineStartError::MeNotInCluster(config.my_id))?
        .clone();

    let root_logger = config.logger.new(slog::o!("member" => config.my_id.val()));

    let log = SegmentedLog::open(root_logger.new(slog::o!("subsystem" => "log")), config.storage.clone())?;
    let meta = MetaStore::open(config.storage.directory.as_ref())?;
    let snapshots = SnapshotStore::open(
        root_logger.new(slog::o!("subsystem" => "snapshots")),
        config.storage.clone(),
    )?;

    let (driver_client, driver_items) = DriverClient::new();
    let (actor_client, actor_queue) = ActorClient::new(64);
    let (role_watch_tx, role_watch_rx) = watch::channel(RoleKind::Inactive);

    let server = Server::new(ServerSeed {
        logger: root_logger.new(slog::o!("subsystem" => "server")),
        my_id: config.my_id,
        initial_members: config.members,
        log,
        meta,
        snapshots,
        options,
        transport: Arc::new(config.transport.clone()),
        driver: driver_client,
        actor_client: actor_client.weak(),
        role_watch: role_watch_tx,
    });

    let driver = StateMachineDriver::new(
        root_logger.new(slog::o!("subsystem" => "state-machine")),
        machine,
        me.client_address.clone(),
        driver_items,
        actor_client.weak(),
    );

    config.transport.register(&me.server_address, actor_client.weak());

    tokio::spawn(ServerActor::new(root_logger.new(slog::o!("subsystem" => "actor")), actor_queue, server).run_event_loop());
    tokio::spawn(driver.run());

    Ok(Engine {
        my_id: config.my_id,
        client_address: me.client_address,
        actor_client,
        role_watch: role_watch_rx,
    })
}

/// A running member. Dropping the engine (and every session handle cloned
/// from it) shuts the member down.
pub struct Engine {
    my_id: MemberId,
    client_address: String,
    actor_client: ActorClient,
    role_watch: watch::Receiver<RoleKind>,
}

impl Engine {
    pub fn member_id(&self) -> MemberId {
        self.my_id
    }

    pub fn role(&self) -> RoleKind {
        *self.role_watch.borrow()
    }

    /// Observe role transitions; useful for waiting out elections.
    pub fn role_watch(&self) -> watch::Receiver<RoleKind> {
        self.role_watch.clone()
    }

    /// Waits until this member reports the given role.
    pub async fn wait_for_role(&self, role: RoleKind) {
        let mut watch = self.role_watch.clone();
        loop {
            if *watch.borrow() == role {
                return;
            }
            if watch.changed().await.is_err() {
                return;
            }
        }
    }

    /// Proposes adding `member` to the cluster. It joins as Reserve; the
    /// leader's rebalancer promotes it as capacity and availability allow.
    /// Must be called on the leader.
    pub async fn add_member(&self, member: Member) -> Result<Configuration, RequestError> {
        let response = self.actor_client.join(JoinRequest { member }).await?;
        Ok(response.configuration)
    }

    /// Proposes removing `member` from the cluster. Must be called on the
    /// leader.
    pub async fn remove_member(&self, member: MemberId) -> Result<Configuration, RequestError> {
        let response = self.actor_client.leave(LeaveRequest { member }).await?;
        Ok(response.configuration)
    }

    /// Registers a new client session against this member. The member must be
    /// the leader; others redirect via the returned error.
    pub async fn register_session(
        &self,
        client_id: impl Into<String>,
        timeout_ms: u64,
    ) -> Result<SessionHandle, RequestError> {
        let response = self
            .actor_client
            .register(RegisterRequest {
                client_id: client_id.into(),
                timeout_ms,
            })
            .await?;

        let (event_sink, event_stream) = mpsc::unbounded_channel();
        self.actor_client
            .connect(
                ConnectRequest {
                    session: response.session,
                    address: self.client_address.clone(),
                },
                event_sink,
            )
            .await?;

        Ok(SessionHandle {
            actor_client: self.actor_client.clone(),
            session: response.session,
            next_sequence: 1,
            observed_version: Index::ZERO,
            acked_command_sequence: 0,
            acked_event_version: Index::ZERO,
            event_stream,
        })
    }
}

/// An event published to this session by the replicated state machine.
#[derive(Clone, Debug)]
pub struct SessionEvent {
    /// Log index of the command that published the event.
    pub version: u64,
    pub payload: Bytes,
}

/// A registered session: sequences commands, tracks the version watermark for
/// monotonic reads, receives events, and refreshes liveness.
pub struct SessionHandle {
    actor_client: ActorClient,
    session: SessionId,
    next_sequence: u64,
    observed_version: Index,
    acked_command_sequence: u64,
    acked_event_version: Index,
    event_stream: mpsc::UnboundedReceiver<PublishRequest>,
}

impl SessionHandle {
    pub fn session_id(&self) -> u64 {
        self.session.val()
    }

    /// Submits a state-changing command and waits for its committed result.
    /// `tombstone` marks commands that erase earlier state.
    pub async fn submit_command(
        &mut self,
        payload: Bytes,
        consistency: CommandConsistency,
        tombstone: bool,
    ) -> Result<Bytes, RequestError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let response = self
            .actor_client
            .command(CommandRequest {
                session: self.session,
                sequence,
                payload,
                consistency,
                tombstone,
            })
            .await?;
        self.acked_command_sequence = sequence;
        if response.index > self.observed_version {
            self.observed_version = response.index;
        }
        Ok(response.result)
    }

    /// Re-submits an already used sequence; duplicates are served from the
    /// session's response cache without re-applying.
    pub async fn resubmit_command(
        &mut self,
        sequence: u64,
        payload: Bytes,
        consistency: CommandConsistency,
        tombstone: bool,
    ) -> Result<Bytes, RequestError> {
        let response = self
            .actor_client
            .command(CommandRequest {
                session: self.session,
                sequence,
                payload,
                consistency,
                tombstone,
            })
            .await?;
        Ok(response.result)
    }

    /// Submits a read-only query at the requested consistency level.
    pub async fn submit_query(
        &mut self,
        payload: Bytes,
        consistency: QueryConsistency,
    ) -> Result<Bytes, RequestError> {
        let response = self
            .actor_client
            .query(QueryRequest {
                session: self.session,
                sequence: self.next_sequence - 1,
                version: self.observed_version,
                payload,
                consistency,
            })
            .await?;
        if response.version > self.observed_version {
            self.observed_version = response.version;
        }
        Ok(response.result)
    }

    /// Receives the next published event, acknowledging it to the server.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let publish = self.event_stream.recv().await?;
        self.acked_event_version = publish.event_version;
        self.actor_client
            .acknowledge_events(EventAcknowledgement {
                session: self.session,
                version: publish.event_version,
                sequence: publish.event_sequence,
            })
            .await;
        Some(SessionEvent {
            version: publish.event_version.val(),
            payload: publish.payload,
        })
    }

    /// Refreshes session liveness, acknowledging received responses and
    /// events so the server can release them.
    pub async fn keep_alive(&mut self) -> Result<(), RequestError> {
        self.actor_client
            .keep_alive(KeepAliveRequest {
                session: self.session,
                command_seq_ack: self.acked_command_sequence,
                event_version_ack: self.acked_event_version.val(),
            })
            .await?;
        Ok(())
    }

    /// Closes the session cleanly.
    pub async fn unregister(&mut self) -> Result<(), RequestError> {
        self.actor_client
            .unregister(UnregisterRequest { session: self.session })
            .await?;
        Ok(())
    }
}
