use crate::actor::WeakActorClient;
use crate::protocol::{
    AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, ErrorKind, HeartbeatRequest,
    HeartbeatResponse, InstallRequest, InstallResponse, JoinRequest, JoinResponse, LeaveRequest, LeaveResponse,
    PollRequest, PollResponse, VoteRequest, VoteResponse,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// PeerClient is one per-peer connection for server-to-server RPCs. The
/// consensus core never sees further than this trait; wire framing lives
/// behind it.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn append(&self, request: AppendRequest) -> Result<AppendResponse, PeerClientError>;
    async fn vote(&self, request: VoteRequest) -> Result<VoteResponse, PeerClientError>;
    async fn poll(&self, request: PollRequest) -> Result<PollResponse, PeerClientError>;
    async fn install(&self, request: InstallRequest) -> Result<InstallResponse, PeerClientError>;
    async fn configure(&self, request: ConfigureRequest) -> Result<ConfigureResponse, PeerClientError>;
    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, PeerClientError>;
    async fn join(&self, request: JoinRequest) -> Result<JoinResponse, PeerClientError>;
    async fn leave(&self, request: LeaveRequest) -> Result<LeaveResponse, PeerClientError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerClientError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("peer rejected the request: {0:?}")]
    Remote(ErrorKind),
}

/// Transport hands out per-peer connections by server address.
pub trait Transport: Send + Sync {
    fn connect(&self, address: &str) -> Arc<dyn PeerClient>;
}

/// ChannelTransport is the in-process transport: every server registers its
/// actor under its server address, and peer calls are plain channel sends.
/// Tests and single-process clusters run on this; a networked deployment
/// supplies its own Transport.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    registry: Arc<Mutex<HashMap<String, WeakActorClient>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        ChannelTransport::default()
    }

    pub(crate) fn register(&self, address: &str, client: WeakActorClient) {
        self.registry
            .lock()
            .expect("transport registry poisoned")
            .insert(address.to_string(), client);
    }

    fn lookup(&self, address: &str) -> Option<WeakActorClient> {
        self.registry
            .lock()
            .expect("transport registry poisoned")
            .get(address)
            .cloned()
    }
}

impl Transport for ChannelTransport {
    fn connect(&self, address: &str) -> Arc<dyn PeerClient> {
        Arc::new(ChannelPeerClient {
            transport: self.clone(),
            address: address.to_string(),
        })
    }
}

/// A lazily resolving channel connection: the peer may register after we
/// connect, and may restart under the same address.
struct ChannelPeerClient {
    transport: ChannelTransport,
    address: String,
}

impl ChannelPeerClient {
    fn target(&self) -> Result<crate::actor::ActorClient, PeerClientError> {
        self.transport
            .lookup(&self.address)
            .and_then(|weak| weak.strong())
            .ok_or_else(|| PeerClientError::Unreachable(self.address.clone()))
    }
}

macro_rules! relay {
    ($self:ident, $method:ident, $request:ident) => {
        $self
            .target()?
            .$method($request)
            .await
            .map_err(|e| PeerClientError::Remote(e.kind()))
    };
}

#[async_trait]
impl PeerClient for ChannelPeerClient {
    async fn append(&self, request: AppendRequest) -> Result<AppendResponse, PeerClientError> {
        relay!(self, append, request)
    }

    async fn vote(&self, request: VoteRequest) -> Result<VoteResponse, PeerClientError> {
        relay!(self, vote, request)
    }

    async fn poll(&self, request: PollRequest) -> Result<PollResponse, PeerClientError> {
        relay!(self, poll, request)
    }

    async fn install(&self, request: InstallRequest) -> Result<InstallResponse, PeerClientError> {
        relay!(self, install, request)
    }

    async fn configure(&self, request: ConfigureRequest) -> Result<ConfigureResponse, PeerClientError> {
        relay!(self, configure, request)
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, PeerClientError> {
        relay!(self, heartbeat, request)
    }

    async fn join(&self, request: JoinRequest) -> Result<JoinResponse, PeerClientError> {
        relay!(self, join, request)
    }

    async fn leave(&self, request: LeaveRequest) -> Result<LeaveResponse, PeerClientError> {
        relay!(self, leave, request)
    }
}
