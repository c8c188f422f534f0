mod actor;
mod cluster;
mod engine;
mod machine;
mod protocol;
mod server;
mod session;
mod storage;
mod transport;

pub use cluster::Configuration;
pub use cluster::Member;
pub use cluster::MemberId;
pub use cluster::MemberKind;
pub use engine::start_engine;
pub use engine::Engine;
pub use engine::EngineConfig;
pub use engine::EngineStartError;
pub use engine::SessionEvent;
pub use engine::SessionHandle;
pub use machine::Commit;
pub use machine::StateMachine;
pub use protocol::ErrorKind;
pub use protocol::RequestError;
pub use server::RoleKind;
pub use server::ServerOptions;
pub use storage::CommandConsistency;
pub use storage::Index;
pub use storage::QueryConsistency;
pub use storage::SessionId;
pub use storage::StorageConfig;
pub use storage::Term;
pub use transport::ChannelTransport;
pub use transport::PeerClient;
pub use transport::PeerClientError;
pub use transport::Transport;
