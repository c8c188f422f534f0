mod event;
mod registry;
mod session;

pub(crate) use event::EventHolder;
pub(crate) use event::EventSink;
pub(crate) use registry::SessionRegistry;
pub(crate) use session::CachedResponse;
pub(crate) use session::QueuedCommand;
pub(crate) use session::QueuedQuery;
pub(crate) use session::ServerSession;
pub(crate) use session::SessionState;
