use crate::session::session::ServerSession;
use crate::storage::SessionId;
use std::collections::HashMap;

/// SessionRegistry holds every live session, keyed by the Register entry
/// index that created it. Owned by the state-machine driver; sessions are
/// created by Register applies and destroyed by Unregister applies, nothing
/// else.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<SessionId, ServerSession>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        SessionRegistry::default()
    }

    pub(crate) fn register(&mut self, session: ServerSession) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn unregister(&mut self, id: SessionId) -> Option<ServerSession> {
        self.sessions.remove(&id)
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<&ServerSession> {
        self.sessions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut ServerSession> {
        self.sessions.get_mut(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ServerSession> {
        self.sessions.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerSession> {
        self.sessions.values_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
