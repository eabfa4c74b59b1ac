use std::collections::HashMap;

use tracing::debug;

use crate::error::OffloadError;
use crate::session::{Session, SessionId};

/// Engine-side map of live sessions, addressed by id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and return its id.
    pub fn open(&mut self) -> SessionId {
        let session = Session::new();
        let id = session.id();
        self.sessions.insert(id, session);
        id
    }

    pub fn session(&self, id: SessionId) -> Result<&Session, OffloadError> {
        self.sessions.get(&id).ok_or(OffloadError::InvalidSession(id))
    }

    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut Session, OffloadError> {
        self.sessions
            .get_mut(&id)
            .ok_or(OffloadError::InvalidSession(id))
    }

    /// Tear the session down and forget it. Its id is never valid again.
    pub fn teardown(&mut self, id: SessionId) -> Result<(), OffloadError> {
        let mut session = self
            .sessions
            .remove(&id)
            .ok_or(OffloadError::InvalidSession(id))?;
        session.teardown();
        debug!(session = %id, remaining = self.sessions.len(), "session removed from table");
        Ok(())
    }

    /// Take a session out of the table, e.g. to hand it to a worker thread.
    pub fn detach_session(&mut self, id: SessionId) -> Result<Session, OffloadError> {
        self.sessions
            .remove(&id)
            .ok_or(OffloadError::InvalidSession(id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallbackContext;
    use crate::kind::OperationKind;

    #[test]
    fn open_and_teardown() {
        let mut table = SessionTable::new();
        let a = table.open();
        let b = table.open();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.session(a).unwrap().id(), a);

        table.teardown(a).unwrap();
        assert!(matches!(table.session(a), Err(OffloadError::InvalidSession(id)) if id == a));
        assert!(matches!(table.teardown(a), Err(OffloadError::InvalidSession(_))));
        assert!(table.session(b).is_ok());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn teardown_releases_context_claims() {
        let mut table = SessionTable::new();
        let a = table.open();
        let b = table.open();
        let ctx = CallbackContext::new(5u32);

        table
            .session_mut(a)
            .unwrap()
            .attach(OperationKind::RsaSign, &ctx)
            .unwrap();
        assert!(matches!(
            table.session_mut(b).unwrap().attach(OperationKind::RsaSign, &ctx),
            Err(OffloadError::ContextInUse { holder, .. }) if holder == a
        ));

        table.teardown(a).unwrap();
        table
            .session_mut(b)
            .unwrap()
            .attach(OperationKind::RsaSign, &ctx)
            .unwrap();
        assert_eq!(ctx.attached_to(), Some(b));
    }

    #[test]
    fn detached_session_moves_to_another_thread() {
        let mut table = SessionTable::new();
        let id = table.open();
        let session = table.detach_session(id).unwrap();
        assert!(table.is_empty());

        let moved = std::thread::spawn(move || session.id()).join().unwrap();
        assert_eq!(moved, id);
    }
}
