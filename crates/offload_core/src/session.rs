//! Engine-owned session state: record keys, the callback registry and the
//! attached contexts.
//!
//! A session is driven by a single thread. Nothing here synchronises access
//! to the registry or the context map; distinct sessions are independent and
//! may live on different threads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::callbacks::Handler;
use crate::context::{CallbackContext, ContextStore, ErasedContext};
use crate::error::OffloadError;
use crate::keys::TrafficKeys;
use crate::kind::OperationKind;
use crate::registry::CallbackRegistry;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    TornDown,
}

#[derive(Debug, Default)]
pub(crate) struct Direction {
    pub(crate) keys: Option<TrafficKeys>,
    pub(crate) seq: u64,
}

/// Read-only session handle given to handlers. This is how a handler
/// reaches session-derived key material.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    id: SessionId,
    read: Option<&'a TrafficKeys>,
    write: Option<&'a TrafficKeys>,
    read_seq: u64,
    write_seq: u64,
}

impl<'a> SessionView<'a> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Keys protecting records the peer sends us.
    pub fn read_keys(&self) -> Option<&'a TrafficKeys> {
        self.read
    }

    /// Keys protecting records we send.
    pub fn write_keys(&self) -> Option<&'a TrafficKeys> {
        self.write
    }

    /// Sequence number of the next record to be decrypted.
    pub fn read_sequence(&self) -> u64 {
        self.read_seq
    }

    /// Sequence number of the next record to be encrypted.
    pub fn write_sequence(&self) -> u64 {
        self.write_seq
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    pub(crate) read: Direction,
    pub(crate) write: Direction,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) contexts: ContextStore,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let id = SessionId::next();
        info!(session = %id, "session opened");
        Self {
            id,
            state: SessionState::Active,
            read: Direction::default(),
            write: Direction::default(),
            callbacks: CallbackRegistry::default(),
            contexts: ContextStore::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn ensure_active(&self) -> Result<(), OffloadError> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::TornDown => Err(OffloadError::InvalidSession(self.id)),
        }
    }

    pub fn view(&self) -> SessionView<'_> {
        SessionView {
            id: self.id,
            read: self.read.keys.as_ref(),
            write: self.write.keys.as_ref(),
            read_seq: self.read.seq,
            write_seq: self.write.seq,
        }
    }

    /// Install the peer's record keys; the read sequence restarts at zero.
    pub fn install_read_keys(&mut self, keys: TrafficKeys) -> Result<(), OffloadError> {
        self.ensure_active()?;
        debug!(session = %self.id, cipher = ?keys.cipher(), "read keys installed");
        self.read = Direction {
            keys: Some(keys),
            seq: 0,
        };
        Ok(())
    }

    /// Install our record keys; the write sequence restarts at zero.
    pub fn install_write_keys(&mut self, keys: TrafficKeys) -> Result<(), OffloadError> {
        self.ensure_active()?;
        debug!(session = %self.id, cipher = ?keys.cipher(), "write keys installed");
        self.write = Direction {
            keys: Some(keys),
            seq: 0,
        };
        Ok(())
    }

    // ── Callback registry ────────────────────────────────────────────────────

    /// Bind `handler` to its kind on this session, replacing any previous
    /// handler for that kind (which is returned).
    pub fn register(&mut self, handler: Handler) -> Result<Option<Handler>, OffloadError> {
        self.ensure_active()?;
        debug!(session = %self.id, kind = %handler.kind(), "handler registered");
        Ok(self.callbacks.register(handler))
    }

    pub fn lookup(&self, kind: OperationKind) -> Result<Handler, OffloadError> {
        self.ensure_active()?;
        self.callbacks.lookup(kind).cloned()
    }

    /// Clear the binding for `kind`; the engine reverts to its own
    /// implementation for it.
    pub fn unregister(&mut self, kind: OperationKind) -> Result<Option<Handler>, OffloadError> {
        self.ensure_active()?;
        debug!(session = %self.id, %kind, "handler unregistered");
        Ok(self.callbacks.unregister(kind))
    }

    pub fn registered_kinds(&self) -> Result<Vec<OperationKind>, OffloadError> {
        self.ensure_active()?;
        Ok(self.callbacks.kinds())
    }

    // ── Callback contexts ────────────────────────────────────────────────────

    /// Associate `context` with `kind`. The session keeps a reference only;
    /// the caller keeps ownership of whatever the context holds.
    pub fn attach<T: Send + 'static>(
        &mut self,
        kind: OperationKind,
        context: &CallbackContext<T>,
    ) -> Result<(), OffloadError> {
        self.attach_erased(kind, context.erase())
    }

    pub fn attach_erased(
        &mut self,
        kind: OperationKind,
        context: ErasedContext,
    ) -> Result<(), OffloadError> {
        self.ensure_active()?;
        debug!(session = %self.id, %kind, context = context.type_name(), "context attached");
        self.contexts.attach(self.id, kind, context)
    }

    pub fn context(&self, kind: OperationKind) -> Result<Option<ErasedContext>, OffloadError> {
        self.ensure_active()?;
        Ok(self.contexts.get(kind).cloned())
    }

    pub fn detach(&mut self, kind: OperationKind) -> Result<Option<ErasedContext>, OffloadError> {
        self.ensure_active()?;
        Ok(self.contexts.detach(self.id, kind))
    }

    /// Drop every handler and context reference and wipe key material.
    /// Idempotent; every later call on this session fails with
    /// [`OffloadError::InvalidSession`].
    pub fn teardown(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        self.callbacks.clear();
        self.contexts.clear(self.id);
        self.read = Direction::default();
        self.write = Direction::default();
        self.state = SessionState::TornDown;
        info!(session = %self.id, "session torn down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.contexts.clear(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{BulkCipher, IV_LEN};

    #[test]
    fn ids_are_unique() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn torn_down_session_rejects_everything() {
        let mut session = Session::new();
        let ctx = CallbackContext::new(0u8);
        session.attach(OperationKind::RsaSign, &ctx).unwrap();
        session.teardown();

        assert_eq!(session.state(), SessionState::TornDown);
        assert_eq!(ctx.attached_to(), None);
        assert!(matches!(
            session.lookup(OperationKind::RsaSign),
            Err(OffloadError::InvalidSession(id)) if id == session.id()
        ));
        assert!(matches!(
            session.unregister(OperationKind::RsaSign),
            Err(OffloadError::InvalidSession(_))
        ));
        assert!(matches!(
            session.context(OperationKind::RsaSign),
            Err(OffloadError::InvalidSession(_))
        ));
        assert!(matches!(
            session.attach(OperationKind::RsaSign, &ctx),
            Err(OffloadError::InvalidSession(_))
        ));

        // second teardown is a no-op
        session.teardown();
    }

    #[test]
    fn dropping_a_session_releases_its_contexts() {
        let ctx = CallbackContext::new(String::from("hsm-slot-3"));
        {
            let mut session = Session::new();
            session.attach(OperationKind::RsaSign, &ctx).unwrap();
            assert_eq!(ctx.attached_to(), Some(session.id()));
        }
        assert_eq!(ctx.attached_to(), None);
        assert_eq!(*ctx.lock(), "hsm-slot-3");
    }

    #[test]
    fn installing_keys_resets_sequence() {
        let mut session = Session::new();
        session.read.seq = 9;
        session
            .install_read_keys(TrafficKeys::new(BulkCipher::AesGcm, &[1; 16], [0; IV_LEN]))
            .unwrap();
        let view = session.view();
        assert_eq!(view.read_sequence(), 0);
        assert!(view.read_keys().is_some());
        assert!(view.write_keys().is_none());
    }

    #[test]
    fn context_get_reports_none_when_unattached() {
        let session = Session::new();
        assert!(session
            .context(OperationKind::AtomicRecordDecrypt)
            .unwrap()
            .is_none());
    }
}
