//! Opaque per-session callback contexts.
//!
//! The application creates a [`CallbackContext<T>`] and keeps a clone; the
//! session stores a type-erased reference ([`ErasedContext`]) and forwards it
//! to the handler at invocation time. Only the handler adapter recovers the
//! concrete `T`, and only for the type the handler declares.
//!
//! A context may be attached to at most one live session at a time. The
//! claim is released when the last (session, kind) binding for it goes away.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::OffloadError;
use crate::kind::OperationKind;
use crate::session::SessionId;

type Claim = Arc<Mutex<Option<SessionId>>>;

/// Application-owned handler state, shared by reference with one session.
pub struct CallbackContext<T> {
    value: Arc<Mutex<T>>,
    claim: Claim,
}

impl<T> Clone for CallbackContext<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            claim: Arc::clone(&self.claim),
        }
    }
}

impl<T: Send + 'static> CallbackContext<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(Mutex::new(value)),
            claim: Arc::new(Mutex::new(None)),
        }
    }

    /// Lock the context for inspection. Must not be held while the owning
    /// session invokes a handler.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock()
    }

    /// Session currently holding a reference, if any.
    pub fn attached_to(&self) -> Option<SessionId> {
        *self.claim.lock()
    }

    pub fn erase(&self) -> ErasedContext {
        let value: Arc<dyn Any + Send + Sync> = self.value.clone();
        ErasedContext {
            value,
            claim: Arc::clone(&self.claim),
            type_name: type_name::<T>(),
        }
    }
}

impl<T> fmt::Debug for CallbackContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContext")
            .field("type", &type_name::<T>())
            .field("attached_to", &*self.claim.lock())
            .finish()
    }
}

/// Type-erased context reference as stored on a session.
#[derive(Clone)]
pub struct ErasedContext {
    value: Arc<dyn Any + Send + Sync>,
    claim: Claim,
    type_name: &'static str,
}

impl ErasedContext {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn same_as<T>(&self, other: &CallbackContext<T>) -> bool {
        Arc::ptr_eq(&self.claim, &other.claim)
    }

    fn same_context(&self, other: &ErasedContext) -> bool {
        Arc::ptr_eq(&self.claim, &other.claim)
    }

    /// Run `f` with exclusive access to the context as `T`.
    pub(crate) fn with<T: Send + 'static, R>(
        &self,
        kind: OperationKind,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, OffloadError> {
        let cell = self
            .value
            .downcast_ref::<Mutex<T>>()
            .ok_or(OffloadError::ContextMismatch {
                kind,
                attached: self.type_name,
                expected: type_name::<T>(),
            })?;
        let mut guard = cell.lock();
        Ok(f(&mut *guard))
    }

    fn claim(&self, session: SessionId, kind: OperationKind) -> Result<(), OffloadError> {
        let mut holder = self.claim.lock();
        match *holder {
            Some(other) if other != session => Err(OffloadError::ContextInUse {
                kind,
                holder: other,
            }),
            _ => {
                *holder = Some(session);
                Ok(())
            }
        }
    }

    fn release(&self, session: SessionId) {
        let mut holder = self.claim.lock();
        if *holder == Some(session) {
            *holder = None;
        }
    }
}

impl fmt::Debug for ErasedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedContext")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Per-session map from kind to attached context.
#[derive(Debug, Default)]
pub(crate) struct ContextStore {
    slots: HashMap<OperationKind, ErasedContext>,
}

impl ContextStore {
    pub(crate) fn attach(
        &mut self,
        session: SessionId,
        kind: OperationKind,
        context: ErasedContext,
    ) -> Result<(), OffloadError> {
        context.claim(session, kind)?;
        if let Some(previous) = self.slots.insert(kind, context) {
            self.release_if_unbound(session, &previous);
        }
        Ok(())
    }

    pub(crate) fn get(&self, kind: OperationKind) -> Option<&ErasedContext> {
        self.slots.get(&kind)
    }

    pub(crate) fn detach(&mut self, session: SessionId, kind: OperationKind) -> Option<ErasedContext> {
        let previous = self.slots.remove(&kind)?;
        self.release_if_unbound(session, &previous);
        Some(previous)
    }

    pub(crate) fn clear(&mut self, session: SessionId) {
        for (_, context) in self.slots.drain() {
            context.release(session);
        }
    }

    fn release_if_unbound(&self, session: SessionId, context: &ErasedContext) {
        if !self.slots.values().any(|c| c.same_context(context)) {
            context.release(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Counter(u32);

    #[test]
    fn erased_context_forwards_to_same_value() {
        let ctx = CallbackContext::new(Counter(0));
        let erased = ctx.erase();
        erased
            .with::<Counter, _>(OperationKind::RsaSign, |c| c.0 += 1)
            .unwrap();
        assert_eq!(*ctx.lock(), Counter(1));
        assert!(erased.same_as(&ctx));
        let seen = erased
            .with::<Counter, _>(OperationKind::RsaSign, |c| c.0)
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn wrong_type_is_a_mismatch() {
        let erased = CallbackContext::new(Counter(0)).erase();
        let err = erased
            .with::<String, _>(OperationKind::RsaSign, |_| ())
            .unwrap_err();
        assert!(matches!(
            err,
            OffloadError::ContextMismatch { attached, .. } if attached == erased.type_name()
        ));
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let ctx = CallbackContext::new(Counter(0));
        let (a, b) = (SessionId::next(), SessionId::next());
        let mut store_a = ContextStore::default();
        let mut store_b = ContextStore::default();

        store_a.attach(a, OperationKind::RsaSign, ctx.erase()).unwrap();
        assert_eq!(ctx.attached_to(), Some(a));

        let err = store_b
            .attach(b, OperationKind::RsaSign, ctx.erase())
            .unwrap_err();
        assert!(matches!(err, OffloadError::ContextInUse { holder, .. } if holder == a));

        store_a.clear(a);
        assert_eq!(ctx.attached_to(), None);
        store_b.attach(b, OperationKind::RsaSign, ctx.erase()).unwrap();
        assert_eq!(ctx.attached_to(), Some(b));
    }

    #[test]
    fn claim_survives_while_another_kind_still_binds_it() {
        let ctx = CallbackContext::new(Counter(0));
        let s = SessionId::next();
        let mut store = ContextStore::default();
        store.attach(s, OperationKind::RsaSign, ctx.erase()).unwrap();
        store.attach(s, OperationKind::RsaVerify, ctx.erase()).unwrap();

        store.detach(s, OperationKind::RsaSign);
        assert_eq!(ctx.attached_to(), Some(s));
        store.detach(s, OperationKind::RsaVerify);
        assert_eq!(ctx.attached_to(), None);
    }
}
