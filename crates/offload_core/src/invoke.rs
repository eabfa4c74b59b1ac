//! Invocation protocol: the points where the engine hands an operation to
//! the registered handler.
//!
//! Each call looks up the handler for its kind, forwards the session view,
//! the attached context (if any) and the engine's buffers, and blocks until
//! the handler returns. Failures are surfaced unchanged. There is no retry
//! and no fallback to a built-in implementation once a handler is
//! registered; with no handler the caller gets
//! [`OffloadError::NotRegistered`] and applies its own policy.

use tracing::{debug, debug_span, warn};

use crate::callbacks::HandlerInner;
use crate::error::OffloadError;
use crate::keys::ContentType;
use crate::kind::OperationKind;
use crate::session::Session;

fn next_sequence(kind: OperationKind, seq: u64) -> Result<u64, OffloadError> {
    seq.checked_add(1).ok_or_else(|| OffloadError::OperationFailure {
        kind,
        reason: "record sequence number exhausted".into(),
    })
}

fn report<T>(kind: OperationKind, result: Result<T, OffloadError>) -> Result<T, OffloadError> {
    if let Err(e) = &result {
        warn!(%kind, status = e.status_code(), "offloaded operation failed: {e}");
    }
    result
}

impl Session {
    /// RSA public-key encryption of `plaintext` under `key_der`. Returns the
    /// exact ciphertext length written to `out`.
    pub fn rsa_public_encrypt(
        &self,
        plaintext: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError> {
        let kind = OperationKind::RsaPublicEncrypt;
        let _span = debug_span!("offload", session = %self.id(), %kind).entered();
        self.ensure_active()?;
        let HandlerInner::RsaPublicEncrypt(handler) = &self.callbacks.lookup(kind)?.inner else {
            return Err(OffloadError::NotRegistered(kind));
        };
        debug!(input = plaintext.len(), capacity = out.len(), "dispatching");
        let view = self.view();
        report(
            kind,
            handler.invoke(&view, self.contexts.get(kind), plaintext, key_der, out),
        )
    }

    /// RSA signature over `message` with the key whose public half is
    /// `key_der`. Returns the signature length written to `out`.
    pub fn rsa_sign(
        &self,
        message: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError> {
        let kind = OperationKind::RsaSign;
        let _span = debug_span!("offload", session = %self.id(), %kind).entered();
        self.ensure_active()?;
        let HandlerInner::RsaSign(handler) = &self.callbacks.lookup(kind)?.inner else {
            return Err(OffloadError::NotRegistered(kind));
        };
        debug!(input = message.len(), capacity = out.len(), "dispatching");
        let view = self.view();
        report(
            kind,
            handler.invoke(&view, self.contexts.get(kind), message, key_der, out),
        )
    }

    pub fn rsa_verify(
        &self,
        message: &[u8],
        signature: &[u8],
        key_der: &[u8],
    ) -> Result<(), OffloadError> {
        let kind = OperationKind::RsaVerify;
        let _span = debug_span!("offload", session = %self.id(), %kind).entered();
        self.ensure_active()?;
        let HandlerInner::RsaVerify(handler) = &self.callbacks.lookup(kind)?.inner else {
            return Err(OffloadError::NotRegistered(kind));
        };
        debug!(input = message.len(), signature = signature.len(), "dispatching");
        let view = self.view();
        report(
            kind,
            handler.invoke(&view, self.contexts.get(kind), message, signature, key_der),
        )
    }

    /// Protect one outgoing record. The write sequence advances only when
    /// the handler succeeds; once it is exhausted every call fails without
    /// reaching the handler.
    pub fn encrypt_record(
        &mut self,
        content_type: ContentType,
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError> {
        let kind = OperationKind::AtomicRecordEncrypt;
        let _span = debug_span!("offload", session = %self.id(), %kind).entered();
        self.ensure_active()?;
        let next = report(kind, next_sequence(kind, self.write.seq))?;
        let written = {
            let HandlerInner::AtomicRecordEncrypt(handler) = &self.callbacks.lookup(kind)?.inner
            else {
                return Err(OffloadError::NotRegistered(kind));
            };
            debug!(seq = self.write.seq, input = plaintext.len(), "dispatching");
            let view = self.view();
            report(
                kind,
                handler.invoke(&view, self.contexts.get(kind), content_type, plaintext, out),
            )?
        };
        self.write.seq = next;
        Ok(written)
    }

    /// Decrypt and authenticate one incoming record. A rejected record
    /// leaves the session, its context and the read sequence untouched.
    pub fn decrypt_record(
        &mut self,
        content_type: ContentType,
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError> {
        let kind = OperationKind::AtomicRecordDecrypt;
        let _span = debug_span!("offload", session = %self.id(), %kind).entered();
        self.ensure_active()?;
        let next = report(kind, next_sequence(kind, self.read.seq))?;
        let written = {
            let HandlerInner::AtomicRecordDecrypt(handler) = &self.callbacks.lookup(kind)?.inner
            else {
                return Err(OffloadError::NotRegistered(kind));
            };
            debug!(seq = self.read.seq, input = ciphertext.len(), "dispatching");
            let view = self.view();
            report(
                kind,
                handler.invoke(&view, self.contexts.get(kind), content_type, ciphertext, out),
            )?
        };
        self.read.seq = next;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroI32;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::callbacks::{Handler, RecordDecryptCallback, RsaEncryptCallback};
    use crate::context::CallbackContext;
    use crate::error::CallbackError;
    use crate::session::SessionView;

    /// Copies the input and counts calls.
    struct Echo {
        calls: Arc<AtomicUsize>,
    }

    impl RsaEncryptCallback for Echo {
        type Context = Vec<usize>;

        fn rsa_encrypt(
            &self,
            _session: &SessionView<'_>,
            ctx: Option<&mut Vec<usize>>,
            plaintext: &[u8],
            _key_der: &[u8],
            out: &mut [u8],
        ) -> Result<usize, CallbackError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(seen) = ctx {
                seen.push(plaintext.len());
            }
            if out.len() < plaintext.len() {
                return Err(CallbackError::BufferTooSmall {
                    needed: plaintext.len(),
                });
            }
            out[..plaintext.len()].copy_from_slice(plaintext);
            Ok(plaintext.len())
        }
    }

    /// Claims to have written more than it was given.
    struct Overclaim;

    impl RsaEncryptCallback for Overclaim {
        type Context = ();

        fn rsa_encrypt(
            &self,
            _session: &SessionView<'_>,
            _ctx: Option<&mut ()>,
            _plaintext: &[u8],
            _key_der: &[u8],
            out: &mut [u8],
        ) -> Result<usize, CallbackError> {
            Ok(out.len() + 1)
        }
    }

    /// Copies the record through and counts calls.
    struct Passthrough {
        calls: Arc<AtomicUsize>,
    }

    impl RecordDecryptCallback for Passthrough {
        type Context = ();

        fn decrypt_record(
            &self,
            _session: &SessionView<'_>,
            _ctx: &mut (),
            _content_type: ContentType,
            ciphertext: &[u8],
            out: &mut [u8],
        ) -> Result<usize, CallbackError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            out[..ciphertext.len()].copy_from_slice(ciphertext);
            Ok(ciphertext.len())
        }
    }

    /// Returns an application-defined code.
    struct Vendor(i32);

    impl RecordDecryptCallback for Vendor {
        type Context = ();

        fn decrypt_record(
            &self,
            _session: &SessionView<'_>,
            _ctx: &mut (),
            _content_type: ContentType,
            _ciphertext: &[u8],
            _out: &mut [u8],
        ) -> Result<usize, CallbackError> {
            Err(CallbackError::Status(NonZeroI32::new(self.0).unwrap()))
        }
    }

    fn echo() -> (Echo, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Echo {
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    #[test]
    fn unregistered_kind_is_reported_without_fallback() {
        let session = Session::new();
        let mut out = [0u8; 8];
        let err = session.rsa_public_encrypt(b"abc", b"", &mut out).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::NotRegistered(OperationKind::RsaPublicEncrypt)
        ));
        assert_eq!(out, [0u8; 8]);
    }

    #[test]
    fn context_is_forwarded_and_optional_for_rsa() {
        let (handler, calls) = echo();
        let mut session = Session::new();
        session.register(Handler::rsa_public_encrypt(handler)).unwrap();

        let mut out = [0u8; 8];
        assert_eq!(session.rsa_public_encrypt(b"abc", b"", &mut out).unwrap(), 3);

        let ctx = CallbackContext::new(Vec::<usize>::new());
        session.attach(OperationKind::RsaPublicEncrypt, &ctx).unwrap();
        assert_eq!(session.rsa_public_encrypt(b"abcd", b"", &mut out).unwrap(), 4);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*ctx.lock(), vec![4]);
    }

    #[test]
    fn mismatched_context_never_reaches_handler() {
        let (handler, calls) = echo();
        let mut session = Session::new();
        session.register(Handler::rsa_public_encrypt(handler)).unwrap();
        session
            .attach(OperationKind::RsaPublicEncrypt, &CallbackContext::new(7u64))
            .unwrap();

        let mut out = [0u8; 8];
        let err = session.rsa_public_encrypt(b"abc", b"", &mut out).unwrap_err();
        assert!(matches!(err, OffloadError::ContextMismatch { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn small_buffer_and_overclaim_are_buffer_errors() {
        let (handler, _) = echo();
        let mut session = Session::new();
        session.register(Handler::rsa_public_encrypt(handler)).unwrap();
        let mut out = [0u8; 2];
        assert!(matches!(
            session.rsa_public_encrypt(b"abcdef", b"", &mut out),
            Err(OffloadError::BufferTooSmall { needed: 6, capacity: 2, .. })
        ));

        session.register(Handler::rsa_public_encrypt(Overclaim)).unwrap();
        assert!(matches!(
            session.rsa_public_encrypt(b"a", b"", &mut out),
            Err(OffloadError::BufferTooSmall { needed: 3, capacity: 2, .. })
        ));
    }

    #[test]
    fn record_decrypt_without_context_is_setup_failure() {
        let mut session = Session::new();
        session.register(Handler::atomic_record_decrypt(Vendor(-9))).unwrap();
        let mut out = [0u8; 32];
        let err = session
            .decrypt_record(ContentType::ApplicationData, &[0u8; 32], &mut out)
            .unwrap_err();
        assert!(matches!(err, OffloadError::SetupFailure { .. }));
        assert!(err.is_retryable());
        assert_eq!(session.view().read_sequence(), 0);
    }

    #[test]
    fn vendor_status_surfaces_verbatim_and_sequence_holds() {
        let mut session = Session::new();
        session.register(Handler::atomic_record_decrypt(Vendor(-1234))).unwrap();
        session
            .attach(OperationKind::AtomicRecordDecrypt, &CallbackContext::new(()))
            .unwrap();
        let mut out = [0u8; 32];
        let err = session
            .decrypt_record(ContentType::ApplicationData, &[0u8; 32], &mut out)
            .unwrap_err();
        assert_eq!(err.status_code(), -1234);
        assert_eq!(session.view().read_sequence(), 0);
    }

    #[test]
    fn exhausted_read_sequence_fails_before_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut session = Session::new();
        session
            .register(Handler::atomic_record_decrypt(Passthrough {
                calls: Arc::clone(&calls),
            }))
            .unwrap();
        session
            .attach(OperationKind::AtomicRecordDecrypt, &CallbackContext::new(()))
            .unwrap();

        let mut out = [0u8; 8];
        session.read.seq = u64::MAX - 1;
        assert_eq!(
            session
                .decrypt_record(ContentType::ApplicationData, b"last", &mut out)
                .unwrap(),
            4
        );
        assert_eq!(session.view().read_sequence(), u64::MAX);

        let err = session
            .decrypt_record(ContentType::ApplicationData, b"wrap", &mut out)
            .unwrap_err();
        assert!(matches!(
            err,
            OffloadError::OperationFailure { kind: OperationKind::AtomicRecordDecrypt, .. }
        ));
        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.view().read_sequence(), u64::MAX);
    }

    #[test]
    fn torn_down_session_refuses_invocation() {
        let (handler, calls) = echo();
        let mut session = Session::new();
        session.register(Handler::rsa_public_encrypt(handler)).unwrap();
        session.teardown();
        let mut out = [0u8; 8];
        assert!(matches!(
            session.rsa_public_encrypt(b"abc", b"", &mut out),
            Err(OffloadError::InvalidSession(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
